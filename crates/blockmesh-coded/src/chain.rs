use sha2::{Digest, Sha256};

/// Deterministic sequence of physical block keys for one blob name.
///
/// The first key is `hex(sha256(name))`; every later key is
/// `hex(sha256(name ‖ previous_key))`. Anyone who knows the name can
/// regenerate the whole chain, which is how reads and deletes find blocks.
#[derive(Debug, Clone)]
pub struct KeyChain {
    name: String,
    prev: Option<String>,
}

impl KeyChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prev: None,
        }
    }

    pub fn next_key(&mut self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        if let Some(prev) = &self.prev {
            hasher.update(prev.as_bytes());
        }
        let key = hex::encode(hasher.finalize());
        self.prev = Some(key.clone());
        key
    }

    /// The next `n` keys.
    pub fn take_keys(&mut self, n: usize) -> Vec<String> {
        (0..n).map(|_| self.next_key()).collect()
    }

    /// Advance past `n` keys without returning them.
    pub fn skip_keys(&mut self, n: usize) {
        for _ in 0..n {
            self.next_key();
        }
    }
}

impl Iterator for KeyChain {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        Some(self.next_key())
    }
}
