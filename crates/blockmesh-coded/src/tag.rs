use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{CodedError, Result, TAG_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// Seals payloads into physical blocks and opens them again.
///
/// A physical block is `payload ‖ HMAC-SHA256(secret, name ‖ key ‖ payload)`.
/// Binding the blob name and the chain key into the tag stops a block from
/// being replayed under another name or at another chain position.
#[derive(Clone)]
pub struct BlockSealer {
    mac: HmacSha256,
}

impl std::fmt::Debug for BlockSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSealer").finish_non_exhaustive()
    }
}

impl BlockSealer {
    pub fn new(secret: &[u8]) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| CodedError::InvalidSecret)?;
        Ok(Self { mac })
    }

    fn keyed(&self, name: &str, key: &str, payload: &[u8]) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(name.as_bytes());
        mac.update(key.as_bytes());
        mac.update(payload);
        mac
    }

    /// Append the tag for (`name`, `key`) to `payload`.
    pub fn seal(&self, name: &str, key: &str, payload: &[u8]) -> Vec<u8> {
        let tag = self.keyed(name, key, payload).finalize().into_bytes();
        let mut block = Vec::with_capacity(payload.len() + TAG_SIZE);
        block.extend_from_slice(payload);
        block.extend_from_slice(&tag);
        block
    }

    /// Verify the trailer and return the payload.
    pub fn open<'b>(&self, name: &str, key: &str, block: &'b [u8]) -> Result<&'b [u8]> {
        if block.len() < TAG_SIZE {
            return Err(CodedError::InvalidBlockFormat {
                reason: format!("block {} is {} bytes, shorter than its tag", key, block.len()),
            });
        }
        let (payload, tag) = block.split_at(block.len() - TAG_SIZE);
        self.keyed(name, key, payload)
            .verify_slice(tag)
            .map_err(|_| CodedError::AuthenticationError {
                key: key.to_string(),
            })?;
        Ok(payload)
    }
}
