//! Key placement on the ring.

use std::collections::BTreeMap;
use std::ops::Bound;

/// Ring position of a key: the lowercase hex BLAKE3 digest of the key text.
///
/// Store ids and digests are compared as strings, so the ring order is the
/// lexicographic order of hex ids.
pub fn placement_hash(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Owner of `hash` among `members`: the greatest id not exceeding the hash,
/// wrapping to the greatest id overall when the hash sorts below every id.
///
/// Total and deterministic: any non-empty membership maps every hash to
/// exactly one member.
pub fn select<'a, V>(members: &'a BTreeMap<String, V>, hash: &str) -> Option<(&'a String, &'a V)> {
    members
        .range::<str, _>((Bound::Unbounded, Bound::Included(hash)))
        .next_back()
        .or_else(|| members.iter().next_back())
}

/// The member whose range ends where `id`'s begins (the previous id in ring
/// order, wrapping). `None` when `id` is the only member or absent.
pub fn predecessor<'a, V>(members: &'a BTreeMap<String, V>, id: &str) -> Option<(&'a String, &'a V)> {
    if members.len() < 2 || !members.contains_key(id) {
        return None;
    }
    members
        .range::<str, _>((Bound::Unbounded, Bound::Excluded(id)))
        .next_back()
        .or_else(|| members.iter().next_back())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(ids: &[&str]) -> BTreeMap<String, ()> {
        ids.iter().map(|id| (id.to_string(), ())).collect()
    }

    fn owner(members: &BTreeMap<String, ()>, hash: &str) -> String {
        select(members, hash).unwrap().0.clone()
    }

    #[test]
    fn test_hash_is_fixed() {
        assert_eq!(placement_hash("0123"), placement_hash("0123"));
        assert_ne!(placement_hash("0123"), placement_hash("0124"));
        assert_eq!(placement_hash("0123").len(), 64);
    }

    #[test]
    fn test_greatest_id_not_exceeding_hash() {
        let members = ring(&["40", "80", "c0"]);
        assert_eq!(owner(&members, "40"), "40");
        assert_eq!(owner(&members, "7f"), "40");
        assert_eq!(owner(&members, "80"), "80");
        assert_eq!(owner(&members, "bfff"), "80");
        assert_eq!(owner(&members, "ff"), "c0");
    }

    #[test]
    fn test_wraps_to_greatest_id() {
        let members = ring(&["40", "80", "c0"]);
        assert_eq!(owner(&members, "00"), "c0");
        assert_eq!(owner(&members, "3f"), "c0");
    }

    #[test]
    fn test_single_member_owns_everything() {
        let members = ring(&["80"]);
        for hash in ["00", "80", "ff"] {
            assert_eq!(owner(&members, hash), "80");
        }
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let members = ring(&[]);
        assert!(select(&members, "00").is_none());
    }

    #[test]
    fn test_every_hash_maps_to_one_member() {
        let members = ring(&["1f", "5a", "a0", "e7"]);
        for byte in 0..=255u8 {
            let hash = format!("{:02x}", byte);
            let chosen = owner(&members, &hash);
            assert!(members.contains_key(&chosen));
            // deterministic
            assert_eq!(chosen, owner(&members, &hash));
        }
    }

    #[test]
    fn test_predecessor() {
        let members = ring(&["40", "80", "c0"]);
        assert_eq!(predecessor(&members, "80").unwrap().0, "40");
        assert_eq!(predecessor(&members, "40").unwrap().0, "c0");
        assert!(predecessor(&members, "99").is_none());
        assert!(predecessor(&ring(&["40"]), "40").is_none());
    }
}
