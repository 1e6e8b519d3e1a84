//! Cluster hash slots.

/// Number of partitions in the cluster key space.
pub const SLOT_COUNT: u16 = 16384;

/// Calculates the slot for a key, honoring `{hash tags}`.
///
/// Only the bytes between the first `{` and the next `}` are hashed, and only
/// when that span is non-empty, so `{user1}.name` and `{user1}.age` share a slot.
pub fn hash_slot(key: &[u8]) -> u16 {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[start + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return crc16(&key[start + 1..start + 1 + len]) % SLOT_COUNT;
            }
        }
    }
    crc16(key) % SLOT_COUNT
}

/// CRC16/XMODEM, as mandated by the cluster specification.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vector() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn hash_tags_colocate_keys() {
        assert_eq!(hash_slot(b"{user1}.name"), hash_slot(b"{user1}.age"));
        assert_eq!(hash_slot(b"{user1}.name"), hash_slot(b"user1"));
    }

    #[test]
    fn empty_tag_hashes_whole_key() {
        assert_eq!(hash_slot(b"{}foo"), crc16(b"{}foo") % SLOT_COUNT);
        assert_eq!(hash_slot(b"foo{"), crc16(b"foo{") % SLOT_COUNT);
    }

    #[test]
    fn only_first_tag_counts() {
        assert_eq!(hash_slot(b"{a}{b}"), hash_slot(b"a"));
        assert_eq!(hash_slot(b"{{a}}"), hash_slot(b"{a"));
    }

    #[test]
    fn known_slots() {
        assert_eq!(hash_slot(b"foo"), 12182);
        assert_eq!(hash_slot(b"bar"), 5061);
    }
}
