use std::cmp::Ordering;

/// Compares two binary keys; the tree is ordered by whatever comparator it
/// was built with.
pub type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

/// Lexicographic byte order.
pub fn default_comparator(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Encode an i64 so that lexicographic byte order matches numeric order.
pub fn i64_key(value: i64) -> Vec<u8> {
    ((value as u64) ^ (1 << 63)).to_be_bytes().to_vec()
}

/// Inverse of [`i64_key`].
pub fn decode_i64_key(key: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some((u64::from_be_bytes(bytes) ^ (1 << 63)) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_comparator_is_lexicographic() {
        assert_eq!(default_comparator(b"abc", b"abd"), Ordering::Less);
        assert_eq!(default_comparator(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(default_comparator(b"b", b"aaaa"), Ordering::Greater);
    }

    #[test]
    fn i64_keys_preserve_numeric_order() {
        let values = [i64::MIN, -100, -1, 0, 1, 42, i64::MAX];
        for window in values.windows(2) {
            assert_eq!(
                default_comparator(&i64_key(window[0]), &i64_key(window[1])),
                Ordering::Less
            );
        }
        for v in values {
            assert_eq!(decode_i64_key(&i64_key(v)), Some(v));
        }
    }
}
