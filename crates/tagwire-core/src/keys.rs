//! Textual encoding of connection keys and session ids.
//!
//! Keys are random non-zero `u64`s written in base 32 (`0-9a-v`), the form used
//! in upgrade URLs and session cookies.

const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Encode a key. Zero encodes as the empty string.
pub fn key_string(key: u64) -> String {
    if key == 0 {
        return String::new();
    }
    let mut buf = Vec::with_capacity(13);
    let mut n = key;
    while n > 0 {
        buf.push(DIGITS[(n % 32) as usize]);
        n /= 32;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

/// Decode a key, ignoring anything from the first `/`. Returns zero if invalid.
pub fn key_value(s: &str) -> u64 {
    let s = s.split('/').next().unwrap_or_default();
    if s.is_empty() {
        return 0;
    }
    u64::from_str_radix(s, 32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_string() {
        assert_eq!(key_string(0), "");
        assert_eq!(key_string(1), "1");
        assert_eq!(key_string(31), "v");
        assert_eq!(key_string(32), "10");
        assert_eq!(key_string(u64::MAX), "fvvvvvvvvvvvv");
    }

    #[test]
    fn test_key_value() {
        assert_eq!(key_value("10"), 32);
        assert_eq!(key_value("v/noscript"), 31);
        assert_eq!(key_value(""), 0);
        assert_eq!(key_value("zz"), 0);
        assert_eq!(key_value(&key_string(0xdead_beef_cafe)), 0xdead_beef_cafe);
    }
}
