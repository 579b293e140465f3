//! Element identifiers.

use std::fmt;
use std::num::NonZeroU64;

/// Prefix of the HTML `id` attribute derived from a [`Jid`].
pub const PREFIX: &str = "Jid.";

/// Per-connection element id. Never zero; `Jid(1)` in one connection is
/// unrelated to `Jid(1)` in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid(NonZeroU64);

impl Jid {
    pub fn new(n: u64) -> Option<Jid> {
        NonZeroU64::new(n).map(Jid)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Parse `Jid.<n>`. Returns `None` for anything else, including `Jid.0`.
    pub fn parse(s: &str) -> Option<Jid> {
        let digits = s.strip_prefix(PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u64>().ok().and_then(Jid::new)
    }

    /// The quoted `id="Jid.N"` attribute.
    pub fn id_attr(self) -> String {
        format!("id=\"{self}\"")
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let jid = Jid::new(42).unwrap();
        assert_eq!(jid.to_string(), "Jid.42");
        assert_eq!(Jid::parse("Jid.42"), Some(jid));
        assert_eq!(jid.id_attr(), "id=\"Jid.42\"");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Jid::parse(""), None);
        assert_eq!(Jid::parse("Jid."), None);
        assert_eq!(Jid::parse("Jid.0"), None);
        assert_eq!(Jid::parse("Jid.-3"), None);
        assert_eq!(Jid::parse("Jid.+3"), None);
        assert_eq!(Jid::parse("jid.3"), None);
        assert_eq!(Jid::parse("foo"), None);
    }

    #[test]
    fn test_zero_is_not_a_jid() {
        assert!(Jid::new(0).is_none());
    }
}
