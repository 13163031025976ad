//! Message flag types

use std::collections::BTreeSet;
use std::fmt;

/// A single message flag
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    /// Message has been answered
    Answered,
    /// Message is marked for deletion
    Deleted,
    /// Message is a draft
    Draft,
    /// Message is flagged/starred
    Flagged,
    /// Message is new since the last session checkpoint
    Recent,
    /// Message has been read
    Seen,
    /// Any other keyword, kept verbatim
    Keyword(String),
}

impl Flag {
    /// Parse a flag from its IMAP text form
    pub fn parse(text: &str) -> Self {
        match text.to_lowercase().as_str() {
            "\\seen" => Flag::Seen,
            "\\answered" => Flag::Answered,
            "\\flagged" => Flag::Flagged,
            "\\deleted" => Flag::Deleted,
            "\\draft" => Flag::Draft,
            "\\recent" => Flag::Recent,
            _ => Flag::Keyword(text.to_string()),
        }
    }

    pub fn is_recent(&self) -> bool {
        matches!(self, Flag::Recent)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Answered => f.write_str("\\Answered"),
            Flag::Deleted => f.write_str("\\Deleted"),
            Flag::Draft => f.write_str("\\Draft"),
            Flag::Flagged => f.write_str("\\Flagged"),
            Flag::Recent => f.write_str("\\Recent"),
            Flag::Seen => f.write_str("\\Seen"),
            Flag::Keyword(keyword) => f.write_str(keyword),
        }
    }
}

/// An ordered set of message flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlagSet(BTreeSet<Flag>);

impl FlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse flags from an IMAP FETCH response
    pub fn from_imap_flags(flags: &[&str]) -> Self {
        flags.iter().map(|flag| Flag::parse(flag)).collect()
    }

    /// Convert to IMAP flag strings
    pub fn to_imap_flags(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    pub fn insert(&mut self, flag: Flag) -> bool {
        self.0.insert(flag)
    }

    pub fn remove(&mut self, flag: &Flag) -> bool {
        self.0.remove(flag)
    }

    pub fn contains(&self, flag: &Flag) -> bool {
        self.0.contains(flag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.0.iter()
    }

    /// Copy of this set with `\Recent` removed
    pub fn without_recent(&self) -> Self {
        self.0.iter().filter(|f| !f.is_recent()).cloned().collect()
    }

    /// Compare two sets ignoring `\Recent`.
    ///
    /// Recent changes alone never count as a flag update.
    pub fn significant_eq(&self, other: &FlagSet) -> bool {
        self.0
            .iter()
            .filter(|f| !f.is_recent())
            .eq(other.0.iter().filter(|f| !f.is_recent()))
    }
}

impl FromIterator<Flag> for FlagSet {
    fn from_iter<I: IntoIterator<Item = Flag>>(iter: I) -> Self {
        FlagSet(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Flag; N]> for FlagSet {
    fn from(flags: [Flag; N]) -> Self {
        flags.into_iter().collect()
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, flag) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", flag)?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let flags = FlagSet::from_imap_flags(&["\\SEEN", "\\Flagged", "$Forwarded"]);
        assert!(flags.contains(&Flag::Seen));
        assert!(flags.contains(&Flag::Flagged));
        assert!(flags.contains(&Flag::Keyword("$Forwarded".into())));
        assert_eq!(flags.to_imap_flags(), vec!["\\Flagged", "\\Seen", "$Forwarded"]);
    }

    #[test]
    fn test_significant_eq_ignores_recent() {
        let recent = FlagSet::from([Flag::Recent]);
        assert!(recent.significant_eq(&FlagSet::new()));
        assert!(FlagSet::new().significant_eq(&FlagSet::new()));
        assert!(FlagSet::from([Flag::Recent, Flag::Seen]).significant_eq(&FlagSet::from([Flag::Seen])));
        assert!(!recent.significant_eq(&FlagSet::from([Flag::Seen])));
    }

    #[test]
    fn test_display() {
        assert_eq!(FlagSet::new().to_string(), "()");
        assert_eq!(
            FlagSet::from([Flag::Seen, Flag::Answered]).to_string(),
            "(\\Answered \\Seen)"
        );
    }
}
