//! Heuristic password strength rating.
//!
//! This counts character classes and length. It is not an entropy estimate
//! and says nothing about resistance to a real attacker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Punctuation that counts as a symbol.
pub const SYMBOLS: &str = "!@#$%^&*()_+-=[]{};':\"\\|,.<>/?`~";

/// Minimum length (in characters) that satisfies the length criterion.
pub const MIN_LENGTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrengthLevel {
    Weak,
    Medium,
    Strong,
}

impl StrengthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrengthLevel::Weak => "weak",
            StrengthLevel::Medium => "medium",
            StrengthLevel::Strong => "strong",
        }
    }
}

impl fmt::Display for StrengthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the five criteria a password meets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StrengthCriteria {
    pub lowercase: bool,
    pub uppercase: bool,
    pub digit: bool,
    pub symbol: bool,
    pub long_enough: bool,
}

impl StrengthCriteria {
    pub fn of(password: &str) -> Self {
        Self {
            lowercase: password.chars().any(|c| c.is_ascii_lowercase()),
            uppercase: password.chars().any(|c| c.is_ascii_uppercase()),
            digit: password.chars().any(|c| c.is_ascii_digit()),
            symbol: password.chars().any(|c| SYMBOLS.contains(c)),
            long_enough: password.chars().count() >= MIN_LENGTH,
        }
    }

    pub fn met(&self) -> usize {
        [
            self.lowercase,
            self.uppercase,
            self.digit,
            self.symbol,
            self.long_enough,
        ]
        .into_iter()
        .filter(|&c| c)
        .count()
    }
}

/// Four or more criteria is strong, three is medium, anything less is weak.
pub fn evaluate(password: &str) -> StrengthLevel {
    if password.is_empty() {
        return StrengthLevel::Weak;
    }
    match StrengthCriteria::of(password).met() {
        4.. => StrengthLevel::Strong,
        3 => StrengthLevel::Medium,
        _ => StrengthLevel::Weak,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_is_weak() {
        assert_eq!(evaluate(""), StrengthLevel::Weak);
        assert_eq!(StrengthCriteria::of("").met(), 0);
    }

    #[test]
    fn all_classes_and_long_is_strong() {
        let pw = "aB3$efGh1!jkLm9#";
        assert_eq!(pw.chars().count(), 16);
        assert_eq!(StrengthCriteria::of(pw).met(), 5);
        assert_eq!(evaluate(pw), StrengthLevel::Strong);
    }

    #[test]
    fn short_lowercase_is_weak() {
        assert_eq!(evaluate("abcdef"), StrengthLevel::Weak);
    }

    #[test]
    fn long_lowercase_with_digit_is_medium() {
        let pw = "passwordpass1";
        assert_eq!(pw.chars().count(), 13);
        let criteria = StrengthCriteria::of(pw);
        assert!(criteria.lowercase && criteria.digit && criteria.long_enough);
        assert!(!criteria.uppercase && !criteria.symbol);
        assert_eq!(evaluate(pw), StrengthLevel::Medium);
    }

    #[test]
    fn four_criteria_without_length_is_strong() {
        assert_eq!(evaluate("Tr0ub4dor&3"), StrengthLevel::Strong);
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        // 6 characters, 12 bytes
        let pw = "пароль";
        assert_eq!(pw.len(), 12);
        assert!(!StrengthCriteria::of(pw).long_enough);
        assert_eq!(evaluate(pw), StrengthLevel::Weak);
    }

    #[test]
    fn space_is_not_a_symbol() {
        assert!(!StrengthCriteria::of("a b").symbol);
        assert!(StrengthCriteria::of("a~b").symbol);
    }

    proptest! {
        #[test]
        fn rating_is_deterministic(pw in any::<String>()) {
            prop_assert_eq!(evaluate(&pw), evaluate(&pw));
            prop_assert_eq!(StrengthCriteria::of(&pw), StrengthCriteria::of(&pw));
        }

        #[test]
        fn rating_follows_criteria_count(pw in "\\PC{1,40}") {
            let met = StrengthCriteria::of(&pw).met();
            prop_assert!(met <= 5);
            let expected = match met {
                4.. => StrengthLevel::Strong,
                3 => StrengthLevel::Medium,
                _ => StrengthLevel::Weak,
            };
            prop_assert_eq!(evaluate(&pw), expected);
        }
    }

    #[test]
    fn levels_are_ordered() {
        assert!(StrengthLevel::Weak < StrengthLevel::Medium);
        assert!(StrengthLevel::Medium < StrengthLevel::Strong);
        assert_eq!(
            serde_json::to_string(&StrengthLevel::Medium).unwrap(),
            "\"medium\""
        );
    }
}
