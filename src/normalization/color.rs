use serde::{Deserialize, Serialize};

/// Non-semantic trailing words stripped before the base/suffix split.
const NOISE_SUFFIXES: [&str; 2] = ["LOGO", "OS"];

/// Canonical comparison form of a raw color token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedColor {
    base: String,
    numeric_suffix: String,
}

impl NormalizedColor {
    /// Build the normalized form of a raw color label.
    ///
    /// Normalization steps:
    /// - upper-case and trim
    /// - strip multi-image sequence artifacts (`BLACK_1`, `BLACK_2` → `BLACK`)
    ///   and trailing `LOGO` / `OS` markers, repeatedly
    /// - drop every non-alphanumeric character
    /// - split a clean `letters+digits` shape into base and numeric suffix
    pub fn new(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        let stripped = strip_noise(&upper);
        let cleaned: String = stripped.chars().filter(|c| c.is_alphanumeric()).collect();

        match split_letters_digits(&cleaned) {
            Some((base, digits)) => Self {
                base: base.to_string(),
                numeric_suffix: digits.to_string(),
            },
            None => Self {
                base: cleaned,
                numeric_suffix: String::new(),
            },
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Trailing digit run of the cleaned token; empty when there is none.
    pub fn numeric_suffix(&self) -> &str {
        &self.numeric_suffix
    }

    pub fn has_numeric(&self) -> bool {
        !self.numeric_suffix.is_empty()
    }

    /// Base and suffix concatenated back together.
    pub fn compact(&self) -> String {
        format!("{}{}", self.base, self.numeric_suffix)
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty() && self.numeric_suffix.is_empty()
    }
}

/// Shorthand for [`NormalizedColor::new`].
pub fn normalize_color(raw: &str) -> NormalizedColor {
    NormalizedColor::new(raw)
}

fn strip_noise(input: &str) -> String {
    let mut current = input.trim().to_string();
    loop {
        let next = strip_sequence_suffix(&current)
            .or_else(|| strip_noise_word(&current))
            .map(|s| s.trim_end().to_string());
        match next {
            Some(s) if s.chars().any(char::is_alphanumeric) => current = s,
            _ => return current,
        }
    }
}

/// `BLACK_2` → `BLACK`; a bare `_` run with no digits after it is left alone.
fn strip_sequence_suffix(input: &str) -> Option<&str> {
    let (head, tail) = input.rsplit_once('_')?;
    if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
        Some(head)
    } else {
        None
    }
}

fn strip_noise_word(input: &str) -> Option<&str> {
    for word in NOISE_SUFFIXES {
        if let Some(head) = input.strip_suffix(word) {
            let head = head.trim_end_matches(['_', '-', ' ']);
            return Some(head);
        }
    }
    None
}

/// Leading alphabetic run followed by an ASCII digit run, covering the whole input.
fn split_letters_digits(input: &str) -> Option<(&str, &str)> {
    let split_at = input
        .char_indices()
        .find(|(_, c)| !c.is_alphabetic())
        .map(|(i, _)| i)
        .unwrap_or(input.len());
    let (letters, digits) = input.split_at(split_at);
    if digits.chars().all(|c| c.is_ascii_digit()) {
        Some((letters, digits))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_code_into_base_and_suffix() {
        let c = NormalizedColor::new("dbr01");
        assert_eq!(c.base(), "DBR");
        assert_eq!(c.numeric_suffix(), "01");
        assert_eq!(c.compact(), "DBR01");
    }

    #[test]
    fn drops_sequence_artifacts() {
        assert_eq!(NormalizedColor::new("BLACK_1"), NormalizedColor::new("BLACK_2"));
        assert_eq!(NormalizedColor::new("BLACK_1_3").base(), "BLACK");
        assert!(!NormalizedColor::new("BLACK_1").has_numeric());
    }

    #[test]
    fn drops_logo_and_os_markers() {
        assert_eq!(NormalizedColor::new("Black Logo").base(), "BLACK");
        assert_eq!(NormalizedColor::new("NAVY-OS").base(), "NAVY");
        assert_eq!(NormalizedColor::new("WHITE_LOGO_2").base(), "WHITE");
    }

    #[test]
    fn keeps_marker_when_nothing_else_is_left() {
        assert_eq!(NormalizedColor::new("OS").base(), "OS");
        assert_eq!(NormalizedColor::new("logo").base(), "LOGO");
    }

    #[test]
    fn strips_punctuation_and_spaces() {
        let c = NormalizedColor::new(" dark brown / 02 ");
        assert_eq!(c.base(), "DARKBROWN");
        assert_eq!(c.numeric_suffix(), "02");
    }

    #[test]
    fn irregular_shape_keeps_whole_token_as_base() {
        let c = NormalizedColor::new("2TONE");
        assert_eq!(c.base(), "2TONE");
        assert_eq!(c.numeric_suffix(), "");
        let c = NormalizedColor::new("RED2BLUE");
        assert_eq!(c.base(), "RED2BLUE");
    }

    #[test]
    fn pure_numeric_code_has_empty_base() {
        let c = NormalizedColor::new("001");
        assert_eq!(c.base(), "");
        assert_eq!(c.numeric_suffix(), "001");
    }

    #[test]
    fn keeps_non_ascii_letters() {
        assert_eq!(NormalizedColor::new("grün").base(), "GRÜN");
    }

    #[test]
    fn compact_reconstructs_clean_alphanumerics() {
        for raw in ["Navy 12", "BLO", "taupe", "c-04", "ÉCRU9"] {
            let c = NormalizedColor::new(raw);
            let expected: String = raw
                .to_uppercase()
                .chars()
                .filter(|ch| ch.is_alphanumeric())
                .collect();
            assert_eq!(c.compact(), expected, "{raw}");
            assert!(!c.base().chars().any(|ch| ch.is_ascii_digit()), "{raw}");
        }
    }
}
