//! Phone number normalization
//!
//! Patient records store phone numbers in whatever format the front desk typed.
//! Lookups therefore go through the full set of textual encodings a number may
//! have been saved under. Everything here is pure.

use crate::ValidationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Minimum digit count accepted as a dialable number.
const MIN_DIGITS: usize = 7;

/// E.164 maximum length.
const MAX_DIGITS: usize = 15;

/// A parsed phone number in canonical digit form.
///
/// North American numbers are stored as their 10-digit national number,
/// everything else as the full digit string without a leading `+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneNumber {
    digits: String,
    nanp: bool,
}

impl PhoneNumber {
    /// Parse a raw caller number.
    ///
    /// Separators and a `tel:` style prefix are ignored; anything after an
    /// extension marker (`x`, `ext`, `;`, `,`, `#`) is dropped.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let digits = extract_digits(raw);
        if digits.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "phone".to_string(),
            });
        }

        if digits.len() == 11 && digits.starts_with('1') {
            return Ok(Self {
                digits: digits[1..].to_string(),
                nanp: true,
            });
        }
        if digits.len() == 10 {
            return Ok(Self { digits, nanp: true });
        }
        if (MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
            return Ok(Self {
                digits,
                nanp: false,
            });
        }

        Err(ValidationError::InvalidValue {
            field: "phone".to_string(),
            reason: format!("{} digits is not a dialable number", digits.len()),
        })
    }

    /// Canonical digits.
    pub fn digits(&self) -> &str {
        &self.digits
    }

    pub fn is_nanp(&self) -> bool {
        self.nanp
    }

    pub fn e164(&self) -> String {
        if self.nanp {
            format!("+1{}", self.digits)
        } else {
            format!("+{}", self.digits)
        }
    }

    /// Every textual encoding this number is plausibly stored under.
    ///
    /// Sorted and deduplicated, so the output is stable for a given number.
    pub fn variants(&self) -> Vec<String> {
        let mut out = BTreeSet::new();
        let d = &self.digits;
        out.insert(d.clone());
        out.insert(self.e164());

        if self.nanp {
            let (area, exchange, line) = (&d[0..3], &d[3..6], &d[6..10]);
            out.insert(format!("1{d}"));
            out.insert(format!("({area}) {exchange}-{line}"));
            out.insert(format!("{area}-{exchange}-{line}"));
            out.insert(format!("{area}.{exchange}.{line}"));
            out.insert(format!("{area} {exchange} {line}"));
            out.insert(format!("1-{area}-{exchange}-{line}"));
            out.insert(format!("+1-{area}-{exchange}-{line}"));
            out.insert(format!("+1 ({area}) {exchange}-{line}"));
            out.insert(format!("+1 {area} {exchange} {line}"));
        }

        out.into_iter().collect()
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.e164())
    }
}

/// From the first digit up to an extension marker.
static DIALED_PART: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[0-9][^A-Za-z;,#]*").ok());

static NON_DIGIT: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[^0-9]+").ok());

fn extract_digits(raw: &str) -> String {
    let (Some(dialed), Some(non_digit)) = (DIALED_PART.as_ref(), NON_DIGIT.as_ref()) else {
        return String::new();
    };
    dialed
        .find(raw.trim())
        .map(|m| non_digit.replace_all(m.as_str(), "").into_owned())
        .unwrap_or_default()
}

/// Canonical digits for `raw`, or `None` if it is not a dialable number.
pub fn normalize_digits(raw: &str) -> Option<String> {
    PhoneNumber::parse(raw).ok().map(|p| p.digits)
}

/// All lookup encodings for `raw`; empty when it cannot be parsed.
pub fn phone_variants(raw: &str) -> Vec<String> {
    PhoneNumber::parse(raw)
        .map(|p| p.variants())
        .unwrap_or_default()
}

/// True when both inputs parse to the same canonical number.
pub fn same_number(a: &str, b: &str) -> bool {
    match (normalize_digits(a), normalize_digits(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_matches_stored_digits() {
        let caller = PhoneNumber::parse("+1-555-010-2000").unwrap();
        assert_eq!(caller.digits(), "5550102000");
        assert!(caller.variants().contains(&"5550102000".to_string()));
        assert!(same_number("+1-555-010-2000", "5550102000"));
    }

    #[test]
    fn test_nanp_variants() {
        let variants = phone_variants("(555) 010-2000");
        for expected in [
            "5550102000",
            "15550102000",
            "+15550102000",
            "(555) 010-2000",
            "555-010-2000",
            "555.010.2000",
            "555 010 2000",
            "1-555-010-2000",
            "+1-555-010-2000",
        ] {
            assert!(variants.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_extension_is_dropped() {
        assert_eq!(
            normalize_digits("555-010-2000 ext. 12").as_deref(),
            Some("5550102000")
        );
        assert_eq!(normalize_digits("5550102000x9").as_deref(), Some("5550102000"));
        assert_eq!(normalize_digits("tel:+15550102000;ext=4").as_deref(), Some("5550102000"));
        assert_eq!(normalize_digits("555 010 2000, 3").as_deref(), Some("5550102000"));
    }

    #[test]
    fn test_leading_text_is_ignored() {
        assert_eq!(normalize_digits("cell: (555) 010-2000").as_deref(), Some("5550102000"));
        assert_eq!(extract_digits("no digits here"), "");
    }

    #[test]
    fn test_international_number() {
        let p = PhoneNumber::parse("+44 20 7946 0958").unwrap();
        assert!(!p.is_nanp());
        assert_eq!(p.e164(), "+442079460958");
        assert_eq!(p.variants(), vec!["+442079460958", "442079460958"]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(PhoneNumber::parse("").is_err());
        assert!(PhoneNumber::parse("anonymous").is_err());
        assert!(PhoneNumber::parse("911").is_err());
        assert!(phone_variants("12").is_empty());
        assert!(!same_number("anonymous", "anonymous"));
    }
}
