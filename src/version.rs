//! Version parsing and ordering for installer packages.
//!
//! Kandji package versions are dot-separated and mostly numeric, but vendors
//! sneak in suffixes (`1.2b`, `90.0.4480`), so this is not semver. Each
//! component splits into a numeric prefix and a textual remainder: numeric
//! prefixes compare numerically (a component with no digits sorts below any
//! numbered one), remainders compare lexically. Missing components compare
//! as empty, so `1.2.1 > 1.2`.

use std::cmp::Ordering;
use std::fmt;

/// A parsed, orderable package version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageVersion {
    raw: String,
    components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Component {
    number: Option<u64>,
    suffix: String,
}

impl Component {
    fn parse(text: &str) -> Self {
        let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
        let suffix = text[digits.len()..].to_string();
        Self {
            number: digits.parse().ok(),
            suffix,
        }
    }

    fn empty() -> Self {
        Self {
            number: None,
            suffix: String::new(),
        }
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.number, other.number) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.suffix.cmp(&other.suffix)),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => self.suffix.cmp(&other.suffix),
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PackageVersion {
    /// Parse a version string. Never fails; unrecognized text still gets a
    /// stable (if lowly) position in the order.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let components = trimmed
            .split('.')
            .filter(|part| !part.is_empty())
            .map(Component::parse)
            .collect();
        Self {
            raw: trimmed.to_string(),
            components,
        }
    }

    /// The original version text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        let empty = Component::empty();
        for i in 0..len {
            let a = self.components.get(i).unwrap_or(&empty);
            let b = other.components.get(i).unwrap_or(&empty);
            match a.cmp(b) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
