//! Parsing of capacity quantities.
//!
//! A capacity is a positive integer byte count, optionally carrying a
//! binary (`Ki`..`Ei`) or decimal (`k`..`E`) SI suffix, the same grammar
//! the orchestrator uses for storage resource quantities.

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref CAPACITY: Regex = Regex::new(r"^([0-9]+)([kMGTPE]|[KMGTPE]i)?$").unwrap();
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CapacityError {
    #[error("'{0}' is not a capacity quantity")]
    Malformed(String),
    #[error("capacity must be a positive number of bytes, got '{0}'")]
    NotPositive(String),
    #[error("capacity '{0}' overflows the byte counter")]
    Overflow(String),
}

/// Returns true when the string is a well-formed, positive capacity.
pub fn is_capacity(s: &str) -> bool {
    parse(s).is_ok()
}

/// Parses a capacity quantity into bytes.
pub fn parse(s: &str) -> Result<i64, CapacityError> {
    let captures = CAPACITY
        .captures(s)
        .ok_or_else(|| CapacityError::Malformed(s.to_owned()))?;

    let amount: i64 = captures[1]
        .parse()
        .map_err(|_| CapacityError::Overflow(s.to_owned()))?;

    let multiplier: i64 = match captures.get(2).map(|m| m.as_str()) {
        None => 1,
        Some("k") => 1_000,
        Some("M") => 1_000_000,
        Some("G") => 1_000_000_000,
        Some("T") => 1_000_000_000_000,
        Some("P") => 1_000_000_000_000_000,
        Some("E") => 1_000_000_000_000_000_000,
        Some("Ki") => 1 << 10,
        Some("Mi") => 1 << 20,
        Some("Gi") => 1 << 30,
        Some("Ti") => 1 << 40,
        Some("Pi") => 1 << 50,
        Some("Ei") => 1 << 60,
        Some(other) => return Err(CapacityError::Malformed(other.to_owned())),
    };

    let bytes = amount
        .checked_mul(multiplier)
        .ok_or_else(|| CapacityError::Overflow(s.to_owned()))?;

    if bytes <= 0 {
        return Err(CapacityError::NotPositive(s.to_owned()));
    }

    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_bytes() {
        assert_eq!(parse("12345"), Ok(12345));
    }

    #[test]
    fn binary_suffixes() {
        assert_eq!(parse("1Ki"), Ok(1024));
        assert_eq!(parse("1Mi"), Ok(1048576));
        assert_eq!(parse("2Gi"), Ok(2 * (1 << 30)));
        assert_eq!(parse("1Ei"), Ok(1 << 60));
    }

    #[test]
    fn decimal_suffixes() {
        assert_eq!(parse("1k"), Ok(1000));
        assert_eq!(parse("3G"), Ok(3_000_000_000));
        assert_eq!(parse("1E"), Ok(1_000_000_000_000_000_000));
    }

    #[test]
    fn zero_is_rejected() {
        assert_eq!(parse("0"), Err(CapacityError::NotPositive("0".into())));
        assert_eq!(parse("0Gi"), Err(CapacityError::NotPositive("0Gi".into())));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse("").is_err());
        assert!(parse("10X").is_err());
        assert!(parse("-5").is_err());
        assert!(parse("1.5Gi").is_err());
        assert!(parse("Gi").is_err());
        assert!(parse("10 Gi").is_err());
    }

    #[test]
    fn overflow_is_rejected() {
        assert_eq!(parse("99E"), Err(CapacityError::Overflow("99E".into())));
        assert!(parse("999999999999999999999").is_err());
    }

    #[test]
    fn template_strings_are_not_capacities() {
        assert!(!is_capacity("{{ requestedMinCapacity }}"));
        assert!(is_capacity("1Gi"));
    }
}
