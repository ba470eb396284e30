//! Fixed-point money type.
//!
//! Budget limits and costs are compared exactly, so amounts are held as whole
//! micro-dollars rather than floats. `"0.01"` parses to 10_000 micros.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

const MICROS_PER_DOLLAR: i64 = 1_000_000;
const FRACTION_DIGITS: usize = 6;

/// A non-negative USD amount in micro-dollars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Usd(i64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    pub const fn from_micros(micros: i64) -> Self {
        Usd(micros)
    }

    pub const fn from_cents(cents: i64) -> Self {
        Usd(cents * 10_000)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add(self, other: Usd) -> Usd {
        Usd(self.0.saturating_add(other.0))
    }

    /// Lossy conversion for display and metrics only.
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_DOLLAR as f64
    }

    /// Convert a float amount, rounding to the nearest micro-dollar.
    pub fn from_f64(amount: f64) -> Result<Self, UsdParseError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(UsdParseError(amount.to_string()));
        }
        let micros = (amount * MICROS_PER_DOLLAR as f64).round();
        if micros > i64::MAX as f64 {
            return Err(UsdParseError(amount.to_string()));
        }
        Ok(Usd(micros as i64))
    }

    /// Parse a decimal dollar amount such as `"0.01"`, `"12"` or `"$3.5"`.
    pub fn parse(input: &str) -> Result<Self, UsdParseError> {
        let err = || UsdParseError(input.to_string());
        let trimmed = input.trim();
        let digits = trimmed.strip_prefix('$').unwrap_or(trimmed);
        if digits.is_empty() {
            return Err(err());
        }

        let (whole, fraction) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(err());
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
            || fraction.len() > FRACTION_DIGITS
        {
            return Err(err());
        }

        let whole_value: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| err())?
        };
        let mut fraction_value: i64 = 0;
        if !fraction.is_empty() {
            let padded = format!("{:0<width$}", fraction, width = FRACTION_DIGITS);
            fraction_value = padded.parse().map_err(|_| err())?;
        }

        whole_value
            .checked_mul(MICROS_PER_DOLLAR)
            .and_then(|w| w.checked_add(fraction_value))
            .map(Usd)
            .ok_or_else(err)
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / MICROS_PER_DOLLAR;
        let fraction = format!("{:06}", (self.0 % MICROS_PER_DOLLAR).abs());
        let mut trimmed = fraction.trim_end_matches('0');
        if trimmed.len() < 2 {
            trimmed = &fraction[..2];
        }
        write!(f, "{}.{}", whole, trimmed)
    }
}

impl FromStr for Usd {
    type Err = UsdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Add for Usd {
    type Output = Usd;

    fn add(self, rhs: Usd) -> Usd {
        self.saturating_add(rhs)
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Usd) {
        *self = self.saturating_add(rhs);
    }
}

impl Sum for Usd {
    fn sum<I: Iterator<Item = Usd>>(iter: I) -> Usd {
        iter.fold(Usd::ZERO, |acc, x| acc + x)
    }
}

impl<'a> Sum<&'a Usd> for Usd {
    fn sum<I: Iterator<Item = &'a Usd>>(iter: I) -> Usd {
        iter.copied().sum()
    }
}

// Serialized as a decimal string so JSON clients never see float rounding.
impl Serialize for Usd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UsdRepr {
    Text(String),
    Number(f64),
}

impl<'de> Deserialize<'de> for Usd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match UsdRepr::deserialize(deserializer)? {
            UsdRepr::Text(s) => Usd::parse(&s).map_err(serde::de::Error::custom),
            UsdRepr::Number(n) => Usd::from_f64(n).map_err(serde::de::Error::custom),
        }
    }
}

/// Error when parsing an invalid dollar amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsdParseError(pub String);

impl fmt::Display for UsdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid USD amount: {}", self.0)
    }
}

impl std::error::Error for UsdParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cent() {
        assert_eq!(Usd::parse("0.01").unwrap(), Usd::from_micros(10_000));
        assert_eq!(Usd::parse("$0.01").unwrap(), Usd::from_cents(1));
        assert_eq!(Usd::parse(".5").unwrap(), Usd::from_micros(500_000));
        assert_eq!(Usd::parse("12").unwrap(), Usd::from_micros(12_000_000));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Usd::parse("").is_err());
        assert!(Usd::parse(".").is_err());
        assert!(Usd::parse("-1").is_err());
        assert!(Usd::parse("1.2345678").is_err());
        assert!(Usd::parse("abc").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Usd::from_cents(1).to_string(), "0.01");
        assert_eq!(Usd::from_micros(1_500_000).to_string(), "1.50");
        assert_eq!(Usd::from_micros(1_234_567).to_string(), "1.234567");
        assert_eq!(Usd::ZERO.to_string(), "0.00");
    }

    #[test]
    fn test_sum_and_ordering() {
        let total: Usd = [Usd::from_micros(5_000), Usd::from_micros(5_000)].iter().sum();
        assert_eq!(total, Usd::parse("0.01").unwrap());
        assert!(total >= Usd::from_cents(1));
    }

    #[test]
    fn test_serde_accepts_string_and_number() {
        let from_str: Usd = serde_json::from_str("\"0.25\"").unwrap();
        let from_num: Usd = serde_json::from_str("0.25").unwrap();
        assert_eq!(from_str, from_num);
        assert_eq!(serde_json::to_string(&from_str).unwrap(), "\"0.25\"");
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: Display output parses back to the same amount
        #[test]
        fn prop_display_parses_back(micros in 0i64..10_000_000_000_000) {
            let amount = Usd::from_micros(micros);
            prop_assert_eq!(Usd::parse(&amount.to_string()).unwrap(), amount);
        }
    }
}
