//! Core domain model for the sales-to-customer-record sync.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const CRATE_NAME: &str = "gumsync-core";

/// Monetary amount held as integer minor units (cents).
///
/// Float inputs are rounded half away from zero, which for the non-negative
/// amounts seen in sales is round-half-up. Sums never touch floating point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Largest magnitude accepted from float input: one trillion in major units.
    pub const MAX_MINOR_UNITS: i64 = 100_000_000_000_000;

    pub const fn from_minor_units(cents: i64) -> Self {
        Self(cents)
    }

    /// Returns `None` for NaN, infinite, or out-of-range input.
    pub fn from_minor_units_f64(cents: f64) -> Option<Self> {
        if !cents.is_finite() {
            return None;
        }
        let rounded = cents.round();
        if rounded.abs() > Self::MAX_MINOR_UNITS as f64 {
            return None;
        }
        Some(Self(rounded as i64))
    }

    /// Converts a major-unit amount such as `19.99` into cents.
    pub fn from_major_units(amount: f64) -> Option<Self> {
        if !amount.is_finite() {
            return None;
        }
        Self::from_minor_units_f64(amount * 100.0)
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub fn as_major_units(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.copied().sum()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_major_units())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let amount = f64::deserialize(deserializer)?;
        Money::from_major_units(amount)
            .ok_or_else(|| serde::de::Error::custom("amount must be a finite number within range"))
    }
}

/// Opaque identifier assigned by the record store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One entry of a customer's purchase history. Repeats are meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductRef {
    pub name: String,
}

impl ProductRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A sale as reported by the payment feed. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleEvent {
    pub price: Money,
    pub product_name: String,
    pub buyer_email: String,
    pub can_contact: bool,
    pub created_at: DateTime<Utc>,
}

impl SaleEvent {
    /// The record a fresh sale becomes before any merging.
    pub fn to_new_record(&self) -> NewRecord {
        NewRecord {
            email: self.buyer_email.clone(),
            total_spent: self.price,
            subscribed: self.can_contact,
            purchased_products: vec![ProductRef::new(self.product_name.clone())],
        }
    }
}

/// An active customer row as read back from the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub id: RecordId,
    pub email: String,
    pub total_spent: Money,
    pub subscribed: bool,
    pub purchased_products: Vec<ProductRef>,
    pub created_at: DateTime<Utc>,
}

/// Creation payload; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub email: String,
    pub total_spent: Money,
    pub subscribed: bool,
    pub purchased_products: Vec<ProductRef>,
}

/// Fields rewritten on a surviving record when duplicates fold into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    pub total_spent: Money,
    pub subscribed: bool,
    pub purchased_products: Vec<ProductRef>,
}
