use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

pub const THIRTY_DAYS_TOKEN: &str = "thirtyDays";
/// Number of calendar months kept in a domain's rolling window.
pub const WINDOW_MONTHS: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("anchor date must be a string, found {found}")]
    NotAString { found: &'static str },
    #[error("anchor date must be formatted as YYYY-MM-DD, found {value:?}")]
    InvalidFormat { value: String },
    #[error("anchor date is not a calendar date: {value}")]
    InvalidDate { value: String },
    #[error("invalid period key: {value:?}")]
    InvalidPeriod { value: String },
    #[error("anchor date {value} puts the summary window outside years 0000-9999")]
    AnchorOutOfRange { value: String },
}

/// A calendar month, rendered as the ISO date of its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonthKey {
    year: i32,
    month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Result<Self, ValidationError> {
        if !(1..=12).contains(&month) || !(0..=9999).contains(&year) {
            return Err(ValidationError::InvalidPeriod {
                value: format!("{year:04}-{month:02}-01"),
            });
        }
        Ok(Self { year, month })
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Shift by a signed number of months.
    pub fn offset(self, months: i32) -> Self {
        let index = self.year * 12 + (self.month as i32 - 1) + months;
        Self {
            year: index.div_euclid(12),
            month: index.rem_euclid(12) as u32 + 1,
        }
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-01", self.year, self.month)
    }
}

/// Identifies one summary slot of a domain: a calendar month or the trailing
/// thirty-day window. Months sort chronologically and `ThirtyDays` sorts last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeriodKey {
    Month(MonthKey),
    ThirtyDays,
}

impl PeriodKey {
    pub fn is_month(&self) -> bool {
        matches!(self, PeriodKey::Month(_))
    }

    pub fn as_month(&self) -> Option<MonthKey> {
        match self {
            PeriodKey::Month(month) => Some(*month),
            PeriodKey::ThirtyDays => None,
        }
    }
}

impl From<MonthKey> for PeriodKey {
    fn from(value: MonthKey) -> Self {
        PeriodKey::Month(value)
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodKey::Month(month) => write!(f, "{month}"),
            PeriodKey::ThirtyDays => f.write_str(THIRTY_DAYS_TOKEN),
        }
    }
}

impl FromStr for PeriodKey {
    type Err = ValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input == THIRTY_DAYS_TOKEN {
            return Ok(PeriodKey::ThirtyDays);
        }
        let invalid = || ValidationError::InvalidPeriod {
            value: input.to_string(),
        };
        let date = parse_date(input).map_err(|_| invalid())?;
        if date.day() != 1 {
            return Err(invalid());
        }
        Ok(PeriodKey::Month(MonthKey::containing(date)))
    }
}

impl Serialize for PeriodKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeriodKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn anchor_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$").expect("valid regex"))
}

/// Validates a loosely-typed anchor (e.g. a job payload field).
pub fn parse_anchor(value: &Value) -> Result<NaiveDate, ValidationError> {
    match value {
        Value::String(raw) => parse_anchor_str(raw),
        Value::Null => Err(ValidationError::NotAString { found: "null" }),
        Value::Bool(_) => Err(ValidationError::NotAString { found: "boolean" }),
        Value::Number(_) => Err(ValidationError::NotAString { found: "number" }),
        Value::Array(_) => Err(ValidationError::NotAString { found: "array" }),
        Value::Object(_) => Err(ValidationError::NotAString { found: "object" }),
    }
}

pub fn parse_anchor_str(raw: &str) -> Result<NaiveDate, ValidationError> {
    check_anchor(parse_date(raw)?)
}

/// Rejects anchors whose window would reach months that have no
/// `YYYY-MM-01` key.
pub fn check_anchor(anchor: NaiveDate) -> Result<NaiveDate, ValidationError> {
    let oldest = MonthKey::containing(anchor).offset(1 - WINDOW_MONTHS as i32);
    MonthKey::new(oldest.year(), oldest.month())
        .and_then(|_| MonthKey::new(anchor.year(), anchor.month()))
        .map_err(|_| ValidationError::AnchorOutOfRange {
            value: anchor.to_string(),
        })?;
    Ok(anchor)
}

fn parse_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    if !anchor_pattern().is_match(raw) {
        return Err(ValidationError::InvalidFormat {
            value: raw.to_string(),
        });
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ValidationError::InvalidDate {
        value: raw.to_string(),
    })
}

/// The anchor's month and the twelve months before it, oldest first.
pub fn periods(anchor: NaiveDate) -> Vec<PeriodKey> {
    let current = MonthKey::containing(anchor);
    (0..WINDOW_MONTHS as i32)
        .rev()
        .map(|back| PeriodKey::Month(current.offset(-back)))
        .collect()
}
