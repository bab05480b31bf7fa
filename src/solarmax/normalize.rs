use crate::error::{SolarMaxError, SolarMaxResult};
use crate::solarmax::field::QueryField;
use crate::solarmax::frame::RawFields;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::BTreeMap;

pub type Values = BTreeMap<QueryField, NormalizedValue>;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NormalizedValue {
    Float(f64),
    Integer(u64),
    Pair(u64, u64),
    Timestamp(NaiveDateTime),
}

impl NormalizedValue {
    /// Numeric view; integers widen to floats so that unscaled fields can
    /// take part in arithmetic.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<(u64, u64)> {
        match self {
            Self::Pair(x, y) => Some((*x, *y)),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rule {
    Scaled(u32),
    Integer,
    Pair,
    DateTime,
}

impl Rule {
    fn for_field(field: QueryField) -> Self {
        use QueryField::*;

        match field {
            KDY | UL1 | UDC => Rule::Scaled(10),
            IL1 | IDC | TNF => Rule::Scaled(100),
            PAC | PIN => Rule::Scaled(2),
            SYS => Rule::Pair,
            SDAT | FDAT => Rule::DateTime,
            _ => Rule::Integer,
        }
    }
}

pub fn normalize(field: QueryField, raw: &str) -> SolarMaxResult<NormalizedValue> {
    match Rule::for_field(field) {
        Rule::Scaled(divisor) => Ok(NormalizedValue::Float(
            hex(field, raw)? as f64 / divisor as f64,
        )),
        Rule::Integer => Ok(NormalizedValue::Integer(hex(field, raw)?)),
        Rule::Pair => {
            let (x, y) = split_pair(field, raw)?;
            Ok(NormalizedValue::Pair(hex(field, x)?, hex(field, y)?))
        }
        Rule::DateTime => datetime(field, raw).map(NormalizedValue::Timestamp),
    }
}

pub fn normalize_all(raw: &RawFields) -> SolarMaxResult<Values> {
    raw.iter()
        .map(|(field, value)| normalize(*field, value).map(|v| (*field, v)))
        .collect()
}

fn hex(field: QueryField, raw: &str) -> SolarMaxResult<u64> {
    u64::from_str_radix(raw.trim(), 16).map_err(|e| SolarMaxError::value_decode(field, raw, e))
}

fn split_pair(field: QueryField, raw: &str) -> SolarMaxResult<(&str, &str)> {
    raw.split_once(',')
        .ok_or_else(|| SolarMaxError::value_decode(field, raw, "expected two comma separated parts"))
}

// "7E80C1F,B4B2" -> 2024-12-31 12:50:58
// date: 3 hex digits year, 2 month, rest day; time: seconds since midnight
fn datetime(field: QueryField, raw: &str) -> SolarMaxResult<NaiveDateTime> {
    let (date, time) = split_pair(field, raw)?;

    let part = |range: std::ops::Range<usize>| -> SolarMaxResult<u64> {
        date.get(range)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SolarMaxError::value_decode(field, raw, "date part too short"))
            .and_then(|s| hex(field, s))
    };
    let year = part(0..3)?;
    let month = part(3..5)?;
    let day = part(5..date.len())?;
    let seconds = hex(field, time)?;

    let narrow = |v: u64| {
        u32::try_from(v).map_err(|_| SolarMaxError::value_decode(field, raw, "not a calendar date"))
    };
    let year = i32::try_from(year)
        .map_err(|_| SolarMaxError::value_decode(field, raw, "not a calendar date"))?;

    NaiveDate::from_ymd_opt(year, narrow(month)?, narrow(day)?)
        .and_then(|d| {
            let hour = u32::try_from(seconds / 3600).ok()?;
            d.and_hms_opt(hour, ((seconds % 3600) / 60) as u32, (seconds % 60) as u32)
        })
        .ok_or_else(|| SolarMaxError::value_decode(field, raw, "not a calendar date"))
}
