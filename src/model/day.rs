//! Calendar-day containers

use super::document::{Keyed, RawDocument};
use crate::error::DecodeError;
use chrono::{DateTime, Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DAY_KEY_FORMAT: &str = "%Y-%m-%d";

/// A calendar date in the `yyyy-MM-dd` form used as a day document id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Day key for an instant, using that instant's own calendar date
    pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self {
        Self(dt.date_naive())
    }

    /// Today's key on the local calendar
    pub fn today() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DAY_KEY_FORMAT))
    }
}

impl FromStr for DayKey {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s, DAY_KEY_FORMAT).map(Self)
    }
}

impl TryFrom<String> for DayKey {
    type Error = chrono::ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DayKey> for String {
    fn from(key: DayKey) -> Self {
        key.to_string()
    }
}

/// A day container. Only ever appears or disappears; never edited client-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRecord {
    id: String,
    pub day: DayKey,
}

impl DayRecord {
    pub fn new(day: DayKey) -> Self {
        Self {
            id: day.to_string(),
            day,
        }
    }

    /// Decode a day document. The document id must be a valid day key; the
    /// field map carries nothing the client needs.
    pub fn decode(doc: &RawDocument) -> Result<Self, DecodeError> {
        let day: DayKey = doc.id.parse().map_err(|_| DecodeError::InvalidDayKey {
            id: doc.id.clone(),
        })?;
        Ok(Self {
            id: doc.id.clone(),
            day,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Keyed for DayRecord {
    fn key(&self) -> &str {
        &self.id
    }
}
