//! Synchronization cursors.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// An opaque per-collection synchronization cursor.
///
/// A synckey is either the reset key `"0"` or a key of the form
/// `{<guid>}<counter>`. All keys issued for one collection baseline share a
/// guid (a *series*); the counter increases by one for every response that
/// advances the baseline.
///
/// # Invariants
///
/// - `"0"` never names a stored state; it always requests a full resync
/// - a non-zero key has a counter of at least 1
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncKey(Repr);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Repr {
    Zero,
    Issued { series: String, counter: u64 },
}

impl SyncKey {
    /// Returns the reset key `"0"`.
    #[must_use]
    pub fn zero() -> Self {
        Self(Repr::Zero)
    }

    /// Starts a new series with counter 1.
    #[must_use]
    pub fn new_series() -> Self {
        Self(Repr::Issued {
            series: Uuid::new_v4().to_string(),
            counter: 1,
        })
    }

    /// Parses a synckey as sent by a client.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidSyncKey`] if the value is neither `"0"`
    /// nor a well-formed `{guid}counter` key.
    pub fn parse(value: &str) -> ProtocolResult<Self> {
        if value == "0" {
            return Ok(Self::zero());
        }

        let invalid = || ProtocolError::InvalidSyncKey(value.to_string());
        let rest = value.strip_prefix('{').ok_or_else(invalid)?;
        let (series, counter) = rest.split_once('}').ok_or_else(invalid)?;

        if series.is_empty()
            || !series
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid());
        }
        if counter.is_empty() || !counter.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let counter: u64 = counter.parse().map_err(|_| invalid())?;
        if counter == 0 {
            return Err(invalid());
        }

        Ok(Self(Repr::Issued {
            series: series.to_string(),
            counter,
        }))
    }

    /// Returns true for the reset key `"0"`.
    pub fn is_zero(&self) -> bool {
        matches!(self.0, Repr::Zero)
    }

    /// Returns the series guid, or `None` for `"0"`.
    pub fn series(&self) -> Option<&str> {
        match &self.0 {
            Repr::Zero => None,
            Repr::Issued { series, .. } => Some(series),
        }
    }

    /// Returns the counter, `0` for the reset key.
    pub fn counter(&self) -> u64 {
        match &self.0 {
            Repr::Zero => 0,
            Repr::Issued { counter, .. } => *counter,
        }
    }

    /// Returns the key that follows this one.
    ///
    /// The successor of `"0"` is the first key of a fresh series.
    #[must_use]
    pub fn next(&self) -> Self {
        match &self.0 {
            Repr::Zero => Self::new_series(),
            Repr::Issued { series, counter } => Self(Repr::Issued {
                series: series.clone(),
                counter: counter + 1,
            }),
        }
    }

    /// Returns true if `other` belongs to the same series and precedes this key.
    pub fn supersedes(&self, other: &SyncKey) -> bool {
        match (self.series(), other.series()) {
            (Some(a), Some(b)) => a == b && other.counter() < self.counter(),
            _ => false,
        }
    }
}

impl Default for SyncKey {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Zero => f.write_str("0"),
            Repr::Issued { series, counter } => write!(f, "{{{series}}}{counter}"),
        }
    }
}

impl FromStr for SyncKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SyncKey {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SyncKey> for String {
    fn from(key: SyncKey) -> Self {
        key.to_string()
    }
}
