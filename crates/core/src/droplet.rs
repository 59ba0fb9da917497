//! Droplet: time-sortable distributed identifiers
//!
//! Every document id, block id and version stamp is a Droplet: a 23-character
//! decimal string laid out as
//!
//! ```text
//! 1 TTTTTTTTTTTTT MMMM CCCC S
//! │ │             │    │    └─ checksum: sum of the 22 preceding digits mod 10
//! │ │             │    └────── rolling counter, 0001..=9999
//! │ │             └─────────── machine tag, 0000..=9999
//! │ └───────────────────────── milliseconds since DROPLET_EPOCH_MILLIS
//! └─────────────────────────── fixed prefix digit
//! ```
//!
//! ## Ordering
//!
//! All fields are fixed width, so lexicographic order of the string equals
//! numeric order, which equals creation order for ids from one generator.
//! The generator never hands out the same `(timestamp, counter)` pair twice:
//! when the counter wraps inside one millisecond, or the clock steps
//! backwards, it advances its logical millisecond instead.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Total length of a droplet string
pub const DROPLET_LEN: usize = 23;

/// Fixed leading digit
pub const DROPLET_PREFIX: u8 = b'1';

/// Custom epoch (2022-01-01T00:00:00Z) in Unix milliseconds
pub const DROPLET_EPOCH_MILLIS: i64 = 1_640_995_200_000;

/// Largest counter value before wrapping back to 1
pub const MAX_COUNTER: u16 = 9999;

/// Largest machine tag that fits in four digits
pub const MAX_MACHINE_TAG: u16 = 9999;

const TIMESTAMP_DIGITS: usize = 13;
const MAX_OFFSET_MILLIS: u64 = 9_999_999_999_999;

const TIMESTAMP_RANGE: std::ops::Range<usize> = 1..14;
const MACHINE_RANGE: std::ops::Range<usize> = 14..18;
const COUNTER_RANGE: std::ops::Range<usize> = 18..22;

/// Reasons a string is not a valid droplet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropletError {
    /// Wrong number of characters
    #[error("droplet must be 23 characters, got {0}")]
    Length(usize),

    /// Leading digit is not the fixed prefix
    #[error("droplet prefix must be '1', got '{0}'")]
    Prefix(char),

    /// Contains a character that is not an ASCII digit
    #[error("droplet contains non-digit characters")]
    NonDigit,

    /// Embedded timestamp lies after the validation time
    #[error("droplet timestamp {0} is in the future")]
    Future(DateTime<Utc>),

    /// Checksum digit does not match the payload
    #[error("droplet checksum mismatch: expected {expected}, got {actual}")]
    Checksum {
        /// Checksum computed from the payload digits
        expected: u8,
        /// Checksum digit present in the string
        actual: u8,
    },
}

/// A validated droplet identifier
///
/// Deserialization performs the structural [`Droplet::decode`] check.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Droplet(String);

impl Droplet {
    /// Assemble a droplet from its fields, appending the checksum
    ///
    /// Out-of-range fields are clamped to their maximum width.
    pub fn compose(offset_millis: u64, machine_tag: u16, counter: u16) -> Self {
        let mut s = format!(
            "{}{:0width$}{:04}{:04}",
            DROPLET_PREFIX as char,
            offset_millis.min(MAX_OFFSET_MILLIS),
            machine_tag.min(MAX_MACHINE_TAG),
            counter.min(MAX_COUNTER),
            width = TIMESTAMP_DIGITS,
        );
        let sum = checksum(s.as_bytes());
        s.push((b'0' + sum) as char);
        Droplet(s)
    }

    /// Structural decode: length, prefix, digits and checksum
    ///
    /// Does not look at the clock. Used when reading keys written by other
    /// machines whose clocks may run slightly ahead.
    pub fn decode(s: &str) -> Result<Self, DropletError> {
        let bytes = s.as_bytes();
        if bytes.len() != DROPLET_LEN {
            return Err(DropletError::Length(s.chars().count()));
        }
        if bytes[0] != DROPLET_PREFIX {
            return Err(DropletError::Prefix(s.chars().next().unwrap_or_default()));
        }
        if !bytes.iter().all(u8::is_ascii_digit) {
            return Err(DropletError::NonDigit);
        }
        let expected = checksum(&bytes[..DROPLET_LEN - 1]);
        let actual = bytes[DROPLET_LEN - 1] - b'0';
        if expected != actual {
            return Err(DropletError::Checksum { expected, actual });
        }
        Ok(Droplet(s.to_string()))
    }

    /// Full validation against the given time
    pub fn parse_at(s: &str, now: DateTime<Utc>) -> Result<Self, DropletError> {
        let droplet = Self::decode(s)?;
        let time = droplet.time();
        if time > now {
            return Err(DropletError::Future(time));
        }
        Ok(droplet)
    }

    /// Full validation against the current time
    pub fn parse(s: &str) -> Result<Self, DropletError> {
        Self::parse_at(s, Utc::now())
    }

    /// Whether `s` is a valid droplet right now
    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    /// Decode the creation time embedded in `s`
    pub fn get_time(s: &str) -> Result<DateTime<Utc>, DropletError> {
        Ok(Self::decode(s)?.time())
    }

    /// The droplet as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Milliseconds since the droplet epoch
    pub fn offset_millis(&self) -> u64 {
        digits(&self.0[TIMESTAMP_RANGE])
    }

    /// Creation time
    pub fn time(&self) -> DateTime<Utc> {
        let millis = DROPLET_EPOCH_MILLIS + self.offset_millis() as i64;
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Machine tag of the generator that produced this droplet
    pub fn machine_tag(&self) -> u16 {
        digits(&self.0[MACHINE_RANGE]) as u16
    }

    /// Counter value at generation time
    pub fn counter(&self) -> u16 {
        digits(&self.0[COUNTER_RANGE]) as u16
    }
}

impl fmt::Display for Droplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Droplet {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Droplet {
    type Error = DropletError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Droplet::decode(&s)
    }
}

impl From<Droplet> for String {
    fn from(d: Droplet) -> Self {
        d.0
    }
}

impl FromStr for Droplet {
    type Err = DropletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Droplet::parse(s)
    }
}

fn checksum(payload: &[u8]) -> u8 {
    let sum: u32 = payload.iter().map(|b| u32::from(b - b'0')).sum();
    (sum % 10) as u8
}

// Callers only pass slices already checked to be ASCII digits.
fn digits(s: &str) -> u64 {
    s.bytes()
        .fold(0u64, |acc, b| acc * 10 + u64::from(b - b'0'))
}

// ============================================================================
// Generator
// ============================================================================

#[derive(Debug, Default)]
struct GeneratorState {
    last_offset: u64,
    counter: u16,
}

/// Process-local droplet generator
///
/// Owns the rolling counter. Share one instance (behind an `Arc`) across all
/// tasks of a process; the counter is guarded by a mutex so multi-threaded
/// runtimes cannot race on it.
#[derive(Debug)]
pub struct DropletGenerator {
    machine_tag: u16,
    state: Mutex<GeneratorState>,
}

impl DropletGenerator {
    /// Create a generator with the given machine tag (clamped to 4 digits)
    pub fn new(machine_tag: u16) -> Self {
        Self {
            machine_tag: machine_tag.min(MAX_MACHINE_TAG),
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// Machine tag stamped into every droplet
    pub fn machine_tag(&self) -> u16 {
        self.machine_tag
    }

    /// Generate a droplet for the given time
    ///
    /// Times before the droplet epoch are clamped to the epoch.
    pub fn generate(&self, time: DateTime<Utc>) -> Droplet {
        let requested = (time.timestamp_millis() - DROPLET_EPOCH_MILLIS)
            .clamp(0, MAX_OFFSET_MILLIS as i64) as u64;

        let mut state = self.state.lock();
        let next = if state.counter >= MAX_COUNTER {
            1
        } else {
            state.counter + 1
        };

        if requested > state.last_offset {
            state.last_offset = requested;
        } else if next <= state.counter {
            // Counter wrapped without the clock moving forward.
            state.last_offset += 1;
        }
        state.counter = next;

        Droplet::compose(state.last_offset, self.machine_tag, state.counter)
    }

    /// Generate a droplet for the current time
    pub fn generate_now(&self) -> Droplet {
        self.generate(Utc::now())
    }

    /// Forget the last timestamp and counter
    pub fn reset(&self) {
        *self.state.lock() = GeneratorState::default();
    }
}
