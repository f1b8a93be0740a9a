//! Time-ordered 64-bit identifiers.
//!
//! A snowflake packs a millisecond timestamp, a server id, and a per-server
//! sequence number into a single `u64`. Its canonical wire form is a
//! zero-padded 13-character base-36 string. Snowflakes are monotonic within
//! a server and collision-free across servers as long as server ids are
//! unique and clocks only move forward.

use std::num::ParseIntError;
use std::str::FromStr;
use std::{error, fmt};

use jiff::Timestamp;
use parking_lot::Mutex;
use serde::{de, ser, Deserialize, Serialize};

/// Custom epoch: 2015-01-01T00:00:00Z, in milliseconds since the Unix epoch.
const EPOCH_MS: i64 = 1_420_070_400_000;

const SERVER_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;

/// A 64-bit time-ordered identifier.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// The zero snowflake, used on the wire where "no id" is meaningful
    /// (e.g. the previous edit id of a never-edited message).
    pub const ZERO: Self = Snowflake(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// The millisecond timestamp encoded in this snowflake.
    pub fn timestamp_ms(&self) -> i64 {
        (self.0 >> (SERVER_BITS + SEQ_BITS)) as i64 + EPOCH_MS
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut n = self.0;
        let mut result = String::with_capacity(13);
        for _ in 0..13 {
            let c = char::from_digit((n % 36) as u32, 36).unwrap();
            result.insert(0, c);
            n /= 36;
        }
        f.write_str(&result)
    }
}

#[derive(Debug)]
pub enum ParseSnowflakeError {
    InvalidLength(usize),
    ParseIntError(ParseIntError),
}

impl fmt::Display for ParseSnowflakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength(l) => {
                write!(f, "invalid length: expected 1 to 13 bytes, got {l}")
            }
            Self::ParseIntError(from) => write!(f, "{from}"),
        }
    }
}

impl error::Error for ParseSnowflakeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::InvalidLength(_) => None,
            Self::ParseIntError(from) => Some(from),
        }
    }
}

impl From<ParseIntError> for ParseSnowflakeError {
    fn from(err: ParseIntError) -> Self {
        Self::ParseIntError(err)
    }
}

impl FromStr for Snowflake {
    type Err = ParseSnowflakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 13 {
            return Err(ParseSnowflakeError::InvalidLength(s.len()));
        }
        let n = u64::from_str_radix(s, 36)?;
        Ok(Snowflake(n))
    }
}

impl Serialize for Snowflake {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        format!("{self}").serialize(serializer)
    }
}

struct SnowflakeVisitor;

impl de::Visitor<'_> for SnowflakeVisitor {
    type Value = Snowflake;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "a base36 string of up to 13 characters")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(|e| match e {
            ParseSnowflakeError::InvalidLength(len) => E::invalid_length(len, &self),
            ParseSnowflakeError::ParseIntError(_) => {
                E::invalid_value(de::Unexpected::Str(v), &self)
            }
        })
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Snowflake(v))
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

/// Allocates snowflakes for a single server.
///
/// The sequence counter rolls the timestamp forward when more than 2^12 ids
/// are requested within one millisecond, preserving monotonicity.
#[derive(Debug)]
pub struct IdGenerator {
    server_id: u64,
    state: Mutex<GenState>,
}

#[derive(Debug)]
struct GenState {
    last_ms: i64,
    seq: u64,
}

impl IdGenerator {
    pub fn new(server_id: u16) -> Self {
        Self {
            server_id: u64::from(server_id) & ((1 << SERVER_BITS) - 1),
            state: Mutex::new(GenState { last_ms: 0, seq: 0 }),
        }
    }

    pub fn next(&self) -> Snowflake {
        let now_ms = Timestamp::now().as_millisecond();
        let mut state = self.state.lock();

        let mut ms = now_ms.max(state.last_ms);
        if ms == state.last_ms {
            state.seq += 1;
            if state.seq >= (1 << SEQ_BITS) {
                ms += 1;
                state.seq = 0;
            }
        } else {
            state.seq = 0;
        }
        state.last_ms = ms;

        let elapsed = (ms - EPOCH_MS).max(0) as u64;
        Snowflake((elapsed << (SERVER_BITS + SEQ_BITS)) | (self.server_id << SEQ_BITS) | state.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_13_characters() {
        let id = Snowflake(12345);
        let s = id.to_string();
        assert_eq!(s.len(), 13);
        assert_eq!(s.parse::<Snowflake>().unwrap(), id);
    }

    #[test]
    fn accepts_short_and_rejects_long_strings() {
        assert_eq!("0".parse::<Snowflake>().unwrap(), Snowflake::ZERO);
        assert!("".parse::<Snowflake>().is_err());
        assert!("00000000000000".parse::<Snowflake>().is_err());
    }

    #[test]
    fn generator_is_strictly_monotonic() {
        let ids = IdGenerator::new(3);
        let mut prev = ids.next();
        for _ in 0..10_000 {
            let next = ids.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn generator_embeds_server_id() {
        let ids = IdGenerator::new(7);
        let id = ids.next();
        assert_eq!((id.0 >> SEQ_BITS) & ((1 << SERVER_BITS) - 1), 7);
    }

    #[test]
    fn serde_round_trip() {
        let id = Snowflake(987654321);
        let json = serde_json::to_string(&id).unwrap();
        let back: Snowflake = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        // Integer zero is tolerated for "no id" fields.
        let zero: Snowflake = serde_json::from_str("0").unwrap();
        assert!(zero.is_zero());
    }
}
