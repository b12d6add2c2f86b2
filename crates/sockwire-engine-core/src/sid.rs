use std::{fmt, str::FromStr};

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use rand::Rng;

/// Engine.IO session id.
///
/// It is made of 12 random bytes encoded as 16 chars of url safe base64 without padding,
/// so it can be placed as is in a query string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid([u8; 16]);

impl Sid {
    /// A session id made only of `A` chars. Mostly useful in tests.
    pub const ZERO: Self = Self([b'A'; 16]);

    /// Generate a new random session id.
    pub fn new() -> Self {
        let mut random = [0u8; 12];
        rand::rng().fill(&mut random);

        let mut id = [0u8; 16];
        let _written = BASE64_URL_SAFE_NO_PAD
            .encode_slice(random, &mut id)
            .unwrap_or_default();
        debug_assert_eq!(_written, 16);
        Sid(id)
    }

    /// The session id as a 16 chars string.
    pub const fn as_str(&self) -> &str {
        // SAFETY: the inner buffer only ever holds url safe base64 chars, see `new` and `from_str`.
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when a string cannot be read as a [`Sid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidDecodeError {
    /// The string is not 16 chars long.
    InvalidLength,
    /// The string contains chars outside of the url safe base64 alphabet.
    InvalidBase64String,
}

impl fmt::Display for SidDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SidDecodeError::InvalidLength => f.write_str("Invalid sid length"),
            SidDecodeError::InvalidBase64String => f.write_str("Invalid url base64 string"),
        }
    }
}
impl std::error::Error for SidDecodeError {}

impl FromStr for Sid {
    type Err = SidDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 16] = s
            .as_bytes()
            .try_into()
            .map_err(|_| SidDecodeError::InvalidLength)?;

        let valid = bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_');
        if valid {
            Ok(Sid(bytes))
        } else {
            Err(SidDecodeError::InvalidBase64String)
        }
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Sid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Sid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SidVisitor;
        impl serde::de::Visitor<'_> for SidVisitor {
            type Value = Sid;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 16 chars url safe base64 session id")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Sid, E> {
                v.parse().map_err(E::custom)
            }
        }
        deserializer.deserialize_str(SidVisitor)
    }
}
