use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

/// Unix-seconds timestamp with a strict wire format: serializes to an
/// integer (`0` for the zero time), and deserialization accepts only
/// integers and `null`. String forms are rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JsonTime(pub i64);

impl JsonTime {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn from_unix(seconds: i64) -> Self {
        Self(seconds)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn unix(self) -> i64 {
        self.0
    }
}

impl From<OffsetDateTime> for JsonTime {
    fn from(value: OffsetDateTime) -> Self {
        Self(value.unix_timestamp())
    }
}

impl Serialize for JsonTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

struct JsonTimeVisitor;

impl<'de> Visitor<'de> for JsonTimeVisitor {
    type Value = JsonTime;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a unix-seconds integer or null")
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<JsonTime, E> {
        Ok(JsonTime(value))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<JsonTime, E> {
        i64::try_from(value)
            .map(JsonTime)
            .map_err(|_| E::custom("timestamp out of range"))
    }

    fn visit_unit<E: de::Error>(self) -> Result<JsonTime, E> {
        Ok(JsonTime(0))
    }

    fn visit_none<E: de::Error>(self) -> Result<JsonTime, E> {
        Ok(JsonTime(0))
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<JsonTime, D::Error> {
        deserializer.deserialize_any(JsonTimeVisitor)
    }
}

impl<'de> Deserialize<'de> for JsonTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_option(JsonTimeVisitor)
    }
}
