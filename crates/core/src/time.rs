//! Timestamp serialization helpers.
//!
//! All wire and snapshot timestamps are RFC3339 UTC with exactly nine
//! fractional digits, so canonical encodings agree byte-for-byte on every
//! replica regardless of the sub-second precision of the source clock.

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp the way the wire expects it.
pub fn format_rfc3339_nanos(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parses an RFC3339 timestamp into UTC.
pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

/// `#[serde(with = "rfc3339_nanos")]` for `DateTime<Utc>` fields.
pub mod rfc3339_nanos {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_rfc3339_nanos(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        parse_rfc3339(&raw).map_err(serde::de::Error::custom)
    }
}

/// `#[serde(with = "rfc3339_nanos_opt")]` for `Option<DateTime<Utc>>` fields.
pub mod rfc3339_nanos_opt {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        at: &Option<DateTime<Utc>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match at {
            Some(at) => ser.serialize_some(&format_rfc3339_nanos(at)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(de)?;
        raw.map(|s| parse_rfc3339(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
