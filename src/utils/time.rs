//! Serde helpers that store timestamps as RFC 3339 strings.

use serde::{Deserialize, Deserializer, Serializer};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Deserialize an RFC 3339 string, or a bare unix timestamp in seconds, into an OffsetDateTime.
pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Stamp {
        Text(String),
        Unix(i64),
    }

    match Stamp::deserialize(deserializer)? {
        Stamp::Text(s) => OffsetDateTime::parse(&s, &Rfc3339).map_err(serde::de::Error::custom),
        Stamp::Unix(secs) => {
            OffsetDateTime::from_unix_timestamp(secs).map_err(serde::de::Error::custom)
        }
    }
}

/// Serialize an OffsetDateTime into an RFC 3339 string.
pub fn serialize<S>(datetime: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let s = datetime
        .format(&Rfc3339)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&s)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use time::OffsetDateTime;
    use time::macros::datetime;

    #[derive(Serialize, Deserialize)]
    struct Stamped {
        #[serde(with = "crate::utils::time")]
        at: OffsetDateTime,
    }

    #[test]
    fn writes_rfc3339() {
        let stamped = Stamped {
            at: datetime!(2024-03-01 12:30:00 UTC),
        };
        let json = serde_json::to_string(&stamped).unwrap();
        assert_eq!(json, r#"{"at":"2024-03-01T12:30:00Z"}"#);
    }

    #[test]
    fn reads_unix_seconds() {
        let stamped: Stamped = serde_json::from_str(r#"{"at":0}"#).unwrap();
        assert_eq!(stamped.at, OffsetDateTime::UNIX_EPOCH);
    }
}
