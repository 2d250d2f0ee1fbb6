use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// A normalized identifier. External inputs may arrive as 24-hex strings,
/// bare UUIDs, or UUIDs wrapped in `ObjectId("...")`-style decoration; all of
/// that tolerance lives at the boundary (`parse_id`) so that everywhere else
/// in the engine only a plain `Uuid` is ever passed around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Id(pub Uuid);

impl Id {
    pub fn new() -> Self {
        Id(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for Id {
    fn from(u: Uuid) -> Self {
        Id(u)
    }
}

impl From<Id> for Uuid {
    fn from(id: Id) -> Self {
        id.0
    }
}

/// Accepts a bare UUID string or a 24-hex legacy id (zero-padded into a
/// UUID's last 12 bytes) from external inputs. Internal code should never
/// need this — only HTTP/webhook boundaries do.
pub fn parse_id(raw: &str) -> Result<Id, String> {
    let trimmed = raw.trim().trim_matches('"');
    if let Ok(u) = Uuid::parse_str(trimmed) {
        return Ok(Id(u));
    }
    if trimmed.len() == 24 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut bytes = [0u8; 16];
        for (i, chunk) in trimmed.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| "invalid hex id")?;
            bytes[4 + i] = u8::from_str_radix(hex, 16).map_err(|_| "invalid hex id")?;
        }
        return Ok(Id(Uuid::from_bytes(bytes)));
    }
    Err(format!("not a recognizable id: {raw}"))
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Uuid(Uuid),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Uuid(u) => Ok(Id(u)),
            Repr::Text(s) => parse_id(&s).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_uuid() {
        let u = Uuid::new_v4();
        assert_eq!(parse_id(&u.to_string()).unwrap().as_uuid(), u);
    }

    #[test]
    fn parses_legacy_24_hex() {
        let id = parse_id("507f1f77bcf86cd799439011").unwrap();
        assert_eq!(id.to_string().len(), 36);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_id("not-an-id").is_err());
    }
}
