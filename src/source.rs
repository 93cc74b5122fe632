use serde::Serialize;
use std::fmt;

/// Registry key; also why `endpoints` cannot be used as a source id.
pub const REGISTRY_KEY: &str = "webhook:endpoints";
const LOG_KEY_PREFIX: &str = "webhook:";
const RESERVED: &str = "endpoints";
const MAX_LEN: usize = 128;

/// Canonical webhook source identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SourceId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceIdError {
    #[error("source id is empty")]
    Empty,
    #[error("source id is longer than 128 bytes")]
    TooLong,
    #[error("source id contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("source id `endpoints` is reserved")]
    Reserved,
}

impl SourceId {
    /// Canonicalize a raw route segment: drop any query string, strip
    /// leading and trailing slashes, then validate what is left.
    pub fn parse(raw: &str) -> Result<Self, SourceIdError> {
        let path = raw.split('?').next().unwrap_or_default();
        let id = path.trim_matches('/');
        if id.is_empty() {
            return Err(SourceIdError::Empty);
        }
        if id.len() > MAX_LEN {
            return Err(SourceIdError::TooLong);
        }
        if let Some(c) = id
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || *c == '/')
        {
            return Err(SourceIdError::InvalidChar(c));
        }
        if id == RESERVED {
            return Err(SourceIdError::Reserved);
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn log_key(&self) -> String {
        format!("{LOG_KEY_PREFIX}{}", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_query_and_slashes() {
        assert_eq!(SourceId::parse("orders").unwrap().as_str(), "orders");
        assert_eq!(SourceId::parse("/orders/").unwrap().as_str(), "orders");
        assert_eq!(SourceId::parse("orders?x=1&y=2").unwrap().as_str(), "orders");
        assert_eq!(SourceId::parse("//orders?x=/").unwrap().as_str(), "orders");
    }

    #[test]
    fn rejects_invalid_ids() {
        assert_eq!(SourceId::parse(""), Err(SourceIdError::Empty));
        assert_eq!(SourceId::parse("/?q"), Err(SourceIdError::Empty));
        assert_eq!(SourceId::parse("a b"), Err(SourceIdError::InvalidChar(' ')));
        assert_eq!(SourceId::parse("a/b"), Err(SourceIdError::InvalidChar('/')));
        assert_eq!(SourceId::parse("endpoints"), Err(SourceIdError::Reserved));
        assert_eq!(SourceId::parse(&"x".repeat(129)), Err(SourceIdError::TooLong));
    }

    #[test]
    fn log_key_never_collides_with_registry() {
        let id = SourceId::parse("orders").unwrap();
        assert_eq!(id.log_key(), "webhook:orders");
        assert_ne!(id.log_key(), REGISTRY_KEY);
    }
}
