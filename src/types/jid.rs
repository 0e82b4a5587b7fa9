use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JidParseError {
    #[error("empty JID")]
    Empty,
    #[error("missing domain part in JID: {0}")]
    MissingDomain(String),
}

/// An XMPP address. OMEMO state is always keyed by the *bare* JID
/// (`local@domain`); the resource only matters for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Jid {
    pub local: String,
    pub domain: String,
    pub resource: Option<String>,
}

impl Jid {
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Bare-string form, used as the database key for per-peer state.
    pub fn bare_string(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(r) => write!(f, "{}@{}/{}", self.local, self.domain, r),
            None => write!(f, "{}@{}", self.local, self.domain),
        }
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(JidParseError::Empty);
        }
        let (address, resource) = match s.split_once('/') {
            Some((a, r)) => (a, Some(r.to_string())),
            None => (s, None),
        };
        let (local, domain) = address
            .split_once('@')
            .ok_or_else(|| JidParseError::MissingDomain(s.to_string()))?;
        if domain.is_empty() {
            return Err(JidParseError::MissingDomain(s.to_string()));
        }
        Ok(Jid {
            local: local.to_string(),
            domain: domain.to_string(),
            resource,
        })
    }
}
