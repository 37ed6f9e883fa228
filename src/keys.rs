//! Validated identifiers handed to the limiters and the quota engine.
//!
//! Both the request limiter and the account-scoped components key their state
//! by string. Parsing happens once at the edge so that an empty or garbled
//! identifier never reaches shared state.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::GuardError;

const MAX_ACCOUNT_KEY_LEN: usize = 320;

/// Client network address used by the request limiter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn parse(raw: &str) -> Result<Self, GuardError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(GuardError::InvalidKey {
                kind: "client",
                reason: "empty address".to_string(),
            });
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Self::from(ip));
        }
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Ok(Self::from(addr.ip()));
        }
        Err(GuardError::InvalidKey {
            kind: "client",
            reason: format!("not an ip address: {raw}"),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        let ip = match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        Self(ip.to_string())
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Account identifier (typically the login email). Normalised to lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountKey(String);

impl AccountKey {
    pub fn parse(raw: &str) -> Result<Self, GuardError> {
        let raw = raw.trim();
        let reject = |reason: &str| GuardError::InvalidKey {
            kind: "account",
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(reject("empty account identifier"));
        }
        if raw.len() > MAX_ACCOUNT_KEY_LEN {
            return Err(reject("account identifier too long"));
        }
        if raw.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
            return Err(reject("account identifier contains whitespace"));
        }
        Ok(Self(raw.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AccountKey {
    type Error = GuardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AccountKey> for String {
    fn from(key: AccountKey) -> Self {
        key.0
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
