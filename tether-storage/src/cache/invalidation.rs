//! Auth-driven invalidation taxonomy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Events that invalidate a fixed slice of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationEvent {
    Login,
    Logout,
    TokenRefresh,
    ProfileUpdate,
    SessionChange,
    ProviderLink,
    ProviderUnlink,
}

/// Which keys an [`InvalidationEvent`] purges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    Everything,
    Nothing,
    Prefixes(&'static [&'static str]),
}

impl InvalidationScope {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Everything => true,
            Self::Nothing => false,
            Self::Prefixes(prefixes) => prefixes.iter().any(|prefix| key.starts_with(prefix)),
        }
    }
}

impl InvalidationEvent {
    pub const ALL: [InvalidationEvent; 7] = [
        Self::Login,
        Self::Logout,
        Self::TokenRefresh,
        Self::ProfileUpdate,
        Self::SessionChange,
        Self::ProviderLink,
        Self::ProviderUnlink,
    ];

    pub fn scope(&self) -> InvalidationScope {
        match self {
            Self::Login | Self::Logout => InvalidationScope::Everything,
            Self::TokenRefresh => InvalidationScope::Nothing,
            Self::ProfileUpdate => InvalidationScope::Prefixes(&["profile:", "user:"]),
            Self::SessionChange => InvalidationScope::Prefixes(&["sessions:"]),
            Self::ProviderLink | Self::ProviderUnlink => {
                InvalidationScope::Prefixes(&["providers:", "linked-providers:"])
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::TokenRefresh => "token_refresh",
            Self::ProfileUpdate => "profile_update",
            Self::SessionChange => "session_change",
            Self::ProviderLink => "provider_link",
            Self::ProviderUnlink => "provider_unlink",
        }
    }
}

impl fmt::Display for InvalidationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvalidationEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("unknown invalidation event: {}", s))
    }
}
