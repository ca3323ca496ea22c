//! Authentication capabilities advertised by connectors.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

/// A supported way of authenticating against a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Pat,
    OAuth,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Pat => f.write_str("pat"),
            AuthMethod::OAuth => f.write_str("oauth"),
        }
    }
}

/// Set of [`AuthMethod`]s a connector accepts.
///
/// ```
/// use sercha_core::auth::AuthCapability;
///
/// let both = AuthCapability::PAT | AuthCapability::OAUTH;
/// assert!(both.supports_multiple_methods());
/// assert_eq!(both.to_string(), "pat,oauth");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AuthCapability(u8);

impl AuthCapability {
    pub const NONE: Self = Self(0);
    pub const PAT: Self = Self(1);
    pub const OAUTH: Self = Self(1 << 1);

    pub fn supports_pat(self) -> bool {
        self.0 & Self::PAT.0 != 0
    }

    pub fn supports_oauth(self) -> bool {
        self.0 & Self::OAUTH.0 != 0
    }

    pub fn supports_multiple_methods(self) -> bool {
        self.supports_pat() && self.supports_oauth()
    }

    pub fn requires_auth(self) -> bool {
        self != Self::NONE
    }

    pub fn supports(self, method: AuthMethod) -> bool {
        match method {
            AuthMethod::Pat => self.supports_pat(),
            AuthMethod::OAuth => self.supports_oauth(),
        }
    }

    pub fn supported_methods(self) -> Vec<AuthMethod> {
        let mut methods = Vec::new();
        if self.supports_pat() {
            methods.push(AuthMethod::Pat);
        }
        if self.supports_oauth() {
            methods.push(AuthMethod::OAuth);
        }
        methods
    }
}

impl BitOr for AuthCapability {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<AuthMethod> for AuthCapability {
    fn from(method: AuthMethod) -> Self {
        match method {
            AuthMethod::Pat => Self::PAT,
            AuthMethod::OAuth => Self::OAUTH,
        }
    }
}

impl fmt::Display for AuthCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods = self.supported_methods();
        if methods.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<String> = methods.iter().map(ToString::to_string).collect();
        f.write_str(&names.join(","))
    }
}
