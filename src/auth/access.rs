//! Bearer token authorization.
//!
//! Maps an opaque token carried in a query request to the permission set
//! configured for it. Endpoints open to the public never look at the token.

use crate::config::{AuthConfig, Endpoint, Permissions};
use crate::core::constant_time_eq;

/// Decides whether a request may read an endpoint.
#[derive(Debug, Clone, Default)]
pub struct AccessValidator {
    config: AuthConfig,
}

impl AccessValidator {
    /// Validator over the configured public permissions and tokens.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// True when `endpoint` requires a token.
    pub fn is_auth_required(&self, endpoint: Endpoint) -> bool {
        !self.config.is_publicly_accessible(endpoint)
    }

    /// Whether a request carrying `token` may read `endpoint`.
    pub fn is_access_allowed(&self, endpoint: Endpoint, token: Option<&[u8]>) -> bool {
        if self.config.is_publicly_accessible(endpoint) {
            return true;
        }
        match token {
            Some(token) if !token.is_empty() => self
                .permissions_for(token)
                .map(|permissions| permissions.allows(endpoint))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Permissions for a raw token.
    ///
    /// Every configured token is compared so lookup time does not depend on
    /// which entry matched.
    pub fn permissions_for(&self, token: &[u8]) -> Option<Permissions> {
        let mut found = None;
        for (secret, permissions) in &self.config.tokens {
            if constant_time_eq(secret.as_bytes(), token) && found.is_none() {
                found = Some(*permissions);
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> AccessValidator {
        let mut config = AuthConfig {
            public: Permissions {
                basic: true,
                players: false,
            },
            ..Default::default()
        };
        config.tokens.insert("admin".to_string(), Permissions::all());
        config.tokens.insert(
            "basic-only".to_string(),
            Permissions {
                basic: true,
                players: false,
            },
        );
        AccessValidator::new(config)
    }

    #[test]
    fn test_public_endpoint_ignores_token() {
        let v = validator();
        assert!(!v.is_auth_required(Endpoint::Basic));
        assert!(v.is_access_allowed(Endpoint::Basic, None));
        assert!(v.is_access_allowed(Endpoint::Basic, Some(b"garbage")));
    }

    #[test]
    fn test_protected_endpoint_needs_token() {
        let v = validator();
        assert!(v.is_auth_required(Endpoint::Players));
        assert!(!v.is_access_allowed(Endpoint::Players, None));
        assert!(!v.is_access_allowed(Endpoint::Players, Some(b"")));
        assert!(!v.is_access_allowed(Endpoint::Players, Some(b"wrong")));
        assert!(!v.is_access_allowed(Endpoint::Players, Some(b"basic-only")));
        assert!(v.is_access_allowed(Endpoint::Players, Some(b"admin")));
    }

    #[test]
    fn test_non_utf8_token() {
        let v = validator();
        assert!(v.permissions_for(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn test_default_is_fully_public() {
        let v = AccessValidator::default();
        assert!(v.is_access_allowed(Endpoint::Players, None));
    }
}
