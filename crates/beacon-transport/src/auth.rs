//! Authentication contract, consumed once per inbound connection attempt.

/// Grant returned by a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    /// The application the connection belongs to.
    pub app_id: String,
    /// Credential forwarded to the realm's mesh connection.
    pub credential: String,
}

/// Authenticates an inbound connection attempt by the client's public key.
///
/// A constructor-time dependency of every listener. Returning `None` rejects
/// the connection before any peer or realm state is touched.
pub trait Authenticator: Send + Sync {
    /// Authenticate `public_key` and resolve its application grant.
    fn authenticate(&self, public_key: &str) -> Option<AuthGrant>;
}

/// Grants one fixed application/credential pair to any non-empty public key.
///
/// Development and single-tenant deployments; production wires an
/// implementation backed by a real identity system.
#[derive(Debug, Clone)]
pub struct StaticAuthenticator {
    app_id: String,
    credential: String,
}

impl StaticAuthenticator {
    /// Create an authenticator granting `app_id`/`credential` to everyone.
    #[must_use]
    pub fn new(app_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            credential: credential.into(),
        }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, public_key: &str) -> Option<AuthGrant> {
        if public_key.is_empty() {
            return None;
        }
        Some(AuthGrant {
            app_id: self.app_id.clone(),
            credential: self.credential.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_authenticator() {
        let auth = StaticAuthenticator::new("demo", "secret");

        let grant = auth.authenticate("any-key").unwrap();
        assert_eq!(grant.app_id, "demo");
        assert_eq!(grant.credential, "secret");

        assert!(auth.authenticate("").is_none());
    }
}
