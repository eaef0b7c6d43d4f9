//! Gateway authentication collaborator.
//!
//! The relay never issues credentials; it hands the bearer token presented in
//! the Identify frame to an [`Authenticator`] and trusts the resolved
//! identity for the life of the connection. The trait keeps the account
//! service swappable (and lets tests resolve identities statically).

use async_trait::async_trait;
use huddle_common::{HuddleError, HuddleResult};

/// The identity an authenticator resolves a credential to.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Resolve a bearer credential, or fail with
    /// [`HuddleError::AuthenticationFailure`].
    async fn authenticate(&self, token: &str) -> HuddleResult<Identity>;
}

/// Validates locally-issued HS256 access tokens.
pub struct TokenAuthenticator {
    secret: String,
}

impl TokenAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, token: &str) -> HuddleResult<Identity> {
        let claims = huddle_common::auth::validate_token(token, &self.secret).map_err(|e| {
            HuddleError::AuthenticationFailure {
                reason: e.to_string(),
            }
        })?;
        Ok(Identity {
            user_id: claims.sub,
            display_name: claims.display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::auth::Claims;
    use jsonwebtoken::{EncodingKey, Header, encode};

    #[tokio::test]
    async fn resolves_identity_from_valid_token() {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "user-7".into(),
            display_name: "bob".into(),
            iat: now,
            exp: now + 600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .expect("encode");

        let auth = TokenAuthenticator::new("secret");
        let identity = auth.authenticate(&token).await.expect("valid");
        assert_eq!(identity.user_id, "user-7");
        assert_eq!(identity.display_name, "bob");
    }

    #[tokio::test]
    async fn garbage_token_is_an_authentication_failure() {
        let auth = TokenAuthenticator::new("secret");
        let err = auth.authenticate("not-a-jwt").await.expect_err("invalid");
        assert_eq!(err.error_code(), "AUTHENTICATION_FAILURE");
    }
}
