//! Handshake authentication
//!
//! Verifies the bearer JWT carried in the `token` query parameter of the
//! upgrade request. Runs before any connection state exists: a rejected
//! request never reaches the session registry.

use std::fmt;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::http::Uri;
use tracing::debug;

use crate::error::AuthError;
use crate::types::UserId;

/// Query parameter holding the token
pub const TOKEN_PARAM: &str = "token";

/// Query parameter naming the user in unauthenticated mode
pub const ID_PARAM: &str = "id";

/// Identity attached to a verified handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: UserId,
}

#[derive(Debug, Deserialize)]
struct Claims {
    id: UserId,
}

enum Mode {
    Verified {
        key: DecodingKey,
        validation: Validation,
    },
    Unauthenticated,
}

/// Bearer-token verifier bound to the process-wide secret
pub struct Authenticator {
    mode: Mode,
}

impl Authenticator {
    /// Without a secret the authenticator accepts every handshake
    pub fn new(secret: Option<&str>) -> Self {
        let mode = match secret {
            Some(secret) => {
                let mut validation = Validation::new(Algorithm::HS256);
                // `exp` is checked when present but not required
                validation.required_spec_claims.clear();
                validation.validate_exp = true;
                Mode::Verified {
                    key: DecodingKey::from_secret(secret.as_bytes()),
                    validation,
                }
            }
            None => Mode::Unauthenticated,
        };
        Self { mode }
    }

    pub fn is_enforcing(&self) -> bool {
        matches!(self.mode, Mode::Verified { .. })
    }

    /// Resolve the identity of an upgrade request
    pub fn verify(&self, uri: &Uri) -> Result<Identity, AuthError> {
        let query = uri.query().unwrap_or("");
        match &self.mode {
            Mode::Verified { .. } => {
                let token = query_param(query, TOKEN_PARAM).ok_or(AuthError::MissingToken)?;
                self.verify_token(token)
            }
            Mode::Unauthenticated => {
                let user = query_param(query, ID_PARAM)
                    .map(UserId::new)
                    .unwrap_or_else(UserId::random);
                Ok(Identity { user })
            }
        }
    }

    /// Check signature and expiry of a raw token
    pub fn verify_token(&self, token: &str) -> Result<Identity, AuthError> {
        let Mode::Verified { key, validation } = &self.mode else {
            return Err(AuthError::InvalidToken("no secret configured".to_string()));
        };

        let data = decode::<Claims>(token, key, validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        debug!(user = %data.claims.id, "Token verified");
        Ok(Identity {
            user: data.claims.id,
        })
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("enforcing", &self.is_enforcing())
            .finish()
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}
