use jsonwebtoken::{DecodingKey, Validation, decode};

use atrium_types::api::Claims;
use atrium_types::identity::Identity;

/// The identity a token resolved to. Display names travel with tokens so
/// the gateway never has to ask the roster application for them.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub identity: Identity,
    pub display_name: String,
}

/// Verifies bearer tokens minted by the external roster application.
/// The gateway never issues credentials; a shared HS256 secret is the whole
/// trust relationship.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: String,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Any invalid result (bad signature, expired, malformed) is a hard
    /// authentication failure: `None`, no detail.
    pub fn verify(&self, token: &str) -> Option<VerifiedIdentity> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .ok()?;

        Some(VerifiedIdentity {
            identity: Identity::new(data.claims.sub),
            display_name: data.claims.username,
        })
    }
}
