#![forbid(unsafe_code)]

//! **aegis-capability** – Capability-based security primitives for Aegis.
//!
//! This crate defines the canonical [`Claims`] structure, the
//! [`CapabilityToken`] / [`TokenValidator`] traits, a bundled HS256 JWT
//! implementation, and the DB-backed token registry the policy gate decides
//! from. Every minted token's `jti` is registered with its scopes; the gate
//! consults the registry row (existence, revocation, expiry, principal
//! binding, scope coverage), so revocation takes effect immediately
//! regardless of the signed wire token still circulating.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod registry;

pub use registry::{CapabilityRecord, SqliteTokenRegistry, TokenRegistry};

/// Canonical claim set embedded in every capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject – the principal the token is bound to.
    pub sub: String,
    /// Workspace the subject wishes to act in.
    pub workspace: String,
    /// Scopes the token grants.
    pub scopes: TokenScopes,
    /// Issued-at timestamp (seconds since Unix epoch).
    pub iat: u64,
    /// Absolute expiry timestamp (seconds since Unix epoch).
    pub exp: u64,
    /// Unique token identifier; the registry key and revocation handle.
    pub jti: String,
}

/// The coverage a capability token grants.
///
/// Each list is an allow-list; the literal `"*"` covers everything in that
/// dimension. Empty lists cover nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenScopes {
    /// Rooms the holder may act in.
    pub rooms: Vec<String>,
    /// Action types the holder may request.
    pub actions: Vec<String>,
    /// Tools the holder may invoke.
    pub tools: Vec<String>,
    /// Data-access targets the holder may touch.
    pub data_targets: Vec<String>,
    /// Egress domains the holder may reach.
    pub egress_domains: Vec<String>,
}

fn covers(list: &[String], value: &str) -> bool {
    list.iter().any(|entry| entry == "*" || entry == value)
}

impl TokenScopes {
    /// Grant everything; for trusted service principals.
    pub fn all() -> Self {
        let star = vec!["*".to_string()];
        Self {
            rooms: star.clone(),
            actions: star.clone(),
            tools: star.clone(),
            data_targets: star.clone(),
            egress_domains: star,
        }
    }

    /// Whether the scopes cover acting in `room_id`.
    pub fn covers_room(&self, room_id: &str) -> bool {
        covers(&self.rooms, room_id)
    }

    /// Whether the scopes cover requesting `action`.
    pub fn covers_action(&self, action: &str) -> bool {
        covers(&self.actions, action)
    }

    /// Whether the scopes cover invoking `tool`.
    pub fn covers_tool(&self, tool: &str) -> bool {
        covers(&self.tools, tool)
    }

    /// Whether the scopes cover touching `target`.
    pub fn covers_data_target(&self, target: &str) -> bool {
        covers(&self.data_targets, target)
    }

    /// Whether the scopes cover egress to `domain`.
    pub fn covers_egress(&self, domain: &str) -> bool {
        covers(&self.egress_domains, domain)
    }
}

/// Minimal in-crate error type.
#[derive(Debug, thiserror::Error)]
#[error("{msg}")]
pub struct Error {
    msg: String,
}

impl Error {
    /// Wrap a message.
    pub fn new(msg: &str) -> Self {
        Self { msg: msg.into() }
    }
}

/// Crate result helper.
pub type Result<T> = std::result::Result<T, Error>;

//─────────────────────────────
//  Trait definitions
//─────────────────────────────

/// Abstract behaviour common to *all* capability token formats.
#[async_trait]
pub trait CapabilityToken: Sized + Send + Sync {
    /// Mint a new token from raw `claims` using the provided secret / key.
    async fn mint(claims: &Claims, key: &[u8]) -> Result<Self>;

    /// Return the serialized wire representation (e.g. JWT string).
    fn as_str(&self) -> &str;
}

/// Verifier trait used at the service boundary before a request reaches the
/// gate.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Verify authenticity + expiry, returning the embedded [`Claims`].
    async fn validate(&self, raw: &str) -> Result<Claims>;
}

//─────────────────────────────
//  HS256 JWT implementation
//─────────────────────────────

/// HS256 JWT wire format for capability tokens.
pub mod hs256 {
    use super::{CapabilityToken, Claims, Error, Result, TokenScopes, TokenValidator};
    use async_trait::async_trait;
    use jsonwebtoken::{
        decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
    };
    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    /// Concrete JWT (HS256) capability token implementation.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct JwtHs256Token {
        token: String,
    }

    #[async_trait]
    impl CapabilityToken for JwtHs256Token {
        async fn mint(claims: &Claims, key: &[u8]) -> Result<Self> {
            let mut header = Header::new(Algorithm::HS256);
            header.typ = Some("aegis.cap+jwt".into());
            let jwt = encode(&header, claims, &EncodingKey::from_secret(key))
                .map_err(|e| Error::new(&e.to_string()))?;
            Ok(Self { token: jwt })
        }

        fn as_str(&self) -> &str {
            &self.token
        }
    }

    /// Helper to construct standard claims with proper timestamps.
    pub fn build_claims(
        principal_id: Uuid,
        workspace: &str,
        scopes: TokenScopes,
        ttl_secs: u64,
    ) -> Result<Claims> {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::new(&e.to_string()))?
            .as_secs();
        Ok(Claims {
            sub: principal_id.to_string(),
            workspace: workspace.to_owned(),
            scopes,
            iat: issued_at,
            exp: issued_at + ttl_secs,
            jti: Uuid::new_v4().to_string(),
        })
    }

    /// HS256 JWT validator.
    #[derive(Clone)]
    pub struct JwtHs256Validator {
        secret: String,
        validation: Validation,
    }

    impl JwtHs256Validator {
        /// Build a validator over a shared secret.
        pub fn new(secret: impl Into<String>) -> Self {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_exp = true;
            Self { secret: secret.into(), validation }
        }
    }

    #[async_trait]
    impl TokenValidator for JwtHs256Validator {
        async fn validate(&self, raw: &str) -> Result<Claims> {
            let data = decode::<Claims>(
                raw,
                &DecodingKey::from_secret(self.secret.as_bytes()),
                &self.validation,
            )
            .map_err(|e| Error::new(&e.to_string()))?;
            Ok(data.claims)
        }
    }
}

pub use hs256::{build_claims, JwtHs256Token, JwtHs256Validator};

/// Single-line glob import for downstream crates.
pub mod prelude {
    pub use super::{
        build_claims, CapabilityRecord, CapabilityToken, Claims, JwtHs256Token,
        JwtHs256Validator, TokenRegistry, TokenScopes, TokenValidator,
    };
}
