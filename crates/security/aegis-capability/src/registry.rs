//! The DB-backed capability token registry.
//!
//! Minting inserts a row keyed by `jti`; the policy gate decides from that
//! row, so revoking it invalidates the capability immediately.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::{Claims, TokenScopes};

/// The registry's view of one minted capability token.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRecord {
    /// The token's unique id.
    pub jti: String,
    /// The principal the token is bound to.
    pub principal_id: Uuid,
    /// The coverage the token grants.
    pub scopes: TokenScopes,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
    /// When the token expires.
    pub expires_at: DateTime<Utc>,
    /// Whether the token has been revoked.
    pub revoked: bool,
}

impl CapabilityRecord {
    /// Whether the token is expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Storage for minted capability tokens.
#[async_trait]
pub trait TokenRegistry: Send + Sync {
    /// Register a freshly minted token's claims.
    async fn register(&self, claims: &Claims) -> Result<()>;

    /// Look up a token by its `jti`.
    async fn get(&self, jti: &str) -> Result<Option<CapabilityRecord>>;

    /// Revoke a token by its `jti`. Revoking an unknown token is a no-op.
    async fn revoke(&self, jti: &str) -> Result<()>;
}

/// SQLite-backed registry sharing the kernel's pool.
pub struct SqliteTokenRegistry {
    pool: SqlitePool,
}

impl SqliteTokenRegistry {
    /// Build a registry over `pool`, creating its table.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS capability_tokens (
                jti TEXT PRIMARY KEY,
                principal_id TEXT NOT NULL,
                scopes_json TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                revoked_at INTEGER
            ) STRICT
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl TokenRegistry for SqliteTokenRegistry {
    async fn register(&self, claims: &Claims) -> Result<()> {
        sqlx::query(
            "INSERT INTO capability_tokens \
             (jti, principal_id, scopes_json, issued_at, expires_at, revoked) \
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(&claims.jti)
        .bind(&claims.sub)
        .bind(serde_json::to_string(&claims.scopes)?)
        .bind(claims.iat as i64)
        .bind(claims.exp as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, jti: &str) -> Result<Option<CapabilityRecord>> {
        let row = sqlx::query("SELECT * FROM capability_tokens WHERE jti = ?")
            .bind(jti)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(CapabilityRecord {
            jti: row.get("jti"),
            principal_id: Uuid::parse_str(&row.get::<String, _>("principal_id"))?,
            scopes: serde_json::from_str(&row.get::<String, _>("scopes_json"))?,
            issued_at: Utc
                .timestamp_opt(row.get::<i64, _>("issued_at"), 0)
                .single()
                .unwrap_or_default(),
            expires_at: Utc
                .timestamp_opt(row.get::<i64, _>("expires_at"), 0)
                .single()
                .unwrap_or_default(),
            revoked: row.get::<i64, _>("revoked") != 0,
        }))
    }

    async fn revoke(&self, jti: &str) -> Result<()> {
        sqlx::query(
            "UPDATE capability_tokens SET revoked = 1, revoked_at = ? WHERE jti = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(jti)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
