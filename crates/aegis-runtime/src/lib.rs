#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aegis-runtime** – Runtime adapter for Aegis.
//!
//! This crate owns the explicit configuration object (built from
//! environment flags with documented defaults, validated at startup) and
//! assembles a running kernel: storage, projections, policy gate, secret
//! vault, and the lease-expiry sweeper. Configuration is passed through
//! construction rather than read from globals, so many kernels can run in
//! one test process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use aegis_kernel::{Kernel, KernelConfig, KernelError};
use aegis_policy::{EnforcementMode, PolicyConfig};
use aegis_secrets::{MasterKey, SecretVault, VaultError};
use aegis_store_sqlite::SqliteEventStore;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Where the transactional backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// In-memory database; lost at process exit. For tests and demos.
    InMemory,
    /// On-disk database at this path, created if missing.
    File(String),
}

/// The full runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Backend location.
    pub storage: StorageConfig,
    /// Kernel timing and policy parameters.
    pub kernel: KernelConfig,
    /// How often the lease sweeper runs.
    pub sweep_interval: Duration,
    /// Base64-encoded 32-byte master key for the secret vault; the vault is
    /// disabled when absent.
    pub master_key: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::File("data/aegis.db".to_string()),
            kernel: KernelConfig::default(),
            sweep_interval: Duration::from_secs(30),
            master_key: None,
        }
    }
}

/// A configuration flag failed validation at startup.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {flag}: {problem}")]
pub struct ConfigError {
    /// The offending environment flag.
    pub flag: &'static str,
    /// What was wrong with it.
    pub problem: String,
}

fn parse_secs(
    lookup: &dyn Fn(&str) -> Option<String>,
    flag: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match lookup(flag) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError { flag, problem: e.to_string() }),
    }
}

fn parse_bool(
    lookup: &dyn Fn(&str) -> Option<String>,
    flag: &'static str,
) -> Result<bool, ConfigError> {
    match lookup(flag).as_deref() {
        None | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(other) => Err(ConfigError {
            flag,
            problem: format!("expected 0/1/true/false, got {other}"),
        }),
    }
}

impl RuntimeConfig {
    /// Build a configuration from process environment flags.
    ///
    /// | flag | default |
    /// |------|---------|
    /// | `AEGIS_DB_PATH` | `data/aegis.db` (`:memory:` for in-memory) |
    /// | `AEGIS_KILL_SWITCH` | off |
    /// | `AEGIS_POLICY_MODE` | `enforce` |
    /// | `AEGIS_LEASE_DURATION_SECS` | `1800` |
    /// | `AEGIS_HEARTBEAT_MIN_INTERVAL_SECS` | `10` |
    /// | `AEGIS_MAX_CLAIM_AGE_SECS` | `900` |
    /// | `AEGIS_EGRESS_HOURLY_QUOTA` | `100` |
    /// | `AEGIS_SWEEP_INTERVAL_SECS` | `30` |
    /// | `AEGIS_MASTER_KEY` | unset (vault disabled) |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Build from an explicit lookup function; `from_env` over a map, for
    /// tests.
    pub fn from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let storage = match lookup("AEGIS_DB_PATH").as_deref() {
            None => StorageConfig::File("data/aegis.db".to_string()),
            Some(":memory:") => StorageConfig::InMemory,
            Some(path) => StorageConfig::File(path.to_string()),
        };

        let mode = match lookup("AEGIS_POLICY_MODE").as_deref() {
            None | Some("enforce") => EnforcementMode::Enforce,
            Some("shadow") => EnforcementMode::Shadow,
            Some(other) => {
                return Err(ConfigError {
                    flag: "AEGIS_POLICY_MODE",
                    problem: format!("expected enforce or shadow, got {other}"),
                })
            }
        };

        let egress_hourly_quota = match lookup("AEGIS_EGRESS_HOURLY_QUOTA") {
            None => 100,
            Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError {
                flag: "AEGIS_EGRESS_HOURLY_QUOTA",
                problem: e.to_string(),
            })?,
        };

        let kernel = KernelConfig {
            lease_duration: parse_secs(lookup, "AEGIS_LEASE_DURATION_SECS", 1800)?,
            heartbeat_min_interval: parse_secs(
                lookup,
                "AEGIS_HEARTBEAT_MIN_INTERVAL_SECS",
                10,
            )?,
            max_claim_age: parse_secs(lookup, "AEGIS_MAX_CLAIM_AGE_SECS", 900)?,
            policy: PolicyConfig {
                kill_switch: parse_bool(lookup, "AEGIS_KILL_SWITCH")?,
                mode,
                egress_hourly_quota,
            },
        };
        kernel
            .validate()
            .map_err(|problem| ConfigError { flag: "AEGIS_LEASE_DURATION_SECS", problem })?;

        Ok(Self {
            storage,
            kernel,
            sweep_interval: parse_secs(lookup, "AEGIS_SWEEP_INTERVAL_SECS", 30)?,
            master_key: lookup("AEGIS_MASTER_KEY"),
        })
    }
}

//─────────────────────────────
//  Runtime
//─────────────────────────────

/// Failures while bringing the runtime up.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Kernel assembly failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// Secret vault initialization failed.
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// A running Aegis instance: kernel, vault, and the lease sweeper.
pub struct Runtime {
    kernel: Arc<Kernel>,
    vault: Option<Arc<Mutex<SecretVault>>>,
    sweeper: JoinHandle<()>,
}

impl Runtime {
    /// Bring up a runtime from `config`.
    pub async fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.kernel.validate().map_err(|problem| ConfigError {
            flag: "AEGIS_LEASE_DURATION_SECS",
            problem,
        })?;

        let store = match &config.storage {
            StorageConfig::InMemory => SqliteEventStore::in_memory().await,
            StorageConfig::File(path) => SqliteEventStore::open(path).await,
        }
        .map_err(KernelError::Store)?;
        let store = Arc::new(store);

        let kernel = Arc::new(Kernel::new(store.clone(), config.kernel.clone()).await?);
        info!(storage = ?config.storage, "aegis kernel assembled");

        let vault = match &config.master_key {
            Some(encoded) => {
                let key = MasterKey::from_base64(1, encoded)?;
                let vault = SecretVault::new(store.pool().clone(), key).await?;
                Some(Arc::new(Mutex::new(vault)))
            }
            None => None,
        };

        let sweeper = spawn_sweeper(kernel.clone(), config.sweep_interval);

        Ok(Self { kernel, vault, sweeper })
    }

    /// The assembled kernel.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// The secret vault, when a master key was configured.
    pub fn vault(&self) -> Option<Arc<Mutex<SecretVault>>> {
        self.vault.clone()
    }

    /// Stop background tasks.
    pub async fn shutdown(self) {
        self.sweeper.abort();
        let _ = self.sweeper.await;
        info!("aegis runtime stopped");
    }
}

fn spawn_sweeper(kernel: Arc<Kernel>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match kernel.sweep_expired_leases().await {
                Ok(reclaimed) if !reclaimed.is_empty() => {
                    info!(count = reclaimed.len(), "lease sweep reclaimed runs");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "lease sweep failed"),
            }
        }
    })
}
