//! Typed, env-driven configuration assembled once at startup, the way the
//! teacher's `config` module builds a single `Config` from the process
//! environment with explicit defaults rather than scattering `env::var`
//! calls through the codebase.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use vibe80_session::DeploymentMode;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration_secs(key: &str, default_secs: u64) -> Result<Duration> {
    let raw = env_or(key, &default_secs.to_string());
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{key}={raw} is not a valid number of seconds"))?;
    Ok(Duration::from_secs(secs))
}

fn env_duration_millis(key: &str, default_millis: u64) -> Result<Duration> {
    let raw = env_or(key, &default_millis.to_string());
    let millis: u64 = raw
        .parse()
        .with_context(|| format!("{key}={raw} is not a valid number of milliseconds"))?;
    Ok(Duration::from_millis(millis))
}

#[derive(Debug, Clone)]
pub struct SessionGcConfig {
    /// `0` disables idle reclamation.
    pub idle_ttl: Duration,
    /// `0` disables max-age reclamation.
    pub max_ttl: Duration,
    pub gc_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Redis,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub redis_url: Option<String>,
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub root_directory: PathBuf,
    pub uid_min: u32,
    pub uid_max: u32,
    pub deployment_mode: DeploymentModeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentModeConfig {
    MonoUser,
    MultiUser,
}

impl From<DeploymentModeConfig> for DeploymentMode {
    fn from(value: DeploymentModeConfig) -> Self {
        match value {
            DeploymentModeConfig::MonoUser => DeploymentMode::MonoUser,
            DeploymentModeConfig::MultiUser => DeploymentMode::MultiUser,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitIdentityConfig {
    pub author_name: String,
    pub author_email: String,
    pub hooks_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session_gc: SessionGcConfig,
    pub storage: StorageConfig,
    pub workspace: WorkspaceConfig,
    pub git_identity: GitIdentityConfig,
    pub diff_debounce: Duration,
    pub ws_ping_interval: Duration,
    pub ws_outbound_buffer: usize,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let backend = match env_or("STORAGE_BACKEND", "memory").as_str() {
            "redis" => StorageBackend::Redis,
            "sqlite" => StorageBackend::Sqlite,
            "memory" => StorageBackend::Memory,
            other => anyhow::bail!("unknown STORAGE_BACKEND: {other}"),
        };

        let deployment_mode = match env_or("DEPLOYMENT_MODE", "mono_user").as_str() {
            "mono_user" => DeploymentModeConfig::MonoUser,
            "multi_user" => DeploymentModeConfig::MultiUser,
            other => anyhow::bail!("unknown DEPLOYMENT_MODE: {other}"),
        };

        Ok(Self {
            session_gc: SessionGcConfig {
                idle_ttl: env_duration_secs("VIBE80_SESSION_IDLE_TTL_SECONDS", 1800)?,
                max_ttl: env_duration_secs("VIBE80_SESSION_MAX_TTL_SECONDS", 86400)?,
                gc_interval: env_duration_millis("VIBE80_SESSION_GC_INTERVAL_MS", 300_000)?,
            },
            storage: StorageConfig {
                backend,
                redis_url: std::env::var("REDIS_URL").ok(),
                sqlite_path: std::env::var("SQLITE_PATH").ok().map(PathBuf::from),
            },
            workspace: WorkspaceConfig {
                root_directory: PathBuf::from(env_or(
                    "WORKSPACE_ROOT_DIRECTORY",
                    "/var/lib/vibe80/workspaces",
                )),
                uid_min: env_or("WORKSPACE_UID_MIN", "2000").parse().context("WORKSPACE_UID_MIN")?,
                uid_max: env_or("WORKSPACE_UID_MAX", "65000").parse().context("WORKSPACE_UID_MAX")?,
                deployment_mode,
            },
            git_identity: GitIdentityConfig {
                author_name: env_or("VIBE80_DEFAULT_GIT_AUTHOR_NAME", "vibe80"),
                author_email: env_or("VIBE80_DEFAULT_GIT_AUTHOR_EMAIL", "vibe80@localhost"),
                hooks_dir: std::env::var("GIT_HOOKS_DIR").ok().map(PathBuf::from),
            },
            diff_debounce: Duration::from_millis(500),
            ws_ping_interval: Duration::from_secs(25),
            ws_outbound_buffer: 256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        // SAFETY: tests run single-threaded w.r.t. this var via serial env access below.
        std::env::remove_var("STORAGE_BACKEND");
        std::env::remove_var("DEPLOYMENT_MODE");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.session_gc.idle_ttl, Duration::from_secs(1800));
        assert!(matches!(config.storage.backend, StorageBackend::Memory));
        assert!(matches!(
            config.workspace.deployment_mode,
            DeploymentModeConfig::MonoUser
        ));
    }
}
