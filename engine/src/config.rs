//! Engine configuration.
//!
//! Mirrors the teacher's `ControllerConfig`: a typed struct assembled from environment
//! variables with explicit defaults, never read from process-wide globals at call sites
//! (spec §9: "the engine takes all configuration via explicit activity inputs").

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top level engine configuration, constructed once at startup and threaded through
/// explicitly (as `Arc<EngineConfig>`) to every subsystem that needs it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub container: ContainerConfig,
    pub network: NetworkConfig,
    pub proxy: ProxyConfig,
    pub telemetry: TelemetryConfig,
}

impl EngineConfig {
    /// Load configuration from the environment, matching the variable names in spec §6.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            container: ContainerConfig::from_env(),
            network: NetworkConfig::from_env(),
            proxy: ProxyConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    fn from_env() -> anyhow::Result<Self> {
        let url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        Ok(Self {
            url,
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
        })
    }
}

/// Container sandbox defaults (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    pub memory_bytes: i64,
    pub cpu_quota_us: i64,
    pub cpu_period_us: i64,
    pub pids_limit: i64,
    pub default_exec_timeout: Duration,
    pub tmp_tmpfs_bytes: i64,
    pub cache_tmpfs_bytes: i64,
    pub workspace_root: String,
    pub claude_config_dir: Option<String>,
}

impl ContainerConfig {
    fn from_env() -> Self {
        Self {
            image: env::var("AGENT_IMAGE").unwrap_or_else(|_| "paid-agent:latest".to_string()),
            memory_bytes: env_parse("CONTAINER_MEMORY_BYTES", 2 * 1024 * 1024 * 1024),
            cpu_quota_us: env_parse("CONTAINER_CPU_QUOTA_US", 200_000),
            cpu_period_us: env_parse("CONTAINER_CPU_PERIOD_US", 100_000),
            pids_limit: env_parse("CONTAINER_PIDS_LIMIT", 500),
            default_exec_timeout: Duration::from_secs(env_parse("CONTAINER_EXEC_TIMEOUT_SECS", 600)),
            tmp_tmpfs_bytes: env_parse("CONTAINER_TMP_TMPFS_BYTES", 1024 * 1024 * 1024),
            cache_tmpfs_bytes: env_parse("CONTAINER_CACHE_TMPFS_BYTES", 512 * 1024 * 1024),
            workspace_root: env::var("WORKSPACE_ROOT")
                .unwrap_or_else(|_| "/var/paid/workspaces".to_string()),
            claude_config_dir: env::var("CLAUDE_CONFIG_DIR").ok(),
        }
    }

    /// Subscription mode is active when the host exposes a Claude config directory.
    pub fn subscription_mode(&self) -> bool {
        self.claude_config_dir.is_some()
    }
}

/// Network policy defaults (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub agent_network: String,
    pub infra_network: String,
    pub agent_subnet: String,
    pub github_cidrs_fallback: Vec<String>,
    pub production: bool,
}

impl NetworkConfig {
    fn from_env() -> Self {
        Self {
            agent_network: env::var("AGENT_NETWORK_NAME")
                .unwrap_or_else(|_| "paid_agent".to_string()),
            infra_network: env::var("INFRA_NETWORK_NAME")
                .unwrap_or_else(|_| "paid_internal".to_string()),
            agent_subnet: env::var("AGENT_NETWORK_SUBNET")
                .unwrap_or_else(|_| "172.28.0.0/16".to_string()),
            github_cidrs_fallback: default_github_cidrs(),
            production: env::var("ENVIRONMENT")
                .map(|v| v.eq_ignore_ascii_case("production"))
                .unwrap_or(false),
        }
    }
}

fn default_github_cidrs() -> Vec<String> {
    // Static fallback list, used when https://api.github.com/meta cannot be reached.
    vec![
        "140.82.112.0/20".to_string(),
        "143.55.64.0/20".to_string(),
        "185.199.108.0/22".to_string(),
        "192.30.252.0/22".to_string(),
        "20.175.192.108/31".to_string(),
        "20.205.243.160/27".to_string(),
    ]
}

/// Secrets proxy location (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    fn from_env() -> Self {
        Self {
            host: env::var("PAID_PROXY_HOST").unwrap_or_else(|_| "secrets-proxy".to_string()),
            port: env_parse("PAID_PROXY_PORT", 3000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_format: LogFormat,
    pub env_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl TelemetryConfig {
    fn from_env() -> Self {
        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("pretty") => LogFormat::Pretty,
            _ => {
                if cfg!(debug_assertions) {
                    LogFormat::Pretty
                } else {
                    LogFormat::Json
                }
            }
        };
        Self {
            log_format,
            env_filter: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Install the global tracing subscriber per `TelemetryConfig`.
pub fn init_tracing(config: &TelemetryConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_new(&config.env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.log_format {
        LogFormat::Json => {
            let _ = fmt().json().with_env_filter(filter).try_init();
        }
        LogFormat::Pretty => {
            let _ = fmt().with_env_filter(filter).try_init();
        }
    }
}
