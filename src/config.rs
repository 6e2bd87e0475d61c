use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP listener, namespaces and storage
    #[serde(default)]
    pub server: ServerConfig,

    /// PHP sandbox process settings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Temporary route expiry
    #[serde(default)]
    pub purge: PurgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Mount point of the admin interface (default: /manager)
    #[serde(default = "default_admin_path")]
    pub admin_path: String,

    /// Mount point of the management API (default: /api)
    #[serde(default = "default_api_path")]
    pub api_path: String,

    /// Directory holding the built admin single-page app
    #[serde(default = "default_admin_dir")]
    pub admin_dir: String,

    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database: String,

    /// Keys accepted in the X-API-Key header. Empty means every API call is rejected.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Create the "/" route at startup when it does not exist
    #[serde(default = "default_true")]
    pub seed_default_route: bool,

    /// Largest request body buffered for routes and the API (default: 10 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_path: default_admin_path(),
            api_path: default_api_path(),
            admin_dir: default_admin_dir(),
            database: default_database_path(),
            api_keys: Vec::new(),
            seed_default_route: true,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    /// Admin mount point without a trailing slash ("/manager")
    pub fn admin_root(&self) -> String {
        trim_mount(&self.admin_path)
    }

    /// API mount point without a trailing slash ("/api")
    pub fn api_root(&self) -> String {
        trim_mount(&self.api_path)
    }

    /// Merge keys from a comma-separated list, as found in the API_KEY variable
    pub fn merge_api_keys(&mut self, list: &str) {
        for key in list.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            if !self.api_keys.iter().any(|existing| existing == key) {
                self.api_keys.push(key.to_string());
            }
        }
    }
}

/// Whether `inner` lies strictly below the `outer` mount point
fn mount_contains(outer: &str, inner: &str) -> bool {
    inner
        .strip_prefix(outer)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn trim_mount(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_path() -> String {
    "/manager".to_string()
}

fn default_api_path() -> String {
    "/api".to_string()
}

fn default_admin_dir() -> String {
    "./admin-frontend/build".to_string()
}

fn default_database_path() -> String {
    "./data/payload-host.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// Settings for the interpreter server that executes PHP routes
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Interpreter executable (default: php)
    #[serde(default = "default_sandbox_command")]
    pub command: String,

    /// Arguments; `{port}` and `{root}` are substituted at spawn time
    #[serde(default = "default_sandbox_args")]
    pub args: Vec<String>,

    /// First port probed for the sandbox (default: 8000)
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// Consecutive ports probed before giving up (default: 1000)
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u32,

    /// How long a fresh process may take to answer its first request
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// A sandbox verified within this window is reused without probing
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Timeout of a single liveness probe
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL when stopping the sandbox
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Upper bound for one script execution round-trip (default: 60s)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum idle loopback connections kept open (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle loopback connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: default_sandbox_command(),
            args: default_sandbox_args(),
            start_port: default_start_port(),
            max_port_attempts: default_max_port_attempts(),
            startup_timeout_ms: default_startup_timeout_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl SandboxConfig {
    /// Substitute `{port}` and `{root}` in the argument template
    pub fn render_args(&self, port: u16, root: &Path) -> Vec<String> {
        let port = port.to_string();
        let root = root.display().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{port}", &port).replace("{root}", &root))
            .collect()
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_sandbox_command() -> String {
    "php".to_string()
}

fn default_sandbox_args() -> Vec<String> {
    vec![
        "-S".to_string(),
        "0.0.0.0:{port}".to_string(),
        "-t".to_string(),
        "{root}".to_string(),
    ]
}

fn default_start_port() -> u16 {
    8000
}

fn default_max_port_attempts() -> u32 {
    1000
}

fn default_startup_timeout_ms() -> u64 {
    2000
}

fn default_liveness_interval_ms() -> u64 {
    1000
}

fn default_health_timeout_ms() -> u64 {
    500
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

/// Expiry of temporary routes
#[derive(Debug, Deserialize, Clone)]
pub struct PurgeConfig {
    /// Run the purge loop (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between purge passes (default: 3600)
    #[serde(default = "default_purge_interval")]
    pub interval_secs: u64,

    /// Lifetime of a route created as temporary, in days
    #[serde(default = "default_temporary_delay_days")]
    pub temporary_delay_days: i64,

    /// Lifetime of a classic route after it was switched to temporary, in days
    #[serde(default = "default_swap_delay_days")]
    pub swap_delay_days: i64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_purge_interval(),
            temporary_delay_days: default_temporary_delay_days(),
            swap_delay_days: default_swap_delay_days(),
        }
    }
}

fn default_purge_interval() -> u64 {
    3600
}

fn default_temporary_delay_days() -> i64 {
    7
}

fn default_swap_delay_days() -> i64 {
    7
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.server.admin_path.starts_with('/') {
            errors.push(format!("server.admin_path must start with '/': {}", self.server.admin_path));
        }
        if !self.server.api_path.starts_with('/') {
            errors.push(format!("server.api_path must start with '/': {}", self.server.api_path));
        }
        let (admin, api) = (self.server.admin_root(), self.server.api_root());
        if admin == api {
            errors.push("server.admin_path and server.api_path must differ".to_string());
        } else if mount_contains(&admin, &api) || mount_contains(&api, &admin) {
            errors.push(format!(
                "server.admin_path and server.api_path must not be nested: {} and {}",
                admin, api
            ));
        }
        if self.server.max_body_bytes == 0 {
            errors.push("server.max_body_bytes must be greater than 0".to_string());
        }

        if self.sandbox.command.trim().is_empty() {
            errors.push("sandbox.command must not be empty".to_string());
        }
        if !self.sandbox.args.iter().any(|arg| arg.contains("{port}")) {
            errors.push("sandbox.args must contain a {port} placeholder".to_string());
        }
        if self.sandbox.max_port_attempts == 0 {
            errors.push("sandbox.max_port_attempts must be greater than 0".to_string());
        }
        if self.sandbox.startup_timeout_ms == 0 {
            errors.push("sandbox.startup_timeout_ms must be greater than 0".to_string());
        }

        if self.purge.interval_secs == 0 {
            errors.push("purge.interval_secs must be greater than 0".to_string());
        }
        if self.purge.temporary_delay_days < 0 || self.purge.swap_delay_days < 0 {
            errors.push("purge delays must not be negative".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
