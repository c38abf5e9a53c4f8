use crate::readiness::DEFAULT_READY_MARKERS;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides the listening port
pub const PORT_ENV: &str = "PORT";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised backend
    pub backend: BackendConfig,

    /// On-disk state and backend settings bootstrap
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public port (default: 8080, overridden by $PORT)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Readiness probe path answered by the proxy itself
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            probe_path: default_probe_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Command to run. Split with shell-words rules when `args` is empty.
    pub command: String,

    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Loopback port the backend listens on
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Extra environment variables (the proxy's own environment is inherited)
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Output substrings that mean the backend is accepting connections
    #[serde(default = "default_ready_markers")]
    pub ready_markers: Vec<String>,

    /// Also look for readiness markers on stderr
    #[serde(default)]
    pub watch_stderr: bool,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl BackendConfig {
    /// Create a minimal backend config (useful for testing)
    pub fn new(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            port,
            env: HashMap::new(),
            ready_markers: default_ready_markers(),
            watch_stderr: false,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Program and arguments to execute
    pub fn argv(&self) -> Result<(String, Vec<String>), shell_words::ParseError> {
        if !self.args.is_empty() {
            return Ok((self.command.clone(), self.args.clone()));
        }
        let mut words = shell_words::split(&self.command)?;
        if words.is_empty() {
            return Ok((String::new(), Vec::new()));
        }
        let program = words.remove(0);
        Ok((program, words))
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("backend: 'command' must not be empty".to_string());
        } else if let Err(e) = self.argv() {
            errors.push(format!("backend: invalid 'command': {}", e));
        }

        if self.port == 0 {
            errors.push("backend: 'port' must be non-zero".to_string());
        }

        if self.ready_markers.is_empty() {
            errors.push("backend: 'ready_markers' must not be empty".to_string());
        } else if self.ready_markers.iter().any(|m| m.is_empty()) {
            // an empty marker matches every line
            errors.push("backend: 'ready_markers' must not contain an empty marker".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// State directory (default: ~/.frontgate)
    pub dir: Option<String>,

    /// Settings file name inside the state directory
    #[serde(default = "default_settings_file")]
    pub settings_file: String,

    /// Dotted path of the trusted-proxy list inside the settings JSON
    #[serde(default = "default_trusted_proxies_key")]
    pub trusted_proxies_key: String,

    /// Addresses the backend should trust forwarding headers from
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,
}

impl StateConfig {
    pub fn state_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs_next::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".frontgate"),
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.state_dir().join(&self.settings_file)
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: None,
            settings_file: default_settings_file(),
            trusted_proxies_key: default_trusted_proxies_key(),
            trusted_proxies: default_trusted_proxies(),
        }
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_probe_path() -> String {
    "/healthz".to_string()
}

fn default_backend_port() -> u16 {
    18789
}

fn default_ready_markers() -> Vec<String> {
    DEFAULT_READY_MARKERS.iter().map(|m| m.to_string()).collect()
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_settings_file() -> String {
    "settings.json".to_string()
}

fn default_trusted_proxies_key() -> String {
    "gateway.trustedProxies".to_string()
}

fn default_trusted_proxies() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides (currently only $PORT)
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(PORT_ENV) {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {} value '{}': {}", PORT_ENV, port, e))?;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.server.probe_path.starts_with('/') {
            errors.push(format!(
                "server: 'probe_path' must start with '/' (got '{}')",
                self.server.probe_path
            ));
        }

        if self.server.port != 0 && self.server.port == self.backend.port {
            errors.push(format!(
                "server: 'port' {} collides with the backend port",
                self.server.port
            ));
        }

        if let Err(e) = self.backend.validate() {
            errors.push(e);
        }

        if self.state.settings_file.trim().is_empty() {
            errors.push("state: 'settings_file' must not be empty".to_string());
        }

        if self.state.trusted_proxies_key.split('.').any(|seg| seg.is_empty()) {
            errors.push(format!(
                "state: invalid 'trusted_proxies_key' '{}'",
                self.state.trusted_proxies_key
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
