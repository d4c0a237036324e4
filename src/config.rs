use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Default settings shared by all apps
    #[serde(default)]
    pub defaults: AppDefaults,

    /// Apps keyed by the hostname they answer for
    #[serde(default)]
    pub apps: HashMap<String, AppConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path prefix of the per-app control endpoints (default: /_devgate)
    #[serde(default = "default_control_prefix")]
    pub control_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            control_prefix: default_control_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppDefaults {
    /// Interval between readiness probes in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// How long a backend may take to accept connections
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Number of output lines kept per app
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,

    /// Name of the env file read from the app directory
    #[serde(default = "default_env_file")]
    pub env_file: String,

    /// Shell used to run app commands (default: $SHELL, then /bin/sh)
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Arguments passed to the shell before the command string
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval(),
            startup_timeout_secs: default_startup_timeout(),
            log_lines: default_log_lines(),
            env_file: default_env_file(),
            shell: default_shell(),
            shell_args: default_shell_args(),
        }
    }
}

/// Configuration for a single app, as written in the config file
///
/// # Security Warning
///
/// `command` is run through a login shell with the permissions of this
/// process. Only load configuration files you trust.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Display name (defaults to the hostname)
    pub name: Option<String>,

    /// Scheme used to reach the backend: "http" (default) or "https"
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Working directory of the backend
    pub dir: PathBuf,

    /// Env var that receives the assigned port
    pub env_port_name: Option<String>,

    /// Shell command template, `%s` slots filled with port then host
    pub command: String,

    /// Output patterns that stop the backend when matched
    #[serde(default)]
    pub restart_patterns: Vec<String>,

    pub probe_interval_ms: Option<u64>,
    pub startup_timeout_secs: Option<u64>,
    pub log_lines: Option<usize>,
    pub env_file: Option<String>,
    pub shell: Option<String>,
    pub shell_args: Option<Vec<String>>,
}

impl AppConfig {
    /// Validate the app configuration
    pub fn validate(&self, host: &str) -> Result<(), String> {
        let slots = self.command.matches("%s").count();
        if slots != 2 {
            return Err(format!(
                "App '{}': 'command' needs two %s slots (port, host), found {}",
                host, slots
            ));
        }

        if self.scheme != "http" && self.scheme != "https" {
            return Err(format!(
                "App '{}': unsupported scheme '{}'",
                host, self.scheme
            ));
        }

        if self.dir.as_os_str().is_empty() {
            return Err(format!("App '{}': 'dir' must not be empty", host));
        }

        for pattern in &self.restart_patterns {
            if let Err(e) = Regex::new(pattern) {
                return Err(format!(
                    "App '{}': invalid restart pattern '{}': {}",
                    host, pattern, e
                ));
            }
        }

        if self.log_lines == Some(0) {
            return Err(format!("App '{}': 'log_lines' must be greater than 0", host));
        }

        if self.probe_interval_ms == Some(0) {
            return Err(format!(
                "App '{}': 'probe_interval_ms' must be greater than 0",
                host
            ));
        }

        Ok(())
    }

    /// Resolve defaults and compile patterns into an adapter configuration
    pub fn resolve(&self, host: &str, defaults: &AppDefaults) -> anyhow::Result<AdapterConfig> {
        let restart_patterns = self
            .restart_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AdapterConfig {
            name: self.name.clone().unwrap_or_else(|| host.to_string()),
            scheme: self.scheme.clone(),
            host: host.to_lowercase(),
            dir: self.dir.clone(),
            env_port_name: self.env_port_name.clone(),
            shell_command: self.command.clone(),
            restart_patterns,
            probe_interval: Duration::from_millis(
                self.probe_interval_ms.unwrap_or(defaults.probe_interval_ms),
            ),
            startup_timeout: Duration::from_secs(
                self.startup_timeout_secs
                    .unwrap_or(defaults.startup_timeout_secs),
            ),
            log_lines: self.log_lines.unwrap_or(defaults.log_lines),
            env_file: self
                .env_file
                .clone()
                .unwrap_or_else(|| defaults.env_file.clone()),
            shell: self.shell.clone().unwrap_or_else(|| defaults.shell.clone()),
            shell_args: self
                .shell_args
                .clone()
                .unwrap_or_else(|| defaults.shell_args.clone()),
        })
    }
}

/// Fully resolved, immutable configuration of one adapter
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub name: String,
    pub scheme: String,
    pub host: String,
    pub dir: PathBuf,
    pub env_port_name: Option<String>,
    pub shell_command: String,
    /// Checked in declaration order, first match wins
    pub restart_patterns: Vec<Regex>,
    pub probe_interval: Duration,
    pub startup_timeout: Duration,
    pub log_lines: usize,
    pub env_file: String,
    pub shell: String,
    pub shell_args: Vec<String>,
}

impl AdapterConfig {
    /// Create an http adapter config with default settings
    pub fn new(host: &str, dir: impl Into<PathBuf>, shell_command: &str) -> Self {
        let defaults = AppDefaults::default();
        Self {
            name: host.to_string(),
            scheme: default_scheme(),
            host: host.to_lowercase(),
            dir: dir.into(),
            env_port_name: None,
            shell_command: shell_command.to_string(),
            restart_patterns: Vec::new(),
            probe_interval: Duration::from_millis(defaults.probe_interval_ms),
            startup_timeout: Duration::from_secs(defaults.startup_timeout_secs),
            log_lines: defaults.log_lines,
            env_file: defaults.env_file,
            shell: defaults.shell,
            shell_args: defaults.shell_args,
        }
    }

    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    pub fn with_env_port_name(mut self, name: &str) -> Self {
        self.env_port_name = Some(name.to_string());
        self
    }

    pub fn with_restart_patterns(mut self, patterns: Vec<Regex>) -> Self {
        self.restart_patterns = patterns;
        self
    }

    pub fn with_shell(mut self, shell: &str, args: &[&str]) -> Self {
        self.shell = shell.to_string();
        self.shell_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_probe(mut self, interval: Duration, timeout: Duration) -> Self {
        self.probe_interval = interval;
        self.startup_timeout = timeout;
        self
    }

    pub fn with_log_lines(mut self, lines: usize) -> Self {
        self.log_lines = lines;
        self
    }

    /// Path of the directory-local env file
    pub fn env_file_path(&self) -> PathBuf {
        self.dir.join(&self.env_file)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_control_prefix() -> String {
    "/_devgate".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_probe_interval() -> u64 {
    250
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_log_lines() -> usize {
    1000
}

fn default_env_file() -> String {
    ".env".to_string()
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

fn default_shell_args() -> Vec<String> {
    vec!["-l".to_string(), "-i".to_string(), "-c".to_string()]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.server.control_prefix.starts_with('/') {
            errors.push("Server: 'control_prefix' must start with '/'".to_string());
        }

        if self.defaults.log_lines == 0 {
            errors.push("Defaults: 'log_lines' must be greater than 0".to_string());
        }

        if self.defaults.probe_interval_ms == 0 {
            errors.push("Defaults: 'probe_interval_ms' must be greater than 0".to_string());
        }

        for (host, app) in &self.apps {
            if let Err(e) = app.validate(host) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Resolve every app into its adapter configuration
    pub fn adapter_configs(&self) -> anyhow::Result<Vec<AdapterConfig>> {
        self.apps
            .iter()
            .map(|(host, app)| app.resolve(host, &self.defaults))
            .collect()
    }
}
