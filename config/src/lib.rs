//! Configuration file for the Grails session manager.
//!
//! ```toml
//! project_root = "${HOME}/work/bookstore"
//! tooling_available = true
//!
//! [server]
//! mode = "local"              # or "development" to dial a running server
//! host = "localhost"
//! port = 5007
//! java_home = "${JAVA_HOME}"
//! jvm_args = ["-Xmx2g"]
//! install_dir = "${HOME}/.grails-ls/server"
//! trace = "off"               # off | messages | verbose
//! ready = "progress-end"      # progress-end | connect
//!
//! [server.debug]
//! port = 5005
//! suspend = false
//!
//! [server.retry]
//! max_attempts = 5
//! delay_ms = 5000
//! per_attempt_timeout_ms = 5000
//! backoff = "fixed"           # fixed | exponential
//!
//! [progress]
//! tokens = ["GLS-SERVER-SETUP"]
//! prefixes = ["grails-"]
//!
//! [initialization_options]
//! [settings]
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use grails_lsp::translator::{SERVER_SETUP_TOKEN, SERVER_TASK_PREFIX};
use grails_lsp::{
    Backoff, DebugAgent, ReadyPolicy, RetryPolicy, ServerSettings, SessionConfig, TokenMatcher,
    TraceLevel,
};
use serde::Deserialize;

/// Overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "GRAILS_SESSION_CONFIG";
/// `1` or `true` forces development (remote) mode.
pub const DEV_MODE_ENV: &str = "GRAILS_SESSION_DEV";

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config{}: {source}", path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    Invalid {
        path: Option<PathBuf>,
        source: ValidationError,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::Invalid { path, .. } => path.as_deref(),
        }
    }
}

/// A well-formed file with values the session can't use.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(String);

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Spawn the bundled server.
    #[default]
    Local,
    /// Connect to an externally started server over TCP.
    Development,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceSetting {
    #[default]
    Off,
    Messages,
    Verbose,
}

impl From<TraceSetting> for TraceLevel {
    fn from(value: TraceSetting) -> Self {
        match value {
            TraceSetting::Off => TraceLevel::Off,
            TraceSetting::Messages => TraceLevel::Messages,
            TraceSetting::Verbose => TraceLevel::Verbose,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReadySetting {
    /// Running once the setup progress reports its end.
    #[default]
    ProgressEnd,
    /// Running as soon as the handshake completes.
    Connect,
}

impl From<ReadySetting> for ReadyPolicy {
    fn from(value: ReadySetting) -> Self {
        match value {
            ReadySetting::ProgressEnd => ReadyPolicy::OnProgressEnd,
            ReadySetting::Connect => ReadyPolicy::OnConnect,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffSetting {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Workspace root handed to the server in `initialize`.
    pub project_root: Option<String>,
    /// Whether the build tooling is installed. Settings are withheld while
    /// it is not.
    pub tooling_available: Option<bool>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Sent verbatim as `initializationOptions`.
    pub initialization_options: Option<toml::Table>,
    /// Sent verbatim as `workspace/didChangeConfiguration`.
    pub settings: Option<toml::Table>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub mode: ServerMode,
    pub host: String,
    pub port: u16,
    pub java_home: Option<String>,
    pub jvm_args: Vec<String>,
    pub install_dir: Option<String>,
    pub trace: TraceSetting,
    pub ready: ReadySetting,
    pub handshake_timeout_ms: u64,
    /// JDWP agent for the spawned server; absent means no agent.
    pub debug: Option<DebugConfig>,
    pub env: BTreeMap<String, String>,
    pub retry: RetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = ServerSettings::default();
        Self {
            mode: ServerMode::default(),
            host: defaults.host,
            port: defaults.port,
            java_home: None,
            jvm_args: Vec::new(),
            install_dir: None,
            trace: TraceSetting::default(),
            ready: ReadySetting::default(),
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            debug: None,
            env: BTreeMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub port: u16,
    pub suspend: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        let agent = DebugAgent::default();
        Self {
            port: agent.port,
            suspend: agent.suspend,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    /// Zero disables the per-attempt bound.
    pub per_attempt_timeout_ms: u64,
    pub backoff: BackoffSetting,
    /// Cap for exponential backoff.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            delay_ms: millis(policy.delay),
            per_attempt_timeout_ms: millis(policy.per_attempt_timeout),
            backoff: BackoffSetting::default(),
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Exact setup tokens.
    pub tokens: Vec<String>,
    /// Token prefixes that also count as setup.
    pub prefixes: Vec<String>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            tokens: vec![SERVER_SETUP_TOKEN.to_string()],
            prefixes: vec![SERVER_TASK_PREFIX.to_string()],
        }
    }
}

/// Convert a TOML value to a JSON value.
fn toml_to_json(value: &toml::Value) -> Result<serde_json::Value, String> {
    match value {
        toml::Value::String(s) => Ok(serde_json::Value::String(s.clone())),
        toml::Value::Integer(i) => Ok(serde_json::Value::Number((*i).into())),
        toml::Value::Float(f) => {
            let n =
                serde_json::Number::from_f64(*f).ok_or_else(|| format!("Invalid float: {f}"))?;
            Ok(serde_json::Value::Number(n))
        }
        toml::Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        toml::Value::Array(arr) => {
            let json_arr: Result<Vec<_>, _> = arr.iter().map(toml_to_json).collect();
            Ok(serde_json::Value::Array(json_arr?))
        }
        toml::Value::Table(table) => table_to_json(table),
        toml::Value::Datetime(dt) => Ok(serde_json::Value::String(dt.to_string())),
    }
}

fn table_to_json(table: &toml::Table) -> Result<serde_json::Value, String> {
    let mut map = serde_json::Map::new();
    for (k, v) in table {
        map.insert(k.clone(), toml_to_json(v)?);
    }
    Ok(serde_json::Value::Object(map))
}

/// Replace `${VAR}` with the variable's value (empty when unset).
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(open) = rest.find("${") {
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        let var = &after[..close];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_path(value: &str) -> PathBuf {
    PathBuf::from(expand_env_vars(value))
}

/// Whether `GRAILS_SESSION_DEV` forces development mode.
#[must_use]
pub fn dev_mode_override() -> bool {
    env::var(DEV_MODE_ENV).is_ok_and(|v| is_truthy(&v))
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl SessionFileConfig {
    /// Load from `explicit`, `$GRAILS_SESSION_CONFIG`, or the default
    /// location, in that order. A missing default file is not an error.
    pub fn load(explicit: Option<&Path>) -> Result<Option<(PathBuf, Self)>, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from(path).map(|config| Some((path.to_path_buf(), config)));
        }

        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(None);
        }
        Self::load_from(&path).map(|config| Some((path, config)))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Validate and convert into the session's configuration.
    ///
    /// `force_development` overrides `server.mode`.
    pub fn into_session_config(
        self,
        force_development: bool,
    ) -> Result<SessionConfig, ValidationError> {
        let server = self.server;
        let development_mode = force_development || server.mode == ServerMode::Development;

        if server.retry.max_attempts == 0 {
            return Err(ValidationError(
                "server.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if development_mode && server.port == 0 {
            return Err(ValidationError(
                "server.port must be set in development mode".to_string(),
            ));
        }
        if self.progress.tokens.is_empty()
            && self.progress.prefixes.is_empty()
            && server.ready == ReadySetting::ProgressEnd
        {
            return Err(ValidationError(
                "progress.tokens or progress.prefixes is required when ready = \"progress-end\""
                    .to_string(),
            ));
        }

        let backoff = match server.retry.backoff {
            BackoffSetting::Fixed => Backoff::Fixed,
            BackoffSetting::Exponential => Backoff::Exponential {
                max_delay: Duration::from_millis(server.retry.max_delay_ms),
            },
        };
        let defaults = ServerSettings::default();
        let settings = ServerSettings {
            development_mode,
            host: server.host,
            port: server.port,
            retry: RetryPolicy {
                max_attempts: server.retry.max_attempts,
                delay: Duration::from_millis(server.retry.delay_ms),
                per_attempt_timeout: Duration::from_millis(server.retry.per_attempt_timeout_ms),
                backoff,
            },
            java_home: server.java_home.as_deref().map(expand_path),
            jvm_args: server.jvm_args,
            install_dir: server
                .install_dir
                .as_deref()
                .map_or(defaults.install_dir, expand_path),
            debug: server.debug.map(|debug| DebugAgent {
                port: debug.port,
                suspend: debug.suspend,
            }),
            env: server.env,
        };

        let initialization_options = match &self.initialization_options {
            Some(table) => table_to_json(table)
                .map_err(|e| ValidationError(format!("initialization_options: {e}")))?,
            None => serde_json::Value::Null,
        };
        let user_settings = self
            .settings
            .as_ref()
            .map(table_to_json)
            .transpose()
            .map_err(|e| ValidationError(format!("settings: {e}")))?;

        Ok(SessionConfig {
            server: settings,
            progress: TokenMatcher::new(self.progress.tokens, self.progress.prefixes),
            ready_policy: server.ready.into(),
            trace: server.trace.into(),
            project_root: self.project_root.as_deref().map(expand_path),
            initialization_options,
            settings: user_settings,
            tooling_available: self.tooling_available.unwrap_or(true),
            handshake_timeout: Duration::from_millis(server.handshake_timeout_ms),
        })
    }
}

/// Load and convert in one step. Returns the file the config came from.
pub fn load_session_config(
    explicit: Option<&Path>,
) -> Result<(SessionConfig, Option<PathBuf>), ConfigError> {
    let (path, file) = match SessionFileConfig::load(explicit)? {
        Some((path, file)) => (Some(path), file),
        None => (None, SessionFileConfig::default()),
    };
    let config = file
        .into_session_config(dev_mode_override())
        .map_err(|source| ConfigError::Invalid {
            path: path.clone(),
            source,
        })?;
    Ok((config, path))
}

/// `$GRAILS_SESSION_CONFIG`, else `<config dir>/grails-session/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("grails-session").join("config.toml"))
}
