use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::DEFAULT_SESSION_ENV;

/// Socket file name placed under the temp directory when no path is configured.
pub const DEFAULT_SOCKET_NAME: &str = "bw-ssh-agent.sock";
/// Marker file name placed under the temp directory when no path is configured.
pub const DEFAULT_PID_NAME: &str = "bw-ssh-agent.pid";
/// Vault folder searched for the key item.
pub const DEFAULT_FOLDER: &str = "ssh-agent";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub hardening: HardeningConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_session_env")]
    pub session_env: String,
    #[serde(default = "default_bw_binary")]
    pub bw_binary: PathBuf,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// How long the launching process waits for the detached daemon to report ready.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            session_env: default_session_env(),
            bw_binary: default_bw_binary(),
            socket_path: None,
            pid_file: None,
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

impl AgentConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SOCKET_NAME))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_PID_NAME))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardeningConfig {
    #[serde(default = "default_true")]
    pub disable_core_dumps: bool,
    #[serde(default = "default_true")]
    pub lock_memory: bool,
}

impl Default for HardeningConfig {
    fn default() -> Self {
        Self {
            disable_core_dumps: true,
            lock_memory: true,
        }
    }
}

/// Log filtering comes from `BWAGENT_LOG`; the subscriber is up before this file is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Where the detached daemon's stderr goes.  `None` discards it.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// `$XDG_CONFIG_HOME/bwagent/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME are set; using current directory for config");
            PathBuf::from(".")
        });
    base.join("bwagent").join("config.toml")
}

/// Load the config at `path`.  A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) if meta.mode() & 0o077 != 0 => {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:o}", meta.mode() & 0o777),
                    "config file is readable by group or others; recommend: chmod 600 {}",
                    path.display()
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("could not check config file permissions: {e}"),
        }
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_folder() -> String {
    DEFAULT_FOLDER.to_string()
}

fn default_session_env() -> String {
    DEFAULT_SESSION_ENV.to_string()
}

fn default_bw_binary() -> PathBuf {
    PathBuf::from("bw")
}

fn default_startup_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}
