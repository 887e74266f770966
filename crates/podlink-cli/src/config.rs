//! Configuration: TOML file + CLI overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub forward: ForwardSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub kubectl: KubectlSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[forward]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardSection {
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_allowed_scopes")]
    pub allowed_scopes: Vec<String>,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            network: default_network(),
            listen: default_listen(),
            dial_timeout_secs: default_dial_timeout(),
            max_connections: default_max_connections(),
            allowed_scopes: default_allowed_scopes(),
        }
    }
}

/// Which tunnel mechanism to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `kubectl port-forward` child process.
    #[default]
    Kubectl,
    /// In-process relay straight to the upstream host.
    Relay,
}

/// `[backend]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub kind: BackendKind,
}

/// `[kubectl]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct KubectlSection {
    #[serde(default = "default_kubectl_binary")]
    pub binary: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

impl Default for KubectlSection {
    fn default() -> Self {
        Self {
            binary: default_kubectl_binary(),
            context: None,
            kubeconfig: None,
            request_timeout: default_request_timeout(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    /// Upstream host template; `{name}` and `{scope}` are substituted.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_network() -> String {
    "tcp".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}
fn default_dial_timeout() -> u64 {
    30
}
fn default_max_connections() -> usize {
    100
}
fn default_allowed_scopes() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_kubectl_binary() -> String {
    "kubectl".to_string()
}
fn default_request_timeout() -> String {
    "32s".to_string()
}
fn default_upstream() -> String {
    "{name}.{scope}".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub backend: Option<BackendKind>,
    pub dial_timeout_secs: Option<u64>,
}

/// Resolved configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct Settings {
    pub network: String,
    pub listen: String,
    pub dial_timeout: Duration,
    pub max_connections: usize,
    pub allowed_scopes: Vec<String>,
    pub backend: BackendKind,
    pub kubectl: KubectlSection,
    pub relay: RelaySection,
}

impl Settings {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded).with_context(|| {
                        format!("failed to read config at {}", expanded.display())
                    })?;
                    toml::from_str::<ConfigFile>(&content).with_context(|| {
                        format!("failed to parse config at {}", expanded.display())
                    })?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::from_file(file_config, overrides))
    }

    fn from_file(file: ConfigFile, overrides: Overrides) -> Self {
        let mut kubectl = file.kubectl;
        kubectl.kubeconfig = kubectl
            .kubeconfig
            .map(|p| expand_tilde_str(&p).to_string_lossy().into_owned());

        Self {
            network: file.forward.network,
            listen: overrides.listen.unwrap_or(file.forward.listen),
            dial_timeout: Duration::from_secs(
                overrides
                    .dial_timeout_secs
                    .unwrap_or(file.forward.dial_timeout_secs),
            ),
            max_connections: file.forward.max_connections,
            allowed_scopes: file.forward.allowed_scopes,
            backend: overrides.backend.unwrap_or(file.backend.kind),
            kubectl,
            relay: file.relay,
        }
    }
}

/// Default config location, `~/.podlink/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".podlink")
        .join("config.toml")
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
