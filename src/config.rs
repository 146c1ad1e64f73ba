//! Configuration loading for fixloop.
//!
//! Settings are layered: `.fixloop/fixloop.toml` first, then environment
//! variables, then CLI flags. Secrets (`ANTHROPIC_API_KEY`, `GITHUB_TOKEN`) are
//! only ever read from the environment and are wrapped in [`Secret`].
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//!
//! [lifecycle]
//! network_timeout_secs = 60
//! allow_apply_retry = false
//! dedup = "off"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::extract::PRODUCER_NAMES;
use crate::lifecycle::dedup::DedupPolicy;

pub const CONFIG_DIR: &str = ".fixloop";
pub const CONFIG_FILE: &str = "fixloop.toml";

/// A credential that never shows up in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Analysis service endpoint. The API key is not part of this section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_api_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitSection {
    /// Where working copies are cloned. Relative paths are taken from the
    /// project directory.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("repos")
}

fn default_branch_prefix() -> String {
    "autofix".to_string()
}

fn default_author_name() -> String {
    "fixloop".to_string()
}

fn default_author_email() -> String {
    "fixloop@localhost".to_string()
}

fn default_commit_message() -> String {
    "Auto-fix applied by fixloop".to_string()
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            branch_prefix: default_branch_prefix(),
            author_name: default_author_name(),
            author_email: default_author_email(),
            commit_message: default_commit_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleSection {
    /// Upper bound for every network-bound step (clone, fetch, analysis, push).
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    /// Permit `apply_failed -> applying`. Off by default: apply_failed is terminal.
    #[serde(default)]
    pub allow_apply_retry: bool,
    #[serde(default)]
    pub dedup: DedupPolicy,
}

fn default_network_timeout_secs() -> u64 {
    60
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            network_timeout_secs: default_network_timeout_secs(),
            allow_apply_retry: false,
            dedup: DedupPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractSection {
    #[serde(default = "default_producers")]
    pub producers: Vec<String>,
}

fn default_producers() -> Vec<String> {
    PRODUCER_NAMES.iter().map(|s| s.to_string()).collect()
}

impl Default for ExtractSection {
    fn default() -> Self {
        Self {
            producers: default_producers(),
        }
    }
}

/// The complete fixloop.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FixloopToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub extract: ExtractSection,
}

impl FixloopToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fixloop.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize fixloop.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FIXLOOP_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("FIXLOOP_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid FIXLOOP_PORT '{}'", port))?;
        }
        if let Some(workspace) = lookup("FIXLOOP_WORKSPACE") {
            self.git.workspace_root = PathBuf::from(workspace);
        }
        if let Some(secs) = lookup("FIXLOOP_TIMEOUT_SECS") {
            self.lifecycle.network_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("Invalid FIXLOOP_TIMEOUT_SECS '{}'", secs))?;
        }
        if let Some(flag) = lookup("FIXLOOP_ALLOW_APPLY_RETRY") {
            self.lifecycle.allow_apply_retry = parse_bool(&flag)
                .with_context(|| format!("Invalid FIXLOOP_ALLOW_APPLY_RETRY '{}'", flag))?;
        }
        if let Some(url) = lookup("FIXLOOP_ANALYSIS_URL") {
            self.analysis.api_url = url;
        }
        if let Some(model) = lookup("FIXLOOP_MODEL") {
            self.analysis.model = model;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.lifecycle.network_timeout_secs == 0 {
            warnings.push(
                "network_timeout_secs is 0: every clone, push and analysis call will time out"
                    .to_string(),
            );
        }

        let sample = format!("refs/heads/{}/attempt-0", self.git.branch_prefix.trim_matches('/'));
        if !git2::Reference::is_valid_name(&sample) {
            warnings.push(format!(
                "Invalid branch_prefix '{}': not a valid git ref component",
                self.git.branch_prefix
            ));
        }

        for producer in &self.extract.producers {
            if !PRODUCER_NAMES.contains(&producer.as_str()) {
                warnings.push(format!(
                    "Unknown producer '{}'. Valid values: {}",
                    producer,
                    PRODUCER_NAMES.join(", ")
                ));
            }
        }

        if self.extract.producers.is_empty() {
            warnings.push("No producers configured: scans will never find errors".to_string());
        }

        warnings
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Resolved runtime configuration: file, environment and CLI merged.
#[derive(Debug, Clone)]
pub struct FixloopConfig {
    pub project_dir: PathBuf,
    /// The file that was (or would be) read.
    pub config_path: PathBuf,
    pub toml: FixloopToml,
    pub anthropic_api_key: Option<Secret>,
    pub github_token: Option<Secret>,
    pub verbose: bool,
}

impl FixloopConfig {
    /// Load from `config_path` (default `.fixloop/fixloop.toml` under
    /// `project_dir`), then apply the process environment.
    pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(project_dir, config_path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(project_dir: &Path, config_path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_path = match config_path {
            Some(path) => path.to_path_buf(),
            None => default_config_path(&project_dir),
        };

        let mut toml = if config_path.exists() {
            FixloopToml::load(&config_path)?
        } else {
            FixloopToml::default()
        };
        toml.apply_env(&lookup)?;

        let secret = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(Secret::new)
        };

        Ok(Self {
            anthropic_api_key: secret("ANTHROPIC_API_KEY"),
            github_token: secret("GITHUB_TOKEN"),
            project_dir,
            config_path,
            toml,
            verbose: false,
        })
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// CLI overrides for `serve`.
    pub fn override_server(&mut self, host: Option<String>, port: Option<u16>) {
        if let Some(host) = host {
            self.toml.server.host = host;
        }
        if let Some(port) = port {
            self.toml.server.port = port;
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.lifecycle.network_timeout_secs)
    }

    /// Absolute workspace root for working copies.
    pub fn workspace_root(&self) -> PathBuf {
        let root = &self.toml.git.workspace_root;
        if root.is_absolute() {
            root.clone()
        } else {
            self.project_dir.join(root)
        }
    }

    /// File warnings plus warnings about missing secrets.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if self.anthropic_api_key.is_none() {
            warnings.push(
                "ANTHROPIC_API_KEY is not set: proposal requests will fail".to_string(),
            );
        }
        if self.github_token.is_none() {
            warnings.push(
                "GITHUB_TOKEN is not set: only public or locally reachable remotes can be cloned and pushed"
                    .to_string(),
            );
        }
        warnings
    }
}

pub fn default_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let toml = FixloopToml::default();
        assert_eq!(toml.server.host, "127.0.0.1");
        assert_eq!(toml.server.port, 3142);
        assert_eq!(toml.analysis.max_tokens, 4096);
        assert_eq!(toml.git.branch_prefix, "autofix");
        assert_eq!(toml.lifecycle.network_timeout_secs, 60);
        assert!(!toml.lifecycle.allow_apply_retry);
        assert_eq!(toml.lifecycle.dedup, DedupPolicy::Off);
        assert_eq!(toml.extract.producers, vec!["python_traceback", "log_block"]);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let toml = FixloopToml::parse(
            r#"
[server]
port = 8080

[lifecycle]
allow_apply_retry = true
dedup = "signature"
"#,
        )
        .unwrap();
        assert_eq!(toml.server.port, 8080);
        assert_eq!(toml.server.host, "127.0.0.1");
        assert!(toml.lifecycle.allow_apply_retry);
        assert_eq!(toml.lifecycle.dedup, DedupPolicy::Signature);
        assert_eq!(toml.git.author_name, "fixloop");
    }

    #[test]
    fn test_parse_rejects_bad_toml() {
        let err = FixloopToml::parse("[server\nport = ").unwrap_err();
        assert!(err.to_string().contains("fixloop.toml"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = FixloopToml::parse("[server]\nport = 9000\n").unwrap();
        toml.apply_env(env(&[
            ("FIXLOOP_PORT", "9100"),
            ("FIXLOOP_TIMEOUT_SECS", "5"),
            ("FIXLOOP_ALLOW_APPLY_RETRY", "yes"),
            ("FIXLOOP_MODEL", "claude-test"),
        ]))
        .unwrap();
        assert_eq!(toml.server.port, 9100);
        assert_eq!(toml.lifecycle.network_timeout_secs, 5);
        assert!(toml.lifecycle.allow_apply_retry);
        assert_eq!(toml.analysis.model, "claude-test");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut toml = FixloopToml::default();
        let err = toml.apply_env(env(&[("FIXLOOP_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("FIXLOOP_PORT"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut toml = FixloopToml::default();
        toml.lifecycle.network_timeout_secs = 0;
        toml.git.branch_prefix = "bad..prefix".to_string();
        toml.extract.producers = vec!["stacktrace".to_string()];
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("network_timeout_secs"));
        assert!(warnings[1].contains("branch_prefix"));
        assert!(warnings[2].contains("stacktrace"));
    }

    #[test]
    fn test_load_with_env_reads_secrets_and_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            default_config_path(dir.path()),
            "[git]\nbranch_prefix = \"bot\"\n",
        )
        .unwrap();

        let config = FixloopConfig::load_with_env(
            dir.path(),
            None,
            env(&[("ANTHROPIC_API_KEY", "sk-test"), ("GITHUB_TOKEN", "  ")]),
        )
        .unwrap();
        assert_eq!(config.toml.git.branch_prefix, "bot");
        assert_eq!(
            config.anthropic_api_key.as_ref().map(Secret::expose),
            Some("sk-test")
        );
        assert!(config.github_token.is_none());
        assert!(config.workspace_root().is_absolute());

        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("GITHUB_TOKEN"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = FixloopConfig::load_with_env(dir.path(), None, env(&[])).unwrap();
        assert_eq!(config.toml, FixloopToml::default());
        assert_eq!(config.network_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_server_cli_override() {
        let dir = tempdir().unwrap();
        let mut config = FixloopConfig::load_with_env(dir.path(), None, env(&[])).unwrap();
        config.override_server(Some("0.0.0.0".into()), None);
        assert_eq!(config.toml.server.host, "0.0.0.0");
        assert_eq!(config.toml.server.port, 3142);
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("ghp_supersecret");
        assert_eq!(format!("{}", secret), "***");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert!(!format!("{:?}", Some(secret.clone())).contains("ghp_"));
        assert_eq!(secret.expose(), "ghp_supersecret");
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fixloop.toml");
        let mut toml = FixloopToml::default();
        toml.lifecycle.dedup = DedupPolicy::Signature;
        toml.save(&path).unwrap();
        assert_eq!(FixloopToml::load(&path).unwrap(), toml);
    }
}
