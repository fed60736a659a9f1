//! Configuration loading and mode resolution
//!
//! Service definitions come from `servers.toml`. Each service declares a
//! primary command (the real tool server) and an optional fallback command
//! (usually a local mock). [`resolve_service_modes`] decides which of the two
//! is launched, based on the declared mode, CLI overrides, and whether the
//! credentials the primary command needs are actually present.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use thiserror::Error;

/// Config file name searched for when `--config` is not given
pub const CONFIG_FILE_NAME: &str = "servers.toml";

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("Invalid regex"));

// ============================================================================
// Errors
// ============================================================================

/// Configuration problems, fatal to a single service's launch
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid executable path: {0} does not exist")]
    ExecutableNotFound(PathBuf),

    #[error("invalid executable path: {0} is not executable")]
    NotExecutable(PathBuf),

    #[error("invalid executable: {0} not found on PATH")]
    NotOnPath(String),

    #[error("invalid working directory: {0} does not exist")]
    WorkdirMissing(PathBuf),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ============================================================================
// Placeholders
// ============================================================================

/// Replace every `${KEY}` in `value` with `env[KEY]`
///
/// An unknown key is a [`ConfigError::MissingEnv`] unless `allow_missing`
/// is set, in which case it renders as an empty string.
pub fn render_template(
    value: &str,
    env: &HashMap<String, String>,
    allow_missing: bool,
) -> Result<String, ConfigError> {
    let mut missing = None;
    let rendered = PLACEHOLDER_REGEX.replace_all(value, |caps: &Captures<'_>| {
        let key = &caps[1];
        match env.get(key) {
            Some(found) => found.clone(),
            None => {
                if !allow_missing && missing.is_none() {
                    missing = Some(key.to_string());
                }
                String::new()
            }
        }
    });

    match missing {
        Some(key) => Err(ConfigError::MissingEnv(key)),
        None => Ok(rendered.into_owned()),
    }
}

/// Collect the keys referenced by `${KEY}` placeholders
pub fn extract_placeholders<'a>(values: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    values
        .into_iter()
        .flat_map(|value| PLACEHOLDER_REGEX.captures_iter(value))
        .map(|caps| caps[1].to_string())
        .collect()
}

// ============================================================================
// Service definitions
// ============================================================================

/// Which command of a service is launched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// The real tool server; every placeholder must resolve
    #[default]
    #[serde(alias = "real")]
    Primary,
    /// The stand-in tool server; unresolved placeholders become empty strings
    #[serde(alias = "mock")]
    Fallback,
}

impl RunMode {
    pub fn tolerates_missing_env(self) -> bool {
        self == RunMode::Fallback
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Primary => f.pad("primary"),
            RunMode::Fallback => f.pad("fallback"),
        }
    }
}

/// One launchable command template
#[derive(Debug, Clone, Deserialize)]
pub struct ServerCommand {
    pub exec: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Command-level env templates; override service-level ones
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_workdir() -> String {
    ".".to_string()
}

/// How a search hit's full content is obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    /// Call `fetch_tool` with the hit's URI and forwarded fields
    Tool,
    /// `resources/read` on the hit's URI
    #[default]
    Resource,
    /// No remote call; the snippet is the content
    Snippet,
}

/// Per-service knobs for interpreting a tool server's search/fetch shapes
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_search_tool")]
    pub search_tool: String,
    #[serde(default = "default_query_param")]
    pub query_param: String,
    /// Omitted from the search arguments when unset
    #[serde(default)]
    pub limit_param: Option<String>,
    #[serde(default)]
    pub fetch: FetchStrategy,
    #[serde(default)]
    pub fetch_tool: Option<String>,
    /// Extra hit fields forwarded as fetch arguments (e.g. `thread_ts`)
    #[serde(default)]
    pub fetch_fields: Vec<String>,
}

fn default_search_tool() -> String {
    "search".to_string()
}

fn default_query_param() -> String {
    "query".to_string()
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            search_tool: default_search_tool(),
            query_param: default_query_param(),
            limit_param: None,
            fetch: FetchStrategy::default(),
            fetch_tool: None,
            fetch_fields: Vec::new(),
        }
    }
}

/// A service as declared in `servers.toml`
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDefinition {
    #[serde(default)]
    pub mode: RunMode,
    /// Service-level env templates
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Credential files the primary command needs (paths may hold placeholders)
    #[serde(default)]
    pub auth_files: Vec<String>,
    pub primary: ServerCommand,
    #[serde(default)]
    pub fallback: Option<ServerCommand>,
    #[serde(default)]
    pub adapter: AdapterConfig,
}

impl ServerDefinition {
    /// The command template launched in `mode`
    ///
    /// Without an explicit fallback the primary command is reused with its
    /// command-level env dropped.
    pub fn command_for(&self, mode: RunMode) -> Cow<'_, ServerCommand> {
        match (mode, &self.fallback) {
            (RunMode::Primary, _) => Cow::Borrowed(&self.primary),
            (RunMode::Fallback, Some(fallback)) => Cow::Borrowed(fallback),
            (RunMode::Fallback, None) => Cow::Owned(ServerCommand {
                env: HashMap::new(),
                ..self.primary.clone()
            }),
        }
    }

    /// Env keys the primary command cannot start without
    pub fn required_env_keys(&self) -> BTreeSet<String> {
        let mut required: BTreeSet<String> = self.env.keys().cloned().collect();
        required.extend(extract_placeholders(self.env.values().map(String::as_str)));
        required.extend(extract_placeholders(self.auth_files.iter().map(String::as_str)));
        required
    }
}

/// Top-level `servers.toml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersConfig {
    #[serde(default)]
    pub services: BTreeMap<String, ServerDefinition>,
}

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at `<config_dir>/workspace-finder/`
fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("workspace-finder").join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

impl ServersConfig {
    /// Load from `servers.toml` found in the directory tree or the global config dir
    pub fn load() -> Result<Option<Self>, ConfigError> {
        if let Some(config_path) = find_config_file(CONFIG_FILE_NAME) {
            tracing::debug!("Loading servers config from: {}", config_path.display());
            return Self::load_from_path(&config_path).map(Some);
        }

        tracing::debug!("No {} found", CONFIG_FILE_NAME);
        Ok(None)
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

// ============================================================================
// Mode resolution
// ============================================================================

/// The launch decision for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub name: String,
    pub declared_mode: RunMode,
    pub selected_mode: RunMode,
    pub missing_keys: Vec<String>,
    pub missing_files: Vec<String>,
    pub warning: Option<String>,
}

impl ResolvedService {
    /// Declared primary but launched as fallback
    pub fn is_override(&self) -> bool {
        self.declared_mode == RunMode::Primary && self.selected_mode == RunMode::Fallback
    }
}

fn missing_auth_files(definition: &ServerDefinition, env: &HashMap<String, String>) -> Vec<String> {
    let mut missing = Vec::new();
    for raw_path in &definition.auth_files {
        let resolved = render_template(raw_path, env, true)
            .unwrap_or_default()
            .trim()
            .to_string();
        if resolved.is_empty() {
            missing.push(raw_path.clone());
            continue;
        }
        let candidate = PathBuf::from(shellexpand::tilde(&resolved).as_ref());
        let readable = candidate.is_file() && std::fs::File::open(&candidate).is_ok();
        if !readable {
            missing.push(resolved);
        }
    }
    missing
}

/// Decide primary vs fallback for every service
///
/// - `force_fallback` wins over everything
/// - primary is only selected when allowed, declared, and every required
///   env key and auth file is present
pub fn resolve_service_modes(
    definitions: &BTreeMap<String, ServerDefinition>,
    force_fallback: bool,
    allow_primary: bool,
    env: &HashMap<String, String>,
) -> BTreeMap<String, ResolvedService> {
    let mut results = BTreeMap::new();

    for (name, definition) in definitions {
        let mut warning = None;
        let mut missing_keys = Vec::new();
        let mut missing_files = Vec::new();
        let mut selected = RunMode::Fallback;

        if force_fallback {
            if definition.mode == RunMode::Primary {
                warning = Some(format!("CLI override: forced fallback for {}", name));
            }
        } else if allow_primary && definition.mode == RunMode::Primary {
            missing_keys = definition
                .required_env_keys()
                .into_iter()
                .filter(|key| env.get(key).map_or(true, |value| value.is_empty()))
                .collect();

            if !missing_keys.is_empty() {
                warning = Some(format!(
                    "falling back: missing credentials for {} ({})",
                    name,
                    missing_keys.join(", ")
                ));
            } else {
                missing_files = missing_auth_files(definition, env);
                if !missing_files.is_empty() {
                    warning = Some(format!(
                        "falling back: missing auth files for {} ({})",
                        name,
                        missing_files.join(", ")
                    ));
                } else {
                    selected = RunMode::Primary;
                }
            }
        }

        if let Some(ref message) = warning {
            tracing::warn!("{}", message);
        }

        results.insert(
            name.clone(),
            ResolvedService {
                name: name.clone(),
                declared_mode: definition.mode,
                selected_mode: selected,
                missing_keys,
                missing_files,
                warning,
            },
        );
    }

    results
}

/// `name=mode, ...` in service-name order
pub fn mode_summary(resolved: &BTreeMap<String, ResolvedService>) -> String {
    resolved
        .iter()
        .map(|(name, service)| format!("{}={}", name, service.selected_mode))
        .collect::<Vec<_>>()
        .join(", ")
}
