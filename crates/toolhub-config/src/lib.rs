//! Configuration discovery for toolhub.
//!
//! Finds the server configuration file with precedence:
//! CLI flag > `TOOLHUB_CONFIG` > `./.mcp.json` > global `servers.toml` > empty

use std::path::{Path, PathBuf};
use thiserror::Error;
use toolhub_mcp::McpConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TOOLHUB_CONFIG";

/// Environment variable overriding the global config directory.
pub const CONFIG_DIR_ENV: &str = "TOOLHUB_CONFIG_DIR";

/// Environment variable overriding every server's request timeout.
pub const TIMEOUT_ENV: &str = "TOOLHUB_TIMEOUT_MS";

/// Project-local config file, in the `.mcp.json` layout.
pub const PROJECT_FILE: &str = ".mcp.json";

/// Global config file inside the config directory.
pub const GLOBAL_FILE: &str = "servers.toml";

/// Errors from locating or reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Unsupported config format for {path} (expected .json or .toml)")]
    UnsupportedFormat { path: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}

/// Where the configuration was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Flag(PathBuf),
    Env(PathBuf),
    Project(PathBuf),
    Global(PathBuf),
    Default,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Flag(path) | Self::Env(path) | Self::Project(path) | Self::Global(path) => {
                Some(path)
            }
            Self::Default => None,
        }
    }
}

/// Places searched for a config file, captured up front so discovery does
/// not read the process environment directly.
#[derive(Debug, Clone)]
pub struct SearchPaths {
    pub flag: Option<PathBuf>,
    pub env: Option<PathBuf>,
    pub cwd: PathBuf,
    pub config_dir: PathBuf,
}

impl SearchPaths {
    pub fn from_env(flag: Option<PathBuf>) -> Self {
        Self {
            flag,
            env: std::env::var_os(CONFIG_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_dir: config_dir(),
        }
    }
}

/// A configuration together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub mcp: McpConfig,
    pub source: ConfigSource,
}

/// Load configuration from all sources, applying precedence rules.
///
/// Precedence for the file (highest to lowest):
/// 1. `--config` flag
/// 2. `TOOLHUB_CONFIG`
/// 3. `./.mcp.json`
/// 4. `<config dir>/servers.toml`
/// 5. Empty configuration
///
/// Request timeout: CLI flag > `TOOLHUB_TIMEOUT_MS` > file.
pub fn load(overrides: CliOverrides) -> Result<LoadedConfig, ConfigError> {
    let paths = SearchPaths::from_env(overrides.config_path);
    let timeout_ms = match overrides.timeout_ms {
        Some(ms) => Some(ms),
        None => env_timeout()?,
    };
    load_from(&paths, timeout_ms)
}

/// [`load`] with explicit search paths and timeout override.
pub fn load_from(paths: &SearchPaths, timeout_ms: Option<u64>) -> Result<LoadedConfig, ConfigError> {
    let source = locate(paths)?;
    let mut mcp = match source.path() {
        Some(path) => load_file(path)?,
        None => {
            tracing::info!("No MCP configuration found, starting with no servers");
            McpConfig::default()
        }
    };

    if let Some(ms) = timeout_ms {
        apply_timeout(&mut mcp, ms);
    }

    tracing::debug!(source = ?source, servers = mcp.servers.len(), "Loaded configuration");
    Ok(LoadedConfig { mcp, source })
}

/// Pick the config file to use. Explicit paths must exist.
pub fn locate(paths: &SearchPaths) -> Result<ConfigSource, ConfigError> {
    if let Some(path) = &paths.flag {
        return existing(path).map(ConfigSource::Flag);
    }
    if let Some(path) = &paths.env {
        return existing(path).map(ConfigSource::Env);
    }

    let project = paths.cwd.join(PROJECT_FILE);
    if project.is_file() {
        return Ok(ConfigSource::Project(project));
    }
    let global = paths.config_dir.join(GLOBAL_FILE);
    if global.is_file() {
        return Ok(ConfigSource::Global(global));
    }
    Ok(ConfigSource::Default)
}

fn existing(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(ConfigError::NotFound {
            path: path.display().to_string(),
        })
    }
}

/// Read and parse one config file; the format follows the extension.
///
/// The returned config's `base_dir` is the file's directory.
pub fn load_file(path: &Path) -> Result<McpConfig, ConfigError> {
    let display = path.display().to_string();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;

    let mut config: McpConfig = match extension.as_deref() {
        Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: display.clone(),
            message: e.to_string(),
        })?,
        Some("toml") => toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: display.clone(),
            message: e.to_string(),
        })?,
        _ => return Err(ConfigError::UnsupportedFormat { path: display }),
    };

    config.base_dir = std::path::absolute(path)
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));
    Ok(config)
}

/// Override the request timeout of every configured server.
pub fn apply_timeout(config: &mut McpConfig, timeout_ms: u64) {
    for server in config.servers.values_mut() {
        server.timeout_ms = timeout_ms;
    }
}

fn env_timeout() -> Result<Option<u64>, ConfigError> {
    match std::env::var(TIMEOUT_ENV) {
        Ok(value) if !value.trim().is_empty() => parse_timeout(&value).map(Some),
        _ => Ok(None),
    }
}

fn parse_timeout(value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key: TIMEOUT_ENV.into(),
            message: "must be greater than zero".into(),
        }),
        Ok(ms) => Ok(ms),
        Err(e) => Err(ConfigError::InvalidValue {
            key: TIMEOUT_ENV.into(),
            message: e.to_string(),
        }),
    }
}

/// Get the toolhub config directory path (~/.toolhub/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolhub")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const TOML: &str = r#"
[servers.filesystem]
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem"]
"#;

    const JSON: &str = r#"{"mcpServers": {"github": {"command": "npx", "timeoutMs": 60000}}}"#;

    struct Dirs {
        _root: TempDir,
        cwd: PathBuf,
        config_dir: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempfile::tempdir().unwrap();
        let cwd = root.path().join("project");
        let config_dir = root.path().join("home");
        fs::create_dir_all(&cwd).unwrap();
        fs::create_dir_all(&config_dir).unwrap();
        Dirs {
            _root: root,
            cwd,
            config_dir,
        }
    }

    fn paths(dirs: &Dirs) -> SearchPaths {
        SearchPaths {
            flag: None,
            env: None,
            cwd: dirs.cwd.clone(),
            config_dir: dirs.config_dir.clone(),
        }
    }

    #[test]
    fn nothing_found_yields_empty_config() {
        let dirs = dirs();
        let loaded = load_from(&paths(&dirs), None).unwrap();
        assert_eq!(loaded.source, ConfigSource::Default);
        assert!(loaded.mcp.servers.is_empty());
    }

    #[test]
    fn project_file_beats_global_file() {
        let dirs = dirs();
        fs::write(dirs.cwd.join(PROJECT_FILE), JSON).unwrap();
        fs::write(dirs.config_dir.join(GLOBAL_FILE), TOML).unwrap();

        let loaded = load_from(&paths(&dirs), None).unwrap();
        assert!(matches!(loaded.source, ConfigSource::Project(_)));
        assert!(loaded.mcp.servers.contains_key("github"));
    }

    #[test]
    fn global_file_used_when_no_project_file() {
        let dirs = dirs();
        fs::write(dirs.config_dir.join(GLOBAL_FILE), TOML).unwrap();

        let loaded = load_from(&paths(&dirs), None).unwrap();
        assert!(matches!(loaded.source, ConfigSource::Global(_)));
        assert_eq!(loaded.mcp.servers["filesystem"].command, "npx");
        assert_eq!(loaded.mcp.base_dir.as_deref(), Some(dirs.config_dir.as_path()));
    }

    #[test]
    fn flag_beats_env_and_files() {
        let dirs = dirs();
        let flagged = dirs.cwd.join("flagged.toml");
        let from_env = dirs.cwd.join("env.json");
        fs::write(&flagged, TOML).unwrap();
        fs::write(&from_env, JSON).unwrap();
        fs::write(dirs.cwd.join(PROJECT_FILE), JSON).unwrap();

        let mut search = paths(&dirs);
        search.flag = Some(flagged.clone());
        search.env = Some(from_env.clone());
        assert_eq!(locate(&search).unwrap(), ConfigSource::Flag(flagged));

        search.flag = None;
        assert_eq!(locate(&search).unwrap(), ConfigSource::Env(from_env));
    }

    #[test]
    fn explicit_path_must_exist() {
        let dirs = dirs();
        let mut search = paths(&dirs);
        search.env = Some(dirs.cwd.join("missing.toml"));
        assert!(matches!(locate(&search), Err(ConfigError::NotFound { .. })));

        search.flag = Some(dirs.cwd.join("also-missing.json"));
        assert!(matches!(locate(&search), Err(ConfigError::NotFound { .. })));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dirs = dirs();
        let path = dirs.cwd.join("servers.yaml");
        fs::write(&path, "servers: {}").unwrap();
        assert!(matches!(
            load_file(&path),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn parse_error_names_the_file() {
        let dirs = dirs();
        let path = dirs.cwd.join("broken.toml");
        fs::write(&path, "[servers.x\ncommand = ").unwrap();
        match load_file(&path) {
            Err(ConfigError::Parse { path: reported, .. }) => {
                assert!(reported.ends_with("broken.toml"));
            }
            other => panic!("Expected Parse error, got: {other:?}"),
        }
    }

    #[test]
    fn timeout_override_applies_to_every_server() {
        let dirs = dirs();
        fs::write(dirs.cwd.join(PROJECT_FILE), JSON).unwrap();
        let loaded = load_from(&paths(&dirs), Some(1500)).unwrap();
        assert_eq!(loaded.mcp.servers["github"].timeout_ms, 1500);

        let loaded = load_from(&paths(&dirs), None).unwrap();
        assert_eq!(loaded.mcp.servers["github"].timeout_ms, 60000);
    }

    #[test]
    fn project_file_keeps_server_declaration_order() {
        let dirs = dirs();
        let json = r#"{"mcpServers": {
            "zeta": {"command": "zeta-server"},
            "alpha": {"command": "alpha-server"}
        }}"#;
        fs::write(dirs.cwd.join(PROJECT_FILE), json).unwrap();

        let loaded = load_from(&paths(&dirs), None).unwrap();
        let names: Vec<&str> = loaded.mcp.servers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn zero_timeout_in_file_is_a_parse_error() {
        let dirs = dirs();
        let path = dirs.cwd.join("zero.toml");
        fs::write(&path, "[servers.x]\ncommand = \"x\"\ntimeout_ms = 0\n").unwrap();
        assert!(matches!(load_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn timeout_values_are_validated() {
        assert_eq!(parse_timeout(" 2500 ").unwrap(), 2500);
        assert!(matches!(
            parse_timeout("0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_timeout("soon"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
