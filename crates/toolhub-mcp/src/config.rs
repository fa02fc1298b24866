//! Configuration types for MCP servers.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_timeout() -> u64 {
    30000
}

fn nonzero_ms<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match u64::deserialize(deserializer)? {
        0 => Err(serde::de::Error::custom("timeout must be greater than zero")),
        ms => Ok(ms),
    }
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_event_capacity() -> usize {
    256
}

/// Top-level MCP configuration.
///
/// Servers keep the order they are declared in. Bare tool-name lookup
/// prefers the earliest declared server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default, alias = "mcpServers")]
    pub servers: IndexMap<String, McpServerConfig>,
    #[serde(default)]
    pub settings: HubSettings,
    /// Directory of the file this configuration was read from.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the server process. Values may
    /// contain `${VAR}` placeholders.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Skip this server entirely.
    #[serde(default)]
    pub disabled: bool,
    /// Working directory override. Relative paths resolve against the
    /// config file's directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Run the server from the config file's directory.
    #[serde(default)]
    pub local: bool,
    /// Timeout for requests in milliseconds (default: 30000).
    #[serde(
        default = "default_timeout",
        deserialize_with = "nonzero_ms",
        alias = "timeoutMs"
    )]
    pub timeout_ms: u64,
    /// Timeout for the initialize + tools/list handshake (default: 30000).
    #[serde(
        default = "default_timeout",
        deserialize_with = "nonzero_ms",
        alias = "startupTimeoutMs"
    )]
    pub startup_timeout_ms: u64,
}

impl McpServerConfig {
    /// A config running `command` with defaults for everything else.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            disabled: false,
            cwd: None,
            local: false,
            timeout_ms: default_timeout(),
            startup_timeout_ms: default_timeout(),
        }
    }

    /// Working directory for the process, if one applies.
    pub fn working_dir(&self, base_dir: Option<&Path>) -> Option<PathBuf> {
        match (&self.cwd, base_dir) {
            (Some(cwd), Some(base)) if cwd.is_relative() => Some(base.join(cwd)),
            (Some(cwd), _) => Some(cwd.clone()),
            (None, Some(base)) if self.local => Some(base.to_path_buf()),
            (None, _) => None,
        }
    }
}

/// Hub-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// How long a server gets to exit after its stdin closes before it is killed.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Largest single line accepted from a server.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Buffer size of the event feed.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace(),
            max_frame_bytes: default_max_frame_bytes(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Replace `${NAME}` placeholders using the parent process environment.
pub fn substitute_env(value: &str) -> String {
    substitute_with(value, |name| std::env::var(name).ok())
}

/// Replace `${NAME}` and `${NAME:-default}` placeholders using `lookup`.
///
/// An unset or empty variable leaves `${NAME}` untouched; with a default,
/// the default is used instead. An unterminated `${` is copied as-is.
pub fn substitute_with<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let token = &after[..end];
        let (name, default) = match token.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (token, None),
        };

        match (lookup(name).filter(|v| !v.is_empty()), default) {
            (Some(resolved), _) => out.push_str(&resolved),
            (None, Some(default)) => out.push_str(default),
            (None, None) => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Resolve placeholders in every value of an environment map.
pub fn resolve_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(key, value)| (key.clone(), substitute_env(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "TOKEN" => Some("ghp_xxxx".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[test]
    fn parse_single_server() {
        let toml_str = r#"
[servers.filesystem]
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/home/user"]
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.servers.len(), 1);
        let fs = &config.servers["filesystem"];
        assert_eq!(fs.command, "npx");
        assert_eq!(fs.args.len(), 3);
        assert_eq!(fs.timeout_ms, 30000); // default
        assert!(!fs.disabled);
        assert_eq!(config.settings.shutdown_grace_ms, 2000);
    }

    #[test]
    fn parse_mcp_json_layout() {
        let json = r#"{
            "mcpServers": {
                "github": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-github"],
                    "env": {"GITHUB_TOKEN": "${GITHUB_PERSONAL_ACCESS_TOKEN}"},
                    "timeoutMs": 60000
                },
                "memory": {"command": "memory-server", "disabled": true}
            }
        }"#;
        let config: McpConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers["github"].timeout_ms, 60000);
        assert!(config.servers["memory"].disabled);
        assert_eq!(
            config.servers["github"].env["GITHUB_TOKEN"],
            "${GITHUB_PERSONAL_ACCESS_TOKEN}"
        );
    }

    #[test]
    fn servers_keep_declaration_order() {
        let toml_str = r#"
[servers.zeta]
command = "z"

[servers.alpha]
command = "a"
"#;
        let config: McpConfig = toml::from_str(toml_str).unwrap();
        let names: Vec<&str> = config.servers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);

        let json = r#"{"mcpServers": {"zeta": {"command": "z"}, "alpha": {"command": "a"}}}"#;
        let config: McpConfig = serde_json::from_str(json).unwrap();
        let names: Vec<&str> = config.servers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let toml_str = r#"
[servers.x]
command = "x"
timeout_ms = 0
"#;
        let err = toml::from_str::<McpConfig>(toml_str).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        let json = r#"{"mcpServers": {"x": {"command": "x", "startupTimeoutMs": 0}}}"#;
        assert!(serde_json::from_str::<McpConfig>(json).is_err());

        let json = r#"{"mcpServers": {"x": {"command": "x", "timeoutMs": 1}}}"#;
        let config: McpConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.servers["x"].timeout_ms, 1);
    }

    #[test]
    fn default_config_is_empty() {
        let config = McpConfig::default();
        assert!(config.servers.is_empty());
        assert_eq!(config.settings.max_frame_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn substitute_known_variable() {
        assert_eq!(substitute_with("Bearer ${TOKEN}", lookup), "Bearer ghp_xxxx");
    }

    #[test]
    fn substitute_leaves_unknown_and_empty_untouched() {
        assert_eq!(substitute_with("${MISSING}", lookup), "${MISSING}");
        assert_eq!(substitute_with("x${EMPTY}y", lookup), "x${EMPTY}y");
    }

    #[test]
    fn substitute_uses_default_when_unset() {
        assert_eq!(
            substitute_with("${NODE_ENV:-development}", lookup),
            "development"
        );
        assert_eq!(substitute_with("${TOKEN:-fallback}", lookup), "ghp_xxxx");
    }

    #[test]
    fn substitute_handles_multiple_and_unterminated() {
        assert_eq!(
            substitute_with("${TOKEN}/${MISSING}/${TOKEN}", lookup),
            "ghp_xxxx/${MISSING}/ghp_xxxx"
        );
        assert_eq!(substitute_with("abc ${TOKEN", lookup), "abc ${TOKEN");
        assert_eq!(substitute_with("no placeholders", lookup), "no placeholders");
    }

    #[test]
    fn working_dir_resolution() {
        let base = Path::new("/srv/hub");
        let mut config = McpServerConfig::new("server");
        assert_eq!(config.working_dir(Some(base)), None);

        config.local = true;
        assert_eq!(config.working_dir(Some(base)), Some(base.to_path_buf()));

        config.cwd = Some(PathBuf::from("tools"));
        assert_eq!(config.working_dir(Some(base)), Some(base.join("tools")));

        config.cwd = Some(PathBuf::from("/opt/tools"));
        assert_eq!(config.working_dir(Some(base)), Some(PathBuf::from("/opt/tools")));
        assert_eq!(config.working_dir(None), Some(PathBuf::from("/opt/tools")));
    }
}
