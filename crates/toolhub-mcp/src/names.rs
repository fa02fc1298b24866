//! Server and tool name types.
//!
//! A tool is addressed externally as `server.tool`. The split happens once,
//! at the boundary, in [`QualifiedToolName::from_str`]; everything past that
//! point carries the two parts separately.

use crate::error::McpError;
use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Separator between the server and tool parts of a qualified name.
pub const NAME_SEPARATOR: char = '.';

/// Name of a configured MCP server. Never contains [`NAME_SEPARATOR`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ServerName(String);

impl ServerName {
    pub fn new(name: impl Into<String>) -> Result<Self, McpError> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("must not be empty")
        } else if name.contains(NAME_SEPARATOR) {
            Some("must not contain '.'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(McpError::InvalidName {
                kind: "server",
                name,
                reason,
            }),
            None => Ok(Self(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Name of a tool as reported by its server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ToolName(String);

impl ToolName {
    pub fn new(name: impl Into<String>) -> Result<Self, McpError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(McpError::InvalidName {
                kind: "tool",
                name,
                reason: "must not be empty",
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A fully qualified `server.tool` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedToolName {
    pub server: ServerName,
    pub tool: ToolName,
}

impl QualifiedToolName {
    pub fn new(server: ServerName, tool: ToolName) -> Self {
        Self { server, tool }
    }
}

impl FromStr for QualifiedToolName {
    type Err = McpError;

    /// Split on the first separator: the server part never contains one,
    /// the tool part may.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (server, tool) = s
            .split_once(NAME_SEPARATOR)
            .ok_or_else(|| McpError::InvalidName {
                kind: "qualified tool",
                name: s.to_string(),
                reason: "expected 'server.tool'",
            })?;
        Ok(Self {
            server: ServerName::new(server)?,
            tool: ToolName::new(tool)?,
        })
    }
}

macro_rules! string_name_impls {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_name_impls!(ServerName);
string_name_impls!(ToolName);

impl fmt::Display for QualifiedToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.server, NAME_SEPARATOR, self.tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_rejects_separator() {
        let err = ServerName::new("my.server").unwrap_err();
        assert!(matches!(err, McpError::InvalidName { kind: "server", .. }));
    }

    #[test]
    fn server_name_rejects_only_empty_and_separator() {
        assert!(ServerName::new("").is_err());
        assert_eq!(ServerName::new("github").unwrap().as_str(), "github");
        assert_eq!(ServerName::new("my server").unwrap().as_str(), "my server");

        let name: QualifiedToolName = "my server.search".parse().unwrap();
        assert_eq!(name.server.as_str(), "my server");
    }

    #[test]
    fn qualified_name_splits_on_first_separator() {
        let name: QualifiedToolName = "fs.read.file".parse().unwrap();
        assert_eq!(name.server.as_str(), "fs");
        assert_eq!(name.tool.as_str(), "read.file");
        assert_eq!(name.to_string(), "fs.read.file");
    }

    #[test]
    fn qualified_name_requires_separator() {
        assert!("ping".parse::<QualifiedToolName>().is_err());
        assert!(".ping".parse::<QualifiedToolName>().is_err());
        assert!("echo.".parse::<QualifiedToolName>().is_err());
    }

    #[test]
    fn names_serialize_as_plain_strings() {
        let name = ToolName::new("read_file").unwrap();
        assert_eq!(serde_json::to_value(&name).unwrap(), "read_file");
    }
}
