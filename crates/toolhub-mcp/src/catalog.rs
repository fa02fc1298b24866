//! Versioned registry of the tools each server exposes.
//!
//! A server's tool set is replaced wholesale by [`ToolCatalog::set_tools`],
//! which publishes a new version. Descriptors are shared immutable `Arc`s,
//! so a caller holding one keeps a consistent view while the entry is
//! swapped underneath it.

use crate::names::{QualifiedToolName, ServerName, ToolName};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A tool as described by its server.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: ToolName,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Catalog entry as exposed to callers of `list_tools`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub server: ServerName,
    pub name: ToolName,
    pub full_name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub version: u64,
}

#[derive(Debug)]
struct ServerTools {
    version: u64,
    tools: HashMap<ToolName, Arc<ToolDescriptor>>,
}

/// Tool descriptors for every connected server.
///
/// Each server gets a rank the first time it is registered. Bare-name
/// lookups walk servers by rank, so the first registered server wins no
/// matter which handshake finished first.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    servers: BTreeMap<ServerName, ServerTools>,
    ranks: HashMap<ServerName, usize>,
    last_version: u64,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a lookup rank for `server`. Ranks follow call order and are
    /// kept for the catalog's lifetime; registering twice is a no-op.
    pub fn register_server(&mut self, server: &ServerName) -> usize {
        let next = self.ranks.len();
        *self.ranks.entry(server.clone()).or_insert(next)
    }

    pub fn rank(&self, server: &str) -> Option<usize> {
        self.ranks.get(server).copied()
    }

    /// Servers with a tool set, in rank order.
    fn ranked(&self) -> Vec<(&ServerName, &ServerTools)> {
        let mut ranked: Vec<_> = self.servers.iter().collect();
        ranked.sort_by_key(|(server, _)| self.rank(server.as_str()).unwrap_or(usize::MAX));
        ranked
    }

    /// Replace the tool set of `server`. Returns the new version.
    ///
    /// Duplicate names within one list keep the first occurrence. A server
    /// that was never registered is registered now.
    pub fn set_tools(&mut self, server: &ServerName, tools: Vec<ToolDescriptor>) -> u64 {
        self.register_server(server);
        self.last_version += 1;
        let version = self.last_version;

        let mut map = HashMap::with_capacity(tools.len());
        for tool in tools {
            if map.contains_key(&tool.name) {
                tracing::warn!(server = %server, tool = %tool.name, "Ignoring duplicate tool name");
                continue;
            }
            map.insert(tool.name.clone(), Arc::new(tool));
        }

        tracing::debug!(server = %server, version, tools = map.len(), "Published tool set");
        self.servers
            .insert(server.clone(), ServerTools { version, tools: map });
        version
    }

    pub fn get(&self, server: &str, tool: &str) -> Option<Arc<ToolDescriptor>> {
        self.servers.get(server)?.tools.get(tool).cloned()
    }

    pub fn version(&self, server: &str) -> Option<u64> {
        self.servers.get(server).map(|entry| entry.version)
    }

    pub fn tool_count(&self, server: &str) -> usize {
        self.servers.get(server).map_or(0, |entry| entry.tools.len())
    }

    pub fn contains_server(&self, server: &str) -> bool {
        self.servers.contains_key(server)
    }

    /// Drop a server's tools. Returns whether it had any entry.
    pub fn remove_server(&mut self, server: &str) -> bool {
        self.servers.remove(server).is_some()
    }

    pub fn clear(&mut self) {
        self.servers.clear();
    }

    /// Every tool, tagged with its server, sorted by server then tool name.
    pub fn all_tools(&self) -> Vec<ToolInfo> {
        let mut all = Vec::new();
        for (server, entry) in &self.servers {
            let mut tools: Vec<&Arc<ToolDescriptor>> = entry.tools.values().collect();
            tools.sort_by(|a, b| a.name.cmp(&b.name));
            for tool in tools {
                let qualified = QualifiedToolName::new(server.clone(), tool.name.clone());
                all.push(ToolInfo {
                    server: server.clone(),
                    name: tool.name.clone(),
                    full_name: qualified.to_string(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    version: entry.version,
                });
            }
        }
        all
    }

    /// Find a tool by bare name. The first server in registration order wins.
    pub fn find(&self, tool: &str) -> Option<(ServerName, Arc<ToolDescriptor>)> {
        self.ranked().into_iter().find_map(|(server, entry)| {
            entry
                .tools
                .get(tool)
                .map(|descriptor| (server.clone(), Arc::clone(descriptor)))
        })
    }

    /// Resolve `server.tool` or a bare `tool`.
    ///
    /// A name containing a separator is tried as qualified first; if that
    /// misses, the whole string is looked up as a bare name, since tool
    /// names themselves may contain the separator.
    pub fn resolve(&self, name: &str) -> Option<(ServerName, Arc<ToolDescriptor>)> {
        if let Ok(qualified) = name.parse::<QualifiedToolName>() {
            if let Some(descriptor) = self.get(qualified.server.as_str(), qualified.tool.as_str()) {
                return Some((qualified.server, descriptor));
            }
        }
        self.find(name)
    }

    /// Servers that expose a tool with this bare name, in registration order.
    pub fn servers_with(&self, tool: &str) -> Vec<ServerName> {
        self.ranked()
            .into_iter()
            .filter(|(_, entry)| entry.tools.contains_key(tool))
            .map(|(server, _)| server.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server(name: &str) -> ServerName {
        ServerName::new(name).unwrap()
    }

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: ToolName::new(name).unwrap(),
            description: format!("{name} tool"),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn set_and_get() {
        let mut catalog = ToolCatalog::new();
        catalog.set_tools(&server("fs"), vec![tool("read"), tool("write")]);
        assert_eq!(catalog.get("fs", "read").unwrap().description, "read tool");
        assert!(catalog.get("fs", "delete").is_none());
        assert!(catalog.get("other", "read").is_none());
        assert_eq!(catalog.tool_count("fs"), 2);
    }

    #[test]
    fn versions_increase_across_servers() {
        let mut catalog = ToolCatalog::new();
        let v1 = catalog.set_tools(&server("a"), vec![tool("x")]);
        let v2 = catalog.set_tools(&server("b"), vec![tool("y")]);
        let v3 = catalog.set_tools(&server("a"), vec![tool("z")]);
        assert!(v1 < v2 && v2 < v3);
        assert_eq!(catalog.version("a"), Some(v3));
        assert_eq!(catalog.version("b"), Some(v2));
    }

    #[test]
    fn replacing_tools_leaves_held_descriptors_intact() {
        let mut catalog = ToolCatalog::new();
        catalog.set_tools(&server("a"), vec![tool("x")]);
        let held = catalog.get("a", "x").unwrap();

        let mut changed = tool("x");
        changed.description = "new".into();
        catalog.set_tools(&server("a"), vec![changed]);

        assert_eq!(held.description, "x tool");
        assert_eq!(catalog.get("a", "x").unwrap().description, "new");
    }

    #[test]
    fn duplicate_names_keep_first() {
        let mut catalog = ToolCatalog::new();
        let mut second = tool("x");
        second.description = "second".into();
        catalog.set_tools(&server("a"), vec![tool("x"), second]);
        assert_eq!(catalog.tool_count("a"), 1);
        assert_eq!(catalog.get("a", "x").unwrap().description, "x tool");
    }

    #[test]
    fn all_tools_is_sorted_and_tagged() {
        let mut catalog = ToolCatalog::new();
        catalog.set_tools(&server("zeta"), vec![tool("b"), tool("a")]);
        catalog.set_tools(&server("alpha"), vec![tool("c")]);

        let names: Vec<String> = catalog.all_tools().into_iter().map(|t| t.full_name).collect();
        assert_eq!(names, vec!["alpha.c", "zeta.a", "zeta.b"]);
    }

    #[test]
    fn tool_info_serializes_camel_case() {
        let mut catalog = ToolCatalog::new();
        catalog.set_tools(&server("fs"), vec![tool("read")]);
        let json = serde_json::to_value(&catalog.all_tools()[0]).unwrap();
        assert_eq!(json["server"], "fs");
        assert_eq!(json["fullName"], "fs.read");
        assert_eq!(json["inputSchema"]["type"], "object");
    }

    #[test]
    fn bare_lookup_prefers_first_registered_server() {
        let mut catalog = ToolCatalog::new();
        catalog.set_tools(&server("beta"), vec![tool("search")]);
        catalog.set_tools(&server("alpha"), vec![tool("search")]);

        let (owner, _) = catalog.find("search").unwrap();
        assert_eq!(owner.as_str(), "beta");
        let owners: Vec<String> = catalog
            .servers_with("search")
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(owners, vec!["beta", "alpha"]);
    }

    #[test]
    fn rank_comes_from_registration_not_publication() {
        let mut catalog = ToolCatalog::new();
        assert_eq!(catalog.register_server(&server("zeta")), 0);
        assert_eq!(catalog.register_server(&server("alpha")), 1);
        assert_eq!(catalog.register_server(&server("zeta")), 0);

        // alpha's handshake finishes first.
        catalog.set_tools(&server("alpha"), vec![tool("search")]);
        catalog.set_tools(&server("zeta"), vec![tool("search")]);
        let (owner, _) = catalog.find("search").unwrap();
        assert_eq!(owner.as_str(), "zeta");

        // A refresh republishes zeta without moving it.
        catalog.set_tools(&server("zeta"), vec![tool("search")]);
        assert_eq!(catalog.find("search").unwrap().0.as_str(), "zeta");

        catalog.remove_server("zeta");
        assert_eq!(catalog.find("search").unwrap().0.as_str(), "alpha");
        assert_eq!(catalog.rank("zeta"), Some(0));
    }

    #[test]
    fn resolve_qualified_then_bare() {
        let mut catalog = ToolCatalog::new();
        catalog.set_tools(&server("alpha"), vec![tool("search")]);
        catalog.set_tools(&server("beta"), vec![tool("search"), tool("v1.fetch")]);

        let (owner, _) = catalog.resolve("beta.search").unwrap();
        assert_eq!(owner.as_str(), "beta");

        // alpha was registered first.
        let (owner, _) = catalog.resolve("search").unwrap();
        assert_eq!(owner.as_str(), "alpha");

        // No server called "v1", so the whole string is a bare tool name.
        let (owner, descriptor) = catalog.resolve("v1.fetch").unwrap();
        assert_eq!(owner.as_str(), "beta");
        assert_eq!(descriptor.name.as_str(), "v1.fetch");

        assert!(catalog.resolve("gamma.search").is_none());
    }

    #[test]
    fn remove_server_drops_its_tools() {
        let mut catalog = ToolCatalog::new();
        catalog.set_tools(&server("a"), vec![tool("x")]);
        assert!(catalog.remove_server("a"));
        assert!(!catalog.remove_server("a"));
        assert!(catalog.get("a", "x").is_none());
        assert!(catalog.all_tools().is_empty());
    }
}
