//! Cluster description — the machines a run fans out across.
//!
//! A cluster descriptor is a YAML file listing worker nodes by SSH
//! coordinates, optionally pinning a node's logical core count (skipping
//! discovery) and reserving cores that scheduling must not use. Structural
//! validation here is all-or-nothing: a single bad node aborts the run.

pub mod probe;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ClusterNode
// ---------------------------------------------------------------------------

/// One worker machine, identified by SSH coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterNode {
    /// Short name used in logs, filters, and worker identities.
    /// Defaults to the host when omitted.
    #[serde(default)]
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH user.
    pub user: String,
    /// Logical core count, if known statically (skips remote discovery).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_cores: Option<u32>,
    /// Per-node override of the global reserved-core count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unused_cores: Option<u32>,
}

fn default_port() -> u16 {
    22
}

impl ClusterNode {
    /// Build the `user@host` string used in ssh/scp commands.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Build base SSH arguments (port, options, user@host) without a command.
    pub fn ssh_base_args(&self, connect_timeout_secs: u64) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout_secs),
            self.user_at_host(),
        ]
    }

    /// Build base scp arguments (recursive, port, options) without paths.
    pub fn scp_base_args(&self, connect_timeout_secs: u64) -> Vec<String> {
        vec![
            "-r".to_string(),
            "-q".to_string(),
            "-P".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout_secs),
        ]
    }

    /// Structural validation of the identity fields.
    fn validate(&self, index: usize) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("node {}: empty host", index + 1));
        }
        if self.user.trim().is_empty() {
            return Err(format!("node '{}': empty user", self.name));
        }
        if self.port == 0 {
            return Err(format!("node '{}': port must be non-zero", self.name));
        }
        if let (Some(unused), Some(logical)) = (self.unused_cores, self.logical_cores) {
            if unused > logical {
                return Err(format!(
                    "node '{}': unused_cores {} exceeds logical_cores {}",
                    self.name, unused, logical
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Descriptor loading
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ClusterFile {
    nodes: Vec<ClusterNode>,
}

/// Parse a cluster descriptor from YAML. Node order is preserved.
pub fn parse(content: &str) -> Result<Vec<ClusterNode>, String> {
    let file: ClusterFile =
        serde_yaml::from_str(content).map_err(|e| e.to_string())?;
    let mut nodes = file.nodes;
    if nodes.is_empty() {
        return Err("descriptor lists no nodes".into());
    }
    for (i, node) in nodes.iter_mut().enumerate() {
        if node.name.trim().is_empty() {
            node.name = node.host.clone();
        }
        node.validate(i)?;
    }
    for (i, node) in nodes.iter().enumerate() {
        if nodes[..i].iter().any(|n| n.name == node.name) {
            return Err(format!("duplicate node name '{}'", node.name));
        }
    }
    Ok(nodes)
}

/// Load and parse a cluster descriptor file.
pub fn load(path: &std::path::Path) -> Result<Vec<ClusterNode>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    parse(&content)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
