// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node roles and queue relationships.
//!
//! ```text
//!            ┌────────┐
//!            │  root  │  capture + tick, emits queue "orders"
//!            └───┬────┘
//!        ┌───────┴────────┐
//!   ┌────▼───┐       ┌────▼───┐
//!   │ branch │       │  leaf  │   branch re-emits "orders" locally
//!   └────┬───┘       └────────┘
//!   ┌────▼──────┐
//!   │ merge-leaf│ ◄── also consumes "orders_eu" (combined_set)
//!   └───────────┘
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};

/// Role of a node in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// No provider; captures changes and emits its queue.
    Root,
    /// Consumes a provider queue and re-emits it locally.
    Branch,
    /// Consumes a provider queue and applies only.
    Leaf,
    /// Leaf fed by more than one provider queue into shared tables.
    MergeLeaf,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Branch => write!(f, "branch"),
            Self::Leaf => write!(f, "leaf"),
            Self::MergeLeaf => write!(f, "merge-leaf"),
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "root" => Ok(Self::Root),
            "branch" => Ok(Self::Branch),
            "leaf" => Ok(Self::Leaf),
            "merge-leaf" => Ok(Self::MergeLeaf),
            other => Err(ReplicationError::Config(format!("unknown node type: {}", other))),
        }
    }
}

/// This node's role and relationships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_name: String,
    pub node_type: NodeType,
    /// Queue this node consumes (or emits, for a root).
    pub queue_name: String,
    /// Node providing `queue_name`; `None` only for a root.
    #[serde(default)]
    pub provider_node: Option<String>,
    /// Additional queues merged into this node's tables.
    #[serde(default)]
    pub combined_set: Vec<String>,
    /// Consumer group on the provider queues. Nodes sharing a worker name
    /// are takeover candidates: only one of them applies at a time.
    /// Defaults to `node_name`.
    #[serde(default)]
    pub worker_name: Option<String>,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            node_name: "local.dev.node.default".to_string(),
            node_type: NodeType::Leaf,
            queue_name: "default".to_string(),
            provider_node: None,
            combined_set: Vec::new(),
            worker_name: None,
        }
    }
}

impl NodeInfo {
    pub fn root(node_name: &str, queue_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            node_type: NodeType::Root,
            queue_name: queue_name.to_string(),
            ..Default::default()
        }
    }

    pub fn branch(node_name: &str, queue_name: &str, provider: &str) -> Self {
        Self {
            node_type: NodeType::Branch,
            ..Self::leaf(node_name, queue_name, provider)
        }
    }

    pub fn leaf(node_name: &str, queue_name: &str, provider: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            node_type: NodeType::Leaf,
            queue_name: queue_name.to_string(),
            provider_node: Some(provider.to_string()),
            ..Default::default()
        }
    }

    pub fn merge_leaf(node_name: &str, queue_name: &str, provider: &str, combined: &[&str]) -> Self {
        Self {
            node_type: NodeType::MergeLeaf,
            combined_set: combined.iter().map(|q| q.to_string()).collect(),
            ..Self::leaf(node_name, queue_name, provider)
        }
    }

    /// Name this node registers under on provider queues.
    pub fn consumer_name(&self) -> &str {
        &self.node_name
    }

    /// Group whose single active member applies the queue.
    pub fn group_name(&self) -> &str {
        self.worker_name.as_deref().unwrap_or(&self.node_name)
    }

    /// Queues this node runs a playback loop for.
    pub fn consumed_queues(&self) -> Vec<String> {
        match self.node_type {
            NodeType::Root => Vec::new(),
            NodeType::Branch | NodeType::Leaf => vec![self.queue_name.clone()],
            NodeType::MergeLeaf => {
                let mut queues = vec![self.queue_name.clone()];
                for q in &self.combined_set {
                    if !queues.contains(q) {
                        queues.push(q.clone());
                    }
                }
                queues
            }
        }
    }

    /// Whether applied batches are re-emitted into the local queue.
    pub fn reemits(&self) -> bool {
        self.node_type == NodeType::Branch
    }

    /// Whether EXECUTE events run on this node.
    pub fn allows_execute(&self, execute_on_merge: bool) -> bool {
        match self.node_type {
            NodeType::MergeLeaf => execute_on_merge,
            _ => true,
        }
    }

    /// Check the relationships are consistent for this role.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(ReplicationError::Config("node_name is empty".to_string()));
        }
        if self.queue_name.is_empty() {
            return Err(ReplicationError::Config("queue_name is empty".to_string()));
        }
        match self.node_type {
            NodeType::Root => {
                if self.provider_node.is_some() {
                    return Err(ReplicationError::Topology(format!(
                        "root {} cannot have a provider",
                        self.node_name
                    )));
                }
                if !self.combined_set.is_empty() {
                    return Err(ReplicationError::Topology(format!(
                        "root {} cannot merge queues",
                        self.node_name
                    )));
                }
            }
            NodeType::Branch | NodeType::Leaf | NodeType::MergeLeaf => {
                if self.provider_node.is_none() {
                    return Err(ReplicationError::Topology(format!(
                        "{} {} has no provider",
                        self.node_type, self.node_name
                    )));
                }
            }
        }
        if self.node_type != NodeType::MergeLeaf && !self.combined_set.is_empty() {
            return Err(ReplicationError::Topology(format!(
                "only merge-leaf nodes combine queues, {} is a {}",
                self.node_name, self.node_type
            )));
        }
        if self.node_type == NodeType::MergeLeaf && self.combined_set.is_empty() {
            return Err(ReplicationError::Topology(format!(
                "merge-leaf {} has an empty combined_set",
                self.node_name
            )));
        }
        Ok(())
    }
}
