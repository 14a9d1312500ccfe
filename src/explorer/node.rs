//! Tree node types for the object explorer.

use std::sync::Arc;

use serde::Serialize;

use crate::backend::NodeInfo;

/// A node in a browse session's tree.
///
/// Nodes are values; the cache owns the authoritative copy keyed by path. The
/// generation stamp tells whether a node handed out earlier has since been
/// replaced by a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    /// Browse session the node belongs to.
    pub session_id: String,

    /// Path of the node, unique within its session.
    pub path: String,

    /// Display label.
    pub label: String,

    /// Kind of object, e.g. "Schema", "Table", "Column".
    pub node_type: String,

    /// Whether the node can never have children.
    pub is_leaf: bool,

    /// Path of the parent node; `None` for the session root.
    pub parent_path: Option<String>,

    /// Cache generation the node was created in.
    pub generation: u64,
}

impl TreeNode {
    pub(crate) fn from_info(
        info: NodeInfo,
        session_id: &str,
        parent_path: Option<&str>,
        generation: u64,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            path: info.path,
            label: info.label,
            node_type: info.node_type,
            is_leaf: info.is_leaf,
            parent_path: parent_path.map(str::to_string),
            generation,
        }
    }

    /// Returns true for the session root.
    pub fn is_root(&self) -> bool {
        self.parent_path.is_none()
    }
}

/// Result of expanding or refreshing a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// The node's children, shared with the cache.
    Children(Arc<[TreeNode]>),
    /// The node is a leaf and was not sent to the backend.
    Leaf,
    /// The node can have children but currently has none.
    Empty,
    /// The backend could not expand the node. Not cached.
    Error(String),
}

impl Expansion {
    /// Returns the children, or an empty slice for every other outcome.
    pub fn children(&self) -> &[TreeNode] {
        match self {
            Self::Children(children) => children,
            _ => &[],
        }
    }

    /// Returns true if the expansion failed.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub(crate) fn from_cached(children: &Arc<[TreeNode]>) -> Self {
        if children.is_empty() {
            Self::Empty
        } else {
            Self::Children(Arc::clone(children))
        }
    }
}
