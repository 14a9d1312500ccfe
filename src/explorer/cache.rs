//! Per-session cache of expanded browse nodes.
//!
//! Each browse session keeps an arena of nodes keyed by path plus the
//! children list of every node expanded so far. Expanding a cached node hands
//! back the same shared list without a backend round trip. Refreshing a node
//! evicts its whole subtree and stamps the replacement children with a new
//! generation, so nodes handed out before the refresh can be detected as
//! stale with `is_current`.
//!
//! The cache is shared by reference. Its maps sit behind one lock that is
//! only held to look up or apply; backend round trips run without it, so a
//! slow expansion in one session never holds up another. Answers are checked
//! against the session again when they are applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::node::{Expansion, TreeNode};
use crate::backend::{with_deadline, BrowseBackend, NodeExpansion};
use crate::config::{ConnectionConfig, SessionSettings};
use crate::error::{Result, SessionError};

/// One open browse session.
struct TreeSession {
    provider_id: String,
    /// Id the provider knows the session by.
    backend_session_id: String,
    connection_key: String,
    root_path: String,
    /// Every node seen so far, keyed by path.
    nodes: HashMap<String, TreeNode>,
    /// Cached children of expanded nodes, keyed by parent path.
    children: HashMap<String, Arc<[TreeNode]>>,
}

impl TreeSession {
    fn node(&self, session_id: &str, path: &str) -> Result<&TreeNode> {
        self.nodes
            .get(path)
            .ok_or_else(|| SessionError::unknown_node(session_id, path))
    }

    /// Removes everything below `path` from the arena and the children cache.
    fn evict_subtree(&mut self, path: &str) {
        if let Some(children) = self.children.remove(path) {
            for child in children.iter() {
                self.evict_subtree(&child.path);
                self.nodes.remove(&child.path);
            }
        }
    }

    fn store_children(
        &mut self,
        session_id: &str,
        parent_path: &str,
        expansion: NodeExpansion,
        generation: u64,
    ) -> Arc<[TreeNode]> {
        let children: Arc<[TreeNode]> = expansion
            .children
            .into_iter()
            .map(|info| TreeNode::from_info(info, session_id, Some(parent_path), generation))
            .collect();

        for child in children.iter() {
            self.nodes.insert(child.path.clone(), child.clone());
        }
        self.children
            .insert(parent_path.to_string(), Arc::clone(&children));
        children
    }
}

#[derive(Default)]
struct CacheState {
    providers: HashMap<String, Arc<dyn BrowseBackend>>,
    /// Sessions keyed by `provider:backend id`.
    sessions: HashMap<String, TreeSession>,
    /// Connection key to the session most recently created for it.
    connections: HashMap<String, String>,
    generation: u64,
}

impl CacheState {
    fn provider(&self, provider_id: &str) -> Result<Arc<dyn BrowseBackend>> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| SessionError::invalid_provider(provider_id))
    }

    fn session(&self, session_id: &str) -> Result<&TreeSession> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| SessionError::unknown_session(session_id))
    }

    /// Removes a session and its connection mapping.
    fn remove_session(&mut self, session_id: &str) -> Option<TreeSession> {
        let session = self.sessions.remove(session_id)?;
        if self.connections.get(&session.connection_key).map(String::as_str) == Some(session_id) {
            self.connections.remove(&session.connection_key);
        }
        Some(session)
    }
}

/// Backend call prepared under the lock and run without it.
struct PendingCall {
    backend: Arc<dyn BrowseBackend>,
    backend_session_id: String,
}

/// Caches browse trees for any number of sessions across registered
/// providers.
pub struct TreeSessionCache {
    state: Mutex<CacheState>,
    deadline: Duration,
}

impl TreeSessionCache {
    /// Creates an empty cache with no providers.
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            deadline: settings.backend_timeout(),
        }
    }

    /// Registers a browse backend under a provider id, replacing any previous
    /// backend with the same id.
    pub fn register_provider(
        &self,
        provider_id: impl Into<String>,
        backend: Arc<dyn BrowseBackend>,
    ) {
        self.state().providers.insert(provider_id.into(), backend);
    }

    /// Opens a browse session and returns its root node.
    ///
    /// Concurrent creates for the same connection are not merged; the
    /// connection maps to the session created last.
    pub async fn create_session(
        &self,
        provider_id: &str,
        connection: &ConnectionConfig,
    ) -> Result<TreeNode> {
        let backend = self.state().provider(provider_id)?;
        let session = with_deadline(
            self.deadline,
            "create session",
            backend.create_session(connection),
        )
        .await?;

        let session_id = format!("{}:{}", provider_id, session.session_id);
        let connection_key = connection.key();

        let (root, replaced) = {
            let mut state = self.state();
            let root = TreeNode::from_info(session.root, &session_id, None, state.generation);
            let replaced = state.remove_session(&session_id);

            let mut nodes = HashMap::new();
            nodes.insert(root.path.clone(), root.clone());
            state.sessions.insert(
                session_id.clone(),
                TreeSession {
                    provider_id: provider_id.to_string(),
                    backend_session_id: session.session_id.clone(),
                    connection_key: connection_key.clone(),
                    root_path: root.path.clone(),
                    nodes,
                    children: HashMap::new(),
                },
            );
            state.connections.insert(connection_key.clone(), session_id.clone());
            (root, replaced)
        };
        info!(
            "Opened browse session {} for {} via {}",
            session_id, connection_key, provider_id
        );

        if let Some(old) = replaced {
            warn!(
                "Provider {} reused session id {}; dropped {} cached nodes of the older session",
                provider_id,
                session.session_id,
                old.nodes.len()
            );
        }

        Ok(root)
    }

    /// Returns a session's root node.
    pub fn root(&self, session_id: &str) -> Result<TreeNode> {
        let state = self.state();
        let session = state.session(session_id)?;
        session.node(session_id, &session.root_path).cloned()
    }

    /// Returns the current version of the node at `path`.
    pub fn node(&self, session_id: &str, path: &str) -> Result<TreeNode> {
        self.state()
            .session(session_id)?
            .node(session_id, path)
            .cloned()
    }

    /// Returns the current parent of a node, or `None` for the root.
    pub fn parent(&self, node: &TreeNode) -> Result<Option<TreeNode>> {
        match &node.parent_path {
            Some(parent) => self.node(&node.session_id, parent).map(Some),
            None => Ok(None),
        }
    }

    /// Lists a node's children, asking the backend only on first expansion.
    pub async fn expand_node(&self, session_id: &str, path: &str) -> Result<Expansion> {
        let call = {
            let state = self.state();
            let session = state.session(session_id)?;
            let node = session.node(session_id, path)?;
            if node.is_leaf {
                return Ok(Expansion::Leaf);
            }
            if let Some(children) = session.children.get(path) {
                debug!("Expansion of {} in {} served from cache", path, session_id);
                return Ok(Expansion::from_cached(children));
            }
            PendingCall {
                backend: state.provider(&session.provider_id)?,
                backend_session_id: session.backend_session_id.clone(),
            }
        };

        let result = with_deadline(
            self.deadline,
            "expand node",
            call.backend.expand_node(&call.backend_session_id, path),
        )
        .await;

        self.apply(session_id, path, result, "expand", false)
    }

    /// Re-lists a node's children from the backend, replacing the cached list
    /// and everything below it.
    ///
    /// On failure the previously cached children stay in place.
    pub async fn refresh_node(&self, session_id: &str, path: &str) -> Result<Expansion> {
        let call = {
            let state = self.state();
            let session = state.session(session_id)?;
            let node = session.node(session_id, path)?;
            if node.is_leaf {
                return Ok(Expansion::Leaf);
            }
            PendingCall {
                backend: state.provider(&session.provider_id)?,
                backend_session_id: session.backend_session_id.clone(),
            }
        };

        let result = with_deadline(
            self.deadline,
            "refresh node",
            call.backend.refresh_node(&call.backend_session_id, path),
        )
        .await;

        self.apply(session_id, path, result, "refresh", true)
    }

    /// Returns true if `node` has not been replaced by a refresh or removed
    /// with its session.
    pub fn is_current(&self, node: &TreeNode) -> bool {
        self.state()
            .sessions
            .get(&node.session_id)
            .and_then(|session| session.nodes.get(&node.path))
            .is_some_and(|current| current.generation == node.generation)
    }

    /// Returns the session most recently created for a connection.
    pub fn session_for(&self, connection: &ConnectionConfig) -> Option<String> {
        self.state().connections.get(&connection.key()).cloned()
    }

    /// Drops the session for a connection and closes it on the backend.
    ///
    /// Every node of the session becomes stale. Backend close errors are
    /// logged. Returns whether a session existed.
    pub async fn delete_session(&self, connection: &ConnectionConfig) -> bool {
        match self.session_for(connection) {
            Some(session_id) => self.close_session(&session_id).await,
            None => {
                debug!("No browse session for {}", connection.key());
                false
            }
        }
    }

    /// Drops a session by id and closes it on the backend.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let removed = self.state().remove_session(session_id);
        let Some(session) = removed else {
            return false;
        };
        info!(
            "Closing browse session {} ({} cached nodes)",
            session_id,
            session.nodes.len()
        );
        self.close_backend(session_id, &session).await;
        true
    }

    /// Returns the number of open sessions.
    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn close_backend(&self, session_id: &str, session: &TreeSession) {
        let backend = match self.state().provider(&session.provider_id) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Cannot close browse session {}: {}", session_id, e);
                return;
            }
        };
        if let Err(e) = with_deadline(
            self.deadline,
            "close session",
            backend.close_session(&session.backend_session_id),
        )
        .await
        {
            warn!("Failed to close browse session {}: {}", session_id, e);
        }
    }

    /// Stores a backend answer and converts it into an `Expansion`.
    ///
    /// The session and the node must still exist; an answer for a session
    /// closed or a node evicted in the meantime is dropped.
    fn apply(
        &self,
        session_id: &str,
        path: &str,
        result: Result<NodeExpansion>,
        operation: &str,
        replace: bool,
    ) -> Result<Expansion> {
        let expansion = match result {
            Ok(expansion) => expansion,
            Err(e) => {
                warn!("Failed to {} {} in {}: {}", operation, path, session_id, e);
                return Ok(Expansion::Error(e.to_string()));
            }
        };
        if let Some(message) = expansion.error_message {
            warn!("Backend could not {} {} in {}: {}", operation, path, session_id, message);
            return Ok(Expansion::Error(message));
        }

        let mut state = self.state();
        let generation = if replace {
            state.generation += 1;
            state.generation
        } else {
            state.generation
        };

        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::unknown_session(session_id))?;
        session.node(session_id, path)?;

        if !replace {
            if let Some(children) = session.children.get(path) {
                debug!("{} in {} was expanded concurrently", path, session_id);
                return Ok(Expansion::from_cached(children));
            }
        } else {
            session.evict_subtree(path);
        }
        let children = session.store_children(session_id, path, expansion, generation);
        debug!(
            "Cached {} children of {} in {} (generation {})",
            children.len(),
            path,
            session_id,
            generation
        );
        Ok(Expansion::from_cached(&children))
    }
}
