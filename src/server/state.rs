//! Shared state for the HTTP API

use std::sync::Arc;

use crate::node::Node;

/// Application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    /// The node this server fronts
    pub node: Arc<Node>,
}

impl AppState {
    /// Create state over a node
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    /// The shared API key used to sign outgoing commands
    pub fn api_key(&self) -> String {
        self.node.api_key()
    }
}
