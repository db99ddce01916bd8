//! # mindweave-core: Mind-map document model
//!
//! A document is a rooted tree of [`Node`]s. Children are held behind `Arc`
//! so a mutation only copies the path from the root to the node it touches;
//! untouched subtrees are shared between consecutive snapshots.
//!
//! - [`mutator`]: pure `(snapshot, mutation) → snapshot` transformation
//! - [`mutation`]: create / update / delete / move payloads

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::sync::Arc;

pub mod mutation;
pub mod mutator;

pub use mutation::{Mutation, MutationKind, NodePatch, StylePatch};
pub use mutator::{apply, TreeError, TreeLimits};

/// Id of the root node of a freshly created document.
pub const ROOT_ID: &str = "root";

/// Position of a node on the canvas.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Visual attributes of a node. Every field has a default so partially
/// specified styles can be completed on create.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStyle {
    pub background_color: String,
    pub text_color: String,
    pub border_color: String,
    pub font_size: f64,
    pub shape: String,
}

impl Default for NodeStyle {
    fn default() -> Self {
        Self {
            background_color: "#ffffff".to_string(),
            text_color: "#333333".to_string(),
            border_color: "#cccccc".to_string(),
            font_size: 14.0,
            shape: "rounded".to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Node {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub style: NodeStyle,
    #[serde(default)]
    pub children: Vec<Arc<Node>>,
}

impl Node {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            position: Position::default(),
            style: NodeStyle::default(),
            children: Vec::new(),
        }
    }

    /// Generate a fresh node id for creates that did not name one.
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    pub fn child_ids(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.id.as_str()).collect()
    }
}

/// Immutable document snapshot.
///
/// Cloning is O(1): only the root `Arc` is copied.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    root: Arc<Node>,
    node_count: usize,
}

impl Default for Document {
    fn default() -> Self {
        Self::new("Central Topic")
    }
}

impl Document {
    /// Create a document holding only a root node with id [`ROOT_ID`].
    pub fn new(root_text: impl Into<String>) -> Self {
        Self {
            root: Arc::new(Node::new(ROOT_ID, root_text)),
            node_count: 1,
        }
    }

    /// Build a document from an existing tree, rejecting duplicate ids.
    pub fn from_root(root: Node) -> Result<Self, TreeError> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&Node> = vec![&root];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.id.as_str()) {
                return Err(TreeError::DuplicateNode(node.id.clone()));
            }
            stack.extend(node.children.iter().map(|c| c.as_ref()));
        }
        let node_count = seen.len();
        Ok(Self {
            root: Arc::new(root),
            node_count,
        })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn root_id(&self) -> &str {
        &self.root.id
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Depth-first lookup by id.
    pub fn find(&self, id: &str) -> Option<&Node> {
        let mut stack: Vec<&Node> = vec![&self.root];
        while let Some(node) = stack.pop() {
            if node.id == id {
                return Some(node);
            }
            stack.extend(node.children.iter().rev().map(|c| c.as_ref()));
        }
        None
    }

    /// Parent of the node with `id`, `None` for the root or unknown ids.
    pub fn parent_of(&self, id: &str) -> Option<&Node> {
        let mut stack: Vec<&Node> = vec![&self.root];
        while let Some(node) = stack.pop() {
            if node.children.iter().any(|c| c.id == id) {
                return Some(node);
            }
            stack.extend(node.children.iter().map(|c| c.as_ref()));
        }
        None
    }

    /// Whether `ancestor` is a proper ancestor of `id`.
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        match self.find(ancestor) {
            Some(node) => {
                let mut stack: Vec<&Node> = node.children.iter().map(|c| c.as_ref()).collect();
                while let Some(n) = stack.pop() {
                    if n.id == id {
                        return true;
                    }
                    stack.extend(n.children.iter().map(|c| c.as_ref()));
                }
                false
            }
            None => false,
        }
    }

    /// Walk the whole tree and confirm ids are unique and the tracked node
    /// count matches. Each node is reached through exactly one parent by
    /// construction, so a unique-id walk is also a single-parent check.
    pub fn check_integrity(&self) -> Result<(), TreeError> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&Node> = vec![&self.root];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.id.as_str()) {
                return Err(TreeError::DuplicateNode(node.id.clone()));
            }
            stack.extend(node.children.iter().map(|c| c.as_ref()));
        }
        if seen.len() != self.node_count {
            return Err(TreeError::CountMismatch {
                tracked: self.node_count,
                actual: seen.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn from_parts(root: Arc<Node>, node_count: usize) -> Self {
        Self { root, node_count }
    }

    pub(crate) fn root_arc(&self) -> &Arc<Node> {
        &self.root
    }
}

// A document serializes as its root node; the count is derived on load.
impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.root.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let root = Node::deserialize(deserializer)?;
        Document::from_root(root).map_err(serde::de::Error::custom)
    }
}
