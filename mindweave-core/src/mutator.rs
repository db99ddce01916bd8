//! Pure tree mutator: `(snapshot, mutation) → snapshot`.
//!
//! The input document is never modified. The returned document shares every
//! subtree that the mutation did not touch; only the nodes on the path from
//! the root to the changed node are copied (`Arc::make_mut`).
//!
//! Lookups are depth-first and bounded by the node budget, so a corrupt or
//! oversized snapshot cannot turn a search into an unbounded walk.

use std::sync::Arc;
use thiserror::Error;

use crate::mutation::{Mutation, NodePatch, StylePatch};
use crate::{Document, Node, Position};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("node id already exists: {0}")]
    DuplicateNode(String),
    #[error("root node {0} cannot be deleted or moved")]
    RootImmutable(String),
    #[error("moving {node_id} under {new_parent_id} would make it its own ancestor")]
    WouldCreateCycle {
        node_id: String,
        new_parent_id: String,
    },
    #[error("document is limited to {limit} nodes")]
    CapacityExceeded { limit: usize },
    #[error("tracked node count {tracked} does not match tree ({actual})")]
    CountMismatch { tracked: usize, actual: usize },
}

/// Size limits applied while mutating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLimits {
    pub max_nodes: usize,
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self { max_nodes: 10_000 }
    }
}

/// Apply one mutation to a snapshot.
pub fn apply(doc: &Document, mutation: &Mutation, limits: &TreeLimits) -> Result<Document, TreeError> {
    let budget = limits.max_nodes.max(doc.node_count());
    match mutation {
        Mutation::Create {
            parent_id,
            node_id,
            text,
            position,
            style,
        } => create(doc, parent_id, node_id, text, *position, style, limits, budget),
        Mutation::Update { node_id, patch } => update(doc, node_id, patch, budget),
        Mutation::Delete {
            node_id,
            preserve_children,
        } => delete(doc, node_id, *preserve_children, budget),
        Mutation::Move {
            node_id,
            new_parent_id,
            position,
        } => move_node(doc, node_id, new_parent_id.as_deref(), *position, budget),
    }
}

#[allow(clippy::too_many_arguments)]
fn create(
    doc: &Document,
    parent_id: &str,
    node_id: &str,
    text: &str,
    position: Position,
    style: &StylePatch,
    limits: &TreeLimits,
    budget: usize,
) -> Result<Document, TreeError> {
    let parent_path = find_path(doc.root(), parent_id, budget)
        .ok_or_else(|| TreeError::NodeNotFound(parent_id.to_string()))?;
    if find_path(doc.root(), node_id, budget).is_some() {
        return Err(TreeError::DuplicateNode(node_id.to_string()));
    }
    if doc.node_count() >= limits.max_nodes {
        return Err(TreeError::CapacityExceeded {
            limit: limits.max_nodes,
        });
    }

    let mut root = doc.root_arc().clone();
    let parent = node_at_mut(&mut root, &parent_path);
    parent.children.push(Arc::new(Node {
        id: node_id.to_string(),
        text: text.to_string(),
        position,
        style: style.resolve(),
        children: Vec::new(),
    }));
    Ok(Document::from_parts(root, doc.node_count() + 1))
}

fn update(doc: &Document, node_id: &str, patch: &NodePatch, budget: usize) -> Result<Document, TreeError> {
    let path = find_path(doc.root(), node_id, budget)
        .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;
    if patch.is_empty() {
        return Ok(doc.clone());
    }

    let mut root = doc.root_arc().clone();
    let node = node_at_mut(&mut root, &path);
    if let Some(text) = &patch.text {
        node.text = text.clone();
    }
    if let Some(position) = patch.position {
        node.position = position;
    }
    if let Some(style) = &patch.style {
        style.merge_into(&mut node.style);
    }
    Ok(Document::from_parts(root, doc.node_count()))
}

fn delete(doc: &Document, node_id: &str, preserve_children: bool, budget: usize) -> Result<Document, TreeError> {
    if node_id == doc.root_id() {
        return Err(TreeError::RootImmutable(node_id.to_string()));
    }
    let path = find_path(doc.root(), node_id, budget)
        .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;
    let Some((&index, parent_path)) = path.split_last() else {
        return Err(TreeError::RootImmutable(node_id.to_string()));
    };

    let mut root = doc.root_arc().clone();
    let parent = node_at_mut(&mut root, parent_path);
    let removed = parent.children.remove(index);
    let node_count = if preserve_children {
        parent
            .children
            .splice(index..index, removed.children.iter().cloned());
        doc.node_count() - 1
    } else {
        doc.node_count() - subtree_size(&removed)
    };
    log::trace!(
        "deleted {node_id} (preserve_children={preserve_children}), {} nodes remain",
        node_count
    );
    Ok(Document::from_parts(root, node_count))
}

fn move_node(
    doc: &Document,
    node_id: &str,
    new_parent_id: Option<&str>,
    position: Option<Position>,
    budget: usize,
) -> Result<Document, TreeError> {
    if node_id == doc.root_id() {
        return Err(TreeError::RootImmutable(node_id.to_string()));
    }
    let path = find_path(doc.root(), node_id, budget)
        .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;

    let mut root = doc.root_arc().clone();
    let Some(new_parent_id) = new_parent_id else {
        // Reposition in place.
        if let Some(position) = position {
            node_at_mut(&mut root, &path).position = position;
        }
        return Ok(Document::from_parts(root, doc.node_count()));
    };

    let target_path = find_path(doc.root(), new_parent_id, budget)
        .ok_or_else(|| TreeError::NodeNotFound(new_parent_id.to_string()))?;
    if target_path.starts_with(&path) {
        log::debug!("rejected move of {node_id} under its own descendant {new_parent_id}");
        return Err(TreeError::WouldCreateCycle {
            node_id: node_id.to_string(),
            new_parent_id: new_parent_id.to_string(),
        });
    }
    let Some((&index, parent_path)) = path.split_last() else {
        return Err(TreeError::RootImmutable(node_id.to_string()));
    };

    let mut moved = node_at_mut(&mut root, parent_path).children.remove(index);
    if let Some(position) = position {
        Arc::make_mut(&mut moved).position = position;
    }
    // Detaching may have shifted the destination's index path.
    let target_path = find_path(&root, new_parent_id, budget)
        .ok_or_else(|| TreeError::NodeNotFound(new_parent_id.to_string()))?;
    node_at_mut(&mut root, &target_path).children.push(moved);
    Ok(Document::from_parts(root, doc.node_count()))
}

/// Child-index path from the root to the node with `id`.
fn find_path(root: &Node, id: &str, budget: usize) -> Option<Vec<usize>> {
    if root.id == id {
        return Some(Vec::new());
    }
    let mut stack: Vec<(&Node, Vec<usize>)> = vec![(root, Vec::new())];
    let mut visited = 0usize;
    while let Some((node, path)) = stack.pop() {
        visited += 1;
        if visited > budget {
            log::warn!("tree search for {id} exceeded the {budget} node budget");
            return None;
        }
        for (i, child) in node.children.iter().enumerate() {
            let mut child_path = path.clone();
            child_path.push(i);
            if child.id == id {
                return Some(child_path);
            }
            stack.push((child, child_path));
        }
    }
    None
}

/// Copy-on-write descent along `path`.
fn node_at_mut<'a>(root: &'a mut Arc<Node>, path: &[usize]) -> &'a mut Node {
    let mut node = Arc::make_mut(root);
    for &i in path {
        node = Arc::make_mut(&mut node.children[i]);
    }
    node
}

fn subtree_size(node: &Node) -> usize {
    let mut count = 0;
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        count += 1;
        stack.extend(n.children.iter().map(|c| c.as_ref()));
    }
    count
}
