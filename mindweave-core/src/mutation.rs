//! Mutation payloads accepted by the tree mutator.
//!
//! Wire shape (adjacently tagged):
//! ```text
//! { "kind": "create", "payload": { "parentId": "root", "nodeId": "a", "text": "Idea" } }
//! ```

use serde::{Deserialize, Serialize};

use crate::{NodeStyle, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Move,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Move => "move",
        };
        f.write_str(name)
    }
}

/// Style fields supplied by a client; anything missing is filled from the
/// existing style (update) or from [`NodeStyle::default`] (create).
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StylePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub border_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
}

impl StylePatch {
    pub fn merge_into(&self, style: &mut NodeStyle) {
        if let Some(v) = &self.background_color {
            style.background_color = v.clone();
        }
        if let Some(v) = &self.text_color {
            style.text_color = v.clone();
        }
        if let Some(v) = &self.border_color {
            style.border_color = v.clone();
        }
        if let Some(v) = self.font_size {
            style.font_size = v;
        }
        if let Some(v) = &self.shape {
            style.shape = v.clone();
        }
    }

    pub fn resolve(&self) -> NodeStyle {
        let mut style = NodeStyle::default();
        self.merge_into(&mut style);
        style
    }
}

/// Fields an update may change. `None` leaves the field untouched.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<StylePatch>,
}

impl NodePatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.position.is_none() && self.style.is_none()
    }
}

/// One atomic change to the tree.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Mutation {
    #[serde(rename_all = "camelCase")]
    Create {
        parent_id: String,
        node_id: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        position: Position,
        #[serde(default)]
        style: StylePatch,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        node_id: String,
        #[serde(default)]
        patch: NodePatch,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        node_id: String,
        #[serde(default)]
        preserve_children: bool,
    },
    #[serde(rename_all = "camelCase")]
    Move {
        node_id: String,
        #[serde(default)]
        new_parent_id: Option<String>,
        #[serde(default)]
        position: Option<Position>,
    },
}

impl Mutation {
    pub fn create(parent_id: impl Into<String>, node_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Create {
            parent_id: parent_id.into(),
            node_id: node_id.into(),
            text: text.into(),
            position: Position::default(),
            style: StylePatch::default(),
        }
    }

    pub fn update(node_id: impl Into<String>, patch: NodePatch) -> Self {
        Self::Update {
            node_id: node_id.into(),
            patch,
        }
    }

    pub fn delete(node_id: impl Into<String>, preserve_children: bool) -> Self {
        Self::Delete {
            node_id: node_id.into(),
            preserve_children,
        }
    }

    pub fn move_to(node_id: impl Into<String>, new_parent_id: impl Into<String>) -> Self {
        Self::Move {
            node_id: node_id.into(),
            new_parent_id: Some(new_parent_id.into()),
            position: None,
        }
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Create { .. } => MutationKind::Create,
            Self::Update { .. } => MutationKind::Update,
            Self::Delete { .. } => MutationKind::Delete,
            Self::Move { .. } => MutationKind::Move,
        }
    }

    /// The node this mutation is about. For creates, the new node.
    pub fn target_node_id(&self) -> &str {
        match self {
            Self::Create { node_id, .. }
            | Self::Update { node_id, .. }
            | Self::Delete { node_id, .. }
            | Self::Move { node_id, .. } => node_id.as_str(),
        }
    }

    /// Parent a create attaches under.
    pub fn created_under(&self) -> Option<&str> {
        match self {
            Self::Create { parent_id, .. } => Some(parent_id.as_str()),
            _ => None,
        }
    }

    /// Every node id whose state this mutation reads or writes.
    pub fn touched_nodes(&self) -> Vec<&str> {
        match self {
            Self::Create { node_id, parent_id, .. } => vec![node_id.as_str(), parent_id.as_str()],
            Self::Move { node_id, new_parent_id: Some(parent), .. } => {
                vec![node_id.as_str(), parent.as_str()]
            }
            other => vec![other.target_node_id()],
        }
    }
}
