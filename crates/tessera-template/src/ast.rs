//! Arena-allocated template syntax tree.
//!
//! Nodes live in one flat vector and refer to their children by [`NodeId`].
//! Passes never mutate a tree in place: they build a new [`Ast`], copying
//! the subtrees they keep with [`Ast::copy_subtree`].

use serde::{Deserialize, Serialize};

/// Index of a node inside its [`Ast`].
pub type NodeId = usize;

/// A macro parameter with its optional default expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroParam {
    /// Parameter name.
    pub name: String,
    /// Default expression text, evaluated in the caller's scope.
    pub default: Option<String>,
}

/// The kind of a node, with its typed attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// The tree root. Children are the top-level nodes.
    Root,
    /// An ordered run of nodes, used for branch and loop bodies.
    Sequence,
    /// Literal output.
    Text(String),
    /// `{{ expr|filters }}`
    Variable(String),
    /// A loop. Children: the body `Sequence`, then an optional `else`
    /// `Sequence` rendered on zero iterations.
    For {
        /// One loop variable, or two for key/value iteration.
        vars: Vec<String>,
        /// The iterable expression.
        iterable: String,
    },
    /// An `if` chain. Children are `Branch` nodes in source order.
    If,
    /// One arm of an `if` chain. `None` marks the `else` arm.
    Branch {
        /// The arm's condition.
        condition: Option<String>,
    },
    /// `{% block name %}`
    Block {
        /// Block name.
        name: String,
    },
    /// `{% macro name(params) %}`; children are the body.
    Macro {
        /// Macro name.
        name: String,
        /// Declared parameters, in order.
        params: Vec<MacroParam>,
    },
    /// `{% import "path" as alias %}`
    Import {
        /// Template to load macros from.
        path: String,
        /// Prefix for the imported macro names.
        alias: String,
    },
    /// `{% extends "parent" %}`
    Extends {
        /// The parent template name.
        parent: String,
    },
    /// `{% include target %}`
    Include {
        /// A quoted name or an expression.
        target: String,
    },
    /// `{{ parent() }}` inside a block.
    ParentRef,
    /// An expanded macro call: an isolated scope binding the parameters.
    Scope {
        /// Parameter name and argument expression pairs.
        bindings: Vec<(String, String)>,
    },
    /// Output of the children piped through a filter chain.
    Filtered {
        /// Filter expressions, applied in order.
        filters: Vec<String>,
    },
}

/// A node: its kind and its children in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// What the node is.
    pub kind: NodeKind,
    /// Child node ids.
    pub children: Vec<NodeId>,
}

/// A template syntax tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ast {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Ast {
    /// Creates a tree holding only an empty root.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Root,
                children: Vec::new(),
            }],
            root: 0,
        }
    }

    /// The root node id.
    pub const fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the node with id `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this tree.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// The node's kind.
    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    /// The node's children.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the root has no children.
    pub fn is_empty(&self) -> bool {
        self.nodes[self.root].children.is_empty()
    }

    /// Allocates a detached node and returns its id.
    pub fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    /// Appends `child` to `parent`'s children.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent].children.push(child);
    }

    /// Allocates a node and appends it to `parent`.
    pub fn push_child(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = self.push(kind);
        self.add_child(parent, id);
        id
    }

    /// Deep-copies the subtree at `id` of `other` into this arena and
    /// returns the id of the copy (detached).
    pub fn copy_subtree(&mut self, other: &Self, id: NodeId) -> NodeId {
        let copy = self.push(other.kind(id).clone());
        for &child in other.children(id) {
            let child_copy = self.copy_subtree(other, child);
            self.add_child(copy, child_copy);
        }
        copy
    }

    /// Copies the children of `other`'s node `id` and appends them to `parent`.
    pub fn copy_children_into(&mut self, parent: NodeId, other: &Self, id: NodeId) {
        for &child in other.children(id) {
            let copy = self.copy_subtree(other, child);
            self.add_child(parent, copy);
        }
    }

    /// Builds a standalone tree whose root children are copies of the
    /// children of `other`'s node `id`.
    pub fn from_children(other: &Self, id: NodeId) -> Self {
        let mut ast = Self::new();
        let root = ast.root();
        ast.copy_children_into(root, other, id);
        ast
    }

    /// Visits every node reachable from the root, depth-first, pre-order.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.children(id).iter().rev());
        }
        order
    }

    /// Returns a copy with unreachable nodes dropped and ids renumbered
    /// in pre-order.
    #[must_use]
    pub fn compact(&self) -> Self {
        let mut out = Self::new();
        let root = out.root();
        out.copy_children_into(root, self, self.root);
        out
    }
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}
