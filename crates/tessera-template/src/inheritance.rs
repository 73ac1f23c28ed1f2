//! Template inheritance.
//!
//! A child template declares `{% extends "parent" %}` as its first tag and
//! overrides `{% block %}` sections of the parent. `{{ parent() }}` inside an
//! overriding block splices in the ancestor's content for that block.
//!
//! ## Example
//!
//! ```text
//! {# base.html #}
//! <body>{% block content %}Default{% endblock %}</body>
//!
//! {# page.html #}
//! {% extends "base.html" %}
//! {% block content %}<h1>Page</h1>{{ parent() }}{% endblock %}
//! ```
//!
//! Resolving `page.html` yields `<body><h1>Page</h1>Default</body>`.
//!
//! Chains resolve from the ultimate ancestor down, so every level sees a
//! fully resolved parent. The result contains no `extends` and no
//! `parent()` references, which makes resolving it again a no-op.

use std::collections::HashMap;

use tessera_core::error::{TesseraError, TesseraResult};

use crate::ast::{Ast, NodeId, NodeKind};

/// Loads the syntax tree of another template by name.
///
/// Implemented by the engine, which adds caching and dependency tracking.
pub trait AstSource {
    /// Loads and parses the template called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::TemplateNotFound`] if no such template exists.
    fn load_ast(&self, name: &str) -> TesseraResult<Ast>;
}

/// Returns the parent named by a leading `extends`, if any.
///
/// Whitespace-only text may precede the tag.
///
/// # Errors
///
/// Returns [`TesseraError::SyntaxError`] if `extends` appears anywhere other
/// than as the first meaningful node.
pub fn find_extends(ast: &Ast) -> TesseraResult<Option<String>> {
    let first = ast.children(ast.root()).iter().copied().find(|&id| {
        !matches!(ast.kind(id), NodeKind::Text(t) if t.trim().is_empty())
    });

    let leading = first.and_then(|id| match ast.kind(id) {
        NodeKind::Extends { parent } => Some((id, parent.clone())),
        _ => None,
    });

    let misplaced = ast.walk().into_iter().any(|id| {
        matches!(ast.kind(id), NodeKind::Extends { .. })
            && leading.as_ref().is_none_or(|(lead, _)| *lead != id)
    });
    if misplaced {
        return Err(TesseraError::SyntaxError(
            "'extends' must be the first tag in the template".to_string(),
        ));
    }

    Ok(leading.map(|(_, parent)| parent))
}

/// Resolves `extends` chains into a single tree.
pub struct InheritanceResolver<'a> {
    source: &'a dyn AstSource,
}

impl<'a> InheritanceResolver<'a> {
    /// Creates a resolver that loads ancestors from `source`.
    pub fn new(source: &'a dyn AstSource) -> Self {
        Self { source }
    }

    /// Resolves the template `name` whose tree is `ast`.
    ///
    /// # Errors
    ///
    /// - [`TesseraError::CircularInheritance`] naming the full chain when a
    ///   template is revisited.
    /// - [`TesseraError::TemplateNotFound`] for a missing ancestor.
    /// - [`TesseraError::SyntaxError`] for a misplaced `extends`.
    pub fn resolve(&self, name: &str, ast: &Ast) -> TesseraResult<Ast> {
        let mut chain = vec![name.to_string()];
        self.resolve_chain(ast, &mut chain)
    }

    fn resolve_chain(&self, ast: &Ast, chain: &mut Vec<String>) -> TesseraResult<Ast> {
        let Some(parent_name) = find_extends(ast)? else {
            return Ok(without_parent_refs(ast));
        };

        let revisited = chain.contains(&parent_name);
        chain.push(parent_name.clone());
        if revisited {
            return Err(TesseraError::CircularInheritance {
                chain: chain.clone(),
            });
        }

        tracing::debug!(parent = %parent_name, depth = chain.len() - 1, "resolving ancestor");
        let parent_ast = self.source.load_ast(&parent_name)?;
        let parent = self.resolve_chain(&parent_ast, chain)?;

        let mut overrides = HashMap::new();
        collect_blocks(ast, ast.root(), &mut overrides);

        let mut out = Ast::new();
        let root = out.root();

        // Declarations produce no output but are needed by macro expansion.
        for &child in ast.children(ast.root()) {
            if matches!(ast.kind(child), NodeKind::Import { .. } | NodeKind::Macro { .. }) {
                let copy = out.copy_subtree(ast, child);
                out.add_child(root, copy);
            }
        }

        let merge = Merge {
            parent: &parent,
            leaf: ast,
            overrides: &overrides,
        };
        for &child in parent.children(parent.root()) {
            merge.emit(child, &mut out, root);
        }
        Ok(out)
    }
}

struct Merge<'a> {
    parent: &'a Ast,
    leaf: &'a Ast,
    overrides: &'a HashMap<String, NodeId>,
}

impl Merge<'_> {
    /// Copies a node of the resolved parent, substituting overridden blocks.
    fn emit(&self, id: NodeId, out: &mut Ast, out_parent: NodeId) {
        if let NodeKind::Block { name } = self.parent.kind(id) {
            if let Some(&leaf_block) = self.overrides.get(name) {
                let block = out.push_child(out_parent, NodeKind::Block { name: name.clone() });
                self.emit_override(leaf_block, Some(id), out, block);
                return;
            }
        }
        let copy = out.push_child(out_parent, self.parent.kind(id).clone());
        for &child in self.parent.children(id) {
            self.emit(child, out, copy);
        }
    }

    /// Copies the children of an overriding block, splicing the ancestor
    /// block's content at every `parent()` reference.
    fn emit_override(
        &self,
        leaf_node: NodeId,
        ancestor: Option<NodeId>,
        out: &mut Ast,
        out_parent: NodeId,
    ) {
        for &child in self.leaf.children(leaf_node) {
            match self.leaf.kind(child) {
                NodeKind::ParentRef => {
                    if let Some(ancestor) = ancestor {
                        out.copy_children_into(out_parent, self.parent, ancestor);
                    }
                }
                NodeKind::Block { name } => {
                    let nested = out.push_child(out_parent, NodeKind::Block { name: name.clone() });
                    let nested_ancestor = find_block(self.parent, name);
                    self.emit_override(child, nested_ancestor, out, nested);
                }
                other => {
                    let copy = out.push_child(out_parent, other.clone());
                    self.emit_override(child, ancestor, out, copy);
                }
            }
        }
    }
}

/// Records the first definition of every block name under `id`.
fn collect_blocks(ast: &Ast, id: NodeId, blocks: &mut HashMap<String, NodeId>) {
    for &child in ast.children(id) {
        if let NodeKind::Block { name } = ast.kind(child) {
            blocks.entry(name.clone()).or_insert(child);
        }
        collect_blocks(ast, child, blocks);
    }
}

fn find_block(ast: &Ast, name: &str) -> Option<NodeId> {
    ast.walk()
        .into_iter()
        .find(|&id| matches!(ast.kind(id), NodeKind::Block { name: n } if n == name))
}

/// Copies a root template, dropping `parent()` references (no ancestor
/// content exists).
fn without_parent_refs(ast: &Ast) -> Ast {
    fn copy(src: &Ast, id: NodeId, out: &mut Ast, parent: NodeId) {
        if matches!(src.kind(id), NodeKind::ParentRef) {
            return;
        }
        let node = out.push_child(parent, src.kind(id).clone());
        for &child in src.children(id) {
            copy(src, child, out, node);
        }
    }

    let mut out = Ast::new();
    let root = out.root();
    for &child in ast.children(ast.root()) {
        copy(ast, child, &mut out, root);
    }
    out
}
