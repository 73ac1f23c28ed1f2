//! Dead-branch elimination.
//!
//! Walks `if` chains whose conditions are constant and keeps only the arms
//! that can still be taken. Runs after constant folding, so conditions are
//! usually plain literals by the time they get here.

use crate::ast::{Ast, NodeId, NodeKind};
use crate::optimizer::fold::constant_value;

/// Removes untaken branches of constant conditions.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadBranchEliminator;

impl DeadBranchEliminator {
    /// Creates an eliminator.
    pub const fn new() -> Self {
        Self
    }

    /// Returns a copy of `ast` with dead branches removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use tessera_template::lexer::Lexer;
    /// use tessera_template::optimizer::DeadBranchEliminator;
    /// use tessera_template::parser::ParsedTemplate;
    /// use tessera_template::ast::NodeKind;
    ///
    /// let parsed = ParsedTemplate::parse(
    ///     &Lexer::default(),
    ///     "{% if true %}A{% else %}B{% endif %}",
    /// ).unwrap();
    /// let ast = DeadBranchEliminator::new().eliminate(&parsed.ast);
    /// let top: Vec<_> = ast.children(ast.root()).iter().map(|&id| ast.kind(id).clone()).collect();
    /// assert_eq!(top, vec![NodeKind::Text("A".into())]);
    /// ```
    pub fn eliminate(&self, ast: &Ast) -> Ast {
        let mut out = Ast::new();
        let root = out.root();
        for &child in ast.children(ast.root()) {
            self.copy_live(ast, child, &mut out, root);
        }
        out
    }

    fn copy_live(&self, src: &Ast, id: NodeId, out: &mut Ast, parent: NodeId) {
        if matches!(src.kind(id), NodeKind::If) {
            self.emit_if(src, id, out, parent);
            return;
        }
        let copy = out.push_child(parent, src.kind(id).clone());
        for &child in src.children(id) {
            self.copy_live(src, child, out, copy);
        }
    }

    fn inline_body(&self, src: &Ast, branch: NodeId, out: &mut Ast, parent: NodeId) {
        for &child in src.children(branch) {
            self.copy_live(src, child, out, parent);
        }
    }

    fn emit_if(&self, src: &Ast, id: NodeId, out: &mut Ast, parent: NodeId) {
        let mut kept: Vec<(Option<String>, NodeId)> = Vec::new();

        for &branch in src.children(id) {
            let NodeKind::Branch { condition } = src.kind(branch) else {
                continue;
            };
            let decided = match condition {
                None => Some(true),
                Some(cond) => constant_value(cond).map(|v| v.is_truthy()),
            };
            match decided {
                Some(false) => {}
                Some(true) if kept.is_empty() => {
                    self.inline_body(src, branch, out, parent);
                    return;
                }
                Some(true) => {
                    // Everything after a sure branch is unreachable.
                    kept.push((None, branch));
                    break;
                }
                None => kept.push((condition.clone(), branch)),
            }
        }

        if kept.is_empty() {
            return;
        }

        let chain = out.push_child(parent, NodeKind::If);
        for (condition, branch) in kept {
            let arm = out.push_child(chain, NodeKind::Branch { condition });
            self.inline_body(src, branch, out, arm);
        }
    }
}
