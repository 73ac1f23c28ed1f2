//! Semantics-preserving tree optimizations.
//!
//! - [`ConstantFolder`] replaces variable-free expressions with literals.
//! - [`DeadBranchEliminator`] removes `if` arms that can never be taken.
//!
//! Rendering an optimized tree produces byte-identical output to rendering
//! the original for every context.

mod dead_branch;
mod fold;

pub use dead_branch::DeadBranchEliminator;
pub use fold::{constant_value, is_optimizable, ConstantFolder};

use crate::ast::Ast;

/// Runs folding followed by dead-branch elimination.
#[derive(Debug, Default)]
pub struct Optimizer {
    folder: ConstantFolder,
    eliminator: DeadBranchEliminator,
}

impl Optimizer {
    /// Creates an optimizer with a fresh folding memo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the optimized copy of `ast`.
    pub fn optimize(&mut self, ast: &Ast) -> Ast {
        let folded = self.folder.fold_tree(ast);
        let pruned = self.eliminator.eliminate(&folded);
        tracing::debug!(
            before = ast.len(),
            after = pruned.len(),
            memoized = self.folder.memo_len(),
            "optimized template tree"
        );
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeKind;
    use crate::lexer::Lexer;
    use crate::parser::ParsedTemplate;

    #[test]
    fn test_fold_then_eliminate() {
        let parsed = ParsedTemplate::parse(
            &Lexer::default(),
            "{% if 2 * 3 > 5 %}{{ 2 * 3 }}{% else %}small{% endif %}",
        )
        .unwrap();
        let ast = Optimizer::new().optimize(&parsed.ast);
        let top: Vec<_> = ast
            .children(ast.root())
            .iter()
            .map(|&id| ast.kind(id).clone())
            .collect();
        assert_eq!(top, vec![NodeKind::Variable("6".into())]);
    }
}
