//! Constant folding.
//!
//! Variable-free arithmetic, boolean and comparison expressions are replaced
//! by the literal they evaluate to. Anything that cannot be folded is left
//! exactly as written.

use std::collections::HashMap;

use crate::ast::{Ast, NodeId, NodeKind};
use crate::context::ContextValue;
use crate::expr::{self, split_filters, ExprToken};

/// Operator keywords that may appear in a foldable expression.
const KEYWORDS: &[&str] = &["true", "false", "null", "and", "or", "not", "in"];

/// Returns `true` if `expr` tokenizes and refers to no variables: the only
/// words allowed are `true`, `false`, `null` and the operator keywords.
pub fn is_optimizable(expr: &str) -> bool {
    expr::tokenize(expr).is_ok_and(|tokens| {
        !tokens.is_empty()
            && tokens.iter().all(|t| match t {
                ExprToken::Ident(word) => KEYWORDS.contains(&word.as_str()),
                _ => true,
            })
    })
}

/// Evaluates a variable-free expression without filters, or returns `None`.
pub fn constant_value(expr: &str) -> Option<ContextValue> {
    let (base, filters) = split_filters(expr);
    if !filters.is_empty() || !is_optimizable(&base) {
        return None;
    }
    let parsed = expr::parse(&base).ok()?;
    expr::evaluate(&parsed, &|_| None).ok()
}

/// Folds constant expressions, memoizing results per instance.
///
/// # Examples
///
/// ```
/// use tessera_template::optimizer::ConstantFolder;
///
/// let mut folder = ConstantFolder::new();
/// assert_eq!(folder.fold("24 * 60 * 60"), "86400");
/// assert_eq!(folder.fold("count + 1"), "count + 1");
/// ```
#[derive(Debug, Default)]
pub struct ConstantFolder {
    memo: HashMap<String, String>,
}

impl ConstantFolder {
    /// Creates a folder with an empty memo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the literal text `expr` evaluates to, or `expr` unchanged if
    /// it is not constant or fails to evaluate. Never fails.
    pub fn fold(&mut self, expr: &str) -> String {
        if let Some(hit) = self.memo.get(expr) {
            return hit.clone();
        }
        let folded = Self::try_fold(expr).unwrap_or_else(|| expr.to_string());
        self.memo.insert(expr.to_string(), folded.clone());
        folded
    }

    fn try_fold(expr: &str) -> Option<String> {
        if !is_optimizable(expr) {
            return None;
        }
        let parsed = expr::parse(expr).ok()?;
        let value = expr::evaluate(&parsed, &|_| None).ok()?;
        expr::format_literal(&value)
    }

    /// Number of memoized expressions.
    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    /// Folds the base expression of a filtered expression, keeping the
    /// filter chain.
    pub fn fold_filtered(&mut self, expr: &str) -> String {
        let (base, filters) = split_filters(expr);
        let folded = self.fold(&base);
        if filters.is_empty() {
            folded
        } else if folded == base {
            expr.to_string()
        } else {
            format!("{folded}|{}", filters.join("|"))
        }
    }

    /// Returns a copy of `ast` with `if`/`elseif` conditions, variable
    /// expressions and macro arguments folded.
    pub fn fold_tree(&mut self, ast: &Ast) -> Ast {
        let mut out = Ast::new();
        let root = out.root();
        for &child in ast.children(ast.root()) {
            self.copy_folded(ast, child, &mut out, root);
        }
        out
    }

    fn copy_folded(&mut self, src: &Ast, id: NodeId, out: &mut Ast, parent: NodeId) {
        let kind = match src.kind(id) {
            NodeKind::Variable(e) => NodeKind::Variable(self.fold_filtered(e)),
            NodeKind::Branch {
                condition: Some(c),
            } => NodeKind::Branch {
                condition: Some(self.fold_filtered(c)),
            },
            NodeKind::Scope { bindings } => NodeKind::Scope {
                bindings: bindings
                    .iter()
                    .map(|(name, arg)| (name.clone(), self.fold(arg)))
                    .collect(),
            },
            other => other.clone(),
        };
        let copy = out.push_child(parent, kind);
        for &child in src.children(id) {
            self.copy_folded(src, child, out, copy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::ParsedTemplate;

    #[test]
    fn test_fold_arithmetic() {
        let mut f = ConstantFolder::new();
        assert_eq!(f.fold("24 * 60 * 60"), "86400");
        assert_eq!(f.fold("2 + 3 * 4"), "14");
        assert_eq!(f.fold("7 / 2"), "3.5");
        assert_eq!(f.fold("4.0 / 2"), "2.0");
        assert_eq!(f.fold("2 ** 10"), "1024");
        assert_eq!(f.fold("10 % 3"), "1");
        assert_eq!(f.fold("0 - 5"), "-5");
    }

    #[test]
    fn test_fold_boolean_and_comparison() {
        let mut f = ConstantFolder::new();
        assert_eq!(f.fold("1 < 2 && 3 >= 3"), "true");
        assert_eq!(f.fold("not true or false"), "false");
        assert_eq!(f.fold("!(1 == 1)"), "false");
        assert_eq!(f.fold("1 > 2 ? \"a\" : \"b\""), "\"b\"");
        assert_eq!(f.fold("null"), "null");
        assert_eq!(f.fold("\"ab\" + \"c\""), "\"abc\"");
    }

    #[test]
    fn test_variables_are_not_folded() {
        let mut f = ConstantFolder::new();
        assert_eq!(f.fold("count + 1"), "count + 1");
        assert_eq!(f.fold("user.age > 3"), "user.age > 3");
        assert!(!is_optimizable("x"));
        assert!(!is_optimizable("1 is odd"));
        assert!(is_optimizable("true and 1 in \"1\""));
    }

    #[test]
    fn test_failures_are_left_unchanged() {
        let mut f = ConstantFolder::new();
        assert_eq!(f.fold("1 / 0"), "1 / 0");
        assert_eq!(f.fold("9223372036854775807 * 2"), "9223372036854775807 * 2");
        assert_eq!(f.fold("\"a\" - 1"), "\"a\" - 1");
        assert_eq!(f.fold("1 +"), "1 +");
        assert_eq!(f.fold(""), "");
    }

    #[test]
    fn test_fold_is_idempotent() {
        let mut f = ConstantFolder::new();
        for expr in [
            "24 * 60 * 60",
            "7 / 2",
            "3.0 * 1",
            "\"x\\\"y\" + \"\\n\"",
            "count + 1",
            "1 / 0",
            "'single'",
            "0 - 9223372036854775807 - 1",
        ] {
            let once = f.fold(expr);
            assert_eq!(f.fold(&once), once, "not idempotent for {expr}");
        }
    }

    #[test]
    fn test_memo_is_per_instance() {
        let mut a = ConstantFolder::new();
        a.fold("1 + 1");
        a.fold("1 + 1");
        assert_eq!(a.memo_len(), 1);
        assert_eq!(ConstantFolder::new().memo_len(), 0);
    }

    #[test]
    fn test_fold_filtered_keeps_filters() {
        let mut f = ConstantFolder::new();
        assert_eq!(f.fold_filtered("1 + 1|default:3"), "2|default:3");
        assert_eq!(f.fold_filtered("name | upper"), "name | upper");
    }

    #[test]
    fn test_fold_tree() {
        let parsed = ParsedTemplate::parse(
            &Lexer::default(),
            "{% if 1 + 1 == 2 %}{{ 60 * 60 }}{% elseif x %}{{ x + 1 }}{% endif %}",
        )
        .unwrap();
        let folded = ConstantFolder::new().fold_tree(&parsed.ast);
        let kinds: Vec<_> = folded.walk().into_iter().map(|id| folded.kind(id).clone()).collect();
        assert!(kinds.contains(&NodeKind::Branch {
            condition: Some("true".into())
        }));
        assert!(kinds.contains(&NodeKind::Variable("3600".into())));
        assert!(kinds.contains(&NodeKind::Variable("x + 1".into())));
    }
}
