//! Runtime hooks used by compiled templates.
//!
//! A [`CompiledTemplate`](crate::compiler::CompiledTemplate) never evaluates
//! anything itself. Variable lookup, filters, expressions and includes all
//! go through a [`Helpers`] implementation, so hosts can swap any of them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tessera_core::error::{TesseraError, TesseraResult};

use crate::context::{Context, ContextValue};
use crate::expr::{self, split_filters, split_top_level, Expr};
use crate::filters::FilterRegistry;

/// Include nesting for one render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Current include depth; the top-level template is at depth 0.
    pub depth: usize,
    /// Deepest include allowed.
    pub max_depth: usize,
}

impl ExecutionLimits {
    /// Limits for a top-level render.
    pub const fn new(max_depth: usize) -> Self {
        Self {
            depth: 0,
            max_depth,
        }
    }

    /// Limits for a template included from this one.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::RecursionLimitExceeded`] when `name` would be
    /// rendered deeper than `max_depth`.
    pub fn descend(self, name: &str) -> TesseraResult<Self> {
        let depth = self.depth + 1;
        if depth > self.max_depth {
            return Err(TesseraError::RecursionLimitExceeded {
                name: name.to_string(),
                limit: self.max_depth,
            });
        }
        Ok(Self { depth, ..self })
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::new(32)
    }
}

/// Runtime operations a compiled template needs from its host.
pub trait Helpers {
    /// Looks up a dotted variable path.
    fn resolve_variable(&self, path: &str, scope: &Context) -> Option<ContextValue>;

    /// Applies one filter (`name`, `name:arg` or `name(args)`) to `value`.
    fn apply_filter(
        &self,
        filter: &str,
        value: ContextValue,
        scope: &Context,
    ) -> TesseraResult<ContextValue>;

    /// Evaluates an expression, filters included.
    fn evaluate_expression(&self, expr: &str, scope: &Context) -> TesseraResult<ContextValue>;

    /// Evaluates an expression for its truthiness.
    fn evaluate_condition(&self, expr: &str, scope: &Context) -> TesseraResult<bool> {
        Ok(self.evaluate_expression(expr, scope)?.is_truthy())
    }

    /// Renders another template by name with the current variables.
    fn include(&self, name: &str, _scope: &Context, _limits: ExecutionLimits) -> TesseraResult<String> {
        Err(TesseraError::TemplateNotFound(name.to_string()))
    }
}

/// A parsed filter reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCall {
    pub name: String,
    /// Argument expressions, unevaluated.
    pub args: Vec<String>,
}

/// Parses `upper`, `default:"n/a"` or `truncate(10, "~")`.
///
/// # Errors
///
/// Returns [`TesseraError::SyntaxError`] for a missing name, an empty
/// argument, or trailing text after the name.
pub fn parse_filter(filter: &str) -> TesseraResult<FilterCall> {
    let filter = filter.trim();
    let name_len = filter
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(filter.len());
    let (name, rest) = filter.split_at(name_len);
    if name.is_empty() {
        return Err(TesseraError::SyntaxError(format!(
            "filter name expected in '{filter}'"
        )));
    }
    let rest = rest.trim();

    let args = if rest.is_empty() {
        Vec::new()
    } else if let Some(arg) = rest.strip_prefix(':') {
        vec![arg.trim().to_string()]
    } else if let Some(inner) = rest.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        if inner.trim().is_empty() {
            Vec::new()
        } else {
            split_top_level(inner, ',')
                .into_iter()
                .map(|a| a.trim().to_string())
                .collect()
        }
    } else {
        return Err(TesseraError::SyntaxError(format!(
            "unexpected '{rest}' after filter '{name}'"
        )));
    };

    if args.iter().any(String::is_empty) {
        return Err(TesseraError::SyntaxError(format!(
            "empty argument to filter '{name}'"
        )));
    }

    Ok(FilterCall {
        name: name.to_string(),
        args,
    })
}

/// Checks an expression and each of its filters without evaluating anything.
///
/// # Errors
///
/// Returns the first [`TesseraError::SyntaxError`] found.
pub fn check_expression(source: &str) -> TesseraResult<()> {
    let (base, filters) = split_filters(source);
    expr::parse(&base)?;
    for filter in &filters {
        for arg in parse_filter(filter)?.args {
            expr::parse(&arg)?;
        }
    }
    Ok(())
}

/// The standard [`Helpers`]: context lookup, the expression evaluator and a
/// [`FilterRegistry`].
///
/// Parsed expressions are memoized per source string.
#[derive(Debug, Default)]
pub struct DefaultHelpers {
    filters: FilterRegistry,
    parsed: RwLock<HashMap<String, Arc<Expr>>>,
}

impl DefaultHelpers {
    /// Creates helpers with the built-in filters.
    pub fn new() -> Self {
        Self::with_filters(FilterRegistry::with_builtins())
    }

    /// Creates helpers over a custom filter registry.
    pub fn with_filters(filters: FilterRegistry) -> Self {
        Self {
            filters,
            parsed: RwLock::new(HashMap::new()),
        }
    }

    /// The filter registry in use.
    pub const fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    fn parsed(&self, source: &str) -> TesseraResult<Arc<Expr>> {
        if let Some(expr) = self
            .parsed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
        {
            return Ok(Arc::clone(expr));
        }
        let expr = Arc::new(expr::parse(source)?);
        self.parsed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    /// Evaluates a filter-free expression. Arithmetic failures yield `None`.
    fn evaluate_base(&self, source: &str, scope: &Context) -> TesseraResult<ContextValue> {
        let expr = self.parsed(source)?;
        let resolve = |path: &str| self.resolve_variable(path, scope);
        match expr::evaluate(&expr, &resolve) {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::debug!(expression = source, error = %err, "expression evaluated to null");
                Ok(ContextValue::None)
            }
        }
    }
}

impl Helpers for DefaultHelpers {
    fn resolve_variable(&self, path: &str, scope: &Context) -> Option<ContextValue> {
        scope.get(path)
    }

    fn apply_filter(
        &self,
        filter: &str,
        value: ContextValue,
        scope: &Context,
    ) -> TesseraResult<ContextValue> {
        let call = parse_filter(filter)?;
        let args = call
            .args
            .iter()
            .map(|arg| self.evaluate_base(arg, scope))
            .collect::<TesseraResult<Vec<_>>>()?;
        self.filters.apply(&call.name, &value, &args)
    }

    fn evaluate_expression(&self, source: &str, scope: &Context) -> TesseraResult<ContextValue> {
        let (base, filters) = split_filters(source);
        let mut value = self.evaluate_base(&base, scope)?;
        for filter in &filters {
            value = self.apply_filter(filter, value, scope)?;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Context {
        let mut ctx = Context::new();
        ctx.set("name", "ada".into());
        ctx.set("count", 3.into());
        ctx.set("items", vec!["a", "b"].into());
        ctx
    }

    #[test]
    fn test_parse_filter_forms() {
        assert_eq!(
            parse_filter("upper").unwrap(),
            FilterCall { name: "upper".into(), args: vec![] }
        );
        assert_eq!(parse_filter("default:\"x\"").unwrap().args, vec!["\"x\""]);
        assert_eq!(
            parse_filter("truncate(10, \"a,b\")").unwrap().args,
            vec!["10", "\"a,b\""]
        );
        assert!(parse_filter("").is_err());
        assert!(parse_filter("upper junk").is_err());
        assert!(parse_filter("default:").is_err());
    }

    #[test]
    fn test_check_expression() {
        assert!(check_expression("a + 1|default(2)|upper").is_ok());
        assert!(check_expression("a +").is_err());
        assert!(check_expression("a|default(1 +)").is_err());
    }

    #[test]
    fn test_evaluate_with_filters() {
        let h = DefaultHelpers::new();
        let v = h.evaluate_expression("name|upper", &scope()).unwrap();
        assert_eq!(v, ContextValue::from("ADA"));
        let v = h.evaluate_expression("count * 2", &scope()).unwrap();
        assert_eq!(v, ContextValue::Integer(6));
        let v = h.evaluate_expression("items|join(sep)", &{
            let mut s = scope();
            s.set("sep", "-".into());
            s
        });
        assert_eq!(v.unwrap(), ContextValue::from("a-b"));
    }

    #[test]
    fn test_arithmetic_errors_become_null() {
        let h = DefaultHelpers::new();
        let v = h.evaluate_expression("count / 0", &scope()).unwrap();
        assert_eq!(v, ContextValue::None);
        assert!(!h.evaluate_condition("count / 0", &scope()).unwrap());
    }

    #[test]
    fn test_unknown_filter_errors() {
        let h = DefaultHelpers::new();
        let err = h.apply_filter("shout", "x".into(), &scope()).unwrap_err();
        assert!(matches!(err, TesseraError::UnknownFilter(_)));
    }

    #[test]
    fn test_default_include_is_not_found() {
        let h = DefaultHelpers::new();
        let err = h.include("x.html", &scope(), ExecutionLimits::default()).unwrap_err();
        assert!(matches!(err, TesseraError::TemplateNotFound(_)));
    }

    #[test]
    fn test_limits_descend() {
        let limits = ExecutionLimits::new(1);
        let once = limits.descend("a").unwrap();
        assert_eq!(once.depth, 1);
        let err = once.descend("a").unwrap_err();
        assert!(matches!(
            err,
            TesseraError::RecursionLimitExceeded { limit: 1, .. }
        ));
    }
}
