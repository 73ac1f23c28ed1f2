//! Macro definition collection and call-site expansion.
//!
//! ```text
//! {% macro greet(name, greeting="Hi") %}{{ greeting }}, {{ name }}!{% endmacro %}
//! {{ greet("Bob") }}          -> Hi, Bob!
//! {{ greet("Bob", "Yo") }}    -> Yo, Bob!
//! {% import "forms.html" as f %}{{ f.field("email") }}
//! ```
//!
//! Each call expands into an isolated scope node holding the bound
//! parameters and a copy of the macro body. Arguments and defaults are
//! evaluated in the caller's scope when the scope is entered.

use std::collections::HashMap;

use regex::Regex;

use tessera_core::error::{TesseraError, TesseraResult};

use crate::ast::{Ast, MacroParam, NodeId, NodeKind};
use crate::expr::{split_filters, split_top_level};
use crate::inheritance::AstSource;

/// A collected macro.
#[derive(Debug, Clone)]
pub struct MacroDef {
    /// Declared parameters, in order.
    pub params: Vec<MacroParam>,
    /// The macro body as a standalone tree.
    pub body: Ast,
}

/// A parsed call site: `name(args)` with an optional filter chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroCall {
    /// Callee, possibly `alias.name`.
    pub name: String,
    /// Raw argument expressions.
    pub args: Vec<String>,
    /// Filters applied to the captured output.
    pub filters: Vec<String>,
}

/// Collects macros and rewrites call sites.
pub struct MacroProcessor<'a> {
    source: &'a dyn AstSource,
    call: Regex,
}

impl<'a> MacroProcessor<'a> {
    /// Creates a processor that loads imported templates from `source`.
    pub fn new(source: &'a dyn AstSource) -> Self {
        Self {
            source,
            call: Regex::new(r"^([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)\s*\((.*)\)$")
                .expect("built-in pattern is valid"),
        }
    }

    /// Parses `expr` as a call site, if it is one.
    pub fn parse_call(&self, expr: &str) -> Option<MacroCall> {
        let (base, filters) = split_filters(expr);
        let caps = self.call.captures(&base)?;
        let name = caps.get(1)?.as_str().to_string();
        let inner = caps.get(2)?.as_str();
        if !parens_balanced(inner) {
            // e.g. `f(1) + g(2)`: not a single call.
            return None;
        }
        let args = split_top_level(inner, ',')
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        Some(MacroCall {
            name,
            args,
            filters,
        })
    }

    /// Collects every macro defined in `ast` and every macro imported by it.
    pub fn collect(&self, ast: &Ast) -> TesseraResult<HashMap<String, MacroDef>> {
        let mut registry = HashMap::new();
        collect_defs(ast, None, &mut registry);

        for id in ast.walk() {
            if let NodeKind::Import { path, alias } = ast.kind(id) {
                let imported = self.source.load_ast(path)?;
                collect_defs(&imported, Some(alias.as_str()), &mut registry);
            }
        }

        for (name, def) in &registry {
            for id in def.body.walk() {
                if let NodeKind::Variable(expr) = def.body.kind(id) {
                    if let Some(inner) = self.parse_call(expr) {
                        return Err(TesseraError::Unsupported(format!(
                            "macro '{name}' calls macro '{}'; nested macro calls are not supported",
                            inner.name
                        )));
                    }
                }
            }
        }

        Ok(registry)
    }

    /// Returns a copy of `ast` with every call site expanded and every macro
    /// definition and import removed.
    ///
    /// # Errors
    ///
    /// - [`TesseraError::UndefinedMacro`] for an unregistered callee.
    /// - [`TesseraError::MissingRequiredParameter`] when a parameter has
    ///   neither an argument nor a default.
    /// - [`TesseraError::SyntaxError`] for too many arguments.
    /// - [`TesseraError::Unsupported`] when a macro body calls a macro.
    pub fn expand(&self, ast: &Ast) -> TesseraResult<Ast> {
        let registry = self.collect(ast)?;
        tracing::debug!(macros = registry.len(), "collected macros");

        let mut out = Ast::new();
        let root = out.root();
        for &child in ast.children(ast.root()) {
            self.rewrite(ast, child, &mut out, root, &registry)?;
        }
        Ok(out)
    }

    fn rewrite(
        &self,
        src: &Ast,
        id: NodeId,
        out: &mut Ast,
        parent: NodeId,
        registry: &HashMap<String, MacroDef>,
    ) -> TesseraResult<()> {
        match src.kind(id) {
            NodeKind::Macro { .. } | NodeKind::Import { .. } => Ok(()),
            NodeKind::Variable(expr) => {
                match self.parse_call(expr) {
                    Some(call) => expand_call(&call, registry, out, parent)?,
                    None => {
                        out.push_child(parent, NodeKind::Variable(expr.clone()));
                    }
                }
                Ok(())
            }
            other => {
                let copy = out.push_child(parent, other.clone());
                for &child in src.children(id) {
                    self.rewrite(src, child, out, copy, registry)?;
                }
                Ok(())
            }
        }
    }
}

fn collect_defs(ast: &Ast, alias: Option<&str>, registry: &mut HashMap<String, MacroDef>) {
    for id in ast.walk() {
        if let NodeKind::Macro { name, params } = ast.kind(id) {
            let key = alias.map_or_else(|| name.clone(), |a| format!("{a}.{name}"));
            registry.entry(key).or_insert_with(|| MacroDef {
                params: params.clone(),
                body: Ast::from_children(ast, id),
            });
        }
    }
}

/// Binds call arguments to parameters: positional first, then defaults.
pub fn bind_arguments(
    macro_name: &str,
    params: &[MacroParam],
    args: &[String],
) -> TesseraResult<Vec<(String, String)>> {
    if args.len() > params.len() {
        return Err(TesseraError::SyntaxError(format!(
            "macro '{macro_name}' takes {} argument(s) but {} were given",
            params.len(),
            args.len()
        )));
    }

    params
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let value = args
                .get(i)
                .cloned()
                .or_else(|| param.default.clone())
                .ok_or_else(|| TesseraError::MissingRequiredParameter {
                    macro_name: macro_name.to_string(),
                    parameter: param.name.clone(),
                })?;
            Ok((param.name.clone(), value))
        })
        .collect()
}

fn expand_call(
    call: &MacroCall,
    registry: &HashMap<String, MacroDef>,
    out: &mut Ast,
    parent: NodeId,
) -> TesseraResult<()> {
    let def = registry
        .get(&call.name)
        .ok_or_else(|| TesseraError::UndefinedMacro(call.name.clone()))?;
    let bindings = bind_arguments(&call.name, &def.params, &call.args)?;

    let holder = if call.filters.is_empty() {
        parent
    } else {
        out.push_child(
            parent,
            NodeKind::Filtered {
                filters: call.filters.clone(),
            },
        )
    };
    let scope = out.push_child(holder, NodeKind::Scope { bindings });
    out.copy_children_into(scope, &def.body, def.body.root());
    Ok(())
}

fn parens_balanced(s: &str) -> bool {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in s.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}
