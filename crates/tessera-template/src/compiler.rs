//! Lowers a resolved template tree to a flat instruction list.
//!
//! Control flow becomes forward and backward jumps. Jump targets are unknown
//! while a construct is being emitted, so they are written as [`FIXME`] and
//! patched once the target is reached.
//!
//! Compiled templates are plain data: they serialize with serde and are
//! executed against a [`Context`] through a [`Helpers`] implementation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tessera_core::error::{TesseraError, TesseraResult};

use crate::ast::{Ast, NodeId, NodeKind};
use crate::context::{escape_html, Context, ContextValue};
use crate::expr::{self, is_plain_path, split_filters};
use crate::helpers::{check_expression, parse_filter, ExecutionLimits, Helpers};
use crate::lexer::unquote;

/// Placeholder for a jump target that has not been emitted yet.
pub const FIXME: usize = !0;

/// Where an emitted value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueSource {
    /// A dotted variable path, looked up directly.
    Path(String),
    /// Any other expression.
    Expression(String),
}

/// A single executable step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instr {
    /// Write literal text.
    EmitText(String),
    /// Evaluate, filter and write a value.
    EmitValue {
        source: ValueSource,
        filters: Vec<String>,
        escape: bool,
    },
    /// Jump to `target` when `condition` is falsy.
    JumpIfFalse { condition: String, target: usize },
    /// Unconditional jump.
    Jump(usize),
    /// Evaluate `iterable`. Empty iterables jump to `else_target`; otherwise
    /// a loop frame is opened and execution falls through to [`Instr::LoopNext`].
    LoopStart {
        vars: Vec<String>,
        iterable: String,
        else_target: usize,
        end_target: usize,
    },
    /// Bind the next item and the `loop` record, or close the frame and jump
    /// to `end_target` when the items are exhausted.
    LoopNext { end_target: usize },
    /// Evaluate `bindings` in the current scope and push them as a new scope.
    PushScope {
        bindings: Vec<(String, String)>,
        isolated: bool,
    },
    PopScope,
    /// Start capturing output.
    CaptureStart,
    /// Stop capturing and emit the captured text through `filters`.
    CaptureEnd { filters: Vec<String>, escape: bool },
    /// Render another template in place.
    Include { target: String },
}

/// An executable template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledTemplate {
    pub name: String,
    pub instructions: Vec<Instr>,
    /// The file the template was loaded from, if any.
    pub origin: Option<PathBuf>,
    /// Files of parents and imported templates this one was built from.
    pub dependencies: Vec<PathBuf>,
}

/// Filters after which a value is never auto-escaped.
fn ends_escaped(filters: &[String]) -> bool {
    filters.last().is_some_and(|last| {
        parse_filter(last).is_ok_and(|call| matches!(call.name.as_str(), "safe" | "escape" | "e"))
    })
}

/// Builds [`CompiledTemplate`]s.
#[derive(Debug)]
pub struct Compiler {
    instrs: Vec<Instr>,
    auto_escape: bool,
}

impl Compiler {
    pub const fn new(auto_escape: bool) -> Self {
        Self {
            instrs: Vec::new(),
            auto_escape,
        }
    }

    /// Compiles a fully resolved tree.
    ///
    /// Every expression is syntax-checked here, so a template that compiles
    /// cannot fail to parse at render time.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::SyntaxError`] for a malformed expression or
    /// filter, and [`TesseraError::UnbalancedStructure`] for nodes that
    /// inheritance or macro expansion should have removed.
    pub fn compile(
        mut self,
        name: &str,
        ast: &Ast,
        origin: Option<PathBuf>,
        dependencies: Vec<PathBuf>,
    ) -> TesseraResult<CompiledTemplate> {
        self.compile_children(ast, ast.root())?;
        if let Some(i) = self.instrs.iter().position(has_fixme) {
            return Err(TesseraError::CompileError(format!(
                "jump at {i} was never patched"
            )));
        }
        Ok(CompiledTemplate {
            name: name.to_string(),
            instructions: self.instrs,
            origin,
            dependencies,
        })
    }

    fn push(&mut self, instr: Instr) -> usize {
        let i = self.instrs.len();
        self.instrs.push(instr);
        i
    }

    /// Points the jump at `i` to the next instruction to be emitted.
    fn update_jump(&mut self, i: usize) -> TesseraResult<()> {
        let next = self.instrs.len();
        match self.instrs.get_mut(i) {
            Some(Instr::Jump(target) | Instr::JumpIfFalse { target, .. }) => *target = next,
            Some(Instr::LoopNext { end_target }) => *end_target = next,
            other => {
                return Err(TesseraError::CompileError(format!(
                    "no jump to patch at {i}: {other:?}"
                )));
            }
        }
        Ok(())
    }

    fn compile_children(&mut self, ast: &Ast, id: NodeId) -> TesseraResult<()> {
        for &child in ast.children(id) {
            self.compile_node(ast, child)?;
        }
        Ok(())
    }

    fn escape_for(&self, filters: &[String]) -> bool {
        self.auto_escape && !ends_escaped(filters)
    }

    fn compile_node(&mut self, ast: &Ast, id: NodeId) -> TesseraResult<()> {
        match ast.kind(id) {
            NodeKind::Root | NodeKind::Sequence | NodeKind::Block { .. } => {
                self.compile_children(ast, id)?;
            }
            NodeKind::Text(text) => {
                if !text.is_empty() {
                    self.push(Instr::EmitText(text.clone()));
                }
            }
            NodeKind::Variable(source) => {
                check_expression(source)?;
                let (base, filters) = split_filters(source);
                let escape = self.escape_for(&filters);
                let source = if is_plain_path(&base) {
                    ValueSource::Path(base)
                } else {
                    ValueSource::Expression(base)
                };
                self.push(Instr::EmitValue {
                    source,
                    filters,
                    escape,
                });
            }
            NodeKind::If => self.compile_if(ast, id)?,
            NodeKind::For { vars, iterable } => {
                check_expression(iterable)?;
                let start = self.push(Instr::LoopStart {
                    vars: vars.clone(),
                    iterable: iterable.clone(),
                    else_target: FIXME,
                    end_target: FIXME,
                });
                let next = self.push(Instr::LoopNext { end_target: FIXME });
                let children = ast.children(id);
                if let Some(&body) = children.first() {
                    self.compile_node(ast, body)?;
                }
                self.push(Instr::Jump(next));
                let else_target = self.instrs.len();
                if let Some(&otherwise) = children.get(1) {
                    self.compile_node(ast, otherwise)?;
                }
                let end = self.instrs.len();
                if let Instr::LoopStart {
                    else_target: e,
                    end_target: t,
                    ..
                } = &mut self.instrs[start]
                {
                    *e = else_target;
                    *t = end;
                }
                self.update_jump(next)?;
            }
            NodeKind::Scope { bindings } => {
                for (_, value) in bindings {
                    check_expression(value)?;
                }
                self.push(Instr::PushScope {
                    bindings: bindings.clone(),
                    isolated: true,
                });
                self.compile_children(ast, id)?;
                self.push(Instr::PopScope);
            }
            NodeKind::Filtered { filters } => {
                for filter in filters {
                    for arg in parse_filter(filter)?.args {
                        expr::parse(&arg)?;
                    }
                }
                self.push(Instr::CaptureStart);
                self.compile_children(ast, id)?;
                let escape = self.escape_for(filters);
                self.push(Instr::CaptureEnd {
                    filters: filters.clone(),
                    escape,
                });
            }
            NodeKind::Include { target } => {
                if unquote(target) == target.as_str() {
                    check_expression(target)?;
                }
                self.push(Instr::Include {
                    target: target.clone(),
                });
            }
            // Definitions produce no output of their own.
            NodeKind::Macro { .. } | NodeKind::Import { .. } | NodeKind::Extends { .. } => {}
            NodeKind::ParentRef => {
                return Err(TesseraError::UnbalancedStructure(
                    "parent() used outside an overriding block".to_string(),
                ));
            }
            NodeKind::Branch { .. } => {
                return Err(TesseraError::UnbalancedStructure(
                    "branch outside an if".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn compile_if(&mut self, ast: &Ast, id: NodeId) -> TesseraResult<()> {
        let mut exits = Vec::new();
        for &branch in ast.children(id) {
            let NodeKind::Branch { condition } = ast.kind(branch) else {
                continue;
            };
            match condition {
                Some(condition) => {
                    check_expression(condition)?;
                    let skip = self.push(Instr::JumpIfFalse {
                        condition: condition.clone(),
                        target: FIXME,
                    });
                    self.compile_children(ast, branch)?;
                    exits.push(self.push(Instr::Jump(FIXME)));
                    self.update_jump(skip)?;
                }
                None => self.compile_children(ast, branch)?,
            }
        }
        for exit in exits {
            self.update_jump(exit)?;
        }
        Ok(())
    }
}

fn has_fixme(instr: &Instr) -> bool {
    match instr {
        Instr::Jump(t) | Instr::JumpIfFalse { target: t, .. } | Instr::LoopNext { end_target: t } => {
            *t == FIXME
        }
        Instr::LoopStart {
            else_target,
            end_target,
            ..
        } => *else_target == FIXME || *end_target == FIXME,
        _ => false,
    }
}

/// One active `for` loop.
struct LoopFrame {
    vars: Vec<String>,
    items: Vec<Vec<ContextValue>>,
    next: usize,
    parent: ContextValue,
}

impl LoopFrame {
    fn record(&self, index0: usize) -> ContextValue {
        let length = self.items.len();
        let mut record = std::collections::BTreeMap::new();
        record.insert("index".to_string(), ContextValue::from(index0 + 1));
        record.insert("index0".to_string(), ContextValue::from(index0));
        record.insert("first".to_string(), ContextValue::Bool(index0 == 0));
        record.insert("last".to_string(), ContextValue::Bool(index0 + 1 == length));
        record.insert("length".to_string(), ContextValue::from(length));
        record.insert("revindex".to_string(), ContextValue::from(length - index0));
        record.insert("revindex0".to_string(), ContextValue::from(length - index0 - 1));
        record.insert("parent".to_string(), self.parent.clone());
        ContextValue::Dict(record)
    }
}

/// Splits a value into per-iteration bindings for `var_count` loop variables.
///
/// Dicts yield their keys, or key and value with two variables. Lists yield
/// their items, or index and item with two variables. Strings yield
/// characters. Anything else iterates zero times.
fn iteration_items(value: &ContextValue, var_count: usize) -> Vec<Vec<ContextValue>> {
    let pair = var_count > 1;
    match value {
        ContextValue::List(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                if pair {
                    vec![ContextValue::from(i), item.clone()]
                } else {
                    vec![item.clone()]
                }
            })
            .collect(),
        ContextValue::Dict(map) => map
            .iter()
            .map(|(k, v)| {
                if pair {
                    vec![ContextValue::from(k.as_str()), v.clone()]
                } else {
                    vec![ContextValue::from(k.as_str())]
                }
            })
            .collect(),
        ContextValue::String(s) | ContextValue::SafeString(s) => s
            .chars()
            .map(|c| vec![ContextValue::String(c.to_string())])
            .collect(),
        _ => Vec::new(),
    }
}

fn write_value(out: &mut String, value: &ContextValue, escape: bool) {
    let text = value.to_display_string();
    if escape && !value.is_safe() {
        out.push_str(&escape_html(&text));
    } else {
        out.push_str(&text);
    }
}

impl CompiledTemplate {
    /// Renders the template for a top-level call.
    ///
    /// # Errors
    ///
    /// Propagates filter, include and recursion errors from `helpers`.
    pub fn execute(&self, variables: &Context, helpers: &dyn Helpers) -> TesseraResult<String> {
        self.execute_with(variables, helpers, ExecutionLimits::default())
    }

    /// Renders the template at a given include depth.
    ///
    /// # Errors
    ///
    /// Propagates filter, include and recursion errors from `helpers`.
    pub fn execute_with(
        &self,
        variables: &Context,
        helpers: &dyn Helpers,
        limits: ExecutionLimits,
    ) -> TesseraResult<String> {
        let mut scope = variables.clone();
        let mut outputs = vec![String::new()];
        let mut loops: Vec<LoopFrame> = Vec::new();
        let mut pc = 0;

        while let Some(instr) = self.instructions.get(pc) {
            match instr {
                Instr::EmitText(text) => outputs.last_mut().ok_or_else(corrupt)?.push_str(text),
                Instr::EmitValue {
                    source,
                    filters,
                    escape,
                } => {
                    let mut value = match source {
                        ValueSource::Path(path) => helpers
                            .resolve_variable(path, &scope)
                            .unwrap_or(ContextValue::None),
                        ValueSource::Expression(e) => helpers.evaluate_expression(e, &scope)?,
                    };
                    for filter in filters {
                        value = helpers.apply_filter(filter, value, &scope)?;
                    }
                    let out = outputs.last_mut().ok_or_else(corrupt)?;
                    write_value(out, &value, *escape);
                }
                Instr::JumpIfFalse { condition, target } => {
                    if !helpers.evaluate_condition(condition, &scope)? {
                        pc = *target;
                        continue;
                    }
                }
                Instr::Jump(target) => {
                    pc = *target;
                    continue;
                }
                Instr::LoopStart {
                    vars,
                    iterable,
                    else_target,
                    ..
                } => {
                    let value = helpers.evaluate_expression(iterable, &scope)?;
                    let items = iteration_items(&value, vars.len());
                    if items.is_empty() {
                        pc = *else_target;
                        continue;
                    }
                    let parent = scope.get("loop").unwrap_or(ContextValue::None);
                    scope.push();
                    loops.push(LoopFrame {
                        vars: vars.clone(),
                        items,
                        next: 0,
                        parent,
                    });
                }
                Instr::LoopNext { end_target } => {
                    let frame = loops.last_mut().ok_or_else(corrupt)?;
                    if frame.next >= frame.items.len() {
                        loops.pop();
                        scope.pop();
                        pc = *end_target;
                        continue;
                    }
                    let index = frame.next;
                    frame.next += 1;
                    for (var, value) in frame.vars.iter().zip(&frame.items[index]) {
                        scope.set(var.clone(), value.clone());
                    }
                    scope.set("loop", frame.record(index));
                }
                Instr::PushScope { bindings, isolated } => {
                    let values = bindings
                        .iter()
                        .map(|(name, e)| Ok((name.clone(), helpers.evaluate_expression(e, &scope)?)))
                        .collect::<TesseraResult<Vec<_>>>()?;
                    if *isolated {
                        scope.push_isolated();
                    } else {
                        scope.push();
                    }
                    for (name, value) in values {
                        scope.set(name, value);
                    }
                }
                Instr::PopScope => scope.pop(),
                Instr::CaptureStart => outputs.push(String::new()),
                Instr::CaptureEnd { filters, escape } => {
                    let captured = if outputs.len() > 1 { outputs.pop() } else { None };
                    let mut value = ContextValue::SafeString(captured.ok_or_else(corrupt)?);
                    for filter in filters {
                        value = helpers.apply_filter(filter, value, &scope)?;
                    }
                    let out = outputs.last_mut().ok_or_else(corrupt)?;
                    write_value(out, &value, *escape);
                }
                Instr::Include { target } => {
                    let unquoted = unquote(target);
                    let name = if unquoted == target.as_str() {
                        helpers.evaluate_expression(target, &scope)?.to_display_string()
                    } else {
                        unquoted.to_string()
                    };
                    let nested = limits.descend(&name)?;
                    let rendered = helpers.include(&name, &scope, nested)?;
                    let out = outputs.last_mut().ok_or_else(corrupt)?;
                    out.push_str(&rendered);
                }
            }
            pc += 1;
        }

        if outputs.len() != 1 {
            return Err(corrupt());
        }
        Ok(outputs.pop().unwrap_or_default())
    }
}

fn corrupt() -> TesseraError {
    TesseraError::UnbalancedStructure("malformed instruction stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::DefaultHelpers;
    use crate::lexer::Lexer;
    use crate::parser::ParsedTemplate;

    fn compile(src: &str) -> CompiledTemplate {
        let parsed = ParsedTemplate::parse(&Lexer::default(), src).unwrap();
        Compiler::new(true)
            .compile("test", &parsed.ast, None, Vec::new())
            .unwrap()
    }

    fn render(src: &str, ctx: &Context) -> String {
        compile(src).execute(ctx, &DefaultHelpers::new()).unwrap()
    }

    #[test]
    fn test_if_chain_jumps() {
        let t = compile("{% if a %}A{% elseif b %}B{% else %}C{% endif %}");
        assert_eq!(
            t.instructions,
            vec![
                Instr::JumpIfFalse { condition: "a".into(), target: 3 },
                Instr::EmitText("A".into()),
                Instr::Jump(7),
                Instr::JumpIfFalse { condition: "b".into(), target: 6 },
                Instr::EmitText("B".into()),
                Instr::Jump(7),
                Instr::EmitText("C".into()),
            ]
        );
    }

    #[test]
    fn test_loop_layout() {
        let t = compile("{% for x in xs %}{{ x }}{% else %}none{% endfor %}");
        assert_eq!(
            t.instructions[0],
            Instr::LoopStart {
                vars: vec!["x".into()],
                iterable: "xs".into(),
                else_target: 4,
                end_target: 5,
            }
        );
        assert_eq!(t.instructions[1], Instr::LoopNext { end_target: 5 });
        assert_eq!(t.instructions[3], Instr::Jump(1));
    }

    #[test]
    fn test_plain_paths_and_expressions() {
        let t = compile("{{ user.name }}{{ a + 1 }}");
        assert!(matches!(
            &t.instructions[0],
            Instr::EmitValue { source: ValueSource::Path(p), .. } if p == "user.name"
        ));
        assert!(matches!(
            &t.instructions[1],
            Instr::EmitValue { source: ValueSource::Expression(_), .. }
        ));
    }

    #[test]
    fn test_syntax_checked_at_compile_time() {
        let parsed = ParsedTemplate::parse(&Lexer::default(), "{{ a + }}").unwrap();
        let err = Compiler::new(true)
            .compile("bad", &parsed.ast, None, Vec::new())
            .unwrap_err();
        assert!(matches!(err, TesseraError::SyntaxError(_)));
    }

    #[test]
    fn test_patching_a_non_jump_is_an_error() {
        let mut compiler = Compiler::new(true);
        compiler.push(Instr::EmitText("x".into()));
        assert!(matches!(
            compiler.update_jump(0),
            Err(TesseraError::CompileError(_))
        ));
        assert!(compiler.update_jump(5).is_err());

        let jump = compiler.push(Instr::Jump(FIXME));
        compiler.update_jump(jump).unwrap();
        assert_eq!(compiler.instrs[jump], Instr::Jump(2));
    }

    #[test]
    fn test_escape_flag() {
        let t = compile("{{ a }}{{ a|safe }}{{ a|e }}{{ a|upper }}");
        let flags: Vec<bool> = t
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instr::EmitValue { escape, .. } => Some(*escape),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![true, false, false, true]);
    }

    #[test]
    fn test_render_escapes_unless_safe() {
        let mut ctx = Context::new();
        ctx.set("a", "<b>".into());
        ctx.set("s", ContextValue::SafeString("<i>".into()));
        assert_eq!(render("{{ a }}|{{ a|safe }}|{{ s }}", &ctx), "&lt;b&gt;|<b>|<i>");
    }

    #[test]
    fn test_render_loop_record() {
        let mut ctx = Context::new();
        ctx.set("xs", vec!["a", "b", "c"].into());
        assert_eq!(
            render(
                "{% for x in xs %}{{ loop.index }}{{ x }}{% if loop.last %}.{% else %},{% endif %}{% endfor %}",
                &ctx
            ),
            "1a,2b,3c."
        );
        assert_eq!(
            render("{% for x in xs %}{{ loop.revindex0 }}{% endfor %}", &ctx),
            "210"
        );
    }

    #[test]
    fn test_render_loop_else_and_scope() {
        let mut ctx = Context::new();
        ctx.set("x", "outer".into());
        ctx.set("empty", ContextValue::List(vec![]));
        ctx.set("xs", vec![1i32, 2].into());
        assert_eq!(
            render("{% for x in empty %}{{ x }}{% else %}none{% endfor %}", &ctx),
            "none"
        );
        assert_eq!(render("{% for x in xs %}{{ x }}{% endfor %}{{ x }}", &ctx), "12outer");
    }

    #[test]
    fn test_render_nested_loop_parent() {
        let mut ctx = Context::new();
        ctx.set("rows", vec![vec![1i32, 2], vec![3]].into());
        assert_eq!(
            render(
                "{% for row in rows %}{% for c in row %}{{ loop.parent.index }}:{{ c }} {% endfor %}{% endfor %}",
                &ctx
            ),
            "1:1 1:2 2:3 "
        );
    }

    #[test]
    fn test_render_dict_pairs() {
        let mut ctx = Context::new();
        let mut map = std::collections::BTreeMap::new();
        map.insert("a".to_string(), 1i32);
        map.insert("b".to_string(), 2i32);
        ctx.set("m", map.into());
        assert_eq!(render("{% for k in m %}{{ k }}{% endfor %}", &ctx), "ab");
        assert_eq!(
            render("{% for k, v in m %}{{ k }}={{ v }};{% endfor %}", &ctx),
            "a=1;b=2;"
        );
    }

    #[test]
    fn test_capture_applies_filters_once() {
        let parsed = ParsedTemplate::parse(&Lexer::default(), "x").unwrap();
        let mut ast = parsed.ast.clone();
        let root = ast.root();
        let filtered = ast.push_child(
            root,
            NodeKind::Filtered {
                filters: vec!["upper".into()],
            },
        );
        ast.push_child(filtered, NodeKind::Variable("a".into()));
        let t = Compiler::new(true)
            .compile("cap", &ast, None, Vec::new())
            .unwrap();
        let mut ctx = Context::new();
        ctx.set("a", "<b>".into());
        assert_eq!(t.execute(&ctx, &DefaultHelpers::new()).unwrap(), "x&LT;B&GT;");
    }

    #[test]
    fn test_isolated_scope_hides_outer() {
        let parsed = ParsedTemplate::parse(&Lexer::default(), "").unwrap();
        let mut ast = parsed.ast.clone();
        let root = ast.root();
        let scope = ast.push_child(
            root,
            NodeKind::Scope {
                bindings: vec![("who".into(), "name|upper".into())],
            },
        );
        ast.push_child(scope, NodeKind::Variable("who".into()));
        ast.push_child(scope, NodeKind::Variable("name".into()));
        let t = Compiler::new(true)
            .compile("scope", &ast, None, Vec::new())
            .unwrap();
        let mut ctx = Context::new();
        ctx.set("name", "ada".into());
        assert_eq!(t.execute(&ctx, &DefaultHelpers::new()).unwrap(), "ADA");
    }

    #[test]
    fn test_include_without_host_fails() {
        let t = compile("{% include \"other.html\" %}");
        let err = t.execute(&Context::new(), &DefaultHelpers::new()).unwrap_err();
        assert!(matches!(err, TesseraError::TemplateNotFound(ref n) if n == "other.html"));
    }

    #[test]
    fn test_serde_roundtrip_preserves_behavior() {
        let t = compile("{% for x in xs %}{{ x }}{% endfor %}");
        let json = serde_json::to_string(&t).unwrap();
        let back: CompiledTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
