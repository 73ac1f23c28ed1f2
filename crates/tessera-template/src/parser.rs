//! Builds an [`Ast`] from a token stream.
//!
//! The builder keeps an explicit stack of open scopes. A start tag pushes a
//! scope, its end tag pops it, and everything in between is attached to the
//! scope's current body. Any nesting mistake is a structural error.

use serde::{Deserialize, Serialize};

use tessera_core::error::{TesseraError, TesseraResult};

use crate::ast::{Ast, MacroParam, NodeId, NodeKind};
use crate::expr::split_top_level;
use crate::lexer::{unquote, Lexer, Token, TokenKind};

/// The output of lexing and parsing one template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTemplate {
    /// The token stream.
    pub tokens: Vec<Token>,
    /// Source after comment removal and whitespace control.
    pub normalized: String,
    /// The syntax tree.
    pub ast: Ast,
}

impl ParsedTemplate {
    /// Lexes and parses `source`.
    pub fn parse(lexer: &Lexer, source: &str) -> TesseraResult<Self> {
        let (normalized, tokens) = lexer.lex(source)?;
        let ast = parse_tokens(&tokens)?;
        Ok(Self {
            tokens,
            normalized,
            ast,
        })
    }
}

struct Frame {
    open: TokenKind,
    node: NodeId,
    body: NodeId,
    has_else: bool,
}

/// Builds the syntax tree for `tokens`.
///
/// # Errors
///
/// Returns [`TesseraError::UnbalancedStructure`] for unmatched or mismatched
/// closers, `else`/`elseif` outside an `if`, `elseif` after `else`, a
/// duplicate `else` and unclosed tags at end of input.
pub fn parse_tokens(tokens: &[Token]) -> TesseraResult<Ast> {
    let mut ast = Ast::new();
    let root = ast.root();
    let mut stack = vec![Frame {
        open: TokenKind::Text,
        node: root,
        body: root,
        has_else: false,
    }];

    for token in tokens {
        let body = stack.last().map_or(root, |f| f.body);
        match token.kind {
            TokenKind::Text => {
                ast.push_child(body, NodeKind::Text(token.raw.clone()));
            }
            TokenKind::Variable => {
                let expr = token.group(0).unwrap_or_default();
                let kind = if is_parent_call(expr) {
                    NodeKind::ParentRef
                } else {
                    NodeKind::Variable(expr.to_string())
                };
                ast.push_child(body, kind);
            }
            TokenKind::ForStart => {
                let mut vars = vec![group(token, 0)?];
                if let Some(second) = token.group(1) {
                    vars.push(second.to_string());
                }
                let node = ast.push_child(
                    body,
                    NodeKind::For {
                        vars,
                        iterable: group(token, 2)?,
                    },
                );
                let seq = ast.push_child(node, NodeKind::Sequence);
                stack.push(Frame {
                    open: TokenKind::ForStart,
                    node,
                    body: seq,
                    has_else: false,
                });
            }
            TokenKind::IfStart => {
                let node = ast.push_child(body, NodeKind::If);
                let branch = ast.push_child(
                    node,
                    NodeKind::Branch {
                        condition: Some(group(token, 0)?),
                    },
                );
                stack.push(Frame {
                    open: TokenKind::IfStart,
                    node,
                    body: branch,
                    has_else: false,
                });
            }
            TokenKind::ElseIf => {
                let frame = current_if(&mut stack, token)?;
                if frame.has_else {
                    return Err(TesseraError::UnbalancedStructure(
                        "'elseif' after 'else' in 'if'".to_string(),
                    ));
                }
                frame.body = ast.push_child(
                    frame.node,
                    NodeKind::Branch {
                        condition: Some(group(token, 0)?),
                    },
                );
            }
            TokenKind::Else => {
                let frame = match stack.last_mut() {
                    Some(f) if matches!(f.open, TokenKind::IfStart | TokenKind::ForStart) => f,
                    _ => {
                        return Err(TesseraError::UnbalancedStructure(
                            "'else' outside of 'if' or 'for'".to_string(),
                        ))
                    }
                };
                if frame.has_else {
                    return Err(TesseraError::UnbalancedStructure(format!(
                        "duplicate 'else' in '{}'",
                        frame.open.keyword()
                    )));
                }
                frame.has_else = true;
                frame.body = if frame.open == TokenKind::IfStart {
                    ast.push_child(frame.node, NodeKind::Branch { condition: None })
                } else {
                    ast.push_child(frame.node, NodeKind::Sequence)
                };
            }
            TokenKind::BlockStart => {
                let node = ast.push_child(
                    body,
                    NodeKind::Block {
                        name: group(token, 0)?,
                    },
                );
                stack.push(Frame {
                    open: TokenKind::BlockStart,
                    node,
                    body: node,
                    has_else: false,
                });
            }
            TokenKind::MacroStart => {
                let node = ast.push_child(
                    body,
                    NodeKind::Macro {
                        name: group(token, 0)?,
                        params: parse_params(token.group(1).unwrap_or_default())?,
                    },
                );
                stack.push(Frame {
                    open: TokenKind::MacroStart,
                    node,
                    body: node,
                    has_else: false,
                });
            }
            TokenKind::ForEnd | TokenKind::IfEnd | TokenKind::BlockEnd | TokenKind::MacroEnd => {
                close(&mut stack, token.kind)?;
            }
            TokenKind::Import => {
                ast.push_child(
                    body,
                    NodeKind::Import {
                        path: unquote(&group(token, 0)?).to_string(),
                        alias: group(token, 1)?,
                    },
                );
            }
            TokenKind::Extends => {
                ast.push_child(
                    body,
                    NodeKind::Extends {
                        parent: unquote(&group(token, 0)?).to_string(),
                    },
                );
            }
            TokenKind::Include => {
                ast.push_child(
                    body,
                    NodeKind::Include {
                        target: group(token, 0)?,
                    },
                );
            }
        }
    }

    if let Some(open) = stack.iter().skip(1).last() {
        return Err(TesseraError::UnbalancedStructure(format!(
            "unclosed '{}' tag at end of template",
            open.open.keyword()
        )));
    }

    Ok(ast)
}

fn group(token: &Token, index: usize) -> TesseraResult<String> {
    token.group(index).map(str::to_string).ok_or_else(|| {
        TesseraError::SyntaxError(format!("malformed '{}' tag: {}", token.kind.keyword(), token.raw))
    })
}

fn is_parent_call(expr: &str) -> bool {
    expr.strip_prefix("parent")
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix('('))
        .is_some_and(|rest| rest.trim() == ")")
}

fn current_if<'a>(stack: &'a mut [Frame], token: &Token) -> TesseraResult<&'a mut Frame> {
    match stack.last_mut() {
        Some(f) if f.open == TokenKind::IfStart => Ok(f),
        _ => Err(TesseraError::UnbalancedStructure(format!(
            "'{}' outside of 'if'",
            token.kind.keyword()
        ))),
    }
}

fn close(stack: &mut Vec<Frame>, closer: TokenKind) -> TesseraResult<()> {
    let expected = match closer {
        TokenKind::ForEnd => TokenKind::ForStart,
        TokenKind::IfEnd => TokenKind::IfStart,
        TokenKind::BlockEnd => TokenKind::BlockStart,
        _ => TokenKind::MacroStart,
    };

    if stack.len() <= 1 {
        return Err(TesseraError::UnbalancedStructure(format!(
            "'{}' without matching '{}'",
            closer.keyword(),
            expected.keyword()
        )));
    }

    let open = stack.last().map_or(TokenKind::Text, |f| f.open);
    if open != expected {
        return Err(TesseraError::UnbalancedStructure(format!(
            "'{}' found while '{}' is open",
            closer.keyword(),
            open.keyword()
        )));
    }

    stack.pop();
    Ok(())
}

/// Parses a macro parameter list such as `name, greeting="Hello"`.
pub fn parse_params(params: &str) -> TesseraResult<Vec<MacroParam>> {
    let mut out: Vec<MacroParam> = Vec::new();
    for raw in split_top_level(params, ',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (name, default) = match raw.split_once('=') {
            Some((name, default)) => (name.trim(), Some(default.trim().to_string())),
            None => (raw, None),
        };
        let valid = name
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        if !valid || default.as_deref() == Some("") {
            return Err(TesseraError::SyntaxError(format!(
                "invalid macro parameter '{raw}'"
            )));
        }
        if out.iter().any(|p| p.name == name) {
            return Err(TesseraError::SyntaxError(format!(
                "duplicate macro parameter '{name}'"
            )));
        }
        out.push(MacroParam {
            name: name.to_string(),
            default,
        });
    }
    Ok(out)
}
