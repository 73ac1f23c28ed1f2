//! Template lexer (tokenizer).
//!
//! Converts raw template source into a stream of [`Token`]s: text runs,
//! variable expressions (`{{ }}`) and typed block tags (`{% %}`). Comments
//! (`{# #}`) and whitespace-control markers are handled by a pre-pass before
//! scanning.
//!
//! Tags that do not match the tag grammar are kept as literal text rather
//! than rejected.

use regex::Regex;
use serde::{Deserialize, Serialize};

use tessera_core::error::{TesseraError, TesseraResult};

/// The kind of a [`Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    /// A literal text run.
    Text,
    /// `{{ expression }}`
    Variable,
    /// `{% for x in xs %}` / `{% for k, v in map %}`
    ForStart,
    /// `{% endfor %}`
    ForEnd,
    /// `{% if cond %}`
    IfStart,
    /// `{% elseif cond %}` / `{% elif cond %}`
    ElseIf,
    /// `{% else %}`
    Else,
    /// `{% endif %}`
    IfEnd,
    /// `{% block name %}`
    BlockStart,
    /// `{% endblock %}` / `{% endblock name %}`
    BlockEnd,
    /// `{% macro name(params) %}`
    MacroStart,
    /// `{% endmacro %}`
    MacroEnd,
    /// `{% import "file" as alias %}`
    Import,
    /// `{% extends "file" %}`
    Extends,
    /// `{% include "file" %}` / `{% include expr %}`
    Include,
}

impl TokenKind {
    /// The tag keyword, used in error messages.
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Variable => "variable",
            Self::ForStart => "for",
            Self::ForEnd => "endfor",
            Self::IfStart => "if",
            Self::ElseIf => "elseif",
            Self::Else => "else",
            Self::IfEnd => "endif",
            Self::BlockStart => "block",
            Self::BlockEnd => "endblock",
            Self::MacroStart => "macro",
            Self::MacroEnd => "endmacro",
            Self::Import => "import",
            Self::Extends => "extends",
            Self::Include => "include",
        }
    }
}

/// A token produced by the [`Lexer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// What kind of token this is.
    pub kind: TokenKind,
    /// The exact source text of the token.
    pub raw: String,
    /// Captured groups of the tag grammar. For `Text` and `Variable` this
    /// holds the text and the trimmed expression respectively.
    pub groups: Vec<Option<String>>,
}

impl Token {
    fn text(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            kind: TokenKind::Text,
            groups: vec![Some(raw.clone())],
            raw,
        }
    }

    /// Returns capture group `index`, if it participated in the match.
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(Option::as_deref)
    }
}

fn pattern(re: &str) -> Regex {
    Regex::new(re).expect("built-in pattern is valid")
}

/// A tag pattern. Tag bodies may span lines.
fn tag(re: &str) -> Regex {
    pattern(&format!("(?s){re}"))
}

/// Tokenizer for template source.
///
/// The compiled tag grammar is owned by the instance, so build one lexer and
/// reuse it.
///
/// # Examples
///
/// ```
/// use tessera_template::lexer::{Lexer, TokenKind};
///
/// let lexer = Lexer::new(1024);
/// let tokens = lexer.tokenize("Hi {{ name }}{% if x %}!{% endif %}").unwrap();
/// let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
/// assert_eq!(
///     kinds,
///     vec![TokenKind::Text, TokenKind::Variable, TokenKind::IfStart, TokenKind::Text, TokenKind::IfEnd]
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Lexer {
    grammar: Vec<(TokenKind, Regex)>,
    comment: Regex,
    trim_before: Regex,
    trim_after: Regex,
    max_bytes: usize,
}

impl Lexer {
    /// Creates a lexer that rejects sources larger than `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        let grammar = vec![
            (
                TokenKind::ForStart,
                tag(r"^for\s+([A-Za-z_]\w*)(?:\s*,\s*([A-Za-z_]\w*))?\s+in\s+(.+)$"),
            ),
            (TokenKind::ForEnd, tag(r"^endfor$")),
            (TokenKind::IfStart, tag(r"^if\s+(.+)$")),
            (TokenKind::ElseIf, tag(r"^(?:elseif|elif)\s+(.+)$")),
            (TokenKind::Else, tag(r"^else$")),
            (TokenKind::IfEnd, tag(r"^endif$")),
            (TokenKind::BlockStart, tag(r"^block\s+([A-Za-z_][\w-]*)$")),
            (TokenKind::BlockEnd, tag(r"^endblock(?:\s+[A-Za-z_][\w-]*)?$")),
            (
                TokenKind::MacroStart,
                tag(r"^macro\s+([A-Za-z_]\w*)\s*\((.*)\)$"),
            ),
            (TokenKind::MacroEnd, tag(r"^endmacro$")),
            (
                TokenKind::Import,
                tag(r#"^import\s+("[^"]*"|'[^']*')\s+as\s+([A-Za-z_]\w*)$"#),
            ),
            (TokenKind::Extends, tag(r#"^extends\s+("[^"]*"|'[^']*')$"#)),
            (TokenKind::Include, tag(r"^include\s+(.+)$")),
        ];

        Self {
            grammar,
            comment: pattern(r"(?s)\{#.*?#\}"),
            trim_before: pattern(r"\s*(\{[{%])-"),
            trim_after: pattern(r"-([%}]\})\s*"),
            max_bytes,
        }
    }

    /// Runs the pre-pass: strips comments, then applies whitespace control
    /// and normalizes the markers to plain delimiters.
    pub fn normalize(&self, source: &str) -> String {
        let without_comments = self.comment.replace_all(source, "");
        let trimmed_before = self.trim_before.replace_all(&without_comments, "$1");
        self.trim_after
            .replace_all(&trimmed_before, "$1")
            .into_owned()
    }

    /// Tokenizes template source.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::InputTooLarge`] if the source exceeds the
    /// configured maximum. Malformed tags never fail; they become text.
    pub fn tokenize(&self, source: &str) -> TesseraResult<Vec<Token>> {
        self.lex(source).map(|(_, tokens)| tokens)
    }

    /// Tokenizes template source and also returns the normalized text.
    pub fn lex(&self, source: &str) -> TesseraResult<(String, Vec<Token>)> {
        if source.len() > self.max_bytes {
            return Err(TesseraError::InputTooLarge {
                size: source.len(),
                limit: self.max_bytes,
            });
        }

        let normalized = self.normalize(source);
        let tokens = self.scan(&normalized);
        Ok((normalized, tokens))
    }

    fn scan(&self, source: &str) -> Vec<Token> {
        let mut tokens: Vec<Token> = Vec::new();
        let mut remaining = source;

        while !remaining.is_empty() {
            let Some((pos, closer)) = find_next_open(remaining) else {
                push_text(&mut tokens, remaining);
                break;
            };

            if pos > 0 {
                push_text(&mut tokens, &remaining[..pos]);
            }

            let after_open = &remaining[pos + 2..];
            let Some(end) = find_closer(after_open, closer) else {
                // No closer: the rest is literal text.
                push_text(&mut tokens, &remaining[pos..]);
                break;
            };

            let raw = &remaining[pos..pos + 2 + end + 2];
            let inner = after_open[..end].trim();
            let token = if closer == "}}" {
                (!inner.is_empty()).then(|| Token {
                    kind: TokenKind::Variable,
                    raw: raw.to_string(),
                    groups: vec![Some(inner.to_string())],
                })
            } else {
                self.match_tag(raw, inner)
            };

            match token {
                Some(token) => tokens.push(token),
                None => push_text(&mut tokens, raw),
            }
            remaining = &after_open[end + 2..];
        }

        tokens
    }

    fn match_tag(&self, raw: &str, inner: &str) -> Option<Token> {
        self.grammar.iter().find_map(|(kind, re)| {
            re.captures(inner).map(|caps| Token {
                kind: *kind,
                raw: raw.to_string(),
                groups: caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().trim().to_string()))
                    .collect(),
            })
        })
    }
}

impl Default for Lexer {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

/// Appends text, merging with a preceding text token.
fn push_text(tokens: &mut Vec<Token>, text: &str) {
    if let Some(last) = tokens.last_mut() {
        if last.kind == TokenKind::Text {
            last.raw.push_str(text);
            last.groups = vec![Some(last.raw.clone())];
            return;
        }
    }
    tokens.push(Token::text(text));
}

/// Finds the next `{{` or `{%` and returns its position and matching closer.
fn find_next_open(s: &str) -> Option<(usize, &'static str)> {
    let var = s.find("{{").map(|p| (p, "}}"));
    let tag = s.find("{%").map(|p| (p, "%}"));
    match (var, tag) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Finds `closer` in `s`, skipping over quoted strings.
fn find_closer(s: &str, closer: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'\'' {
                    quote = Some(b);
                } else if bytes[i..].starts_with(closer.as_bytes()) {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    // An unbalanced quote: fall back to the first closer at all.
    quote.and_then(|_| s.find(closer))
}

/// Strips one layer of matching quotes.
pub fn unquote(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::default()
            .tokenize(src)
            .unwrap()
            .iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_plain_text() {
        let tokens = Lexer::default().tokenize("Hello world").unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].raw, "Hello world");
    }

    #[test]
    fn test_variable_with_filter() {
        let tokens = Lexer::default().tokenize("{{ name|lower }}").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Variable);
        assert_eq!(tokens[0].group(0), Some("name|lower"));
    }

    #[test]
    fn test_for_groups() {
        let tokens = Lexer::default().tokenize("{% for k, v in items %}").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::ForStart);
        assert_eq!(tokens[0].group(0), Some("k"));
        assert_eq!(tokens[0].group(1), Some("v"));
        assert_eq!(tokens[0].group(2), Some("items"));

        let tokens = Lexer::default().tokenize("{% for x in xs %}").unwrap();
        assert_eq!(tokens[0].group(1), None);
    }

    #[test]
    fn test_all_tag_kinds() {
        let src = r#"{% extends "base" %}{% import "m" as m %}{% block a %}{% endblock a %}{% macro f(a, b="x") %}{% endmacro %}{% if a %}{% elif b %}{% elseif c %}{% else %}{% endif %}{% include "p" %}{% endfor %}"#;
        assert_eq!(
            kinds(src),
            vec![
                TokenKind::Extends,
                TokenKind::Import,
                TokenKind::BlockStart,
                TokenKind::BlockEnd,
                TokenKind::MacroStart,
                TokenKind::MacroEnd,
                TokenKind::IfStart,
                TokenKind::ElseIf,
                TokenKind::ElseIf,
                TokenKind::Else,
                TokenKind::IfEnd,
                TokenKind::Include,
                TokenKind::ForEnd,
            ]
        );
    }

    #[test]
    fn test_macro_groups() {
        let tokens = Lexer::default()
            .tokenize(r#"{% macro greet(name, greeting="Hi") %}"#)
            .unwrap();
        assert_eq!(tokens[0].group(0), Some("greet"));
        assert_eq!(tokens[0].group(1), Some(r#"name, greeting="Hi""#));
    }

    #[test]
    fn test_tags_spanning_lines() {
        let tokens = Lexer::default()
            .tokenize("{% if a\n   or b %}x{% endif %}{% for k,\n v in\n items %}{% endfor %}")
            .unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::IfStart,
                TokenKind::Text,
                TokenKind::IfEnd,
                TokenKind::ForStart,
                TokenKind::ForEnd,
            ]
        );
        assert_eq!(tokens[0].group(0), Some("a\n   or b"));
        assert_eq!(tokens[3].group(1), Some("v"));
        assert_eq!(tokens[3].group(2), Some("items"));

        let tokens = Lexer::default()
            .tokenize("{% macro field(\n    name,\n    kind=\"text\"\n) %}{% endmacro %}")
            .unwrap();
        assert_eq!(tokens[0].kind, TokenKind::MacroStart);
        assert_eq!(tokens[0].group(0), Some("field"));
        assert!(tokens[0].group(1).unwrap().contains("kind=\"text\""));
    }

    #[test]
    fn test_comments_are_stripped() {
        let tokens = Lexer::default().tokenize("a{# {{ x }}\n#}b").unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].raw, "ab");
    }

    #[test]
    fn test_whitespace_control() {
        let lexer = Lexer::default();
        assert_eq!(lexer.normalize("a   {%- if x -%}   b"), "a{% if x %}b");
        assert_eq!(lexer.normalize("a \n {{- x -}} \n b"), "a{{ x }}b");
        assert_eq!(lexer.normalize("a {{ x }} b"), "a {{ x }} b");
    }

    #[test]
    fn test_unknown_and_malformed_tags_are_text() {
        let tokens = Lexer::default()
            .tokenize("a{% frobnicate %}b{% for in %}c{% if x")
            .unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].raw, "a{% frobnicate %}b{% for in %}c{% if x");
    }

    #[test]
    fn test_closer_inside_quotes() {
        let tokens = Lexer::default().tokenize(r#"{{ "}}"|upper }}!"#).unwrap();
        assert_eq!(tokens[0].group(0), Some(r#""}}"|upper"#));
        assert_eq!(tokens[1].raw, "!");
    }

    #[test]
    fn test_input_too_large() {
        let err = Lexer::new(4).tokenize("hello").unwrap_err();
        assert!(matches!(err, TesseraError::InputTooLarge { size: 5, limit: 4 }));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"a.html\""), "a.html");
        assert_eq!(unquote("'b'"), "b");
        assert_eq!(unquote("name"), "name");
    }
}
