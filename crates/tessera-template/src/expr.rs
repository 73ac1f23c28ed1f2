//! The expression language used inside `{{ }}` and tag arguments.
//!
//! Expressions are tokenized, parsed by precedence climbing into an
//! [`Expr`] tree and evaluated against a resolver closure. The same
//! evaluator backs runtime rendering and compile-time constant folding.
//!
//! Precedence, loosest first: ternary `c ? a : b`, `||`/`or`, `&&`/`and`,
//! comparison (`== != < > <= >= in`, `not in`, `is`), additive, multiplicative,
//! power `**`, unary `- ! not`. Binary operators are left-associative.

use std::cmp::Ordering;
use std::fmt;

use tessera_core::error::{TesseraError, TesseraResult};

use crate::context::{format_float, ContextValue};

/// A lexical token of the expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprToken {
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal, escapes already decoded.
    Str(String),
    /// Identifier or dotted path such as `user.name` or `items.0`.
    Ident(String),
    /// Operator or punctuation.
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "**", "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!", "(", ")",
    ",", "?", ":",
];

/// Splits an expression into tokens.
pub fn tokenize(input: &str) -> TesseraResult<Vec<ExprToken>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float =
                i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let token = if is_float {
                text.parse().map(ExprToken::Float).ok()
            } else {
                text.parse().map(ExprToken::Int).ok()
            };
            tokens.push(token.ok_or_else(|| {
                TesseraError::SyntaxError(format!("Invalid number literal '{text}'"))
            })?);
        } else if c == '"' || c == '\'' {
            let (s, next) = read_string(&chars, i)?;
            tokens.push(ExprToken::Str(s));
            i = next;
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() {
                let ch = chars[i];
                let continues_path = ch == '.'
                    && chars
                        .get(i + 1)
                        .is_some_and(|n| n.is_alphanumeric() || *n == '_');
                if ch.is_alphanumeric() || ch == '_' || continues_path {
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push(ExprToken::Ident(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or_else(|| {
                    TesseraError::SyntaxError(format!(
                        "Unexpected character '{c}' in expression '{input}'"
                    ))
                })?;
            tokens.push(ExprToken::Op(op));
            i += op.len();
        }
    }

    Ok(tokens)
}

fn read_string(chars: &[char], start: usize) -> TesseraResult<(String, usize)> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push(match chars[i + 1] {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            ch if ch == quote => return Ok((out, i + 1)),
            ch => {
                out.push(ch);
                i += 1;
            }
        }
    }
    Err(TesseraError::SyntaxError(
        "Unterminated string literal".to_string(),
    ))
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Logical negation (`!` or `not`).
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

/// The `is` tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Defined,
    Undefined,
    None,
    Even,
    Odd,
    Empty,
}

impl TestKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "defined" => Some(Self::Defined),
            "undefined" => Some(Self::Undefined),
            "none" | "null" => Some(Self::None),
            "even" => Some(Self::Even),
            "odd" => Some(Self::Odd),
            "empty" => Some(Self::Empty),
            _ => None,
        }
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal(ContextValue),
    /// A variable reference, possibly dotted.
    Var(String),
    /// A unary operation.
    Unary(UnaryOp, Box<Expr>),
    /// A binary operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `cond ? then : else`
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `value is [not] test`
    Test {
        value: Box<Expr>,
        test: TestKind,
        negated: bool,
    },
}

impl Expr {
    /// Returns `true` if the expression references no variables.
    pub fn is_constant(&self) -> bool {
        match self {
            Self::Literal(_) => true,
            Self::Var(_) => false,
            Self::Unary(_, e) => e.is_constant(),
            Self::Binary(_, a, b) => a.is_constant() && b.is_constant(),
            Self::Ternary(c, a, b) => c.is_constant() && a.is_constant() && b.is_constant(),
            Self::Test { value, .. } => value.is_constant(),
        }
    }
}

/// Parses an expression string into an [`Expr`].
///
/// # Errors
///
/// Returns [`TesseraError::SyntaxError`] for malformed input.
pub fn parse(input: &str) -> TesseraResult<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(TesseraError::SyntaxError("Empty expression".to_string()));
    }
    let mut parser = ExprParser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos < parser.tokens.len() {
        return Err(TesseraError::SyntaxError(format!(
            "Unexpected token {:?} in expression '{input}'",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

struct ExprParser {
    tokens: Vec<ExprToken>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&ExprToken> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&ExprToken> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<ExprToken> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(ExprToken::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn is_word(&self, offset: usize, word: &str) -> bool {
        matches!(self.peek_at(offset), Some(ExprToken::Ident(w)) if w == word)
    }

    fn ternary(&mut self) -> TesseraResult<Expr> {
        let cond = self.or()?;
        if self.eat_op("?") {
            let then = self.ternary()?;
            if !self.eat_op(":") {
                return Err(TesseraError::SyntaxError(
                    "Expected ':' in ternary expression".to_string(),
                ));
            }
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.is_word(0, word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> TesseraResult<Expr> {
        let mut left = self.and()?;
        while self.eat_op("||") || self.eat_word("or") {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> TesseraResult<Expr> {
        let mut left = self.comparison()?;
        while self.eat_op("&&") || self.eat_word("and") {
            let right = self.comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> TesseraResult<Expr> {
        let mut left = self.additive()?;
        loop {
            if self.eat_word("is") {
                left = self.test(left)?;
                continue;
            }
            let (op, width) = match self.peek() {
                Some(ExprToken::Op(o)) => match *o {
                    "==" => (BinaryOp::Eq, 1),
                    "!=" => (BinaryOp::Ne, 1),
                    "<" => (BinaryOp::Lt, 1),
                    ">" => (BinaryOp::Gt, 1),
                    "<=" => (BinaryOp::Le, 1),
                    ">=" => (BinaryOp::Ge, 1),
                    _ => return Ok(left),
                },
                Some(ExprToken::Ident(w)) if w == "in" => (BinaryOp::In, 1),
                Some(ExprToken::Ident(w)) if w == "not" && self.is_word(1, "in") => {
                    (BinaryOp::NotIn, 2)
                }
                _ => return Ok(left),
            };
            self.pos += width;
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn test(&mut self, value: Expr) -> TesseraResult<Expr> {
        let negated = self.eat_word("not");
        match self.next() {
            Some(ExprToken::Ident(name)) => {
                let test = TestKind::from_name(&name)
                    .ok_or_else(|| TesseraError::SyntaxError(format!("Unknown test '{name}'")))?;
                Ok(Expr::Test {
                    value: Box::new(value),
                    test,
                    negated,
                })
            }
            _ => Err(TesseraError::SyntaxError(
                "Expected test name after 'is'".to_string(),
            )),
        }
    }

    fn additive(&mut self) -> TesseraResult<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(ExprToken::Op("+")) => BinaryOp::Add,
                Some(ExprToken::Op("-")) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> TesseraResult<Expr> {
        let mut left = self.power()?;
        loop {
            let op = match self.peek() {
                Some(ExprToken::Op("*")) => BinaryOp::Mul,
                Some(ExprToken::Op("/")) => BinaryOp::Div,
                Some(ExprToken::Op("%")) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.power()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn power(&mut self) -> TesseraResult<Expr> {
        let mut left = self.unary()?;
        while self.eat_op("**") {
            let right = self.unary()?;
            left = Expr::Binary(BinaryOp::Pow, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> TesseraResult<Expr> {
        if self.eat_op("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        if self.eat_op("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat_word("not") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> TesseraResult<Expr> {
        match self.next() {
            Some(ExprToken::Int(i)) => Ok(Expr::Literal(ContextValue::Integer(i))),
            Some(ExprToken::Float(f)) => Ok(Expr::Literal(ContextValue::Float(f))),
            Some(ExprToken::Str(s)) => Ok(Expr::Literal(ContextValue::String(s))),
            Some(ExprToken::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(ContextValue::Bool(true)),
                "false" => Expr::Literal(ContextValue::Bool(false)),
                "null" => Expr::Literal(ContextValue::None),
                "and" | "or" | "not" | "in" | "is" => {
                    return Err(TesseraError::SyntaxError(format!(
                        "Unexpected keyword '{name}'"
                    )))
                }
                _ => Expr::Var(name),
            }),
            Some(ExprToken::Op("(")) => {
                let inner = self.ternary()?;
                if !self.eat_op(")") {
                    return Err(TesseraError::SyntaxError(
                        "Expected ')' in expression".to_string(),
                    ));
                }
                Ok(inner)
            }
            Some(tok) => Err(TesseraError::SyntaxError(format!(
                "Unexpected token {tok:?} in expression"
            ))),
            None => Err(TesseraError::SyntaxError(
                "Unexpected end of expression".to_string(),
            )),
        }
    }
}

/// An evaluation failure. Runtime callers turn it into an empty value;
/// the constant folder leaves the expression untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    DivisionByZero,
    Overflow,
    TypeMismatch(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::Overflow => write!(f, "arithmetic overflow"),
            Self::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
        }
    }
}

type EvalResult = Result<ContextValue, EvalError>;

/// Evaluates an expression. `resolve` maps a (possibly dotted) variable
/// path to its value, or `None` when undefined.
pub fn evaluate(expr: &Expr, resolve: &dyn Fn(&str) -> Option<ContextValue>) -> EvalResult {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(path) => Ok(resolve(path).unwrap_or(ContextValue::None)),
        Expr::Unary(UnaryOp::Not, e) => Ok(ContextValue::Bool(!evaluate(e, resolve)?.is_truthy())),
        Expr::Unary(UnaryOp::Neg, e) => match evaluate(e, resolve)? {
            ContextValue::Integer(i) => i
                .checked_neg()
                .map(ContextValue::Integer)
                .ok_or(EvalError::Overflow),
            ContextValue::Float(f) => Ok(ContextValue::Float(-f)),
            other => Err(EvalError::TypeMismatch(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },
        Expr::Binary(BinaryOp::And, a, b) => {
            if evaluate(a, resolve)?.is_truthy() {
                Ok(ContextValue::Bool(evaluate(b, resolve)?.is_truthy()))
            } else {
                Ok(ContextValue::Bool(false))
            }
        }
        Expr::Binary(BinaryOp::Or, a, b) => {
            if evaluate(a, resolve)?.is_truthy() {
                Ok(ContextValue::Bool(true))
            } else {
                Ok(ContextValue::Bool(evaluate(b, resolve)?.is_truthy()))
            }
        }
        Expr::Binary(op, a, b) => binary(*op, &evaluate(a, resolve)?, &evaluate(b, resolve)?),
        Expr::Ternary(c, a, b) => {
            if evaluate(c, resolve)?.is_truthy() {
                evaluate(a, resolve)
            } else {
                evaluate(b, resolve)
            }
        }
        Expr::Test {
            value,
            test,
            negated,
        } => {
            let result = match test {
                TestKind::Defined | TestKind::Undefined => {
                    let defined = match value.as_ref() {
                        Expr::Var(path) => resolve(path).is_some(),
                        other => !matches!(evaluate(other, resolve)?, ContextValue::None),
                    };
                    defined == (*test == TestKind::Defined)
                }
                TestKind::None => matches!(evaluate(value, resolve)?, ContextValue::None),
                TestKind::Even | TestKind::Odd => {
                    let v = evaluate(value, resolve)?;
                    let n = match v {
                        ContextValue::Integer(i) => i,
                        other => {
                            return Err(EvalError::TypeMismatch(format!(
                                "'{}' is not an integer",
                                other.type_name()
                            )))
                        }
                    };
                    (n % 2 == 0) == (*test == TestKind::Even)
                }
                TestKind::Empty => {
                    let v = evaluate(value, resolve)?;
                    matches!(v, ContextValue::None) || v.is_empty().unwrap_or(false)
                }
            };
            Ok(ContextValue::Bool(result != *negated))
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn binary(op: BinaryOp, a: &ContextValue, b: &ContextValue) -> EvalResult {
    use ContextValue as V;

    match op {
        BinaryOp::Eq => return Ok(V::Bool(a == b)),
        BinaryOp::Ne => return Ok(V::Bool(a != b)),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            let ord = compare(a, b)?;
            return Ok(V::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::Le => ord != Ordering::Greater,
                _ => ord != Ordering::Less,
            }));
        }
        BinaryOp::In => return contains(b, a).map(V::Bool),
        BinaryOp::NotIn => return contains(b, a).map(|c| V::Bool(!c)),
        _ => {}
    }

    if op == BinaryOp::Add {
        if let (Some(x), Some(y)) = (string_of(a), string_of(b)) {
            return Ok(V::String(format!("{x}{y}")));
        }
    }

    match (a, b) {
        (V::Integer(x), V::Integer(y)) => int_arith(op, *x, *y),
        (V::Integer(_) | V::Float(_), V::Integer(_) | V::Float(_)) => {
            let x = a.as_float().unwrap_or_default();
            let y = b.as_float().unwrap_or_default();
            float_arith(op, x, y)
        }
        _ => Err(EvalError::TypeMismatch(format!(
            "unsupported operands {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn string_of(v: &ContextValue) -> Option<&str> {
    match v {
        ContextValue::String(s) | ContextValue::SafeString(s) => Some(s),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn int_arith(op: BinaryOp, x: i64, y: i64) -> EvalResult {
    let result = match op {
        BinaryOp::Add => x.checked_add(y),
        BinaryOp::Sub => x.checked_sub(y),
        BinaryOp::Mul => x.checked_mul(y),
        BinaryOp::Div => {
            if y == 0 {
                return Err(EvalError::DivisionByZero);
            }
            if x % y != 0 {
                return Ok(ContextValue::Float(x as f64 / y as f64));
            }
            x.checked_div(y)
        }
        BinaryOp::Rem => {
            if y == 0 {
                return Err(EvalError::DivisionByZero);
            }
            x.checked_rem(y)
        }
        BinaryOp::Pow => {
            if y < 0 {
                return float_arith(op, x as f64, y as f64);
            }
            u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
        }
        _ => return Err(not_arithmetic(op)),
    };
    result.map(ContextValue::Integer).ok_or(EvalError::Overflow)
}

fn float_arith(op: BinaryOp, x: f64, y: f64) -> EvalResult {
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div | BinaryOp::Rem if y == 0.0 => return Err(EvalError::DivisionByZero),
        BinaryOp::Div => x / y,
        BinaryOp::Rem => x % y,
        BinaryOp::Pow => x.powf(y),
        _ => return Err(not_arithmetic(op)),
    };
    if result.is_finite() {
        Ok(ContextValue::Float(result))
    } else {
        Err(EvalError::Overflow)
    }
}

fn not_arithmetic(op: BinaryOp) -> EvalError {
    EvalError::TypeMismatch(format!("{op:?} is not arithmetic"))
}

fn compare(a: &ContextValue, b: &ContextValue) -> Result<Ordering, EvalError> {
    use ContextValue as V;
    match (a, b) {
        (V::Integer(x), V::Integer(y)) => Ok(x.cmp(y)),
        (V::Integer(_) | V::Float(_), V::Integer(_) | V::Float(_)) => {
            let x = a.as_float().unwrap_or_default();
            let y = b.as_float().unwrap_or_default();
            x.partial_cmp(&y)
                .ok_or_else(|| EvalError::TypeMismatch("NaN is not ordered".to_string()))
        }
        _ => match (string_of(a), string_of(b)) {
            (Some(x), Some(y)) => Ok(x.cmp(y)),
            _ => Err(EvalError::TypeMismatch(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn contains(haystack: &ContextValue, needle: &ContextValue) -> Result<bool, EvalError> {
    match haystack {
        ContextValue::String(s) | ContextValue::SafeString(s) => {
            Ok(s.contains(&needle.to_display_string()))
        }
        ContextValue::List(items) => Ok(items.contains(needle)),
        ContextValue::Dict(map) => Ok(map.contains_key(&needle.to_display_string())),
        ContextValue::None => Ok(false),
        other => Err(EvalError::TypeMismatch(format!(
            "'in' needs a string, list or dict, got {}",
            other.type_name()
        ))),
    }
}

/// Writes a value as expression-language literal text, the inverse of
/// tokenizing a literal.
pub fn format_literal(value: &ContextValue) -> Option<String> {
    match value {
        ContextValue::Integer(i) => Some(i.to_string()),
        ContextValue::Float(f) => Some(format_float(*f)),
        ContextValue::Bool(b) => Some(b.to_string()),
        ContextValue::None => Some("null".to_string()),
        ContextValue::String(s) | ContextValue::SafeString(s) => {
            let escaped = s
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
                .replace('\t', "\\t");
            Some(format!("\"{escaped}\""))
        }
        ContextValue::List(_) | ContextValue::Dict(_) | ContextValue::Object(_) => None,
    }
}

/// Splits `expr` into its base and filter chain at top-level single `|`
/// characters. Pipes inside quotes or parentheses and `||` are not split.
pub fn split_filters(expr: &str) -> (String, Vec<String>) {
    let parts = split_top_level(expr, '|');
    let mut iter = parts.into_iter();
    let base = iter.next().unwrap_or_default().trim().to_string();
    let filters = iter.map(|f| f.trim().to_string()).collect();
    (base, filters)
}

/// Splits `input` at top-level occurrences of `sep`, ignoring separators
/// inside quotes, parentheses and brackets. A doubled `|` is never a split
/// point.
pub fn split_top_level(input: &str, sep: char) -> Vec<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            current.push(c);
            if c == '\\' {
                if let Some(next) = chars.get(i + 1) {
                    current.push(*next);
                    i += 1;
                }
            } else if c == q {
                quote = None;
            }
        } else if c == '"' || c == '\'' {
            quote = Some(c);
            current.push(c);
        } else if c == '(' || c == '[' {
            depth += 1;
            current.push(c);
        } else if c == ')' || c == ']' {
            depth = depth.saturating_sub(1);
            current.push(c);
        } else if c == sep && depth == 0 {
            if sep == '|' && chars.get(i + 1) == Some(&'|') {
                current.push_str("||");
                i += 2;
                continue;
            }
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
        i += 1;
    }
    parts.push(current);
    parts
}

/// Returns `true` if `expr` is a bare variable path (`name`, `a.b.0`).
pub fn is_plain_path(expr: &str) -> bool {
    let mut segments = expr.split('.');
    let Some(first) = segments.next() else {
        return false;
    };
    let mut chars = first.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_');
    valid_head
        && !matches!(first, "true" | "false" | "null" | "not" | "and" | "or" | "in" | "is")
        && segments.all(|s| !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_const(src: &str) -> EvalResult {
        evaluate(&parse(src).unwrap(), &|_| None)
    }

    #[test]
    fn test_tokenize_mixed() {
        let toks = tokenize("user.name == \"a\\\"b\" && 2.5 ** 2").unwrap();
        assert_eq!(toks[0], ExprToken::Ident("user.name".into()));
        assert_eq!(toks[1], ExprToken::Op("=="));
        assert_eq!(toks[2], ExprToken::Str("a\"b".into()));
        assert_eq!(toks[4], ExprToken::Float(2.5));
        assert_eq!(toks[5], ExprToken::Op("**"));
    }

    #[test]
    fn test_tokenize_rejects_garbage() {
        assert!(tokenize("a $ b").is_err());
        assert!(tokenize("\"open").is_err());
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval_const("2 + 3 * 4").unwrap(), ContextValue::Integer(14));
        assert_eq!(eval_const("(2 + 3) * 4").unwrap(), ContextValue::Integer(20));
        assert_eq!(eval_const("-2 ** 2").unwrap(), ContextValue::Integer(4));
        assert_eq!(eval_const("2 ** 3 ** 2").unwrap(), ContextValue::Integer(64));
        assert_eq!(eval_const("10 - 4 - 3").unwrap(), ContextValue::Integer(3));
        assert_eq!(eval_const("1 < 2 && 3 > 4 || true").unwrap(), ContextValue::Bool(true));
    }

    #[test]
    fn test_division() {
        assert_eq!(eval_const("6 / 3").unwrap(), ContextValue::Integer(2));
        assert_eq!(eval_const("7 / 2").unwrap(), ContextValue::Float(3.5));
        assert_eq!(eval_const("1 / 0"), Err(EvalError::DivisionByZero));
        assert_eq!(eval_const("1.0 % 0"), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn test_overflow_and_type_errors() {
        assert_eq!(eval_const("9223372036854775807 + 1"), Err(EvalError::Overflow));
        assert!(matches!(eval_const("\"a\" * 2"), Err(EvalError::TypeMismatch(_))));
        assert!(matches!(eval_const("\"a\" < 1"), Err(EvalError::TypeMismatch(_))));
    }

    #[test]
    fn test_string_concat_and_in() {
        assert_eq!(eval_const("\"ab\" + \"cd\"").unwrap(), ContextValue::from("abcd"));
        assert_eq!(eval_const("\"b\" in \"abc\"").unwrap(), ContextValue::Bool(true));
        assert_eq!(eval_const("\"z\" not in \"abc\"").unwrap(), ContextValue::Bool(true));
    }

    #[test]
    fn test_ternary_and_keywords() {
        assert_eq!(eval_const("true ? 1 : 2").unwrap(), ContextValue::Integer(1));
        assert_eq!(eval_const("not true or false").unwrap(), ContextValue::Bool(false));
        assert_eq!(eval_const("false and 1 / 0").unwrap(), ContextValue::Bool(false));
    }

    #[test]
    fn test_is_tests() {
        let resolve = |p: &str| match p {
            "n" => Some(ContextValue::Integer(3)),
            "items" => Some(ContextValue::List(vec![])),
            _ => None,
        };
        let check = |src: &str| evaluate(&parse(src).unwrap(), &resolve).unwrap();
        assert_eq!(check("n is defined"), ContextValue::Bool(true));
        assert_eq!(check("missing is undefined"), ContextValue::Bool(true));
        assert_eq!(check("missing is none"), ContextValue::Bool(true));
        assert_eq!(check("n is odd"), ContextValue::Bool(true));
        assert_eq!(check("n is not even"), ContextValue::Bool(true));
        assert_eq!(check("items is empty"), ContextValue::Bool(true));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("1 +").is_err());
        assert!(parse("(1").is_err());
        assert!(parse("a ? b").is_err());
        assert!(parse("x is shiny").is_err());
        assert!(parse("1 2").is_err());
    }

    #[test]
    fn test_format_literal() {
        assert_eq!(format_literal(&ContextValue::Float(2.0)).unwrap(), "2.0");
        assert_eq!(format_literal(&ContextValue::Float(0.25)).unwrap(), "0.25");
        assert_eq!(format_literal(&ContextValue::from("a\"b")).unwrap(), "\"a\\\"b\"");
        assert_eq!(format_literal(&ContextValue::None).unwrap(), "null");
    }

    #[test]
    fn test_split_filters() {
        let (base, filters) = split_filters("name|default:\"a|b\"|truncate(5)");
        assert_eq!(base, "name");
        assert_eq!(filters, vec!["default:\"a|b\"", "truncate(5)"]);

        let (base, filters) = split_filters("a || b");
        assert_eq!(base, "a || b");
        assert!(filters.is_empty());
    }

    #[test]
    fn test_is_plain_path() {
        assert!(is_plain_path("user.name"));
        assert!(is_plain_path("items.0"));
        assert!(!is_plain_path("true"));
        assert!(!is_plain_path("a + b"));
        assert!(!is_plain_path("f(x)"));
        assert!(!is_plain_path("a..b"));
    }
}
