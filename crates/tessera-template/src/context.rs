//! Template context for variable resolution and rendering.
//!
//! Provides [`Context`] for holding template variables in a stack-based scope,
//! [`ContextValue`] for representing dynamic template values, and
//! [`TemplateObject`] for exposing host objects to templates.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// A host object that templates can read attributes from.
///
/// Attribute lookup tries the three capabilities in a fixed order: map-style
/// [`key`](Self::key), then [`getter`](Self::getter), then public
/// [`field`](Self::field). The first one that answers wins.
pub trait TemplateObject: fmt::Debug + Send + Sync {
    /// Map-style lookup (`obj["name"]`).
    fn key(&self, _name: &str) -> Option<ContextValue> {
        None
    }

    /// Computed attribute, e.g. `obj.full_name` backed by a method.
    fn getter(&self, _name: &str) -> Option<ContextValue> {
        None
    }

    /// Plain data field.
    fn field(&self, _name: &str) -> Option<ContextValue> {
        None
    }

    /// Text written when the object itself is emitted.
    fn display(&self) -> String {
        format!("{self:?}")
    }
}

/// Represents a dynamic value in a template context.
#[derive(Debug, Clone)]
pub enum ContextValue {
    /// A plain string, escaped on output when auto-escaping is on.
    String(String),
    /// A 64-bit integer.
    Integer(i64),
    /// A 64-bit floating point number.
    Float(f64),
    /// A boolean value.
    Bool(bool),
    /// An ordered list of values.
    List(Vec<ContextValue>),
    /// A key-value mapping, iterated in key order.
    Dict(BTreeMap<String, ContextValue>),
    /// The absence of a value.
    None,
    /// A string marked as safe; auto-escaping will not be applied.
    SafeString(String),
    /// A host object resolved through [`TemplateObject`].
    Object(Arc<dyn TemplateObject>),
}

impl ContextValue {
    /// Returns `true` if this value is considered "truthy".
    ///
    /// `None`, `false`, zero, and empty strings, lists and dicts are falsy.
    /// Objects are always truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) | Self::SafeString(s) => !s.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::Dict(d) => !d.is_empty(),
            Self::Object(_) => true,
        }
    }

    /// Converts this value to a display string (without HTML escaping).
    pub fn to_display_string(&self) -> String {
        match self {
            Self::String(s) | Self::SafeString(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Bool(b) => b.to_string(),
            Self::List(items) => {
                let inner: Vec<String> = items.iter().map(Self::to_repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Self::Dict(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("\"{k}\": {}", v.to_repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Self::None => String::new(),
            Self::Object(obj) => obj.display(),
        }
    }

    fn to_repr(&self) -> String {
        match self {
            Self::String(s) | Self::SafeString(s) => format!("\"{s}\""),
            Self::None => "null".to_string(),
            other => other.to_display_string(),
        }
    }

    /// Returns `true` if this value is a safe string (auto-escaping bypassed).
    pub const fn is_safe(&self) -> bool {
        matches!(self, Self::SafeString(_))
    }

    /// Marks a string value as safe, bypassing auto-escaping.
    #[must_use]
    pub fn mark_safe(self) -> Self {
        match self {
            Self::String(s) => Self::SafeString(s),
            other => other,
        }
    }

    /// Resolves one attribute segment on this value.
    ///
    /// Dicts are looked up by key, lists by numeric index, and objects
    /// through [`TemplateObject`] in key, getter, field order.
    pub fn resolve_segment(&self, segment: &str) -> Option<Self> {
        match self {
            Self::Dict(map) => map.get(segment).cloned(),
            Self::List(list) => segment.parse::<usize>().ok().and_then(|i| list.get(i).cloned()),
            Self::Object(obj) => obj
                .key(segment)
                .or_else(|| obj.getter(segment))
                .or_else(|| obj.field(segment)),
            _ => None,
        }
    }

    /// Returns the length of a list, string, or dict.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::String(s) | Self::SafeString(s) => Some(s.chars().count()),
            Self::List(l) => Some(l.len()),
            Self::Dict(d) => Some(d.len()),
            _ => None,
        }
    }

    /// Returns `true` if this is an empty collection or empty string.
    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|l| l == 0)
    }

    /// Attempts to convert this value to an i64.
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(*f as i64),
            Self::String(s) | Self::SafeString(s) => s.trim().parse::<i64>().ok(),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Attempts to convert this value to an f64.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            Self::String(s) | Self::SafeString(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Returns the string contents if this is a String or SafeString.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::SafeString(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the name of this value's type, for error messages.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) | Self::SafeString(_) => "string",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::None => "null",
            Self::Object(_) => "object",
        }
    }
}

/// Formats a float the way literals are written: integral values keep one
/// decimal place.
pub fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl PartialEq for ContextValue {
    #[allow(clippy::cast_precision_loss, clippy::float_cmp)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a) | Self::SafeString(a), Self::String(b) | Self::SafeString(b)) => {
                a == b
            }
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Integer(a), Self::Float(b)) | (Self::Float(b), Self::Integer(a)) => {
                (*a as f64) == *b
            }
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::None, Self::None) => true,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Serialize for ContextValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) | Self::SafeString(s) => serializer.serialize_str(s),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::None => serializer.serialize_none(),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Dict(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            Self::Object(obj) => serializer.serialize_str(&obj.display()),
        }
    }
}

// -- From implementations --

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i32> for ContextValue {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<i64> for ContextValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<u32> for ContextValue {
    fn from(i: u32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<usize> for ContextValue {
    fn from(i: usize) -> Self {
        Self::Integer(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ContextValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<Self>> From<Vec<T>> for ContextValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Self>> From<HashMap<String, T>> for ContextValue {
    fn from(m: HashMap<String, T>) -> Self {
        Self::Dict(m.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Self>> From<BTreeMap<String, T>> for ContextValue {
    fn from(m: BTreeMap<String, T>) -> Self {
        Self::Dict(m.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Self>> From<Option<T>> for ContextValue {
    fn from(o: Option<T>) -> Self {
        o.map_or(Self::None, Into::into)
    }
}

impl From<Arc<dyn TemplateObject>> for ContextValue {
    fn from(obj: Arc<dyn TemplateObject>) -> Self {
        Self::Object(obj)
    }
}

impl From<serde_json::Value> for ContextValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::None),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(arr) => Self::List(arr.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Dict(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Scope {
    vars: HashMap<String, ContextValue>,
    isolated: bool,
}

/// A template context that holds variables in a stack of scopes.
///
/// Variable lookup searches from the top of the stack downward and stops at
/// the first isolated scope, so a macro body sees only its own parameters.
///
/// # Examples
///
/// ```
/// use tessera_template::context::{Context, ContextValue};
///
/// let mut ctx = Context::new();
/// ctx.set("name", ContextValue::from("tessera"));
/// assert_eq!(ctx.get("name").unwrap().to_display_string(), "tessera");
///
/// ctx.push();
/// ctx.set("name", ContextValue::from("inner"));
/// assert_eq!(ctx.get("name").unwrap().to_display_string(), "inner");
///
/// ctx.pop();
/// assert_eq!(ctx.get("name").unwrap().to_display_string(), "tessera");
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    stack: Vec<Scope>,
}

impl Context {
    /// Creates a new empty context with a single scope.
    pub fn new() -> Self {
        Self {
            stack: vec![Scope::default()],
        }
    }

    /// Pushes a new scope that can see the scopes below it.
    pub fn push(&mut self) {
        self.stack.push(Scope::default());
    }

    /// Pushes a scope that hides every scope below it.
    pub fn push_isolated(&mut self) {
        self.stack.push(Scope {
            vars: HashMap::new(),
            isolated: true,
        });
    }

    /// Pops the top scope from the context stack.
    ///
    /// If only one scope remains, this is a no-op.
    pub fn pop(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    /// Sets a variable in the current (top) scope.
    pub fn set(&mut self, key: impl Into<String>, value: ContextValue) {
        if let Some(top) = self.stack.last_mut() {
            top.vars.insert(key.into(), value);
        }
    }

    /// Looks up a top-level name in the visible scopes.
    fn lookup(&self, name: &str) -> Option<&ContextValue> {
        for scope in self.stack.iter().rev() {
            if let Some(v) = scope.vars.get(name) {
                return Some(v);
            }
            if scope.isolated {
                break;
            }
        }
        None
    }

    /// Looks up a variable by dotted path, e.g. `user.name` or `items.0.title`.
    ///
    /// Returns `None` if the root name or any later segment is missing.
    pub fn get(&self, path: &str) -> Option<ContextValue> {
        let mut parts = path.split('.');
        let mut current = self.lookup(parts.next()?)?.clone();
        for part in parts {
            current = current.resolve_segment(part)?;
        }
        Some(current)
    }

    /// Returns `true` if `path` resolves to a value.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Flattens the visible scopes into a single map, with later scopes
    /// overriding earlier ones.
    pub fn flatten(&self) -> HashMap<String, ContextValue> {
        let start = self
            .stack
            .iter()
            .rposition(|s| s.isolated)
            .unwrap_or(0);
        let mut result = HashMap::new();
        for scope in &self.stack[start..] {
            for (k, v) in &scope.vars {
                result.insert(k.clone(), v.clone());
            }
        }
        result
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl From<HashMap<String, ContextValue>> for Context {
    fn from(vars: HashMap<String, ContextValue>) -> Self {
        Self {
            stack: vec![Scope {
                vars,
                isolated: false,
            }],
        }
    }
}

/// Escapes HTML special characters in a string.
///
/// Replaces `&`, `<`, `>`, `"`, and `'` with their HTML entity equivalents.
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct User {
        first: String,
        last: String,
    }

    impl TemplateObject for User {
        fn key(&self, name: &str) -> Option<ContextValue> {
            (name == "first").then(|| ContextValue::from("from-key"))
        }

        fn getter(&self, name: &str) -> Option<ContextValue> {
            match name {
                "full_name" => Some(format!("{} {}", self.first, self.last).into()),
                "first" => Some(ContextValue::from("from-getter")),
                _ => None,
            }
        }

        fn field(&self, name: &str) -> Option<ContextValue> {
            match name {
                "first" => Some(self.first.clone().into()),
                "last" => Some(self.last.clone().into()),
                _ => None,
            }
        }
    }

    fn user() -> ContextValue {
        let obj: Arc<dyn TemplateObject> = Arc::new(User {
            first: "Ada".into(),
            last: "Lovelace".into(),
        });
        obj.into()
    }

    #[test]
    fn test_context_value_from_primitives() {
        assert_eq!(ContextValue::from("hello").to_display_string(), "hello");
        assert_eq!(ContextValue::from(42i32).to_display_string(), "42");
        assert_eq!(ContextValue::from(3.5f64).to_display_string(), "3.5");
        assert_eq!(ContextValue::from(true).to_display_string(), "true");
        assert_eq!(ContextValue::from(vec![1i32, 2, 3]).to_display_string(), "[1, 2, 3]");
    }

    #[test]
    fn test_float_display_integer_valued() {
        assert_eq!(ContextValue::Float(3.0).to_display_string(), "3.0");
    }

    #[test]
    fn test_context_value_from_option() {
        assert_eq!(ContextValue::from(Some(1i32)), ContextValue::Integer(1));
        assert!(matches!(ContextValue::from(Option::<i32>::None), ContextValue::None));
    }

    #[test]
    fn test_context_value_from_json() {
        let json = serde_json::json!({
            "name": "tessera",
            "version": 4,
            "tags": ["a", "b"],
            "meta": null
        });
        let ContextValue::Dict(map) = ContextValue::from(json) else {
            panic!("expected dict");
        };
        assert_eq!(map["name"], ContextValue::from("tessera"));
        assert_eq!(map["version"], ContextValue::Integer(4));
        assert!(matches!(map["meta"], ContextValue::None));
    }

    #[test]
    fn test_truthiness() {
        assert!(ContextValue::Bool(true).is_truthy());
        assert!(!ContextValue::Integer(0).is_truthy());
        assert!(!ContextValue::String(String::new()).is_truthy());
        assert!(!ContextValue::None.is_truthy());
        assert!(!ContextValue::List(vec![]).is_truthy());
        assert!(user().is_truthy());
    }

    #[test]
    fn test_equality_across_numeric_types() {
        assert_eq!(ContextValue::Integer(2), ContextValue::Float(2.0));
        assert_eq!(ContextValue::from("a"), ContextValue::SafeString("a".into()));
        assert_ne!(ContextValue::Integer(1), ContextValue::from("1"));
    }

    #[test]
    fn test_mark_safe() {
        let v = ContextValue::from("<b>").mark_safe();
        assert!(v.is_safe());
        assert_eq!(v.to_display_string(), "<b>");
    }

    #[test]
    fn test_object_lookup_priority() {
        let u = user();
        assert_eq!(u.resolve_segment("first").unwrap(), ContextValue::from("from-key"));
        assert_eq!(
            u.resolve_segment("full_name").unwrap(),
            ContextValue::from("Ada Lovelace")
        );
        assert_eq!(u.resolve_segment("last").unwrap(), ContextValue::from("Lovelace"));
        assert!(u.resolve_segment("missing").is_none());
    }

    #[test]
    fn test_context_dotted_lookup() {
        let mut ctx = Context::new();
        let mut address = BTreeMap::new();
        address.insert("city".to_string(), ContextValue::from("NYC"));
        let mut person = BTreeMap::new();
        person.insert("address".to_string(), ContextValue::Dict(address));
        ctx.set("person", ContextValue::Dict(person));
        ctx.set("items", ContextValue::from(vec!["x", "y"]));
        ctx.set("user", user());

        assert_eq!(ctx.get("person.address.city").unwrap().to_display_string(), "NYC");
        assert_eq!(ctx.get("items.1").unwrap().to_display_string(), "y");
        assert_eq!(ctx.get("user.full_name").unwrap().to_display_string(), "Ada Lovelace");
        assert!(ctx.get("person.email").is_none());
        assert!(ctx.get("items.5").is_none());
        assert!(ctx.get("nobody.name").is_none());
    }

    #[test]
    fn test_context_push_pop() {
        let mut ctx = Context::new();
        ctx.set("x", ContextValue::from(1i32));
        ctx.push();
        ctx.set("x", ContextValue::from(2i32));
        assert_eq!(ctx.get("x").unwrap(), ContextValue::Integer(2));
        ctx.pop();
        assert_eq!(ctx.get("x").unwrap(), ContextValue::Integer(1));
        ctx.pop();
        assert_eq!(ctx.get("x").unwrap(), ContextValue::Integer(1));
    }

    #[test]
    fn test_isolated_scope_hides_outer_names() {
        let mut ctx = Context::new();
        ctx.set("secret", ContextValue::from("outer"));
        ctx.push_isolated();
        ctx.set("name", ContextValue::from("Bob"));
        assert!(ctx.get("secret").is_none());
        assert!(ctx.contains("name"));
        assert_eq!(ctx.flatten().len(), 1);
        ctx.pop();
        assert!(ctx.contains("secret"));
    }

    #[test]
    fn test_serialize_is_deterministic() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), ContextValue::Integer(2));
        map.insert("a".to_string(), ContextValue::None);
        let json = serde_json::to_string(&ContextValue::Dict(map)).unwrap();
        assert_eq!(json, r#"{"a":null,"b":2}"#);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>bold</b>"), "&lt;b&gt;bold&lt;/b&gt;");
        assert_eq!(escape_html("a & b"), "a &amp; b");
        assert_eq!(escape_html("it's \"x\""), "it&#x27;s &quot;x&quot;");
    }
}
