//! Built-in template filters.
//!
//! A filter is a named, pure function over a value with optional arguments.
//! Filters are registered in a [`FilterRegistry`]; templates refer to them as
//! `name`, `name:arg` or `name(arg, ...)`.
//!
//! String transforms keep the safe marker of their input, so a filter applied
//! to already-rendered markup does not cause it to be escaped twice.

use std::collections::HashMap;

use tessera_core::error::{TesseraError, TesseraResult};

use crate::context::{escape_html, ContextValue};

/// A template filter function.
pub trait Filter: Send + Sync {
    /// Returns the filter name.
    fn name(&self) -> &'static str;

    /// Applies the filter to a value with the given arguments.
    fn apply(&self, value: &ContextValue, args: &[ContextValue]) -> TesseraResult<ContextValue>;
}

/// A registry of available template filters.
pub struct FilterRegistry {
    filters: HashMap<String, Box<dyn Filter>>,
}

impl FilterRegistry {
    /// Creates a new empty filter registry.
    pub fn new() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    /// Creates a registry holding every built-in filter.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        register_all(&mut r);
        r
    }

    /// Registers a filter, replacing any filter with the same name.
    pub fn register(&mut self, filter: Box<dyn Filter>) {
        self.filters.insert(filter.name().to_string(), filter);
    }

    /// Returns `true` if a filter called `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    /// Registered filter names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.filters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Applies a named filter to a value.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::UnknownFilter`] if no filter has that name.
    pub fn apply(
        &self,
        name: &str,
        value: &ContextValue,
        args: &[ContextValue],
    ) -> TesseraResult<ContextValue> {
        let filter = self
            .filters
            .get(name)
            .ok_or_else(|| TesseraError::UnknownFilter(name.to_string()))?;
        filter.apply(value, args)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("filters", &self.names())
            .finish()
    }
}

/// Registers all built-in filters.
fn register_all(r: &mut FilterRegistry) {
    // String filters
    r.register(Box::new(LowerFilter));
    r.register(Box::new(UpperFilter));
    r.register(Box::new(TitleFilter));
    r.register(Box::new(CapitalizeFilter));
    r.register(Box::new(TrimFilter));
    r.register(Box::new(TruncateFilter));
    r.register(Box::new(ReplaceFilter));
    r.register(Box::new(UrlencodeFilter));

    // Escaping
    r.register(Box::new(EscapeFilter { name: "escape" }));
    r.register(Box::new(EscapeFilter { name: "e" }));
    r.register(Box::new(SafeFilter));

    // Collections
    r.register(Box::new(LengthFilter));
    r.register(Box::new(FirstFilter));
    r.register(Box::new(LastFilter));
    r.register(Box::new(JoinFilter));
    r.register(Box::new(ReverseFilter));

    // Numbers
    r.register(Box::new(AbsFilter));
    r.register(Box::new(RoundFilter));

    // Dates
    r.register(Box::new(DateFilter));

    // Logic
    r.register(Box::new(DefaultFilter));
}

/// Wraps `s` as a string with the same safe marker as `input`.
fn like(input: &ContextValue, s: String) -> ContextValue {
    if input.is_safe() {
        ContextValue::SafeString(s)
    } else {
        ContextValue::String(s)
    }
}

fn arg_string(args: &[ContextValue], index: usize) -> Option<String> {
    args.get(index).map(ContextValue::to_display_string)
}

// ============================================================
// String filters
// ============================================================

struct LowerFilter;
impl Filter for LowerFilter {
    fn name(&self) -> &'static str {
        "lower"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        Ok(like(value, value.to_display_string().to_lowercase()))
    }
}

struct UpperFilter;
impl Filter for UpperFilter {
    fn name(&self) -> &'static str {
        "upper"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        Ok(like(value, value.to_display_string().to_uppercase()))
    }
}

struct TitleFilter;
impl Filter for TitleFilter {
    fn name(&self) -> &'static str {
        "title"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        let s = value.to_display_string();
        let titled = s
            .split(' ')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(c) => format!("{}{}", c.to_uppercase(), chars.as_str().to_lowercase()),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        Ok(like(value, titled))
    }
}

struct CapitalizeFilter;
impl Filter for CapitalizeFilter {
    fn name(&self) -> &'static str {
        "capitalize"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        let s = value.to_display_string();
        let mut chars = s.chars();
        let result = match chars.next() {
            Some(c) => format!("{}{}", c.to_uppercase(), chars.as_str().to_lowercase()),
            None => String::new(),
        };
        Ok(like(value, result))
    }
}

struct TrimFilter;
impl Filter for TrimFilter {
    fn name(&self) -> &'static str {
        "trim"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        Ok(like(value, value.to_display_string().trim().to_string()))
    }
}

/// `truncate(n)` / `truncate(n, "...")`: at most `n` characters including the
/// suffix.
struct TruncateFilter;
impl Filter for TruncateFilter {
    fn name(&self) -> &'static str {
        "truncate"
    }
    fn apply(&self, value: &ContextValue, args: &[ContextValue]) -> TesseraResult<ContextValue> {
        let s = value.to_display_string();
        let max = args
            .first()
            .and_then(ContextValue::as_integer)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(255);
        let suffix = arg_string(args, 1).unwrap_or_else(|| "...".to_string());
        if s.chars().count() <= max {
            return Ok(like(value, s));
        }
        let keep = max.saturating_sub(suffix.chars().count());
        let mut out: String = s.chars().take(keep).collect();
        out.push_str(&suffix);
        Ok(like(value, out))
    }
}

struct ReplaceFilter;
impl Filter for ReplaceFilter {
    fn name(&self) -> &'static str {
        "replace"
    }
    fn apply(&self, value: &ContextValue, args: &[ContextValue]) -> TesseraResult<ContextValue> {
        let (Some(from), Some(to)) = (arg_string(args, 0), arg_string(args, 1)) else {
            return Err(TesseraError::SyntaxError(
                "replace filter takes two arguments".to_string(),
            ));
        };
        let s = value.to_display_string();
        if from.is_empty() {
            return Ok(like(value, s));
        }
        Ok(like(value, s.replace(&from, &to)))
    }
}

struct UrlencodeFilter;
impl Filter for UrlencodeFilter {
    fn name(&self) -> &'static str {
        "urlencode"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        let s = value.to_display_string();
        let encoded =
            percent_encoding::utf8_percent_encode(&s, percent_encoding::NON_ALPHANUMERIC)
                .to_string();
        Ok(ContextValue::String(encoded))
    }
}

// ============================================================
// Escaping
// ============================================================

struct EscapeFilter {
    name: &'static str,
}
impl Filter for EscapeFilter {
    fn name(&self) -> &'static str {
        self.name
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        if value.is_safe() {
            return Ok(value.clone());
        }
        Ok(ContextValue::SafeString(escape_html(
            &value.to_display_string(),
        )))
    }
}

struct SafeFilter;
impl Filter for SafeFilter {
    fn name(&self) -> &'static str {
        "safe"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        Ok(ContextValue::SafeString(value.to_display_string()))
    }
}

// ============================================================
// Collection filters
// ============================================================

struct LengthFilter;
impl Filter for LengthFilter {
    fn name(&self) -> &'static str {
        "length"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        Ok(ContextValue::from(value.len().unwrap_or(0)))
    }
}

struct FirstFilter;
impl Filter for FirstFilter {
    fn name(&self) -> &'static str {
        "first"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        match value {
            ContextValue::List(list) => Ok(list.first().cloned().unwrap_or(ContextValue::None)),
            ContextValue::String(s) | ContextValue::SafeString(s) => Ok(s
                .chars()
                .next()
                .map_or(ContextValue::None, |c| like(value, c.to_string()))),
            _ => Ok(ContextValue::None),
        }
    }
}

struct LastFilter;
impl Filter for LastFilter {
    fn name(&self) -> &'static str {
        "last"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        match value {
            ContextValue::List(list) => Ok(list.last().cloned().unwrap_or(ContextValue::None)),
            ContextValue::String(s) | ContextValue::SafeString(s) => Ok(s
                .chars()
                .last()
                .map_or(ContextValue::None, |c| like(value, c.to_string()))),
            _ => Ok(ContextValue::None),
        }
    }
}

struct JoinFilter;
impl Filter for JoinFilter {
    fn name(&self) -> &'static str {
        "join"
    }
    fn apply(&self, value: &ContextValue, args: &[ContextValue]) -> TesseraResult<ContextValue> {
        let separator = arg_string(args, 0).unwrap_or_default();
        match value {
            ContextValue::List(list) => {
                let joined = list
                    .iter()
                    .map(ContextValue::to_display_string)
                    .collect::<Vec<_>>()
                    .join(&separator);
                Ok(ContextValue::String(joined))
            }
            _ => Ok(value.clone()),
        }
    }
}

struct ReverseFilter;
impl Filter for ReverseFilter {
    fn name(&self) -> &'static str {
        "reverse"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        match value {
            ContextValue::List(list) => Ok(ContextValue::List(list.iter().rev().cloned().collect())),
            ContextValue::String(s) | ContextValue::SafeString(s) => {
                Ok(like(value, s.chars().rev().collect()))
            }
            other => Ok(other.clone()),
        }
    }
}

// ============================================================
// Number filters
// ============================================================

struct AbsFilter;
impl Filter for AbsFilter {
    fn name(&self) -> &'static str {
        "abs"
    }
    fn apply(&self, value: &ContextValue, _args: &[ContextValue]) -> TesseraResult<ContextValue> {
        match value {
            ContextValue::Integer(i) => Ok(i
                .checked_abs()
                .map_or_else(|| ContextValue::Float((*i as f64).abs()), ContextValue::Integer)),
            ContextValue::Float(f) => Ok(ContextValue::Float(f.abs())),
            other => Ok(other.clone()),
        }
    }
}

/// `round` / `round(precision)`: rounds half away from zero.
struct RoundFilter;
impl Filter for RoundFilter {
    fn name(&self) -> &'static str {
        "round"
    }
    fn apply(&self, value: &ContextValue, args: &[ContextValue]) -> TesseraResult<ContextValue> {
        let Some(f) = value.as_float() else {
            return Ok(value.clone());
        };
        let precision = args
            .first()
            .and_then(ContextValue::as_integer)
            .and_then(|p| i32::try_from(p.clamp(0, 15)).ok())
            .unwrap_or(0);
        let factor = 10f64.powi(precision);
        Ok(ContextValue::Float((f * factor).round() / factor))
    }
}

// ============================================================
// Date filters
// ============================================================

/// `date` / `date("%d %b %Y")`: formats an ISO date or RFC 3339 timestamp
/// with a strftime pattern. Unparseable input is returned unchanged.
struct DateFilter;
impl Filter for DateFilter {
    fn name(&self) -> &'static str {
        "date"
    }
    fn apply(&self, value: &ContextValue, args: &[ContextValue]) -> TesseraResult<ContextValue> {
        use std::fmt::Write;

        let format = arg_string(args, 0).unwrap_or_else(|| "%Y-%m-%d".to_string());
        let s = value.to_display_string();
        let parsed = chrono::DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.naive_local())
            .or_else(|_| {
                chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .map(|d| d.and_time(chrono::NaiveTime::MIN))
            });
        let Ok(dt) = parsed else {
            return Ok(value.clone());
        };
        let mut out = String::new();
        // Invalid format specifiers surface as fmt errors.
        write!(out, "{}", dt.format(&format)).map_err(|_| {
            TesseraError::SyntaxError(format!("invalid date format '{format}'"))
        })?;
        Ok(ContextValue::String(out))
    }
}

// ============================================================
// Logic filters
// ============================================================

struct DefaultFilter;
impl Filter for DefaultFilter {
    fn name(&self) -> &'static str {
        "default"
    }
    fn apply(&self, value: &ContextValue, args: &[ContextValue]) -> TesseraResult<ContextValue> {
        if value.is_truthy() {
            Ok(value.clone())
        } else {
            Ok(args.first().cloned().unwrap_or(ContextValue::None))
        }
    }
}
