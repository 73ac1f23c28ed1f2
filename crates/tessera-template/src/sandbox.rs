//! Source validation before parsing.
//!
//! A [`SecurityPolicy`] sees the raw template text and may reject it. The
//! [`WhitelistPolicy`] only lets templates call filters and functions it
//! knows about; macros defined or imported by the template itself are always
//! callable.

use std::collections::HashSet;

use regex::Regex;
use tessera_core::error::{TesseraError, TesseraResult};

use crate::cache::sha256_hex;
use crate::expr::split_filters;

/// Validates template source before it is parsed.
pub trait SecurityPolicy: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TesseraError::SecurityViolation`] if the source is rejected.
    fn validate(&self, source: &str) -> TesseraResult<()>;

    /// Identifies the rules this policy enforces. Two policies with the same
    /// fingerprint must accept the same sources; the artifact cache is
    /// partitioned by it.
    fn fingerprint(&self) -> String;
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl SecurityPolicy for AllowAll {
    fn validate(&self, _source: &str) -> TesseraResult<()> {
        Ok(())
    }

    fn fingerprint(&self) -> String {
        "allow-all".to_string()
    }
}

/// Rejects calls to filters and functions outside an allowed set.
#[derive(Debug)]
pub struct WhitelistPolicy {
    allowed: HashSet<String>,
    tag: Regex,
    call: Regex,
    string: Regex,
    macro_def: Regex,
    import: Regex,
}

impl WhitelistPolicy {
    /// A policy allowing exactly `names`. `parent` is always allowed.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allowed: HashSet<String> = names.into_iter().map(Into::into).collect();
        allowed.insert("parent".to_string());
        Self {
            allowed,
            tag: Regex::new(r"(?s)\{\{(.*?)\}\}|\{%(.*?)%\}").expect("built-in pattern is valid"),
            call: Regex::new(r"([A-Za-z_][A-Za-z0-9_.]*)\s*\(").expect("built-in pattern is valid"),
            string: Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'"#)
                .expect("built-in pattern is valid"),
            macro_def: Regex::new(r"^-?\s*macro\s+([A-Za-z_]\w*)").expect("built-in pattern is valid"),
            import: Regex::new(r"^-?\s*import\s+.*\bas\s+([A-Za-z_]\w*)")
                .expect("built-in pattern is valid"),
        }
    }

    /// A policy allowing the given filter registry's names.
    pub fn for_filters(filters: &crate::filters::FilterRegistry) -> Self {
        Self::new(filters.names())
    }

    fn interiors<'s>(&self, source: &'s str) -> Vec<&'s str> {
        self.tag
            .captures_iter(source)
            .filter_map(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str())
            .collect()
    }

    fn is_allowed(&self, name: &str, locals: &HashSet<String>, aliases: &HashSet<String>) -> bool {
        if self.allowed.contains(name) || locals.contains(name) {
            return true;
        }
        name.split_once('.')
            .is_some_and(|(alias, _)| aliases.contains(alias))
    }
}

fn violation(name: &str) -> TesseraError {
    TesseraError::SecurityViolation(format!("'{name}' is not an allowed filter or function"))
}

impl SecurityPolicy for WhitelistPolicy {
    fn validate(&self, source: &str) -> TesseraResult<()> {
        let interiors = self.interiors(source);

        let mut locals = HashSet::new();
        let mut aliases = HashSet::new();
        for inner in &interiors {
            let inner = inner.trim_start();
            if let Some(c) = self.macro_def.captures(inner) {
                locals.insert(c[1].to_string());
            } else if let Some(c) = self.import.captures(inner) {
                aliases.insert(c[1].to_string());
            }
        }

        for inner in interiors {
            let trimmed = inner.trim_start();
            if self.macro_def.is_match(trimmed) || self.import.is_match(trimmed) {
                continue;
            }
            let (_, filters) = split_filters(inner.trim_matches('-'));
            for filter in &filters {
                let name: String = filter
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if !name.is_empty() && !self.is_allowed(&name, &locals, &aliases) {
                    return Err(violation(&name));
                }
            }
            let unquoted = self.string.replace_all(inner, "\"\"");
            for c in self.call.captures_iter(&unquoted) {
                let name = &c[1];
                if !self.is_allowed(name, &locals, &aliases) {
                    return Err(violation(name));
                }
            }
        }
        Ok(())
    }

    fn fingerprint(&self) -> String {
        let mut names: Vec<&str> = self.allowed.iter().map(String::as_str).collect();
        names.sort_unstable();
        format!("whitelist:{}", sha256_hex(names.join("\n").as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> WhitelistPolicy {
        WhitelistPolicy::new(["upper", "default", "truncate"])
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.validate("{{ anything|goes() }}").is_ok());
    }

    #[test]
    fn test_allowed_filters_pass() {
        assert!(policy()
            .validate("{{ name|upper }} {{ x|default:\"a\" }} {{ t|truncate(5) }}")
            .is_ok());
    }

    #[test]
    fn test_unknown_filter_rejected() {
        let err = policy().validate("{{ name|lower }}").unwrap_err();
        assert!(matches!(err, TesseraError::SecurityViolation(ref m) if m.contains("lower")));
    }

    #[test]
    fn test_unknown_call_rejected() {
        assert!(policy().validate("{% if exec(\"rm\") %}x{% endif %}").is_err());
    }

    #[test]
    fn test_logical_or_is_not_a_filter() {
        assert!(policy().validate("{% if a || b %}x{% endif %}").is_ok());
    }

    #[test]
    fn test_strings_are_ignored() {
        assert!(policy().validate("{{ \"call(me)|lower\" }}").is_ok());
    }

    #[test]
    fn test_local_and_imported_macros_allowed() {
        let src = "{% import \"forms.html\" as forms %}\
                   {% macro greet(name) %}Hi {{ name }}{% endmacro %}\
                   {{ greet(\"Bob\") }}{{ forms.input(\"q\") }}{{ parent() }}";
        assert!(policy().validate(src).is_ok());
    }

    #[test]
    fn test_fingerprint_follows_allowed_names() {
        assert_eq!(
            WhitelistPolicy::new(["a", "b"]).fingerprint(),
            WhitelistPolicy::new(["b", "a"]).fingerprint()
        );
        assert_ne!(
            WhitelistPolicy::new(["a"]).fingerprint(),
            WhitelistPolicy::new(["a", "b"]).fingerprint()
        );
        assert_ne!(AllowAll.fingerprint(), policy().fingerprint());
    }

    #[test]
    fn test_for_filters_uses_registry_names() {
        let p = WhitelistPolicy::for_filters(&crate::filters::FilterRegistry::with_builtins());
        assert!(p.validate("{{ a|lower|escape }}").is_ok());
        assert!(p.validate("{{ a|shout }}").is_err());
    }
}
