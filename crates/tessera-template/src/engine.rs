//! The template engine: loading, compiling, caching and rendering.
//!
//! [`Engine`] drives the full pipeline for a template name:
//!
//! 1. load the source through the registered loaders,
//! 2. validate it against the [`SecurityPolicy`],
//! 3. lex and parse it (parsed-artifact cache),
//! 4. resolve inheritance and expand macros,
//! 5. fold constants and prune dead branches,
//! 6. compile to instructions (compiled-artifact cache),
//!
//! and keeps compiled templates resident in memory until one of their source
//! files changes. The artifact cache is scoped by the policy's fingerprint,
//! so a cached artifact has always passed this engine's policy.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tessera_core::error::TesseraResult;
use tessera_core::logging::{compile_span, render_span};
use tessera_core::settings::Settings;

use crate::ast::Ast;
use crate::cache::{CacheManager, FragmentCache, SourceStamp, TaggedCacheManager};
use crate::compiler::{CompiledTemplate, Compiler};
use crate::context::{Context, ContextValue};
use crate::filters::FilterRegistry;
use crate::helpers::{DefaultHelpers, ExecutionLimits, Helpers};
use crate::inheritance::{AstSource, InheritanceResolver};
use crate::lexer::Lexer;
use crate::limits::CompileRateLimiter;
use crate::loaders::{ChainLoader, FileSystemLoader, StringLoader, TemplateLoader, TemplateSource};
use crate::macros::MacroProcessor;
use crate::optimizer::Optimizer;
use crate::parser::ParsedTemplate;
use crate::sandbox::{AllowAll, SecurityPolicy};

/// Name used for templates rendered straight from a string.
const STRING_TEMPLATE: &str = "<string>";

struct Resident {
    template: Arc<CompiledTemplate>,
    sources: Vec<SourceStamp>,
}

impl Resident {
    fn is_fresh(&self) -> bool {
        self.sources.iter().all(SourceStamp::is_current)
    }
}

/// The template engine.
///
/// # Examples
///
/// ```
/// use tessera_template::engine::Engine;
/// use tessera_template::context::{Context, ContextValue};
///
/// let engine = Engine::new();
/// engine.add_string_template("base.html", "<h1>{% block title %}Site{% endblock %}</h1>");
/// engine.add_string_template(
///     "page.html",
///     "{% extends \"base.html\" %}{% block title %}{{ title|upper }}{% endblock %}",
/// );
///
/// let mut ctx = Context::new();
/// ctx.set("title", ContextValue::from("news"));
/// assert_eq!(engine.render("page.html", &ctx).unwrap(), "<h1>NEWS</h1>");
/// ```
pub struct Engine {
    settings: Settings,
    lexer: Lexer,
    strings: StringLoader,
    loaders: ChainLoader,
    helpers: DefaultHelpers,
    policy: Box<dyn SecurityPolicy>,
    cache: Option<TaggedCacheManager>,
    fragments: FragmentCache,
    limiter: Option<CompileRateLimiter>,
    compiled: RwLock<HashMap<String, Resident>>,
}

impl Engine {
    /// Creates an engine with default settings: no template directories, no
    /// artifact cache.
    pub fn new() -> Self {
        Self::from_settings(Settings::default())
    }

    /// Creates an engine from settings.
    pub fn from_settings(settings: Settings) -> Self {
        let mut loaders = ChainLoader::new();
        if !settings.templates.dirs.is_empty() {
            loaders.push(Box::new(
                FileSystemLoader::new(settings.templates.dirs.clone())
                    .with_extensions(settings.templates.extensions.clone()),
            ));
        }
        let cache = settings.cache.enabled.then(|| {
            TaggedCacheManager::new(
                CacheManager::from_settings(&settings.cache).with_scope(AllowAll.fingerprint()),
            )
        });
        let limiter = settings
            .rate_limit
            .enabled
            .then(|| CompileRateLimiter::from_settings(&settings.rate_limit));

        Self {
            lexer: Lexer::new(settings.templates.max_template_bytes),
            strings: StringLoader::new(),
            loaders,
            helpers: DefaultHelpers::new(),
            policy: Box::new(AllowAll),
            cache,
            fragments: FragmentCache::new(Duration::from_secs(settings.fragments.ttl_secs)),
            limiter,
            compiled: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Replaces the security policy. Artifacts built under the previous
    /// policy are no longer served.
    #[must_use]
    pub fn with_policy(mut self, policy: impl SecurityPolicy + 'static) -> Self {
        let scope = policy.fingerprint();
        self.cache = self
            .cache
            .take()
            .map(|cache| TaggedCacheManager::new(cache.into_inner().with_scope(scope)));
        self.compiled
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.policy = Box::new(policy);
        self
    }

    /// Replaces the filter registry.
    #[must_use]
    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.helpers = DefaultHelpers::with_filters(filters);
        self
    }

    /// Adds a loader, searched after string templates and earlier loaders.
    pub fn add_loader(&mut self, loader: Box<dyn TemplateLoader>) {
        self.loaders.push(loader);
    }

    /// Adds or replaces an in-memory template.
    pub fn add_string_template(&self, name: &str, source: &str) {
        self.strings.add(name, source);
        // Other resident templates may extend or import this one.
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    pub const fn fragments(&self) -> &FragmentCache {
        &self.fragments
    }

    /// The artifact cache, when enabled.
    pub const fn cache(&self) -> Option<&TaggedCacheManager> {
        self.cache.as_ref()
    }

    /// Renders the named template.
    ///
    /// # Errors
    ///
    /// Any structural, resolution, limit or security error raised while
    /// compiling or rendering.
    pub fn render(&self, name: &str, context: &Context) -> TesseraResult<String> {
        let template = self.compile(name)?;
        self.execute(&template, context, self.top_level_limits())
    }

    /// Compiles and renders `source` directly. Nothing is cached.
    pub fn render_string(&self, source: &str, context: &Context) -> TesseraResult<String> {
        let (template, _) = self.build(TemplateSource::in_memory(STRING_TEMPLATE, source), &[])?;
        self.execute(&template, context, self.top_level_limits())
    }

    /// Renders the named template through the fragment cache, keyed by the
    /// template name and the visible variables of `params`.
    pub fn render_component(&self, name: &str, params: &Context) -> TesseraResult<String> {
        let key_params: BTreeMap<String, ContextValue> = params.flatten().into_iter().collect();
        self.fragments
            .get_or_render(name, &key_params, || self.render(name, params))
    }

    /// Returns the compiled form of the named template.
    pub fn compile(&self, name: &str) -> TesseraResult<Arc<CompiledTemplate>> {
        self.compile_tagged(name, &[])
    }

    /// Like [`Self::compile`], recording the artifact under `tags` when it is
    /// freshly written to the cache.
    pub fn compile_tagged(&self, name: &str, tags: &[&str]) -> TesseraResult<Arc<CompiledTemplate>> {
        if let Some(template) = self.resident(name) {
            return Ok(template);
        }

        let source = self.load(name)?;

        if let (Some(cache), Some(origin)) = (&self.cache, &source.origin) {
            if let Some((template, sources)) = cache.inner().get_compiled_stamped(origin) {
                return Ok(self.keep_resident(name, template, sources));
            }
        }

        if let Some(limiter) = &self.limiter {
            limiter.check(name)?;
        }
        let (template, sources) = self.build(source, tags)?;
        Ok(self.keep_resident(name, template, sources))
    }

    /// Drops every artifact recorded under `tag`, plus all resident
    /// templates. Returns the number of cache files removed.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.cache
            .as_ref()
            .map_or(0, |cache| cache.invalidate_by_tag(tag))
    }

    /// Empties the resident templates, the artifact cache and the fragment
    /// cache.
    pub fn clear_cache(&self) {
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.fragments.clear();
    }

    const fn top_level_limits(&self) -> ExecutionLimits {
        ExecutionLimits::new(self.settings.templates.max_render_depth)
    }

    fn resident(&self, name: &str) -> Option<Arc<CompiledTemplate>> {
        let compiled = self.compiled.read().unwrap_or_else(PoisonError::into_inner);
        compiled
            .get(name)
            .filter(|r| r.is_fresh())
            .map(|r| Arc::clone(&r.template))
    }

    fn keep_resident(
        &self,
        name: &str,
        template: CompiledTemplate,
        sources: Vec<SourceStamp>,
    ) -> Arc<CompiledTemplate> {
        let template = Arc::new(template);
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_string(),
                Resident {
                    template: Arc::clone(&template),
                    sources,
                },
            );
        template
    }

    fn load(&self, name: &str) -> TesseraResult<TemplateSource> {
        match self.strings.load(name) {
            Ok(source) => Ok(source),
            Err(_) => self.loaders.load(name),
        }
    }

    fn parse_source(&self, source: &TemplateSource) -> TesseraResult<ParsedTemplate> {
        let cache = self.cache.as_ref().zip(source.stamp());
        if let Some((cache, stamp)) = &cache {
            if let Some(parsed) = cache.inner().get_parsed(&stamp.path) {
                return Ok(parsed);
            }
        }
        self.policy.validate(&source.content)?;
        let parsed = ParsedTemplate::parse(&self.lexer, &source.content)?;
        if let Some((cache, stamp)) = &cache {
            cache.inner().save_parsed(stamp, &parsed);
        }
        Ok(parsed)
    }

    /// Runs the pipeline on `source`. Also returns the stamps of every file
    /// read along the way.
    fn build(
        &self,
        source: TemplateSource,
        tags: &[&str],
    ) -> TesseraResult<(CompiledTemplate, Vec<SourceStamp>)> {
        let _span = compile_span(&source.name).entered();
        let started = Instant::now();

        let session = CompileSession::new(self);
        let parsed = self.parse_source(&source)?;
        let resolved = InheritanceResolver::new(&session).resolve(&source.name, &parsed.ast)?;
        let expanded = MacroProcessor::new(&session).expand(&resolved)?;
        let ast = if self.settings.templates.optimize {
            Optimizer::new().optimize(&expanded)
        } else {
            expanded
        };

        let mut dependencies = session.into_dependencies();
        dependencies.retain(|d| Some(&d.path) != source.origin.as_ref());
        let compiled = Compiler::new(self.settings.templates.auto_escape).compile(
            &source.name,
            &ast,
            source.origin.clone(),
            dependencies.iter().map(|d| d.path.clone()).collect(),
        )?;

        if let (Some(cache), Some(stamp)) = (&self.cache, source.stamp()) {
            cache.save_compiled_tagged(&stamp, &compiled, &dependencies, tags);
        }
        tracing::debug!(
            template = %source.name,
            instructions = compiled.instructions.len(),
            dependencies = compiled.dependencies.len(),
            elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "compiled template"
        );
        let sources = source.stamp().into_iter().chain(dependencies).collect();
        Ok((compiled, sources))
    }

    fn execute(
        &self,
        template: &CompiledTemplate,
        context: &Context,
        limits: ExecutionLimits,
    ) -> TesseraResult<String> {
        let _span = render_span(&template.name, limits.depth).entered();
        template.execute_with(context, &EngineHelpers { engine: self }, limits)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .field("loaders", &self.loaders)
            .field("cache", &self.cache)
            .field("fragments", &self.fragments)
            .finish_non_exhaustive()
    }
}

/// Loads parents and imports for one compilation and records which files
/// they came from, stamped at read time.
struct CompileSession<'e> {
    engine: &'e Engine,
    dependencies: RefCell<Vec<SourceStamp>>,
}

impl<'e> CompileSession<'e> {
    const fn new(engine: &'e Engine) -> Self {
        Self {
            engine,
            dependencies: RefCell::new(Vec::new()),
        }
    }

    fn into_dependencies(self) -> Vec<SourceStamp> {
        let mut deps = self.dependencies.into_inner();
        deps.sort_by(|a, b| a.path.cmp(&b.path));
        deps.dedup_by(|a, b| a.path == b.path);
        deps
    }
}

impl AstSource for CompileSession<'_> {
    fn load_ast(&self, name: &str) -> TesseraResult<Ast> {
        let source = self.engine.load(name)?;
        if let Some(stamp) = source.stamp() {
            self.dependencies.borrow_mut().push(stamp);
        }
        Ok(self.engine.parse_source(&source)?.ast)
    }
}

/// Routes includes back into the engine.
struct EngineHelpers<'e> {
    engine: &'e Engine,
}

impl Helpers for EngineHelpers<'_> {
    fn resolve_variable(&self, path: &str, scope: &Context) -> Option<ContextValue> {
        self.engine.helpers.resolve_variable(path, scope)
    }

    fn apply_filter(
        &self,
        filter: &str,
        value: ContextValue,
        scope: &Context,
    ) -> TesseraResult<ContextValue> {
        self.engine.helpers.apply_filter(filter, value, scope)
    }

    fn evaluate_expression(&self, expr: &str, scope: &Context) -> TesseraResult<ContextValue> {
        self.engine.helpers.evaluate_expression(expr, scope)
    }

    fn evaluate_condition(&self, expr: &str, scope: &Context) -> TesseraResult<bool> {
        self.engine.helpers.evaluate_condition(expr, scope)
    }

    fn include(&self, name: &str, scope: &Context, limits: ExecutionLimits) -> TesseraResult<String> {
        let template = self.engine.compile(name)?;
        self.engine.execute(&template, scope, limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::error::TesseraError;

    fn ctx(pairs: &[(&str, ContextValue)]) -> Context {
        let mut c = Context::new();
        for (k, v) in pairs {
            c.set(*k, v.clone());
        }
        c
    }

    #[test]
    fn test_render_string_template() {
        let engine = Engine::new();
        engine.add_string_template("hello", "Hello {{ name|upper }}!");
        let out = engine
            .render("hello", &ctx(&[("name", "world".into())]))
            .unwrap();
        assert_eq!(out, "Hello WORLD!");
    }

    #[test]
    fn test_render_string_directly() {
        let engine = Engine::new();
        let out = engine
            .render_string("{{ 2 * 21 }} {{ a }}", &ctx(&[("a", "<x>".into())]))
            .unwrap();
        assert_eq!(out, "42 &lt;x&gt;");
    }

    #[test]
    fn test_tags_may_span_lines() {
        let engine = Engine::new();
        let src = "{% if a\n   or b %}x{% endif %}\
                   {% macro row(\n  label,\n  mark=\"*\"\n) %}{{ mark }}{{ label }}{% endmacro %}\
                   {% for n in\n  ns %}{{ row(n) }}{% endfor %}";
        let out = engine
            .render_string(src, &ctx(&[("b", true.into()), ("ns", vec![1i32, 2].into())]))
            .unwrap();
        assert_eq!(out, "x*1*2");
    }

    #[test]
    fn test_missing_template() {
        let engine = Engine::new();
        let err = engine.render("nope", &Context::new()).unwrap_err();
        assert!(matches!(err, TesseraError::TemplateNotFound(_)));
    }

    #[test]
    fn test_replacing_string_template_recompiles() {
        let engine = Engine::new();
        engine.add_string_template("t", "one");
        assert_eq!(engine.render("t", &Context::new()).unwrap(), "one");
        engine.add_string_template("t", "two");
        assert_eq!(engine.render("t", &Context::new()).unwrap(), "two");
    }

    #[test]
    fn test_parent_edit_invalidates_resident_child() {
        let engine = Engine::new();
        engine.add_string_template("base", "[{% block b %}{% endblock %}]");
        engine.add_string_template("child", "{% extends \"base\" %}{% block b %}x{% endblock %}");
        assert_eq!(engine.render("child", &Context::new()).unwrap(), "[x]");
        engine.add_string_template("base", "({% block b %}{% endblock %})");
        assert_eq!(engine.render("child", &Context::new()).unwrap(), "(x)");
    }

    #[test]
    fn test_include_shares_scope() {
        let engine = Engine::new();
        engine.add_string_template("item", "<li>{{ x }}</li>");
        engine.add_string_template(
            "list",
            "{% for x in xs %}{% include \"item\" %}{% endfor %}",
        );
        let out = engine
            .render("list", &ctx(&[("xs", vec![1i32, 2].into())]))
            .unwrap();
        assert_eq!(out, "<li>1</li><li>2</li>");
    }

    #[test]
    fn test_dynamic_include() {
        let engine = Engine::new();
        engine.add_string_template("a", "A");
        engine.add_string_template("b", "B");
        engine.add_string_template("pick", "{% include which %}");
        let out = engine.render("pick", &ctx(&[("which", "b".into())])).unwrap();
        assert_eq!(out, "B");
    }

    #[test]
    fn test_self_include_hits_depth_limit() {
        let mut settings = Settings::default();
        settings.templates.max_render_depth = 4;
        let engine = Engine::from_settings(settings);
        engine.add_string_template("loop", "x{% include \"loop\" %}");
        let err = engine.render("loop", &Context::new()).unwrap_err();
        assert!(err.is_limit());
        assert!(matches!(
            err,
            TesseraError::RecursionLimitExceeded { limit: 4, .. }
        ));
    }

    #[test]
    fn test_rate_limit() {
        let mut settings = Settings::default();
        settings.rate_limit.enabled = true;
        settings.rate_limit.max_compiles = 2;
        let engine = Engine::from_settings(settings);
        for _ in 0..2 {
            engine.add_string_template("hot", "hot");
            engine.render("hot", &Context::new()).unwrap();
        }
        engine.add_string_template("hot", "hot");
        let err = engine.render("hot", &Context::new()).unwrap_err();
        assert!(matches!(err, TesseraError::RateLimitExceeded { .. }));
    }

    #[test]
    fn test_policy_rejects_before_parse() {
        let engine = Engine::new().with_policy(crate::sandbox::WhitelistPolicy::new(["upper"]));
        engine.add_string_template("ok", "{{ a|upper }}");
        engine.add_string_template("bad", "{{ a|lower }}");
        assert!(engine.render("ok", &Context::new()).is_ok());
        let err = engine.render("bad", &Context::new()).unwrap_err();
        assert!(matches!(err, TesseraError::SecurityViolation(_)));
    }

    #[test]
    fn test_render_component_caches_output() {
        let engine = Engine::new();
        engine.add_string_template("card", "<b>{{ id }}</b>");
        let params = ctx(&[("id", 1.into())]);
        assert_eq!(engine.render_component("card", &params).unwrap(), "<b>1</b>");
        engine.add_string_template("card", "changed");
        assert_eq!(engine.render_component("card", &params).unwrap(), "<b>1</b>");
        engine.fragments().invalidate_component("card");
        assert_eq!(engine.render_component("card", &params).unwrap(), "changed");
    }

    #[test]
    fn test_optimize_toggle_renders_identically() {
        let src = "{% if 1 + 1 == 2 %}{{ 60 * 60 }}{% else %}no{% endif %}{% if x %}{{ x }}{% endif %}";
        let mut plain = Settings::default();
        plain.templates.optimize = false;
        let a = Engine::new();
        let b = Engine::from_settings(plain);
        let c = ctx(&[("x", "y".into())]);
        assert_eq!(a.render_string(src, &c).unwrap(), b.render_string(src, &c).unwrap());
        assert_eq!(a.render_string(src, &c).unwrap(), "3600y");
    }
}
