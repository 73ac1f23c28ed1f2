//! Engine behavior with the on-disk artifact cache enabled.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tessera_core::error::TesseraError;
use tessera_core::settings::Settings;
use tessera_template::cache::ArtifactKind;
use tessera_template::context::{Context, ContextValue};
use tessera_template::engine::Engine;
use tessera_template::sandbox::WhitelistPolicy;

fn settings(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.templates.dirs = vec![root.join("templates")];
    settings.cache.enabled = true;
    settings.cache.dir = root.join("cache");
    settings
}

fn write_template(root: &Path, name: &str, source: &str) -> std::path::PathBuf {
    let dir = root.join("templates");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path
}

fn set_mtime(path: &Path, at: SystemTime) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(at).unwrap();
}

fn entry_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|rd| {
            rd.flatten()
                .filter(|e| e.file_name() != "tags.index.json")
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn test_second_engine_is_served_from_disk() {
    let root = tempfile::tempdir().unwrap();
    let page = write_template(root.path(), "page.html", "v1 {{ n }}");
    let mut ctx = Context::new();
    ctx.set("n", ContextValue::Integer(1));

    let first = Engine::from_settings(settings(root.path()));
    assert_eq!(first.render("page.html", &ctx).unwrap(), "v1 1");
    assert!(entry_count(&root.path().join("cache")) >= 2);

    // No compilations allowed: only a disk hit can succeed.
    let mut no_compiles = settings(root.path());
    no_compiles.rate_limit.enabled = true;
    no_compiles.rate_limit.max_compiles = 0;
    let second = Engine::from_settings(no_compiles.clone());
    assert_eq!(second.render("page.html", &ctx).unwrap(), "v1 1");

    // Any mtime change is a change, even one into the past.
    std::fs::write(&page, "v2 {{ n }}").unwrap();
    set_mtime(&page, SystemTime::now() - Duration::from_secs(3600));
    let third = Engine::from_settings(no_compiles);
    let err = third.render("page.html", &ctx).unwrap_err();
    assert!(matches!(err, TesseraError::RateLimitExceeded { .. }));
    let fourth = Engine::from_settings(settings(root.path()));
    assert_eq!(fourth.render("page.html", &ctx).unwrap(), "v2 1");
}

#[test]
fn test_cache_does_not_bypass_a_stricter_policy() {
    let root = tempfile::tempdir().unwrap();
    write_template(root.path(), "p.html", "{{ a|lower }}");
    let mut ctx = Context::new();
    ctx.set("a", ContextValue::from("X"));

    let permissive = Engine::from_settings(settings(root.path()));
    assert_eq!(permissive.render("p.html", &ctx).unwrap(), "x");

    let strict =
        Engine::from_settings(settings(root.path())).with_policy(WhitelistPolicy::new(["upper"]));
    let err = strict.render("p.html", &ctx).unwrap_err();
    assert!(matches!(err, TesseraError::SecurityViolation(ref m) if m.contains("lower")));

    let lenient =
        Engine::from_settings(settings(root.path())).with_policy(WhitelistPolicy::new(["lower"]));
    assert_eq!(lenient.render("p.html", &ctx).unwrap(), "x");
    assert_eq!(permissive.render("p.html", &ctx).unwrap(), "x");
}

#[test]
fn test_policy_covers_cached_parents() {
    let root = tempfile::tempdir().unwrap();
    write_template(root.path(), "base.html", "{% block b %}{{ a|lower }}{% endblock %}");
    write_template(root.path(), "page.html", "{% extends \"base.html\" %}");

    let permissive = Engine::from_settings(settings(root.path()));
    assert!(permissive.render("page.html", &Context::new()).is_ok());

    let strict =
        Engine::from_settings(settings(root.path())).with_policy(WhitelistPolicy::new(["upper"]));
    let err = strict.render("page.html", &Context::new()).unwrap_err();
    assert!(matches!(err, TesseraError::SecurityViolation(_)));
}

#[test]
fn test_editing_parent_recompiles_child() {
    let root = tempfile::tempdir().unwrap();
    let base = write_template(root.path(), "base.html", "[{% block b %}{% endblock %}]");
    write_template(
        root.path(),
        "page.html",
        "{% extends \"base.html\" %}{% block b %}x{% endblock %}",
    );

    let engine = Engine::from_settings(settings(root.path()));
    let compiled = engine.compile("page.html").unwrap();
    assert_eq!(compiled.dependencies.len(), 1);
    assert_eq!(engine.render("page.html", &Context::new()).unwrap(), "[x]");

    std::fs::write(&base, "({% block b %}{% endblock %})").unwrap();
    set_mtime(&base, SystemTime::now() + Duration::from_secs(60));
    assert_eq!(engine.render("page.html", &Context::new()).unwrap(), "(x)");

    let fresh = Engine::from_settings(settings(root.path()));
    assert_eq!(fresh.render("page.html", &Context::new()).unwrap(), "(x)");
}

#[test]
fn test_imported_file_is_a_dependency() {
    let root = tempfile::tempdir().unwrap();
    let forms = write_template(
        root.path(),
        "forms.html",
        "{% macro b(t) %}<b>{{ t }}</b>{% endmacro %}",
    );
    write_template(
        root.path(),
        "page.html",
        "{% import \"forms.html\" as f %}{{ f.b(\"hi\") }}",
    );

    let engine = Engine::from_settings(settings(root.path()));
    assert_eq!(engine.render("page.html", &Context::new()).unwrap(), "<b>hi</b>");

    std::fs::write(&forms, "{% macro b(t) %}<i>{{ t }}</i>{% endmacro %}").unwrap();
    set_mtime(&forms, SystemTime::now() + Duration::from_secs(60));
    assert_eq!(engine.render("page.html", &Context::new()).unwrap(), "<i>hi</i>");
}

#[test]
fn test_tagged_compile_and_invalidate() {
    let root = tempfile::tempdir().unwrap();
    let page = write_template(root.path(), "page.html", "page");
    write_template(root.path(), "other.html", "other");

    let engine = Engine::from_settings(settings(root.path()));
    engine.compile_tagged("page.html", &["pages", "all"]).unwrap();
    engine.compile_tagged("other.html", &["all"]).unwrap();

    let cache = engine.cache().unwrap();
    let key = cache.inner().key_for(&page, ArtifactKind::Compiled);
    assert_eq!(cache.tags_for(&key), vec!["all", "pages"]);

    assert_eq!(engine.invalidate_tag("pages"), 1);
    assert!(cache.inner().get_compiled(&page).is_none());
    assert!(cache.tags_for(&key).contains(&"all".to_string()));

    assert_eq!(engine.invalidate_tag("all"), 1);
    assert_eq!(engine.invalidate_tag("missing"), 0);
    assert_eq!(engine.render("page.html", &Context::new()).unwrap(), "page");
}

#[test]
fn test_clean_tag_index_drops_vanished_entries() {
    let root = tempfile::tempdir().unwrap();
    write_template(root.path(), "page.html", "page");

    let engine = Engine::from_settings(settings(root.path()));
    engine.compile_tagged("page.html", &["pages"]).unwrap();
    let cache = engine.cache().unwrap();

    assert!(cache.inner().clear() >= 1);
    assert!(cache.index_path().is_file());
    assert_eq!(cache.clean_tag_index(), 1);
    assert_eq!(cache.clean_tag_index(), 0);
    assert_eq!(cache.invalidate_by_tag("pages"), 0);
}

#[test]
fn test_background_writes_land_after_flush() {
    let root = tempfile::tempdir().unwrap();
    let page = write_template(root.path(), "page.html", "{{ 6 * 7 }}");
    let mut settings = settings(root.path());
    settings.cache.background_writes = true;

    let engine = Engine::from_settings(settings.clone());
    assert_eq!(engine.render("page.html", &Context::new()).unwrap(), "42");
    let cache = engine.cache().unwrap();
    cache.inner().flush();
    assert!(cache.inner().get_compiled(&page).is_some());

    let other = Engine::from_settings(settings);
    assert_eq!(other.render("page.html", &Context::new()).unwrap(), "42");
}

#[test]
fn test_clear_cache_empties_everything() {
    let root = tempfile::tempdir().unwrap();
    write_template(root.path(), "card.html", "<b>{{ id }}</b>");

    let engine = Engine::from_settings(settings(root.path()));
    let mut params = Context::new();
    params.set("id", ContextValue::Integer(3));
    assert_eq!(engine.render_component("card.html", &params).unwrap(), "<b>3</b>");
    assert!(!engine.fragments().is_empty());

    engine.clear_cache();
    assert!(engine.fragments().is_empty());
    assert_eq!(entry_count(&root.path().join("cache")), 0);
}
