//! End-to-end build passes driven through the public API, against the
//! in-memory host doubles.

use std::sync::Arc;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use crate::contracts::{SourceTree, Storage};
use crate::errors::StorageError;
use crate::manifest::{
    DeleteDecl, FileDecl, Manifest, OutputDecl, PartDecl, StageCategory, StageDecl,
};
use crate::project::{Site, SiteEnv};
use crate::testing::mocks::{LineParser, MemorySourceTree, MemoryStorage};

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Routes engine logs into the test harness; filtered by `RUST_LOG`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn env_for(backend: &Arc<MemoryStorage>, tree: &Arc<MemorySourceTree>) -> SiteEnv {
    init_logging();
    let storage: Arc<dyn Storage> = backend.clone();
    let source_tree: Arc<dyn SourceTree> = tree.clone();
    SiteEnv::new(storage, "mem:", source_tree).with_parser(Arc::new(LineParser::new()))
}

fn xml_output(name: &str) -> OutputDecl {
    OutputDecl::new(name).with_stage(StageDecl::new(StageCategory::Format).with_type("xml"))
}

fn copy_file(target: &str, source: &str) -> FileDecl {
    FileDecl::new(target)
        .with_source(source)
        .with_stage(StageDecl::new(StageCategory::Source))
}

fn read_file(target: &str, source: &str, output: &str) -> FileDecl {
    FileDecl::new(target)
        .with_source(source)
        .with_output(output)
        .with_stage(StageDecl::new(StageCategory::Read))
}

fn markup(backend: &MemoryStorage, path: &str) -> String {
    String::from_utf8(backend.read(path).unwrap()).unwrap()
}

#[test]
fn test_first_pass_builds_and_second_skips() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file_stamped(
        "/src/index.txt",
        b"hello site",
        Utc::now() - Duration::hours(1),
    );

    let manifest = Manifest::new().with_file(copy_file("/index.html", "/src/index.txt"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    let first = site.build_pass(false).unwrap();
    assert_eq!(first.built, 1);
    assert_eq!(first.skipped, 0);
    assert_eq!(backend.read("/index.html").unwrap(), b"hello site");

    let second = site.build_pass(false).unwrap();
    assert_eq!(second.built, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(backend.creates(), 1);
    // The connection opened once and stayed open across both passes.
    assert_eq!(backend.reconnects(), 0);
}

#[test]
fn test_force_rebuilds_up_to_date_targets() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file_stamped("/src/index.txt", b"hello", Utc::now() - Duration::hours(1));

    let manifest = Manifest::new().with_file(copy_file("/index.html", "/src/index.txt"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    site.build_pass(false).unwrap();
    let forced = site.build_pass(true).unwrap();
    assert_eq!(forced.built, 1);
    assert_eq!(backend.creates(), 2);
}

#[test]
fn test_source_changes_rebuild_only_affected_targets() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    let old = Utc::now() - Duration::hours(1);
    tree.add_file_stamped("/src/a.txt", b"a v1", old);
    tree.add_file_stamped("/src/b.txt", b"b v1", old);

    let manifest = Manifest::new()
        .with_file(copy_file("/a.html", "/src/a.txt"))
        .with_file(copy_file("/b.html", "/src/b.txt"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    assert_eq!(site.build_pass(false).unwrap().built, 2);

    tree.add_file_stamped("/src/b.txt", b"b v2", Utc::now());
    let second = site.build_pass(false).unwrap();
    assert_eq!(second.built, 1);
    assert_eq!(second.skipped, 1);
    assert_eq!(backend.read("/a.html").unwrap(), b"a v1");
    assert_eq!(backend.read("/b.html").unwrap(), b"b v2");
}

#[test]
fn test_read_chain_serializes_markup() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file_stamped(
        "/src/page.txt",
        b"+page\nhello\n-page\n",
        Utc::now() - Duration::hours(1),
    );

    let manifest = Manifest::new()
        .with_output(xml_output("page"))
        .with_file(read_file("/page.html", "/src/page.txt", "page"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    assert_eq!(site.build_pass(false).unwrap().built, 1);
    assert_eq!(
        markup(&backend, "/page.html"),
        format!("{XML_DECL}<page>hello</page>")
    );
    assert_eq!(site.build_pass(false).unwrap().skipped, 1);
    assert_eq!(backend.creates(), 1);
}

#[test]
fn test_transform_renames_between_read_and_output() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file("/src/page.txt", b"+draft\ncopy\n-draft\n");

    let manifest = Manifest::new().with_output(xml_output("page")).with_file(
        FileDecl::new("/page.html")
            .with_source("/src/page.txt")
            .with_output("page")
            .with_stage(
                StageDecl::new(StageCategory::Read).with_stage(
                    StageDecl::new(StageCategory::Transform).with_param("rename", "draft=page"),
                ),
            ),
    );
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    assert!(site.run_build_pass(false).unwrap());
    assert_eq!(
        markup(&backend, "/page.html"),
        format!("{XML_DECL}<page>copy</page>")
    );
}

#[test]
fn test_wildcard_entries_track_the_source_directory() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    let old = Utc::now() - Duration::hours(1);
    tree.add_file_stamped("/posts/alpha.txt", b"alpha body", old);
    tree.add_file_stamped("/posts/beta.txt", b"beta body", old);

    let manifest = Manifest::new().with_file(copy_file("/out/*.html", "/posts/*.txt"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    let first = site.build_pass(false).unwrap();
    assert_eq!(first.built, 2);
    assert_eq!(backend.read("/out/alpha.html").unwrap(), b"alpha body");
    assert_eq!(backend.read("/out/beta.html").unwrap(), b"beta body");

    tree.add_file_stamped("/posts/beta.txt", b"beta v2", Utc::now());
    let second = site.build_pass(false).unwrap();
    assert_eq!(second.built, 1);
    assert_eq!(second.skipped, 1);
    assert_eq!(backend.read("/out/beta.html").unwrap(), b"beta v2");

    // New source files show up on the next pass without recompiling.
    tree.add_file_stamped("/posts/gamma.txt", b"gamma body", old);
    let third = site.build_pass(false).unwrap();
    assert_eq!(third.built, 1);
    assert_eq!(third.skipped, 2);
    assert_eq!(backend.read("/out/gamma.html").unwrap(), b"gamma body");
}

#[test]
fn test_pass_continues_past_failing_artifacts() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file("/src/good.txt", b"still here");

    let manifest = Manifest::new()
        .with_file(copy_file("/broken.html", "/src/absent.txt"))
        .with_file(copy_file("/good.html", "/src/good.txt"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    assert!(!site.run_build_pass(false).unwrap());
    let summary = site.build_pass(true).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.built, 1);
    assert_eq!(backend.read("/good.html").unwrap(), b"still here");
    assert!(backend.read("/broken.html").is_none());

    // Every opened write settled, one way or the other.
    assert_eq!(backend.creates(), backend.commits() + backend.discards());
    assert_eq!(backend.leaks(), 0);
}

#[test]
fn test_parts_resolve_and_propagate_staleness() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file_stamped(
        "/src/nav.txt",
        b"+nav\nhome\n-nav\n",
        Utc::now() - Duration::hours(1),
    );

    let manifest = Manifest::new()
        .with_output(xml_output("page"))
        .with_part(
            PartDecl::new("navigation")
                .with_source("/src/nav.txt")
                .with_stage(StageDecl::new(StageCategory::Read)),
        )
        .with_file(read_file("/nav.html", "part:navigation", "page"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    assert_eq!(site.build_pass(false).unwrap().built, 1);
    assert_eq!(
        markup(&backend, "/nav.html"),
        format!("{XML_DECL}<nav>home</nav>")
    );

    // Nothing changed, so the part reference reads as fresh.
    assert_eq!(site.build_pass(false).unwrap().skipped, 1);

    // Touching the part's source invalidates the artifact through the
    // part: indirection.
    tree.add_file_stamped("/src/nav.txt", b"+nav\nhome\nabout\n-nav\n", Utc::now());
    assert_eq!(site.build_pass(false).unwrap().built, 1);
    assert_eq!(
        markup(&backend, "/nav.html"),
        format!("{XML_DECL}<nav>homeabout</nav>")
    );
}

#[test]
fn test_split_rename_fans_a_document_into_siblings() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file_stamped(
        "/src/book.txt",
        b"+book\n+chapter\none\n-chapter\n+chapter\ntwo\n-chapter\n-book\n",
        Utc::now() - Duration::hours(1),
    );

    let manifest = Manifest::new()
        .with_property("break-at", "chapter")
        .with_output(xml_output("page"))
        .with_file(
            FileDecl::new("/book.html")
                .with_source("/src/book.txt")
                .with_output("page")
                .with_stage(
                    StageDecl::new(StageCategory::Read).with_stage(
                        StageDecl::new(StageCategory::Process)
                            .with_type("split")
                            .with_param("mode", "rename")
                            .with_param("at", "${break-at}")
                            .with_param("name", "part-*.html"),
                    ),
                ),
        );
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    let summary = site.build_pass(false).unwrap();
    assert_eq!(summary.built, 1);
    assert_eq!(
        markup(&backend, "/book.html"),
        format!("{XML_DECL}<book><chapter>one</chapter>")
    );
    assert_eq!(markup(&backend, "/part-1.html"), "<chapter>two</chapter>");
    assert_eq!(markup(&backend, "/part-2.html"), "</book>");
    assert_eq!(backend.creates(), 3);
    assert_eq!(backend.commits(), 3);

    // Staleness is keyed on the declared target, not the siblings.
    assert_eq!(site.build_pass(false).unwrap().skipped, 1);
    assert_eq!(backend.creates(), 3);
}

#[test]
fn test_split_async_extracts_sections_through_an_output() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file(
        "/src/doc.txt",
        b"+doc\nlead\n+section\ninner\n-section\ntail\n-doc\n",
    );

    let manifest = Manifest::new().with_output(xml_output("page")).with_file(
        FileDecl::new("/doc.html")
            .with_source("/src/doc.txt")
            .with_output("page")
            .with_stage(
                StageDecl::new(StageCategory::Read).with_stage(
                    StageDecl::new(StageCategory::Process)
                        .with_type("split")
                        .with_param("mode", "async")
                        .with_param("at", "section")
                        .with_param("name", "extract-*.xml")
                        .with_param("output", "page"),
                ),
            ),
    );
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    assert_eq!(site.build_pass(false).unwrap().built, 1);
    assert_eq!(
        markup(&backend, "/doc.html"),
        format!("{XML_DECL}<doc>lead<!--split:extract-1.xml-->tail</doc>")
    );
    assert_eq!(
        markup(&backend, "/extract-1.xml"),
        format!("{XML_DECL}<section>inner</section>")
    );
    assert_eq!(backend.creates(), 2);
    assert_eq!(backend.commits(), 2);
    assert_eq!(backend.leaks(), 0);
}

#[test]
fn test_split_async_spools_on_non_reentrant_storage() {
    let backend = Arc::new(MemoryStorage::new().non_reentrant());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file(
        "/src/doc.txt",
        b"+doc\n+section\ninner\n-section\n+section\nlater\n-section\n-doc\n",
    );

    let manifest = Manifest::new().with_output(xml_output("page")).with_file(
        FileDecl::new("/doc.html")
            .with_source("/src/doc.txt")
            .with_output("page")
            .with_stage(
                StageDecl::new(StageCategory::Read).with_stage(
                    StageDecl::new(StageCategory::Process)
                        .with_type("split")
                        .with_param("mode", "async")
                        .with_param("at", "section")
                        .with_param("name", "extract-*.xml")
                        .with_param("output", "page"),
                ),
            ),
    );
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    // A second write while the primary is open would be rejected by the
    // backend, so success means the extracts spooled and replayed.
    assert!(site.run_build_pass(false).unwrap());
    assert_eq!(
        markup(&backend, "/extract-1.xml"),
        format!("{XML_DECL}<section>inner</section>")
    );
    assert_eq!(
        markup(&backend, "/extract-2.xml"),
        format!("{XML_DECL}<section>later</section>")
    );
    assert_eq!(backend.creates(), 3);
    assert_eq!(backend.commits(), 3);
    assert_eq!(backend.leaks(), 0);
}

#[test]
fn test_dynamic_outputs_rebuild_every_pass() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file_stamped(
        "/src/page.txt",
        b"+page\nnow\n-page\n",
        Utc::now() - Duration::hours(1),
    );

    let manifest = Manifest::new()
        .with_output(
            OutputDecl::new("live").with_stage(
                StageDecl::new(StageCategory::Format)
                    .with_type("xml")
                    .with_param("dynamic", "true"),
            ),
        )
        .with_file(read_file("/page.html", "/src/page.txt", "live"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    assert_eq!(site.build_pass(false).unwrap().built, 1);
    assert_eq!(site.build_pass(false).unwrap().built, 1);
    assert_eq!(backend.creates(), 2);
}

#[test]
fn test_transient_storage_failures_recover_mid_pass() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    tree.add_file("/src/index.txt", b"survives a reset");

    let manifest = Manifest::new().with_file(copy_file("/index.html", "/src/index.txt"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    backend.fail_next(StorageError::Transient {
        message: "connection reset".to_string(),
    });
    let summary = site.build_pass(false).unwrap();
    assert_eq!(summary.built, 1);
    assert_eq!(backend.read("/index.html").unwrap(), b"survives a reset");
    assert_eq!(backend.reconnects(), 1);
}

#[test]
fn test_delete_failures_do_not_fail_the_pass() {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());
    backend.add_file("/stale.html", b"junk");

    let manifest = Manifest::new().with_delete(DeleteDecl::new("/stale.html"));
    let site = Site::compile(&manifest, env_for(&backend, &tree)).unwrap();

    backend.fail_next(StorageError::Backend {
        message: "deletion refused".to_string(),
    });
    let summary = site.build_pass(false).unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.deleted, 1);
    // The backend refused, so the file survived this pass.
    assert_eq!(backend.read("/stale.html").unwrap(), b"junk");

    let again = site.build_pass(false).unwrap();
    assert_eq!(again.deleted, 1);
    assert!(backend.read("/stale.html").is_none());
}
