//! Benchmarks for site compilation and build passes.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sitewright::manifest::{FileDecl, Manifest, OutputDecl, StageCategory, StageDecl};
use sitewright::project::{Site, SiteEnv};
use sitewright::testing::mocks::{LineParser, MemorySourceTree, MemoryStorage};

const ARTIFACTS: usize = 50;

fn fixture() -> (Manifest, Arc<MemoryStorage>, Arc<MemorySourceTree>) {
    let backend = Arc::new(MemoryStorage::new());
    let tree = Arc::new(MemorySourceTree::new());

    let mut manifest = Manifest::new().with_output(
        OutputDecl::new("page").with_stage(StageDecl::new(StageCategory::Format).with_type("xml")),
    );
    for index in 0..ARTIFACTS {
        let source = format!("/src/page-{index}.txt");
        tree.add_file(&source, format!("+page\nbody {index}\n-page\n").as_bytes());
        manifest = manifest.with_file(
            FileDecl::new(format!("/page-{index}.html"))
                .with_source(source)
                .with_output("page")
                .with_stage(StageDecl::new(StageCategory::Read)),
        );
    }
    (manifest, backend, tree)
}

fn env_for(backend: &Arc<MemoryStorage>, tree: &Arc<MemorySourceTree>) -> SiteEnv {
    let storage: Arc<dyn sitewright::contracts::Storage> = backend.clone();
    let source_tree: Arc<dyn sitewright::contracts::SourceTree> = tree.clone();
    SiteEnv::new(storage, "mem:", source_tree).with_parser(Arc::new(LineParser::new()))
}

fn compile_benchmark(c: &mut Criterion) {
    let (manifest, backend, tree) = fixture();
    c.bench_function("site_compile", |b| {
        b.iter(|| {
            let site = Site::compile(black_box(&manifest), env_for(&backend, &tree));
            black_box(site).ok()
        });
    });
}

fn warm_pass_benchmark(c: &mut Criterion) {
    let (manifest, backend, tree) = fixture();
    let site = match Site::compile(&manifest, env_for(&backend, &tree)) {
        Ok(site) => site,
        Err(err) => panic!("bench site failed to compile: {err}"),
    };
    if site.run_build_pass(false).is_err() {
        panic!("bench site failed its first pass");
    }

    // Every target is fresh, so this measures the staleness sweep alone.
    c.bench_function("warm_pass", |b| {
        b.iter(|| black_box(site.build_pass(false)).ok());
    });
}

fn forced_pass_benchmark(c: &mut Criterion) {
    let (manifest, backend, tree) = fixture();
    let site = match Site::compile(&manifest, env_for(&backend, &tree)) {
        Ok(site) => site,
        Err(err) => panic!("bench site failed to compile: {err}"),
    };

    c.bench_function("forced_pass", |b| {
        b.iter(|| black_box(site.build_pass(true)).ok());
    });
}

criterion_group!(
    benches,
    compile_benchmark,
    warm_pass_benchmark,
    forced_pass_benchmark
);
criterion_main!(benches);
