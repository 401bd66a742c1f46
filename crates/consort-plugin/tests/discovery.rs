//! Search, probe and registry behaviour of `HostContext` against a mock loader.

mod helpers;

use consort_core::HostError;
use consort_plugin::{HostContext, ProbeStatus, SearchFlags, SearchRequest};
use helpers::{host_config, module_files, MockLoader};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn names(plugins: &[Arc<consort_core::PluginDescriptor>]) -> Vec<String> {
    let mut names: Vec<String> = plugins.iter().map(|p| p.name.clone()).collect();
    names.sort();
    names
}

#[test]
fn test_probe_one_loads_module_once() {
    let dir = TempDir::new().unwrap();
    let paths = module_files(&dir.path().join("plugins"), &["alpha"]);
    let loader = MockLoader::new();
    let context = HostContext::new(host_config(dir.path()), loader.clone()).unwrap();

    let first = context.probe_one(&paths[0]);
    assert_eq!(first.status, ProbeStatus::Success);
    assert!(!first.cached);
    assert_eq!(loader.loads(), 1);

    let second = context.probe_one(&paths[0]);
    assert!(second.cached);
    assert_eq!(loader.loads(), 1);
    assert_eq!(first.plugins.len(), second.plugins.len());
    assert!(Arc::ptr_eq(&first.plugins[0], &second.plugins[0]));
}

#[test]
fn test_failed_probe_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let paths = module_files(&dir.path().join("plugins"), &["bad"]);
    let loader = MockLoader::new();
    let context = HostContext::new(host_config(dir.path()), loader.clone()).unwrap();

    let result = context.probe_one(&paths[0]);
    assert_eq!(result.status, ProbeStatus::Fail);
    assert!(context.registry().is_exception(&paths[0]));

    let again = context.probe_one(&paths[0]);
    assert_eq!(again.status, ProbeStatus::Fail);
    assert_eq!(loader.loads(), 1);
}

#[test]
fn test_search_report_and_denylist() {
    let dir = TempDir::new().unwrap();
    let plugins = dir.path().join("plugins");
    let paths = module_files(&plugins, &["alpha", "multi", "bad", "panic"]);
    let loader = MockLoader::new();
    let context = HostContext::new(host_config(dir.path()), loader.clone()).unwrap();

    let mut progress = Vec::new();
    let mut on_result = |r: &consort_plugin::ProbeResult| progress.push(r.status);
    let report = context
        .search(&SearchRequest::new([&plugins]), Some(&mut on_result))
        .unwrap();

    assert_eq!(names(&report.found), ["Alpha", "Left", "Right"]);
    assert_eq!(report.failed, vec![paths[2].clone()]);
    assert_eq!(report.crashed, vec![paths[3].clone()]);
    assert!(report.skipped.is_empty());
    assert_eq!(progress.len(), 4);
    assert_eq!(loader.loads(), 4);

    assert!(context.registry().find_plugin("Alpha").is_some());
    assert!(context.registry().find_plugin("Left").is_some());
    assert_eq!(context.registry().exceptions().len(), 2);

    // known modules are answered from the registry, exceptions are skipped
    let report = context.search(&SearchRequest::new([&plugins]), None).unwrap();
    assert_eq!(names(&report.found), ["Alpha", "Left", "Right"]);
    assert_eq!(report.skipped.len(), 2);
    assert!(report.failed.is_empty() && report.crashed.is_empty());
    assert_eq!(loader.loads(), 4);
}

#[test]
fn test_search_excludes_paths() {
    let dir = TempDir::new().unwrap();
    let plugins = dir.path().join("plugins");
    module_files(&plugins, &["alpha"]);
    module_files(&plugins.join("skip"), &["beta"]);
    let context = HostContext::new(host_config(dir.path()), MockLoader::new()).unwrap();

    let request = SearchRequest::new([&plugins]).exclude(plugins.join("skip"));
    let report = context.search(&request, None).unwrap();
    assert_eq!(names(&report.found), ["Alpha"]);
}

#[test]
fn test_parallel_search_matches_sequential() {
    let stems = ["alpha", "beta", "gamma", "delta", "bad", "multi"];
    let run = |parallel: bool| {
        let dir = TempDir::new().unwrap();
        let plugins = dir.path().join("plugins");
        module_files(&plugins, &stems);
        let context = HostContext::new(host_config(dir.path()), MockLoader::new()).unwrap();
        let request = SearchRequest::new([&plugins]).flags(SearchFlags {
            parallel,
            ..Default::default()
        });
        let report = context.search(&request, None).unwrap();
        (names(&report.found), report.failed.len())
    };
    assert_eq!(run(true), run(false));
}

#[test]
fn test_cache_survives_new_context() {
    let dir = TempDir::new().unwrap();
    let plugins = dir.path().join("plugins");
    let paths = module_files(&plugins, &["alpha", "multi", "bad"]);

    let context = HostContext::new(host_config(dir.path()), MockLoader::new()).unwrap();
    let request = SearchRequest::new([&plugins]).flags(SearchFlags {
        save_cache: true,
        ..Default::default()
    });
    context.search(&request, None).unwrap();
    assert!(context.cache_path().is_file());
    drop(context);

    let loader = MockLoader::new();
    let context = HostContext::new(host_config(dir.path()), loader.clone()).unwrap();
    let (factory, desc) = context.resolve("Alpha").unwrap();
    assert_eq!(desc.name, "Alpha");
    assert_eq!(factory.path(), paths[0]);
    assert!(!factory.is_loaded());
    assert!(context.registry().find_plugin("Right").is_some());
    assert!(context.registry().is_exception(&paths[2]));

    let report = context.search(&SearchRequest::new([&plugins]), None).unwrap();
    assert_eq!(report.found.len(), 3);
    assert_eq!(report.skipped, vec![paths[2].clone()]);
    assert_eq!(loader.loads(), 0);
}

#[test]
fn test_resolve_by_path() {
    let dir = TempDir::new().unwrap();
    let paths = module_files(&dir.path().join("plugins"), &["alpha", "multi"]);
    let context = HostContext::new(host_config(dir.path()), MockLoader::new()).unwrap();

    let (_, desc) = context.resolve(&paths[0].to_string_lossy()).unwrap();
    assert_eq!(desc.name, "Alpha");

    // a shell module has no single plugin to open by path
    let err = context.resolve(&paths[1].to_string_lossy()).unwrap_err();
    assert!(matches!(err, HostError::PluginNotFound(_)));
    let (_, desc) = context.resolve("Right").unwrap();
    assert_eq!(desc.name, "Right");

    assert!(matches!(
        context.resolve("Nowhere"),
        Err(HostError::PluginNotFound(_))
    ));
}

#[test]
fn test_clear_cache_is_busy_during_search() {
    let dir = TempDir::new().unwrap();
    let plugins = dir.path().join("plugins");
    module_files(&plugins, &["alpha"]);
    let (loader, release, entered) = MockLoader::gated();
    let context = HostContext::new(host_config(dir.path()), loader).unwrap();

    let searcher = {
        let context = Arc::clone(&context);
        let plugins = plugins.clone();
        thread::spawn(move || context.search(&SearchRequest::new([&plugins]), None))
    };
    entered.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(context.is_searching());
    assert!(matches!(context.clear_cache(false), Err(HostError::Busy(_))));
    assert!(matches!(
        context.search(&SearchRequest::new([&plugins]), None),
        Err(HostError::Busy(_))
    ));

    release.send(()).unwrap();
    let report = searcher.join().unwrap().unwrap();
    assert_eq!(report.found.len(), 1);

    assert!(!context.is_searching());
    context.clear_cache(false).unwrap();
    assert!(context.registry().is_empty());
}

#[test]
fn test_clear_cache_removes_file() {
    let dir = TempDir::new().unwrap();
    let paths = module_files(&dir.path().join("plugins"), &["alpha", "bad"]);
    let context = HostContext::new(host_config(dir.path()), MockLoader::new()).unwrap();
    context.probe_one(&paths[0]);
    context.probe_one(&paths[1]);
    context.save_cache().unwrap();

    context.clear_cache(true).unwrap();
    assert!(!context.cache_path().exists());
    assert!(context.registry().exceptions().is_empty());
    assert!(context.registry().find_plugin("Alpha").is_none());
    // removing a missing file is fine
    context.clear_cache(true).unwrap();
}

#[test]
fn test_async_search_and_probe() {
    let dir = TempDir::new().unwrap();
    let plugins = dir.path().join("plugins");
    let paths = module_files(&plugins, &["alpha", "beta"]);
    let loader = MockLoader::new();
    let context = HostContext::new(host_config(dir.path()), loader.clone()).unwrap();

    let (tx, rx) = mpsc::channel();
    context
        .search_async(
            SearchRequest::new([&plugins]),
            Box::new(move |report| tx.send(report.map(|r| r.found.len())).unwrap()),
        )
        .unwrap();
    let found = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(found, 2);

    let (tx, rx) = mpsc::channel();
    context
        .probe_one_async(
            paths[1].clone(),
            Box::new(move |result| tx.send(result.cached).unwrap()),
        )
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert_eq!(loader.loads(), 2);
}
