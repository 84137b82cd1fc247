//! End-to-end resolution scenarios against an in-memory registry.

mod common;

use kpm_core::{Package, Source};
use kpm_registry::mvs::{build_list, ReqsGraph};
use kpm_registry::visitor::{SourceVisitor, Visitor};
use kpm_registry::{update_package, vendor_deps, Cache, Module, RegistryError, ResolveOptions, Settings};

use common::{oci_dep, root_package, FakeRegistry};

fn options(root: &std::path::Path) -> ResolveOptions {
    ResolveOptions::new(Settings::default(), root.join("cache"))
}

#[test]
fn remote_resolution_populates_and_reuses_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FakeRegistry::default().with("helloworld", "0.1.2", "");
    let opts = options(dir.path());
    let mut pkg = root_package(&dir.path().join("app"), &oci_dep("helloworld", "0.1.2"));

    update_package(&mut pkg, &registry, &opts).unwrap();
    assert_eq!(registry.downloads(), 1);

    let cached = Cache::new(&opts.cache_root)
        .find(&Source::oci("ghcr.io", "kcl-lang/helloworld", "0.1.2"))
        .unwrap();
    assert!(cached.join("main.k").is_file());
    assert_eq!(pkg.locked["helloworld"].local_full_path.as_deref(), Some(cached.as_path()));
    assert_eq!(pkg.dependencies["helloworld"].local_full_path.as_deref(), Some(cached.as_path()));

    // The recorded sum survives a store/load cycle and still matches.
    pkg.store_lock().unwrap();
    let mut reloaded = Package::load(&pkg.home_path).unwrap();
    assert_eq!(reloaded.locked["helloworld"].sum, pkg.locked["helloworld"].sum);
    update_package(&mut reloaded, &registry, &opts).unwrap();
    assert_eq!(registry.downloads(), 1);
}

#[test]
fn tampered_cache_fails_the_lock_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FakeRegistry::default().with("helloworld", "0.1.2", "");
    let mut opts = options(dir.path());
    let mut pkg = root_package(&dir.path().join("app"), &oci_dep("helloworld", "0.1.2"));
    update_package(&mut pkg, &registry, &opts).unwrap();
    pkg.store_lock().unwrap();

    let cached = pkg.locked["helloworld"].local_full_path.clone().unwrap();
    std::fs::write(cached.join("main.k"), "name = \"evil\"\n").unwrap();

    let mut reloaded = Package::load(&pkg.home_path).unwrap();
    let err = update_package(&mut reloaded, &registry, &opts).unwrap_err();
    assert!(err.to_string().contains(&pkg.locked["helloworld"].sum));

    opts.no_sum_check = true;
    update_package(&mut reloaded, &registry, &opts).unwrap();
}

#[test]
fn untagged_dependency_resolves_to_latest() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FakeRegistry::default()
        .with("helloworld", "0.1.0", "")
        .with("helloworld", "0.1.2", "")
        .with("helloworld", "0.1.1", "");
    let opts = options(dir.path());
    let mut pkg = root_package(
        &dir.path().join("app"),
        "helloworld = { oci = \"oci://ghcr.io/kcl-lang/helloworld\" }\n",
    );

    update_package(&mut pkg, &registry, &opts).unwrap();
    let locked = &pkg.locked["helloworld"];
    assert_eq!(locked.version, "0.1.2");
    assert_eq!(locked.full_name, "helloworld_0.1.2");
    assert_eq!(registry.downloads(), 1);
}

/// app -> a -> helloworld 0.1.1, app -> b -> helloworld 0.1.2
fn diamond() -> FakeRegistry {
    FakeRegistry::default()
        .with("a", "1.0.0", &oci_dep("helloworld", "0.1.1"))
        .with("b", "1.0.0", &oci_dep("helloworld", "0.1.2"))
        .with("helloworld", "0.1.1", "")
        .with("helloworld", "0.1.2", "")
}

#[test]
fn vendoring_keeps_only_the_greatest_version() {
    let dir = tempfile::tempdir().unwrap();
    let registry = diamond();
    let opts = options(dir.path());
    let deps = format!("{}{}", oci_dep("a", "1.0.0"), oci_dep("b", "1.0.0"));
    let pkg = root_package(&dir.path().join("app"), &deps);

    let locked = vendor_deps(&pkg, &registry, &opts).unwrap();

    let vendor = pkg.vendor_path();
    assert!(vendor.join("helloworld_0.1.2").is_dir());
    assert!(!vendor.join("helloworld_0.1.1").exists());
    assert!(vendor.join("a_1.0.0").is_dir());
    assert!(vendor.join("b_1.0.0").is_dir());
    assert_eq!(locked["helloworld"].version, "0.1.2");
}

#[test]
fn vendor_mode_resolves_offline() {
    let dir = tempfile::tempdir().unwrap();
    let registry = diamond();
    let opts = options(dir.path());
    let deps = format!("{}{}", oci_dep("a", "1.0.0"), oci_dep("b", "1.0.0"));
    let mut pkg = root_package(&dir.path().join("app"), &deps);
    vendor_deps(&pkg, &registry, &opts).unwrap();

    // A registry that serves nothing: every dependency must come from vendor/.
    let offline = FakeRegistry::default();
    pkg.vendor_mode = true;
    update_package(&mut pkg, &offline, &opts).unwrap();
    assert_eq!(offline.downloads(), 0);
    assert!(pkg.locked["b"].local_full_path.as_ref().unwrap().starts_with(pkg.vendor_path()));
}

#[test]
fn build_list_selects_one_version_per_module() {
    let dir = tempfile::tempdir().unwrap();
    let registry = diamond();
    let opts = options(dir.path());
    let deps = format!("{}{}", oci_dep("a", "1.0.0"), oci_dep("b", "1.0.0"));
    let mut pkg = root_package(&dir.path().join("app"), &deps);

    let graph = update_package(&mut pkg, &registry, &opts).unwrap();
    assert_eq!(graph.versions_of("helloworld").len(), 2);

    let reqs = ReqsGraph::from_package(&graph, &pkg, None);
    let list = build_list(&Module::new("app", "0.1.0"), &reqs).unwrap();
    assert_eq!(
        list,
        vec![
            Module::new("app", "0.1.0"),
            Module::new("a", "1.0.0"),
            Module::new("b", "1.0.0"),
            Module::new("helloworld", "0.1.2"),
        ]
    );
}

#[test]
fn missing_remote_package_aborts_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let registry = FakeRegistry::default().with("b", "1.0.0", "");
    let opts = options(dir.path());
    let deps = format!("{}{}", oci_dep("a", "1.0.0"), oci_dep("b", "1.0.0"));
    let mut pkg = root_package(&dir.path().join("app"), &deps);

    let err = update_package(&mut pkg, &registry, &opts).unwrap_err();
    assert!(matches!(err, RegistryError::Oci { .. }), "{err}");
    assert_eq!(registry.downloads(), 0);
    assert!(pkg.locked.is_empty());
}

#[test]
fn virtual_packages_get_fresh_names() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.k"), "a = 1").unwrap();
    let source = Source::local(dir.path());
    let registry = FakeRegistry::default();
    let opts = options(dir.path());

    let mut names = Vec::new();
    for _ in 0..2 {
        let visitor = SourceVisitor::select(&source, &registry, &opts);
        visitor
            .visit(&source, &mut |pkg: &mut Package| {
                assert!(pkg.is_virtual);
                assert_eq!(pkg.home_path, dir.path());
                names.push(pkg.name().to_string());
                Ok(())
            })
            .unwrap();
    }
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
    assert!(names.iter().all(|n| n.starts_with("virtual_")));
}
