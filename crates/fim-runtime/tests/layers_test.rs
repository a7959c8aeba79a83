//! Cross-crate flows that do not need bubblewrap or FUSE:
//! 1. Layer creation, registration and stack resolution
//! 2. Whiteout composition through the layer cache
//! 3. Commit of the upper directory into a new layer
//! 4. Records and instance claims sharing one data directory

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};

use fim_common::config::FimConfig;
use fim_common::error::FimError;
use fim_image::cache::LayerCache;
use fim_image::commit::commit;
use fim_image::layer::create_layer;
use fim_image::store::{LayerStore, LayerTarget};
use fim_runtime::engine::Engine;
use fim_runtime::instance::{InstanceRecord, InstanceRegistry};
use fim_runtime::records::{OverlayRecord, Records};

struct Workspace {
    dir: tempfile::TempDir,
    config: FimConfig,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let binary = dir.path().join("app.flatimage");
        let _ = std::fs::copy(std::env::current_exe().expect("exe"), &binary).expect("copy");
        let config = FimConfig::new(binary, dir.path().join("data"));
        Self { dir, config }
    }

    fn tree(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.dir.path().join("trees").join(name);
        for (path, content) in files {
            let path = root.join(path);
            std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            std::fs::write(path, content).expect("write");
        }
        std::fs::create_dir_all(&root).expect("mkdir");
        root
    }

    fn layer(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let src = self.tree(name, files);
        let dst = self.dir.path().join(format!("{name}.layer"));
        let _ = create_layer(&src, &dst, 6).expect("create");
        dst
    }

    fn store(&self) -> LayerStore<'_> {
        LayerStore::new(&self.config)
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).expect("read")
}

// ── Layer stack ──────────────────────────────────────────────────────

#[test]
fn stack_orders_embedded_then_managed_then_external() {
    let ws = Workspace::new();
    let base = ws.layer("base", &[("etc/os-release", "base")]);
    let app = ws.layer("app", &[("opt/app", "v1")]);
    let extra = ws.layer("extra", &[("opt/extra", "x")]);

    let _ = ws.store().add(&app, &LayerTarget::Managed).expect("managed");
    let _ = ws.store().add(&base, &LayerTarget::Binary).expect("binary");

    let mut config = ws.config.clone();
    config.external_layers = Some(format!("{}:/does/not/exist", extra.display()));
    let stack = LayerStore::new(&config).enumerate().expect("enumerate");

    assert_eq!(stack.len(), 3);
    assert_eq!(stack[0].path, ws.config.binary);
    assert!(stack[0].offset > 0);
    assert_eq!(stack[1].path, ws.config.layers_dir().join("layer-000.layer"));
    assert_eq!(stack[2].path, extra);
}

#[test]
fn adding_to_binary_increments_the_count() {
    let ws = Workspace::new();
    let before = ws.store().enumerate().expect("enumerate").len();
    let layer = ws.layer("one", &[("a", "1")]);
    let _ = ws.store().add(&layer, &LayerTarget::Binary).expect("add");
    let _ = ws.store().add(&layer, &LayerTarget::Binary).expect("add");
    assert_eq!(ws.store().enumerate().expect("enumerate").len(), before + 2);

    let lines = ws.store().list().expect("list");
    assert!(lines[0].starts_with("0:"));
    assert!(lines[1].starts_with("1:"));
}

// ── Composition ──────────────────────────────────────────────────────

#[test]
fn whiteout_in_upper_layer_hides_lower_file() {
    let ws = Workspace::new();
    let base = ws.layer("base", &[("etc/motd", "hello"), ("etc/hosts", "127.0.0.1")]);
    let patch = ws.layer("patch", &[("etc/.wh.motd", "")]);
    let _ = ws.store().add(&base, &LayerTarget::Managed).expect("add");
    let _ = ws.store().add(&patch, &LayerTarget::Managed).expect("add");

    let stack = ws.store().enumerate().expect("enumerate");
    let lowers = LayerCache::new(ws.config.layer_cache_dir())
        .compose(&stack)
        .expect("compose");

    assert_eq!(lowers.len(), 1);
    assert!(!lowers[0].join("etc/motd").exists());
    assert_eq!(read(&lowers[0].join("etc/hosts")), "127.0.0.1");
}

#[test]
fn appending_to_the_binary_keeps_earlier_cache_entries() {
    let ws = Workspace::new();
    let cache = LayerCache::new(ws.config.layer_cache_dir());
    let names = ["one", "two", "three"];
    for (i, name) in names.iter().enumerate() {
        let layer = ws.layer(name, &[(*name, *name)]);
        let _ = ws.store().add(&layer, &LayerTarget::Binary).expect("add");
        let stack = ws.store().enumerate().expect("enumerate");
        assert_eq!(cache.compose(&stack).expect("compose").len(), i + 1);
    }

    let entries = std::fs::read_dir(ws.config.layer_cache_dir())
        .expect("read cache")
        .count();
    assert_eq!(entries, names.len());
}

// ── Commit ───────────────────────────────────────────────────────────

#[test]
fn commit_turns_upper_into_next_layer() {
    let ws = Workspace::new();
    let base = ws.layer("base", &[("etc/motd", "hello")]);
    let _ = ws.store().add(&base, &LayerTarget::Managed).expect("add");

    let upper = ws.config.upper_dir();
    std::fs::create_dir_all(upper.join("home/user")).expect("mkdir");
    std::fs::write(upper.join("home/user/notes"), "remember").expect("write");

    let before = ws.store().enumerate().expect("enumerate").len();
    let dest = commit(&ws.config, &LayerTarget::Managed).expect("commit");
    let stack = ws.store().enumerate().expect("enumerate");

    assert_eq!(stack.len(), before + 1);
    assert_eq!(dest, ws.config.layers_dir().join("layer-001.layer"));
    assert!(!upper.join("home").exists());

    let lowers = LayerCache::new(ws.config.layer_cache_dir())
        .compose(&stack)
        .expect("compose");
    assert_eq!(read(&lowers[1].join("home/user/notes")), "remember");
}

#[test]
fn exhausted_slots_fail_add_and_commit() {
    let ws = Workspace::new();
    let layer = ws.layer("any", &[("f", "x")]);
    std::fs::create_dir_all(ws.config.layers_dir()).expect("mkdir");
    let _ = std::fs::copy(&layer, ws.config.layers_dir().join("layer-999.layer")).expect("copy");

    let err = ws.store().add(&layer, &LayerTarget::Managed).unwrap_err();
    assert_eq!(err.to_string(), "Maximum number of layers exceeded");

    std::fs::create_dir_all(ws.config.upper_dir()).expect("mkdir");
    std::fs::write(ws.config.upper_dir().join("kept"), "k").expect("write");
    assert!(matches!(
        commit(&ws.config, &LayerTarget::Managed),
        Err(FimError::LayerSlotsExhausted)
    ));
    assert!(ws.config.upper_dir().join("kept").exists());
}

// ── Records and instances ────────────────────────────────────────────

#[test]
fn records_and_claims_live_in_the_data_dir() {
    let ws = Workspace::new();
    let records = Records::new(ws.config.records_dir());
    records
        .save(&OverlayRecord {
            kind: Some("unionfs".parse().expect("kind")),
        })
        .expect("save");
    assert!(ws.config.records_dir().join("overlay.json").exists());

    let registry = InstanceRegistry::new(ws.config.instances_dir());
    let claim = registry.claim(InstanceRecord::current(1000, 1000)).expect("claim");
    assert_eq!(claim.index(), 0);
    let listed = registry.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].record.pid, std::process::id());
    drop(claim);
    assert!(registry.list().expect("list").is_empty());
}

#[test]
fn default_boot_runs_bash_with_caller_args() {
    let ws = Workspace::new();
    let host = fim_core::host::FixedHost::new(1000, 1000);
    let request = Engine::new(&ws.config, &host)
        .boot_request(&["-c".to_string(), "echo hi".to_string()])
        .expect("boot");
    assert_eq!(request.program, "bash");
    assert_eq!(request.args, vec!["-c", "echo hi"]);
    assert!(!request.root);
}
