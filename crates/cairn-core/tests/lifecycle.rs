//! End-to-end lifecycle tests against the local provider.
//!
//! These run real shell commands through the blocking service API and need
//! only `sh` on the host.

use cairn_core::{
    CairnConfig, CommandSpec, CoreError, HealthStatus, HistoryEvent, LocalProvider, LocalSettings,
    MasterSecretSource, MemoryStore, ProviderKind, ProviderRegistry, ProviderSettings, RetryPolicy,
    SandboxConfig, SandboxService, SandboxState,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(root: &Path) -> CairnConfig {
    let mut config = CairnConfig::default();
    config.local_root = root.join("sandboxes");
    config.kdf_iterations = 1_000;
    config
}

fn service(root: &Path) -> SandboxService {
    SandboxService::new(config(root)).expect("service")
}

/// Service with two independent local providers, "local" and "scratch".
fn two_provider_service(root: &Path) -> SandboxService {
    let registry = ProviderRegistry::new();
    for name in ["local", "scratch"] {
        let provider = LocalProvider::new(
            name,
            LocalSettings {
                root: root.join(name),
                max_sandboxes: 10,
                max_upload_bytes: 1024 * 1024,
            },
        )
        .expect("local provider");
        registry.register(Arc::new(provider), RetryPolicy::default());
    }
    SandboxService::with_parts(config(root), registry, Arc::new(MemoryStore::new()))
        .expect("service")
}

#[test]
fn test_basic_sandbox_session() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(dir.path());

    let config = SandboxConfig::builder()
        .provider("local")
        .working_dir("/tmp/ws")
        .build()
        .unwrap();
    let sandbox = s.create(config).unwrap();
    assert_eq!(sandbox.state, SandboxState::Ready);

    let result = s.execute(sandbox.id, "echo hi", None).unwrap();
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.exit_code, 0);

    s.upload_file(sandbox.id, "a.txt", "data").unwrap();
    let files = s.list_files(sandbox.id, "/").unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "a.txt");
    assert_eq!(files[0].size, 4);
    assert!(!files[0].is_dir);

    s.destroy(sandbox.id).unwrap();
    assert!(matches!(
        s.get_instance_state(sandbox.id),
        Err(CoreError::InstanceNotFound(_))
    ));
    assert!(matches!(
        s.execute(sandbox.id, "echo again", None),
        Err(CoreError::InstanceNotFound(_))
    ));

    // History outlives the sandbox.
    let history = s.history(sandbox.id).unwrap();
    assert!(history.iter().any(|r| matches!(
        r.event,
        HistoryEvent::Lifecycle {
            to: SandboxState::Destroyed,
            ..
        }
    )));
    assert!(s.shutdown());
}

#[test]
fn test_create_then_destroy_twice() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(dir.path());

    let id = s.create(SandboxConfig::default()).unwrap().id;
    s.destroy(id).unwrap();
    s.destroy(id).unwrap();
    assert!(s.list_instances().is_empty());
    assert!(s.shutdown());
}

#[test]
fn test_concurrent_executes_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let s = Arc::new(service(dir.path()));
    let id = s.create(SandboxConfig::default()).unwrap().id;

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let s = Arc::clone(&s);
            std::thread::spawn(move || s.execute(id, &format!("sleep 0.1; echo {i}"), None))
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap().is_ok());
    }

    let commands: Vec<_> = s
        .history(id)
        .unwrap()
        .into_iter()
        .filter_map(|r| r.as_command().cloned())
        .collect();
    assert_eq!(commands.len(), 5);
    for pair in commands.windows(2) {
        assert!(
            pair[1].started_at >= pair[0].finished_at,
            "commands overlapped: {:?} and {:?}",
            pair[0].command,
            pair[1].command
        );
    }
    assert!(s.shutdown());
}

#[test]
fn test_snapshot_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(dir.path());
    let id = s.create(SandboxConfig::default()).unwrap().id;

    s.upload_file(id, "state.txt", "before").unwrap();
    let snapshot = s.snapshot(id, "checkpoint").unwrap();
    assert_eq!(snapshot.provider, "local");
    assert_eq!(snapshot.label, "checkpoint");

    s.upload_file(id, "state.txt", "after").unwrap();
    s.upload_file(id, "extra.txt", "x").unwrap();
    s.restore(id, &snapshot).unwrap();

    assert_eq!(s.download_file(id, "state.txt").unwrap(), b"before");
    assert!(matches!(
        s.download_file(id, "extra.txt"),
        Err(CoreError::PathNotFound { .. })
    ));
    assert_eq!(s.list_snapshots(id).unwrap(), vec![snapshot]);
    assert!(s.shutdown());
}

#[test]
fn test_restore_across_providers_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let s = two_provider_service(dir.path());

    let source = s
        .create(SandboxConfig::builder().provider("local").build().unwrap())
        .unwrap()
        .id;
    let target = s
        .create(SandboxConfig::builder().provider("scratch").build().unwrap())
        .unwrap()
        .id;
    let snapshot = s.snapshot(source, "s1").unwrap();

    let submitted = s.bridge_stats().submitted();
    assert!(matches!(
        s.restore(target, &snapshot),
        Err(CoreError::IncompatibleSnapshot { .. })
    ));
    // Nothing was dispatched.
    assert_eq!(s.bridge_stats().submitted(), submitted);
    assert_eq!(s.get_instance_state(target).unwrap(), SandboxState::Ready);
    assert!(s.shutdown());
}

#[test]
fn test_execute_timeout_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(dir.path());
    let id = s.create(SandboxConfig::default()).unwrap().id;

    let start = Instant::now();
    let err = s
        .execute(id, "sleep 30", Some(Duration::from_millis(500)))
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout { .. }));
    // Command timeout plus the default two-second slack, with room to spare.
    assert!(start.elapsed() < Duration::from_secs(5));

    // The sandbox is still usable.
    assert_eq!(s.execute(id, "echo ok", None).unwrap().stdout, "ok\n");
    assert!(s.shutdown());
}

#[test]
fn test_full_queue_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.workers = 1;
    config.queue_depth = 1;
    let s = SandboxService::new(config).unwrap();

    let ids: Vec<_> = (0..3)
        .map(|_| s.create(SandboxConfig::default()).unwrap().id)
        .collect();

    let busy = s.submit_execute(ids[0], "sleep 1", None).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    let queued = s.submit_execute(ids[1], "echo queued", None).unwrap();
    let err = s.submit_execute(ids[2], "echo rejected", None).err().unwrap();
    assert!(matches!(err, CoreError::Overloaded { .. }));
    assert!(s.bridge_stats().rejected() >= 1);

    busy.wait().unwrap();
    assert_eq!(queued.wait().unwrap().stdout, "queued\n");
    assert!(s.shutdown());
}

#[test]
fn test_remote_provider_without_credential_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.providers.insert(
        "e2b".into(),
        ProviderSettings::new(ProviderKind::E2b).with_endpoint("http://127.0.0.1:1"),
    );
    let s = SandboxService::new(config).unwrap();

    assert!(matches!(
        s.list_provider_health().get("e2b"),
        Some(HealthStatus::Unavailable(_))
    ));
    assert!(matches!(
        s.create(SandboxConfig::builder().provider("e2b").build().unwrap()),
        Err(CoreError::ProviderUnavailable { .. })
    ));
    // The local provider is unaffected.
    assert!(s.create(SandboxConfig::default()).is_ok());
    assert!(s.shutdown());
}

#[test]
fn test_command_overrides_do_not_leak() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(dir.path());
    let config = SandboxConfig::builder().env("MODE", "base").build().unwrap();
    let id = s.create(config).unwrap().id;
    s.upload_file(id, "src/lib.txt", "x").unwrap();

    let spec = CommandSpec::new("ls; echo $MODE").working_dir("/src").env("MODE", "override");
    assert_eq!(s.execute(id, spec, None).unwrap().stdout, "lib.txt\noverride\n");
    assert_eq!(s.execute(id, "echo $MODE", None).unwrap().stdout, "base\n");
    assert!(s.shutdown());
}

/// Remote backend stand-in that only answers health checks.
fn spawn_health_backend(rt: &tokio::runtime::Runtime) -> String {
    let app = axum::Router::new().route("/health", axum::routing::get(|| async { "ok" }));
    let listener = rt
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let addr = listener.local_addr().unwrap();
    rt.spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[test]
fn test_corrupted_credential_makes_provider_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let endpoint = spawn_health_backend(&rt);

    let mut config = config(dir.path());
    config.state_dir = Some(dir.path().join("state"));
    config.master_secret = MasterSecretSource::Inline("test-master".into());
    config.providers.insert(
        "e2b".into(),
        ProviderSettings::new(ProviderKind::E2b).with_endpoint(&endpoint),
    );
    let s = SandboxService::new(config).unwrap();
    assert_eq!(
        s.save_credential("e2b", "e2b_live_key_123").unwrap(),
        HealthStatus::Available
    );

    let path = dir.path().join("state/credentials/default/e2b.json");
    let mut entry: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    entry["blob"] = serde_json::Value::String("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into());
    std::fs::write(&path, serde_json::to_string(&entry).unwrap()).unwrap();

    // The cached health is stale; the first call finds out and degrades it.
    let e2b = || SandboxConfig::builder().provider("e2b").build().unwrap();
    assert!(matches!(
        s.create(e2b()),
        Err(CoreError::CredentialUnavailable { .. })
    ));
    assert!(!s.list_provider_health()["e2b"].is_usable());

    let health = s.refresh_health().unwrap();
    match health.get("e2b") {
        Some(HealthStatus::Unavailable(reason)) => assert!(reason.contains("credential")),
        other => panic!("expected e2b unavailable, got {other:?}"),
    }
    assert_eq!(health.get("local"), Some(&HealthStatus::Available));
    assert!(matches!(
        s.create(e2b()),
        Err(CoreError::ProviderUnavailable { .. })
    ));

    // Everything else keeps working.
    let local = s.create(SandboxConfig::default()).unwrap().id;
    assert_eq!(s.execute(local, "echo ok", None).unwrap().stdout, "ok\n");
    s.destroy(local).unwrap();
    s.shutdown();
}
