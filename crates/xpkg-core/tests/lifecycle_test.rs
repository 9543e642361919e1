//! Manager lifecycle tests
//!
//! Drives real archives through the loader, registry and config manager with a
//! stub host in place of the native one.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use tokio::sync::Notify;
use xpkg_core::prelude::*;
use xpkg_core::ManagerConfig;

#[tokio::test]
async fn test_pack_load_enable_find() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    let manager = manager(root.path(), host.clone(), &[]);
    write_config(root.path(), &ExtensionConfig::disabled("demo"));

    let archive = pack(root.path(), "demo", DEMO_MANIFEST);
    let id = manager.load_plugin(&archive).await.unwrap();
    assert_eq!(id, "demo");

    let entry = manager.registry().get("demo").await.unwrap();
    assert_eq!(entry.state, ExtensionState::Ready);
    assert_eq!(entry.instance.metadata().id, "demo");
    assert!(entry.loaded_at.is_some());

    // Only active extensions are found
    assert!(manager
        .find_by_capability(CapabilityType::Embedding, Some("m1"))
        .await
        .is_err());

    manager.enable_plugin("demo").await.unwrap();
    let entry = manager.registry().get("demo").await.unwrap();
    assert_eq!(entry.state, ExtensionState::Active);
    assert!(entry.config.enabled);

    let found = manager
        .find_by_capability(CapabilityType::Embedding, Some("m1"))
        .await
        .unwrap();
    assert_eq!(found.id(), "demo");
    assert!(manager
        .find_by_capability(CapabilityType::Embedding, Some("m9"))
        .await
        .is_err());
    assert!(manager
        .find_by_capability(CapabilityType::Chat, None)
        .await
        .is_err());
    assert!(manager.registry().get("demo").await.unwrap().last_used_at.is_some());

    // The sandbox is gone
    let leftovers: Vec<_> = std::fs::read_dir(root.path().join("tmp"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("xpkg-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_enabled_config_goes_straight_to_active() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), StubHost::new(), &[]);

    let archive = pack(root.path(), "demo", DEMO_MANIFEST);
    manager.load_plugin(&archive).await.unwrap();

    let entry = manager.registry().get("demo").await.unwrap();
    assert_eq!(entry.state, ExtensionState::Active);
    let embedder = manager.get_embedder("demo").await.unwrap();
    assert_eq!(embedder.embed("hello").await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_enable_failure_sets_error_and_keeps_flag() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    host.set_behavior(
        "demo",
        Behavior {
            fail_enable: true,
            ..Default::default()
        },
    );
    let manager = manager(root.path(), host, &[]);
    write_config(root.path(), &ExtensionConfig::disabled("demo"));

    let archive = pack(root.path(), "demo", DEMO_MANIFEST);
    manager.load_plugin(&archive).await.unwrap();

    let err = manager.enable_plugin("demo").await.unwrap_err();
    assert!(matches!(err, ExtensionError::Lifecycle { .. }));

    let entry = manager.registry().get("demo").await.unwrap();
    assert_eq!(entry.state, ExtensionState::Error);
    assert!(!entry.config.enabled);
    assert!(entry.error.unwrap().contains("enable"));

    // Error entries are not handed out
    assert!(matches!(
        manager.get_plugin("demo").await,
        Err(ExtensionError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_initialize_failure_recorded_then_retry_replaces_entry() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    host.set_behavior(
        "demo",
        Behavior {
            fail_initialize: true,
            ..Default::default()
        },
    );
    let manager = manager(root.path(), host.clone(), &[]);
    let archive = pack(root.path(), "demo", DEMO_MANIFEST);

    assert!(manager.load_plugin(&archive).await.is_err());
    let entry = manager.registry().get("demo").await.unwrap();
    assert_eq!(entry.state, ExtensionState::Error);
    assert!(entry.error.is_some());

    host.set_behavior("demo", Behavior::default());
    manager.load_plugin(&archive).await.unwrap();
    assert_eq!(manager.registry().count().await, 1);
    assert_eq!(
        manager.registry().get("demo").await.unwrap().state,
        ExtensionState::Active
    );
}

#[tokio::test]
async fn test_id_mismatch_rejected_atomically() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    host.set_behavior(
        "demo",
        Behavior {
            report_id: Some("impostor".to_string()),
            ..Default::default()
        },
    );
    let manager = manager(root.path(), host.clone(), &[]);
    let archive = pack(root.path(), "demo", DEMO_MANIFEST);

    let err = manager.load_plugin(&archive).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Extension ID mismatch: manifest=demo, extension=impostor"
    );
    assert_eq!(manager.registry().count().await, 0);
    assert_eq!(
        host.last_instance()
            .unwrap()
            .cleanups
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_duplicate_load_rejected() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), StubHost::new(), &[]);
    let archive = pack(root.path(), "demo", DEMO_MANIFEST);

    manager.load_plugin(&archive).await.unwrap();
    let err = manager.load_plugin(&archive).await.unwrap_err();
    assert!(matches!(err, ExtensionError::AlreadyRegistered(_)));
    assert_eq!(
        manager.registry().get("demo").await.unwrap().state,
        ExtensionState::Active
    );
}

#[tokio::test]
async fn test_checksum_and_portable_binary() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), StubHost::new(), &[]);

    let tampered = manifest_json("sum", r#"[{"type":"embedding"}]"#)
        .replace("\"version\"", "\"checksum\":\"deadbeef\",\"version\"");
    let archive = pack(root.path(), "sum", &tampered);
    assert!(matches!(
        manager.load_plugin(&archive).await,
        Err(ExtensionError::Integrity { .. })
    ));

    let manifest = manifest_json("wasm", r#"[{"type":"embedding"}]"#);
    let archive = root.path().join("wasm.xpkg");
    write_zip(
        &archive,
        &[
            ("manifest.json", manifest.as_bytes()),
            ("plugin.wasm", &b"\0asm"[..]),
        ],
    );
    assert!(matches!(
        manager.load_plugin(&archive).await,
        Err(ExtensionError::NotImplemented(_))
    ));
    assert_eq!(manager.registry().count().await, 0);
}

fn write_zip(path: &std::path::Path, entries: &[(&str, &[u8])]) {
    use std::io::Write;
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    for (name, data) in entries {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

#[tokio::test]
async fn test_host_version_window_enforced() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), StubHost::new(), &[]);
    let json = manifest_json("future", r#"[{"type":"embedding"}]"#)
        .replace("\"version\"", "\"min_version\":\"99.0.0\",\"version\"");
    let archive = pack(root.path(), "future", &json);
    assert!(matches!(
        manager.load_plugin(&archive).await,
        Err(ExtensionError::Validation(_))
    ));
}

#[tokio::test]
async fn test_disable_and_reenable() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    let manager = manager(root.path(), host.clone(), &[]);
    manager
        .load_plugin(&pack(root.path(), "demo", DEMO_MANIFEST))
        .await
        .unwrap();
    let instance = host.last_instance().unwrap();

    manager.disable_plugin("demo").await.unwrap();
    let entry = manager.registry().get("demo").await.unwrap();
    assert_eq!(entry.state, ExtensionState::Disabled);
    assert!(!entry.config.enabled);
    assert!(!instance.is_enabled());
    assert!(manager
        .find_by_capability(CapabilityType::Embedding, None)
        .await
        .is_err());

    // Disabled entries cannot be handed out
    assert!(manager.get_embedder("demo").await.is_err());

    manager.enable_plugin("demo").await.unwrap();
    manager.enable_plugin("demo").await.unwrap();
    assert!(instance.is_enabled());

    // The flag was persisted
    let stored = manager.config_manager();
    stored.invalidate("demo");
    assert!(stored.load_config("demo").await.unwrap().enabled);
}

#[tokio::test]
async fn test_unload_survives_cleanup_failure() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    host.set_behavior(
        "demo",
        Behavior {
            fail_cleanup: true,
            ..Default::default()
        },
    );
    let manager = manager(root.path(), host, &[]);
    manager
        .load_plugin(&pack(root.path(), "demo", DEMO_MANIFEST))
        .await
        .unwrap();

    manager.unload_plugin("demo").await.unwrap();
    assert!(!manager.registry().contains("demo").await);
    assert!(manager
        .registry()
        .get_by_type(CapabilityType::Embedding)
        .await
        .is_empty());
    assert!(matches!(
        manager.unload_plugin("demo").await,
        Err(ExtensionError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_reload_config_paths() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    let json = r#"{
        "id": "conf", "name": "Conf", "version": "1.0.0",
        "capabilities": [{"type": "embedding", "models": ["m1"]}],
        "config_schema": {
            "required": ["api_key"],
            "properties": {"api_key": {"type": "string"}, "top_n": {"type": "integer", "default": 3}}
        }
    }"#;
    let manager = manager(root.path(), host.clone(), &[("PLUGIN_CONF_API_KEY", "sk-env")]);
    manager
        .load_plugin(&pack(root.path(), "conf", json))
        .await
        .unwrap();

    let entry = manager.registry().get("conf").await.unwrap();
    assert_eq!(entry.config.settings["api_key"], "sk-env");
    assert_eq!(entry.config.settings["top_n"], 3);

    // Invalid config: nothing changes
    let bad = entry.config.clone().with_setting("top_n", "many");
    assert!(matches!(
        manager.reload_config("conf", bad).await,
        Err(ExtensionError::Schema { .. })
    ));
    let unchanged = manager.registry().get("conf").await.unwrap();
    assert_eq!(unchanged.state, ExtensionState::Active);
    assert_eq!(unchanged.config.settings["top_n"], 3);

    // Valid config: applied and persisted without the env value
    let good = entry.config.clone().with_setting("top_n", 7);
    manager.reload_config("conf", good).await.unwrap();
    assert_eq!(
        manager.registry().get("conf").await.unwrap().config.settings["top_n"],
        7
    );
    let saved: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.path().join("config/conf.json")).unwrap())
            .unwrap();
    assert_eq!(saved["settings"]["top_n"], json!(7));
    assert!(saved["settings"].get("api_key").is_none());
    let instance = host.last_instance().unwrap();
    assert_eq!(instance.reloads.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reload_rejected_by_extension_keeps_config() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    host.set_behavior(
        "demo",
        Behavior {
            fail_reload: true,
            ..Default::default()
        },
    );
    let manager = manager(root.path(), host, &[]);
    manager
        .load_plugin(&pack(root.path(), "demo", DEMO_MANIFEST))
        .await
        .unwrap();

    let config = ExtensionConfig::new("demo").with_setting("model", "m2");
    assert!(manager.reload_config("demo", config).await.is_err());

    let entry = manager.registry().get("demo").await.unwrap();
    assert_eq!(entry.state, ExtensionState::Error);
    assert!(entry.config.settings.get("model").is_none());
}

#[tokio::test]
async fn test_missing_required_setting_fails_initialize() {
    let root = tempfile::tempdir().unwrap();
    let json = r#"{
        "id": "strict", "name": "Strict", "version": "1.0.0",
        "capabilities": [{"type": "embedding"}],
        "config_schema": {"required": ["api_key"]}
    }"#;
    let manager = manager(root.path(), StubHost::new(), &[]);
    let err = manager
        .load_plugin(&pack(root.path(), "strict", json))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtensionError::Schema { .. }));
    assert_eq!(
        manager.registry().get("strict").await.unwrap().state,
        ExtensionState::Error
    );
}

#[tokio::test]
async fn test_typed_handles() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), StubHost::new(), &[]);
    manager
        .load_plugin(&pack(root.path(), "demo", DEMO_MANIFEST))
        .await
        .unwrap();

    let embedder = manager.get_embedder("demo").await.unwrap();
    assert!(matches!(embedder.embed("   ").await, Err(ExtensionError::EmptyInput)));

    let reranker = manager.get_reranker("demo").await.unwrap();
    let docs = vec![
        RerankDocument::new(1, "a"),
        RerankDocument::new(2, "ccc"),
        RerankDocument::new(3, "bb"),
    ];
    let ranked = reranker.rerank("query", &docs).await.unwrap();
    assert_eq!(ranked.len(), docs.len());
    let ids: Vec<u64> = ranked.iter().map(|r| r.document.id).collect();
    assert_eq!(ids, vec![2, 3, 1]);
    let ranks: Vec<u32> = ranked.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));

    assert!(matches!(
        manager.get_chat("demo").await,
        Err(ExtensionError::Unsupported { .. })
    ));
}

#[tokio::test]
async fn test_chat_stream_appends_end_marker() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), StubHost::new(), &[]);
    let json = manifest_json("talk", r#"[{"type":"chat","models":["c1"]}]"#);
    manager
        .load_plugin(&pack(root.path(), "talk", &json))
        .await
        .unwrap();

    let chat = manager.get_chat("talk").await.unwrap();
    let request = ChatRequest {
        model: "c1".to_string(),
        messages: vec![ChatMessage::user("hello streaming world")],
        ..Default::default()
    };
    assert_eq!(
        chat.chat(&request).await.unwrap().choices[0].message.content,
        "hello streaming world"
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    chat.chat_stream(&request, tx).await.unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(String::from_utf8(chunk).unwrap());
    }
    assert_eq!(chunks, vec!["hello", "streaming", "world", "[DONE]"]);

    // A caller that went away surfaces as cancellation
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    drop(rx);
    assert!(matches!(
        chat.chat_stream(&request, tx).await,
        Err(ExtensionError::Cancelled(_))
    ));
}

#[tokio::test]
async fn test_start_discovers_and_loads() {
    let root = tempfile::tempdir().unwrap();
    let mut config = ManagerConfig::rooted(root.path());
    config.auto_discover = true;
    config.auto_load = true;
    std::fs::create_dir_all(&config.plugin_dir).unwrap();

    pack(&config.plugin_dir, "demo", DEMO_MANIFEST);
    pack(
        &config.plugin_dir.join("nested"),
        "other",
        &manifest_json("other", r#"[{"type":"rerank"}]"#),
    );
    std::fs::write(config.plugin_dir.join("broken.xpkg"), b"not a zip").unwrap();

    let configs = xpkg_core::config::ConfigManager::file_backed(&config.config_dir)
        .with_env(fixed_env(&[]));
    let manager =
        xpkg_core::ExtensionManager::with_config_manager(config, StubHost::new(), configs).unwrap();
    manager.start().await.unwrap();

    let mut ids: Vec<String> = manager
        .list_plugins()
        .await
        .iter()
        .map(|e| e.id().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["demo", "other"]);

    manager.shutdown().await;
    assert_eq!(manager.registry().count().await, 0);
}

#[tokio::test]
async fn test_discover_without_auto_load_loads_nothing() {
    let root = tempfile::tempdir().unwrap();
    let mut config = ManagerConfig::rooted(root.path());
    config.auto_discover = true;
    std::fs::create_dir_all(&config.plugin_dir).unwrap();
    pack(&config.plugin_dir, "demo", DEMO_MANIFEST);

    let configs = xpkg_core::config::ConfigManager::file_backed(&config.config_dir)
        .with_env(fixed_env(&[]));
    let manager =
        xpkg_core::ExtensionManager::with_config_manager(config, StubHost::new(), configs).unwrap();
    manager.start().await.unwrap();
    assert_eq!(manager.registry().count().await, 0);

    assert_eq!(manager.discover_and_load().await, vec!["demo".to_string()]);
}

#[tokio::test]
async fn test_rejected_registration_cleans_up_instance() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    host.set_behavior(
        "demo",
        Behavior {
            hide_adapters: true,
            ..Default::default()
        },
    );
    let manager = manager(root.path(), host.clone(), &[]);
    let archive = pack(root.path(), "demo", DEMO_MANIFEST);

    let err = manager.load_plugin(&archive).await.unwrap_err();
    assert!(matches!(err, ExtensionError::CapabilityMismatch { .. }));
    assert_eq!(manager.registry().count().await, 0);
    assert_eq!(host.last_instance().unwrap().cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_of_different_archives() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), StubHost::new(), &[]);
    let first = pack(root.path(), "demo", DEMO_MANIFEST);
    let second = pack(
        root.path(),
        "other",
        &manifest_json("other", r#"[{"type":"rerank","models":["r2"]}]"#),
    );

    let (a, b) = tokio::join!(manager.load_plugin(&first), manager.load_plugin(&second));
    assert_eq!(a.unwrap(), "demo");
    assert_eq!(b.unwrap(), "other");
    assert_eq!(manager.registry().count().await, 2);
    for id in ["demo", "other"] {
        assert_eq!(
            manager.registry().get(id).await.unwrap().state,
            ExtensionState::Active
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_loads_of_one_id() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    let manager = Arc::new(manager(root.path(), host.clone(), &[]));
    let first = pack(root.path(), "demo-a", DEMO_MANIFEST);
    let second = pack(root.path(), "demo-b", DEMO_MANIFEST);

    let tasks: Vec<_> = [first, second]
        .into_iter()
        .map(|archive| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.load_plugin(&archive).await })
        })
        .collect();

    let mut loaded = 0;
    let mut duplicates = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(id) => {
                assert_eq!(id, "demo");
                loaded += 1;
            }
            Err(ExtensionError::AlreadyRegistered(id)) => {
                assert_eq!(id, "demo");
                duplicates += 1;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!((loaded, duplicates), (1, 1));
    assert_eq!(manager.registry().count().await, 1);
    assert_eq!(
        manager.registry().get("demo").await.unwrap().state,
        ExtensionState::Active
    );

    // The losing instance was cleaned up, the winner was not
    let cleanups: usize = host
        .instances
        .lock()
        .iter()
        .map(|i| i.cleanups.load(Ordering::SeqCst))
        .sum();
    assert_eq!(cleanups, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_answers_while_extension_call_blocks() {
    let root = tempfile::tempdir().unwrap();
    let host = StubHost::new();
    let gate = Arc::new(Notify::new());
    host.set_behavior(
        "demo",
        Behavior {
            enable_gate: Some(gate.clone()),
            ..Default::default()
        },
    );
    let manager = Arc::new(manager(root.path(), host.clone(), &[]));
    write_config(root.path(), &ExtensionConfig::disabled("demo"));
    let archive = pack(root.path(), "demo", DEMO_MANIFEST);
    manager.load_plugin(&archive).await.unwrap();
    let instance = host.last_instance().unwrap();

    let enabling = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.enable_plugin("demo").await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while instance.enable_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("enable never started");

    // enable() is parked; bookkeeping and capability calls still answer
    let entry = tokio::time::timeout(Duration::from_secs(1), manager.registry().get("demo"))
        .await
        .expect("registry blocked by a running extension call")
        .unwrap();
    assert_eq!(entry.state, ExtensionState::Ready);
    let listed = tokio::time::timeout(Duration::from_secs(1), manager.list_plugins())
        .await
        .expect("listing blocked by a running extension call");
    assert_eq!(listed.len(), 1);
    let embedder = manager.get_embedder("demo").await.unwrap();
    assert_eq!(embedder.embed("abc").await.unwrap()[0], 3.0);

    gate.notify_one();
    enabling.await.unwrap().unwrap();
    assert_eq!(
        manager.registry().get("demo").await.unwrap().state,
        ExtensionState::Active
    );
}
