#![cfg(unix)]

use super::*;
use crate::config::ServiceDefinition;
use crate::error::ErrorKind;
use crate::models::{LogSource, ServiceState, TunnelState};
use crate::port::{is_port_free, PortPolicy};
use crate::settings::{Readiness, ServerBinary, CONFIG_FILE_NAME};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const SERVE: &str = r#"echo "Listening on http://127.0.0.1:$3"; exec sleep 30"#;

fn settings_in(data_dir: PathBuf) -> Settings {
    let mut settings = Settings::with_data_dir(data_dir);
    settings.server = ServerBinary::new("/bin/sh").with_args(["-c", SERVE, "sh"]);
    settings.readiness = Readiness::OutputContains("Listening on".into());
    settings.timeouts.readiness = Duration::from_secs(5);
    settings.timeouts.stop_grace = Duration::from_millis(500);
    settings.timeouts.download = Duration::from_secs(2);
    settings.timeouts.autosave_debounce = Duration::from_millis(50);
    settings.tunnel.download_url = "http://127.0.0.1:1/cloudflared".into();
    settings
}

fn settings(dir: &TempDir) -> Settings {
    settings_in(dir.path().join("data"))
}

fn www(dir: &TempDir, name: &str) -> PathBuf {
    let root = dir.path().join(name);
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn running(manager: &ServiceManager, id: &ServiceId) -> Arc<Service> {
    let svc = manager.service(id).unwrap();
    let state = svc
        .wait_for(Duration::from_secs(5), |s| s == ServiceState::Running)
        .await;
    assert_eq!(state, Some(ServiceState::Running), "{:?}", svc.last_error());
    svc
}

fn read_raw(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn allocates_first_usable_port_and_runs_lifecycle() {
    let dir = TempDir::new().unwrap();
    let floor_holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let floor = floor_holder.local_addr().unwrap().port();
    let ceiling = floor.saturating_add(50);

    let mut settings = settings(&dir);
    settings.ports = PortPolicy {
        min_port: floor,
        max_port: ceiling,
        default_port: floor,
        reserved_max: 1024,
        deny_list: [floor.saturating_add(1)].into_iter().collect(),
    };
    let manager = ServiceManager::open(settings).await.unwrap();

    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = manager.subscribe(Topic::State, move |event| {
        if let Event::StateChanged { to, .. } = event {
            sink.lock().unwrap().push(to);
        }
    });

    let expected = (floor.saturating_add(2)..=ceiling)
        .find(|p| is_port_free(*p))
        .unwrap();
    let config = manager
        .add_service(ServiceDefinition::new("docs", www(&dir, "srv/docs")))
        .await
        .unwrap();
    assert_eq!(config.port, expected);
    assert_eq!(manager.service(&config.id).unwrap().state(), ServiceState::Stopped);

    assert_eq!(
        manager.start_service(&config.id).await.unwrap(),
        ServiceState::Starting
    );
    let svc = running(&manager, &config.id).await;
    let snapshot = svc.snapshot();
    assert!(snapshot
        .runtime
        .local_url
        .unwrap()
        .ends_with(&format!(":{expected}")));

    manager.stop_service(&config.id).await.unwrap();
    assert_eq!(svc.state(), ServiceState::Stopped);

    for _ in 0..50 {
        if seen.lock().unwrap().len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        *seen.lock().unwrap(),
        [
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Stopping,
            ServiceState::Stopped
        ]
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn explicit_port_taken_by_another_service_is_refused() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let port = free_port();

    manager
        .add_service(ServiceDefinition::new("a", www(&dir, "a")).with_port(port))
        .await
        .unwrap();
    let err = manager
        .add_service(ServiceDefinition::new("b", www(&dir, "b")).with_port(port))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PortUnavailable);
    assert_eq!(manager.list_services().len(), 1);
    assert_eq!(manager.document().await.services.len(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn allocated_ports_are_distinct() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let mut ports = std::collections::HashSet::new();
    for name in ["one", "two", "three"] {
        let config = manager
            .add_service(ServiceDefinition::new(name, www(&dir, name)))
            .await
            .unwrap();
        assert!(ports.insert(config.port));
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn names_must_be_unique_and_present() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    manager
        .add_service(ServiceDefinition::new("docs", www(&dir, "docs")))
        .await
        .unwrap();

    let err = manager
        .add_service(ServiceDefinition::new("  docs ", www(&dir, "other")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateName);

    let err = manager
        .add_service(ServiceDefinition::new("   ", www(&dir, "other")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    manager.shutdown().await;
}

#[tokio::test]
async fn paths_are_checked() {
    let dir = TempDir::new().unwrap();
    let allowed = www(&dir, "allowed");
    let mut settings = settings(&dir);
    settings.allowed_roots = vec![allowed.clone()];
    let manager = ServiceManager::open(settings).await.unwrap();

    let missing = manager
        .add_service(ServiceDefinition::new("missing", dir.path().join("nope")))
        .await
        .unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::InvalidPath);

    let outside = manager
        .add_service(ServiceDefinition::new("outside", www(&dir, "elsewhere")))
        .await
        .unwrap_err();
    assert_eq!(outside.kind(), ErrorKind::InvalidPath);

    let mut deep = allowed.clone();
    for level in 0..=crate::settings::MAX_PATH_DEPTH {
        deep.push(format!("d{level}"));
    }
    std::fs::create_dir_all(&deep).unwrap();
    let too_deep = manager
        .add_service(ServiceDefinition::new("deep", deep))
        .await
        .unwrap_err();
    assert_eq!(too_deep.kind(), ErrorKind::InvalidPath);

    let file = allowed.join("file.txt");
    std::fs::write(&file, "x").unwrap();
    let not_dir = manager
        .add_service(ServiceDefinition::new("file", file))
        .await
        .unwrap_err();
    assert_eq!(not_dir.kind(), ErrorKind::InvalidPath);

    manager
        .add_service(ServiceDefinition::new("ok", www(&dir, "allowed/inner")))
        .await
        .unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn stored_root_is_the_resolved_directory() {
    let dir = TempDir::new().unwrap();
    let real = www(&dir, "real");
    let link = dir.path().join("link");
    std::os::unix::fs::symlink(&real, &link).unwrap();
    let resolved = real.canonicalize().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();

    let via_link = manager
        .add_service(ServiceDefinition::new("linked", &link))
        .await
        .unwrap();
    assert_eq!(via_link.root_path, resolved);

    let dotted = manager
        .add_service(ServiceDefinition::new("dotted", real.join("..").join("real")))
        .await
        .unwrap();
    assert_eq!(dotted.root_path, resolved);
    manager.shutdown().await;
}

#[tokio::test]
async fn tunnel_download_failure_leaves_service_running() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let config = manager
        .add_service(ServiceDefinition::new("docs", www(&dir, "docs")))
        .await
        .unwrap();
    manager.start_service(&config.id).await.unwrap();
    let svc = running(&manager, &config.id).await;

    assert_eq!(
        manager.enable_tunnel(&config.id).await.unwrap(),
        TunnelState::Connecting
    );
    let settled = svc
        .tunnel()
        .wait_for(Duration::from_secs(10), |s| s != TunnelState::Connecting)
        .await;
    assert_eq!(settled, Some(TunnelState::Error));

    let runtime = manager.snapshot(&config.id).unwrap().runtime;
    assert_eq!(runtime.state, ServiceState::Running);
    assert_eq!(
        runtime.tunnel.last_error.map(|e| e.kind),
        Some(ErrorKind::BinaryUnavailable)
    );
    assert!(runtime.tunnel.public_url.is_none());
    manager.shutdown().await;
}

#[tokio::test]
async fn edit_requires_stopped_service() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let config = manager
        .add_service(ServiceDefinition::new("docs", www(&dir, "docs")))
        .await
        .unwrap();
    manager.start_service(&config.id).await.unwrap();
    running(&manager, &config.id).await;

    let edit = ServiceDefinition::new("renamed", www(&dir, "docs"));
    let err = manager
        .edit_service(&config.id, edit.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    manager.stop_service(&config.id).await.unwrap();
    let edited = manager.edit_service(&config.id, edit).await.unwrap();
    assert_eq!(edited.name, "renamed");
    assert_eq!(edited.port, config.port);
    assert_eq!(edited.created_at, config.created_at);

    let raw = read_raw(&manager.settings().config_path());
    assert!(raw.contains("renamed"));
    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn edit_racing_start_serves_the_configured_port() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let root = www(&dir, "docs");

    for round in 0..5 {
        let name = format!("docs-{round}");
        let config = manager
            .add_service(ServiceDefinition::new(name.clone(), &root))
            .await
            .unwrap();
        let edit = ServiceDefinition::new(name, &root).with_port(free_port());

        let editor = {
            let manager = manager.clone();
            let id = config.id.clone();
            tokio::spawn(async move { manager.edit_service(&id, edit).await })
        };
        let starter = {
            let manager = manager.clone();
            let id = config.id.clone();
            tokio::spawn(async move { manager.start_service(&id).await })
        };
        let (edited, started) = tokio::join!(editor, starter);
        assert_eq!(started.unwrap().unwrap(), ServiceState::Starting);
        match edited.unwrap() {
            Ok(edited) => assert_ne!(edited.port, config.port),
            Err(e) => assert_eq!(e.kind(), ErrorKind::InvalidState),
        }

        let svc = running(&manager, &config.id).await;
        let announced = svc
            .logs(50)
            .into_iter()
            .find(|line| line.source == LogSource::Stdout && line.text.contains("Listening on"))
            .unwrap();
        assert!(
            announced.text.ends_with(&format!(":{}", svc.port())),
            "{} vs configured {}",
            announced.text,
            svc.port()
        );
        manager.stop_service(&config.id).await.unwrap();
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn removing_a_running_service_stops_it_first() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let config = manager
        .add_service(ServiceDefinition::new("docs", www(&dir, "docs")))
        .await
        .unwrap();
    manager.start_service(&config.id).await.unwrap();
    let pid = running(&manager, &config.id).await.pid().unwrap();

    manager.remove_service(&config.id).await.unwrap();

    assert!(manager.list_services().is_empty());
    assert_eq!(
        manager.service(&config.id).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(!ProcessTable::new().is_alive(pid));
    let doc = manager.document().await;
    assert!(doc.services.is_empty());
    assert!(!doc.session.running.contains(&config.id));
    manager.shutdown().await;
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let ghost = ServiceId::from("ghost");
    assert_eq!(
        manager.start_service(&ghost).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        manager.remove_service(&ghost).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn start_all_reports_each_failure() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let good = manager
        .add_service(ServiceDefinition::new("good", www(&dir, "good")))
        .await
        .unwrap();
    let doomed_root = www(&dir, "doomed");
    let doomed = manager
        .add_service(ServiceDefinition::new("doomed", doomed_root.clone()))
        .await
        .unwrap();
    std::fs::remove_dir_all(&doomed_root).unwrap();

    let report = manager.start_all().await;
    assert_eq!(report.items.len(), 2);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].service_id, doomed.id);
    assert_eq!(
        failures[0].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::InvalidPath)
    );
    running(&manager, &good.id).await;

    let report = manager.stop_all().await;
    assert!(report.is_success());
    assert_eq!(manager.service(&good.id).unwrap().state(), ServiceState::Stopped);
    manager.shutdown().await;
}

#[tokio::test]
async fn configuration_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let config = manager
        .add_service(
            ServiceDefinition::new("docs", www(&dir, "docs")).with_auth("admin", "s3cret-pass"),
        )
        .await
        .unwrap();
    manager
        .update_app_state(serde_json::json!({ "window": { "width": 800 } }))
        .await;
    manager.shutdown().await;

    let path = settings(&dir).config_path();
    assert!(!read_raw(&path).contains("s3cret-pass"));

    let reopened = ServiceManager::open(settings(&dir)).await.unwrap();
    let snapshot = reopened.snapshot(&config.id).unwrap();
    assert_eq!(snapshot.config.name, "docs");
    assert_eq!(snapshot.config.port, config.port);
    assert_eq!(
        snapshot.config.auth.map(|a| a.secret.expose().to_string()),
        Some("s3cret-pass".to_string())
    );
    assert_eq!(snapshot.runtime.state, ServiceState::Stopped);
    assert_eq!(
        reopened.app_state().await.0["window"]["width"],
        serde_json::json!(800)
    );
    assert!(reopened.previous_session().normal_exit);
    reopened.shutdown().await;
}

#[tokio::test]
async fn hand_edited_duplicates_are_repaired_on_open() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    std::fs::create_dir_all(&settings.data_dir).unwrap();
    let root = www(&dir, "docs");
    let raw = serde_json::json!({
        "schema_version": 2,
        "services": [
            { "id": "a", "name": "docs", "root_path": root, "port": 41500 },
            { "id": "b", "name": "docs", "root_path": root, "port": 41500 }
        ]
    });
    std::fs::write(
        settings.data_dir.join(CONFIG_FILE_NAME),
        serde_json::to_vec(&raw).unwrap(),
    )
    .unwrap();

    let manager = ServiceManager::open(settings).await.unwrap();
    let listed = manager.list_services();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].name, "docs");
    assert_eq!(listed[1].name, "docs_1");
    assert_ne!(listed[0].port, listed[1].port);

    let doc = manager.document().await;
    assert_eq!(doc.services[1].name, "docs_1");
    assert!(read_raw(&manager.settings().config_path()).contains("docs_1"));
    manager.shutdown().await;
}

#[tokio::test]
async fn crashed_session_is_restored() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let config = manager
        .add_service(ServiceDefinition::new("docs", www(&dir, "docs")))
        .await
        .unwrap();
    manager.start_service(&config.id).await.unwrap();
    running(&manager, &config.id).await;
    for _ in 0..50 {
        if manager.document().await.session.running.contains(&config.id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    manager.persist().await.unwrap();

    // what a crash leaves on disk: the running list and normal_exit = false
    let crash_dir = dir.path().join("after-crash");
    std::fs::create_dir_all(&crash_dir).unwrap();
    std::fs::copy(
        manager.settings().config_path(),
        crash_dir.join(CONFIG_FILE_NAME),
    )
    .unwrap();
    manager.shutdown().await;

    let restored = ServiceManager::open(settings_in(crash_dir)).await.unwrap();
    assert!(!restored.previous_session().normal_exit);
    let report = restored.restore_session().await;
    assert_eq!(report.items.len(), 1);
    assert!(report.is_success());
    running(&restored, &config.id).await;
    restored.shutdown().await;
}

#[tokio::test]
async fn clean_recent_exit_is_not_restored() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    let config = manager
        .add_service(ServiceDefinition::new("docs", www(&dir, "docs")))
        .await
        .unwrap();
    manager.start_service(&config.id).await.unwrap();
    running(&manager, &config.id).await;
    manager.shutdown().await;

    let reopened = ServiceManager::open(settings(&dir)).await.unwrap();
    assert!(reopened.previous_session().normal_exit);
    assert!(reopened.restore_session().await.items.is_empty());
    assert_eq!(
        reopened.service(&config.id).unwrap().state(),
        ServiceState::Stopped
    );
    reopened.shutdown().await;
}

#[tokio::test]
async fn reconcile_on_idle_collection_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    manager
        .add_service(ServiceDefinition::new("docs", www(&dir, "docs")))
        .await
        .unwrap();
    assert_eq!(manager.reconcile(), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn close_keeps_previous_exit_markers() {
    let dir = TempDir::new().unwrap();
    let manager = ServiceManager::open(settings(&dir)).await.unwrap();
    manager.shutdown().await;
    let ended = ServiceManager::open(settings(&dir)).await.unwrap();
    let marker = ended.previous_session().last_exit;
    assert!(marker.is_some());

    ended
        .add_service(ServiceDefinition::new("docs", www(&dir, "docs")))
        .await
        .unwrap();
    ended.close().await.unwrap();

    let reopened = ServiceManager::open(settings(&dir)).await.unwrap();
    assert!(reopened.previous_session().normal_exit);
    assert_eq!(reopened.previous_session().last_exit, marker);
    assert_eq!(reopened.list_services().len(), 1);
    reopened.shutdown().await;
}
