//! End-to-end tests against the real file-backed collaborators
//!
//! Every test works inside its own temporary directory; nginx commands are
//! left empty so no external process is needed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ssl_termination_proxy::controller::{
    run_controller, AppliedStateStore, Collaborators, ControllerState, Reconciler,
    ReconcilerOptions, ServicePhase, StatusBoard, StatusLevel,
};
use ssl_termination_proxy::proxy::{
    verify_ssha_entry, HtpasswdStore, NginxConfigurer, SelfSignedAuthority,
};
use ssl_termination_proxy::relation::{
    ChannelEventSource, DirectoryEventSource, EventSource, RelationEvent, ServiceRequirement,
};

struct Layout {
    root: tempfile::TempDir,
}

impl Layout {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("relations")).unwrap();
        Self { root }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    fn state(&self) -> (Arc<ControllerState>, Arc<StatusBoard>) {
        let board = Arc::new(StatusBoard::new());
        let collaborators = Collaborators {
            authority: Arc::new(SelfSignedAuthority::new(self.path("certs"), 30)),
            credentials: Arc::new(HtpasswdStore::new(self.path("htpasswd"))),
            proxy: Arc::new(NginxConfigurer::new(
                self.path("sites"),
                self.path("htpasswd"),
            )),
            status: board.clone(),
        };
        let applied = AppliedStateStore::load(self.path("state.json")).unwrap();
        let reconciler = Reconciler::new(applied, collaborators, ReconcilerOptions::default());
        (
            Arc::new(ControllerState::new(reconciler, board.clone())),
            board,
        )
    }
}

fn write(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
}

async fn drain(source: &mut DirectoryEventSource, state: &ControllerState) {
    source.poll_once().await.unwrap();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), source.next_event()).await
    {
        state.handle_event(event).await;
    }
}

#[tokio::test]
async fn relation_files_drive_the_proxy() {
    let layout = Layout::new();
    let (state, board) = layout.state();
    let mut source = DirectoryEventSource::new(layout.path("relations"), Duration::from_secs(60));

    write(
        &layout.path("relations/grafana.yaml"),
        r#"
serviceName: grafana
hostnames: [grafana.example.com]
backendAddresses: ["10.0.0.4:3000", "10.0.0.5:3000"]
loadBalancing: least-conn
basicAuth:
  admin: s3cret
"#,
    );
    write(
        &layout.path("relations/wiki.json"),
        r#"{"serviceName": "wiki", "hostnames": ["wiki.example.com"], "backendAddresses": ["10.0.1.1:80"]}"#,
    );

    drain(&mut source, &state).await;
    let outcome = state.reconcile_once().await;
    assert_eq!(outcome.status, ServicePhase::Active);

    let site = std::fs::read_to_string(layout.path("sites/grafana.conf")).unwrap();
    assert!(site.contains("least_conn;"));
    assert!(site.contains("server 10.0.0.5:3000;"));
    assert!(site.contains("auth_basic_user_file"));
    assert!(site.contains("live/grafana.example.com/fullchain.pem"));

    let wiki = std::fs::read_to_string(layout.path("sites/wiki.conf")).unwrap();
    assert!(!wiki.contains("auth_basic"));

    let htpasswd = std::fs::read_to_string(layout.path("htpasswd/grafana")).unwrap();
    assert!(verify_ssha_entry(htpasswd.trim_end(), "admin", "s3cret"));
    assert!(!layout.path("htpasswd/wiki").exists());

    let snapshot = board.snapshot();
    assert_eq!(snapshot.level, StatusLevel::Active);
    assert_eq!(
        snapshot.message,
        "grafana.example.com, wiki.example.com have been registered and are online"
    );

    // Removing the file tears the service down
    std::fs::remove_file(layout.path("relations/wiki.json")).unwrap();
    drain(&mut source, &state).await;
    let outcome = state.reconcile_once().await;
    assert_eq!(outcome.status, ServicePhase::Active);
    assert!(!layout.path("sites/wiki.conf").exists());
    assert_eq!(
        outcome.hostnames.iter().collect::<Vec<_>>(),
        vec!["grafana.example.com"]
    );

    std::fs::remove_file(layout.path("relations/grafana.yaml")).unwrap();
    drain(&mut source, &state).await;
    let outcome = state.reconcile_once().await;
    assert_eq!(outcome.status, ServicePhase::Blocked);
    assert!(!layout.path("sites/grafana.conf").exists());
    assert!(!layout.path("htpasswd/grafana").exists());
    assert_eq!(board.snapshot().level, StatusLevel::Blocked);
}

#[tokio::test]
async fn restart_does_not_redo_work() {
    let layout = Layout::new();
    let requirement =
        ServiceRequirement::new("grafana", ["grafana.example.com"], ["10.0.0.4:3000"]);

    let (state, _) = layout.state();
    state
        .handle_event(RelationEvent::Upsert(requirement.clone()))
        .await;
    let first = state.reconcile_once().await;
    assert_eq!(first.status, ServicePhase::Active);
    let chain_before = std::fs::read(layout.path("certs/live/grafana.example.com/fullchain.pem"))
        .unwrap();
    drop(state);

    let (state, _) = layout.state();
    state.handle_event(RelationEvent::Upsert(requirement)).await;
    let second = state.reconcile_once().await;

    assert_eq!(second.status, ServicePhase::Active);
    assert_eq!(second.actions, 0);
    let chain_after = std::fs::read(layout.path("certs/live/grafana.example.com/fullchain.pem"))
        .unwrap();
    assert_eq!(chain_before, chain_after);
}

#[tokio::test]
async fn controller_loop_consumes_channel_events() {
    let layout = Layout::new();
    let (state, board) = layout.state();
    let (tx, source) = ChannelEventSource::channel(8);

    let handle = tokio::spawn(run_controller(state.clone(), source, None));

    tx.send(RelationEvent::Upsert(ServiceRequirement::new(
        "grafana",
        ["grafana.example.com"],
        ["10.0.0.4:3000"],
    )))
    .await
    .unwrap();
    tx.send(RelationEvent::Upsert(ServiceRequirement::new(
        "bad name",
        ["grafana.example.com"],
        ["10.0.0.4:3000"],
    )))
    .await
    .unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(layout.path("sites/grafana.conf").exists());
    assert!(!layout.path("sites/bad name.conf").exists());
    let snapshot = board.snapshot();
    assert_eq!(snapshot.level, StatusLevel::Active);
    assert_eq!(
        snapshot.last_outcome.unwrap().services.keys().collect::<Vec<_>>(),
        vec!["grafana"]
    );
}
