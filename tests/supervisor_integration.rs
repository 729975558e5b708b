//! 서버 프로세스 수명주기 통합 테스트
//! `sh` 스크립트를 서버 jar 대신 실행

#![cfg(unix)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{http::StatusCode, routing::get, Router};
use mc_warden::artifact::FileCatalog;
use mc_warden::config::{SelectionStore, WardenConfig};
use mc_warden::supervisor::error::SupervisorError;
use mc_warden::supervisor::status::Wake;
use mc_warden::supervisor::{ServerStatus, Supervisor};

const JAR: &str = "minecraft_server-1.20.jar";
const LOOP_SCRIPT: &str = "echo \"[Server thread/INFO]: Done\"\nwhile true; do sleep 0.1; done\n";

fn test_config(server_dir: &Path, catalog: &Path) -> WardenConfig {
    WardenConfig {
        server_dir: server_dir.to_path_buf(),
        launch: vec!["sh".into(), "{jar}".into()],
        grace_period_secs: 1,
        poll_interval_ms: 100,
        catalog_path: catalog.to_path_buf(),
        ..Default::default()
    }
}

fn supervisor_with(config: WardenConfig) -> Arc<Supervisor> {
    let catalog = Arc::new(FileCatalog::new(&config.catalog_path));
    Supervisor::new(config, catalog)
}

fn write_jar(dir: &Path, name: &str, script: &str) {
    std::fs::write(dir.join(name), script).unwrap();
}

async fn wait_until<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_start_single_artifact() {
    let dir = tempfile::tempdir().unwrap();
    write_jar(dir.path(), JAR, LOOP_SCRIPT);
    let sup = supervisor_with(test_config(dir.path(), &dir.path().join("none.json")));
    let mut sub = sup.subscribe();

    sup.start(None, "").await.unwrap();
    assert_eq!(sup.status(), ServerStatus::Running);
    assert_eq!(sub.wait_status(Some(Duration::from_secs(1))).await, Wake::Status);
    assert!(sup.pid().is_some());

    let eula = std::fs::read_to_string(dir.path().join("eula.txt")).unwrap();
    assert!(eula.contains("eula=true"));

    // 콘솔 출력 캡처
    let captured = wait_until(Duration::from_secs(5), || {
        sup.recent_output().iter().any(|l| l.content.contains("Done"))
    })
    .await;
    assert!(captured, "server output should reach the console buffer");

    sup.stop().await.unwrap();
    assert_eq!(sup.status(), ServerStatus::Disabled);
    println!("✓ Single artifact start/stop passed");
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_jar(dir.path(), JAR, LOOP_SCRIPT);
    let sup = supervisor_with(test_config(dir.path(), &dir.path().join("none.json")));

    sup.start(Some(JAR), "").await.unwrap();
    let pid = sup.pid();
    assert!(matches!(sup.start(Some(JAR), "").await, Err(SupervisorError::AlreadyRunning)));
    assert_eq!(sup.pid(), pid, "the running process is untouched");
    assert_eq!(sup.status(), ServerStatus::Running);

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_spawn_once() {
    let dir = tempfile::tempdir().unwrap();
    write_jar(dir.path(), JAR, LOOP_SCRIPT);
    let sup = supervisor_with(test_config(dir.path(), &dir.path().join("none.json")));

    let (a, b) = tokio::join!(sup.start(Some(JAR), ""), sup.start(Some(JAR), ""));
    assert!(a.is_ok() ^ b.is_ok(), "exactly one start wins");
    assert_eq!(sup.status(), ServerStatus::Running);

    sup.stop().await.unwrap();
    assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
}

#[tokio::test]
async fn test_input_reaches_server() {
    let dir = tempfile::tempdir().unwrap();
    write_jar(dir.path(), JAR, "while read line; do echo \"echo:$line\"; done\n");
    let sup = supervisor_with(test_config(dir.path(), &dir.path().join("none.json")));

    sup.start(None, "").await.unwrap();
    let mut sub = sup.subscribe();
    sup.input_line("say hi").await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !sup.recent_output().iter().any(|l| l.content == "echo:say hi") {
        assert!(Instant::now() < deadline, "echo never arrived");
        sub.wait_output(Some(Duration::from_millis(200))).await;
    }

    sup.stop().await.unwrap();
    assert!(matches!(sup.input_line("say bye").await, Err(SupervisorError::NotRunning)));
}

#[tokio::test]
async fn test_watchdog_detects_external_kill() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    write_jar(dir.path(), JAR, LOOP_SCRIPT);
    let sup = supervisor_with(test_config(dir.path(), &dir.path().join("none.json")));

    sup.start(None, "").await.unwrap();
    let pid = sup.pid().unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let disabled = wait_until(Duration::from_secs(5), || sup.status() == ServerStatus::Disabled).await;
    assert!(disabled, "watchdog should reset status after an unsolicited exit");
    assert!(sup.uptime().is_none());
    assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
}

#[tokio::test]
async fn test_stop_forces_kill_after_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    write_jar(dir.path(), JAR, "trap '' TERM\nwhile true; do sleep 0.1; done\n");
    let config = test_config(dir.path(), &dir.path().join("none.json"));
    let grace = config.grace_period();
    let sup = supervisor_with(config);

    sup.start(None, "").await.unwrap();
    // trap 설치 대기
    tokio::time::sleep(Duration::from_millis(300)).await;

    let began = Instant::now();
    sup.stop().await.unwrap();
    assert!(began.elapsed() >= grace);
    assert_eq!(sup.status(), ServerStatus::Disabled);
    assert!(sup.uptime().is_none());
}

#[tokio::test]
async fn test_closed_process_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    write_jar(dir.path(), JAR, "exit 0\n");
    let config = WardenConfig {
        // watchdog가 개입하기 전에 Closed 상태를 관찰
        poll_interval_ms: 60_000,
        ..test_config(dir.path(), &dir.path().join("none.json"))
    };
    let sup = supervisor_with(config);

    sup.start(None, "").await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || sup.status() == ServerStatus::Closed).await);
    assert!(matches!(sup.input_line("list").await, Err(SupervisorError::NotRunning)));

    // Closed 상태에서 재시작 가능
    sup.start(None, "").await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || sup.status() == ServerStatus::Closed).await);

    sup.stop().await.unwrap();
    assert_eq!(sup.status(), ServerStatus::Disabled);
}

#[tokio::test]
async fn test_downloads_latest_when_no_artifact() {
    let base = serve(Router::new().route("/1.20.1.jar", get(|| async { LOOP_SCRIPT }))).await;
    let dir = tempfile::tempdir().unwrap();
    let server_dir = dir.path().join("server");
    let catalog = dir.path().join("server_list.json");
    std::fs::write(
        &catalog,
        format!(
            r#"{{ "minecraft_server-1.20.1.jar": "{base}/1.20.1.jar",
                 "minecraft_server-1.19.jar": "{base}/missing.jar" }}"#
        ),
    )
    .unwrap();
    let sup = supervisor_with(test_config(&server_dir, &catalog));

    sup.start(None, "").await.unwrap();
    assert_eq!(sup.status(), ServerStatus::Running);
    assert_eq!(sup.jar_name().as_deref(), Some("minecraft_server-1.20.1.jar"));
    assert!(server_dir.join("minecraft_server-1.20.1.jar").is_file());

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_download_is_retried_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/1.20.1.jar",
        get(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::SERVICE_UNAVAILABLE
            }
        }),
    );
    let base = serve(router).await;
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("server_list.json");
    std::fs::write(
        &catalog,
        format!(r#"{{ "minecraft_server-1.20.1.jar": "{base}/1.20.1.jar" }}"#),
    )
    .unwrap();
    let server_dir = dir.path().join("server");
    let sup = supervisor_with(test_config(&server_dir, &catalog));

    let result = sup.start(None, "").await;
    assert!(matches!(result, Err(SupervisorError::Download { attempts: 2, .. })));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(sup.status(), ServerStatus::Disabled);
    assert!(!server_dir.join("minecraft_server-1.20.1.jar").exists());
}

#[tokio::test]
async fn test_autostart_selects_latest() {
    let base = serve(Router::new().route("/1.20.1.jar", get(|| async { LOOP_SCRIPT }))).await;
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("server_list.json");
    std::fs::write(
        &catalog,
        format!(r#"{{ "minecraft_server-1.20.1.jar": "{base}/1.20.1.jar" }}"#),
    )
    .unwrap();
    let server_dir = dir.path().join("server");
    let sup = supervisor_with(test_config(&server_dir, &catalog));
    let selection = SelectionStore::load(dir.path().join("selection.json")).unwrap();

    sup.autostart(&selection, "").await.unwrap();
    assert_eq!(sup.status(), ServerStatus::Running);
    assert_eq!(selection.selected_jar().as_deref(), Some("minecraft_server-1.20.1.jar"));
    assert!(matches!(sup.autostart(&selection, "").await, Err(SupervisorError::AlreadyRunning)));

    sup.shutdown().await;
    assert_eq!(sup.status(), ServerStatus::Disabled);
}

#[tokio::test]
async fn test_autostart_redownloads_missing_selection() {
    let base = serve(Router::new().route("/23w31a.jar", get(|| async { LOOP_SCRIPT }))).await;
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("server_list.json");
    std::fs::write(
        &catalog,
        format!(r#"{{ "minecraft_server-23w31a.jar": "{base}/23w31a.jar" }}"#),
    )
    .unwrap();
    let server_dir = dir.path().join("server");
    let sup = supervisor_with(test_config(&server_dir, &catalog));
    let selection = SelectionStore::load(dir.path().join("selection.json")).unwrap();
    selection.set_selected_jar(Some("minecraft_server-23w31a.jar")).unwrap();

    sup.autostart(&selection, "").await.unwrap();
    assert!(server_dir.join("minecraft_server-23w31a.jar").is_file());
    assert_eq!(sup.jar_name().as_deref(), Some("minecraft_server-23w31a.jar"));

    sup.stop().await.unwrap();
}
