pub mod console;
pub mod error;
pub mod process;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::artifact::{self, ArtifactEntry, ArtifactResolver, Downloader};
use crate::config::{SelectionStore, WardenConfig};
use console::{ConsoleLine, LineSource, LogLevel, OutputBuffer};
use error::{SupervisorError, SupervisorResult};
use process::ServerProcess;
use status::{StatusPublisher, Subscription};

pub use status::ServerStatus;

const EULA_FILE: &str = "eula.txt";
const EULA_CONTENT: &str = "#By changing the setting below to TRUE you are indicating your agreement to our EULA \
(https://account.mojang.com/documents/minecraft_eula)\n\
#Mon Mar 20 21:15:37 PDT 2017\n\
eula=true\n";

/// The live run: one spawned process and when it started.
struct ActiveRun {
    id: u64,
    process: Arc<ServerProcess>,
    started_at: Instant,
}

#[derive(Default)]
struct RunState {
    run: Option<ActiveRun>,
    jar_name: Option<String>,
    next_run_id: u64,
}

/// Point-in-time view for status endpoints and streams.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: ServerStatus,
    pub uptime_seconds: Option<u64>,
    pub jar: Option<String>,
    pub pid: Option<u32>,
}

/// Supervises the single game server process.
///
/// Start and stop run their critical sections under `transition`, an async
/// lock that may be held across the download and the graceful-stop wait.
/// The handle itself lives in `state`, a short synchronous lock, so status
/// queries never wait behind a transition.
pub struct Supervisor {
    config: WardenConfig,
    resolver: Arc<dyn ArtifactResolver>,
    downloader: Downloader,
    publisher: Arc<StatusPublisher>,
    output: Arc<OutputBuffer>,
    log_pattern: Option<Arc<Regex>>,
    transition: tokio::sync::Mutex<()>,
    state: Mutex<RunState>,
    me: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(config: WardenConfig, resolver: Arc<dyn ArtifactResolver>) -> Arc<Self> {
        let publisher = Arc::new(StatusPublisher::new());
        let output = Arc::new(OutputBuffer::new(config.console_capacity, publisher.clone()));

        let log_pattern = config.log_pattern.as_deref().and_then(|pat| match Regex::new(pat) {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                tracing::warn!("Invalid log_pattern '{}': {}, falling back to default", pat, e);
                None
            }
        });

        Arc::new_cyclic(|me| Self {
            downloader: Downloader::new(config.download_attempts),
            config,
            resolver,
            publisher,
            output,
            log_pattern,
            transition: tokio::sync::Mutex::new(()),
            state: Mutex::new(RunState::default()),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn server_dir(&self) -> &Path {
        &self.config.server_dir
    }

    /// 상태 락 획득 헬퍼
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| {
            tracing::error!("Supervisor state lock poisoned: {}", e);
            e.into_inner()
        })
    }

    // ─── Observations ────────────────────────────────────────

    /// Derived from the handle: none → Disabled, alive → Running, exited → Closed.
    pub fn status(&self) -> ServerStatus {
        match &self.lock_state().run {
            None => ServerStatus::Disabled,
            Some(run) if run.process.is_alive() => ServerStatus::Running,
            Some(_) => ServerStatus::Closed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == ServerStatus::Running
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.lock_state().run.as_ref().map(|run| run.started_at.elapsed())
    }

    /// Artifact of the current or most recent run.
    pub fn jar_name(&self) -> Option<String> {
        self.lock_state().jar_name.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_state().run.as_ref().map(|run| run.process.pid())
    }

    pub fn report(&self) -> StatusReport {
        let state = self.lock_state();
        let (status, uptime, pid) = match &state.run {
            None => (ServerStatus::Disabled, None, None),
            Some(run) => {
                let status = if run.process.is_alive() {
                    ServerStatus::Running
                } else {
                    ServerStatus::Closed
                };
                (status, Some(run.started_at.elapsed().as_secs()), Some(run.process.pid()))
            }
        };
        StatusReport {
            state: status,
            uptime_seconds: uptime,
            jar: state.jar_name.clone(),
            pid,
        }
    }

    /// Console transcript, oldest first.
    pub fn recent_output(&self) -> Vec<ConsoleLine> {
        self.output.snapshot()
    }

    pub fn console_since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.output.since(since_id)
    }

    pub fn last_console_id(&self) -> Option<u64> {
        self.output.last_id()
    }

    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    fn current_run(&self) -> Option<(u64, Arc<ServerProcess>)> {
        self.lock_state()
            .run
            .as_ref()
            .map(|run| (run.id, run.process.clone()))
    }

    // ─── Start ───────────────────────────────────────────────

    /// Start the server.
    ///
    /// With `requested` the named artifact must already exist in the server
    /// directory. Without it a single artifact matching the configured pattern
    /// is used, or the latest stable version is downloaded when none exists.
    pub async fn start(&self, requested: Option<&str>, launch_args: &str) -> SupervisorResult<()> {
        let _transition = self.transition.lock().await;

        match self.status() {
            ServerStatus::Running => return Err(SupervisorError::AlreadyRunning),
            ServerStatus::Closed => {
                tracing::info!("Discarding reference to a server process that already closed");
                self.lock_state().run = None;
                self.publisher.notify_status_changed();
            }
            ServerStatus::Disabled => {}
        }

        tokio::fs::create_dir_all(self.server_dir()).await?;
        let jar = self.resolve_artifact(requested).await?;

        // EULA has to be agreed to otherwise the server won't start
        self.agree_eula().await?;

        let (program, args) = self.config.launch_command(&jar, launch_args)?;
        tracing::info!("Starting server with '{}'", jar);
        let spawned = ServerProcess::spawn(&program, &args, self.server_dir())?;
        let process = spawned.process;
        let (Some(stdout), Some(stderr)) = (spawned.stdout, spawned.stderr) else {
            process.force_kill();
            process.wait_exit().await;
            return Err(anyhow::anyhow!("Server process spawned without output pipes").into());
        };

        let run_id = {
            let mut state = self.lock_state();
            state.next_run_id += 1;
            let id = state.next_run_id;
            state.run = Some(ActiveRun {
                id,
                process: process.clone(),
                started_at: Instant::now(),
            });
            state.jar_name = Some(jar.clone());
            id
        };

        self.output.push(
            LineSource::System,
            format!("Server started with PID {} ({})", process.pid(), jar),
            LogLevel::Info,
        );

        let drain = self.config.poll_interval();
        console::spawn_console_reader(
            stdout,
            LineSource::Stdout,
            process.clone(),
            self.output.clone(),
            self.log_pattern.clone(),
            drain,
        );
        console::spawn_console_reader(
            stderr,
            LineSource::Stderr,
            process.clone(),
            self.output.clone(),
            self.log_pattern.clone(),
            drain,
        );
        self.spawn_watchdog(run_id, process);

        self.publisher.notify_status_changed();
        Ok(())
    }

    async fn resolve_artifact(&self, requested: Option<&str>) -> SupervisorResult<String> {
        let dir = self.server_dir();

        if let Some(name) = requested {
            let path = dir.join(name);
            if !artifact::is_plain_file_name(name) || !is_file(&path).await {
                return Err(SupervisorError::NotFound(path.display().to_string()));
            }
            return Ok(name.to_string());
        }

        let mut matches = artifact::locate_artifacts(dir, &self.config.artifact_pattern)?;
        match matches.len() {
            0 => {
                tracing::warn!(
                    "No server file found in {}; downloading the latest stable version",
                    dir.display()
                );
                let entry = self.resolver.latest_stable().await?;
                self.download(&entry).await?;
                Ok(entry.name)
            }
            1 => Ok(matches.remove(0)),
            _ => Err(SupervisorError::AmbiguousArtifact(matches)),
        }
    }

    async fn download(&self, entry: &ArtifactEntry) -> SupervisorResult<PathBuf> {
        if !artifact::is_plain_file_name(&entry.name) {
            return Err(SupervisorError::Catalog(format!(
                "Refusing catalog entry with unsafe file name '{}'",
                entry.name
            )));
        }
        let dest = self.server_dir().join(&entry.name);
        tracing::info!("Downloading server {} from {}", entry.version, entry.url);
        self.downloader
            .fetch_artifact(&entry.url, &dest, entry.sha256.as_deref())
            .await?;
        Ok(dest)
    }

    async fn agree_eula(&self) -> SupervisorResult<()> {
        tokio::fs::write(self.server_dir().join(EULA_FILE), EULA_CONTENT).await?;
        Ok(())
    }

    /// Start using the persisted artifact selection.
    ///
    /// Nothing selected → download the latest stable version and select it.
    /// Selected but missing on disk → look it up in the catalog and download it.
    pub async fn autostart(&self, selection: &SelectionStore, launch_args: &str) -> SupervisorResult<()> {
        if self.is_running() {
            return Err(SupervisorError::AlreadyRunning);
        }
        tokio::fs::create_dir_all(self.server_dir()).await?;

        let jar = match selection.selected_jar() {
            None => {
                let entry = self.resolver.latest_stable().await?;
                self.download(&entry).await?;
                selection.set_selected_jar(Some(&entry.name))?;
                entry.name
            }
            Some(name) => {
                if !is_file(&self.server_dir().join(&name)).await {
                    tracing::info!("Selected jar '{}' is missing; downloading it", name);
                    let entry = self.resolver.resolve(&name).await?;
                    self.download(&entry).await?;
                }
                name
            }
        };

        self.start(Some(&jar), launch_args).await
    }

    // ─── Stop ────────────────────────────────────────────────

    /// Stop the server: graceful request, then a forced kill after the grace period.
    pub async fn stop(&self) -> SupervisorResult<()> {
        let _transition = self.transition.lock().await;
        self.stop_locked().await
    }

    /// Stop on behalf of the watchdog of run `run_id`. Returns `false` when
    /// that run was already cleared by someone else.
    async fn stop_run(&self, run_id: u64) -> SupervisorResult<bool> {
        let _transition = self.transition.lock().await;
        if self.current_run().map(|(id, _)| id) != Some(run_id) {
            return Ok(false);
        }
        self.stop_locked().await.map(|()| true)
    }

    async fn stop_locked(&self) -> SupervisorResult<()> {
        let Some((_, process)) = self.current_run() else {
            return Err(SupervisorError::NotRunning);
        };

        if process.is_alive() {
            let grace = self.config.grace_period();
            tracing::info!("Waiting at most {} seconds for server to shut down...", grace.as_secs());
            let exited = match process.request_shutdown() {
                Ok(()) => process.wait_exit_timeout(grace).await,
                Err(e) => {
                    tracing::warn!("Graceful shutdown request failed: {}", e);
                    false
                }
            };
            if !exited {
                tracing::warn!("Server did not shut down in time; terminating forcefully");
                process.force_kill();
                process.wait_exit().await;
            }
        } else {
            tracing::info!("Server process was referenced, but it was already closed. Discarding reference.");
        }

        self.lock_state().run = None;
        self.output.push(
            LineSource::System,
            format!("Server process closed ({:?})", process.state()),
            LogLevel::Info,
        );
        tracing::info!("Server process closed.");
        self.publisher.notify_status_changed();
        Ok(())
    }

    /// Stop a live process before the daemon exits.
    pub async fn shutdown(&self) {
        if self.status() == ServerStatus::Disabled {
            return;
        }
        tracing::info!("Daemon is exiting: stopping server process");
        match self.stop().await {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(e) => tracing::error!("Failed to stop server on shutdown: {}", e),
        }
    }

    // ─── Input ───────────────────────────────────────────────

    /// Send one console line to the server's stdin.
    pub async fn input_line(&self, text: &str) -> SupervisorResult<()> {
        let process = match self.current_run() {
            Some((_, process)) if process.is_alive() => process,
            _ => return Err(SupervisorError::NotRunning),
        };
        tracing::debug!("Input: {:?}", text);
        match process.write_line(text).await {
            Ok(()) => Ok(()),
            // stdin closes when the process exits, possibly while a stop is in progress
            Err(e)
                if e.kind() == std::io::ErrorKind::BrokenPipe
                    && process.wait_exit_timeout(self.config.poll_interval()).await =>
            {
                tracing::debug!("Input dropped: server process {} exited", process.pid());
                Err(SupervisorError::NotRunning)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ─── Watchdog ────────────────────────────────────────────

    /// Poll the run's own handle and normalize state back to Disabled when
    /// the process exits without a stop request.
    fn spawn_watchdog(&self, run_id: u64, process: Arc<ServerProcess>) {
        let supervisor = self.me.clone();
        let interval = self.config.poll_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                if supervisor.current_run().map(|(id, _)| id) != Some(run_id) {
                    break;
                }
                if !process.is_alive() {
                    tracing::debug!("[Watchdog] Process {} is closed; calling stop()", process.pid());
                    match supervisor.stop_run(run_id).await {
                        Ok(true) => tracing::info!("[Watchdog] Server exited on its own; state reset"),
                        Ok(false) => {}
                        Err(e) => tracing::error!("[Watchdog] stop failed: {}", e),
                    }
                    break;
                }
            }
            tracing::debug!("[Watchdog] Quit (run {})", run_id);
        });
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoCatalog;

    #[async_trait]
    impl ArtifactResolver for NoCatalog {
        async fn latest_stable(&self) -> SupervisorResult<ArtifactEntry> {
            Err(SupervisorError::Catalog("offline".into()))
        }

        async fn resolve(&self, name: &str) -> SupervisorResult<ArtifactEntry> {
            Err(SupervisorError::NotFound(name.to_string()))
        }
    }

    fn supervisor(dir: &Path) -> Arc<Supervisor> {
        let config = WardenConfig {
            server_dir: dir.to_path_buf(),
            launch: vec!["sh".into(), "{jar}".into()],
            grace_period_secs: 1,
            poll_interval_ms: 50,
            ..Default::default()
        };
        Supervisor::new(config, Arc::new(NoCatalog))
    }

    #[tokio::test]
    async fn test_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert_eq!(sup.status(), ServerStatus::Disabled);
        assert!(sup.uptime().is_none());
        assert!(sup.pid().is_none());
        assert!(sup.recent_output().is_empty());
        let report = sup.report();
        assert_eq!(report.state, ServerStatus::Disabled);
        assert!(report.uptime_seconds.is_none());
    }

    #[tokio::test]
    async fn test_stop_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let mut sub = sup.subscribe();
        assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
        assert_eq!(sup.status(), ServerStatus::Disabled);
        // 상태 변경 알림 없음
        assert_eq!(
            sub.wait_status(Some(Duration::from_millis(50))).await,
            status::Wake::Timeout
        );
    }

    #[tokio::test]
    async fn test_input_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert!(matches!(sup.input_line("say hi").await, Err(SupervisorError::NotRunning)));
    }

    #[tokio::test]
    async fn test_requested_artifact_missing() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let result = sup.start(Some("minecraft_server-1.20.jar"), "").await;
        assert!(matches!(result, Err(SupervisorError::NotFound(_))));
        assert_eq!(sup.status(), ServerStatus::Disabled);
    }

    #[tokio::test]
    async fn test_requested_artifact_outside_server_dir() {
        let dir = tempfile::tempdir().unwrap();
        let server_dir = dir.path().join("server");
        std::fs::create_dir(&server_dir).unwrap();
        std::fs::write(dir.path().join("outside.jar"), "exit 0").unwrap();
        let sup = supervisor(&server_dir);
        let result = sup.start(Some("../outside.jar"), "").await;
        assert!(matches!(result, Err(SupervisorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ambiguous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("minecraft_server-1.19.jar"), "exit 0").unwrap();
        std::fs::write(dir.path().join("minecraft_server-1.20.jar"), "exit 0").unwrap();
        let sup = supervisor(dir.path());
        match sup.start(None, "").await {
            Err(SupervisorError::AmbiguousArtifact(names)) => assert_eq!(names.len(), 2),
            other => panic!("expected AmbiguousArtifact, got {:?}", other.map(|_| ())),
        }
        assert_eq!(sup.status(), ServerStatus::Disabled);
    }

    #[tokio::test]
    async fn test_catalog_failure_leaves_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert!(matches!(sup.start(None, "").await, Err(SupervisorError::Catalog(_))));
        assert_eq!(sup.status(), ServerStatus::Disabled);
        assert!(!dir.path().join(EULA_FILE).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_input_after_stdin_closed_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        // stdin 닫고 잠시 후 종료
        std::fs::write(
            dir.path().join("minecraft_server-1.20.jar"),
            "exec 0<&-\nsleep 0.3\n",
        )
        .unwrap();
        let config = WardenConfig {
            server_dir: dir.path().to_path_buf(),
            launch: vec!["sh".into(), "{jar}".into()],
            grace_period_secs: 1,
            poll_interval_ms: 2000,
            ..Default::default()
        };
        let sup = Supervisor::new(config, Arc::new(NoCatalog));

        sup.start(None, "").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.status(), ServerStatus::Running);
        assert!(matches!(sup.input_line("list").await, Err(SupervisorError::NotRunning)));
        assert_eq!(sup.status(), ServerStatus::Closed);

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_when_disabled_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.shutdown().await;
        assert_eq!(sup.status(), ServerStatus::Disabled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_stop_cycle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("minecraft_server-1.20.jar"),
            "echo ready\nwhile true; do sleep 0.1; done\n",
        )
        .unwrap();
        let sup = supervisor(dir.path());

        sup.start(None, "").await.unwrap();
        assert_eq!(sup.status(), ServerStatus::Running);
        assert_eq!(sup.jar_name().as_deref(), Some("minecraft_server-1.20.jar"));
        assert!(sup.uptime().is_some());
        let eula = std::fs::read_to_string(dir.path().join(EULA_FILE)).unwrap();
        assert!(eula.ends_with("eula=true\n"));

        sup.stop().await.unwrap();
        assert_eq!(sup.status(), ServerStatus::Disabled);
        assert!(sup.uptime().is_none());
        // 마지막 실행의 jar 이름은 유지
        assert_eq!(sup.jar_name().as_deref(), Some("minecraft_server-1.20.jar"));
    }
}
