use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::artifact::download::DEFAULT_DOWNLOAD_ATTEMPTS;
use crate::supervisor::console::DEFAULT_CONSOLE_CAPACITY;

/// Default location of the daemon config, overridable with `WARDEN_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "config/warden.toml";

/// Daemon configuration (`config/warden.toml`). Every field is optional.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct WardenConfig {
    /// Working directory of the server; artifacts and `eula.txt` live here
    pub server_dir: PathBuf,
    /// Glob used to find an artifact when none is requested
    pub artifact_pattern: String,
    /// Command template. `{jar}` is replaced by the artifact file name and a
    /// standalone `{args}` expands to the whitespace-split launch arguments.
    pub launch: Vec<String>,
    /// Launch arguments used by autostart
    pub launch_args: String,
    pub grace_period_secs: u64,
    pub poll_interval_ms: u64,
    pub console_capacity: usize,
    pub download_attempts: u32,
    /// Regex with a `level` group for console log levels
    pub log_pattern: Option<String>,
    pub listen_addr: String,
    /// JSON file of downloadable versions (see `FileCatalog`)
    pub catalog_path: PathBuf,
    /// Persisted artifact selection
    pub selection_path: PathBuf,
    /// Start the server when the daemon boots
    pub autostart: bool,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            server_dir: PathBuf::from("server_files"),
            artifact_pattern: "minecraft_server-*.jar".to_string(),
            launch: ["java", "{args}", "-jar", "{jar}", "nogui"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            launch_args: String::new(),
            grace_period_secs: 30,
            poll_interval_ms: 1000,
            console_capacity: DEFAULT_CONSOLE_CAPACITY,
            download_attempts: DEFAULT_DOWNLOAD_ATTEMPTS,
            log_pattern: Some(r"/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]".to_string()),
            listen_addr: "127.0.0.1:57480".to_string(),
            catalog_path: PathBuf::from("server_list.json"),
            selection_path: PathBuf::from("selection.json"),
            autostart: false,
        }
    }
}

impl WardenConfig {
    /// Load from `WARDEN_CONFIG` or [`DEFAULT_CONFIG_PATH`].
    pub fn load() -> Result<Self> {
        let path = std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let cfg: Self = toml::from_str(&s)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Build `(program, args)` from the launch template.
    pub fn launch_command(&self, jar: &str, launch_args: &str) -> Result<(String, Vec<String>)> {
        let mut parts = Vec::with_capacity(self.launch.len() + 4);
        for token in &self.launch {
            if token == "{args}" {
                parts.extend(launch_args.split_whitespace().map(str::to_string));
            } else {
                parts.push(token.replace("{jar}", jar));
            }
        }
        if parts.is_empty() {
            anyhow::bail!("Launch command template is empty");
        }
        let program = parts.remove(0);
        Ok((program, parts))
    }
}

// ─── Artifact Selection ──────────────────────────────────────

/// Persisted choice of which artifact to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selection {
    #[serde(default)]
    pub use_server_jar: Option<String>,
}

/// selection.json 관리
pub struct SelectionStore {
    file_path: PathBuf,
    current: Mutex<Selection>,
}

impl SelectionStore {
    /// 파일에서 로드 (없으면 빈 선택)
    pub fn load(file_path: impl Into<PathBuf>) -> Result<Self> {
        let file_path = file_path.into();
        let current = if file_path.exists() {
            let content = std::fs::read_to_string(&file_path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", file_path.display()))?
        } else {
            Selection::default()
        };
        Ok(Self {
            file_path,
            current: Mutex::new(current),
        })
    }

    pub fn selected_jar(&self) -> Option<String> {
        self.lock().use_server_jar.clone()
    }

    pub fn set_selected_jar(&self, name: Option<&str>) -> Result<()> {
        let mut current = self.lock();
        current.use_server_jar = name.map(str::to_string);
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.file_path, serde_json::to_string_pretty(&*current)?)?;
        tracing::info!("Selected server jar: {:?}", current.use_server_jar);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Selection> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
