//! Artifact download with a bounded retry budget.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::supervisor::error::{SupervisorError, SupervisorResult};

/// Default maximum number of attempts per download.
pub const DEFAULT_DOWNLOAD_ATTEMPTS: u32 = 2;

pub struct Downloader {
    http: reqwest::Client,
    attempts: u32,
}

impl Downloader {
    pub fn new(attempts: u32) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mc-warden/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            attempts: attempts.max(1),
        }
    }

    /// Fetch `url` into `dest`.
    ///
    /// Each attempt downloads the whole body before anything is written, so a
    /// failed attempt never leaves a partial file at `dest`.
    pub async fn fetch_artifact(&self, url: &str, dest: &Path, sha256: Option<&str>) -> SupervisorResult<()> {
        for attempt in 1..=self.attempts {
            tracing::info!("Downloading {} (attempt {}/{})", url, attempt, self.attempts);
            match self.fetch_once(url, dest, sha256).await {
                Ok(size) => {
                    tracing::info!("Downloaded {} ({} bytes) → {}", url, size, dest.display());
                    return Ok(());
                }
                Err(e) => {
                    let retrying = if attempt < self.attempts { "... Retrying" } else { "" };
                    tracing::error!("Could not download server executable: {}{}", e, retrying);
                }
            }
        }
        Err(SupervisorError::Download {
            url: url.to_string(),
            attempts: self.attempts,
        })
    }

    async fn fetch_once(&self, url: &str, dest: &Path, sha256: Option<&str>) -> Result<usize> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("Failed to download {}: {}", url, response.status());
        }
        let bytes = response.bytes().await?;

        if let Some(expected) = sha256 {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                anyhow::bail!("Checksum mismatch: expected {}, got {}", expected, actual);
            }
        }

        let size = bytes.len();
        let dest: PathBuf = dest.to_path_buf();
        tokio::task::spawn_blocking(move || write_atomically(&dest, &bytes)).await??;
        Ok(size)
    }
}

/// Write to a temp file next to `dest`, then rename it into place.
fn write_atomically(dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_fetch_writes_file() {
        let base = serve(Router::new().route("/server.jar", get(|| async { "jar-bytes" }))).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("minecraft_server-1.20.jar");

        Downloader::new(2)
            .fetch_artifact(&format!("{}/server.jar", base), &dest, None)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"jar-bytes");
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/server.jar",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let base = serve(router).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");

        let result = Downloader::new(DEFAULT_DOWNLOAD_ATTEMPTS)
            .fetch_artifact(&format!("{}/server.jar", base), &dest, None)
            .await;
        assert!(matches!(result, Err(SupervisorError::Download { attempts: 2, .. })));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!dest.exists(), "no partial file after failure");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let base = serve(Router::new().route("/server.jar", get(|| async { "tampered" }))).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");

        let result = Downloader::new(1)
            .fetch_artifact(&format!("{}/server.jar", base), &dest, Some("00ff"))
            .await;
        assert!(result.is_err());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_checksum_match() {
        let base = serve(Router::new().route("/server.jar", get(|| async { "jar-bytes" }))).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");
        let digest = hex::encode(Sha256::digest(b"jar-bytes"));

        Downloader::new(1)
            .fetch_artifact(&format!("{}/server.jar", base), &dest, Some(&digest.to_uppercase()))
            .await
            .unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("server.jar");
        // 포트 1은 열려 있지 않음
        let result = Downloader::new(2)
            .fetch_artifact("http://127.0.0.1:1/server.jar", &dest, None)
            .await;
        assert!(matches!(result, Err(SupervisorError::Download { .. })));
    }

    #[test]
    fn test_write_atomically_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("a.jar");
        write_atomically(&dest, b"one").unwrap();
        write_atomically(&dest, b"two").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
    }
}
