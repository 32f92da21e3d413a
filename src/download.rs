//! Terraform binary downloads with an on-disk version cache.
//!
//! Workspaces pin terraform versions, so the first run needing a version
//! fetches its release archive and every later run reuses the cached binary.
//! A single slot serializes all downloads through one downloader instance:
//! a caller wanting version A waits for an in-flight download of version B.

use std::io::{Cursor, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::client::LogSink;
use crate::error::EngineError;

const RELEASES_HOST: &str = "https://releases.hashicorp.com";
const PLATFORM: &str = "linux_amd64";

/// Retrieval of a terraform release archive. Abstracted so tests can count
/// and serialize-check fetches without a network.
#[async_trait]
pub trait ReleaseFetcher: Send + Sync {
    /// Fetch the zip release archive for a terraform version.
    async fn fetch(&self, version: &str) -> anyhow::Result<Vec<u8>>;
}

/// Fetches release archives from the hashicorp releases host.
pub struct HashicorpReleases {
    client: reqwest::Client,
    host: String,
}

impl HashicorpReleases {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            host: RELEASES_HOST.to_string(),
        }
    }
}

impl Default for HashicorpReleases {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseFetcher for HashicorpReleases {
    async fn fetch(&self, version: &str) -> anyhow::Result<Vec<u8>> {
        let url = format!(
            "{host}/terraform/{version}/terraform_{version}_{PLATFORM}.zip",
            host = self.host,
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()
            .with_context(|| format!("requesting {url}"))?;
        let body = resp.bytes().await.context("reading release archive")?;
        Ok(body.to_vec())
    }
}

/// Downloads and caches terraform binaries, one version per subdirectory.
pub struct Downloader {
    dest_dir: PathBuf,
    fetcher: Arc<dyn ReleaseFetcher>,
    slot: Semaphore,
}

impl Downloader {
    pub fn new(dest_dir: PathBuf, fetcher: Arc<dyn ReleaseFetcher>) -> Self {
        Self {
            dest_dir,
            fetcher,
            // one global slot: all downloads are serialized, not just
            // same-version downloads
            slot: Semaphore::new(1),
        }
    }

    /// Canonical path of the binary for a version. Existence of this path
    /// means the download completed.
    pub fn terraform_path(&self, version: &str) -> PathBuf {
        self.dest_dir.join(version).join("terraform")
    }

    /// Ensure the binary for `version` is present, downloading it if needed,
    /// and return its path. Progress is reported to `log`. Waiting for the
    /// download slot remains cancelable via `shutdown`.
    pub async fn download(
        &self,
        shutdown: &CancellationToken,
        version: &str,
        log: &dyn LogSink,
    ) -> Result<PathBuf, EngineError> {
        let dest = self.terraform_path(version);
        if dest.exists() {
            return Ok(dest);
        }

        let _permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(EngineError::Canceled),
            permit = self.slot.acquire() => permit.map_err(|e| anyhow!("{e}"))?,
        };
        // another caller may have finished the same version while we waited
        if dest.exists() {
            return Ok(dest);
        }

        log.write(format!("downloading terraform v{version}...\n").as_bytes())
            .await?;

        let archive = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(EngineError::Canceled),
            fetched = self.fetcher.fetch(version) => fetched.map_err(|source| {
                EngineError::Download {
                    version: version.to_string(),
                    source,
                }
            })?,
        };

        let binary = tokio::task::spawn_blocking(move || extract_terraform(&archive))
            .await
            .map_err(|e| anyhow!("extraction task panicked: {e}"))?
            .map_err(|source| EngineError::Download {
                version: version.to_string(),
                source,
            })?;

        self.install(&dest, &binary)?;
        log.write(format!("downloaded terraform v{version}\n").as_bytes())
            .await?;
        Ok(dest)
    }

    /// Write the binary next to its destination and rename into place, so a
    /// failed download never leaves a partial file at the canonical path.
    fn install(&self, dest: &Path, binary: &[u8]) -> Result<(), EngineError> {
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("destination {} has no parent", dest.display()))?;
        std::fs::create_dir_all(parent)?;
        let mut staged = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut staged, binary)?;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))?;
        staged
            .persist(dest)
            .map_err(|e| anyhow!("installing terraform binary: {e}"))?;
        Ok(())
    }
}

/// Pull the `terraform` entry out of a release archive.
fn extract_terraform(archive: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).context("reading release archive")?;
    let mut entry = zip
        .by_name("terraform")
        .context("release archive has no terraform entry")?;
    let mut binary = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut binary)?;
    Ok(binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use zip::write::SimpleFileOptions;

    struct NullLog;

    #[async_trait]
    impl LogSink for NullLog {
        async fn write(&self, _chunk: &[u8]) -> Result<(), EngineError> {
            Ok(())
        }
    }

    /// Minimal release archive containing a `terraform` entry.
    fn release_zip(content: &[u8]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(
                "terraform",
                SimpleFileOptions::default().unix_permissions(0o755),
            )
            .unwrap();
        std::io::Write::write_all(&mut writer, content).unwrap();
        writer.finish().unwrap().into_inner()
    }

    /// Fetcher instrumented to count total and concurrent in-flight fetches.
    struct CountingFetcher {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingFetcher {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Duration::ZERO)
            }
        }
    }

    #[async_trait]
    impl ReleaseFetcher for CountingFetcher {
        async fn fetch(&self, version: &str) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("synthetic fetch failure");
            }
            Ok(release_zip(version.as_bytes()))
        }
    }

    fn downloader(fetcher: Arc<CountingFetcher>) -> (Downloader, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Downloader::new(dir.path().to_path_buf(), fetcher), dir)
    }

    #[tokio::test]
    async fn second_download_hits_the_cache() {
        let fetcher = Arc::new(CountingFetcher::new(Duration::ZERO));
        let (downloader, _dir) = downloader(fetcher.clone());
        let token = CancellationToken::new();

        let first = downloader.download(&token, "1.1.1", &NullLog).await.unwrap();
        let second = downloader.download(&token, "1.1.1", &NullLog).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&first).unwrap(), b"1.1.1");
    }

    #[tokio::test]
    async fn concurrent_downloads_are_serialized() {
        let fetcher = Arc::new(CountingFetcher::new(Duration::from_millis(50)));
        let (downloader, _dir) = downloader(fetcher.clone());
        let downloader = Arc::new(downloader);
        let token = CancellationToken::new();

        let a = {
            let downloader = downloader.clone();
            let token = token.clone();
            tokio::spawn(async move { downloader.download(&token, "1.1.1", &NullLog).await })
        };
        let b = {
            let downloader = downloader.clone();
            let token = token.clone();
            tokio::spawn(async move { downloader.download(&token, "1.2.2", &NullLog).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn canceled_before_acquiring_slot() {
        let fetcher = Arc::new(CountingFetcher::new(Duration::ZERO));
        let (downloader, _dir) = downloader(fetcher.clone());
        let token = CancellationToken::new();
        token.cancel();

        let err = downloader
            .download(&token, "1.1.1", &NullLog)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_download_leaves_no_canonical_file() {
        let fetcher = Arc::new(CountingFetcher::failing());
        let (downloader, _dir) = downloader(fetcher.clone());
        let token = CancellationToken::new();

        let err = downloader
            .download(&token, "1.1.1", &NullLog)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Download { .. }));
        assert!(!downloader.terraform_path("1.1.1").exists());
    }
}
