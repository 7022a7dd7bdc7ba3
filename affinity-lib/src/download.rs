//! Resumable downloads with retry, proxy support and checksum verification

use crate::config::NetworkSettings;
use crate::error::{AffinityError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chunks buffered between the network reader and the disk writer
const WRITE_QUEUE_DEPTH: usize = 16;

/// Absolute installer links on an update page
const INSTALLER_LINK_PATTERN: &str = r#"(?i)https?://[^\s"'<>]*Affinity[_-]?Universal[^\s"'<>]*\.exe"#;

/// One file to fetch
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    /// Lowercase hex SHA-256
    pub expected_sha256: Option<String>,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            expected_size: None,
            expected_sha256: None,
        }
    }

    pub fn with_sha256(mut self, sha256: Option<String>) -> Self {
        self.expected_sha256 = sha256;
        self
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }

    /// In-progress bytes live here until verified
    pub fn partial_path(&self) -> PathBuf {
        let mut path = self.destination.as_os_str().to_owned();
        path.push(".part");
        PathBuf::from(path)
    }
}

/// What one complete transfer looked like
#[derive(Debug, Default)]
struct Transfer {
    /// Some bytes came from an earlier, interrupted transfer
    resumed: bool,
    /// Full size announced by the server
    declared_size: Option<u64>,
}

/// Download manager
pub struct DownloadManager {
    settings: NetworkSettings,
}

impl DownloadManager {
    pub fn new(settings: NetworkSettings) -> Self {
        Self { settings }
    }

    /// Fetch `task.url` to `task.destination`.
    ///
    /// Resumes from the partial file when one exists, retries transient
    /// failures with exponential backoff and only moves the file into place
    /// once size and checksum check out. Cancellation keeps the partial file.
    pub async fn fetch(&self, task: &DownloadTask, cancel: &CancellationToken) -> Result<PathBuf> {
        if let Some(parent) = task.destination.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if task.destination.exists() {
            if self.is_complete(task).await? {
                info!("Using cached {}", task.destination.display());
                return Ok(task.destination.clone());
            }
            warn!(
                "Cached {} failed verification, downloading again",
                task.destination.display()
            );
            std::fs::remove_file(&task.destination)?;
        }

        // Surface a bad proxy before any attempt is spent
        self.client()?;

        let mut restarted = false;
        loop {
            let transfer = self.transfer_with_retry(task, cancel).await?;
            match self.promote(task, transfer.declared_size).await {
                Ok(()) => {
                    info!("Downloaded {}", task.destination.display());
                    return Ok(task.destination.clone());
                }
                Err(e @ AffinityError::ChecksumMismatch { .. }) => {
                    remove_if_exists(&task.partial_path())?;
                    if transfer.resumed && !restarted {
                        warn!("{}; resumed data discarded, restarting from zero", e);
                        restarted = true;
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Look up the current installer URL on a vendor update page.
    ///
    /// The page either redirects straight to the `.exe` or links to it. An
    /// unreachable page or one without a link yields `None`.
    pub async fn resolve_update_page(
        &self,
        page: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let client = self.client()?;
        let read_timeout = self.settings.read_timeout;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AffinityError::Cancelled),
            sent = tokio::time::timeout(read_timeout, client.get(page).send()) => match sent {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    debug!("Update page {} unreachable: {}", page, e);
                    return Ok(None);
                }
                Err(_) => {
                    debug!("Update page {} sent no headers within {}s", page, read_timeout.as_secs());
                    return Ok(None);
                }
            },
        };

        if !response.status().is_success() {
            debug!("Update page {} returned HTTP {}", page, response.status());
            return Ok(None);
        }
        if response.url().path().to_lowercase().ends_with(".exe") {
            return Ok(Some(response.url().to_string()));
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(AffinityError::Cancelled),
            body = tokio::time::timeout(read_timeout, response.text()) => match body {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => {
                    debug!("Could not read update page {}: {}", page, e);
                    return Ok(None);
                }
                Err(_) => return Ok(None),
            },
        };
        let link = installer_link(&body)?;
        if link.is_none() {
            debug!("No installer link on {}", page);
        }
        Ok(link)
    }

    fn client(&self) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(self.settings.user_agent.as_str())
            .connect_timeout(self.settings.connect_timeout)
            .no_proxy();

        if let Some(proxy) = &self.settings.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str()).map_err(|e| {
                AffinityError::ConfigInvalid(format!("invalid proxy '{}': {}", proxy, e))
            })?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| AffinityError::ConfigInvalid(format!("HTTP client: {}", e)))
    }

    async fn transfer_with_retry(
        &self,
        task: &DownloadTask,
        cancel: &CancellationToken,
    ) -> Result<Transfer> {
        let mut transfer = Transfer::default();
        let mut backoff = Backoff::new(&self.settings);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(AffinityError::Cancelled);
            }

            match self.attempt(task, &mut transfer, cancel).await {
                Ok(()) => return Ok(transfer),
                Err(e @ AffinityError::NetworkRetryable(_))
                    if attempt < self.settings.max_attempts =>
                {
                    let delay = backoff.next_delay();
                    warn!(
                        "Download attempt {}/{} failed: {}; retrying in {:.1}s",
                        attempt,
                        self.settings.max_attempts,
                        e,
                        delay.as_secs_f32()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AffinityError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        task: &DownloadTask,
        transfer: &mut Transfer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let partial = task.partial_path();
        let offset = file_len(&partial);
        let client = self.client()?;

        let mut request = client.get(&task.url);
        if offset > 0 {
            debug!("Resuming {} at byte {}", task.url, offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        // Headers must arrive within the same stall window as body chunks
        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(AffinityError::Cancelled),
            sent = tokio::time::timeout(self.settings.read_timeout, request.send()) => match sent {
                Ok(response) => response.map_err(network_error)?,
                Err(_) => {
                    return Err(AffinityError::NetworkRetryable(format!(
                        "no response headers within {}s",
                        self.settings.read_timeout.as_secs()
                    )))
                }
            },
        };

        let status = response.status();
        let append = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                transfer.resumed = true;
                transfer.declared_size = content_range_total(&response)
                    .or_else(|| response.content_length().map(|len| len + offset));
                true
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                debug!("Server has nothing past byte {}; partial file is complete", offset);
                transfer.resumed = true;
                return Ok(());
            }
            s if s.is_success() => {
                if offset > 0 {
                    info!("Server ignored the range request; restarting from zero");
                }
                transfer.resumed = false;
                transfer.declared_size = response.content_length();
                false
            }
            s if s == StatusCode::REQUEST_TIMEOUT
                || s == StatusCode::TOO_MANY_REQUESTS
                || s.is_server_error() =>
            {
                return Err(AffinityError::NetworkRetryable(format!("HTTP {}", s)));
            }
            s => {
                return Err(AffinityError::ConfigInvalid(format!(
                    "{} returned HTTP {}",
                    task.url, s
                )));
            }
        };

        let start = if append { offset } else { 0 };
        let progress = self.progress_bar(transfer.declared_size, start)?;
        let expected_body = response.content_length();

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let writer_path = partial.clone();
        let writer = tokio::spawn(async move {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&writer_path)
                .await?;
            while let Some(chunk) = rx.recv().await {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_data().await
        });

        let mut received: u64 = 0;
        let read_result = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Err(AffinityError::Cancelled),
                next = tokio::time::timeout(self.settings.read_timeout, response.chunk()) => next,
            };
            match next {
                Err(_) => {
                    break Err(AffinityError::NetworkRetryable(format!(
                        "no data received for {}s",
                        self.settings.read_timeout.as_secs()
                    )))
                }
                Ok(Err(e)) => break Err(network_error(e)),
                Ok(Ok(None)) => break Ok(()),
                Ok(Ok(Some(chunk))) => {
                    received += chunk.len() as u64;
                    if let Some(pb) = &progress {
                        pb.inc(chunk.len() as u64);
                    }
                    if tx.send(chunk.to_vec()).await.is_err() {
                        break Ok(());
                    }
                }
            }
        };
        drop(tx);

        writer
            .await
            .map_err(|e| AffinityError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        read_result?;

        if let Some(expected) = expected_body {
            if received < expected {
                return Err(AffinityError::NetworkRetryable(format!(
                    "short transfer: {} of {} bytes",
                    received, expected
                )));
            }
        }
        Ok(())
    }

    /// Verify the partial file and move it into place
    async fn promote(&self, task: &DownloadTask, declared_size: Option<u64>) -> Result<()> {
        let partial = task.partial_path();
        let len = file_len(&partial);

        if len == 0 {
            return Err(AffinityError::ChecksumMismatch {
                expected: "a non-empty file".into(),
                got: "0 bytes".into(),
            });
        }
        if let Some(limit) = task.expected_size.or(declared_size) {
            if len > limit {
                return Err(size_mismatch(limit, len));
            }
        }
        if let Some(expected) = task.expected_size {
            if len != expected {
                return Err(size_mismatch(expected, len));
            }
        }
        if let Some(expected) = &task.expected_sha256 {
            let got = sha256_file(&partial).await?;
            if &got != expected {
                return Err(AffinityError::ChecksumMismatch {
                    expected: expected.clone(),
                    got,
                });
            }
        }

        std::fs::rename(&partial, &task.destination)?;
        Ok(())
    }

    async fn is_complete(&self, task: &DownloadTask) -> Result<bool> {
        let len = file_len(&task.destination);
        if len == 0 || task.expected_size.is_some_and(|size| size != len) {
            return Ok(false);
        }
        match &task.expected_sha256 {
            Some(expected) => Ok(&sha256_file(&task.destination).await? == expected),
            None => Ok(true),
        }
    }

    fn progress_bar(&self, total: Option<u64>, position: u64) -> Result<Option<ProgressBar>> {
        let total = match total {
            Some(total) if self.settings.progress && total > 0 => total,
            _ => return Ok(None),
        };
        let style = ProgressStyle::default_bar()
            .template("{msg} {bar:40.cyan/blue} {bytes}/{total_bytes} {eta}")
            .map_err(|e| AffinityError::ConfigInvalid(format!("progress bar template: {}", e)))?;
        let pb = ProgressBar::new(total);
        pb.set_style(style);
        pb.set_position(position);
        pb.set_message("Downloading");
        Ok(Some(pb))
    }
}

/// SHA-256 of a file as lowercase hex
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut hasher = Sha256::new();
        let mut file = std::fs::File::open(&path)?;
        std::io::copy(&mut file, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| AffinityError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn installer_link(html: &str) -> Result<Option<String>> {
    let pattern = Regex::new(INSTALLER_LINK_PATTERN)
        .map_err(|e| AffinityError::ConfigInvalid(format!("installer link pattern: {}", e)))?;
    Ok(pattern.find(html).map(|m| m.as_str().to_string()))
}

fn network_error(err: reqwest::Error) -> AffinityError {
    if err.is_builder() {
        AffinityError::ConfigInvalid(err.to_string())
    } else {
        AffinityError::NetworkRetryable(err.to_string())
    }
}

fn size_mismatch(expected: u64, got: u64) -> AffinityError {
    AffinityError::ChecksumMismatch {
        expected: format!("{} bytes", expected),
        got: format!("{} bytes", got),
    }
}

/// Total from `Content-Range: bytes <start>-<end>/<total>`
fn content_range_total(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    value.rsplit('/').next()?.trim().parse().ok()
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Exponential backoff between download attempts
struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    fn new(settings: &NetworkSettings) -> Self {
        Self {
            next: settings.initial_backoff,
            max: settings.max_backoff,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &[u8] = b"MZ-affinity-universal-installer-bytes";

    fn settings() -> NetworkSettings {
        NetworkSettings {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            read_timeout: Duration::from_secs(5),
            ..NetworkSettings::default()
        }
    }

    fn digest(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    fn task(server: &MockServer, dir: &Path) -> DownloadTask {
        DownloadTask::new(
            format!("{}/Affinity.exe", server.uri()),
            dir.join("Affinity_Universal.exe"),
        )
        .with_sha256(Some(digest(BODY)))
    }

    async fn requests(server: &MockServer) -> usize {
        server.received_requests().await.unwrap().len()
    }

    #[tokio::test]
    async fn downloads_and_verifies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Affinity.exe"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let task = task(&server, dir.path());

        let path = DownloadManager::new(settings())
            .fetch(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        assert!(!task.partial_path().exists());
    }

    #[tokio::test]
    async fn resumes_from_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=10-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes 10-{}/{}", BODY.len() - 1, BODY.len()))
                    .set_body_bytes(&BODY[10..]),
            )
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let task = task(&server, dir.path());
        std::fs::write(task.partial_path(), &BODY[..10]).unwrap();

        let path = DownloadManager::new(settings())
            .fetch(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        assert_eq!(requests(&server).await, 1);
    }

    #[tokio::test]
    async fn corrupt_partial_forces_full_restart() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=10-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(&BODY[10..]))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let task = task(&server, dir.path());
        std::fs::write(task.partial_path(), b"XXXXXXXXXX").unwrap();

        let path = DownloadManager::new(settings())
            .fetch(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), BODY);
        assert_eq!(requests(&server).await, 2);
    }

    #[tokio::test]
    async fn mismatch_from_zero_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let task = task(&server, dir.path());

        let err = DownloadManager::new(settings())
            .fetch(&task, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AffinityError::ChecksumMismatch { .. }));
        assert!(!task.partial_path().exists());
        assert!(!task.destination.exists());
        assert_eq!(requests(&server).await, 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .with_priority(1)
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let task = task(&server, dir.path());

        DownloadManager::new(settings())
            .fetch(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(requests(&server).await, 3);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let task = task(&server, dir.path());
        let settings = NetworkSettings {
            max_attempts: 3,
            ..settings()
        };

        let err = DownloadManager::new(settings)
            .fetch(&task, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AffinityError::NetworkRetryable(_)));
        assert_eq!(requests(&server).await, 3);
    }

    #[tokio::test]
    async fn slow_response_headers_are_a_retryable_stall() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(BODY)
                    .set_delay(Duration::from_secs(8)),
            )
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let settings = NetworkSettings {
            max_attempts: 1,
            read_timeout: Duration::from_secs(1),
            ..settings()
        };

        let started = std::time::Instant::now();
        let err = DownloadManager::new(settings)
            .fetch(&task(&server, dir.path()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(err, AffinityError::NetworkRetryable(_)));
        assert!(!dir.path().join("Affinity_Universal.exe").exists());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let err = DownloadManager::new(settings())
            .fetch(&task(&server, dir.path()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AffinityError::ConfigInvalid(_)));
        assert_eq!(requests(&server).await, 1);
    }

    #[tokio::test]
    async fn invalid_proxy_fails_before_any_request() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = NetworkSettings {
            proxy: Some("ftp://proxy.invalid:21".into()),
            ..settings()
        };

        let err = DownloadManager::new(settings)
            .fetch(&task(&server, dir.path()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AffinityError::ConfigInvalid(_)));
        assert_eq!(requests(&server).await, 0);
    }

    #[tokio::test]
    async fn cached_file_short_circuits() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let task = task(&server, dir.path());
        std::fs::write(&task.destination, BODY).unwrap();

        let path = DownloadManager::new(settings())
            .fetch(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, task.destination);
        assert_eq!(requests(&server).await, 0);
    }

    #[tokio::test]
    async fn range_not_satisfiable_means_partial_is_complete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(416))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let task = task(&server, dir.path());
        std::fs::write(task.partial_path(), BODY).unwrap();

        let path = DownloadManager::new(settings())
            .fetch(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), BODY);
    }

    #[tokio::test]
    async fn cancellation_keeps_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(&BODY[5..])
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let task = task(&server, dir.path());
        std::fs::write(task.partial_path(), &BODY[..5]).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = DownloadManager::new(settings())
            .fetch(&task, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(std::fs::read(task.partial_path()).unwrap(), &BODY[..5]);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(&NetworkSettings {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3),
            ..NetworkSettings::default()
        });
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3)
            ]
        );
    }

    #[tokio::test]
    async fn update_page_link_is_scraped() {
        let server = MockServer::start().await;
        let link = format!("{}/files/Affinity_Universal-2.6.0.exe", server.uri());
        Mock::given(method("GET"))
            .and(path("/update/windows/universal/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "<html><a href='{}/files/readme.pdf'>notes</a> <a href=\"{}\">Download</a></html>",
                server.uri(),
                link
            )))
            .mount(&server)
            .await;

        let page = format!("{}/update/windows/universal/", server.uri());
        let found = DownloadManager::new(settings())
            .resolve_update_page(&page, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found, Some(link));
    }

    #[tokio::test]
    async fn update_page_redirect_to_installer_is_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/update"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/dl/Affinity_Universal.exe"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/Affinity_Universal.exe"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
            .mount(&server)
            .await;

        let found = DownloadManager::new(settings())
            .resolve_update_page(&format!("{}/update", server.uri()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found, Some(format!("{}/dl/Affinity_Universal.exe", server.uri())));
    }

    #[tokio::test]
    async fn update_page_without_link_resolves_to_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>Sign in</html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let manager = DownloadManager::new(settings());
        let cancel = CancellationToken::new();
        for page in ["/empty", "/gone"] {
            let found = manager
                .resolve_update_page(&format!("{}{}", server.uri(), page), &cancel)
                .await
                .unwrap();
            assert_eq!(found, None, "{}", page);
        }
    }
}
