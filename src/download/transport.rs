// src/download/transport.rs

//! Transfer seam
//!
//! A transport fetches one URL into a local file and reports progress and a
//! single terminal event through an [`EventSink`]. The pipeline never waits
//! on a transfer; it reacts to events as they arrive.

use crate::config::Config;
use crate::error::{Error, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use reqwest::blocking::Client;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use url::Url;

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Event reported by a transfer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        bytes_delta: u64,
        total_written: u64,
        total_expected: Option<u64>,
    },
    /// Transfer is stalled, e.g. waiting for a connection
    Waiting(String),
    /// Finished; the file at this path now belongs to the receiver
    Success(PathBuf),
    Failure {
        status: Option<u16>,
        error: Option<String>,
    },
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Success(_) | TransferEvent::Failure { .. })
    }
}

/// Callback receiving transfer events, possibly from a worker thread
pub type EventSink = Arc<dyn Fn(TransferEvent) + Send + Sync>;

/// Handle to an in-flight transfer
pub trait TransferHandle: Send + Sync {
    /// Request cancellation; no terminal event is reported afterwards
    fn cancel(&self);
}

pub trait Transport: Send + Sync {
    /// Start fetching `url`; events go to `sink`
    fn fetch(&self, url: &Url, headers: &[(String, String)], sink: EventSink)
    -> Box<dyn TransferHandle>;
}

struct CancelFlag(Arc<AtomicBool>);

impl TransferHandle for CancelFlag {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// HTTP transport running blocking reqwest transfers on a worker pool
pub struct HttpTransport {
    client: Client,
    pool: ThreadPool,
    download_dir: PathBuf,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.max_parallel_downloads)
            .thread_name(|i| format!("pkgqueue-download-{}", i))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create download pool: {}", e)))?;

        fs::create_dir_all(&config.download_dir).map_err(|e| {
            Error::InitError(format!(
                "Failed to create download directory {}: {}",
                config.download_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            client,
            pool,
            download_dir: config.download_dir.clone(),
        })
    }
}

impl Transport for HttpTransport {
    fn fetch(
        &self,
        url: &Url,
        headers: &[(String, String)],
        sink: EventSink,
    ) -> Box<dyn TransferHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));

        let client = self.client.clone();
        let url = url.clone();
        let headers = headers.to_vec();
        let download_dir = self.download_dir.clone();
        let flag = Arc::clone(&cancelled);

        self.pool.spawn(move || {
            let event = match transfer(&client, &url, &headers, &download_dir, &flag, &sink) {
                Ok(event) => event,
                Err(e) => TransferEvent::Failure {
                    status: None,
                    error: Some(e.to_string()),
                },
            };
            if flag.load(Ordering::SeqCst) {
                debug!("Transfer of {} cancelled", url);
                if let TransferEvent::Success(path) = &event {
                    let _ = fs::remove_file(path);
                }
                return;
            }
            sink(event);
        });

        Box::new(CancelFlag(cancelled))
    }
}

/// Stream one URL into a file under `download_dir`
fn transfer(
    client: &Client,
    url: &Url,
    headers: &[(String, String)],
    download_dir: &Path,
    cancelled: &AtomicBool,
    sink: &EventSink,
) -> Result<TransferEvent> {
    info!("Downloading {}", url);
    sink(TransferEvent::Waiting(format!(
        "Connecting to {}",
        url.host_str().unwrap_or("server")
    )));

    let mut request = client.get(url.clone());
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let mut response = match request.send() {
        Ok(response) => response,
        Err(e) => {
            warn!("Request for {} failed: {}", url, e);
            return Ok(TransferEvent::Failure {
                status: e.status().map(|s| s.as_u16()),
                error: Some(e.to_string()),
            });
        }
    };

    if !response.status().is_success() {
        return Ok(TransferEvent::Failure {
            status: Some(response.status().as_u16()),
            error: None,
        });
    }

    let total_expected = response.content_length();

    let mut file = tempfile::Builder::new()
        .prefix("pkgqueue-")
        .suffix(".deb")
        .tempfile_in(download_dir)
        .map_err(|e| Error::IoError(format!("Failed to create temporary file: {}", e)))?;

    let mut written: u64 = 0;
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Ok(TransferEvent::Failure {
                status: None,
                error: Some("cancelled".to_string()),
            });
        }

        let bytes_read = response
            .read(&mut buffer)
            .map_err(|e| Error::DownloadError(format!("Failed to read response: {}", e)))?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .map_err(|e| Error::IoError(format!("Failed to write data: {}", e)))?;
        written += bytes_read as u64;

        sink(TransferEvent::Progress {
            bytes_delta: bytes_read as u64,
            total_written: written,
            total_expected,
        });
    }

    file.flush()
        .map_err(|e| Error::IoError(format!("Failed to flush download: {}", e)))?;

    let path = file
        .into_temp_path()
        .keep()
        .map_err(|e| Error::IoError(format!("Failed to keep downloaded file: {}", e)))?;

    debug!("Downloaded {} bytes from {} to {}", written, url, path.display());
    Ok(TransferEvent::Success(path))
}
