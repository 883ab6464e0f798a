use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::{header, Client, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Instant};

use super::Transfer;
use crate::download::BandwidthLimiter;
use crate::error::TransferError;
use crate::source::SourceDescriptor;
use crate::task::{SpeedMeter, TransferContext};
use crate::util::ensure_parent_dir;

const REPORT_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Streams one HTTP(S) resource to disk, resuming a partial file with a
/// `Range` request when the server allows it.
pub struct HttpTransfer {
    client: Client,
    bandwidth: Option<Arc<BandwidthLimiter>>,
    stall_timeout: Duration,
}

impl HttpTransfer {
    pub fn new(
        client: Client,
        bandwidth: Option<Arc<BandwidthLimiter>>,
        stall_timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            bandwidth,
            stall_timeout: stall_timeout.unwrap_or(DEFAULT_STALL_TIMEOUT),
        }
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn run(self: Box<Self>, mut ctx: TransferContext) -> Result<PathBuf, TransferError> {
        let url = match &ctx.request().source {
            SourceDescriptor::Http { url } => url.clone(),
            other => {
                return Err(TransferError::Other(format!(
                    "http backend cannot fetch {other}"
                )))
            }
        };
        let output = ctx.request().destination.clone();
        let checksum = ctx.request().checksum.clone();
        ensure_parent_dir(&output)?;

        let existing = tokio::fs::metadata(&output)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        ctx.checkpoint().await?;
        ctx.set_status("connecting");
        let mut request = self.client.get(url.clone());
        if existing > 0 {
            request = request.header(header::RANGE, format!("bytes={existing}-"));
        }
        let response = tokio::select! {
            response = timeout(self.stall_timeout, request.send()) => {
                response.map_err(|_| TransferError::Timeout(self.stall_timeout))??
            }
            _ = ctx.control().cancelled() => return Err(TransferError::Cancelled),
        };

        let status = response.status();
        let (mut file, mut downloaded) = if status == StatusCode::PARTIAL_CONTENT {
            info!("resuming {} from byte {existing}", output.display());
            let file = OpenOptions::new().append(true).open(&output).await?;
            (file, existing)
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            // the partial file is already complete
            debug!("{} already holds the full body", output.display());
            ctx.report(existing, Some(existing), 0.0);
            if let Some(spec) = &checksum {
                spec.verify_file(&output).await?;
            }
            return Ok(output);
        } else if status.is_success() {
            if existing > 0 {
                warn!("{url} does not allow resume; restarting download");
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&output)
                .await?;
            (file, 0)
        } else {
            return Err(TransferError::Status(status.as_u16()));
        };

        let total = response
            .content_length()
            .map(|len| len + downloaded)
            .or_else(|| Some(ctx.request().total_size).filter(|size| *size > 0));

        ctx.set_status("downloading");
        ctx.report(downloaded, total, 0.0);

        let mut meter = SpeedMeter::new();
        let mut last_report = Instant::now();
        let mut stream = response.bytes_stream();
        loop {
            if ctx.control().is_paused() {
                file.flush().await?;
                ctx.checkpoint().await?;
                meter.reset();
            }

            let next = tokio::select! {
                next = timeout(self.stall_timeout, stream.next()) => {
                    next.map_err(|_| TransferError::Timeout(self.stall_timeout))?
                }
                _ = ctx.control().cancelled() => {
                    file.flush().await?;
                    return Err(TransferError::Cancelled);
                }
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            if let Some(limiter) = &self.bandwidth {
                limiter.consume(chunk.len()).await;
            }
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            let speed = meter.record(chunk.len() as u64);

            if last_report.elapsed() >= REPORT_INTERVAL {
                ctx.report(downloaded, total, speed);
                last_report = Instant::now();
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = total {
            if downloaded < expected {
                return Err(TransferError::Integrity(format!(
                    "stream ended after {downloaded} of {expected} bytes"
                )));
            }
        }
        if let Some(spec) = &checksum {
            ctx.set_status("verifying");
            spec.verify_file(&output).await?;
        }
        ctx.report(downloaded, Some(downloaded), 0.0);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;
    use crate::checksum::ChecksumSpec;
    use crate::download::{DownloadKind, DownloadRequest};
    use crate::source::parse_link;
    use crate::task::{spawn_transfer, Outcome, TaskEvent};

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    /// Answers every connection with `handler(request_head)` and closes it.
    fn serve<F>(handler: F) -> String
    where
        F: Fn(&str) -> Vec<u8> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let response = handler(&String::from_utf8_lossy(&head));
                let _ = stream.write_all(&response);
            }
        });
        format!("http://{addr}")
    }

    fn response(status: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    async fn run(request: DownloadRequest) -> Outcome {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = Client::builder().no_proxy().build().unwrap();
        let transfer = Box::new(HttpTransfer::new(
            client,
            None,
            Some(Duration::from_secs(5)),
        ));
        let _handle = spawn_transfer(Arc::new(request), transfer, tx);
        while let Some(message) = rx.recv().await {
            if let TaskEvent::Terminated(outcome) = message.event {
                return outcome;
            }
        }
        panic!("transfer ended without a terminal event");
    }

    fn request(url: &str, destination: PathBuf) -> DownloadRequest {
        DownloadRequest::new(parse_link(url).unwrap(), destination, DownloadKind::Video, 0)
    }

    #[tokio::test]
    async fn downloads_the_whole_body() {
        let base = serve(|_| response("200 OK", b"hello world"));
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("hello.txt");
        let mut request = request(&format!("{base}/hello.txt"), output.clone());
        request.checksum = Some(ChecksumSpec::from_hex(HELLO_SHA256).unwrap());

        assert_eq!(run(request).await, Outcome::Finished(output.clone()));
        assert_eq!(std::fs::read(&output).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn resumes_a_partial_file_with_range() {
        let base = serve(|head| {
            if head.to_ascii_lowercase().contains("range: bytes=6-") {
                response("206 Partial Content", b"world")
            } else {
                response("200 OK", b"hello world")
            }
        });
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("hello.txt");
        std::fs::write(&output, b"hello ").unwrap();

        let mut request = request(&format!("{base}/hello.txt"), output.clone());
        request.checksum = Some(ChecksumSpec::from_hex(HELLO_SHA256).unwrap());
        assert_eq!(run(request).await, Outcome::Finished(output.clone()));
        assert_eq!(std::fs::read(&output).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn restarts_when_range_is_ignored() {
        let base = serve(|_| response("200 OK", b"fresh"));
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("file.bin");
        std::fs::write(&output, b"stale partial content").unwrap();

        let request = request(&format!("{base}/file.bin"), output.clone());
        assert_eq!(run(request).await, Outcome::Finished(output.clone()));
        assert_eq!(std::fs::read(&output).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn error_status_fails_the_task() {
        let base = serve(|_| response("404 Not Found", b"missing"));
        let dir = tempfile::tempdir().unwrap();
        let request = request(&format!("{base}/gone"), dir.path().join("gone"));

        match run(request).await {
            Outcome::Failed(reason) => assert!(reason.contains("404"), "{reason}"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_the_task() {
        let base = serve(|_| response("200 OK", b"hello there"));
        let dir = tempfile::tempdir().unwrap();
        let mut request = request(&format!("{base}/x"), dir.path().join("x"));
        request.checksum = Some(ChecksumSpec::from_hex(HELLO_SHA256).unwrap());

        match run(request).await {
            Outcome::Failed(reason) => assert!(reason.contains("integrity"), "{reason}"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
