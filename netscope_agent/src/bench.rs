//! Throughput benchmarks: the one-shot upload test and the full speed test.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{CollaboratorError, EngineError};
use crate::state::{Mutation, SnapshotStore};
use crate::types::Throughput;

pub const DEFAULT_UPLOAD_URL: &str = "https://httpbin.org/post";
pub const DEFAULT_SPEEDTEST_DOWN_URL: &str = "https://speed.cloudflare.com/__down";
pub const DEFAULT_SPEEDTEST_UP_URL: &str = "https://speed.cloudflare.com/__up";

/// 512 KiB of filler per upload request.
pub const UPLOAD_PAYLOAD_BYTES: usize = 512 * 1024;

const SPEEDTEST_DOWN_BYTES: u64 = 25_000_000;
const SPEEDTEST_UP_BYTES: usize = 10_000_000;

/// Receives one upload payload.
pub trait UploadTarget: Send + Sync {
    fn send(&self, payload: Bytes) -> BoxFuture<'_, Result<(), CollaboratorError>>;
}

/// Measures full download and upload throughput.
pub trait SpeedTest: Send + Sync {
    fn run(&self) -> BoxFuture<'_, Result<Throughput, CollaboratorError>>;
}

pub struct HttpUploadTarget {
    client: reqwest::Client,
    url: String,
}

impl HttpUploadTarget {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

impl UploadTarget for HttpUploadTarget {
    fn send(&self, payload: Bytes) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        async move {
            self.client
                .post(&self.url)
                .body(payload)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        }
        .boxed()
    }
}

/// Timed transfer against a public speed endpoint.
pub struct HttpSpeedTest {
    client: reqwest::Client,
    down_url: String,
    up_url: String,
}

impl HttpSpeedTest {
    pub fn new(timeout: Duration) -> Result<Self, EngineError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            down_url: DEFAULT_SPEEDTEST_DOWN_URL.to_string(),
            up_url: DEFAULT_SPEEDTEST_UP_URL.to_string(),
        })
    }

    async fn download(&self) -> Result<f64, CollaboratorError> {
        let start = Instant::now();
        let mut resp = self
            .client
            .get(&self.down_url)
            .query(&[("bytes", SPEEDTEST_DOWN_BYTES)])
            .send()
            .await?
            .error_for_status()?;
        let mut received = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            received += chunk.len() as u64;
        }
        if received == 0 {
            return Err(CollaboratorError::Malformed("empty download".into()));
        }
        Ok(bits_per_second(received, start.elapsed()))
    }

    async fn upload(&self) -> Result<f64, CollaboratorError> {
        let body = Bytes::from(vec![0u8; SPEEDTEST_UP_BYTES]);
        let start = Instant::now();
        self.client
            .post(&self.up_url)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(bits_per_second(SPEEDTEST_UP_BYTES as u64, start.elapsed()))
    }
}

impl SpeedTest for HttpSpeedTest {
    fn run(&self) -> BoxFuture<'_, Result<Throughput, CollaboratorError>> {
        async move {
            let download_bps = self.download().await?;
            let upload_bps = self.upload().await?;
            Ok(Throughput {
                download_bps,
                upload_bps,
            })
        }
        .boxed()
    }
}

fn bits_per_second(bytes: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 * 8.0 / secs
    } else {
        0.0
    }
}

/// Upload the payload back to back for `duration`, publishing the speed of
/// each ~1 s window and the average at the end. Failed sends are retried a
/// second later. Returns the average in bits per second.
pub async fn run_upload_benchmark(
    store: &SnapshotStore,
    target: &dyn UploadTarget,
    duration: Duration,
    payload_bytes: usize,
    cancel: &CancellationToken,
) -> f64 {
    store.apply(Mutation::UploadTest {
        speed_bps: 0.0,
        running: true,
    });
    info!(secs = duration.as_secs_f64(), "upload test started");

    let payload = Bytes::from(vec![b'x'; payload_bytes]);
    let start = Instant::now();
    let end = start + duration;
    let mut total = 0u64;
    let mut window = 0u64;
    let mut window_start = start;

    while Instant::now() < end {
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            r = target.send(payload.clone()) => r,
        };
        match sent {
            Ok(()) => {
                total += payload_bytes as u64;
                window += payload_bytes as u64;
            }
            Err(e) => {
                warn!(error = %e, "upload test send failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(Duration::from_secs(1)) => {}
                }
            }
        }
        let now = Instant::now();
        let span = now - window_start;
        if span >= Duration::from_secs(1) {
            store.apply(Mutation::UploadTest {
                speed_bps: bits_per_second(window, span),
                running: true,
            });
            window = 0;
            window_start = now;
        }
    }

    let measured = if cancel.is_cancelled() {
        start.elapsed().min(duration)
    } else {
        duration
    };
    let avg = bits_per_second(total, measured);
    store.apply(Mutation::UploadTest {
        speed_bps: avg,
        running: false,
    });
    info!(avg_bps = avg, "upload test finished");
    avg
}
