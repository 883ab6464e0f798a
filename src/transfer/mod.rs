//! Protocol backends.
//!
//! A backend implements [`Transfer`]: `run` performs the whole transfer and
//! returns the output path. Starting is done by the scheduler (which spawns
//! `run` on the runtime); pause, resume and cancel arrive through the
//! [`TransferContext`] and are honoured at the backend's checkpoints.

mod http;
mod peer;

pub use http::HttpTransfer;
pub use peer::{PeerProtocol, PeerTransfer};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;

use crate::download::{BandwidthLimiter, DownloadKind, DownloadRequest, OrchestratorConfig};
use crate::error::TransferError;
use crate::task::TransferContext;
use crate::util::format_speed;

#[async_trait]
pub trait Transfer: Send {
    async fn run(self: Box<Self>, ctx: TransferContext) -> Result<PathBuf, TransferError>;
}

/// Creates the backend for an admitted request.
pub trait TransferFactory: Send + Sync {
    fn create(&self, request: &DownloadRequest) -> Box<dyn Transfer>;
}

/// Default factory: picks the backend from the request kind.
pub struct ProtocolFactory {
    client: Client,
    config: OrchestratorConfig,
    bandwidth: Option<Arc<BandwidthLimiter>>,
}

impl ProtocolFactory {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("mdown/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .pool_idle_timeout(Some(std::time::Duration::from_secs(90)))
            .tcp_nodelay(true)
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        let bandwidth = config
            .bandwidth_limit
            .map(|limit| Arc::new(BandwidthLimiter::new(limit)));
        if let Some(limiter) = &bandwidth {
            debug!(
                "http bandwidth limited to {}",
                format_speed(limiter.bytes_per_sec() as f64)
            );
        }
        Ok(Self {
            client,
            config: config.clone(),
            bandwidth,
        })
    }
}

impl TransferFactory for ProtocolFactory {
    fn create(&self, request: &DownloadRequest) -> Box<dyn Transfer> {
        match request.kind {
            DownloadKind::Torrent => Box::new(PeerTransfer::new(
                PeerProtocol::BitTorrent,
                self.config.peer.clone(),
            )),
            DownloadKind::Ed2k => Box::new(PeerTransfer::new(
                PeerProtocol::Ed2k,
                self.config.peer.clone(),
            )),
            DownloadKind::Video
            | DownloadKind::Audio
            | DownloadKind::VideoAudio
            | DownloadKind::Subtitle
            | DownloadKind::SubtitleNoTimestamp => Box::new(HttpTransfer::new(
                self.client.clone(),
                self.bandwidth.clone(),
                self.config.http_timeout,
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Transfers driven step by step from the test body.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::download::TaskId;

    #[derive(Debug)]
    pub enum Step {
        Progress { downloaded: u64, total: u64 },
        Finish,
        Fail(&'static str),
    }

    #[derive(Default)]
    pub struct ScriptedFactory {
        created: Mutex<Vec<TaskId>>,
        scripts: Mutex<HashMap<TaskId, mpsc::UnboundedSender<Step>>>,
    }

    impl ScriptedFactory {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Ids in the order their transfers were created (admission order).
        pub fn created(&self) -> Vec<TaskId> {
            self.created.lock().unwrap().clone()
        }

        pub fn step(&self, id: &TaskId, step: Step) {
            let scripts = self.scripts.lock().unwrap();
            let tx = scripts
                .get(id)
                .unwrap_or_else(|| panic!("task {id} was never started"));
            let _ = tx.send(step);
        }
    }

    impl TransferFactory for ScriptedFactory {
        fn create(&self, request: &DownloadRequest) -> Box<dyn Transfer> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.created.lock().unwrap().push(request.id.clone());
            self.scripts.lock().unwrap().insert(request.id.clone(), tx);
            Box::new(ScriptedTransfer { steps: rx })
        }
    }

    struct ScriptedTransfer {
        steps: mpsc::UnboundedReceiver<Step>,
    }

    #[async_trait]
    impl Transfer for ScriptedTransfer {
        async fn run(self: Box<Self>, mut ctx: TransferContext) -> Result<PathBuf, TransferError> {
            let mut steps = self.steps;
            loop {
                ctx.checkpoint().await?;
                let step = tokio::select! {
                    step = steps.recv() => step,
                    _ = ctx.control().cancelled() => return Err(TransferError::Cancelled),
                };
                match step {
                    Some(Step::Progress { downloaded, total }) => {
                        ctx.report(downloaded, Some(total), 1024.0)
                    }
                    Some(Step::Finish) => return Ok(ctx.request().destination.clone()),
                    Some(Step::Fail(reason)) => return Err(TransferError::Other(reason.into())),
                    None => return Err(TransferError::Other("script dropped".into())),
                }
            }
        }
    }
}
