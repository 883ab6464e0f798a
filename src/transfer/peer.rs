//! Simulated swarm backends for BitTorrent and ED2K.
//!
//! No peer wire protocol is spoken here. The transfer walks through the usual
//! connection phases, then writes deterministic pseudo-random chunks derived
//! from the content hash, so the scheduling contract (progress, pause,
//! resume, cancel, one terminal event) can be exercised end to end.

use std::fmt;
use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

#[cfg(target_os = "linux")]
use nix::errno::Errno;
#[cfg(target_os = "linux")]
use nix::fcntl::{fallocate, FallocateFlags};
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

use super::Transfer;
use crate::download::PeerSettings;
use crate::error::TransferError;
use crate::source::SourceDescriptor;
use crate::task::{SpeedMeter, TransferContext};
use crate::util::ensure_parent_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerProtocol {
    BitTorrent,
    Ed2k,
}

impl PeerProtocol {
    fn phases(self) -> [&'static str; 3] {
        match self {
            PeerProtocol::BitTorrent => [
                "querying trackers and DHT",
                "fetching torrent metadata",
                "connecting to peers",
            ],
            PeerProtocol::Ed2k => [
                "connecting to ed2k network",
                "searching for sources",
                "establishing connections",
            ],
        }
    }
}

impl fmt::Display for PeerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerProtocol::BitTorrent => f.write_str("bittorrent"),
            PeerProtocol::Ed2k => f.write_str("ed2k"),
        }
    }
}

pub struct PeerTransfer {
    protocol: PeerProtocol,
    settings: PeerSettings,
}

impl PeerTransfer {
    pub fn new(protocol: PeerProtocol, settings: PeerSettings) -> Self {
        Self { protocol, settings }
    }

    async fn write_chunks(
        &self,
        ctx: &mut TransferContext,
        file: &mut File,
        content_hash: &str,
        size: u64,
    ) -> Result<(), TransferError> {
        let chunk_size = self.settings.chunk_size.max(1);
        let mut meter = SpeedMeter::new();
        let mut downloaded = 0u64;
        let mut chunk_index = 0u64;
        while downloaded < size {
            let was_paused = ctx.control().is_paused();
            if was_paused {
                file.flush().await?;
            }
            ctx.checkpoint().await?;
            if was_paused {
                meter.reset();
            }

            let len = chunk_size.min(size - downloaded);
            let chunk = chunk_data(content_hash, chunk_index, len as usize);
            file.seek(SeekFrom::Start(downloaded)).await?;
            file.write_all(&chunk).await?;

            downloaded += len;
            chunk_index += 1;
            let speed = meter.record(len);
            ctx.report(downloaded, Some(size), speed);

            if downloaded < size {
                ctx.idle(self.settings.chunk_delay).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transfer for PeerTransfer {
    async fn run(self: Box<Self>, mut ctx: TransferContext) -> Result<PathBuf, TransferError> {
        let (content_hash, size) = match (&ctx.request().source, self.protocol) {
            (SourceDescriptor::Magnet { info_hash, .. }, PeerProtocol::BitTorrent) => {
                let size = Some(ctx.request().total_size)
                    .filter(|s| *s > 0)
                    .unwrap_or(self.settings.default_size);
                (info_hash.clone(), size)
            }
            (SourceDescriptor::Ed2k { hash, size, .. }, PeerProtocol::Ed2k) => (hash.clone(), *size),
            (other, protocol) => {
                return Err(TransferError::Other(format!(
                    "{protocol} backend cannot fetch {other}"
                )))
            }
        };
        let output = ctx.request().destination.clone();

        for phase in self.protocol.phases() {
            ctx.checkpoint().await?;
            ctx.set_status(phase);
            ctx.report(0, Some(size), 0.0);
            ctx.idle(self.settings.phase_delay).await?;
        }

        let file = open_preallocated(&output, size)?;
        let mut file = File::from_std(file);
        ctx.set_status("downloading");
        info!(
            "{} transfer of {} ({size} bytes) started",
            self.protocol,
            output.display()
        );

        let copied = self.write_chunks(&mut ctx, &mut file, &content_hash, size).await;
        // chunks already written stay on disk when the transfer is cancelled
        file.flush().await?;
        copied?;
        file.sync_all().await?;
        drop(file);

        ctx.set_status("verifying");
        let written = tokio::fs::metadata(&output).await?.len();
        if written != size {
            return Err(TransferError::Integrity(format!(
                "expected {size} bytes on disk, found {written}"
            )));
        }
        debug!("{} transfer of {} verified", self.protocol, output.display());
        Ok(output)
    }
}

fn open_preallocated(path: &Path, size: u64) -> Result<std::fs::File, TransferError> {
    ensure_parent_dir(path)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .truncate(true)
        .open(path)?;
    preallocate(&file, size)?;
    Ok(file)
}

fn preallocate(file: &std::fs::File, size: u64) -> Result<(), TransferError> {
    #[cfg(target_os = "linux")]
    {
        if size > 0 {
            if let Err(err) = fallocate(
                file.as_raw_fd(),
                FallocateFlags::FALLOC_FL_KEEP_SIZE,
                0,
                size as i64,
            ) {
                if err != Errno::ENOTSUP && err != Errno::EINVAL {
                    return Err(TransferError::Other(format!("fallocate failed: {err}")));
                }
            }
        }
    }
    file.set_len(size)?;
    Ok(())
}

/// Deterministic filler for chunk `index` of the content identified by `hash`.
fn chunk_data(hash: &str, index: u64, len: usize) -> Vec<u8> {
    let digest = Sha256::new()
        .chain_update(hash.as_bytes())
        .chain_update(index.to_le_bytes())
        .finalize();
    let mut seed = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (0..len)
        .map(|_| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff;
            (seed & 0xff) as u8
        })
        .collect()
}
