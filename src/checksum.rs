use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use hex::FromHex;
use sha2::{Digest, Sha256};
use tokio::task;

use crate::error::TransferError;

/// Expected SHA-256 digest of a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumSpec {
    expected: [u8; 32],
}

impl ChecksumSpec {
    /// Accepts a 64-character hex digest or the path of a `sha256sum`-style file.
    pub fn from_input(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("checksum value cannot be empty"));
        }

        if trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Self::from_hex(trimmed);
        }

        let path = Path::new(trimmed);
        if !path.exists() {
            return Err(anyhow!("checksum file does not exist: {}", trimmed));
        }
        let file = File::open(path)
            .with_context(|| format!("failed to open checksum file {}", trimmed))?;
        let mut line = String::new();
        BufReader::new(file)
            .read_line(&mut line)
            .context("failed to read checksum file")?;
        let token = line
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("checksum file is empty"))?;
        Self::from_hex(token)
    }

    pub fn from_hex(digest: &str) -> Result<Self> {
        let expected =
            <[u8; 32]>::from_hex(digest).map_err(|_| anyhow!("invalid hex digest {digest:?}"))?;
        Ok(Self { expected })
    }

    pub fn hex(&self) -> String {
        hex::encode(self.expected)
    }

    pub async fn verify_file(&self, path: &Path) -> Result<(), TransferError> {
        let path_owned = path.to_owned();
        let computed = task::spawn_blocking(move || sha256_file(&path_owned))
            .await
            .map_err(|err| TransferError::Other(format!("checksum worker failed: {err}")))??;
        if computed == self.expected {
            Ok(())
        } else {
            Err(TransferError::Integrity(format!(
                "sha256 mismatch: expected {}, got {}",
                self.hex(),
                hex::encode(computed)
            )))
        }
    }
}

fn sha256_file(path: &Path) -> std::io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn verifies_matching_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let spec = ChecksumSpec::from_input(HELLO).unwrap();
        spec.verify_file(file.path()).await.unwrap();
    }

    #[tokio::test]
    async fn mismatch_is_an_integrity_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello there").unwrap();
        let spec = ChecksumSpec::from_input(HELLO).unwrap();
        let err = spec.verify_file(file.path()).await.unwrap_err();
        assert!(matches!(err, TransferError::Integrity(_)));
    }

    #[test]
    fn reads_digest_from_checksum_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{HELLO}  hello.txt").unwrap();
        let spec = ChecksumSpec::from_input(file.path().to_str().unwrap()).unwrap();
        assert_eq!(spec.hex(), HELLO);
    }
}
