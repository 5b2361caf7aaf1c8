// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

//! qcow2 header reader.
//!
//! Only the leading, version-independent part of the header is decoded. All
//! fields are big-endian:
//!
//! ```text
//! 0   magic               u32   "QFI\xfb"
//! 4   version             u32
//! 8   backing_file_offset u64
//! 16  backing_file_size   u32
//! 20  cluster_bits        i32
//! 24  size                u64
//! 32  crypt_method        i32
//! ```

use loom_model::{LoomError, Result};
use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tracing::{debug, info};

pub const QCOW2_MAGIC: u32 = 0x5146_49FB;
pub const HEADER_LEN: usize = 36;

/// Deepest backing chain `resolve_chain` will follow.
pub const MAX_CHAIN_DEPTH: usize = 64;

/// Longest backing file name qemu writes.
pub const MAX_BACKING_NAME: u32 = 1023;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qcow2Header {
    pub magic: u32,
    pub version: u32,
    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub cluster_bits: i32,
    pub size: u64,
    pub crypt_method: i32,
}

impl Qcow2Header {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(LoomError::FormatError(format!(
                "qcow2 header needs {} bytes, got {}",
                HEADER_LEN,
                bytes.len()
            )));
        }
        let u32_at = |o: usize| u32::from_be_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[o..o + 8]);
            u64::from_be_bytes(b)
        };

        let magic = u32_at(0);
        if magic != QCOW2_MAGIC {
            return Err(LoomError::FormatError(format!(
                "bad qcow2 magic {:#010x}",
                magic
            )));
        }

        Ok(Self {
            magic,
            version: u32_at(4),
            backing_file_offset: u64_at(8),
            backing_file_size: u32_at(16),
            cluster_bits: u32_at(20) as i32,
            size: u64_at(24),
            crypt_method: u32_at(32) as i32,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..16].copy_from_slice(&self.backing_file_offset.to_be_bytes());
        out[16..20].copy_from_slice(&self.backing_file_size.to_be_bytes());
        out[20..24].copy_from_slice(&self.cluster_bits.to_be_bytes());
        out[24..32].copy_from_slice(&self.size.to_be_bytes());
        out[32..36].copy_from_slice(&self.crypt_method.to_be_bytes());
        out
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypt_method != 0
    }

    pub fn has_backing_file(&self) -> bool {
        self.backing_file_offset != 0 && self.backing_file_size != 0
    }
}

/// An opened qcow2 file.
#[derive(Debug, Clone)]
pub struct Qcow2Image {
    path: PathBuf,
    header: Qcow2Header,
}

impl Qcow2Image {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header = read_header(&path).await?;
        Ok(Self { path, header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Qcow2Header {
        &self.header
    }

    /// The backing file path as recorded in the image, `None` when the image
    /// stands alone.
    pub async fn backing_file(&self) -> Result<Option<String>> {
        if !self.header.has_backing_file() {
            return Ok(None);
        }
        if self.header.backing_file_size > MAX_BACKING_NAME {
            return Err(LoomError::FormatError(format!(
                "{}: backing file name of {} bytes exceeds {}",
                self.path.display(),
                self.header.backing_file_size,
                MAX_BACKING_NAME
            )));
        }
        let mut file = open_image(&self.path).await?;
        file.seek(SeekFrom::Start(self.header.backing_file_offset)).await?;
        let mut raw = vec![0u8; self.header.backing_file_size as usize];
        file.read_exact(&mut raw).await.map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => LoomError::FormatError(format!(
                "{}: backing file name runs past end of file",
                self.path.display()
            )),
            _ => LoomError::Io(e),
        })?;
        let name = String::from_utf8(raw).map_err(|_| {
            LoomError::FormatError(format!(
                "{}: backing file name is not UTF-8",
                self.path.display()
            ))
        })?;
        Ok(if name.is_empty() { None } else { Some(name) })
    }

    pub async fn reload(&mut self) -> Result<()> {
        self.header = read_header(&self.path).await?;
        Ok(())
    }

    /// Points this image at `base_image` with `<tool> rebase -u`.
    pub async fn rebase(
        &mut self,
        tool: &Path,
        base_image: &Path,
        backing_format: Option<&str>,
    ) -> Result<()> {
        if !tokio::fs::try_exists(base_image).await.unwrap_or(false) {
            return Err(LoomError::not_found("base image", base_image.display()));
        }

        let options = BackingOptions::resolve(base_image).await;
        let mut cmd = Command::new(tool);
        cmd.arg("rebase").arg("-u").arg("-b").arg(&options.spec);
        if let Some(fmt) = backing_format {
            cmd.arg("-F").arg(fmt);
        }
        cmd.arg(&self.path);

        info!(
            image = %self.path.display(),
            base = %base_image.display(),
            "Rebasing disk image"
        );
        let status = cmd.status().await.map_err(|e| {
            LoomError::ExternalToolError(format!("cannot run {}: {}", tool.display(), e))
        })?;
        if !status.success() {
            return Err(LoomError::ExternalToolError(format!(
                "{} rebase of {} exited with {}",
                tool.display(),
                self.path.display(),
                status
            )));
        }

        self.reload().await
    }
}

/// What to hand an image tool as the `-b` argument for a base image.
#[derive(Debug, Clone, PartialEq)]
pub struct BackingOptions {
    pub spec: String,
    pub header: Option<Qcow2Header>,
}

impl BackingOptions {
    /// Non-qcow2 bases (raw, vmdk, ...) are passed through as plain paths.
    pub async fn resolve(path: &Path) -> Self {
        let plain = path.display().to_string();
        match read_header(path).await {
            Ok(header) if header.is_encrypted() => {
                let secret = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| plain.clone());
                let options = serde_json::json!({
                    "driver": "qcow2",
                    "encrypt.key-secret": secret,
                    "file": {
                        "driver": "file",
                        "filename": plain,
                    },
                });
                Self {
                    spec: format!("json:{}", options),
                    header: Some(header),
                }
            }
            Ok(header) => Self {
                spec: plain,
                header: Some(header),
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Base image is not qcow2");
                Self {
                    spec: plain,
                    header: None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainLink {
    pub path: PathBuf,
    /// `None` for a non-qcow2 terminal image.
    pub header: Option<Qcow2Header>,
}

/// Walks backing pointers from `top` down to the base image. Relative backing
/// names are resolved against the directory of the image that names them.
pub async fn resolve_chain(top: &Path) -> Result<Vec<ChainLink>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = top.to_path_buf();

    loop {
        if !seen.insert(current.clone()) {
            return Err(LoomError::FormatError(format!(
                "backing chain loops back to {}",
                current.display()
            )));
        }
        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(LoomError::FormatError(format!(
                "backing chain deeper than {}",
                MAX_CHAIN_DEPTH
            )));
        }

        let image = match Qcow2Image::open(&current).await {
            Ok(image) => image,
            Err(LoomError::FormatError(_)) if !chain.is_empty() => {
                chain.push(ChainLink {
                    path: current,
                    header: None,
                });
                return Ok(chain);
            }
            Err(e) => return Err(e),
        };

        let next = image.backing_file().await?;
        chain.push(ChainLink {
            path: current.clone(),
            header: Some(image.header),
        });

        match next {
            None => return Ok(chain),
            Some(name) => {
                let candidate = PathBuf::from(&name);
                current = if candidate.is_absolute() {
                    candidate
                } else {
                    current
                        .parent()
                        .map(|dir| dir.join(&candidate))
                        .unwrap_or(candidate)
                };
            }
        }
    }
}

async fn open_image(path: &Path) -> Result<File> {
    File::open(path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => LoomError::not_found("disk image", path.display()),
        _ => LoomError::Io(e),
    })
}

async fn read_header(path: &Path) -> Result<Qcow2Header> {
    let mut file = open_image(path).await?;
    let mut buf = [0u8; HEADER_LEN];
    file.read_exact(&mut buf).await.map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            LoomError::FormatError(format!("{}: file too short for a qcow2 header", path.display()))
        }
        _ => LoomError::Io(e),
    })?;
    Qcow2Header::parse(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Qcow2Header {
        Qcow2Header {
            magic: QCOW2_MAGIC,
            version: 3,
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits: 16,
            size: 1 << 30,
            crypt_method: 0,
        }
    }

    #[test]
    fn header_round_trip() {
        let h = Qcow2Header {
            backing_file_offset: 0x1_0000_0000,
            backing_file_size: 17,
            crypt_method: 2,
            ..header()
        };
        assert_eq!(Qcow2Header::parse(&h.to_bytes()).unwrap(), h);
    }

    #[test]
    fn byte_layout_is_big_endian() {
        let bytes = header().to_bytes();
        assert_eq!(&bytes[0..4], b"QFI\xfb");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 3]);
        assert_eq!(bytes[23], 16);
    }

    #[test]
    fn wrong_magic_or_short_input() {
        let mut bytes = header().to_bytes();
        bytes[0] = 0;
        assert!(matches!(Qcow2Header::parse(&bytes), Err(LoomError::FormatError(_))));
        assert!(matches!(
            Qcow2Header::parse(&header().to_bytes()[..20]),
            Err(LoomError::FormatError(_))
        ));
    }

    #[test]
    fn backing_presence() {
        assert!(!header().has_backing_file());
        let h = Qcow2Header {
            backing_file_offset: 512,
            backing_file_size: 8,
            ..header()
        };
        assert!(h.has_backing_file());
        assert!(!h.is_encrypted());
    }
}
