// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

use loom_model::{LoomError, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

pub const STORED: u16 = 0;
pub const ZSTD: u16 = 93;
pub const SNAPPY: u16 = 94;

/// An encoder/decoder pair addressed by its compression-method id.
pub trait Codec: Send + Sync {
    fn id(&self) -> u16;
    fn name(&self) -> &'static str;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

pub struct Stored;

impl Codec for Stored {
    fn id(&self) -> u16 {
        STORED
    }

    fn name(&self) -> &'static str {
        "stored"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

pub struct Zstd {
    pub level: i32,
}

impl Default for Zstd {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for Zstd {
    fn id(&self) -> u16 {
        ZSTD
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), self.level)?;
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = zstd::stream::read::Decoder::new(data)?;
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| LoomError::FormatError(format!("zstd stream is corrupt: {}", e)))?;
        Ok(out)
    }
}

pub struct Snappy;

impl Codec for Snappy {
    fn id(&self) -> u16 {
        SNAPPY
    }

    fn name(&self) -> &'static str {
        "snappy"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| LoomError::FormatError(format!("snappy compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| LoomError::FormatError(format!("snappy stream is corrupt: {}", e)))
    }
}

/// Compression methods known to archive readers and writers.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<u16, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Stored));
        registry.register(Arc::new(Zstd::default()));
        registry.register(Arc::new(Snappy));
        registry
    }

    /// Returns the codec previously registered under the same id.
    pub fn register(&mut self, codec: Arc<dyn Codec>) -> Option<Arc<dyn Codec>> {
        self.codecs.insert(codec.id(), codec)
    }

    pub fn get(&self, id: u16) -> Result<Arc<dyn Codec>> {
        self.codecs
            .get(&id)
            .cloned()
            .ok_or_else(|| LoomError::not_found("compression method", id))
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<dyn Codec>> {
        self.codecs
            .values()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| LoomError::not_found("compression method", name))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.codecs.values().map(|c| c.name()).collect()
    }
}
