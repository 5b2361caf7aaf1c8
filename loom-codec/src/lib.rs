// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

pub mod archive;
pub mod compression;
pub mod qcow2;

pub use archive::{pack_dir, unpack_dir, ArchiveReader, ArchiveWriter, Entry};
pub use compression::{Codec, CodecRegistry};
pub use qcow2::{resolve_chain, BackingOptions, ChainLink, Qcow2Header, Qcow2Image, QCOW2_MAGIC};
