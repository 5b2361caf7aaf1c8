// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Leif Rydenfalk – https://github.com/Leif-Rydenfalk/loom

//! Portable project archives.
//!
//! Layout: the 8-byte magic, then one record per file
//! `[name_len: u16][name][method: u16][raw_len: u64][data_len: u64][data]`
//! (big-endian), closed by a zero `name_len`.

use crate::compression::CodecRegistry;
use loom_model::{LoomError, Result};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub const ARCHIVE_MAGIC: &[u8; 8] = b"LOOMARC1";

/// Entries larger than this are refused on read.
pub const MAX_ENTRY_SIZE: u64 = 8 * 1024 * 1024 * 1024;

pub struct ArchiveWriter<W: Write> {
    inner: W,
    registry: CodecRegistry,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(mut inner: W, registry: CodecRegistry) -> Result<Self> {
        inner.write_all(ARCHIVE_MAGIC)?;
        Ok(Self { inner, registry })
    }

    pub fn add(&mut self, name: &str, data: &[u8], method: u16) -> Result<()> {
        validate_name(name)?;
        let codec = self.registry.get(method)?;
        let packed = codec.compress(data)?;
        let name_len = u16::try_from(name.len())
            .map_err(|_| LoomError::InvalidArgument(format!("entry name too long: {}", name)))?;

        self.inner.write_all(&name_len.to_be_bytes())?;
        self.inner.write_all(name.as_bytes())?;
        self.inner.write_all(&method.to_be_bytes())?;
        self.inner.write_all(&(data.len() as u64).to_be_bytes())?;
        self.inner.write_all(&(packed.len() as u64).to_be_bytes())?;
        self.inner.write_all(&packed)?;
        debug!(entry = name, codec = codec.name(), raw = data.len(), packed = packed.len(), "Archived");
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.inner.write_all(&0u16.to_be_bytes())?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub method: u16,
    pub data: Vec<u8>,
}

pub struct ArchiveReader<R: Read> {
    inner: R,
    registry: CodecRegistry,
    done: bool,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(mut inner: R, registry: CodecRegistry) -> Result<Self> {
        let mut magic = [0u8; 8];
        read_exact(&mut inner, &mut magic)?;
        if &magic != ARCHIVE_MAGIC {
            return Err(LoomError::FormatError("not a loom project archive".into()));
        }
        Ok(Self {
            inner,
            registry,
            done: false,
        })
    }

    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        let name_len = u16::from_be_bytes(self.array()?) as usize;
        if name_len == 0 {
            self.done = true;
            return Ok(None);
        }

        let mut name = vec![0u8; name_len];
        read_exact(&mut self.inner, &mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| LoomError::FormatError("archive entry name is not UTF-8".into()))?;
        validate_name(&name)?;

        let method = u16::from_be_bytes(self.array()?);
        let raw_len = u64::from_be_bytes(self.array()?);
        let data_len = u64::from_be_bytes(self.array()?);
        if raw_len > MAX_ENTRY_SIZE || data_len > MAX_ENTRY_SIZE {
            return Err(LoomError::FormatError(format!("entry {} is too large", name)));
        }

        let mut packed = vec![0u8; data_len as usize];
        read_exact(&mut self.inner, &mut packed)?;
        let data = self.registry.get(method)?.decompress(&packed)?;
        if data.len() as u64 != raw_len {
            return Err(LoomError::FormatError(format!(
                "entry {} decoded to {} bytes, header says {}",
                name,
                data.len(),
                raw_len
            )));
        }
        Ok(Some(Entry { name, method, data }))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        read_exact(&mut self.inner, &mut buf)?;
        Ok(buf)
    }
}

/// Archives every regular file below `dir`, names relative to `dir` with `/`.
pub fn pack_dir<W: Write>(dir: &Path, out: W, registry: CodecRegistry, method: u16) -> Result<W> {
    let mut writer = ArchiveWriter::new(out, registry)?;
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();
    for rel in files {
        let data = fs::read(dir.join(&rel))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        writer.add(&name, &data, method)?;
    }
    writer.finish()
}

/// Extracts an archive below `dest`. Returns the extracted names.
pub fn unpack_dir<R: Read>(input: R, dest: &Path, registry: CodecRegistry) -> Result<Vec<String>> {
    let mut reader = ArchiveReader::new(input, registry)?;
    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry()? {
        let target = dest.join(&entry.name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &entry.data)?;
        names.push(entry.name);
    }
    Ok(names)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if name.is_empty() || escapes || name.contains('\\') {
        return Err(LoomError::FormatError(format!("unsafe archive entry name '{}'", name)));
    }
    Ok(())
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => LoomError::FormatError("archive is truncated".into()),
        _ => LoomError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{SNAPPY, STORED, ZSTD};

    #[test]
    fn entries_come_back_in_order() {
        let registry = CodecRegistry::with_defaults();
        let mut w = ArchiveWriter::new(Vec::new(), registry.clone()).unwrap();
        w.add("lab.loom", b"{}", ZSTD).unwrap();
        w.add("configs/R1.cfg", b"hostname R1", SNAPPY).unwrap();
        w.add("empty", b"", STORED).unwrap();
        let bytes = w.finish().unwrap();

        let mut r = ArchiveReader::new(bytes.as_slice(), registry).unwrap();
        let names: Vec<String> = std::iter::from_fn(|| r.next_entry().unwrap())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["lab.loom", "configs/R1.cfg", "empty"]);
    }

    #[test]
    fn unknown_method_is_refused() {
        let mut w = ArchiveWriter::new(Vec::new(), CodecRegistry::with_defaults()).unwrap();
        assert!(w.add("x", b"x", 77).unwrap_err().is_not_found());
    }

    #[test]
    fn traversal_names_are_refused() {
        let mut w = ArchiveWriter::new(Vec::new(), CodecRegistry::with_defaults()).unwrap();
        for bad in ["../etc/passwd", "/abs", "a/../../b", ""] {
            assert!(w.add(bad, b"x", STORED).is_err(), "{}", bad);
        }
    }

    #[test]
    fn truncated_and_foreign_input() {
        let registry = CodecRegistry::with_defaults();
        assert!(matches!(
            ArchiveReader::new(&b"PK\x03\x04...."[..], registry.clone()),
            Err(LoomError::FormatError(_))
        ));

        let mut w = ArchiveWriter::new(Vec::new(), registry.clone()).unwrap();
        w.add("a", b"hello world", STORED).unwrap();
        let bytes = w.finish().unwrap();
        let cut = &bytes[..bytes.len() - 6];
        let mut r = ArchiveReader::new(cut, registry).unwrap();
        assert!(matches!(r.next_entry(), Err(LoomError::FormatError(_))));
    }
}
