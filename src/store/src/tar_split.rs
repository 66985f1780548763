//! Tar-split: store a layer as a file tree plus the tar framing needed to
//! rebuild its exact tar stream.
//!
//! The framing is NDJSON, gzip-compressed:
//!
//! ```json
//! {"type":2,"payload":"<base64 header and padding bytes>"}
//! {"type":1,"name":"etc/hosts","size":123}
//! {"type":2,"payload":"<base64 footer>"}
//! ```
//!
//! Type 2 segments are raw bytes written back verbatim. Type 1 entries name a
//! file whose payload is read from the layer's data directory. Reassembling
//! a disassembled stream reproduces it byte for byte, so a layer can be
//! re-digested or re-uploaded without keeping the original tar around.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use base64::prelude::*;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use cimage_core::digest::{Digest, HashingReader};
use cimage_core::error::{CimageError, Result};

const BLOCK_SIZE: usize = 512;

const FILE_TYPE: u8 = 1;
const SEGMENT_TYPE: u8 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    #[serde(rename = "type")]
    type_id: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

/// What a disassembled tar stream hashed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarSummary {
    /// Digest of the uncompressed tar stream.
    pub digest: Digest,
    /// Length of the uncompressed tar stream in bytes.
    pub size: u64,
}

struct MetadataWriter<W: Write> {
    out: W,
    pending: Vec<u8>,
}

impl<W: Write> MetadataWriter<W> {
    fn segment(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn flush_segment(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let entry = Entry {
            type_id: SEGMENT_TYPE,
            name: None,
            size: None,
            payload: Some(BASE64_STANDARD.encode(&self.pending)),
        };
        self.pending.clear();
        self.line(&entry)
    }

    fn file(&mut self, name: &str, size: u64) -> Result<()> {
        self.flush_segment()?;
        let entry = Entry {
            type_id: FILE_TYPE,
            name: Some(name.to_string()),
            size: Some(size),
            payload: None,
        };
        self.line(&entry)
    }

    fn line(&mut self, entry: &Entry) -> Result<()> {
        serde_json::to_writer(&mut self.out, entry)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

/// Split a tar stream into `data_dir` (when `extract` is set) and framing
/// metadata written gzip-compressed to `metadata`.
///
/// With `extract` unset the file tree is assumed to be in `data_dir` already
/// and only the framing is recorded.
pub fn disassemble<R: Read, W: Write>(
    reader: R,
    data_dir: &Path,
    extract: bool,
    metadata: W,
) -> Result<TarSummary> {
    let mut input = HashingReader::new(reader);
    let mut meta = MetadataWriter {
        out: GzEncoder::new(metadata, Compression::default()),
        pending: Vec::new(),
    };
    let mut long_name: Option<Vec<u8>> = None;
    let mut long_link: Option<Vec<u8>> = None;

    loop {
        let mut block = [0u8; BLOCK_SIZE];
        if !read_block(&mut input, &mut block)? {
            break;
        }
        meta.segment(&block);

        if block.iter().all(|b| *b == 0) {
            // End-of-archive marker; everything after it is kept verbatim.
            let mut trailer = Vec::new();
            input.read_to_end(&mut trailer)?;
            meta.segment(&trailer);
            break;
        }

        let header = tar::Header::from_byte_slice(&block);
        let size = header
            .entry_size()
            .map_err(|e| CimageError::TarSplitError(format!("invalid entry size: {}", e)))?;
        let padding = padding_for(size);
        let kind = header.entry_type();

        match kind {
            tar::EntryType::GNULongName | tar::EntryType::GNULongLink => {
                let data = read_exact_vec(&mut input, size + padding)?;
                meta.segment(&data);
                let value = trim_nul(&data[..size as usize]).to_vec();
                if kind == tar::EntryType::GNULongName {
                    long_name = Some(value);
                } else {
                    long_link = Some(value);
                }
                continue;
            }
            tar::EntryType::XHeader => {
                let data = read_exact_vec(&mut input, size + padding)?;
                meta.segment(&data);
                for ext in tar::PaxExtensions::new(&data[..size as usize]) {
                    let ext = ext.map_err(|e| {
                        CimageError::TarSplitError(format!("invalid pax header: {}", e))
                    })?;
                    match ext.key() {
                        Ok("path") => long_name = Some(ext.value_bytes().to_vec()),
                        Ok("linkpath") => long_link = Some(ext.value_bytes().to_vec()),
                        _ => {}
                    }
                }
                continue;
            }
            tar::EntryType::XGlobalHeader => {
                let data = read_exact_vec(&mut input, size + padding)?;
                meta.segment(&data);
                continue;
            }
            _ => {}
        }

        let raw_name = long_name
            .take()
            .unwrap_or_else(|| header.path_bytes().into_owned());
        let link_name = long_link
            .take()
            .or_else(|| header.link_name_bytes().map(|l| l.into_owned()));
        let name = sanitize_name(&raw_name)?;
        let is_file = matches!(kind, tar::EntryType::Regular | tar::EntryType::Continuous);

        if is_file {
            meta.file(&name, size)?;
            let mut content = (&mut input).take(size);
            if extract {
                let path = data_dir.join(&name);
                create_parent(&path)?;
                let mut file = std::fs::File::create(&path).map_err(|e| CimageError::io(&path, e))?;
                std::io::copy(&mut content, &mut file).map_err(|e| CimageError::io(&path, e))?;
                set_mode(&path, header.mode().ok());
            } else {
                std::io::copy(&mut content, &mut std::io::sink())?;
            }
            if content.limit() != 0 {
                return Err(CimageError::TarSplitError(format!(
                    "unexpected end of stream inside '{}'",
                    name
                )));
            }
            let pad = read_exact_vec(&mut input, padding)?;
            meta.segment(&pad);
        } else {
            meta.file(&name, 0)?;
            // Non-file entries rarely carry data; keep it in the framing.
            let data = read_exact_vec(&mut input, size + padding)?;
            meta.segment(&data);
            if extract {
                extract_special(data_dir, &name, kind, link_name.as_deref(), header.mode().ok())?;
            }
        }
    }

    meta.flush_segment()?;
    meta.out.finish()?;
    let (digest, size) = input.finish()?;
    tracing::debug!(digest = %digest, size, "Disassembled tar stream");
    Ok(TarSummary { digest, size })
}

/// Rebuild the original tar stream from framing metadata and the file tree
/// in `data_dir`.
pub fn assemble<R: Read, W: Write>(metadata: R, data_dir: &Path, mut writer: W) -> Result<()> {
    let reader = BufReader::new(GzDecoder::new(metadata));
    for line in reader.lines() {
        let line = line.map_err(|e| CimageError::TarSplitError(format!("corrupt metadata: {}", e)))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: Entry = serde_json::from_str(&line)?;
        match entry.type_id {
            SEGMENT_TYPE => {
                let payload = entry.payload.unwrap_or_default();
                let bytes = BASE64_STANDARD
                    .decode(payload.as_bytes())
                    .map_err(|e| CimageError::TarSplitError(format!("invalid segment: {}", e)))?;
                writer.write_all(&bytes)?;
            }
            FILE_TYPE => {
                let size = entry.size.unwrap_or(0);
                if size == 0 {
                    continue;
                }
                let name = entry.name.unwrap_or_default();
                let path = data_dir.join(&name);
                let file = std::fs::File::open(&path).map_err(|e| CimageError::io(&path, e))?;
                let copied = std::io::copy(&mut file.take(size), &mut writer)?;
                if copied != size {
                    return Err(CimageError::TarSplitError(format!(
                        "'{}' is {} bytes, expected {}",
                        name, copied, size
                    )));
                }
            }
            other => {
                return Err(CimageError::TarSplitError(format!(
                    "Invalid tar-split entry type: {}",
                    other
                )))
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Write a deterministic tar of everything under `dir`.
///
/// Entries are emitted in sorted path order with normalized ownership and
/// timestamps, so the same tree always produces the same bytes.
pub fn write_dir_tar<W: Write>(dir: &Path, writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    let mut paths = Vec::new();
    collect_paths(dir, Path::new(""), &mut paths)?;
    for rel in paths {
        let full = dir.join(&rel);
        builder
            .append_path_with_name(&full, &rel)
            .map_err(|e| CimageError::io(&full, e))?;
    }
    Ok(builder.into_inner()?)
}

fn collect_paths(root: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let dir = root.join(rel);
    let mut names: Vec<_> = std::fs::read_dir(&dir)
        .map_err(|e| CimageError::io(&dir, e))?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<std::io::Result<_>>()
        .map_err(|e| CimageError::io(&dir, e))?;
    names.sort();

    for name in names {
        let child = rel.join(&name);
        out.push(child.clone());
        let meta = root
            .join(&child)
            .symlink_metadata()
            .map_err(|e| CimageError::io(root.join(&child), e))?;
        if meta.is_dir() {
            collect_paths(root, &child, out)?;
        }
    }
    Ok(())
}

fn read_block<R: Read>(reader: &mut R, block: &mut [u8; BLOCK_SIZE]) -> Result<bool> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = reader.read(&mut block[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(CimageError::TarSplitError(
                "unexpected end of stream inside a header".to_string(),
            ));
        }
        filled += n;
    }
    Ok(true)
}

fn read_exact_vec<R: Read>(reader: &mut R, len: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|e| CimageError::TarSplitError(format!("truncated tar stream: {}", e)))?;
    Ok(buf)
}

fn padding_for(size: u64) -> u64 {
    let rem = size % BLOCK_SIZE as u64;
    if rem == 0 {
        0
    } else {
        BLOCK_SIZE as u64 - rem
    }
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Normalize an entry name to a relative path that stays inside the layer.
fn sanitize_name(raw: &[u8]) -> Result<String> {
    let name = String::from_utf8_lossy(raw);
    let mut clean = PathBuf::new();
    for component in Path::new(name.as_ref()).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(CimageError::TarSplitError(format!(
                    "entry '{}' escapes the layer root",
                    name
                )))
            }
        }
    }
    Ok(clean.to_string_lossy().into_owned())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CimageError::io(parent, e))?;
    }
    Ok(())
}

fn extract_special(
    data_dir: &Path,
    name: &str,
    kind: tar::EntryType,
    link_name: Option<&[u8]>,
    mode: Option<u32>,
) -> Result<()> {
    let path = data_dir.join(name);
    match kind {
        tar::EntryType::Directory => {
            std::fs::create_dir_all(&path).map_err(|e| CimageError::io(&path, e))?;
            set_mode(&path, mode);
        }
        tar::EntryType::Symlink => {
            let target = link_name.ok_or_else(|| {
                CimageError::TarSplitError(format!("symlink '{}' has no target", name))
            })?;
            create_parent(&path)?;
            #[cfg(unix)]
            {
                use std::os::unix::ffi::OsStrExt;
                let target = std::ffi::OsStr::from_bytes(target);
                std::os::unix::fs::symlink(target, &path).map_err(|e| CimageError::io(&path, e))?;
            }
            #[cfg(not(unix))]
            {
                tracing::warn!(name, target = %String::from_utf8_lossy(target), "Skipping symlink");
            }
        }
        tar::EntryType::Link => {
            let target = link_name.ok_or_else(|| {
                CimageError::TarSplitError(format!("hardlink '{}' has no target", name))
            })?;
            let source = data_dir.join(sanitize_name(target)?);
            create_parent(&path)?;
            std::fs::hard_link(&source, &path).map_err(|e| CimageError::io(&path, e))?;
        }
        _ => {
            tracing::debug!(name, kind = ?kind, "Not materializing special entry");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)) {
            tracing::debug!(path = %path.display(), error = %e, "Failed to set permissions");
        }
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) {}
