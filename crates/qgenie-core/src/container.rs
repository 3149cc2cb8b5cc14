//! `QGENIE1` bundle container codec.
//!
//! Layout (little-endian, no padding):
//!
//! ```text
//! header   magic "QGENIE1" | version u16 | reserved u32
//!          | config_offset u64 | config_length u64 | toc_offset u64
//! payload  zstd(config.json) | zstd(entry 0) | zstd(entry 1) | ...
//! toc      per entry: name_len u16 | name | offset u64 | comp_length u64
//!          | raw_length u64 | crc32 u32 (of the compressed bytes)
//! footer   crc32 u32 of every preceding byte
//! ```
//!
//! The reader streams the file for the global checksum and then reads one
//! section at a time, so peak memory is bounded by the largest entry rather
//! than the whole bundle.

use flate2::Crc;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::{BundleConfig, ContainerConfig};
use crate::error::{BundleError, Result, UnpackError};
use crate::fsutil::atomic_write;
use crate::resolver::BundleUnpacker;

const CHUNK_SIZE: usize = 64 * 1024;

/// CRC-32 (IEEE, as computed by zlib).
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(bytes);
    crc.sum()
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Fixed-size container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerHeader {
    pub version: u16,
    pub config_offset: u64,
    pub config_length: u64,
    pub toc_offset: u64,
}

impl ContainerHeader {
    pub fn decode(bytes: &[u8; ContainerConfig::HEADER_LEN]) -> Result<Self> {
        if &bytes[..7] != ContainerConfig::MAGIC {
            return Err(BundleError::container("Invalid container magic"));
        }
        let version = le_u16(&bytes[7..9]);
        if version != ContainerConfig::VERSION {
            return Err(BundleError::container(format!(
                "Unsupported container version {}",
                version
            )));
        }
        // bytes[9..13] are reserved
        Ok(Self {
            version,
            config_offset: le_u64(&bytes[13..21]),
            config_length: le_u64(&bytes[21..29]),
            toc_offset: le_u64(&bytes[29..37]),
        })
    }

    pub fn encode(&self) -> [u8; ContainerConfig::HEADER_LEN] {
        let mut out = [0u8; ContainerConfig::HEADER_LEN];
        out[..7].copy_from_slice(ContainerConfig::MAGIC);
        out[7..9].copy_from_slice(&self.version.to_le_bytes());
        out[13..21].copy_from_slice(&self.config_offset.to_le_bytes());
        out[21..29].copy_from_slice(&self.config_length.to_le_bytes());
        out[29..37].copy_from_slice(&self.toc_offset.to_le_bytes());
        out
    }
}

/// One table-of-contents entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TocEntry {
    pub name: String,
    pub offset: u64,
    pub comp_length: u64,
    pub raw_length: u64,
    pub crc32: u32,
}

impl TocEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let name_len = u16::try_from(self.name.len()).map_err(|_| {
            BundleError::container(format!("Entry name too long: {}", self.name))
        })?;
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.comp_length.to_le_bytes());
        out.extend_from_slice(&self.raw_length.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        Ok(())
    }
}

fn decode_toc(bytes: &[u8]) -> Result<Vec<TocEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes.len() - pos < 2 {
            return Err(BundleError::container("Truncated TOC entry"));
        }
        let name_len = le_u16(&bytes[pos..]) as usize;
        pos += 2;

        if bytes.len() - pos < name_len + ContainerConfig::TOC_FIXED_LEN {
            return Err(BundleError::container("Truncated TOC entry"));
        }
        let name = std::str::from_utf8(&bytes[pos..pos + name_len])
            .map_err(|_| BundleError::container("TOC entry name is not valid UTF-8"))?
            .to_string();
        pos += name_len;

        entries.push(TocEntry {
            name,
            offset: le_u64(&bytes[pos..]),
            comp_length: le_u64(&bytes[pos + 8..]),
            raw_length: le_u64(&bytes[pos + 16..]),
            crc32: le_u32(&bytes[pos + 24..]),
        });
        pos += ContainerConfig::TOC_FIXED_LEN;
    }

    Ok(entries)
}

/// Map a TOC name to a relative path that cannot escape the output directory.
pub fn safe_entry_path(name: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(BundleError::container(format!("Unsafe entry name: {}", name)));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(BundleError::container(format!("Empty entry name: {:?}", name)));
    }
    if relative == Path::new(BundleConfig::MANIFEST_FILE_NAME) {
        return Err(BundleError::container(format!(
            "Entry name collides with the manifest: {}",
            name
        )));
    }
    Ok(relative)
}

/// Verified, seekable view over a bundle.
///
/// Construction checks the magic, version and global CRC, decodes the TOC and
/// range-checks every section. Section CRCs are checked when read.
pub struct BundleReader<R> {
    inner: R,
    header: ContainerHeader,
    entries: Vec<TocEntry>,
}

impl BundleReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| BundleError::io_with_path(e, path))?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> BundleReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        let min_len = (ContainerConfig::HEADER_LEN + ContainerConfig::FOOTER_LEN) as u64;
        if len < min_len {
            return Err(BundleError::container("Bundle too small"));
        }
        let body_len = len - ContainerConfig::FOOTER_LEN as u64;

        inner.seek(SeekFrom::Start(0))?;
        let mut header_bytes = [0u8; ContainerConfig::HEADER_LEN];
        inner.read_exact(&mut header_bytes)?;
        let header = ContainerHeader::decode(&header_bytes)?;

        let mut crc = Crc::new();
        crc.update(&header_bytes);
        let mut remaining = body_len - ContainerConfig::HEADER_LEN as u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while remaining > 0 {
            let n = remaining.min(CHUNK_SIZE as u64) as usize;
            inner.read_exact(&mut buf[..n])?;
            crc.update(&buf[..n]);
            remaining -= n as u64;
        }
        let mut footer = [0u8; ContainerConfig::FOOTER_LEN];
        inner.read_exact(&mut footer)?;
        if le_u32(&footer) != crc.sum() {
            return Err(BundleError::container("Global CRC mismatch"));
        }

        let header_len = ContainerConfig::HEADER_LEN as u64;
        if !section_in_range(header.config_offset, header.config_length, header_len, body_len) {
            return Err(BundleError::container("Config section out of range"));
        }
        if header.toc_offset < header_len || header.toc_offset > body_len {
            return Err(BundleError::container("TOC offset out of range"));
        }

        inner.seek(SeekFrom::Start(header.toc_offset))?;
        let mut toc_bytes = vec![0u8; (body_len - header.toc_offset) as usize];
        inner.read_exact(&mut toc_bytes)?;
        let entries = decode_toc(&toc_bytes)?;

        for entry in &entries {
            if !section_in_range(entry.offset, entry.comp_length, header_len, body_len) {
                return Err(BundleError::container(format!(
                    "Section out of range: {}",
                    entry.name
                )));
            }
        }

        Ok(Self {
            inner,
            header,
            entries,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn entries(&self) -> &[TocEntry] {
        &self.entries
    }

    /// Decompressed manifest bytes.
    pub fn read_config(&mut self) -> Result<Vec<u8>> {
        let comp = self.read_range(self.header.config_offset, self.header.config_length)?;
        zstd::bulk::decompress(&comp, ContainerConfig::MAX_CONFIG_BYTES).map_err(|e| {
            BundleError::container(format!("Zstd decompress config failed: {}", e))
        })
    }

    /// Decompressed bytes of one entry, after its CRC and size are verified.
    pub fn read_entry(&mut self, entry: &TocEntry) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        self.copy_entry(entry, &mut raw)?;
        Ok(raw)
    }

    /// Stream one entry into `out`, returning the number of bytes written.
    ///
    /// Decoding stops one byte past the TOC's `raw_length`, so a wrong size
    /// fails after at most that many bytes instead of trusting it for an
    /// allocation.
    pub fn copy_entry<W: Write>(&mut self, entry: &TocEntry, out: &mut W) -> Result<u64> {
        let comp = self.read_range(entry.offset, entry.comp_length)?;
        if crc32(&comp) != entry.crc32 {
            return Err(BundleError::container(format!(
                "CRC mismatch for section: {}",
                entry.name
            )));
        }

        let decode_err = |e: std::io::Error| {
            BundleError::container(format!("Decompress failed for {}: {}", entry.name, e))
        };
        let decoder = zstd::stream::read::Decoder::new(comp.as_slice()).map_err(decode_err)?;
        let mut limited = decoder.take(entry.raw_length.saturating_add(1));
        let written = std::io::copy(&mut limited, out).map_err(decode_err)?;
        if written != entry.raw_length {
            return Err(BundleError::container(format!(
                "Decompress failed for {}: expected {} bytes, got {}",
                entry.name,
                entry.raw_length,
                if written > entry.raw_length {
                    format!("more than {}", entry.raw_length)
                } else {
                    written.to_string()
                }
            )));
        }
        Ok(written)
    }

    fn read_range(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let length = usize::try_from(length)
            .map_err(|_| BundleError::container("Section too large for this platform"))?;
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn section_in_range(offset: u64, length: u64, start: u64, end: u64) -> bool {
    offset >= start && offset.checked_add(length).is_some_and(|stop| stop <= end)
}

/// Summary of a completed unpack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnpackSummary {
    /// Files written, including `config.json`.
    pub files: usize,
    pub bytes_written: u64,
}

/// Extract a bundle into `out_dir`.
///
/// Entries are written before `config.json`, and the manifest lands via an
/// atomic rename, so a present manifest means the unpack completed.
pub fn unpack_bundle(bundle_path: &Path, out_dir: &Path) -> Result<UnpackSummary> {
    let mut reader = BundleReader::open(bundle_path)?;
    let config = reader.read_config()?;

    fs::create_dir_all(out_dir).map_err(|e| BundleError::io_with_path(e, out_dir))?;

    let entries = reader.entries().to_vec();
    let mut bytes_written = config.len() as u64;
    for entry in &entries {
        let dest = out_dir.join(safe_entry_path(&entry.name)?);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| BundleError::io_with_path(e, parent))?;
        }

        let file = File::create(&dest).map_err(|e| BundleError::io_with_path(e, &dest))?;
        let mut out = BufWriter::new(file);
        let written = reader.copy_entry(entry, &mut out)?;
        out.flush().map_err(|e| BundleError::io_with_path(e, &dest))?;
        bytes_written += written;
        debug!("Unpacked {} ({} bytes)", entry.name, written);
    }

    atomic_write(&out_dir.join(BundleConfig::MANIFEST_FILE_NAME), &config)?;

    info!(
        "Unpacked {} into {} ({} files)",
        bundle_path.display(),
        out_dir.display(),
        entries.len() + 1
    );
    Ok(UnpackSummary {
        files: entries.len() + 1,
        bytes_written,
    })
}

/// Header and TOC of a verified bundle.
#[derive(Debug, Clone, Serialize)]
pub struct BundleInfo {
    pub header: ContainerHeader,
    pub entries: Vec<TocEntry>,
}

/// Verify a bundle and list its contents without extracting it.
pub fn inspect_bundle(bundle_path: &Path) -> Result<BundleInfo> {
    let reader = BundleReader::open(bundle_path)?;
    Ok(BundleInfo {
        header: *reader.header(),
        entries: reader.entries().to_vec(),
    })
}

/// A file to store in a bundle under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub name: String,
    pub source: PathBuf,
}

/// Fail if `output` already exists and is one of `inputs`.
pub(crate) fn reject_input_overwrite<'p>(
    output: &Path,
    inputs: impl IntoIterator<Item = &'p Path>,
) -> Result<()> {
    let Ok(target) = fs::canonicalize(output) else {
        return Ok(());
    };
    for input in inputs {
        if fs::canonicalize(input).is_ok_and(|source| source == target) {
            return Err(BundleError::container(format!(
                "Output {} would overwrite input {}",
                output.display(),
                input.display()
            )));
        }
    }
    Ok(())
}

/// Write a bundle holding `config` and `entries` to `output`.
///
/// The bundle is assembled in a temp file next to `output` and renamed into
/// place once its footer is synced; on error `output` is left untouched.
pub fn write_bundle(
    output: &Path,
    config: &[u8],
    entries: &[PackEntry],
    level: i32,
) -> Result<Vec<TocEntry>> {
    let io = |e: std::io::Error| BundleError::io_with_path(e, output);
    let compress = |raw: &[u8], what: &str| {
        zstd::bulk::compress(raw, level)
            .map_err(|e| BundleError::container(format!("Zstd compress {} failed: {}", what, e)))
    };

    reject_input_overwrite(output, entries.iter().map(|entry| entry.source.as_path()))?;

    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(parent).map_err(|e| BundleError::io_with_path(e, parent))?;
    let mut out = BufWriter::new(temp);

    // Header is backfilled once the offsets are known.
    out.write_all(&[0u8; ContainerConfig::HEADER_LEN]).map_err(io)?;

    let comp_config = compress(config, BundleConfig::MANIFEST_FILE_NAME)?;
    let config_offset = ContainerConfig::HEADER_LEN as u64;
    out.write_all(&comp_config).map_err(io)?;

    let mut cursor = config_offset + comp_config.len() as u64;
    let mut toc = Vec::with_capacity(entries.len());
    for entry in entries {
        let raw = fs::read(&entry.source).map_err(|e| BundleError::io_with_path(e, &entry.source))?;
        let comp = compress(&raw, &entry.name)?;
        out.write_all(&comp).map_err(io)?;
        toc.push(TocEntry {
            name: entry.name.clone(),
            offset: cursor,
            comp_length: comp.len() as u64,
            raw_length: raw.len() as u64,
            crc32: crc32(&comp),
        });
        cursor += comp.len() as u64;
        debug!("Packed {} ({} -> {} bytes)", entry.name, raw.len(), comp.len());
    }

    let mut toc_bytes = Vec::new();
    for entry in &toc {
        entry.encode(&mut toc_bytes)?;
    }
    out.write_all(&toc_bytes).map_err(io)?;

    let header = ContainerHeader {
        version: ContainerConfig::VERSION,
        config_offset,
        config_length: comp_config.len() as u64,
        toc_offset: cursor,
    };
    out.seek(SeekFrom::Start(0)).map_err(io)?;
    out.write_all(&header.encode()).map_err(io)?;
    let mut temp = out.into_inner().map_err(|e| io(e.into_error()))?;

    temp.seek(SeekFrom::Start(0)).map_err(io)?;
    let mut crc = Crc::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = temp.read(&mut buf).map_err(io)?;
        if n == 0 {
            break;
        }
        crc.update(&buf[..n]);
    }
    temp.write_all(&crc.sum().to_le_bytes()).map_err(io)?;
    temp.as_file().sync_all().map_err(io)?;
    temp.persist(output).map_err(|e| io(e.error))?;

    Ok(toc)
}

/// [`BundleUnpacker`] for `QGENIE1` containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerUnpacker;

impl BundleUnpacker for ContainerUnpacker {
    fn unpack(&self, bundle_path: &Path, unpack_dir: &Path) -> std::result::Result<(), UnpackError> {
        unpack_bundle(bundle_path, unpack_dir)
            .map(|_| ())
            .map_err(|e| Box::new(e) as UnpackError)
    }
}
