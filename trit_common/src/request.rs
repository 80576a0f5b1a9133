// trit_common is the main trit library implementing the transfer core shared logic.
// Copyright (C) 2025  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::{ProtocolError, TransferError};

use std::cmp;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// The maximum plaintext chunk size in bytes. The negotiated chunk size is
/// the total transfer size capped by this value.
pub const MAX_CHUNK_SIZE: u32 = 4096;

/// Metadata of a single file within a transfer, as carried on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileInfo {
    /// Path relative to the working directory, POSIX separators,
    /// at most 65535 bytes of UTF-8.
    pub relative_path: String,
    /// File size in bytes at the time the transfer was proposed.
    pub size: u64,
}

impl FileInfo {
    /// Resolves the wire path against a local working directory.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }
}

/// A `TransferRequest` is the self-describing negotiation header the sender
/// transmits before any chunk: the file list and the chunk geometry the
/// pipeline stages on both sides are configured with.
///
/// Constructed on the sender, serialized, deserialized on the receiver and
/// immutable from then on. File order is significant and preserved by the
/// wire format; reader and writer iterate it identically.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferRequest {
    num_files: u32,
    transfer_size: u64,
    chunk_size: u32,
    final_chunk_size: u32,
    num_chunks: u32,
    files: Vec<FileInfo>,
}

impl TransferRequest {
    /// Builds a request for `paths`, which must be regular files beneath
    /// `root`. Sizes are taken from the filesystem; the empty set and an
    /// all-empty transfer are rejected.
    pub fn from_files(root: &Path, paths: &[PathBuf]) -> Result<Self, TransferError> {
        if paths.is_empty() {
            return Err(TransferError::Precondition(
                "cannot build a transfer request from an empty file set",
            ));
        }

        let mut files = Vec::with_capacity(paths.len());
        let mut transfer_size: u64 = 0;

        for path in paths {
            let metadata = fs::metadata(path).map_err(|e| TransferError::OpenFailed {
                path: path.clone(),
                source: e,
            })?;

            let relative = path.strip_prefix(root).map_err(|_| {
                TransferError::Precondition("staged file is outside the working directory")
            })?;
            let relative_path = posix_path(relative).ok_or(TransferError::Precondition(
                "staged file path is not a plain relative UTF-8 path",
            ))?;
            if relative_path.len() > u16::MAX as usize {
                return Err(TransferError::Precondition("staged file path is too long"));
            }

            transfer_size += metadata.len();
            files.push(FileInfo {
                relative_path,
                size: metadata.len(),
            });
        }

        if transfer_size == 0 {
            return Err(TransferError::Precondition(
                "cannot build a transfer request of 0 bytes",
            ));
        }

        // A transfer smaller than the cap fits exactly one chunk.
        let chunk_size = cmp::min(transfer_size, u64::from(MAX_CHUNK_SIZE)) as u32;
        let final_chunk_size = (transfer_size % u64::from(chunk_size)) as u32;
        let num_chunks = transfer_size.div_ceil(u64::from(chunk_size)) as u32;

        Ok(Self {
            num_files: files.len() as u32,
            transfer_size,
            chunk_size,
            final_chunk_size,
            num_chunks,
            files,
        })
    }

    pub fn num_files(&self) -> u32 {
        self.num_files
    }

    /// Total transfer size in bytes, the sum of all file sizes.
    pub fn transfer_size(&self) -> u64 {
        self.transfer_size
    }

    /// Size of every chunk except possibly the last.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Size of the last chunk, or 0 if the transfer divides evenly
    /// (the last chunk is then a full `chunk_size` bytes).
    pub fn final_chunk_size(&self) -> u32 {
        self.final_chunk_size
    }

    pub fn num_chunks(&self) -> u32 {
        self.num_chunks
    }

    /// The files of the transfer in stream order.
    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    /// Serializes the request into the little-endian wire layout:
    ///
    /// ```text
    /// u32  num_files
    /// u64  transfer_size
    /// u32  chunk_size
    /// u32  final_chunk_size
    /// u32  num_chunks
    /// repeated num_files times:
    ///   u16          path_length
    ///   u8[length]   path (UTF-8, POSIX separators)
    ///   u64          size
    /// ```
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.num_files.to_le_bytes());
        buf.extend_from_slice(&self.transfer_size.to_le_bytes());
        buf.extend_from_slice(&self.chunk_size.to_le_bytes());
        buf.extend_from_slice(&self.final_chunk_size.to_le_bytes());
        buf.extend_from_slice(&self.num_chunks.to_le_bytes());

        for file in &self.files {
            buf.extend_from_slice(&(file.relative_path.len() as u16).to_le_bytes());
            buf.extend_from_slice(file.relative_path.as_bytes());
            buf.extend_from_slice(&file.size.to_le_bytes());
        }

        buf
    }

    /// Deserializes and validates a request. Truncation, malformed paths and
    /// fixed fields that contradict the recomputed invariants are rejected.
    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = buf;

        let num_files = read_u32(&mut r)?;
        let transfer_size = read_u64(&mut r)?;
        let chunk_size = read_u32(&mut r)?;
        let final_chunk_size = read_u32(&mut r)?;
        let num_chunks = read_u32(&mut r)?;

        let mut files = Vec::new();
        for _ in 0..num_files {
            let path_length = read_u16(&mut r)? as usize;
            if path_length == 0 {
                return Err(ProtocolError::InvalidPath(String::new()));
            }

            let raw = take(&mut r, path_length)?;
            let relative_path = std::str::from_utf8(raw)
                .map_err(|_| ProtocolError::InvalidPath(String::from_utf8_lossy(raw).into_owned()))?
                .to_owned();
            validate_wire_path(&relative_path)?;

            let size = read_u64(&mut r)?;
            files.push(FileInfo {
                relative_path,
                size,
            });
        }

        if !r.is_empty() {
            return Err(ProtocolError::Inconsistent("trailing bytes after file list"));
        }
        if num_files == 0 {
            return Err(ProtocolError::Inconsistent("empty file list"));
        }
        if transfer_size == 0 {
            return Err(ProtocolError::Inconsistent("transfer size of 0"));
        }
        let total = files
            .iter()
            .try_fold(0u64, |acc, file| acc.checked_add(file.size));
        if total != Some(transfer_size) {
            return Err(ProtocolError::Inconsistent(
                "transfer size does not match the file list",
            ));
        }
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::Inconsistent("chunk size out of range"));
        }
        if u64::from(final_chunk_size) != transfer_size % u64::from(chunk_size) {
            return Err(ProtocolError::Inconsistent("final chunk size mismatch"));
        }
        if u64::from(num_chunks) != transfer_size.div_ceil(u64::from(chunk_size)) {
            return Err(ProtocolError::Inconsistent("chunk count mismatch"));
        }

        Ok(Self {
            num_files,
            transfer_size,
            chunk_size,
            final_chunk_size,
            num_chunks,
            files,
        })
    }
}

impl fmt::Display for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Incoming transfer:")?;
        for file in &self.files {
            writeln!(f, "  {} ({})", file.relative_path, format_size(file.size))?;
        }
        write!(
            f,
            "Total {} file(s), {} in {} chunk(s)",
            self.num_files,
            format_size(self.transfer_size),
            self.num_chunks
        )
    }
}

/// Formats a byte count with a 1024-based unit suffix.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

// Joins the normal components of `path` with forward slashes.
// Refuses prefixes, parent references and non-UTF-8 names.
fn posix_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn validate_wire_path(path: &str) -> Result<(), ProtocolError> {
    if path.starts_with('/') || path.contains('\\') {
        return Err(ProtocolError::InvalidPath(path.to_owned()));
    }

    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(ProtocolError::InvalidPath(path.to_owned()));
        }
    }

    Ok(())
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProtocolError> {
    if buf.len() < n {
        return Err(ProtocolError::Truncated);
    }

    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn read_u16(buf: &mut &[u8]) -> Result<u16, ProtocolError> {
    let mut bytes = [0; 2];
    bytes.copy_from_slice(take(buf, 2)?);
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, ProtocolError> {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(take(buf, 4)?);
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(buf: &mut &[u8]) -> Result<u64, ProtocolError> {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(take(buf, 8)?);
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;
    use std::io::Write;

    use tempfile::tempdir;

    fn write_file(root: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        File::create(&path).unwrap().write_all(contents).unwrap();
        path
    }

    #[test]
    fn single_small_file_is_one_exact_chunk() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "hello.txt", b"hello\nworld");

        let request = TransferRequest::from_files(dir.path(), &[path]).unwrap();
        assert_eq!(request.transfer_size(), 11);
        assert_eq!(request.chunk_size(), 11);
        assert_eq!(request.final_chunk_size(), 0);
        assert_eq!(request.num_chunks(), 1);
    }

    #[test]
    fn two_files_spanning_a_chunk_boundary() {
        let dir = tempdir().unwrap();
        let a = write_file(dir.path(), "a.bin", &[1; 3000]);
        let b = write_file(dir.path(), "b.bin", &[2; 2000]);

        let request = TransferRequest::from_files(dir.path(), &[a, b]).unwrap();
        assert_eq!(request.transfer_size(), 5000);
        assert_eq!(request.chunk_size(), 4096);
        assert_eq!(request.final_chunk_size(), 904);
        assert_eq!(request.num_chunks(), 2);
    }

    #[test]
    fn rejects_empty_set_and_empty_transfer() {
        let dir = tempdir().unwrap();
        assert!(TransferRequest::from_files(dir.path(), &[]).is_err());

        let empty = write_file(dir.path(), "empty", b"");
        assert!(TransferRequest::from_files(dir.path(), &[empty]).is_err());
    }

    #[test]
    fn rejects_files_outside_the_root() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let path = write_file(outside.path(), "x", b"x");

        assert!(matches!(
            TransferRequest::from_files(dir.path(), &[path]),
            Err(TransferError::Precondition(_))
        ));
    }

    #[test]
    fn codec_roundtrip_is_identity() {
        let dir = tempdir().unwrap();
        let a = write_file(dir.path(), "nested/dir/a.txt", &[1; 5000]);
        let b = write_file(dir.path(), "b.txt", &[2; 123]);

        let request = TransferRequest::from_files(dir.path(), &[a, b]).unwrap();
        let decoded = TransferRequest::deserialize(&request.serialize()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.files()[0].relative_path, "nested/dir/a.txt");
    }

    #[test]
    fn rejects_truncation_at_every_boundary() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a", &[1; 10]);
        let request = TransferRequest::from_files(dir.path(), &[path]).unwrap();
        let bytes = request.serialize();

        for len in 0..bytes.len() {
            assert!(TransferRequest::deserialize(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "ok", &[1; 10]);
        let request = TransferRequest::from_files(dir.path(), &[path]).unwrap();

        for bad in ["/abs", "../escape", "a//b", "a/./b", "a/../b"] {
            let mut tampered = request.clone();
            tampered.files[0].relative_path = bad.to_owned();
            let err = TransferRequest::deserialize(&tampered.serialize()).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidPath(_)), "{bad}");
        }
    }

    #[test]
    fn rejects_inconsistent_fixed_fields() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a", &[1; 5000]);
        let request = TransferRequest::from_files(dir.path(), &[path]).unwrap();

        let mut wrong_total = request.clone();
        wrong_total.transfer_size += 1;
        assert!(TransferRequest::deserialize(&wrong_total.serialize()).is_err());

        let mut wrong_final = request.clone();
        wrong_final.final_chunk_size += 1;
        assert!(TransferRequest::deserialize(&wrong_final.serialize()).is_err());

        let mut wrong_count = request.clone();
        wrong_count.num_chunks += 1;
        assert!(TransferRequest::deserialize(&wrong_count.serialize()).is_err());

        let mut huge_chunk = request;
        huge_chunk.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(TransferRequest::deserialize(&huge_chunk.serialize()).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a", &[1; 10]);
        let request = TransferRequest::from_files(dir.path(), &[path]).unwrap();

        let mut bytes = request.serialize();
        bytes.push(0);
        assert!(matches!(
            TransferRequest::deserialize(&bytes),
            Err(ProtocolError::Inconsistent(_))
        ));
    }

    #[test]
    fn formats_sizes_with_binary_units() {
        assert_eq!(format_size(11), "11 B");
        assert_eq!(format_size(5000), "4.9 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }
}
