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

use crate::chunk::Chunk;
use crate::queue::BoundedQueue;
use crate::request::TransferRequest;
use crate::worker::{pop_abortable, push_abortable, WorkerContext};
use crate::{ProtocolError, TransferError};

use std::cmp;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::debug;

/// Reads the files of `request` (relative to `root`) as one contiguous byte
/// stream and repacks it into fixed-size chunks pushed to `out_queue`.
///
/// Every chunk is exactly `chunk_size` bytes except the last, which is
/// `final_chunk_size` bytes when that is non-zero. A file may span several
/// chunks and several small files may share one; chunk boundaries are
/// independent of file boundaries.
///
/// Sets `done` after the last push so downstream stages can drain and exit.
pub fn read_files_into_chunks(
    request: &TransferRequest,
    root: &Path,
    out_queue: &BoundedQueue<Chunk>,
    done: &AtomicBool,
    ctx: &WorkerContext,
) -> Result<(), TransferError> {
    let mut seq: u64 = 1;
    let mut buffer = vec![0; request.chunk_size() as usize];
    let mut filled = 0;

    for info in request.files() {
        let path = info.local_path(root);

        let metadata = fs::metadata(&path).map_err(|e| TransferError::OpenFailed {
            path: path.clone(),
            source: e,
        })?;
        if metadata.len() != info.size {
            return Err(TransferError::SizeMismatch {
                path,
                expected: info.size,
                actual: metadata.len(),
            });
        }

        let mut file = File::open(&path).map_err(|e| TransferError::OpenFailed {
            path: path.clone(),
            source: e,
        })?;
        debug!("chunking {} ({} bytes)", path.display(), info.size);

        let mut remaining = info.size;
        while remaining > 0 {
            if ctx.should_abort() {
                return Ok(());
            }

            let want = cmp::min(remaining, (buffer.len() - filled) as u64) as usize;
            file.read_exact(&mut buffer[filled..filled + want])
                .map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => TransferError::ShortRead {
                        path: path.clone(),
                        expected: info.size,
                    },
                    _ => TransferError::ReadFailed {
                        path: path.clone(),
                        source: e,
                    },
                })?;
            filled += want;
            remaining -= want as u64;

            if filled == buffer.len() {
                let next_size = next_chunk_size(request, seq + 1);
                let payload = std::mem::replace(&mut buffer, vec![0; next_size]);
                if !push_abortable(out_queue, ctx, Chunk::plain(seq, payload)) {
                    return Ok(());
                }
                seq += 1;
                filled = 0;
            }
        }
    }

    done.store(true, Ordering::SeqCst);
    Ok(())
}

// Size of the chunk with sequence number `seq`: the negotiated chunk size,
// except a shorter final chunk when the transfer does not divide evenly.
fn next_chunk_size(request: &TransferRequest, seq: u64) -> usize {
    if seq == u64::from(request.num_chunks()) && request.final_chunk_size() > 0 {
        request.final_chunk_size() as usize
    } else {
        request.chunk_size() as usize
    }
}

/// Writes incoming plaintext chunks into the files of `request` (relative to
/// `root`), in request order, creating missing parent directories.
///
/// A cursor runs across chunks and files: each file consumes exactly its
/// announced size from the stream, refilling from `in_queue` whenever the
/// current chunk is exhausted. `chunks_written` is bumped after a chunk has
/// been fully consumed, which feeds the progress display.
pub fn write_files_from_chunks(
    request: &TransferRequest,
    root: &Path,
    in_queue: &BoundedQueue<Chunk>,
    input_done: &AtomicBool,
    chunks_written: &AtomicU32,
    ctx: &WorkerContext,
) -> Result<(), TransferError> {
    let mut chunk: Option<Chunk> = None;
    let mut offset = 0;
    let mut fetched: u32 = 0;

    for info in request.files() {
        let path = info.local_path(root);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| TransferError::OpenFailed {
                    path: path.clone(),
                    source: e,
                })?;
            }
        }

        let mut file = File::create(&path).map_err(|e| TransferError::OpenFailed {
            path: path.clone(),
            source: e,
        })?;
        debug!("writing {} ({} bytes)", path.display(), info.size);

        let mut remaining = info.size;
        while remaining > 0 {
            if ctx.should_abort() {
                return Ok(());
            }

            let exhausted = match &chunk {
                Some(c) => offset == c.len(),
                None => true,
            };
            if exhausted {
                if chunk.take().is_some() {
                    chunks_written.fetch_add(1, Ordering::SeqCst);
                }

                match pop_abortable(in_queue, input_done, ctx) {
                    Some(next) => {
                        fetched += 1;
                        // A payload that deviates from the negotiated
                        // geometry would desynchronize the cursor and leave
                        // upstream stages stuck on a full queue.
                        let expected = next_chunk_size(request, u64::from(fetched)) as u32;
                        if next.len() != expected as usize {
                            return Err(ProtocolError::BadChunkLength {
                                seq: next.seq(),
                                expected,
                                actual: next.len(),
                            }
                            .into());
                        }
                        chunk = Some(next);
                        offset = 0;
                    }
                    None if ctx.should_abort() => return Ok(()),
                    None => return Err(ProtocolError::MissingChunks.into()),
                }
            }

            if let Some(current) = &chunk {
                let len = cmp::min(remaining, (current.len() - offset) as u64) as usize;
                file.write_all(&current.payload()[offset..offset + len])
                    .map_err(|e| TransferError::WriteFailed {
                        path: path.clone(),
                        source: e,
                    })?;
                offset += len;
                remaining -= len as u64;
            }
        }
    }

    // The chunk the last file ended on is fully consumed too.
    if chunk.take().is_some() {
        chunks_written.fetch_add(1, Ordering::SeqCst);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use tempfile::tempdir;

    fn write_file(root: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn drain(queue: &BoundedQueue<Chunk>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = queue.try_pop() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn repacks_files_across_chunk_boundaries() {
        let dir = tempdir().unwrap();
        let a: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let b: Vec<u8> = (0..2000u32).map(|i| (i * 7) as u8).collect();
        let path_a = write_file(dir.path(), "a.bin", &a);
        let path_b = write_file(dir.path(), "b.bin", &b);

        let request = TransferRequest::from_files(dir.path(), &[path_a, path_b]).unwrap();
        let queue = BoundedQueue::new(50).unwrap();
        let done = AtomicBool::new(false);
        let ctx = WorkerContext::new();

        read_files_into_chunks(&request, dir.path(), &queue, &done, &ctx).unwrap();
        assert!(done.load(Ordering::SeqCst));

        let chunks = drain(&queue);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].seq(), 1);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].seq(), 2);
        assert_eq!(chunks[1].len(), 904);

        // Chunk 1 ends with the first 1096 bytes of the second file.
        assert_eq!(&chunks[0].payload()[..3000], &a[..]);
        assert_eq!(&chunks[0].payload()[3000..], &b[..1096]);
        assert_eq!(chunks[1].payload(), &b[1096..]);
    }

    #[test]
    fn exact_multiple_produces_full_final_chunk() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.bin", &[9; 8192]);

        let request = TransferRequest::from_files(dir.path(), &[path]).unwrap();
        assert_eq!(request.final_chunk_size(), 0);

        let queue = BoundedQueue::new(50).unwrap();
        let done = AtomicBool::new(false);
        let ctx = WorkerContext::new();
        read_files_into_chunks(&request, dir.path(), &queue, &done, &ctx).unwrap();

        let chunks = drain(&queue);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 4096);
    }

    #[test]
    fn detects_size_changes_since_staging() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.bin", &[1; 100]);

        let request = TransferRequest::from_files(dir.path(), &[path.clone()]).unwrap();
        fs::write(&path, [1; 99]).unwrap();

        let queue = BoundedQueue::new(50).unwrap();
        let done = AtomicBool::new(false);
        let ctx = WorkerContext::new();
        let err = read_files_into_chunks(&request, dir.path(), &queue, &done, &ctx).unwrap_err();
        assert!(matches!(err, TransferError::SizeMismatch { .. }));
    }

    #[test]
    fn writer_reconstructs_files_from_chunks() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let a: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let b: Vec<u8> = (0..2000u32).map(|i| (i * 3) as u8).collect();
        let path_a = write_file(src.path(), "nested/a.bin", &a);
        let path_b = write_file(src.path(), "b.bin", &b);

        let request = TransferRequest::from_files(src.path(), &[path_a, path_b]).unwrap();
        let queue = BoundedQueue::new(50).unwrap();
        let done = AtomicBool::new(false);
        let ctx = WorkerContext::new();

        read_files_into_chunks(&request, src.path(), &queue, &done, &ctx).unwrap();

        let chunks_written = AtomicU32::new(0);
        write_files_from_chunks(&request, dst.path(), &queue, &done, &chunks_written, &ctx)
            .unwrap();

        assert_eq!(chunks_written.load(Ordering::SeqCst), request.num_chunks());
        assert_eq!(fs::read(dst.path().join("nested/a.bin")).unwrap(), a);
        assert_eq!(fs::read(dst.path().join("b.bin")).unwrap(), b);
    }

    #[test]
    fn writer_rejects_misshapen_chunks() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let path = write_file(src.path(), "a.bin", &[5; 5000]);

        let request = TransferRequest::from_files(src.path(), &[path]).unwrap();
        let queue = BoundedQueue::new(50).unwrap();
        let done = AtomicBool::new(false);
        let ctx = WorkerContext::new();

        queue.push(Chunk::plain(1, vec![5; 4000]));
        done.store(true, Ordering::SeqCst);

        let chunks_written = AtomicU32::new(0);
        let err =
            write_files_from_chunks(&request, dst.path(), &queue, &done, &chunks_written, &ctx)
                .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::BadChunkLength { seq: 1, .. })
        ));
    }

    #[test]
    fn writer_reports_missing_chunks() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let path = write_file(src.path(), "a.bin", &[5; 5000]);

        let request = TransferRequest::from_files(src.path(), &[path]).unwrap();
        let queue = BoundedQueue::new(50).unwrap();
        let done = AtomicBool::new(false);
        let ctx = WorkerContext::new();

        // Only the first of two chunks arrives before the stream ends.
        queue.push(Chunk::plain(1, vec![5; 4096]));
        done.store(true, Ordering::SeqCst);

        let chunks_written = AtomicU32::new(0);
        let err =
            write_files_from_chunks(&request, dst.path(), &queue, &done, &chunks_written, &ctx)
                .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::MissingChunks)
        ));
    }
}
