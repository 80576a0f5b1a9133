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

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::trace;

/*
Chunk frame, little-endian, no padding:

    u64  sequence number
    u8   compressed flag (reserved, 0)
    u16  original size
    u16  chunk size
    u8[chunk size] payload
*/

const FRAME_HEADER_SIZE: usize = 13;

/// The largest payload a frame can carry, bounded by its 16-bit length field.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// The largest serialized transfer request accepted from the wire.
/// A sanity bound on the untrusted `u64` length prefix.
pub const MAX_REQUEST_SIZE: u64 = 16 * 1024 * 1024;

/// The transmitting end of the framer: drains sealed chunks from `input`
/// and writes one frame per chunk, bumping `chunks_sent` after each.
///
/// Exits once the upstream stage has set `input_done` and the queue is
/// drained, or as soon as the session aborts.
pub fn send_chunks<W: Write>(
    stream: &mut W,
    input: &BoundedQueue<Chunk>,
    input_done: &AtomicBool,
    chunks_sent: &AtomicU32,
    ctx: &WorkerContext,
) -> Result<(), TransferError> {
    while let Some(chunk) = pop_abortable(input, input_done, ctx) {
        write_frame(stream, &chunk)?;
        trace!("sent chunk {} ({} bytes)", chunk.seq(), chunk.len());
        chunks_sent.fetch_add(1, Ordering::SeqCst);
    }

    stream.flush().map_err(TransferError::Disconnected)?;
    Ok(())
}

/// The receiving end of the framer: reads exactly `num_chunks` frames in
/// stream order and pushes them to `output`, then sets `output_done`.
pub fn recv_chunks<R: Read>(
    stream: &mut R,
    output: &BoundedQueue<Chunk>,
    output_done: &AtomicBool,
    num_chunks: u32,
    ctx: &WorkerContext,
) -> Result<(), TransferError> {
    for _ in 0..num_chunks {
        if ctx.should_abort() {
            return Ok(());
        }

        let chunk = read_frame(stream)?;
        trace!("received chunk {} ({} bytes)", chunk.seq(), chunk.len());
        if !push_abortable(output, ctx, chunk) {
            return Ok(());
        }
    }

    output_done.store(true, Ordering::SeqCst);
    Ok(())
}

fn write_frame<W: Write>(stream: &mut W, chunk: &Chunk) -> Result<(), TransferError> {
    if chunk.len() > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::ChunkTooLarge(chunk.len()).into());
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + chunk.len());
    frame.extend_from_slice(&chunk.seq().to_le_bytes());
    frame.push(chunk.compressed() as u8);
    frame.extend_from_slice(&chunk.original_size().to_le_bytes());
    frame.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
    frame.extend_from_slice(chunk.payload());

    stream.write_all(&frame).map_err(TransferError::Disconnected)
}

fn read_frame<R: Read>(stream: &mut R) -> Result<Chunk, TransferError> {
    let mut header = [0; FRAME_HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .map_err(TransferError::Disconnected)?;

    let mut seq = [0; 8];
    seq.copy_from_slice(&header[0..8]);
    let seq = u64::from_le_bytes(seq);

    if header[8] != 0 {
        return Err(ProtocolError::CompressedChunk.into());
    }

    let mut original_size = [0; 2];
    original_size.copy_from_slice(&header[9..11]);
    let original_size = u16::from_le_bytes(original_size);

    let mut chunk_size = [0; 2];
    chunk_size.copy_from_slice(&header[11..13]);
    let chunk_size = u16::from_le_bytes(chunk_size);

    let mut payload = vec![0; usize::from(chunk_size)];
    stream
        .read_exact(&mut payload)
        .map_err(TransferError::Disconnected)?;

    Ok(Chunk::sealed(seq, payload, original_size))
}

/// Writes the length-prefixed transfer request.
pub fn send_request<W: Write>(
    stream: &mut W,
    request: &TransferRequest,
) -> Result<(), TransferError> {
    let body = request.serialize();

    stream
        .write_all(&(body.len() as u64).to_le_bytes())
        .map_err(TransferError::Disconnected)?;
    stream
        .write_all(&body)
        .map_err(TransferError::Disconnected)?;

    Ok(())
}

/// Reads and validates a length-prefixed transfer request.
pub fn recv_request<R: Read>(stream: &mut R) -> Result<TransferRequest, TransferError> {
    let mut length = [0; 8];
    stream
        .read_exact(&mut length)
        .map_err(TransferError::Disconnected)?;
    let length = u64::from_le_bytes(length);

    if length == 0 || length > MAX_REQUEST_SIZE {
        return Err(ProtocolError::RequestTooLarge(length).into());
    }

    let mut body = vec![0; length as usize];
    stream
        .read_exact(&mut body)
        .map_err(TransferError::Disconnected)?;

    Ok(TransferRequest::deserialize(&body)?)
}
