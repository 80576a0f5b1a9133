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

/// A `Chunk` carries one slice of the transfer byte stream through the
/// pipeline, tagged with its 1-based position.
///
/// Chunks are created once, moved from stage to stage and dropped by their
/// final consumer. The type is deliberately not `Clone`.
#[derive(Debug)]
pub struct Chunk {
    seq: u64,
    payload: Vec<u8>,
    original_size: u16,
    compressed: bool,
}

impl Chunk {
    /// Wraps a plaintext payload. The original size is the payload size.
    pub fn plain(seq: u64, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= u16::MAX as usize);

        Self {
            seq,
            original_size: payload.len() as u16,
            payload,
            compressed: false,
        }
    }

    /// Wraps a ciphertext payload, carrying the plaintext size it was
    /// produced from.
    pub fn sealed(seq: u64, payload: Vec<u8>, original_size: u16) -> Self {
        Self {
            seq,
            payload,
            original_size,
            compressed: false,
        }
    }

    /// Returns the 1-based position of the chunk in the transfer.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns the payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Reports whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns the payload size before encryption or compression.
    pub fn original_size(&self) -> u16 {
        self.original_size
    }

    /// Reports whether the payload is compressed. Reserved; always false.
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    /// Consumes the chunk, yielding its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
