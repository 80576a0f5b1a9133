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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A `CryptoError` indicates a failure of a cryptographic primitive.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Password-based key derivation using Argon2id failed.
    #[error("Password-based key derivation using Argon2id failed: {0}")]
    Kdf(argon2::Error),
    /// The encryption stream rejected an input it should always accept.
    ///
    /// This variant should never actually happen:
    /// The streaming cipher only fails on counter exhaustion,
    /// far beyond the number of chunks a single transfer can carry.
    #[error("Encryption stream failure")]
    Stream,
    /// Authenticated decryption failed: the data was tampered with,
    /// produced under a different key, or presented out of order.
    #[error("Message authentication failed")]
    Auth,
    /// A cipher output did not have the length the construction guarantees.
    #[error("Unexpected cipher output length: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    /// The stream was used again after its final chunk was processed.
    #[error("Cipher stream is already finalized")]
    Finalized,
}

/// A `ProtocolError` indicates a violation of the transfer wire format.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The serialized transfer request ended before all announced fields.
    #[error("Truncated transfer request")]
    Truncated,
    /// A file path in the transfer request is empty, absolute,
    /// escapes the working directory or is not valid UTF-8.
    #[error("Invalid file path in transfer request: \"{0}\"")]
    InvalidPath(String),
    /// The fixed fields of the transfer request contradict each other.
    #[error("Inconsistent transfer request: {0}")]
    Inconsistent(&'static str),
    /// A chunk carried a sequence number outside the negotiated range.
    #[error("Invalid chunk sequence number {seq}, expected 1..={num_chunks}")]
    BadSequence { seq: u64, num_chunks: u32 },
    /// A chunk payload does not fit the 16-bit length field of the frame.
    #[error("Chunk of {0} bytes exceeds the maximum frame payload of 65535 bytes")]
    ChunkTooLarge(usize),
    /// A chunk payload does not have the size the transfer geometry assigns it.
    #[error("Chunk {seq} carries {actual} bytes, expected {expected}")]
    BadChunkLength {
        seq: u64,
        expected: u32,
        actual: usize,
    },
    /// The chunk stream ended although file data was still outstanding.
    #[error("Chunk stream ended before the transfer was complete")]
    MissingChunks,
    /// The length prefix of a transfer request is zero or implausibly large.
    #[error("Transfer request length of {0} bytes is outside the accepted range")]
    RequestTooLarge(u64),
    /// The reserved compression flag was set; compressed chunks are not supported.
    #[error("Chunk frame carries the reserved compression flag")]
    CompressedChunk,
}

/// A `TransferError` is the session-level error shared by all pipeline workers
/// of a single transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A source or destination file could not be opened or created.
    #[error("Cannot open {path}: {source}", path = .path.display())]
    OpenFailed { path: PathBuf, source: io::Error },
    /// Reading from a source file failed.
    #[error("Cannot read {path}: {source}", path = .path.display())]
    ReadFailed { path: PathBuf, source: io::Error },
    /// Writing to a destination file failed.
    #[error("Cannot write {path}: {source}", path = .path.display())]
    WriteFailed { path: PathBuf, source: io::Error },
    /// A source file ended before the number of bytes it was staged with.
    #[error("File {path} ended before the expected {expected} bytes", path = .path.display())]
    ShortRead { path: PathBuf, expected: u64 },
    /// A source file changed size between staging and transfer.
    #[error(
        "Size of {path} changed since staging: expected {expected} bytes, found {actual}",
        path = .path.display()
    )]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The TCP connection or listener could not be established.
    #[error("Connection failed: {0}")]
    ConnectFailed(io::Error),
    /// The TCP connection was lost mid-session.
    #[error("Connection lost: {0}")]
    Disconnected(io::Error),

    /// The peer violated the wire protocol.
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    /// A cryptographic operation failed.
    #[error("{0}")]
    Crypto(#[from] CryptoError),

    /// The receiver declined the transfer request.
    /// Not an abnormal condition; sessions end cleanly on it.
    #[error("Transfer was declined by the receiver")]
    Declined,
    /// A caller-supplied precondition was violated.
    #[error("{0}")]
    Precondition(&'static str),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
