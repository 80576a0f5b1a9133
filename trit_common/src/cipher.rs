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
use crate::crypto::{Decryptor, Encryptor};
use crate::queue::BoundedQueue;
use crate::worker::{pop_abortable, push_abortable, WorkerContext};
use crate::{CryptoError, ProtocolError, TransferError};

use std::sync::atomic::{AtomicBool, Ordering};

/// The encrypting cipher stage of the transmit pipeline.
///
/// Runs on a single thread and processes chunks strictly in arrival order;
/// the stream cipher binds each chunk to its position, so reordering here
/// would make the receiver fail authentication.
pub struct ChunkEncryptor {
    encryptor: Encryptor,
    num_chunks: u32,
}

impl ChunkEncryptor {
    pub fn new(encryptor: Encryptor, num_chunks: u32) -> Self {
        Self {
            encryptor,
            num_chunks,
        }
    }

    /// Pumps plaintext chunks from `input` into sealed chunks on `output`
    /// until the upstream stage is done and the input queue is drained.
    pub fn run(
        mut self,
        input: &BoundedQueue<Chunk>,
        input_done: &AtomicBool,
        output: &BoundedQueue<Chunk>,
        output_done: &AtomicBool,
        ctx: &WorkerContext,
    ) -> Result<(), TransferError> {
        process_chunks(input, input_done, output, output_done, ctx, |chunk| {
            self.encrypt_chunk(chunk)
        })
    }

    fn encrypt_chunk(&mut self, chunk: Chunk) -> Result<Chunk, TransferError> {
        check_sequence(chunk.seq(), self.num_chunks)?;

        let seq = chunk.seq();
        let original_size = chunk.original_size();
        let is_final = seq == u64::from(self.num_chunks);

        let sealed = self.encryptor.encrypt(chunk.payload(), is_final)?;
        Ok(Chunk::sealed(seq, sealed, original_size))
    }
}

/// The decrypting cipher stage of the receive pipeline.
pub struct ChunkDecryptor {
    decryptor: Decryptor,
    num_chunks: u32,
}

impl ChunkDecryptor {
    pub fn new(decryptor: Decryptor, num_chunks: u32) -> Self {
        Self {
            decryptor,
            num_chunks,
        }
    }

    /// Pumps sealed chunks from `input` into plaintext chunks on `output`
    /// until the upstream stage is done and the input queue is drained.
    pub fn run(
        mut self,
        input: &BoundedQueue<Chunk>,
        input_done: &AtomicBool,
        output: &BoundedQueue<Chunk>,
        output_done: &AtomicBool,
        ctx: &WorkerContext,
    ) -> Result<(), TransferError> {
        process_chunks(input, input_done, output, output_done, ctx, |chunk| {
            self.decrypt_chunk(chunk)
        })
    }

    fn decrypt_chunk(&mut self, chunk: Chunk) -> Result<Chunk, TransferError> {
        check_sequence(chunk.seq(), self.num_chunks)?;

        let seq = chunk.seq();
        let original_size = chunk.original_size();
        // The flag choice is authenticated; a sender that disagreed on which
        // chunk is last fails the MAC check inside `decrypt`.
        let is_final = seq == u64::from(self.num_chunks);

        let plain = self.decryptor.decrypt(chunk.payload(), is_final)?;
        if plain.len() != usize::from(original_size) {
            return Err(CryptoError::LengthMismatch {
                expected: usize::from(original_size),
                actual: plain.len(),
            }
            .into());
        }

        Ok(Chunk::plain(seq, plain))
    }
}

fn check_sequence(seq: u64, num_chunks: u32) -> Result<(), ProtocolError> {
    if seq == 0 || seq > u64::from(num_chunks) {
        return Err(ProtocolError::BadSequence { seq, num_chunks });
    }

    Ok(())
}

// Shared pump of both stage variants: drain the input queue, transform,
// forward, then mark the output stream complete.
fn process_chunks(
    input: &BoundedQueue<Chunk>,
    input_done: &AtomicBool,
    output: &BoundedQueue<Chunk>,
    output_done: &AtomicBool,
    ctx: &WorkerContext,
    mut transform: impl FnMut(Chunk) -> Result<Chunk, TransferError>,
) -> Result<(), TransferError> {
    while let Some(chunk) = pop_abortable(input, input_done, ctx) {
        let out = transform(chunk)?;
        if !push_abortable(output, ctx, out) {
            return Ok(());
        }
    }

    if !ctx.should_abort() {
        output_done.store(true, Ordering::SeqCst);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::crypto::{Key, ABYTES, KEY_SIZE};

    fn test_key() -> Key {
        Key::from_bytes([0x24; KEY_SIZE])
    }

    fn run_stage(
        chunks: Vec<Chunk>,
        run: impl FnOnce(
            &BoundedQueue<Chunk>,
            &AtomicBool,
            &BoundedQueue<Chunk>,
            &AtomicBool,
            &WorkerContext,
        ) -> Result<(), TransferError>,
    ) -> Result<Vec<Chunk>, TransferError> {
        let input = BoundedQueue::new(50).unwrap();
        let output = BoundedQueue::new(50).unwrap();
        let input_done = AtomicBool::new(false);
        let output_done = AtomicBool::new(false);
        let ctx = WorkerContext::new();

        for chunk in chunks {
            input.push(chunk);
        }
        input_done.store(true, Ordering::SeqCst);

        run(&input, &input_done, &output, &output_done, &ctx)?;
        assert!(output_done.load(Ordering::SeqCst));

        let mut out = Vec::new();
        while let Some(chunk) = output.try_pop() {
            out.push(chunk);
        }
        Ok(out)
    }

    #[test]
    fn encrypt_then_decrypt_restores_payloads() {
        let key = test_key();
        let encryptor = Encryptor::new(&key);
        let header = encryptor.header().clone();

        let plain = vec![
            Chunk::plain(1, vec![1; 4096]),
            Chunk::plain(2, vec![2; 4096]),
            Chunk::plain(3, vec![3; 904]),
        ];

        let sealed = run_stage(plain, |i, id, o, od, ctx| {
            ChunkEncryptor::new(encryptor, 3).run(i, id, o, od, ctx)
        })
        .unwrap();

        assert_eq!(sealed.len(), 3);
        for (i, chunk) in sealed.iter().enumerate() {
            assert_eq!(chunk.seq(), i as u64 + 1);
            assert_eq!(chunk.len(), usize::from(chunk.original_size()) + ABYTES);
        }

        let decryptor = Decryptor::new(&key, &header);
        let restored = run_stage(sealed, |i, id, o, od, ctx| {
            ChunkDecryptor::new(decryptor, 3).run(i, id, o, od, ctx)
        })
        .unwrap();

        assert_eq!(restored[0].payload(), &[1; 4096][..]);
        assert_eq!(restored[1].payload(), &[2; 4096][..]);
        assert_eq!(restored[2].payload(), &[3; 904][..]);
    }

    #[test]
    fn rejects_out_of_range_sequence_numbers() {
        let encryptor = Encryptor::new(&test_key());

        let err = run_stage(vec![Chunk::plain(4, vec![0; 8])], |i, id, o, od, ctx| {
            ChunkEncryptor::new(encryptor, 3).run(i, id, o, od, ctx)
        })
        .unwrap_err();

        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::BadSequence { seq: 4, .. })
        ));
    }

    #[test]
    fn tampered_chunk_aborts_decryption() {
        let key = test_key();
        let mut encryptor = Encryptor::new(&key);
        let header = encryptor.header().clone();

        let sealed = encryptor.encrypt(&[7; 100], true).unwrap();
        let mut tampered = sealed;
        tampered[50] ^= 0x01;

        let decryptor = Decryptor::new(&key, &header);
        let err = run_stage(
            vec![Chunk::sealed(1, tampered, 100)],
            |i, id, o, od, ctx| ChunkDecryptor::new(decryptor, 1).run(i, id, o, od, ctx),
        )
        .unwrap_err();

        assert!(matches!(err, TransferError::Crypto(CryptoError::Auth)));
    }

    #[test]
    fn lying_original_size_is_length_mismatch() {
        let key = test_key();
        let mut encryptor = Encryptor::new(&key);
        let header = encryptor.header().clone();
        let sealed = encryptor.encrypt(&[7; 100], true).unwrap();

        let decryptor = Decryptor::new(&key, &header);
        let err = run_stage(vec![Chunk::sealed(1, sealed, 99)], |i, id, o, od, ctx| {
            ChunkDecryptor::new(decryptor, 1).run(i, id, o, od, ctx)
        })
        .unwrap_err();

        assert!(matches!(
            err,
            TransferError::Crypto(CryptoError::LengthMismatch { .. })
        ));
    }
}
