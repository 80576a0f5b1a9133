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

use crate::cipher::{ChunkDecryptor, ChunkEncryptor};
use crate::crypto::{
    open_handshake, seal_handshake, Decryptor, Encryptor, Header, Key, Nonce, Salt,
    HANDSHAKE_CIPHERTEXT_SIZE, HEADER_SIZE, NONCE_SIZE, SALT_SIZE,
};
use crate::files;
use crate::progress;
use crate::queue::BoundedQueue;
use crate::request::TransferRequest;
use crate::wire;
use crate::worker::{run_worker, WorkerContext};
use crate::{CryptoError, TransferError};

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

/// Capacity of the two queues between the pipeline stages of one session.
const QUEUE_CAPACITY: usize = 50;

/// TCP connect timeout. Connection attempt is aborted if the receiver
/// doesn't respond.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the receiver accept loop sleeps between polls of the
/// nonblocking listener and the exit flag.
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

// Candidate ports for the receiver, above the registered range.
const RECEIVER_PORT_RANGE: Range<u16> = 49152..65535;
const RECEIVER_BIND_ATTEMPTS: usize = 16;

/// Summary of a completed transfer, for the end-of-session report.
#[derive(Clone, Copy, Debug)]
pub struct TransferStats {
    pub num_files: u32,
    pub num_chunks: u32,
    pub transfer_size: u64,
    pub elapsed: Duration,
}

/// A `Sender` drives one outgoing session:
/// `Init → Connected → Handshaken → Negotiated → Streaming → Done`.
///
/// Construction connects; [`Sender::run`] performs the handshake, negotiates
/// the transfer request and streams the chunks. Any failure is terminal for
/// the session, there are no retries.
pub struct Sender {
    stream: TcpStream,
    password: String,
    root: PathBuf,
}

impl Sender {
    /// Opens the TCP connection to a listening receiver.
    pub fn connect(addr: SocketAddr, password: String, root: PathBuf) -> Result<Self, TransferError> {
        let stream =
            TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(TransferError::ConnectFailed)?;
        info!("connected to {}", addr);

        Ok(Self {
            stream,
            password,
            root,
        })
    }

    /// Runs the session over the staged `files`.
    ///
    /// Fails with [`CryptoError::Auth`] if the receiver rejects the
    /// handshake and with [`TransferError::Declined`] if it declines the
    /// transfer request.
    pub fn run(mut self, files: &[PathBuf]) -> Result<TransferStats, TransferError> {
        let encryptor = self.send_handshake()?;
        debug!("handshake successful");

        let request = TransferRequest::from_files(&self.root, files)?;
        self.negotiate(&request)?;
        debug!("transfer request accepted by receiver");

        self.stream_chunks(&request, encryptor)
    }

    // Handshake format: salt, handshake nonce, sealed tag, stream header.
    // The receiver answers with a single byte, 1 for a matching key.
    fn send_handshake(&mut self) -> Result<Encryptor, TransferError> {
        let salt = Salt::random();
        let key = Key::derive(&self.password, &salt)?;
        let (nonce, sealed_tag) = seal_handshake(&key)?;
        let encryptor = Encryptor::new(&key);

        let mut handshake =
            Vec::with_capacity(SALT_SIZE + NONCE_SIZE + HANDSHAKE_CIPHERTEXT_SIZE + HEADER_SIZE);
        handshake.extend_from_slice(salt.as_bytes());
        handshake.extend_from_slice(nonce.as_bytes());
        handshake.extend_from_slice(&sealed_tag);
        handshake.extend_from_slice(encryptor.header().as_bytes());
        self.stream
            .write_all(&handshake)
            .map_err(TransferError::Disconnected)?;

        let mut ack = [0; 1];
        self.stream
            .read_exact(&mut ack)
            .map_err(TransferError::Disconnected)?;
        if ack[0] != 1 {
            return Err(CryptoError::Auth.into());
        }

        Ok(encryptor)
    }

    fn negotiate(&mut self, request: &TransferRequest) -> Result<(), TransferError> {
        wire::send_request(&mut self.stream, request)?;

        let mut accept = [0; 1];
        self.stream
            .read_exact(&mut accept)
            .map_err(TransferError::Disconnected)?;
        if accept[0] != 1 {
            return Err(TransferError::Declined);
        }

        Ok(())
    }

    // Transmit pipeline: reader → encryptor → framer, plus the progress
    // poller. The socket is only touched by the framer thread from here on.
    fn stream_chunks(
        &self,
        request: &TransferRequest,
        encryptor: Encryptor,
    ) -> Result<TransferStats, TransferError> {
        let started = Instant::now();

        let plain_queue = BoundedQueue::new(QUEUE_CAPACITY)?;
        let sealed_queue = BoundedQueue::new(QUEUE_CAPACITY)?;
        let reading_done = AtomicBool::new(false);
        let encryption_done = AtomicBool::new(false);
        let chunks_sent = AtomicU32::new(0);
        let ctx = WorkerContext::new();
        let stage = ChunkEncryptor::new(encryptor, request.num_chunks());

        thread::scope(|s| {
            s.spawn(|| {
                run_worker(&ctx, || {
                    files::read_files_into_chunks(
                        request,
                        &self.root,
                        &plain_queue,
                        &reading_done,
                        &ctx,
                    )
                })
            });
            s.spawn(|| {
                run_worker(&ctx, || {
                    stage.run(
                        &plain_queue,
                        &reading_done,
                        &sealed_queue,
                        &encryption_done,
                        &ctx,
                    )
                })
            });
            s.spawn(|| {
                run_worker(&ctx, || {
                    let mut socket = &self.stream;
                    wire::send_chunks(
                        &mut socket,
                        &sealed_queue,
                        &encryption_done,
                        &chunks_sent,
                        &ctx,
                    )
                })
            });
            s.spawn(|| progress::track_chunks("Chunks sent", &chunks_sent, request.num_chunks(), &ctx));
        });

        ctx.raise_if_error()?;
        info!(
            "sent {} chunks ({} bytes) in {:?}",
            request.num_chunks(),
            request.transfer_size(),
            started.elapsed()
        );

        Ok(TransferStats {
            num_files: request.num_files(),
            num_chunks: request.num_chunks(),
            transfer_size: request.transfer_size(),
            elapsed: started.elapsed(),
        })
    }
}

/// A `Receiver` drives the listening side. It accepts one connection at a
/// time, re-listens after a failed handshake or a declined request, and
/// returns after one completed transfer.
pub struct Receiver {
    listener: TcpListener,
    password: String,
    root: PathBuf,
}

impl Receiver {
    /// Binds to the given port on all IPv4 interfaces. Port 0 lets the OS pick.
    pub fn bind(port: u16, password: String, root: PathBuf) -> Result<Self, TransferError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(TransferError::ConnectFailed)?;

        Ok(Self {
            listener,
            password,
            root,
        })
    }

    /// Binds to a random dynamic port, re-rolling a few times if a candidate
    /// is taken, before falling back to an OS-assigned port.
    pub fn bind_random(password: String, root: PathBuf) -> Result<Self, TransferError> {
        let mut rng = rand::thread_rng();

        for _ in 0..RECEIVER_BIND_ATTEMPTS {
            let port = rng.gen_range(RECEIVER_PORT_RANGE);
            if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
                return Ok(Self {
                    listener,
                    password,
                    root,
                });
            }
        }

        Self::bind(0, password, root)
    }

    /// The local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransferError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until a transfer completes or `should_exit` is
    /// raised. `accept` decides whether an offered transfer request is taken;
    /// it runs between negotiation and streaming, so it may block on user
    /// input.
    ///
    /// Returns `None` if the loop was stopped without a completed transfer.
    pub fn run(
        &self,
        should_exit: &AtomicBool,
        mut accept: impl FnMut(&TransferRequest) -> bool,
    ) -> Result<Option<TransferStats>, TransferError> {
        self.listener.set_nonblocking(true)?;

        loop {
            if should_exit.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let (stream, peer_addr) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            info!("incoming connection from {}", peer_addr);

            match self.serve(stream, &mut accept) {
                Ok(Some(stats)) => return Ok(Some(stats)),
                Ok(None) => {
                    println!("Waiting for the next connection...");
                }
                Err(e) => {
                    warn!("session with {} failed: {}", peer_addr, e);
                    return Err(e);
                }
            }
        }
    }

    // One inbound session. `Ok(None)` means the peer was turned away
    // (handshake failure or declined request) and the loop should re-listen.
    fn serve(
        &self,
        mut stream: TcpStream,
        accept: &mut impl FnMut(&TransferRequest) -> bool,
    ) -> Result<Option<TransferStats>, TransferError> {
        // Accepted sockets inherit the listener's nonblocking mode.
        stream.set_nonblocking(false)?;

        let decryptor = match self.recv_handshake(&mut stream)? {
            Some(decryptor) => decryptor,
            None => {
                println!("Handshake failed. Ensure passwords match.");
                return Ok(None);
            }
        };
        debug!("handshake successful");

        let request = wire::recv_request(&mut stream)?;
        debug!("received transfer request for {} files", request.num_files());

        if !accept(&request) {
            stream.write_all(&[0]).map_err(TransferError::Disconnected)?;
            info!("transfer request declined");
            return Ok(None);
        }
        stream.write_all(&[1]).map_err(TransferError::Disconnected)?;

        self.stream_chunks(&stream, &request, decryptor).map(Some)
    }

    // Mirror of the sender handshake: derive the key from the received salt,
    // verify the sealed tag, answer with the ack byte and install the stream
    // header. A failed verification is reported as `None`, not an error.
    fn recv_handshake(&self, stream: &mut TcpStream) -> Result<Option<Decryptor>, TransferError> {
        let mut salt = [0; SALT_SIZE];
        stream
            .read_exact(&mut salt)
            .map_err(TransferError::Disconnected)?;

        let mut nonce = [0; NONCE_SIZE];
        stream
            .read_exact(&mut nonce)
            .map_err(TransferError::Disconnected)?;

        let mut sealed_tag = [0; HANDSHAKE_CIPHERTEXT_SIZE];
        stream
            .read_exact(&mut sealed_tag)
            .map_err(TransferError::Disconnected)?;

        let mut header = [0; HEADER_SIZE];
        stream
            .read_exact(&mut header)
            .map_err(TransferError::Disconnected)?;

        let key = Key::derive(&self.password, &Salt::from_bytes(salt))?;
        if !open_handshake(&key, &Nonce::from_bytes(nonce), &sealed_tag) {
            stream.write_all(&[0]).map_err(TransferError::Disconnected)?;
            return Ok(None);
        }

        stream.write_all(&[1]).map_err(TransferError::Disconnected)?;
        Ok(Some(Decryptor::new(&key, &Header::from_bytes(header))))
    }

    // Receive pipeline: framer → decryptor → writer, plus the progress
    // poller. The mirror image of the sender pipeline.
    fn stream_chunks(
        &self,
        stream: &TcpStream,
        request: &TransferRequest,
        decryptor: Decryptor,
    ) -> Result<TransferStats, TransferError> {
        let started = Instant::now();

        let sealed_queue = BoundedQueue::new(QUEUE_CAPACITY)?;
        let plain_queue = BoundedQueue::new(QUEUE_CAPACITY)?;
        let reception_done = AtomicBool::new(false);
        let decryption_done = AtomicBool::new(false);
        let chunks_written = AtomicU32::new(0);
        let ctx = WorkerContext::new();
        let stage = ChunkDecryptor::new(decryptor, request.num_chunks());

        thread::scope(|s| {
            s.spawn(|| {
                run_worker(&ctx, || {
                    let mut socket = stream;
                    wire::recv_chunks(
                        &mut socket,
                        &sealed_queue,
                        &reception_done,
                        request.num_chunks(),
                        &ctx,
                    )
                })
            });
            s.spawn(|| {
                run_worker(&ctx, || {
                    stage.run(
                        &sealed_queue,
                        &reception_done,
                        &plain_queue,
                        &decryption_done,
                        &ctx,
                    )
                })
            });
            s.spawn(|| {
                run_worker(&ctx, || {
                    files::write_files_from_chunks(
                        request,
                        &self.root,
                        &plain_queue,
                        &decryption_done,
                        &chunks_written,
                        &ctx,
                    )
                })
            });
            s.spawn(|| {
                progress::track_chunks("Chunks received", &chunks_written, request.num_chunks(), &ctx)
            });
        });

        ctx.raise_if_error()?;
        info!(
            "received {} chunks ({} bytes) in {:?}",
            request.num_chunks(),
            request.transfer_size(),
            started.elapsed()
        );

        Ok(TransferStats {
            num_files: request.num_files(),
            num_chunks: request.num_chunks(),
            transfer_size: request.transfer_size(),
            elapsed: started.elapsed(),
        })
    }
}

/// Best-effort discovery of the address LAN peers can reach this host at.
/// Uses a connected UDP socket to pick the outbound interface; no packet is
/// actually sent.
pub fn lan_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    Some(socket.local_addr().ok()?.ip())
}
