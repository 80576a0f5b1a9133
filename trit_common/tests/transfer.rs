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

//! End-to-end transfer sessions over loopback TCP.

use trit_common::session::{Receiver, Sender, TransferStats};
use trit_common::{CryptoError, TransferError};

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tempfile::{tempdir, TempDir};

fn write_file(root: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

struct TestReceiver {
    addr: SocketAddr,
    exit: Arc<AtomicBool>,
    handle: JoinHandle<Result<Option<TransferStats>, TransferError>>,
    dir: TempDir,
}

fn spawn_receiver(password: &str, accept: bool) -> TestReceiver {
    let dir = tempdir().unwrap();
    let receiver = Receiver::bind(0, password.to_owned(), dir.path().to_path_buf()).unwrap();
    // The listener binds the wildcard address; connect via loopback.
    let addr = SocketAddr::from(([127, 0, 0, 1], receiver.local_addr().unwrap().port()));

    let exit = Arc::new(AtomicBool::new(false));
    let handle = {
        let exit = Arc::clone(&exit);
        thread::spawn(move || receiver.run(&exit, |_| accept))
    };

    TestReceiver {
        addr,
        exit,
        handle,
        dir,
    }
}

#[test]
fn transfers_files_byte_identically() {
    let src = tempdir().unwrap();
    let a: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
    let b: Vec<u8> = (0..2000u32).map(|i| (i * 13) as u8).collect();
    let path_a = write_file(src.path(), "a.bin", &a);
    let path_b = write_file(src.path(), "docs/readme.txt", &b);

    let receiver = spawn_receiver("correct horse", true);

    let sender = Sender::connect(
        receiver.addr,
        "correct horse".to_owned(),
        src.path().to_path_buf(),
    )
    .unwrap();
    let stats = sender.run(&[path_a, path_b]).unwrap();

    assert_eq!(stats.transfer_size, 5000);
    assert_eq!(stats.num_chunks, 2);

    let received = receiver.handle.join().unwrap().unwrap().unwrap();
    assert_eq!(received.num_chunks, 2);
    assert_eq!(fs::read(receiver.dir.path().join("a.bin")).unwrap(), a);
    assert_eq!(
        fs::read(receiver.dir.path().join("docs/readme.txt")).unwrap(),
        b
    );
}

#[test]
fn single_small_file_is_one_chunk() {
    let src = tempdir().unwrap();
    let path = write_file(src.path(), "hello.txt", b"hello\nworld");

    let receiver = spawn_receiver("pw", true);

    let sender = Sender::connect(receiver.addr, "pw".to_owned(), src.path().to_path_buf()).unwrap();
    let stats = sender.run(&[path]).unwrap();
    assert_eq!(stats.num_chunks, 1);
    assert_eq!(stats.transfer_size, 11);

    receiver.handle.join().unwrap().unwrap().unwrap();
    assert_eq!(
        fs::read(receiver.dir.path().join("hello.txt")).unwrap(),
        b"hello\nworld"
    );
}

#[test]
fn wrong_password_fails_the_handshake() {
    let src = tempdir().unwrap();
    let path = write_file(src.path(), "secret.bin", &[1; 64]);

    let receiver = spawn_receiver("beta", true);

    let sender = Sender::connect(receiver.addr, "alpha".to_owned(), src.path().to_path_buf()).unwrap();
    let err = sender.run(&[path]).unwrap_err();
    assert!(matches!(err, TransferError::Crypto(CryptoError::Auth)));

    // The receiver turned the peer away and keeps listening.
    receiver.exit.store(true, Ordering::SeqCst);
    assert!(receiver.handle.join().unwrap().unwrap().is_none());
    assert!(!receiver.dir.path().join("secret.bin").exists());
}

#[test]
fn declined_request_ends_the_session_cleanly() {
    let src = tempdir().unwrap();
    let path = write_file(src.path(), "unwanted.bin", &[2; 64]);

    let receiver = spawn_receiver("pw", false);

    let sender = Sender::connect(receiver.addr, "pw".to_owned(), src.path().to_path_buf()).unwrap();
    let err = sender.run(&[path]).unwrap_err();
    assert!(matches!(err, TransferError::Declined));

    receiver.exit.store(true, Ordering::SeqCst);
    assert!(receiver.handle.join().unwrap().unwrap().is_none());
    assert!(!receiver.dir.path().join("unwanted.bin").exists());
}

#[test]
fn stopping_the_receiver_without_a_connection() {
    let receiver = spawn_receiver("pw", true);
    receiver.exit.store(true, Ordering::SeqCst);
    assert!(receiver.handle.join().unwrap().unwrap().is_none());
}
