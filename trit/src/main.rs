// trit is a password-authenticated, end-to-end encrypted LAN file transfer tool.
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

mod error;
mod staging;

use error::*;
use staging::{display_relative, StagingArea};

use trit_common::request::{format_size, TransferRequest};
use trit_common::session::{lan_address, Receiver, Sender, TransferStats};
use trit_common::{CryptoError, TransferError};

use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage files matching the given patterns for the next transfer.
    Add {
        /// File patterns relative to the working directory.
        /// `*` and `?` match within one path segment, `**` recurses,
        /// a directory stages everything beneath it.
        patterns: Vec<String>,
    },
    /// Unstage previously staged files matching the given patterns.
    Drop {
        /// File patterns relative to the working directory.
        patterns: Vec<String>,
    },
    /// List the currently staged files.
    List,
    /// Clear the staging registry.
    Clear,
    /// Send the staged files to a listening receiver.
    Send {
        /// The IP address the receiver listens on.
        ip: String,
        /// The port the receiver listens on.
        port: String,
        /// The transfer password. Prompted for if omitted.
        password: Option<String>,
    },
    /// Listen for an incoming transfer.
    Receive {
        /// The transfer password. Prompted for if omitted.
        password: Option<String>,
    },
}

fn main() {
    init_logging();

    match logic() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

// Diagnostics go to a per-process file under the OS temp directory;
// stdout stays reserved for user-facing output.
fn init_logging() {
    let log_dir = env::temp_dir().join("trit");
    if fs::create_dir_all(&log_dir).is_err() {
        return;
    }

    let log_path = log_dir.join(format!("trit-{}.log", process::id()));
    if let Ok(file) = File::create(log_path) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .try_init();
    }
}

fn logic() -> Result<i32> {
    let cli = Cli::parse();
    let root = env::current_dir()?;

    match cli.command {
        Commands::Add { patterns } => add(&root, &patterns),
        Commands::Drop { patterns } => drop_staged(&root, &patterns),
        Commands::List => list(&root),
        Commands::Clear => clear(&root),
        Commands::Send { ip, port, password } => send(&root, &ip, &port, password),
        Commands::Receive { password } => receive(&root, password),
    }
}

fn add(root: &Path, patterns: &[String]) -> Result<i32> {
    if patterns.is_empty() {
        println!("Nothing to stage: no file patterns given");
        return Ok(1);
    }

    let mut area = StagingArea::load(root)?;
    let outcome = area.add(root, patterns)?;

    for path in &outcome.already_staged {
        println!("already staged:\t{}", display_relative(path, root));
    }

    if outcome.added.is_empty() {
        if outcome.already_staged.is_empty() {
            println!("No files in current directory matched the provided pattern(s)");
        } else {
            println!("All matching files were already staged, no new files added");
        }
        return Ok(0);
    }

    area.save(root)?;
    println!("Added staged files:");
    for path in &outcome.added {
        println!("  {}", display_relative(path, root));
    }

    Ok(0)
}

fn drop_staged(root: &Path, patterns: &[String]) -> Result<i32> {
    if patterns.is_empty() {
        println!("Nothing to drop: no file patterns given");
        return Ok(1);
    }

    let mut area = StagingArea::load(root)?;
    let dropped = area.drop_matching(root, patterns)?;

    if dropped.is_empty() {
        println!("No staged files matched the provided pattern(s)");
        return Ok(0);
    }

    area.save(root)?;
    println!("Dropped staged files:");
    for path in &dropped {
        println!("  {}", display_relative(path, root));
    }

    Ok(0)
}

fn list(root: &Path) -> Result<i32> {
    let area = StagingArea::load(root)?;

    if area.is_empty() {
        println!("No files are currently staged.");
        return Ok(0);
    }

    println!("Staged files:");
    for path in area.files() {
        println!("  {}", display_relative(path, root));
    }

    Ok(0)
}

fn clear(root: &Path) -> Result<i32> {
    if StagingArea::clear(root)? {
        println!("Cleared staged files");
    } else {
        println!("No staged files to clear");
    }

    Ok(0)
}

fn send(root: &Path, ip: &str, port: &str, password: Option<String>) -> Result<i32> {
    let ip: IpAddr = ip.parse().map_err(Error::InvalidAddr)?;
    let port: u16 = port.parse().ok().filter(|p| *p != 0).ok_or(Error::InvalidPort)?;

    let area = StagingArea::load(root)?;
    if area.is_empty() {
        println!("No files staged. Nothing to send.");
        return Ok(0);
    }

    let password = resolve_password(password)?;
    let sender = Sender::connect(SocketAddr::new(ip, port), password, root.to_path_buf())?;
    println!("Connected to {}:{}", ip, port);

    println!("Sending files...");
    match sender.run(area.files()) {
        Ok(stats) => {
            print_summary("Sent", &stats);
            Ok(0)
        }
        Err(TransferError::Declined) => {
            println!("Transfer was declined by the receiver");
            Ok(0)
        }
        Err(TransferError::Crypto(CryptoError::Auth)) => {
            println!("Handshake failed. Ensure passwords match.");
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

fn receive(root: &Path, password: Option<String>) -> Result<i32> {
    let password = resolve_password(password)?;
    let receiver = Receiver::bind_random(password, root.to_path_buf())?;

    let addr = receiver.local_addr()?;
    let display_ip = lan_address().unwrap_or_else(|| addr.ip());
    println!(
        "Listening for connection at address {} on port {}",
        display_ip,
        addr.port()
    );
    println!("Press Ctrl-C to stop.");

    let should_exit = Arc::new(AtomicBool::new(false));
    {
        let should_exit = Arc::clone(&should_exit);
        ctrlc::set_handler(move || {
            info!("caught termination signal, exiting");
            should_exit.store(true, Ordering::SeqCst);
        })?;
    }

    match receiver.run(&should_exit, prompt_accept)? {
        Some(stats) => {
            print_summary("Received", &stats);
            Ok(0)
        }
        None => Ok(0),
    }
}

fn prompt_accept(request: &TransferRequest) -> bool {
    println!("{}", request);

    loop {
        print!("Accept transfer? (y/n) ");
        io::stdout().flush().ok();

        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            return false;
        }

        match line.trim() {
            "y" | "Y" => return true,
            "n" | "N" => return false,
            _ => println!("Please enter y or n"),
        }
    }
}

fn resolve_password(password: Option<String>) -> Result<String> {
    match password {
        Some(password) => Ok(password),
        None => Ok(rpassword::prompt_password("Enter transfer password: ")?),
    }
}

fn print_summary(verb: &str, stats: &TransferStats) {
    println!(
        "{} {} file(s), {} in {:.1}s",
        verb,
        stats.num_files,
        format_size(stats.transfer_size),
        stats.elapsed.as_secs_f64()
    );
}
