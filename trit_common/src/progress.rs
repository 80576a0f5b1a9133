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

use crate::worker::WorkerContext;

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Renders a progress bar off the terminal stage's chunk counter.
///
/// Runs alongside the pipeline but outside of it: it only reads the shared
/// counter, and exits once the counter reaches `total` or the session aborts.
pub fn track_chunks(label: &str, counter: &AtomicU32, total: u32, ctx: &WorkerContext) {
    let bar = ProgressBar::new(u64::from(total));
    if let Ok(style) =
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} chunks ({elapsed})")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_message(label.to_owned());

    loop {
        let n = counter.load(Ordering::SeqCst);
        bar.set_position(u64::from(n));

        if n >= total {
            bar.finish();
            break;
        }
        if ctx.should_abort() {
            bar.abandon();
            break;
        }

        thread::sleep(REFRESH_INTERVAL);
    }
}
