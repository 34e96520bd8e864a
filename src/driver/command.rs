// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, Sender};

/// Creates a blocking command: the issuing side waits until the real-time
/// side has carried it out at a window boundary.
pub(crate) fn command() -> (Command, CommandHandle) {
    let pending = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = bounded(1);
    (
        Command {
            pending: pending.clone(),
            done_rx,
        },
        CommandHandle { pending, done_tx },
    )
}

pub(crate) struct Command {
    pending: Arc<AtomicBool>,
    done_rx: Receiver<()>,
}

impl Command {
    /// Marks the command pending and waits for it to complete. Returns false
    /// on timeout, in which case the command stays pending.
    pub(crate) fn issue(&self, timeout: Duration) -> bool {
        while self.done_rx.try_recv().is_ok() {}
        self.pending.store(true, Ordering::Release);
        self.done_rx.recv_timeout(timeout).is_ok()
    }
}

pub(crate) struct CommandHandle {
    pending: Arc<AtomicBool>,
    done_tx: Sender<()>,
}

impl CommandHandle {
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Completes a pending command, releasing the issuer.
    pub(crate) fn complete(&self) {
        if self.pending.swap(false, Ordering::AcqRel) {
            let _ = self.done_tx.try_send(());
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn issue_waits_for_completion() {
        let (command, handle) = command();
        assert!(!handle.is_pending());

        let join_handle = thread::spawn(move || {
            while !handle.is_pending() {
                thread::sleep(Duration::from_millis(1));
            }
            handle.complete();
            handle
        });
        assert!(command.issue(Duration::from_secs(3)));

        let handle = join_handle.join().expect("join");
        assert!(!handle.is_pending());
        // Completing again is harmless.
        handle.complete();
    }

    #[test]
    fn issue_times_out() {
        let (command, handle) = command();
        assert!(!command.issue(Duration::from_millis(10)));
        assert!(handle.is_pending());
    }
}
