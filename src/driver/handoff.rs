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
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use super::DriverError;

/// Retirements that can be in flight at once: a stale install picked up late
/// plus the current one.
const RETIRE_CAPACITY: usize = 2;

/// Creates the two halves of a value hand-off between a control thread and
/// the real-time thread.
pub(crate) fn handoff<T: Send>(timeout: Duration) -> (Handoff<T>, HandoffReceiver<T>) {
    let (install_tx, install_rx) = bounded(1);
    let (retire_tx, retire_rx) = bounded(RETIRE_CAPACITY);
    (
        Handoff {
            install_tx,
            install_rx: install_rx.clone(),
            retire_rx,
            sequence: AtomicU64::new(0),
            timeout,
        },
        HandoffReceiver {
            install_rx,
            retire_tx,
            installed: AtomicU64::new(0),
        },
    )
}

/// The control side. Swapping blocks until the real-time side has taken the
/// new value and given back the old one.
///
/// Installs carry a sequence number and retirements echo it, so a swap only
/// accepts the value its own install replaced.
pub(crate) struct Handoff<T> {
    install_tx: Sender<(u64, Option<T>)>,
    install_rx: Receiver<(u64, Option<T>)>,
    retire_rx: Receiver<(u64, Option<T>)>,
    sequence: AtomicU64,
    timeout: Duration,
}

impl<T> Handoff<T> {
    /// Installs `value` and returns the value it replaced.
    pub(crate) fn swap(&self, value: Option<T>) -> Result<Option<T>, DriverError> {
        if self.install_rx.try_recv().is_ok() {
            warn!("Replacing a value the real-time side never picked up.");
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.install_tx
            .try_send((sequence, value))
            .map_err(|_| DriverError::Disconnected)?;

        loop {
            match self.retire_rx.recv_timeout(self.timeout) {
                Ok((retired, old)) if retired == sequence => return Ok(old),
                // Left over from a swap that timed out. Released here.
                Ok((retired, _)) => debug!(retired, sequence, "Discarding stale retirement."),
                Err(_) => return Err(DriverError::HandoffTimeout(self.timeout)),
            }
        }
    }
}

/// The real-time side. Never blocks.
pub(crate) struct HandoffReceiver<T> {
    install_rx: Receiver<(u64, Option<T>)>,
    retire_tx: Sender<(u64, Option<T>)>,
    installed: AtomicU64,
}

impl<T> HandoffReceiver<T> {
    /// The value waiting to be installed, if any.
    pub(crate) fn take(&self) -> Option<Option<T>> {
        match self.install_rx.try_recv() {
            Ok((sequence, value)) => {
                self.installed.store(sequence, Ordering::Relaxed);
                Some(value)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Hands the value replaced by the last install back to the control
    /// side, which releases it.
    pub(crate) fn retire(&self, old: Option<T>) {
        let retired = (self.installed.load(Ordering::Relaxed), old);
        if self.retire_tx.try_send(retired).is_err() {
            warn!("Unable to retire value to the control side.");
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    use super::*;

    #[test]
    fn swap_returns_previous_value() -> Result<(), Box<dyn std::error::Error>> {
        let (control, realtime) = handoff::<u32>(Duration::from_secs(3));
        let done = Arc::new(AtomicBool::new(false));

        let join_handle = {
            let done = done.clone();
            thread::spawn(move || {
                let mut current: Option<u32> = None;
                while !done.load(Ordering::Relaxed) {
                    if let Some(new) = realtime.take() {
                        let old = std::mem::replace(&mut current, new);
                        realtime.retire(old);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        assert_eq!(None, control.swap(Some(1))?);
        assert_eq!(Some(1), control.swap(Some(2))?);
        assert_eq!(Some(2), control.swap(None)?);

        done.store(true, Ordering::Relaxed);
        join_handle.join().map_err(|_| "join failed")?;
        Ok(())
    }

    #[test]
    fn swap_times_out_without_a_receiver_loop() {
        let (control, realtime) = handoff::<u32>(Duration::from_millis(20));
        assert!(matches!(
            control.swap(Some(1)),
            Err(DriverError::HandoffTimeout(_))
        ));

        // The stale install is replaced rather than queued behind.
        assert!(matches!(
            control.swap(Some(2)),
            Err(DriverError::HandoffTimeout(_))
        ));
        assert_eq!(Some(Some(2)), realtime.take());
        assert_eq!(None, realtime.take());
    }

    #[test]
    fn late_retirements_are_not_mistaken_for_the_current_one(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (control, realtime) = handoff::<u32>(Duration::from_millis(100));

        // Nobody answers the first swap in time.
        assert!(matches!(
            control.swap(Some(1)),
            Err(DriverError::HandoffTimeout(_))
        ));
        assert_eq!(Some(Some(1)), realtime.take());

        // The second swap may already be waiting when the first one's
        // retirement finally arrives.
        let swapped = thread::scope(|scope| {
            let swap = scope.spawn(|| control.swap(Some(2)));
            thread::sleep(Duration::from_millis(5));
            realtime.retire(None);
            loop {
                if let Some(new) = realtime.take() {
                    assert_eq!(Some(2), new);
                    break;
                }
                thread::yield_now();
            }
            realtime.retire(Some(1));
            swap.join()
        })
        .map_err(|_| "swap panicked")?;
        assert_eq!(Some(1), swapped?);
        Ok(())
    }
}
