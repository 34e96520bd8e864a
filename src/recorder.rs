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
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, span, Level};

use crate::{
    builder::MachineBuilder,
    machine::Machine,
    ringbuffer::{event_ring_buffer, EventReader, EventWriter, MAX_EVENT_SIZE},
    time::{TimeDuration, TimeSlice, TimeStamp},
};

/// How long the reader thread sleeps when nobody wakes it.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("unable to start recorder thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("recorder thread panicked")]
    ThreadPanicked,
}

/// Records a live performance into a machine.
///
/// The real-time side writes events through the [`RecordWriter`]; a
/// background thread drains them and feeds a [`MachineBuilder`].
pub struct Recorder {
    stop: Arc<AtomicBool>,
    wake: Sender<()>,
    join_handle: Option<JoinHandle<Machine>>,
}

/// The real-time half of a recorder. Writes never block or allocate.
pub struct RecordWriter {
    writer: EventWriter,
    wake: Sender<()>,
}

impl Recorder {
    /// Starts recording into `machine`. Event times written to the returned
    /// writer are in the slice's tick unit and are converted to beats using
    /// the slice's rate and tempo.
    pub fn start(
        machine: Machine,
        slice: TimeSlice,
        quantization: TimeDuration,
        capacity: usize,
    ) -> Result<(Recorder, RecordWriter), RecorderError> {
        let (writer, reader) = event_ring_buffer(capacity, slice.tick_unit());
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let join_handle = {
            let stop = stop.clone();
            let builder = MachineBuilder::new(machine, quantization);
            thread::Builder::new()
                .name("machina-recorder".into())
                .spawn(move || reader_thread(builder, reader, slice, stop, wake_rx))?
        };

        Ok((
            Recorder {
                stop,
                wake: wake_tx.clone(),
                join_handle: Some(join_handle),
            },
            RecordWriter {
                writer,
                wake: wake_tx,
            },
        ))
    }

    /// Stops the reader thread once it has drained everything written so
    /// far and returns the recorded machine.
    pub fn finish(mut self) -> Result<Machine, RecorderError> {
        self.stop.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
        match self.join_handle.take() {
            Some(join_handle) => join_handle.join().map_err(|_| RecorderError::ThreadPanicked),
            None => Err(RecorderError::ThreadPanicked),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            self.stop.store(true, Ordering::Release);
            let _ = self.wake.try_send(());
            let _ = join_handle.join();
        }
    }
}

impl RecordWriter {
    /// Queues an event for the recorder. Returns the number of bytes
    /// written, or 0 if the event was dropped.
    pub fn write(&mut self, time: TimeStamp, event: &[u8]) -> usize {
        let written = self.writer.write(time, event);
        if written > 0 {
            let _ = self.wake.try_send(());
        }
        written
    }

    /// Marks the end of the recording at `time`. Notes still held are closed
    /// there.
    pub fn close(&mut self, time: TimeStamp) -> bool {
        // An empty record only moves the clock.
        let written = self.writer.write(time, &[]) > 0;
        if written {
            let _ = self.wake.try_send(());
        }
        written
    }
}

fn reader_thread(
    mut builder: MachineBuilder,
    mut reader: EventReader,
    slice: TimeSlice,
    stop: Arc<AtomicBool>,
    wake: Receiver<()>,
) -> Machine {
    let span = span!(Level::INFO, "recorder");
    let _enter = span.enter();

    let mut buf = Vec::with_capacity(MAX_EVENT_SIZE);
    let mut origin: Option<TimeStamp> = None;
    let mut events = 0usize;
    loop {
        // Anything written before the stop flag was raised is still drained.
        let stopping = stop.load(Ordering::Acquire);
        while let Some(time) = reader.read(&mut buf) {
            let origin = *origin.get_or_insert(time);
            let offset = slice.ticks_to_beats(time.saturating_sub(origin));
            builder.set_time(offset);
            if buf.is_empty() {
                continue;
            }
            debug!(time = %offset, bytes = ?buf, "Recording event.");
            builder.event(TimeStamp::zero(offset.unit()), &buf);
            events += 1;
        }
        if stopping {
            break;
        }
        let _ = wake.recv_timeout(POLL_INTERVAL);
    }

    let machine = builder.finish();
    info!(
        events,
        nodes = machine.node_count(),
        "Recording finished."
    );
    machine
}

#[cfg(test)]
mod test {
    use std::error::Error;

    use crate::{
        action::ActionFactory,
        time::{TimeStamp, TimeUnit},
    };

    use super::*;

    fn slice() -> TimeSlice {
        // 480 frames per second at 60 bpm is one frame per pulse.
        TimeSlice::new(480, 60.0, TimeUnit::beats(480))
    }

    #[test]
    fn records_a_note() -> Result<(), Box<dyn Error>> {
        let slice = slice();
        let frames = slice.tick_unit();
        let unit = slice.beat_unit();
        let (recorder, mut writer) = Recorder::start(
            Machine::new(unit),
            slice,
            TimeStamp::zero(unit),
            1024,
        )?;

        // The first event sets the origin.
        assert!(writer.write(TimeStamp::new(frames, 100, 0), &[0x90, 60, 100]) > 0);
        assert!(writer.write(TimeStamp::new(frames, 580, 0), &[0x80, 60, 0]) > 0);

        let machine = recorder.finish()?;
        let notes: Vec<_> = machine
            .nodes()
            .filter(|node| node.enter_action().is_some())
            .collect();
        assert_eq!(1, notes.len());
        assert_eq!(Some(60), notes[0].pitch());
        assert_eq!(TimeStamp::new(unit, 1, 0), notes[0].duration());
        assert!(notes[0].is_initial());
        Ok(())
    }

    #[test]
    fn held_notes_are_closed_on_finish() -> Result<(), Box<dyn Error>> {
        let slice = slice();
        let frames = slice.tick_unit();
        let unit = slice.beat_unit();
        let (recorder, mut writer) =
            Recorder::start(Machine::new(unit), slice, TimeStamp::zero(unit), 1024)?;

        writer.write(TimeStamp::zero(frames), ActionFactory::note_on(64).bytes());
        let machine = recorder.finish()?;
        let note = machine
            .nodes()
            .find(|node| node.pitch() == Some(64))
            .ok_or("missing note")?;
        assert_eq!(Some(64), note.exit_action().and_then(|action| action.pitch()));
        Ok(())
    }

    #[test]
    fn held_notes_end_when_recording_stops() -> Result<(), Box<dyn Error>> {
        let slice = slice();
        let frames = slice.tick_unit();
        let unit = slice.beat_unit();
        let (recorder, mut writer) =
            Recorder::start(Machine::new(unit), slice, TimeStamp::zero(unit), 1024)?;

        writer.write(TimeStamp::zero(frames), ActionFactory::note_on(60).bytes());
        writer.write(TimeStamp::new(frames, 480, 0), ActionFactory::note_off(60).bytes());
        writer.write(TimeStamp::new(frames, 960, 0), ActionFactory::note_on(64).bytes());
        assert!(writer.close(TimeStamp::new(frames, 1440, 0)));

        let machine = recorder.finish()?;
        let held = machine
            .nodes()
            .find(|node| node.pitch() == Some(64))
            .ok_or("missing note")?;
        assert_eq!(TimeStamp::new(unit, 1, 0), held.duration());
        assert_eq!(Some(64), held.exit_action().and_then(|action| action.pitch()));
        Ok(())
    }

    #[test]
    fn full_buffer_drops_events() -> Result<(), Box<dyn Error>> {
        let slice = slice();
        let frames = slice.tick_unit();
        let unit = slice.beat_unit();
        // Room for a single 3 byte record.
        let (recorder, mut writer) =
            Recorder::start(Machine::new(unit), slice, TimeStamp::zero(unit), 15)?;

        let mut accepted = 0;
        for i in 0..16 {
            if writer.write(TimeStamp::new(frames, i, 0), &[0x90, 60, 100]) > 0 {
                accepted += 1;
            }
        }
        assert!(accepted >= 1);
        recorder.finish()?;
        Ok(())
    }

    #[test]
    fn empty_recording() -> Result<(), Box<dyn Error>> {
        let slice = slice();
        let unit = slice.beat_unit();
        let (recorder, _writer) =
            Recorder::start(Machine::new(unit), slice, TimeStamp::zero(unit), 64)?;
        assert!(recorder.finish()?.is_empty());
        Ok(())
    }
}
