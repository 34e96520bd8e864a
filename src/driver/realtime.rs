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
use std::{fmt, mem, sync::Arc};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, warn};

use crate::{
    action::{MidiSink, MAX_ACTION_SIZE},
    learn::LearnRequest,
    machine::Machine,
    recorder::RecordWriter,
    time::{TimeSlice, TimeStamp},
};

use super::{command::CommandHandle, handoff::HandoffReceiver, DriverState, SharedState};

/// How many times a machine may finish and restart inside one window.
const MAX_RESTARTS_PER_WINDOW: usize = 64;

/// A short MIDI message at a frame offset inside a window.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameEvent {
    frame: u32,
    len: u8,
    data: [u8; MAX_ACTION_SIZE],
}

impl FrameEvent {
    /// Returns None for empty messages or ones longer than three bytes.
    pub fn new(frame: u32, bytes: &[u8]) -> Option<FrameEvent> {
        if bytes.is_empty() || bytes.len() > MAX_ACTION_SIZE {
            return None;
        }
        let mut data = [0; MAX_ACTION_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(FrameEvent {
            frame,
            len: bytes.len() as u8,
            data,
        })
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

impl fmt::Debug for FrameEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:02X?}", self.frame, self.bytes())
    }
}

/// Output events for one window, preallocated so the real-time thread never
/// grows it.
#[derive(Debug)]
pub struct OutputBuffer {
    events: Vec<FrameEvent>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> OutputBuffer {
        OutputBuffer {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an event. Returns false if the buffer is full or the message
    /// doesn't fit.
    pub fn push(&mut self, frame: u32, bytes: &[u8]) -> bool {
        if self.events.len() >= self.capacity {
            warn!(capacity = self.capacity, "Output buffer full, dropping event.");
            return false;
        }
        match FrameEvent::new(frame, bytes) {
            Some(event) => {
                self.events.push(event);
                true
            }
            None => {
                warn!(size = bytes.len(), "Unable to output event.");
                false
            }
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn events(&self) -> &[FrameEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Places machine events at their frame inside the current window.
pub(crate) struct CycleWriter<'a> {
    slice: &'a TimeSlice,
    output: &'a mut OutputBuffer,
}

impl<'a> CycleWriter<'a> {
    pub(crate) fn new(slice: &'a TimeSlice, output: &'a mut OutputBuffer) -> CycleWriter<'a> {
        CycleWriter { slice, output }
    }
}

impl MidiSink for CycleWriter<'_> {
    fn write_event(&mut self, time: TimeStamp, event: &[u8]) {
        let start = self.slice.start_beats();
        let end = self.slice.end_beats();
        if time < start {
            warn!(time = %time, start = %start, "Missed event.");
            return;
        }
        if time >= end {
            error!(time = %time, end = %end, "Event falls outside of the window.");
            return;
        }

        let length = self.slice.length_ticks();
        let last = length.saturating_sub(TimeStamp::new(length.unit(), 1, 0));
        let ticks = self
            .slice
            .beats_to_ticks(time)
            .saturating_sub(self.slice.start_ticks())
            .min(last);
        let frame = (self.slice.offset_ticks() + ticks).ticks();
        self.output.push(frame, event);
    }
}

/// The real-time half of the driver. The transport calls [`Process::process`]
/// once per window; nothing in it blocks, locks or allocates.
pub struct Process {
    slice: TimeSlice,
    max_output_events: usize,
    clock: TimeStamp,
    machine: Option<Machine>,
    state: Arc<SharedState>,
    machines: HandoffReceiver<Machine>,
    recorders: HandoffReceiver<RecordWriter>,
    recorder: Option<RecordWriter>,
    stop: CommandHandle,
    learn_rx: Receiver<LearnRequest>,
    learned_tx: Sender<LearnRequest>,
    learn: Option<LearnRequest>,
}

impl Process {
    pub(crate) fn new(
        slice: TimeSlice,
        max_output_events: usize,
        state: Arc<SharedState>,
        machines: HandoffReceiver<Machine>,
        recorders: HandoffReceiver<RecordWriter>,
        stop: CommandHandle,
        learn_rx: Receiver<LearnRequest>,
        learned_tx: Sender<LearnRequest>,
    ) -> Process {
        let clock = TimeStamp::zero(slice.tick_unit());
        Process {
            slice,
            max_output_events,
            clock,
            machine: None,
            state,
            machines,
            recorders,
            recorder: None,
            stop,
            learn_rx,
            learned_tx,
            learn: None,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state.load()
    }

    /// An output buffer sized for one window. Create it before the transport
    /// starts calling [`Process::process`].
    pub fn output_buffer(&self) -> OutputBuffer {
        OutputBuffer::new(self.max_output_events)
    }

    /// Frames processed so far.
    pub fn clock(&self) -> TimeStamp {
        self.clock
    }

    /// Processes one window of `nframes` frames.
    pub fn process(&mut self, nframes: u32, input: &[FrameEvent], output: &mut OutputBuffer) {
        let frames = self.slice.tick_unit();
        let zero = TimeStamp::zero(frames);
        self.slice.set_offset(zero);
        self.slice.set_length(TimeStamp::new(frames, nframes, 0));
        output.clear();

        if let Some(new) = self.machines.take() {
            let mut old = mem::replace(&mut self.machine, new);
            if let Some(old) = old.as_mut() {
                let mut writer = CycleWriter::new(&self.slice, output);
                old.reset(old.time(), &mut writer);
            }
            self.machines.retire(old);
            self.slice.set_start(zero);
        }

        if let Some(new) = self.recorders.take() {
            let mut old = mem::replace(&mut self.recorder, new);
            if let Some(old) = old.as_mut() {
                old.close(self.clock);
            }
            self.recorders.retire(old);
        }

        if self.stop.is_pending() {
            if let Some(machine) = self.machine.as_mut() {
                let mut writer = CycleWriter::new(&self.slice, output);
                machine.reset(machine.time(), &mut writer);
            }
            self.slice.set_start(zero);
            self.state.store(DriverState::Idle);
            self.stop.complete();
        }

        self.route_input(input);

        if self.state.load() == DriverState::Running {
            self.run_machine(output);
        }

        self.clock += TimeStamp::new(frames, nframes, 0);
    }

    fn route_input(&mut self, input: &[FrameEvent]) {
        if self.learn.is_none() {
            self.learn = self.learn_rx.try_recv().ok();
        }

        for event in input {
            let time = self.clock + TimeStamp::new(self.clock.unit(), event.frame(), 0);

            if let Some(request) = self.learn.as_mut() {
                if request.event(self.slice.ticks_to_beats(time), event.bytes()) {
                    if let Some(machine) = self.machine.as_mut() {
                        request.apply(machine);
                    }
                    if self.learned_tx.try_send(*request).is_err() {
                        warn!(node = %request.node(), "Unable to report learned node.");
                    }
                    self.learn = self.learn_rx.try_recv().ok();
                }
                continue;
            }

            if let Some(recorder) = self.recorder.as_mut() {
                recorder.write(time, event.bytes());
            }
        }
    }

    fn run_machine(&mut self, output: &mut OutputBuffer) {
        let Some(machine) = self.machine.as_mut() else {
            return;
        };
        let zero = TimeStamp::zero(self.slice.tick_unit());

        for _ in 0..MAX_RESTARTS_PER_WINDOW {
            let remaining = self.slice.length_ticks();
            let mut writer = CycleWriter::new(&self.slice, output);
            machine.run(&self.slice, &mut writer);

            if !machine.is_finished() {
                self.slice.set_start(self.slice.start_ticks() + remaining);
                return;
            }

            // The machine finished inside the window: start it over on
            // whatever is left.
            let end = machine.time();
            machine.reset(end, &mut writer);
            let used = self
                .slice
                .beats_to_ticks(end)
                .saturating_sub(self.slice.start_ticks())
                .min(remaining);
            self.slice.set_start(zero);
            if end.is_zero() || used >= remaining {
                return;
            }
            self.slice.set_offset(self.slice.offset_ticks() + used);
            self.slice.set_length(remaining - used);
        }
        warn!(
            restarts = MAX_RESTARTS_PER_WINDOW,
            "Machine restarted too often in one window."
        );
    }
}

#[cfg(test)]
mod test {
    use crossbeam_channel::bounded;

    use crate::{
        driver::{command::command, handoff::handoff},
        testutil::{add_note, note_loop},
        time::TimeUnit,
    };

    use super::*;

    fn slice() -> TimeSlice {
        // One frame per pulse.
        TimeSlice::new(480, 60.0, TimeUnit::beats(480))
    }

    fn process(machine: Machine) -> Process {
        let (_, machines) = handoff(std::time::Duration::from_millis(10));
        let (_, recorders) = handoff(std::time::Duration::from_millis(10));
        let (_, stop) = command();
        let (_, learn_rx) = bounded(1);
        let (learned_tx, _) = bounded(1);
        let mut process = Process::new(
            slice(),
            16,
            Arc::new(SharedState::new(DriverState::Running)),
            machines,
            recorders,
            stop,
            learn_rx,
            learned_tx,
        );
        process.machine = Some(machine);
        process
    }

    fn frames(output: &OutputBuffer) -> Vec<(u32, u8)> {
        output
            .events()
            .iter()
            .map(|event| (event.frame(), event.bytes()[0] & 0xF0))
            .collect()
    }

    #[test]
    fn events_land_on_their_frames() {
        let unit = TimeUnit::beats(480);
        let mut machine = Machine::new(unit);
        note_loop(&mut machine, &[60, 62], TimeStamp::new(unit, 0, 100));
        machine.seed(1);
        let mut process = process(machine);
        let mut output = process.output_buffer();

        process.process(150, &[], &mut output);
        assert_eq!(vec![(0, 0x90), (100, 0x80), (100, 0x90)], frames(&output));

        // The next window picks up where the last one ended.
        process.process(150, &[], &mut output);
        assert_eq!(vec![(50, 0x80), (50, 0x90)], frames(&output));
        assert_eq!(TimeStamp::new(TimeUnit::frames(480), 300, 0), process.clock());
    }

    #[test]
    fn finished_machines_restart_inside_the_window() {
        let unit = TimeUnit::beats(480);
        let mut machine = Machine::new(unit);
        let note = add_note(&mut machine, 60, TimeStamp::new(unit, 0, 100));
        machine.node_mut(note).expect("node").set_initial(true);
        let mut process = process(machine);
        let mut output = process.output_buffer();

        process.process(250, &[], &mut output);
        assert_eq!(
            vec![(0, 0x90), (100, 0x80), (100, 0x90), (200, 0x80), (200, 0x90)],
            frames(&output)
        );
        process.process(100, &[], &mut output);
        assert_eq!(vec![(50, 0x80), (50, 0x90)], frames(&output));
    }

    #[test]
    fn idle_driver_is_silent() {
        let unit = TimeUnit::beats(480);
        let mut machine = Machine::new(unit);
        note_loop(&mut machine, &[60], TimeStamp::new(unit, 0, 10));
        let mut process = process(machine);
        process.state.store(DriverState::Idle);
        let mut output = OutputBuffer::new(16);
        process.process(100, &[], &mut output);
        assert!(output.is_empty());
    }

    #[test]
    fn cycle_writer_drops_bad_times() {
        let unit = TimeUnit::beats(480);
        let mut slice = slice();
        slice.set_slice(
            TimeStamp::new(slice.tick_unit(), 480, 0),
            TimeStamp::new(slice.tick_unit(), 480, 0),
        );
        slice.set_offset(TimeStamp::new(slice.tick_unit(), 10, 0));
        let mut output = OutputBuffer::new(4);
        let mut writer = CycleWriter::new(&slice, &mut output);

        // Missed.
        writer.write_event(TimeStamp::new(unit, 0, 479), &[0x90, 1, 1]);
        // Past the end of the window.
        writer.write_event(TimeStamp::new(unit, 2, 0), &[0x90, 2, 1]);
        writer.write_event(TimeStamp::new(unit, 1, 0), &[0x90, 3, 1]);
        writer.write_event(TimeStamp::new(unit, 1, 479), &[0x90, 4, 1]);

        let events = output.events();
        assert_eq!(2, events.len());
        assert_eq!((10, 3), (events[0].frame(), events[0].bytes()[1]));
        assert_eq!((489, 4), (events[1].frame(), events[1].bytes()[1]));
    }

    #[test]
    fn output_buffer_is_bounded() {
        let mut output = OutputBuffer::new(2);
        assert!(output.push(0, &[0x90, 1, 1]));
        assert!(!output.push(0, &[0xF0, 1, 2, 3]));
        assert!(output.push(1, &[0x80, 1, 1]));
        assert!(!output.push(2, &[0x80, 1, 1]));
        assert_eq!(2, output.len());
        output.clear();
        assert!(output.is_empty());
        assert!(FrameEvent::new(0, &[]).is_none());
    }
}
