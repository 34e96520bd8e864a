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
//! Drivers that run machines against a clock.
//!
//! [`Driver`] and [`Process`] are the two halves of the real-time driver: the
//! control thread owns the driver, while the transport's callback owns the
//! process and calls it once per window. [`SmfDriver`] runs machines offline
//! against standard MIDI files.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{info, span, Level};

use crate::{
    config::{ConfigError, Settings},
    learn::LearnRequest,
    machine::{EdgeId, Machine, NodeId},
    mutation::Mutation,
    recorder::{RecordWriter, Recorder, RecorderError},
    time::{TimeDuration, TimeSlice},
};

mod command;
mod handoff;
mod realtime;
mod smf;

pub use realtime::{FrameEvent, OutputBuffer, Process};
pub use smf::SmfDriver;

use command::{command, Command};
use handoff::{handoff, Handoff};

/// Learn requests that may be queued at once.
const LEARN_QUEUE_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("timed out after {0:?} waiting for the real-time thread")]
    HandoffTimeout(Duration),
    #[error("timed out waiting for the driver to stop")]
    StopTimeout,
    #[error("the real-time side has gone away")]
    Disconnected,
    #[error("already recording")]
    AlreadyRecording,
    #[error("not recording")]
    NotRecording,
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("too many pending learn requests")]
    LearnQueueFull,
    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Where the driver is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Running,
    Stopping,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DriverState::Idle => "idle",
                DriverState::Running => "running",
                DriverState::Stopping => "stopping",
            }
        )
    }
}

/// The driver state shared between the control and real-time sides.
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn new(state: DriverState) -> SharedState {
        SharedState(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> DriverState {
        match self.0.load(Ordering::Acquire) {
            x if x == DriverState::Running as u8 => DriverState::Running,
            x if x == DriverState::Stopping as u8 => DriverState::Stopping,
            _ => DriverState::Idle,
        }
    }

    pub(crate) fn store(&self, state: DriverState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: DriverState, to: DriverState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The control half of the real-time driver.
///
/// The driver keeps its own copy of the machine. Edits are made to that
/// copy and handed to the real-time side whole; edge weights are shared
/// between the two, so they can be changed in place.
pub struct Driver {
    machine: Machine,
    slice: TimeSlice,
    quantization: TimeDuration,
    recorder_capacity: usize,
    max_active_nodes: usize,
    timeout: Duration,
    state: Arc<SharedState>,
    machines: Handoff<Machine>,
    recorders: Handoff<RecordWriter>,
    recorder: Option<Recorder>,
    stop: Command,
    learn_tx: Sender<LearnRequest>,
    learned_rx: Receiver<LearnRequest>,
}

impl Driver {
    /// Creates a driver and the process the transport should call.
    pub fn new(settings: &Settings) -> Result<(Driver, Process), DriverError> {
        let timeout = settings.handoff_timeout()?;
        let slice = TimeSlice::new(settings.sample_rate(), settings.bpm(), settings.beat_unit());
        let state = Arc::new(SharedState::new(DriverState::Idle));
        let (machines, machines_rx) = handoff(timeout);
        let (recorders, recorders_rx) = handoff(timeout);
        let (stop, stop_handle) = command();
        let (learn_tx, learn_rx) = bounded(LEARN_QUEUE_SIZE);
        let (learned_tx, learned_rx) = bounded(LEARN_QUEUE_SIZE);

        let process = Process::new(
            slice.clone(),
            settings.max_output_events(),
            state.clone(),
            machines_rx,
            recorders_rx,
            stop_handle,
            learn_rx,
            learned_tx,
        );
        let driver = Driver {
            machine: settings.new_machine(),
            slice,
            quantization: settings.quantization(),
            recorder_capacity: settings.recorder_capacity(),
            max_active_nodes: settings.max_active_nodes(),
            timeout,
            state,
            machines,
            recorders,
            recorder: None,
            stop,
            learn_tx,
            learned_rx,
        };
        Ok((driver, process))
    }

    pub fn state(&self) -> DriverState {
        self.state.load()
    }

    /// The control copy of the running machine.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Replaces the running machine. Returns once the real-time side has
    /// reset the old machine and let go of it, handing back that running
    /// copy.
    pub fn set_machine(&mut self, mut machine: Machine) -> Result<Option<Machine>, DriverError> {
        machine.set_max_active_nodes(self.max_active_nodes);
        let running = machine.linked_copy();
        self.machine = machine;

        let old = self.machines.swap(Some(running))?;
        info!(
            nodes = self.machine.node_count(),
            edges = self.machine.edge_count(),
            "Machine changed."
        );
        Ok(old)
    }

    /// Applies a mutation to a copy of the machine and installs the result.
    pub fn mutate(&mut self, mutation: &dyn Mutation) -> Result<(), DriverError> {
        let mut machine = self.machine.clone();
        mutation.mutate(&mut machine);
        self.set_machine(machine)?;
        Ok(())
    }

    /// Changes an edge weight on the running machine without a hand-off.
    pub fn set_edge_probability(&self, edge: EdgeId, probability: f64) -> bool {
        self.machine.set_edge_probability(edge, probability)
    }

    /// Starts running the machine. Returns false unless the driver was idle.
    pub fn start(&self) -> bool {
        let started = self.state.transition(DriverState::Idle, DriverState::Running);
        if started {
            info!("Driver started.");
        }
        started
    }

    /// Stops the machine, waiting for the real-time side to reset it.
    pub fn stop(&self) -> Result<(), DriverError> {
        if self.state.load() == DriverState::Idle {
            return Ok(());
        }
        self.state.store(DriverState::Stopping);
        if !self.stop.issue(self.timeout) {
            return Err(DriverError::StopTimeout);
        }
        info!("Driver stopped.");
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Starts recording the input into a new machine.
    pub fn start_record(&mut self) -> Result<(), DriverError> {
        if self.recorder.is_some() {
            return Err(DriverError::AlreadyRecording);
        }
        let mut machine = Machine::new(self.machine.unit());
        machine.set_max_active_nodes(self.max_active_nodes);
        let (recorder, writer) = Recorder::start(
            machine,
            self.slice.clone(),
            self.quantization,
            self.recorder_capacity,
        )?;
        self.recorder = Some(recorder);
        self.recorders.swap(Some(writer))?;
        info!("Recording started.");
        Ok(())
    }

    /// Stops recording and merges what was played into the machine. Returns
    /// false if nothing was recorded.
    pub fn finish_record(&mut self) -> Result<bool, DriverError> {
        let span = span!(Level::INFO, "finish record");
        let _enter = span.enter();

        let recorder = self.recorder.take().ok_or(DriverError::NotRecording)?;
        drop(self.recorders.swap(None)?);
        let recorded = recorder.finish()?;
        if !recorded.nodes().any(|node| node.enter_action().is_some()) {
            info!("Nothing was recorded.");
            return Ok(false);
        }

        let mut machine = self.machine.clone();
        machine.append(recorded);
        self.set_machine(machine)?;
        Ok(true)
    }

    /// Asks the real-time side to teach `node` the next note played.
    pub fn learn(&self, node: NodeId) -> Result<(), DriverError> {
        if self.machine.node(node).is_none() {
            return Err(DriverError::NodeNotFound(node));
        }
        self.learn_tx
            .try_send(LearnRequest::new(node, self.quantization))
            .map_err(|_| DriverError::LearnQueueFull)
    }

    /// Applies completed learn requests to the control copy. Returns how
    /// many were applied.
    pub fn collect_learned(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(request) = self.learned_rx.try_recv() {
            if request.apply(&mut self.machine) {
                applied += 1;
            }
        }
        applied
    }
}
