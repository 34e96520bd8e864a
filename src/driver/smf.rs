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
    io::{Read, Seek, Write},
    path::Path,
};

use tracing::{debug, info, span, warn, Level};

use crate::{
    action::{MidiSink, NullSink},
    builder::MachineBuilder,
    config::Settings,
    machine::Machine,
    smf::{SmfError, SmfReader, SmfWriter},
    time::{TimeDuration, TimeSlice, TimeStamp, TimeUnit},
};

/// Runs machines against standard MIDI files: learning them from tracks and
/// rendering their output.
#[derive(Clone, Debug)]
pub struct SmfDriver {
    settings: Settings,
    unit: TimeUnit,
    quantization: TimeDuration,
}

impl SmfDriver {
    pub fn new(settings: &Settings) -> SmfDriver {
        SmfDriver {
            settings: settings.clone(),
            unit: settings.beat_unit(),
            quantization: settings.quantization(),
        }
    }

    /// The resolution written files use.
    pub fn ppqn(&self) -> u16 {
        u16::try_from(self.settings.ppqn()).unwrap_or(0x7FFF)
    }

    /// Learns a machine from one track of the file at `path`. Tracks count
    /// from 1. Learning stops at `max_duration` if one is given.
    pub fn learn(
        &self,
        path: &Path,
        track: u16,
        max_duration: Option<TimeDuration>,
    ) -> Result<Machine, SmfError> {
        let span = span!(Level::INFO, "learn", path = %path.display(), track);
        let _enter = span.enter();

        let mut reader = SmfReader::open(path)?;
        let mut builder = MachineBuilder::new(self.settings.new_machine(), self.quantization);
        self.learn_track(&mut reader, track, max_duration, &mut builder)?;
        self.produced(builder.finish())
    }

    /// Learns every track of the file into one machine, one disjoint graph
    /// per track.
    pub fn learn_all(&self, path: &Path) -> Result<Machine, SmfError> {
        let span = span!(Level::INFO, "learn all", path = %path.display());
        let _enter = span.enter();

        let mut reader = SmfReader::open(path)?;
        self.learn_reader(&mut reader)
    }

    /// Learns every track available from `reader`.
    pub fn learn_reader<R: Read + Seek>(
        &self,
        reader: &mut SmfReader<R>,
    ) -> Result<Machine, SmfError> {
        let mut builder = MachineBuilder::new(self.settings.new_machine(), self.quantization);
        for track in 1..=reader.num_tracks() {
            if track > 1 {
                builder.reset();
            }
            match self.learn_track(reader, track, None, &mut builder) {
                Ok(()) => {}
                Err(SmfError::TrackNotFound(track)) => {
                    warn!(track, "File has fewer tracks than its header declares.");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.produced(builder.finish())
    }

    /// Feeds one track into `builder`. The builder's clock is left at the last
    /// event, so notes still held are closed there.
    pub(crate) fn learn_track<R: Read + Seek>(
        &self,
        reader: &mut SmfReader<R>,
        track: u16,
        max_duration: Option<TimeDuration>,
        builder: &mut MachineBuilder,
    ) -> Result<(), SmfError> {
        reader.seek_to_track(track)?;
        let file_ppqn = u128::from(reader.ppqn().max(1));
        let ppt = u128::from(self.unit.ppt());

        let mut ticks: u64 = 0;
        let mut events = 0usize;
        while let Some(event) = reader.read_event()? {
            ticks += event.delta;
            let time = TimeStamp::from_subticks(
                self.unit,
                (u128::from(ticks) * ppt + file_ppqn / 2) / file_ppqn,
            );
            if max_duration.is_some_and(|max| time > max) {
                debug!(time = %time, "Reached the maximum duration.");
                break;
            }
            builder.set_time(time);
            builder.event(TimeStamp::zero(self.unit), &event.bytes);
            events += 1;
        }
        info!(track, events, time = %builder.time(), "Learned track.");
        Ok(())
    }

    /// Performs `machine` for `beats` into the file at `path`.
    pub fn run(
        &self,
        machine: &mut Machine,
        path: &Path,
        beats: TimeDuration,
    ) -> Result<(), SmfError> {
        let span = span!(Level::INFO, "render", path = %path.display());
        let _enter = span.enter();

        let writer = SmfWriter::create(path, self.ppqn(), TimeStamp::zero(machine.unit()))?;
        self.render(machine, writer, beats)?;
        Ok(())
    }

    /// Performs `machine` for `beats` through `writer`, restarting it each
    /// time it finishes. Notes still sounding at the end are released.
    pub fn render<W: Write + Seek>(
        &self,
        machine: &mut Machine,
        mut writer: SmfWriter<W>,
        beats: TimeDuration,
    ) -> Result<W, SmfError> {
        let unit = machine.unit();
        if beats.unit() != unit {
            return Err(SmfError::UnitMismatch(beats.unit().to_string()));
        }

        // One tick of the slice is one tick of the file.
        let mut slice = TimeSlice::new(u32::from(self.ppqn()), 60.0, unit);
        let ticks = slice.tick_unit();
        let window = TimeStamp::new(ticks, u32::from(self.ppqn()), 0);
        let total = slice.beats_to_ticks(beats);

        let mut base = TimeStamp::zero(unit);
        let mut elapsed = TimeStamp::zero(ticks);
        let mut restarts = 0usize;
        machine.reset(TimeStamp::zero(unit), &mut NullSink);
        slice.set_slice(TimeStamp::zero(ticks), window.min(total));

        while elapsed < total {
            let length = window.min(total - elapsed);
            slice.set_length(length);
            let mut sink = OffsetSink {
                sink: &mut writer,
                offset: base,
            };
            machine.run(&slice, &mut sink);

            if !machine.is_finished() {
                elapsed += length;
                slice.set_start(slice.start_ticks() + length);
                continue;
            }

            let end = machine.time();
            machine.reset(end, &mut sink);
            let used = slice.beats_to_ticks(end).saturating_sub(slice.start_ticks());
            if end.is_zero() {
                warn!("Machine finished without advancing, ending the render.");
                break;
            }
            restarts += 1;
            base += end;
            elapsed += used;
            slice.set_start(TimeStamp::zero(ticks));
        }

        let time = machine.time();
        machine.reset(
            time,
            &mut OffsetSink {
                sink: &mut writer,
                offset: base,
            },
        );
        if writer.failed() {
            return Err(SmfError::WriteFailed);
        }
        info!(beats = %beats, restarts, "Rendered machine.");
        writer.finish()
    }

    fn produced(&self, machine: Machine) -> Result<Machine, SmfError> {
        let notes = machine
            .nodes()
            .filter(|node| node.enter_action().is_some() || node.exit_action().is_some())
            .count();
        if notes == 0 {
            return Err(SmfError::NoMachineProduced);
        }
        info!(
            notes,
            nodes = machine.node_count(),
            edges = machine.edge_count(),
            "Built machine."
        );
        Ok(machine)
    }
}

/// Shifts event times by a fixed offset.
struct OffsetSink<'a> {
    sink: &'a mut dyn MidiSink,
    offset: TimeStamp,
}

impl MidiSink for OffsetSink<'_> {
    fn write_event(&mut self, time: TimeStamp, event: &[u8]) {
        self.sink.write_event(time + self.offset, event);
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, io::Cursor};

    use crate::{builder::MachineBuilder, smf::SmfEvent};

    use super::*;

    fn settings() -> Settings {
        Settings::parse("ppqn: 480\nseed: 11\n").expect("settings")
    }

    fn smf_file(tracks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"MThd");
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&96u16.to_be_bytes());
        for track in tracks {
            out.extend_from_slice(b"MTrk");
            out.extend_from_slice(&(track.len() as u32).to_be_bytes());
            out.extend_from_slice(track);
        }
        out
    }

    fn read_all(bytes: Vec<u8>) -> Result<Vec<SmfEvent>, SmfError> {
        let mut reader = SmfReader::new(Cursor::new(bytes))?;
        reader.seek_to_track(1)?;
        let mut events = Vec::new();
        while let Some(event) = reader.read_event()? {
            events.push(event);
        }
        Ok(events)
    }

    #[test]
    fn built_machine_renders_back_to_the_same_events() -> Result<(), Box<dyn Error>> {
        let settings = settings();
        let unit = settings.beat_unit();
        let mut builder = MachineBuilder::new(Machine::new(unit), TimeStamp::zero(unit));
        builder.event(TimeStamp::zero(unit), &[0x90, 60, 100]);
        builder.event(TimeStamp::new(unit, 0, 480), &[0x80, 60, 0]);
        let mut machine = builder.finish();

        let notes: Vec<_> = machine
            .nodes()
            .filter(|node| node.enter_action().is_some())
            .collect();
        assert_eq!(1, notes.len());
        assert_eq!(TimeStamp::new(unit, 1, 0), notes[0].duration());

        let driver = SmfDriver::new(&settings);
        let writer = SmfWriter::start(
            Cursor::new(Vec::<u8>::new()),
            driver.ppqn(),
            TimeStamp::zero(unit),
        )?;
        let bytes = driver
            .render(&mut machine, writer, TimeStamp::new(unit, 1, 0))?
            .into_inner();

        let events = read_all(bytes)?;
        assert_eq!(
            vec![
                SmfEvent {
                    delta: 0,
                    bytes: vec![0x90, 60, 100]
                },
                SmfEvent {
                    delta: 480,
                    bytes: vec![0x80, 60, 0]
                },
            ],
            events
        );
        Ok(())
    }

    #[test]
    fn finished_machines_restart() -> Result<(), Box<dyn Error>> {
        let settings = settings();
        let unit = settings.beat_unit();
        let mut machine = Machine::new(unit);
        let note = crate::testutil::add_note(&mut machine, 64, TimeStamp::new(unit, 1, 0));
        machine.node_mut(note).ok_or("node")?.set_initial(true);

        let driver = SmfDriver::new(&settings);
        let writer = SmfWriter::start(
            Cursor::new(Vec::<u8>::new()),
            driver.ppqn(),
            TimeStamp::zero(unit),
        )?;
        let bytes = driver
            .render(&mut machine, writer, TimeStamp::new(unit, 3, 0))?
            .into_inner();

        let events = read_all(bytes)?;
        let deltas: Vec<u64> = events.iter().map(|event| event.delta).collect();
        assert_eq!(vec![0, 480, 0, 480, 0, 480], deltas);
        Ok(())
    }

    #[test]
    fn learns_from_a_file() -> Result<(), Box<dyn Error>> {
        // 96 pulses per quarter note in the file.
        let track: &[u8] = &[
            0x00, 0x90, 60, 100, //
            0x60, 0x80, 60, 0, //
            0x30, 0x90, 62, 100, //
            0x30, 0x80, 62, 0, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("learn.mid");
        std::fs::write(&path, smf_file(&[track]))?;

        let settings = settings();
        let unit = settings.beat_unit();
        let machine = SmfDriver::new(&settings).learn(&path, 1, None)?;
        let durations: Vec<_> = machine
            .nodes()
            .map(|node| (node.pitch(), node.duration()))
            .collect();
        assert!(durations.contains(&(Some(60), TimeStamp::new(unit, 1, 0))));
        assert!(durations.contains(&(Some(62), TimeStamp::new(unit, 0, 240))));
        // The rest between the notes becomes a delay.
        assert!(durations.contains(&(None, TimeStamp::new(unit, 0, 240))));

        // Cutting the track short leaves the second note out.
        let machine =
            SmfDriver::new(&settings).learn(&path, 1, Some(TimeStamp::new(unit, 1, 0)))?;
        assert!(machine.nodes().all(|node| node.pitch() != Some(62)));

        assert!(matches!(
            SmfDriver::new(&settings).learn(&path, 2, None),
            Err(SmfError::TrackNotFound(2))
        ));
        Ok(())
    }

    #[test]
    fn held_notes_end_at_the_last_event() -> Result<(), Box<dyn Error>> {
        let track: &[u8] = &[
            0x00, 0x90, 60, 100, //
            0x30, 0x80, 60, 0, //
            0x00, 0x90, 64, 100, //
            // Never released; the program change is the last event.
            0x60, 0xC0, 5, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let mut reader = SmfReader::new(Cursor::new(smf_file(&[track])))?;
        let settings = settings();
        let unit = settings.beat_unit();
        let machine = SmfDriver::new(&settings).learn_reader(&mut reader)?;

        let held = machine
            .nodes()
            .find(|node| node.pitch() == Some(64))
            .ok_or("missing note")?;
        assert_eq!(TimeStamp::new(unit, 1, 0), held.duration());
        assert_eq!(Some(64), held.exit_action().and_then(|action| action.pitch()));
        Ok(())
    }

    #[test]
    fn learns_every_track() -> Result<(), Box<dyn Error>> {
        let first: &[u8] = &[0x00, 0x90, 60, 100, 0x60, 0x80, 60, 0, 0x00, 0xFF, 0x2F, 0x00];
        let second: &[u8] = &[0x00, 0x91, 72, 100, 0x30, 0x81, 72, 0, 0x00, 0xFF, 0x2F, 0x00];
        let mut reader = SmfReader::new(Cursor::new(smf_file(&[first, second])))?;

        let machine = SmfDriver::new(&settings()).learn_reader(&mut reader)?;
        assert_eq!(2, machine.initial_nodes().len());
        let pitches: Vec<_> = machine.nodes().filter_map(|node| node.pitch()).collect();
        assert!(pitches.contains(&60));
        assert!(pitches.contains(&72));
        Ok(())
    }

    #[test]
    fn empty_tracks_produce_nothing() -> Result<(), Box<dyn Error>> {
        let track: &[u8] = &[0x00, 0xC0, 5, 0x00, 0xFF, 0x2F, 0x00];
        let mut reader = SmfReader::new(Cursor::new(smf_file(&[track])))?;
        assert!(matches!(
            SmfDriver::new(&settings()).learn_reader(&mut reader),
            Err(SmfError::NoMachineProduced)
        ));
        Ok(())
    }
}
