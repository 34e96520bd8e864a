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
    fs::File,
    io::{BufWriter, Seek, SeekFrom, Write},
    path::Path,
};

use tracing::error;

use crate::{
    action::MidiSink,
    time::{TimeStamp, TimeUnitKind},
};

use super::{write_var_len, SmfError, VAR_LEN_MAX};

/// Offset of the track chunk's length field.
const TRACK_LENGTH_OFFSET: u64 = 18;
const NO_OP: [u8; 3] = [0xFF, 0x7F, 0x00];
const END_OF_TRACK: [u8; 3] = [0xFF, 0x2F, 0x00];

/// Writes a single track (type 0) standard MIDI file.
///
/// The track length in the header is patched once the writer is finished,
/// so the output must be seekable.
pub struct SmfWriter<W: Write + Seek> {
    writer: W,
    ppqn: u16,
    start_time: TimeStamp,
    last_event_ticks: u64,
    track_size: u32,
    failed: bool,
    scratch: Vec<u8>,
}

impl SmfWriter<BufWriter<File>> {
    /// Creates the file at `path` and starts writing.
    pub fn create(
        path: &Path,
        ppqn: u16,
        start_time: TimeStamp,
    ) -> Result<SmfWriter<BufWriter<File>>, SmfError> {
        SmfWriter::start(BufWriter::new(File::create(path)?), ppqn, start_time)
    }
}

impl<W: Write + Seek> SmfWriter<W> {
    /// Writes the header and opens the track. Event times are beats, and
    /// `start_time` is the beat written at tick zero.
    pub fn start(mut writer: W, ppqn: u16, start_time: TimeStamp) -> Result<SmfWriter<W>, SmfError> {
        if start_time.unit().kind() != TimeUnitKind::Beats {
            return Err(SmfError::UnitMismatch(start_time.unit().to_string()));
        }
        let ppqn = ppqn.clamp(1, 0x7FFF);

        let mut header = Vec::with_capacity(22);
        header.extend_from_slice(b"MThd");
        header.extend_from_slice(&6u32.to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes());
        header.extend_from_slice(&1u16.to_be_bytes());
        header.extend_from_slice(&ppqn.to_be_bytes());
        header.extend_from_slice(b"MTrk");
        header.extend_from_slice(&0u32.to_be_bytes());
        writer.write_all(&header)?;

        Ok(SmfWriter {
            writer,
            ppqn,
            start_time,
            last_event_ticks: 0,
            track_size: 0,
            failed: false,
            scratch: Vec::with_capacity(16),
        })
    }

    pub fn ppqn(&self) -> u16 {
        self.ppqn
    }

    /// Whether a write through the sink interface failed.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Appends an event at `time`. Times must not go backwards.
    pub fn write_event(&mut self, time: TimeStamp, event: &[u8]) -> Result<(), SmfError> {
        if time.unit() != self.start_time.unit() {
            return Err(SmfError::UnitMismatch(time.unit().to_string()));
        }
        let ticks = self.to_ticks(time)?;
        if ticks < self.last_event_ticks {
            return Err(SmfError::OutOfOrder {
                time: time.to_string(),
                previous: self.last_event_ticks.to_string(),
            });
        }

        let mut delta = ticks - self.last_event_ticks;
        self.scratch.clear();
        while delta > u64::from(VAR_LEN_MAX) {
            write_var_len(VAR_LEN_MAX, &mut self.scratch);
            self.scratch.extend_from_slice(&NO_OP);
            delta -= u64::from(VAR_LEN_MAX);
        }
        write_var_len(delta as u32, &mut self.scratch);
        self.scratch.extend_from_slice(event);

        self.writer.write_all(&self.scratch)?;
        self.track_size += self.scratch.len() as u32;
        self.last_event_ticks = ticks;
        Ok(())
    }

    /// Ends the track, patches its length and returns the underlying writer.
    pub fn finish(mut self) -> Result<W, SmfError> {
        self.scratch.clear();
        write_var_len(0, &mut self.scratch);
        self.scratch.extend_from_slice(&END_OF_TRACK);
        self.writer.write_all(&self.scratch)?;
        self.track_size += self.scratch.len() as u32;

        let end = self.writer.stream_position()?;
        self.writer.seek(SeekFrom::Start(TRACK_LENGTH_OFFSET))?;
        self.writer.write_all(&self.track_size.to_be_bytes())?;
        self.writer.seek(SeekFrom::Start(end))?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    /// Ticks since the start time, rounded to the nearest tick.
    fn to_ticks(&self, time: TimeStamp) -> Result<u64, SmfError> {
        if time < self.start_time {
            return Err(SmfError::OutOfOrder {
                time: time.to_string(),
                previous: self.start_time.to_string(),
            });
        }
        let elapsed = (time - self.start_time).total_subticks();
        let ppt = u128::from(time.unit().ppt());
        let ticks = (elapsed * u128::from(self.ppqn) + ppt / 2) / ppt;
        Ok(ticks.min(u128::from(u64::MAX)) as u64)
    }
}

impl<W: Write + Seek> MidiSink for SmfWriter<W> {
    fn write_event(&mut self, time: TimeStamp, event: &[u8]) {
        if let Err(e) = SmfWriter::write_event(self, time, event) {
            error!(err = %e, "Failed to write MIDI event to file.");
            self.failed = true;
        }
    }
}
