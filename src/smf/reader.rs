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
    io::{BufReader, ErrorKind, Read, Seek, SeekFrom},
    path::Path,
};

use tracing::debug;

use super::{data_size, read_var_len, SmfError};

const HEADER_SIZE: u64 = 14;
const META: u8 = 0xFF;
const META_END_OF_TRACK: u8 = 0x2F;

/// A MIDI event read from a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmfEvent {
    /// Ticks since the previous event returned, including the time of any
    /// meta or sysex events skipped in between.
    pub delta: u64,
    pub bytes: Vec<u8>,
}

/// Reads the MIDI events of one track at a time from a standard MIDI file.
pub struct SmfReader<R> {
    reader: R,
    format: u16,
    num_tracks: u16,
    ppqn: u16,
    track: Option<Track>,
}

struct Track {
    data: Vec<u8>,
    pos: usize,
    running_status: Option<u8>,
    finished: bool,
}

impl SmfReader<BufReader<File>> {
    /// Opens and validates the file at `path`.
    pub fn open(path: &Path) -> Result<SmfReader<BufReader<File>>, SmfError> {
        SmfReader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> SmfReader<R> {
    /// Creates a new reader, validating the header.
    pub fn new(mut reader: R) -> Result<SmfReader<R>, SmfError> {
        let mut header = [0u8; HEADER_SIZE as usize];
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut header).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => SmfError::BadHeader,
            _ => SmfError::Io(e),
        })?;

        if &header[0..4] != b"MThd" || be_u32(&header[4..8]) != 6 {
            return Err(SmfError::BadHeader);
        }
        let format = be_u16(&header[8..10]);
        let num_tracks = be_u16(&header[10..12]);
        let division = be_u16(&header[12..14]);
        if division & 0x8000 != 0 {
            return Err(SmfError::SmpteDivision);
        }

        Ok(SmfReader {
            reader,
            format,
            num_tracks,
            ppqn: division,
            track: None,
        })
    }

    pub fn format(&self) -> u16 {
        self.format
    }

    /// The number of tracks the header declares.
    pub fn num_tracks(&self) -> u16 {
        self.num_tracks
    }

    /// Ticks per quarter note.
    pub fn ppqn(&self) -> u16 {
        self.ppqn
    }

    /// Positions the reader at the start of a track. Tracks count from 1.
    pub fn seek_to_track(&mut self, track: u16) -> Result<(), SmfError> {
        self.track = None;
        if track == 0 {
            return Err(SmfError::TrackNotFound(track));
        }
        self.reader.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut found = 0;
        loop {
            let mut chunk = [0u8; 8];
            match self.reader.read_exact(&mut chunk) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(SmfError::TrackNotFound(track))
                }
                Err(e) => return Err(e.into()),
            }
            let length = be_u32(&chunk[4..8]);

            if &chunk[0..4] == b"MTrk" {
                found += 1;
                if found == track {
                    // The declared length is only trusted as far as the file goes.
                    let mut data = Vec::new();
                    (&mut self.reader)
                        .take(u64::from(length))
                        .read_to_end(&mut data)?;
                    if data.len() < length as usize {
                        return Err(SmfError::Truncated(data.len()));
                    }
                    self.track = Some(Track {
                        data,
                        pos: 0,
                        running_status: None,
                        finished: false,
                    });
                    return Ok(());
                }
            } else {
                debug!(chunk = ?&chunk[0..4], "Skipping unknown chunk.");
            }
            self.reader.seek(SeekFrom::Current(i64::from(length)))?;
        }
    }

    /// Reads the next MIDI event from the current track. Returns None at the
    /// end of the track.
    pub fn read_event(&mut self) -> Result<Option<SmfEvent>, SmfError> {
        let track = self.track.as_mut().ok_or(SmfError::NoTrack)?;
        if track.finished {
            return Ok(None);
        }

        let mut delta: u64 = 0;
        loop {
            if track.pos >= track.data.len() {
                // Tolerate a missing end of track event.
                track.finished = true;
                return Ok(None);
            }
            let data = &track.data;
            let pos = &mut track.pos;
            let start = *pos;

            delta += u64::from(read_var_len(data, pos).ok_or(SmfError::Truncated(start))?);
            let first = *data.get(*pos).ok_or(SmfError::Truncated(*pos))?;

            let status = if first & 0x80 != 0 {
                *pos += 1;
                first
            } else {
                track.running_status.ok_or(SmfError::Truncated(*pos))?
            };

            match status {
                META => {
                    let kind = *data.get(*pos).ok_or(SmfError::Truncated(*pos))?;
                    *pos += 1;
                    skip(data, pos)?;
                    if kind == META_END_OF_TRACK {
                        track.finished = true;
                        return Ok(None);
                    }
                }
                0xF0 | 0xF7 => {
                    track.running_status = None;
                    skip(data, pos)?;
                }
                _ => {
                    let size = data_size(status).ok_or(SmfError::Truncated(*pos))?;
                    let end = *pos + size;
                    if end > data.len() {
                        return Err(SmfError::Truncated(*pos));
                    }
                    let mut bytes = Vec::with_capacity(size + 1);
                    bytes.push(status);
                    bytes.extend_from_slice(&data[*pos..end]);
                    *pos = end;
                    if status < 0xF0 {
                        track.running_status = Some(status);
                    }
                    return Ok(Some(SmfEvent { delta, bytes }));
                }
            }
        }
    }
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Skips a length-prefixed meta or sysex payload.
fn skip(data: &[u8], pos: &mut usize) -> Result<(), SmfError> {
    let start = *pos;
    let length = read_var_len(data, pos).ok_or(SmfError::Truncated(start))?;
    let end = *pos + length as usize;
    if end > data.len() {
        return Err(SmfError::Truncated(start));
    }
    *pos = end;
    Ok(())
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
