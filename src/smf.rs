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

//! Standard MIDI File reading and writing.

mod reader;
mod writer;

pub use reader::{SmfEvent, SmfReader};
pub use writer::SmfWriter;

/// The largest value a variable length quantity can hold (28 bits).
pub const VAR_LEN_MAX: u32 = 0x0FFF_FFFF;

/// Errors reading or writing standard MIDI files.
#[derive(Debug, thiserror::Error)]
pub enum SmfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a standard MIDI file")]
    BadHeader,
    #[error("SMPTE time division is not supported")]
    SmpteDivision,
    #[error("track {0} not found")]
    TrackNotFound(u16),
    #[error("no track selected")]
    NoTrack,
    #[error("truncated or malformed track data at byte {0}")]
    Truncated(usize),
    #[error("event time {time} is before the previous event at {previous}")]
    OutOfOrder { time: String, previous: String },
    #[error("time unit {0} can't be written to a MIDI file")]
    UnitMismatch(String),
    #[error("no machine produced")]
    NoMachineProduced,
    #[error("failed to write events")]
    WriteFailed,
}

/// Appends `value` as a variable length quantity. Values above
/// [`VAR_LEN_MAX`] are truncated to 28 bits.
pub(crate) fn write_var_len(value: u32, out: &mut Vec<u8>) {
    let value = value & VAR_LEN_MAX;
    let mut groups = [0u8; 4];
    let mut count = 0;
    let mut rest = value;
    loop {
        groups[count] = (rest & 0x7F) as u8;
        count += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    for i in (0..count).rev() {
        let continuation = if i > 0 { 0x80 } else { 0 };
        out.push(groups[i] | continuation);
    }
}

/// Reads a variable length quantity starting at `*pos`, advancing it.
pub(crate) fn read_var_len(data: &[u8], pos: &mut usize) -> Option<u32> {
    let mut value: u32 = 0;
    for _ in 0..4 {
        let byte = *data.get(*pos)?;
        *pos += 1;
        value = (value << 7) | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// The number of data bytes following a status byte, if fixed.
pub(crate) fn data_size(status: u8) -> Option<usize> {
    match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Some(2),
        0xC0 | 0xD0 => Some(1),
        _ => match status {
            0xF2 => Some(2),
            0xF1 | 0xF3 => Some(1),
            0xF6 | 0xF8..=0xFE => Some(0),
            _ => None,
        },
    }
}
