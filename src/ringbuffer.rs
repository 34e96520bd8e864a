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
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tracing::warn;

use crate::time::{TimeStamp, TimeUnit};

/// Encoded header: ticks, subticks and payload size, little endian.
const HEADER_SIZE: usize = 12;

/// The largest payload a single record may carry.
pub const MAX_EVENT_SIZE: usize = 256;

/// Creates a lock free single producer, single consumer buffer of timestamped
/// raw events. `capacity` is in bytes and includes per-record headers.
pub fn event_ring_buffer(capacity: usize, unit: TimeUnit) -> (EventWriter, EventReader) {
    let (prod, cons) = HeapRb::<u8>::new(capacity.max(1)).split();
    (EventWriter { prod, unit }, EventReader { cons, unit })
}

/// The writing half. Safe to use from a real-time thread.
pub struct EventWriter {
    prod: HeapProd<u8>,
    unit: TimeUnit,
}

impl EventWriter {
    /// Writes an event. Returns the number of bytes consumed, or 0 if the
    /// event was rejected because it doesn't fit.
    pub fn write(&mut self, time: TimeStamp, event: &[u8]) -> usize {
        if time.unit() != self.unit {
            warn!(unit = %time.unit(), "Event time unit does not match ring buffer.");
            return 0;
        }
        if event.len() > MAX_EVENT_SIZE {
            warn!(size = event.len(), "Event too large for ring buffer.");
            return 0;
        }
        let needed = HEADER_SIZE + event.len();
        if self.prod.vacant_len() < needed {
            warn!(
                needed,
                available = self.prod.vacant_len(),
                "Ring buffer full, dropping event."
            );
            return 0;
        }

        // Records are published with a single push so the reader never sees
        // a header without its payload.
        let mut record = [0u8; HEADER_SIZE + MAX_EVENT_SIZE];
        record[0..4].copy_from_slice(&time.ticks().to_le_bytes());
        record[4..8].copy_from_slice(&time.subticks().to_le_bytes());
        record[8..12].copy_from_slice(&(event.len() as u32).to_le_bytes());
        record[HEADER_SIZE..needed].copy_from_slice(event);
        self.prod.push_slice(&record[..needed])
    }

    /// Free space in bytes.
    pub fn write_space(&self) -> usize {
        self.prod.vacant_len()
    }

    pub fn capacity(&self) -> usize {
        self.prod.capacity().into()
    }
}

/// The reading half.
pub struct EventReader {
    cons: HeapCons<u8>,
    unit: TimeUnit,
}

impl EventReader {
    /// Reads the oldest event into `buf`, returning its time.
    pub fn read(&mut self, buf: &mut Vec<u8>) -> Option<TimeStamp> {
        if self.cons.occupied_len() < HEADER_SIZE {
            return None;
        }
        let mut header = [0u8; HEADER_SIZE];
        self.cons.pop_slice(&mut header);
        let ticks = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let subticks = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let size = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;

        buf.clear();
        buf.resize(size, 0);
        let read = self.cons.pop_slice(buf);
        buf.truncate(read);
        Some(TimeStamp::new(self.unit, ticks, subticks))
    }

    pub fn is_empty(&self) -> bool {
        self.cons.is_empty()
    }

    /// Bytes waiting to be read.
    pub fn read_space(&self) -> usize {
        self.cons.occupied_len()
    }
}
