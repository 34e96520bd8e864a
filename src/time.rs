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
    cmp::Ordering,
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// The domain a time value counts in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeUnitKind {
    /// Audio frames at a sample rate.
    Frames,
    /// Musical beats at a PPQN.
    Beats,
    /// Wall clock seconds.
    Seconds,
}

/// A time domain plus its parts-per-tick granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeUnit {
    kind: TimeUnitKind,
    ppt: u32,
}

impl TimeUnit {
    /// Audio frames. Subticks are fractions of a frame in units of 1/rate.
    pub fn frames(rate: u32) -> TimeUnit {
        TimeUnit {
            kind: TimeUnitKind::Frames,
            ppt: rate.max(1),
        }
    }

    /// Beats with the given pulses per quarter note.
    pub fn beats(ppqn: u32) -> TimeUnit {
        TimeUnit {
            kind: TimeUnitKind::Beats,
            ppt: ppqn.max(1),
        }
    }

    /// Seconds with a 32 bit fractional part.
    pub fn seconds() -> TimeUnit {
        TimeUnit {
            kind: TimeUnitKind::Seconds,
            ppt: u32::MAX,
        }
    }

    pub fn kind(&self) -> TimeUnitKind {
        self.kind
    }

    /// Parts per tick.
    pub fn ppt(&self) -> u32 {
        self.ppt
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TimeUnitKind::Frames => write!(f, "frames@{}", self.ppt),
            TimeUnitKind::Beats => write!(f, "beats@{}", self.ppt),
            TimeUnitKind::Seconds => write!(f, "seconds"),
        }
    }
}

/// A fixed point time value: whole ticks plus subticks within a unit.
///
/// `subticks` is always strictly less than `unit.ppt()`. Arithmetic and
/// ordering are only defined between stamps of the same unit; mixing units
/// panics on arithmetic and yields no ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeStamp {
    ticks: u32,
    subticks: u32,
    unit: TimeUnit,
}

/// Durations share the representation of stamps.
pub type TimeDuration = TimeStamp;

impl TimeStamp {
    /// Creates a new stamp, carrying any excess subticks into ticks.
    pub fn new(unit: TimeUnit, ticks: u32, subticks: u32) -> TimeStamp {
        TimeStamp::from_subticks(
            unit,
            u128::from(ticks) * u128::from(unit.ppt) + u128::from(subticks),
        )
    }

    pub fn zero(unit: TimeUnit) -> TimeStamp {
        TimeStamp {
            ticks: 0,
            subticks: 0,
            unit,
        }
    }

    /// Builds a stamp from a total subtick count. Saturates at the largest
    /// representable tick.
    pub fn from_subticks(unit: TimeUnit, total: u128) -> TimeStamp {
        let ppt = u128::from(unit.ppt);
        let ticks = total / ppt;
        if ticks > u128::from(u32::MAX) {
            return TimeStamp {
                ticks: u32::MAX,
                subticks: unit.ppt - 1,
                unit,
            };
        }
        TimeStamp {
            ticks: ticks as u32,
            subticks: (total % ppt) as u32,
            unit,
        }
    }

    /// Converts a decimal tick count, rounding to the nearest subtick.
    /// Negative and non-finite values clamp to zero.
    pub fn from_f64(unit: TimeUnit, value: f64) -> TimeStamp {
        if !value.is_finite() || value <= 0.0 {
            return TimeStamp::zero(unit);
        }
        let whole = value.floor();
        let frac = ((value - whole) * f64::from(unit.ppt)).round();
        TimeStamp::from_subticks(
            unit,
            (whole as u128) * u128::from(unit.ppt) + frac as u128,
        )
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    pub fn subticks(&self) -> u32 {
        self.subticks
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    pub fn is_zero(&self) -> bool {
        self.ticks == 0 && self.subticks == 0
    }

    /// The whole value expressed in subticks.
    pub fn total_subticks(&self) -> u128 {
        u128::from(self.ticks) * u128::from(self.unit.ppt) + u128::from(self.subticks)
    }

    pub fn to_f64(&self) -> f64 {
        f64::from(self.ticks) + f64::from(self.subticks) / f64::from(self.unit.ppt)
    }

    /// Subtracts, clamping at zero instead of underflowing.
    pub fn saturating_sub(self, rhs: TimeStamp) -> TimeStamp {
        self.assert_same_unit(&rhs);
        TimeStamp::from_subticks(
            self.unit,
            self.total_subticks().saturating_sub(rhs.total_subticks()),
        )
    }

    pub fn max(self, rhs: TimeStamp) -> TimeStamp {
        if rhs > self {
            rhs
        } else {
            self
        }
    }

    pub fn min(self, rhs: TimeStamp) -> TimeStamp {
        if rhs < self {
            rhs
        } else {
            self
        }
    }

    fn assert_same_unit(&self, rhs: &TimeStamp) {
        assert_eq!(
            self.unit, rhs.unit,
            "time arithmetic between different units"
        );
    }
}

impl Add for TimeStamp {
    type Output = TimeStamp;

    fn add(self, rhs: TimeStamp) -> TimeStamp {
        self.assert_same_unit(&rhs);
        TimeStamp::from_subticks(self.unit, self.total_subticks() + rhs.total_subticks())
    }
}

impl AddAssign for TimeStamp {
    fn add_assign(&mut self, rhs: TimeStamp) {
        *self = *self + rhs;
    }
}

impl Sub for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, rhs: TimeStamp) -> TimeStamp {
        self.assert_same_unit(&rhs);
        let total = self
            .total_subticks()
            .checked_sub(rhs.total_subticks())
            .expect("time subtraction underflow");
        TimeStamp::from_subticks(self.unit, total)
    }
}

impl SubAssign for TimeStamp {
    fn sub_assign(&mut self, rhs: TimeStamp) {
        *self = *self - rhs;
    }
}

impl PartialOrd for TimeStamp {
    fn partial_cmp(&self, other: &TimeStamp) -> Option<Ordering> {
        if self.unit != other.unit {
            return None;
        }
        Some(
            self.ticks
                .cmp(&other.ticks)
                .then(self.subticks.cmp(&other.subticks)),
        )
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.ticks, self.subticks, self.unit)
    }
}

/// Snaps `t` to the nearest multiple of `q`. A zero grid leaves `t` alone.
pub fn quantize(q: TimeDuration, t: TimeStamp) -> TimeStamp {
    if q.is_zero() {
        return t;
    }
    t.assert_same_unit(&q);
    let grid = q.total_subticks();
    let steps = (t.total_subticks() + grid / 2) / grid;
    TimeStamp::from_subticks(t.unit, steps * grid)
}

/// Quantizes the duration of something that sounds. A result of zero is
/// bumped to one grid unit.
pub fn quantize_sounding(q: TimeDuration, t: TimeDuration) -> TimeDuration {
    let quantized = quantize(q, t);
    if quantized.is_zero() && !q.is_zero() {
        q
    } else {
        quantized
    }
}

/// A window of time expressed both in ticks (frames of the driving clock)
/// and beats (the machine's musical time).
#[derive(Clone, Debug)]
pub struct TimeSlice {
    tick_unit: TimeUnit,
    beat_unit: TimeUnit,
    tick_rate: f64,
    bpm: f64,
    start_ticks: TimeStamp,
    length_ticks: TimeDuration,
    offset_ticks: TimeDuration,
    start_beats: TimeStamp,
    end_beats: TimeStamp,
}

impl TimeSlice {
    /// Creates a new slice for a clock of `rate` ticks per second at `bpm`.
    pub fn new(rate: u32, bpm: f64, beat_unit: TimeUnit) -> TimeSlice {
        let tick_unit = TimeUnit::frames(rate);
        let mut slice = TimeSlice {
            tick_unit,
            beat_unit,
            tick_rate: f64::from(tick_unit.ppt()),
            bpm: sanitize_bpm(bpm),
            start_ticks: TimeStamp::zero(tick_unit),
            length_ticks: TimeStamp::zero(tick_unit),
            offset_ticks: TimeStamp::zero(tick_unit),
            start_beats: TimeStamp::zero(beat_unit),
            end_beats: TimeStamp::zero(beat_unit),
        };
        slice.update_beats();
        slice
    }

    pub fn tick_unit(&self) -> TimeUnit {
        self.tick_unit
    }

    pub fn beat_unit(&self) -> TimeUnit {
        self.beat_unit
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        let bpm = sanitize_bpm(bpm);
        if bpm != self.bpm {
            self.bpm = bpm;
            self.update_beats();
        }
    }

    pub fn set_slice(&mut self, start: TimeStamp, length: TimeDuration) {
        self.start_ticks = start;
        self.length_ticks = length;
        self.update_beats();
    }

    pub fn set_start(&mut self, start: TimeStamp) {
        self.start_ticks = start;
        self.update_beats();
    }

    pub fn set_length(&mut self, length: TimeDuration) {
        self.length_ticks = length;
        self.update_beats();
    }

    /// Sets where inside the transport's buffer this slice begins.
    pub fn set_offset(&mut self, offset: TimeDuration) {
        self.offset_ticks = offset;
    }

    pub fn start_ticks(&self) -> TimeStamp {
        self.start_ticks
    }

    pub fn length_ticks(&self) -> TimeDuration {
        self.length_ticks
    }

    pub fn offset_ticks(&self) -> TimeDuration {
        self.offset_ticks
    }

    pub fn start_beats(&self) -> TimeStamp {
        self.start_beats
    }

    /// The first beat after this slice, which is exactly the start of the
    /// slice that follows it.
    pub fn end_beats(&self) -> TimeStamp {
        self.end_beats
    }

    pub fn length_beats(&self) -> TimeDuration {
        self.end_beats.saturating_sub(self.start_beats)
    }

    pub fn ticks_to_beats(&self, ticks: TimeStamp) -> TimeStamp {
        let seconds = ticks.to_f64() / self.tick_rate;
        TimeStamp::from_f64(self.beat_unit, seconds * self.bpm / 60.0)
    }

    /// Converts beats to the nearest whole tick.
    pub fn beats_to_ticks(&self, beats: TimeStamp) -> TimeStamp {
        let seconds = beats.to_f64() * 60.0 / self.bpm;
        TimeStamp::from_f64(self.tick_unit, (seconds * self.tick_rate).round())
    }

    fn update_beats(&mut self) {
        self.start_beats = self.ticks_to_beats(self.start_ticks);
        self.end_beats = self.ticks_to_beats(self.start_ticks + self.length_ticks);
    }
}

fn sanitize_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() && bpm > 0.0 {
        bpm
    } else {
        120.0
    }
}
