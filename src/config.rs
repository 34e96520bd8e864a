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
use std::{path::Path, time::Duration};

use config::{Config, Environment, File, FileFormat};
use duration_string::DurationString;
use serde::Deserialize;

use crate::{
    machine::{Machine, DEFAULT_MAX_ACTIVE_NODES},
    time::{TimeDuration, TimeStamp, TimeUnit},
};

mod error;

pub use error::ConfigError;

/// The default sample rate of the real-time driver.
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// The default tempo.
pub const DEFAULT_BPM: f64 = 120.0;

/// The default resolution of beat time, in pulses per quarter note.
pub const DEFAULT_PPQN: u32 = 1920;

/// Quantization is off by default.
pub const DEFAULT_QUANTIZATION: f64 = 0.0;

/// The default recorder ring buffer size in bytes.
pub const DEFAULT_RECORDER_CAPACITY: usize = 4096;

/// The default number of output events per window.
pub const DEFAULT_MAX_OUTPUT_EVENTS: usize = 512;

/// The default time to wait for the real-time thread.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(2);

/// The prefix of environment variables that override settings.
const ENV_PREFIX: &str = "MACHINA";

/// Engine settings. Every field is optional and falls back to a default.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Settings {
    /// Frames per second of the real-time driver.
    sample_rate: Option<u32>,

    /// Tempo in beats per minute.
    bpm: Option<f64>,

    /// Pulses per quarter note of beat time, also used for written files.
    ppqn: Option<u32>,

    /// Quantization grid for learned durations, in beats. 0 turns it off.
    quantization: Option<f64>,

    /// Size of the recorder ring buffer in bytes.
    recorder_capacity: Option<usize>,

    /// Output events the driver can emit in a single window.
    max_output_events: Option<usize>,

    /// Size of a machine's active node table.
    max_active_nodes: Option<usize>,

    /// How long control calls wait on the real-time thread, e.g. "2s".
    handoff_timeout: Option<String>,

    /// Seeds machine randomness for reproducible runs.
    seed: Option<u64>,
}

impl Settings {
    /// Loads settings from an optional YAML file, overridden by MACHINA_
    /// prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings from a YAML string.
    pub fn parse(yaml: &str) -> Result<Settings, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == Some(0) {
            return Err(invalid("sample_rate", "must be positive"));
        }
        if let Some(bpm) = self.bpm {
            if !bpm.is_finite() || bpm <= 0.0 {
                return Err(invalid("bpm", "must be a positive number"));
            }
        }
        if let Some(ppqn) = self.ppqn {
            if ppqn == 0 || ppqn > 0x7FFF {
                return Err(invalid("ppqn", "must be between 1 and 32767"));
            }
        }
        if let Some(quantization) = self.quantization {
            if !quantization.is_finite() || quantization < 0.0 {
                return Err(invalid("quantization", "must not be negative"));
            }
        }
        if self.recorder_capacity == Some(0) {
            return Err(invalid("recorder_capacity", "must be positive"));
        }
        self.handoff_timeout()?;
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub fn bpm(&self) -> f64 {
        self.bpm.unwrap_or(DEFAULT_BPM)
    }

    pub fn ppqn(&self) -> u32 {
        self.ppqn.unwrap_or(DEFAULT_PPQN)
    }

    /// The unit machines built from these settings count time in.
    pub fn beat_unit(&self) -> TimeUnit {
        TimeUnit::beats(self.ppqn())
    }

    /// The quantization grid in beat time.
    pub fn quantization(&self) -> TimeDuration {
        TimeStamp::from_f64(
            self.beat_unit(),
            self.quantization.unwrap_or(DEFAULT_QUANTIZATION),
        )
    }

    /// Overrides the quantization grid, in beats.
    pub fn set_quantization(&mut self, beats: f64) {
        self.quantization = Some(beats);
    }

    pub fn recorder_capacity(&self) -> usize {
        self.recorder_capacity.unwrap_or(DEFAULT_RECORDER_CAPACITY)
    }

    pub fn max_output_events(&self) -> usize {
        self.max_output_events.unwrap_or(DEFAULT_MAX_OUTPUT_EVENTS)
    }

    pub fn max_active_nodes(&self) -> usize {
        self.max_active_nodes.unwrap_or(DEFAULT_MAX_ACTIVE_NODES)
    }

    /// Returns the hand-off timeout (default: 2s).
    pub fn handoff_timeout(&self) -> Result<Duration, ConfigError> {
        match &self.handoff_timeout {
            Some(timeout) => DurationString::from_string(timeout.clone())
                .map(Duration::from)
                .map_err(|e| invalid("handoff_timeout", e.to_string())),
            None => Ok(DEFAULT_HANDOFF_TIMEOUT),
        }
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = Some(seed);
    }

    /// An empty machine sized and seeded according to these settings.
    pub fn new_machine(&self) -> Machine {
        let mut machine = Machine::new(self.beat_unit());
        machine.set_max_active_nodes(self.max_active_nodes());
        if let Some(seed) = self.seed {
            machine.seed(seed);
        }
        machine
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod test {
    use std::{error::Error, fs};

    use super::*;

    #[test]
    fn defaults() -> Result<(), Box<dyn Error>> {
        let settings = Settings::default();
        assert_eq!(48000, settings.sample_rate());
        assert_eq!(120.0, settings.bpm());
        assert_eq!(TimeUnit::beats(1920), settings.beat_unit());
        assert!(settings.quantization().is_zero());
        assert_eq!(4096, settings.recorder_capacity());
        assert_eq!(512, settings.max_output_events());
        assert_eq!(128, settings.max_active_nodes());
        assert_eq!(Duration::from_secs(2), settings.handoff_timeout()?);
        assert_eq!(None, settings.seed());
        Ok(())
    }

    #[test]
    fn parses_values() -> Result<(), Box<dyn Error>> {
        let settings = Settings::parse(
            r#"
            sample_rate: 44100
            bpm: 90.5
            ppqn: 480
            quantization: 0.25
            max_active_nodes: 16
            handoff_timeout: 500ms
            seed: 7
        "#,
        )?;
        assert_eq!(44100, settings.sample_rate());
        assert_eq!(90.5, settings.bpm());
        assert_eq!(TimeStamp::new(TimeUnit::beats(480), 0, 120), settings.quantization());
        assert_eq!(Duration::from_millis(500), settings.handoff_timeout()?);
        assert_eq!(Some(7), settings.seed());

        let machine = settings.new_machine();
        assert_eq!(16, machine.max_active_nodes());
        assert_eq!(TimeUnit::beats(480), machine.unit());
        Ok(())
    }

    #[test]
    fn rejects_bad_values() {
        for yaml in [
            "bpm: 0",
            "ppqn: 0",
            "ppqn: 40000",
            "quantization: -1",
            "sample_rate: 0",
            "handoff_timeout: soon",
        ] {
            assert!(
                matches!(Settings::parse(yaml), Err(ConfigError::Invalid { .. })),
                "{} should be rejected",
                yaml
            );
        }
        assert!(matches!(
            Settings::parse("bpm: [1, 2]"),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn loads_from_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("machina.yaml");
        fs::write(&path, "ppqn: 96\nbpm: 100\n")?;

        let settings = Settings::load(Some(path.as_path()))?;
        assert_eq!(96, settings.ppqn());
        assert_eq!(100.0, settings.bpm());

        assert!(Settings::load(Some(dir.path().join("missing.yaml").as_path())).is_err());
        Ok(())
    }
}
