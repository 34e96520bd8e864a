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
use std::{error::Error, path::PathBuf, thread, time::Duration};

use clap::{crate_version, Parser, Subcommand};
use duration_string::DurationString;
use machina::{
    action::NoteEvent,
    config::Settings,
    driver::SmfDriver,
    evolver::{Evolver, Problem},
    machine::Machine,
    smf::SmfReader,
    time::TimeStamp,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A generative MIDI performance engine."
)]
struct Cli {
    /// The path to a settings file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Seeds machine randomness for reproducible output.
    #[arg(short, long, global = true)]
    seed: Option<u64>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Learns a machine from a MIDI file and renders what it plays.
    Learn {
        /// The MIDI file to learn from.
        input: PathBuf,
        /// Where to write the rendered performance.
        output: PathBuf,
        /// The track to learn, counting from 1.
        #[arg(short, long, default_value_t = 1)]
        track: u16,
        /// Learns every track instead of one.
        #[arg(short, long)]
        all: bool,
        /// Stops learning after this many beats.
        #[arg(short, long)]
        max_beats: Option<f64>,
        /// The quantization grid in beats. Overrides the settings file.
        #[arg(short, long)]
        quantization: Option<f64>,
        /// How many beats to render.
        #[arg(short, long, default_value_t = 32.0)]
        beats: f64,
    },
    /// Evolves a machine toward a track of a MIDI file and renders the best.
    Evolve {
        /// The MIDI file holding the target notes.
        target: PathBuf,
        /// Where to write the rendered performance.
        output: PathBuf,
        /// The target track, counting from 1.
        #[arg(short, long, default_value_t = 1)]
        track: u16,
        /// How many generations to breed.
        #[arg(short, long, default_value_t = 100)]
        generations: usize,
        /// Evolves in the background for this long instead, e.g. "30s".
        #[arg(short, long)]
        duration: Option<String>,
        /// How many beats to render.
        #[arg(short, long, default_value_t = 32.0)]
        beats: f64,
    },
    /// Prints the header and track summary of a MIDI file.
    Info {
        /// The MIDI file to describe.
        path: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(seed) = cli.seed {
        settings.set_seed(seed);
    }

    match cli.command {
        Commands::Learn {
            input,
            output,
            track,
            all,
            max_beats,
            quantization,
            beats,
        } => {
            if let Some(quantization) = quantization {
                settings.set_quantization(quantization);
            }
            let driver = SmfDriver::new(&settings);
            let unit = settings.beat_unit();
            let mut machine = if all {
                driver.learn_all(&input)?
            } else {
                let max_duration = max_beats.map(|beats| TimeStamp::from_f64(unit, beats));
                driver.learn(&input, track, max_duration)?
            };
            print_machine(&machine);

            driver.run(&mut machine, &output, TimeStamp::from_f64(unit, beats))?;
            println!("Wrote {}.", output.display());
        }
        Commands::Evolve {
            target,
            output,
            track,
            generations,
            duration,
            beats,
        } => {
            let unit = settings.beat_unit();
            let problem = Problem::from_smf(&target, track, unit)?;
            println!(
                "Target: {} notes, {} distinct.",
                problem.target().n_notes(),
                problem.target().notes().count()
            );

            let mut evolver = Evolver::new(problem, None, settings.seed());
            let mut machine = match duration {
                Some(duration) => {
                    let duration: Duration = DurationString::from_string(duration)
                        .map_err(|e| format!("invalid duration: {}", e))?
                        .into();
                    let handle = evolver.start()?;
                    thread::sleep(duration);
                    let evolver = handle.stop()?;
                    info!(generations = evolver.generation(), "Evolution finished.");
                    evolver.best().cloned()
                }
                None => {
                    for _ in 0..generations {
                        evolver.iteration();
                    }
                    evolver.best().cloned()
                }
            }
            .ok_or("no machine evolved")?;

            print_machine(&machine);
            let driver = SmfDriver::new(&settings);
            driver.run(&mut machine, &output, TimeStamp::from_f64(unit, beats))?;
            println!("Wrote {}.", output.display());
        }
        Commands::Info { path } => {
            let mut reader = SmfReader::open(&path)?;
            println!(
                "{}: format {}, {} tracks, {} ppqn",
                path.display(),
                reader.format(),
                reader.num_tracks(),
                reader.ppqn()
            );
            for track in 1..=reader.num_tracks() {
                reader.seek_to_track(track)?;
                let mut events = 0;
                let mut notes = 0;
                let mut ticks: u64 = 0;
                while let Some(event) = reader.read_event()? {
                    events += 1;
                    ticks += event.delta;
                    if matches!(NoteEvent::parse(&event.bytes), Some(NoteEvent::On { .. })) {
                        notes += 1;
                    }
                }
                println!(
                    "- track {}: {} events, {} notes, {} ticks",
                    track, events, notes, ticks
                );
            }
        }
    };

    Ok(())
}

fn print_machine(machine: &Machine) {
    println!(
        "Machine: {} nodes, {} edges, {} initial.",
        machine.node_count(),
        machine.edge_count(),
        machine.initial_nodes().len()
    );
}
