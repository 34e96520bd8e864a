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
//! A small genetic search for machines that play like a target sequence.
use std::{
    cmp::Ordering as CmpOrdering,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, span, Level};

use crate::{
    machine::Machine,
    mutation::{HybridMutation, Mutation},
};

mod problem;

pub use problem::{NoteStats, Problem, DEFAULT_ORDER};

/// Individuals per generation.
pub const DEFAULT_POPULATION_SIZE: usize = 10;

/// Individuals carried over unchanged into the next generation.
pub const DEFAULT_ELITES: usize = 2;

/// Individuals drawn for each tournament.
pub const DEFAULT_TOURNAMENT_SIZE: usize = 3;

/// Chance that a tournament goes to its fittest entrant.
pub const DEFAULT_TOURNAMENT_PROBABILITY: f64 = 0.8;

#[derive(Debug, thiserror::Error)]
pub enum EvolverError {
    #[error("unable to start evolver thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("evolver thread panicked")]
    ThreadPanicked,
}

struct Individual {
    machine: Machine,
    fitness: f32,
}

/// Evolves a population of machines toward a [`Problem`].
pub struct Evolver {
    problem: Problem,
    mutation: Box<dyn Mutation>,
    population: Vec<Individual>,
    population_size: usize,
    elites: usize,
    tournament_size: usize,
    tournament_probability: f64,
    generation: usize,
    rng: StdRng,
}

impl Evolver {
    /// Creates an evolver with a random initial population over the
    /// target's notes. A seed machine, if given, joins that population.
    pub fn new(problem: Problem, seed_machine: Option<&Machine>, seed: Option<u64>) -> Evolver {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut population = Vec::with_capacity(DEFAULT_POPULATION_SIZE);
        if let Some(machine) = seed_machine {
            let machine = machine.clone();
            let fitness = problem.fitness(&machine);
            population.push(Individual { machine, fitness });
        }
        while population.len() < DEFAULT_POPULATION_SIZE {
            let machine = problem.random_machine(&mut rng);
            let fitness = problem.fitness(&machine);
            population.push(Individual { machine, fitness });
        }
        sort_by_fitness(&mut population);

        Evolver {
            problem,
            mutation: Box::new(HybridMutation::uniform()),
            population,
            population_size: DEFAULT_POPULATION_SIZE,
            elites: DEFAULT_ELITES,
            tournament_size: DEFAULT_TOURNAMENT_SIZE,
            tournament_probability: DEFAULT_TOURNAMENT_PROBABILITY,
            generation: 0,
            rng,
        }
    }

    /// Replaces the mutation applied to every offspring.
    pub fn set_mutation(&mut self, mutation: Box<dyn Mutation>) {
        self.mutation = mutation;
    }

    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn best_fitness(&self) -> f32 {
        self.population
            .first()
            .map_or(f32::MIN, |individual| individual.fitness)
    }

    pub fn best(&self) -> Option<&Machine> {
        self.population.first().map(|individual| &individual.machine)
    }

    /// Breeds one generation: the elites survive and everyone else is a
    /// mutated copy of a tournament winner.
    pub fn iteration(&mut self) {
        let mut next = Vec::with_capacity(self.population_size);
        for elite in self.population.iter().take(self.elites) {
            next.push(Individual {
                machine: elite.machine.clone(),
                fitness: elite.fitness,
            });
        }

        while next.len() < self.population_size {
            let parent = self.tournament();
            let mut machine = self.population[parent].machine.clone();
            machine.seed(self.rng.gen());
            self.mutation.mutate(&mut machine);
            let fitness = self.problem.fitness(&machine);
            next.push(Individual { machine, fitness });
        }

        sort_by_fitness(&mut next);
        self.population = next;
        self.generation += 1;
        debug!(
            generation = self.generation,
            best = self.best_fitness(),
            "Finished generation."
        );
    }

    /// Picks a parent. The population is kept sorted, so the entrant with
    /// the lowest index is the fittest.
    fn tournament(&mut self) -> usize {
        let size = self.tournament_size.clamp(1, self.population.len());
        let mut entrants: Vec<usize> = (0..size)
            .map(|_| self.rng.gen_range(0..self.population.len()))
            .collect();
        entrants.sort_unstable();

        for entrant in entrants.iter() {
            if self.rng.gen_bool(self.tournament_probability) {
                return *entrant;
            }
        }
        entrants[entrants.len() - 1]
    }

    /// Runs generations on a background thread until stopped.
    pub fn start(self) -> Result<EvolverHandle, EvolverError> {
        let best = Arc::new(Mutex::new(self.best().cloned().map(|machine| Best {
            machine,
            fitness: self.best_fitness(),
        })));
        let stop = Arc::new(AtomicBool::new(false));
        let generations = Arc::new(AtomicUsize::new(0));

        let join_handle = {
            let best = best.clone();
            let stop = stop.clone();
            let generations = generations.clone();
            thread::Builder::new()
                .name("machina-evolver".into())
                .spawn(move || evolve(self, best, stop, generations))?
        };

        Ok(EvolverHandle {
            best,
            stop,
            generations,
            join_handle: Some(join_handle),
        })
    }
}

/// The best machine found so far and its score.
#[derive(Clone, Debug)]
pub struct Best {
    pub machine: Machine,
    pub fitness: f32,
}

/// Control over an evolver running on a background thread.
pub struct EvolverHandle {
    best: Arc<Mutex<Option<Best>>>,
    stop: Arc<AtomicBool>,
    generations: Arc<AtomicUsize>,
    join_handle: Option<JoinHandle<Evolver>>,
}

impl EvolverHandle {
    /// A copy of the best machine found so far.
    pub fn best(&self) -> Option<Best> {
        self.best.lock().clone()
    }

    pub fn generations(&self) -> usize {
        self.generations.load(Ordering::Relaxed)
    }

    /// Stops the thread after its current generation and hands back the
    /// evolver.
    pub fn stop(mut self) -> Result<Evolver, EvolverError> {
        self.stop.store(true, Ordering::Release);
        match self.join_handle.take() {
            Some(join_handle) => join_handle.join().map_err(|_| EvolverError::ThreadPanicked),
            None => Err(EvolverError::ThreadPanicked),
        }
    }
}

impl Drop for EvolverHandle {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            self.stop.store(true, Ordering::Release);
            let _ = join_handle.join();
        }
    }
}

fn evolve(
    mut evolver: Evolver,
    best: Arc<Mutex<Option<Best>>>,
    stop: Arc<AtomicBool>,
    generations: Arc<AtomicUsize>,
) -> Evolver {
    let span = span!(Level::INFO, "evolver");
    let _enter = span.enter();

    let mut best_fitness = evolver.best_fitness();
    info!(fitness = best_fitness, "Evolving.");
    while !stop.load(Ordering::Acquire) {
        evolver.iteration();
        generations.fetch_add(1, Ordering::Relaxed);

        let fitness = evolver.best_fitness();
        if fitness > best_fitness {
            best_fitness = fitness;
            if let Some(machine) = evolver.best() {
                *best.lock() = Some(Best {
                    machine: machine.clone(),
                    fitness,
                });
            }
            info!(
                generation = evolver.generation(),
                fitness, "Found a better machine."
            );
        }
    }
    info!(generations = evolver.generation(), "Evolver stopped.");
    evolver
}

fn sort_by_fitness(population: &mut [Individual]) {
    population.sort_by(|a, b| {
        b.fitness
            .partial_cmp(&a.fitness)
            .unwrap_or(CmpOrdering::Equal)
    });
}
