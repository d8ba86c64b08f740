//! JSON exporter for offline display of a run.
//!
//! Frames are captured through a [`PopulationObserver`], so the exporter sees
//! exactly what a display would: the gathered population after each tick.

use parasim_core::{Agent, ModelConfig, PopulationObserver};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// The population after one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFrame {
    pub iteration: u64,

    /// `(id, x, y, value)` tuples in population order
    pub agents: Vec<Agent>,
}

/// Complete run export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunExport {
    /// Model parameters of the run
    pub config: ModelConfig,

    /// Ranks in the group, coordinator included
    pub world_size: usize,

    /// All frames
    pub frames: Vec<ExportFrame>,

    /// Iterations whose tick reported failures
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub degraded_iterations: Vec<u64>,
}

impl RunExport {
    /// Creates a new export container.
    pub fn new(config: ModelConfig, world_size: usize) -> Self {
        Self {
            config,
            world_size,
            frames: Vec::new(),
            degraded_iterations: Vec::new(),
        }
    }

    pub fn add_frame(&mut self, iteration: u64, population: &[Agent]) {
        self.frames.push(ExportFrame {
            iteration,
            agents: population.to_vec(),
        });
    }

    pub fn mark_degraded(&mut self, iteration: u64) {
        self.degraded_iterations.push(iteration);
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

/// Observer that appends a frame to a shared [`RunExport`] after each gather.
pub struct ExportObserver {
    export: Arc<Mutex<RunExport>>,
}

impl ExportObserver {
    pub fn new(export: Arc<Mutex<RunExport>>) -> Self {
        Self { export }
    }
}

impl PopulationObserver for ExportObserver {
    fn on_post_step(&mut self, iteration: u64, population: &[Agent]) {
        match self.export.lock() {
            Ok(mut export) => export.add_frame(iteration, population),
            Err(_) => tracing::warn!("Export buffer poisoned, dropping frame {}", iteration),
        }
    }
}
