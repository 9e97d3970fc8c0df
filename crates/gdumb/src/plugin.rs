//! Strategy plugins that rewrite a step's training data

use crate::{BalancedMemory, MemoryConfig, MemoryStats, Result, Sample};
use tracing::info;

/// Hook run by [`crate::TrainingFlow`] before each step is trained
pub trait StrategyPlugin: Send {
    /// Plugin name, used in logs
    fn name(&self) -> &str;

    /// Replace or filter the dataset the step trains on
    fn adapt_train_dataset(&mut self, step_id: usize, dataset: Vec<Sample>) -> Result<Vec<Sample>>;
}

/// GDumb plugin.
///
/// Every step trains on the balanced memory alone. New data only matters
/// through what it changes in memory. Combined with a plain training flow this
/// gives the standard GDumb strategy.
#[derive(Debug, Clone)]
pub struct GDumbPlugin {
    memory: BalancedMemory,
}

impl GDumbPlugin {
    /// Create new plugin
    pub fn new(config: MemoryConfig) -> Result<Self> {
        Ok(Self {
            memory: BalancedMemory::new(config)?,
        })
    }

    /// Create new plugin with the given memory size
    pub fn with_mem_size(mem_size: usize) -> Result<Self> {
        Self::new(MemoryConfig { mem_size })
    }

    /// Get the memory
    pub fn memory(&self) -> &BalancedMemory {
        &self.memory
    }

    /// Get memory statistics
    pub fn stats(&self) -> MemoryStats {
        self.memory.stats()
    }
}

impl StrategyPlugin for GDumbPlugin {
    fn name(&self) -> &str {
        "gdumb"
    }

    fn adapt_train_dataset(&mut self, step_id: usize, dataset: Vec<Sample>) -> Result<Vec<Sample>> {
        let report = self.memory.process_step_with_report(dataset)?;

        info!(
            "GDumb step {}: admitted {}/{} samples, memory {}/{} over {} classes",
            step_id,
            report.admitted(),
            report.incoming,
            self.memory.len(),
            self.memory.capacity(),
            self.memory.counts().len()
        );

        Ok(self.memory.samples().to_vec())
    }
}
