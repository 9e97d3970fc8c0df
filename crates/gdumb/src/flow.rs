//! Per-step training flow with strategy plugins

use crate::{plugin::StrategyPlugin, GDumbError, Result, Sample};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Flow configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Samples per minibatch
    pub batch_size: usize,
    /// Passes over the adapted dataset per step
    pub epochs: usize,
    /// Shuffle before each epoch
    pub shuffle: bool,
    /// Random seed
    pub seed: Option<u64>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 1,
            shuffle: true,
            seed: None,
        }
    }
}

impl FlowConfig {
    /// Reject unusable configurations
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(GDumbError::ConfigError("batch_size must be positive".into()));
        }
        if self.epochs == 0 {
            return Err(GDumbError::ConfigError("epochs must be positive".into()));
        }
        Ok(())
    }
}

/// Result of one trained step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    /// Step identifier
    pub step_id: usize,
    /// Dataset size after plugins ran
    pub dataset_size: usize,
    /// Minibatches trained
    pub batches: usize,
    /// Mean loss over minibatches (0 when nothing was trained)
    pub mean_loss: f32,
}

/// Flow statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowStats {
    /// Steps trained
    pub total_steps: usize,
    /// Minibatches trained
    pub total_batches: usize,
    /// Samples fed to the training callback
    pub total_samples: usize,
    /// Running loss
    pub running_loss: f32,
}

impl FlowStats {
    /// Update with one minibatch
    pub fn update(&mut self, loss: f32, samples: usize) {
        self.total_batches += 1;
        self.total_samples += samples;

        // Exponential moving average of loss
        if self.total_batches == 1 {
            self.running_loss = loss;
        } else {
            self.running_loss = 0.99 * self.running_loss + 0.01 * loss;
        }
    }
}

/// Naive training flow.
///
/// Each step runs every plugin's dataset hook in registration order, then
/// hands the result to a training callback in minibatches.
pub struct TrainingFlow {
    config: FlowConfig,
    plugins: Vec<Box<dyn StrategyPlugin>>,
    rng: StdRng,
    stats: FlowStats,
}

impl TrainingFlow {
    /// Create new flow
    pub fn new(config: FlowConfig) -> Result<Self> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config,
            plugins: Vec::new(),
            rng,
            stats: FlowStats::default(),
        })
    }

    /// Register a plugin
    pub fn with_plugin(mut self, plugin: Box<dyn StrategyPlugin>) -> Self {
        self.add_plugin(plugin);
        self
    }

    /// Register a plugin
    pub fn add_plugin(&mut self, plugin: Box<dyn StrategyPlugin>) {
        debug!("Registered plugin '{}'", plugin.name());
        self.plugins.push(plugin);
    }

    /// Names of registered plugins
    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Adapt the step dataset through all plugins without training.
    ///
    /// Plugins run in registration order and each keeps whatever state it
    /// updated. If a later plugin fails, the earlier ones are not rolled back.
    pub fn adapt_train_dataset(
        &mut self,
        step_id: usize,
        dataset: Vec<Sample>,
    ) -> Result<Vec<Sample>> {
        let mut dataset = dataset;
        for plugin in &mut self.plugins {
            dataset = plugin.adapt_train_dataset(step_id, dataset)?;
        }
        Ok(dataset)
    }

    /// Train one step.
    ///
    /// Plugin state changes made before a plugin or training error are kept;
    /// see [`TrainingFlow::adapt_train_dataset`].
    pub fn train_step<F>(
        &mut self,
        step_id: usize,
        dataset: Vec<Sample>,
        mut train_fn: F,
    ) -> Result<StepSummary>
    where
        F: FnMut(&[&Sample]) -> Result<f32>,
    {
        let dataset = self.adapt_train_dataset(step_id, dataset)?;

        let mut batches = 0;
        let mut loss_sum = 0.0f32;

        for _ in 0..self.config.epochs {
            let order = self.epoch_order(dataset.len());

            for chunk in order.chunks(self.config.batch_size) {
                let batch: Vec<&Sample> = chunk.iter().map(|&i| &dataset[i]).collect();
                let loss = train_fn(&batch)?;

                loss_sum += loss;
                batches += 1;
                self.stats.update(loss, batch.len());
            }
        }

        self.stats.total_steps += 1;

        let mean_loss = if batches == 0 {
            0.0
        } else {
            loss_sum / batches as f32
        };

        info!(
            "Step {} trained on {} samples in {} batches, mean loss {:.4}",
            step_id,
            dataset.len(),
            batches,
            mean_loss
        );

        Ok(StepSummary {
            step_id,
            dataset_size: dataset.len(),
            batches,
            mean_loss,
        })
    }

    /// Sample visiting order for one epoch
    fn epoch_order(&mut self, n: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..n).collect();
        if self.config.shuffle {
            order.shuffle(&mut self.rng);
        }
        order
    }

    /// Get flow statistics
    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    /// Get configuration
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }
}

impl std::fmt::Debug for TrainingFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingFlow")
            .field("config", &self.config)
            .field("plugins", &self.plugin_names())
            .field("stats", &self.stats)
            .finish()
    }
}
