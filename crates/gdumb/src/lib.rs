//! Class-balanced replay memory for continual learning
//!
//! This crate implements the GDumb memory strategy:
//! - Fixed-capacity exemplar memory kept close to class-balanced
//! - Quota-based admission with eviction from the most represented class
//! - A plugin hook that swaps each step's training data for the memory
//! - A minimal per-step training flow that runs plugins and minibatches
//!
//! ```rust
//! use gdumb::{BalancedMemory, Sample};
//!
//! let mut memory = BalancedMemory::with_capacity(4)?;
//! let step: Vec<Sample> = (0..4)
//!     .map(|_| Sample::from_vec(vec![0.0, 1.0], 0))
//!     .collect::<gdumb::Result<_>>()?;
//!
//! memory.process_step(step)?;
//! memory.process_step(vec![Sample::from_vec(vec![1.0, 0.0], 1)?])?;
//!
//! assert_eq!(memory.count(0), 3);
//! assert_eq!(memory.count(1), 1);
//! # Ok::<(), gdumb::GDumbError>(())
//! ```

mod error;
mod flow;
mod memory;
mod plugin;
mod sample;

pub use error::{GDumbError, Result};
pub use flow::{FlowConfig, FlowStats, StepSummary, TrainingFlow};
pub use memory::{
    BalancedMemory, ClassCounts, MemoryConfig, MemorySnapshot, MemoryStats, StepReport,
};
pub use plugin::{GDumbPlugin, StrategyPlugin};
pub use sample::{Label, Sample};
