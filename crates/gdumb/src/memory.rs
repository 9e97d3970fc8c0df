//! Class-balanced exemplar memory
//!
//! The memory admits a sample while its class is below the per-class quota
//! (`capacity / classes_seen`). Below capacity admitted samples are appended;
//! at capacity they overwrite a sample of the most represented class, lowest
//! label first on ties.

use crate::{GDumbError, Label, Result, Sample};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Per-class sample counts, ordered by label
pub type ClassCounts = BTreeMap<Label, usize>;

/// Memory configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of stored samples
    pub mem_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { mem_size: 200 }
    }
}

impl MemoryConfig {
    /// Reject unusable configurations
    pub fn validate(&self) -> Result<()> {
        if self.mem_size == 0 {
            return Err(GDumbError::ConfigError("mem_size must be positive".into()));
        }
        Ok(())
    }
}

/// Outcome of one processed step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Samples offered
    pub incoming: usize,
    /// Samples appended to free slots
    pub appended: usize,
    /// Samples that overwrote an evicted sample
    pub replaced: usize,
    /// Samples rejected by the class quota
    pub discarded: usize,
    /// Evictions per class
    pub evicted: ClassCounts,
}

impl StepReport {
    /// Samples that entered memory
    pub fn admitted(&self) -> usize {
        self.appended + self.replaced
    }

    fn absorb(&mut self, other: &StepReport) {
        self.incoming += other.incoming;
        self.appended += other.appended;
        self.replaced += other.replaced;
        self.discarded += other.discarded;
        for (&label, &n) in &other.evicted {
            *self.evicted.entry(label).or_insert(0) += n;
        }
    }
}

/// Statistics about the memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Stored samples
    pub size: usize,
    /// Capacity
    pub capacity: usize,
    /// Classes seen
    pub num_classes: usize,
    /// Current quota
    pub quota: usize,
    /// Steps processed
    pub steps: usize,
    /// Totals over every processed step
    pub totals: StepReport,
}

/// Serializable memory state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Configuration
    pub config: MemoryConfig,
    /// Stored samples, in slot order
    pub samples: Vec<Sample>,
    /// Class counts
    pub counts: ClassCounts,
    /// Steps processed
    #[serde(default)]
    pub steps: usize,
    /// Totals over every processed step
    #[serde(default)]
    pub totals: StepReport,
}

/// GDumb balanced reservoir memory
#[derive(Debug, Clone)]
pub struct BalancedMemory {
    config: MemoryConfig,
    samples: Vec<Sample>,
    counts: ClassCounts,
    /// Shape fixed by the first stored sample
    feature_shape: Option<Vec<usize>>,
    steps: usize,
    totals: StepReport,
    /// Set once an invariant violation is detected
    poisoned: Option<String>,
}

impl BalancedMemory {
    /// Create new memory
    pub fn new(config: MemoryConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            samples: Vec::with_capacity(config.mem_size),
            config,
            counts: ClassCounts::new(),
            feature_shape: None,
            steps: 0,
            totals: StepReport::default(),
            poisoned: None,
        })
    }

    /// Create new memory with the given capacity
    pub fn with_capacity(mem_size: usize) -> Result<Self> {
        Self::new(MemoryConfig { mem_size })
    }

    /// Restore memory from a snapshot, re-checking every invariant
    pub fn from_snapshot(snapshot: MemorySnapshot) -> Result<Self> {
        let mut memory = Self::new(snapshot.config)?;
        memory.validate_batch(&snapshot.samples)?;

        memory.feature_shape = snapshot.samples.first().map(|s| s.shape().to_vec());
        memory.samples = snapshot.samples;
        memory.counts = snapshot.counts;
        memory.steps = snapshot.steps;
        memory.totals = snapshot.totals;
        memory.check_invariants()?;

        Ok(memory)
    }

    /// Ingest one step's samples and return the updated memory
    pub fn process_step(&mut self, incoming: Vec<Sample>) -> Result<&[Sample]> {
        self.process_step_with_report(incoming)?;
        Ok(&self.samples)
    }

    /// Ingest one step's samples and report what happened to them.
    ///
    /// The batch is validated before any state changes, so an error leaves
    /// the memory as it was.
    pub fn process_step_with_report(&mut self, incoming: Vec<Sample>) -> Result<StepReport> {
        self.ensure_healthy()?;
        self.validate_batch(&incoming)?;

        let mut report = StepReport {
            incoming: incoming.len(),
            ..Default::default()
        };

        for sample in incoming {
            let label = sample.label();
            let quota = self.quota();
            let eligible = self.counts.get(&label).map_or(true, |&count| count < quota);

            if !eligible {
                report.discarded += 1;
                continue;
            }

            if self.is_full() {
                let evicted = self.replace_most_represented(sample)?;
                *report.evicted.entry(evicted).or_insert(0) += 1;
                report.replaced += 1;
            } else {
                if self.feature_shape.is_none() {
                    self.feature_shape = Some(sample.shape().to_vec());
                }
                self.samples.push(sample);
                report.appended += 1;
            }

            *self.counts.entry(label).or_insert(0) += 1;
        }

        debug_assert!(
            self.check_invariants().is_ok(),
            "memory invariants broken after step"
        );

        self.steps += 1;
        self.totals.absorb(&report);

        debug!(
            "Step processed: {} in, {} appended, {} replaced, {} discarded, {}/{} stored",
            report.incoming,
            report.appended,
            report.replaced,
            report.discarded,
            self.samples.len(),
            self.config.mem_size
        );

        Ok(report)
    }

    /// Per-class quota for the next sample
    pub fn quota(&self) -> usize {
        if self.counts.is_empty() {
            // Any positive value; only admits the first sample
            1
        } else {
            self.config.mem_size / self.counts.len()
        }
    }

    /// Recompute class counts from the stored samples and compare.
    ///
    /// Labels may keep a zero count after their last sample was evicted;
    /// they still count as seen for the quota.
    pub fn check_invariants(&self) -> Result<()> {
        if self.samples.len() > self.config.mem_size {
            return Err(GDumbError::InvariantViolation(format!(
                "{} samples exceed capacity {}",
                self.samples.len(),
                self.config.mem_size
            )));
        }

        let mut actual = ClassCounts::new();
        for sample in &self.samples {
            *actual.entry(sample.label()).or_insert(0) += 1;
        }

        for (&label, &count) in &actual {
            let recorded = self.counts.get(&label).copied().unwrap_or(0);
            if recorded != count {
                return Err(GDumbError::InvariantViolation(format!(
                    "class {} has {} samples but count {}",
                    label, count, recorded
                )));
            }
        }

        for (&label, &count) in &self.counts {
            if count > 0 && !actual.contains_key(&label) {
                return Err(GDumbError::InvariantViolation(format!(
                    "class {} counted {} times but absent from memory",
                    label, count
                )));
            }
        }

        Ok(())
    }

    /// Stored samples
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Class counts
    pub fn counts(&self) -> &ClassCounts {
        &self.counts
    }

    /// Count for one class
    pub fn count(&self, label: Label) -> usize {
        self.counts.get(&label).copied().unwrap_or(0)
    }

    /// Number of stored samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Is memory empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Is memory full
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.config.mem_size
    }

    /// Capacity
    pub fn capacity(&self) -> usize {
        self.config.mem_size
    }

    /// Get configuration
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Feature shape of stored samples, once known
    pub fn feature_shape(&self) -> Option<&[usize]> {
        self.feature_shape.as_deref()
    }

    /// Get statistics
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            size: self.samples.len(),
            capacity: self.config.mem_size,
            num_classes: self.counts.len(),
            quota: self.quota(),
            steps: self.steps,
            totals: self.totals.clone(),
        }
    }

    /// Capture state for checkpointing
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            config: self.config.clone(),
            samples: self.samples.clone(),
            counts: self.counts.clone(),
            steps: self.steps,
            totals: self.totals.clone(),
        }
    }

    /// Drop all samples and counts; capacity is kept
    pub fn clear(&mut self) {
        self.samples.clear();
        self.counts.clear();
        self.feature_shape = None;
        self.steps = 0;
        self.totals = StepReport::default();
        self.poisoned = None;
    }

    fn ensure_healthy(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(GDumbError::InvariantViolation(reason.clone())),
            None => Ok(()),
        }
    }

    /// All samples in a batch must share the memory's feature shape
    fn validate_batch(&self, batch: &[Sample]) -> Result<()> {
        let expected = match (&self.feature_shape, batch.first()) {
            (Some(shape), _) => shape.as_slice(),
            (None, Some(first)) => first.shape(),
            (None, None) => return Ok(()),
        };

        for sample in batch {
            if sample.shape() != expected {
                return Err(GDumbError::ShapeMismatch {
                    expected: expected.to_vec(),
                    got: sample.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Label with the highest count, lowest label on ties
    fn most_represented(&self) -> Option<Label> {
        let mut best: Option<(Label, usize)> = None;
        for (&label, &count) in &self.counts {
            if best.map_or(true, |(_, top)| count > top) {
                best = Some((label, count));
            }
        }
        best.map(|(label, _)| label)
    }

    /// Overwrite the first slot of the most represented class
    fn replace_most_represented(&mut self, sample: Sample) -> Result<Label> {
        let victim = match self.most_represented() {
            Some(label) => label,
            None => return Err(self.poison("memory is full but no class is counted".into())),
        };

        let slot = self.samples.iter().position(|s| s.label() == victim);
        let slot = match slot {
            Some(slot) => slot,
            None => {
                return Err(self.poison(format!(
                    "class {} is most represented but has no stored sample",
                    victim
                )))
            }
        };

        debug!(
            "Evicting class {} from slot {} for class {}",
            victim,
            slot,
            sample.label()
        );

        self.samples[slot] = sample;
        if let Some(count) = self.counts.get_mut(&victim) {
            *count -= 1;
        }

        Ok(victim)
    }

    fn poison(&mut self, reason: String) -> GDumbError {
        warn!("Replay memory poisoned: {}", reason);
        if cfg!(debug_assertions) {
            panic!("replay memory invariant violated: {}", reason);
        }
        self.poisoned = Some(reason.clone());
        GDumbError::InvariantViolation(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(label: Label, value: f32) -> Sample {
        Sample::from_vec(vec![value, value], label).unwrap()
    }

    fn labelled(labels: &[Label]) -> Vec<Sample> {
        labels
            .iter()
            .enumerate()
            .map(|(i, &label)| sample(label, i as f32))
            .collect()
    }

    fn labels_of(memory: &BalancedMemory) -> Vec<Label> {
        memory.samples().iter().map(|s| s.label()).collect()
    }

    #[test]
    fn test_memory_creation() {
        let memory = BalancedMemory::new(MemoryConfig::default()).unwrap();

        assert!(memory.is_empty());
        assert_eq!(memory.capacity(), 200);
        assert_eq!(memory.quota(), 1);
        assert!(memory.feature_shape().is_none());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = BalancedMemory::with_capacity(0).unwrap_err();
        assert!(matches!(err, GDumbError::ConfigError(_)));
    }

    #[test]
    fn test_fill_then_evict_from_majority() {
        let mut memory = BalancedMemory::with_capacity(4).unwrap();

        let stored = memory.process_step(labelled(&[0, 0, 0, 0])).unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(memory.counts(), &ClassCounts::from([(0, 4)]));

        let report = memory.process_step_with_report(labelled(&[1])).unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(report.evicted, ClassCounts::from([(0, 1)]));
        assert_eq!(memory.len(), 4);
        assert_eq!(memory.counts(), &ClassCounts::from([(0, 3), (1, 1)]));
    }

    #[test]
    fn test_empty_step_is_noop() {
        let mut memory = BalancedMemory::with_capacity(4).unwrap();
        memory.process_step(labelled(&[0, 1, 1])).unwrap();
        let before = memory.snapshot();

        let report = memory.process_step_with_report(Vec::new()).unwrap();

        assert_eq!(report, StepReport::default());
        assert_eq!(memory.samples(), before.samples.as_slice());
        assert_eq!(memory.counts(), &before.counts);
    }

    #[test]
    fn test_quota_boundary_discards() {
        let mut memory = BalancedMemory::with_capacity(10).unwrap();
        memory
            .process_step(labelled(&[0, 0, 0, 0, 0, 1, 1, 1, 1, 1]))
            .unwrap();
        assert_eq!(memory.counts(), &ClassCounts::from([(0, 5), (1, 5)]));
        assert_eq!(memory.quota(), 5);

        let before = memory.snapshot();
        let report = memory.process_step_with_report(labelled(&[0])).unwrap();

        assert_eq!(report.discarded, 1);
        assert_eq!(report.admitted(), 0);
        assert_eq!(memory.samples(), before.samples.as_slice());
        assert_eq!(memory.counts(), &before.counts);
    }

    #[test]
    fn test_tie_break_evicts_lowest_label_first_slot() {
        let mut memory = BalancedMemory::with_capacity(4).unwrap();
        memory
            .process_step(vec![
                sample(1, 10.0),
                sample(0, 20.0),
                sample(1, 30.0),
                sample(0, 40.0),
            ])
            .unwrap();
        assert_eq!(memory.counts(), &ClassCounts::from([(0, 2), (1, 2)]));

        memory.process_step(vec![sample(2, 99.0)]).unwrap();

        // First label-0 slot is index 1
        assert_eq!(labels_of(&memory), vec![1, 2, 1, 0]);
        assert_eq!(memory.samples()[1].features(), &[99.0, 99.0]);
        assert_eq!(memory.counts(), &ClassCounts::from([(0, 1), (1, 2), (2, 1)]));
    }

    #[test]
    fn test_quota_shrinks_within_step() {
        let mut memory = BalancedMemory::with_capacity(6).unwrap();

        // Class 1 halves the quota while class 0 already holds 4
        let report = memory
            .process_step_with_report(labelled(&[0, 0, 0, 0, 1, 0, 0, 0]))
            .unwrap();

        assert_eq!(memory.counts(), &ClassCounts::from([(0, 4), (1, 1)]));
        assert_eq!(report.appended, 5);
        assert_eq!(report.discarded, 3);
        assert_eq!(memory.quota(), 3);
    }

    #[test]
    fn test_no_eviction_below_capacity() {
        let mut memory = BalancedMemory::with_capacity(10).unwrap();

        let report = memory
            .process_step_with_report(labelled(&[3, 1, 2, 3, 1]))
            .unwrap();

        assert_eq!(report.appended, 5);
        assert_eq!(report.replaced, 0);
        assert_eq!(labels_of(&memory), vec![3, 1, 2, 3, 1]);
    }

    #[test]
    fn test_zero_count_class_still_counts_as_seen() {
        let mut memory = BalancedMemory::with_capacity(2).unwrap();
        memory.process_step(labelled(&[0, 1])).unwrap();

        memory.process_step(labelled(&[2])).unwrap();
        assert_eq!(memory.counts(), &ClassCounts::from([(0, 0), (1, 1), (2, 1)]));
        assert_eq!(memory.quota(), 0);
        memory.check_invariants().unwrap();

        // Quota of zero keeps known classes out
        let report = memory.process_step_with_report(labelled(&[0, 1])).unwrap();
        assert_eq!(report.discarded, 2);
    }

    #[test]
    fn test_shape_mismatch_leaves_state_untouched() {
        let mut memory = BalancedMemory::with_capacity(4).unwrap();
        memory.process_step(labelled(&[0])).unwrap();
        let before = memory.snapshot();

        let bad = vec![
            sample(1, 1.0),
            Sample::from_vec(vec![1.0, 2.0, 3.0], 1).unwrap(),
        ];
        let err = memory.process_step(bad).unwrap_err();

        assert_eq!(
            err,
            GDumbError::ShapeMismatch {
                expected: vec![2],
                got: vec![3],
            }
        );
        assert_eq!(memory.snapshot(), before);
    }

    #[test]
    fn test_stats_accumulate() {
        let mut memory = BalancedMemory::with_capacity(4).unwrap();
        memory.process_step(labelled(&[0, 0, 0, 0, 0])).unwrap();
        memory.process_step(labelled(&[1, 1, 1])).unwrap();

        let stats = memory.stats();
        assert_eq!(stats.steps, 2);
        assert_eq!(stats.size, 4);
        assert_eq!(stats.num_classes, 2);
        assert_eq!(stats.quota, 2);
        assert_eq!(stats.totals.incoming, 8);
        assert_eq!(stats.totals.appended, 4);
        assert_eq!(stats.totals.replaced, 2);
        assert_eq!(stats.totals.discarded, 2);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut memory = BalancedMemory::with_capacity(5).unwrap();
        memory.process_step(labelled(&[4, 2, 4, 7, 2, 2])).unwrap();

        let json = serde_json::to_string(&memory.snapshot()).unwrap();
        let restored: MemorySnapshot = serde_json::from_str(&json).unwrap();
        let restored = BalancedMemory::from_snapshot(restored).unwrap();

        assert_eq!(restored.samples(), memory.samples());
        assert_eq!(restored.counts(), memory.counts());
        assert_eq!(restored.feature_shape(), Some(&[2usize][..]));
    }

    #[test]
    fn test_snapshot_with_bad_counts_rejected() {
        let mut memory = BalancedMemory::with_capacity(5).unwrap();
        memory.process_step(labelled(&[0, 1])).unwrap();

        let mut snapshot = memory.snapshot();
        snapshot.counts.insert(1, 3);

        let err = BalancedMemory::from_snapshot(snapshot).unwrap_err();
        assert!(matches!(err, GDumbError::InvariantViolation(_)));
    }

    #[test]
    fn test_snapshot_over_capacity_rejected() {
        let snapshot = MemorySnapshot {
            config: MemoryConfig { mem_size: 1 },
            samples: labelled(&[0, 0]),
            counts: ClassCounts::from([(0, 2)]),
            steps: 1,
            totals: StepReport::default(),
        };

        let err = BalancedMemory::from_snapshot(snapshot).unwrap_err();
        assert!(matches!(err, GDumbError::InvariantViolation(_)));
    }

    #[test]
    fn test_clear() {
        let mut memory = BalancedMemory::with_capacity(3).unwrap();
        memory.process_step(labelled(&[0, 1, 2])).unwrap();

        memory.clear();

        assert!(memory.is_empty());
        assert!(memory.counts().is_empty());
        assert_eq!(memory.capacity(), 3);
        assert_eq!(memory.stats().steps, 0);

        // Shape is free again after clearing
        memory
            .process_step(vec![Sample::from_vec(vec![1.0], 0).unwrap()])
            .unwrap();
        assert_eq!(memory.feature_shape(), Some(&[1usize][..]));
    }

    #[test]
    fn test_snapshot_keeps_stats() {
        let mut memory = BalancedMemory::with_capacity(3).unwrap();
        memory.process_step(labelled(&[0, 0, 0, 0])).unwrap();
        memory.process_step(labelled(&[1])).unwrap();

        let json = serde_json::to_string(&memory.snapshot()).unwrap();
        let restored: MemorySnapshot = serde_json::from_str(&json).unwrap();
        let restored = BalancedMemory::from_snapshot(restored).unwrap();

        assert_eq!(restored.stats(), memory.stats());
        assert_eq!(restored.stats().steps, 2);
        assert_eq!(restored.stats().totals.replaced, 1);
    }

    fn snapshot_json(features: Vec<f32>, shape: Vec<usize>) -> serde_json::Value {
        serde_json::json!({
            "config": { "mem_size": 4 },
            "samples": [{ "features": features, "shape": shape, "label": 0 }],
            "counts": { "0": 1 }
        })
    }

    #[test]
    fn test_snapshot_without_stats_starts_at_zero() {
        let snapshot: MemorySnapshot =
            serde_json::from_value(snapshot_json(vec![1.0], vec![1])).unwrap();
        let memory = BalancedMemory::from_snapshot(snapshot).unwrap();

        assert_eq!(memory.len(), 1);
        assert_eq!(memory.stats().steps, 0);
    }

    #[test]
    fn test_snapshot_with_malformed_sample_rejected() {
        let empty = serde_json::from_value::<MemorySnapshot>(snapshot_json(Vec::new(), vec![3]));
        assert!(empty.is_err());

        let short =
            serde_json::from_value::<MemorySnapshot>(snapshot_json(vec![1.0, 2.0], vec![3]));
        assert!(short.is_err());
    }
}
