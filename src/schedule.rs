//! Per-cycle epoch schedule derived from the human-facing sample count.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Epoch counts of a cyclic sampling run. Computed once per run and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub warmup_epochs: usize,
    pub burnin_epochs: usize,
    /// Epochs per cycle from which samples are collected.
    pub sample_epochs: usize,
    /// `warmup_epochs + burnin_epochs + sample_epochs`.
    pub epochs_per_cycle: usize,
    pub cycles: usize,
    pub skip: usize,
    total_epochs: usize,
}

impl Schedule {
    /// Turns `(n_samples, skip, cycles, warmup, burnin)` into per-cycle epoch counts.
    ///
    /// `n_samples * skip` must be divisible by `cycles`; otherwise the integer division would
    /// silently collect fewer samples than requested, so it is rejected instead.
    pub fn compute(
        n_samples: usize,
        skip: usize,
        cycles: usize,
        warmup: usize,
        burnin: usize,
    ) -> Result<Self, ConfigError> {
        for (field, value) in [("n_samples", n_samples), ("skip", skip), ("cycles", cycles)] {
            if value == 0 {
                return Err(ConfigError::NonPositive {
                    field,
                    value: value.to_string(),
                });
            }
        }
        let product = n_samples
            .checked_mul(skip)
            .ok_or(ConfigError::Overflow { n_samples, skip })?;
        if product % cycles != 0 {
            return Err(ConfigError::Indivisible {
                n_samples,
                skip,
                cycles,
                product,
            });
        }
        let sample_epochs = product / cycles;
        let epochs_per_cycle = warmup
            .checked_add(burnin)
            .and_then(|e| e.checked_add(sample_epochs))
            .ok_or(ConfigError::Overflow { n_samples, skip })?;
        let total_epochs = epochs_per_cycle
            .checked_mul(cycles)
            .ok_or(ConfigError::Overflow { n_samples, skip })?;
        Ok(Self {
            warmup_epochs: warmup,
            burnin_epochs: burnin,
            sample_epochs,
            epochs_per_cycle,
            cycles,
            skip,
            total_epochs,
        })
    }

    /// `epochs_per_cycle * cycles`.
    pub fn total_epochs(&self) -> usize {
        self.total_epochs
    }

    /// Number of samples the schedule yields when one is kept every `skip` sampling epochs.
    pub fn n_samples(&self) -> usize {
        self.sample_epochs * self.cycles / self.skip
    }

    /// Phase of `epoch` (counted from the start of its cycle).
    pub fn phase(&self, epoch: usize) -> Phase {
        if epoch < self.warmup_epochs {
            Phase::Warmup
        } else if epoch < self.warmup_epochs + self.burnin_epochs {
            Phase::Burnin
        } else {
            Phase::Sampling
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Burnin,
    Sampling,
}
