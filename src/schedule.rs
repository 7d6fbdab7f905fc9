use crate::config::{LrPolicy, TrainConfig};

/// Per-optimizer learning-rate schedule, advanced once per epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct LrScheduler {
    base_lr: f64,
    policy: SchedulePolicy,
    epoch: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulePolicy {
    /// Multiply by `gamma` every `step_size` epochs.
    Step { step_size: usize, gamma: f64 },
    /// Keep the rate for `n_epoch` epochs, then decay linearly to zero over `n_epoch_decay`.
    Linear { n_epoch: usize, n_epoch_decay: usize },
}

impl LrScheduler {
    pub fn new(base_lr: f64, policy: SchedulePolicy) -> Self {
        Self {
            base_lr,
            policy,
            epoch: 0,
        }
    }

    pub fn from_config(base_lr: f64, config: &TrainConfig) -> Self {
        let policy = match config.lr_policy {
            LrPolicy::Step => SchedulePolicy::Step {
                step_size: config.lr_decay,
                gamma: config.lr_gamma,
            },
            LrPolicy::Lambda => SchedulePolicy::Linear {
                n_epoch: config.n_epoch,
                n_epoch_decay: config.n_epoch_decay,
            },
        };
        Self::new(base_lr, policy)
    }

    /// Fast-forwards the schedule when training resumes after `epochs` epochs.
    pub fn resume(&mut self, epochs: usize) {
        self.epoch = epochs;
    }

    /// Advances one epoch and returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.lr()
    }

    pub fn lr(&self) -> f64 {
        match self.policy {
            SchedulePolicy::Step { step_size, gamma } => {
                let n_decays = (self.epoch / step_size.max(1)) as i32;
                self.base_lr * gamma.powi(n_decays)
            }
            SchedulePolicy::Linear {
                n_epoch,
                n_epoch_decay,
            } => {
                let excess = self.epoch.saturating_sub(n_epoch) as f64;
                let factor = 1.0 - excess / (n_epoch_decay as f64 + 1.0);
                self.base_lr * factor.max(0.0)
            }
        }
    }
}
