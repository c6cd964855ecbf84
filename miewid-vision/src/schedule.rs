use serde::{Deserialize, Serialize};

/// Per-epoch learning rate: linear ramp, sustain, then exponential decay
/// towards `lr_min`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub lr_start: f64,
    pub lr_max: f64,
    pub lr_min: f64,
    pub lr_ramp_ep: u32,
    pub lr_sus_ep: u32,
    pub lr_decay: f64,
}

impl Default for LrSchedule {
    fn default() -> Self {
        Self {
            lr_start: 1e-5,
            lr_max: 1e-3,
            lr_min: 1e-6,
            lr_ramp_ep: 5,
            lr_sus_ep: 0,
            lr_decay: 0.8,
        }
    }
}

impl LrSchedule {
    pub fn lr_at(&self, epoch: u32) -> f64 {
        if epoch < self.lr_ramp_ep {
            (self.lr_max - self.lr_start) / self.lr_ramp_ep as f64 * epoch as f64 + self.lr_start
        } else if epoch < self.lr_ramp_ep + self.lr_sus_ep {
            self.lr_max
        } else {
            let decay_steps = (epoch - self.lr_ramp_ep - self.lr_sus_ep) as i32;
            (self.lr_max - self.lr_min) * self.lr_decay.powi(decay_steps) + self.lr_min
        }
    }

    pub fn iter(&self, epochs: u32) -> impl Iterator<Item = (u32, f64)> + '_ {
        (0..epochs).map(move |e| (e, self.lr_at(e)))
    }
}
