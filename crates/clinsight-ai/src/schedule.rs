//! Cosine annealing, stepped once per epoch.
//!
//! `lr_t = lr_min + ½·(lr_0 − lr_min)·(1 + cos(π·t/T))`, applied to every
//! optimizer group from its own initial rate.

use std::f32::consts::PI;

use crate::optim::AdamW;

pub const DEFAULT_MIN_LR: f32 = 1e-6;

#[derive(Debug, Clone)]
pub struct CosineAnnealing {
    t_max: usize,
    lr_min: f32,
    current_step: usize,
}

impl CosineAnnealing {
    pub fn new(t_max: usize, lr_min: f32) -> Self {
        Self {
            t_max: t_max.max(1),
            lr_min,
            current_step: 0,
        }
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Rate at the current step for a group starting at `lr_max`.
    pub fn lr_at(&self, lr_max: f32) -> f32 {
        if self.current_step >= self.t_max {
            return self.lr_min;
        }
        let progress = self.current_step as f32 / self.t_max as f32;
        self.lr_min + (lr_max - self.lr_min) * 0.5 * (1.0 + (PI * progress).cos())
    }

    /// Advance one epoch and write the new rates into the optimizer.
    pub fn step(&mut self, optimizer: &mut AdamW) {
        self.current_step += 1;
        for g in optimizer.groups_mut() {
            g.lr = self.lr_at(g.initial_lr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::OptimGroup;

    fn optimizer() -> AdamW {
        AdamW::new(
            vec![
                OptimGroup::new("encoder", 1e-5, vec![]),
                OptimGroup::new("head", 3e-4, vec![]),
            ],
            0.01,
        )
    }

    #[test]
    fn starts_at_initial_rate() {
        let sched = CosineAnnealing::new(10, DEFAULT_MIN_LR);
        assert_eq!(sched.lr_at(3e-4), 3e-4);
    }

    #[test]
    fn halfway_is_midpoint() {
        let mut sched = CosineAnnealing::new(10, 0.0);
        let mut opt = optimizer();
        for _ in 0..5 {
            sched.step(&mut opt);
        }
        assert!((opt.groups()[1].lr - 1.5e-4).abs() < 1e-9);
        assert!((opt.groups()[0].lr - 5e-6).abs() < 1e-10);
    }

    #[test]
    fn ends_at_min_rate() {
        let mut sched = CosineAnnealing::new(4, DEFAULT_MIN_LR);
        let mut opt = optimizer();
        for _ in 0..4 {
            sched.step(&mut opt);
        }
        for g in opt.groups() {
            assert_eq!(g.lr, DEFAULT_MIN_LR);
        }
        assert_eq!(sched.current_step(), 4);
    }

    #[test]
    fn monotonically_decreasing() {
        let mut sched = CosineAnnealing::new(20, DEFAULT_MIN_LR);
        let mut opt = optimizer();
        let mut prev = opt.groups()[1].lr;
        for _ in 0..20 {
            sched.step(&mut opt);
            let lr = opt.groups()[1].lr;
            assert!(lr <= prev);
            prev = lr;
        }
    }
}
