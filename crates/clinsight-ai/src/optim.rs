//! AdamW with per-group learning rates.
//!
//! Weight decay is decoupled from the gradient update:
//! `θ ← θ·(1 − lr·λ) − lr · m̂ / (√v̂ + ε)`.
//! Frozen parameters are skipped and keep no moment state.

use std::collections::HashMap;

use ndarray::{Array2, Zip};
use tracing::info;

use crate::model::ChestXrayClassifier;

pub const DEFAULT_WEIGHT_DECAY: f32 = 0.01;

/// A learning-rate group covering one or more model parameter groups by name.
#[derive(Debug, Clone)]
pub struct OptimGroup {
    pub name: String,
    pub lr: f32,
    pub initial_lr: f32,
    pub members: Vec<String>,
}

impl OptimGroup {
    pub fn new(name: &str, lr: f32, members: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            lr,
            initial_lr: lr,
            members,
        }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: Array2<f32>,
    v: Array2<f32>,
    step: i32,
}

pub struct AdamW {
    groups: Vec<OptimGroup>,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    state: HashMap<String, Moments>,
}

impl AdamW {
    pub fn new(groups: Vec<OptimGroup>, weight_decay: f32) -> Self {
        Self {
            groups,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            state: HashMap::new(),
        }
    }

    pub fn groups(&self) -> &[OptimGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [OptimGroup] {
        &mut self.groups
    }

    /// Apply one update to every trainable parameter covered by a group.
    pub fn step(&mut self, model: &mut ChestXrayClassifier) {
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        for pg in model.param_groups_mut() {
            let Some(group) = self.groups.iter().find(|g| g.members.contains(&pg.name)) else {
                continue;
            };
            let lr = group.lr;
            let decay = 1.0 - lr * self.weight_decay;

            for p in pg.params.iter_mut().filter(|p| p.requires_grad) {
                let st = self.state.entry(p.name.clone()).or_insert_with(|| Moments {
                    m: Array2::zeros(p.data.raw_dim()),
                    v: Array2::zeros(p.data.raw_dim()),
                    step: 0,
                });
                st.step += 1;
                let bc1 = 1.0 - beta1.powi(st.step);
                let bc2 = 1.0 - beta2.powi(st.step);

                // m_t = β1·m + (1 − β1)·g,  v_t = β2·v + (1 − β2)·g²
                Zip::from(&mut st.m)
                    .and(&mut st.v)
                    .and(&p.grad)
                    .for_each(|m, v, &g| {
                        *m = beta1 * *m + (1.0 - beta1) * g;
                        *v = beta2 * *v + (1.0 - beta2) * g * g;
                    });

                Zip::from(&mut p.data)
                    .and(&st.m)
                    .and(&st.v)
                    .for_each(|w, &m, &v| {
                        *w = *w * decay - lr * (m / bc1) / ((v / bc2).sqrt() + epsilon);
                    });
            }
        }
    }
}

/// Head-only optimizer for a frozen encoder; otherwise encoder and head groups
/// at their own rates.
pub fn build_optimizer(
    model: &ChestXrayClassifier,
    freeze_encoder: bool,
    head_lr: f32,
    encoder_lr: f32,
) -> AdamW {
    let head = vec![model.head.group().name.clone()];
    let groups = if freeze_encoder {
        vec![OptimGroup::new("head", head_lr, head)]
    } else {
        let encoder = model.encoder.groups().iter().map(|g| g.name.clone()).collect();
        vec![
            OptimGroup::new("encoder", encoder_lr, encoder),
            OptimGroup::new("head", head_lr, head),
        ]
    };

    for g in &groups {
        info!(group = %g.name, lr = g.lr, members = g.members.len(), "optimizer group");
    }
    AdamW::new(groups, DEFAULT_WEIGHT_DECAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EncoderShape;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn model() -> ChestXrayClassifier {
        let mut rng = StdRng::seed_from_u64(3);
        ChestXrayClassifier::new(
            EncoderShape {
                in_dim: 2,
                hidden_dim: 2,
                num_blocks: 1,
            },
            1,
            0.0,
            &mut rng,
        )
    }

    #[test]
    fn frozen_encoder_gets_single_head_group() {
        let m = model();
        let opt = build_optimizer(&m, true, 3e-4, 1e-5);
        assert_eq!(opt.groups().len(), 1);
        assert_eq!(opt.groups()[0].lr, 3e-4);
        assert_eq!(opt.groups()[0].members, vec!["head".to_string()]);
    }

    #[test]
    fn finetune_gets_encoder_and_head_groups() {
        let m = model();
        let opt = build_optimizer(&m, false, 3e-4, 1e-5);
        let names: Vec<&str> = opt.groups().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["encoder", "head"]);
        assert_eq!(opt.groups()[0].lr, 1e-5);
        assert_eq!(opt.groups()[0].members, vec!["stem", "blocks.0", "norm"]);
    }

    #[test]
    fn first_step_moves_by_lr_against_gradient() {
        let mut m = model();
        m.encoder.freeze_all();
        let mut opt = AdamW::new(vec![OptimGroup::new("head", 0.1, vec!["head".into()])], 0.0);

        let before = m.head.group().params[0].data.clone();
        m.head.group_mut().params[0].grad = array![[2.0, -0.5]];
        opt.step(&mut m);
        let after = &m.head.group().params[0].data;

        // Bias-corrected Adam's first step is lr·sign(g).
        assert!((after[[0, 0]] - (before[[0, 0]] - 0.1)).abs() < 1e-5);
        assert!((after[[0, 1]] - (before[[0, 1]] + 0.1)).abs() < 1e-5);
    }

    #[test]
    fn frozen_params_are_untouched() {
        let mut m = model();
        m.encoder.freeze_all();
        let mut opt = build_optimizer(&m, false, 0.1, 0.1);

        let stem_before = m.encoder.groups()[0].params[0].data.clone();
        m.encoder.groups_mut()[0].params[0].grad = Array2::ones((2, 2));
        opt.step(&mut m);
        assert_eq!(m.encoder.groups()[0].params[0].data, stem_before);
    }

    #[test]
    fn weight_decay_shrinks_without_gradient() {
        let mut m = model();
        m.encoder.freeze_all();
        let mut opt = AdamW::new(vec![OptimGroup::new("head", 0.1, vec!["head".into()])], 0.5);

        let before = m.head.group().params[0].data.clone();
        opt.step(&mut m);
        for (a, b) in m.head.group().params[0].data.iter().zip(&before) {
            assert!((a - b * 0.95).abs() < 1e-6);
        }
    }
}
