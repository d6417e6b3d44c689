//! Masked binary cross-entropy over logits.
//!
//! Only entries with a positive mask contribute. Masked-out entries are never
//! read, so undefined (NaN) targets cannot leak into the loss or its gradient.
//!
//! ```text
//! L = Σ m·[max(s,0) − s·t + ln(1 + e^−|s|)] / max(Σ m, ε)
//! ∂L/∂s = m·(σ(s) − t) / max(Σ m, ε)
//! ```

use ndarray::{Array2, Zip};

/// Lower bound on the mask sum so an all-masked batch yields 0, not NaN.
pub const MASK_EPS: f32 = 1e-8;

/// Numerically stable sigmoid.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn stable_bce(logit: f32, target: f32) -> f32 {
    logit.max(0.0) - logit * target + (1.0 + (-logit.abs()).exp()).ln()
}

fn mask_sum(masks: &Array2<f32>) -> f32 {
    masks.iter().filter(|&&m| m > 0.0).sum::<f32>()
}

/// Masked mean BCE over `[batch, labels]` logits.
pub fn masked_loss(scores: &Array2<f32>, targets: &Array2<f32>, masks: &Array2<f32>) -> f32 {
    let mut total = 0.0f32;
    Zip::from(scores).and(targets).and(masks).for_each(|&s, &t, &m| {
        if m > 0.0 {
            total += m * stable_bce(s, t);
        }
    });
    total / mask_sum(masks).max(MASK_EPS)
}

/// Masked loss plus its gradient with respect to the logits.
pub fn masked_loss_with_grad(
    scores: &Array2<f32>,
    targets: &Array2<f32>,
    masks: &Array2<f32>,
) -> (f32, Array2<f32>) {
    let denom = mask_sum(masks).max(MASK_EPS);

    let mut total = 0.0f32;
    let mut grad = Array2::zeros(scores.raw_dim());
    Zip::from(&mut grad)
        .and(scores)
        .and(targets)
        .and(masks)
        .for_each(|g, &s, &t, &m| {
            if m > 0.0 {
                total += m * stable_bce(s, t);
                *g = m * (sigmoid(s) - t) / denom;
            }
        });
    (total / denom, grad)
}
