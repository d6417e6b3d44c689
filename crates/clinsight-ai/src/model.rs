//! Trainable classifier over image features.
//!
//! The encoder is an explicit, ordered list of named parameter groups so the
//! freeze controller can address them by position:
//!
//! ```text
//! stem       H = X Wᵀ + b
//! blocks.i   H = H + relu(H Wᵀ + b)
//! norm       Y = γ · (H − μ) / σ + β      (per row)
//! ```
//!
//! The head applies dropout (training only) and a linear layer producing one
//! logit per finding. Activations are `[batch, features]` matrices and the
//! backward pass is written out by hand.

use std::fmt;

use ndarray::{Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

const LAYER_NORM_EPS: f32 = 1e-5;

/// One named parameter tensor. Weights are `[out, in]`, biases and norm
/// parameters are `[1, dim]` rows.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub data: Array2<f32>,
    pub grad: Array2<f32>,
    pub requires_grad: bool,
}

impl Param {
    fn filled(name: String, rows: usize, cols: usize, value: f32) -> Self {
        Self {
            name,
            data: Array2::from_elem((rows, cols), value),
            grad: Array2::zeros((rows, cols)),
            requires_grad: true,
        }
    }

    /// Uniform in ±1/√fan_in.
    fn uniform(name: String, rows: usize, cols: usize, fan_in: usize, rng: &mut impl Rng) -> Self {
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        Self {
            name,
            data: Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound)),
            grad: Array2::zeros((rows, cols)),
            requires_grad: true,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Stem,
    Block(usize),
    Norm,
    Head,
}

/// A named set of parameters that is frozen or unfrozen as a unit.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub name: String,
    pub kind: GroupKind,
    pub params: Vec<Param>,
}

impl ParamGroup {
    fn linear(name: &str, kind: GroupKind, out_dim: usize, in_dim: usize, rng: &mut impl Rng) -> Self {
        Self {
            name: name.to_string(),
            kind,
            params: vec![
                Param::uniform(format!("{name}.weight"), out_dim, in_dim, in_dim, rng),
                Param::uniform(format!("{name}.bias"), 1, out_dim, in_dim, rng),
            ],
        }
    }

    fn layer_norm(name: &str, dim: usize) -> Self {
        Self {
            name: name.to_string(),
            kind: GroupKind::Norm,
            params: vec![
                Param::filled(format!("{name}.weight"), 1, dim, 1.0),
                Param::filled(format!("{name}.bias"), 1, dim, 0.0),
            ],
        }
    }

    pub fn is_trainable(&self) -> bool {
        self.params.iter().any(|p| p.requires_grad)
    }

    pub fn set_requires_grad(&mut self, flag: bool) {
        for p in &mut self.params {
            p.requires_grad = flag;
        }
    }

    pub fn num_params(&self) -> usize {
        self.params.iter().map(Param::len).sum()
    }
}

/// Shape of the trainable encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderShape {
    pub in_dim: usize,
    pub hidden_dim: usize,
    pub num_blocks: usize,
}

/// Batch activations kept for the backward pass.
#[derive(Debug, Clone)]
pub struct EncoderTrace {
    input: Array2<f32>,
    block_inputs: Vec<Array2<f32>>,
    block_pre: Vec<Array2<f32>>,
    xhat: Array2<f32>,
    /// `[batch, 1]`
    inv_std: Array2<f32>,
}

/// Residual MLP encoder with ordered parameter groups `[stem, blocks.0.., norm]`.
#[derive(Debug, Clone)]
pub struct Encoder {
    shape: EncoderShape,
    groups: Vec<ParamGroup>,
}

impl Encoder {
    pub fn new(shape: EncoderShape, rng: &mut impl Rng) -> Self {
        let mut groups = Vec::with_capacity(shape.num_blocks + 2);
        groups.push(ParamGroup::linear(
            "stem",
            GroupKind::Stem,
            shape.hidden_dim,
            shape.in_dim,
            rng,
        ));
        for i in 0..shape.num_blocks {
            groups.push(ParamGroup::linear(
                &format!("blocks.{i}"),
                GroupKind::Block(i),
                shape.hidden_dim,
                shape.hidden_dim,
                rng,
            ));
        }
        groups.push(ParamGroup::layer_norm("norm", shape.hidden_dim));
        Self { shape, groups }
    }

    pub fn shape(&self) -> EncoderShape {
        self.shape
    }

    pub fn embed_dim(&self) -> usize {
        self.shape.hidden_dim
    }

    pub fn num_blocks(&self) -> usize {
        self.shape.num_blocks
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn norm_index(&self) -> usize {
        self.groups.len() - 1
    }

    fn first_trainable(&self) -> Option<usize> {
        self.groups.iter().position(ParamGroup::is_trainable)
    }

    /// `[batch, in_dim]` to `[batch, hidden_dim]`.
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        self.run(x, None)
    }

    pub fn forward_traced(&self, x: &Array2<f32>) -> (Array2<f32>, EncoderTrace) {
        let mut trace = EncoderTrace {
            input: x.clone(),
            block_inputs: Vec::with_capacity(self.shape.num_blocks),
            block_pre: Vec::with_capacity(self.shape.num_blocks),
            xhat: Array2::zeros((0, 0)),
            inv_std: Array2::zeros((0, 0)),
        };
        let out = self.run(x, Some(&mut trace));
        (out, trace)
    }

    fn run(&self, x: &Array2<f32>, mut trace: Option<&mut EncoderTrace>) -> Array2<f32> {
        let stem = &self.groups[0].params;
        let mut h = linear(&stem[0], &stem[1], x);

        for group in &self.groups[1..self.norm_index()] {
            let pre = linear(&group.params[0], &group.params[1], &h);
            let next = &h + &pre.mapv(|z| z.max(0.0));
            if let Some(t) = trace.as_deref_mut() {
                t.block_inputs.push(h);
                t.block_pre.push(pre);
            }
            h = next;
        }

        let norm = &self.groups[self.norm_index()].params;
        let n = h.ncols().max(1) as f32;
        let mean = h.sum_axis(Axis(1)).insert_axis(Axis(1)) / n;
        let centered = &h - &mean;
        let var = centered.mapv(|v| v * v).sum_axis(Axis(1)).insert_axis(Axis(1)) / n;
        let inv_std = var.mapv(|v| 1.0 / (v + LAYER_NORM_EPS).sqrt());
        let xhat = &centered * &inv_std;
        let out = &xhat * &norm[0].data + &norm[1].data;

        if let Some(t) = trace {
            t.xhat = xhat;
            t.inv_std = inv_std;
        }
        out
    }

    /// Accumulate parameter gradients for a traced batch. Stops descending once
    /// no earlier group is trainable.
    pub fn backward(&mut self, trace: &EncoderTrace, grad_out: &Array2<f32>) {
        let Some(first) = self.first_trainable() else {
            return;
        };
        let norm_idx = self.norm_index();

        // norm
        let norm = &mut self.groups[norm_idx].params;
        if norm[0].requires_grad {
            norm[0].grad += &(grad_out * &trace.xhat).sum_axis(Axis(0)).insert_axis(Axis(0));
            norm[1].grad += &grad_out.sum_axis(Axis(0)).insert_axis(Axis(0));
        }
        if first == norm_idx {
            return;
        }
        let dxhat = grad_out * &norm[0].data;
        let n = dxhat.ncols().max(1) as f32;
        let mean_d = dxhat.sum_axis(Axis(1)).insert_axis(Axis(1)) / n;
        let mean_dx = (&dxhat * &trace.xhat).sum_axis(Axis(1)).insert_axis(Axis(1)) / n;
        let mut dh = (&dxhat - &mean_d - &(&trace.xhat * &mean_dx)) * &trace.inv_std;

        // blocks, last to first
        for b in (0..self.shape.num_blocks).rev() {
            let gi = b + 1;
            let dz = &dh * &trace.block_pre[b].mapv(|z| if z > 0.0 { 1.0 } else { 0.0 });
            let params = &mut self.groups[gi].params;
            if params[0].requires_grad {
                accumulate_linear_grads(params, &dz, &trace.block_inputs[b]);
            }
            if first == gi {
                return;
            }
            dh += &dz.dot(&params[0].data);
        }

        // stem
        let stem = &mut self.groups[0].params;
        if stem[0].requires_grad {
            accumulate_linear_grads(stem, &dh, &trace.input);
        }
    }

    pub fn zero_grad(&mut self) {
        for g in &mut self.groups {
            g.params.iter_mut().for_each(Param::zero_grad);
        }
    }
}

impl fmt::Display for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Encoder(in={}, embed_dim={}, blocks={}, trainable={}/{})",
            self.shape.in_dim,
            self.shape.hidden_dim,
            self.shape.num_blocks,
            self.trainable_params(),
            self.total_params()
        )
    }
}

/// Dropout followed by a linear layer producing one logit per finding.
#[derive(Debug, Clone)]
pub struct MultiLabelHead {
    dropout: f32,
    group: ParamGroup,
}

impl MultiLabelHead {
    pub fn new(in_dim: usize, num_labels: usize, dropout: f32, rng: &mut impl Rng) -> Self {
        Self {
            dropout: dropout.clamp(0.0, 0.99),
            group: ParamGroup::linear("head", GroupKind::Head, num_labels, in_dim, rng),
        }
    }

    pub fn num_labels(&self) -> usize {
        self.group.params[0].data.nrows()
    }

    pub fn group(&self) -> &ParamGroup {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut ParamGroup {
        &mut self.group
    }

    pub fn forward(&self, features: &Array2<f32>) -> Array2<f32> {
        linear(&self.group.params[0], &self.group.params[1], features)
    }

    /// Training forward with inverted dropout. Returns logits, the dropped-out
    /// features and the per-entry scale applied.
    fn forward_train(&self, features: &Array2<f32>, rng: &mut impl Rng) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let keep = 1.0 - self.dropout;
        let scale = Array2::from_shape_fn(features.raw_dim(), |_| {
            if self.dropout == 0.0 || rng.gen_range(0.0f32..1.0) < keep {
                1.0 / keep
            } else {
                0.0
            }
        });
        let dropped = features * &scale;
        (self.forward(&dropped), dropped, scale)
    }

    fn backward(&mut self, dropped: &Array2<f32>, scale: &Array2<f32>, grad_logits: &Array2<f32>) -> Array2<f32> {
        let params = &mut self.group.params;
        if params[0].requires_grad {
            accumulate_linear_grads(params, grad_logits, dropped);
        }
        grad_logits.dot(&params[0].data) * scale
    }
}

impl fmt::Display for MultiLabelHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let w = &self.group.params[0].data;
        write!(
            f,
            "MultiLabelHead(in={}, labels={}, dropout={})",
            w.ncols(),
            w.nrows(),
            self.dropout
        )
    }
}

/// Activations from a training forward pass, consumed by [`ChestXrayClassifier::backward`].
pub struct BatchTrace {
    encoder: Option<EncoderTrace>,
    dropped: Array2<f32>,
    scale: Array2<f32>,
}

/// Encoder plus multi-label head.
#[derive(Debug, Clone)]
pub struct ChestXrayClassifier {
    pub encoder: Encoder,
    pub head: MultiLabelHead,
}

impl ChestXrayClassifier {
    pub fn new(shape: EncoderShape, num_labels: usize, dropout: f32, rng: &mut impl Rng) -> Self {
        let encoder = Encoder::new(shape, rng);
        let head = MultiLabelHead::new(shape.hidden_dim, num_labels, dropout, rng);
        Self { encoder, head }
    }

    /// Forward pass without dropout or traces: `[batch, in_dim]` to `[batch, labels]`.
    pub fn predict(&self, batch: &Array2<f32>) -> Array2<f32> {
        self.head.forward(&self.encoder.forward(batch))
    }

    /// Forward pass with dropout, keeping what backward needs. Encoder
    /// activations are only kept while some encoder group is trainable.
    pub fn forward_train(&self, batch: &Array2<f32>, rng: &mut impl Rng) -> (Array2<f32>, BatchTrace) {
        let (features, encoder) = if self.encoder.first_trainable().is_some() {
            let (f, t) = self.encoder.forward_traced(batch);
            (f, Some(t))
        } else {
            (self.encoder.forward(batch), None)
        };
        let (logits, dropped, scale) = self.head.forward_train(&features, rng);
        (
            logits,
            BatchTrace {
                encoder,
                dropped,
                scale,
            },
        )
    }

    /// Accumulate gradients given `∂L/∂logits` for the traced batch.
    pub fn backward(&mut self, trace: &BatchTrace, grad_logits: &Array2<f32>) {
        let grad_features = self.head.backward(&trace.dropped, &trace.scale, grad_logits);
        if let Some(enc) = &trace.encoder {
            self.encoder.backward(enc, &grad_features);
        }
    }

    pub fn zero_grad(&mut self) {
        self.encoder.zero_grad();
        self.head.group.params.iter_mut().for_each(Param::zero_grad);
    }

    /// Every parameter group, encoder first.
    pub fn param_groups(&self) -> impl Iterator<Item = &ParamGroup> {
        self.encoder.groups.iter().chain(std::iter::once(&self.head.group))
    }

    pub fn param_groups_mut(&mut self) -> impl Iterator<Item = &mut ParamGroup> {
        self.encoder
            .groups
            .iter_mut()
            .chain(std::iter::once(&mut self.head.group))
    }
}

/// `X Wᵀ + b` for `params = [weight, bias]`.
fn linear(w: &Param, b: &Param, x: &Array2<f32>) -> Array2<f32> {
    x.dot(&w.data.t()) + &b.data
}

/// `params` is `[weight, bias]`; `g` is `[batch, out]`, `x` is `[batch, in]`.
fn accumulate_linear_grads(params: &mut [Param], g: &Array2<f32>, x: &Array2<f32>) {
    params[0].grad += &g.t().dot(x);
    params[1].grad += &g.sum_axis(Axis(0)).insert_axis(Axis(0));
}
