//! Partial-freeze control over the encoder's parameter groups.
//!
//! Only called between training phases, never during a step.

use tracing::{info, warn};

use crate::model::{Encoder, GroupKind, ParamGroup};

/// Mark every group frozen.
pub fn freeze_all(groups: &mut [ParamGroup]) {
    for g in groups {
        g.set_requires_grad(false);
    }
}

/// Freeze everything, then unfreeze blocks `block_index..` plus the final norm.
/// `0` unfreezes every group including the stem.
pub fn unfreeze_from(groups: &mut [ParamGroup], block_index: usize) {
    freeze_all(groups);

    if block_index == 0 {
        for g in groups.iter_mut() {
            g.set_requires_grad(true);
        }
        return;
    }

    for g in groups.iter_mut() {
        let trainable = match g.kind {
            GroupKind::Block(i) => i >= block_index,
            GroupKind::Norm => true,
            GroupKind::Stem | GroupKind::Head => false,
        };
        g.set_requires_grad(trainable);
    }
}

impl Encoder {
    pub fn freeze_all(&mut self) {
        freeze_all(self.groups_mut());
        info!(trainable = self.trainable_params(), total = self.total_params(), "encoder frozen");
    }

    pub fn unfreeze_from(&mut self, block_index: usize) {
        if block_index > self.num_blocks() {
            warn!(
                block_index,
                blocks = self.num_blocks(),
                "unfreeze index past the last block; only the final norm trains"
            );
        }
        unfreeze_from(self.groups_mut(), block_index);
        info!(
            from_block = block_index,
            trainable = self.trainable_params(),
            total = self.total_params(),
            "encoder unfrozen"
        );
    }

    pub fn is_frozen(&self) -> bool {
        !self.groups().iter().any(ParamGroup::is_trainable)
    }

    pub fn trainable_params(&self) -> usize {
        self.groups()
            .iter()
            .flat_map(|g| &g.params)
            .filter(|p| p.requires_grad)
            .map(|p| p.len())
            .sum()
    }

    pub fn total_params(&self) -> usize {
        self.groups().iter().map(ParamGroup::num_params).sum()
    }
}
