/// Opaque update rule applied to a stage's flat parameter buffer.
///
/// `weights` and `gradient` have the same length; `key` identifies the owning
/// layer so stateful optimizers can keep per-layer slots. The callee applies
/// its update in place and resets the gradients it consumed — the stage
/// copies both buffers back afterwards.
pub trait Optimizer {
    fn update(&mut self, weights: &mut [f32], gradient: &mut [f32], key: usize);
}
