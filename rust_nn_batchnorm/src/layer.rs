use std::sync::atomic::{AtomicUsize, Ordering};

use crate::optimizer::Optimizer;

/// A batch of row vectors, shape [batch_size][width].
pub type Batch = Vec<Vec<f32>>;

static NEXT_LAYER_ID: AtomicUsize = AtomicUsize::new(0);

/// Allocate a process-wide unique layer id, used to key optimizer state.
pub fn next_layer_id() -> usize {
    NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Contract for a trainable stage in a layered pipeline.
///
/// `begin_update` returns the forward output together with a context object
/// holding everything the paired `finish_update` call needs. The context is
/// consumed exactly once; `predict` is the inference path and must leave the
/// stage untouched.
pub trait Layer {
    /// Values captured by the training forward pass for the backward pass.
    type Ctx;

    /// Output feature width, if the stage knows it.
    fn output_width(&self) -> Option<usize>;

    /// Multiplier applied to the dropout rate of a wrapping stage.
    fn drop_factor(&self) -> f32 {
        1.0
    }

    /// Inference forward pass.
    fn predict(&self, x: &[Vec<f32>]) -> Result<Batch, Box<dyn std::error::Error>>;

    /// Training forward pass.
    fn begin_update(
        &mut self,
        x: &[Vec<f32>],
        drop: f32,
    ) -> Result<(Batch, Self::Ctx), Box<dyn std::error::Error>>;

    /// Training backward pass: accumulates parameter gradients, lets the
    /// optimizer consume them when one is supplied, and returns the gradient
    /// with respect to the stage input.
    fn finish_update(
        &mut self,
        ctx: Self::Ctx,
        d_out: &[Vec<f32>],
        opt: Option<&mut dyn Optimizer>,
    ) -> Result<Batch, Box<dyn std::error::Error>>;
}
