//! Configuration for the batch normalization stage.
#[derive(Clone, Debug)]
pub struct BatchNormConfig {
    /// Feature width; inferred from the child stage when `None`.
    pub output_width: Option<usize>,
    /// Floor added to every variance before division or powers.
    pub eps: f32,
    /// Update count at which the renormalization correction activates.
    pub renorm_after: usize,
    /// Cap on the running-statistics smoothing coefficient.
    pub max_alpha: f32,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        BatchNormConfig {
            output_width: None,
            eps: 1e-8,
            renorm_after: 50_000,
            max_alpha: 0.9,
        }
    }
}
