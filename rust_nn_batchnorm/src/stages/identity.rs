use serde::{Deserialize, Serialize};

use crate::batch_utils::check_width;
use crate::layer::{Batch, Layer};
use crate::optimizer::Optimizer;

/// Width-checked pass-through stage, the trivial child for a normalizer.
#[derive(Serialize, Deserialize)]
pub struct Identity {
    pub width: usize,
}

impl Identity {
    pub fn new(width: usize) -> Self {
        Identity { width }
    }
}

impl Layer for Identity {
    type Ctx = ();

    fn output_width(&self) -> Option<usize> {
        Some(self.width)
    }

    fn predict(&self, x: &[Vec<f32>]) -> Result<Batch, Box<dyn std::error::Error>> {
        check_width(x, self.width, "identity input")?;
        Ok(x.to_vec())
    }

    fn begin_update(
        &mut self,
        x: &[Vec<f32>],
        _drop: f32,
    ) -> Result<(Batch, ()), Box<dyn std::error::Error>> {
        check_width(x, self.width, "identity input")?;
        Ok((x.to_vec(), ()))
    }

    fn finish_update(
        &mut self,
        _ctx: (),
        d_out: &[Vec<f32>],
        _opt: Option<&mut dyn Optimizer>,
    ) -> Result<Batch, Box<dyn std::error::Error>> {
        check_width(d_out, self.width, "identity gradient")?;
        Ok(d_out.to_vec())
    }
}
