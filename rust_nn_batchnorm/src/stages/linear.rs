use rand::Rng;
use rand::distributions::{Distribution, Uniform};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::batch_utils::check_width;
use crate::layer::{Batch, Layer, next_layer_id};
use crate::optimizer::Optimizer;

/// Fully-connected stage, the standard trainable child for a normalizer.
#[derive(Serialize, Deserialize)]
pub struct Linear {
    pub in_dim: usize,
    pub out_dim: usize,
    pub weight: Vec<Vec<f32>>, // shape: [out_dim][in_dim]
    pub bias: Vec<f32>,        // shape: [out_dim]
    pub grad_weight: Vec<Vec<f32>>,
    pub grad_bias: Vec<f32>,
    #[serde(skip, default = "next_layer_id")]
    pub id: usize,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        // Xavier/Glorot uniform initialization
        let mut rng = rand::thread_rng();
        let limit = (6.0f32 / (in_dim as f32 + out_dim as f32)).sqrt();
        let dist = Uniform::new(-limit, limit);
        let weight: Vec<Vec<f32>> = (0..out_dim)
            .map(|_| (0..in_dim).map(|_| dist.sample(&mut rng)).collect())
            .collect();
        let bias: Vec<f32> = (0..out_dim).map(|_| rng.gen_range(-1e-2..1e-2)).collect();
        Linear {
            in_dim,
            out_dim,
            weight,
            bias,
            grad_weight: vec![vec![0.0; in_dim]; out_dim],
            grad_bias: vec![0.0; out_dim],
            id: next_layer_id(),
        }
    }

    fn forward_row(&self, input: &[f32]) -> Vec<f32> {
        self.weight
            .par_iter()
            .zip(self.bias.par_iter())
            .map(|(w_row, b)| {
                w_row
                    .iter()
                    .zip(input.iter())
                    .map(|(w, x)| w * x)
                    .sum::<f32>()
                    + b
            })
            .collect()
    }

    pub fn zero_grad(&mut self) {
        for row in &mut self.grad_weight {
            for g in row.iter_mut() {
                *g = 0.0;
            }
        }
        for g in &mut self.grad_bias {
            *g = 0.0;
        }
    }

    /// Hand the flat `[weight | bias]` buffers to the optimizer and copy the
    /// results back.
    fn apply_optimizer(&mut self, opt: &mut dyn Optimizer) {
        let mut weights: Vec<f32> = Vec::with_capacity(self.out_dim * self.in_dim + self.out_dim);
        for row in &self.weight {
            weights.extend_from_slice(row);
        }
        weights.extend_from_slice(&self.bias);
        let mut gradient: Vec<f32> = Vec::with_capacity(weights.len());
        for row in &self.grad_weight {
            gradient.extend_from_slice(row);
        }
        gradient.extend_from_slice(&self.grad_bias);

        opt.update(&mut weights, &mut gradient, self.id);

        for (i, row) in self.weight.iter_mut().enumerate() {
            row.copy_from_slice(&weights[i * self.in_dim..(i + 1) * self.in_dim]);
        }
        self.bias
            .copy_from_slice(&weights[self.out_dim * self.in_dim..]);
        for (i, row) in self.grad_weight.iter_mut().enumerate() {
            row.copy_from_slice(&gradient[i * self.in_dim..(i + 1) * self.in_dim]);
        }
        self.grad_bias
            .copy_from_slice(&gradient[self.out_dim * self.in_dim..]);
    }
}

impl Layer for Linear {
    /// The input batch, captured for the backward pass.
    type Ctx = Batch;

    fn output_width(&self) -> Option<usize> {
        Some(self.out_dim)
    }

    fn predict(&self, x: &[Vec<f32>]) -> Result<Batch, Box<dyn std::error::Error>> {
        check_width(x, self.in_dim, "linear input")?;
        Ok(x.iter().map(|row| self.forward_row(row)).collect())
    }

    fn begin_update(
        &mut self,
        x: &[Vec<f32>],
        _drop: f32,
    ) -> Result<(Batch, Batch), Box<dyn std::error::Error>> {
        let y = self.predict(x)?;
        Ok((y, x.to_vec()))
    }

    fn finish_update(
        &mut self,
        input: Batch,
        d_out: &[Vec<f32>],
        mut opt: Option<&mut dyn Optimizer>,
    ) -> Result<Batch, Box<dyn std::error::Error>> {
        check_width(d_out, self.out_dim, "linear gradient")?;
        if d_out.len() != input.len() {
            return Err(format!(
                "shape mismatch: gradient has {} rows, forward batch had {}",
                d_out.len(),
                input.len()
            )
            .into());
        }
        for (row, dy) in input.iter().zip(d_out.iter()) {
            for i in 0..self.out_dim {
                for j in 0..self.in_dim {
                    self.grad_weight[i][j] += dy[i] * row[j];
                }
                self.grad_bias[i] += dy[i];
            }
        }
        let grad_input: Batch = d_out
            .par_iter()
            .map(|dy| {
                (0..self.in_dim)
                    .map(|j| (0..self.out_dim).map(|i| dy[i] * self.weight[i][j]).sum())
                    .collect()
            })
            .collect();
        if let Some(opt) = opt.as_deref_mut() {
            self.apply_optimizer(opt);
        }
        Ok(grad_input)
    }
}
