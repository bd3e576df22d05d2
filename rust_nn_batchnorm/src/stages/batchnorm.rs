use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};

use crate::batch_utils::{check_width, column_mean, column_sum, column_var};
use crate::config::BatchNormConfig;
use crate::dropout::{apply_mask, dropout_mask};
use crate::layer::{Batch, Layer, next_layer_id};
use crate::optimizer::Optimizer;

/// Callback run on the child with the first real training batch, before any
/// normalization happens. Used by surrounding code for shape inference.
pub type DataHook<C> = Box<dyn FnMut(&mut C, &[Vec<f32>])>;

/// Batch normalization around a child stage.
///
/// Whitens the child output with batch statistics during training, keeps
/// running mean/variance estimates for inference, and rescales with learned
/// gamma/beta. Once the running estimates have seen `renorm_after` updates,
/// a renormalization correction realigns the batch-normalized activations
/// with them to shrink the train/inference gap.
#[derive(Serialize, Deserialize)]
pub struct BatchNorm<C: Layer> {
    pub width: usize,
    pub gamma: Vec<f32>, // scale
    pub beta: Vec<f32>,  // shift
    pub running_mean: Vec<f32>,
    pub running_var: Vec<f32>,
    pub grad_gamma: Vec<f32>,
    pub grad_beta: Vec<f32>,
    pub update_count: usize,
    pub eps: f32,
    pub renorm_after: usize,
    pub max_alpha: f32,
    pub child: C,
    #[serde(skip, default = "next_layer_id")]
    pub id: usize,
    #[serde(skip, default = "Vec::new")]
    pub child_hooks: Vec<DataHook<C>>,
    #[serde(skip)]
    pub hooks_done: bool,
}

/// Values captured by the training forward pass, consumed exactly once by
/// the paired `finish_update` call.
pub struct BatchNormCtx<CCtx> {
    n: usize,
    mu: Vec<f32>,
    var: Vec<f32>, // batch variance, floor already added
    x: Batch,      // child output
    x_hat: Batch,  // normalized activations fed to scale/shift
    mask: Option<Batch>,
    child: CCtx,
}

impl<C: Layer> BatchNorm<C> {
    /// Wrap `child`, taking the feature width from the config or, failing
    /// that, from the child itself.
    pub fn new(child: C, config: BatchNormConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let width = match config.output_width.or_else(|| child.output_width()) {
            Some(w) if w > 0 => w,
            Some(_) => return Err("batchnorm width must be positive".into()),
            None => {
                return Err(
                    "batchnorm width is not configured and the child does not report one".into(),
                );
            }
        };
        Ok(BatchNorm {
            width,
            gamma: vec![1.0; width],
            beta: vec![0.0; width],
            running_mean: vec![0.0; width],
            running_var: vec![0.0; width],
            grad_gamma: vec![0.0; width],
            grad_beta: vec![0.0; width],
            update_count: 0,
            eps: config.eps,
            renorm_after: config.renorm_after,
            max_alpha: config.max_alpha,
            child,
            id: next_layer_id(),
            child_hooks: Vec::new(),
            hooks_done: false,
        })
    }

    /// Register a data hook; hooks run in registration order on the first
    /// training batch.
    pub fn add_child_hook(&mut self, hook: DataHook<C>) {
        self.child_hooks.push(hook);
    }

    /// Smoothing coefficient for the running statistics after `update_count`
    /// updates: starts near 1/100 and saturates at `max_alpha`, so early
    /// batches move the estimates strongly and later ones barely at all.
    pub fn smoothing_coefficient(&self, update_count: usize) -> f32 {
        let alpha = (1.0 + update_count as f32) / (100.0 + update_count as f32);
        alpha.min(self.max_alpha)
    }

    pub fn zero_grad(&mut self) {
        for g in &mut self.grad_gamma {
            *g = 0.0;
        }
        for g in &mut self.grad_beta {
            *g = 0.0;
        }
    }

    fn scale_shift(&self, x_hat: &[Vec<f32>]) -> Batch {
        let gamma = &self.gamma;
        let beta = &self.beta;
        x_hat
            .par_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| v * gamma[j] + beta[j])
                    .collect()
            })
            .collect()
    }

    /// Backward of the scale/shift step: accumulates gamma/beta gradients,
    /// lets the optimizer consume them when present, and returns the
    /// gradient with respect to the normalized activations.
    fn scale_shift_backward(
        &mut self,
        x_hat: &[Vec<f32>],
        dy: &[Vec<f32>],
        opt: &mut Option<&mut dyn Optimizer>,
    ) -> Batch {
        for (dy_row, xh_row) in dy.iter().zip(x_hat.iter()) {
            for j in 0..self.width {
                self.grad_beta[j] += dy_row[j];
                self.grad_gamma[j] += dy_row[j] * xh_row[j];
            }
        }
        if let Some(opt) = opt.as_deref_mut() {
            self.apply_optimizer(opt);
        }
        let gamma = &self.gamma;
        dy.par_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, g)| g * gamma[j])
                    .collect()
            })
            .collect()
    }

    /// Hand the flat `[gamma | beta]` buffers to the optimizer and copy the
    /// results back. The optimizer is the sole consumer of the accumulated
    /// gradients.
    fn apply_optimizer(&mut self, opt: &mut dyn Optimizer) {
        let mut weights: Vec<f32> = Vec::with_capacity(2 * self.width);
        weights.extend_from_slice(&self.gamma);
        weights.extend_from_slice(&self.beta);
        let mut gradient: Vec<f32> = Vec::with_capacity(2 * self.width);
        gradient.extend_from_slice(&self.grad_gamma);
        gradient.extend_from_slice(&self.grad_beta);

        opt.update(&mut weights, &mut gradient, self.id);

        let (g, b) = weights.split_at(self.width);
        self.gamma.copy_from_slice(g);
        self.beta.copy_from_slice(b);
        let (gg, gb) = gradient.split_at(self.width);
        self.grad_gamma.copy_from_slice(gg);
        self.grad_beta.copy_from_slice(gb);
    }
}

impl<C: Layer> Layer for BatchNorm<C> {
    type Ctx = BatchNormCtx<C::Ctx>;

    fn output_width(&self) -> Option<usize> {
        Some(self.width)
    }

    fn predict(&self, x: &[Vec<f32>]) -> Result<Batch, Box<dyn std::error::Error>> {
        let x = self.child.predict(x)?;
        check_width(&x, self.width, "child output")?;
        let running_mean = &self.running_mean;
        let running_var = &self.running_var;
        let eps = self.eps;
        let gamma = &self.gamma;
        let beta = &self.beta;
        let y = x
            .par_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| {
                        let xh =
                            (v - running_mean[j]) / (running_var[j] + eps).sqrt();
                        xh * gamma[j] + beta[j]
                    })
                    .collect()
            })
            .collect();
        Ok(y)
    }

    fn begin_update(
        &mut self,
        x: &[Vec<f32>],
        drop: f32,
    ) -> Result<(Batch, Self::Ctx), Box<dyn std::error::Error>> {
        if !self.hooks_done {
            let mut hooks = std::mem::take(&mut self.child_hooks);
            for hook in hooks.iter_mut() {
                hook(&mut self.child, x);
            }
            self.child_hooks = hooks;
            self.hooks_done = true;
        }

        let (x, child_ctx) = self.child.begin_update(x, 0.0)?;
        if x.is_empty() {
            return Err("shape mismatch: cannot normalize an empty batch".into());
        }
        let n = check_width(&x, self.width, "child output")?;

        let mu = column_mean(&x, self.width);
        let mut var = column_var(&x, &mu);
        for v in &mut var {
            *v += self.eps;
        }

        self.update_count += 1;
        let alpha = self.smoothing_coefficient(self.update_count);

        // Running-statistics update. diff is taken against the running mean
        // from *before* this update, and the variance accumulator reuses the
        // same diff/incr products before its alpha decay. The two updates
        // are coupled; keep the order.
        let diff: Batch = x
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| v - self.running_mean[j])
                    .collect()
            })
            .collect();
        let incr: Batch = diff
            .iter()
            .map(|row| row.iter().map(|d| (1.0 - alpha) * d).collect())
            .collect();
        let incr_mean = column_mean(&incr, self.width);
        for (m, im) in self.running_mean.iter_mut().zip(incr_mean.iter()) {
            *m += im;
        }
        let prod: Batch = diff
            .iter()
            .zip(incr.iter())
            .map(|(drow, irow)| drow.iter().zip(irow).map(|(d, i)| d * i).collect())
            .collect();
        let prod_mean = column_mean(&prod, self.width);
        for (v, pm) in self.running_var.iter_mut().zip(prod_mean.iter()) {
            *v += pm;
        }
        for v in &mut self.running_var {
            *v *= alpha;
        }

        // Whiten with the batch statistics, not the running ones.
        let mut x_hat: Batch = x
            .par_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| (v - mu[j]) / var[j].sqrt())
                    .collect()
            })
            .collect();

        // Batch renormalization: once the running estimates have seen enough
        // updates, realign the batch-normalized activations with them.
        if self.update_count >= self.renorm_after {
            for row in &mut x_hat {
                for j in 0..self.width {
                    let rv = self.running_var[j] + self.eps;
                    row[j] = row[j] * (var[j] / rv) + (mu[j] - self.running_mean[j]) / rv;
                }
            }
        }

        let y = self.scale_shift(&x_hat);

        let rate = drop * self.child.drop_factor();
        let mask = dropout_mask(y.len(), self.width, rate);
        let y = match &mask {
            Some(mask) => apply_mask(&y, mask),
            None => y,
        };

        Ok((
            y,
            BatchNormCtx {
                n,
                mu,
                var,
                x,
                x_hat,
                mask,
                child: child_ctx,
            },
        ))
    }

    fn finish_update(
        &mut self,
        ctx: Self::Ctx,
        d_out: &[Vec<f32>],
        mut opt: Option<&mut dyn Optimizer>,
    ) -> Result<Batch, Box<dyn std::error::Error>> {
        let BatchNormCtx {
            n,
            mu,
            var,
            x,
            x_hat,
            mask,
            child,
        } = ctx;
        check_width(d_out, self.width, "output gradient")?;
        if d_out.len() != n {
            return Err(format!(
                "shape mismatch: output gradient has {} rows, forward batch had {}",
                d_out.len(),
                n
            )
            .into());
        }

        let dy = match &mask {
            Some(mask) => apply_mask(d_out, mask),
            None => d_out.to_vec(),
        };
        let dy = self.scale_shift_backward(&x_hat, &dy, &mut opt);

        // Gradient of the whitening transform with respect to the child
        // output, using the batch statistics captured at forward time.
        let sum_dy = column_sum(&dy, self.width);
        let dist: Batch = x
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| v - mu[j])
                    .collect()
            })
            .collect();
        let prod: Batch = dy
            .iter()
            .zip(dist.iter())
            .map(|(dy_row, dist_row)| {
                dy_row
                    .iter()
                    .zip(dist_row)
                    .map(|(g, d)| g * d)
                    .collect()
            })
            .collect();
        let sum_dy_dist = column_sum(&prod, self.width);

        let nf = n as f32;
        let width = self.width;
        let d_xhat: Batch = dy
            .par_iter()
            .zip(dist.par_iter())
            .map(|(dy_row, dist_row)| {
                (0..width)
                    .map(|j| {
                        let g = nf * dy_row[j] - sum_dy[j] - dist_row[j] / var[j] * sum_dy_dist[j];
                        g / var[j].sqrt() / nf
                    })
                    .collect()
            })
            .collect();

        self.child.finish_update(child, &d_xhat, opt)
    }
}

impl<C> BatchNorm<C>
where
    C: Layer + Serialize + serde::de::DeserializeOwned,
{
    pub fn save_json(&self, path: &str) -> std::io::Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer(writer, self).map_err(std::io::Error::other)
    }

    pub fn load_json(path: &str) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(std::io::Error::other)
    }
}
