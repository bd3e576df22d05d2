use rand::Rng;
use rust_nn_batchnorm::config::BatchNormConfig;
use rust_nn_batchnorm::layer::Layer;
use rust_nn_batchnorm::optimizer::Optimizer;
use rust_nn_batchnorm::stages::{BatchNorm, Linear};

struct Sgd {
    lr: f32,
}

impl Optimizer for Sgd {
    fn update(&mut self, weights: &mut [f32], gradient: &mut [f32], _key: usize) {
        for (w, g) in weights.iter_mut().zip(gradient.iter()) {
            *w -= self.lr * g;
        }
        for g in gradient.iter_mut() {
            *g = 0.0;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let input_dim = 32;
    let output_dim = 16;
    let batch_size = 64;
    let mut rng = rand::thread_rng();
    let inputs: Vec<Vec<f32>> = (0..batch_size)
        .map(|_| (0..input_dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect();
    let targets: Vec<Vec<f32>> = (0..batch_size)
        .map(|_| (0..output_dim).map(|_| rng.gen_range(-2.0..2.0)).collect())
        .collect();

    let mut model = BatchNorm::new(
        Linear::new(input_dim, output_dim),
        BatchNormConfig::default(),
    )?;
    let mut sgd = Sgd { lr: 0.01 };

    // Training loop
    for epoch in 0..1000 {
        let (y, ctx) = model.begin_update(&inputs, 0.0)?;
        let mut loss = 0.0;
        let mut grad = vec![vec![0.0f32; output_dim]; batch_size];
        for i in 0..batch_size {
            for j in 0..output_dim {
                let diff = y[i][j] - targets[i][j];
                loss += 0.5 * diff * diff;
                grad[i][j] = diff;
            }
        }
        model.finish_update(ctx, &grad, Some(&mut sgd))?;
        println!("Epoch {}: loss = {}", epoch, loss / batch_size as f32);
    }
    Ok(())
}
