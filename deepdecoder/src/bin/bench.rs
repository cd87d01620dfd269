use std::time::{Duration, Instant};

use anyhow::Result;
use burn::{backend::Autodiff, prelude::*, tensor::Distribution};
use burn_mask_split::{MaskClass, SplitImpl};
use clap::{Parser, ValueEnum};
use deepdecoder::{
    backend::{default_device, SelectedBackend, BACKEND_NAME},
    MaskLossConfig,
};

type B = Autodiff<SelectedBackend>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Implementation {
    Auto,
    Kernel,
    Reference,
}

impl From<Implementation> for SplitImpl {
    fn from(value: Implementation) -> Self {
        match value {
            Implementation::Auto => SplitImpl::Auto,
            Implementation::Kernel => SplitImpl::Kernel,
            Implementation::Reference => SplitImpl::Reference,
        }
    }
}

/// Times the mask loss forward and backward pass.
#[derive(Parser, Debug)]
#[command(name = "bench")]
struct Args {
    /// Batch size
    #[arg(short, long, default_value_t = 64)]
    batch: usize,

    /// Side length of the tag images, must be even
    #[arg(short, long, default_value_t = 64)]
    size: usize,

    /// Timed iterations
    #[arg(short, long, default_value_t = 20)]
    iterations: usize,

    /// Mask split implementation
    #[arg(long, value_enum, default_value_t = Implementation::Auto)]
    implementation: Implementation,

    /// Mask loss configuration file, overrides --implementation
    #[arg(short, long)]
    config: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(true).init();

    let args = Args::parse();
    anyhow::ensure!(
        args.size > 0 && args.size % 2 == 0,
        "Image size must be even, got {}",
        args.size
    );

    let config = match &args.config {
        Some(path) => MaskLossConfig::load(path)?,
        None => MaskLossConfig::new().with_implementation(args.implementation.into()),
    };

    let device = default_device();
    tracing::info!(backend = BACKEND_NAME, ?config, "starting mask loss benchmark");

    let mut loss = config.init::<B>()?;
    tracing::info!(path = ?loss.split().path(), "mask split ready");

    let shape = [args.batch, 1, args.size, args.size];
    let labels = random_tag::<B>(shape, &device);
    let image = Tensor::<B, 4>::random(shape, Distribution::Default, &device);

    let start = Instant::now();
    let mut timings = Vec::with_capacity(args.iterations);
    for _ in 0..args.iterations {
        let iteration = Instant::now();
        let image = image.clone().require_grad();
        let output = loss.forward(labels.clone(), image.clone());
        let grads = output.loss.backward();
        let _ = image.grad(&grads);
        <B as Backend>::sync(&device);
        timings.push(iteration.elapsed());
    }

    let total = start.elapsed();
    tracing::info!(
        ?total,
        per_second = args.iterations as f32 / total.as_secs_f32(),
        mean = ?mean(&timings),
        staging_allocations = loss.split().staging_allocations(),
        "benchmark finished"
    );

    Ok(())
}

fn random_tag<B: Backend>(shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
    let classes = MaskClass::ALL.len();
    let codes: Vec<i64> = MaskClass::ALL.iter().map(|class| class.code() as i64).collect();
    let codes = Tensor::<B, 1, Int>::from_data(TensorData::new(codes, [classes]), device);

    let index = Tensor::<B, 1>::random(
        [shape.iter().product::<usize>()],
        Distribution::Uniform(0.0, classes as f64),
        device,
    )
    .floor()
    .int()
    .clamp(0, classes as i64 - 1);

    codes.select(0, index).float().reshape(shape)
}

fn mean(timings: &[Duration]) -> Duration {
    if timings.is_empty() {
        return Duration::ZERO;
    }
    timings.iter().sum::<Duration>() / timings.len() as u32
}
