use std::sync::Arc;

use anyhow::{Result, bail};
use candle_core::{DType, Device, Tensor};
use clap::{Args, Parser, Subcommand};
use log::info;

use softmax_layer::{
    ExecTarget, GroupedSoftmax, KernelCall, SoftmaxConfig, SoftmaxLayer, SoftmaxTree,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward + backward on random scores, printing per-distribution sums
    Run {
        #[command(flatten)]
        layer: LayerArgs,
    },
    /// Host kernels vs. device path on the same scores
    Parity {
        #[command(flatten)]
        layer: LayerArgs,
        #[arg(long)]
        cuda: bool,
    },
}

#[derive(Args)]
struct LayerArgs {
    #[arg(long, default_value_t = 2)]
    batch: usize,
    #[arg(long, default_value_t = 10)]
    inputs: usize,
    #[arg(long, default_value_t = 1)]
    groups: usize,
    /// Softmax across channels per position, as `C,W,H`
    #[arg(long, value_delimiter = ',', conflicts_with = "tree")]
    spatial: Option<Vec<usize>>,
    /// Tree group sizes, e.g. `2,3,5`
    #[arg(long, value_delimiter = ',')]
    tree: Option<Vec<usize>>,
    #[arg(long, default_value_t = 1.0)]
    temperature: f32,
}

impl LayerArgs {
    fn config(&self) -> Result<SoftmaxConfig> {
        let cfg = match (&self.spatial, &self.tree) {
            (Some(dims), _) => match dims.as_slice() {
                &[c, w, h] => SoftmaxConfig::spatial(self.batch, c, w, h),
                dims => bail!("--spatial takes C,W,H ({dims:?})"),
            },
            (None, Some(sizes)) => {
                SoftmaxConfig::tree(self.batch, Arc::new(SoftmaxTree::new(sizes.clone())?))
            }
            (None, None) => SoftmaxConfig::flat(self.batch, self.inputs, self.groups),
        };
        Ok(cfg.with_temperature(self.temperature))
    }
}

fn random_scores(len: usize) -> Result<Vec<f32>> {
    Ok(Tensor::randn(0f32, 1f32, len, &Device::Cpu)?.to_vec1::<f32>()?)
}

fn distribution_sums(values: &[f32], calls: &[KernelCall]) -> Vec<f32> {
    let mut sums = Vec::new();
    for call in calls {
        let p = &call.params;
        for b in 0..p.batch {
            for g in 0..p.groups {
                let base = call.offset + b * p.batch_stride + g * p.group_stride;
                sums.push((0..p.n).map(|i| values[base + i * p.stride]).sum());
            }
        }
    }
    sums
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

fn run(args: &LayerArgs) -> Result<()> {
    let cfg = args.config()?;
    let len = cfg.batch * cfg.inputs;
    let mut layer = SoftmaxLayer::new(&cfg, ExecTarget::Host)?;
    let calls = cfg.partition.kernel_calls(cfg.batch, cfg.inputs);

    layer.forward(&random_scores(len)?)?;
    layer.delta_mut().copy_from_slice(&random_scores(len)?);
    let mut upstream = vec![0.0f32; len];
    layer.backward(&mut upstream)?;

    let prob_sums = distribution_sums(layer.output(), &calls);
    let grad_sums = distribution_sums(&upstream, &calls);
    info!("{} distributions", prob_sums.len());

    for (row, probs) in layer.output().chunks(cfg.inputs).enumerate() {
        println!("row {row}: {probs:.4?}");
    }
    println!("probability sums: {prob_sums:.6?}");
    println!("gradient sums:    {grad_sums:.6?}");
    Ok(())
}

fn parity(args: &LayerArgs, cuda: bool) -> Result<()> {
    let cfg = args.config()?;
    let len = cfg.batch * cfg.inputs;
    let device = if cuda {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };
    info!("parity on {:?}", device);

    let input = random_scores(len)?;
    let delta = random_scores(len)?;

    let mut host = SoftmaxLayer::new(&cfg, ExecTarget::Host)?;
    host.forward(&input)?;
    host.delta_mut().copy_from_slice(&delta);
    let mut host_upstream = vec![0.0f32; len];
    host.backward(&mut host_upstream)?;

    let mut accel = SoftmaxLayer::new(&cfg, ExecTarget::Device(device.clone()))?;
    accel.forward_device(&Tensor::from_slice(&input, (cfg.batch, cfg.inputs), &device)?)?;
    accel.set_delta_device(Tensor::from_slice(&delta, (cfg.batch, cfg.inputs), &device)?)?;
    let mut accel_upstream = Tensor::zeros((cfg.batch, cfg.inputs), DType::F32, &device)?;
    accel.backward_device(&mut accel_upstream)?;
    accel.pull_output()?;

    let op = GroupedSoftmax::new(cfg.inputs, cfg.partition.clone(), cfg.temperature)?;
    let composed = op
        .forward_tensor(&Tensor::from_slice(&input, (cfg.batch, cfg.inputs), &device)?)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    println!("forward  host vs device layer: {:.3e}", max_abs_diff(host.output(), accel.output()));
    println!("forward  host vs tensor ops:   {:.3e}", max_abs_diff(host.output(), &composed));
    println!(
        "backward host vs device layer: {:.3e}",
        max_abs_diff(&host_upstream, &accel_upstream.flatten_all()?.to_vec1::<f32>()?)
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Run { layer } => run(layer),
        Commands::Parity { layer, cuda } => parity(layer, *cuda),
    }
}
