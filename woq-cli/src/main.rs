use clap::{Parser, Subcommand};
use half::{bf16, f16};
use std::path::PathBuf;
use std::time::Instant;

use woq_core::dispatch::{self, SPECIALIZED_KERNELS, WeightPath};
use woq_core::dtype::{FloatType, QuantMode, WeightDType};
use woq_core::gemm::{woq_gemm, woq_gemm_reference};
use woq_core::layout::{pack_blocked, pack_plain};
use woq_core::simd;
use woq_core::{Tensor, WoqConfig};

#[derive(Parser)]
#[command(name = "woq")]
#[command(about = "Weight-only-quantized GEMM kernels: diagnostics and smoke runs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the probed CPU level and the kernel table
    Info {
        /// List every specialized kernel
        #[arg(long)]
        kernels: bool,
    },

    /// Run a synthetic GEMM through both paths and compare
    Gemm {
        #[arg(long, default_value = "8")]
        m: usize,

        #[arg(long, default_value = "256")]
        n: usize,

        #[arg(long, default_value = "512")]
        k: usize,

        /// Weight format: int8, int4, nf4
        #[arg(long, default_value = "int4")]
        weight_type: WeightDType,

        /// Quantization mode: per_channel, per_k_block, per_tensor (append _sym for symmetric)
        #[arg(long, default_value = "per_k_block_sym")]
        mode: QuantMode,

        /// Reduction block size for per_k_block modes (0 = whole row)
        #[arg(long, default_value = "128")]
        block_k: i64,

        /// Compute precision: f32, f16, bf16
        #[arg(long, default_value = "f32")]
        compute: FloatType,

        /// Activation type: f32, f16, bf16
        #[arg(long, default_value = "f32")]
        act: FloatType,

        /// JSON config overriding weight type, mode, block size, fusion and compute
        #[arg(long)]
        config: Option<PathBuf>,

        /// Timed iterations per path
        #[arg(long, default_value = "10")]
        iters: u32,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    match cli.command {
        Commands::Info { kernels } => cmd_info(kernels),
        Commands::Gemm {
            m,
            n,
            k,
            weight_type,
            mode,
            block_k,
            compute,
            act,
            config,
            iters,
        } => {
            let flags = WoqConfig {
                weight_dtype: weight_type,
                mode,
                quant_block_k: block_k,
                compute,
                ..WoqConfig::default()
            };
            let result = load_config(config, flags).and_then(|c| cmd_gemm(m, n, k, &c, act, iters.max(1)));
            if let Err(e) = result {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn cmd_info(list_kernels: bool) {
    let level = simd::level();
    println!("cpu level:          {}", level.name());
    println!(
        "{} override:   {}",
        simd::ISA_ENV,
        std::env::var(simd::ISA_ENV).unwrap_or_else(|_| "(unset)".into())
    );
    println!("specialized gemm:   {}", if simd::avx2().is_some() { "enabled" } else { "reference only" });
    println!("kernel table:       {SPECIALIZED_KERNELS} kernels");

    if list_kernels {
        println!();
        for act in FloatType::ALL {
            for compute in FloatType::ALL {
                for path in WeightPath::ALL {
                    let kernel = dispatch::specialized(act, compute, path);
                    println!("  act={act:?} compute={compute:?} {path:?} @ {:p}", kernel as *const ());
                }
            }
        }
    }
}

/// The `--config` file when given, otherwise the command-line flags.
fn load_config(path: Option<PathBuf>, flags: WoqConfig) -> Result<WoqConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(WoqConfig::load(path)?),
        None => {
            flags.validate()?;
            Ok(flags)
        }
    }
}

fn cmd_gemm(
    m: usize,
    n: usize,
    k: usize,
    config: &WoqConfig,
    act_type: FloatType,
    iters: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let dtype = config.weight_dtype;
    if dtype.is_4bit() && n % 2 != 0 {
        return Err(format!("{dtype:?} packs two channels per byte, N must be even (got {n})").into());
    }
    let (nb, kb) = (tile(n, 64, dtype.is_4bit()), tile(k, 64, false));

    println!("gemm: M={m} N={n} K={k} {dtype:?} {} block_k={}", config.mode.name(), config.quant_block_k);
    println!("      act={act_type:?} compute={:?} tile={nb}x{kb}", config.compute);

    let mut seed = 0x2545_F491_4F6C_DD1Du64;
    let max_level = if dtype.is_4bit() { 16 } else { 256 };
    let levels: Vec<u8> = (0..n * k).map(|_| (next(&mut seed) % max_level) as u8).collect();
    let plain = pack_plain(&levels, n, k, dtype)?;
    let blocked = pack_blocked(&plain, dtype, nb, kb)?;
    tracing::debug!(bytes = plain.numel(), "synthetic weight packed");

    let groups = match config.mode {
        QuantMode::PerKBlock | QuantMode::PerKBlockSym if config.quant_block_k > 0 => {
            k.div_ceil(config.quant_block_k as usize)
        }
        _ => 1,
    };
    let count = match config.mode {
        QuantMode::PerTensor | QuantMode::PerTensorSym => 1,
        _ => n * groups,
    };
    let scales = vec![Tensor::from_f32(
        [count],
        (0..count).map(|_| 0.002 + (next(&mut seed) % 64) as f32 * 1e-4).collect(),
    )?];
    let zero_points = if config.mode.is_asymmetric() {
        let centre = if dtype == WeightDType::Int8 { 0.0 } else { 8.0 };
        vec![Tensor::from_f32([count], vec![centre; count])?]
    } else {
        Vec::new()
    };

    let values: Vec<f32> = (0..m * k).map(|_| (next(&mut seed) % 2000) as f32 / 1000.0 - 1.0).collect();
    let x = match act_type {
        FloatType::F32 => Tensor::from_f32([m, k], values)?,
        FloatType::F16 => Tensor::from_elements([m, k], values.into_iter().map(f16::from_f32).collect())?,
        FloatType::BF16 => Tensor::from_elements([m, k], values.into_iter().map(bf16::from_f32).collect())?,
    };

    let params = config.params(&scales).zero_points(&zero_points);
    if config.fusion.operand_count() > 0 {
        return Err(format!("fusion {:?} needs operands; the smoke run only takes unary post-ops", config.fusion).into());
    }

    let start = Instant::now();
    let mut fast = woq_gemm(&x, &blocked, &params)?;
    for _ in 1..iters {
        fast = woq_gemm(&x, &blocked, &params)?;
    }
    let fast_time = start.elapsed() / iters;

    let start = Instant::now();
    let mut slow = woq_gemm_reference(&x, &plain, &params)?;
    for _ in 1..iters {
        slow = woq_gemm_reference(&x, &plain, &params)?;
    }
    let slow_time = start.elapsed() / iters;

    let max_diff = fast
        .to_f32_vec()
        .iter()
        .zip(slow.to_f32_vec())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);

    let flops = 2.0 * (m * n * k) as f64;
    println!();
    println!(
        "  dispatched: {:>10.3?}  ({:.2} GFLOP/s)",
        fast_time,
        flops / fast_time.as_secs_f64().max(1e-12) / 1e9
    );
    println!(
        "  reference:  {:>10.3?}  ({:.2} GFLOP/s)",
        slow_time,
        flops / slow_time.as_secs_f64().max(1e-12) / 1e9
    );
    println!("  max |diff|: {max_diff:.3e}");
    Ok(())
}

/// Largest tile size <= `want` dividing `dim`, even when `even` is set.
/// `dim` must itself be even in that case.
fn tile(dim: usize, want: usize, even: bool) -> usize {
    (1..=want.min(dim))
        .rev()
        .find(|t| dim % t == 0 && (!even || t % 2 == 0))
        .unwrap_or(dim)
}

fn next(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}
