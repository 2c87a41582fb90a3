//! dsp-wasm harness entry point.
//!
//! Loads a module and drives it through the embedding layer the way firmware
//! would: one engine, one store, one instance, then repeated calls. The
//! `process` command feeds generated audio blocks through the buffer bridge
//! and reports per-block latency against the real-time deadline.

use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dsp_wasm_common::{ConfigFile, RuntimeConfig};
use dsp_wasm_core::{
    AllocatorContext, Engine, Instance, LimitedAllocator, Module, Store, SystemAllocator,
};

#[derive(Debug, Parser)]
#[command(name = "dsp-wasm", version, about = "Run WebAssembly DSP modules on the host")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "DSP_WASM_CONFIG")]
    config: Option<PathBuf>,

    /// Draw guest memory from a capped pool of this many MiB.
    #[arg(long, env = "DSP_WASM_POOL_MB")]
    pool_mb: Option<usize>,

    /// Emit logs as JSON.
    #[arg(long, env = "DSP_WASM_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a buffer-processing export over generated blocks.
    Process {
        /// Module file (`.wasm`, or `.wat` for text).
        module: PathBuf,

        /// Export to call (overrides the config file).
        #[arg(long)]
        export: Option<String>,

        /// Frames per block (overrides the config file).
        #[arg(long)]
        block_size: Option<u32>,

        /// Number of blocks (overrides the config file).
        #[arg(long)]
        blocks: Option<u32>,
    },

    /// Call an `(i32, i32) -> i32` export once.
    CallI32 {
        /// Module file.
        module: PathBuf,
        /// Export to call.
        export: String,
        /// First argument.
        #[arg(allow_hyphen_values = true)]
        a: i32,
        /// Second argument.
        #[arg(allow_hyphen_values = true)]
        b: i32,
    },

    /// Call an `(f32) -> f32` export once.
    CallF32 {
        /// Module file.
        module: PathBuf,
        /// Export to call.
        export: String,
        /// Argument.
        #[arg(allow_hyphen_values = true)]
        x: f32,
    },

    /// List a module's exports.
    Inspect {
        /// Module file.
        module: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let json = cli.log_json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dsp_wasm=debug".into()),
        )
        .with((!json).then(tracing_subscriber::fmt::layer))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .init();

    let mut config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConfigFile::default(),
    };
    config.validate()?;

    let (engine, allocator) = build_engine(&config.runtime, cli.pool_mb)?;

    match cli.command {
        Command::Process {
            module,
            export,
            block_size,
            blocks,
        } => {
            if let Some(export) = export {
                config.harness.export = export;
            }
            if let Some(block_size) = block_size {
                config.harness.block_size = block_size;
            }
            if let Some(blocks) = blocks {
                config.harness.blocks = blocks;
            }
            config.validate()?;

            let module = load_module(&engine, &module)?;
            run_process(&engine, &module, &config)?;
        }
        Command::CallI32 { module, export, a, b } => {
            let module = load_module(&engine, &module)?;
            let mut store = Store::with_bridge(
                &engine,
                &config.runtime.execution,
                config.runtime.bridge.clone(),
            )?;
            let instance = Instance::new(&mut store, &module)?;
            let func = instance.get_func(&mut store, export.as_bytes())?;

            let result = func.call_i32_i32_to_i32(&mut store, a, b)?;
            println!("{result}");
            info!(fuel = store.metrics().last_fuel_consumed, "Call completed");
        }
        Command::CallF32 { module, export, x } => {
            let module = load_module(&engine, &module)?;
            let mut store = Store::with_bridge(
                &engine,
                &config.runtime.execution,
                config.runtime.bridge.clone(),
            )?;
            let instance = Instance::new(&mut store, &module)?;
            let func = instance.get_func(&mut store, export.as_bytes())?;

            let result = func.call_f32_to_f32(&mut store, x)?;
            println!("{result}");
            info!(fuel = store.metrics().last_fuel_consumed, "Call completed");
        }
        Command::Inspect { module } => {
            let module = load_module(&engine, &module)?;
            for name in module.export_names() {
                println!("{name}");
            }
        }
    }

    if let Some(allocator) = allocator {
        let stats = allocator.stats();
        info!(
            peak_bytes = stats.peak_bytes,
            allocations = stats.allocations,
            failures = stats.failures,
            "Host pool usage"
        );
    }

    Ok(())
}

fn build_engine(
    config: &RuntimeConfig,
    pool_mb: Option<usize>,
) -> anyhow::Result<(Engine, Option<AllocatorContext>)> {
    match pool_mb {
        Some(mb) => {
            let capacity = mb
                .checked_mul(1024 * 1024)
                .context("Pool size overflows usize")?;
            let allocator = AllocatorContext::new(LimitedAllocator::new(SystemAllocator, capacity));
            let engine = Engine::with_allocator(&config.engine, allocator.clone())?;
            info!(pool_mb = mb, "Guest memory drawn from capped pool");
            Ok((engine, Some(allocator)))
        }
        None => Ok((Engine::new(&config.engine)?, None)),
    }
}

fn load_module<'e>(engine: &'e Engine, path: &Path) -> anyhow::Result<Module<'e>> {
    let is_text = path.extension().is_some_and(|ext| ext == "wat");

    let module = if is_text {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Module::from_wat(engine, &text)?
    } else {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Module::from_bytes(engine, &bytes)?
    };

    info!(path = %path.display(), hash = %module.content_hash(), "Module loaded");
    Ok(module)
}

fn run_process(engine: &Engine, module: &Module<'_>, config: &ConfigFile) -> anyhow::Result<()> {
    let harness = &config.harness;
    let mut store = Store::with_bridge(
        engine,
        &config.runtime.execution,
        config.runtime.bridge.clone(),
    )?;
    let instance = Instance::new(&mut store, module)?;
    let func = instance.get_func(&mut store, harness.export.as_bytes())?;

    let Some(region) = instance.region() else {
        bail!("Instance has no bridge region; check runtime.bridge.memory_export");
    };
    info!(
        input_offset = region.input_offset(),
        output_offset = region.output_offset(),
        capacity_frames = region.capacity_frames(),
        "Bridge region"
    );

    let frames = harness.block_size as usize;
    let mut input = vec![0.0_f32; frames];
    let mut output = vec![0.0_f32; frames];
    let mut oscillator = Oscillator::new(440.0, harness.sample_rate);

    let deadline = Duration::from_micros(harness.block_deadline_us());
    let mut latencies = Vec::with_capacity(harness.blocks as usize);
    let mut peak = 0.0_f32;

    for _ in 0..harness.blocks {
        oscillator.fill(&mut input);

        let start = Instant::now();
        instance.process(&mut store, &func, &input, &mut output)?;
        latencies.push(start.elapsed());

        peak = output.iter().fold(peak, |acc, s| acc.max(s.abs()));
    }

    let report = LatencyReport::from_samples(&mut latencies, deadline);
    info!(
        blocks = harness.blocks,
        block_size = harness.block_size,
        deadline_us = deadline.as_micros(),
        mean_us = report.mean.as_micros(),
        p99_us = report.p99.as_micros(),
        max_us = report.max.as_micros(),
        missed = report.missed,
        fuel_per_block = store.metrics().last_fuel_consumed,
        output_peak = peak,
        "Processing finished"
    );

    if report.missed > 0 {
        warn!(missed = report.missed, "Blocks exceeded the real-time deadline");
    }

    println!(
        "blocks={} mean={}us p99={}us max={}us missed={}",
        harness.blocks,
        report.mean.as_micros(),
        report.p99.as_micros(),
        report.max.as_micros(),
        report.missed
    );

    Ok(())
}

/// Sine test signal.
struct Oscillator {
    phase: f32,
    step: f32,
}

impl Oscillator {
    #[allow(clippy::cast_precision_loss)]
    fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate.max(1) as f32,
        }
    }

    fn fill(&mut self, block: &mut [f32]) {
        for sample in block {
            *sample = 0.5 * self.phase.sin();
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

/// Summary of per-block processing times.
#[derive(Debug, Default, PartialEq, Eq)]
struct LatencyReport {
    mean: Duration,
    p99: Duration,
    max: Duration,
    missed: usize,
}

impl LatencyReport {
    fn from_samples(samples: &mut [Duration], deadline: Duration) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();

        let total: Duration = samples.iter().sum();
        let count = u32::try_from(samples.len()).unwrap_or(u32::MAX);
        let p99_index = (samples.len() * 99).div_ceil(100).saturating_sub(1);

        Self {
            mean: total / count,
            p99: samples[p99_index],
            max: samples[samples.len() - 1],
            missed: samples.iter().filter(|&&d| d > deadline).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsp_wasm_common::HarnessConfig;

    #[test]
    fn test_latency_report() {
        let mut samples: Vec<Duration> = (1..=100).map(Duration::from_micros).collect();
        let report = LatencyReport::from_samples(&mut samples, Duration::from_micros(90));

        assert_eq!(report.max, Duration::from_micros(100));
        assert_eq!(report.p99, Duration::from_micros(99));
        assert_eq!(report.missed, 10);
        assert_eq!(report.mean, Duration::from_nanos(50_500));
    }

    #[test]
    fn test_latency_report_empty() {
        let report = LatencyReport::from_samples(&mut [], Duration::from_micros(1));
        assert_eq!(report, LatencyReport::default());
    }

    #[test]
    fn test_oscillator_bounded() {
        let mut osc = Oscillator::new(440.0, 48_000);
        let mut block = [0.0_f32; 480];
        osc.fill(&mut block);

        assert!(block.iter().all(|s| s.abs() <= 0.5));
        assert!(block.iter().any(|s| s.abs() > 0.4));
    }

    #[test]
    fn test_cli_parses_negative_arguments() {
        let cli = Cli::try_parse_from(["dsp-wasm", "call-i32", "add.wasm", "add", "-5", "3"]).unwrap();
        assert!(matches!(cli.command, Command::CallI32 { a: -5, b: 3, .. }));
    }

    #[test]
    fn test_harness_defaults_fit_bridge() {
        let config = ConfigFile::default();
        assert!(config.harness.block_size <= config.runtime.bridge.max_frames);
        assert_eq!(HarnessConfig::default().block_deadline_us(), 1000);
    }
}
