use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;

use hbmsim_attention::{calculate, QueryRater, Rater, RaterConfig};
use hbmsim_core::{Allocator, Residency};
use hbmsim_device::{GpuSimulator, SimConfig};

#[derive(Parser)]
#[command(
    name = "hbmsim",
    about = "Streaming attention on a simulated HBM/SRAM device",
    version
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the device model and default workload
    Info,
    /// Run streaming attention over a random workload and score it
    Run {
        /// Number of rounds (key/value pairs and queries)
        #[arg(long, default_value = "8")]
        rounds: usize,
        /// Feature width of keys, values and queries
        #[arg(long, default_value = "16")]
        dim: usize,
        /// Seed for the input generator
        #[arg(long, default_value = "0")]
        seed: u64,
        /// Max absolute error for an answer to pass
        #[arg(long, default_value = "1e-4")]
        tolerance: f32,
        /// SRAM capacity in bytes (overrides --config)
        #[arg(long)]
        sram_budget: Option<usize>,
        /// HBM capacity in bytes (overrides --config)
        #[arg(long)]
        hbm_budget: Option<usize>,
        /// Simulator config file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Log every operation's output values
        #[arg(long)]
        debug: bool,
        /// Print the report as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Info => {
            cmd_info();
            Ok(())
        }
        Commands::Run {
            rounds,
            dim,
            seed,
            tolerance,
            sram_budget,
            hbm_budget,
            config,
            debug,
            json,
        } => {
            let mut sim_config = match config {
                Some(path) => SimConfig::from_json_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => SimConfig::unbounded(),
            };
            if let Some(bytes) = sram_budget {
                sim_config = sim_config.with_sram_budget(bytes);
            }
            if let Some(bytes) = hbm_budget {
                sim_config = sim_config.with_hbm_budget(bytes);
            }
            sim_config.trace_values |= debug;

            let rater_config = RaterConfig {
                rounds,
                dim,
                seed,
                tolerance,
            };
            cmd_run(sim_config, &rater_config, json)
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_info() {
    println!("hbmsim v{}\n", env!("CARGO_PKG_VERSION"));

    println!("Device");
    println!("  Tiers:      hbm (large, slow), sram (small, fast)");
    println!("  Execution:  deferred queue, applied in order by run()");
    println!("  Compute:    operands and outputs must be SRAM-resident");
    println!("  Element:    f32 ({} bytes)", hbmsim_core::matrix::ELEM_BYTES);

    let defaults = RaterConfig::default();
    println!("\nDefault workload");
    println!("  Rounds:     {}", defaults.rounds);
    println!("  Dim:        {}", defaults.dim);
    println!("  Seed:       {}", defaults.seed);
    println!("  Tolerance:  {:.1e}", defaults.tolerance);
}

fn cmd_run(sim_config: SimConfig, rater_config: &RaterConfig, json: bool) -> Result<()> {
    if rater_config.dim == 0 {
        bail!("--dim must be at least 1");
    }

    tracing::info!(
        rounds = rater_config.rounds,
        dim = rater_config.dim,
        sram_budget = ?sim_config.sram_budget_bytes,
        hbm_budget = ?sim_config.hbm_budget_bytes,
        "starting run"
    );

    let mut alloc = Allocator::new();
    let mut sim = GpuSimulator::new(sim_config);
    let mut rater = Rater::random(&mut alloc, rater_config).context("building workload")?;
    let keys = rater.keys().to_vec();
    let values = rater.values().to_vec();

    let start = Instant::now();
    calculate(&keys, &values, &mut rater, &mut sim, &mut alloc).context("streaming attention failed")?;
    let elapsed = start.elapsed();

    let report = rater.report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        rater.print_result(&sim, &alloc);
        println!("Wall time: {:.3}ms", elapsed.as_secs_f64() * 1000.0);
    }

    alloc
        .leak_check(&rater.owned_handles())
        .context("device tensors leaked")?;
    rater.release_all(&mut alloc)?;
    tracing::debug!(
        peak_sram = alloc.peak_bytes(Residency::Sram),
        allocations = alloc.total_allocations(),
        "teardown complete"
    );

    if !report.all_passed() {
        bail!(
            "{} of {} rounds failed (max |err| {:.3e})",
            report.rounds - report.passed,
            report.rounds,
            report.max_abs_error
        );
    }
    Ok(())
}
