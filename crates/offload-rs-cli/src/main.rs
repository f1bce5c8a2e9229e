use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use offload_rs::backend::spec::Program;
use offload_rs::env::HW_APP_DIR_VAR;
use offload_rs::hardware::{HardwareBuildManager, HardwareConfig};
use offload_rs_harness::{
    offload_per_operator, run_scenario, HarnessConfig, HarnessContext, Scenario, ScenarioStatus,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "offload", version)]
#[command(about = "Offload operators to an accelerator backend and verify the results", long_about = None)]
struct Cli {
    /// Harness configuration (JSON). Flags below override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Accelerator backend to offload to
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Directory holding the hardware Makefile
    #[arg(long, global = true)]
    app_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OpKind {
    Add,
    BiasAdd,
    All,
}

impl OpKind {
    fn scenarios(self) -> Vec<Scenario> {
        let add = Scenario::add(&[8, 4]);
        let bias_add = Scenario::bias_add(&[1, 112, 112, 32], &[32], 3);
        match self {
            OpKind::Add => vec![add],
            OpKind::BiasAdd => vec![bias_add],
            OpKind::All => vec![add, bias_add],
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run operator scenarios and print the cycles each one took
    Ops {
        #[arg(long, value_enum, default_value_t = OpKind::All)]
        op: OpKind,
        /// Vector lane counts, comma separated (defaults to the configured list)
        #[arg(long, value_delimiter = ',')]
        lanes: Vec<u32>,
        /// Seed for the random inputs
        #[arg(long)]
        seed: Option<u64>,
        /// Do not enable the cycle profiler
        #[arg(long)]
        no_profile: bool,
    },
    /// Print the partitioned IR of a scenario or a program file
    Partition {
        #[arg(long, value_enum, default_value_t = OpKind::Add)]
        op: OpKind,
        /// Program JSON to partition instead of a built-in scenario
        #[arg(long)]
        program: Option<PathBuf>,
        /// Give every supported operator its own region
        #[arg(long)]
        per_operator: bool,
    },
    /// Build the hardware library for a lane count unless it already exists
    Build {
        #[arg(long)]
        lanes: u32,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    tracing::debug!(?config, "harness configuration");

    match cli.command {
        Commands::Ops {
            op,
            lanes,
            seed,
            no_profile,
        } => {
            if !lanes.is_empty() {
                config.lanes = lanes;
            }
            if let Some(seed) = seed {
                config.seed = seed;
            }
            if no_profile {
                config.profiler_enable = false;
            }
            run_ops(config, op)
        }
        Commands::Partition {
            op,
            program,
            per_operator,
        } => print_partition(config, op, program, per_operator),
        Commands::Build { lanes } => build(&config, lanes),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    }
    .with_env_overrides();
    if let Some(backend) = &cli.backend {
        config.backend = backend.clone();
    }
    if let Some(dir) = &cli.app_dir {
        config.hardware_app_dir = Some(dir.clone());
    }
    Ok(config)
}

fn run_ops(config: HarnessConfig, op: OpKind) -> Result<()> {
    let lanes = config.lanes.clone();
    let cx = HarnessContext::vsim(config);
    for scenario in op.scenarios() {
        for &n in &lanes {
            match run_scenario(&cx, &scenario, n)? {
                ScenarioStatus::Passed(outcome) => println!("{outcome}"),
                ScenarioStatus::Skipped { reason } => println!(
                    "test:{} vector-lanes:{} skipped: {reason}",
                    scenario.op_name(),
                    n
                ),
            }
        }
    }
    Ok(())
}

fn print_partition(
    config: HarnessConfig,
    op: OpKind,
    program: Option<PathBuf>,
    per_operator: bool,
) -> Result<()> {
    let programs = match program {
        Some(path) => vec![Program::load_json(&path)
            .with_context(|| format!("failed to load program {}", path.display()))?],
        None => op
            .scenarios()
            .iter()
            .map(Scenario::program)
            .collect::<Result<Vec<_>>>()?,
    };
    let cx = HarnessContext::vsim(config);
    for program in &programs {
        let partitioned = if per_operator {
            offload_per_operator(program, Arc::clone(&cx.support), &cx.config.backend)?
        } else {
            cx.offload(program)?
        };
        print!("{partitioned}");
    }
    Ok(())
}

fn build(config: &HarnessConfig, lanes: u32) -> Result<()> {
    let app_dir = config.hardware_app_dir.clone().with_context(|| {
        format!("no hardware app directory; pass --app-dir or set {HW_APP_DIR_VAR}")
    })?;
    let builds = HardwareBuildManager::new(app_dir);
    let path = builds.ensure_built(&HardwareConfig::new(config.library_name.clone(), lanes))?;
    println!("{}", path.display());
    Ok(())
}
