//! Geomon CLI - run and validate monitoring simulations.

mod trace;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use geomon_runtime::accurate::{SelfJoinExact, TwoWayJoinExact};
use geomon_runtime::config::QueryKind;
use geomon_runtime::results::RowSink;
use geomon_runtime::source::BufferedSource;
use geomon_runtime::{DataSource, SgmNetwork, Sim, SimulationConfig};
use std::cell::RefCell;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "geomon")]
#[command(version)]
#[command(about = "Simulator for distributed continuous-query monitoring", long_about = None)]
struct Cli {
    /// Verbose output (debug-level logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation
    Run {
        /// Path to the configuration file (YAML or TOML)
        #[arg(short, long, env = "GEOMON_CONFIG")]
        config: PathBuf,

        /// Trace file to replay instead of the configured generator
        #[arg(short, long)]
        trace: Option<PathBuf>,

        /// Directory for the result tables (JSON lines)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also run the exact baseline estimator
        #[arg(long)]
        baselines: bool,
    },

    /// Validate a configuration file
    Check {
        /// Path to the configuration file (YAML or TOML)
        #[arg(short, long, env = "GEOMON_CONFIG")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting tracing subscriber")?;

    match cli.command {
        Commands::Run {
            config,
            trace,
            output,
            baselines,
        } => run(&config, trace.as_deref(), output.as_deref(), baselines),
        Commands::Check { config } => check(&config),
    }
}

fn load_config(path: &Path) -> Result<SimulationConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let cfg = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?,
        _ => serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?,
    };
    Ok(cfg)
}

fn check(config: &Path) -> Result<()> {
    let cfg = load_config(config)?;
    cfg.validate()?;
    info!(name = %cfg.name, "configuration is valid");
    Ok(())
}

fn open_table(dir: &Path, table: &str) -> Result<RowSink> {
    let path = dir.join(format!("{table}.jsonl"));
    let file = File::create(&path)
        .with_context(|| format!("creating result file {}", path.display()))?;
    Ok(RowSink::writer(BufWriter::new(file)))
}

fn run(config: &Path, trace: Option<&Path>, output: Option<&Path>, baselines: bool) -> Result<()> {
    let cfg = load_config(config)?;
    cfg.validate()?;

    let sim = Sim::new();
    if let Some(dir) = output {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        let (dataset, comm, gm) = (
            open_table(dir, "dataset")?,
            open_table(dir, "comm")?,
            open_table(dir, "gm")?,
        );
        sim.with_outputs(|out| {
            out.dataset = dataset;
            out.comm = comm;
            out.gm = gm;
        });
    }

    let source: Box<dyn DataSource> = match trace {
        Some(path) => Box::new(BufferedSource::new(trace::read_trace(path)?)),
        None => Box::new(
            cfg.build_generator()?
                .ok_or_else(|| anyhow!("no trace file given and no generator configured"))?,
        ),
    };
    let meta = cfg.shape_dataset(source).create(&sim)?;
    info!(
        dataset = %meta.name,
        records = meta.size,
        sites = meta.num_sources(),
        streams = meta.streams.len(),
        warmup = meta.warmup,
        "dataset installed"
    );

    let net = Rc::new(RefCell::new(
        cfg.build_network(meta.sources.iter().copied())?,
    ));
    SgmNetwork::install(Rc::clone(&net), &sim);

    let exact = if baselines {
        Some(install_baseline(&cfg, &sim)?)
    } else {
        None
    };

    sim.run();

    let net = net.borrow();
    info!(
        name = %net.name(),
        rounds = net.num_rounds(),
        subrounds = net.num_subrounds(),
        total_bytes = net.channels().total_bytes(),
        estimate = net.estimate(),
        "simulation finished"
    );
    if let Some(exact) = exact {
        let truth = exact.estimate();
        let est = net.estimate();
        let rel = if truth != 0.0 {
            (est - truth).abs() / truth.abs()
        } else {
            0.0
        };
        info!(exact = truth, relative_error = rel, "baseline comparison");
    }
    Ok(())
}

/// Exact baseline matching the configured query.
enum Baseline {
    SelfJoin(Rc<RefCell<SelfJoinExact>>),
    TwoWay(Rc<RefCell<TwoWayJoinExact>>),
}

impl Baseline {
    fn estimate(&self) -> f64 {
        match self {
            Baseline::SelfJoin(m) => m.borrow().current_estimate(),
            Baseline::TwoWay(m) => m.borrow().current_estimate(),
        }
    }
}

fn install_baseline(cfg: &SimulationConfig, sim: &Sim) -> Result<Baseline> {
    Ok(match cfg.query.kind {
        QueryKind::SelfJoin => {
            let sid = cfg
                .query
                .stream
                .ok_or_else(|| anyhow!("query.stream is required"))?;
            let m = Rc::new(RefCell::new(SelfJoinExact::new("exact", sid)));
            SelfJoinExact::install(Rc::clone(&m), sim);
            Baseline::SelfJoin(m)
        }
        QueryKind::TwowayJoin => {
            let (Some(s1), Some(s2)) = (cfg.query.stream1, cfg.query.stream2) else {
                bail!("query.stream1 and query.stream2 are required");
            };
            let m = Rc::new(RefCell::new(TwoWayJoinExact::new("exact", s1, s2)));
            TwoWayJoinExact::install(Rc::clone(&m), sim);
            Baseline::TwoWay(m)
        }
    })
}
