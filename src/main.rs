use clap::{Parser, Subcommand};
use megaplant::config::{DataLayout, PipelineConfig};
use megaplant::pipeline::{PipelineController, PipelineError};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "megaplant",
    version,
    about = "Curate multi-source leaf-image collections into a deduplicated, split dataset"
)]
struct Cli {
    /// Data root holding staging/, processed/, manifests/ and splits/
    #[arg(long, value_name = "DIR", default_value = "data")]
    data_dir: PathBuf,

    /// JSON source configuration (defaults to the built-in sources)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download and stage every configured source archive
    FetchAll,

    /// Rewrite staged sources into the canonical class layout
    Normalize,

    /// Fingerprint the corpus and group exact and near duplicates
    Dedup {
        /// Run to annotate (default: latest)
        #[arg(long, value_name = "RUN")]
        run: Option<String>,
    },

    /// Assign duplicate groups to train/val/test splits
    Split {
        /// Comma-separated ratios summing to 1.0
        #[arg(long, value_delimiter = ',', default_value = "0.7,0.15,0.15")]
        ratios: Vec<f64>,

        /// Seed for reproducible assignment
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Run to split (default: latest)
        #[arg(long, value_name = "RUN")]
        run: Option<String>,

        /// Also write the hard-linked {split}/{class} tree under splits/
        #[arg(long)]
        materialize: bool,
    },

    /// Run the whole pipeline: fetch, normalize, dedup, split
    Run {
        #[arg(long, value_delimiter = ',', default_value = "0.7,0.15,0.15")]
        ratios: Vec<f64>,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        #[arg(long)]
        materialize: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("❌ {error}");
            ExitCode::from(error.exit_code() as u8)
        }
    }
}

fn execute(cli: Cli) -> Result<(), PipelineError> {
    let config = PipelineConfig::load(cli.config.as_deref())?;
    let controller = PipelineController::new(config, DataLayout::new(&cli.data_dir));

    match cli.command {
        Commands::FetchAll => {
            println!(
                "▶ Fetching {} source(s)…",
                controller.config().sources.len()
            );
            let outcome = controller.fetch_all()?;
            for (name, path) in &outcome.staged {
                println!("   ✅ {name} staged at {}", path.display());
            }
            for (name, error) in &outcome.failures {
                println!("   ✗ {name}: {error}");
            }
            match outcome.failures.into_iter().next() {
                Some((_, error)) => Err(error.into()),
                None => Ok(()),
            }
        }

        Commands::Normalize => {
            println!("▶ Normalizing staged sources…");
            let (run_id, store) = controller.normalize()?;
            println!("✅ {} record(s) normalized into run {run_id}", store.len());
            Ok(())
        }

        Commands::Dedup { run } => {
            let run_id = controller
                .manifests()
                .resolve_run(run.as_deref())
                .map_err(|cause| PipelineError::Manifest {
                    stage: "dedup",
                    cause,
                })?;
            println!("▶ Deduplicating run {run_id}…");
            let mut store = controller.load_normalized(&run_id)?;
            let outcome = controller.dedup(&run_id, &mut store)?;
            println!(
                "✅ {} group(s); {} duplicate(s) and {} corrupt file(s) excluded",
                outcome.groups.len(),
                outcome.excluded_duplicates(),
                outcome.corrupt.len()
            );
            Ok(())
        }

        Commands::Split {
            ratios,
            seed,
            run,
            materialize,
        } => {
            let run_id = controller
                .manifests()
                .resolve_run(run.as_deref())
                .map_err(|cause| PipelineError::Manifest {
                    stage: "split",
                    cause,
                })?;
            println!("▶ Splitting run {run_id} (seed {seed})…");
            let mut store = controller.load_normalized(&run_id)?;
            let (groups, _) = controller.load_dedup(&run_id, &mut store)?;
            let manifest =
                controller.split(&run_id, &store, &groups, &ratios, seed, materialize)?;
            println!("✅ {} record(s) assigned", manifest.len());
            for ((split, class), count) in manifest.counts() {
                println!("   {split}/{class}: {count}");
            }
            Ok(())
        }

        Commands::Run {
            ratios,
            seed,
            materialize,
        } => {
            println!("▶ Running the full pipeline…");
            let (summary, error) = controller.run(&ratios, seed, materialize);
            print!("{summary}");
            match error {
                None => Ok(()),
                Some(error) => Err(error),
            }
        }
    }
}
