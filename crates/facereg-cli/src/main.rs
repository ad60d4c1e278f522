use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facereg_core::{EmbeddingStore, Registry, SqliteStorage};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod dataset;

use config::Config;

#[derive(Parser)]
#[command(name = "facereg", about = "Face embedding registry and verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an embedding for a person (repeat registrations are averaged)
    Register {
        /// Person identifier (e.g., matriculation number)
        #[arg(long)]
        id: String,
        /// JSON file containing the embedding as an array of numbers
        #[arg(long)]
        embedding: PathBuf,
        /// Reference to the source image (e.g., its filename)
        #[arg(long)]
        image_ref: Option<String>,
    },
    /// Identify the registered person closest to an embedding
    Verify {
        #[arg(long)]
        embedding: PathBuf,
        /// Minimum cosine similarity (defaults to the configured threshold)
        #[arg(long, allow_negative_numbers = true)]
        threshold: Option<f32>,
    },
    /// Print a registered record
    Show {
        id: String,
    },
    /// List registered person IDs
    List,
    /// Remove a registered person
    Remove {
        id: String,
    },
    /// Measure accuracy against a directory of labelled probe embeddings
    Evaluate {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long, allow_negative_numbers = true)]
        threshold: Option<f32>,
    },
    /// Show registry status
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    let storage = SqliteStorage::open(&config.db_path)
        .with_context(|| format!("opening registry {}", config.db_path.display()))?;
    let registry = Registry::new(EmbeddingStore::new(storage));

    match cli.command {
        Commands::Register {
            id,
            embedding,
            image_ref,
        } => {
            let embedding = dataset::read_embedding(&embedding, config.expected_dimension)?;
            let persisted = registry
                .register(&id, embedding, image_ref.as_deref())
                .with_context(|| format!("registering {id}"))?;
            if !persisted {
                anyhow::bail!("registry did not persist the embedding for {id}");
            }
            let record = registry.require_record(&id)?;
            println!("Registered {id} ({} samples)", record.sample_count);
        }
        Commands::Verify {
            embedding,
            threshold,
        } => {
            let embedding = dataset::read_embedding(&embedding, config.expected_dimension)?;
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let result = registry.verify_detailed(&embedding, threshold)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Show { id } => {
            let record = registry.require_record(&id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::List => {
            let ids = registry.list_ids()?;
            if ids.is_empty() {
                println!("No identities registered");
            }
            for id in ids {
                println!("{id}");
            }
        }
        Commands::Remove { id } => match registry.delete(&id)? {
            0 => println!("{id} was not registered"),
            _ => println!("Removed {id}"),
        },
        Commands::Evaluate {
            dataset: root,
            threshold,
        } => {
            let threshold = threshold.unwrap_or(config.similarity_threshold);
            let probes = dataset::load_probes(&root, config.expected_dimension)?;
            let report = facereg_core::evaluation::evaluate(&registry, probes, threshold)?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            println!("accuracy:  {:.2}%", report.accuracy() * 100.0);
            println!("precision: {:.2}%", report.precision() * 100.0);
            println!("recall:    {:.2}%", report.recall() * 100.0);
            println!("f1:        {:.2}%", report.f1() * 100.0);
        }
        Commands::Status => {
            println!(
                "{}",
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "db_path": config.db_path.display().to_string(),
                    "identities": registry.store().len()?,
                    "similarity_threshold": config.similarity_threshold,
                    "expected_dimension": config.expected_dimension,
                })
            );
        }
    }

    Ok(())
}
