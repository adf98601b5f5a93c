//! multiblock CLI: template validation and storage maintenance.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use multiblock::config::EngineConfig;
use multiblock::storage::{RecoveryKind, StorageService, StoreAddress, normalize_segment};
use multiblock::template::{self, TemplateSource};

#[derive(Parser)]
#[command(name = "multiblock", version, about = "Multiblock structure engine tools")]
struct Cli {
    /// Engine configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every template in a directory and summarize it.
    Validate {
        /// Directory of `*.toml` template files.
        dir: PathBuf,
    },

    /// Run storage recovery and print what was repaired.
    Recover {
        #[arg(long)]
        data_dir: PathBuf,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List the records of one store with their checksum status.
    Inspect {
        #[arg(long)]
        data_dir: PathBuf,
        namespace: String,
        domain: String,
        store: String,
    },

    /// Write the default configuration to a file.
    InitConfig {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).into_diagnostic()?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Validate { dir } => {
            let templates =
                template::load_dir(&dir, TemplateSource::User, config.default_tick_interval)
                    .into_diagnostic()?;
            if templates.is_empty() {
                println!("No templates in {}.", dir.display());
                return Ok(());
            }
            println!("Templates in {} ({}):", dir.display(), templates.len());
            for t in &templates {
                let optional = t.pattern().iter().filter(|e| e.optional).count();
                println!(
                    "  {:<32} v{:<3} trigger={:<28} cells={:<3} optional={:<2} ports={:<2} tick={}{}",
                    t.id(),
                    t.version(),
                    t.trigger(),
                    t.pattern().len() + 1,
                    optional,
                    t.ports().len(),
                    t.tick_interval(),
                    if t.persistent() { "" } else { " (transient)" },
                );
            }
        }

        Commands::Recover { data_dir, json } => {
            let service = StorageService::open(&data_dir, config.storage.clone()).into_diagnostic()?;
            service.initialize().into_diagnostic()?;
            let report = service.recover().into_diagnostic()?;
            service.shutdown(true);

            if json {
                println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
                return Ok(());
            }
            if !report.work_needed {
                println!("Storage at {} is clean.", data_dir.display());
                return Ok(());
            }
            println!(
                "Recovery of {}: {} replayed, {} discarded, {} quarantined{}",
                data_dir.display(),
                report.count(RecoveryKind::Replayed),
                report.count(RecoveryKind::Discarded),
                report.count(RecoveryKind::Quarantined),
                if report.unclean_shutdown {
                    " (after unclean shutdown)"
                } else {
                    ""
                },
            );
            for action in &report.actions {
                println!("  {:<16} {:<32} {}", format!("{:?}", action.kind), action.address, action.detail);
            }
        }

        Commands::Inspect {
            data_dir,
            namespace,
            domain,
            store,
        } => {
            let storage = &config.storage;
            let segment = |raw: &str| normalize_segment(raw, storage.id_mode, storage.log_normalization);
            let address = StoreAddress {
                namespace: segment(&namespace).into_diagnostic()?,
                domain: segment(&domain).into_diagnostic()?,
                store: segment(&store).into_diagnostic()?,
            };
            // Read-only: no initialize(), so the session marker is untouched.
            let service = StorageService::open(&data_dir, storage.clone()).into_diagnostic()?;
            let records = service.inspect(&address).into_diagnostic()?;

            if records.is_empty() {
                println!("No records in {address}.");
                return Ok(());
            }
            println!("Records in {address} ({}):", records.len());
            for (key, status) in records {
                match status {
                    Ok(env) => println!(
                        "  {:<32} v{:<3} {:>8} bytes  crc={:08x} ok  producer={} ts={}",
                        key,
                        env.schema_version,
                        env.payload.len(),
                        env.crc32,
                        env.producer,
                        env.timestamp_ms,
                    ),
                    Err(problem) => println!("  {key:<32} CORRUPT  {problem}"),
                }
            }
        }

        Commands::InitConfig { path } => {
            config.save(&path).into_diagnostic()?;
            println!("Wrote configuration to {}", path.display());
        }
    }

    Ok(())
}
