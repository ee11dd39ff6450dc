//! Main module for the `arag` CLI application.
//!
//! Parses the command line, loads the configuration, builds the pipeline and runs the
//! requested subcommand.
//!
//! # Examples
//!
//! ```sh
//! arag init
//! arag ingest manual.txt
//! arag ask "How often should the filter be replaced?"
//! arag interactive
//! ```

use awful_rag::{
    commands::{Cli, Commands},
    config::{self, AwfulRagConfig, GenerationBackend},
    config_dir,
    embedding::build_embedder,
    error::RagError,
    generator::OllamaChatModel,
    index::VectorIndex,
    pipeline::RagPipeline,
    pretty,
};
use clap::Parser;
use crossterm::{
    ExecutableCommand,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::OnceCell;
use std::{
    error::Error,
    io::{self, BufRead, Write, stdout},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt().with_writer(io::stderr).init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

/// Main asynchronous function of the `arag` CLI application.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command fails.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config_dir()?.join("config.yaml"),
    };

    if cli.command == Commands::Init {
        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for path in config::init(&dir)? {
            println!("Created {}", path.display());
        }
        return Ok(());
    }

    debug!("Loading config from: {}", config_path.display());
    let rag_config = if config_path.exists() {
        config::load_config(&config_path)?
    } else {
        info!(
            "No config at {}, using defaults (run `arag init` to create one)",
            config_path.display()
        );
        AwfulRagConfig::default()
    };
    debug!("Config loaded: {:?}", rag_config);

    match cli.command {
        Commands::Doctor => return doctor(&rag_config).await,
        Commands::Clear => {
            // Overwrites the store without loading it, so a corrupted index can be reset.
            let index_path = rag_config.resolved_index_path()?;
            VectorIndex::new(
                rag_config.embedding.dimension,
                rag_config.retrieval.similarity,
            )
            .persist_to(&index_path)?;
            println!("Index at {} cleared.", index_path.display());
            return Ok(());
        }
        _ => {}
    }

    let pipeline = match RagPipeline::from_config(rag_config).await {
        Ok(pipeline) => pipeline,
        Err(RagError::IndexCorrupted(reason)) => {
            return Err(format!(
                "the stored index is corrupted ({reason}); run `arag clear`, then re-ingest your documents"
            )
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    match cli.command {
        Commands::Ingest { file, name } => ingest(&pipeline, &file, name.as_deref()).await?,
        Commands::Ask { question } => {
            let answer = pipeline.ask(&question).await?;
            pretty::render_answer(&mut stdout(), &answer)?;
        }
        Commands::Interactive => interactive(&pipeline).await?,
        Commands::Stats => pretty::render_stats(&mut stdout(), &pipeline.stats())?,
        Commands::Init | Commands::Doctor | Commands::Clear => {}
    }

    Ok(())
}

async fn ingest(
    pipeline: &RagPipeline,
    file: &Path,
    name: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} embedding [{bar:30}] {pos}/{len} chunks")?
            .progress_chars("=> "),
    );
    let report = pipeline
        .ingest_file_with_progress(file, name, |done, total| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        })
        .await;
    bar.finish_and_clear();

    pretty::render_report(&mut stdout(), &report?)?;
    Ok(())
}

async fn interactive(pipeline: &RagPipeline) -> Result<(), Box<dyn Error>> {
    let mut out = stdout();
    out.execute(SetForegroundColor(Color::DarkGrey))?
        .execute(Print(
            "Ask about your documents. `history` shows this session, `forget` clears it, `exit` quits.\n",
        ))?
        .execute(ResetColor)?;

    let stdin = io::stdin();
    loop {
        out.execute(SetForegroundColor(Color::Green))?
            .execute(Print("> "))?
            .execute(ResetColor)?;
        out.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        match input {
            "" => continue,
            "exit" | "quit" => break,
            "history" => {
                println!("{}", pipeline.history().formatted());
                continue;
            }
            "forget" => {
                pipeline.clear_history();
                continue;
            }
            _ => {}
        }

        match pipeline.ask(input).await {
            Ok(answer) => pretty::render_answer(&mut out, &answer)?,
            Err(e) if e.is_service_error() => {
                pretty::render_error(&mut out, &format!("Service unavailable: {e}"))?
            }
            Err(e) => pretty::render_error(&mut out, &e.to_string())?,
        }
        println!();
    }
    Ok(())
}

/// Reports on the generation service, the embedder and the stored index.
async fn doctor(config: &AwfulRagConfig) -> Result<(), Box<dyn Error>> {
    let mut out = stdout();
    let mut healthy = true;

    match config.generation.backend {
        GenerationBackend::Ollama => {
            let ollama =
                OllamaChatModel::new(&config.generation.api_base, config.request_timeout())?;
            match ollama.list_models().await {
                Ok(models) => {
                    println!("Ollama at {}: {} models", config.generation.api_base, models.len());
                    for model in &models {
                        println!("  - {model}");
                    }
                    if models.iter().any(|m| m.contains(&config.generation.model)) {
                        println!("Model {} is available.", config.generation.model);
                    } else {
                        healthy = false;
                        pretty::render_error(
                            &mut out,
                            &format!(
                                "Model {} is not pulled; run `ollama pull {}`.",
                                config.generation.model, config.generation.model
                            ),
                        )?;
                    }
                }
                Err(e) => {
                    healthy = false;
                    pretty::render_error(&mut out, &format!("Ollama unreachable: {e}"))?;
                }
            }
        }
        GenerationBackend::OpenAi => {
            println!(
                "Generation uses the OpenAI-compatible API at {} (model {}).",
                config.generation.api_base, config.generation.model
            );
        }
    }

    match build_embedder(&config.embedding, config.request_timeout()).await {
        Ok(embedder) => match embedder.embed("ping").await {
            Ok(vector) => println!(
                "Embedder {} works ({} dimensions).",
                embedder.model_name(),
                vector.len()
            ),
            Err(e) => {
                healthy = false;
                pretty::render_error(&mut out, &format!("Embedding failed: {e}"))?;
            }
        },
        Err(e) => {
            healthy = false;
            pretty::render_error(&mut out, &format!("Embedder unavailable: {e}"))?;
        }
    }

    let index_path = config.resolved_index_path()?;
    match VectorIndex::load(
        &index_path,
        config.embedding.dimension,
        config.retrieval.similarity,
    ) {
        Ok(index) => println!(
            "Index at {}: {} entries.",
            index_path.display(),
            index.len()
        ),
        Err(e) => {
            healthy = false;
            pretty::render_error(&mut out, &format!("Index at {}: {e}", index_path.display()))?;
        }
    }

    if healthy {
        Ok(())
    } else {
        Err("one or more checks failed".into())
    }
}
