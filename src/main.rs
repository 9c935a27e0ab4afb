//! Herd CLI
//!
//! Serves an OpenAI-compatible API in front of a local llama.cpp or ggml binary.

use clap::{Parser, Subcommand};
use herd::{EngineFamily, Herd, PromptProfile, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "herd")]
#[command(about = "OpenAI-compatible API for local llama.cpp models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Interface to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Model file used when a request has no bearer token
        #[arg(short, long, env = "MODEL")]
        model: Option<PathBuf>,

        /// Directory with the llama.cpp `main` and `embedding` binaries
        #[arg(long, env = "LLAMA_DIR")]
        llama_dir: Option<PathBuf>,

        /// Directory with the ggml example binaries
        #[arg(long, env = "GGML_DIR")]
        ggml_dir: Option<PathBuf>,

        /// Seconds without output before the process is nudged
        #[arg(long, default_value = "20")]
        stall_timeout: u64,

        /// Extra flags passed to llama.cpp, after `--`
        #[arg(last = true)]
        engine_args: Vec<String>,
    },

    /// Show which engine and prompt profile a model file selects
    Info {
        /// Path to the model file
        #[arg(short, long, env = "MODEL")]
        model: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("herd=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            model,
            llama_dir,
            ggml_dir,
            stall_timeout,
            engine_args,
        } => {
            let mut config = ServerConfig::default()
                .with_stall_timeout(Duration::from_secs(stall_timeout))
                .with_engine_args(engine_args);
            config.host = host;
            config.port = port;
            config.model_path = model;
            if let Some(dir) = llama_dir {
                config = config.with_llama_dir(dir);
            }
            if let Some(dir) = ggml_dir {
                config = config.with_ggml_dir(dir);
            }

            herd::api::serve(Herd::new(config)).await?;
        }

        Commands::Info { model } => {
            show_info(model);
        }
    }

    Ok(())
}

fn show_info(model: PathBuf) {
    let config = ServerConfig::default();
    let family = EngineFamily::detect(&model);
    let profile = PromptProfile::for_model(&model);

    println!("Model:         {}", model.display());
    println!("Engine:        {}", family.name());
    println!("Executable:    {}", family.executable(&config).display());
    println!("Continuation:  {}", if family.supports_interactive() { "yes" } else { "no" });
    println!("Profile:       {:?}", profile.kind);
    println!("Echo boundary: {:?}", profile.echo_boundary);
    println!("Stop markers:  {:?}", profile.stop_markers);
}
