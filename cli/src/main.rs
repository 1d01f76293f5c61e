mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "faceforge")]
#[command(author, version, about = "Identity-guided portrait generation service", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/faceforge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the models and start the inference server
    Serve {
        /// Port to listen on (default: daemon.port from config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Download the diffusion model files ahead of time
    Pull,

    /// Generate one portrait from a person image URL
    Generate {
        /// URL of the person image
        person_image: String,

        /// Text prompt for image generation
        #[arg(short, long, default_value = "A photorealistic portrait")]
        prompt: String,

        /// Output file path
        #[arg(short, long, default_value = "output.jpg")]
        output: String,

        /// Run on CPU instead of GPU
        #[arg(long)]
        cpu: bool,
    },

    /// View or set configuration
    Config {
        /// Config key (e.g., "daemon.port", "inference.use_f16")
        key: Option<String>,

        /// Value to set (if omitted, shows current value)
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve { port } => {
            commands::serve::execute(config_path, port).await?;
        }
        Commands::Pull => {
            commands::pull::execute(config_path).await?;
        }
        Commands::Generate {
            person_image,
            prompt,
            output,
            cpu,
        } => {
            commands::generate::execute(config_path, &person_image, &prompt, &output, cpu)
                .await?;
        }
        Commands::Config { key, value } => {
            commands::config::execute(config_path, key.as_deref(), value.as_deref()).await?;
        }
    }

    Ok(())
}
