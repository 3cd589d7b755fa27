use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{handle_ask, handle_kbs, handle_models, handle_providers, AskArgs};
use localrag_core::RagConfig;

#[derive(Parser)]
#[command(name = "localrag")]
#[command(about = "localrag - retrieval-augmented answers from local or remote models", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, env = "LOCALRAG_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question, optionally grounded in a knowledge base
    Ask {
        /// The question
        query: String,

        /// Model endpoint URL, or "local" for an on-device model
        #[arg(long, env = "LOCALRAG_API_URL", default_value = "https://api.deepseek.com")]
        api_url: String,

        /// API key for the endpoint
        #[arg(long, env = "LOCALRAG_API_KEY", default_value = "")]
        api_key: String,

        /// Model name (or local model id)
        #[arg(long, default_value = "deepseek-chat")]
        model: String,

        /// Knowledge base to search; "none" answers directly
        #[arg(long, default_value = "none")]
        kb: String,

        /// System instruction
        #[arg(long, default_value = "")]
        system: String,
    },

    /// List known model providers
    Providers,

    /// List knowledge bases
    Kbs,

    /// List local models
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (searches current dir and parent dirs)
    let _ = dotenvy::dotenv();

    // Logs go to stderr so answers on stdout stay clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .compact()
        .init();

    let cli_args = Cli::parse();
    let config = RagConfig::load(cli_args.config.as_deref())?;

    match cli_args.command {
        Commands::Ask {
            query,
            api_url,
            api_key,
            model,
            kb,
            system,
        } => {
            let args = AskArgs {
                query,
                api_url,
                api_key,
                model,
                knowledge_base: kb,
                system_prompt: system,
            };
            handle_ask(&config, args).await?;
        }

        Commands::Providers => handle_providers(),

        Commands::Kbs => handle_kbs(&config).await?,

        Commands::Models => handle_models(&config)?,
    }

    Ok(())
}
