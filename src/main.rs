//! lmsession - chat sessions over a local LM Studio server.
//!
//! Usage:
//!   lmsession serve [--port 8080]         # Start HTTP server
//!   lmsession models                      # List downloaded and loaded models
//!   lmsession complete "Hello"            # One-shot blocking completion

use clap::{Parser, Subcommand};
use lmsession::config::{BackendArgs, ServeArgs};
use lmsession::http_server::{self, AppState};
use lmsession::lmstudio::LmStudioConnector;
use lmsession::registry::SessionRegistry;
use lmsession::service::ChatService;
use std::process::exit;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lmsession")]
#[command(about = "Chat sessions over a local LM Studio server")]
struct Args {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// List models known to the inference server
    Models,
    /// Send one prompt through a throwaway session and print the reply
    Complete {
        /// Prompt text
        prompt: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let connector = Arc::new(LmStudioConnector::new()?);
    let context = args.backend.session_context(connector)?;
    let registry = Arc::new(SessionRegistry::new(context));
    let service = ChatService::new(registry);

    match args.command {
        Commands::Serve(serve) => {
            let options = serve.server_options();
            http_server::run_server(serve.port, AppState::new(service), options).await?;
        }
        Commands::Models => {
            let listing = service.list_models().await?;
            for model in &listing.downloaded {
                let marker = if listing.loaded.contains(model) { "*" } else { " " };
                println!("{} {}", marker, model);
            }
        }
        Commands::Complete { prompt } => {
            let session_id = service.create_session().await;
            let reply = service.send_message(&session_id, &prompt).await;
            service.unload_session(&session_id).await?;
            println!("{}", reply?);
        }
    }
    Ok(())
}
