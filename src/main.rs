//! workbox - multi-tenant cloud workspace server.
//!
//! Usage:
//!   workbox serve [--port 8080] [--container-mode]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use workbox::container::{DockerCli, Provisioner};
use workbox::http;
use workbox::state::AppState;
use workbox::storage::{MemoryStore, RemoteStore, SharedStore};
use workbox::terminal::{TerminalManager, DEFAULT_TERMINAL_CAP};

#[derive(Parser, Debug)]
#[command(name = "workbox")]
#[command(about = "Multi-tenant cloud workspace server")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Max concurrent terminals per workspace
        #[arg(long, default_value_t = DEFAULT_TERMINAL_CAP)]
        terminal_cap: usize,

        /// Back terminals with per-workspace docker containers
        #[arg(long)]
        container_mode: bool,

        /// Where local project dirs and container build contexts live
        #[arg(long, default_value = "./projects")]
        projects_dir: PathBuf,
    },
}

/// Remote store when `WORKBOX_STORE_URL`/`WORKBOX_STORE_KEY` are set,
/// in-memory otherwise.
fn build_store() -> SharedStore {
    match (
        std::env::var("WORKBOX_STORE_URL"),
        std::env::var("WORKBOX_STORE_KEY"),
    ) {
        (Ok(url), Ok(key)) => {
            let bucket =
                std::env::var("WORKBOX_STORE_BUCKET").unwrap_or_else(|_| "file-storage".to_string());
            info!(%url, %bucket, "using remote blob store");
            Arc::new(RemoteStore::new(url, key, bucket))
        }
        _ => {
            info!("WORKBOX_STORE_URL not set, using in-memory blob store");
            Arc::new(MemoryStore::new())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match args.command {
        Commands::Serve {
            port,
            terminal_cap,
            container_mode,
            projects_dir,
        } => {
            let store = build_store();
            let terminals = if container_mode {
                let provisioner = Arc::new(Provisioner::new(
                    Arc::new(DockerCli::new()),
                    store.clone(),
                    projects_dir,
                ));
                info!("terminals backed by per-workspace containers");
                Arc::new(TerminalManager::container(terminal_cap, provisioner))
            } else {
                Arc::new(TerminalManager::local(terminal_cap, projects_dir))
            };

            let state = AppState::new(store, terminals);
            http::run_server(port, state).await;
        }
    }
}
