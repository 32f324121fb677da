mod auth;
mod error;
mod html;
mod render;
mod serve;
mod session;
mod store;
mod views;
mod web_assets;

use std::{io, path::PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Explicit subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Serve the document store over HTTP
    Serve {
        /// Interface address to bind to
        #[arg(long, env = "CMS_BIND", default_value = "127.0.0.1")]
        bind: String,
        /// Starting port number for the HTTP server
        #[arg(long, env = "CMS_PORT", default_value = "4567")]
        port: u16,
        /// Directory holding the documents (created if missing)
        #[arg(long, env = "CMS_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
        /// YAML file mapping usernames to password digests
        #[arg(long, env = "CMS_CREDENTIALS", default_value = "users.yml")]
        credentials: PathBuf,
    },
    /// Print a password digest for the credentials file
    HashPassword {
        /// Plaintext password to hash
        password: String,
    },
}

#[derive(Parser)]
#[command(
    name = "cms",
    version,
    about = "A small file-backed content management web app",
    after_help = "CREDENTIALS FILE:\n  admin: \"<output of `cms hash-password <password>`>\""
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> io::Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Serve {
            bind,
            port,
            data_dir,
            credentials,
        } => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            rt.block_on(serve::run_serve(serve::ServeConfig {
                bind,
                port,
                data_dir,
                credentials,
            }))
        }
        Commands::HashPassword { password } => {
            let digest = auth::hash_password(&password)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            println!("{digest}");
            Ok(())
        }
    }
}
