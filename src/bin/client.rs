//! bulletin-client: posts one message to a bulletin board server.

use bulletin_board::client;
use bulletin_board::Post;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the bulletin board client
#[derive(Parser, Debug)]
#[command(name = "bulletin-client")]
#[command(version)]
#[command(about = "Post a message to a bulletin board server", long_about = None)]
struct ClientArgs {
    /// Server host name or address
    #[arg(short, long)]
    server: String,

    /// Server port (1-65535)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// User name shown with the post
    #[arg(short, long)]
    user: String,

    /// Url of an image shown with the post
    #[arg(short, long)]
    image: Option<String>,

    /// Message text
    #[arg(short, long)]
    message: String,

    /// Log protocol details
    #[arg(short, long)]
    verbose: bool,

    /// Directory receiving the response files
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = ClientArgs::parse();

    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let post = Post::new(args.user, args.image, args.message);
    match client::post(&args.server, args.port, &post, &args.output_dir).await {
        Ok(reply) => {
            if reply.is_accepted() {
                info!(files = reply.files.len(), "Post accepted");
            } else {
                warn!(status = reply.status, "Post rejected by server");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Post failed");
            ExitCode::FAILURE
        }
    }
}
