mod commands;

use clap::{Parser, Subcommand};
use commands::{RunArgs, init, run};

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Supervise a dedicated game server under wine in a headless container")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble the server installation and run it under supervision
    Run(RunArgs),
    /// One-time wine prefix initialization
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Init => init().await,
    };
    std::process::exit(code);
}
