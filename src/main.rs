//! AutoDevOps CLI: natural-language requests to validated, applied IaC.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "autodevops",
    version,
    about = "Natural-language to applied Infrastructure as Code: validated, audited, reversible"
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: autodevops::cli::Commands,
}

fn init_tracing(json: bool, verbose: u8) {
    let default = match verbose {
        0 => "autodevops=info",
        1 => "autodevops=debug",
        _ => "autodevops=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json, cli.verbose);
    if let Err(e) = autodevops::cli::dispatch(cli.command).await {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}
