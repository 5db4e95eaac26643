mod cmd;
mod progress;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "gpt2-complete")]
#[command(version = "0.5.0")]
#[command(about = "Incremental GPT-2 text completion", long_about = None)]
struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Continue a prompt
    Complete(cmd::CompleteArgs),
    /// Download a model into the local store
    Pull { model: String },
    /// Show the known models and whether they are downloaded
    #[command(alias = "ls")]
    List,
    /// Rewrite a model file with quantized weights
    Quantize {
        input: PathBuf,
        output: PathBuf,
        #[arg(short = 't', long = "type")]
        quantization: String,
    },
    /// Print the hyperparameters and tensors of a model file
    Inspect {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = cmd::ignore_cancelled(match cli.command {
        Commands::Complete(args) => cmd::complete(args).await,
        Commands::Pull { model } => cmd::pull(&model).await,
        Commands::List => cmd::list().await,
        Commands::Quantize {
            input,
            output,
            quantization,
        } => cmd::quantize(input, output, &quantization).await,
        Commands::Inspect { file, json } => cmd::inspect(file, json).await,
    });

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
