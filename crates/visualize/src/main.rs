use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use training_curves::{read_log, render_curves, VisualizeError, DEFAULT_FILE_NAME};

#[derive(Parser, Debug)]
#[command(author, version, about = "Plot loss and memory curves from a training log", long_about = None)]
struct Args {
    #[arg(long, value_name = "PATH", help = "JSON-lines epoch log (log.txt)")]
    log: PathBuf,

    #[arg(long, value_name = "DIR", help = "Directory the figure is written to")]
    output_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_FILE_NAME, help = "File name of the figure")]
    file_name: String,
}

fn main() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();

    if let Err(err) = run(Args::parse()) {
        error!("visualization failed: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), VisualizeError> {
    let series = read_log(&args.log)?;
    render_curves(&series, &args.output_dir, &args.file_name)?;
    Ok(())
}
