use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use codec_bridge_lib::commands::{convert_files, render_info, ConvertJob};
use codec_bridge_lib::processing::native::WasmLoader;
use codec_bridge_lib::{OptionRecord, OutputFormat, WorkerClient, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "codec-bridge", version, about = "Convert PNG images to WebP, AVIF or optimized PNG")]
struct Cli {
    /// Primary codec module
    #[arg(long, env = "CODEC_BRIDGE_MODULE")]
    module: String,

    /// Quantization module enabling PNGX palette and lossless modes
    #[arg(long, env = "CODEC_BRIDGE_QUANT_MODULE")]
    quant_module: Option<String>,

    /// Worker threads; 0 uses one per core
    #[arg(long, env = "CODEC_BRIDGE_THREADS")]
    threads: Option<usize>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert PNG files
    Convert {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// webp, avif or pngx
        #[arg(short, long, default_value = "webp")]
        format: OutputFormat,

        /// Options as inline JSON, e.g. '{"quality": 80}'
        #[arg(long, conflicts_with = "options_file")]
        options: Option<String>,

        /// Options from a JSON file
        #[arg(long)]
        options_file: Option<PathBuf>,

        /// Output directory, defaults to each input's directory
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
    },
    /// Show module versions and capabilities
    Info,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_target(false)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn load_options(inline: Option<String>, file: Option<PathBuf>) -> anyhow::Result<OptionRecord> {
    let json = match (inline, file) {
        (Some(json), _) => json,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read options file {}", path.display()))?,
        (None, None) => return Ok(OptionRecord::new()),
    };
    serde_json::from_str(&json).context("Options must be a JSON object")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    debug!("{:?}", cli);

    let mut config = WorkerConfig::new(cli.module);
    config.secondary_location = cli.quant_module;
    config.thread_count = cli.threads;

    let loader = WasmLoader::new()?;
    let client = WorkerClient::spawn(Arc::new(loader));
    let init = client.init(config).await?;

    match cli.command {
        Command::Info => {
            println!("{}", render_info(&init));
        }
        Command::Convert { inputs, format, options, options_file, out_dir } => {
            let options = load_options(options, options_file).await?;
            let job = ConvertJob { inputs, format, options, out_dir };
            let summaries = convert_files(&client, &job).await;

            let failed = summaries.iter().filter(|s| !s.success).count();
            let saved: i64 = summaries.iter().map(|s| s.saved_bytes).sum();
            info!("Converted {} of {} files, saved {} bytes", summaries.len() - failed, summaries.len(), saved);
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            if failed > 0 {
                client.terminate();
                bail!("{failed} file(s) failed to convert");
            }
        }
    }

    client.terminate();
    Ok(())
}
