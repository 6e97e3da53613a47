use clap::Parser;
use cli::handlers::handle_convert;

/// Convert a pipeline-parallel GPT-NeoX checkpoint into a single-file model
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Folder with the layer_NN-model_00-model_states.pt shards and configs/
    #[arg(long, alias = "checkpoint_dir")]
    checkpoint_dir: String,
    /// JSON config of the destination model
    #[arg(long, alias = "hf_config_path")]
    hf_config_path: String,
    /// Folder to write model.safetensors and config.json to
    #[arg(long, alias = "hf_save_dir")]
    hf_save_dir: String,
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    let cli = Cli::parse();

    if let Err(error) = handle_convert(cli.checkpoint_dir, cli.hf_config_path, cli.hf_save_dir) {
        eprintln!("❌ {error}");
        std::process::exit(1);
    }
}
