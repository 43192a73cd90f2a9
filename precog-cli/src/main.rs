use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use precog_core::{config, Executor, Manifest, RunOptions, TokenStore};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    manifest_file: PathBuf,
    output_dir: PathBuf,

    #[arg(long)]
    debug: bool,

    #[arg(long, default_value_t = 3000)]
    redirect_port: u16,

    #[arg(long)]
    redirect_uri: Option<String>,

    #[arg(long)]
    force_reauth: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.debug && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    config::load_dotenv_local();

    let manifest = match Manifest::load(&args.manifest_file) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to load manifest {}: {e}", args.manifest_file.display());
            std::process::exit(1);
        }
    };

    let credentials = match config::resolve_credentials(&manifest.config_schema) {
        Ok(c) => c,
        Err(config::Error::MissingCredentials(missing)) => {
            eprintln!("missing required environment variable(s): {missing}");
            std::process::exit(2);
        }
    };

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating output directory {}", args.output_dir.display()))?;

    let client = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let token_store = TokenStore::new(".credentials");
    let options = RunOptions {
        force_reauth: args.force_reauth,
        redirect_port: args.redirect_port,
        redirect_uri_override: args.redirect_uri,
    };
    let executor = Executor::new(client, token_store, args.output_dir, options);

    match executor.run(&manifest, credentials).await {
        Ok(summary) => {
            println!("{summary}");
            Ok(())
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            std::process::exit(1);
        }
    }
}
