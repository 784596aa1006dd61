use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use du_runtime::{Capabilities, Config, Interpreter};
use log::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "du", version, about = "Run Du scripts", long_about = None)]
struct Cli {
    /// Path to the script to run; reads the program from stdin when omitted
    script: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    debug: bool,

    /// Withhold all filesystem capabilities from the script
    #[arg(long)]
    no_files: bool,

    /// Override the initial script directory
    #[arg(long)]
    workdir: Option<PathBuf>,
}

fn main() {
    let args = Cli::parse();
    let mut builder = colog::default_builder();
    if args.debug {
        builder.filter(None, log::LevelFilter::Debug);
    }
    builder.init();

    if let Err(e) = run(args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: Cli) -> Result<()> {
    let caps = if args.no_files {
        debug!("running without filesystem capabilities");
        Capabilities::no_files()
    } else {
        Capabilities::local_fs()
    };

    let script_dir = match (&args.workdir, &args.script) {
        (Some(dir), _) => dir.clone(),
        (None, Some(path)) => path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
        (None, None) => PathBuf::from("."),
    };

    let interp = Interpreter::new(
        Config {
            script_dir,
            ..Config::default()
        },
        caps,
    );

    let result = match &args.script {
        Some(path) => {
            let path = std::fs::canonicalize(path)
                .with_context(|| format!("cannot open {}", path.display()))?;
            info!("running {}", path.display());
            interp
                .execute_path(&path.display().to_string())
                .map_err(anyhow::Error::new)?
        }
        None => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("failed to read program from stdin")?;
            interp.execute(&source).map_err(anyhow::Error::new)?
        }
    };

    if !result.is_nil() {
        println!("{}", result.to_display_string());
    }

    // final snapshot for any store configured with persistence
    du_runtime::store::registry().shutdown();
    Ok(())
}
