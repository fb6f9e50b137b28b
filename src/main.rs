mod cli;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::path::Path;

use imgforge::config::{self, AppConfig, BuildMode, ClassicOptions, SnapOptions};
use imgforge::statemachine::StateMachine;
use imgforge::steps;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    // Initialize logger, default info level, display file line number and time
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}:{}] {level_style}{}{level_style:#}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    // Try to load configuration file
    let config_path = Path::new(config::CONFIG_FILE);
    let app_config = if config_path.exists() {
        match AppConfig::load_from_file(config_path) {
            Ok(cfg) => {
                let abs_path = std::fs::canonicalize(config_path)
                    .unwrap_or_else(|_| config_path.to_path_buf());
                info!("Using configuration file: {}", abs_path.display());
                Some(cfg)
            }
            Err(e) => {
                error!("Failed to load configuration file: {}, using defaults", e);
                None
            }
        }
    } else {
        None
    };

    let build = match cli.command {
        Commands::Snap { bundle, common } => {
            common.into_config(BuildMode::Snap(SnapOptions { bundle }), app_config.as_ref())
        }

        Commands::Classic {
            layout,
            suite,
            mirror,
            components,
            packages,
            hooks,
            hostname,
            common,
        } => {
            let mut opts = ClassicOptions::new(layout, suite);
            if !components.is_empty() {
                opts.components = components;
            }
            opts.extra_packages = packages;
            opts.hooks = hooks;
            opts.hostname = hostname;
            let mut cfg = common.into_config(BuildMode::Classic(opts), app_config.as_ref());
            // the mirror default comes from the config file, the flag wins over it
            if let (BuildMode::Classic(opts), Some(mirror)) = (&mut cfg.mode, mirror) {
                opts.mirror = mirror;
            }
            cfg
        }

        Commands::Resume {
            workdir,
            compression,
            run,
        } => match cli::resume_config(workdir, compression, run) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        },

        Commands::Steps { image_type } => {
            for (i, name) in steps::step_names(image_type).iter().enumerate() {
                println!("{:>2}  {name}", i + 1);
            }
            return Ok(());
        }

        Commands::Genconfig { force } => {
            if let Err(e) = AppConfig::generate_config_file(config_path, force) {
                error!("Error: {}", e);
                std::process::exit(1);
            }
            return Ok(());
        }
    };

    let mut machine = StateMachine::new(build);
    if let Err(e) = machine.execute() {
        error!("{e}");
        if let Some(dir) = machine.workspace() {
            info!("workspace kept at {}", dir.display());
        }
        std::process::exit(1);
    }
    info!("build finished: {:?}", machine.status());
    Ok(())
}
