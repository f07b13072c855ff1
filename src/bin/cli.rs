//! Pomodoro Updater - entry point the application shell calls at startup
//!
//! Exit codes: 0 when up to date or updated, 2 when the failure is worth retrying
//! later, 1 for anything else.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use pomodoro_lib::engine::{
    cli::{Cli, Commands, OutputFormat},
    config::{UpdaterConfig, CONFIG_FILE_NAME},
    updater::{ApplyOutcome, RestartRequired, UpdateOrchestrator},
};
use std::process::{Command, ExitCode};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run_cli(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// RUST_LOG wins unless --verbose is given
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,pomodoro_lib=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,pomodoro_lib=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_cli(cli: &Cli) -> Result<ExitCode> {
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { force } => cmd_init(cli, force, json),
        Commands::Check => cmd_check(cli, json),
        Commands::Apply { restart } => cmd_apply(cli, restart, json),
        Commands::Status => cmd_status(cli, json),
    }
}

fn orchestrator(cli: &Cli) -> Result<UpdateOrchestrator> {
    let config = cli.load_config().context("loading updater config")?;
    UpdateOrchestrator::new(config).context("initializing updater")
}

fn cmd_init(cli: &Cli, force: bool, json: bool) -> Result<ExitCode> {
    let base_dir = cli.get_base_dir()?;
    let config_path = base_dir.join(CONFIG_FILE_NAME);
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = UpdaterConfig::for_base_dir(&base_dir);
    if let Some(url) = &cli.service_url {
        config.service_url = url.clone();
    }
    config.save(&base_dir)?;

    if json {
        println!("{}", serde_json::json!({ "config": config_path, "settings": config }));
    } else {
        println!("{} Wrote {}", "✓".green(), config_path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_check(cli: &Cli, json: bool) -> Result<ExitCode> {
    let orch = orchestrator(cli)?;
    let installed = orch.installed_version();

    match orch.check() {
        Ok(manifest) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "installed": installed,
                        "update_available": manifest.is_some(),
                        "version": manifest.as_ref().map(|m| &m.target_version),
                    })
                );
            } else {
                match manifest {
                    Some(m) => println!(
                        "{} Update available: {} (installed: {})",
                        "↑".yellow(),
                        m.target_version.to_string().bold(),
                        installed.map(|v| v.to_string()).unwrap_or_else(|| "unknown".into())
                    ),
                    None => println!("{} Up to date", "✓".green()),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            if json {
                println!("{}", serde_json::json!({ "error": e.to_string(), "retryable": e.is_retryable() }));
            } else {
                eprintln!("{} {}", "✗".red(), e);
            }
            Ok(failure_code(e.is_retryable()))
        }
    }
}

fn cmd_apply(cli: &Cli, restart: bool, json: bool) -> Result<ExitCode> {
    let orch = orchestrator(cli)?;
    let outcome = orch.check_and_apply();

    if json {
        println!("{}", serde_json::to_string(&outcome)?);
    }

    match outcome {
        ApplyOutcome::UpToDate => {
            if !json {
                println!("{} Up to date", "✓".green());
            }
            Ok(ExitCode::SUCCESS)
        }
        ApplyOutcome::Updated { restart: signal } => {
            if !json {
                println!(
                    "{} Updated to {}",
                    "✓".green(),
                    signal.version.to_string().bold()
                );
            }
            if restart {
                relaunch(&signal)?;
            } else if !json {
                println!("  Restart the application to use the new version.");
            }
            Ok(ExitCode::SUCCESS)
        }
        ApplyOutcome::Failed { reason } => {
            if !json {
                eprintln!("{} {}", "✗".red(), reason);
                if reason.retryable {
                    eprintln!("  Continuing with the installed version; try again later.");
                }
            }
            Ok(failure_code(reason.retryable))
        }
    }
}

fn cmd_status(cli: &Cli, json: bool) -> Result<ExitCode> {
    let orch = orchestrator(cli)?;
    let installed = orch.installed_version();
    let latest = orch.client().latest_version();
    let backup = orch.backup_record();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "installed": installed,
                "latest": latest.as_ref().ok(),
                "latest_error": latest.as_ref().err().map(|e| e.to_string()),
                "install_dir": orch.config().install_dir,
                "service_url": orch.config().service_url,
                "backup": backup,
            })
        );
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}", "Pomodoro Update Status".bold());
    println!(
        "   Installed: {}",
        installed.map(|v| v.to_string()).unwrap_or_else(|| "unknown".into())
    );
    match latest {
        Ok(v) => println!("   Latest:    {}", v),
        Err(e) => println!("   Latest:    {} ({})", "unavailable".yellow(), e),
    }
    println!("   Install:   {}", orch.config().install_dir.display());
    println!("   Service:   {}", orch.config().service_url);
    match backup {
        Some(b) if b.had_installation => println!(
            "   Backup:    {} ({} files, taken {})",
            b.version.map(|v| v.to_string()).unwrap_or_else(|| "unknown".into()),
            b.files,
            b.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        _ => println!("   Backup:    (none)"),
    }
    Ok(ExitCode::SUCCESS)
}

fn failure_code(retryable: bool) -> ExitCode {
    if retryable {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

/// Start the freshly installed application in place of this process
fn relaunch(signal: &RestartRequired) -> Result<()> {
    let Some(executable) = &signal.executable else {
        anyhow::bail!("no launch_executable configured; restart the application manually");
    };
    if !executable.exists() {
        anyhow::bail!("updated executable not found at {}", executable.display());
    }

    tracing::info!("Relaunching {}", executable.display());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = Command::new(executable)
            .current_dir(&signal.install_dir)
            .exec();
        Err(err).with_context(|| format!("exec {}", executable.display()))
    }

    #[cfg(not(unix))]
    {
        Command::new(executable)
            .current_dir(&signal.install_dir)
            .spawn()
            .with_context(|| format!("launching {}", executable.display()))?;
        std::process::exit(0);
    }
}
