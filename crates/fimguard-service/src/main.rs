use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fimguard_core::atomic::write_atomic;
use fimguard_core::config::{ENV_ADMIN_TOKEN, ENV_SECRET_KEY};
use fimguard_core::paths::default_config_file;
use fimguard_core::{Config, GuardError, WatchMode};
use fimguard_service::{Monitor, MonitorStatus};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const MIN_SECRET_LEN: usize = 12;

#[derive(Parser, Debug)]
#[command(author, version, about = "fimguard file-integrity monitor", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a new config file
    InitConfig {
        #[arg(long)]
        watch_path: PathBuf,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = ModeArg::Notify)]
        mode: ModeArg,
        #[arg(long)]
        webhook_url: Option<String>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the monitor in the foreground until Ctrl-C or safe mode
    Run,
    /// Re-hash the watched tree and check the sealed stores
    Verify {
        /// Commit detected changes and respond to them
        #[arg(long)]
        accept: bool,
    },
    /// Show the persisted monitor status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Leave safe mode (requires the admin token)
    ClearSafeMode {
        /// Also re-record the current tree as trusted
        #[arg(long)]
        rebaseline: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Poll,
    Notify,
}

impl From<ModeArg> for WatchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Poll => WatchMode::Poll,
            ModeArg::Notify => WatchMode::Notify,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_file()?,
    };
    match cli.command {
        Commands::InitConfig {
            watch_path,
            data_dir,
            mode,
            webhook_url,
            force,
        } => init_config_command(&config_path, watch_path, data_dir, mode.into(), webhook_url, force),
        Commands::Run => run_command(&config_path).await,
        Commands::Verify { accept } => verify_command(&config_path, accept).await,
        Commands::Status { json } => status_command(&config_path, json),
        Commands::ClearSafeMode { rebaseline } => clear_command(&config_path, rebaseline).await,
    }
}

fn init_config_command(
    config_path: &Path,
    watch_path: PathBuf,
    data_dir: Option<PathBuf>,
    watch_mode: WatchMode,
    webhook_url: Option<String>,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            config_path.display()
        ));
    }
    let watch_path = watch_path
        .canonicalize()
        .with_context(|| format!("watch path {}", watch_path.display()))?;
    let config = Config {
        watch_path,
        watch_mode,
        data_dir,
        webhook_url,
        secret_key: prompt_secret_twice("Create secret key", ENV_SECRET_KEY)?,
        admin_token: prompt_secret_twice("Create admin token", ENV_ADMIN_TOKEN)?,
        ..Config::default()
    };
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(&config)?;
    write_atomic(config_path, &body)
        .with_context(|| format!("writing {}", config_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(config_path, std::fs::Permissions::from_mode(0o600))?;
    }
    println!("Config written to {}", config_path.display());
    println!("Watching {}", config.watch_path.display());
    Ok(())
}

async fn run_command(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let monitor = Monitor::open(config)?;
    if let Err(e) = monitor.start_monitoring().await {
        eprintln!("{}", monitor.get_status());
        return Err(e);
    }
    let Some(mut stopped) = monitor.session_stopped() else {
        return Err(anyhow!("monitoring session did not start"));
    };
    info!("fimguard running");

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("fimguard stopping");
            monitor.stop_monitoring().await?;
            Ok(())
        }
        _ = async {
            while !*stopped.borrow_and_update() {
                if stopped.changed().await.is_err() {
                    break;
                }
            }
        } => {
            monitor.stop_monitoring().await?;
            let status = monitor.get_status();
            error!("{}", status.headline);
            eprintln!("{status}");
            Err(GuardError::SafeModeActive.into())
        }
    }
}

async fn verify_command(config_path: &Path, accept: bool) -> Result<()> {
    let config = Config::load(config_path)?;
    let monitor = Monitor::open(config)?;
    let report = monitor.run_full_verification(accept).await?;

    println!("{}", report.summary());
    for path in &report.mismatches {
        println!("  modified  {path}");
    }
    for path in &report.missing {
        println!("  missing   {path}");
    }
    for path in &report.created {
        println!("  created   {path}");
    }
    for err in &report.errors {
        println!("  error     {} ({})", err.path, err.error);
    }
    for finding in &report.tamper_findings {
        println!(
            "  TAMPER    {} {}: {}",
            finding.target,
            finding.path.as_deref().unwrap_or("-"),
            finding.detail
        );
    }
    if !report.tamper_findings.is_empty() {
        eprintln!("{}", monitor.get_status());
        std::process::exit(2);
    }
    if !report.is_clean() && !report.accepted {
        std::process::exit(1);
    }
    Ok(())
}

fn status_command(config_path: &Path, json: bool) -> Result<()> {
    let config = Config::load(config_path)?;
    let status = MonitorStatus::read_from_disk(&config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{status}");
    }
    Ok(())
}

async fn clear_command(config_path: &Path, rebaseline: bool) -> Result<()> {
    let config = Config::load(config_path)?;
    let monitor = Monitor::open(config)?;
    let token = prompt_admin_token()?;
    if rebaseline {
        let records = monitor.rebaseline(&token).await?;
        println!("Rebaselined {records} files");
    }
    monitor.clear_safe_mode(&token)?;
    println!("{}", monitor.get_status());
    if !rebaseline {
        println!("If the record store was tampered with, clear again with --rebaseline.");
    }
    Ok(())
}

fn prompt_admin_token() -> Result<String> {
    if let Ok(token) = std::env::var(ENV_ADMIN_TOKEN) {
        if !token.is_empty() {
            return Ok(token);
        }
    }
    rpassword::prompt_password("Admin token: ").map_err(|e| anyhow!("token prompt: {e}"))
}

fn prompt_secret_twice(prompt: &str, env_var: &str) -> Result<String> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Ok(value);
        }
    }
    let first = rpassword::prompt_password(format!("{prompt}: "))
        .map_err(|e| anyhow!("secret prompt: {e}"))?;
    if first.len() < MIN_SECRET_LEN {
        return Err(anyhow!("too short; minimum {MIN_SECRET_LEN} characters"));
    }
    let second =
        rpassword::prompt_password("Confirm: ").map_err(|e| anyhow!("secret prompt: {e}"))?;
    if first != second {
        return Err(anyhow!("values do not match"));
    }
    Ok(first)
}
