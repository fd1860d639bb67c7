//! intunewin-packager - turn catalog packages into Intune `.intunewin` files.
//!
//! Searches the catalog, downloads the chosen installer, writes the
//! install/uninstall/detection scripts and runs the packaging tool over them.

use clap::{Parser, Subcommand};
use intunewin_packager::{
    CatalogClient, ConfigError, FailureKind, JobExecutor, JobOutcome, JobRequest,
    Level, PackagerError, ProcessRunner, ProgressEvent, Settings,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "intunewin-packager",
    version,
    about = "Package catalog software as Intune Win32 apps",
    long_about = "Searches the package catalog, downloads an installer and wraps it with \
generated install, uninstall and detection scripts into an .intunewin file.

Usage:
  intunewin-packager config set-tool C:\\Tools\\IntuneWinAppUtil.exe
  intunewin-packager search 7zip
  intunewin-packager package 7zip.7zip --output C:\\Packages"
)]
struct Cli {
    /// Settings file to use instead of the per-user default
    #[arg(long, global = true, env = "INTUNEWIN_PACKAGER_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search the catalog
    Search {
        query: String,
    },

    /// Package a catalog entry
    Package {
        /// Catalog id, e.g. 7zip.7zip
        id: String,

        /// Search terms used to find the id (defaults to the id)
        #[arg(long)]
        query: Option<String>,

        /// Directory that receives the .intunewin file
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,
    },

    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the settings file location and contents
    Show,

    /// Set the path to IntuneWinAppUtil.exe
    SetTool { path: PathBuf },

    /// Forget the packaging tool path
    ClearTool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Packager(#[from] PackagerError),

    #[error("failed to render settings: {0}")]
    Render(#[from] serde_json::Error),

    #[error("{0}")]
    JobFailed(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if let CliError::Packager(err) = &e {
                if err.needs_configuration() {
                    eprintln!("Hint: run `intunewin-packager config set-tool <PATH>`");
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_path = match cli.config {
        Some(path) => path,
        None => Settings::default_path()?,
    };
    let settings = Settings::load(&config_path)?;
    debug!(path = %config_path.display(), "Loaded settings");

    match cli.command {
        Command::Search { query } => search(settings, &query).await,
        Command::Package { id, query, output } => {
            let request = JobRequest {
                query,
                package_id: id,
                output_dir: output,
            };
            package(settings, request).await
        }
        Command::Config { action } => configure(settings, &config_path, action),
    }
}

async fn search(settings: Settings, query: &str) -> Result<(), CliError> {
    if query.trim().is_empty() {
        return Err(PackagerError::EmptyQuery.into());
    }
    let runner = Arc::new(ProcessRunner::new());
    let client = CatalogClient::new(runner, settings.catalog_tool.clone())
        .with_timeouts(settings.search_timeout(), settings.download_timeout());

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watcher.cancel();
        }
    });

    let entries = client.search(query.trim(), cancel, None).await?;
    if entries.is_empty() {
        println!("No packages found for '{}'", query.trim());
        return Ok(());
    }

    let name_width = column_width(entries.iter().map(|e| e.name.as_str()), "Name");
    let id_width = column_width(entries.iter().map(|e| e.id.as_str()), "Id");
    println!("{:<name_width$}  {:<id_width$}  Version", "Name", "Id");
    for entry in &entries {
        println!(
            "{:<name_width$}  {:<id_width$}  {}",
            entry.name, entry.id, entry.version
        );
    }
    Ok(())
}

fn column_width<'a>(values: impl Iterator<Item = &'a str>, header: &str) -> usize {
    values
        .map(|v| v.chars().count())
        .fold(header.len(), usize::max)
}

async fn package(settings: Settings, request: JobRequest) -> Result<(), CliError> {
    // Fail before touching the network when the tool cannot run anyway.
    settings.packaging_tool()?;

    let executor = JobExecutor::new(settings, Arc::new(ProcessRunner::new()));
    let mut ticket = executor.submit(request)?;

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = ticket.events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!("Interrupted, cancelling job");
                interrupted = true;
                ticket.cancel.cancel();
            }
        }
    }

    let outcome = ticket
        .handle
        .await
        .map_err(|e| CliError::JobFailed(format!("job task ended unexpectedly: {e}")))?;
    report(&outcome)
}

fn print_event(event: &ProgressEvent) {
    if event.from_tool() {
        println!("    {}", event.message);
        return;
    }
    match event.level {
        Level::Error => eprintln!("[{}] {}", event.phase, event.message),
        Level::Warning => println!("[{}] warning: {}", event.phase, event.message),
        Level::Info => println!("[{}] {}", event.phase, event.message),
    }
}

fn report(outcome: &JobOutcome) -> Result<(), CliError> {
    if let Some(artifact) = outcome.artifact.as_ref().filter(|_| outcome.succeeded()) {
        println!("Package ready: {}", artifact.display());
        return Ok(());
    }

    if let Some(workspace) = &outcome.preserved_workspace {
        eprintln!("Workspace kept for inspection: {}", workspace.display());
    }
    match &outcome.failure {
        Some(failure) if failure.kind == FailureKind::ToolNotConfigured => {
            Err(PackagerError::ToolNotConfigured {
                reason: failure.message.clone(),
            }
            .into())
        }
        Some(failure) => Err(CliError::JobFailed(failure.to_string())),
        None => Err(CliError::JobFailed(format!(
            "job ended in state {}",
            outcome.state
        ))),
    }
}

fn configure(
    mut settings: Settings,
    path: &Path,
    action: ConfigCommand,
) -> Result<(), CliError> {
    match action {
        ConfigCommand::Show => {
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
            match settings.packaging_tool() {
                Ok(tool) => println!("# packaging tool OK: {}", tool.display()),
                Err(e) => println!("# {e}"),
            }
        }
        ConfigCommand::SetTool { path: tool } => {
            let tool = if tool.is_absolute() {
                tool
            } else {
                std::env::current_dir()
                    .map(|dir| dir.join(&tool))
                    .unwrap_or(tool)
            };
            settings.packaging_tool_path = Some(tool);
            settings.packaging_tool()?;
            settings.save(path)?;
            println!("Packaging tool set");
        }
        ConfigCommand::ClearTool => {
            settings.packaging_tool_path = None;
            settings.save(path)?;
            println!("Packaging tool cleared");
        }
    }
    Ok(())
}
