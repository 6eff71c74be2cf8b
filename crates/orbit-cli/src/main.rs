//! Command-line surface for Orbit extension discovery.
//!
//! Thin presentation layer over the discovery model: searching the registry,
//! listing installed extensions, and running install/uninstall/enable/disable
//! actions with a console companion prompt.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use orbit_companions::{
    CompanionChoice, CompanionInstallFlow, CompanionPrompt, HttpSessionBroker, InstallSelection,
    ResolvedCompanions,
};
use orbit_gateway::ExtensionsGateway;
use orbit_model::{DiscoveryModel, InstallOutcome, DEFAULT_PAGINATION};
use orbit_registry::{RegistryClient, DEFAULT_CDN_URL, DEFAULT_REGISTRY_URL};

#[derive(Debug, Parser)]
#[command(
    name = "orbit-discovery",
    about = "Discover, install, and manage Orbit extensions"
)]
struct Cli {
    #[arg(long, env = "ORBIT_REGISTRY_URL", default_value = DEFAULT_REGISTRY_URL)]
    registry_url: String,
    #[arg(long, env = "ORBIT_CDN_URL", default_value = DEFAULT_CDN_URL)]
    cdn_url: String,
    #[arg(long, env = "ORBIT_SERVER_URL", default_value = "http://127.0.0.1:8888")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search the registry for installable extensions.
    Search {
        query: String,
        #[arg(long, default_value_t = 0)]
        page: u64,
        #[arg(long, default_value_t = DEFAULT_PAGINATION)]
        pagination: u64,
    },
    /// List installed extensions.
    List,
    /// Install an extension, prompting for declared companion packages.
    Install {
        name: String,
        /// Skip companion installs and install only the frontend extension.
        #[arg(long)]
        frontend_only: bool,
    },
    /// Uninstall an installed extension.
    Uninstall { name: String },
    /// Enable an installed extension.
    Enable { name: String },
    /// Disable an installed extension.
    Disable { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let registry = RegistryClient::new(&cli.registry_url, &cli.cdn_url);
    let gateway = ExtensionsGateway::new(&cli.server_url);
    let broker = Arc::new(HttpSessionBroker::new(&cli.server_url));
    let frontend_only = matches!(
        &cli.command,
        Command::Install {
            frontend_only: true,
            ..
        }
    );
    let prompt: Arc<dyn CompanionPrompt> = if frontend_only {
        Arc::new(FrontendOnlyPrompt)
    } else {
        Arc::new(ConsolePrompt)
    };
    let flow = Arc::new(CompanionInstallFlow::new(broker, prompt));
    let model = DiscoveryModel::new(registry, gateway, flow);

    match cli.command {
        Command::Search {
            query,
            page,
            pagination,
        } => run_search(&model, &query, page, pagination).await,
        Command::List => run_list(&model).await,
        Command::Install { name, .. } => run_install(&model, &name).await,
        Command::Uninstall { name } => {
            model.refresh().await;
            model
                .uninstall(&name)
                .await
                .with_context(|| format!("failed to uninstall '{}'", name))?;
            println!("uninstalled: {name}");
            Ok(())
        }
        Command::Enable { name } => {
            model.refresh().await;
            model
                .enable(&name)
                .await
                .with_context(|| format!("failed to enable '{}'", name))?;
            println!("enabled: {name}");
            Ok(())
        }
        Command::Disable { name } => {
            model.refresh().await;
            model
                .disable(&name)
                .await
                .with_context(|| format!("failed to disable '{}'", name))?;
            println!("disabled: {name}");
            Ok(())
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn run_search(model: &DiscoveryModel, query: &str, page: u64, pagination: u64) -> Result<()> {
    if pagination != DEFAULT_PAGINATION {
        model.set_pagination(pagination).await;
    }
    if page != 0 {
        model.set_page(page).await;
    }
    model.set_query(query).await;

    if model.offline() {
        println!(
            "registry unreachable: {}",
            model.error_message().unwrap_or_default()
        );
    }

    // The model never clamps the page; the presentation layer does.
    let pages = model.pages();
    if pages > 0 && model.page() >= pages {
        model.set_page(pages - 1).await;
    }

    let installable = model.installable();
    if installable.is_empty() {
        println!("no installable extensions matched '{query}'");
    }
    for entry in &installable {
        println!(
            "{}  {}  {}",
            entry.name, entry.latest_version, entry.description
        );
    }
    if pages > 0 {
        println!("page {} of {pages} ({} total)", model.page() + 1, model.total_entries());
    }
    Ok(())
}

async fn run_list(model: &DiscoveryModel) -> Result<()> {
    model.refresh().await;
    if model.offline() {
        println!(
            "server unreachable: {}",
            model.error_message().unwrap_or_default()
        );
        return Ok(());
    }
    let installed = model.installed();
    if installed.is_empty() {
        println!("no extensions installed");
        return Ok(());
    }
    for entry in &installed {
        let enabled = if entry.enabled { "enabled" } else { "disabled" };
        let update = if entry.has_update() {
            format!("  (update available: {})", entry.latest_version)
        } else {
            String::new()
        };
        println!(
            "{}  {}  {}{}",
            entry.name, entry.installed_version, enabled, update
        );
    }
    Ok(())
}

async fn run_install(model: &DiscoveryModel, name: &str) -> Result<()> {
    model.refresh().await;
    let outcome = model
        .install(name)
        .await
        .with_context(|| format!("failed to install '{}'", name))?;
    match outcome {
        InstallOutcome::Completed => println!("installed: {name}"),
        InstallOutcome::AbortedByCompanions => {
            println!("frontend install skipped (companion flow)")
        }
    }
    Ok(())
}

/// Console implementation of the companion dialog.
struct ConsolePrompt;

#[async_trait]
impl CompanionPrompt for ConsolePrompt {
    async fn present(&self, resolved: &ResolvedCompanions) -> Result<CompanionChoice> {
        if let Some(server) = &resolved.server {
            println!(
                "This package needs a corresponding server extension: {}",
                server.base.name.as_deref().unwrap_or("<unnamed>")
            );
        }
        for companion in &resolved.kernel {
            println!(
                "The package {} is required by the following kernels:",
                companion.info.install.base.name.as_deref().unwrap_or("<unnamed>")
            );
            for kernel in &companion.kernels {
                println!("  - {}", kernel.display_name.as_deref().unwrap_or(&kernel.name));
            }
        }

        match ask("Install companions? [y]es / [f]rontend only / [c]ancel: ")?.as_str() {
            "y" | "yes" => {}
            "f" | "frontend" => return Ok(CompanionChoice::FrontendOnly),
            _ => return Ok(CompanionChoice::Cancel),
        }

        let mut selection = InstallSelection::from_resolved(resolved);
        for choice in &mut selection.kernel {
            let managers = choice.info.install.managers.clone();
            if managers.len() > 1 {
                let answer = ask(&format!(
                    "Manager for {} ({}) [{}]: ",
                    choice.info.install.base.name.as_deref().unwrap_or("<unnamed>"),
                    managers.join("/"),
                    choice.manager()
                ))?;
                if !answer.is_empty() {
                    choice.set_manager(&answer);
                }
            }
            let kernels = choice.kernels.clone();
            let answer = ask(&format!(
                "Kernels to install into (comma-separated, empty for all of: {}): ",
                kernels
                    .iter()
                    .map(|spec| spec.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))?;
            if answer.is_empty() {
                for spec in &kernels {
                    choice.toggle_kernel(spec);
                }
            } else {
                for wanted in answer.split(',').map(str::trim) {
                    if let Some(spec) = kernels.iter().find(|spec| spec.name == wanted) {
                        choice.toggle_kernel(spec);
                    } else {
                        println!("ignoring unknown kernel '{wanted}'");
                    }
                }
            }
        }
        if let Some(server) = &mut selection.server {
            let managers = server.info.managers.clone();
            if managers.len() > 1 {
                let answer = ask(&format!(
                    "Manager for the server extension ({}) [{}]: ",
                    managers.join("/"),
                    server.manager()
                ))?;
                if !answer.is_empty() {
                    server.set_manager(&answer);
                }
            }
        }
        Ok(CompanionChoice::Install(selection))
    }
}

/// Prompt that skips companion installs entirely (`--frontend-only`).
struct FrontendOnlyPrompt;

#[async_trait]
impl CompanionPrompt for FrontendOnlyPrompt {
    async fn present(&self, _resolved: &ResolvedCompanions) -> Result<CompanionChoice> {
        Ok(CompanionChoice::FrontendOnly)
    }
}

fn ask(question: &str) -> Result<String> {
    print!("{question}");
    io::stdout().flush().context("failed to flush stdout")?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read from stdin")?;
    Ok(line.trim().to_string())
}
