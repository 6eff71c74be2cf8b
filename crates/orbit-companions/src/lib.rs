//! Companion-package resolution and install orchestration for Orbit.
//!
//! Resolves a package's declared server/kernel companion requirements against
//! the live kernel registry, collects user manager/kernel choices, fans the
//! install work out across ephemeral sessions, and decides whether the
//! primary frontend install may still proceed.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use orbit_registry::{DiscoveryMetadata, InstallInfo, InstallInfoEntry, KernelInstallInfo};

mod sessions;

pub use sessions::{
    ExecuteReply, HttpSessionBroker, KernelSession, KernelSpec, SessionBroker, TerminalSession,
    EXECUTE_STATUS_OK,
};

pub const MANAGER_PIP: &str = "pip";
pub const MANAGER_CONDA: &str = "conda";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Public struct `KernelCompanion` used across Orbit components.
pub struct KernelCompanion {
    pub info: KernelInstallInfo,
    pub kernels: Vec<KernelSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Public struct `ResolvedCompanions` used across Orbit components.
pub struct ResolvedCompanions {
    pub server: Option<InstallInfo>,
    pub kernel: Vec<KernelCompanion>,
}

impl ResolvedCompanions {
    pub fn is_empty(&self) -> bool {
        self.server.is_none() && self.kernel.is_empty()
    }
}

/// Intersects declared kernel requirements with the live kernel registry.
///
/// A declared language takes precedence over a declared display name; a
/// requirement declaring neither matches nothing. Requirements matching zero
/// live kernels are dropped. Output order follows declaration order.
pub fn resolve_companions(
    metadata: &DiscoveryMetadata,
    live_specs: &[KernelSpec],
) -> ResolvedCompanions {
    let mut kernel = Vec::new();
    for requirement in &metadata.kernel {
        let matches: Vec<KernelSpec> =
            if let Some(language) = requirement.kernel_spec.language.as_deref() {
                live_specs
                    .iter()
                    .filter(|spec| spec.language.as_deref() == Some(language))
                    .cloned()
                    .collect()
            } else if let Some(display_name) = requirement.kernel_spec.display_name.as_deref() {
                live_specs
                    .iter()
                    .filter(|spec| spec.display_name.as_deref() == Some(display_name))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
        if matches.is_empty() {
            continue;
        }
        kernel.push(KernelCompanion {
            info: requirement.clone(),
            kernels: matches,
        });
    }
    ResolvedCompanions {
        server: metadata.server.clone(),
        kernel,
    }
}

#[derive(Debug, Clone)]
/// Public struct `KernelChoice` used across Orbit components.
pub struct KernelChoice {
    pub info: KernelInstallInfo,
    pub kernels: Vec<KernelSpec>,
    manager: String,
    selected: BTreeMap<String, KernelSpec>,
}

impl KernelChoice {
    fn from_companion(companion: &KernelCompanion) -> Self {
        Self {
            manager: companion.info.install.default_manager(),
            info: companion.info.clone(),
            kernels: companion.kernels.clone(),
            selected: BTreeMap::new(),
        }
    }

    pub fn manager(&self) -> &str {
        &self.manager
    }

    pub fn set_manager(&mut self, manager: &str) {
        self.manager = manager.to_string();
    }

    /// Flips the selection state of one kernel; returns true when the kernel
    /// is selected after the call.
    pub fn toggle_kernel(&mut self, spec: &KernelSpec) -> bool {
        if self.selected.remove(&spec.name).is_some() {
            false
        } else {
            self.selected.insert(spec.name.clone(), spec.clone());
            true
        }
    }

    pub fn selected_kernels(&self) -> impl Iterator<Item = &KernelSpec> {
        self.selected.values()
    }

    pub fn effective_entry(&self) -> InstallInfoEntry {
        self.info.install.effective_entry(&self.manager)
    }
}

#[derive(Debug, Clone)]
/// Public struct `ServerChoice` used across Orbit components.
pub struct ServerChoice {
    pub info: InstallInfo,
    manager: String,
}

impl ServerChoice {
    pub fn manager(&self) -> &str {
        &self.manager
    }

    pub fn set_manager(&mut self, manager: &str) {
        self.manager = manager.to_string();
    }

    pub fn effective_entry(&self) -> InstallInfoEntry {
        self.info.effective_entry(&self.manager)
    }
}

#[derive(Debug, Clone, Default)]
/// Public struct `InstallSelection` used across Orbit components.
///
/// Transient per-orchestration state; mutated only through the choice
/// setters, never persisted.
pub struct InstallSelection {
    pub kernel: Vec<KernelChoice>,
    pub server: Option<ServerChoice>,
}

impl InstallSelection {
    pub fn from_resolved(resolved: &ResolvedCompanions) -> Self {
        Self {
            kernel: resolved
                .kernel
                .iter()
                .map(KernelChoice::from_companion)
                .collect(),
            server: resolved.server.as_ref().map(|info| ServerChoice {
                manager: info.default_manager(),
                info: info.clone(),
            }),
        }
    }

    /// True when any choice's effective install info declares that it bundles
    /// the frontend extension. Covers every kernel choice present in the
    /// selection (even with zero kernels ticked) plus the server choice.
    pub fn bundles_extension(&self) -> bool {
        let kernel_bundles = self
            .kernel
            .iter()
            .any(|choice| choice.effective_entry().bundles_extension == Some(true));
        let server_bundles = self
            .server
            .as_ref()
            .is_some_and(|choice| choice.effective_entry().bundles_extension == Some(true));
        kernel_bundles || server_bundles
    }
}

#[derive(Debug, Clone)]
/// Enumerates supported `CompanionChoice` values.
pub enum CompanionChoice {
    /// Abort the whole install, frontend included.
    Cancel,
    /// Install only the frontend extension.
    FrontendOnly,
    /// Install the selected companions, then decide about the frontend.
    Install(InstallSelection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `InstallDecision` values.
pub enum InstallDecision {
    Proceed,
    Halt,
}

#[async_trait]
/// Trait contract for `CompanionPrompt` behavior.
pub trait CompanionPrompt: Send + Sync {
    async fn present(&self, resolved: &ResolvedCompanions) -> Result<CompanionChoice>;
}

#[async_trait]
/// Trait contract for `CompanionGate` behavior.
pub trait CompanionGate: Send + Sync {
    async fn gate_install(&self, metadata: &DiscoveryMetadata) -> Result<InstallDecision>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Public struct `CompanionInstallReport` used across Orbit components.
pub struct CompanionInstallReport {
    pub launched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<String>,
}

/// Orchestrates companion installs across ephemeral sessions.
pub struct CompanionInstallFlow {
    broker: Arc<dyn SessionBroker>,
    prompt: Arc<dyn CompanionPrompt>,
}

impl CompanionInstallFlow {
    pub fn new(broker: Arc<dyn SessionBroker>, prompt: Arc<dyn CompanionPrompt>) -> Self {
        Self { broker, prompt }
    }

    /// Resolves companions, prompts when any exist, runs the selected
    /// installs, and answers whether the frontend install may proceed.
    pub async fn gate(&self, metadata: &DiscoveryMetadata) -> Result<InstallDecision> {
        let live_specs = self
            .broker
            .kernel_specs()
            .await
            .context("failed to list kernel specifications")?;
        let resolved = resolve_companions(metadata, &live_specs);
        if resolved.is_empty() {
            return Ok(InstallDecision::Proceed);
        }
        match self.prompt.present(&resolved).await? {
            CompanionChoice::Cancel => Ok(InstallDecision::Halt),
            CompanionChoice::FrontendOnly => Ok(InstallDecision::Proceed),
            CompanionChoice::Install(selection) => {
                let report = self.install_selection(&selection).await;
                if report.failed > 0 {
                    warn!(
                        failed = report.failed,
                        launched = report.launched,
                        "companion installs reported failures"
                    );
                }
                if selection.bundles_extension() {
                    Ok(InstallDecision::Halt)
                } else {
                    Ok(InstallDecision::Proceed)
                }
            }
        }
    }

    /// Launches every selected companion install concurrently and waits for
    /// all of them. Failures are logged and aggregated; they do not abort
    /// sibling tasks.
    pub async fn install_selection(&self, selection: &InstallSelection) -> CompanionInstallReport {
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        for choice in &selection.kernel {
            let effective = choice.effective_entry();
            for spec in choice.selected_kernels() {
                let broker = Arc::clone(&self.broker);
                let manager = choice.manager.clone();
                let info = effective.clone();
                let spec = spec.clone();
                tasks.spawn(async move {
                    let target = format!("kernel '{}'", spec.name);
                    let outcome = install_on_kernel(broker.as_ref(), &spec, &manager, &info).await;
                    (target, outcome)
                });
            }
        }
        if let Some(server) = &selection.server {
            let broker = Arc::clone(&self.broker);
            let manager = server.manager.clone();
            let info = server.effective_entry();
            tasks.spawn(async move {
                let outcome = install_on_server(broker.as_ref(), &manager, &info).await;
                ("server".to_string(), outcome)
            });
        }

        let mut report = CompanionInstallReport {
            launched: tasks.len(),
            ..CompanionInstallReport::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, Ok(()))) => {
                    report.succeeded += 1;
                    debug!(%target, "companion install completed");
                }
                Ok((target, Err(error))) => {
                    report.failed += 1;
                    warn!(%target, error = %format!("{error:#}"), "companion install failed");
                    report.failures.push(format!("{target}: {error:#}"));
                }
                Err(join_error) => {
                    report.failed += 1;
                    warn!(%join_error, "companion install task aborted");
                    report.failures.push(format!("task: {join_error}"));
                }
            }
        }
        report
    }
}

#[async_trait]
impl CompanionGate for CompanionInstallFlow {
    async fn gate_install(&self, metadata: &DiscoveryMetadata) -> Result<InstallDecision> {
        self.gate(metadata).await
    }
}

/// Python snippet that installs `package` inside the kernel's own
/// interpreter via the given manager's CLI. None for unrecognized managers.
pub fn kernel_install_code(manager: &str, package: &str) -> Option<String> {
    match manager {
        MANAGER_PIP => Some(format!(
            r#"
import sys
from subprocess import check_call
check_call([sys.executable, '-m', 'pip', 'install', '{package}'])
"#
        )),
        MANAGER_CONDA => Some(format!(
            r#"
import sys
from subprocess import check_call
import os
pjoin = os.path.join
cmd_opt = ['install', '--prefix', sys.prefix, '--yes', '--quiet', '{package}']
try:
    check_call([pjoin(sys.prefix, 'bin', 'conda')] + cmd_opt)
except FileNotFoundError:
    if os.name == 'nt':
        check_call([pjoin(sys.prefix, 'Scripts', 'conda')] + cmd_opt)
    else:
        raise
"#
        )),
        _ => None,
    }
}

/// One-line shell command installing `package` on the host server. None for
/// unrecognized managers.
pub fn server_install_command(manager: &str, package: &str) -> Option<String> {
    match manager {
        MANAGER_PIP => Some(format!("pip install {package}")),
        MANAGER_CONDA => Some(format!("conda install --yes --quiet {package}")),
        _ => None,
    }
}

async fn install_on_kernel(
    broker: &dyn SessionBroker,
    spec: &KernelSpec,
    manager: &str,
    info: &InstallInfoEntry,
) -> Result<()> {
    let package = info
        .name
        .as_deref()
        .ok_or_else(|| anyhow!("companion install info declares no package name"))?;
    // Recipe lookup happens before any session is started so an unknown
    // manager fails without network effects.
    let code = kernel_install_code(manager, package)
        .ok_or_else(|| anyhow!("unknown manager: '{manager}'"))?;
    let mut session = broker
        .start_kernel(&spec.name)
        .await
        .with_context(|| format!("failed to start session for kernel '{}'", spec.name))?;
    let outcome = session.execute(&code).await;
    if let Err(error) = session.shutdown().await {
        debug!(kernel = %spec.name, error = %format!("{error:#}"), "kernel session shutdown failed");
    }
    let reply = outcome
        .with_context(|| format!("failed to run '{manager}' install on kernel '{}'", spec.name))?;
    if !reply.is_ok() {
        bail!(
            "install of '{}' via '{}' on kernel '{}' returned status '{}'{}",
            package,
            manager,
            spec.name,
            reply.status,
            reply
                .evalue
                .as_deref()
                .map(|evalue| format!(": {evalue}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn install_on_server(
    broker: &dyn SessionBroker,
    manager: &str,
    info: &InstallInfoEntry,
) -> Result<()> {
    let package = info
        .name
        .as_deref()
        .ok_or_else(|| anyhow!("companion install info declares no package name"))?;
    let command = server_install_command(manager, package)
        .ok_or_else(|| anyhow!("unknown manager: '{manager}'"))?;
    let mut terminal = broker
        .start_terminal()
        .await
        .context("failed to start terminal session")?;
    let driven = drive_terminal_install(&mut *terminal, &command).await;
    if let Err(error) = driven {
        // Disconnect never arrived; tear the terminal down ourselves.
        if let Err(shutdown_error) = terminal.shutdown().await {
            debug!(
                error = %format!("{shutdown_error:#}"),
                "terminal shutdown after failed install also failed"
            );
        }
        return Err(error);
    }
    Ok(())
}

async fn drive_terminal_install(
    terminal: &mut (dyn TerminalSession + '_),
    command: &str,
) -> Result<()> {
    terminal.send_line(command).await?;
    terminal.send_line("exit").await?;
    terminal.wait_disconnect().await
}
