//! Discovery state reconciliation and action tracking for Orbit.
//!
//! Merges registry search results with the locally installed-extension list
//! into one consistent paginated view, tracks in-flight actions per entry,
//! and gates extension installs behind the companion-install flow.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use orbit_companions::{CompanionGate, InstallDecision};
use orbit_gateway::{ExtensionAction, ExtensionStatus, ExtensionsGateway, InstalledExtension};
use orbit_registry::{RegistryClient, RegistrySearchResult};


pub const DEFAULT_PAGINATION: u64 = 250;

// The package delivering this tool itself never shows up in its own listings.
const SELF_PACKAGE_NAME: &str = "orbit-discovery";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Public struct `Entry` used across Orbit components.
pub struct Entry {
    pub name: String,
    pub description: String,
    pub runtime_package: Option<String>,
    pub installed: bool,
    pub enabled: bool,
    pub status: Option<ExtensionStatus>,
    pub latest_version: String,
    pub installed_version: String,
}

impl Entry {
    pub fn has_update(&self) -> bool {
        self.installed && self.installed_version != self.latest_version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `InstallOutcome` values.
pub enum InstallOutcome {
    Completed,
    /// The companion flow decided the frontend install must not run (user
    /// cancelled, or a companion bundles the frontend code).
    AbortedByCompanions,
}

#[derive(Debug, Error)]
/// Enumerates supported `ActionError` values.
pub enum ActionError {
    #[error("already installed: {0}")]
    AlreadyInstalled(String),
    #[error("not installed, cannot uninstall: {0}")]
    NotInstalled(String),
    #[error("already enabled: {0}")]
    AlreadyEnabled(String),
    #[error("already disabled: {0}")]
    AlreadyDisabled(String),
    #[error("unknown extension: {0}")]
    UnknownEntry(String),
    #[error("companion flow failed for '{name}'")]
    Companions {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("extension action '{action}' failed for '{name}'")]
    Gateway {
        action: ExtensionAction,
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

type StateListener = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
struct ModelState {
    query: String,
    page: u64,
    pagination: u64,
    total_entries: u64,
    installed: Vec<Entry>,
    installable: Vec<Entry>,
    offline: bool,
    error_message: Option<String>,
    generation: u64,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            query: String::new(),
            page: 0,
            pagination: DEFAULT_PAGINATION,
            total_entries: 0,
            installed: Vec::new(),
            installable: Vec::new(),
            offline: false,
            error_message: None,
            generation: 0,
        }
    }
}

/// Reconciles the remote registry view with the locally installed list and
/// executes extension actions against the gateway.
pub struct DiscoveryModel {
    registry: RegistryClient,
    gateway: ExtensionsGateway,
    companions: Arc<dyn CompanionGate>,
    state: Mutex<ModelState>,
    pending: Mutex<HashSet<String>>,
    listeners: Mutex<Vec<StateListener>>,
}

impl DiscoveryModel {
    pub fn new(
        registry: RegistryClient,
        gateway: ExtensionsGateway,
        companions: Arc<dyn CompanionGate>,
    ) -> Self {
        Self {
            registry,
            gateway,
            companions,
            state: Mutex::new(ModelState::default()),
            pending: Mutex::new(HashSet::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn query(&self) -> String {
        self.state.lock().expect("state lock").query.clone()
    }

    pub fn page(&self) -> u64 {
        self.state.lock().expect("state lock").page
    }

    pub fn pagination(&self) -> u64 {
        self.state.lock().expect("state lock").pagination
    }

    pub fn total_entries(&self) -> u64 {
        self.state.lock().expect("state lock").total_entries
    }

    /// Installed entries in gateway order.
    pub fn installed(&self) -> Vec<Entry> {
        self.state.lock().expect("state lock").installed.clone()
    }

    /// Registry hits not installed locally, in registry relevance order.
    pub fn installable(&self) -> Vec<Entry> {
        self.state.lock().expect("state lock").installable.clone()
    }

    pub fn offline(&self) -> bool {
        self.state.lock().expect("state lock").offline
    }

    pub fn error_message(&self) -> Option<String> {
        self.state.lock().expect("state lock").error_message.clone()
    }

    /// Total page count from the registry-reported total. The model never
    /// clamps `page`; that is the presentation layer's job.
    pub fn pages(&self) -> u64 {
        let state = self.state.lock().expect("state lock");
        if state.pagination == 0 {
            return 0;
        }
        (state.total_entries + state.pagination - 1) / state.pagination
    }

    /// Registers a listener fired once after every completed state
    /// replacement.
    pub fn on_change(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .push(Box::new(listener));
    }

    pub async fn set_query(&self, value: &str) {
        self.state.lock().expect("state lock").query = value.to_string();
        self.refresh().await;
    }

    pub async fn set_page(&self, value: u64) {
        self.state.lock().expect("state lock").page = value;
        self.refresh().await;
    }

    pub async fn set_pagination(&self, value: u64) {
        self.state.lock().expect("state lock").pagination = value;
        self.refresh().await;
    }

    /// Runs one reconciliation pass: search and installed-list fetch issued
    /// concurrently, results merged, listeners notified. A pass whose
    /// generation is no longer current discards its results untouched.
    pub async fn refresh(&self) {
        let (generation, query, page, pagination) = {
            let mut state = self.state.lock().expect("state lock");
            state.generation += 1;
            (state.generation, state.query.clone(), state.page, state.pagination)
        };
        let (search, installed) = tokio::join!(
            self.registry.search(&query, page, pagination),
            self.gateway.list()
        );
        self.apply_pass(generation, search, installed);
    }

    fn apply_pass(
        &self,
        generation: u64,
        search: anyhow::Result<RegistrySearchResult>,
        installed: anyhow::Result<Vec<InstalledExtension>>,
    ) {
        {
            let mut state = self.state.lock().expect("state lock");
            if state.generation != generation {
                debug!(
                    generation,
                    latest = state.generation,
                    "discarding stale reconciliation pass"
                );
                return;
            }
            state.offline = false;
            state.error_message = None;
            match installed {
                Ok(list) => state.installed = translate_installed(&list),
                Err(error) => {
                    state.offline = true;
                    state.error_message = Some(format!("{error:#}"));
                }
            }
            let installed_names: HashSet<&str> = state
                .installed
                .iter()
                .map(|entry| entry.name.as_str())
                .collect();
            match search {
                Ok(result) => {
                    let installable: Vec<_> = translate_search(&result)
                        .into_iter()
                        .filter(|entry| !installed_names.contains(entry.name.as_str()))
                        .collect();
                    state.total_entries = result.total;
                    state.installable = installable;
                }
                Err(error) => {
                    state.offline = true;
                    state.error_message = Some(format!("{error:#}"));
                    state.installable = Vec::new();
                    state.total_entries = 0;
                }
            }
        }
        self.notify_listeners();
    }

    fn notify_listeners(&self) {
        let listeners = self.listeners.lock().expect("listeners lock");
        for listener in listeners.iter() {
            listener();
        }
    }

    /// True while any submitted action has not settled. Drives the global
    /// busy indicator; it does not identify which entries are pending.
    pub fn has_pending_actions(&self) -> bool {
        !self.pending.lock().expect("pending lock").is_empty()
    }

    fn find_entry(&self, name: &str) -> Result<Entry, ActionError> {
        let state = self.state.lock().expect("state lock");
        state
            .installed
            .iter()
            .chain(state.installable.iter())
            .find(|entry| entry.name == name)
            .cloned()
            .ok_or_else(|| ActionError::UnknownEntry(name.to_string()))
    }

    fn mark_pending(&self, name: &str) -> PendingGuard<'_> {
        self.pending
            .lock()
            .expect("pending lock")
            .insert(name.to_string());
        PendingGuard {
            model: self,
            name: name.to_string(),
        }
    }

    /// Installs an extension, first running the companion flow declared by
    /// its package metadata. A `Halt` decision aborts before the gateway is
    /// contacted.
    pub async fn install(&self, name: &str) -> Result<InstallOutcome, ActionError> {
        let entry = self.find_entry(name)?;
        if entry.installed {
            return Err(ActionError::AlreadyInstalled(entry.name));
        }
        let guard = self.mark_pending(name);
        let metadata = self
            .registry
            .fetch_discovery_metadata(name, &entry.latest_version)
            .await
            .map_err(|source| ActionError::Companions {
                name: name.to_string(),
                source,
            })?;
        if let Some(metadata) = metadata {
            let decision = self
                .companions
                .gate_install(&metadata)
                .await
                .map_err(|source| ActionError::Companions {
                    name: name.to_string(),
                    source,
                })?;
            if decision == InstallDecision::Halt {
                debug!(extension = name, "companion flow halted frontend install");
                return Ok(InstallOutcome::AbortedByCompanions);
            }
        }
        self.gateway
            .perform(ExtensionAction::Install, name)
            .await
            .map_err(|source| ActionError::Gateway {
                action: ExtensionAction::Install,
                name: name.to_string(),
                source,
            })?;
        drop(guard);
        self.refresh().await;
        Ok(InstallOutcome::Completed)
    }

    pub async fn uninstall(&self, name: &str) -> Result<(), ActionError> {
        let entry = self.find_entry(name)?;
        if !entry.installed {
            return Err(ActionError::NotInstalled(entry.name));
        }
        self.submit(ExtensionAction::Uninstall, name).await
    }

    pub async fn enable(&self, name: &str) -> Result<(), ActionError> {
        let entry = self.find_entry(name)?;
        if entry.enabled {
            return Err(ActionError::AlreadyEnabled(entry.name));
        }
        self.submit(ExtensionAction::Enable, name).await
    }

    pub async fn disable(&self, name: &str) -> Result<(), ActionError> {
        let entry = self.find_entry(name)?;
        if !entry.enabled {
            return Err(ActionError::AlreadyDisabled(entry.name));
        }
        self.submit(ExtensionAction::Disable, name).await
    }

    async fn submit(&self, action: ExtensionAction, name: &str) -> Result<(), ActionError> {
        let guard = self.mark_pending(name);
        self.gateway
            .perform(action, name)
            .await
            .map_err(|source| ActionError::Gateway {
                action,
                name: name.to_string(),
                source,
            })?;
        drop(guard);
        self.refresh().await;
        Ok(())
    }
}

/// Clears the pending flag exactly once, on every exit path of an action.
struct PendingGuard<'a> {
    model: &'a DiscoveryModel,
    name: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.model
            .pending
            .lock()
            .expect("pending lock")
            .remove(&self.name);
    }
}

fn translate_search(result: &RegistrySearchResult) -> Vec<Entry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for object in &result.objects {
        let package = &object.package;
        if package.name == SELF_PACKAGE_NAME || !seen.insert(package.name.clone()) {
            continue;
        }
        entries.push(Entry {
            name: package.name.clone(),
            description: package.description.clone(),
            runtime_package: None,
            installed: false,
            enabled: false,
            status: None,
            latest_version: package.version.clone(),
            installed_version: String::new(),
        });
    }
    entries
}

fn translate_installed(list: &[InstalledExtension]) -> Vec<Entry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for extension in list {
        if extension.name == SELF_PACKAGE_NAME || !seen.insert(extension.name.clone()) {
            continue;
        }
        entries.push(Entry {
            name: extension.name.clone(),
            description: extension.description.clone(),
            runtime_package: None,
            installed: true,
            enabled: extension.enabled,
            status: extension.status,
            latest_version: extension.latest_version.clone(),
            installed_version: extension.installed_version.clone(),
        });
    }
    entries
}
