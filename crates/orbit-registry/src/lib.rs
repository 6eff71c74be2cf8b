//! Package-registry search and manifest lookup for Orbit discovery.
//!
//! Queries the remote registry's search endpoint and fetches per-package
//! manifests from the CDN to extract declared companion requirements.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const SEARCH_PATH: &str = "/-/v1/search";
const SEARCH_KEYWORD_FILTER: &str = "keywords:orbit-extension";
const SEARCH_SAFETY_FILTER: &str = "not:insecure";

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.orbithub.io";
pub const DEFAULT_CDN_URL: &str = "https://cdn.orbithub.io";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Public struct `RegistryPackage` used across Orbit components.
pub struct RegistryPackage {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Public struct `RegistryScoreDetail` used across Orbit components.
pub struct RegistryScoreDetail {
    #[serde(default)]
    pub quality: f64,
    #[serde(default)]
    pub popularity: f64,
    #[serde(default)]
    pub maintenance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Public struct `RegistryScore` used across Orbit components.
pub struct RegistryScore {
    #[serde(rename = "final", default)]
    pub final_score: f64,
    #[serde(default)]
    pub detail: RegistryScoreDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Public struct `RegistrySearchObject` used across Orbit components.
pub struct RegistrySearchObject {
    pub package: RegistryPackage,
    #[serde(default)]
    pub score: RegistryScore,
    #[serde(rename = "searchScore", default)]
    pub search_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Public struct `RegistrySearchResult` used across Orbit components.
pub struct RegistrySearchResult {
    #[serde(default)]
    pub objects: Vec<RegistrySearchObject>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `InstallInfoEntry` used across Orbit components.
pub struct InstallInfoEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bundles_extension: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `InstallInfo` used across Orbit components.
pub struct InstallInfo {
    #[serde(default)]
    pub base: InstallInfoEntry,
    #[serde(default)]
    pub managers: Vec<String>,
    #[serde(default)]
    pub overrides: HashMap<String, InstallInfoEntry>,
}

impl InstallInfo {
    /// Returns the install info effective for `manager`: fields declared by
    /// the manager's override win, unspecified fields fall back to base.
    pub fn effective_entry(&self, manager: &str) -> InstallInfoEntry {
        let mut entry = self.base.clone();
        if let Some(override_entry) = self.overrides.get(manager) {
            if override_entry.name.is_some() {
                entry.name = override_entry.name.clone();
            }
            if override_entry.bundles_extension.is_some() {
                entry.bundles_extension = override_entry.bundles_extension;
            }
        }
        entry
    }

    /// Returns the default manager choice: the first declared manager, or an
    /// empty string when none are declared.
    pub fn default_manager(&self) -> String {
        self.managers.first().cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `KernelSpecHint` used across Orbit components.
pub struct KernelSpecHint {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `KernelInstallInfo` used across Orbit components.
pub struct KernelInstallInfo {
    #[serde(flatten)]
    pub install: InstallInfo,
    #[serde(default)]
    pub kernel_spec: KernelSpecHint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `DiscoveryMetadata` used across Orbit components.
pub struct DiscoveryMetadata {
    #[serde(default)]
    pub server: Option<InstallInfo>,
    #[serde(default)]
    pub kernel: Vec<KernelInstallInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    orbit: Option<OrbitManifestSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OrbitManifestSection {
    #[serde(default)]
    discovery: Option<DiscoveryMetadata>,
}

#[derive(Debug, Clone)]
/// Public struct `RegistryClient` used across Orbit components.
pub struct RegistryClient {
    http: reqwest::Client,
    registry_url: String,
    cdn_url: String,
}

impl RegistryClient {
    pub fn new(registry_url: &str, cdn_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            registry_url: registry_url.trim_end_matches('/').to_string(),
            cdn_url: cdn_url.trim_end_matches('/').to_string(),
        }
    }

    /// Runs a paged extension search. `from` is derived as `pagination * page`
    /// so page indices are zero-based; an out-of-range page yields an empty
    /// object list with the total unchanged.
    pub async fn search(
        &self,
        query: &str,
        page: u64,
        pagination: u64,
    ) -> Result<RegistrySearchResult> {
        let text = format!("{SEARCH_SAFETY_FILTER} {query} {SEARCH_KEYWORD_FILTER}");
        let url = format!("{}{}", self.registry_url, SEARCH_PATH);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("text", text.as_str()),
                ("size", &pagination.to_string()),
                ("from", &(pagination.saturating_mul(page)).to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("failed to query extension registry at '{}'", url))?;
        if !response.status().is_success() {
            bail!(
                "extension registry search at '{}' returned status {}",
                url,
                response.status()
            );
        }
        response
            .json::<RegistrySearchResult>()
            .await
            .with_context(|| format!("failed to parse registry search response from '{}'", url))
    }

    /// Runs the search with only the keyword filter and no paging parameters,
    /// returning however many entries the registry serves by default.
    pub async fn search_all(&self) -> Result<RegistrySearchResult> {
        let text = format!("{SEARCH_KEYWORD_FILTER} {SEARCH_SAFETY_FILTER}");
        let url = format!("{}{}", self.registry_url, SEARCH_PATH);
        let response = self
            .http
            .get(&url)
            .query(&[("text", text.as_str())])
            .send()
            .await
            .with_context(|| format!("failed to query extension registry at '{}'", url))?;
        if !response.status().is_success() {
            bail!(
                "extension registry search at '{}' returned status {}",
                url,
                response.status()
            );
        }
        response
            .json::<RegistrySearchResult>()
            .await
            .with_context(|| format!("failed to parse registry search response from '{}'", url))
    }

    /// Fetches the published manifest for `name@version` and extracts the
    /// `orbit.discovery` section. A manifest without that section means the
    /// package declares no companions.
    pub async fn fetch_discovery_metadata(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<DiscoveryMetadata>> {
        let url = format!("{}/{}@{}/package.json", self.cdn_url, name, version);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch package manifest from '{}'", url))?;
        if !response.status().is_success() {
            bail!(
                "package manifest fetch from '{}' returned status {}",
                url,
                response.status()
            );
        }
        let manifest = response
            .json::<PackageManifest>()
            .await
            .with_context(|| format!("failed to parse package manifest from '{}'", url))?;
        Ok(manifest.orbit.and_then(|section| section.discovery))
    }
}
