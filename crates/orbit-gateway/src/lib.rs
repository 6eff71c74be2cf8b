//! Installed-extension gateway client for Orbit discovery.
//!
//! Talks to the workbench server's extension endpoint: lists locally
//! installed extensions and submits install/uninstall/enable/disable actions.

use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const EXTENSIONS_PATH: &str = "/api/extensions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported `ExtensionStatus` values.
pub enum ExtensionStatus {
    Ok,
    Warning,
    Error,
    Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported `ExtensionAction` values.
pub enum ExtensionAction {
    Install,
    Uninstall,
    Enable,
    Disable,
}

impl ExtensionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtensionAction::Install => "install",
            ExtensionAction::Uninstall => "uninstall",
            ExtensionAction::Enable => "enable",
            ExtensionAction::Disable => "disable",
        }
    }
}

impl fmt::Display for ExtensionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `InstalledExtension` used across Orbit components.
pub struct InstalledExtension {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub core: bool,
    #[serde(default)]
    pub latest_version: String,
    #[serde(default)]
    pub installed_version: String,
    #[serde(default)]
    pub status: Option<ExtensionStatus>,
}

#[derive(Debug, Clone, Serialize)]
struct ActionRequest<'a> {
    cmd: ExtensionAction,
    extension_name: &'a str,
}

#[derive(Debug, Clone)]
/// Public struct `ExtensionsGateway` used across Orbit components.
pub struct ExtensionsGateway {
    http: reqwest::Client,
    endpoint_url: String,
}

impl ExtensionsGateway {
    pub fn new(server_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint_url: format!("{}{}", server_url.trim_end_matches('/'), EXTENSIONS_PATH),
        }
    }

    pub async fn list(&self) -> Result<Vec<InstalledExtension>> {
        let response = self
            .http
            .get(&self.endpoint_url)
            .send()
            .await
            .with_context(|| {
                format!(
                    "failed to fetch installed extensions from '{}'",
                    self.endpoint_url
                )
            })?;
        if !response.status().is_success() {
            bail!(
                "installed-extension list from '{}' returned status {}",
                self.endpoint_url,
                response.status()
            );
        }
        response
            .json::<Vec<InstalledExtension>>()
            .await
            .with_context(|| {
                format!(
                    "failed to parse installed-extension list from '{}'",
                    self.endpoint_url
                )
            })
    }

    /// Submits one extension action and returns the refreshed installed list
    /// reported by the server.
    pub async fn perform(
        &self,
        action: ExtensionAction,
        extension_name: &str,
    ) -> Result<Vec<InstalledExtension>> {
        let response = self
            .http
            .post(&self.endpoint_url)
            .json(&ActionRequest {
                cmd: action,
                extension_name,
            })
            .send()
            .await
            .with_context(|| {
                format!(
                    "failed to submit '{}' for extension '{}' to '{}'",
                    action, extension_name, self.endpoint_url
                )
            })?;
        if !response.status().is_success() {
            bail!(
                "extension action '{}' for '{}' returned status {}",
                action,
                extension_name,
                response.status()
            );
        }
        response
            .json::<Vec<InstalledExtension>>()
            .await
            .with_context(|| {
                format!(
                    "failed to parse response for extension action '{}' on '{}'",
                    action, extension_name
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::{ExtensionAction, ExtensionStatus, ExtensionsGateway, InstalledExtension};

    #[tokio::test]
    async fn functional_list_parses_installed_extensions() {
        let server = MockServer::start();
        server
            .mock(|when, then| {
                when.method(GET).path("/api/extensions");
                then.status(200).json_body(serde_json::json!([
                    {
                        "name": "orbit-plotter",
                        "description": "Plotting panels",
                        "enabled": true,
                        "core": false,
                        "latest_version": "1.1.0",
                        "installed_version": "1.0.0",
                        "status": "ok"
                    }
                ]));
            });

        let gateway = ExtensionsGateway::new(&server.base_url());
        let installed = gateway.list().await.expect("list");
        assert_eq!(
            installed,
            vec![InstalledExtension {
                name: "orbit-plotter".to_string(),
                description: "Plotting panels".to_string(),
                enabled: true,
                core: false,
                latest_version: "1.1.0".to_string(),
                installed_version: "1.0.0".to_string(),
                status: Some(ExtensionStatus::Ok),
            }]
        );
    }

    #[tokio::test]
    async fn functional_perform_posts_cmd_and_extension_name() {
        let server = MockServer::start();
        let mock = server
            .mock(|when, then| {
                when.method(POST)
                    .path("/api/extensions")
                    .json_body(serde_json::json!({
                        "cmd": "install",
                        "extension_name": "orbit-plotter"
                    }));
                then.status(200).json_body(serde_json::json!([]));
            });

        let gateway = ExtensionsGateway::new(&server.base_url());
        let updated = gateway
            .perform(ExtensionAction::Install, "orbit-plotter")
            .await
            .expect("perform");
        mock.assert();
        assert!(updated.is_empty());
    }

    #[tokio::test]
    async fn regression_perform_non_success_status_names_action_and_status() {
        let server = MockServer::start();
        server
            .mock(|when, then| {
                when.method(POST).path("/api/extensions");
                then.status(422);
            });

        let gateway = ExtensionsGateway::new(&server.base_url());
        let error = gateway
            .perform(ExtensionAction::Disable, "missing-ext")
            .await
            .expect_err("422 should fail");
        let message = error.to_string();
        assert!(message.contains("disable"));
        assert!(message.contains("422"));
    }

    #[test]
    fn unit_status_parses_lowercase_wire_values() {
        let parsed: InstalledExtension = serde_json::from_str(
            r#"{"name": "x", "enabled": false, "status": "deprecated"}"#,
        )
        .expect("parse");
        assert_eq!(parsed.status, Some(ExtensionStatus::Deprecated));
        let none_status: InstalledExtension =
            serde_json::from_str(r#"{"name": "y"}"#).expect("parse");
        assert_eq!(none_status.status, None);
    }
}
