//! End-to-end discovery scenarios: reconciliation against mocked registry and
//! gateway endpoints, and the companion-gated install path with scripted
//! sessions.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use httpmock::prelude::*;

use orbit_companions::{
    CompanionChoice, CompanionInstallFlow, CompanionPrompt, ExecuteReply, InstallSelection,
    KernelSession, KernelSpec, ResolvedCompanions, SessionBroker, TerminalSession,
};
use orbit_gateway::ExtensionsGateway;
use orbit_model::{DiscoveryModel, InstallOutcome};
use orbit_registry::RegistryClient;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEvent {
    Started(String),
    Executed(String),
    Shutdown(String),
}

struct ScriptedBroker {
    specs: Vec<KernelSpec>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl ScriptedBroker {
    fn new(specs: Vec<KernelSpec>) -> Self {
        Self {
            specs,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

#[async_trait]
impl SessionBroker for ScriptedBroker {
    async fn kernel_specs(&self) -> anyhow::Result<Vec<KernelSpec>> {
        Ok(self.specs.clone())
    }

    async fn start_kernel(&self, kernel_name: &str) -> anyhow::Result<Box<dyn KernelSession>> {
        self.events
            .lock()
            .expect("events lock")
            .push(SessionEvent::Started(kernel_name.to_string()));
        Ok(Box::new(ScriptedKernelSession {
            kernel_name: kernel_name.to_string(),
            events: Arc::clone(&self.events),
        }))
    }

    async fn start_terminal(&self) -> anyhow::Result<Box<dyn TerminalSession>> {
        anyhow::bail!("no terminal sessions in this scenario")
    }
}

struct ScriptedKernelSession {
    kernel_name: String,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

#[async_trait]
impl KernelSession for ScriptedKernelSession {
    async fn execute(&mut self, _code: &str) -> anyhow::Result<ExecuteReply> {
        self.events
            .lock()
            .expect("events lock")
            .push(SessionEvent::Executed(self.kernel_name.clone()));
        Ok(ExecuteReply {
            status: "ok".to_string(),
            ename: None,
            evalue: None,
        })
    }

    async fn shutdown(self: Box<Self>) -> anyhow::Result<()> {
        self.events
            .lock()
            .expect("events lock")
            .push(SessionEvent::Shutdown(self.kernel_name.clone()));
        Ok(())
    }
}

/// Prompt fake choosing the first matched kernel of every companion with the
/// default manager.
struct FirstKernelPrompt;

#[async_trait]
impl CompanionPrompt for FirstKernelPrompt {
    async fn present(&self, resolved: &ResolvedCompanions) -> anyhow::Result<CompanionChoice> {
        let mut selection = InstallSelection::from_resolved(resolved);
        for choice in &mut selection.kernel {
            let first = choice.kernels[0].clone();
            choice.toggle_kernel(&first);
        }
        Ok(CompanionChoice::Install(selection))
    }
}

fn python_spec(name: &str, display_name: &str) -> KernelSpec {
    KernelSpec {
        name: name.to_string(),
        language: Some("python".to_string()),
        display_name: Some(display_name.to_string()),
    }
}

fn model_with_broker(
    server: &MockServer,
    broker: Arc<ScriptedBroker>,
) -> DiscoveryModel {
    let flow = Arc::new(CompanionInstallFlow::new(broker, Arc::new(FirstKernelPrompt)));
    DiscoveryModel::new(
        RegistryClient::new(&server.base_url(), &server.base_url()),
        ExtensionsGateway::new(&server.base_url()),
        flow,
    )
}

fn mock_gateway_list(server: &MockServer, list: serde_json::Value) {
    server
        .mock(move |when, then| {
            when.method(GET).path("/api/extensions");
            then.status(200).json_body(list);
        });
}

#[tokio::test]
async fn integration_search_only_package_is_installable_and_online() {
    let server = MockServer::start();
    server
        .mock(|when, then| {
            when.method(GET).path("/-/v1/search");
            then.status(200).json_body(serde_json::json!({
                "objects": [
                    {"package": {"name": "pkg-a", "version": "1.0.0", "description": "d"}}
                ],
                "total": 1,
                "time": ""
            }));
        });
    mock_gateway_list(&server, serde_json::json!([]));

    let model = model_with_broker(&server, Arc::new(ScriptedBroker::new(Vec::new())));
    model.refresh().await;

    assert!(!model.offline());
    assert!(model.installed().is_empty());
    let installable = model.installable();
    assert_eq!(installable.len(), 1);
    assert_eq!(installable[0].name, "pkg-a");
    assert!(!installable[0].installed);
    assert_eq!(installable[0].latest_version, "1.0.0");
    assert_eq!(model.total_entries(), 1);
}

#[tokio::test]
async fn integration_installed_package_with_newer_release_has_update() {
    let server = MockServer::start();
    server
        .mock(|when, then| {
            when.method(GET).path("/-/v1/search");
            then.status(200)
                .json_body(serde_json::json!({"objects": [], "total": 0, "time": ""}));
        });
    mock_gateway_list(
        &server,
        serde_json::json!([
            {
                "name": "pkg-b",
                "enabled": true,
                "installed_version": "1.0.0",
                "latest_version": "1.1.0",
                "status": "ok"
            }
        ]),
    );

    let model = model_with_broker(&server, Arc::new(ScriptedBroker::new(Vec::new())));
    model.refresh().await;

    let installed = model.installed();
    assert_eq!(installed.len(), 1);
    assert!(installed[0].has_update());
    assert!(installed[0].enabled);
}

#[tokio::test]
async fn integration_registry_outage_preserves_installed_view() {
    let server = MockServer::start();
    let mut search = server
        .mock(|when, then| {
            when.method(GET).path("/-/v1/search");
            then.status(200)
                .json_body(serde_json::json!({"objects": [], "total": 0, "time": ""}));
        });
    mock_gateway_list(
        &server,
        serde_json::json!([
            {"name": "pkg-b", "enabled": true, "installed_version": "1.0.0", "latest_version": "1.0.0"}
        ]),
    );

    let model = model_with_broker(&server, Arc::new(ScriptedBroker::new(Vec::new())));
    model.refresh().await;
    assert!(!model.offline());

    search.delete();
    model.refresh().await;

    assert!(model.offline());
    assert!(model.error_message().is_some());
    assert_eq!(model.installed().len(), 1);
    assert!(model.installable().is_empty());
}

#[tokio::test]
async fn integration_kernel_companion_install_runs_one_session_then_proceeds() {
    let server = MockServer::start();
    server
        .mock(|when, then| {
            when.method(GET).path("/-/v1/search");
            then.status(200).json_body(serde_json::json!({
                "objects": [
                    {"package": {"name": "pkg-a", "version": "1.0.0", "description": "d"}}
                ],
                "total": 1,
                "time": ""
            }));
        });
    mock_gateway_list(&server, serde_json::json!([]));
    server
        .mock(|when, then| {
            when.method(GET).path("/pkg-a@1.0.0/package.json");
            then.status(200).json_body(serde_json::json!({
                "name": "pkg-a",
                "orbit": {
                    "discovery": {
                        "kernel": [
                            {
                                "base": {"name": "pkg-a-runtime"},
                                "managers": ["pip"],
                                "kernel_spec": {"language": "python"}
                            }
                        ]
                    }
                }
            }));
        });
    let action = server
        .mock(|when, then| {
            when.method(POST).path("/api/extensions").json_body(
                serde_json::json!({"cmd": "install", "extension_name": "pkg-a"}),
            );
            then.status(200).json_body(serde_json::json!([]));
        });

    let broker = Arc::new(ScriptedBroker::new(vec![
        python_spec("python3", "Python 3"),
        python_spec("python-ml", "Python (ML)"),
    ]));
    let model = model_with_broker(&server, Arc::clone(&broker));
    model.refresh().await;

    let outcome = model.install("pkg-a").await.expect("install");
    assert_eq!(outcome, InstallOutcome::Completed);
    action.assert_calls(1);
    // Exactly one ephemeral session: started, executed, torn down.
    assert_eq!(
        broker.events(),
        vec![
            SessionEvent::Started("python3".to_string()),
            SessionEvent::Executed("python3".to_string()),
            SessionEvent::Shutdown("python3".to_string()),
        ]
    );
    assert!(!model.has_pending_actions());
}

#[tokio::test]
async fn integration_bundling_companion_blocks_frontend_install() {
    let server = MockServer::start();
    server
        .mock(|when, then| {
            when.method(GET).path("/-/v1/search");
            then.status(200).json_body(serde_json::json!({
                "objects": [
                    {"package": {"name": "pkg-a", "version": "1.0.0", "description": "d"}}
                ],
                "total": 1,
                "time": ""
            }));
        });
    mock_gateway_list(&server, serde_json::json!([]));
    server
        .mock(|when, then| {
            when.method(GET).path("/pkg-a@1.0.0/package.json");
            then.status(200).json_body(serde_json::json!({
                "name": "pkg-a",
                "orbit": {
                    "discovery": {
                        "kernel": [
                            {
                                "base": {"name": "pkg-a-runtime"},
                                "managers": ["pip"],
                                "overrides": {
                                    "pip": {"bundles_extension": true}
                                },
                                "kernel_spec": {"language": "python"}
                            }
                        ]
                    }
                }
            }));
        });
    let action = server
        .mock(|when, then| {
            when.method(POST).path("/api/extensions");
            then.status(200).json_body(serde_json::json!([]));
        });

    let broker = Arc::new(ScriptedBroker::new(vec![python_spec(
        "python3", "Python 3",
    )]));
    let model = model_with_broker(&server, Arc::clone(&broker));
    model.refresh().await;

    let outcome = model.install("pkg-a").await.expect("install");
    assert_eq!(outcome, InstallOutcome::AbortedByCompanions);
    action.assert_calls(0);
    // The companion install itself still ran before the bundling decision.
    assert!(broker
        .events()
        .contains(&SessionEvent::Shutdown("python3".to_string())));
}
