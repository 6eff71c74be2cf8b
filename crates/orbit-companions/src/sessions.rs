//! Ephemeral kernel and terminal sessions on the Orbit server.
//!
//! Each session exists to run one install command and is torn down
//! afterwards. The broker trait is the seam that lets the orchestrator run
//! against scripted sessions in tests.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const KERNELSPECS_PATH: &str = "/api/kernelspecs";
const SESSIONS_PATH: &str = "/api/sessions";
const KERNELS_PATH: &str = "/api/kernels";
const TERMINALS_PATH: &str = "/api/terminals";

const TERMINAL_POLL_INTERVAL_MS: u64 = 500;
const TERMINAL_POLL_MAX_ATTEMPTS: u32 = 600;

pub const EXECUTE_STATUS_OK: &str = "ok";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `KernelSpec` used across Orbit components.
pub struct KernelSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Public struct `ExecuteReply` used across Orbit components.
pub struct ExecuteReply {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
}

impl ExecuteReply {
    pub fn is_ok(&self) -> bool {
        self.status == EXECUTE_STATUS_OK
    }
}

#[async_trait]
/// Trait contract for `KernelSession` behavior.
pub trait KernelSession: Send {
    async fn execute(&mut self, code: &str) -> Result<ExecuteReply>;
    async fn shutdown(self: Box<Self>) -> Result<()>;
}

#[async_trait]
/// Trait contract for `TerminalSession` behavior.
pub trait TerminalSession: Send {
    /// Sends one line of input followed by a carriage return.
    async fn send_line(&mut self, line: &str) -> Result<()>;
    /// Resolves once the session reports disconnection.
    async fn wait_disconnect(&mut self) -> Result<()>;
    async fn shutdown(self: Box<Self>) -> Result<()>;
}

#[async_trait]
/// Trait contract for `SessionBroker` behavior.
pub trait SessionBroker: Send + Sync {
    async fn kernel_specs(&self) -> Result<Vec<KernelSpec>>;
    async fn start_kernel(&self, kernel_name: &str) -> Result<Box<dyn KernelSession>>;
    async fn start_terminal(&self) -> Result<Box<dyn TerminalSession>>;
}

#[derive(Debug, Clone, Default, Deserialize)]
struct KernelSpecsResponse {
    #[serde(default)]
    kernelspecs: HashMap<String, KernelSpec>,
}

#[derive(Debug, Clone, Serialize)]
struct SessionCreateRequest<'a> {
    path: String,
    kernel: KernelNameRef<'a>,
}

#[derive(Debug, Clone, Serialize)]
struct KernelNameRef<'a> {
    name: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionCreated {
    id: String,
    kernel: KernelCreated,
}

#[derive(Debug, Clone, Deserialize)]
struct KernelCreated {
    id: String,
}

#[derive(Debug, Clone, Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    stop_on_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct TerminalCreated {
    name: String,
}

#[derive(Debug, Clone, Serialize)]
struct TerminalInput<'a> {
    data: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TerminalState {
    #[serde(default = "default_connected")]
    connected: bool,
}

fn default_connected() -> bool {
    true
}

#[derive(Debug, Clone)]
/// Public struct `HttpSessionBroker` used across Orbit components.
pub struct HttpSessionBroker {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSessionBroker {
    pub fn new(server_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: server_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SessionBroker for HttpSessionBroker {
    async fn kernel_specs(&self) -> Result<Vec<KernelSpec>> {
        let url = format!("{}{}", self.base_url, KERNELSPECS_PATH);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch kernel specifications from '{}'", url))?;
        if !response.status().is_success() {
            bail!(
                "kernel specification fetch from '{}' returned status {}",
                url,
                response.status()
            );
        }
        let parsed = response
            .json::<KernelSpecsResponse>()
            .await
            .with_context(|| format!("failed to parse kernel specifications from '{}'", url))?;
        let mut specs: Vec<KernelSpec> = parsed
            .kernelspecs
            .into_iter()
            .map(|(key, mut spec)| {
                if spec.name.is_empty() {
                    spec.name = key;
                }
                spec
            })
            .collect();
        specs.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(specs)
    }

    async fn start_kernel(&self, kernel_name: &str) -> Result<Box<dyn KernelSession>> {
        let url = format!("{}{}", self.base_url, SESSIONS_PATH);
        let response = self
            .http
            .post(&url)
            .json(&SessionCreateRequest {
                path: Uuid::new_v4().to_string(),
                kernel: KernelNameRef { name: kernel_name },
            })
            .send()
            .await
            .with_context(|| format!("failed to start session for kernel '{}'", kernel_name))?;
        if !response.status().is_success() {
            bail!(
                "session start for kernel '{}' returned status {}",
                kernel_name,
                response.status()
            );
        }
        let created = response
            .json::<SessionCreated>()
            .await
            .with_context(|| format!("failed to parse session response for kernel '{}'", kernel_name))?;
        Ok(Box::new(HttpKernelSession {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            session_id: created.id,
            kernel_id: created.kernel.id,
        }))
    }

    async fn start_terminal(&self) -> Result<Box<dyn TerminalSession>> {
        let url = format!("{}{}", self.base_url, TERMINALS_PATH);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .context("failed to start terminal session")?;
        if !response.status().is_success() {
            bail!(
                "terminal session start returned status {}",
                response.status()
            );
        }
        let created = response
            .json::<TerminalCreated>()
            .await
            .context("failed to parse terminal session response")?;
        Ok(Box::new(HttpTerminalSession {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            name: created.name,
        }))
    }
}

struct HttpKernelSession {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    kernel_id: String,
}

#[async_trait]
impl KernelSession for HttpKernelSession {
    async fn execute(&mut self, code: &str) -> Result<ExecuteReply> {
        let url = format!("{}{}/{}/execute", self.base_url, KERNELS_PATH, self.kernel_id);
        let response = self
            .http
            .post(&url)
            .json(&ExecuteRequest {
                code,
                stop_on_error: true,
            })
            .send()
            .await
            .with_context(|| format!("failed to execute code on kernel '{}'", self.kernel_id))?;
        if !response.status().is_success() {
            bail!(
                "execute request on kernel '{}' returned status {}",
                self.kernel_id,
                response.status()
            );
        }
        response
            .json::<ExecuteReply>()
            .await
            .with_context(|| format!("failed to parse execute reply from kernel '{}'", self.kernel_id))
    }

    async fn shutdown(self: Box<Self>) -> Result<()> {
        let url = format!("{}{}/{}", self.base_url, SESSIONS_PATH, self.session_id);
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("failed to shut down session '{}'", self.session_id))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            bail!(
                "session shutdown for '{}' returned status {}",
                self.session_id,
                response.status()
            );
        }
        Ok(())
    }
}

struct HttpTerminalSession {
    http: reqwest::Client,
    base_url: String,
    name: String,
}

impl HttpTerminalSession {
    fn state_url(&self) -> String {
        format!("{}{}/{}", self.base_url, TERMINALS_PATH, self.name)
    }
}

#[async_trait]
impl TerminalSession for HttpTerminalSession {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        let url = format!("{}/input", self.state_url());
        let data = format!("{line}\r");
        let response = self
            .http
            .post(&url)
            .json(&TerminalInput { data: &data })
            .send()
            .await
            .with_context(|| format!("failed to send input to terminal '{}'", self.name))?;
        if !response.status().is_success() {
            bail!(
                "terminal input to '{}' returned status {}",
                self.name,
                response.status()
            );
        }
        Ok(())
    }

    async fn wait_disconnect(&mut self) -> Result<()> {
        for _ in 0..TERMINAL_POLL_MAX_ATTEMPTS {
            let response = self
                .http
                .get(self.state_url())
                .send()
                .await
                .with_context(|| format!("failed to poll terminal '{}'", self.name))?;
            if response.status().as_u16() == 404 {
                return Ok(());
            }
            if !response.status().is_success() {
                bail!(
                    "terminal poll for '{}' returned status {}",
                    self.name,
                    response.status()
                );
            }
            let state = response
                .json::<TerminalState>()
                .await
                .with_context(|| format!("failed to parse terminal state for '{}'", self.name))?;
            if !state.connected {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(TERMINAL_POLL_INTERVAL_MS)).await;
        }
        bail!("terminal '{}' did not report disconnection", self.name)
    }

    async fn shutdown(self: Box<Self>) -> Result<()> {
        let url = self.state_url();
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("failed to shut down terminal '{}'", self.name))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            bail!(
                "terminal shutdown for '{}' returned status {}",
                self.name,
                response.status()
            );
        }
        Ok(())
    }
}
