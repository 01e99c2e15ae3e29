//! Instrumentation seam between the orchestrators and the interception
//! machinery
//!
//! The kernel-level packet/syscall interception itself is an external
//! collaborator; this module consumes the control hooks it exposes. The
//! in-process [`ProxyInstrumentation`] wires the transparent proxy and runs
//! the application command, which is all the engine needs on a loopback
//! setup and in tests.

use crate::capture::Factory;
use crate::error::{Result, RetraceError};
use crate::models::{
    AppError, AppErrorKind, HookOptions, Mock, OutgoingOptions, RunOptions, SetupOptions,
    TestCase,
};
use crate::proxy::{Proxy, ProxyMode};
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shell exit status for "command not found"
const EXIT_NOT_FOUND: i32 = 127;

/// Control surface the orchestrators drive
#[async_trait]
pub trait Instrumentation: Send + Sync {
    /// Register an application; returns its id
    async fn setup(&self, command: &str, opts: SetupOptions) -> Result<u64>;
    /// Install hooks and start the proxy for the application
    async fn hook(&self, app_id: u64, opts: HookOptions) -> Result<()>;
    /// Install mock pools into the proxy
    async fn set_mocks(
        &self,
        app_id: u64,
        filtered: Vec<Mock>,
        unfiltered: Vec<Mock>,
    ) -> Result<()>;
    /// Switch outgoing traffic to MOCK mode; the receiver surfaces handler
    /// errors (mock misses, protocol faults) to the caller
    async fn mock_outgoing(
        &self,
        app_id: u64,
        opts: OutgoingOptions,
    ) -> Result<mpsc::Receiver<RetraceError>>;
    /// Stream of test cases assembled from intercepted ingress traffic
    async fn get_incoming(
        &self,
        app_id: u64,
        opts: OutgoingOptions,
    ) -> Result<mpsc::Receiver<TestCase>>;
    /// Stream of mocks recorded from intercepted outgoing traffic
    async fn get_outgoing(
        &self,
        app_id: u64,
        opts: OutgoingOptions,
    ) -> Result<mpsc::Receiver<Mock>>;
    /// Run the application to completion; always resolves to a classified
    /// [`AppError`]. Cancelling `cancel` kills the process.
    async fn run(&self, app_id: u64, opts: RunOptions, cancel: CancellationToken) -> AppError;
    /// Address the application serves on
    async fn get_app_ip(&self, app_id: u64) -> Result<String>;
}

struct AppState {
    command: String,
}

/// In-process instrumentation backed by the transparent proxy
pub struct ProxyInstrumentation {
    proxy: Arc<Proxy>,
    factory: Arc<Factory>,
    cancel: CancellationToken,
    container_ip: Option<String>,
    sweep_interval: Duration,
    apps: DashMap<u64, AppState>,
    next_app_id: AtomicU64,
}

impl ProxyInstrumentation {
    pub fn new(
        proxy: Arc<Proxy>,
        factory: Arc<Factory>,
        cancel: CancellationToken,
        container_ip: Option<String>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            proxy,
            factory,
            cancel,
            container_ip,
            sweep_interval,
            apps: DashMap::new(),
            next_app_id: AtomicU64::new(1),
        }
    }

    pub fn proxy(&self) -> Arc<Proxy> {
        self.proxy.clone()
    }

    pub fn factory(&self) -> Arc<Factory> {
        self.factory.clone()
    }

    fn command_of(&self, app_id: u64) -> Result<String> {
        self.apps
            .get(&app_id)
            .map(|app| app.command.clone())
            .ok_or_else(|| {
                RetraceError::Instrumentation(format!("unknown app id {}", app_id))
            })
    }
}

#[async_trait]
impl Instrumentation for ProxyInstrumentation {
    async fn setup(&self, command: &str, _opts: SetupOptions) -> Result<u64> {
        let app_id = self.next_app_id.fetch_add(1, Ordering::SeqCst);
        self.apps.insert(
            app_id,
            AppState {
                command: command.to_string(),
            },
        );
        debug!(app_id, command, "registered application");
        Ok(app_id)
    }

    async fn hook(&self, app_id: u64, opts: HookOptions) -> Result<()> {
        self.command_of(app_id)?;
        let listener = TcpListener::bind(("127.0.0.1", opts.proxy_port))
            .await
            .map_err(|e| {
                RetraceError::Instrumentation(format!(
                    "failed to bind proxy port {}: {}",
                    opts.proxy_port, e
                ))
            })?;
        info!(app_id, addr = ?listener.local_addr().ok(), "hooks installed, proxy starting");
        tokio::spawn(self.proxy.clone().serve(listener, self.cancel.child_token()));
        Ok(())
    }

    async fn set_mocks(
        &self,
        app_id: u64,
        filtered: Vec<Mock>,
        unfiltered: Vec<Mock>,
    ) -> Result<()> {
        self.command_of(app_id)?;
        debug!(
            app_id,
            filtered = filtered.len(),
            unfiltered = unfiltered.len(),
            "installing mocks"
        );
        self.proxy.set_mocks(filtered, unfiltered);
        Ok(())
    }

    async fn mock_outgoing(
        &self,
        app_id: u64,
        opts: OutgoingOptions,
    ) -> Result<mpsc::Receiver<RetraceError>> {
        self.command_of(app_id)?;
        self.proxy.set_opts(opts);
        Ok(self.proxy.start_mocking())
    }

    async fn get_incoming(
        &self,
        app_id: u64,
        _opts: OutgoingOptions,
    ) -> Result<mpsc::Receiver<TestCase>> {
        self.command_of(app_id)?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(self.factory.clone().run(
            self.sweep_interval,
            self.cancel.child_token(),
            tx,
        ));
        Ok(rx)
    }

    async fn get_outgoing(
        &self,
        app_id: u64,
        opts: OutgoingOptions,
    ) -> Result<mpsc::Receiver<Mock>> {
        self.command_of(app_id)?;
        self.proxy.set_opts(opts);
        self.proxy.set_mode(ProxyMode::Record);
        let (tx, rx) = mpsc::channel(64);
        self.proxy.set_record_sink(tx);
        Ok(rx)
    }

    async fn run(&self, app_id: u64, opts: RunOptions, cancel: CancellationToken) -> AppError {
        let command = match self.command_of(app_id) {
            Ok(command) => command,
            Err(e) => return AppError::new(AppErrorKind::Internal, e.to_string()),
        };
        if command.is_empty() {
            return AppError::new(AppErrorKind::CommandError, "empty application command");
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if opts.coverage {
            match std::env::var("GOCOVERDIR") {
                Ok(dir) => {
                    cmd.env("GOCOVERDIR", dir);
                }
                Err(_) => debug!("GOCOVERDIR not set, coverage data will not be collected"),
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AppError::new(
                    AppErrorKind::CommandError,
                    format!("failed to start application: {}", e),
                )
            }
        };
        info!(app_id, command, "application started");

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill application: {}", e);
                }
                return AppError::new(AppErrorKind::CtxCanceled, "run cancelled");
            }
            _ = self.cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill application: {}", e);
                }
                return AppError::new(AppErrorKind::CtxCanceled, "run cancelled");
            }
        };

        match status {
            Ok(status) if status.code() == Some(EXIT_NOT_FOUND) => AppError::new(
                AppErrorKind::CommandError,
                format!("application command not found: {}", command),
            ),
            Ok(status) if status.success() => {
                AppError::new(AppErrorKind::AppStopped, "application exited")
            }
            Ok(status) => AppError::new(
                AppErrorKind::Unexpected,
                format!("application exited with {}", status),
            ),
            Err(e) => AppError::new(
                AppErrorKind::Internal,
                format!("failed to wait for application: {}", e),
            ),
        }
    }

    async fn get_app_ip(&self, app_id: u64) -> Result<String> {
        self.command_of(app_id)?;
        Ok(self
            .container_ip
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string()))
    }
}
