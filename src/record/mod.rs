//! Record-mode orchestration
//!
//! Boots instrumentation, runs the application and drains the captured
//! test-case and mock streams into the document stores until the run is
//! stopped or the application exits.

use crate::config::Config;
use crate::error::{Result, RetraceError};
use crate::instrument::Instrumentation;
use crate::models::{AppErrorKind, HookOptions, OutgoingOptions, RunOptions, SetupOptions};
use crate::shutdown::StopHandle;
use crate::storage::{next_id, MockDb, TestDb};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drives one recording session
pub struct Recorder {
    test_db: Arc<dyn TestDb>,
    mock_db: Arc<dyn MockDb>,
    instrumentation: Arc<dyn Instrumentation>,
    config: Config,
    stop: StopHandle,
}

impl Recorder {
    pub fn new(
        test_db: Arc<dyn TestDb>,
        mock_db: Arc<dyn MockDb>,
        instrumentation: Arc<dyn Instrumentation>,
        config: Config,
        stop: StopHandle,
    ) -> Self {
        Self {
            test_db,
            mock_db,
            instrumentation,
            config,
            stop,
        }
    }

    /// Record until cancelled or the application exits
    pub async fn start(&self) -> Result<()> {
        let cancel = self.stop.token().child_token();
        let result = self.record(&cancel).await;
        if let Err(e) = &result {
            let reason = format!("failed to record: {}", e);
            error!("{}", reason);
            if let Err(stop_err) = self.stop.stop(&reason) {
                error!("failed to stop recording: {}", stop_err);
            }
        }
        result
    }

    async fn record(&self, cancel: &CancellationToken) -> Result<()> {
        let existing = self.test_db.get_all_test_set_ids().await?;
        let test_set_id = next_id(&existing, "test-set");
        info!(test_set = %test_set_id, "starting recording");

        let app_id = self
            .instrumentation
            .setup(&self.config.command, SetupOptions::default())
            .await?;
        self.instrumentation
            .hook(
                app_id,
                HookOptions {
                    proxy_port: self.config.proxy_port,
                },
            )
            .await?;

        let outgoing_opts = OutgoingOptions {
            pass_through_ports: self.config.pass_through_ports.clone(),
            fallback_passthrough: false,
        };
        let mut incoming = self
            .instrumentation
            .get_incoming(app_id, outgoing_opts.clone())
            .await?;
        let mut outgoing = self
            .instrumentation
            .get_outgoing(app_id, outgoing_opts)
            .await?;

        let test_count = Arc::new(AtomicUsize::new(0));
        let mock_count = Arc::new(AtomicUsize::new(0));

        // scope for the writer tasks: closed once the app or the run ends
        let writer_scope = cancel.child_token();

        let test_writer = tokio::spawn({
            let test_db = self.test_db.clone();
            let test_set_id = test_set_id.clone();
            let count = test_count.clone();
            let scope = writer_scope.clone();
            async move {
                loop {
                    let test_case = tokio::select! {
                        tc = incoming.recv() => match tc {
                            Some(tc) => tc,
                            None => break,
                        },
                        _ = scope.cancelled() => break,
                    };
                    match test_db.insert_test_case(&test_set_id, &test_case).await {
                        Ok(name) => {
                            count.fetch_add(1, Ordering::Relaxed);
                            info!(test_case = %name, "captured test case");
                        }
                        Err(e) => warn!("failed to persist test case: {}", e),
                    }
                }
            }
        });
        let mock_writer = tokio::spawn({
            let mock_db = self.mock_db.clone();
            let test_set_id = test_set_id.clone();
            let count = mock_count.clone();
            let scope = writer_scope.clone();
            async move {
                loop {
                    let mock = tokio::select! {
                        mock = outgoing.recv() => match mock {
                            Some(mock) => mock,
                            None => break,
                        },
                        _ = scope.cancelled() => break,
                    };
                    match mock_db.insert_mock(&test_set_id, &mock).await {
                        Ok(()) => {
                            count.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => warn!("failed to persist mock: {}", e),
                    }
                }
            }
        });

        let instrumentation = self.instrumentation.clone();
        let coverage = self.config.coverage;
        let app_cancel = cancel.child_token();
        let app_task = tokio::spawn(async move {
            instrumentation
                .run(app_id, RunOptions { coverage }, app_cancel)
                .await
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            app_err = app_task => match app_err {
                Ok(err) => match err.kind {
                    AppErrorKind::CtxCanceled => Ok(()),
                    AppErrorKind::AppStopped => {
                        info!("application exited, ending recording");
                        Ok(())
                    }
                    _ => Err(RetraceError::Instrumentation(err.to_string())),
                },
                Err(e) => Err(RetraceError::Internal(format!("app runner panicked: {}", e))),
            },
        };

        writer_scope.cancel();
        let _ = tokio::join!(test_writer, mock_writer);
        info!(
            test_set = %test_set_id,
            tests = test_count.load(Ordering::Relaxed),
            mocks = mock_count.load(Ordering::Relaxed),
            "recording finished"
        );
        outcome
    }
}
