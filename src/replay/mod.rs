//! Replay orchestration
//!
//! Drives one test run: boots instrumentation, then per test set installs
//! mocks, launches the application supervised, replays every recorded
//! request while watching the mock subsystem, the application and the run
//! scope for failures, compares responses under the noise policy and writes
//! reports. All roll-up state is owned by the run, so concurrent runs cannot
//! corrupt each other.

use crate::compare::{compare, left_join_noise};
use crate::config::Config;
use crate::error::{Result, RetraceError};
use crate::instrument::Instrumentation;
use crate::models::{
    AppErrorKind, HookOptions, HttpResp, Kind, NoiseMap, OutgoingOptions, RunOptions,
    SetupOptions, TestCase, TestReport, TestResult, TestSetStatus, TestStatus, API_VERSION,
    TEST_RUN_TEMPLATE,
};
use crate::shutdown::StopHandle;
use crate::storage::{next_id, MockDb, ReportDb, TestDb};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Roll-up of one test set
#[derive(Debug, Clone, Copy)]
pub struct TestSetResult {
    pub status: TestSetStatus,
    pub total: usize,
    pub success: usize,
    pub failure: usize,
}

/// Run-owned accumulator; replaces any process-wide counters
#[derive(Debug, Default)]
pub struct RunSummary {
    pub test_run_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub verdicts: Vec<(String, TestSetResult)>,
    pub aborted: bool,
}

impl RunSummary {
    fn new(test_run_id: String) -> Self {
        Self {
            test_run_id,
            ..Default::default()
        }
    }

    fn record(&mut self, test_set_id: String, result: TestSetResult) {
        self.total += result.total;
        self.passed += result.success;
        self.failed += result.failure;
        self.verdicts.push((test_set_id, result));
    }

    /// The run succeeds iff every set ended `passed`
    pub fn all_passed(&self) -> bool {
        !self.aborted
            && self
                .verdicts
                .iter()
                .all(|(_, v)| v.status == TestSetStatus::Passed)
    }
}

/// Drives a full test run over all recorded test sets
pub struct Replayer {
    test_db: Arc<dyn TestDb>,
    mock_db: Arc<dyn MockDb>,
    report_db: Arc<dyn ReportDb>,
    instrumentation: Arc<dyn Instrumentation>,
    config: Config,
    stop: StopHandle,
    client: reqwest::Client,
}

impl Replayer {
    pub fn new(
        test_db: Arc<dyn TestDb>,
        mock_db: Arc<dyn MockDb>,
        report_db: Arc<dyn ReportDb>,
        instrumentation: Arc<dyn Instrumentation>,
        config: Config,
        stop: StopHandle,
    ) -> Self {
        Self {
            test_db,
            mock_db,
            report_db,
            instrumentation,
            config,
            stop,
            client: reqwest::Client::new(),
        }
    }

    /// Run every test set; failures inside a set never abort the run,
    /// subsystem and application failures always do.
    pub async fn start(&self) -> Result<RunSummary> {
        let run_cancel = self.stop.token().child_token();
        let result = self.run(&run_cancel).await;
        if let Err(e) = &result {
            let reason = format!("failed to run test sets: {}", e);
            error!("{}", reason);
            if let Err(stop_err) = self.stop.stop(&reason) {
                error!("failed to stop replay: {}", stop_err);
            }
        }
        result
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let (test_run_id, app_id) = self.boot().await?;
        info!(test_run = %test_run_id, "starting test run");

        let test_set_ids = self.test_db.get_all_test_set_ids().await?;
        let mut summary = RunSummary::new(test_run_id.clone());

        for test_set_id in test_set_ids {
            let result = self
                .run_test_set(cancel, &test_set_id, &test_run_id, app_id, false)
                .await?;
            summary.record(test_set_id.clone(), result);

            if result.status == TestSetStatus::UserAbort {
                summary.aborted = true;
                return Ok(summary);
            }
            if result.status.aborts_run() {
                summary.aborted = true;
                let reason = format!(
                    "test set {} ended with status {}",
                    test_set_id, result.status
                );
                if let Err(e) = self.stop.stop(&reason) {
                    error!("failed to stop after aborted test set: {}", e);
                }
                break;
            }
        }

        if !summary.aborted {
            self.print_summary(&summary);
        }
        Ok(summary)
    }

    /// Allocate the next run id and boot instrumentation
    async fn boot(&self) -> Result<(String, u64)> {
        let run_ids = self.report_db.get_all_test_run_ids().await?;
        let test_run_id = next_id(&run_ids, TEST_RUN_TEMPLATE);

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
        Ok((test_run_id, app_id))
    }

    /// Run one test set to a terminal status
    pub async fn run_test_set(
        &self,
        cancel: &CancellationToken,
        test_set_id: &str,
        test_run_id: &str,
        app_id: u64,
        serve_test: bool,
    ) -> Result<TestSetResult> {
        // scope tree: the set scope owns the application, the loop scope
        // owns the per-case work; both join at the tail of this function
        let set_cancel = cancel.child_token();
        let loop_cancel = set_cancel.child_token();

        let test_cases = self.test_db.get_test_cases(test_set_id).await?;
        let total = test_cases.len();
        if test_cases.is_empty() {
            return Ok(TestSetResult {
                status: TestSetStatus::Passed,
                total: 0,
                success: 0,
                failure: 0,
            });
        }

        // whole recorded pool first; the loop re-narrows per case
        let filtered = self.mock_db.get_filtered_mocks(test_set_id, None, None).await?;
        let unfiltered = self
            .mock_db
            .get_unfiltered_mocks(test_set_id, None, None)
            .await?;
        self.instrumentation
            .set_mocks(app_id, filtered, unfiltered)
            .await?;
        let mut mock_errors = self
            .instrumentation
            .mock_outgoing(
                app_id,
                OutgoingOptions {
                    pass_through_ports: self.config.pass_through_ports.clone(),
                    fallback_passthrough: false,
                },
            )
            .await?;

        let (app_err_tx, mut app_err_rx) = mpsc::channel(1);
        let mut app_task = None;
        if !serve_test {
            let instrumentation = self.instrumentation.clone();
            let coverage = self.config.coverage;
            let app_cancel = set_cancel.child_token();
            app_task = Some(tokio::spawn(async move {
                let err = instrumentation
                    .run(app_id, RunOptions { coverage }, app_cancel)
                    .await;
                if err.kind != AppErrorKind::CtxCanceled {
                    let _ = app_err_tx.send(err).await;
                }
            }));
        }

        // startup grace period
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(self.config.delay)) => {}
            _ = cancel.cancelled() => {}
        }

        // first failure signal wins and ends the test loop
        let (status_tx, status_rx) = watch::channel(TestSetStatus::Running);
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            let loop_cancel = loop_cancel.clone();
            async move {
                let status = tokio::select! {
                    mock_err = mock_errors.recv() => match mock_err {
                        Some(e) => {
                            error!("failed to mock outgoing call: {}", e);
                            TestSetStatus::Failed
                        }
                        None => return,
                    },
                    app_err = app_err_rx.recv() => match app_err {
                        Some(err) => {
                            error!("application failed to run: {}", err);
                            match err.kind {
                                AppErrorKind::CommandError => TestSetStatus::FaultUserApp,
                                AppErrorKind::Unexpected | AppErrorKind::AppStopped => {
                                    TestSetStatus::AppHalted
                                }
                                AppErrorKind::Internal => TestSetStatus::InternalErr,
                                AppErrorKind::CtxCanceled => return,
                            }
                        }
                        None => return,
                    },
                    _ = cancel.cancelled() => TestSetStatus::UserAbort,
                };
                let _ = status_tx.send(status);
                loop_cancel.cancel();
            }
        });

        let running_report = TestReport {
            version: API_VERSION.to_string(),
            status: TestSetStatus::Running,
            total,
            ..Default::default()
        };
        let report_name = self
            .report_db
            .insert_report(test_run_id, test_set_id, &running_report)
            .await?;

        let mut success = 0usize;
        let mut failure = 0usize;
        let mut set_status = TestSetStatus::Passed;

        for test_case in &test_cases {
            let signalled = *status_rx.borrow();
            if signalled != TestSetStatus::Running {
                set_status = signalled;
                break;
            }

            // re-narrow the mock window to this case
            let window = (test_case.http_req.timestamp, test_case.http_resp.timestamp);
            let narrowing = async {
                let filtered = self
                    .mock_db
                    .get_filtered_mocks(test_set_id, window.0, window.1)
                    .await?;
                let unfiltered = self
                    .mock_db
                    .get_unfiltered_mocks(test_set_id, window.0, window.1)
                    .await?;
                self.instrumentation
                    .set_mocks(app_id, filtered, unfiltered)
                    .await
            };
            if let Err(e) = narrowing.await {
                error!(test_case = %test_case.name, "failed to install mocks: {}", e);
                set_status = TestSetStatus::InternalErr;
                break;
            }

            let started = Utc::now();
            let actual = match self.simulate_request(app_id, test_case).await {
                Ok(actual) => actual,
                Err(e) => {
                    if loop_cancel.is_cancelled() {
                        set_status = *status_rx.borrow();
                        if set_status == TestSetStatus::Running {
                            set_status = TestSetStatus::UserAbort;
                        }
                    } else {
                        error!(test_case = %test_case.name, "failed to simulate request: {}", e);
                        set_status = TestSetStatus::UserAbort;
                    }
                    break;
                }
            };

            let (passed, diffs) = self.compare_resp(test_case, &actual, test_set_id);
            if passed {
                info!(
                    test_case = %test_case.name,
                    test_set = %test_set_id,
                    "result: \x1b[32mPASSED\x1b[0m"
                );
                success += 1;
            } else {
                info!(
                    test_case = %test_case.name,
                    test_set = %test_set_id,
                    "result: \x1b[31mFAILED\x1b[0m"
                );
                failure += 1;
                set_status = TestSetStatus::Failed;
            }

            let result = TestResult {
                kind: Kind::Http,
                name: test_set_id.to_string(),
                status: if passed {
                    TestStatus::Passed
                } else {
                    TestStatus::Failed
                },
                started: started.timestamp(),
                completed: Utc::now().timestamp(),
                test_case_id: test_case.name.clone(),
                req: test_case.http_req.clone(),
                res: actual,
                noise: test_case.noise.clone(),
                result: diffs,
            };
            if let Err(e) = self
                .report_db
                .insert_test_case_result(test_run_id, test_set_id, result)
                .await
            {
                error!("failed to insert test case result: {}", e);
                set_status = TestSetStatus::InternalErr;
                break;
            }
        }

        let results = match self
            .report_db
            .get_test_case_results(test_run_id, test_set_id)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                if !cancel.is_cancelled() {
                    error!("failed to get test case results: {}", e);
                    set_status = TestSetStatus::InternalErr;
                }
                Vec::new()
            }
        };

        // the final write must survive shutdown: it deliberately ignores
        // the run scope so an abort reason always reaches the report
        let final_report = TestReport {
            version: API_VERSION.to_string(),
            name: report_name,
            test_set: test_set_id.to_string(),
            status: set_status,
            total,
            success,
            failure,
            tests: results,
        };
        self.report_db
            .insert_report(test_run_id, test_set_id, &final_report)
            .await
            .map_err(|e| {
                RetraceError::Internal(format!("failed to insert final report: {}", e))
            })?;

        // tear the scope tree down: kills the app, stops the watcher
        set_cancel.cancel();
        if let Some(task) = app_task {
            let _ = task.await;
        }
        watcher.abort();
        let _ = watcher.await;

        Ok(TestSetResult {
            status: set_status,
            total,
            success,
            failure,
        })
    }

    /// Issue one recorded request against the live application
    async fn simulate_request(&self, app_id: u64, test_case: &TestCase) -> Result<HttpResp> {
        let mut target = test_case.http_req.url.clone();
        if self.config.container_ip.is_some() {
            let app_ip = self.instrumentation.get_app_ip(app_id).await?;
            target = replace_host(&target, &app_ip)?;
            debug!(url = %target, "rewrote url host to container address");
        }

        let method = reqwest::Method::from_bytes(test_case.http_req.method.as_bytes())
            .map_err(|e| RetraceError::Simulation(format!("invalid method: {}", e)))?;

        let mut request = self
            .client
            .request(method, target.as_str())
            .timeout(Duration::from_secs(self.config.api_timeout));
        for (name, value) in &test_case.http_req.header {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        if !test_case.http_req.body.is_empty() {
            request = request.body(test_case.http_req.body.clone());
        }

        let response = request.send().await?;
        let status_code = response.status().as_u16();
        let status_message = response
            .status()
            .canonical_reason()
            .map(|r| r.to_string());
        let mut header = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = value.to_str().unwrap_or_default().to_string();
            header
                .entry(name.to_string())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
        let body = response.text().await?;

        Ok(HttpResp {
            status_code,
            header,
            body,
            status_message,
            proto_major: 1,
            proto_minor: 1,
            timestamp: Some(Utc::now()),
        })
    }

    /// Compare under the merged noise policy: global, then per-set
    /// overrides, then the test case's own recorded noise.
    fn compare_resp(
        &self,
        test_case: &TestCase,
        actual: &HttpResp,
        test_set_id: &str,
    ) -> (bool, Vec<crate::models::DiffRecord>) {
        let mut noise: NoiseMap = self.config.global_noise.global.clone();
        if let Some(set_noise) = self.config.global_noise.test_sets.get(test_set_id) {
            noise = left_join_noise(&noise, set_noise);
        }
        noise = left_join_noise(&noise, &test_case.noise);

        let comparison = compare(
            &test_case.http_resp,
            actual,
            &noise,
            self.config.ignore_ordering,
        );
        (comparison.passed, comparison.diffs)
    }

    fn print_summary(&self, summary: &RunSummary) {
        if summary.total == 0 {
            return;
        }
        println!("\n <=========================================>");
        println!("  COMPLETE TESTRUN SUMMARY.");
        println!("\tTotal tests: {}", summary.total);
        println!("\tTotal test passed: {}", summary.passed);
        println!("\tTotal test failed: {}", summary.failed);
        println!("\n\tTest Suite Name\t\tTotal Test\tPassed\t\tFailed\t\tStatus");
        for (name, verdict) in &summary.verdicts {
            println!(
                "\t{}\t\t{}\t\t{}\t\t{}\t\t{}",
                name, verdict.total, verdict.success, verdict.failure, verdict.status
            );
        }
        println!(" <=========================================>\n");
        info!(passed_overall = summary.all_passed(), "test run completed");

        if self.config.coverage {
            match std::env::var("GOCOVERDIR") {
                Ok(dir) => info!(dir, "coverage data collected"),
                Err(_) => warn!("coverage requested but GOCOVERDIR is not set"),
            }
        }
    }

    /// Serve recorded mocks without driving any tests, until cancelled
    pub async fn provide_mocks(&self) -> Result<()> {
        let (_, app_id) = self.boot().await?;

        let mut filtered = Vec::new();
        let mut unfiltered = Vec::new();
        for test_set_id in self.test_db.get_all_test_set_ids().await? {
            filtered.extend(
                self.mock_db
                    .get_filtered_mocks(&test_set_id, None, None)
                    .await?,
            );
            unfiltered.extend(
                self.mock_db
                    .get_unfiltered_mocks(&test_set_id, None, None)
                    .await?,
            );
        }
        self.instrumentation
            .set_mocks(app_id, filtered, unfiltered)
            .await?;
        let _errors = self
            .instrumentation
            .mock_outgoing(app_id, OutgoingOptions::default())
            .await?;

        info!("serving mocks until interrupted");
        self.stop.cancelled().await;
        Ok(())
    }
}

/// Swap the host (and implied port) of a recorded URL for the live one
fn replace_host(url: &str, new_host: &str) -> Result<String> {
    let mut parsed = url::Url::parse(url)?;
    match new_host.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            parsed
                .set_host(Some(host))
                .map_err(|e| RetraceError::Simulation(format!("invalid host: {}", e)))?;
            let port: u16 = port
                .parse()
                .map_err(|_| RetraceError::Simulation(format!("invalid port in {}", new_host)))?;
            parsed
                .set_port(Some(port))
                .map_err(|_| RetraceError::Simulation("cannot set port".to_string()))?;
        }
        _ => {
            parsed
                .set_host(Some(new_host))
                .map_err(|e| RetraceError::Simulation(format!("invalid host: {}", e)))?;
        }
    }
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_host_keeps_path_and_query() {
        let replaced = replace_host("http://localhost:8080/api/v1?x=1", "172.17.0.2").unwrap();
        assert_eq!(replaced, "http://172.17.0.2:8080/api/v1?x=1");
    }

    #[test]
    fn replace_host_with_port() {
        let replaced = replace_host("http://localhost:8080/api", "10.0.0.9:9999").unwrap();
        assert_eq!(replaced, "http://10.0.0.9:9999/api");
    }

    #[test]
    fn summary_overall_verdict() {
        let mut summary = RunSummary::new("test-run-0".to_string());
        summary.record(
            "test-set-1".to_string(),
            TestSetResult {
                status: TestSetStatus::Passed,
                total: 2,
                success: 2,
                failure: 0,
            },
        );
        assert!(summary.all_passed());

        summary.record(
            "test-set-2".to_string(),
            TestSetResult {
                status: TestSetStatus::Failed,
                total: 1,
                success: 0,
                failure: 1,
            },
        );
        assert!(!summary.all_passed());
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn aborted_summary_never_passes() {
        let mut summary = RunSummary::new("test-run-0".to_string());
        summary.aborted = true;
        assert!(!summary.all_passed());
    }
}
