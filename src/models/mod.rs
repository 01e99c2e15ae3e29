//! Core data model: test cases, mocks, results and reports
//!
//! Everything in this module is serde-serializable so it can round-trip
//! through the YAML document stores unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Document version written by this build
pub const API_VERSION: &str = "api.keploy.io/v1beta1";

/// Enterprise document version: loaded, but flagged
pub const ENTERPRISE_API_VERSION: &str = "api.keploy-enterprise.io/v1beta1";

/// Naming template for test runs (`test-run-0`, `test-run-1`, ...)
pub const TEST_RUN_TEMPLATE: &str = "test-run";

/// Naming template for per-set reports (`report-1`, `report-2`, ...)
pub const REPORT_TEMPLATE: &str = "report";

/// Protocol kind of a recorded interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Kind {
    #[default]
    Http,
    #[serde(rename = "gRPC")]
    Grpc,
    Mongo,
    Generic,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Http => write!(f, "Http"),
            Kind::Grpc => write!(f, "gRPC"),
            Kind::Mongo => write!(f, "Mongo"),
            Kind::Generic => write!(f, "Generic"),
        }
    }
}

/// A recorded HTTP request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpReq {
    pub method: String,
    #[serde(default)]
    pub proto_major: u8,
    #[serde(default)]
    pub proto_minor: u8,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub url_params: BTreeMap<String, String>,
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A recorded HTTP response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResp {
    pub status_code: u16,
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub proto_major: u8,
    #[serde(default)]
    pub proto_minor: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Noise policy: dotted response path -> regexes over the expected value.
/// An empty list marks the path unconditionally noisy.
pub type NoiseMap = BTreeMap<String, Vec<String>>;

/// A captured ingress exchange, immutable once persisted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCase {
    pub version: String,
    pub name: String,
    pub kind: Kind,
    #[serde(default)]
    pub created: i64,
    pub http_req: HttpReq,
    pub http_resp: HttpResp,
    #[serde(default)]
    pub noise: NoiseMap,
}

/// One gRPC message as reassembled from HTTP/2 frames
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrpcMessage {
    /// Decoded headers, pseudo-headers included (`:path`, `:status`, ...)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Concatenated DATA frame payload (length-prefixed gRPC messages)
    #[serde(default)]
    pub data: Vec<u8>,
    /// Trailer block, present on responses
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trailers: BTreeMap<String, String>,
}

/// Fixed 16-byte Mongo wire header
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MongoHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub opcode: i32,
}

/// One Mongo wire message (header + raw body)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MongoMessage {
    pub header: MongoHeader,
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// Protocol-specific payload of a mock, one family of fields per [`Kind`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_req: Option<HttpReq>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_res: Option<HttpResp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_req: Option<GrpcMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_res: Option<GrpcMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mongo_requests: Vec<MongoMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mongo_responses: Vec<MongoMessage>,
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_timestamp: Option<DateTime<Utc>>,
}

/// A recorded outbound interaction of the application with a dependency
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mock {
    pub version: String,
    pub kind: Kind,
    pub name: String,
    pub spec: MockSpec,
}

impl Mock {
    /// Whether this mock was classified as background/config traffic
    /// (heartbeats and similar) during recording.
    pub fn is_config(&self) -> bool {
        self.spec.metadata.get("type").map(String::as_str) == Some("config")
    }
}

/// Verdict of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    #[default]
    Running,
    Passed,
    Failed,
}

/// Terminal (or running) state of one test set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TestSetStatus {
    #[default]
    Running,
    Passed,
    Failed,
    AppHalted,
    InternalErr,
    UserAbort,
    FaultUserApp,
}

impl TestSetStatus {
    /// Whether this state ends the test set
    pub fn is_terminal(self) -> bool {
        self != TestSetStatus::Running
    }

    /// Whether the whole run must stop after this set
    pub fn aborts_run(self) -> bool {
        matches!(
            self,
            TestSetStatus::AppHalted
                | TestSetStatus::InternalErr
                | TestSetStatus::FaultUserApp
                | TestSetStatus::UserAbort
        )
    }
}

impl fmt::Display for TestSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestSetStatus::Running => "running",
            TestSetStatus::Passed => "passed",
            TestSetStatus::Failed => "failed",
            TestSetStatus::AppHalted => "app-halted",
            TestSetStatus::InternalErr => "internal-err",
            TestSetStatus::UserAbort => "user-abort",
            TestSetStatus::FaultUserApp => "fault-user-app",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TestSetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(TestSetStatus::Running),
            "passed" => Ok(TestSetStatus::Passed),
            "failed" => Ok(TestSetStatus::Failed),
            "app-halted" => Ok(TestSetStatus::AppHalted),
            "internal-err" => Ok(TestSetStatus::InternalErr),
            "user-abort" => Ok(TestSetStatus::UserAbort),
            "fault-user-app" => Ok(TestSetStatus::FaultUserApp),
            other => Err(format!("unknown test set status: {}", other)),
        }
    }
}

/// One compared response path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub path: String,
    pub expected: String,
    pub actual: String,
    /// true when the path matched or was marked noisy
    pub normal: bool,
}

/// Result of replaying one test case
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResult {
    pub kind: Kind,
    /// Test set this result belongs to
    pub name: String,
    pub status: TestStatus,
    pub started: i64,
    pub completed: i64,
    pub test_case_id: String,
    pub req: HttpReq,
    pub res: HttpResp,
    #[serde(default)]
    pub noise: NoiseMap,
    #[serde(default)]
    pub result: Vec<DiffRecord>,
}

/// Aggregated report for one test set within a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestReport {
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub test_set: String,
    pub status: TestSetStatus,
    pub total: usize,
    #[serde(default)]
    pub success: usize,
    #[serde(default)]
    pub failure: usize,
    #[serde(default)]
    pub tests: Vec<TestResult>,
}

/// Classified failure of the application under test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    /// Cancellation reached the app runner; not a failure
    CtxCanceled,
    /// The command failed to start or exec
    CommandError,
    /// The app exited unexpectedly mid-run
    Unexpected,
    /// The app stopped (signalled or external stop)
    AppStopped,
    /// Fault in the runner itself
    Internal,
}

/// Error surfaced by the application runner
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(kind: AppErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AppError {}

/// Options for instrumentation setup
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// Container/runtime hint; empty for native processes
    pub container: String,
}

/// Options for installing hooks and the proxy
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
    pub proxy_port: u16,
}

/// Options applied to outgoing-call handlers in both modes
#[derive(Debug, Clone, Default)]
pub struct OutgoingOptions {
    /// Ports piped blind to the real upstream instead of being matched
    pub pass_through_ports: Vec<u16>,
    /// When true, an unmatched mock falls back to the real upstream
    /// instead of failing the test
    pub fallback_passthrough: bool,
}

/// Options for running the application under test
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Forward `GOCOVERDIR` to the child when coverage is requested
    pub coverage: bool,
}
