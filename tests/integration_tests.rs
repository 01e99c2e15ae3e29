//! Integration tests for the retrace engine
//!
//! Exercises the capture factory, the mock store views and the replay
//! orchestrator through their public APIs, including full record-to-replay
//! round trips against scripted applications.

use chrono::{TimeZone, Utc};
use retrace::capture::{ConnId, Factory};
use retrace::compare::{compare, left_join_noise};
use retrace::instrument::ProxyInstrumentation;
use retrace::models::{
    HttpReq, HttpResp, Kind, Mock, MockSpec, NoiseMap, TestCase, TestSetStatus, API_VERSION,
};
use retrace::proxy::Proxy;
use retrace::storage::{MockDb, ReportDb, TestDb, YamlMockDb, YamlReportDb, YamlTestDb};
use retrace::{Config, Replayer, StopHandle};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn conn_id(nonce: u64) -> ConnId {
    ConnId::new(
        "127.0.0.1:40000".parse().unwrap(),
        "127.0.0.1:8080".parse().unwrap(),
        nonce,
    )
}

/// One recorded GET becomes exactly one test case
#[tokio::test]
async fn record_one_get() {
    let factory = Factory::new(Duration::from_secs(30));
    let tracker = factory.get_or_create(conn_id(1)).await;
    {
        let mut t = tracker.lock().await;
        t.append_request_bytes(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n", Utc::now());
        t.append_response_bytes(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
            Utc::now(),
        );
    }

    let (tx, mut rx) = mpsc::channel(4);
    factory.process_active(&CancellationToken::new(), &tx).await;

    let tc = rx.try_recv().expect("one test case");
    assert_eq!(tc.http_req.method, "GET");
    assert_eq!(tc.http_req.url, "http://x/hello");
    assert_eq!(tc.http_req.body, "");
    assert_eq!(tc.http_resp.status_code, 200);
    assert_eq!(tc.http_resp.body, "hello");
    assert!(tc.http_req.timestamp.is_some());
    assert!(tc.http_resp.timestamp.is_some());
    assert!(rx.try_recv().is_err(), "exactly one test case");
}

/// A stalled connection is swept without emitting anything
#[tokio::test]
async fn inactivity_sweep() {
    let factory = Factory::new(Duration::from_millis(20));
    let tracker = factory.get_or_create(conn_id(1)).await;
    tracker
        .lock()
        .await
        .append_request_bytes(b"GET", Utc::now());

    tokio::time::sleep(Duration::from_millis(40)).await;

    let (tx, mut rx) = mpsc::channel(4);
    factory.process_active(&CancellationToken::new(), &tx).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(factory.len().await, 0);
}

/// The filtered view keeps in-window and timestamp-less mocks
#[tokio::test]
async fn mock_windowing_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = YamlMockDb::new(dir.path());

    let windows: [(&str, Option<(i64, i64)>); 4] = [
        ("A", Some((50, 60))),
        ("B", Some((120, 180))),
        ("C", Some((190, 250))),
        ("D", None),
    ];
    for (name, window) in windows {
        let mock = Mock {
            version: API_VERSION.to_string(),
            kind: Kind::Http,
            name: name.to_string(),
            spec: MockSpec {
                req_timestamp: window.map(|(r, _)| Utc.timestamp_opt(r, 0).unwrap()),
                res_timestamp: window.map(|(_, r)| Utc.timestamp_opt(r, 0).unwrap()),
                ..Default::default()
            },
        };
        db.insert_mock("test-set-1", &mock).await.unwrap();
    }

    let filtered = db
        .get_filtered_mocks(
            "test-set-1",
            Some(Utc.timestamp_opt(100, 0).unwrap()),
            Some(Utc.timestamp_opt(200, 0).unwrap()),
        )
        .await
        .unwrap();
    let names: Vec<&str> = filtered.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["B", "D"]);
}

/// A noisy path passes and is marked normal in the diff
#[test]
fn comparator_with_noise() {
    let expected = HttpResp {
        status_code: 200,
        body: r#"{"user":{"id":"abc","name":"x"}}"#.to_string(),
        ..Default::default()
    };
    let actual = HttpResp {
        status_code: 200,
        body: r#"{"user":{"id":"zzz","name":"x"}}"#.to_string(),
        ..Default::default()
    };
    let noise = NoiseMap::from([("body.user.id".to_string(), Vec::new())]);

    let result = compare(&expected, &actual, &noise, false);
    assert!(result.passed);
    let id_path = result
        .diffs
        .iter()
        .find(|d| d.path == "body.user.id")
        .unwrap();
    assert!(id_path.normal);
}

/// Per-set noise overrides the global policy for conflicting paths
#[test]
fn noise_merge_prefers_test_set() {
    let global = NoiseMap::from([("body.token".to_string(), vec!["^g".to_string()])]);
    let per_set = NoiseMap::from([("body.token".to_string(), Vec::new())]);
    let merged = left_join_noise(&global, &per_set);
    assert!(merged.get("body.token").unwrap().is_empty());
}

/// Minimal HTTP/1.1 stub application: answers every request with `ok`,
/// except paths containing "hang", which are answered only after a long
/// sleep.
async fn spawn_stub_app() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let Ok(n) = conn.read(&mut buf).await else {
                    return;
                };
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                if head.contains("hang") {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                let _ = conn
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                    .await;
            });
        }
    });
    addr
}

fn stub_case(name: &str, url: String) -> TestCase {
    TestCase {
        version: API_VERSION.to_string(),
        name: name.to_string(),
        kind: Kind::Http,
        created: 0,
        http_req: HttpReq {
            method: "GET".to_string(),
            proto_major: 1,
            proto_minor: 1,
            url,
            ..Default::default()
        },
        http_resp: HttpResp {
            status_code: 200,
            header: BTreeMap::from([("content-length".to_string(), "2".to_string())]),
            body: "ok".to_string(),
            ..Default::default()
        },
        noise: NoiseMap::new(),
    }
}

/// Engine wired over a `sets/` recording root and a separate `reports/`
/// root so report directories are never mistaken for test sets.
fn engine(dir: &std::path::Path, command: &str) -> (Replayer, Arc<YamlReportDb>, StopHandle) {
    let sets_root = dir.join("sets");
    let reports_root = dir.join("reports");
    let stop = StopHandle::new();
    let config = Config {
        command: command.to_string(),
        path: sets_root.clone(),
        test_report_path: reports_root.clone(),
        proxy_port: 0,
        delay: 0,
        api_timeout: 2,
        ..Default::default()
    };
    let factory = Arc::new(Factory::new(Duration::from_secs(5)));
    let instrumentation = Arc::new(ProxyInstrumentation::new(
        Arc::new(Proxy::new()),
        factory,
        stop.token(),
        None,
        Duration::from_millis(100),
    ));
    let report_db = Arc::new(YamlReportDb::new(reports_root));
    let replayer = Replayer::new(
        Arc::new(YamlTestDb::new(sets_root.clone())),
        Arc::new(YamlMockDb::new(sets_root)),
        report_db.clone(),
        instrumentation,
        config,
        stop.clone(),
    );
    (replayer, report_db, stop)
}

/// A full run over one recorded set where every response matches
#[tokio::test]
async fn replay_round_trip_passes() {
    let dir = tempfile::tempdir().unwrap();
    let app_addr = spawn_stub_app().await;

    let test_db = YamlTestDb::new(dir.path().join("sets"));
    for name in ["", ""] {
        test_db
            .insert_test_case(
                "test-set-0",
                &stub_case(name, format!("http://{}/hello", app_addr)),
            )
            .await
            .unwrap();
    }

    // the stub runs independently; the supervised command just stays alive
    let (replayer, report_db, _stop) = engine(dir.path(), "sleep 30");
    let summary = replayer.start().await.unwrap();

    assert!(summary.all_passed());
    assert_eq!(summary.total, 2);
    assert_eq!(summary.passed, 2);
    assert_eq!(summary.failed, 0);

    let report = report_db
        .get_report(&summary.test_run_id, "test-set-0")
        .await
        .unwrap();
    assert_eq!(report.status, TestSetStatus::Passed);
    assert_eq!(report.tests.len(), 2);
}

/// A body mismatch fails the test and the set, but the run completes
#[tokio::test]
async fn replay_mismatch_fails_set_without_abort() {
    let dir = tempfile::tempdir().unwrap();
    let app_addr = spawn_stub_app().await;

    let test_db = YamlTestDb::new(dir.path().join("sets"));
    let mut wrong = stub_case("", format!("http://{}/hello", app_addr));
    wrong.http_resp.body = "different".to_string();
    test_db.insert_test_case("test-set-0", &wrong).await.unwrap();
    test_db
        .insert_test_case(
            "test-set-0",
            &stub_case("", format!("http://{}/hello", app_addr)),
        )
        .await
        .unwrap();

    let (replayer, report_db, _stop) = engine(dir.path(), "sleep 30");
    let summary = replayer.start().await.unwrap();

    assert!(!summary.all_passed());
    assert!(!summary.aborted);
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.failed, 1);

    let report = report_db
        .get_report(&summary.test_run_id, "test-set-0")
        .await
        .unwrap();
    assert_eq!(report.status, TestSetStatus::Failed);

    // the failing diff names the body path
    let failing = report
        .tests
        .iter()
        .find(|t| t.status == retrace::models::TestStatus::Failed)
        .unwrap();
    assert!(failing
        .result
        .iter()
        .any(|d| d.path == "body" && !d.normal));
}

/// The application dies mid-set; the report carries the
/// halt status and only the completed cases' counters.
#[tokio::test]
async fn app_crash_mid_set() {
    let dir = tempfile::tempdir().unwrap();
    let app_addr = spawn_stub_app().await;

    let test_db = YamlTestDb::new(dir.path().join("sets"));
    for path in ["one", "two"] {
        test_db
            .insert_test_case(
                "test-set-0",
                &stub_case("", format!("http://{}/{}", app_addr, path)),
            )
            .await
            .unwrap();
    }
    // the third request hangs at the stub while the app exits underneath
    test_db
        .insert_test_case(
            "test-set-0",
            &stub_case("", format!("http://{}/hang", app_addr)),
        )
        .await
        .unwrap();

    let (replayer, report_db, _stop) = engine(dir.path(), "sleep 1");
    let summary = replayer.start().await.unwrap();

    assert!(summary.aborted);
    assert_eq!(summary.verdicts.len(), 1);
    let (_, verdict) = &summary.verdicts[0];
    assert_eq!(verdict.status, TestSetStatus::AppHalted);
    assert_eq!(verdict.total, 3);
    assert_eq!(verdict.success, 2);
    assert_eq!(verdict.failure, 0);

    // the detached final write survived the abort
    let report = report_db
        .get_report(&summary.test_run_id, "test-set-0")
        .await
        .unwrap();
    assert_eq!(report.status, TestSetStatus::AppHalted);
    assert_eq!(report.total, 3);
    assert_eq!(report.success, 2);
}

/// Run ids allocate monotonically under the naming template
#[tokio::test]
async fn consecutive_runs_get_fresh_ids() {
    let dir = tempfile::tempdir().unwrap();
    let app_addr = spawn_stub_app().await;

    let test_db = YamlTestDb::new(dir.path().join("sets"));
    test_db
        .insert_test_case(
            "test-set-0",
            &stub_case("", format!("http://{}/hello", app_addr)),
        )
        .await
        .unwrap();

    let (replayer, _, _stop) = engine(dir.path(), "sleep 30");
    let first = replayer.start().await.unwrap();
    assert_eq!(first.test_run_id, "test-run-0");

    let (replayer, _, _stop) = engine(dir.path(), "sleep 30");
    let second = replayer.start().await.unwrap();
    assert_eq!(second.test_run_id, "test-run-1");
}
