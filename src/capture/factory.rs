//! Routine-safe registry of connection trackers with a periodic sweep

use super::http1;
use super::tracker::Tracker;
use super::ConnId;
use crate::models::{Kind, TestCase, API_VERSION};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Request header that overrides the generated test-case name
const TEST_NAME_HEADER: &str = "Retrace-Test-Name";

/// Concurrent container of [`Tracker`]s, one per live connection.
///
/// Lookups take the read lock and upgrade only when inserting; the sweep in
/// [`Factory::process_active`] holds the write lock for its whole pass, so a
/// tracker is never swept while bytes are being appended to it.
pub struct Factory {
    connections: RwLock<HashMap<ConnId, Arc<Mutex<Tracker>>>>,
    inactivity_threshold: Duration,
}

impl Factory {
    pub fn new(inactivity_threshold: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            inactivity_threshold,
        }
    }

    /// Return the tracker for `conn_id`, creating it on first sight
    pub async fn get_or_create(&self, conn_id: ConnId) -> Arc<Mutex<Tracker>> {
        if let Some(tracker) = self.connections.read().await.get(&conn_id) {
            return tracker.clone();
        }
        self.connections
            .write()
            .await
            .entry(conn_id)
            .or_insert_with(|| Arc::new(Mutex::new(Tracker::new(conn_id))))
            .clone()
    }

    /// Number of live trackers
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// One sweep over every tracker: emit finished exchanges as test cases,
    /// drop idle and unparseable ones. Deletions are applied after the
    /// iteration. The send on `out` may block when the consumer lags; that
    /// backpressure is intentional. Cancellation returns early without
    /// further emission.
    pub async fn process_active(&self, cancel: &CancellationToken, out: &mpsc::Sender<TestCase>) {
        let mut connections = self.connections.write().await;
        let mut to_delete: Vec<ConnId> = Vec::new();

        for (conn_id, tracker) in connections.iter() {
            if cancel.is_cancelled() {
                return;
            }
            let tracker = tracker.lock().await;

            if tracker.is_complete() {
                if tracker.request_buf().is_empty() || tracker.response_buf().is_empty() {
                    warn!(
                        conn = %conn_id,
                        req_len = tracker.request_buf().len(),
                        res_len = tracker.response_buf().len(),
                        "skipping exchange with an empty side"
                    );
                    continue;
                }
                match build_test_case(&tracker) {
                    Ok(test_case) => {
                        tokio::select! {
                            res = out.send(test_case) => {
                                if res.is_err() {
                                    debug!("test case receiver dropped, ending sweep");
                                    return;
                                }
                            }
                            _ = cancel.cancelled() => return,
                        }
                        to_delete.push(*conn_id);
                    }
                    Err(e) => {
                        error!(conn = %conn_id, "failed to parse completed exchange: {}", e);
                        to_delete.push(*conn_id);
                    }
                }
            } else if tracker.is_inactive(self.inactivity_threshold) {
                if tracker.is_malformed() {
                    warn!(conn = %conn_id, "dropping unparseable connection buffer");
                }
                to_delete.push(*conn_id);
            }
        }

        for conn_id in to_delete {
            connections.remove(&conn_id);
        }
    }

    /// Sweep on an interval until cancelled
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        out: mpsc::Sender<TestCase>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.process_active(&cancel, &out).await,
                _ = cancel.cancelled() => return,
            }
        }
    }
}

fn build_test_case(tracker: &Tracker) -> crate::error::Result<TestCase> {
    let req = http1::parse_request(tracker.request_buf(), tracker.request_timestamp())?;
    let resp = http1::parse_response(
        tracker.response_buf(),
        Some(req.method.as_str()),
        tracker.response_timestamp(),
    )?;

    let name = req
        .header
        .get(TEST_NAME_HEADER)
        .cloned()
        .unwrap_or_default();

    Ok(TestCase {
        version: API_VERSION.to_string(),
        name,
        kind: Kind::Http,
        created: Utc::now().timestamp(),
        http_req: req,
        http_resp: resp,
        noise: Default::default(),
    })
}
