//! Recorded-mock storage and the replay-time consumable view
//!
//! [`MockStore`] is the append-only, time-indexed pool for one test set.
//! Its two views split the pool by a test case's request/response window:
//! `filtered` for dependency calls made while serving that request,
//! `unfiltered` for background and config traffic around it.
//! [`MockRegistry`] is the per-run view MOCK-mode handlers consume from.

use crate::models::Mock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

/// Append-only store of recorded outbound interactions, iteration in
/// recording order.
#[derive(Default)]
pub struct MockStore {
    mocks: Mutex<Vec<Mock>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mocks(mocks: Vec<Mock>) -> Self {
        Self {
            mocks: Mutex::new(mocks),
        }
    }

    pub fn put(&self, mock: Mock) {
        self.mocks.lock().push(mock);
    }

    pub fn len(&self) -> usize {
        self.mocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mocks.lock().is_empty()
    }

    /// Everything recorded so far, in recording order
    pub fn all(&self) -> Vec<Mock> {
        self.mocks.lock().clone()
    }

    /// Mocks whose timestamps lie strictly inside `(req_ts, res_ts)`.
    /// Mocks missing either timestamp are included unconditionally; a test
    /// case missing either bound gets the whole pool.
    pub fn get_filtered(
        &self,
        req_ts: Option<DateTime<Utc>>,
        res_ts: Option<DateTime<Utc>>,
    ) -> Vec<Mock> {
        let mocks = self.mocks.lock();
        let (Some(req_ts), Some(res_ts)) = (req_ts, res_ts) else {
            warn!("test case is missing a timestamp, returning the full mock pool");
            return mocks.clone();
        };
        mocks
            .iter()
            .filter(|m| match (m.spec.req_timestamp, m.spec.res_timestamp) {
                (Some(mock_req), Some(mock_res)) => mock_req > req_ts && mock_res < res_ts,
                _ => true,
            })
            .cloned()
            .collect()
    }

    /// Mocks outside the window or without timestamps; background and
    /// config traffic is served from this pool regardless of windowing.
    pub fn get_unfiltered(
        &self,
        req_ts: Option<DateTime<Utc>>,
        res_ts: Option<DateTime<Utc>>,
    ) -> Vec<Mock> {
        let mocks = self.mocks.lock();
        let (Some(req_ts), Some(res_ts)) = (req_ts, res_ts) else {
            return mocks
                .iter()
                .filter(|m| {
                    m.spec.req_timestamp.is_none()
                        || m.spec.res_timestamp.is_none()
                        || m.is_config()
                })
                .cloned()
                .collect();
        };
        mocks
            .iter()
            .filter(|m| match (m.spec.req_timestamp, m.spec.res_timestamp) {
                (Some(mock_req), Some(mock_res)) => {
                    !(mock_req > req_ts && mock_res < res_ts) || m.is_config()
                }
                _ => true,
            })
            .cloned()
            .collect()
    }
}

/// Per-run view the MOCK-mode protocol handlers match against.
///
/// Matching a filtered mock consumes it so a duplicate outbound call cannot
/// be answered twice from one recording; config traffic is answered from the
/// unfiltered pool without consumption because heartbeats repeat.
#[derive(Default)]
pub struct MockRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    filtered: Vec<Mock>,
    unfiltered: Vec<Mock>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both pools; called per test case to re-narrow the window
    pub fn set(&self, filtered: Vec<Mock>, unfiltered: Vec<Mock>) {
        let mut inner = self.inner.lock();
        inner.filtered = filtered;
        inner.unfiltered = unfiltered;
    }

    /// First filtered mock satisfying `pred`, in recording order, removed
    /// from the view
    pub fn consume_filtered(&self, pred: impl Fn(&Mock) -> bool) -> Option<Mock> {
        let mut inner = self.inner.lock();
        let idx = inner.filtered.iter().position(|m| pred(m))?;
        Some(inner.filtered.remove(idx))
    }

    /// First unfiltered mock satisfying `pred`; left in place
    pub fn find_unfiltered(&self, pred: impl Fn(&Mock) -> bool) -> Option<Mock> {
        let inner = self.inner.lock();
        inner.unfiltered.iter().find(|m| pred(m)).cloned()
    }

    pub fn filtered_len(&self) -> usize {
        self.inner.lock().filtered.len()
    }

    pub fn unfiltered_len(&self) -> usize {
        self.inner.lock().unfiltered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Kind, MockSpec, API_VERSION};
    use chrono::TimeZone;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn mock(name: &str, window: Option<(i64, i64)>) -> Mock {
        Mock {
            version: API_VERSION.to_string(),
            kind: Kind::Http,
            name: name.to_string(),
            spec: MockSpec {
                req_timestamp: window.map(|(r, _)| ts(r)),
                res_timestamp: window.map(|(_, r)| ts(r)),
                ..Default::default()
            },
        }
    }

    fn names(mocks: &[Mock]) -> Vec<&str> {
        mocks.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn windowing_keeps_inner_and_timestampless() {
        let store = MockStore::new();
        store.put(mock("A", Some((50, 60))));
        store.put(mock("B", Some((120, 180))));
        store.put(mock("C", Some((190, 250))));
        store.put(mock("D", None));

        let filtered = store.get_filtered(Some(ts(100)), Some(ts(200)));
        assert_eq!(names(&filtered), vec!["B", "D"]);

        let unfiltered = store.get_unfiltered(Some(ts(100)), Some(ts(200)));
        assert_eq!(names(&unfiltered), vec!["A", "C", "D"]);
    }

    #[test]
    fn window_bounds_are_strict() {
        let store = MockStore::new();
        store.put(mock("edge-left", Some((100, 150))));
        store.put(mock("edge-right", Some((150, 200))));
        store.put(mock("inside", Some((101, 199))));

        let filtered = store.get_filtered(Some(ts(100)), Some(ts(200)));
        assert_eq!(names(&filtered), vec!["inside"]);
    }

    #[test]
    fn missing_test_timestamps_return_everything_filtered() {
        let store = MockStore::new();
        store.put(mock("A", Some((50, 60))));
        store.put(mock("D", None));

        let filtered = store.get_filtered(None, Some(ts(10)));
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn config_mocks_stay_in_unfiltered_view() {
        let store = MockStore::new();
        let mut heartbeat = mock("hb", Some((120, 130)));
        heartbeat
            .spec
            .metadata
            .insert("type".to_string(), "config".to_string());
        store.put(heartbeat);

        // inside the window, but config traffic must remain reachable
        // from the unfiltered pool
        let unfiltered = store.get_unfiltered(Some(ts(100)), Some(ts(200)));
        assert_eq!(names(&unfiltered), vec!["hb"]);
    }

    #[test]
    fn registry_consumes_in_recording_order() {
        let registry = MockRegistry::new();
        registry.set(
            vec![mock("first", None), mock("second", None)],
            Vec::new(),
        );

        let got = registry.consume_filtered(|_| true).unwrap();
        assert_eq!(got.name, "first");
        assert_eq!(registry.filtered_len(), 1);

        let got = registry.consume_filtered(|_| true).unwrap();
        assert_eq!(got.name, "second");
        assert!(registry.consume_filtered(|_| true).is_none());
    }

    #[test]
    fn registry_unfiltered_lookup_does_not_consume() {
        let registry = MockRegistry::new();
        registry.set(Vec::new(), vec![mock("hb", None)]);

        assert!(registry.find_unfiltered(|m| m.name == "hb").is_some());
        assert!(registry.find_unfiltered(|m| m.name == "hb").is_some());
        assert_eq!(registry.unfiltered_len(), 1);
    }
}
