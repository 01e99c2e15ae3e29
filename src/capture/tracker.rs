//! Per-connection assembly buffer for one in-flight HTTP exchange

use super::http1::{self, ParseState};
use super::ConnId;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Assembles one HTTP request and one HTTP response from the two
/// directional byte streams observed on a single [`ConnId`].
#[derive(Debug)]
pub struct Tracker {
    conn_id: ConnId,
    request_buf: Vec<u8>,
    response_buf: Vec<u8>,
    first_req_ts: Option<DateTime<Utc>>,
    last_req_ts: Option<DateTime<Utc>>,
    first_res_ts: Option<DateTime<Utc>>,
    last_res_ts: Option<DateTime<Utc>>,
    last_activity: Instant,
    req_seen: bool,
    res_seen: bool,
}

impl Tracker {
    pub fn new(conn_id: ConnId) -> Self {
        Self {
            conn_id,
            request_buf: Vec::new(),
            response_buf: Vec::new(),
            first_req_ts: None,
            last_req_ts: None,
            first_res_ts: None,
            last_res_ts: None,
            last_activity: Instant::now(),
            req_seen: false,
            res_seen: false,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Accumulate request-direction bytes
    pub fn append_request_bytes(&mut self, bytes: &[u8], ts: DateTime<Utc>) {
        if !bytes.is_empty() {
            if !self.req_seen {
                self.first_req_ts = Some(ts);
                self.req_seen = true;
            }
            self.last_req_ts = Some(ts);
            self.request_buf.extend_from_slice(bytes);
        }
        self.last_activity = Instant::now();
    }

    /// Accumulate response-direction bytes
    pub fn append_response_bytes(&mut self, bytes: &[u8], ts: DateTime<Utc>) {
        if !bytes.is_empty() {
            if !self.res_seen {
                self.first_res_ts = Some(ts);
                self.res_seen = true;
            }
            self.last_res_ts = Some(ts);
            self.response_buf.extend_from_slice(bytes);
        }
        self.last_activity = Instant::now();
    }

    /// True only when the response buffer parses as a complete HTTP response
    /// and a matching complete request exists. Partial or malformed buffers
    /// leave the tracker live; the sweep handles discarding.
    pub fn is_complete(&self) -> bool {
        if self.request_buf.is_empty() || self.response_buf.is_empty() {
            return false;
        }
        let req_method = self.request_method();
        matches!(http1::request_complete(&self.request_buf), ParseState::Complete(_))
            && matches!(
                http1::response_complete(&self.response_buf, req_method.as_deref()),
                ParseState::Complete(_)
            )
    }

    /// True when either buffer has turned out to be unparseable; such a
    /// tracker can never complete and is discarded by the next sweep.
    pub fn is_malformed(&self) -> bool {
        let req_method = self.request_method();
        http1::request_complete(&self.request_buf) == ParseState::Invalid
            || http1::response_complete(&self.response_buf, req_method.as_deref())
                == ParseState::Invalid
    }

    pub fn is_inactive(&self, threshold: Duration) -> bool {
        self.last_activity.elapsed() > threshold
    }

    pub fn request_buf(&self) -> &[u8] {
        &self.request_buf
    }

    pub fn response_buf(&self) -> &[u8] {
        &self.response_buf
    }

    /// Timestamp of the first request byte
    pub fn request_timestamp(&self) -> Option<DateTime<Utc>> {
        self.first_req_ts
    }

    /// Timestamp of the last response byte
    pub fn response_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_res_ts
    }

    fn request_method(&self) -> Option<String> {
        let line_end = self
            .request_buf
            .windows(2)
            .position(|w| w == b"\r\n")?;
        let line = std::str::from_utf8(&self.request_buf[..line_end]).ok()?;
        line.split_whitespace().next().map(|m| m.to_string())
    }
}
