//! HTTP/1.x outgoing-call handler

use super::{read_message, ProtocolHandler};
use crate::capture::http1;
use crate::error::{Result, RetraceError};
use crate::mocks::MockRegistry;
use crate::models::{HttpReq, Kind, Mock, MockSpec, OutgoingOptions, API_VERSION};
use async_trait::async_trait;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const METHODS: [&str; 9] = [
    "GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH ", "TRACE ", "CONNECT ",
];

/// Records and replays plain HTTP/1.x dependency calls
pub struct HttpHandler;

impl HttpHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Path plus query of a recorded URL, host stripped: replayed dependencies
/// live at different addresses than they were recorded at.
fn path_and_query(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_string(),
        },
        Err(_) => url.to_string(),
    }
}

fn request_matches(mock_req: &HttpReq, req: &HttpReq, with_body: bool) -> bool {
    mock_req.method == req.method
        && path_and_query(&mock_req.url) == path_and_query(&req.url)
        && (!with_body || mock_req.body == req.body)
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    fn match_type(&self, prefix: &[u8]) -> bool {
        METHODS
            .iter()
            .any(|m| prefix.starts_with(m.as_bytes()))
    }

    async fn record_outgoing(
        &self,
        cancel: &CancellationToken,
        mut client: TcpStream,
        mut upstream: TcpStream,
        mocks: mpsc::Sender<Mock>,
        _opts: &OutgoingOptions,
    ) -> Result<()> {
        let mut client_carry = Vec::new();
        let mut upstream_carry = Vec::new();

        // keep-alive loop: one recorded mock per exchange
        loop {
            let req_buf = match read_message(
                &mut client,
                &mut client_carry,
                http1::request_complete,
                cancel,
            )
            .await?
            {
                Some(buf) => buf,
                None => return Ok(()),
            };
            let req_ts = Utc::now();
            upstream.write_all(&req_buf).await?;

            let req = http1::parse_request(&req_buf, Some(req_ts))?;
            let method = req.method.clone();
            let res_buf = read_message(
                &mut upstream,
                &mut upstream_carry,
                |b| http1::response_complete(b, Some(method.as_str())),
                cancel,
            )
            .await?
            .ok_or_else(|| {
                RetraceError::Protocol("upstream closed before responding".to_string())
            })?;
            client.write_all(&res_buf).await?;
            let res_ts = Utc::now();

            let res = http1::parse_response(&res_buf, Some(method.as_str()), Some(res_ts))?;
            debug!(method = %req.method, url = %req.url, status = res.status_code, "recorded outgoing http call");

            let mock = Mock {
                version: API_VERSION.to_string(),
                kind: Kind::Http,
                name: "mocks".to_string(),
                spec: MockSpec {
                    http_req: Some(req),
                    http_res: Some(res),
                    created: Utc::now().timestamp(),
                    req_timestamp: Some(req_ts),
                    res_timestamp: Some(res_ts),
                    ..Default::default()
                },
            };
            if mocks.send(mock).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn mock_outgoing(
        &self,
        cancel: &CancellationToken,
        mut client: TcpStream,
        _upstream_addr: Option<SocketAddr>,
        mocks: Arc<MockRegistry>,
        _opts: &OutgoingOptions,
    ) -> Result<()> {
        let mut carry = Vec::new();
        loop {
            let req_buf = match read_message(
                &mut client,
                &mut carry,
                http1::request_complete,
                cancel,
            )
            .await?
            {
                Some(buf) => buf,
                None => return Ok(()),
            };
            let req = http1::parse_request(&req_buf, None)?;

            // exact match first, then ignore the body
            let matched = mocks
                .consume_filtered(|m| {
                    m.kind == Kind::Http
                        && m.spec
                            .http_req
                            .as_ref()
                            .is_some_and(|mr| request_matches(mr, &req, true))
                })
                .or_else(|| {
                    mocks.consume_filtered(|m| {
                        m.kind == Kind::Http
                            && m.spec
                                .http_req
                                .as_ref()
                                .is_some_and(|mr| request_matches(mr, &req, false))
                    })
                });

            let mock = match matched {
                Some(mock) => mock,
                None => {
                    warn!(method = %req.method, url = %req.url, "no mock matched outgoing http call");
                    return Err(RetraceError::MockMiss(format!(
                        "{} {}",
                        req.method,
                        path_and_query(&req.url)
                    )));
                }
            };

            let res = mock.spec.http_res.as_ref().ok_or_else(|| {
                RetraceError::Internal(format!("http mock {:?} has no response", mock.name))
            })?;
            client.write_all(&http1::write_response(res)).await?;
            debug!(method = %req.method, url = %req.url, status = res.status_code, "served outgoing http call from mock");
        }
    }
}
