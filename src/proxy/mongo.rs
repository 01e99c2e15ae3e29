//! MongoDB wire-protocol outgoing-call handler
//!
//! Messages are relayed whole; each request/reply pair becomes one mock.
//! Driver heartbeats (`hello`/`isMaster`) are classified as config traffic:
//! recorded once per run with a `type=config` marker and served from the
//! unfiltered pool during replay regardless of the test-case window.

use super::ProtocolHandler;
use crate::error::{Result, RetraceError};
use crate::mocks::MockRegistry;
use crate::models::{
    Kind, Mock, MockSpec, MongoHeader, MongoMessage, OutgoingOptions, API_VERSION,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const OP_REPLY: i32 = 1;
const OP_QUERY: i32 = 2004;
const OP_MSG: i32 = 2013;

const HEADER_LEN: usize = 16;
const MAX_MESSAGE_LEN: usize = 48 * 1024 * 1024;

/// Patterns identifying driver heartbeat payloads
const HEARTBEAT_PATTERNS: [&[u8]; 3] = [b"hello", b"isMaster", b"ismaster"];

fn opcode_name(opcode: i32) -> &'static str {
    match opcode {
        OP_REPLY => "op_reply",
        OP_QUERY => "op_query",
        OP_MSG => "op_msg",
        _ => "op_unknown",
    }
}

fn is_heartbeat(msg: &MongoMessage) -> bool {
    if msg.header.opcode != OP_QUERY && msg.header.opcode != OP_MSG {
        return false;
    }
    HEARTBEAT_PATTERNS.iter().any(|pattern| {
        msg.payload
            .windows(pattern.len())
            .any(|window| window == *pattern)
    })
}

/// Read one wire message; `Ok(None)` on clean EOF before the first byte
async fn read_wire_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<MongoMessage>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = i32::from_le_bytes(len_bytes);
    if (length as usize) < HEADER_LEN || length as usize > MAX_MESSAGE_LEN {
        return Err(RetraceError::Protocol(format!(
            "implausible mongo message length {}",
            length
        )));
    }

    let mut rest = vec![0u8; length as usize - 4];
    reader.read_exact(&mut rest).await?;

    let header = MongoHeader {
        length,
        request_id: i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]),
        response_to: i32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]),
        opcode: i32::from_le_bytes([rest[8], rest[9], rest[10], rest[11]]),
    };
    Ok(Some(MongoMessage {
        header,
        payload: rest[12..].to_vec(),
    }))
}

/// Serialize a message back onto the wire, recomputing the length field
fn wire_bytes(msg: &MongoMessage) -> Vec<u8> {
    let length = (HEADER_LEN + msg.payload.len()) as i32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&msg.header.request_id.to_le_bytes());
    out.extend_from_slice(&msg.header.response_to.to_le_bytes());
    out.extend_from_slice(&msg.header.opcode.to_le_bytes());
    out.extend_from_slice(&msg.payload);
    out
}

/// Records and replays MongoDB dependency traffic
pub struct MongoHandler {
    /// Heartbeat payloads already recorded this run
    seen_heartbeats: Mutex<HashSet<Vec<u8>>>,
}

impl MongoHandler {
    pub fn new() -> Self {
        Self {
            seen_heartbeats: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for MongoHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolHandler for MongoHandler {
    fn name(&self) -> &'static str {
        "mongo"
    }

    /// A mongo wire message leads with its own length, little-endian
    fn match_type(&self, prefix: &[u8]) -> bool {
        if prefix.len() < 4 {
            return false;
        }
        let length = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        length as usize == prefix.len()
    }

    async fn record_outgoing(
        &self,
        cancel: &CancellationToken,
        mut client: TcpStream,
        mut upstream: TcpStream,
        mocks: mpsc::Sender<Mock>,
        _opts: &OutgoingOptions,
    ) -> Result<()> {
        loop {
            let request = tokio::select! {
                msg = read_wire_message(&mut client) => match msg? {
                    Some(msg) => msg,
                    None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            };
            let req_ts = Utc::now();
            upstream.write_all(&wire_bytes(&request)).await?;

            let response = read_wire_message(&mut upstream).await?.ok_or_else(|| {
                RetraceError::Protocol("mongo upstream closed before replying".to_string())
            })?;
            client.write_all(&wire_bytes(&response)).await?;
            let res_ts = Utc::now();

            let mut metadata = BTreeMap::from([(
                "operation".to_string(),
                opcode_name(request.header.opcode).to_string(),
            )]);

            if is_heartbeat(&request) {
                metadata.insert("type".to_string(), "config".to_string());
                // identical heartbeats repeat constantly; record the first only
                if !self
                    .seen_heartbeats
                    .lock()
                    .insert(request.payload.clone())
                {
                    debug!("skipping repeated mongo heartbeat");
                    continue;
                }
            }

            let mock = Mock {
                version: API_VERSION.to_string(),
                kind: Kind::Mongo,
                name: "mocks".to_string(),
                spec: MockSpec {
                    metadata,
                    mongo_requests: vec![request],
                    mongo_responses: vec![response],
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
        let mut reply_id: i32 = 1;
        loop {
            let request = tokio::select! {
                msg = read_wire_message(&mut client) => match msg? {
                    Some(msg) => msg,
                    None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            };

            let matched = if is_heartbeat(&request) {
                // config traffic answers from the unfiltered pool and stays
                // available for the next heartbeat
                mocks.find_unfiltered(|m| {
                    m.kind == Kind::Mongo
                        && m.is_config()
                        && m.spec
                            .mongo_requests
                            .first()
                            .is_some_and(|r| r.header.opcode == request.header.opcode)
                })
            } else {
                mocks
                    .consume_filtered(|m| {
                        m.kind == Kind::Mongo
                            && m.spec.mongo_requests.first().is_some_and(|r| {
                                r.header.opcode == request.header.opcode
                                    && r.payload == request.payload
                            })
                    })
                    .or_else(|| {
                        // same opcode in recording order when payloads differ
                        // (ephemeral ids inside the request body)
                        mocks.consume_filtered(|m| {
                            m.kind == Kind::Mongo
                                && m.spec
                                    .mongo_requests
                                    .first()
                                    .is_some_and(|r| r.header.opcode == request.header.opcode)
                        })
                    })
            };

            let mock = match matched {
                Some(mock) => mock,
                None => {
                    warn!(
                        opcode = request.header.opcode,
                        "no mock matched outgoing mongo call"
                    );
                    return Err(RetraceError::MockMiss(format!(
                        "mongo {}",
                        opcode_name(request.header.opcode)
                    )));
                }
            };

            let recorded = mock.spec.mongo_responses.first().ok_or_else(|| {
                RetraceError::Internal(format!("mongo mock {:?} has no response", mock.name))
            })?;

            // re-home the recorded reply onto the live request id
            let mut reply = recorded.clone();
            reply.header.request_id = reply_id;
            reply.header.response_to = request.header.request_id;
            reply_id += 1;

            client.write_all(&wire_bytes(&reply)).await?;
            debug!(
                opcode = request.header.opcode,
                "served mongo call from mock"
            );
        }
    }
}
