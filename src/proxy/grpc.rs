//! gRPC (HTTP/2) outgoing-call handler
//!
//! Works at the frame level: frames are forwarded verbatim while HEADERS and
//! DATA payloads are reassembled per stream into request/response units.
//! Each direction owns its HPACK decoder for the life of the connection;
//! the two are never shared and reset only when the connection closes.

use super::hpack::{encode_literal_block, HpackDecoder};
use super::ProtocolHandler;
use crate::error::{Result, RetraceError};
use crate::mocks::MockRegistry;
use crate::models::{GrpcMessage, Kind, Mock, MockSpec, OutgoingOptions, API_VERSION};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// HTTP/2 client connection preface
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(code: u8) -> Self {
        match code {
            0 => FrameType::Data,
            1 => FrameType::Headers,
            2 => FrameType::Priority,
            3 => FrameType::RstStream,
            4 => FrameType::Settings,
            5 => FrameType::PushPromise,
            6 => FrameType::Ping,
            7 => FrameType::GoAway,
            8 => FrameType::WindowUpdate,
            9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }
}

impl FrameType {
    fn code(self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::Headers => 1,
            FrameType::Priority => 2,
            FrameType::RstStream => 3,
            FrameType::Settings => 4,
            FrameType::PushPromise => 5,
            FrameType::Ping => 6,
            FrameType::GoAway => 7,
            FrameType::WindowUpdate => 8,
            FrameType::Continuation => 9,
            FrameType::Unknown(code) => code,
        }
    }
}

/// One HTTP/2 frame, payload included
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameType, flags: u8, stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            flags,
            stream_id,
            payload,
        }
    }

    pub fn end_stream(&self) -> bool {
        matches!(self.kind, FrameType::Data | FrameType::Headers)
            && self.flags & FLAG_END_STREAM != 0
    }

    pub fn end_headers(&self) -> bool {
        self.flags & FLAG_END_HEADERS != 0
    }

    /// HEADERS payload with padding and priority fields stripped
    pub fn header_fragment(&self) -> Result<&[u8]> {
        let mut start = 0;
        let mut end = self.payload.len();
        if self.kind == FrameType::Headers {
            if self.flags & FLAG_PADDED != 0 {
                let pad = *self.payload.first().ok_or_else(|| {
                    RetraceError::Protocol("padded HEADERS frame without pad length".to_string())
                })? as usize;
                start += 1;
                end = end.checked_sub(pad).ok_or_else(|| {
                    RetraceError::Protocol("HEADERS padding exceeds frame".to_string())
                })?;
            }
            if self.flags & FLAG_PRIORITY != 0 {
                start += 5;
            }
        }
        self.payload.get(start..end).ok_or_else(|| {
            RetraceError::Protocol("malformed HEADERS frame".to_string())
        })
    }

    /// DATA payload with padding stripped
    pub fn data_payload(&self) -> Result<&[u8]> {
        if self.kind == FrameType::Data && self.flags & FLAG_PADDED != 0 {
            let pad = *self.payload.first().ok_or_else(|| {
                RetraceError::Protocol("padded DATA frame without pad length".to_string())
            })? as usize;
            let end = self.payload.len().checked_sub(pad).ok_or_else(|| {
                RetraceError::Protocol("DATA padding exceeds frame".to_string())
            })?;
            return Ok(&self.payload[1..end]);
        }
        Ok(&self.payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(9 + len);
        out.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
        out.push(self.kind.code());
        out.push(self.flags);
        out.extend_from_slice(&(self.stream_id & 0x7fff_ffff).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Read one frame; `Ok(None)` on clean EOF at a frame boundary
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut header = [0u8; 9];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
    let kind = FrameType::from(header[3]);
    let flags = header[4];
    let stream_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame::new(kind, flags, stream_id, payload)))
}

fn is_client_stream(stream_id: u32) -> bool {
    stream_id != 0 && stream_id % 2 == 1
}

#[derive(Default)]
struct StreamState {
    req_headers: BTreeMap<String, String>,
    req_data: Vec<u8>,
    req_ts: Option<DateTime<Utc>>,
    req_fragment: Vec<u8>,
    res_headers: BTreeMap<String, String>,
    res_headers_done: bool,
    res_data: Vec<u8>,
    res_fragment: Vec<u8>,
    trailers: BTreeMap<String, String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Request,
    Response,
}

/// Records and replays gRPC calls over HTTP/2
pub struct GrpcHandler;

impl GrpcHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GrpcHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolHandler for GrpcHandler {
    fn name(&self) -> &'static str {
        "grpc"
    }

    fn match_type(&self, prefix: &[u8]) -> bool {
        !prefix.is_empty() && (prefix.starts_with(PREFACE) || PREFACE.starts_with(prefix))
    }

    async fn record_outgoing(
        &self,
        cancel: &CancellationToken,
        mut client: TcpStream,
        mut upstream: TcpStream,
        mocks: mpsc::Sender<Mock>,
        _opts: &OutgoingOptions,
    ) -> Result<()> {
        let mut preface = [0u8; 24];
        client.read_exact(&mut preface).await?;
        if &preface != PREFACE {
            return Err(RetraceError::Protocol(
                "connection does not start with the HTTP/2 preface".to_string(),
            ));
        }
        upstream.write_all(&preface).await?;

        let streams: Arc<Mutex<HashMap<u32, StreamState>>> = Arc::new(Mutex::new(HashMap::new()));
        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let request_side = transfer_frames(
            client_read,
            upstream_write,
            Direction::Request,
            streams.clone(),
            mocks.clone(),
            cancel.clone(),
        );
        let response_side = transfer_frames(
            upstream_read,
            client_write,
            Direction::Response,
            streams,
            mocks,
            cancel.clone(),
        );

        let (request_result, response_result) = tokio::join!(request_side, response_side);
        request_result.and(response_result)
    }

    async fn mock_outgoing(
        &self,
        cancel: &CancellationToken,
        mut client: TcpStream,
        _upstream_addr: Option<SocketAddr>,
        mocks: Arc<MockRegistry>,
        _opts: &OutgoingOptions,
    ) -> Result<()> {
        let mut preface = [0u8; 24];
        client.read_exact(&mut preface).await?;
        if &preface != PREFACE {
            return Err(RetraceError::Protocol(
                "connection does not start with the HTTP/2 preface".to_string(),
            ));
        }
        client
            .write_all(&Frame::new(FrameType::Settings, 0, 0, Vec::new()).encode())
            .await?;

        let mut decoder = HpackDecoder::new();
        let mut streams: HashMap<u32, StreamState> = HashMap::new();

        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut client) => match frame? {
                    Some(frame) => frame,
                    None => return Ok(()),
                },
                _ = cancel.cancelled() => return Ok(()),
            };

            match frame.kind {
                FrameType::Settings if frame.flags & FLAG_ACK == 0 => {
                    client
                        .write_all(
                            &Frame::new(FrameType::Settings, FLAG_ACK, 0, Vec::new()).encode(),
                        )
                        .await?;
                    continue;
                }
                FrameType::Ping if frame.flags & FLAG_ACK == 0 => {
                    client
                        .write_all(
                            &Frame::new(FrameType::Ping, FLAG_ACK, 0, frame.payload.clone())
                                .encode(),
                        )
                        .await?;
                    continue;
                }
                FrameType::GoAway => return Ok(()),
                FrameType::Headers | FrameType::Continuation => {
                    if !is_client_stream(frame.stream_id) {
                        continue;
                    }
                    let state = streams.entry(frame.stream_id).or_default();
                    state.req_fragment.extend_from_slice(frame.header_fragment()?);
                    if frame.end_headers() {
                        let fragment = std::mem::take(&mut state.req_fragment);
                        for (name, value) in decoder.decode(&fragment)? {
                            state.req_headers.insert(name, value);
                        }
                    }
                }
                FrameType::Data => {
                    if let Some(state) = streams.get_mut(&frame.stream_id) {
                        state.req_data.extend_from_slice(frame.data_payload()?);
                    }
                }
                _ => continue,
            }

            if frame.end_stream() {
                let state = streams.remove(&frame.stream_id).unwrap_or_default();
                self.answer_stream(&mut client, frame.stream_id, state, &mocks)
                    .await?;
            }
        }
    }
}

impl GrpcHandler {
    async fn answer_stream(
        &self,
        client: &mut TcpStream,
        stream_id: u32,
        state: StreamState,
        mocks: &MockRegistry,
    ) -> Result<()> {
        let path = state
            .req_headers
            .get(":path")
            .cloned()
            .unwrap_or_default();

        // exact call match first, then method path alone
        let matched = mocks
            .consume_filtered(|m| {
                m.kind == Kind::Grpc
                    && m.spec.grpc_req.as_ref().is_some_and(|r| {
                        r.headers.get(":path") == Some(&path) && r.data == state.req_data
                    })
            })
            .or_else(|| {
                mocks.consume_filtered(|m| {
                    m.kind == Kind::Grpc
                        && m.spec
                            .grpc_req
                            .as_ref()
                            .is_some_and(|r| r.headers.get(":path") == Some(&path))
                })
            });

        let mock = match matched {
            Some(mock) => mock,
            None => {
                warn!(%path, "no mock matched outgoing grpc call");
                return Err(RetraceError::MockMiss(format!("grpc {}", path)));
            }
        };
        let res = mock.spec.grpc_res.as_ref().ok_or_else(|| {
            RetraceError::Internal(format!("grpc mock {:?} has no response", mock.name))
        })?;

        // pseudo-headers sort before regular names in the BTreeMap, which
        // is exactly the order HTTP/2 requires on the wire
        let headers: Vec<(String, String)> = res
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        client
            .write_all(
                &Frame::new(
                    FrameType::Headers,
                    FLAG_END_HEADERS,
                    stream_id,
                    encode_literal_block(&headers),
                )
                .encode(),
            )
            .await?;

        if !res.data.is_empty() {
            client
                .write_all(&Frame::new(FrameType::Data, 0, stream_id, res.data.clone()).encode())
                .await?;
        }

        let trailers: Vec<(String, String)> = if res.trailers.is_empty() {
            vec![("grpc-status".to_string(), "0".to_string())]
        } else {
            res.trailers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        client
            .write_all(
                &Frame::new(
                    FrameType::Headers,
                    FLAG_END_HEADERS | FLAG_END_STREAM,
                    stream_id,
                    encode_literal_block(&trailers),
                )
                .encode(),
            )
            .await?;
        debug!(%path, stream_id, "served grpc call from mock");
        Ok(())
    }
}

/// Forward frames from `reader` to `writer`, folding HEADERS/DATA payloads
/// of client-initiated streams into the shared stream map. The decoder is
/// owned by this direction and lives for the whole connection.
async fn transfer_frames<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    streams: Arc<Mutex<HashMap<u32, StreamState>>>,
    mocks: mpsc::Sender<Mock>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = HpackDecoder::new();
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => match frame? {
                Some(frame) => frame,
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        };

        if is_client_stream(frame.stream_id) {
            if let Err(e) =
                fold_frame(&frame, direction, &mut decoder, &streams, &mocks).await
            {
                warn!(stream_id = frame.stream_id, "failed to reassemble grpc frame: {}", e);
            }
        }

        writer.write_all(&frame.encode()).await?;
    }
}

async fn fold_frame(
    frame: &Frame,
    direction: Direction,
    decoder: &mut HpackDecoder,
    streams: &Mutex<HashMap<u32, StreamState>>,
    mocks: &mpsc::Sender<Mock>,
) -> Result<()> {
    if !matches!(
        frame.kind,
        FrameType::Headers | FrameType::Continuation | FrameType::Data
    ) {
        return Ok(());
    }

    let mut streams = streams.lock().await;
    let state = streams.entry(frame.stream_id).or_default();

    match (frame.kind, direction) {
        (FrameType::Headers | FrameType::Continuation, Direction::Request) => {
            state.req_ts.get_or_insert_with(Utc::now);
            state.req_fragment.extend_from_slice(frame.header_fragment()?);
            if frame.end_headers() {
                let fragment = std::mem::take(&mut state.req_fragment);
                for (name, value) in decoder.decode(&fragment)? {
                    state.req_headers.insert(name, value);
                }
            }
        }
        (FrameType::Data, Direction::Request) => {
            state.req_ts.get_or_insert_with(Utc::now);
            state.req_data.extend_from_slice(frame.data_payload()?);
        }
        (FrameType::Headers | FrameType::Continuation, Direction::Response) => {
            state.res_fragment.extend_from_slice(frame.header_fragment()?);
            if frame.end_headers() {
                let fragment = std::mem::take(&mut state.res_fragment);
                let decoded = decoder.decode(&fragment)?;
                if state.res_headers_done {
                    state.trailers.extend(decoded);
                } else {
                    state.res_headers.extend(decoded);
                    state.res_headers_done = true;
                }
            }
        }
        (FrameType::Data, Direction::Response) => {
            state.res_data.extend_from_slice(frame.data_payload()?);
        }
        _ => {}
    }

    // a response END_STREAM finishes the exchange for this stream
    if direction == Direction::Response && frame.end_stream() {
        let state = streams.remove(&frame.stream_id).unwrap_or_default();
        let mock = Mock {
            version: API_VERSION.to_string(),
            kind: Kind::Grpc,
            name: "mocks".to_string(),
            spec: MockSpec {
                grpc_req: Some(GrpcMessage {
                    headers: state.req_headers,
                    data: state.req_data,
                    trailers: BTreeMap::new(),
                }),
                grpc_res: Some(GrpcMessage {
                    headers: state.res_headers,
                    data: state.res_data,
                    trailers: state.trailers,
                }),
                created: Utc::now().timestamp(),
                req_timestamp: state.req_ts,
                res_timestamp: Some(Utc::now()),
                ..Default::default()
            },
        };
        if mocks.send(mock).await.is_err() {
            debug!("mock receiver dropped while recording grpc stream");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn request_block(path: &str) -> Vec<u8> {
        encode_literal_block(&[
            (":method".to_string(), "POST".to_string()),
            (":scheme".to_string(), "http".to_string()),
            (":path".to_string(), path.to_string()),
            ("content-type".to_string(), "application/grpc".to_string()),
        ])
    }

    #[test]
    fn match_type_recognizes_preface() {
        let handler = GrpcHandler::new();
        assert!(handler.match_type(PREFACE));
        assert!(handler.match_type(&PREFACE[..10])); // short peek window
        assert!(!handler.match_type(b"GET / HTTP/1.1\r\n"));
        assert!(!handler.match_type(b""));
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let frame = Frame::new(FrameType::Data, FLAG_END_STREAM, 7, b"payload".to_vec());
        let encoded = frame.encode();

        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.kind, FrameType::Data);
        assert_eq!(decoded.flags, FLAG_END_STREAM);
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.payload, b"payload");
        assert!(decoded.end_stream());
    }

    #[tokio::test]
    async fn eof_at_boundary_is_clean() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn padded_headers_fragment_is_stripped() {
        // pad length 2, block "ab", padding "xx"
        let mut payload = vec![2u8];
        payload.extend_from_slice(b"ab");
        payload.extend_from_slice(b"xx");
        let frame = Frame::new(FrameType::Headers, FLAG_PADDED, 1, payload);
        assert_eq!(frame.header_fragment().unwrap(), b"ab");
    }

    #[test]
    fn priority_headers_fragment_is_stripped() {
        let mut payload = vec![0u8; 5];
        payload.extend_from_slice(b"block");
        let frame = Frame::new(FrameType::Headers, FLAG_PRIORITY, 1, payload);
        assert_eq!(frame.header_fragment().unwrap(), b"block");
    }

    #[tokio::test]
    async fn record_reassembles_one_call() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        // scripted upstream: consume everything, answer stream 1
        tokio::spawn(async move {
            let (mut conn, _) = upstream_listener.accept().await.unwrap();
            let mut preface = [0u8; 24];
            conn.read_exact(&mut preface).await.unwrap();
            // request HEADERS + DATA
            let _ = read_frame(&mut conn).await.unwrap().unwrap();
            let _ = read_frame(&mut conn).await.unwrap().unwrap();

            let res_headers = encode_literal_block(&[
                (":status".to_string(), "200".to_string()),
                ("content-type".to_string(), "application/grpc".to_string()),
            ]);
            conn.write_all(
                &Frame::new(FrameType::Headers, FLAG_END_HEADERS, 1, res_headers).encode(),
            )
            .await
            .unwrap();
            conn.write_all(&Frame::new(FrameType::Data, 0, 1, b"\x00\x00\x00\x00\x02ok".to_vec()).encode())
                .await
                .unwrap();
            let trailers = encode_literal_block(&[("grpc-status".to_string(), "0".to_string())]);
            conn.write_all(
                &Frame::new(
                    FrameType::Headers,
                    FLAG_END_HEADERS | FLAG_END_STREAM,
                    1,
                    trailers,
                )
                .encode(),
            )
            .await
            .unwrap();
        });

        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        let (mock_tx, mut mock_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handler_task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let (client_side, _) = proxy_listener.accept().await.unwrap();
                let upstream = TcpStream::connect(upstream_addr).await.unwrap();
                GrpcHandler::new()
                    .record_outgoing(
                        &cancel,
                        client_side,
                        upstream,
                        mock_tx,
                        &OutgoingOptions::default(),
                    )
                    .await
            }
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(PREFACE).await.unwrap();
        client
            .write_all(
                &Frame::new(
                    FrameType::Headers,
                    FLAG_END_HEADERS,
                    1,
                    request_block("/svc.Users/Get"),
                )
                .encode(),
            )
            .await
            .unwrap();
        client
            .write_all(
                &Frame::new(
                    FrameType::Data,
                    FLAG_END_STREAM,
                    1,
                    b"\x00\x00\x00\x00\x03abc".to_vec(),
                )
                .encode(),
            )
            .await
            .unwrap();

        let mock = mock_rx.recv().await.unwrap();
        assert_eq!(mock.kind, Kind::Grpc);
        let req = mock.spec.grpc_req.unwrap();
        assert_eq!(req.headers.get(":path").unwrap(), "/svc.Users/Get");
        assert_eq!(req.data, b"\x00\x00\x00\x00\x03abc");
        let res = mock.spec.grpc_res.unwrap();
        assert_eq!(res.headers.get(":status").unwrap(), "200");
        assert_eq!(res.trailers.get("grpc-status").unwrap(), "0");
        assert!(mock.spec.req_timestamp.is_some());

        // client sees the forwarded response frames
        let mut headers_seen = false;
        let mut end_stream_seen = false;
        while let Some(frame) = read_frame(&mut client).await.unwrap() {
            match frame.kind {
                FrameType::Headers => {
                    headers_seen = true;
                    if frame.end_stream() {
                        end_stream_seen = true;
                        break;
                    }
                }
                _ => {}
            }
        }
        assert!(headers_seen && end_stream_seen);

        drop(client);
        handler_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mock_answers_from_registry() {
        let registry = Arc::new(MockRegistry::new());
        registry.set(
            vec![Mock {
                version: API_VERSION.to_string(),
                kind: Kind::Grpc,
                name: "mocks".to_string(),
                spec: MockSpec {
                    grpc_req: Some(GrpcMessage {
                        headers: BTreeMap::from([(
                            ":path".to_string(),
                            "/svc.Users/Get".to_string(),
                        )]),
                        data: b"\x00\x00\x00\x00\x03abc".to_vec(),
                        trailers: BTreeMap::new(),
                    }),
                    grpc_res: Some(GrpcMessage {
                        headers: BTreeMap::from([
                            (":status".to_string(), "200".to_string()),
                            ("content-type".to_string(), "application/grpc".to_string()),
                        ]),
                        data: b"\x00\x00\x00\x00\x02ok".to_vec(),
                        trailers: BTreeMap::from([("grpc-status".to_string(), "0".to_string())]),
                    }),
                    ..Default::default()
                },
            }],
            Vec::new(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handler_task = tokio::spawn({
            let cancel = cancel.clone();
            let registry = registry.clone();
            async move {
                let (client_side, _) = listener.accept().await.unwrap();
                GrpcHandler::new()
                    .mock_outgoing(
                        &cancel,
                        client_side,
                        None,
                        registry,
                        &OutgoingOptions::default(),
                    )
                    .await
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(PREFACE).await.unwrap();
        client
            .write_all(&Frame::new(FrameType::Settings, 0, 0, Vec::new()).encode())
            .await
            .unwrap();
        client
            .write_all(
                &Frame::new(
                    FrameType::Headers,
                    FLAG_END_HEADERS,
                    1,
                    request_block("/svc.Users/Get"),
                )
                .encode(),
            )
            .await
            .unwrap();
        client
            .write_all(
                &Frame::new(
                    FrameType::Data,
                    FLAG_END_STREAM,
                    1,
                    b"\x00\x00\x00\x00\x03abc".to_vec(),
                )
                .encode(),
            )
            .await
            .unwrap();

        let mut decoder = HpackDecoder::new();
        let mut data = Vec::new();
        let mut trailers = BTreeMap::new();
        loop {
            let frame = read_frame(&mut client).await.unwrap().unwrap();
            match frame.kind {
                FrameType::Data => data.extend_from_slice(frame.data_payload().unwrap()),
                FrameType::Headers => {
                    let decoded = decoder.decode(frame.header_fragment().unwrap()).unwrap();
                    if frame.end_stream() {
                        trailers.extend(decoded);
                        break;
                    }
                }
                _ => {}
            }
        }
        assert_eq!(data, b"\x00\x00\x00\x00\x02ok");
        assert_eq!(trailers.get("grpc-status").map(String::as_str), Some("0"));
        assert_eq!(registry.filtered_len(), 0);

        drop(client);
        handler_task.await.unwrap().unwrap();
    }
}
