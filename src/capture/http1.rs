//! HTTP/1.x wire parsing for captured byte buffers
//!
//! Head parsing goes through `httparse`; body framing (Content-Length,
//! chunked transfer coding, bodyless statuses) is resolved by hand because
//! completeness has to be judged on partial buffers.

use crate::error::{Result, RetraceError};
use crate::models::{HttpReq, HttpResp};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

const MAX_HEADERS: usize = 64;

/// Completeness of a buffered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Start-line, headers and body all present; value is the total length
    Complete(usize),
    /// More bytes needed
    Partial,
    /// The buffer can never become a valid message
    Invalid,
}

/// How the message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(usize),
    Chunked,
    None,
}

fn framing_from_headers(headers: &[httparse::Header<'_>]) -> std::result::Result<BodyFraming, ()> {
    for h in headers {
        if h.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = std::str::from_utf8(h.value).map_err(|_| ())?;
            if value.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyFraming::Chunked);
            }
        }
    }
    for h in headers {
        if h.name.eq_ignore_ascii_case("content-length") {
            let value = std::str::from_utf8(h.value).map_err(|_| ())?;
            let len: usize = value.trim().parse().map_err(|_| ())?;
            return Ok(BodyFraming::Length(len));
        }
    }
    Ok(BodyFraming::None)
}

/// Whether a chunked body starting at `body` has seen its terminal chunk.
/// Returns the decoded-body byte count consumed from `body` on completion.
fn chunked_complete(body: &[u8]) -> ParseState {
    let mut pos = 0;
    loop {
        // chunk-size line
        let line_end = match find_crlf(&body[pos..]) {
            Some(i) => pos + i,
            None => return ParseState::Partial,
        };
        let size_str = match std::str::from_utf8(&body[pos..line_end]) {
            Ok(s) => s,
            Err(_) => return ParseState::Invalid,
        };
        // chunk extensions after ';' are ignored
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = match usize::from_str_radix(size_str, 16) {
            Ok(n) => n,
            Err(_) => return ParseState::Invalid,
        };
        pos = line_end + 2;

        if size == 0 {
            // trailer section: zero or more header lines, then a blank line
            loop {
                let line_end = match find_crlf(&body[pos..]) {
                    Some(i) => pos + i,
                    None => return ParseState::Partial,
                };
                let empty = line_end == pos;
                pos = line_end + 2;
                if empty {
                    return ParseState::Complete(pos);
                }
            }
        }

        if body.len() < pos + size + 2 {
            return ParseState::Partial;
        }
        if &body[pos + size..pos + size + 2] != b"\r\n" {
            return ParseState::Invalid;
        }
        pos += size + 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decode a complete chunked body into its payload bytes
fn decode_chunked(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let rest = body
            .get(pos..)
            .ok_or_else(|| RetraceError::HttpParse("truncated chunk body".to_string()))?;
        let line_end = find_crlf(rest)
            .map(|i| pos + i)
            .ok_or_else(|| RetraceError::HttpParse("truncated chunk size".to_string()))?;
        let size_str = std::str::from_utf8(&body[pos..line_end])
            .map_err(|_| RetraceError::HttpParse("non-utf8 chunk size".to_string()))?;
        let size_str = size_str.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| RetraceError::HttpParse(format!("bad chunk size {:?}", size_str)))?;
        pos = line_end + 2;
        if size == 0 {
            return Ok(out);
        }
        if body.len() < pos + size {
            return Err(RetraceError::HttpParse("truncated chunk data".to_string()));
        }
        out.extend_from_slice(&body[pos..pos + size]);
        pos += size + 2;
    }
}

/// A response to these cannot carry a body regardless of headers
fn bodyless_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

/// Judge completeness of a buffered request
pub fn request_complete(buf: &[u8]) -> ParseState {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return ParseState::Partial,
        Err(_) => return ParseState::Invalid,
    };
    let framing = match framing_from_headers(req.headers) {
        Ok(f) => f,
        Err(()) => return ParseState::Invalid,
    };
    match framing {
        BodyFraming::None => ParseState::Complete(header_len),
        BodyFraming::Length(len) => {
            if buf.len() >= header_len + len {
                ParseState::Complete(header_len + len)
            } else {
                ParseState::Partial
            }
        }
        BodyFraming::Chunked => match chunked_complete(&buf[header_len..]) {
            ParseState::Complete(n) => ParseState::Complete(header_len + n),
            other => other,
        },
    }
}

/// Judge completeness of a buffered response.
///
/// `req_method` decides HEAD semantics: a HEAD response is complete at the
/// end of its header block whatever Content-Length advertises.
pub fn response_complete(buf: &[u8], req_method: Option<&str>) -> ParseState {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let header_len = match resp.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return ParseState::Partial,
        Err(_) => return ParseState::Invalid,
    };
    let status = resp.code.unwrap_or(0);
    if req_method.is_some_and(|m| m.eq_ignore_ascii_case("HEAD")) || bodyless_status(status) {
        return ParseState::Complete(header_len);
    }
    let framing = match framing_from_headers(resp.headers) {
        Ok(f) => f,
        Err(()) => return ParseState::Invalid,
    };
    match framing {
        BodyFraming::None => ParseState::Complete(header_len),
        BodyFraming::Length(len) => {
            if buf.len() >= header_len + len {
                ParseState::Complete(header_len + len)
            } else {
                ParseState::Partial
            }
        }
        BodyFraming::Chunked => match chunked_complete(&buf[header_len..]) {
            ParseState::Complete(n) => ParseState::Complete(header_len + n),
            other => other,
        },
    }
}

fn headers_to_map(headers: &[httparse::Header<'_>]) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for h in headers {
        let value = std::str::from_utf8(h.value)
            .map_err(|_| RetraceError::HttpParse(format!("non-utf8 value for header {}", h.name)))?;
        map.entry(h.name.to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    Ok(map)
}

fn body_from(buf: &[u8], header_len: usize, headers: &[httparse::Header<'_>]) -> Result<String> {
    let raw = &buf[header_len..];
    let framing = framing_from_headers(headers)
        .map_err(|()| RetraceError::HttpParse("unreadable framing headers".to_string()))?;
    let bytes = match framing {
        BodyFraming::None => Vec::new(),
        BodyFraming::Length(len) => raw
            .get(..len)
            .ok_or_else(|| RetraceError::HttpParse("body shorter than Content-Length".to_string()))?
            .to_vec(),
        BodyFraming::Chunked => decode_chunked(raw)?,
    };
    String::from_utf8(bytes)
        .map_err(|_| RetraceError::HttpParse("non-utf8 message body".to_string()))
}

/// Parse a complete request buffer into the document model
pub fn parse_request(buf: &[u8], ts: Option<DateTime<Utc>>) -> Result<HttpReq> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(RetraceError::HttpParse("incomplete request head".to_string()))
        }
        Err(e) => return Err(RetraceError::HttpParse(e.to_string())),
    };

    let method = req
        .method
        .ok_or_else(|| RetraceError::HttpParse("request without method".to_string()))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| RetraceError::HttpParse("request without target".to_string()))?;
    let header = headers_to_map(req.headers)?;
    let host = header
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.clone())
        .unwrap_or_default();
    let url = format!("http://{}{}", host, target);

    let mut url_params = BTreeMap::new();
    if let Some(query) = target.split_once('?').map(|(_, q)| q) {
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            url_params.insert(k.into_owned(), v.into_owned());
        }
    }

    let body = body_from(buf, header_len, req.headers)?;

    Ok(HttpReq {
        method,
        proto_major: 1,
        proto_minor: req.version.unwrap_or(1),
        url,
        url_params,
        header,
        body,
        timestamp: ts,
    })
}

/// Parse a complete response buffer into the document model
pub fn parse_response(
    buf: &[u8],
    req_method: Option<&str>,
    ts: Option<DateTime<Utc>>,
) -> Result<HttpResp> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let header_len = match resp.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            return Err(RetraceError::HttpParse("incomplete response head".to_string()))
        }
        Err(e) => return Err(RetraceError::HttpParse(e.to_string())),
    };

    let status_code = resp
        .code
        .ok_or_else(|| RetraceError::HttpParse("response without status".to_string()))?;
    let header = headers_to_map(resp.headers)?;

    let skip_body =
        req_method.is_some_and(|m| m.eq_ignore_ascii_case("HEAD")) || bodyless_status(status_code);
    let body = if skip_body {
        String::new()
    } else {
        body_from(buf, header_len, resp.headers)?
    };

    Ok(HttpResp {
        status_code,
        header,
        body,
        status_message: resp.reason.map(|r| r.to_string()),
        proto_major: 1,
        proto_minor: resp.version.unwrap_or(1),
        timestamp: ts,
    })
}

/// Serialize a response model back onto the wire.
///
/// Transfer-Encoding from the recording is dropped; the body is re-framed
/// with an exact Content-Length so replayed bytes are always self-delimiting.
pub fn write_response(resp: &HttpResp) -> Vec<u8> {
    let reason = resp.status_message.clone().unwrap_or_else(|| {
        http::StatusCode::from_u16(resp.status_code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string()
    });
    let mut out = format!(
        "HTTP/{}.{} {} {}\r\n",
        resp.proto_major.max(1),
        resp.proto_minor,
        resp.status_code,
        reason
    )
    .into_bytes();
    for (name, value) in &resp.header {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", resp.body.len()).as_bytes());
    out.extend_from_slice(resp.body.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const GET: &[u8] = b"GET /hello?a=1 HTTP/1.1\r\nHost: x\r\n\r\n";
    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn get_without_body_is_complete() {
        assert_eq!(request_complete(GET), ParseState::Complete(GET.len()));
    }

    #[test]
    fn partial_head_is_partial() {
        assert_eq!(request_complete(b"GET /hello HT"), ParseState::Partial);
        assert_eq!(
            request_complete(b"GET /hello HTTP/1.1\r\nHost: x\r\n"),
            ParseState::Partial
        );
    }

    #[test]
    fn content_length_body_completion() {
        let partial = b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(request_complete(partial), ParseState::Partial);
        let full = b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(request_complete(full), ParseState::Complete(full.len()));
    }

    #[test]
    fn chunked_body_completion() {
        let partial = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n";
        assert_eq!(response_complete(partial, Some("GET")), ParseState::Partial);
        let full = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        assert_eq!(
            response_complete(full, Some("GET")),
            ParseState::Complete(full.len())
        );
    }

    #[test]
    fn head_response_ignores_content_length() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n";
        assert_eq!(
            response_complete(buf, Some("HEAD")),
            ParseState::Complete(buf.len())
        );
    }

    #[test]
    fn bodyless_statuses_complete_at_headers() {
        let no_content = b"HTTP/1.1 204 No Content\r\n\r\n";
        assert_eq!(
            response_complete(no_content, Some("GET")),
            ParseState::Complete(no_content.len())
        );
        let not_modified = b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n";
        assert_eq!(
            response_complete(not_modified, Some("GET")),
            ParseState::Complete(not_modified.len())
        );
    }

    #[test]
    fn garbage_is_invalid() {
        assert_eq!(request_complete(b"\x00\x01\x02garbage\r\n\r\n"), ParseState::Invalid);
    }

    #[test]
    fn parse_request_extracts_url_and_params() {
        let req = parse_request(GET, None).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "http://x/hello?a=1");
        assert_eq!(req.url_params.get("a").map(String::as_str), Some("1"));
        assert_eq!(req.body, "");
    }

    #[test]
    fn parse_response_extracts_body() {
        let resp = parse_response(OK, Some("GET"), None).unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, "hello");
        assert_eq!(resp.status_message.as_deref(), Some("OK"));
    }

    #[test]
    fn parse_chunked_response_decodes_body() {
        let buf =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n";
        let resp = parse_response(buf, Some("GET"), None).unwrap();
        assert_eq!(resp.body, "foobar");
    }

    #[test]
    fn duplicate_headers_are_joined() {
        let buf = b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 0\r\n\r\n";
        let resp = parse_response(buf, Some("GET"), None).unwrap();
        assert_eq!(resp.header.get("Set-Cookie").map(String::as_str), Some("a=1, b=2"));
    }

    #[test]
    fn write_response_reframes_with_content_length() {
        let resp = parse_response(OK, Some("GET"), None).unwrap();
        let wire = write_response(&resp);
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\nhello"));
    }
}
