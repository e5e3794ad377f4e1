//! HTTP/1.1 upgrade handshake
//!
//! Just enough HTTP to open WebSocket connections in both roles: request and
//! response builders, parsers for the header block, `Sec-WebSocket-Accept`
//! computation and query-string access for the administrative paths.

use base64::prelude::*;
use sha1::{Digest, Sha1};
use url::Url;

use crate::error::{Error, Result};

/// GUID appended to the client key (RFC 6455 section 1.3)
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound for a handshake header block
pub const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

/// Compute `Sec-WebSocket-Accept` for a client key
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.trim().as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha.finalize())
}

/// Generate a random `Sec-WebSocket-Key`
pub fn generate_key() -> String {
    let mut raw = [0u8; 16];
    fastrand::fill(&mut raw);
    BASE64_STANDARD.encode(raw)
}

/// Position just past the `\r\n\r\n` that ends a header block
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_header_lines<'a>(
    mut lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHttp(format!("malformed header line '{}'", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn header_has_token(headers: &[(String, String)], name: &str, token: &str) -> bool {
    find_header(headers, name)
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

/// Parsed client opening handshake
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Path without the query string
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    /// Parse a complete header block
    pub fn parse(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| Error::InvalidHttp("request is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHttp("empty request".into()))?;

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        let target = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        if method != "GET" {
            return Err(Error::InvalidHttp(format!("method {} not allowed", method)));
        }
        if version != "HTTP/1.1" {
            return Err(Error::InvalidHttp(format!("unsupported version '{}'", version)));
        }

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (
                p.to_string(),
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect(),
            ),
            None => (target.to_string(), Vec::new()),
        };

        Ok(Self {
            path,
            query,
            headers: parse_header_lines(lines)?,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// First value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in offer order
    pub fn protocols(&self) -> Vec<&str> {
        self.header("Sec-WebSocket-Protocol")
            .map(|v| v.split(',').map(str::trim).filter(|p| !p.is_empty()).collect())
            .unwrap_or_default()
    }

    /// Validate the upgrade headers and return the client key
    pub fn websocket_key(&self) -> Result<&str> {
        if !header_has_token(&self.headers, "Upgrade", "websocket") {
            return Err(Error::HandshakeFailed("missing Upgrade: websocket".into()));
        }
        if !header_has_token(&self.headers, "Connection", "upgrade") {
            return Err(Error::HandshakeFailed("missing Connection: Upgrade".into()));
        }
        if self.header("Sec-WebSocket-Version") != Some("13") {
            return Err(Error::HandshakeFailed(
                "unsupported Sec-WebSocket-Version".into(),
            ));
        }
        self.header("Sec-WebSocket-Key")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::HandshakeFailed("missing Sec-WebSocket-Key".into()))
    }
}

/// Parsed server opening handshake response
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl HandshakeResponse {
    pub fn parse(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| Error::InvalidHttp("response is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHttp("empty response".into()))?;
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| Error::InvalidHttp(format!("bad status line '{}'", status_line)))?;
        Ok(Self {
            status,
            headers: parse_header_lines(lines)?,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Check the response upgrades the connection for `key`
    pub fn verify(&self, key: &str) -> Result<()> {
        if self.status != 101 {
            return Err(Error::HandshakeFailed(format!(
                "server answered HTTP {}",
                self.status
            )));
        }
        if !header_has_token(&self.headers, "Upgrade", "websocket") {
            return Err(Error::HandshakeFailed("missing Upgrade: websocket".into()));
        }
        match self.header("Sec-WebSocket-Accept") {
            Some(accept) if accept == accept_key(key) => Ok(()),
            Some(_) => Err(Error::HandshakeFailed(
                "Sec-WebSocket-Accept mismatch".into(),
            )),
            None => Err(Error::HandshakeFailed(
                "missing Sec-WebSocket-Accept".into(),
            )),
        }
    }

    /// Subprotocol the server selected; it must be one of `offered`
    pub fn protocol(&self, offered: &[String]) -> Result<Option<String>> {
        match self.header("Sec-WebSocket-Protocol") {
            None => Ok(None),
            Some(p) if offered.iter().any(|o| o == p) => Ok(Some(p.to_string())),
            Some(p) => Err(Error::HandshakeFailed(format!(
                "server selected subprotocol '{}' that was not offered",
                p
            ))),
        }
    }
}

/// Build the client handshake request for `url`
pub fn client_request(
    url: &Url,
    key: &str,
    extensions: Option<&str>,
    protocols: &[String],
    agent: &str,
) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidHttp(format!("url '{}' has no host", url)))?;
    let host_header = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let target = &url[url::Position::BeforePath..url::Position::AfterQuery];
    let target = if target.is_empty() { "/" } else { target };

    let mut req = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        target, host_header, agent, key
    );
    if let Some(ext) = extensions {
        req.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", ext));
    }
    if !protocols.is_empty() {
        req.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocols.join(", ")));
    }
    req.push_str("\r\n");
    Ok(req)
}

/// Build the `101 Switching Protocols` response
pub fn server_response(
    key: &str,
    extensions: Option<&str>,
    protocol: Option<&str>,
    agent: &str,
) -> String {
    let mut resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\nServer: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
        agent,
        accept_key(key)
    );
    if let Some(ext) = extensions {
        resp.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", ext));
    }
    if let Some(protocol) = protocol {
        resp.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }
    resp.push_str("\r\n");
    resp
}

/// Build a plain HTTP error response for rejected upgrades
pub fn error_response(status: u16, reason: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        reason.len(),
        reason
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generated_key_shape() {
        let key = generate_key();
        assert_eq!(key.len(), 24);
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
    }

    #[test]
    fn test_parse_request_with_query() {
        let raw = b"GET /runCase?case=3&agent=My%20Client HTTP/1.1\r\nHost: localhost:9001\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let end = find_header_end(raw).unwrap();
        assert_eq!(end, raw.len());

        let req = HandshakeRequest::parse(&raw[..end]).unwrap();
        assert_eq!(req.path, "/runCase");
        assert_eq!(req.query_param("case"), Some("3"));
        assert_eq!(req.query_param("agent"), Some("My Client"));
        assert_eq!(req.websocket_key().unwrap(), "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn test_request_missing_upgrade() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let req = HandshakeRequest::parse(raw).unwrap();
        assert!(matches!(req.websocket_key(), Err(Error::HandshakeFailed(_))));
        assert!(HandshakeRequest::parse(b"POST / HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn test_client_request_and_server_response_agree() {
        let url = Url::parse("ws://127.0.0.1:9001/runCase?case=1&agent=x").unwrap();
        let key = generate_key();
        let req = client_request(&url, &key, Some("permessage-deflate"), &[], "agent/1.0").unwrap();
        assert!(req.starts_with("GET /runCase?case=1&agent=x HTTP/1.1\r\n"));
        assert!(req.contains("Host: 127.0.0.1:9001\r\n"));

        let parsed = HandshakeRequest::parse(req.as_bytes()).unwrap();
        assert_eq!(parsed.header("sec-websocket-extensions"), Some("permessage-deflate"));

        let resp = server_response(parsed.websocket_key().unwrap(), None, None, "wstest/0.1");
        let parsed_resp = HandshakeResponse::parse(resp.as_bytes()).unwrap();
        assert_eq!(parsed_resp.header("Server"), Some("wstest/0.1"));
        parsed_resp.verify(&key).unwrap();
        assert!(parsed_resp.verify("other").is_err());
        assert_eq!(parsed_resp.protocol(&[]).unwrap(), None);
    }

    #[test]
    fn test_subprotocol_negotiation() {
        let url = Url::parse("ws://localhost:9090/").unwrap();
        let offered = vec!["wamp".to_string(), "chat".to_string()];
        let req = client_request(&url, "k", None, &offered, "agent/1.0").unwrap();
        let parsed = HandshakeRequest::parse(req.as_bytes()).unwrap();
        assert_eq!(parsed.protocols(), vec!["wamp", "chat"]);

        let resp = server_response("k", None, Some("wamp"), "wstest/0.1");
        let parsed_resp = HandshakeResponse::parse(resp.as_bytes()).unwrap();
        assert_eq!(parsed_resp.protocol(&offered).unwrap().as_deref(), Some("wamp"));
        assert!(matches!(
            parsed_resp.protocol(&["chat".to_string()]),
            Err(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_error_response_status() {
        let resp = error_response(404, "case 9 not found");
        let parsed = HandshakeResponse::parse(resp.as_bytes()).unwrap();
        assert_eq!(parsed.status, 404);
        assert!(parsed.verify("k").is_err());
    }
}
