//! Fuzzing server
//!
//! Accepts testee connections and runs one [`CaseRunner`] per connection.
//! The server stops on `/stopServer`, on `/updateReports` with
//! `shutdownOnComplete`, or when the process is interrupted.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use url::Url;

use crate::catalog::CaseCatalog;
use crate::error::{ConfigurationError, Error, Result};
use crate::handshake::{find_header_end, MAX_HANDSHAKE_SIZE};
use crate::report::SUMMARY_FILE;
use crate::runner::{CaseRunner, FuzzingContext};
use crate::session::{self, SessionConfig, DEFAULT_AGENT};
use crate::spec::{Mode, Spec};

/// Host and port a `ws://` URL listens on
pub(crate) fn listen_addr(raw: &str) -> Result<(String, u16)> {
    let url = Url::parse(raw).map_err(|e| {
        Error::from(ConfigurationError::InvalidValue {
            field: "url".into(),
            reason: e.to_string(),
        })
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| {
            Error::from(ConfigurationError::InvalidValue {
                field: "url".into(),
                reason: "URL has no host".into(),
            })
        })?
        .to_string();
    Ok((host, url.port_or_known_default().unwrap_or(80)))
}

/// A bound fuzzing server, ready to [`run`](FuzzingServer::run)
pub struct FuzzingServer {
    ctx: Arc<FuzzingContext>,
    config: SessionConfig,
    listener: TcpListener,
    web: Option<TcpListener>,
    shutdown_rx: broadcast::Receiver<()>,
    web_shutdown_rx: broadcast::Receiver<()>,
}

impl FuzzingServer {
    /// Resolve the spec and bind the listeners
    pub async fn bind(spec: &Spec, catalog: Arc<CaseCatalog>) -> Result<Self> {
        spec.check(Mode::FuzzingServer, &catalog)?;
        let ctx = FuzzingContext::from_spec(spec, Mode::FuzzingServer, catalog)?;
        let raw = spec
            .url
            .as_deref()
            .ok_or_else(|| Error::from(ConfigurationError::MissingField("url".into())))?;
        let (host, port) = listen_addr(raw)?;
        let listener = TcpListener::bind((host.as_str(), port)).await?;

        let web = match spec.webport {
            Some(port) if port > 0 => Some(TcpListener::bind((host.as_str(), port)).await?),
            _ => None,
        };

        tracing::info!(
            addr = %listener.local_addr()?,
            cases = ctx.cases.len(),
            outdir = %ctx.outdir.display(),
            "fuzzing server listening"
        );
        Ok(Self {
            config: SessionConfig::from_options(&ctx.options, DEFAULT_AGENT),
            shutdown_rx: ctx.shutdown.subscribe(),
            web_shutdown_rx: ctx.shutdown.subscribe(),
            ctx: Arc::new(ctx),
            listener,
            web,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn web_addr(&self) -> Option<SocketAddr> {
        self.web.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn context(&self) -> Arc<FuzzingContext> {
        self.ctx.clone()
    }

    /// Sender that stops the server
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.ctx.shutdown.clone()
    }

    /// Serve until shut down
    pub async fn run(self) -> Result<()> {
        let Self {
            ctx,
            config,
            listener,
            web,
            mut shutdown_rx,
            web_shutdown_rx,
        } = self;
        if let Some(web) = web {
            tokio::spawn(serve_reports(web, ctx.outdir.clone(), web_shutdown_rx));
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tokio::spawn(handle_connection(stream, peer, ctx.clone(), config.clone()));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }

        tracing::info!(agents = ctx.results.agents().len(), "fuzzing server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<FuzzingContext>,
    config: SessionConfig,
) {
    tracing::debug!(%peer, "connection accepted");
    let mut runner = CaseRunner::new(ctx);
    match session::serve(stream, config, &mut runner).await {
        Ok(()) => tracing::debug!(%peer, "connection closed"),
        Err(e) => tracing::debug!(%peer, error = %e, "connection rejected"),
    }
}

// ============================================================================
// Report web server
// ============================================================================

/// Map a request target onto a file under `root`
///
/// Only plain relative segments are accepted; `/` maps to the summary.
fn resolve_report_path(root: &Path, target: &str) -> Option<PathBuf> {
    let path = target.split(['?', '#']).next().unwrap_or("");
    let relative = path.trim_start_matches('/');
    if relative.is_empty() {
        return Some(root.join(SUMMARY_FILE));
    }
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(segment) => out.push(segment),
            _ => return None,
        }
    }
    Some(out)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("html") => "text/html; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn serve_reports(listener: TcpListener, root: PathBuf, mut shutdown_rx: broadcast::Receiver<()>) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, root = %root.display(), "serving reports");
    }
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => break,

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let root = root.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_report_file(stream, &root).await {
                                tracing::debug!(%peer, error = %e, "report request failed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "report accept failed"),
                }
            }
        }
    }
}

async fn serve_report_file(mut stream: TcpStream, root: &Path) -> Result<()> {
    let mut buf = BytesMut::with_capacity(1024);
    let end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HANDSHAKE_SIZE || stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::InvalidHttp("incomplete request".into()));
        }
    };
    let head = String::from_utf8_lossy(&buf[..end]);
    let mut parts = head.lines().next().unwrap_or("").split_whitespace();
    let (method, target) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));

    let (status, kind, body) = match (method, resolve_report_path(root, target)) {
        ("GET", Some(path)) => match tokio::fs::read(&path).await {
            Ok(body) => ("200 OK", content_type(&path), body),
            Err(_) => ("404 Not Found", "text/plain", b"not found".to_vec()),
        },
        ("GET", None) => ("403 Forbidden", "text/plain", b"forbidden".to_vec()),
        _ => ("405 Method Not Allowed", "text/plain", b"method not allowed".to_vec()),
    };
    let header = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        kind,
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr("ws://127.0.0.1:9001").unwrap(), ("127.0.0.1".into(), 9001));
        assert_eq!(listen_addr("ws://localhost").unwrap(), ("localhost".into(), 80));
        assert!(listen_addr("not a url").is_err());
    }

    #[test]
    fn test_report_paths_stay_under_root() {
        let root = Path::new("/reports");
        assert_eq!(resolve_report_path(root, "/"), Some(root.join(SUMMARY_FILE)));
        assert_eq!(
            resolve_report_path(root, "/index.json?x=1"),
            Some(root.join("index.json"))
        );
        assert_eq!(resolve_report_path(root, "/../etc/passwd"), None);
        assert_eq!(resolve_report_path(root, "/a/./b"), Some(root.join("a").join("b")));
    }

    #[tokio::test]
    async fn test_stop_via_shutdown_handle() {
        let spec = Spec::from_json(r#"{"url": "ws://127.0.0.1:0", "cases": ["1.1.1"]}"#).unwrap();
        let server = FuzzingServer::bind(&spec, Arc::new(CaseCatalog::standard().unwrap()))
            .await
            .unwrap();
        assert!(server.local_addr().unwrap().port() > 0);
        assert_eq!(server.context().cases.len(), 1);
        let stop = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_webport_serves_summary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SUMMARY_FILE), "Case | A\n").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(serve_reports(listener, dir.path().to_path_buf(), rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("Case | A\n"));
        let _ = tx.send(());
    }
}
