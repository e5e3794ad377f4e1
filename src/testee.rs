//! Echo testees
//!
//! A minimal WebSocket implementation under test, built on the same session
//! engine: the server echoes every message, the client walks a fuzzing
//! server's case list through the administrative paths.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use url::Url;

use crate::compression::{AcceptRule, PerMessageDeflateOffer};
use crate::connection::Connection;
use crate::error::{CloseReason, Error, Result};
use crate::handshake::HandshakeRequest;
use crate::session::{self, SessionConfig, SessionHandler};

/// Echoes every message; accepts any permessage-deflate offer
#[derive(Debug, Default)]
pub struct EchoHandler {
    pub messages: usize,
}

impl SessionHandler for EchoHandler {
    fn on_request(&mut self, _request: &HandshakeRequest) -> Result<Vec<AcceptRule>> {
        Ok(vec![AcceptRule::default()])
    }

    fn deflate_offers(&self) -> Vec<PerMessageDeflateOffer> {
        vec![PerMessageDeflateOffer::default()]
    }

    fn on_open(&mut self, _conn: &mut dyn Connection) -> Result<()> {
        Ok(())
    }

    fn on_message(&mut self, conn: &mut dyn Connection, payload: Bytes, binary: bool) -> Result<()> {
        self.messages += 1;
        conn.send_message(&payload, binary)
    }
}

/// Echo every connection accepted on `listener` until `shutdown` fires
pub async fn run_testee_server(
    listener: TcpListener,
    config: SessionConfig,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    tracing::info!(addr = %listener.local_addr()?, agent = %config.agent, "testee server listening");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let config = config.clone();
                        tokio::spawn(async move {
                            let mut handler = EchoHandler::default();
                            if let Err(e) = session::serve(stream, config, &mut handler).await {
                                tracing::debug!(%peer, error = %e, "testee connection rejected");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
    Ok(())
}

/// Keeps the first text message a fuzzing server sends back
#[derive(Debug, Default)]
struct Capture {
    reply: Option<String>,
}

impl SessionHandler for Capture {
    fn on_open(&mut self, _conn: &mut dyn Connection) -> Result<()> {
        Ok(())
    }

    fn on_message(&mut self, conn: &mut dyn Connection, payload: Bytes, _binary: bool) -> Result<()> {
        if self.reply.is_none() {
            self.reply = Some(String::from_utf8_lossy(&payload).into_owned());
        }
        conn.send_close(Some(CloseReason::NORMAL), b"");
        Ok(())
    }
}

/// Drives a fuzzing server through its case list as one agent
#[derive(Debug, Clone)]
pub struct TesteeClient {
    base: Url,
    agent: String,
    config: SessionConfig,
}

impl TesteeClient {
    pub fn new(base: &str, agent: impl Into<String>, mut config: SessionConfig) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| Error::HandshakeFailed(format!("invalid server url '{}': {}", base, e)))?;
        let agent = agent.into();
        config.agent = agent.clone();
        Ok(Self { base, agent, config })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn request(&self, url: &Url) -> Result<Option<String>> {
        let mut capture = Capture::default();
        session::connect(url, self.config.clone(), &mut capture).await?;
        Ok(capture.reply)
    }

    pub async fn case_count(&self) -> Result<usize> {
        let reply = self.request(&self.url("/getCaseCount", &[])?).await?;
        reply
            .as_deref()
            .and_then(|r| r.trim().parse().ok())
            .ok_or_else(|| Error::Protocol("getCaseCount returned no count"))
    }

    /// Run case `index` (1-based) with echo semantics
    pub async fn run_case(&self, index: usize) -> Result<()> {
        let case = index.to_string();
        let url = self.url("/runCase", &[("case", case.as_str()), ("agent", self.agent.as_str())])?;
        let mut handler = EchoHandler::default();
        session::connect(&url, self.config.clone(), &mut handler).await
    }

    pub async fn update_reports(&self, shutdown: bool) -> Result<()> {
        let mut query = vec![("agent", self.agent.as_str())];
        if shutdown {
            query.push(("shutdownOnComplete", "true"));
        }
        self.request(&self.url("/updateReports", &query)?).await.map(drop)
    }

    /// Every case in order, then a report update
    pub async fn run_all(&self) -> Result<usize> {
        let count = self.case_count().await?;
        tracing::info!(agent = %self.agent, cases = count, "running cases");
        for index in 1..=count {
            tracing::debug!(case = index, "running case");
            if let Err(e) = self.run_case(index).await {
                tracing::warn!(case = index, error = %e, "case connection failed");
            }
        }
        self.update_reports(false).await?;
        Ok(count)
    }
}

/// Bind a testee server listener for `url`
pub async fn bind_testee(url: &str) -> Result<(TcpListener, SocketAddr)> {
    let (host, port) = crate::server::listen_addr(url)?;
    let listener = TcpListener::bind((host.as_str(), port)).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}
