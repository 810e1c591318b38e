// =============================================================================
// WebSocket-streaming LP adapter
// =============================================================================
//
// For providers that push quotes over a WebSocket (crypto exchanges). A
// reader task owns the socket, parses each frame into the unified `Quote`
// shape and forwards it to the merge channel. Transport loss triggers
// exponential-backoff reconnection until streaming is stopped.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::lp::adapter::{Backoff, LpAdapter};
use crate::market_data::Quote;

pub struct WsStreamAdapter {
    lp_id: String,
    url: String,
    quotes: mpsc::Sender<Quote>,
    clock: Arc<Clock>,
    connected: Arc<AtomicBool>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl WsStreamAdapter {
    pub fn new(
        lp_id: impl Into<String>,
        url: impl Into<String>,
        quotes: mpsc::Sender<Quote>,
        clock: Arc<Clock>,
    ) -> Self {
        Self {
            lp_id: lp_id.into(),
            url: url.into(),
            quotes,
            clock,
            connected: Arc::new(AtomicBool::new(false)),
            stop_tx: Mutex::new(None),
        }
    }

    /// Parse one text frame: `{symbol, bid, ask, ts?}`.
    fn parse_frame(lp_id: &str, text: &str, now: i64) -> Result<Quote> {
        let root: serde_json::Value =
            serde_json::from_str(text).context("failed to parse quote frame")?;
        let symbol = root
            .get("symbol")
            .and_then(|v| v.as_str())
            .context("missing field symbol")?
            .to_uppercase();
        let bid = root
            .get("bid")
            .and_then(|v| v.as_f64())
            .context("missing field bid")?;
        let ask = root
            .get("ask")
            .and_then(|v| v.as_f64())
            .context("missing field ask")?;
        let ts = root.get("ts").and_then(|v| v.as_i64()).unwrap_or(now);
        Ok(Quote {
            lp_id: lp_id.to_string(),
            symbol,
            bid,
            ask,
            timestamp_ms: ts,
        })
    }

    /// One connection lifetime: subscribe, then read until the stream ends.
    async fn run_stream(
        lp_id: &str,
        url: &str,
        symbols: &[String],
        quotes: &mpsc::Sender<Quote>,
        clock: &Clock,
        connected: &AtomicBool,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        info!(lp = %lp_id, url = %url, "connecting quote WebSocket");
        let (ws_stream, _response) = connect_async(url)
            .await
            .context("failed to connect quote WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::json!({
            "op": "subscribe",
            "symbols": symbols,
        });
        write
            .send(tokio_tungstenite::tungstenite::Message::Text(
                subscribe.to_string(),
            ))
            .await
            .context("failed to send subscribe frame")?;

        connected.store(true, Ordering::SeqCst);
        info!(lp = %lp_id, count = symbols.len(), "quote WebSocket subscribed");

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                            match Self::parse_frame(lp_id, &text, clock.now_ms()) {
                                Ok(quote) => {
                                    debug!(lp = %lp_id, symbol = %quote.symbol, bid = quote.bid, "quote frame");
                                    if quotes.send(quote).await.is_err() {
                                        anyhow::bail!("merge channel closed");
                                    }
                                }
                                Err(e) => warn!(lp = %lp_id, error = %e, "unparseable quote frame"),
                            }
                        }
                        // tungstenite answers pings automatically.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            connected.store(false, Ordering::SeqCst);
                            return Err(e.into());
                        }
                        None => {
                            connected.store(false, Ordering::SeqCst);
                            warn!(lp = %lp_id, "quote WebSocket stream ended");
                            return Ok(());
                        }
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        connected.store(false, Ordering::SeqCst);
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl LpAdapter for WsStreamAdapter {
    fn lp_id(&self) -> &str {
        &self.lp_id
    }

    async fn connect(&self) -> CoreResult<()> {
        // The socket is owned by the streaming task; connect is a probe.
        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| CoreError::Upstream(format!("{}: connect failed: {e}", self.lp_id)))?;
        drop(ws);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(stop) = self.stop_tx.lock().take() {
            let _ = stop.send(true);
        }
        info!(lp = %self.lp_id, "ws adapter disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_streaming(&self, symbols: &[String]) -> CoreResult<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);

        let lp_id = self.lp_id.clone();
        let url = self.url.clone();
        let symbols = symbols.to_vec();
        let quotes = self.quotes.clone();
        let clock = self.clock.clone();
        let connected = self.connected.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::new();
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                match Self::run_stream(
                    &lp_id, &url, &symbols, &quotes, &clock, &connected, &mut stop_rx,
                )
                .await
                {
                    Ok(()) if *stop_rx.borrow() => break,
                    Ok(()) => {}
                    Err(e) => {
                        warn!(lp = %lp_id, error = %e, "quote stream error");
                    }
                }
                connected.store(false, Ordering::SeqCst);
                let delay = backoff.next_delay();
                debug!(lp = %lp_id, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
                tokio::time::sleep(delay).await;
            }
            info!(lp = %lp_id, "quote streaming stopped");
        });
        Ok(())
    }

    async fn stop_streaming(&self, _symbols: &[String]) -> CoreResult<()> {
        if let Some(stop) = self.stop_tx.lock().take() {
            let _ = stop.send(true);
        }
        Ok(())
    }
}

impl std::fmt::Debug for WsStreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsStreamAdapter")
            .field("lp_id", &self.lp_id)
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}
