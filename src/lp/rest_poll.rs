// =============================================================================
// REST-polling LP adapter — HMAC-SHA256 signed requests
// =============================================================================
//
// For providers that expose quotes over plain HTTP (currency brokers). A
// polling task fetches the quote endpoint on an interval and pushes the
// parsed quotes onto the merge channel.
//
// SECURITY: the secret key is never logged or serialized; signed requests
// carry the API key as a header and an HMAC-SHA256 signature over the query.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::lp::adapter::{Backoff, LpAdapter};
use crate::market_data::Quote;

type HmacSha256 = Hmac<Sha256>;

pub struct RestPollAdapter {
    lp_id: String,
    base_url: String,
    api_key: String,
    secret: String,
    poll_interval: std::time::Duration,
    client: reqwest::Client,
    quotes: mpsc::Sender<Quote>,
    clock: Arc<Clock>,
    connected: AtomicBool,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl RestPollAdapter {
    pub fn new(
        lp_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        poll_interval: std::time::Duration,
        quotes: mpsc::Sender<Quote>,
        clock: Arc<Clock>,
    ) -> Self {
        let api_key = api_key.into();
        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", val);
        }
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            lp_id: lp_id.into(),
            base_url: base_url.into(),
            api_key,
            secret: secret.into(),
            poll_interval,
            client,
            quotes,
            clock,
            connected: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
        }
    }

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_url(&self, path: &str, params: &str) -> String {
        let ts = self.clock.now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let sig = self.sign(&base);
        format!("{}{path}?{base}&signature={sig}", self.base_url)
    }

    /// Parse the provider's quote payload: an array of
    /// `{symbol, bid, ask, ts?}`.
    fn parse_quotes(&self, body: &serde_json::Value) -> Vec<Quote> {
        let now = self.clock.now_ms();
        let Some(items) = body.as_array() else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let symbol = item.get("symbol")?.as_str()?.to_uppercase();
                let bid = item.get("bid")?.as_f64()?;
                let ask = item.get("ask")?.as_f64()?;
                let ts = item.get("ts").and_then(|v| v.as_i64()).unwrap_or(now);
                Some(Quote {
                    lp_id: self.lp_id.clone(),
                    symbol,
                    bid,
                    ask,
                    timestamp_ms: ts,
                })
            })
            .collect()
    }

    async fn poll_once(&self, symbols: &str) -> CoreResult<usize> {
        let url = self.signed_url("/api/quotes", &format!("symbols={symbols}"));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Upstream(format!("{}: {e}", self.lp_id)))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Upstream(format!("{}: bad quote payload: {e}", self.lp_id)))?;
        if !status.is_success() {
            return Err(CoreError::Upstream(format!(
                "{}: quote endpoint returned {status}",
                self.lp_id
            )));
        }

        let quotes = self.parse_quotes(&body);
        let count = quotes.len();
        for quote in quotes {
            if self.quotes.send(quote).await.is_err() {
                return Err(CoreError::Upstream("merge channel closed".into()));
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl LpAdapter for RestPollAdapter {
    fn lp_id(&self) -> &str {
        &self.lp_id
    }

    async fn connect(&self) -> CoreResult<()> {
        // A ping round-trip stands in for a persistent transport.
        let url = format!("{}/api/ping", self.base_url);
        self.client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Upstream(format!("{}: ping failed: {e}", self.lp_id)))?;
        self.connected.store(true, Ordering::SeqCst);
        info!(lp = %self.lp_id, "rest adapter connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(stop) = self.stop_tx.lock().take() {
            let _ = stop.send(true);
        }
        info!(lp = %self.lp_id, "rest adapter disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_streaming(&self, symbols: &[String]) -> CoreResult<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(stop_tx);

        let joined = symbols.join(",");
        let lp_id = self.lp_id.clone();
        let interval = self.poll_interval;

        // The polling loop borrows nothing: rebuild a lightweight handle.
        let this = RestPollAdapter {
            lp_id: self.lp_id.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            secret: self.secret.clone(),
            poll_interval: self.poll_interval,
            client: self.client.clone(),
            quotes: self.quotes.clone(),
            clock: self.clock.clone(),
            connected: AtomicBool::new(true),
            stop_tx: Mutex::new(None),
        };

        tokio::spawn(async move {
            let mut backoff = Backoff::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match this.poll_once(&joined).await {
                            Ok(count) => {
                                backoff.reset();
                                debug!(lp = %lp_id, count, "rest poll delivered quotes");
                            }
                            Err(e) => {
                                warn!(lp = %lp_id, error = %e, "rest poll failed, backing off");
                                tokio::time::sleep(backoff.next_delay()).await;
                            }
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(lp = %lp_id, "rest polling stopped");
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

impl std::fmt::Debug for RestPollAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestPollAdapter")
            .field("lp_id", &self.lp_id)
            .field("base_url", &self.base_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> (RestPollAdapter, mpsc::Receiver<Quote>) {
        let (tx, rx) = mpsc::channel(64);
        let a = RestPollAdapter::new(
            "rest-lp",
            "https://quotes.example.com",
            "key",
            "secret",
            std::time::Duration::from_millis(500),
            tx,
            Arc::new(Clock::new()),
        );
        (a, rx)
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let (a, _rx) = adapter();
        let s1 = a.sign("symbols=EURUSD&timestamp=1");
        let s2 = a.sign("symbols=EURUSD&timestamp=1");
        assert_eq!(s1, s2);
        assert_eq!(s1.len(), 64);
        assert!(s1.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(s1, a.sign("symbols=EURUSD&timestamp=2"));
    }

    #[test]
    fn parses_quote_array() {
        let (a, _rx) = adapter();
        let body = serde_json::json!([
            {"symbol": "eurusd", "bid": 1.1, "ask": 1.1002, "ts": 42},
            {"symbol": "GBPUSD", "bid": 1.25, "ask": 1.2502},
            {"symbol": "BAD"} // missing prices -> skipped
        ]);
        let quotes = a.parse_quotes(&body);
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].symbol, "EURUSD");
        assert_eq!(quotes[0].timestamp_ms, 42);
        assert_eq!(quotes[0].lp_id, "rest-lp");
        assert!(quotes[1].timestamp_ms > 0); // stamped with now
    }

    #[test]
    fn non_array_payload_yields_nothing() {
        let (a, _rx) = adapter();
        assert!(a.parse_quotes(&serde_json::json!({"error": "down"})).is_empty());
    }
}
