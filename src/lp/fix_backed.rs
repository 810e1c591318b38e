// =============================================================================
// FIX-backed LP adapter — market data over the FIX 4.4 session
// =============================================================================
//
// The FIX session owns the transport; this adapter subscribes via
// MarketDataRequest (35=V) and translates MarketDataSnapshot (35=W) /
// IncrementalRefresh (35=X) into unified quotes. The session's application
// dispatcher feeds inbound messages to `handle_app_message`.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::fix::message::*;
use crate::fix::session::{AppMessage, ConnectionState, FixSessionHandle};
use crate::lp::adapter::LpAdapter;
use crate::market_data::Quote;

pub struct FixBackedAdapter {
    lp_id: String,
    session: FixSessionHandle,
    quotes: mpsc::Sender<Quote>,
    clock: Arc<Clock>,
}

impl FixBackedAdapter {
    pub fn new(
        lp_id: impl Into<String>,
        session: FixSessionHandle,
        quotes: mpsc::Sender<Quote>,
        clock: Arc<Clock>,
    ) -> Self {
        Self {
            lp_id: lp_id.into(),
            session,
            quotes,
            clock,
        }
    }

    /// Feed an inbound application message from the session dispatcher.
    pub fn handle_app_message(&self, msg: &AppMessage) {
        if !matches!(
            msg.msg_type,
            MsgType::MarketDataSnapshot | MsgType::MarketDataIncremental
        ) {
            return;
        }
        for quote in quotes_from_market_data(&self.lp_id, msg, self.clock.now_ms()) {
            if self.quotes.try_send(quote).is_err() {
                debug!(lp = %self.lp_id, "merge channel full, quote dropped");
            }
        }
    }
}

/// Extract `(symbol, bid, ask)` groups from a market data message. Entries
/// are `269=0` (bid) / `269=1` (offer) each followed by `270` (price);
/// `55` switches the current symbol.
pub fn quotes_from_market_data(lp_id: &str, msg: &AppMessage, now_ms: i64) -> Vec<Quote> {
    let mut out = Vec::new();
    let mut symbol: Option<String> = None;
    let mut bid: Option<f64> = None;
    let mut ask: Option<f64> = None;
    let mut entry_type: Option<&str> = None;

    let mut flush = |symbol: &Option<String>, bid: &mut Option<f64>, ask: &mut Option<f64>| {
        if let (Some(sym), Some(b), Some(a)) = (symbol.as_ref(), *bid, *ask) {
            out.push(Quote {
                lp_id: lp_id.to_string(),
                symbol: sym.clone(),
                bid: b,
                ask: a,
                timestamp_ms: now_ms,
            });
            *bid = None;
            *ask = None;
        }
    };

    for (tag, value) in &msg.fields {
        match *tag {
            TAG_SYMBOL => {
                flush(&symbol, &mut bid, &mut ask);
                symbol = Some(value.to_uppercase());
            }
            TAG_MD_ENTRY_TYPE => entry_type = Some(value.as_str()),
            TAG_MD_ENTRY_PX => {
                let Ok(px) = value.parse::<f64>() else { continue };
                match entry_type {
                    Some("0") => bid = Some(px),
                    Some("1") => ask = Some(px),
                    _ => {}
                }
                flush(&symbol, &mut bid, &mut ask);
            }
            _ => {}
        }
    }
    flush(&symbol, &mut bid, &mut ask);
    out
}

#[async_trait]
impl LpAdapter for FixBackedAdapter {
    fn lp_id(&self) -> &str {
        &self.lp_id
    }

    async fn connect(&self) -> CoreResult<()> {
        // The session task manages its own transport and reconnects.
        match self.session.state() {
            ConnectionState::LoggedIn => Ok(()),
            state => Err(CoreError::Upstream(format!(
                "{}: fix session not ready ({state})",
                self.lp_id
            ))),
        }
    }

    async fn disconnect(&self) {
        self.session.logout().await;
    }

    fn is_connected(&self) -> bool {
        self.session.state() == ConnectionState::LoggedIn
    }

    async fn start_streaming(&self, symbols: &[String]) -> CoreResult<()> {
        for symbol in symbols {
            let request = MessageBuilder::new(MsgType::MarketDataRequest)
                .field(TAG_MD_REQ_ID, format!("md-{}-{symbol}", self.lp_id))
                .field(TAG_SUBSCRIPTION_TYPE, 1) // snapshot + updates
                .field(TAG_MARKET_DEPTH, 0) // top of book
                .field(TAG_NO_MD_ENTRY_TYPES, 2)
                .field(TAG_MD_ENTRY_TYPE, 0)
                .field(TAG_MD_ENTRY_TYPE, 1)
                .field(TAG_NO_RELATED_SYM, 1)
                .field(TAG_SYMBOL, symbol);
            if !self
                .session
                .send_app(request, MsgType::MarketDataRequest)
                .await
            {
                warn!(lp = %self.lp_id, symbol = %symbol, "market data request not sent");
                return Err(CoreError::Upstream(format!(
                    "{}: session command channel closed",
                    self.lp_id
                )));
            }
        }
        Ok(())
    }

    async fn stop_streaming(&self, symbols: &[String]) -> CoreResult<()> {
        for symbol in symbols {
            let request = MessageBuilder::new(MsgType::MarketDataRequest)
                .field(TAG_MD_REQ_ID, format!("md-{}-{symbol}", self.lp_id))
                .field(TAG_SUBSCRIPTION_TYPE, 2) // disable previous snapshot
                .field(TAG_NO_RELATED_SYM, 1)
                .field(TAG_SYMBOL, symbol);
            let _ = self
                .session
                .send_app(request, MsgType::MarketDataRequest)
                .await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FixBackedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixBackedAdapter")
            .field("lp_id", &self.lp_id)
            .field("session", &self.session.session_id)
            .finish()
    }
}
