// =============================================================================
// FIX 4.4 session — state machine, sequence integrity, gap recovery
// =============================================================================
//
// The protocol logic lives in a synchronous `SessionCore` that consumes
// parsed frames and timer polls and returns `Action`s (send bytes, deliver
// to the application, disconnect). Two tasks drive it per connection: a
// reader (socket -> parser -> core -> application) and a writer
// (application -> core -> socket). All sequence mutation happens inside the
// core under one lock, so `out_seq` is incremented-and-persisted before any
// byte leaves and `in_seq` is persisted after each accepted message.
//
//   DISCONNECTED -> CONNECTING -> LOGGING_IN -> LOGGED_IN -> LOGGING_OUT
//
// Gap recovery: a higher-than-expected MsgSeqNum starts a grace window;
// if the gap survives it, a ResendRequest(begin, end) goes out and later
// messages queue (bounded). Resent admin ranges arrive as SequenceReset
// gap fills. Once the gap closes, the queue drains in original order.
// Duplicate detection tracks the last 1000 delivered sequence numbers.
// =============================================================================

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::fix::message::*;
use crate::fix::store::SessionStore;

/// Bound on messages queued while a gap is being recovered.
const MAX_GAP_QUEUE: usize = 1024;
/// Delivered-sequence window for duplicate detection.
const DUP_WINDOW: usize = 1000;

// =============================================================================
// Config & state
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub heartbeat_s: u64,
    pub gap_grace_ms: u64,
    pub recovery_timeout_ms: u64,
    pub logon_timeout_ms: u64,
    pub message_ttl_days: u32,
}

impl SessionConfig {
    pub fn heartbeat_ms(&self) -> i64 {
        (self.heartbeat_s * 1000) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    LoggingIn,
    LoggedIn,
    LoggingOut,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::LoggingIn => "LOGGING_IN",
            Self::LoggedIn => "LOGGED_IN",
            Self::LoggingOut => "LOGGING_OUT",
        };
        write!(f, "{name}")
    }
}

/// An owned application-level message delivered past the read buffer.
#[derive(Debug, Clone)]
pub struct AppMessage {
    pub msg_type: MsgType,
    pub seq: u64,
    pub fields: Vec<(u32, String)>,
}

impl AppMessage {
    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_f64(&self, tag: u32) -> Option<f64> {
        self.get(tag)?.parse().ok()
    }
}

/// What the driving tasks should do next.
#[derive(Debug)]
pub enum Action {
    Send(Vec<u8>),
    Deliver(AppMessage),
    Disconnect(String),
}

struct GapState {
    begin: u64,
    end: u64,
    queued: BTreeMap<u64, AppMessage>,
    detected_at_ms: i64,
    resend_requested: bool,
}

// =============================================================================
// SessionCore
// =============================================================================

pub struct SessionCore {
    config: SessionConfig,
    store: SessionStore,
    state: ConnectionState,
    /// Last sent sequence number.
    out_seq: u64,
    /// Last accepted inbound sequence number.
    in_seq: u64,
    gap: Option<GapState>,
    delivered_recent: VecDeque<u64>,
    business_rejects_seen: HashSet<String>,
    last_sent_ms: i64,
    last_recv_ms: i64,
    logon_sent_at_ms: i64,
    last_purge_ms: i64,
    test_request_pending: bool,
}

impl SessionCore {
    pub fn new(config: SessionConfig, store: SessionStore) -> Self {
        let (out_seq, in_seq) = store.load_seqs();
        info!(
            session = %config.session_id,
            out_seq,
            in_seq,
            "fix session core initialised"
        );
        Self {
            config,
            store,
            state: ConnectionState::Disconnected,
            out_seq,
            in_seq,
            gap: None,
            delivered_recent: VecDeque::with_capacity(DUP_WINDOW),
            business_rejects_seen: HashSet::new(),
            last_sent_ms: 0,
            last_recv_ms: 0,
            logon_sent_at_ms: 0,
            last_purge_ms: 0,
            test_request_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn sequences(&self) -> (u64, u64) {
        (self.out_seq, self.in_seq)
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Allocate the next outbound sequence, persist it, build the bytes and
    /// (for application messages) retain them for resend.
    fn next_out(&mut self, builder: &MessageBuilder, msg_type: MsgType, now_ms: i64) -> Option<Vec<u8>> {
        let seq = self.out_seq + 1;
        if let Err(e) = self.store.save_seqs(seq, self.in_seq) {
            error!(session = %self.config.session_id, error = %e, "sequence persistence failed before send");
            return None;
        }
        self.out_seq = seq;

        let bytes = builder.build(
            seq,
            &self.config.sender_comp_id,
            &self.config.target_comp_id,
            &sending_time_now(),
        );
        if !msg_type.is_admin() {
            if let Err(e) = self.store.store_message(seq, &bytes) {
                warn!(seq, error = %e, "failed to retain sent message");
            }
        }
        self.last_sent_ms = now_ms;
        Some(bytes)
    }

    fn send(&mut self, builder: MessageBuilder, msg_type: MsgType, now_ms: i64, actions: &mut Vec<Action>) {
        match self.next_out(&builder, msg_type, now_ms) {
            Some(bytes) => actions.push(Action::Send(bytes)),
            None => actions.push(Action::Disconnect("sequence persistence failed".into())),
        }
    }

    /// Send an application message (NewOrderSingle etc.). Fails silently to
    /// the log when the session is not logged in.
    pub fn send_app(&mut self, builder: MessageBuilder, msg_type: MsgType, now_ms: i64) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != ConnectionState::LoggedIn {
            warn!(session = %self.config.session_id, state = %self.state, "dropping app message: not logged in");
            return actions;
        }
        self.send(builder, msg_type, now_ms, &mut actions);
        actions
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    pub fn on_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// TCP is up: send Logon and await the peer's.
    pub fn on_transport_up(&mut self, now_ms: i64) -> Vec<Action> {
        let mut actions = Vec::new();
        self.state = ConnectionState::LoggingIn;
        self.logon_sent_at_ms = now_ms;
        self.last_recv_ms = now_ms;
        let logon = MessageBuilder::new(MsgType::Logon)
            .field(TAG_ENCRYPT_METHOD, 0)
            .field(TAG_HEART_BT_INT, self.config.heartbeat_s);
        self.send(logon, MsgType::Logon, now_ms, &mut actions);
        info!(session = %self.config.session_id, "logon sent");
        actions
    }

    /// Operator- or peer-initiated logout.
    pub fn initiate_logout(&mut self, reason: &str, now_ms: i64) -> Vec<Action> {
        let mut actions = Vec::new();
        if matches!(self.state, ConnectionState::LoggedIn | ConnectionState::LoggingIn) {
            let logout = MessageBuilder::new(MsgType::Logout).field(TAG_TEXT, reason);
            self.send(logout, MsgType::Logout, now_ms, &mut actions);
            self.state = ConnectionState::LoggingOut;
        }
        actions
    }

    pub fn on_disconnect(&mut self) {
        info!(session = %self.config.session_id, "fix transport down");
        self.state = ConnectionState::Disconnected;
        self.gap = None;
        self.test_request_pending = false;
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// One complete frame off the wire. Checksum and parse failures are
    /// logged and dropped without advancing `in_seq`.
    pub fn on_frame(&mut self, frame: &[u8], now_ms: i64) -> Vec<Action> {
        match RawMessage::parse(frame) {
            Ok(msg) => self.on_message(&msg, now_ms),
            Err(e) => {
                warn!(session = %self.config.session_id, error = %e, "inbound frame dropped");
                Vec::new()
            }
        }
    }

    fn on_message(&mut self, msg: &RawMessage<'_>, now_ms: i64) -> Vec<Action> {
        let mut actions = Vec::new();
        self.last_recv_ms = now_ms;
        self.test_request_pending = false;

        let Some(msg_type) = msg.msg_type() else {
            self.session_reject(msg, "unknown MsgType", now_ms, &mut actions);
            return actions;
        };
        let Some(seq) = msg.seq_num() else {
            self.session_reject(msg, "missing MsgSeqNum", now_ms, &mut actions);
            return actions;
        };

        // SequenceReset bypasses normal ordering.
        if msg_type == MsgType::SequenceReset {
            let Some(new_seq) = msg.get_u64(TAG_NEW_SEQ_NO) else {
                self.session_reject(msg, "SequenceReset without NewSeqNo", now_ms, &mut actions);
                return actions;
            };
            if msg.get(TAG_GAP_FILL_FLAG) == Some("Y") {
                debug!(new_seq, "gap fill: advancing in_seq");
            } else {
                warn!(new_seq, "hard sequence reset from peer");
                self.gap = None;
            }
            self.in_seq = new_seq.saturating_sub(1);
            self.persist_in_seq();
            self.drain_gap_queue(now_ms, &mut actions);
            return actions;
        }

        let expected = self.in_seq + 1;
        if seq == expected {
            self.accept(msg_type, seq, msg, now_ms, &mut actions);
            self.drain_gap_queue(now_ms, &mut actions);
        } else if seq > expected {
            self.on_gap_detected(msg_type, seq, msg, now_ms, &mut actions);
        } else {
            // seq < expected
            if msg.poss_dup() {
                debug!(seq, expected, "duplicate (PossDup) discarded");
            } else {
                warn!(seq, expected, "MsgSeqNum too low, logging out");
                let logout =
                    MessageBuilder::new(MsgType::Logout).field(TAG_TEXT, "MsgSeqNum too low");
                self.send(logout, MsgType::Logout, now_ms, &mut actions);
                self.state = ConnectionState::LoggingOut;
                actions.push(Action::Disconnect("MsgSeqNum too low".into()));
            }
        }
        actions
    }

    fn persist_in_seq(&mut self) {
        if let Err(e) = self.store.save_seqs(self.out_seq, self.in_seq) {
            error!(session = %self.config.session_id, error = %e, "in_seq persistence failed");
        }
    }

    /// Handle an in-order message: advance `in_seq`, then act on the type.
    fn accept(
        &mut self,
        msg_type: MsgType,
        seq: u64,
        msg: &RawMessage<'_>,
        now_ms: i64,
        actions: &mut Vec<Action>,
    ) {
        self.in_seq = seq;
        self.persist_in_seq();

        // Duplicate suppression window.
        let duplicate = msg.poss_dup() && self.delivered_recent.contains(&seq);
        self.delivered_recent.push_back(seq);
        while self.delivered_recent.len() > DUP_WINDOW {
            self.delivered_recent.pop_front();
        }

        match msg_type {
            MsgType::Logon => {
                if self.state == ConnectionState::LoggingIn {
                    info!(session = %self.config.session_id, "logged in");
                    self.state = ConnectionState::LoggedIn;
                }
            }
            MsgType::Heartbeat => {}
            MsgType::TestRequest => {
                let mut reply = MessageBuilder::new(MsgType::Heartbeat);
                if let Some(id) = msg.get(TAG_TEST_REQ_ID) {
                    reply = reply.field(TAG_TEST_REQ_ID, id);
                }
                self.send(reply, MsgType::Heartbeat, now_ms, actions);
            }
            MsgType::ResendRequest => {
                let begin = msg.get_u64(TAG_BEGIN_SEQ_NO).unwrap_or(1);
                let end = msg.get_u64(TAG_END_SEQ_NO).unwrap_or(0);
                self.handle_resend_request(begin, end, now_ms, actions);
            }
            MsgType::Logout => {
                if self.state == ConnectionState::LoggingOut {
                    actions.push(Action::Disconnect("logout complete".into()));
                } else {
                    let reply = MessageBuilder::new(MsgType::Logout);
                    self.send(reply, MsgType::Logout, now_ms, actions);
                    self.state = ConnectionState::LoggingOut;
                    actions.push(Action::Disconnect("peer logout".into()));
                }
            }
            MsgType::SessionReject => {
                warn!(
                    session = %self.config.session_id,
                    ref_seq = ?msg.get(TAG_REF_SEQ_NUM),
                    text = ?msg.get(TAG_TEXT),
                    "session-level reject received"
                );
            }
            MsgType::BusinessReject => {
                // Repeated rejects for the same reference reach the
                // application only once.
                let key = msg
                    .get(TAG_CL_ORD_ID)
                    .or_else(|| msg.get(TAG_REF_SEQ_NUM))
                    .unwrap_or("?")
                    .to_string();
                warn!(reference = %key, text = ?msg.get(TAG_TEXT), "business reject");
                if self.business_rejects_seen.insert(key) && !duplicate {
                    actions.push(Action::Deliver(AppMessage {
                        msg_type,
                        seq,
                        fields: msg.to_owned_fields(),
                    }));
                }
            }
            // SequenceReset is handled before the ordering check.
            MsgType::SequenceReset => {}
            _ => {
                if duplicate {
                    debug!(seq, "duplicate application message suppressed");
                } else {
                    actions.push(Action::Deliver(AppMessage {
                        msg_type,
                        seq,
                        fields: msg.to_owned_fields(),
                    }));
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Gap recovery
    // -------------------------------------------------------------------------

    fn on_gap_detected(
        &mut self,
        msg_type: MsgType,
        seq: u64,
        msg: &RawMessage<'_>,
        now_ms: i64,
        actions: &mut Vec<Action>,
    ) {
        let expected = self.in_seq + 1;
        let gap = self.gap.get_or_insert_with(|| {
            warn!(expected, received = seq, "sequence gap detected");
            GapState {
                begin: expected,
                end: seq - 1,
                queued: BTreeMap::new(),
                detected_at_ms: now_ms,
                resend_requested: false,
            }
        });

        if gap.queued.len() >= MAX_GAP_QUEUE {
            error!("gap queue overflow, logging out");
            let logout =
                MessageBuilder::new(MsgType::Logout).field(TAG_TEXT, "gap queue overflow");
            self.send(logout, MsgType::Logout, now_ms, actions);
            self.state = ConnectionState::LoggingOut;
            actions.push(Action::Disconnect("gap queue overflow".into()));
            return;
        }

        self.gap.as_mut().unwrap().queued.insert(
            seq,
            AppMessage {
                msg_type,
                seq,
                fields: msg.to_owned_fields(),
            },
        );
    }

    /// Replay queued messages that became contiguous after a fill.
    fn drain_gap_queue(&mut self, now_ms: i64, actions: &mut Vec<Action>) {
        loop {
            let Some(gap) = self.gap.as_mut() else { return };
            let next = self.in_seq + 1;
            let Some(queued) = gap.queued.remove(&next) else {
                if self.in_seq > gap.end {
                    match gap.queued.keys().next().copied() {
                        None => {
                            info!(in_seq = self.in_seq, "gap recovery complete");
                            self.gap = None;
                        }
                        Some(lowest_queued) => {
                            // A second hole opened behind the queue; re-arm
                            // recovery for it.
                            gap.begin = next;
                            gap.end = lowest_queued - 1;
                            gap.detected_at_ms = now_ms;
                            gap.resend_requested = false;
                            warn!(begin = gap.begin, end = gap.end, "residual gap, re-arming recovery");
                        }
                    }
                }
                return;
            };

            self.in_seq = next;
            self.persist_in_seq();
            self.delivered_recent.push_back(next);
            while self.delivered_recent.len() > DUP_WINDOW {
                self.delivered_recent.pop_front();
            }
            if !queued.msg_type.is_admin() {
                actions.push(Action::Deliver(queued));
            }
        }
    }

    /// The peer asked us to resend `begin..=end`. Stored application
    /// messages go out again flagged PossDup; admin ranges (and anything no
    /// longer retained) are gap-filled with SequenceReset.
    fn handle_resend_request(&mut self, begin: u64, end: u64, now_ms: i64, actions: &mut Vec<Action>) {
        let end = if end == 0 { self.out_seq } else { end.min(self.out_seq) };
        info!(begin, end, "resend request received");

        let mut gap_fill_from: Option<u64> = None;
        for seq in begin..=end {
            match self.store.load_message(seq) {
                Some(bytes) => {
                    if let Some(from) = gap_fill_from.take() {
                        actions.push(Action::Send(self.gap_fill(from, seq)));
                    }
                    actions.push(Action::Send(mark_poss_dup(&bytes)));
                }
                None => {
                    gap_fill_from.get_or_insert(seq);
                }
            }
        }
        if let Some(from) = gap_fill_from {
            actions.push(Action::Send(self.gap_fill(from, end + 1)));
        }
        self.last_sent_ms = now_ms;
    }

    /// SequenceReset-GapFill covering `[from, to)`, i.e. NewSeqNo = `to`.
    fn gap_fill(&self, from: u64, to: u64) -> Vec<u8> {
        MessageBuilder::new(MsgType::SequenceReset)
            .field(TAG_POSS_DUP_FLAG, "Y")
            .field(TAG_GAP_FILL_FLAG, "Y")
            .field(TAG_NEW_SEQ_NO, to)
            .build(
                from,
                &self.config.sender_comp_id,
                &self.config.target_comp_id,
                &sending_time_now(),
            )
    }

    fn session_reject(
        &mut self,
        msg: &RawMessage<'_>,
        reason: &str,
        now_ms: i64,
        actions: &mut Vec<Action>,
    ) {
        warn!(reason, "rejecting malformed but parseable message");
        let mut reject = MessageBuilder::new(MsgType::SessionReject).field(TAG_TEXT, reason);
        if let Some(seq) = msg.seq_num() {
            reject = reject.field(TAG_REF_SEQ_NUM, seq);
        }
        self.send(reject, MsgType::SessionReject, now_ms, actions);
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    /// Drive heartbeats, gap grace/timeout, the logon timeout, and the
    /// hourly message-store TTL sweep.
    pub fn poll(&mut self, now_ms: i64) -> Vec<Action> {
        let mut actions = Vec::new();

        if now_ms - self.last_purge_ms >= 3_600_000 {
            self.last_purge_ms = now_ms;
            self.store.purge_expired(self.config.message_ttl_days);
        }

        // Gap grace: wait for out-of-order delivery before asking.
        if let Some(gap) = self.gap.as_mut() {
            if !gap.resend_requested && now_ms - gap.detected_at_ms >= self.config.gap_grace_ms as i64 {
                gap.resend_requested = true;
                let (begin, end) = (gap.begin, gap.end);
                info!(begin, end, "gap persisted past grace, requesting resend");
                let resend = MessageBuilder::new(MsgType::ResendRequest)
                    .field(TAG_BEGIN_SEQ_NO, begin)
                    .field(TAG_END_SEQ_NO, end);
                self.send(resend, MsgType::ResendRequest, now_ms, &mut actions);
            } else if now_ms - gap.detected_at_ms >= self.config.recovery_timeout_ms as i64 {
                warn!("gap recovery timed out, logging out");
                let logout = MessageBuilder::new(MsgType::Logout)
                    .field(TAG_TEXT, "gap recovery timeout");
                self.send(logout, MsgType::Logout, now_ms, &mut actions);
                self.state = ConnectionState::LoggingOut;
                actions.push(Action::Disconnect("gap recovery timeout".into()));
                return actions;
            }
        }

        match self.state {
            ConnectionState::LoggingIn => {
                if now_ms - self.logon_sent_at_ms >= self.config.logon_timeout_ms as i64 {
                    actions.push(Action::Disconnect("logon timeout".into()));
                }
            }
            ConnectionState::LoggedIn => {
                let hb = self.config.heartbeat_ms();
                let grace = hb / 5;
                if now_ms - self.last_sent_ms >= hb {
                    let beat = MessageBuilder::new(MsgType::Heartbeat);
                    self.send(beat, MsgType::Heartbeat, now_ms, &mut actions);
                }
                let silent = now_ms - self.last_recv_ms;
                if silent >= 2 * hb + grace {
                    actions.push(Action::Disconnect("heartbeat timeout".into()));
                } else if silent >= hb + grace && !self.test_request_pending {
                    self.test_request_pending = true;
                    let req = MessageBuilder::new(MsgType::TestRequest)
                        .field(TAG_TEST_REQ_ID, now_ms);
                    self.send(req, MsgType::TestRequest, now_ms, &mut actions);
                }
            }
            _ => {}
        }
        actions
    }
}

/// Re-stamp a retained message with `PossDupFlag=Y`, recomputing body
/// length and checksum.
fn mark_poss_dup(original: &[u8]) -> Vec<u8> {
    let Ok(msg) = RawMessage::parse(original) else {
        return original.to_vec();
    };
    let mut body = Vec::with_capacity(original.len() + 8);
    let mut poss_dup_written = false;
    for (tag, value) in msg.fields() {
        match *tag {
            TAG_BEGIN_STRING | TAG_BODY_LENGTH | TAG_CHECKSUM => continue,
            TAG_POSS_DUP_FLAG => {
                push_field_raw(&mut body, TAG_POSS_DUP_FLAG, "Y");
                poss_dup_written = true;
            }
            TAG_SENDING_TIME => {
                push_field_raw(&mut body, TAG_SENDING_TIME, value);
                if !poss_dup_written {
                    push_field_raw(&mut body, TAG_POSS_DUP_FLAG, "Y");
                    poss_dup_written = true;
                }
            }
            _ => push_field_raw(&mut body, *tag, value),
        }
    }

    let mut out = Vec::with_capacity(body.len() + 32);
    push_field_raw(&mut out, TAG_BEGIN_STRING, BEGIN_STRING);
    push_field_raw(&mut out, TAG_BODY_LENGTH, &body.len().to_string());
    out.extend_from_slice(&body);
    let checksum = out
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
        % 256;
    push_field_raw(&mut out, TAG_CHECKSUM, &format!("{checksum:03}"));
    out
}

fn push_field_raw(buf: &mut Vec<u8>, tag: u32, value: &str) {
    buf.extend_from_slice(tag.to_string().as_bytes());
    buf.push(b'=');
    buf.extend_from_slice(value.as_bytes());
    buf.push(SOH);
}

// =============================================================================
// Async driver
// =============================================================================

/// Commands the application can issue to a running session.
pub enum SessionCommand {
    /// Send an application message.
    App(MessageBuilder, MsgType),
    /// Graceful logout.
    Logout,
}

/// Handle to a spawned FIX session.
#[derive(Clone)]
pub struct FixSessionHandle {
    pub session_id: String,
    core: Arc<Mutex<SessionCore>>,
    commands: mpsc::Sender<SessionCommand>,
}

impl FixSessionHandle {
    pub fn state(&self) -> ConnectionState {
        self.core.lock().state()
    }

    pub fn sequences(&self) -> (u64, u64) {
        self.core.lock().sequences()
    }

    pub async fn send_app(&self, builder: MessageBuilder, msg_type: MsgType) -> bool {
        self.commands
            .send(SessionCommand::App(builder, msg_type))
            .await
            .is_ok()
    }

    pub async fn logout(&self) {
        let _ = self.commands.send(SessionCommand::Logout).await;
    }
}

/// Spawn a session: connect loop with exponential backoff, reader/writer
/// tasks per connection, timer-driven polls. Delivered application
/// messages go to `app_tx`.
pub fn spawn_session(
    config: SessionConfig,
    store: SessionStore,
    clock: Arc<Clock>,
    app_tx: mpsc::Sender<AppMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> FixSessionHandle {
    let core = Arc::new(Mutex::new(SessionCore::new(config.clone(), store)));
    let (commands_tx, mut commands_rx) = mpsc::channel::<SessionCommand>(256);

    let handle = FixSessionHandle {
        session_id: config.session_id.clone(),
        core: core.clone(),
        commands: commands_tx,
    };

    let driver_core = core;
    tokio::spawn(async move {
        let mut backoff_ms: u64 = 1_000;
        loop {
            if *shutdown.borrow() {
                break;
            }
            driver_core.lock().on_connecting();
            let addr = format!("{}:{}", config.host, config.port);
            let stream = tokio::select! {
                s = tokio::net::TcpStream::connect(&addr) => s,
                _ = shutdown.changed() => break,
            };
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!(session = %config.session_id, addr = %addr, error = %e, "fix connect failed");
                    driver_core.lock().on_disconnect();
                    let jitter = backoff_ms / 5;
                    let sleep_ms = backoff_ms - jitter + rand::random::<u64>() % (2 * jitter + 1);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(60_000);
                    continue;
                }
            };
            backoff_ms = 1_000;
            info!(session = %config.session_id, addr = %addr, "fix transport connected");

            let (mut read_half, mut write_half) = stream.into_split();
            let (wire_tx, mut wire_rx) = mpsc::channel::<Vec<u8>>(256);

            // Initial logon.
            {
                let actions = driver_core.lock().on_transport_up(clock.now_ms());
                dispatch(actions, &wire_tx, &app_tx).await;
            }

            let mut buffer: Vec<u8> = Vec::with_capacity(8192);
            let mut chunk = [0u8; 4096];
            let mut poll_timer = tokio::time::interval(std::time::Duration::from_millis(100));
            let mut disconnect = false;

            while !disconnect {
                tokio::select! {
                    read = read_half.read(&mut chunk) => {
                        match read {
                            Ok(0) => {
                                warn!(session = %config.session_id, "fix peer closed connection");
                                break;
                            }
                            Ok(n) => {
                                buffer.extend_from_slice(&chunk[..n]);
                                for frame in extract_frames(&mut buffer) {
                                    let actions = driver_core.lock().on_frame(&frame, clock.now_ms());
                                    disconnect |= dispatch(actions, &wire_tx, &app_tx).await;
                                }
                            }
                            Err(e) => {
                                warn!(session = %config.session_id, error = %e, "fix read error");
                                break;
                            }
                        }
                    }
                    Some(bytes) = wire_rx.recv() => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            warn!(session = %config.session_id, error = %e, "fix write error");
                            break;
                        }
                    }
                    Some(command) = commands_rx.recv() => {
                        let actions = match command {
                            SessionCommand::App(builder, msg_type) => {
                                driver_core.lock().send_app(builder, msg_type, clock.now_ms())
                            }
                            SessionCommand::Logout => {
                                driver_core.lock().initiate_logout("operator logout", clock.now_ms())
                            }
                        };
                        disconnect |= dispatch(actions, &wire_tx, &app_tx).await;
                    }
                    _ = poll_timer.tick() => {
                        let actions = driver_core.lock().poll(clock.now_ms());
                        disconnect |= dispatch(actions, &wire_tx, &app_tx).await;
                    }
                    _ = shutdown.changed() => {
                        let actions = driver_core.lock().initiate_logout("shutdown", clock.now_ms());
                        dispatch(actions, &wire_tx, &app_tx).await;
                        // Give the logout up to 5 s to flush before dropping.
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        disconnect = true;
                    }
                }
            }

            driver_core.lock().on_disconnect();
            if *shutdown.borrow() {
                break;
            }
        }
        info!(session = %config.session_id, "fix session task stopped");
    });

    handle
}

/// Route core actions to the wire and the application. Returns true when
/// the connection should drop.
async fn dispatch(
    actions: Vec<Action>,
    wire_tx: &mpsc::Sender<Vec<u8>>,
    app_tx: &mpsc::Sender<AppMessage>,
) -> bool {
    let mut disconnect = false;
    for action in actions {
        match action {
            Action::Send(bytes) => {
                if wire_tx.send(bytes).await.is_err() {
                    disconnect = true;
                }
            }
            Action::Deliver(msg) => {
                if app_tx.send(msg).await.is_err() {
                    debug!("application receiver dropped");
                }
            }
            Action::Disconnect(reason) => {
                info!(reason = %reason, "fix disconnect requested");
                disconnect = true;
            }
        }
    }
    disconnect
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            session_id: "lp-bank".into(),
            host: "127.0.0.1".into(),
            port: 9876,
            sender_comp_id: "MERIDIAN".into(),
            target_comp_id: "LPBANK".into(),
            heartbeat_s: 30,
            gap_grace_ms: 500,
            recovery_timeout_ms: 30_000,
            logon_timeout_ms: 10_000,
            message_ttl_days: 7,
        }
    }

    fn core(dir: &std::path::Path) -> SessionCore {
        SessionCore::new(config(), SessionStore::new(dir, "lp-bank"))
    }

    /// Build an inbound frame as the LP would send it.
    fn inbound(msg_type: MsgType, seq: u64, fields: &[(u32, &str)]) -> Vec<u8> {
        let mut builder = MessageBuilder::new(msg_type);
        for (tag, value) in fields {
            builder = builder.field(*tag, value);
        }
        builder.build(seq, "LPBANK", "MERIDIAN", "20240101-00:00:00.000")
    }

    fn logon_to_logged_in(core: &mut SessionCore, peer_seq: u64) {
        let actions = core.on_transport_up(0);
        assert!(matches!(actions[0], Action::Send(_)));
        let logon = inbound(MsgType::Logon, peer_seq, &[(TAG_HEART_BT_INT, "30")]);
        core.on_frame(&logon, 1);
        assert_eq!(core.state(), ConnectionState::LoggedIn);
    }

    fn sends(actions: &[Action]) -> Vec<RawParsed> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(bytes) => Some(parse_owned(bytes)),
                _ => None,
            })
            .collect()
    }

    struct RawParsed {
        msg_type: MsgType,
        seq: u64,
        fields: Vec<(u32, String)>,
    }

    impl RawParsed {
        fn get(&self, tag: u32) -> Option<&str> {
            self.fields
                .iter()
                .find(|(t, _)| *t == tag)
                .map(|(_, v)| v.as_str())
        }
    }

    fn parse_owned(bytes: &[u8]) -> RawParsed {
        let msg = RawMessage::parse(bytes).expect("outbound message must parse");
        RawParsed {
            msg_type: msg.msg_type().unwrap(),
            seq: msg.seq_num().unwrap(),
            fields: msg.to_owned_fields(),
        }
    }

    #[test]
    fn logon_handshake_reaches_logged_in() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        assert_eq!(c.state(), ConnectionState::Disconnected);
        let actions = c.on_transport_up(0);
        assert_eq!(c.state(), ConnectionState::LoggingIn);
        let outs = sends(&actions);
        assert_eq!(outs[0].msg_type, MsgType::Logon);
        assert_eq!(outs[0].seq, 1);

        c.on_frame(&inbound(MsgType::Logon, 1, &[]), 1);
        assert_eq!(c.state(), ConnectionState::LoggedIn);
        assert_eq!(c.sequences(), (1, 1));
    }

    #[test]
    fn out_seq_persisted_before_send() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 1);
        let actions = c.send_app(
            MessageBuilder::new(MsgType::NewOrderSingle).field(TAG_CL_ORD_ID, "c1"),
            MsgType::NewOrderSingle,
            10,
        );
        let outs = sends(&actions);
        assert_eq!(outs[0].seq, 2);

        // Persisted out_seq equals the maximum emitted MsgSeqNum.
        let store = SessionStore::new(dir.path(), "lp-bank");
        assert_eq!(store.load_seqs().0, 2);
    }

    #[test]
    fn bad_checksum_does_not_advance_in_seq() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 1);

        let mut frame = inbound(MsgType::Heartbeat, 2, &[]);
        let mid = frame.len() / 2;
        frame[mid] ^= 0x01;
        let actions = c.on_frame(&frame, 5);
        assert!(actions.is_empty());
        assert_eq!(c.sequences().1, 1);
    }

    #[test]
    fn gap_recovery_end_to_end() {
        // From in_seq=100: receive 103, wait out the grace window, send
        // ResendRequest(101,102), fills arrive PossDup, and the application
        // sees 101, 102, 103 in order.
        let dir = tempfile::tempdir().unwrap();
        {
            // Seed the store so the session resumes at out=200/in=99 and the
            // logon exchange lands us at in_seq=100.
            let store = SessionStore::new(dir.path(), "lp-bank");
            store.save_seqs(200, 99).unwrap();
        }
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 100);
        assert_eq!(c.sequences().1, 100);

        // Seq 103 arrives: queued, nothing delivered, no resend yet.
        let actions = c.on_frame(
            &inbound(MsgType::ExecutionReport, 103, &[(TAG_CL_ORD_ID, "c103")]),
            1_000,
        );
        assert!(actions.iter().all(|a| !matches!(a, Action::Deliver(_))));

        // Inside the grace window nothing happens.
        assert!(sends(&c.poll(1_300)).is_empty());

        // Past the grace window: ResendRequest(101, 102).
        let actions = c.poll(1_600);
        let outs = sends(&actions);
        assert_eq!(outs[0].msg_type, MsgType::ResendRequest);
        assert_eq!(outs[0].get(TAG_BEGIN_SEQ_NO), Some("101"));
        assert_eq!(outs[0].get(TAG_END_SEQ_NO), Some("102"));

        // 101 and 102 arrive flagged PossDup.
        let mut delivered: Vec<u64> = Vec::new();
        for seq in [101u64, 102] {
            let frame = inbound(
                MsgType::ExecutionReport,
                seq,
                &[(TAG_POSS_DUP_FLAG, "Y"), (TAG_CL_ORD_ID, "cfill")],
            );
            for action in c.on_frame(&frame, 2_000) {
                if let Action::Deliver(m) = action {
                    delivered.push(m.seq);
                }
            }
        }

        // Application saw 101, 102, then the queued 103 — in order.
        assert_eq!(delivered, vec![101, 102, 103]);
        // in_seq persisted at 103, gap cleared.
        assert_eq!(c.sequences().1, 103);
        let store = SessionStore::new(dir.path(), "lp-bank");
        assert_eq!(store.load_seqs().1, 103);

        // No duplicates on a late replay of 102.
        let frame = inbound(
            MsgType::ExecutionReport,
            102,
            &[(TAG_POSS_DUP_FLAG, "Y"), (TAG_CL_ORD_ID, "cfill")],
        );
        let actions = c.on_frame(&frame, 3_000);
        assert!(actions.iter().all(|a| !matches!(a, Action::Deliver(_))));
    }

    #[test]
    fn seq_too_low_without_poss_dup_logs_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 1);
        c.on_frame(&inbound(MsgType::Heartbeat, 2, &[]), 1);
        assert_eq!(c.sequences().1, 2);

        let actions = c.on_frame(&inbound(MsgType::Heartbeat, 1, &[]), 2);
        let outs = sends(&actions);
        assert_eq!(outs[0].msg_type, MsgType::Logout);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Disconnect(_))));
    }

    #[test]
    fn sequence_reset_gap_fill_advances() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 1);

        let frame = inbound(
            MsgType::SequenceReset,
            2,
            &[(TAG_GAP_FILL_FLAG, "Y"), (TAG_NEW_SEQ_NO, "10")],
        );
        let actions = c.on_frame(&frame, 1);
        assert!(actions.iter().all(|a| !matches!(a, Action::Deliver(_))));
        // Next expected is 10.
        assert_eq!(c.sequences().1, 9);
        let actions = c.on_frame(&inbound(MsgType::Heartbeat, 10, &[]), 2);
        assert!(sends(&actions).is_empty());
        assert_eq!(c.sequences().1, 10);
    }

    #[test]
    fn test_request_echoes_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 1);

        let actions = c.on_frame(
            &inbound(MsgType::TestRequest, 2, &[(TAG_TEST_REQ_ID, "ping-7")]),
            1,
        );
        let outs = sends(&actions);
        assert_eq!(outs[0].msg_type, MsgType::Heartbeat);
        assert_eq!(outs[0].get(TAG_TEST_REQ_ID), Some("ping-7"));
    }

    #[test]
    fn heartbeat_testrequest_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 1);

        // Quiet for H: we emit a heartbeat.
        let outs = sends(&c.poll(31_000));
        assert!(outs.iter().any(|m| m.msg_type == MsgType::Heartbeat));

        // Quiet past H + grace: TestRequest.
        let outs = sends(&c.poll(37_000));
        assert!(outs.iter().any(|m| m.msg_type == MsgType::TestRequest));

        // Still silent after a further H: disconnect.
        let actions = c.poll(67_000);
        assert!(actions.iter().any(|a| matches!(a, Action::Disconnect(_))));
    }

    #[test]
    fn resend_request_replays_with_poss_dup_and_gap_fills() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 1); // our logon was seq 1 (admin, not stored)
        let actions = c.send_app(
            MessageBuilder::new(MsgType::NewOrderSingle).field(TAG_CL_ORD_ID, "c1"),
            MsgType::NewOrderSingle,
            10,
        );
        assert_eq!(sends(&actions)[0].seq, 2);

        // Peer asks for 1..=2.
        let actions = c.on_frame(
            &inbound(
                MsgType::ResendRequest,
                2,
                &[(TAG_BEGIN_SEQ_NO, "1"), (TAG_END_SEQ_NO, "2")],
            ),
            20,
        );
        let outs = sends(&actions);
        // Admin seq 1 gap-filled, app seq 2 resent with PossDup.
        assert_eq!(outs[0].msg_type, MsgType::SequenceReset);
        assert_eq!(outs[0].get(TAG_GAP_FILL_FLAG), Some("Y"));
        assert_eq!(outs[0].get(TAG_NEW_SEQ_NO), Some("2"));
        assert_eq!(outs[1].msg_type, MsgType::NewOrderSingle);
        assert_eq!(outs[1].get(TAG_POSS_DUP_FLAG), Some("Y"));
        assert_eq!(outs[1].get(TAG_CL_ORD_ID), Some("c1"));
    }

    #[test]
    fn business_reject_surfaced_once_per_reference() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 1);

        let frame = inbound(
            MsgType::BusinessReject,
            2,
            &[(TAG_CL_ORD_ID, "c9"), (TAG_TEXT, "unknown symbol")],
        );
        let delivered = c
            .on_frame(&frame, 1)
            .into_iter()
            .filter(|a| matches!(a, Action::Deliver(_)))
            .count();
        assert_eq!(delivered, 1);

        let frame = inbound(
            MsgType::BusinessReject,
            3,
            &[(TAG_CL_ORD_ID, "c9"), (TAG_TEXT, "unknown symbol")],
        );
        let delivered = c
            .on_frame(&frame, 2)
            .into_iter()
            .filter(|a| matches!(a, Action::Deliver(_)))
            .count();
        assert_eq!(delivered, 0);
    }

    #[test]
    fn gap_queue_overflow_logs_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = core(dir.path());
        logon_to_logged_in(&mut c, 1);

        let mut last_actions = Vec::new();
        for i in 0..(MAX_GAP_QUEUE as u64 + 2) {
            let frame = inbound(MsgType::ExecutionReport, 10 + i, &[]);
            last_actions = c.on_frame(&frame, 1);
        }
        assert!(last_actions
            .iter()
            .any(|a| matches!(a, Action::Disconnect(_))));
    }
}
