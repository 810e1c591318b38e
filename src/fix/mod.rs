// =============================================================================
// FIX 4.4 — framing, session store, session state machine
// =============================================================================

pub mod message;
pub mod session;
pub mod store;
