//! Per-connection response state.
//!
//! Tracks whether a model response is in flight so the router can filter
//! stale deltas and cancel on barge-in. Transitions:
//!
//! | from \ event | response.created | response.done | speech_started | speech_stopped | fatal error |
//! |--------------|------------------|---------------|----------------|----------------|-------------|
//! | Idle         | Responding       | -             | Processing     | -              | Error       |
//! | Processing   | Responding       | -             | -              | Idle           | Error       |
//! | Responding   | (new id)         | Idle          | cancel + Processing | -         | Error       |
//! | Error        | terminal         |               |                |                |             |
//!
//! Guarded by a `std::sync::Mutex` held only for the transition itself,
//! never across socket I/O.

use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseState {
    Idle,
    Processing,
    Responding,
    Error,
}

#[derive(Debug)]
pub struct ConnectionState {
    pub response_state: ResponseState,
    pub current_response_id: Option<String>,
    /// Latest `rate_limits.updated` payload, kept so synthesized errors can
    /// quote concrete limits.
    pub rate_limits: Option<Value>,
    /// Whether init_session has been consumed for this connection.
    pub initialized: bool,
    /// Event ids stamped by the relay on this connection.
    pub issued_event_ids: HashSet<String>,
    pub last_activity: Instant,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            response_state: ResponseState::Idle,
            current_response_id: None,
            rate_limits: None,
            initialized: false,
            issued_event_ids: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    fn transition(&mut self, next: ResponseState) {
        if self.response_state == ResponseState::Error {
            return; // terminal
        }
        self.response_state = next;
    }

    /// `response.created`: a new response id always replaces the current one.
    pub fn on_response_created(&mut self, response_id: Option<&str>) {
        if self.response_state == ResponseState::Error {
            return;
        }
        self.current_response_id = response_id.map(str::to_string);
        self.transition(ResponseState::Responding);
    }

    /// `response.done`: only a Responding connection returns to Idle.
    pub fn on_response_done(&mut self) {
        if self.response_state == ResponseState::Responding {
            self.current_response_id = None;
            self.transition(ResponseState::Idle);
        }
    }

    /// `input_audio_buffer.speech_started`. Returns the response id to
    /// cancel when barge-in interrupts an active response.
    pub fn on_speech_started(&mut self) -> Option<String> {
        match self.response_state {
            ResponseState::Idle => {
                self.transition(ResponseState::Processing);
                None
            }
            ResponseState::Responding => {
                let cancel = self.current_response_id.take();
                self.transition(ResponseState::Processing);
                cancel
            }
            _ => None,
        }
    }

    /// `input_audio_buffer.speech_stopped`.
    pub fn on_speech_stopped(&mut self) {
        if self.response_state == ResponseState::Processing {
            self.transition(ResponseState::Idle);
        }
    }

    /// Client-issued `response.cancel`.
    pub fn on_cancel(&mut self) {
        if self.response_state == ResponseState::Responding {
            self.current_response_id = None;
            self.transition(ResponseState::Idle);
        }
    }

    /// Fatal upstream error: terminal.
    pub fn on_fatal_error(&mut self) {
        self.response_state = ResponseState::Error;
        self.current_response_id = None;
    }

    /// Whether a delta carrying this response id should be forwarded.
    /// Deltas for completed or cancelled responses are silently dropped.
    pub fn accepts_delta(&self, delta_response_id: Option<&str>) -> bool {
        match (&self.current_response_id, delta_response_id) {
            (Some(current), Some(delta)) => current == delta,
            // A delta without an id can't be attributed; forward it.
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
