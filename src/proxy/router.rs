//! Event router: the two pumps of a client connection.
//!
//! Each connection runs a client→upstream pump and an upstream→client pump
//! joined by `tokio::select!`; whichever direction finishes tears the other
//! down. The pumps share the per-connection [`ConnectionState`] behind a
//! `std::sync::Mutex`; decisions are made synchronously while holding it,
//! the socket I/O happens strictly after it is released.
//!
//! The decision logic lives in [`decide_client_event`] and
//! [`decide_upstream_event`] so the whole protocol surface is testable
//! without a socket in sight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::Principal;
use crate::errors::close_code;
use crate::middleware::rate_limit::RateLimiter;
use crate::middleware::usage::{ResponseUsage, UsageLedger};
use crate::models::event::{self, EventClass};
use crate::proxy::state::ConnectionState;
use crate::proxy::upstream::{CloseReason, UpstreamSession};
use crate::tools::ToolRegistryClient;

type SharedSink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

/// Everything the pumps need about their connection.
pub struct RouterContext {
    pub connection_id: Uuid,
    pub principal: Principal,
    pub state: Arc<Mutex<ConnectionState>>,
    pub usage: Arc<UsageLedger>,
    pub limiter: Arc<RateLimiter>,
    /// Tier-specific rate-limit capacity, when the tier overrides the default.
    pub rate_capacity_override: Option<u32>,
    /// Configured tool registry; `None` disables function.call interception.
    pub tools: Option<Arc<ToolRegistryClient>>,
}

/// How a pump ended. `close` carries the close frame still owed to the
/// client; `None` means the client is already gone.
pub struct PumpOutcome {
    pub close: Option<(u16, String)>,
}

// ── Client → upstream decisions ───────────────────────────────

#[derive(Debug)]
pub(crate) enum ClientAction {
    /// Enqueue on the upstream session.
    Forward(Value),
    /// Send a synthetic event back to the client; connection continues.
    Reply(Value),
    /// Intercept via the tool registry; response is routed to the client.
    ToolCall {
        name: String,
        params: Value,
        response_id: Option<String>,
    },
    /// Send the reply (if any), then close with the given frame.
    Close {
        reply: Option<Value>,
        code: u16,
        reason: &'static str,
    },
}

pub(crate) fn decide_client_event(ctx: &RouterContext, raw: &str) -> ClientAction {
    // 1. Parse. Bad JSON draws a synthetic error, not a close.
    let mut event_value = match serde_json::from_str::<Value>(raw) {
        Ok(v) if v.is_object() => v,
        _ => {
            return ClientAction::Reply(event::error_event(
                "invalid_request_error",
                "invalid_json",
                "payload is not a JSON object",
                None,
            ))
        }
    };

    // 2. `type` is mandatory.
    let Some(event_type) = event::event_type(&event_value).map(str::to_string) else {
        return ClientAction::Reply(event::error_event(
            "invalid_request_error",
            "invalid_event",
            "the 'type' field is missing",
            Some("type"),
        ));
    };

    // 3. Stamp an event id if the client did not provide one.
    {
        let mut state = ctx.state.lock().unwrap();
        state.touch();
        event::ensure_event_id(&mut event_value, &mut state.issued_event_ids);
    }

    // 4. Classify.
    match event::classify(&event_type) {
        EventClass::InitSession => {
            // init_session is consumed by the frontend; a second one is a
            // protocol violation that ends the connection.
            ClientAction::Close {
                reply: Some(event::error_event(
                    "invalid_request_error",
                    "invalid_init",
                    "init_session is only valid as the first event",
                    Some("type"),
                )),
                code: close_code::INIT_TIMEOUT,
                reason: "invalid_init",
            }
        }
        EventClass::AudioAppend => {
            let ticks = event_value
                .get("audio")
                .and_then(|a| a.as_str())
                .map(event::audio_ticks)
                .unwrap_or(0);
            ctx.usage.record_audio_input(&ctx.principal.id, ticks);
            forward_if_allowed(ctx, event_value)
        }
        EventClass::FunctionCall => {
            if let (Some(tools), Some(name)) = (
                ctx.tools.as_deref(),
                event_value.get("name").and_then(|n| n.as_str()),
            ) {
                if tools.knows(name) {
                    return ClientAction::ToolCall {
                        name: name.to_string(),
                        params: event_value
                            .get("parameters")
                            .cloned()
                            .unwrap_or_else(|| Value::Object(Default::default())),
                        response_id: event::response_id(&event_value).map(str::to_string),
                    };
                }
            }
            forward_if_allowed(ctx, event_value)
        }
        EventClass::ResponseCancel => {
            ctx.state.lock().unwrap().on_cancel();
            forward_if_allowed(ctx, event_value)
        }
        _ => forward_if_allowed(ctx, event_value),
    }
}

/// Step 5 of the client pump: the per-principal rate limit gates every
/// forwarded event. Denied events draw a synthetic error and go nowhere.
fn forward_if_allowed(ctx: &RouterContext, event_value: Value) -> ClientAction {
    if ctx
        .limiter
        .check_and_consume(&ctx.principal.id, ctx.rate_capacity_override)
    {
        return ClientAction::Forward(event_value);
    }

    let known_limits = ctx.state.lock().unwrap().rate_limits.clone();
    let message = match known_limits {
        Some(limits) => format!("rate limit exceeded (upstream limits: {})", limits),
        None => "rate limit exceeded".to_string(),
    };
    ClientAction::Reply(event::error_event(
        "rate_limit_error",
        "rate_limited",
        &message,
        None,
    ))
}

// ── Upstream → client decisions ───────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct UpstreamAction {
    /// Forward to the client. `None` = silently dropped.
    pub forward: Option<Value>,
    /// Synthesized event to enqueue upstream (barge-in cancel).
    pub send_upstream: Option<Value>,
    /// Close the connection after forwarding.
    pub close: Option<(u16, String)>,
}

pub(crate) fn decide_upstream_event(ctx: &RouterContext, event_value: Value) -> UpstreamAction {
    let event_type = event::event_type(&event_value).unwrap_or("").to_string();

    match event::classify(&event_type) {
        EventClass::ResponseCreated => {
            let id = event_value
                .get("response")
                .and_then(|r| r.get("id"))
                .and_then(|i| i.as_str())
                .or_else(|| event::response_id(&event_value));
            ctx.state.lock().unwrap().on_response_created(id);
            UpstreamAction {
                forward: Some(event_value),
                ..Default::default()
            }
        }
        EventClass::ResponseDone => {
            if let Some(usage) = ResponseUsage::from_event(&event_value) {
                ctx.usage.record_response_usage(&ctx.principal.id, &usage);
            }
            ctx.state.lock().unwrap().on_response_done();
            UpstreamAction {
                forward: Some(event_value),
                ..Default::default()
            }
        }
        EventClass::TextDelta | EventClass::AudioTranscriptDelta => {
            let accepted = ctx
                .state
                .lock()
                .unwrap()
                .accepts_delta(event::response_id(&event_value));
            UpstreamAction {
                // A delta for a superseded response is dropped, not an error.
                forward: accepted.then_some(event_value),
                ..Default::default()
            }
        }
        EventClass::AudioDelta => {
            let accepted = ctx
                .state
                .lock()
                .unwrap()
                .accepts_delta(event::response_id(&event_value));
            if !accepted {
                return UpstreamAction::default();
            }
            let ticks = event_value
                .get("delta")
                .and_then(|d| d.as_str())
                .map(event::audio_ticks)
                .unwrap_or(0);
            ctx.usage.record_audio_output(&ctx.principal.id, ticks);
            UpstreamAction {
                forward: Some(event_value),
                ..Default::default()
            }
        }
        EventClass::SpeechStarted => {
            let cancel = ctx.state.lock().unwrap().on_speech_started();
            UpstreamAction {
                forward: Some(event_value),
                send_upstream: cancel.as_deref().map(event::response_cancel),
                close: None,
            }
        }
        EventClass::SpeechStopped => {
            ctx.state.lock().unwrap().on_speech_stopped();
            UpstreamAction {
                forward: Some(event_value),
                ..Default::default()
            }
        }
        EventClass::RateLimitsUpdated => {
            ctx.state.lock().unwrap().rate_limits = event_value.get("rate_limits").cloned();
            UpstreamAction {
                forward: Some(event_value),
                ..Default::default()
            }
        }
        EventClass::Error => {
            ctx.usage.record_error(&ctx.principal.id);
            let fatal = event::error_code(&event_value)
                .map(event::is_fatal_error_code)
                .unwrap_or(false);
            if fatal {
                ctx.state.lock().unwrap().on_fatal_error();
                UpstreamAction {
                    forward: Some(event_value),
                    send_upstream: None,
                    close: Some((close_code::UPSTREAM_FAILED, "upstream_failed".into())),
                }
            } else {
                UpstreamAction {
                    forward: Some(event_value),
                    ..Default::default()
                }
            }
        }
        _ => UpstreamAction {
            forward: Some(event_value),
            ..Default::default()
        },
    }
}

// ── The pumps ─────────────────────────────────────────────────

/// Drive a connection until either side ends, then deliver the close frame.
pub async fn run(
    ctx: RouterContext,
    client_ws: WebSocket,
    session: Arc<UpstreamSession>,
    idle_timeout: Duration,
) {
    let started = Instant::now();
    let (sink, stream) = client_ws.split();
    let client_sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));

    let client_frames = AtomicU64::new(0);
    let upstream_frames = AtomicU64::new(0);

    let outcome = tokio::select! {
        outcome = client_pump(
            &ctx, stream, client_sink.clone(), session.clone(), idle_timeout, &client_frames,
        ) => outcome,
        outcome = upstream_pump(&ctx, client_sink.clone(), session.clone(), &upstream_frames) => outcome,
    };

    if let Some((code, reason)) = &outcome.close {
        let frame = CloseFrame {
            code: *code,
            reason: reason.clone().into(),
        };
        let _ = client_sink
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await;
    }

    tracing::info!(
        connection_id = %ctx.connection_id,
        principal = %ctx.principal.id,
        client_frames = client_frames.load(Ordering::Relaxed),
        upstream_frames = upstream_frames.load(Ordering::Relaxed),
        duration_ms = started.elapsed().as_millis() as u64,
        "connection ended"
    );
}

async fn send_to_client(sink: &SharedSink, event_value: &Value) -> bool {
    sink.lock()
        .await
        .send(Message::Text(event_value.to_string()))
        .await
        .is_ok()
}

async fn client_pump(
    ctx: &RouterContext,
    mut stream: SplitStream<WebSocket>,
    client_sink: SharedSink,
    session: Arc<UpstreamSession>,
    idle_timeout: Duration,
    frames: &AtomicU64,
) -> PumpOutcome {
    loop {
        let msg = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Err(_) => {
                tracing::info!(connection_id = %ctx.connection_id, "client idle, closing");
                return PumpOutcome {
                    close: Some((close_code::NORMAL, "idle_timeout".into())),
                };
            }
            Ok(None) | Ok(Some(Err(_))) => return PumpOutcome { close: None },
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                frames.fetch_add(1, Ordering::Relaxed);
                match decide_client_event(ctx, &text) {
                    ClientAction::Forward(event_value) => {
                        if session.send(event_value).is_err() {
                            let notice = event::error_event(
                                "upstream_error",
                                "upstream_closed",
                                "the upstream session is closed",
                                None,
                            );
                            let _ = send_to_client(&client_sink, &notice).await;
                            return PumpOutcome {
                                close: Some((close_code::UPSTREAM_FAILED, "upstream_failed".into())),
                            };
                        }
                    }
                    ClientAction::Reply(reply) => {
                        if !send_to_client(&client_sink, &reply).await {
                            return PumpOutcome { close: None };
                        }
                    }
                    ClientAction::ToolCall {
                        name,
                        params,
                        response_id,
                    } => {
                        let call = match &ctx.tools {
                            Some(tools) => tools.call(&name, &params).await,
                            None => Err(anyhow::anyhow!("tool registry not configured")),
                        };
                        let reply = match call {
                            Ok(result) => {
                                event::function_response(response_id.as_deref(), result)
                            }
                            Err(e) => {
                                tracing::warn!(
                                    connection_id = %ctx.connection_id,
                                    tool = %name,
                                    "tool call failed: {}",
                                    e
                                );
                                event::error_event(
                                    "function_error",
                                    "function_call_failed",
                                    &e.to_string(),
                                    None,
                                )
                            }
                        };
                        if !send_to_client(&client_sink, &reply).await {
                            return PumpOutcome { close: None };
                        }
                    }
                    ClientAction::Close {
                        reply,
                        code,
                        reason,
                    } => {
                        if let Some(reply) = reply {
                            let _ = send_to_client(&client_sink, &reply).await;
                        }
                        return PumpOutcome {
                            close: Some((code, reason.into())),
                        };
                    }
                }
            }
            Message::Binary(_) => {
                let notice = event::error_event(
                    "invalid_request_error",
                    "invalid_event",
                    "binary frames are not supported",
                    None,
                );
                if !send_to_client(&client_sink, &notice).await {
                    return PumpOutcome { close: None };
                }
            }
            Message::Close(_) => return PumpOutcome { close: None },
            // The WS layer answers pings on its own.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn upstream_pump(
    ctx: &RouterContext,
    client_sink: SharedSink,
    session: Arc<UpstreamSession>,
    frames: &AtomicU64,
) -> PumpOutcome {
    loop {
        let Some(event_value) = session.recv().await else {
            // Upstream is gone for good: clean close vs. failure.
            let (code, reason, message) = match session.close_reason() {
                Some(CloseReason::Clean) | Some(CloseReason::Local) => (
                    close_code::NORMAL,
                    "upstream_closed",
                    "upstream closed the session",
                ),
                _ => (
                    close_code::UPSTREAM_FAILED,
                    "upstream_failed",
                    "upstream connection lost",
                ),
            };
            let notice = event::error_event("upstream_error", "upstream_closed", message, None);
            let _ = send_to_client(&client_sink, &notice).await;
            return PumpOutcome {
                close: Some((code, reason.into())),
            };
        };

        frames.fetch_add(1, Ordering::Relaxed);
        let action = decide_upstream_event(ctx, event_value);

        if let Some(upstream_event) = action.send_upstream {
            // Best effort; a closed session surfaces on the next recv.
            let _ = session.send(upstream_event);
        }
        if let Some(forward) = action.forward {
            if !send_to_client(&client_sink, &forward).await {
                return PumpOutcome { close: None };
            }
        }
        if let Some(close) = action.close {
            return PumpOutcome { close: Some(close) };
        }
    }
}
