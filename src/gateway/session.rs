//! Gateway Session
//!
//! Single responsibility: one connection attempt against one gateway URL.
//!
//! # The Key Abstraction
//!
//! The protocol logic lives in [`SessionMachine`], a plain state machine with
//! no I/O. It consumes [`Input`]s (socket opened, frame received, timer fired,
//! transport failed, socket closed) and returns [`Step`]s (send this frame,
//! resolve/reject this call, close the socket). [`call_at`] is the thin async
//! driver that feeds it from a real WebSocket.
//!
//! ```text
//! Connecting ──open──▶ AwaitingChallenge ──challenge──▶ Authenticating
//!      │                      ▲                              │
//!      └──open (token auth)───┼──────────────────────────────┤
//!                             └── "device nonce required" ───┤
//!                                                      connect ok
//!                                                            ▼
//!                                   Authenticated ──flush──▶ RequestInFlight
//!                                                            │
//!                                      Completed | Failed | TimedOut
//! ```
//!
//! Two responses are not terminal:
//! - a connect rejected only for a missing device nonce (the challenge follows)
//! - an `"accepted"` status on a call submitted with `expect_final`
//!
//! The socket is closed at most once, whichever path tears it down.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::ConnectAuth;
use super::protocol::{Frame, ResponseFrame, ACCEPTED_STATUS};
use super::transport::{Incoming, Transport};
use crate::error::GatewayError;

/// One logical gateway call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub method: String,
    pub params: Value,
    /// Keep waiting past an intermediate `"accepted"` status
    pub expect_final: bool,
}

impl CallRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            expect_final: false,
        }
    }

    pub fn expect_final(mut self, expect_final: bool) -> Self {
        self.expect_final = expect_final;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Authenticated,
    RequestInFlight,
    Completed,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::TimedOut
        )
    }

    fn is_authenticated(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::RequestInFlight)
    }
}

/// Something that happened to the session.
#[derive(Debug)]
pub enum Input {
    Opened,
    Frame(Frame),
    TimerExpired,
    TransportError(String),
    Closed { code: u16, reason: String },
}

/// Something the driver must do.
#[derive(Debug)]
pub enum Step {
    Send(String),
    Resolve { id: String, payload: Value },
    Reject { id: String, error: GatewayError },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Connect,
    Call,
}

#[derive(Debug)]
struct PendingRequest {
    method: String,
    expect_final: bool,
    kind: RequestKind,
}

/// Protocol state for one connection.
///
/// Calls may be submitted at any time; those submitted before the handshake
/// completes are queued and flushed once the gateway accepts `connect`.
pub struct SessionMachine {
    auth: ConnectAuth,
    state: SessionState,
    pending: HashMap<String, PendingRequest>,
    queued: Vec<(String, CallRequest)>,
    closed: bool,
}

impl SessionMachine {
    pub fn new(auth: ConnectAuth) -> Self {
        Self {
            auth,
            state: SessionState::Connecting,
            pending: HashMap::new(),
            queued: Vec::new(),
            closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Calls that have not been resolved or rejected yet.
    pub fn outstanding_calls(&self) -> usize {
        self.queued.len()
            + self
                .pending
                .values()
                .filter(|p| p.kind == RequestKind::Call)
                .count()
    }

    /// Submit a call. Returns its correlation id and any immediate steps.
    pub fn submit(&mut self, call: CallRequest) -> (String, Vec<Step>) {
        let id = Uuid::new_v4().to_string();

        if self.state.is_terminal() {
            let error = GatewayError::Connection(format!(
                "session closed before {} could be sent",
                call.method
            ));
            return (id.clone(), vec![Step::Reject { id, error }]);
        }

        if self.state.is_authenticated() {
            let step = self.send_call(id.clone(), call);
            self.state = SessionState::RequestInFlight;
            return (id, vec![step]);
        }

        debug!(id = %id, method = %call.method, "Call queued until handshake completes");
        self.queued.push((id.clone(), call));
        (id, Vec::new())
    }

    /// Advance the state machine.
    pub fn handle(&mut self, input: Input) -> Vec<Step> {
        if self.state.is_terminal() {
            debug!(state = ?self.state, input = ?input, "Ignoring input on finished session");
            return Vec::new();
        }

        match input {
            Input::Opened => self.on_open(),
            Input::Frame(frame) => self.on_frame(frame),
            Input::TimerExpired => {
                warn!(outstanding = self.outstanding_calls(), "Gateway session timed out");
                self.fail_all(SessionState::TimedOut, |method| {
                    GatewayError::Timeout(format!("gateway timeout calling {}", method))
                })
            }
            Input::TransportError(detail) => {
                warn!(error = %detail, "Gateway transport error");
                self.fail_all(SessionState::Failed, |_| GatewayError::Connection(detail.clone()))
            }
            Input::Closed { code, reason } => {
                // The peer already closed; nothing left for us to close.
                self.closed = true;
                if self.outstanding_calls() == 0 {
                    debug!(code = code, "Gateway closed with nothing outstanding");
                    self.state = SessionState::Completed;
                    return Vec::new();
                }
                self.fail_all(SessionState::Failed, |_| {
                    GatewayError::Connection(format!("gateway closed ({}): {}", code, reason))
                })
            }
        }
    }

    fn on_open(&mut self) -> Vec<Step> {
        if self.state != SessionState::Connecting {
            return Vec::new();
        }
        if self.auth.expects_challenge() {
            debug!("Waiting for connect.challenge");
            self.state = SessionState::AwaitingChallenge;
            return Vec::new();
        }
        self.send_connect(None)
    }

    fn on_frame(&mut self, frame: Frame) -> Vec<Step> {
        if let Some(nonce) = frame.challenge_nonce() {
            if self.state.is_authenticated() {
                debug!("Ignoring challenge on authenticated session");
                return Vec::new();
            }
            debug!(has_nonce = nonce.is_some(), "Received connect.challenge");
            return self.send_connect(nonce.as_deref());
        }

        match frame {
            Frame::Response(res) => self.on_response(res),
            Frame::Event { event, .. } => {
                debug!(event = %event, "Ignoring gateway event");
                Vec::new()
            }
            Frame::Request { method, .. } => {
                debug!(method = %method, "Ignoring gateway request");
                Vec::new()
            }
        }
    }

    fn on_response(&mut self, res: ResponseFrame) -> Vec<Step> {
        let Some(entry) = self.pending.get(&res.id) else {
            debug!(id = %res.id, "Ignoring response for unknown id");
            return Vec::new();
        };

        if entry.expect_final && res.status() == Some(ACCEPTED_STATUS) {
            debug!(id = %res.id, method = %entry.method, "Call accepted, waiting for final result");
            return Vec::new();
        }

        let Some(entry) = self.pending.remove(&res.id) else {
            return Vec::new();
        };

        match entry.kind {
            RequestKind::Connect => self.on_connect_response(res),
            RequestKind::Call => self.on_call_response(res, entry),
        }
    }

    fn on_connect_response(&mut self, res: ResponseFrame) -> Vec<Step> {
        if !res.ok {
            if res.is_nonce_required() {
                let connect_pending = self
                    .pending
                    .values()
                    .any(|p| p.kind == RequestKind::Connect);
                if !connect_pending && !self.state.is_authenticated() {
                    self.state = SessionState::AwaitingChallenge;
                }
                debug!(id = %res.id, "Connect needs a device nonce, waiting for challenge");
                return Vec::new();
            }

            let message = res
                .error_message()
                .unwrap_or("gateway connect failed")
                .to_string();
            warn!(error = %message, "Gateway rejected handshake");
            return self.fail_all(SessionState::Failed, |_| {
                GatewayError::HandshakeRejected(message.clone())
            });
        }

        if self.state.is_authenticated() {
            debug!(id = %res.id, "Duplicate connect success ignored");
            return Vec::new();
        }

        info!("Gateway handshake accepted");
        self.state = SessionState::Authenticated;

        let queued = std::mem::take(&mut self.queued);
        if !queued.is_empty() {
            self.state = SessionState::RequestInFlight;
        }
        queued
            .into_iter()
            .map(|(id, call)| self.send_call(id, call))
            .collect()
    }

    fn on_call_response(&mut self, res: ResponseFrame, entry: PendingRequest) -> Vec<Step> {
        let ok = res.ok;
        let mut steps = if ok {
            debug!(id = %res.id, method = %entry.method, "Call completed");
            vec![Step::Resolve {
                id: res.id,
                payload: res.payload.unwrap_or(Value::Null),
            }]
        } else {
            let message = res
                .error_message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} failed", entry.method));
            warn!(method = %entry.method, error = %message, "Gateway call failed");
            vec![Step::Reject {
                id: res.id,
                error: GatewayError::Application(message),
            }]
        };

        if self.outstanding_calls() == 0 {
            self.state = if ok {
                SessionState::Completed
            } else {
                SessionState::Failed
            };
            steps.extend(self.close());
        }
        steps
    }

    fn send_connect(&mut self, nonce: Option<&str>) -> Vec<Step> {
        let params = self
            .auth
            .connect_params(nonce, chrono::Utc::now().timestamp_millis());
        let id = Uuid::new_v4().to_string();

        let frame = match Frame::request(&id, "connect", &params) {
            Ok(frame) => frame,
            Err(e) => {
                let detail = e.to_string();
                return self.fail_all(SessionState::Failed, |_| GatewayError::Protocol(detail.clone()));
            }
        };

        debug!(id = %id, signed = params.device.is_some(), "Sending connect");
        self.pending.insert(
            id,
            PendingRequest {
                method: "connect".to_string(),
                expect_final: false,
                kind: RequestKind::Connect,
            },
        );
        self.state = SessionState::Authenticating;
        vec![Step::Send(frame.encode())]
    }

    fn send_call(&mut self, id: String, call: CallRequest) -> Step {
        debug!(id = %id, method = %call.method, expect_final = call.expect_final, "Sending call");
        let frame = Frame::Request {
            id: id.clone(),
            method: call.method.clone(),
            params: call.params,
        };
        self.pending.insert(
            id,
            PendingRequest {
                method: call.method,
                expect_final: call.expect_final,
                kind: RequestKind::Call,
            },
        );
        Step::Send(frame.encode())
    }

    /// Reject every outstanding call and close.
    fn fail_all<F>(&mut self, state: SessionState, make_error: F) -> Vec<Step>
    where
        F: Fn(&str) -> GatewayError,
    {
        let queued = std::mem::take(&mut self.queued)
            .into_iter()
            .map(|(id, call)| (id, call.method));
        let in_flight = self
            .pending
            .drain()
            .filter(|(_, p)| p.kind == RequestKind::Call)
            .map(|(id, p)| (id, p.method))
            .collect::<Vec<_>>();

        let mut steps: Vec<Step> = queued
            .chain(in_flight)
            .map(|(id, method)| Step::Reject {
                error: make_error(&method),
                id,
            })
            .collect();

        self.state = state;
        steps.extend(self.close());
        steps
    }

    fn close(&mut self) -> Option<Step> {
        if self.closed {
            return None;
        }
        self.closed = true;
        Some(Step::Close)
    }
}

/// Run one call against one gateway URL.
///
/// A single deadline covers connecting, the handshake (including the nonce
/// round-trip) and the call itself.
pub async fn call_at(
    url: &str,
    call: CallRequest,
    auth: &ConnectAuth,
    timeout: Duration,
) -> Result<Value, GatewayError> {
    let method = call.method.clone();
    debug!(url = %url, method = %method, timeout_ms = timeout.as_millis() as u64, "Starting gateway session");

    let mut machine = SessionMachine::new(auth.clone());
    let (call_id, mut steps): (String, VecDeque<Step>) = {
        let (id, steps) = machine.submit(call);
        (id, steps.into())
    };

    let timer = tokio::time::sleep(timeout);
    tokio::pin!(timer);

    let mut link: Option<Transport> = None;
    let first = tokio::select! {
        connected = Transport::connect(url) => match connected {
            Ok(transport) => {
                link = Some(transport);
                Input::Opened
            }
            Err(e) => Input::TransportError(error_detail(e)),
        },
        _ = &mut timer => Input::TimerExpired,
    };
    steps.extend(machine.handle(first));

    loop {
        while let Some(step) = steps.pop_front() {
            match step {
                Step::Send(text) => {
                    let sent = match link.as_mut() {
                        Some(transport) => transport.send(text).await,
                        None => Err(GatewayError::Connection("not connected".into())),
                    };
                    if let Err(e) = sent {
                        steps.extend(machine.handle(Input::TransportError(error_detail(e))));
                    }
                }
                Step::Resolve { id, payload } if id == call_id => {
                    debug!(url = %url, method = %method, "Gateway call resolved");
                    steps.clear();
                    close_link(&mut link).await;
                    return Ok(payload);
                }
                Step::Reject { id, error } if id == call_id => {
                    debug!(url = %url, method = %method, error = %error, "Gateway call rejected");
                    steps.clear();
                    close_link(&mut link).await;
                    return Err(error);
                }
                Step::Resolve { .. } | Step::Reject { .. } => {}
                Step::Close => close_link(&mut link).await,
            }
        }

        if machine.state().is_terminal() {
            return Err(GatewayError::Connection(format!(
                "session for {} ended without a result",
                method
            )));
        }

        let Some(transport) = link.as_mut() else {
            return Err(GatewayError::Connection("connection lost".into()));
        };

        let input = tokio::select! {
            incoming = transport.recv() => match incoming {
                Ok(Incoming::Text(text)) => Frame::parse(&text).map(Input::Frame),
                Ok(Incoming::Closed { code, reason }) => Some(Input::Closed { code, reason }),
                Err(e) => Some(Input::TransportError(error_detail(e))),
            },
            _ = &mut timer => Some(Input::TimerExpired),
        };

        match input {
            Some(Input::Closed { code, reason }) => {
                // Peer is gone; drop the socket instead of closing it again.
                link = None;
                steps.extend(machine.handle(Input::Closed { code, reason }));
            }
            Some(input) => steps.extend(machine.handle(input)),
            None => debug!(url = %url, "Dropping unparseable frame"),
        }
    }
}

async fn close_link(link: &mut Option<Transport>) {
    if let Some(transport) = link.take() {
        transport.close().await;
    }
}

fn error_detail(error: GatewayError) -> String {
    match error {
        GatewayError::Connection(detail) => detail,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::device::DeviceAuth;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use serde_json::json;
    use std::sync::Arc;

    fn device_auth() -> ConnectAuth {
        let device = DeviceAuth::new(
            "dev-1",
            SigningKey::generate(&mut OsRng),
            "op-token",
            vec!["operator.admin".into()],
        )
        .unwrap();
        ConnectAuth::default().with_device(Arc::new(device))
    }

    fn sent(steps: &[Step]) -> Vec<Frame> {
        steps
            .iter()
            .filter_map(|s| match s {
                Step::Send(text) => Frame::parse(text),
                _ => None,
            })
            .collect()
    }

    fn request_id(frame: &Frame) -> (String, String, Value) {
        match frame {
            Frame::Request { id, method, params } => (id.clone(), method.clone(), params.clone()),
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn res(frame: ResponseFrame) -> Input {
        Input::Frame(Frame::Response(frame))
    }

    fn challenge(nonce: &str) -> Input {
        Input::Frame(Frame::Event {
            event: "connect.challenge".into(),
            payload: Some(json!({ "nonce": nonce })),
        })
    }

    fn closes(steps: &[Step]) -> usize {
        steps.iter().filter(|s| matches!(s, Step::Close)).count()
    }

    #[test]
    fn test_token_auth_full_exchange() {
        let mut machine = SessionMachine::new(ConnectAuth::token("bearer"));
        let (call_id, steps) = machine.submit(CallRequest::new("cron.run", json!({ "id": "job" })));
        assert!(steps.is_empty());

        let steps = machine.handle(Input::Opened);
        assert_eq!(machine.state(), SessionState::Authenticating);
        let (connect_id, method, params) = request_id(&sent(&steps)[0]);
        assert_eq!(method, "connect");
        assert_eq!(params["auth"]["token"], "bearer");
        assert!(params.get("device").is_none());

        let steps = machine.handle(res(ResponseFrame::ok(&connect_id, json!({ "protocol": 3 }))));
        assert_eq!(machine.state(), SessionState::RequestInFlight);
        let (id, method, params) = request_id(&sent(&steps)[0]);
        assert_eq!(id, call_id);
        assert_eq!(method, "cron.run");
        assert_eq!(params, json!({ "id": "job" }));

        let steps = machine.handle(res(ResponseFrame::ok(&call_id, json!({ "ran": true }))));
        assert!(matches!(&steps[0], Step::Resolve { id, payload } if id == &call_id && payload["ran"] == true));
        assert_eq!(closes(&steps), 1);
        assert_eq!(machine.state(), SessionState::Completed);
    }

    #[test]
    fn test_device_auth_waits_for_challenge() {
        let mut machine = SessionMachine::new(device_auth());
        machine.submit(CallRequest::new("agent", json!({})));

        assert!(machine.handle(Input::Opened).is_empty());
        assert_eq!(machine.state(), SessionState::AwaitingChallenge);

        let steps = machine.handle(challenge("nonce-1"));
        let (_, method, params) = request_id(&sent(&steps)[0]);
        assert_eq!(method, "connect");
        assert_eq!(params["device"]["nonce"], "nonce-1");
        assert_eq!(params["device"]["id"], "dev-1");
        assert_eq!(params["auth"]["token"], "op-token");
        assert_eq!(machine.state(), SessionState::Authenticating);
    }

    #[test]
    fn test_nonce_required_rejection_is_not_terminal() {
        let mut machine = SessionMachine::new(device_auth());
        let (call_id, _) = machine.submit(CallRequest::new("agent", json!({})));
        machine.handle(Input::Opened);

        // Challenge without a nonce yields a v1 connect the gateway refuses.
        let steps = machine.handle(Input::Frame(Frame::Event {
            event: "connect.challenge".into(),
            payload: None,
        }));
        let (stale_id, _, _) = request_id(&sent(&steps)[0]);

        let steps = machine.handle(res(ResponseFrame::err(&stale_id, "device nonce required")));
        assert!(steps.is_empty());
        assert_eq!(machine.state(), SessionState::AwaitingChallenge);
        assert_eq!(machine.outstanding_calls(), 1);

        let steps = machine.handle(challenge("nonce-2"));
        let (connect_id, _, params) = request_id(&sent(&steps)[0]);
        assert_eq!(params["device"]["nonce"], "nonce-2");

        let steps = machine.handle(res(ResponseFrame::ok(&connect_id, json!({}))));
        let (id, method, _) = request_id(&sent(&steps)[0]);
        assert_eq!((id.as_str(), method.as_str()), (call_id.as_str(), "agent"));
    }

    #[test]
    fn test_stale_connect_rejection_after_newer_connect() {
        let mut machine = SessionMachine::new(device_auth());
        machine.submit(CallRequest::new("agent", json!({})));
        machine.handle(Input::Opened);

        let (first, _, _) = request_id(&sent(&machine.handle(challenge("a")))[0]);
        let (second, _, _) = request_id(&sent(&machine.handle(challenge("b")))[0]);

        assert!(machine
            .handle(res(ResponseFrame::err(&first, "Device nonce required")))
            .is_empty());
        assert_eq!(machine.state(), SessionState::Authenticating);

        let steps = machine.handle(res(ResponseFrame::ok(&second, json!({}))));
        assert_eq!(sent(&steps).len(), 1);
        assert_eq!(machine.state(), SessionState::RequestInFlight);
    }

    #[test]
    fn test_handshake_rejection_fails_call() {
        let mut machine = SessionMachine::new(ConnectAuth::token("bad"));
        let (call_id, _) = machine.submit(CallRequest::new("agent", json!({})));
        let (connect_id, _, _) = request_id(&sent(&machine.handle(Input::Opened))[0]);

        let steps = machine.handle(res(ResponseFrame::err(&connect_id, "unauthorized")));
        assert!(matches!(
            &steps[0],
            Step::Reject { id, error: GatewayError::HandshakeRejected(msg) } if id == &call_id && msg == "unauthorized"
        ));
        assert_eq!(closes(&steps), 1);
        assert_eq!(machine.state(), SessionState::Failed);
    }

    #[test]
    fn test_accepted_status_waits_for_final() {
        let mut machine = SessionMachine::new(ConnectAuth::token("t"));
        let (call_id, _) = machine.submit(CallRequest::new("agent", json!({})).expect_final(true));
        let (connect_id, _, _) = request_id(&sent(&machine.handle(Input::Opened))[0]);
        machine.handle(res(ResponseFrame::ok(&connect_id, json!({}))));

        let accepted = machine.handle(res(ResponseFrame::ok(&call_id, json!({ "status": "accepted", "runId": "r1" }))));
        assert!(accepted.is_empty());
        assert_eq!(machine.state(), SessionState::RequestInFlight);

        let steps = machine.handle(res(ResponseFrame::ok(&call_id, json!({ "status": "ok", "runId": "r1" }))));
        assert!(matches!(&steps[0], Step::Resolve { payload, .. } if payload["status"] == "ok"));
        assert_eq!(machine.state(), SessionState::Completed);
    }

    #[test]
    fn test_accepted_status_resolves_without_expect_final() {
        let mut machine = SessionMachine::new(ConnectAuth::token("t"));
        let (call_id, _) = machine.submit(CallRequest::new("agent", json!({})));
        let (connect_id, _, _) = request_id(&sent(&machine.handle(Input::Opened))[0]);
        machine.handle(res(ResponseFrame::ok(&connect_id, json!({}))));

        let steps = machine.handle(res(ResponseFrame::ok(&call_id, json!({ "status": "accepted" }))));
        assert!(matches!(&steps[0], Step::Resolve { payload, .. } if payload["status"] == "accepted"));
    }

    #[test]
    fn test_application_error() {
        let mut machine = SessionMachine::new(ConnectAuth::token("t"));
        let (call_id, _) = machine.submit(CallRequest::new("cron.run", json!({})));
        let (connect_id, _, _) = request_id(&sent(&machine.handle(Input::Opened))[0]);
        machine.handle(res(ResponseFrame::ok(&connect_id, json!({}))));

        let failure = ResponseFrame {
            error: None,
            ..ResponseFrame::err(&call_id, "")
        };
        let steps = machine.handle(res(failure));
        assert!(matches!(
            &steps[0],
            Step::Reject { error: GatewayError::Application(msg), .. } if msg == "cron.run failed"
        ));
        assert_eq!(machine.state(), SessionState::Failed);
    }

    #[test]
    fn test_timeout_closes_exactly_once() {
        let mut machine = SessionMachine::new(ConnectAuth::token("t"));
        let (call_id, _) = machine.submit(CallRequest::new("agent", json!({})));
        machine.handle(Input::Opened);

        let steps = machine.handle(Input::TimerExpired);
        assert!(matches!(
            &steps[0],
            Step::Reject { id, error: GatewayError::Timeout(msg) } if id == &call_id && msg.contains("agent")
        ));
        assert_eq!(closes(&steps), 1);
        assert_eq!(machine.state(), SessionState::TimedOut);

        assert!(machine.handle(Input::TransportError("reset".into())).is_empty());
        assert!(machine
            .handle(Input::Closed { code: 1006, reason: String::new() })
            .is_empty());
    }

    #[test]
    fn test_close_with_nothing_outstanding_is_not_an_error() {
        let mut machine = SessionMachine::new(ConnectAuth::token("t"));
        machine.handle(Input::Opened);
        let steps = machine.handle(Input::Closed { code: 1000, reason: "bye".into() });
        assert!(steps.is_empty());
        assert_eq!(machine.state(), SessionState::Completed);
    }

    #[test]
    fn test_unexpected_close_fails_outstanding_calls() {
        let mut machine = SessionMachine::new(device_auth());
        let (call_id, _) = machine.submit(CallRequest::new("agent", json!({})));
        machine.handle(Input::Opened);

        let steps = machine.handle(Input::Closed { code: 1011, reason: "restart".into() });
        assert!(matches!(
            &steps[0],
            Step::Reject { id, error: GatewayError::Connection(msg) } if id == &call_id && msg == "gateway closed (1011): restart"
        ));
        // Peer closed the socket, so no close step.
        assert_eq!(closes(&steps), 0);
    }

    #[test]
    fn test_concurrent_calls_correlate_out_of_order() {
        let mut machine = SessionMachine::new(ConnectAuth::token("t"));
        let (first, _) = machine.submit(CallRequest::new("status", json!({})));
        let (second, _) = machine.submit(CallRequest::new("cron.list", json!({})));
        let (connect_id, _, _) = request_id(&sent(&machine.handle(Input::Opened))[0]);

        let steps = machine.handle(res(ResponseFrame::ok(&connect_id, json!({}))));
        assert_eq!(sent(&steps).len(), 2);

        let (third, steps) = machine.submit(CallRequest::new("health", json!({})));
        assert_eq!(sent(&steps).len(), 1);

        let steps = machine.handle(res(ResponseFrame::ok(&second, json!({ "jobs": [] }))));
        assert!(matches!(&steps[0], Step::Resolve { id, .. } if id == &second));
        assert_eq!(closes(&steps), 0);

        // Duplicate frame for a settled id is ignored.
        assert!(machine.handle(res(ResponseFrame::ok(&second, json!({})))).is_empty());

        machine.handle(res(ResponseFrame::err(&third, "nope")));
        let steps = machine.handle(res(ResponseFrame::ok(&first, json!({}))));
        assert!(matches!(&steps[0], Step::Resolve { id, .. } if id == &first));
        assert_eq!(closes(&steps), 1);
        assert_eq!(machine.state(), SessionState::Completed);
    }

    #[test]
    fn test_submit_after_finish_rejects() {
        let mut machine = SessionMachine::new(ConnectAuth::token("t"));
        machine.handle(Input::TimerExpired);
        let (id, steps) = machine.submit(CallRequest::new("agent", json!({})));
        assert!(matches!(&steps[0], Step::Reject { id: rid, error: GatewayError::Connection(_) } if rid == &id));
    }
}
