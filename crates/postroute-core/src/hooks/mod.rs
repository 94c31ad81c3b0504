//! Protocol hook layer.
//!
//! Hooks run while the message is still on the wire, before it is
//! accepted into the spool. A hook inspects the session and the mail and
//! answers with a return code; the first hook that does not decline
//! decides the message's fate.

use crate::score::{GateOutcome, RejectContext, ScoreBoard, ScoreGate};
use async_trait::async_trait;
use postroute_common::{EmailAddress, Mail};
use tracing::debug;

/// Per-connection state visible to hooks.
///
/// The two score stores are created lazily on first use, matching the
/// session attribute pattern of the wire protocol handlers: a connection
/// that never triggers a scoring hook pays nothing.
pub struct HookSession {
    remote_host: String,
    remote_addr: String,
    sender: Option<EmailAddress>,
    connection_scores: Option<ScoreBoard>,
    message_scores: Option<ScoreBoard>,
}

impl HookSession {
    pub fn new(remote_host: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_addr: remote_addr.into(),
            sender: None,
            connection_scores: None,
            message_scores: None,
        }
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn sender(&self) -> Option<&EmailAddress> {
        self.sender.as_ref()
    }

    pub fn set_sender(&mut self, sender: Option<EmailAddress>) {
        self.sender = sender;
    }

    /// Connection-scoped store, created on first access. Survives across
    /// the messages of one connection.
    pub fn connection_scores(&mut self) -> &mut ScoreBoard {
        self.connection_scores.get_or_insert_with(ScoreBoard::new)
    }

    /// Message-scoped store, created on first access. Cleared between
    /// messages by [`reset_message_scope`](Self::reset_message_scope).
    pub fn message_scores(&mut self) -> &mut ScoreBoard {
        self.message_scores.get_or_insert_with(ScoreBoard::new)
    }

    /// Both stores at once, for evaluation sites that need the pair.
    pub fn scores(&mut self) -> (&ScoreBoard, &ScoreBoard) {
        (
            self.connection_scores.get_or_insert_with(ScoreBoard::new),
            self.message_scores.get_or_insert_with(ScoreBoard::new),
        )
    }

    /// Drop message-scoped state at end-of-message so the next message on
    /// this connection starts clean. Connection-scoped scores persist.
    pub fn reset_message_scope(&mut self) {
        self.message_scores = None;
    }
}

/// What a hook decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookReturnCode {
    /// No opinion, ask the next hook.
    Declined,
    /// Accept the message.
    Ok,
    /// Permanent rejection.
    Deny,
    /// Temporary rejection.
    DenySoft,
}

/// A return code plus the protocol-visible reply for non-declined
/// outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct HookResult {
    pub code: HookReturnCode,
    pub smtp_code: Option<u16>,
    pub reason: Option<String>,
}

impl HookResult {
    pub fn declined() -> Self {
        Self {
            code: HookReturnCode::Declined,
            smtp_code: None,
            reason: None,
        }
    }

    pub fn ok() -> Self {
        Self {
            code: HookReturnCode::Ok,
            smtp_code: None,
            reason: None,
        }
    }

    pub fn deny(smtp_code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: HookReturnCode::Deny,
            smtp_code: Some(smtp_code),
            reason: Some(reason.into()),
        }
    }
}

/// A hook invoked once per message, after the payload is complete but
/// before spooling.
#[async_trait]
pub trait MessageHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_message(&self, session: &mut HookSession, mail: &mut Mail) -> HookResult;
}

/// Run hooks in order; the first non-declined result wins. All hooks
/// declining means the message is accepted.
pub async fn run_hooks(
    hooks: &[Box<dyn MessageHook>],
    session: &mut HookSession,
    mail: &mut Mail,
) -> HookResult {
    for hook in hooks {
        let result = hook.on_message(session, mail).await;
        if result.code != HookReturnCode::Declined {
            debug!(
                mail = mail.name(),
                hook = hook.name(),
                code = ?result.code,
                "hook decided message fate"
            );
            return result;
        }
    }
    HookResult::ok()
}

/// Applies the score gate at the protocol layer, where both the
/// connection-scoped and message-scoped stores are live.
///
/// With the `reject` action a message over the threshold is refused on
/// the wire with a permanent failure; the other actions mutate the mail
/// and decline so later hooks still run.
pub struct ScoreGateHook {
    gate: ScoreGate,
}

impl ScoreGateHook {
    pub fn new(gate: ScoreGate) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl MessageHook for ScoreGateHook {
    fn name(&self) -> &str {
        "score-gate"
    }

    async fn on_message(&self, session: &mut HookSession, mail: &mut Mail) -> HookResult {
        let ctx = RejectContext {
            sender: session
                .sender()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "<>".to_string()),
            remote_host: session.remote_host().to_string(),
            remote_addr: session.remote_addr().to_string(),
        };
        let (connection, message) = session.scores();

        match self.gate.evaluate(connection, message, &ctx) {
            GateOutcome::Reject(rejection) => {
                HookResult::deny(rejection.code, rejection.reason)
            }
            GateOutcome::Tag {
                checks,
                composed_total,
            } => {
                let payload = mail.payload_mut();
                payload.set_header(crate::score::SCORE_HEADER, checks);
                payload.set_header(
                    crate::score::SCORE_COMPOSED_HEADER,
                    composed_total.to_string(),
                );
                HookResult::declined()
            }
            GateOutcome::Annotate {
                session_total,
                message_total,
                composed_total,
            } => {
                let attrs = mail.attributes_mut();
                attrs.set(
                    crate::score::SESSION_TOTAL_ATTR,
                    serde_json::json!(session_total),
                );
                attrs.set(
                    crate::score::MESSAGE_TOTAL_ATTR,
                    serde_json::json!(message_total),
                );
                attrs.set(
                    crate::score::COMPOSED_SCORE_ATTR,
                    serde_json::json!(composed_total),
                );
                HookResult::declined()
            }
            GateOutcome::Pass => HookResult::declined(),
        }
    }
}
