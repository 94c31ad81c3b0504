//! Score aggregation and threshold gating
//!
//! Independent checks accumulate named numeric scores into scoped stores
//! (one per protocol session, one per message). A [`ScoreGate`] composes
//! the stores by summation and performs a configured action once the
//! composed total is evaluated against a threshold. The gate is layer
//! agnostic: the mailet chain and the protocol hook layer apply the same
//! logic, each translating the outcome into its own side effects.

use postroute_common::{Error, Mail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Attribute key holding the serialized message-scoped store.
pub const MESSAGE_SCORE_ATTR: &str = "postroute.score.message";
/// Attribute key for the session store total written by `annotate`.
pub const SESSION_TOTAL_ATTR: &str = "postroute.score.session.total";
/// Attribute key for the message store total written by `annotate`.
/// Distinct from [`MESSAGE_SCORE_ATTR`] so annotating never clobbers the
/// store itself.
pub const MESSAGE_TOTAL_ATTR: &str = "postroute.score.message.total";
/// Attribute key for the composed total written by `annotate`.
pub const COMPOSED_SCORE_ATTR: &str = "postroute.score.composed";

/// Header carrying the per-check score lines written by `tag`.
pub const SCORE_HEADER: &str = "X-Score";
/// Header carrying the composed total written by `tag`.
pub const SCORE_COMPOSED_HEADER: &str = "X-Score-Composed";

/// SMTP reply code used for threshold rejections.
pub const REJECT_CODE: u16 = 550;

/// Enhanced status code prefixed to the rejection reason.
pub const REJECT_STATUS: &str = "5.7.0";

/// A named store of numeric scores, scoped to one message or one session.
///
/// Keys iterate in a stable order so header lines and log output are
/// deterministic. Writing an existing key replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBoard {
    scores: BTreeMap<String, f64>,
}

impl ScoreBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a score under a check name, returning the replaced value.
    pub fn set(&mut self, key: impl Into<String>, score: f64) -> Option<f64> {
        self.scores.insert(key.into(), score)
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.scores.get(key).copied()
    }

    /// Sum of every stored score.
    pub fn total(&self) -> f64 {
        self.scores.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.scores.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn clear(&mut self) {
        self.scores.clear();
    }

    /// Read a score store carried in a mail's attributes. An absent key is
    /// an empty store; a present value that does not deserialize is a
    /// fault, not an empty store, so a clobbered key cannot silently
    /// disable a downstream gate.
    pub fn from_attribute(mail: &Mail, key: &str) -> Result<Self> {
        match mail.attributes().get(key) {
            None => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::Unexpected(format!("malformed score store at '{key}': {e}"))
            }),
        }
    }

    /// Write the store back into a mail's attributes.
    pub fn store(&self, mail: &mut Mail, key: &str) -> Result<()> {
        let value = serde_json::to_value(self)
            .map_err(|e| Error::Unexpected(format!("score serialization failed: {e}")))?;
        mail.attributes_mut().set(key, value);
        Ok(())
    }
}

/// Two scoped stores composed by simple summation.
pub struct ComposedScore<'a> {
    session: &'a ScoreBoard,
    message: &'a ScoreBoard,
}

impl<'a> ComposedScore<'a> {
    pub fn new(session: &'a ScoreBoard, message: &'a ScoreBoard) -> Self {
        Self { session, message }
    }

    /// `session total + message total`.
    pub fn total(&self) -> f64 {
        self.session.total() + self.message.total()
    }

    /// Merged per-check view; a message-scoped check shadows a
    /// session-scoped check of the same name.
    pub fn merged(&self) -> BTreeMap<String, f64> {
        let mut merged: BTreeMap<String, f64> = BTreeMap::new();
        for (key, score) in self.session.iter() {
            merged.insert(key.to_string(), score);
        }
        for (key, score) in self.message.iter() {
            merged.insert(key.to_string(), score);
        }
        merged
    }

    /// Per-check header line: `key=value; ` for every contributing check.
    pub fn header_line(&self) -> String {
        let mut line = String::new();
        for (key, score) in self.merged() {
            line.push_str(&key);
            line.push('=');
            line.push_str(&score.to_string());
            line.push_str("; ");
        }
        line
    }
}

/// Action a gate performs once the composed score is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    /// Store totals as attributes, no control-flow effect.
    Annotate,
    /// Store per-check scores as header lines, no control-flow effect.
    Tag,
    /// Deny once the composed total strictly exceeds the maximum.
    Reject,
}

impl std::str::FromStr for GateAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "annotate" => Ok(GateAction::Annotate),
            "tag" => Ok(GateAction::Tag),
            "reject" => Ok(GateAction::Reject),
            other => Err(Error::Config(format!("Illegal gate action: {other}"))),
        }
    }
}

/// Identity of the mail being gated, used in the rejection log line.
#[derive(Debug, Clone)]
pub struct RejectContext {
    pub sender: String,
    pub remote_host: String,
    pub remote_addr: String,
}

impl RejectContext {
    pub fn from_mail(mail: &Mail) -> Self {
        Self {
            sender: mail.sender_display(),
            remote_host: mail.remote_host().to_string(),
            remote_addr: mail.remote_addr().to_string(),
        }
    }
}

/// Structured threshold rejection: a deliberate terminal outcome, not a
/// fault.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub code: u16,
    pub reason: String,
    pub max_score: f64,
    pub composed_total: f64,
}

/// What a gate decided for one mail.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Nothing to do (reject action below threshold).
    Pass,
    /// Totals to record as attributes.
    Annotate {
        session_total: f64,
        message_total: f64,
        composed_total: f64,
    },
    /// Per-check lines and composed total to record as headers.
    Tag {
        checks: String,
        composed_total: f64,
    },
    /// Deny with a structured reason.
    Reject(Rejection),
}

/// Threshold gate over composed scores.
///
/// The reject comparison is strictly greater-than: a composed total equal
/// to the configured maximum passes. Downstream tooling parses the log
/// line, so its field order is a compatibility contract.
#[derive(Debug, Clone)]
pub struct ScoreGate {
    action: GateAction,
    max_score: f64,
}

impl ScoreGate {
    pub fn new(action: GateAction, max_score: f64) -> Self {
        Self { action, max_score }
    }

    pub fn action(&self) -> GateAction {
        self.action
    }

    pub fn max_score(&self) -> f64 {
        self.max_score
    }

    /// Evaluate the composed score and decide the outcome. The caller
    /// applies the outcome to its own layer (attributes/headers in the
    /// mailet chain, SMTP reply in the hook layer).
    pub fn evaluate(
        &self,
        session: &ScoreBoard,
        message: &ScoreBoard,
        ctx: &RejectContext,
    ) -> GateOutcome {
        let composed = ComposedScore::new(session, message);

        match self.action {
            GateAction::Annotate => GateOutcome::Annotate {
                session_total: session.total(),
                message_total: message.total(),
                composed_total: composed.total(),
            },
            GateAction::Tag => GateOutcome::Tag {
                checks: composed.header_line(),
                composed_total: composed.total(),
            },
            GateAction::Reject => {
                let total = composed.total();
                if self.max_score < total {
                    // Operators parse this text; field order is a contract.
                    let reason = format!(
                        "{} Rejected message from {} from host {} ({}). This message \
                         reached the spam hits threshold. Please contact the Postmaster \
                         if the email is not SPAM. Required rejection hits: {} hits: {}. \
                         Message rejected",
                        REJECT_STATUS,
                        ctx.sender,
                        ctx.remote_host,
                        ctx.remote_addr,
                        self.max_score,
                        total
                    );
                    info!("{reason}");
                    GateOutcome::Reject(Rejection {
                        code: REJECT_CODE,
                        reason,
                        max_score: self.max_score,
                        composed_total: total,
                    })
                } else {
                    GateOutcome::Pass
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> RejectContext {
        RejectContext {
            sender: "s@x.org".to_string(),
            remote_host: "mx.remote.example".to_string(),
            remote_addr: "192.0.2.7".to_string(),
        }
    }

    #[test]
    fn test_score_board_total_and_replace() {
        let mut board = ScoreBoard::new();
        assert!(board.set("DNSBL", 2.5).is_none());
        board.set("HELO_CHECK", 1.0);
        assert_eq!(board.total(), 3.5);

        // Last write wins for a repeated check name.
        assert_eq!(board.set("DNSBL", 4.0), Some(2.5));
        assert_eq!(board.total(), 5.0);
    }

    #[test]
    fn test_composition_law_is_order_independent() {
        let mut session = ScoreBoard::new();
        session.set("CONN_CHECK", 1.5);
        session.set("HELO_CHECK", 0.5);

        let mut message = ScoreBoard::new();
        message.set("BODY_CHECK", 3.0);

        let composed = ComposedScore::new(&session, &message);
        assert_eq!(composed.total(), session.total() + message.total());
        assert_eq!(composed.total(), 5.0);

        // Writing the same keys in a different order composes identically.
        let mut session2 = ScoreBoard::new();
        session2.set("HELO_CHECK", 0.5);
        session2.set("CONN_CHECK", 1.5);
        let composed2 = ComposedScore::new(&session2, &message);
        assert_eq!(composed2.total(), composed.total());
    }

    #[test]
    fn test_header_line_format() {
        let mut session = ScoreBoard::new();
        session.set("CONN_CHECK", 1.5);
        let mut message = ScoreBoard::new();
        message.set("BODY_CHECK", 3.0);

        let composed = ComposedScore::new(&session, &message);
        assert_eq!(composed.header_line(), "BODY_CHECK=3; CONN_CHECK=1.5; ");
    }

    #[test]
    fn test_reject_requires_strictly_greater() {
        let mut message = ScoreBoard::new();
        message.set("A", 3.0);
        message.set("B", 4.0);
        let session = ScoreBoard::new();

        // Equality does not reject.
        let gate = ScoreGate::new(GateAction::Reject, 7.0);
        assert_eq!(gate.evaluate(&session, &message, &ctx()), GateOutcome::Pass);

        // One unit above does.
        let gate = ScoreGate::new(GateAction::Reject, 6.0);
        match gate.evaluate(&session, &message, &ctx()) {
            GateOutcome::Reject(rejection) => {
                assert_eq!(rejection.code, REJECT_CODE);
                assert_eq!(rejection.max_score, 6.0);
                assert_eq!(rejection.composed_total, 7.0);
                assert!(rejection.reason.contains(
                    "Rejected message from s@x.org from host mx.remote.example (192.0.2.7)"
                ));
                assert!(rejection
                    .reason
                    .contains("Required rejection hits: 6 hits: 7"));
                assert!(rejection.reason.ends_with("Message rejected"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_annotate_reports_both_store_totals() {
        let mut session = ScoreBoard::new();
        session.set("CONN_CHECK", 2.0);
        let mut message = ScoreBoard::new();
        message.set("BODY_CHECK", 3.0);

        let gate = ScoreGate::new(GateAction::Annotate, 0.0);
        assert_eq!(
            gate.evaluate(&session, &message, &ctx()),
            GateOutcome::Annotate {
                session_total: 2.0,
                message_total: 3.0,
                composed_total: 5.0,
            }
        );
    }

    #[test]
    fn test_gate_action_from_str() {
        assert_eq!("reject".parse::<GateAction>().unwrap(), GateAction::Reject);
        assert_eq!("Tag".parse::<GateAction>().unwrap(), GateAction::Tag);
        assert!("drop".parse::<GateAction>().is_err());
    }

    #[test]
    fn test_score_board_attribute_roundtrip() {
        let mut mail = Mail::new(None, vec![], postroute_common::Payload::new());
        let mut board = ScoreBoard::from_attribute(&mail, MESSAGE_SCORE_ATTR).unwrap();
        assert!(board.is_empty());

        board.set("BODY_CHECK", 3.0);
        board.store(&mut mail, MESSAGE_SCORE_ATTR).unwrap();

        let restored = ScoreBoard::from_attribute(&mail, MESSAGE_SCORE_ATTR).unwrap();
        assert_eq!(restored, board);
        assert_eq!(restored.total(), 3.0);
    }

    #[test]
    fn test_malformed_score_attribute_is_a_fault() {
        let mut mail = Mail::new(None, vec![], postroute_common::Payload::new());
        mail.attributes_mut()
            .set(MESSAGE_SCORE_ATTR, serde_json::json!(7.0));

        let err = ScoreBoard::from_attribute(&mail, MESSAGE_SCORE_ATTR).unwrap_err();
        assert!(err.to_string().contains(MESSAGE_SCORE_ATTR));
    }
}
