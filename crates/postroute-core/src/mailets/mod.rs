//! Builtin mailets
//!
//! Each mailet is constructed from a step declaration's key/value
//! configuration by the capability registry.

use crate::pipeline::{Mailet, StepError};
use crate::score::{
    GateOutcome, RejectContext, ScoreBoard, ScoreGate, COMPOSED_SCORE_ATTR, MESSAGE_SCORE_ATTR,
    MESSAGE_TOTAL_ATTR, SCORE_COMPOSED_HEADER, SCORE_HEADER, SESSION_TOTAL_ATTR,
};
use async_trait::async_trait;
use postroute_common::{mail::state, Mail};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Set a header on the payload.
pub struct AddHeader {
    header: String,
    value: String,
}

impl AddHeader {
    pub fn new(header: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Mailet for AddHeader {
    fn name(&self) -> &str {
        "add-header"
    }

    async fn service(&self, mail: &mut Mail) -> Result<(), StepError> {
        mail.payload_mut().set_header(&self.header, &self.value);
        Ok(())
    }
}

/// Reroute the mail to a named processor, optionally recording a notice.
pub struct ToProcessor {
    processor: String,
    notice: Option<String>,
}

impl ToProcessor {
    pub fn new(processor: impl Into<String>) -> Self {
        Self {
            processor: processor.into(),
            notice: None,
        }
    }

    pub fn with_notice(mut self, notice: impl Into<String>) -> Self {
        self.notice = Some(notice.into());
        self
    }
}

#[async_trait]
impl Mailet for ToProcessor {
    fn name(&self) -> &str {
        "to-processor"
    }

    async fn service(&self, mail: &mut Mail) -> Result<(), StepError> {
        if let Some(notice) = &self.notice {
            mail.set_error_message(notice);
        }
        mail.set_state(&self.processor);
        Ok(())
    }
}

/// Terminate the mail silently.
pub struct Discard;

#[async_trait]
impl Mailet for Discard {
    fn name(&self) -> &str {
        "discard"
    }

    async fn service(&self, mail: &mut Mail) -> Result<(), StepError> {
        debug!(mail = mail.name(), "discarding mail");
        mail.set_state(state::VANISH);
        Ok(())
    }
}

/// Contribute a named score to the message-scoped store.
pub struct AddScore {
    check: String,
    score: f64,
}

impl AddScore {
    pub fn new(check: impl Into<String>, score: f64) -> Self {
        Self {
            check: check.into(),
            score,
        }
    }
}

#[async_trait]
impl Mailet for AddScore {
    fn name(&self) -> &str {
        "add-score"
    }

    async fn service(&self, mail: &mut Mail) -> Result<(), StepError> {
        let mut board = ScoreBoard::from_attribute(mail, MESSAGE_SCORE_ATTR)
            .map_err(|e| StepError::Unexpected(e.to_string()))?;
        board.set(&self.check, self.score);
        board
            .store(mail, MESSAGE_SCORE_ATTR)
            .map_err(|e| StepError::Unexpected(e.to_string()))?;
        Ok(())
    }
}

/// Apply the score gate in the mailet layer.
///
/// The message-scoped store comes from the mail's attributes; there is no
/// session store at this layer, so the composed total equals the message
/// total. A rejection reroutes the mail to the configured processor
/// (`error` unless overridden) with the rejection reason recorded.
pub struct ScoreGateMailet {
    gate: ScoreGate,
    reject_processor: String,
}

impl ScoreGateMailet {
    pub fn new(gate: ScoreGate) -> Self {
        Self {
            gate,
            reject_processor: state::ERROR.to_string(),
        }
    }

    pub fn with_reject_processor(mut self, processor: impl Into<String>) -> Self {
        self.reject_processor = processor.into();
        self
    }
}

#[async_trait]
impl Mailet for ScoreGateMailet {
    fn name(&self) -> &str {
        "score-gate"
    }

    async fn service(&self, mail: &mut Mail) -> Result<(), StepError> {
        let session = ScoreBoard::new();
        let message = ScoreBoard::from_attribute(mail, MESSAGE_SCORE_ATTR)
            .map_err(|e| StepError::Unexpected(e.to_string()))?;
        let ctx = RejectContext::from_mail(mail);

        match self.gate.evaluate(&session, &message, &ctx) {
            GateOutcome::Pass => {}
            GateOutcome::Annotate {
                session_total,
                message_total,
                composed_total,
            } => {
                // Totals land under their own keys; the store itself stays
                // intact for any gate later in the pipeline.
                let attrs = mail.attributes_mut();
                attrs.set(SESSION_TOTAL_ATTR, serde_json::json!(session_total));
                attrs.set(MESSAGE_TOTAL_ATTR, serde_json::json!(message_total));
                attrs.set(COMPOSED_SCORE_ATTR, serde_json::json!(composed_total));
            }
            GateOutcome::Tag {
                checks,
                composed_total,
            } => {
                let payload = mail.payload_mut();
                payload.set_header(SCORE_HEADER, checks);
                payload.set_header(SCORE_COMPOSED_HEADER, composed_total.to_string());
            }
            GateOutcome::Reject(rejection) => {
                mail.set_error_message(&rejection.reason);
                mail.set_state(&self.reject_processor);
            }
        }
        Ok(())
    }
}

/// Verdict returned by an external content scanner.
#[derive(Debug, Deserialize)]
pub struct ScanVerdict {
    pub score: f64,
    pub required: f64,
    pub spam: bool,
}

/// Send the message through an external scanner daemon over HTTP and
/// record the verdict.
///
/// The header `X-Spam-Status` is added to every message with the score
/// and the scanner's threshold; `X-Spam-Flag: YES` is added when the
/// verdict is spam. The score also lands in the message-scoped store so
/// a later gate can act on it. A scanner that cannot be reached is a
/// recoverable processing failure, not a pipeline fault.
pub struct SpamScan {
    endpoint: String,
    check: String,
    client: reqwest::Client,
}

impl SpamScan {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            check: "SPAM_SCAN".to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.check = check.into();
        self
    }
}

#[async_trait]
impl Mailet for SpamScan {
    fn name(&self) -> &str {
        "spam-scan"
    }

    async fn service(&self, mail: &mut Mail) -> Result<(), StepError> {
        let body = mail.payload().to_bytes();
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "message/rfc822")
            .body(body)
            .send()
            .await
            .map_err(|e| StepError::Processing(format!("scanner unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(StepError::Processing(format!(
                "scanner returned status {}",
                response.status()
            )));
        }

        let verdict: ScanVerdict = response
            .json()
            .await
            .map_err(|e| StepError::Processing(format!("invalid scanner verdict: {e}")))?;

        debug!(
            mail = mail.name(),
            score = verdict.score,
            spam = verdict.spam,
            "scanner verdict received"
        );

        let status = format!(
            "{}, score={} required={}",
            if verdict.spam { "Yes" } else { "No" },
            verdict.score,
            verdict.required
        );
        mail.payload_mut().set_header("X-Spam-Status", status);
        if verdict.spam {
            mail.payload_mut().set_header("X-Spam-Flag", "YES");
        }

        let mut board = ScoreBoard::from_attribute(mail, MESSAGE_SCORE_ATTR)
            .map_err(|e| StepError::Unexpected(e.to_string()))?;
        board.set(&self.check, verdict.score);
        board
            .store(mail, MESSAGE_SCORE_ATTR)
            .map_err(|e| StepError::Unexpected(e.to_string()))?;
        Ok(())
    }
}
