//! The unit of work flowing through the processing pipeline.
//!
//! A [`Mail`] wraps the raw message content with its routing information:
//! envelope sender and recipients, the name of the processor currently
//! responsible for it, an open attribute map used for inter-step
//! communication, and the remote host/address of the submitting client.

use crate::types::EmailAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Reserved processor/state names.
pub mod state {
    /// Initial state of every freshly submitted mail.
    pub const ROOT: &str = "root";
    /// The fault-recovery processor.
    pub const ERROR: &str = "error";
    /// Terminal marker: the mail is discarded, no further processing.
    pub const VANISH: &str = "vanish";
}

/// Open key/value store scoped to one mail.
///
/// Keys are namespaced by convention (e.g. `postroute.score.message`) to
/// avoid collisions between unrelated steps. Last write wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attributes {
    inner: HashMap<String, serde_json::Value>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute, returning the previous value if the key was
    /// already present.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.inner.insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.inner.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.inner.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Raw mail content: an ordered header list plus opaque body bytes.
///
/// Steps mutate the payload in place; header order is preserved so that
/// repeated trace headers keep their relative position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a payload from pre-split parts.
    pub fn from_parts(headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Parse a raw RFC 5322 message into headers and body.
    ///
    /// Header names and unfolded values come from the parser; the body is
    /// kept verbatim (everything past the blank line) so MIME structure
    /// survives untouched.
    pub fn parse(raw: &[u8]) -> crate::Result<Self> {
        let parsed = mail_parser::MessageParser::default()
            .parse(raw)
            .ok_or_else(|| crate::Error::Validation("Failed to parse message".to_string()))?;

        let headers = parsed
            .headers()
            .iter()
            .map(|h| {
                let value = h.value().as_text().unwrap_or_default().to_string();
                (h.name().to_string(), value)
            })
            .collect();

        Ok(Self {
            headers,
            body: body_slice(raw).to_vec(),
        })
    }

    /// First value of the named header, case-insensitive.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of the named header, in order.
    pub fn get_headers(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Replace every occurrence of the named header with a single value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    /// Append a header without removing existing occurrences.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Remove every occurrence of the named header.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Serialize headers and body back into wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Everything past the header/body separator blank line.
fn body_slice(raw: &[u8]) -> &[u8] {
    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        &raw[pos + 4..]
    } else if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        &raw[pos + 2..]
    } else {
        &[]
    }
}

/// A message in flight through the pipeline.
///
/// Owned exclusively by the worker flow currently routing it; the state
/// string names the processor responsible for the mail and is one of the
/// registered processor names or [`state::VANISH`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mail {
    name: String,
    sender: Option<EmailAddress>,
    recipients: Vec<EmailAddress>,
    state: String,
    error_message: Option<String>,
    attributes: Attributes,
    payload: Payload,
    remote_host: String,
    remote_addr: String,
    received_at: DateTime<Utc>,
}

impl Mail {
    /// Create a new mail in the `root` state with a generated unique name.
    pub fn new(
        sender: Option<EmailAddress>,
        recipients: Vec<EmailAddress>,
        payload: Payload,
    ) -> Self {
        Self {
            name: format!("Mail-{}", Uuid::now_v7()),
            sender,
            recipients,
            state: state::ROOT.to_string(),
            error_message: None,
            attributes: Attributes::new(),
            payload,
            remote_host: "localhost".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            received_at: Utc::now(),
        }
    }

    /// Record the host/address of the client that submitted this mail.
    pub fn with_remote(mut self, host: impl Into<String>, addr: impl Into<String>) -> Self {
        self.remote_host = host.into();
        self.remote_addr = addr.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> Option<&EmailAddress> {
        self.sender.as_ref()
    }

    /// Display form of the sender, `<>` for the null reverse-path.
    pub fn sender_display(&self) -> String {
        match &self.sender {
            Some(addr) => addr.to_string(),
            None => "<>".to_string(),
        }
    }

    pub fn recipients(&self) -> &[EmailAddress] {
        &self.recipients
    }

    pub fn set_recipients(&mut self, recipients: Vec<EmailAddress>) {
        self.recipients = recipients;
    }

    /// Remove a single recipient a step has fully handled.
    pub fn remove_recipient(&mut self, recipient: &EmailAddress) -> bool {
        let before = self.recipients.len();
        self.recipients.retain(|r| r != recipient);
        self.recipients.len() != before
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = state.into();
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn set_error_message(&mut self, msg: impl Into<String>) {
        self.error_message = Some(msg.into());
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// When this mail was accepted into the spool.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn recipients(addrs: &[&str]) -> Vec<EmailAddress> {
        addrs.iter().map(|a| EmailAddress::parse(a).unwrap()).collect()
    }

    #[test]
    fn test_new_mail_starts_in_root() {
        let mail = Mail::new(None, recipients(&["a@x.org"]), Payload::new());
        assert_eq!(mail.state(), state::ROOT);
        assert!(mail.error_message().is_none());
        assert!(mail.name().starts_with("Mail-"));
    }

    #[test]
    fn test_mail_names_are_unique() {
        let a = Mail::new(None, vec![], Payload::new());
        let b = Mail::new(None, vec![], Payload::new());
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_sender_display_null_path() {
        let mail = Mail::new(None, vec![], Payload::new());
        assert_eq!(mail.sender_display(), "<>");

        let mail = Mail::new(
            Some(EmailAddress::parse("s@x.org").unwrap()),
            vec![],
            Payload::new(),
        );
        assert_eq!(mail.sender_display(), "s@x.org");
    }

    #[test]
    fn test_remove_recipient() {
        let mut mail = Mail::new(None, recipients(&["a@x.org", "b@x.org"]), Payload::new());
        let gone = EmailAddress::parse("a@x.org").unwrap();
        assert!(mail.remove_recipient(&gone));
        assert_eq!(mail.recipients(), &recipients(&["b@x.org"])[..]);
        assert!(!mail.remove_recipient(&gone));
    }

    #[test]
    fn test_attributes_last_write_wins() {
        let mut attrs = Attributes::new();
        assert!(attrs.set("k", serde_json::json!(1)).is_none());
        let previous = attrs.set("k", serde_json::json!(2));
        assert_eq!(previous, Some(serde_json::json!(1)));
        assert_eq!(attrs.get("k"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_payload_header_case_insensitive() {
        let mut payload = Payload::new();
        payload.set_header("X-Test", "1");
        assert_eq!(payload.get_header("x-test"), Some("1"));

        payload.set_header("x-TEST", "2");
        assert_eq!(payload.get_headers("X-Test"), vec!["2"]);
    }

    #[test]
    fn test_payload_add_vs_set() {
        let mut payload = Payload::new();
        payload.add_header("Received", "hop1");
        payload.add_header("Received", "hop2");
        assert_eq!(payload.get_headers("Received"), vec!["hop1", "hop2"]);

        payload.set_header("Received", "only");
        assert_eq!(payload.get_headers("Received"), vec!["only"]);
    }

    #[test]
    fn test_payload_parse_roundtrip() {
        let raw = b"Subject: hello\r\nFrom: s@x.org\r\nTo: a@x.org\r\n\r\nbody text\r\n";
        let payload = Payload::parse(raw).unwrap();
        assert_eq!(payload.get_header("Subject"), Some("hello"));
        assert_eq!(payload.body(), b"body text\r\n");
    }

    #[test]
    fn test_payload_parse_lf_only() {
        let raw = b"Subject: hi\nFrom: s@x.org\n\nbody\n";
        let payload = Payload::parse(raw).unwrap();
        assert_eq!(payload.get_header("Subject"), Some("hi"));
        assert_eq!(payload.body(), b"body\n");
    }
}
