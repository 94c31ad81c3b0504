//! Builtin matchers
//!
//! Matchers are pure predicates over a mail's recipients. Each one here is
//! constructed from a step declaration's condition string by the
//! capability registry.

use crate::pipeline::{Matched, Matcher};
use postroute_common::{EmailAddress, Error, Mail, Result};
use regex::Regex;
use std::collections::HashSet;

/// Matches every recipient.
pub struct All;

impl Matcher for All {
    fn name(&self) -> &str {
        "all"
    }

    fn matches(&self, _mail: &Mail) -> Matched {
        Matched::All
    }
}

/// Exact-membership match against a configured address set.
///
/// Condition: addresses separated by whitespace or commas, e.g.
/// `"a@x.org, b@x.org"`.
pub struct RecipientIs {
    recipients: HashSet<EmailAddress>,
}

impl RecipientIs {
    pub fn parse(condition: &str) -> Result<Self> {
        let mut recipients = HashSet::new();
        for token in condition.split([',', ' ', '\t']).filter(|t| !t.is_empty()) {
            let address = EmailAddress::parse(token).ok_or_else(|| {
                Error::Config(format!("recipient-is: invalid address '{token}'"))
            })?;
            recipients.insert(address);
        }
        if recipients.is_empty() {
            return Err(Error::Config(
                "recipient-is: condition lists no addresses".to_string(),
            ));
        }
        Ok(Self { recipients })
    }
}

impl Matcher for RecipientIs {
    fn name(&self) -> &str {
        "recipient-is"
    }

    fn matches(&self, mail: &Mail) -> Matched {
        let matched = mail
            .recipients()
            .iter()
            .filter(|r| self.recipients.contains(r))
            .cloned()
            .collect();
        Matched::Recipients(matched)
    }
}

/// Matches every recipient when the payload carries the named header,
/// optionally with a value matching a regex.
///
/// Condition: `Header-Name` or `Header-Name=pattern`.
pub struct HasHeader {
    header: String,
    pattern: Option<Regex>,
}

impl HasHeader {
    pub fn parse(condition: &str) -> Result<Self> {
        let condition = condition.trim();
        if condition.is_empty() {
            return Err(Error::Config(
                "has-header: condition names no header".to_string(),
            ));
        }
        match condition.split_once('=') {
            Some((header, pattern)) => {
                let regex = Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("has-header: invalid pattern '{pattern}': {e}"))
                })?;
                Ok(Self {
                    header: header.trim().to_string(),
                    pattern: Some(regex),
                })
            }
            None => Ok(Self {
                header: condition.to_string(),
                pattern: None,
            }),
        }
    }
}

impl Matcher for HasHeader {
    fn name(&self) -> &str {
        "has-header"
    }

    fn matches(&self, mail: &Mail) -> Matched {
        let hit = mail
            .payload()
            .get_headers(&self.header)
            .into_iter()
            .any(|value| match &self.pattern {
                Some(regex) => regex.is_match(value),
                None => true,
            });
        if hit {
            Matched::All
        } else {
            Matched::Recipients(vec![])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postroute_common::Payload;
    use pretty_assertions::assert_eq;

    fn mail_to(addrs: &[&str]) -> Mail {
        Mail::new(
            None,
            addrs.iter().map(|a| EmailAddress::parse(a).unwrap()).collect(),
            Payload::new(),
        )
    }

    #[test]
    fn test_recipient_is_selects_subset() {
        let matcher = RecipientIs::parse("a@x.org, c@x.org").unwrap();
        let mail = mail_to(&["a@x.org", "b@x.org"]);

        let matched = matcher.matches(&mail);
        assert_eq!(
            matched,
            Matched::Recipients(vec![EmailAddress::parse("a@x.org").unwrap()])
        );
    }

    #[test]
    fn test_recipient_is_no_hit_means_skip() {
        let matcher = RecipientIs::parse("z@x.org").unwrap();
        let mail = mail_to(&["a@x.org"]);
        assert!(matcher.matches(&mail).is_empty());
    }

    #[test]
    fn test_matcher_purity() {
        let matcher = RecipientIs::parse("a@x.org b@x.org").unwrap();
        let mail = mail_to(&["a@x.org", "b@x.org", "c@x.org"]);

        let first = matcher.matches(&mail);
        let second = matcher.matches(&mail);
        assert_eq!(first, second);
    }

    #[test]
    fn test_recipient_is_rejects_bad_condition() {
        assert!(RecipientIs::parse("not-an-address").is_err());
        assert!(RecipientIs::parse("   ").is_err());
    }

    #[test]
    fn test_has_header_presence() {
        let matcher = HasHeader::parse("X-Spam-Flag").unwrap();
        let mut mail = mail_to(&["a@x.org"]);
        assert!(matcher.matches(&mail).is_empty());

        mail.payload_mut().set_header("X-Spam-Flag", "YES");
        assert_eq!(matcher.matches(&mail), Matched::All);
    }

    #[test]
    fn test_has_header_value_pattern() {
        let matcher = HasHeader::parse("X-Spam-Flag=^YES$").unwrap();
        let mut mail = mail_to(&["a@x.org"]);

        mail.payload_mut().set_header("X-Spam-Flag", "NO");
        assert!(matcher.matches(&mail).is_empty());

        mail.payload_mut().set_header("X-Spam-Flag", "YES");
        assert_eq!(matcher.matches(&mail), Matched::All);
    }
}
