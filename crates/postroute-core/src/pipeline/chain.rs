//! Linear processor: ordered matcher/mailet pairs scoped to one state.

use super::{Mailet, Matcher, StepError};
use postroute_common::{mail::state, Mail};
use std::sync::Arc;
use tracing::{debug, error};

/// One matcher/mailet pair.
#[derive(Clone)]
pub struct StepPair {
    pub matcher: Arc<dyn Matcher>,
    pub mailet: Arc<dyn Mailet>,
}

/// A named, immutable, ordered list of matcher/mailet pairs.
///
/// Built once from configuration; execution is deterministic and every
/// step sees the mutations of the steps before it.
pub struct LinearChain {
    name: String,
    pairs: Vec<StepPair>,
}

impl LinearChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pairs: Vec::new(),
        }
    }

    /// Append a pair during assembly. Chains are never mutated once the
    /// router owns them.
    pub fn push(&mut self, matcher: Arc<dyn Matcher>, mailet: Arc<dyn Mailet>) {
        self.pairs.push(StepPair { matcher, mailet });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Run the chain over a mail.
    ///
    /// Matchers only gate whether a mailet runs; a mailet always operates
    /// on the whole mail. A state change short-circuits the remaining
    /// pairs. Faults never escape: they are converted into a state
    /// transition per the error routing policy.
    pub async fn execute(&self, mail: &mut Mail) {
        for (index, pair) in self.pairs.iter().enumerate() {
            let matched = pair.matcher.matches(mail);
            if matched.is_empty() {
                debug!(
                    mail = mail.name(),
                    processor = self.name,
                    step = index,
                    matcher = pair.matcher.name(),
                    "no recipient matched, skipping step"
                );
                continue;
            }

            debug!(
                mail = mail.name(),
                processor = self.name,
                step = index,
                mailet = pair.mailet.name(),
                matched = matched.resolve(mail).len(),
                "servicing mail"
            );

            if let Err(fault) = pair.mailet.service(mail).await {
                self.handle_fault(mail, pair.mailet.name(), fault);
                return;
            }

            if mail.state() != self.name {
                debug!(
                    mail = mail.name(),
                    processor = self.name,
                    new_state = mail.state(),
                    "state changed, leaving processor"
                );
                return;
            }
        }
    }

    /// Error routing policy.
    ///
    /// Inside the error chain any fault terminates the mail (`vanish`),
    /// otherwise an endless error loop could form. Everywhere else both
    /// recoverable failures and unexpected faults reroute to `error`; the
    /// distinction is kept in the log.
    fn handle_fault(&self, mail: &mut Mail, mailet: &str, fault: StepError) {
        let recoverable = matches!(fault, StepError::Processing(_));
        error!(
            mail = mail.name(),
            processor = self.name,
            mailet,
            recoverable,
            "step failed: {fault}"
        );

        mail.set_error_message(fault.to_string());
        if self.name == state::ERROR {
            mail.set_state(state::VANISH);
        } else {
            mail.set_state(state::ERROR);
        }
    }
}
