//! Pipeline contracts and assembly
//!
//! A [`Matcher`] is a pure predicate selecting which recipients a step
//! applies to; a [`Mailet`] is a side-effecting transform over the whole
//! mail. Chains execute ordered pairs of the two, the router dispatches a
//! mail to the chain named by its current state, and the registry builds
//! the whole table from configuration once at startup.

mod chain;
mod registry;
mod router;

pub use chain::{LinearChain, StepPair};
pub use registry::{CapabilityRegistry, MailetFactory, MatcherFactory};
pub use router::StateRouter;

use async_trait::async_trait;
use postroute_common::{EmailAddress, Mail};
use thiserror::Error;

/// Result of running a matcher over a mail's recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matched {
    /// Every recipient matches.
    All,
    /// The listed subset of recipients matches; empty means "skip".
    Recipients(Vec<EmailAddress>),
}

impl Matched {
    /// No recipient matched, so the paired mailet must not run.
    pub fn is_empty(&self) -> bool {
        match self {
            Matched::All => false,
            Matched::Recipients(r) => r.is_empty(),
        }
    }

    /// The concrete matched subset for a given mail.
    pub fn resolve(&self, mail: &Mail) -> Vec<EmailAddress> {
        match self {
            Matched::All => mail.recipients().to_vec(),
            Matched::Recipients(r) => r.clone(),
        }
    }
}

/// Recipient predicate.
///
/// Implementations must be pure: no side effects, and two calls against an
/// unmutated mail yield the same subset. The returned recipients must be a
/// subset of `mail.recipients()`.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, mail: &Mail) -> Matched;
}

/// Failure raised by a processing step.
///
/// The chain fault policy pattern-matches on this instead of catching a
/// broad error base: `Processing` is the handled, typed failure of a
/// downstream collaborator; `Unexpected` is everything else.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Processing(String),

    #[error("{0}")]
    Unexpected(String),
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        StepError::Unexpected(format!("{e:#}"))
    }
}

/// Side-effecting processing step (mailet).
///
/// May mutate payload, attributes, recipients, and state. Implementations
/// must not retain references to the mail beyond the call; ownership stays
/// with the routing worker.
#[async_trait]
pub trait Mailet: Send + Sync {
    fn name(&self) -> &str;

    async fn service(&self, mail: &mut Mail) -> Result<(), StepError>;
}
