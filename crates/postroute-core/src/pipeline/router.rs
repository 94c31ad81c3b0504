//! State router: dispatches a mail to its current-state chain until a
//! terminal outcome.

use super::LinearChain;
use postroute_common::{mail::state, Error, Mail, Result};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Fixed name-to-chain registry, built once at startup and read-only for
/// the remainder of the process lifetime.
pub struct StateRouter {
    chains: HashMap<String, LinearChain>,
}

// Chains hold trait objects, so show the registered names only.
impl fmt::Debug for StateRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.chains.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("StateRouter").field("chains", &names).finish()
    }
}

impl StateRouter {
    /// Build the router from assembled chains, keyed by chain name.
    pub fn new(chains: Vec<LinearChain>) -> Self {
        Self {
            chains: chains
                .into_iter()
                .map(|c| (c.name().to_string(), c))
                .collect(),
        }
    }

    pub fn chain(&self, name: &str) -> Option<&LinearChain> {
        self.chains.get(name)
    }

    pub fn chain_names(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    /// Drive a mail through the pipeline until it terminates.
    ///
    /// On each iteration the chain named by the mail's state runs; a chain
    /// run that leaves the state unchanged means the mail was fully
    /// handled there. An unknown state is a configuration fault: the mail
    /// is rerouted to the error chain with a diagnostic, and only when the
    /// error chain itself is unregistered does routing fail to the caller.
    /// A second visit to the error chain forces `vanish` so a faulty error
    /// chain cannot loop.
    pub async fn route(&self, mail: &mut Mail) -> Result<()> {
        let mut error_visits = 0u32;

        loop {
            let current = mail.state().to_string();
            if current == state::VANISH {
                debug!(mail = mail.name(), "mail vanished");
                return Ok(());
            }

            if current == state::ERROR {
                error_visits += 1;
                if error_visits > 1 {
                    warn!(
                        mail = mail.name(),
                        "error processor revisited, discarding mail"
                    );
                    mail.set_state(state::VANISH);
                    return Ok(());
                }
            }

            let Some(chain) = self.chains.get(&current) else {
                let diagnostic = format!(
                    "Unable to find processor {} requested for processing of {}",
                    current,
                    mail.name()
                );
                warn!(mail = mail.name(), processor = current, "{diagnostic}");

                if current == state::ERROR || !self.chains.contains_key(state::ERROR) {
                    // No in-pipeline recovery is possible.
                    return Err(Error::Config(diagnostic));
                }
                mail.set_error_message(diagnostic);
                mail.set_state(state::ERROR);
                continue;
            };

            debug!(
                mail = mail.name(),
                processor = current,
                "processing mail"
            );
            chain.execute(mail).await;
            debug!(
                mail = mail.name(),
                processor = current,
                result = mail.state(),
                "processed mail"
            );

            if mail.state() == current {
                // The chain ran to completion without rerouting.
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Mailet, Matched, Matcher, StepError};
    use async_trait::async_trait;
    use postroute_common::{EmailAddress, Payload};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MatchAll;

    impl Matcher for MatchAll {
        fn name(&self) -> &str {
            "all"
        }

        fn matches(&self, _mail: &Mail) -> Matched {
            Matched::All
        }
    }

    // `super::*` pulls in the one-argument crate `Result` alias, so the
    // step signatures below must spell out the std form.
    struct Effect {
        calls: Arc<AtomicUsize>,
        effect: Box<dyn Fn(&mut Mail) -> std::result::Result<(), StepError> + Send + Sync>,
    }

    #[async_trait]
    impl Mailet for Effect {
        fn name(&self) -> &str {
            "effect"
        }

        async fn service(&self, mail: &mut Mail) -> std::result::Result<(), StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.effect)(mail)
        }
    }

    fn chain_with(
        name: &str,
        effect: impl Fn(&mut Mail) -> std::result::Result<(), StepError> + Send + Sync + 'static,
    ) -> (LinearChain, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = LinearChain::new(name);
        chain.push(
            Arc::new(MatchAll),
            Arc::new(Effect {
                calls: calls.clone(),
                effect: Box::new(effect),
            }),
        );
        (chain, calls)
    }

    fn test_mail() -> Mail {
        Mail::new(
            None,
            vec![EmailAddress::parse("a@x.org").unwrap()],
            Payload::new(),
        )
    }

    #[test]
    fn test_router_debug_lists_chain_names() {
        let router = StateRouter::new(vec![LinearChain::new("root"), LinearChain::new("error")]);
        let rendered = format!("{router:?}");
        assert!(rendered.contains("root"));
        assert!(rendered.contains("error"));
    }

    #[tokio::test]
    async fn test_route_follows_state_transitions() {
        let (root, _) = chain_with("root", |mail| {
            mail.set_state("transport");
            Ok(())
        });
        let (transport, transport_calls) = chain_with("transport", |mail| {
            mail.payload_mut().set_header("X-Delivered", "yes");
            Ok(())
        });

        let router = StateRouter::new(vec![root, transport]);
        let mut mail = test_mail();
        router.route(&mut mail).await.unwrap();

        assert_eq!(transport_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mail.state(), "transport");
        assert_eq!(mail.payload().get_header("X-Delivered"), Some("yes"));
    }

    #[tokio::test]
    async fn test_route_stops_at_vanish_without_side_effects() {
        let (root, _) = chain_with("root", |mail| {
            mail.set_state(state::VANISH);
            Ok(())
        });
        let (never, never_calls) = chain_with(state::VANISH, |_| Ok(()));

        // A chain registered under the terminal name must never run.
        let router = StateRouter::new(vec![root, never]);
        let mut mail = test_mail();
        router.route(&mut mail).await.unwrap();

        assert_eq!(mail.state(), state::VANISH);
        assert_eq!(never_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_state_reroutes_to_error_chain() {
        let (root, _) = chain_with("root", |mail| {
            mail.set_state("no-such-processor");
            Ok(())
        });
        let (error, error_calls) = chain_with(state::ERROR, |_| Ok(()));

        let router = StateRouter::new(vec![root, error]);
        let mut mail = test_mail();
        router.route(&mut mail).await.unwrap();

        assert_eq!(error_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mail.state(), state::ERROR);
        let diagnostic = mail.error_message().unwrap();
        assert!(diagnostic.contains("no-such-processor"));
        assert!(diagnostic.contains(mail.name()));
    }

    #[tokio::test]
    async fn test_missing_error_chain_is_fatal() {
        let (root, _) = chain_with("root", |mail| {
            mail.set_state("no-such-processor");
            Ok(())
        });

        let router = StateRouter::new(vec![root]);
        let mut mail = test_mail();
        let err = router.route(&mut mail).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_faulting_cycle_terminates_within_two_error_visits() {
        // root faults; the error chain reroutes back to root, which faults
        // again. The loop breaker must vanish the mail on the second
        // error-chain visit instead of cycling forever.
        let (root, root_calls) = chain_with("root", |_| {
            Err(StepError::Unexpected("boom".to_string()))
        });
        let (error, error_calls) = chain_with(state::ERROR, |mail| {
            mail.set_state("root");
            Ok(())
        });

        let router = StateRouter::new(vec![root, error]);
        let mut mail = test_mail();
        router.route(&mut mail).await.unwrap();

        assert_eq!(mail.state(), state::VANISH);
        assert!(error_calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(root_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_chain_completing_normally_ends_routing() {
        let (root, _) = chain_with("root", |_| {
            Err(StepError::Processing("downstream unavailable".to_string()))
        });
        let (error, error_calls) = chain_with(state::ERROR, |mail| {
            mail.payload_mut().set_header("X-Failed", "yes");
            Ok(())
        });

        let router = StateRouter::new(vec![root, error]);
        let mut mail = test_mail();
        router.route(&mut mail).await.unwrap();

        assert_eq!(error_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mail.state(), state::ERROR);
        assert_eq!(mail.error_message(), Some("downstream unavailable"));
        assert_eq!(mail.payload().get_header("X-Failed"), Some("yes"));
    }
}
