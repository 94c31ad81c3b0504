//! Capability registry: resolves matcher and mailet identifiers from
//! configuration into constructed instances, and assembles the router.

use super::{LinearChain, Mailet, Matcher, StateRouter};
use crate::mailets::{AddHeader, AddScore, Discard, ScoreGateMailet, SpamScan, ToProcessor};
use crate::matchers::{All, HasHeader, RecipientIs};
use crate::score::{GateAction, ScoreGate};
use postroute_common::config::{PipelineConfig, StepConfig};
use postroute_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub type MatcherFactory = Box<dyn Fn(&StepConfig) -> Result<Arc<dyn Matcher>> + Send + Sync>;
pub type MailetFactory = Box<dyn Fn(&StepConfig) -> Result<Arc<dyn Mailet>> + Send + Sync>;

/// Maps matcher and mailet identifiers to factories.
///
/// The builtin set covers the stock pipeline; embedders register their
/// own identifiers before assembly. An identifier that resolves to
/// nothing is a configuration error at assembly time, never at routing
/// time.
pub struct CapabilityRegistry {
    matchers: HashMap<String, MatcherFactory>,
    mailets: HashMap<String, MailetFactory>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            matchers: HashMap::new(),
            mailets: HashMap::new(),
        }
    }

    /// Registry pre-populated with the builtin matchers and mailets.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_matcher("all", |_| Ok(Arc::new(All)));
        registry.register_matcher("recipient-is", |step| {
            Ok(Arc::new(RecipientIs::parse(step.require_condition()?)?) as Arc<dyn Matcher>)
        });
        registry.register_matcher("has-header", |step| {
            Ok(Arc::new(HasHeader::parse(step.require_condition()?)?) as Arc<dyn Matcher>)
        });

        registry.register_mailet("add-header", |step| {
            Ok(Arc::new(AddHeader::new(
                step.require_str("name")?,
                step.require_str("value")?,
            )) as Arc<dyn Mailet>)
        });
        registry.register_mailet("to-processor", |step| {
            let mut mailet = ToProcessor::new(step.require_str("processor")?);
            if let Some(notice) = step.str_param("notice") {
                mailet = mailet.with_notice(notice);
            }
            Ok(Arc::new(mailet) as Arc<dyn Mailet>)
        });
        registry.register_mailet("discard", |_| Ok(Arc::new(Discard)));
        registry.register_mailet("add-score", |step| {
            let score = step.f64_param("score").ok_or_else(|| {
                Error::Config("Mailet 'add-score' requires a numeric parameter 'score'".to_string())
            })?;
            Ok(Arc::new(AddScore::new(step.require_str("check")?, score)) as Arc<dyn Mailet>)
        });
        registry.register_mailet("score-gate", |step| {
            let action: GateAction = step.require_str("action")?.parse()?;
            let max_score = step.f64_param("max-score").unwrap_or(0.0);
            let mut mailet = ScoreGateMailet::new(ScoreGate::new(action, max_score));
            if let Some(processor) = step.str_param("reject-processor") {
                mailet = mailet.with_reject_processor(processor);
            }
            Ok(Arc::new(mailet) as Arc<dyn Mailet>)
        });
        registry.register_mailet("spam-scan", |step| {
            let mut mailet = SpamScan::new(step.require_str("endpoint")?);
            if let Some(check) = step.str_param("check") {
                mailet = mailet.with_check(check);
            }
            Ok(Arc::new(mailet) as Arc<dyn Mailet>)
        });

        registry
    }

    pub fn register_matcher(
        &mut self,
        id: impl Into<String>,
        factory: impl Fn(&StepConfig) -> Result<Arc<dyn Matcher>> + Send + Sync + 'static,
    ) {
        self.matchers.insert(id.into(), Box::new(factory));
    }

    pub fn register_mailet(
        &mut self,
        id: impl Into<String>,
        factory: impl Fn(&StepConfig) -> Result<Arc<dyn Mailet>> + Send + Sync + 'static,
    ) {
        self.mailets.insert(id.into(), Box::new(factory));
    }

    pub fn build_matcher(&self, step: &StepConfig) -> Result<Arc<dyn Matcher>> {
        let factory = self.matchers.get(&step.matcher).ok_or_else(|| {
            Error::Config(format!("Unknown matcher identifier '{}'", step.matcher))
        })?;
        factory(step)
    }

    pub fn build_mailet(&self, step: &StepConfig) -> Result<Arc<dyn Mailet>> {
        let factory = self.mailets.get(&step.mailet).ok_or_else(|| {
            Error::Config(format!("Unknown mailet identifier '{}'", step.mailet))
        })?;
        factory(step)
    }

    /// Validate the pipeline declaration and assemble every processor
    /// into a router. Fails on the first unresolvable or misconfigured
    /// step.
    pub fn build_router(&self, pipeline: &PipelineConfig) -> Result<StateRouter> {
        pipeline.validate()?;

        let mut chains = Vec::with_capacity(pipeline.processors.len());
        for processor in &pipeline.processors {
            let mut chain = LinearChain::new(&processor.name);
            for step in &processor.steps {
                chain.push(self.build_matcher(step)?, self.build_mailet(step)?);
            }
            info!(
                processor = processor.name,
                steps = chain.len(),
                "assembled processor"
            );
            chains.push(chain);
        }
        Ok(StateRouter::new(chains))
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
