use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use serde_json::Value;

use super::boosted_tree::{ClassificationRunnerFactory, RegressionRunnerFactory};
use super::outliers::OutliersRunnerFactory;
use super::{AnalysisRunner, RunnerSettings};
use crate::error::{AnalysisError, Result};

/// Creates runners of one analysis type.
pub trait RunnerFactory: Send + Sync {
    /// Analysis name the factory is registered under.
    fn name(&self) -> &'static str;

    /// Build a runner from `parameters`, the opaque `analysis.parameters`
    /// object of the job.
    fn make_runner(&self, settings: &RunnerSettings, parameters: &Value) -> Result<Box<dyn AnalysisRunner>>;
}

/// Runner factories by analysis name. Names match case sensitively.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    factories: BTreeMap<&'static str, Arc<dyn RunnerFactory>>,
}

impl RunnerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Outlier detection, regression and classification.
    pub fn standard() -> Self {
        Self::empty()
            .with(OutliersRunnerFactory)
            .with(RegressionRunnerFactory)
            .with(ClassificationRunnerFactory)
    }

    /// The process wide standard registry.
    pub fn global() -> &'static RunnerRegistry {
        static REGISTRY: OnceLock<RunnerRegistry> = OnceLock::new();
        REGISTRY.get_or_init(RunnerRegistry::standard)
    }

    pub fn with(mut self, factory: impl RunnerFactory + 'static) -> Self {
        self.register(factory);
        self
    }

    /// Add `factory`, replacing any factory with the same name.
    pub fn register(&mut self, factory: impl RunnerFactory + 'static) {
        self.factories.insert(factory.name(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Create the runner for `name` and plan its execution.
    pub fn make_runner(
        &self,
        name: &str,
        settings: &RunnerSettings,
        parameters: &Value,
    ) -> Result<Box<dyn AnalysisRunner>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| AnalysisError::UnsupportedAnalysis(name.to_string()))?;
        let mut runner = factory.make_runner(settings, parameters)?;
        runner.compute_and_save_execution_strategy();
        Ok(runner)
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
