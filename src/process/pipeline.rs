use super::step::Step;
use crate::error::{BrokerError, Result};
use crate::types::{FinishedStages, Operation};
use std::collections::HashSet;
use std::sync::Arc;

/// Predicate deciding whether a conditional step applies to an operation.
pub type StepCondition = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

pub struct StepEntry {
    step: Arc<dyn Step>,
    condition: Option<StepCondition>,
}

impl StepEntry {
    #[must_use]
    pub fn step(&self) -> &dyn Step {
        self.step.as_ref()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.step.name()
    }

    /// Unconditional steps always apply.
    #[must_use]
    pub fn applies_to(&self, operation: &Operation) -> bool {
        self.condition
            .as_ref()
            .map_or(true, |condition| condition(operation))
    }
}

pub struct Stage {
    name: String,
    steps: Vec<StepEntry>,
}

impl Stage {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn steps(&self) -> &[StepEntry] {
        &self.steps
    }
}

/// Ordered, immutable list of named stages.
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Stages still to run, in pipeline order.
    pub fn remaining<'a>(
        &'a self,
        finished: &'a FinishedStages,
    ) -> impl Iterator<Item = &'a Stage> + 'a {
        self.stages
            .iter()
            .filter(move |stage| !finished.contains(stage.name()))
    }

    #[must_use]
    pub fn is_complete(&self, finished: &FinishedStages) -> bool {
        self.remaining(finished).next().is_none()
    }

    /// Finished stages must be known and form a prefix of the pipeline.
    ///
    /// # Errors
    /// Returns [`BrokerError::PipelineError`] describing the first mismatch.
    pub fn check_finished(&self, finished: &FinishedStages) -> Result<()> {
        finished
            .as_slice()
            .iter()
            .zip(self.stages.iter())
            .find(|(done, stage)| done.as_str() != stage.name())
            .map_or_else(
                || {
                    if finished.len() > self.stages.len() {
                        Err(BrokerError::PipelineError(format!(
                            "{} finished stages recorded for a pipeline of {}",
                            finished.len(),
                            self.stages.len()
                        )))
                    } else {
                        Ok(())
                    }
                },
                |(done, stage)| {
                    Err(BrokerError::PipelineError(format!(
                        "finished stage '{done}' does not match pipeline stage '{}'",
                        stage.name()
                    )))
                },
            )
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
    errors: Vec<String>,
}

impl PipelineBuilder {
    /// Declares a stage. Stages run in declaration order.
    #[must_use]
    pub fn stage(mut self, name: impl Into<String>) -> Self {
        self.stages.push(Stage {
            name: name.into(),
            steps: Vec::new(),
        });
        self
    }

    #[must_use]
    pub fn step(self, stage: &str, step: impl Step + 'static) -> Self {
        self.push_step(stage, Arc::new(step), None)
    }

    /// Adds a step that only runs when `condition` holds for the operation.
    #[must_use]
    pub fn conditional_step(
        self,
        stage: &str,
        step: impl Step + 'static,
        condition: impl Fn(&Operation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.push_step(stage, Arc::new(step), Some(Arc::new(condition)))
    }

    fn push_step(
        mut self,
        stage: &str,
        step: Arc<dyn Step>,
        condition: Option<StepCondition>,
    ) -> Self {
        match self.stages.iter_mut().find(|s| s.name == stage) {
            Some(target) => target.steps.push(StepEntry { step, condition }),
            None => self.errors.push(format!(
                "step '{}' added to undeclared stage '{stage}'",
                step.name()
            )),
        }
        self
    }

    /// # Errors
    /// Returns [`BrokerError::PipelineError`] for an empty pipeline, duplicate
    /// stage names, stages without steps, or steps added to unknown stages.
    pub fn build(self) -> Result<Pipeline> {
        if let Some(first) = self.errors.first() {
            return Err(BrokerError::PipelineError(first.clone()));
        }
        if self.stages.is_empty() {
            return Err(BrokerError::PipelineError(
                "pipeline has no stages".to_string(),
            ));
        }
        let duplicate = {
            let mut seen = HashSet::new();
            self.stages
                .iter()
                .find(|s| !seen.insert(s.name.as_str()))
                .map(|s| s.name.clone())
        };
        if let Some(name) = duplicate {
            return Err(BrokerError::PipelineError(format!(
                "duplicate stage name '{name}'"
            )));
        }
        if let Some(empty) = self.stages.iter().find(|s| s.steps.is_empty()) {
            return Err(BrokerError::PipelineError(format!(
                "stage '{}' has no steps",
                empty.name
            )));
        }
        Ok(Pipeline {
            stages: self.stages,
        })
    }
}
