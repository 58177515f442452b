//! Declarative DAG of steps: cycle detection, ready-set execution
//! planning, per-step timeout, result aggregation (spec.md §4.5).

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use schemars::JsonSchema;
use thiserror::Error;

use crate::{
    config::JsonPatchingConfig,
    model_manager::ModelManager,
    prelude::*,
    step::{self, StepDefinition, StepResult, StepStatus},
};

/// Per-step wall-clock timeout (spec.md §4.5, §5).
pub const STEP_TIMEOUT_SECS: u64 = 300;

/// Errors raised while constructing a [`Pipeline`], before any step runs.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("duplicate step name {0:?}")]
    DuplicateStepName(String),

    #[error("circular dependency: {0}")]
    Cycle(String),
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PipelineResult {
    pub results: HashMap<String, StepResult>,
    pub total_time: f64,
    pub success_count: usize,
    pub total_count: usize,
}

/// A validated DAG of steps, ready to run.
pub struct Pipeline {
    steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
    step_timeout: Duration,
}

impl Pipeline {
    /// Build and validate a pipeline with the default per-step timeout
    /// (spec.md §4.5, §5): rejects duplicate step names and cycles; warns
    /// (but doesn't reject) on a dependency naming a step that was never
    /// defined.
    pub fn new(steps: Vec<StepDefinition>) -> std::result::Result<Self, PipelineError> {
        Self::with_step_timeout(steps, Duration::from_secs(STEP_TIMEOUT_SECS))
    }

    /// As [`Self::new`], but with an explicit per-step timeout. Exposed
    /// separately rather than as a `Config` field because the timeout is a
    /// property of one pipeline run, not of the engine as a whole.
    pub fn with_step_timeout(
        steps: Vec<StepDefinition>,
        step_timeout: Duration,
    ) -> std::result::Result<Self, PipelineError> {
        let mut index = HashMap::new();
        for (position, step) in steps.iter().enumerate() {
            if index.insert(step.name.clone(), position).is_some() {
                return Err(PipelineError::DuplicateStepName(step.name.clone()));
            }
        }
        for step in &steps {
            for dep in &step.deps {
                if !index.contains_key(dep) {
                    warn!(
                        "Step {:?} depends on {:?}, which is not defined in this pipeline; \
                         it will run as soon as its other dependencies are satisfied",
                        step.name, dep
                    );
                }
            }
        }
        detect_cycles(&steps)?;
        Ok(Self { steps, index, step_timeout })
    }

    /// Run every reachable step, sequentially, against `input`.
    pub async fn run(
        &self,
        input: Value,
        model_manager: &ModelManager,
        patching: &JsonPatchingConfig,
    ) -> PipelineResult {
        let start = Instant::now();
        let plan = self.execution_plan();

        let mut data = input.as_object().cloned().unwrap_or_default();
        let mut results = HashMap::new();

        for name in plan {
            let def = &self.steps[self.index[&name]];
            let call_data = Value::Object(data.clone());

            let result = match tokio::time::timeout(
                self.step_timeout,
                step::execute(def, &call_data, model_manager, patching),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "Step {:?} timed out after {}s",
                        name,
                        self.step_timeout.as_secs_f64()
                    );
                    timeout_result(def, self.step_timeout)
                }
            };

            match result.status {
                StepStatus::Success => {
                    data.insert(name.clone(), result.output.clone());
                }
                StepStatus::Error => {
                    data.insert(
                        name.clone(),
                        json!({"response": format!("Step {name} failed"), "error": "step_failed"}),
                    );
                }
            }
            results.insert(name, result);
        }

        let success_count = results
            .values()
            .filter(|result| matches!(result.status, StepStatus::Success))
            .count();
        let total_count = results.len();
        PipelineResult {
            results,
            total_time: start.elapsed().as_secs_f64(),
            success_count,
            total_count,
        }
    }

    /// Greedily compute a flattened execution order: repeatedly take every
    /// step whose dependencies are all satisfied (or unresolvable, which
    /// counts as satisfied — see spec.md §4.5). Stops early, dropping the
    /// rest, if no step becomes ready in a round.
    fn execution_plan(&self) -> Vec<String> {
        let mut remaining: Vec<&StepDefinition> = self.steps.iter().collect();
        let mut completed: HashSet<&str> = HashSet::new();
        let mut plan = Vec::new();

        loop {
            if remaining.is_empty() {
                break;
            }
            let (ready, not_ready): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|step| {
                step.deps.iter().all(|dep| {
                    completed.contains(dep.as_str()) || !self.index.contains_key(dep)
                })
            });
            if ready.is_empty() {
                warn!(
                    "Pipeline has unsatisfiable dependencies; these steps will not run: {:?}",
                    not_ready.iter().map(|step| &step.name).collect::<Vec<_>>()
                );
                break;
            }
            for step in &ready {
                plan.push(step.name.clone());
                completed.insert(step.name.as_str());
            }
            remaining = not_ready;
        }
        plan
    }
}

fn timeout_result(def: &StepDefinition, step_timeout: Duration) -> StepResult {
    StepResult {
        output: json!({"error": "timeout"}),
        time: step_timeout.as_secs_f64(),
        model: def.model_name.clone(),
        status: StepStatus::Error,
        prompt: None,
        messages: None,
        error_details: Some(json!({"error": "timeout"})),
        fallback: false,
        patched: false,
    }
}

/// DFS from every step, tracking an in-progress path; a re-entered
/// in-progress node means a cycle.
fn detect_cycles(steps: &[StepDefinition]) -> std::result::Result<(), PipelineError> {
    let index: HashMap<String, usize> = steps
        .iter()
        .enumerate()
        .map(|(position, step)| (step.name.clone(), position))
        .collect();
    let mut done = HashSet::new();
    for step in steps {
        let mut path = Vec::new();
        visit(&step.name, steps, &index, &mut done, &mut path)?;
    }
    Ok(())
}

fn visit(
    name: &str,
    steps: &[StepDefinition],
    index: &HashMap<String, usize>,
    done: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> std::result::Result<(), PipelineError> {
    if done.contains(name) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|n| n == name) {
        let mut cycle = path[start..].to_vec();
        cycle.push(name.to_owned());
        return Err(PipelineError::Cycle(cycle.join(" -> ")));
    }
    path.push(name.to_owned());
    if let Some(&position) = index.get(name) {
        for dep in &steps[position].deps {
            visit(dep, steps, index, done, path)?;
        }
    }
    path.pop();
    done.insert(name.to_owned());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::FileCache, config::Config, step::StepKind};

    fn step(name: &str, model: &str, template: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition {
            name: name.to_owned(),
            kind: StepKind::Completion,
            model_name: model.to_owned(),
            prompt_template: Some(template.to_owned()),
            system_prompt: None,
            options: Value::Null,
            fallback_models: Vec::new(),
            output_schema: None,
            use_patching: true,
            max_patching_attempts: None,
            fallback_to_text: true,
            deps: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn simulated_manager() -> ModelManager {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let mut config = Config::default();
        config.simulation_mode = true;
        ModelManager::new(config, cache).unwrap()
    }

    #[test]
    fn test_duplicate_step_name_rejected() {
        let steps = vec![
            step("a", "m", "{query}", &[]),
            step("a", "m", "{query}", &[]),
        ];
        assert!(Pipeline::new(steps).is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let steps = vec![step("a", "m", "{query}", &["b"]), step("b", "m", "{query}", &["a"])];
        let err = Pipeline::new(steps).unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
    }

    #[test]
    fn test_execution_plan_respects_dependencies() {
        let steps = vec![
            step("a", "m", "{query}", &[]),
            step("b", "m", "{query}", &[]),
            step("c", "m", "{a[response]} {b[response]}", &["a", "b"]),
        ];
        let pipeline = Pipeline::new(steps).unwrap();
        let plan = pipeline.execution_plan();
        let c_index = plan.iter().position(|n| n == "c").unwrap();
        let a_index = plan.iter().position(|n| n == "a").unwrap();
        let b_index = plan.iter().position(|n| n == "b").unwrap();
        assert!(a_index < c_index);
        assert!(b_index < c_index);
    }

    #[test]
    fn test_execution_plan_treats_unresolvable_dep_as_satisfied() {
        let steps = vec![step("a", "m", "{query}", &["nonexistent"])];
        let pipeline = Pipeline::new(steps).unwrap();
        assert_eq!(pipeline.execution_plan(), vec!["a".to_owned()]);
    }

    #[tokio::test]
    async fn test_run_single_step_success() {
        let pipeline = Pipeline::new(vec![step("s", "llama3", "Answer: {query}", &[])]).unwrap();
        let manager = simulated_manager();
        let patching = JsonPatchingConfig::default();
        let result = pipeline.run(json!({"query": "hi"}), &manager, &patching).await;
        assert_eq!(result.total_count, 1);
        assert_eq!(result.success_count, 1);
        assert!(matches!(result.results["s"].status, StepStatus::Success));
    }

    #[tokio::test]
    async fn test_run_fan_in_receives_both_upstream_outputs() {
        let steps = vec![
            step("a", "llama3", "Say hi", &[]),
            step("b", "llama3", "Say bye", &[]),
            step(
                "c",
                "llama3",
                "Combine {a[response]} and {b[response]}",
                &["a", "b"],
            ),
        ];
        let pipeline = Pipeline::new(steps).unwrap();
        let manager = simulated_manager();
        let patching = JsonPatchingConfig::default();
        let result = pipeline.run(json!({"query": "hi"}), &manager, &patching).await;
        assert_eq!(result.success_count, 3);
        let c_prompt = result.results["c"].prompt.clone().unwrap();
        assert!(c_prompt.contains("Simulated response from llama3"));
    }
}
