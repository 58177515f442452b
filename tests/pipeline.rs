//! End-to-end pipeline scenarios against a mocked inference backend,
//! covering spec.md §8's numbered scenarios that a pure-simulation-mode
//! test can't exercise: real HTTP fallback, the JSON patch loop, a cache
//! hit that must never touch the backend, and per-step timeout isolation.

use std::time::Duration;

use pasture::{
    cache::FileCache,
    config::{Config, JsonPatchingConfig},
    model_manager::ModelManager,
    pipeline::Pipeline,
    schema::OutputSchema,
    step::{StepDefinition, StepKind, StepStatus},
};
use serde_json::{Value, json};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate, matchers};

/// Matches a POST body whose UTF-8 text contains `needle`.
struct BodyContains(&'static str);

impl Match for BodyContains {
    fn matches(&self, request: &Request) -> bool {
        String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

/// Matches a POST body whose UTF-8 text does NOT contain `needle`.
struct BodyNotContains(&'static str);

impl Match for BodyNotContains {
    fn matches(&self, request: &Request) -> bool {
        !String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

fn completion_step(name: &str, model: &str, template: &str, deps: &[&str]) -> StepDefinition {
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

fn test_config(api_base: &str) -> Config {
    let mut config = Config::default();
    config.api_base = Some(api_base.to_owned());
    // Keep these tests from exercising the preload/unload discipline; it's
    // covered separately and would otherwise double the mock traffic we'd
    // need to stub out here.
    config.preload_models = false;
    config.retry.max_attempts = 1;
    config
}

/// Scenario 2: fan-in with fallback. Two independent steps feed a third;
/// one of the two fails outright and falls back to an explicit alternate
/// model, and the fan-in step still sees both upstream outputs.
#[tokio::test]
async fn test_fan_in_with_fallback() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/generate"))
        .and(BodyContains("\"model\":\"mA\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "mA",
            "response": "Hello from model A",
            "done": true,
        })))
        .mount(&server)
        .await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/generate"))
        .and(BodyContains("\"model\":\"mB\""))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/generate"))
        .and(BodyContains("\"model\":\"mF\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "mF",
            "response": "Hello from fallback model F",
            "done": true,
        })))
        .mount(&server)
        .await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/generate"))
        .and(BodyContains("\"model\":\"mC\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "mC",
            "response": "Combined report from A and F",
            "done": true,
        })))
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let patching = config.json_patching.clone();
    let cache = FileCache::new(tempfile::tempdir().unwrap().path()).unwrap();
    let manager = ModelManager::new(config, cache).unwrap();

    let steps = vec![
        completion_step("A", "mA", "Say hi", &[]),
        {
            let mut step = completion_step("B", "mB", "Say bye", &[]);
            step.fallback_models = vec!["mF".to_owned()];
            step
        },
        completion_step("C", "mC", "Combine {A[response]} and {B[response]}", &["A", "B"]),
    ];
    let pipeline = Pipeline::new(steps).unwrap();
    let result = pipeline.run(json!({"query": "hi"}), &manager, &patching).await;

    assert_eq!(result.success_count, 3);
    assert!(matches!(result.results["B"].status, StepStatus::Success));
    assert!(result.results["B"].fallback);
    assert_eq!(result.results["B"].model, "mF");
    let c_prompt = result.results["C"].prompt.clone().unwrap();
    assert!(c_prompt.contains("Hello from model A"));
    assert!(c_prompt.contains("Hello from fallback model F"));
}

/// Scenario 3: the JSON patch loop. The model's first answer doesn't
/// match the schema (wrong type); a patch request fixes it and the step
/// succeeds using the repaired value.
#[tokio::test]
async fn test_json_patch_loop_repairs_malformed_output() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/generate"))
        .and(BodyNotContains("Previous output:"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "mS",
            "response": r#"{"x": "3"}"#,
            "done": true,
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/generate"))
        .and(BodyContains("Previous output:"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "mS",
            "response": "The corrected JSON is {\"x\": 3} - hope that helps!",
            "done": true,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let patching = JsonPatchingConfig {
        max_attempts: 2,
        ..config.json_patching.clone()
    };
    let cache = FileCache::new(tempfile::tempdir().unwrap().path()).unwrap();
    let manager = ModelManager::new(config, cache).unwrap();

    let mut step = completion_step("s", "mS", "Extract: {query}", &[]);
    step.max_patching_attempts = Some(2);
    step.output_schema = Some(
        serde_json::from_value::<OutputSchema>(json!({
            "json": {
                "type": "object",
                "required": ["x"],
                "properties": {"x": {"type": "integer"}},
            }
        }))
        .unwrap(),
    );

    let pipeline = Pipeline::new(vec![step]).unwrap();
    let result = pipeline.run(json!({"query": "give me x"}), &manager, &patching).await;

    assert!(matches!(result.results["s"].status, StepStatus::Success));
    assert_eq!(result.results["s"].output["x"], json!(3));
    assert!(result.results["s"].patched);
}

/// Scenario 5: a cache hit must never reach the backend. We point the
/// manager at a server with no mocks registered, so any request at all
/// would surface as a `connection_error`/404 in the result.
#[tokio::test]
async fn test_cache_hit_skips_the_backend() {
    let server = MockServer::start().await;
    // No mocks mounted: any request that actually reaches the server
    // returns a bare 404, which would show up as an `HTTP 404` error in
    // the step result and fail the assertions below.

    let config = test_config(&server.uri());
    let patching = config.json_patching.clone();
    let cache = FileCache::new(tempfile::tempdir().unwrap().path()).unwrap();

    let key = pasture::cache::completion_cache_key("llama3", "P", &json!({"temperature": 0.7}));
    cache.set(&key, json!({"response": "cached"}), Some(3600.0)).await;

    let manager = ModelManager::new(config, cache).unwrap();
    let mut step = completion_step("s", "llama3", "P", &[]);
    step.options = json!({"temperature": 0.7});

    let pipeline = Pipeline::new(vec![step]).unwrap();
    let result = pipeline.run(json!({}), &manager, &patching).await;

    assert!(matches!(result.results["s"].status, StepStatus::Success));
    assert_eq!(result.results["s"].output["response"], json!("cached"));
}

/// Scenario 6: a step that times out doesn't poison the rest of the
/// pipeline; downstream steps still run against its placeholder output.
#[tokio::test]
async fn test_per_step_timeout_isolates_failure() {
    let server = MockServer::start().await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/generate"))
        .and(BodyContains("\"model\":\"mA\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "mA",
            "response": "Output from A, ready for B",
            "done": true,
        })))
        .mount(&server)
        .await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/generate"))
        .and(BodyContains("\"model\":\"mB\""))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"model": "mB", "response": "too slow", "done": true}))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    Mock::given(matchers::method("POST"))
        .and(matchers::path("/api/generate"))
        .and(BodyContains("\"model\":\"mC\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "mC",
            "response": "Handled the missing B output gracefully",
            "done": true,
        })))
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let patching = config.json_patching.clone();
    let cache = FileCache::new(tempfile::tempdir().unwrap().path()).unwrap();
    let manager = ModelManager::new(config, cache).unwrap();

    let steps = vec![
        completion_step("A", "mA", "Say hi", &[]),
        completion_step("B", "mB", "Say bye", &["A"]),
        completion_step("C", "mC", "Use {B[response]} if present", &["B"]),
    ];
    let pipeline = Pipeline::with_step_timeout(steps, Duration::from_millis(50)).unwrap();
    let result = pipeline.run(json!({"query": "hi"}), &manager, &patching).await;

    assert!(matches!(result.results["A"].status, StepStatus::Success));
    assert!(matches!(result.results["B"].status, StepStatus::Error));
    assert_eq!(result.results["B"].output["error"], json!("timeout"));
    assert!(matches!(result.results["C"].status, StepStatus::Success));
}
