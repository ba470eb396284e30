//! HTTP surface tests driven through the router with `oneshot`.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;
use vigil_api::{create_api_router, CALLER_HEADER};
use vigil_core::{Agent, AgentPolicy, SafetyRule};
use vigil_engine::EngineBuilder;
use vigil_storage::ExecutionStore;
use vigil_test_utils::fixtures::make_agent;
use vigil_test_utils::{InMemoryFileStore, InMemoryStore, MockToolInvoker};

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
    invoker: MockToolInvoker,
}

impl TestApp {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let invoker = MockToolInvoker::new("llm");
        let engine = EngineBuilder::new(store.clone(), Arc::new(InMemoryFileStore::new()))
            .with_default_tool(Arc::new(invoker.clone()))
            .build()
            .expect("default engine config is valid");
        Self {
            router: create_api_router(engine.control.clone()),
            store,
            invoker,
        }
    }

    async fn agent(&self, policy: AgentPolicy) -> Agent {
        let agent = make_agent(policy);
        self.store.agent_insert(&agent).await.expect("insert agent");
        agent
    }

    async fn send(
        &self,
        method: &str,
        uri: &str,
        caller: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(caller) = caller {
            request = request.header(CALLER_HEADER, caller.to_string());
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("valid request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    async fn start(&self, agent: &Agent, plan: Value) -> (StatusCode, Value) {
        self.send(
            "POST",
            "/api/v1/executions",
            Some(agent.owner_user_id),
            Some(json!({
                "agent_id": agent.agent_id,
                "goal": "update the changelog",
                "plan": plan,
            })),
        )
        .await
    }
}

fn plan(descriptions: &[&str]) -> Value {
    Value::Array(
        descriptions
            .iter()
            .map(|d| json!({"tool": "llm", "description": d}))
            .collect(),
    )
}

// ============================================================================
// IDENTITY AND INPUT
// ============================================================================

#[tokio::test]
async fn test_health_needs_no_caller() {
    let app = TestApp::new();
    let (status, body) = app.send("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dispatch_mode"], "inline");
}

#[tokio::test]
async fn test_missing_or_invalid_caller_is_unauthorized() {
    let app = TestApp::new();
    let (status, body) = app.send("GET", "/api/v1/executions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let request = Request::builder()
        .uri("/api/v1/executions")
        .header(CALLER_HEADER, "not-a-uuid")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_path_and_body_are_invalid_input() {
    let app = TestApp::new();
    let caller = Uuid::now_v7();

    let (status, body) = app
        .send("GET", "/api/v1/executions/not-an-id", Some(caller), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let (status, body) = app
        .send("POST", "/api/v1/executions", Some(caller), Some(json!({"goal": 3})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_start_runs_plan_and_state_is_readable() {
    let app = TestApp::new();
    let agent = app.agent(AgentPolicy::default()).await;

    let (status, execution) = app.start(&agent, plan(&["draft entry", "polish entry"])).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(execution["state"]["state"], "completed");
    assert_eq!(execution["current_step"], 2);
    assert_eq!(app.invoker.call_count(), 2);

    let id = execution["execution_id"].as_str().unwrap().to_string();
    let (status, view) = app
        .send(
            "GET",
            &format!("/api/v1/executions/{}", id),
            Some(agent.owner_user_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["steps"].as_array().unwrap().len(), 2);

    let (status, list) = app
        .send("GET", "/api/v1/executions", Some(agent.owner_user_id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["executions"].as_array().unwrap().len(), 1);

    let (status, usage) = app
        .send(
            "GET",
            &format!("/api/v1/executions/{}/usage", id),
            Some(agent.owner_user_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["records"], 2);
}

#[tokio::test]
async fn test_engine_errors_map_to_statuses() {
    let app = TestApp::new();
    let agent = app.agent(AgentPolicy::default()).await;
    let stranger = Uuid::now_v7();

    // Unknown agent.
    let (status, body) = app
        .send(
            "POST",
            "/api/v1/executions",
            Some(agent.owner_user_id),
            Some(json!({"agent_id": Uuid::now_v7(), "goal": "anything"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    // Blank goal.
    let (status, body) = app
        .send(
            "POST",
            "/api/v1/executions",
            Some(agent.owner_user_id),
            Some(json!({"agent_id": agent.agent_id, "goal": "  "})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_failed");

    // Disabled agent.
    let disabled = make_agent(AgentPolicy::default()).disabled();
    app.store.agent_insert(&disabled).await.unwrap();
    let (status, body) = app.start(&disabled, plan(&["noop"])).await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["code"], "disabled");

    // Someone else's execution.
    let (_, execution) = app.start(&agent, plan(&["draft entry"])).await;
    let id = execution["execution_id"].as_str().unwrap().to_string();
    let (status, body) = app
        .send("GET", &format!("/api/v1/executions/{}", id), Some(stranger), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    // Pausing a completed execution.
    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/executions/{}/pause", id),
            Some(agent.owner_user_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transition");
    assert_eq!(body["details"]["operation"], "pause");
}

#[tokio::test]
async fn test_confirmation_gate_over_http() {
    let app = TestApp::new();
    let agent = app
        .agent(AgentPolicy::default().with_rule(SafetyRule::confirm("publish")))
        .await;
    let caller = Some(agent.owner_user_id);

    let (_, execution) = app
        .start(&agent, plan(&["draft entry", "publish release notes"]))
        .await;
    assert_eq!(execution["state"]["state"], "awaiting_confirmation");
    assert_eq!(execution["state"]["step_number"], 2);
    let id = execution["execution_id"].as_str().unwrap().to_string();

    let (status, approved) = app
        .send("POST", &format!("/api/v1/executions/{}/approve", id), caller, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(approved["state"]["state"], "completed");

    let (status, body) = app
        .send("POST", &format!("/api/v1/executions/{}/approve", id), caller, None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transition");
}

#[tokio::test]
async fn test_reject_and_stop_accept_optional_bodies() {
    let app = TestApp::new();
    let agent = app
        .agent(AgentPolicy::default().with_rule(SafetyRule::confirm("publish")))
        .await;
    let caller = Some(agent.owner_user_id);

    let (_, execution) = app.start(&agent, plan(&["publish now"])).await;
    let id = execution["execution_id"].as_str().unwrap().to_string();
    let (status, rejected) = app
        .send(
            "POST",
            &format!("/api/v1/executions/{}/reject", id),
            caller,
            Some(json!({"reason": "not yet"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rejected["state"]["state"], "halted");
    assert_eq!(rejected["state"]["reason"]["reason"], "user_rejected");

    let (_, execution) = app.start(&agent, plan(&["publish later"])).await;
    let id = execution["execution_id"].as_str().unwrap().to_string();
    let (status, stopped) = app
        .send("POST", &format!("/api/v1/executions/{}/stop", id), caller, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["state"]["state"], "halted");
    assert_eq!(stopped["state"]["reason"]["reason"], "user_requested");

    let (status, _) = app
        .send("POST", &format!("/api/v1/executions/{}/resume", id), caller, None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// ============================================================================
// CHECKPOINTS
// ============================================================================

#[tokio::test]
async fn test_checkpoint_create_list_and_rollback() {
    let app = TestApp::new();
    let agent = app.agent(AgentPolicy::default()).await;
    let caller = Some(agent.owner_user_id);

    let (_, execution) = app.start(&agent, plan(&["draft entry"])).await;
    let id = execution["execution_id"].as_str().unwrap().to_string();

    let (status, manual) = app
        .send(
            "POST",
            &format!("/api/v1/executions/{}/checkpoints", id),
            caller,
            Some(json!({"description": "before review"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(manual["automatic"], false);

    let (status, list) = app
        .send("GET", &format!("/api/v1/executions/{}/checkpoints", id), caller, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let checkpoints = list["checkpoints"].as_array().unwrap();
    // Initial state, after step 1, manual.
    assert_eq!(checkpoints.len(), 3);
    let initial = checkpoints
        .iter()
        .find(|c| c["step_number"] == 0)
        .unwrap();
    let checkpoint_id = initial["checkpoint_id"].as_str().unwrap();

    let (status, outcome) = app
        .send(
            "POST",
            &format!("/api/v1/checkpoints/{}/rollback", checkpoint_id),
            caller,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["checkpoint"]["checkpoint_id"], checkpoint_id);
    // Restored into executing and replayed to completion.
    assert_eq!(outcome["execution"]["state"]["state"], "completed");
    assert_eq!(app.invoker.call_count(), 2);

    let (status, body) = app
        .send(
            "POST",
            &format!("/api/v1/checkpoints/{}/rollback", Uuid::now_v7()),
            caller,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_audit_trail_lists_lifecycle_events() {
    let app = TestApp::new();
    let agent = app.agent(AgentPolicy::default()).await;

    let (_, execution) = app.start(&agent, plan(&["draft entry"])).await;
    let id = execution["execution_id"].as_str().unwrap().to_string();
    let (status, trail) = app
        .send(
            "GET",
            &format!("/api/v1/executions/{}/audit", id),
            Some(agent.owner_user_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<&str> = trail
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["event"].as_str())
        .collect();
    assert_eq!(events.first(), Some(&"execution.created"));
    assert_eq!(events.last(), Some(&"execution.completed"));
}
