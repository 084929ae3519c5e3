//! Optional Tool Registry collaborator.
//!
//! When `TOOL_REGISTRY_URL` is configured, the router intercepts
//! `function.call` events whose tool name the registry knows and answers the
//! client locally instead of forwarding upstream. The tool list is fetched
//! once at startup; a failed probe logs a warning and leaves interception
//! disabled for the process lifetime.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use serde_json::{json, Value};

pub struct ToolRegistryClient {
    base_url: String,
    client: reqwest::Client,
    names: RwLock<HashSet<String>>,
}

impl ToolRegistryClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            names: RwLock::new(HashSet::new()),
        }
    }

    /// Fetch the tool list and cache the names. Returns how many were found.
    pub async fn refresh(&self) -> anyhow::Result<usize> {
        let tools = self.list_tools().await?;
        let names: HashSet<String> = tools
            .iter()
            .filter_map(|t| {
                t.get("name")
                    .or_else(|| t.get("tool_id"))
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
            })
            .collect();
        let count = names.len();
        *self.names.write().unwrap() = names;
        Ok(count)
    }

    /// Whether the registry advertised a tool under this name.
    pub fn knows(&self, name: &str) -> bool {
        self.names.read().unwrap().contains(name)
    }

    pub async fn list_tools(&self) -> anyhow::Result<Vec<Value>> {
        let resp = self
            .client
            .get(format!("{}/tools", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Execute a tool and return its output payload.
    pub async fn call(&self, name: &str, params: &Value) -> anyhow::Result<Value> {
        let resp = self
            .client
            .post(format!("{}/execute_tool", self.base_url))
            .json(&json!({
                "tool_id": name,
                "input_data": params,
            }))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = resp.json().await?;
        Ok(body.get("output_data").cloned().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_refresh_caches_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "calculator", "description": "math"},
                {"tool_id": "web_search"}
            ])))
            .mount(&server)
            .await;

        let registry = ToolRegistryClient::new(&server.uri());
        let count = registry.refresh().await.unwrap();
        assert_eq!(count, 2);
        assert!(registry.knows("calculator"));
        assert!(registry.knows("web_search"));
        assert!(!registry.knows("nonexistent"));
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_empty_cache() {
        let registry = ToolRegistryClient::new("http://127.0.0.1:1");
        assert!(registry.refresh().await.is_err());
        assert!(!registry.knows("anything"));
    }

    #[tokio::test]
    async fn test_call_extracts_output_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute_tool"))
            .and(body_partial_json(json!({"tool_id": "calculator"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"output_data": {"answer": 42}})),
            )
            .mount(&server)
            .await;

        let registry = ToolRegistryClient::new(&server.uri());
        let result = registry
            .call("calculator", &json!({"expr": "6*7"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"answer": 42}));
    }

    #[tokio::test]
    async fn test_call_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute_tool"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = ToolRegistryClient::new(&server.uri());
        assert!(registry.call("boom", &json!({})).await.is_err());
    }
}
