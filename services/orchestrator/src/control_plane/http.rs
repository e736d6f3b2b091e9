//! HTTP client for the panel API.

use std::time::Duration;

use async_trait::async_trait;
use fleetboot_id::{InstanceId, NodeId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{ControlPlane, ControlPlaneError, ControlPlaneResult, PowerAction};
use crate::model::{InstanceState, InstanceStatus, NodeMetrics, ResourceUsage, WorkerNode};

/// Panel API client.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpControlPlane {
    /// Create a new client. `base_url` must not end with a slash.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ControlPlaneResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn server_url(&self, instance_id: &InstanceId, suffix: &str) -> String {
        format!("{}/api/client/servers/{}/{}", self.base_url, instance_id, suffix)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        instance_id: &InstanceId,
        body: &B,
    ) -> ControlPlaneResult<()> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        check_status(response, instance_id).await.map(|_| ())
    }
}

async fn check_status(
    response: reqwest::Response,
    instance_id: &InstanceId,
) -> ControlPlaneResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ControlPlaneError::NotFound(instance_id.clone()));
    }

    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, instance_id = %instance_id, "Control plane request failed");
    Err(ControlPlaneError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Serialize)]
struct PowerRequest {
    signal: PowerAction,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    attributes: T,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    data: Vec<Envelope<T>>,
}

#[derive(Debug, Deserialize)]
struct ResourcesAttributes {
    current_state: String,
    #[serde(default)]
    resources: Option<ResourcesWire>,
}

#[derive(Debug, Deserialize)]
struct ResourcesWire {
    #[serde(default)]
    memory_bytes: u64,
    #[serde(default)]
    cpu_absolute: f64,
    #[serde(default)]
    disk_bytes: u64,
    /// Milliseconds.
    #[serde(default)]
    uptime: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NodeAttributes {
    id: serde_json::Value,
    name: String,
    #[serde(default)]
    max_concurrent_operations: Option<u32>,
    /// MiB.
    #[serde(default)]
    memory: Option<u64>,
    #[serde(default)]
    allocated_resources: Option<AllocatedWire>,
}

#[derive(Debug, Deserialize)]
struct AllocatedWire {
    /// MiB.
    #[serde(default)]
    memory: u64,
}

impl ResourcesAttributes {
    fn into_status(self) -> InstanceStatus {
        let state = InstanceState::from_wire(&self.current_state);
        match self.resources {
            Some(r) => InstanceStatus {
                state,
                uptime: r
                    .uptime
                    .filter(|_| state == InstanceState::Running)
                    .map(Duration::from_millis),
                resource_usage: ResourceUsage {
                    memory_bytes: r.memory_bytes,
                    cpu_percent: r.cpu_absolute,
                    disk_bytes: r.disk_bytes,
                },
            },
            None => InstanceStatus {
                state,
                ..InstanceStatus::default()
            },
        }
    }
}

impl NodeAttributes {
    fn into_node(self) -> ControlPlaneResult<WorkerNode> {
        let raw_id = match &self.id {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => return Err(ControlPlaneError::Decode(format!("invalid node id: {other}"))),
        };
        let id = NodeId::parse(&raw_id).map_err(|e| ControlPlaneError::Decode(e.to_string()))?;

        const MIB: u64 = 1024 * 1024;
        let metrics = match (self.memory, self.allocated_resources) {
            (Some(total), Some(allocated)) => Some(NodeMetrics {
                memory_used_bytes: allocated.memory * MIB,
                memory_total_bytes: total * MIB,
                cpu_percent: 0.0,
            }),
            _ => None,
        };

        Ok(WorkerNode {
            id,
            name: self.name,
            capacity: self.max_concurrent_operations.unwrap_or(0),
            metrics,
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn send_command(
        &self,
        instance_id: &InstanceId,
        command: &str,
    ) -> ControlPlaneResult<()> {
        debug!(instance_id = %instance_id, command = %command, "Sending console command");
        let url = self.server_url(instance_id, "command");
        self.post_json(&url, instance_id, &CommandRequest { command })
            .await
    }

    async fn power_action(
        &self,
        instance_id: &InstanceId,
        action: PowerAction,
    ) -> ControlPlaneResult<()> {
        debug!(instance_id = %instance_id, action = %action, "Sending power action");
        let url = self.server_url(instance_id, "power");
        self.post_json(&url, instance_id, &PowerRequest { signal: action })
            .await
    }

    async fn get_status(&self, instance_id: &InstanceId) -> ControlPlaneResult<InstanceStatus> {
        let url = self.server_url(instance_id, "resources");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = check_status(response, instance_id).await?;

        let body: Envelope<ResourcesAttributes> = response
            .json()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;
        Ok(body.attributes.into_status())
    }

    async fn list_nodes(&self) -> ControlPlaneResult<Vec<WorkerNode>> {
        let url = format!("{}/api/application/nodes", self.base_url);
        debug!(url = %url, "Listing worker nodes");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to list nodes");
            return Err(ControlPlaneError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: ListEnvelope<NodeAttributes> = response
            .json()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;

        body.data
            .into_iter()
            .map(|envelope| envelope.attributes.into_node())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn inst(id: &str) -> InstanceId {
        InstanceId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_power_action_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/servers/abc123/power"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"signal": "stop"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(server.uri(), "secret").unwrap();
        client
            .power_action(&inst("abc123"), PowerAction::Stop)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_command_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/servers/abc123/command"))
            .and(body_json(json!({"command": "save-all"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(format!("{}/", server.uri()), "secret").unwrap();
        client
            .send_command(&inst("abc123"), "save-all")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_status_parses_resources() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/servers/abc123/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "stats",
                "attributes": {
                    "current_state": "running",
                    "resources": {
                        "memory_bytes": 1024,
                        "cpu_absolute": 12.5,
                        "disk_bytes": 2048,
                        "uptime": 90_000
                    }
                }
            })))
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(server.uri(), "secret").unwrap();
        let status = client.get_status(&inst("abc123")).await.unwrap();
        assert_eq!(status.state, InstanceState::Running);
        assert_eq!(status.uptime, Some(Duration::from_secs(90)));
        assert_eq!(status.resource_usage.memory_bytes, 1024);
    }

    #[tokio::test]
    async fn test_get_status_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/servers/missing/resources"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(server.uri(), "secret").unwrap();
        let err = client.get_status(&inst("missing")).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/servers/abc123/power"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(server.uri(), "secret").unwrap();
        let err = client
            .power_action(&inst("abc123"), PowerAction::Start)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_list_nodes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/application/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    {"object": "node", "attributes": {
                        "id": 1, "name": "eu-1", "max_concurrent_operations": 3,
                        "memory": 16384, "allocated_resources": {"memory": 8192}
                    }},
                    {"object": "node", "attributes": {"id": "us-2", "name": "us-2"}}
                ]
            })))
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(server.uri(), "secret").unwrap();
        let nodes = client.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id.as_str(), "1");
        assert_eq!(nodes[0].capacity, 3);
        assert_eq!(
            nodes[0].metrics.as_ref().unwrap().memory_total_bytes,
            16384 * 1024 * 1024
        );
        assert_eq!(nodes[1].capacity, 0);
        assert!(nodes[1].metrics.is_none());
    }
}
