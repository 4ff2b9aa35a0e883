// Container runtime client
//
// The relay only needs "inspect container by id" from the runtime. Docker
// Engine exposes it as GET /containers/<id>/json.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// What the name resolver needs to know about a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub image: String,
    pub env: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo>;
}

#[derive(Deserialize)]
struct InspectResponse {
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Config", default)]
    config: Option<InspectConfig>,
}

#[derive(Deserialize)]
struct InspectConfig {
    #[serde(rename = "Env", default)]
    env: Option<Vec<String>>,
}

pub struct DockerClient {
    client: reqwest::Client,
    endpoint: String,
}

impl DockerClient {
    /// `endpoint` is either http://host:port or tcp://host:port
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = match endpoint.strip_prefix("tcp://") {
            Some(rest) => format!("http://{}", rest),
            None => endpoint.to_string(),
        };
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(Error::Runtime(format!(
                "unsupported docker endpoint {:?}, expected http:// or tcp://",
                endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Runtime(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let url = format!("{}/containers/{}/json", self.endpoint, container_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Runtime(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Runtime(format!(
                "HTTP {} inspecting container {}",
                response.status(),
                container_id
            )));
        }

        let body: InspectResponse = response
            .json()
            .await
            .map_err(|e| Error::Runtime(e.to_string()))?;

        Ok(ContainerInfo {
            image: body.image,
            env: body.config.and_then(|c| c.env).unwrap_or_default(),
        })
    }
}
