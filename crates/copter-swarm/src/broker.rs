//! HTTP client for the capability broker.
//!
//! - `POST {base}/units/{kind}` with `{"index": n}` or `{}` → device JSON
//! - `POST {base}/devices/{externalId}/operations/{op}` with args → result JSON

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{Value, json};

use crate::device::Device;
use crate::remote::{DeviceClient, Provisioner, RemoteError, ops};
use crate::version::SWARM_VERSION;

pub struct HttpBroker {
    base: Url,
    client: reqwest::Client,
}

impl HttpBroker {
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        let base = Url::parse(base_url)
            .map_err(|e| RemoteError::Transport(format!("invalid broker url {base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(RemoteError::Transport(format!(
                "broker url cannot be a base: {base_url}"
            )));
        }

        // No client-wide timeout: charges legitimately run for minutes.
        // Blocking calls are bounded by `Remote`.
        let client = reqwest::Client::builder()
            .user_agent(format!("copter-swarm/{}", SWARM_VERSION))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(Self { base, client })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post(&self, operation: &str, url: Url, body: &Value) -> Result<Value, RemoteError> {
        tracing::trace!(%url, operation, "Broker request");
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(operation, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RemoteError::failed(
                operation,
                format!("broker returned {status}: {text}"),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error(operation, e))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::decode(operation, e.to_string()))
    }
}

fn request_error(operation: &str, err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout {
            operation: operation.to_string(),
        }
    } else {
        RemoteError::Transport(err.to_string())
    }
}

#[async_trait]
impl Provisioner for HttpBroker {
    async fn request_unit(&self, kind: &str, index: Option<usize>) -> Result<Device, RemoteError> {
        let body = match index {
            Some(index) => json!({ "index": index }),
            None => json!({}),
        };
        let value = self
            .post(ops::REQUEST_UNIT, self.endpoint(&["units", kind]), &body)
            .await?;
        serde_json::from_value(value).map_err(|e| RemoteError::decode(ops::REQUEST_UNIT, e.to_string()))
    }
}

#[async_trait]
impl DeviceClient for HttpBroker {
    async fn invoke(
        &self,
        device: &Device,
        operation: &str,
        args: Value,
    ) -> Result<Value, RemoteError> {
        let url = self.endpoint(&["devices", &device.external_id, "operations", operation]);
        self.post(operation, url, &args).await
    }
}
