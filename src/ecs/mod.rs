//! Signed HTTP client for the ECS control-plane API.
//!
//! Every call is a `POST https://{host}/` with an `X-Amz-Target` operation
//! header and a request-signed header set; responses come back as parsed
//! JSON for the lifecycle controller to interpret.

mod error;
mod types;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::credentials::CredentialSource;
use crate::sigv4::{self, RequestDescriptor};

pub use error::ApiError;
pub use types::{
    AssignPublicIp, AwsVpcConfiguration, ContainerOverride, DescribeTasksRequest, KeyValuePair,
    NetworkConfiguration, RunTaskRequest, StopTaskRequest, TaskOverrides, last_status, private_ip,
    task_in_response,
};

/// Service code used in the credential scope.
const SERVICE: &str = "ecs";
/// Versioned prefix of every `X-Amz-Target` operation header.
const API_PREFIX: &str = "AmazonEC2ContainerServiceV20141113";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Control-plane operations used by the task lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EcsTarget {
    /// Launches a task.
    RunTask,
    /// Reads the current description of one or more tasks.
    DescribeTasks,
    /// Requests a task stop.
    StopTask,
}

impl EcsTarget {
    /// Operation name as it appears in the `X-Amz-Target` header.
    #[must_use]
    pub const fn operation(self) -> &'static str {
        match self {
            Self::RunTask => "RunTask",
            Self::DescribeTasks => "DescribeTasks",
            Self::StopTask => "StopTask",
        }
    }
}

/// Future returned by [`EcsDispatch`] implementations.
pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ApiError>> + Send + 'a>>;

/// Dispatch seam between the lifecycle controller and the control plane.
///
/// The controller only needs "send this operation, give me the parsed
/// body"; tests substitute a scripted implementation.
pub trait EcsDispatch: Send + Sync {
    /// Issues one signed call and returns the parsed response body.
    fn dispatch<'a>(&'a self, target: EcsTarget, body: &'a Value) -> DispatchFuture<'a>;
}

/// Signed client for the control-plane HTTP API.
pub struct EcsClient<C: CredentialSource> {
    http: reqwest::Client,
    region: String,
    host: String,
    endpoint: String,
    credentials: C,
}

impl<C: CredentialSource> EcsClient<C> {
    /// Creates a client for the given region and control-plane host.
    #[must_use]
    pub fn new(region: impl Into<String>, host: impl Into<String>, credentials: C) -> Self {
        let host = host.into();
        Self {
            http: reqwest::Client::new(),
            region: region.into(),
            endpoint: format!("https://{host}/"),
            host,
            credentials,
        }
    }

    /// Overrides the URL requests are sent to while keeping the signed
    /// `host` header. Tests use this to point at a local server.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn call(&self, target: EcsTarget, body: &Value) -> Result<Value, ApiError> {
        let payload = serde_json::to_vec(body).map_err(|err| ApiError::Request {
            message: err.to_string(),
        })?;
        let credentials = self.credentials.credentials().await?;

        let mut pre_auth = credentials.pre_auth_headers.clone();
        pre_auth.insert(
            String::from("X-Amz-Target"),
            format!("{API_PREFIX}.{}", target.operation()),
        );
        pre_auth.insert(String::from("Content-Type"), String::from(CONTENT_TYPE));

        let query = BTreeMap::new();
        let descriptor = RequestDescriptor {
            service: SERVICE,
            region: &self.region,
            host: &self.host,
            method: "POST",
            path: "/",
            query: &query,
            headers: &pre_auth,
            payload: &payload,
        };
        let signed = sigv4::sign(&descriptor, &credentials, OffsetDateTime::now_utc());

        let mut request = self.http.post(self.endpoint.clone());
        for (name, value) in &signed {
            request = request.header(name.as_str(), value.as_str());
        }
        debug!(operation = target.operation(), body = %body, "issuing control-plane request");
        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|err| ApiError::Transport {
                message: err.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| ApiError::Transport {
            message: err.to_string(),
        })?;
        if !status.is_success() {
            error!(
                operation = target.operation(),
                status = status.as_u16(),
                body = %text,
                "control-plane request failed"
            );
            return Err(ApiError::Service {
                status: status.as_u16(),
                body: text,
            });
        }
        debug!(operation = target.operation(), body = %text, "control-plane response");
        serde_json::from_str(&text).map_err(|err| ApiError::Decode {
            message: err.to_string(),
        })
    }
}

impl<C: CredentialSource> EcsDispatch for EcsClient<C> {
    fn dispatch<'a>(&'a self, target: EcsTarget, body: &'a Value) -> DispatchFuture<'a> {
        Box::pin(self.call(target, body))
    }
}
