//! Wire types and response-shape helpers for the control-plane operations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether the task's network interface receives a public address.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignPublicIp {
    /// No public address; the default.
    #[default]
    Disabled,
    /// Assign a public address.
    Enabled,
}

/// Request body for the `RunTask` operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    /// Cluster to launch into.
    pub cluster: String,
    /// Task definition ARN to instantiate.
    pub task_definition: String,
    /// Per-launch overrides applied on top of the task definition.
    pub overrides: TaskOverrides,
    /// Number of task copies; always one here.
    pub count: u32,
    /// Launch type; always `FARGATE` here.
    pub launch_type: String,
    /// Network attachment settings.
    pub network_configuration: NetworkConfiguration,
    /// Fargate platform version.
    pub platform_version: String,
}

/// Overrides applied on top of the task definition.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOverrides {
    /// Role the task assumes while running.
    pub task_role_arn: String,
    /// Per-container command and environment overrides.
    pub container_overrides: Vec<ContainerOverride>,
}

/// Command and environment override for one container.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    /// Full command line to run.
    pub command: Vec<String>,
    /// Environment passed to the container.
    pub environment: Vec<KeyValuePair>,
    /// Name of the container the override applies to.
    pub name: String,
}

/// Name/value pair in the container environment list.
#[derive(Clone, Debug, Serialize)]
pub struct KeyValuePair {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// Network configuration wrapper.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfiguration {
    /// VPC networking for the task.
    pub awsvpc_configuration: AwsVpcConfiguration,
}

/// VPC networking for the task.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsVpcConfiguration {
    /// Public address assignment.
    pub assign_public_ip: AssignPublicIp,
    /// Security groups attached to the task interface.
    pub security_groups: Vec<String>,
    /// Subnets the interface may be placed in.
    pub subnets: Vec<String>,
}

/// Request body for the `DescribeTasks` operation.
#[derive(Clone, Debug, Serialize)]
pub struct DescribeTasksRequest {
    /// Cluster the tasks belong to.
    pub cluster: String,
    /// Task identifiers to describe.
    pub tasks: Vec<String>,
}

/// Request body for the `StopTask` operation.
#[derive(Clone, Debug, Serialize)]
pub struct StopTaskRequest {
    /// Cluster the task belongs to.
    pub cluster: String,
    /// Task identifier to stop.
    pub task: String,
}

/// Extracts the single task object from a `DescribeTasks` response.
///
/// The control plane keys the result under `tasks` or, occasionally,
/// `task`; a freshly created task may be missing entirely until the read
/// becomes consistent. All three shapes are valid observations, with
/// `None` meaning "keep polling".
#[must_use]
pub fn task_in_response(response: &Value) -> Option<&Value> {
    response
        .get("tasks")
        .and_then(Value::as_array)
        .and_then(|tasks| tasks.first())
        .or_else(|| response.get("task"))
}

/// Private IPv4 address attached to the task's first network interface,
/// when the attachment has materialised.
#[must_use]
pub fn private_ip(task: &Value) -> Option<String> {
    task.get("attachments")?
        .as_array()?
        .first()?
        .get("details")?
        .as_array()?
        .iter()
        .find(|detail| detail.get("name").and_then(Value::as_str) == Some("privateIPv4Address"))
        .and_then(|detail| detail.get("value"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Last status reported for the task; empty while the record settles.
#[must_use]
pub fn last_status(task: &Value) -> String {
    task.get("lastStatus")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}
