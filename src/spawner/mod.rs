//! Task lifecycle controller: start, poll, stop, and durable state.
//!
//! [`TaskSpawner`] orchestrates RunTask / DescribeTasks / StopTask into a
//! small state machine. A start launches the task, waits for its network
//! attachment, then waits for the `RUNNING` status, emitting progress
//! events along the way; the returned URL is where the notebook server
//! listens. Only the task identifier is durable — status and addressing
//! are always re-read live from the control plane.


use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SpawnerConfig;
use crate::ecs::{
    self, ApiError, ContainerOverride, DescribeTasksRequest, EcsDispatch, EcsTarget, KeyValuePair,
    NetworkConfiguration, RunTaskRequest, StopTaskRequest, TaskOverrides,
};
use crate::progress::{ProgressBroadcaster, ProgressEvent, ProgressStream};
use crate::state_store::SpawnerState;

/// Statuses a task may report while it is starting or serving.
const ALLOWED_STATUSES: [&str; 4] = ["", "PROVISIONING", "PENDING", "RUNNING"];
const STATUS_RUNNING: &str = "RUNNING";

/// Bound on DescribeTasks polls while waiting for the network attachment.
const IP_POLL_LIMIT: u32 = 50;
/// Fixed wait between consecutive polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors surfaced by the task lifecycle.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Raised when the spawner configuration fails validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the launch call fails.
    #[error("failed to launch task: {0}")]
    Launch(#[source] ApiError),
    /// Raised when the launch response carries no task identifier.
    #[error("task launch response did not include a task ARN")]
    MissingTaskArn,
    /// Raised when a status read fails.
    #[error("failed to query task {task_arn}: {source}")]
    Describe {
        /// Identifier of the task being queried.
        task_arn: String,
        /// Underlying API failure.
        #[source]
        source: ApiError,
    },
    /// Raised when the stop call fails for a reason other than the task
    /// already being gone.
    #[error("failed to stop task {task_arn}: {source}")]
    Stop {
        /// Identifier of the task being stopped.
        task_arn: String,
        /// Underlying API failure.
        #[source]
        source: ApiError,
    },
    /// Raised when the network attachment never materialises within the
    /// poll bound.
    #[error("task {task_arn} took too long to find IP address")]
    NetworkTimeout {
        /// Identifier of the task that timed out.
        task_arn: String,
    },
    /// Raised when the task does not reach `RUNNING` within the start
    /// timeout budget.
    #[error("task {task_arn} took too long to become running")]
    StartTimeout {
        /// Identifier of the task that timed out.
        task_arn: String,
    },
    /// Raised when the task leaves the allowed status set during start-up.
    #[error("task {task_arn} is {status}")]
    TaskFailed {
        /// Identifier of the failed task.
        task_arn: String,
        /// Status reported by the control plane.
        status: String,
    },
    /// Raised when the cancellation token aborts a wait.
    #[error("task start was cancelled")]
    Cancelled,
}

/// Outcome of a lifecycle probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollStatus {
    /// The task is starting or running.
    Active,
    /// No task has been started; the host should call start.
    NotStarted,
    /// The task left the allowed status set; the remote resource still
    /// needs an explicit stop.
    Failed {
        /// Status reported by the control plane.
        status: String,
    },
}

/// State shared with concurrent probes while a start is in flight.
#[derive(Debug)]
struct LifecycleState {
    task_arn: String,
    // True between issuing RunTask and learning the task ARN. A poll in
    // that window must report "starting", not "not started", even though
    // there is no identifier to query yet.
    run_task_in_flight: bool,
    progress: ProgressBroadcaster,
}

/// Launches, monitors, and tears down one task at a time.
///
/// The host must not issue more than one concurrent `start` per spawner;
/// the in-flight flag deliberately tracks a single launch, matching the
/// one-logical-flow scheduling model of the host.
pub struct TaskSpawner<A: EcsDispatch> {
    api: A,
    config: SpawnerConfig,
    command: Vec<String>,
    environment: BTreeMap<String, String>,
    debug: bool,
    shared: Mutex<LifecycleState>,
    cancel: CancellationToken,
    poll_interval: Duration,
    ip_poll_limit: u32,
}

impl<A: EcsDispatch> TaskSpawner<A> {
    /// Creates a spawner over a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Config`] when the configuration is invalid.
    pub fn new(api: A, config: SpawnerConfig) -> Result<Self, SpawnError> {
        config
            .validate()
            .map_err(|err| SpawnError::Config(err.to_string()))?;
        Ok(Self {
            api,
            config,
            command: Vec::new(),
            environment: BTreeMap::new(),
            debug: false,
            shared: Mutex::new(LifecycleState {
                task_arn: String::new(),
                run_task_in_flight: false,
                progress: ProgressBroadcaster::new(),
            }),
            cancel: CancellationToken::new(),
            poll_interval: POLL_INTERVAL,
            ip_poll_limit: IP_POLL_LIMIT,
        })
    }

    /// Sets the base container command the notebook arguments are appended
    /// to.
    #[must_use]
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Sets the environment passed to the container.
    #[must_use]
    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Enables `--debug` forwarding to the container command line.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Installs a token that aborts the waits inside [`TaskSpawner::start`].
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Overrides the polling interval. Tests use this to keep timeout
    /// scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the network-attachment poll bound. Tests use this to keep
    /// timeout scenarios fast.
    #[must_use]
    pub const fn with_ip_poll_limit(mut self, limit: u32) -> Self {
        self.ip_poll_limit = limit;
        self
    }

    /// Durable projection persisted by the host across restarts.
    #[must_use]
    pub fn state(&self) -> SpawnerState {
        SpawnerState {
            task_arn: self.lock().task_arn.clone(),
        }
    }

    /// Restores the durable projection saved by a previous process.
    pub fn restore(&self, state: SpawnerState) {
        self.lock().task_arn = state.task_arn;
    }

    /// Subscribes to the progress stream of the current start attempt.
    #[must_use]
    pub fn progress(&self) -> ProgressStream {
        self.lock().progress.subscribe()
    }

    /// Forgets the task and opens a fresh progress stream for the next
    /// start attempt.
    pub fn clear_state(&self) {
        let mut state = self.lock();
        debug!(task_arn = %state.task_arn, "clearing task state");
        state.task_arn.clear();
        state.progress = ProgressBroadcaster::new();
    }

    /// Launches the task and waits until it is reachable, returning the
    /// notebook connection URL.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] when the launch fails, the task never gets a
    /// network attachment or never reaches `RUNNING` within the configured
    /// bounds, the task leaves the allowed status set, or the cancellation
    /// token fires.
    pub async fn start(&self) -> Result<String, SpawnError> {
        debug!("starting task");
        let port = self.config.notebook_port;

        {
            let mut state = self.lock();
            state
                .progress
                .write(ProgressEvent::with_message(0.5, "Starting server..."));
            state.run_task_in_flight = true;
        }
        let launch = self.run_task().await;
        let task_arn = {
            let mut state = self.lock();
            state.run_task_in_flight = false;
            let task_arn = match launch {
                Ok(task_arn) => task_arn,
                Err(err) => return Err(err),
            };
            state.task_arn = task_arn.clone();
            state.progress.write(ProgressEvent::at(1.0));
            task_arn
        };

        let task_ip = self.await_network_attachment(&task_arn).await?;
        self.write_progress(ProgressEvent::at(2.0));
        self.await_running(&task_arn).await?;

        self.write_progress(ProgressEvent::with_message(100.0, "Server started"));
        self.wait_interval().await?;
        self.lock().progress.close();

        Ok(format!(
            "{}://{task_ip}:{port}",
            self.config.notebook_scheme
        ))
    }

    /// Reports whether the task is active, never started, or failed.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Describe`] when the status read fails.
    pub async fn poll(&self) -> Result<PollStatus, SpawnError> {
        let task_arn = {
            let state = self.lock();
            if state.run_task_in_flight {
                return Ok(PollStatus::Active);
            }
            if state.task_arn.is_empty() {
                return Ok(PollStatus::NotStarted);
            }
            state.task_arn.clone()
        };

        let status = self.fetch_task_status(&task_arn).await?;
        if ALLOWED_STATUSES.contains(&status.as_str()) {
            Ok(PollStatus::Active)
        } else {
            Ok(PollStatus::Failed { status })
        }
    }

    /// Stops the task, succeeding when no task exists or the control plane
    /// reports it already gone.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Stop`] for any other stop failure.
    pub async fn stop(&self) -> Result<(), SpawnError> {
        let task_arn = self.lock().task_arn.clone();
        if task_arn.is_empty() {
            return Ok(());
        }

        debug!(task_arn = %task_arn, "stopping task");
        let request = StopTaskRequest {
            cluster: self.config.cluster_name.clone(),
            task: task_arn.clone(),
        };
        let body = serde_json::to_value(&request).map_err(|err| SpawnError::Stop {
            task_arn: task_arn.clone(),
            source: ApiError::Request {
                message: err.to_string(),
            },
        })?;
        match self.api.dispatch(EcsTarget::StopTask, &body).await {
            // The task already expired on the remote side; stopping twice
            // must stay idempotent.
            Err(err) if err.is_task_not_found() => {}
            Err(source) => return Err(SpawnError::Stop { task_arn, source }),
            Ok(_response) => {}
        }
        debug!(task_arn = %task_arn, "stopped task");
        Ok(())
    }

    async fn run_task(&self) -> Result<String, SpawnError> {
        let request = RunTaskRequest {
            cluster: self.config.cluster_name.clone(),
            task_definition: self.config.task_definition_arn.clone(),
            overrides: TaskOverrides {
                task_role_arn: self.config.task_role_arn.clone(),
                container_overrides: vec![ContainerOverride {
                    command: self.container_command(),
                    environment: self
                        .environment
                        .iter()
                        .map(|(name, value)| KeyValuePair {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                    name: self.config.container_name.clone(),
                }],
            },
            count: 1,
            launch_type: String::from("FARGATE"),
            network_configuration: NetworkConfiguration {
                awsvpc_configuration: ecs::AwsVpcConfiguration {
                    assign_public_ip: self.config.assign_public_ip,
                    security_groups: self.config.security_groups.clone(),
                    subnets: self.config.subnets.clone(),
                },
            },
            platform_version: self.config.platform_version.clone(),
        };
        let body = serde_json::to_value(&request).map_err(|err| {
            SpawnError::Launch(ApiError::Request {
                message: err.to_string(),
            })
        })?;
        let response = self
            .api
            .dispatch(EcsTarget::RunTask, &body)
            .await
            .map_err(SpawnError::Launch)?;
        response
            .get("tasks")
            .and_then(Value::as_array)
            .and_then(|tasks| tasks.first())
            .and_then(|task| task.get("taskArn"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(SpawnError::MissingTaskArn)
    }

    /// Full command line for the container: base command, optional
    /// `--debug`, the port argument, then the configured extra arguments.
    fn container_command(&self) -> Vec<String> {
        let mut command = self.command.clone();
        if self.debug {
            command.push(String::from("--debug"));
        }
        command.push(format!("--port={}", self.config.notebook_port));
        command.extend(self.config.notebook_args.iter().cloned());
        command
    }

    /// Polls until the task's private IP is visible. The attempt counter
    /// reaches the bound before the read, so a bound of N performs N−1
    /// reads — inherited off-by-one, pinned by tests.
    async fn await_network_attachment(&self, task_arn: &str) -> Result<String, SpawnError> {
        let limit = self.ip_poll_limit;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            if attempts >= limit {
                return Err(SpawnError::NetworkTimeout {
                    task_arn: task_arn.to_owned(),
                });
            }
            let task_ip = self.fetch_task_ip(task_arn).await?;
            self.wait_interval().await?;
            self.write_progress(ProgressEvent::at(
                1.0 + f64::from(attempts) / f64::from(limit),
            ));
            if let Some(ip) = task_ip {
                return Ok(ip);
            }
        }
    }

    /// Polls until the task reports `RUNNING`, failing fast when it leaves
    /// the allowed status set. The progress ramp `2 + attempt/budget * 98`
    /// is UI-facing and preserved exactly.
    async fn await_running(&self, task_arn: &str) -> Result<(), SpawnError> {
        let budget = self.config.start_timeout;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            if attempts >= budget {
                return Err(SpawnError::StartTimeout {
                    task_arn: task_arn.to_owned(),
                });
            }
            let status = self.fetch_task_status(task_arn).await?;
            if !ALLOWED_STATUSES.contains(&status.as_str()) {
                return Err(SpawnError::TaskFailed {
                    task_arn: task_arn.to_owned(),
                    status,
                });
            }
            self.wait_interval().await?;
            self.write_progress(ProgressEvent::at(
                2.0 + f64::from(attempts) / f64::from(budget) * 98.0,
            ));
            if status == STATUS_RUNNING {
                return Ok(());
            }
        }
    }

    async fn describe_task(&self, task_arn: &str) -> Result<Option<Value>, SpawnError> {
        let request = DescribeTasksRequest {
            cluster: self.config.cluster_name.clone(),
            tasks: vec![task_arn.to_owned()],
        };
        let body = serde_json::to_value(&request).map_err(|err| SpawnError::Describe {
            task_arn: task_arn.to_owned(),
            source: ApiError::Request {
                message: err.to_string(),
            },
        })?;
        let response = self
            .api
            .dispatch(EcsTarget::DescribeTasks, &body)
            .await
            .map_err(|source| SpawnError::Describe {
                task_arn: task_arn.to_owned(),
                source,
            })?;
        Ok(ecs::task_in_response(&response).cloned())
    }

    async fn fetch_task_ip(&self, task_arn: &str) -> Result<Option<String>, SpawnError> {
        let task = self.describe_task(task_arn).await?;
        Ok(task.as_ref().and_then(ecs::private_ip))
    }

    async fn fetch_task_status(&self, task_arn: &str) -> Result<String, SpawnError> {
        let task = self.describe_task(task_arn).await?;
        Ok(task.as_ref().map(ecs::last_status).unwrap_or_default())
    }

    /// Sleeps one poll interval, aborting early when the cancellation token
    /// fires.
    async fn wait_interval(&self) -> Result<(), SpawnError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(SpawnError::Cancelled),
            () = sleep(self.poll_interval) => Ok(()),
        }
    }

    fn write_progress(&self, event: ProgressEvent) {
        self.lock().progress.write(event);
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
