//! Launch, monitor, and tear down single-container ECS Fargate tasks.
//!
//! The crate exposes a task lifecycle controller (launch → wait for the
//! network attachment → wait for `RUNNING` → stop) over a request-signed
//! HTTP client for the ECS control plane, with live progress reporting
//! that any number of observers can replay from the beginning. A host
//! scheduler drives [`TaskSpawner`] through `start`, `poll`, and `stop`,
//! and persists its single durable field across restarts via
//! [`StateStore`].

pub mod config;
pub mod credentials;
pub mod ecs;
pub mod progress;
pub mod sigv4;
pub mod spawner;
pub mod state_store;

pub use config::{ConfigError, SpawnerConfig};
pub use credentials::{
    ContainerCredentials, CredentialError, CredentialFuture, CredentialSource, Credentials,
    StaticCredentials,
};
pub use ecs::{ApiError, AssignPublicIp, DispatchFuture, EcsClient, EcsDispatch, EcsTarget};
pub use progress::{ProgressBroadcaster, ProgressEvent, ProgressStream};
pub use spawner::{PollStatus, SpawnError, TaskSpawner};
pub use state_store::{FileStateStore, SpawnerState, StateStore, StateStoreError};
