//! Configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::ecs::AssignPublicIp;

/// Spawner configuration derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "FARGATE")]
pub struct SpawnerConfig {
    /// Region the control-plane host lives in; bound into every signature.
    pub aws_region: String,
    /// Control-plane host, for example `ecs.eu-west-2.amazonaws.com`.
    pub ecs_host: String,
    /// Role the launched task assumes. May be empty when the task
    /// definition carries its own role.
    #[ortho_config(default = String::new())]
    pub task_role_arn: String,
    /// Cluster tasks are launched into.
    pub cluster_name: String,
    /// Name of the container inside the task definition that receives the
    /// command and environment overrides.
    pub container_name: String,
    /// Task definition ARN to instantiate.
    pub task_definition_arn: String,
    /// Security groups attached to the task's network interface.
    #[ortho_config(default = Vec::new())]
    pub security_groups: Vec<String>,
    /// Subnets the task's network interface may be placed in. At least one
    /// is required.
    #[ortho_config(default = Vec::new())]
    pub subnets: Vec<String>,
    /// Whether the task receives a public address. Defaults to disabled.
    #[ortho_config(default = AssignPublicIp::Disabled)]
    pub assign_public_ip: AssignPublicIp,
    /// Fargate platform version. Defaults to `LATEST`.
    #[ortho_config(default = String::from("LATEST"))]
    pub platform_version: String,
    /// Port the notebook server listens on inside the task.
    pub notebook_port: u16,
    /// URL scheme of the returned connection address. Defaults to `http`.
    #[ortho_config(default = String::from("http"))]
    pub notebook_scheme: String,
    /// Extra arguments appended to the notebook command line.
    #[ortho_config(default = Vec::new())]
    pub notebook_args: Vec<String>,
    /// Budget, in poll intervals, for the task to reach `RUNNING` once its
    /// network attachment is known. Also scales the 2–100 progress ramp.
    #[ortho_config(default = 300)]
    pub start_timeout: u32,
}

/// Metadata for a configuration field, used to build actionable errors.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl SpawnerConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to the configuration file",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags
    /// in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("fargate-spawner")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages name
    /// the environment variable and configuration key that supply missing
    /// values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.aws_region,
            &FieldMetadata::new("AWS region", "FARGATE_AWS_REGION", "aws_region"),
        )?;
        Self::require_field(
            &self.ecs_host,
            &FieldMetadata::new("control-plane host", "FARGATE_ECS_HOST", "ecs_host"),
        )?;
        Self::require_field(
            &self.cluster_name,
            &FieldMetadata::new("cluster name", "FARGATE_CLUSTER_NAME", "cluster_name"),
        )?;
        Self::require_field(
            &self.container_name,
            &FieldMetadata::new(
                "container name",
                "FARGATE_CONTAINER_NAME",
                "container_name",
            ),
        )?;
        Self::require_field(
            &self.task_definition_arn,
            &FieldMetadata::new(
                "task definition ARN",
                "FARGATE_TASK_DEFINITION_ARN",
                "task_definition_arn",
            ),
        )?;
        Self::require_field(
            &self.notebook_scheme,
            &FieldMetadata::new(
                "notebook URL scheme",
                "FARGATE_NOTEBOOK_SCHEME",
                "notebook_scheme",
            ),
        )?;
        if self.subnets.iter().all(|subnet| subnet.trim().is_empty()) {
            return Err(ConfigError::MissingField(String::from(
                "missing subnets: set FARGATE_SUBNETS or add subnets to the configuration file",
            )));
        }
        if self.notebook_port == 0 {
            return Err(ConfigError::Invalid(String::from(
                "notebook_port must be non-zero",
            )));
        }
        if self.start_timeout < 2 {
            return Err(ConfigError::Invalid(String::from(
                "start_timeout must allow at least one status poll",
            )));
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn valid_config() -> SpawnerConfig {
        SpawnerConfig {
            aws_region: String::from("eu-west-2"),
            ecs_host: String::from("ecs.eu-west-2.amazonaws.com"),
            task_role_arn: String::from("arn:aws:iam::role/notebook"),
            cluster_name: String::from("hub-cluster"),
            container_name: String::from("notebook"),
            task_definition_arn: String::from("arn:aws:ecs:task-definition/notebook:3"),
            security_groups: vec![String::from("sg-1")],
            subnets: vec![String::from("subnet-1")],
            assign_public_ip: AssignPublicIp::Disabled,
            platform_version: String::from("LATEST"),
            notebook_port: 8888,
            notebook_scheme: String::from("http"),
            notebook_args: Vec::new(),
            start_timeout: 300,
        }
    }

    #[test]
    fn valid_configuration_passes_validation() {
        valid_config()
            .validate()
            .unwrap_or_else(|err| panic!("validation should pass: {err}"));
    }

    #[rstest]
    #[case::region(|config: &mut SpawnerConfig| config.aws_region.clear(), "FARGATE_AWS_REGION")]
    #[case::host(|config: &mut SpawnerConfig| config.ecs_host.clear(), "FARGATE_ECS_HOST")]
    #[case::cluster(
        |config: &mut SpawnerConfig| config.cluster_name.clear(),
        "FARGATE_CLUSTER_NAME"
    )]
    #[case::container(
        |config: &mut SpawnerConfig| config.container_name.clear(),
        "FARGATE_CONTAINER_NAME"
    )]
    #[case::definition(
        |config: &mut SpawnerConfig| config.task_definition_arn.clear(),
        "FARGATE_TASK_DEFINITION_ARN"
    )]
    #[case::subnets(|config: &mut SpawnerConfig| config.subnets.clear(), "FARGATE_SUBNETS")]
    fn missing_required_fields_name_their_sources(
        #[case] strip: fn(&mut SpawnerConfig),
        #[case] env_var: &str,
    ) {
        let mut config = valid_config();
        strip(&mut config);

        let Err(ConfigError::MissingField(message)) = config.validate() else {
            panic!("expected a missing-field error");
        };
        assert!(
            message.contains(env_var),
            "message should name {env_var}: {message}"
        );
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = valid_config();
        config.notebook_port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn degenerate_start_timeout_is_rejected() {
        let mut config = valid_config();
        config.start_timeout = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn empty_role_arn_is_allowed() {
        let mut config = valid_config();
        config.task_role_arn.clear();
        config
            .validate()
            .unwrap_or_else(|err| panic!("empty role should validate: {err}"));
    }
}
