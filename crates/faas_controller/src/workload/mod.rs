//! Pure construction of the Deployment and Service a Function materializes into,
//! together with the policies layered onto the generated pod.

pub mod deployment;
pub mod fingerprint;
pub mod ownership;
pub mod probes;
pub mod profiles;
pub mod replicas;
pub mod resources;
pub mod secrets;
pub mod service;

pub use deployment::materialize_deployment;
pub use fingerprint::{deployment_needs_update, specs_equal, LastAppliedSpec};
pub use ownership::is_owned;
pub use probes::FunctionProbes;
pub use profiles::ProfileChanges;
pub use replicas::desired_replicas;
pub use secrets::SecretsClient;
pub use service::materialize_service;

pub const FUNCTION_LABEL: &str = "faas_function";
pub const MIN_REPLICAS_LABEL: &str = "com.openfaas.scale.min";

pub const FUNCTION_SPEC_ANNOTATION: &str = "com.openfaas.function.spec";
pub const PROFILE_ANNOTATION: &str = "com.openfaas.profile";
pub const SCRAPE_ANNOTATION: &str = "prometheus.io.scrape";
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "com.openfaas.serviceaccount";
pub const PROBE_PATH_ANNOTATION: &str = "com.openfaas.health.http.path";
pub const PROBE_INITIAL_DELAY_ANNOTATION: &str = "com.openfaas.health.http.initialDelay";

/// Port the function watchdog listens on inside the pod
pub const WATCHDOG_PORT: i32 = 8080;
pub const HANDLER_ENV_VAR: &str = "fprocess";
pub const SECRETS_MOUNT_PATH: &str = "/var/openfaas/secrets";
pub const NON_ROOT_USER_ID: i64 = 12000;

/// Probe timings applied to every generated container
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    pub initial_delay_seconds: i32,
    pub timeout_seconds: i32,
    pub period_seconds: i32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_delay_seconds: 2,
            timeout_seconds: 1,
            period_seconds: 2,
        }
    }
}

/// Cluster-wide settings for generated workloads
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactoryConfig {
    /// HTTP probes against the watchdog instead of `cat /tmp/.lock`
    pub http_probe: bool,
    pub set_non_root_user: bool,
    pub image_pull_policy: String,
    pub liveness_probe: ProbeConfig,
    pub readiness_probe: ProbeConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            http_probe: true,
            set_non_root_user: false,
            image_pull_policy: "Always".to_string(),
            liveness_probe: ProbeConfig::default(),
            readiness_probe: ProbeConfig::default(),
        }
    }
}

/// Builds the derived pieces of a workload from the factory configuration.
#[derive(Clone, Debug, Default)]
pub struct FunctionFactory {
    pub config: FactoryConfig,
}

impl FunctionFactory {
    pub fn new(config: FactoryConfig) -> Self {
        Self { config }
    }
}
