use clap::Parser;
use faas_controller::controllers::{self, ControllerConfig, State};
use faas_controller::util::telemetry;
use faas_controller::workload::{FactoryConfig, ProbeConfig};
use tokio_util::sync::CancellationToken;
use tracing::*;

mod handlers;
mod server;

/// Reconciles OpenFaaS Function resources into Deployments and Services
#[derive(Parser, Debug)]
#[command(name = "faas-operator", version, about, long_about = None)]
struct Cli {
    /// Namespace watched for Functions and their workloads
    #[arg(long, env = "FUNCTIONS_NAMESPACE", default_value = "openfaas-fn")]
    functions_namespace: String,

    /// Namespace holding Profiles
    #[arg(long, env = "PROFILES_NAMESPACE", default_value = "openfaas")]
    profiles_namespace: String,

    /// Number of concurrent sync workers
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// Run function containers as a fixed non-root user
    #[arg(long, env = "SET_NONROOT_USER")]
    set_non_root_user: bool,

    /// HTTP probes against the watchdog; `false` falls back to exec probes
    #[arg(long, env = "HTTP_PROBE", default_value_t = true, action = clap::ArgAction::Set)]
    http_probe: bool,

    #[arg(long, env = "IMAGE_PULL_POLICY", default_value = "Always")]
    image_pull_policy: String,

    #[arg(long, env = "LIVENESS_PROBE_INITIAL_DELAY_SECONDS", default_value_t = 2)]
    liveness_initial_delay_seconds: i32,

    #[arg(long, env = "LIVENESS_PROBE_TIMEOUT_SECONDS", default_value_t = 1)]
    liveness_timeout_seconds: i32,

    #[arg(long, env = "LIVENESS_PROBE_PERIOD_SECONDS", default_value_t = 2)]
    liveness_period_seconds: i32,

    #[arg(long, env = "READINESS_PROBE_INITIAL_DELAY_SECONDS", default_value_t = 2)]
    readiness_initial_delay_seconds: i32,

    #[arg(long, env = "READINESS_PROBE_TIMEOUT_SECONDS", default_value_t = 1)]
    readiness_timeout_seconds: i32,

    #[arg(long, env = "READINESS_PROBE_PERIOD_SECONDS", default_value_t = 2)]
    readiness_period_seconds: i32,

    /// Address of the health, diagnostics and metrics server
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8081")]
    metrics_addr: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            functions_namespace: self.functions_namespace.clone(),
            profiles_namespace: self.profiles_namespace.clone(),
            workers: self.workers,
            factory: FactoryConfig {
                http_probe: self.http_probe,
                set_non_root_user: self.set_non_root_user,
                image_pull_policy: self.image_pull_policy.clone(),
                liveness_probe: ProbeConfig {
                    initial_delay_seconds: self.liveness_initial_delay_seconds,
                    timeout_seconds: self.liveness_timeout_seconds,
                    period_seconds: self.liveness_period_seconds,
                },
                readiness_probe: ProbeConfig {
                    initial_delay_seconds: self.readiness_initial_delay_seconds,
                    timeout_seconds: self.readiness_timeout_seconds,
                    period_seconds: self.readiness_period_seconds,
                },
            },
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for ctrl-c: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_json)?;

    let config = cli.controller_config();
    info!(
        "starting {} with {} workers in namespace {}",
        controllers::function_controller::CONTROLLER_NAME,
        config.workers,
        config.functions_namespace
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    // Initialize Kubernetes controller state
    let state = State::default();
    let controller = controllers::run(state.clone(), config, shutdown.clone());
    let server = server::start_server(state, &cli.metrics_addr, shutdown.clone());

    // Both halves stop on the same token, so poll until both are done
    let (controller, server) = tokio::join!(
        async {
            let result = controller.await;
            shutdown.cancel();
            result
        },
        server
    );
    controller.map_err(|e| anyhow::anyhow!("controller failed: {e}"))?;
    server?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_map_onto_controller_config() {
        let cli = Cli::parse_from(["faas-operator"]);
        let config = cli.controller_config();
        assert_eq!(config.functions_namespace, "openfaas-fn");
        assert_eq!(config.profiles_namespace, "openfaas");
        assert_eq!(config.workers, 2);
        assert_eq!(config.factory, FactoryConfig::default());
    }

    #[test]
    fn http_probe_can_be_disabled() {
        let cli = Cli::parse_from(["faas-operator", "--http-probe", "false", "--set-non-root-user"]);
        let config = cli.controller_config();
        assert!(!config.factory.http_probe);
        assert!(config.factory.set_non_root_user);
    }
}
