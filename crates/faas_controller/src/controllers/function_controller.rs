use crate::api::v1::{Function, Profile};
use crate::controllers::client::{KubeWorkloadClient, SyncEvent, WorkloadClient};
use crate::controllers::events;
use crate::controllers::workqueue::{default_controller_rate_limiter, RateLimitingQueue};
use crate::util::{errors, errors::Result, metrics};
use crate::workload::deployment::function_annotations;
use crate::workload::profiles::{find_profile, find_profiles, parse_profile_names};
use crate::workload::secrets::KubeSecretsClient;
use crate::workload::{
    deployment_needs_update, is_owned, materialize_deployment, materialize_service, FactoryConfig,
    FunctionFactory, LastAppliedSpec, ProfileChanges, SecretsClient, FUNCTION_LABEL,
    PROFILE_ANNOTATION,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Secret};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        events::Reporter,
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::*;

pub const CONTROLLER_NAME: &str = "faas-controller";

/// Settings for the reconciliation loop
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace watched for Functions and their workloads
    pub functions_namespace: String,
    /// Namespace holding Profiles
    pub profiles_namespace: String,
    pub workers: usize,
    pub factory: FactoryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            functions_namespace: "openfaas-fn".to_string(),
            profiles_namespace: "openfaas".to_string(),
            workers: 2,
            factory: FactoryConfig::default(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub async fn to_context(&self, client: Client, config: &ControllerConfig) -> Result<Arc<Context>> {
        let reporter = self.diagnostics.read().await.reporter.clone();
        Ok(Arc::new(Context {
            workloads: Arc::new(KubeWorkloadClient::new(client.clone(), reporter)),
            secrets: Arc::new(KubeSecretsClient::new(client)),
            factory: FunctionFactory::new(config.factory.clone()),
            profiles_namespace: config.profiles_namespace.clone(),
            metrics: metrics::Metrics::default()
                .register(&self.registry)
                .map_err(|e| errors::Error::StdError(errors::StdError::MetricsError(e)))?,
            diagnostics: self.diagnostics.clone(),
        }))
    }
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    pub workloads: Arc<dyn WorkloadClient>,
    pub secrets: Arc<dyn SecretsClient>,
    pub factory: FunctionFactory,
    pub profiles_namespace: String,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: metrics::Metrics,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: CONTROLLER_NAME.into(),
        }
    }
}

/// `namespace/name` key of a Function.
pub fn function_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}

/// Drives Functions towards their generated Deployment and Service through a
/// rate-limited queue of `namespace/name` keys.
pub struct FunctionController {
    ctx: Arc<Context>,
    functions: Store<Function>,
    deployments: Store<Deployment>,
    profiles: Store<Profile>,
    queue: RateLimitingQueue<String>,
}

impl FunctionController {
    pub fn new(
        ctx: Arc<Context>,
        functions: Store<Function>,
        deployments: Store<Deployment>,
        profiles: Store<Profile>,
    ) -> Self {
        Self {
            ctx,
            functions,
            deployments,
            profiles,
            queue: RateLimitingQueue::new(default_controller_rate_limiter()),
        }
    }

    pub fn queue(&self) -> &RateLimitingQueue<String> {
        &self.queue
    }

    pub fn enqueue(&self, function: &Function) {
        let key = match function.namespace() {
            Some(namespace) => function_key(&namespace, &function.name_any()),
            None => function.name_any(),
        };
        self.queue.add(key);
        self.ctx.metrics.set_queue_depth(self.queue.len());
    }

    /// Enqueues the owning Function of a generated Deployment; anything else is ignored.
    pub fn handle_deployment(&self, deployment: &Deployment) {
        if !deployment.labels().contains_key(FUNCTION_LABEL) {
            return;
        }
        let Some(owner) = deployment.owner_references().iter().find(|o| o.kind == "Function") else {
            return;
        };
        let Some(namespace) = deployment.namespace() else {
            return;
        };
        self.queue.add(function_key(&namespace, &owner.name));
        self.ctx.metrics.set_queue_depth(self.queue.len());
    }

    /// Blocks until all caches are synced, then runs `workers` workers until
    /// `shutdown` fires and the queue has drained.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: CancellationToken) -> Result<()> {
        info!("waiting for informer caches to sync");
        tokio::select! {
            synced = futures::future::try_join3(
                self.functions.wait_until_ready(),
                self.deployments.wait_until_ready(),
                self.profiles.wait_until_ready(),
            ) => {
                synced.map_err(|e| errors::Error::StdError(errors::StdError::CacheSyncFailed(e.to_string())))?;
            }
            _ = shutdown.cancelled() => {
                info!("stopped before caches synced");
                self.queue.shut_down();
                return Ok(());
            }
        }

        info!("starting {} workers", workers);
        let handles: Vec<_> = (0..workers.max(1))
            .map(|_| {
                let controller = self.clone();
                tokio::spawn(async move { while controller.process_next_item().await {} })
            })
            .collect();

        shutdown.cancelled().await;
        info!("shutting down work queue");
        self.queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                error!("worker failed: {}", e);
            }
        }
        Ok(())
    }

    /// Handles one key. Returns false once the queue is shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.ctx.metrics.set_queue_depth(self.queue.len());

        let result = self
            .sync_handler(&key)
            .instrument(info_span!("sync", key = %key))
            .await;

        match result {
            Ok(()) => self.queue.forget(&key),
            Err(e) => {
                warn!("error syncing {}: {}", key, e);
                self.ctx.metrics.reconcile_failure(&key, &e);
                self.queue.add_rate_limited(key);
            }
        }
        true
    }

    /// Converges the workload of the Function named by `key`.
    pub async fn sync_handler(&self, key: &str) -> Result<()> {
        let _timer = self.ctx.metrics.count_and_measure(CONTROLLER_NAME);
        self.ctx.diagnostics.write().await.last_event = Utc::now();

        let Some((namespace, name)) = split_key(key) else {
            error!("invalid resource key: {}", key);
            return Ok(());
        };

        let Some(function) = self.functions.get(&ObjectRef::new(name).within(namespace)) else {
            debug!("function {} no longer exists", key);
            return Ok(());
        };

        let deployment_name = function.spec.name.as_str();
        if deployment_name.is_empty() {
            error!("{}: deployment name must be specified", key);
            return Ok(());
        }

        let existing = self
            .deployments
            .get(&ObjectRef::new(deployment_name).within(namespace));

        match existing {
            None => self.create_workload(&function).await,
            Some(deployment) if !is_owned(deployment.as_ref(), &function) => {
                self.ownership_conflict(&function, "Deployment", deployment_name).await
            }
            Some(deployment) if !deployment_needs_update(&function, &deployment) => {
                debug!("deployment {} is up to date", deployment_name);
                Ok(())
            }
            Some(deployment) => self.update_workload(&function, &deployment).await,
        }
    }

    async fn create_workload(&self, function: &Function) -> Result<()> {
        let secrets = self.fetch_secrets(function).await?;
        let profiles = self.profile_changes(function, None)?;
        let deployment = materialize_deployment(function, None, &secrets, &profiles, &self.ctx.factory)?;
        let service = materialize_service(function)?;

        self.ctx.workloads.create_deployment(&deployment).await?;
        info!("created deployment {}", function.spec.name);

        match self.ctx.workloads.create_service(&service).await {
            Ok(_) => info!("created service {}", function.spec.name),
            Err(e) if e.is_api_code(409) => debug!("service {} already exists", function.spec.name),
            Err(e) => return Err(e),
        }

        self.publish(function, SyncEvent::synced(function)).await;
        Ok(())
    }

    async fn update_workload(&self, function: &Function, existing: &Deployment) -> Result<()> {
        let secrets = self.fetch_secrets(function).await?;
        let profiles = self.profile_changes(function, Some(existing))?;
        let deployment =
            materialize_deployment(function, Some(existing), &secrets, &profiles, &self.ctx.factory)?;

        self.ctx.workloads.update_deployment(&deployment).await?;
        info!("updated deployment {}", function.spec.name);

        self.update_service(function).await?;

        self.publish(function, SyncEvent::synced(function)).await;
        Ok(())
    }

    async fn update_service(&self, function: &Function) -> Result<()> {
        let name = function.spec.name.as_str();
        let namespace = function.namespace().unwrap_or_default();

        match self.ctx.workloads.get_service(&namespace, name).await? {
            None => {
                self.ctx.workloads.create_service(&materialize_service(function)?).await?;
                info!("created service {}", name);
            }
            Some(service) if !is_owned(&service, function) => {
                return self.ownership_conflict(function, "Service", name).await;
            }
            Some(mut service) => {
                service.metadata.annotations = Some(function_annotations(&function.spec));
                self.ctx.workloads.update_service(&service).await?;
                info!("updated service {}", name);
            }
        }
        Ok(())
    }

    async fn ownership_conflict(&self, function: &Function, kind: &str, name: &str) -> Result<()> {
        warn!("{} {} is not owned by function {}", kind, name, function.name_any());
        self.publish(function, SyncEvent::resource_exists(kind, name)).await;
        Err(errors::Error::OwnershipConflict {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }

    async fn fetch_secrets(&self, function: &Function) -> Result<BTreeMap<String, Secret>> {
        if function.spec.secrets.is_empty() {
            return Ok(BTreeMap::new());
        }
        let namespace = function.namespace().unwrap_or_default();
        self.ctx.secrets.get_secrets(&namespace, &function.spec.secrets).await
    }

    /// Strips every previously applied profile, then applies the requested set.
    fn profile_changes(&self, function: &Function, existing: Option<&Deployment>) -> Result<ProfileChanges> {
        let requested = parse_profile_names(function.spec.annotation(PROFILE_ANNOTATION));
        let previous = existing.map(previous_profiles).unwrap_or_default();
        let namespace = self.ctx.profiles_namespace.as_str();

        let mut changes = ProfileChanges::default();
        for name in previous {
            match find_profile(&self.profiles, namespace, &name) {
                Ok(profile) => changes.remove.push(profile),
                Err(errors::Error::StdError(errors::StdError::ProfileNotFound { .. })) => {
                    warn!("profile {} was removed from the cluster; skipping its removal", name);
                }
                Err(e) => return Err(e),
            }
        }
        changes.apply = find_profiles(&self.profiles, namespace, &requested)?;
        Ok(changes)
    }

    async fn publish(&self, function: &Function, event: SyncEvent) {
        if let Err(e) = self.ctx.workloads.publish_event(function, event).await {
            warn!("failed to record event for {}: {}", function.name_any(), e);
        }
    }
}

/// Profile names the Deployment was last materialized with.
fn previous_profiles(deployment: &Deployment) -> Vec<String> {
    match LastAppliedSpec::from_deployment(deployment) {
        Some(previous) => parse_profile_names(previous.spec().annotation(PROFILE_ANNOTATION)),
        None => parse_profile_names(
            deployment
                .annotations()
                .get(PROFILE_ANNOTATION)
                .map(String::as_str),
        ),
    }
}

/// Initialize the informers and run the controller until `shutdown` fires
/// (given the crd is installed)
pub async fn run(state: State, config: ControllerConfig, shutdown: CancellationToken) -> Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| errors::Error::StdError(errors::StdError::KubeError(e)))?;
    let namespace = config.functions_namespace.as_str();

    let functions_api = Api::<Function>::namespaced(client.clone(), namespace);
    if let Err(e) = functions_api.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(errors::Error::StdError(errors::StdError::KubeError(e)));
    }
    let deployments_api = Api::<Deployment>::namespaced(client.clone(), namespace);
    let profiles_api = Api::<Profile>::namespaced(client.clone(), &config.profiles_namespace);

    let (functions, functions_writer) = reflector::store();
    let (deployments, deployments_writer) = reflector::store();
    let (profiles, profiles_writer) = reflector::store();
    let ctx = state.to_context(client.clone(), &config).await?;
    let controller = Arc::new(FunctionController::new(ctx, functions, deployments, profiles));

    let function_informer = watcher(functions_api, watcher::Config::default())
        .default_backoff()
        .reflect(functions_writer)
        .applied_objects()
        .for_each(|function| {
            match function {
                Ok(function) => controller.enqueue(&function),
                Err(e) => warn!("function watch error: {}", e),
            }
            futures::future::ready(())
        });

    let deployment_informer = watcher(deployments_api, watcher::Config::default().labels(FUNCTION_LABEL))
        .default_backoff()
        .reflect(deployments_writer)
        .applied_objects()
        .for_each(|deployment| {
            match deployment {
                Ok(deployment) => controller.handle_deployment(&deployment),
                Err(e) => warn!("deployment watch error: {}", e),
            }
            futures::future::ready(())
        });

    // Profiles are only read during a sync; changes do not enqueue Functions.
    let profile_informer = watcher(profiles_api, watcher::Config::default())
        .default_backoff()
        .reflect(profiles_writer)
        .applied_objects()
        .for_each(|profile| {
            if let Err(e) = profile {
                warn!("profile watch error: {}", e);
            }
            futures::future::ready(())
        });

    let informers = async {
        tokio::join!(
            function_informer,
            deployment_informer,
            profile_informer,
            events::watch_abnormal_events(client.clone(), namespace),
        )
    };

    info!("watching functions in namespace {}", namespace);
    tokio::select! {
        _ = informers => {
            warn!("informers stopped");
            controller.queue().shut_down();
            Ok(())
        }
        result = controller.clone().run(config.workers, shutdown) => result,
    }
}
