use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use kube::{
    api::{Api, PostParams},
    client::Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
    Resource, ResourceExt,
};

#[cfg(test)]
use mockall::automock;

use crate::api::v1::Function;
use crate::util::errors::{Error, Result, StdError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// A human-readable Event recorded against a Function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEvent {
    pub kind: EventKind,
    pub reason: String,
    pub note: String,
}

impl SyncEvent {
    pub fn synced(function: &Function) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: "Synced".to_string(),
            note: format!("Function {} synced successfully", function.name_any()),
        }
    }

    pub fn resource_exists(kind: &str, name: &str) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: "ErrResourceExists".to_string(),
            note: format!("Resource {kind} {name:?} already exists and is not managed by Function"),
        }
    }
}

/// Writes against the generated workload. Reads of Functions and Deployments
/// go through the informer caches instead.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    /// Whole-object replace, guarded by the carried resource version.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn create_service(&self, service: &Service) -> Result<Service>;

    async fn update_service(&self, service: &Service) -> Result<Service>;

    async fn publish_event(&self, function: &Function, event: SyncEvent) -> Result<()>;
}

pub struct KubeWorkloadClient {
    client: Client,
    recorder: Recorder,
}

impl KubeWorkloadClient {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
        }
    }

    fn api<K>(&self, namespace: Option<&str>) -> Result<Api<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        let namespace = namespace.ok_or_else(|| {
            Error::StdError(StdError::MetadataMissing(format!(
                "{} without namespace",
                K::kind(&())
            )))
        })?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }
}

fn name_of<K: Resource>(resource: &K) -> Result<String> {
    resource
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::StdError(StdError::MetadataMissing("name".to_string())))
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.api::<Deployment>(deployment.metadata.namespace.as_deref())?
            .create(&PostParams::default(), deployment)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        self.api::<Deployment>(deployment.metadata.namespace.as_deref())?
            .replace(&name_of(deployment)?, &PostParams::default(), deployment)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.api::<Service>(Some(namespace))?
            .get_opt(name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        self.api::<Service>(service.metadata.namespace.as_deref())?
            .create(&PostParams::default(), service)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        self.api::<Service>(service.metadata.namespace.as_deref())?
            .replace(&name_of(service)?, &PostParams::default(), service)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))
    }

    async fn publish_event(&self, function: &Function, event: SyncEvent) -> Result<()> {
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason,
                    note: Some(event.note),
                    action: "Sync".into(),
                    secondary: None,
                },
                &function.object_ref(&()),
            )
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))
    }
}
