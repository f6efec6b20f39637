use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::{
    api::Api,
    client::Client,
    runtime::{watcher, WatchStreamExt},
};
use tracing::*;

/// Event reasons that point at a function workload in trouble.
pub const ABNORMAL_REASONS: [&str; 9] = [
    "BackOff",
    "Failed",
    "FailedScheduling",
    "Unhealthy",
    "FailedMount",
    "ErrImagePull",
    "ImagePullBackOff",
    "CrashLoopBackOff",
    "OOMKilled",
];

pub fn is_abnormal(event: &Event) -> bool {
    event
        .reason
        .as_deref()
        .is_some_and(|reason| ABNORMAL_REASONS.contains(&reason))
}

fn log_event(event: &Event) {
    if !is_abnormal(event) {
        return;
    }
    let involved = &event.involved_object;
    warn!(
        reason = event.reason.as_deref().unwrap_or_default(),
        kind = involved.kind.as_deref().unwrap_or_default(),
        object = involved.name.as_deref().unwrap_or_default(),
        count = event.count.unwrap_or(1),
        "{}",
        event.message.as_deref().unwrap_or_default()
    );
}

/// Logs abnormal cluster Events in the functions namespace. Never enqueues work.
pub async fn watch_abnormal_events(client: Client, namespace: &str) {
    let events: Api<Event> = Api::namespaced(client, namespace);
    watcher(events, watcher::Config::default())
        .default_backoff()
        .applied_objects()
        .for_each(|event| {
            match event {
                Ok(event) => log_event(&event),
                Err(e) => warn!("event watch error: {}", e),
            }
            futures::future::ready(())
        })
        .await;
}
