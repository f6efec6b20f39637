#[cfg(test)]
mod tests {
    use crate::api::v1::{Function, FunctionSpec, Profile};
    use crate::controllers::{ControllerConfig, FunctionController, State};
    use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
    use kube::api::{Api, ObjectMeta, Patch, PatchParams};
    use kube::runtime::{reflector, watcher};
    use kube::Client;

    #[tokio::test]
    #[ignore = "uses k8s current-context"]
    async fn integration_sync_should_create_workload() {
        let client = Client::try_default().await.unwrap();
        let config = ControllerConfig {
            functions_namespace: "default".to_string(),
            ..Default::default()
        };
        let ctx = State::default().to_context(client.clone(), &config).await.unwrap();

        let function = Function {
            metadata: ObjectMeta {
                name: Some("itest-echo".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: FunctionSpec {
                name: "itest-echo".to_string(),
                image: "ghcr.io/openfaas/alpine:latest".to_string(),
                handler: Some("cat".to_string()),
                ..Default::default()
            },
        };

        let functions: Api<Function> = Api::namespaced(client.clone(), "default");
        let ssapply = PatchParams::apply("ctrltest").force();
        let applied = functions
            .patch("itest-echo", &ssapply, &Patch::Apply(&function))
            .await
            .unwrap();

        let (function_store, mut function_writer) = reflector::store();
        function_writer.apply_watcher_event(&watcher::Event::Apply(applied));
        let (deployment_store, _deployment_writer) = reflector::store::<Deployment>();
        let (profile_store, _profile_writer) = reflector::store::<Profile>();

        let controller = FunctionController::new(ctx, function_store, deployment_store, profile_store);
        controller.sync_handler("default/itest-echo").await.unwrap();

        let deployments: Api<Deployment> = Api::namespaced(client.clone(), "default");
        let deployment = deployments.get("itest-echo").await.unwrap();
        assert!(deployment
            .metadata
            .annotations
            .unwrap()
            .contains_key("com.openfaas.function.spec"));

        let services: Api<Service> = Api::namespaced(client.clone(), "default");
        assert!(services.get("itest-echo").await.is_ok());

        functions.delete("itest-echo", &Default::default()).await.unwrap();
    }
}
