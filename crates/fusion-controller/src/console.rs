//! OpenShift console plugin
//!
//! The storage UI ships as a dynamic console plugin: an nginx Deployment
//! serving the bundle over TLS, its Service and config, and a ConsolePlugin
//! registration. The plugin then has to be listed in the cluster console
//! operator config before the console loads it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::discovery::ApiResource;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use fusion_common::crd::{ConsoleOperatorConfig, ConsolePlugin};
use fusion_common::kube_utils::HasApiResource;
use fusion_common::Error;

use crate::client::{ClusterResources, ObjectKey};

/// Plugin name, shared by every plugin resource
pub const PLUGIN_NAME: &str = "fusion-access-console";

/// Default plugin image
pub const DEFAULT_PLUGIN_IMAGE: &str =
    "quay.io/openshift-storage-scale/openshift-fusion-access-console:latest";

/// Name of the cluster console operator config
pub const CONSOLE_CONFIG_NAME: &str = "cluster";

const SERVING_CERT_SECRET: &str = "plugin-serving-cert";
const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";
const PLUGIN_PORT: i32 = 9443;

const NGINX_CONF: &str = r#"error_log /dev/stdout info;
events {}
http {
  access_log         /dev/stdout;
  include            /etc/nginx/mime.types;
  default_type       application/octet-stream;
  keepalive_timeout  65;
  server {
    listen              9443 ssl;
    listen              [::]:9443 ssl;
    ssl_certificate     /var/cert/tls.crt;
    ssl_certificate_key /var/cert/tls.key;
    root                /usr/share/nginx/html;
  }
}
"#;

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), PLUGIN_NAME.to_string()),
        (
            "app.kubernetes.io/part-of".to_string(),
            PLUGIN_NAME.to_string(),
        ),
    ])
}

fn metadata(namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(PLUGIN_NAME.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels()),
        ..Default::default()
    }
}

/// nginx configuration for the plugin server
pub fn plugin_config_map(namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: metadata(namespace),
        data: Some(BTreeMap::from([(
            "nginx.conf".to_string(),
            NGINX_CONF.to_string(),
        )])),
        ..Default::default()
    }
}

/// Service fronting the plugin; OpenShift mints its serving certificate
pub fn plugin_service(namespace: &str) -> Service {
    let mut meta = metadata(namespace);
    meta.annotations = Some(BTreeMap::from([(
        SERVING_CERT_ANNOTATION.to_string(),
        SERVING_CERT_SECRET.to_string(),
    )]));
    Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                PLUGIN_NAME.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some(format!("{PLUGIN_PORT}-tcp")),
                port: PLUGIN_PORT,
                target_port: Some(IntOrString::Int(PLUGIN_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deployment serving the plugin bundle
pub fn plugin_deployment(namespace: &str, image: &str) -> Deployment {
    Deployment {
        metadata: metadata(namespace),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    PLUGIN_NAME.to_string(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: PLUGIN_NAME.to_string(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            container_port: PLUGIN_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: SERVING_CERT_SECRET.to_string(),
                                mount_path: "/var/cert".to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "nginx-conf".to_string(),
                                mount_path: "/etc/nginx/nginx.conf".to_string(),
                                sub_path: Some("nginx.conf".to_string()),
                                read_only: Some(true),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: SERVING_CERT_SECRET.to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(SERVING_CERT_SECRET.to_string()),
                                default_mode: Some(0o420),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "nginx-conf".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: PLUGIN_NAME.to_string(),
                                default_mode: Some(0o420),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ConsolePlugin registration pointing the console at the Service
pub fn console_plugin(namespace: &str) -> Value {
    json!({
        "apiVersion": ConsolePlugin::API_VERSION,
        "kind": ConsolePlugin::KIND,
        "metadata": { "name": PLUGIN_NAME },
        "spec": {
            "displayName": "Fusion Access for SAN",
            "i18n": { "loadType": "Preload" },
            "backend": {
                "type": "Service",
                "service": {
                    "name": PLUGIN_NAME,
                    "namespace": namespace,
                    "port": PLUGIN_PORT,
                    "basePath": "/",
                }
            }
        }
    })
}

fn to_value<T: Serialize>(kind: &str, object: &T) -> Result<Value, Error> {
    serde_json::to_value(object).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// Apply every plugin resource in `namespace`
pub async fn apply_plugin_resources(
    resources: &dyn ClusterResources,
    namespace: &str,
    image: &str,
) -> Result<(), Error> {
    let objects = [
        (
            ObjectKey::namespaced(ApiResource::erase::<ConfigMap>(&()), namespace, PLUGIN_NAME),
            to_value("ConfigMap", &plugin_config_map(namespace))?,
        ),
        (
            ObjectKey::namespaced(ApiResource::erase::<Service>(&()), namespace, PLUGIN_NAME),
            to_value("Service", &plugin_service(namespace))?,
        ),
        (
            ObjectKey::namespaced(ApiResource::erase::<Deployment>(&()), namespace, PLUGIN_NAME),
            to_value("Deployment", &plugin_deployment(namespace, image))?,
        ),
        (
            ObjectKey::cluster(ConsolePlugin::api_resource(), PLUGIN_NAME),
            console_plugin(namespace),
        ),
    ];

    for (key, object) in &objects {
        resources.apply(key, object).await?;
        debug!(object = %key, "applied console plugin resource");
    }
    Ok(())
}

/// Plugin list with `plugin` appended, `None` if it is already enabled
pub fn plugins_with(console: &Value, plugin: &str) -> Option<Vec<String>> {
    let mut plugins: Vec<String> = console
        .pointer("/spec/plugins")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if plugins.iter().any(|p| p == plugin) {
        return None;
    }
    plugins.push(plugin.to_string());
    Some(plugins)
}

/// Add the plugin to the cluster console config if it is not listed yet
pub async fn enable_plugin(resources: &dyn ClusterResources) -> Result<(), Error> {
    let key = ObjectKey::cluster(ConsoleOperatorConfig::api_resource(), CONSOLE_CONFIG_NAME);
    let console = resources.get(&key).await?.ok_or_else(|| {
        Error::internal_with_context("enable_plugin", format!("{key} not found"))
    })?;
    let console = to_value(ConsoleOperatorConfig::KIND, &console)?;

    match plugins_with(&console, PLUGIN_NAME) {
        None => {
            debug!(plugin = PLUGIN_NAME, "console plugin already enabled");
            Ok(())
        }
        Some(plugins) => {
            resources
                .merge_patch(&key, &json!({ "spec": { "plugins": plugins } }))
                .await?;
            info!(plugin = PLUGIN_NAME, "enabled console plugin");
            Ok(())
        }
    }
}

/// Apply the plugin resources, then enable the plugin
pub async fn ensure_console_plugin(
    resources: &dyn ClusterResources,
    namespace: &str,
    image: &str,
) -> Result<(), Error> {
    apply_plugin_resources(resources, namespace, image).await?;
    enable_plugin(resources).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterResources;
    use kube::api::DynamicObject;
    use std::sync::{Arc, Mutex};

    const NS: &str = "ibm-fusion-access";

    fn console_config(plugins: &[&str]) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "operator.openshift.io/v1",
            "kind": "Console",
            "metadata": { "name": "cluster" },
            "spec": { "plugins": plugins, "managementState": "Managed" }
        }))
        .unwrap()
    }

    #[test]
    fn service_requests_a_serving_certificate() {
        let svc = plugin_service(NS);
        let annotations = svc.metadata.annotations.unwrap();
        assert_eq!(annotations[SERVING_CERT_ANNOTATION], SERVING_CERT_SECRET);
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, PLUGIN_PORT);
    }

    #[test]
    fn deployment_mounts_cert_and_config() {
        let deployment = plugin_deployment(NS, DEFAULT_PLUGIN_IMAGE);
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/var/cert"));
        assert_eq!(pod.volumes.unwrap().len(), 2);
    }

    #[test]
    fn typed_resources_serialize_with_type_meta() {
        let value = to_value("Deployment", &plugin_deployment(NS, "img")).unwrap();
        assert_eq!(value["apiVersion"], "apps/v1");
        assert_eq!(value["kind"], "Deployment");
    }

    #[test]
    fn plugin_list_is_appended_only_when_missing() {
        let console = json!({ "spec": { "plugins": ["odf-console"] } });
        assert_eq!(
            plugins_with(&console, PLUGIN_NAME),
            Some(vec!["odf-console".to_string(), PLUGIN_NAME.to_string()])
        );

        let enabled = json!({ "spec": { "plugins": [PLUGIN_NAME] } });
        assert_eq!(plugins_with(&enabled, PLUGIN_NAME), None);

        assert_eq!(
            plugins_with(&json!({ "spec": {} }), PLUGIN_NAME),
            Some(vec![PLUGIN_NAME.to_string()])
        );
    }

    #[tokio::test]
    async fn plugin_is_applied_then_enabled() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let recorder = applied.clone();

        let mut resources = MockClusterResources::new();
        resources.expect_apply().times(4).returning(move |key, _| {
            recorder.lock().unwrap().push(key.api_resource.kind.clone());
            Ok(())
        });
        resources
            .expect_get()
            .returning(|_| Ok(Some(console_config(&["odf-console"]))));
        resources
            .expect_merge_patch()
            .withf(|key, patch| {
                key.name == CONSOLE_CONFIG_NAME
                    && patch["spec"]["plugins"] == json!(["odf-console", PLUGIN_NAME])
            })
            .times(1)
            .returning(|_, _| Ok(()));

        ensure_console_plugin(&resources, NS, DEFAULT_PLUGIN_IMAGE)
            .await
            .unwrap();

        assert_eq!(
            *applied.lock().unwrap(),
            vec!["ConfigMap", "Service", "Deployment", "ConsolePlugin"]
        );
    }

    #[tokio::test]
    async fn already_enabled_plugin_is_not_patched() {
        let mut resources = MockClusterResources::new();
        resources
            .expect_get()
            .returning(|_| Ok(Some(console_config(&[PLUGIN_NAME]))));
        resources.expect_merge_patch().never();

        enable_plugin(&resources).await.unwrap();
    }

    #[tokio::test]
    async fn missing_console_config_is_an_error() {
        let mut resources = MockClusterResources::new();
        resources.expect_get().returning(|_| Ok(None));
        assert!(enable_plugin(&resources).await.is_err());
    }
}
