//! Workload template for the echo service under test.
//!
//! A `WorkloadSpec` is an immutable value built fresh for each run and passed
//! into provisioning. The pod template labels and the deployment selector are
//! rendered from the same map, so readiness lookups always match the pods.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;

/// Name of the echo workload (deployment and overlay service).
pub const ECHO_WORKLOAD_NAME: &str = "tcp-go-echo";

/// Image that upper-cases whatever it receives.
pub const ECHO_WORKLOAD_IMAGE: &str = "quay.io/skupper/tcp-go-echo";

/// Label key used for the selector.
pub const SELECTOR_LABEL: &str = "application";

/// Declarative description of the workload to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    /// Container port, also the port exposed into the overlay.
    pub port: u16,
    pub replicas: i32,
    labels: BTreeMap<String, String>,
}

impl WorkloadSpec {
    /// The TCP echo workload exposed on `port`.
    pub fn tcp_echo(port: u16) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(SELECTOR_LABEL.to_string(), ECHO_WORKLOAD_NAME.to_string());

        Self {
            name: ECHO_WORKLOAD_NAME.to_string(),
            image: ECHO_WORKLOAD_IMAGE.to_string(),
            port,
            replicas: 1,
            labels,
        }
    }

    /// Render an `apps/v1` Deployment for `namespace`.
    pub fn to_deployment(&self, namespace: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(self.labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: self.name.clone(),
                            image: Some(self.image.clone()),
                            image_pull_policy: Some("IfNotPresent".to_string()),
                            ports: Some(vec![ContainerPort {
                                name: Some("tcp".to_string()),
                                protocol: Some("TCP".to_string()),
                                container_port: i32::from(self.port),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Runtime view of a deployment as observed in a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub name: String,
    pub replicas: i32,
    pub ready_replicas: i32,
}

impl From<Deployment> for WorkloadStatus {
    fn from(deployment: Deployment) -> Self {
        WorkloadStatus {
            name: deployment.metadata.name.unwrap_or_default(),
            // The API server defaults replicas to 1
            replicas: deployment.spec.and_then(|s| s.replicas).unwrap_or(1),
            ready_replicas: deployment
                .status
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }
    }
}
