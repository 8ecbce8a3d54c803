//! Cluster API capability.
//!
//! `ClusterApi` covers the handful of cluster operations the smoke run
//! needs: namespace and deployment lifecycle, plus looking up the service
//! the overlay creates. `KubeClusterApi` implements it over a `kube::Client`
//! for one kube context.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::EnvironmentConfig;
use crate::errors::ClusterApiError;
use crate::workload::{WorkloadSpec, WorkloadStatus};

/// Pause between checks while waiting for a deleted object to disappear.
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A network-exposing resource found in a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub name: String,
    /// Cluster-internal address; `None` for headless services.
    pub cluster_ip: Option<String>,
    pub ports: Vec<u16>,
}

impl ServiceHandle {
    /// `ip:port` inside the cluster, for diagnostics.
    pub fn internal_address(&self, port: u16) -> Option<String> {
        self.cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .map(|ip| format!("{ip}:{port}"))
    }
}

impl From<Service> for ServiceHandle {
    fn from(service: Service) -> Self {
        let spec = service.spec.unwrap_or_default();
        ServiceHandle {
            name: service.metadata.name.unwrap_or_default(),
            cluster_ip: spec.cluster_ip,
            ports: spec
                .ports
                .unwrap_or_default()
                .into_iter()
                .filter_map(|p| u16::try_from(p.port).ok())
                .collect(),
        }
    }
}

/// Cluster operations used by the smoke run.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_namespace(&self, namespace: &str) -> Result<(), ClusterApiError>;

    /// Idempotent: a missing namespace is not an error. Returns once the
    /// namespace is gone.
    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterApiError>;

    async fn create_deployment(
        &self,
        namespace: &str,
        spec: &WorkloadSpec,
    ) -> Result<WorkloadStatus, ClusterApiError>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<WorkloadStatus>, ClusterApiError>;

    /// Foreground cascading delete. Returns once the deployment and its pods
    /// are gone; a missing deployment is `NotFound`.
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterApiError>;

    /// Look up a service by name. `Ok(None)` means it does not exist (yet).
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceHandle>, ClusterApiError>;
}

/// `ClusterApi` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    deletion_timeout: Duration,
}

impl KubeClusterApi {
    pub fn new(client: Client, deletion_timeout: Duration) -> Self {
        Self {
            client,
            deletion_timeout,
        }
    }

    /// Client for the environment's kubeconfig and context. Without either,
    /// the configuration is inferred (`KUBECONFIG`, `~/.kube/config`, or
    /// in-cluster).
    pub async fn connect(
        env: &EnvironmentConfig,
        deletion_timeout: Duration,
    ) -> Result<Self, ClusterApiError> {
        let config = match (&env.kubeconfig, &env.context) {
            (None, None) => Config::infer()
                .await
                .map_err(|e| ClusterApiError::Config(format!("failed to infer config: {e}")))?,
            (kubeconfig, context) => {
                let options = KubeConfigOptions {
                    context: context.clone(),
                    ..Default::default()
                };
                let kubeconfig = match kubeconfig {
                    Some(path) => Kubeconfig::read_from(path).map_err(|e| {
                        ClusterApiError::Config(format!("failed to read kubeconfig {path}: {e}"))
                    })?,
                    None => Kubeconfig::read().map_err(|e| {
                        ClusterApiError::Config(format!("failed to read kubeconfig: {e}"))
                    })?,
                };
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ClusterApiError::Config(format!("failed to load kubeconfig: {e}")))?
            }
        };

        let client = Client::try_from(config)
            .map_err(|e| ClusterApiError::Config(format!("failed to create client: {e}")))?;
        Ok(Self::new(client, deletion_timeout))
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    /// Poll until `name` no longer exists, bounded by the deletion timeout.
    async fn await_deleted<K>(&self, api: &Api<K>, kind: &'static str, name: &str) -> Result<(), ClusterApiError>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        let start = Instant::now();
        loop {
            match api.get_opt(name).await {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => {
                    debug!(target: "smoke.cluster", kind, name = %name, "Waiting for deletion");
                }
                Err(e) => return Err(ClusterApiError::from_kube(e, kind, name)),
            }

            let elapsed = start.elapsed();
            if elapsed >= self.deletion_timeout {
                return Err(ClusterApiError::DeletionTimeout {
                    kind,
                    name: name.to_string(),
                    waited: elapsed,
                });
            }
            sleep(DELETION_POLL_INTERVAL.min(self.deletion_timeout - elapsed)).await;
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create_namespace(&self, namespace: &str) -> Result<(), ClusterApiError> {
        let object = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.namespaces()
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| ClusterApiError::from_kube(e, "namespace", namespace))?;
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterApiError> {
        let api = self.namespaces();
        match api.delete(namespace, &DeleteParams::foreground()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(target: "smoke.cluster", namespace = %namespace, "Namespace already absent");
                return Ok(());
            }
            Err(e) => return Err(ClusterApiError::from_kube(e, "namespace", namespace)),
        }
        self.await_deleted(&api, "namespace", namespace).await
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        spec: &WorkloadSpec,
    ) -> Result<WorkloadStatus, ClusterApiError> {
        let created = self
            .deployments(namespace)
            .create(&PostParams::default(), &spec.to_deployment(namespace))
            .await
            .map_err(|e| ClusterApiError::from_kube(e, "deployment", &spec.name))?;
        Ok(created.into())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<WorkloadStatus>, ClusterApiError> {
        let list = self.deployments(namespace).list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(Into::into).collect())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterApiError> {
        let api = self.deployments(namespace);
        api.delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| ClusterApiError::from_kube(e, "deployment", name))?;
        self.await_deleted(&api, "deployment", name).await
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceHandle>, ClusterApiError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = api
            .get_opt(name)
            .await
            .map_err(|e| ClusterApiError::from_kube(e, "service", name))?;

        if service.is_none() {
            debug!(target: "smoke.cluster", namespace = %namespace, service = %name, "Service not found yet");
        }
        Ok(service.map(Into::into))
    }
}

/// In-memory cluster for tests.
pub mod mock {
    use super::*;
    use crate::process::mock::CallJournal;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Mutex, PoisonError};

    /// Operations that can be made to fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MockOp {
        CreateNamespace,
        DeleteNamespace,
        CreateDeployment,
        ListDeployments,
        DeleteDeployment,
        GetService,
    }

    #[derive(Debug)]
    struct MockService {
        handle: ServiceHandle,
        /// Lookups that still report "not found" before the service appears.
        misses_remaining: u32,
    }

    #[derive(Debug, Default)]
    struct MockState {
        namespaces: BTreeSet<String>,
        deployments: BTreeMap<(String, String), WorkloadStatus>,
        services: BTreeMap<String, MockService>,
        failures: Vec<(MockOp, String)>,
        service_lookups: usize,
    }

    /// In-memory `ClusterApi` with failure injection and a shared journal.
    pub struct MockClusterApi {
        label: String,
        journal: CallJournal,
        state: Mutex<MockState>,
    }

    impl MockClusterApi {
        pub fn new(label: impl Into<String>, journal: CallJournal) -> Self {
            Self {
                label: label.into(),
                journal,
                state: Mutex::new(MockState::default()),
            }
        }

        /// Make `name` resolvable from the first lookup.
        pub fn with_service(self, name: &str, cluster_ip: &str) -> Self {
            self.with_service_after(name, cluster_ip, 0)
        }

        /// Make `name` resolvable after `misses` lookups have returned nothing.
        pub fn with_service_after(self, name: &str, cluster_ip: &str, misses: u32) -> Self {
            self.lock().services.insert(
                name.to_string(),
                MockService {
                    handle: ServiceHandle {
                        name: name.to_string(),
                        cluster_ip: Some(cluster_ip.to_string()),
                        ports: vec![9090],
                    },
                    misses_remaining: misses,
                },
            );
            self
        }

        /// Fail every call of `op` with `message`.
        pub fn fail(&self, op: MockOp, message: impl Into<String>) {
            self.lock().failures.push((op, message.into()));
        }

        pub fn namespaces(&self) -> Vec<String> {
            self.lock().namespaces.iter().cloned().collect()
        }

        pub fn deployments(&self) -> Vec<WorkloadStatus> {
            self.lock().deployments.values().cloned().collect()
        }

        pub fn service_lookups(&self) -> usize {
            self.lock().service_lookups
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn enter(&self, op: MockOp, entry: String) -> Result<(), ClusterApiError> {
            self.journal.record(format!("{}: {entry}", self.label));
            match self.lock().failures.iter().find(|(o, _)| *o == op) {
                Some((_, message)) => Err(ClusterApiError::Api(message.clone())),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ClusterApi for MockClusterApi {
        async fn create_namespace(&self, namespace: &str) -> Result<(), ClusterApiError> {
            self.enter(MockOp::CreateNamespace, format!("create namespace {namespace}"))?;
            if !self.lock().namespaces.insert(namespace.to_string()) {
                return Err(ClusterApiError::AlreadyExists {
                    kind: "namespace",
                    name: namespace.to_string(),
                });
            }
            Ok(())
        }

        async fn delete_namespace(&self, namespace: &str) -> Result<(), ClusterApiError> {
            self.enter(MockOp::DeleteNamespace, format!("delete namespace {namespace}"))?;
            let mut state = self.lock();
            state.namespaces.remove(namespace);
            state.deployments.retain(|(ns, _), _| ns != namespace);
            Ok(())
        }

        async fn create_deployment(
            &self,
            namespace: &str,
            spec: &WorkloadSpec,
        ) -> Result<WorkloadStatus, ClusterApiError> {
            self.enter(
                MockOp::CreateDeployment,
                format!("create deployment {} in {namespace}", spec.name),
            )?;
            let mut state = self.lock();
            if !state.namespaces.contains(namespace) {
                return Err(ClusterApiError::NotFound {
                    kind: "namespace",
                    name: namespace.to_string(),
                });
            }
            let key = (namespace.to_string(), spec.name.clone());
            if state.deployments.contains_key(&key) {
                return Err(ClusterApiError::AlreadyExists {
                    kind: "deployment",
                    name: spec.name.clone(),
                });
            }
            let status = WorkloadStatus {
                name: spec.name.clone(),
                replicas: spec.replicas,
                ready_replicas: 0,
            };
            state.deployments.insert(key, status.clone());
            Ok(status)
        }

        async fn list_deployments(
            &self,
            namespace: &str,
        ) -> Result<Vec<WorkloadStatus>, ClusterApiError> {
            self.enter(MockOp::ListDeployments, format!("list deployments in {namespace}"))?;
            Ok(self
                .lock()
                .deployments
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .map(|(_, status)| status.clone())
                .collect())
        }

        async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterApiError> {
            self.enter(
                MockOp::DeleteDeployment,
                format!("delete deployment {name} in {namespace}"),
            )?;
            match self
                .lock()
                .deployments
                .remove(&(namespace.to_string(), name.to_string()))
            {
                Some(_) => Ok(()),
                None => Err(ClusterApiError::NotFound {
                    kind: "deployment",
                    name: name.to_string(),
                }),
            }
        }

        async fn get_service(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<ServiceHandle>, ClusterApiError> {
            self.enter(MockOp::GetService, format!("get service {name} in {namespace}"))?;
            let mut state = self.lock();
            state.service_lookups += 1;
            match state.services.get_mut(name) {
                Some(service) if service.misses_remaining == 0 => Ok(Some(service.handle.clone())),
                Some(service) => {
                    service.misses_remaining -= 1;
                    Ok(None)
                }
                None => Ok(None),
            }
        }
    }
}
