//! Management cluster access for the reconcilers
//!
//! Every read and write the controllers make against the orchestration
//! store goes through [`KubeClient`], so reconcile logic can be exercised
//! against mocks.

use async_trait::async_trait;
use json_patch::Patch as JsonPatch;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use cape_common::crd::{Cluster, ExternalMachine, Machine};
use cape_common::kube_utils::is_already_exists;
use cape_common::{Error, CLUSTER_NAME_LABEL, EXTERNAL_NODE_LABEL};

/// Result of a create-if-absent call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The object was written
    Created,
    /// An object with that name was already there; nothing was written
    AlreadyExists,
}

/// Which endpoint of a resource a patch targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subresource {
    /// The main resource (metadata and spec)
    Main,
    /// The `/status` subresource
    Status,
}

/// A namespaced object addressed by its API resource
#[derive(Clone, Debug)]
pub struct ObjectTarget {
    /// Group, version, kind, and plural of the object
    pub resource: ApiResource,
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ObjectTarget {
    /// Address a namespaced object of a statically known kind
    pub fn of<K>(namespace: &str, name: &str) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            resource: ApiResource::erase::<K>(&()),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Kind of the addressed object
    pub fn kind(&self) -> &str {
        &self.resource.kind
    }
}

impl std::fmt::Display for ObjectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.resource.kind, self.namespace, self.name)
    }
}

/// Trait abstracting the management cluster operations the reconcilers use
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Cluster, `None` if it does not exist
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error>;

    /// Get a Machine, `None` if it does not exist
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error>;

    /// Get a Secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Set the owner references of a Secret
    async fn set_secret_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<(), Error>;

    /// Create a Machine unless one with the same name exists
    async fn create_machine(&self, machine: &Machine) -> Result<CreateOutcome, Error>;

    /// Create an ExternalMachine unless one with the same name exists
    async fn create_external_machine(
        &self,
        machine: &ExternalMachine,
    ) -> Result<CreateOutcome, Error>;

    /// List the Machines of a cluster that mirror external nodes
    async fn list_mirrored_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, Error>;

    /// Read an object as JSON, `None` if it does not exist
    async fn get_object(&self, target: &ObjectTarget) -> Result<Option<serde_json::Value>, Error>;

    /// Apply a JSON patch and return the persisted object as JSON
    async fn patch_object(
        &self,
        target: &ObjectTarget,
        subresource: Subresource,
        patch: &JsonPatch,
    ) -> Result<serde_json::Value, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic(&self, target: &ObjectTarget) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &target.namespace, &target.resource)
    }
}

async fn create_if_absent<K>(api: Api<K>, obj: &K) -> Result<CreateOutcome, Error>
where
    K: Resource + Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(CreateOutcome::Created),
        Err(e) if is_already_exists(&e) => Ok(CreateOutcome::AlreadyExists),
        Err(e) => Err(e.into()),
    }
}

fn namespace_of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<String, Error> {
    obj.meta().namespace.clone().ok_or_else(|| {
        Error::missing_field(
            K::kind(&()).to_string(),
            obj.meta().name.as_deref(),
            "metadata.namespace",
        )
    })
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn set_secret_owner(
        &self,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "metadata": {
                "ownerReferences": [owner]
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn create_machine(&self, machine: &Machine) -> Result<CreateOutcome, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), &namespace_of(machine)?);
        create_if_absent(api, machine).await
    }

    async fn create_external_machine(
        &self,
        machine: &ExternalMachine,
    ) -> Result<CreateOutcome, Error> {
        let api: Api<ExternalMachine> =
            Api::namespaced(self.client.clone(), &namespace_of(machine)?);
        create_if_absent(api, machine).await
    }

    async fn list_mirrored_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("{CLUSTER_NAME_LABEL}={cluster_name},{EXTERNAL_NODE_LABEL}");
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    async fn get_object(&self, target: &ObjectTarget) -> Result<Option<serde_json::Value>, Error> {
        match self.dynamic(target).get_opt(&target.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn patch_object(
        &self,
        target: &ObjectTarget,
        subresource: Subresource,
        patch: &JsonPatch,
    ) -> Result<serde_json::Value, Error> {
        let api = self.dynamic(target);
        let params = PatchParams::default();
        let patch: Patch<()> = Patch::Json(patch.clone());
        let persisted = match subresource {
            Subresource::Main => api.patch(&target.name, &params, &patch).await?,
            Subresource::Status => api.patch_status(&target.name, &params, &patch).await?,
        };
        Ok(serde_json::to_value(persisted)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cape_common::crd::ExternalCluster;

    #[test]
    fn target_addresses_kind_and_plural() {
        let target = ObjectTarget::of::<ExternalCluster>("default", "edge-01");
        assert_eq!(target.kind(), "ExternalCluster");
        assert_eq!(target.resource.plural, "externalclusters");
        assert_eq!(target.resource.group, "infrastructure.cluster.x-k8s.io");
        assert_eq!(target.to_string(), "ExternalCluster default/edge-01");
    }
}
