//! `cape import`: adopt a running cluster
//!
//! Writes the Cluster, ExternalCluster, and ExternalControlPlane for the
//! cluster and stores its kubeconfig as the credential secret. Objects that
//! already exist are left as they are, so the command can be re-run.

use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::{anyhow, Context as _};
use http::Uri;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource};
use tracing::{debug, info, warn};

use cape_common::crd::{
    ApiEndpoint, Cluster, ClusterSpec, ExternalCluster, ExternalClusterSpec, ExternalControlPlane,
    ExternalControlPlaneSpec, ObjectReference,
};
use cape_common::kube_utils::{create_client, current_server, is_already_exists, parse_kubeconfig};
use cape_common::{
    kubeconfig_secret_name, CLUSTER_SECRET_TYPE, CONTROL_PLANE_API_VERSION,
    INFRASTRUCTURE_API_VERSION, KUBECONFIG_SECRET_KEY,
};

use crate::config::ImportArgs;

const DEFAULT_API_PORT: u16 = 443;

/// The objects written for one imported cluster
#[derive(Debug)]
pub struct ImportPlan {
    /// The generic Cluster, referencing the two provider resources
    pub cluster: Cluster,
    /// Infrastructure side, carrying the API endpoint
    pub external_cluster: ExternalCluster,
    /// Control-plane side
    pub control_plane: ExternalControlPlane,
    /// Immutable credential secret
    pub secret: Secret,
}

/// Host and port of a kubeconfig server URL
pub fn endpoint_from_server(server: &str) -> anyhow::Result<ApiEndpoint> {
    let uri: Uri = server
        .parse()
        .with_context(|| format!("invalid server URL {server}"))?;
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow!("server URL {server} has no host"))?;
    Ok(ApiEndpoint {
        host: host.to_string(),
        port: i32::from(uri.port_u16().unwrap_or(DEFAULT_API_PORT)),
    })
}

/// Build the objects for a cluster reachable at `endpoint`
pub fn plan_import(
    cluster_name: &str,
    namespace: &str,
    endpoint: ApiEndpoint,
    kubeconfig: String,
) -> ImportPlan {
    let meta = |name: String| ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    };

    let mut cluster = Cluster::new(
        cluster_name,
        ClusterSpec {
            control_plane_ref: Some(ObjectReference::new(
                CONTROL_PLANE_API_VERSION,
                "ExternalControlPlane",
                cluster_name,
            )),
            infrastructure_ref: Some(ObjectReference::new(
                INFRASTRUCTURE_API_VERSION,
                "ExternalCluster",
                cluster_name,
            )),
            ..Default::default()
        },
    );
    cluster.metadata = meta(cluster_name.to_string());

    let mut external_cluster = ExternalCluster::new(
        cluster_name,
        ExternalClusterSpec {
            control_plane_endpoint: endpoint,
            ca_bundle: None,
        },
    );
    external_cluster.metadata = meta(cluster_name.to_string());

    let mut control_plane = ExternalControlPlane::new(cluster_name, ExternalControlPlaneSpec {});
    control_plane.metadata = meta(cluster_name.to_string());

    let secret = Secret {
        metadata: meta(kubeconfig_secret_name(cluster_name)),
        immutable: Some(true),
        string_data: Some(BTreeMap::from([(
            KUBECONFIG_SECRET_KEY.to_string(),
            kubeconfig,
        )])),
        type_: Some(CLUSTER_SECRET_TYPE.to_string()),
        ..Default::default()
    };

    ImportPlan {
        cluster,
        external_cluster,
        control_plane,
        secret,
    }
}

/// Create `obj`, treating "already exists" as success
async fn create_or_keep<K>(client: &Client, obj: &K) -> anyhow::Result<()>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
        + Clone
        + Debug
        + serde::Serialize
        + serde::de::DeserializeOwned,
{
    let namespace = obj.meta().namespace.as_deref().unwrap_or("default");
    let name = obj.meta().name.clone().unwrap_or_default();
    let kind = K::kind(&());
    let api: Api<K> = Api::namespaced(client.clone(), namespace);

    debug!(%kind, %namespace, %name, "Creating resource");
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            warn!(%kind, %namespace, %name, "Resource already exists");
            Ok(())
        }
        Err(e) => Err(anyhow!("failed to create {kind} {namespace}/{name}: {e}")),
    }
}

/// Run `cape import`
pub async fn run_import(args: &ImportArgs) -> anyhow::Result<()> {
    let raw = tokio::fs::read(&args.target_kubeconfig)
        .await
        .with_context(|| format!("reading {}", args.target_kubeconfig.display()))?;
    let kubeconfig = parse_kubeconfig(&raw)?;
    let server = current_server(&kubeconfig)
        .ok_or_else(|| anyhow!("target kubeconfig has no server for its current context"))?;
    let endpoint = endpoint_from_server(server)?;
    let text = String::from_utf8(raw).context("target kubeconfig is not UTF-8")?;

    let plan = plan_import(&args.cluster_name, &args.namespace, endpoint, text);
    let client = create_client(args.kubeconfig.as_deref()).await?;

    create_or_keep(&client, &plan.cluster).await?;
    create_or_keep(&client, &plan.external_cluster).await?;
    create_or_keep(&client, &plan.control_plane).await?;
    create_or_keep(&client, &plan.secret).await?;

    info!(cluster = %args.cluster_name, namespace = %args.namespace, "Cluster imported");
    println!(
        "cluster.cluster.x-k8s.io/{} imported into namespace {}",
        args.cluster_name, args.namespace
    );
    Ok(())
}
