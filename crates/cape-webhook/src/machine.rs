//! Machine deletion guard
//!
//! Handles validating AdmissionReview requests for cluster-api Machines.
//! Deletes of Machines backed by an ExternalMachine are denied unless their
//! Cluster is being deleted; every other request is allowed.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::State, Json};
use kube::api::{Api, DynamicObject};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info};

use cape_common::crd::{Cluster, Machine};
use cape_common::kube_utils::label;
use cape_common::CLUSTER_NAME_LABEL;

use crate::error::WebhookError;

/// Path the validating webhook configuration points at
pub const MACHINE_VALIDATE_PATH: &str = "/validate-cluster-x-k8s-io-v1beta1-machine";

/// Denial message for deletes outside cluster teardown
pub const READ_ONLY_MESSAGE: &str =
    "externally-sourced machines are read-only outside of full cluster teardown";

const RESOLUTION_FAILED_MESSAGE: &str = "unable to resolve the cluster of this machine";

const INFRASTRUCTURE_KIND: &str = "ExternalMachine";

/// Looks up the Cluster a Machine belongs to
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterLookup: Send + Sync {
    /// Get a Cluster, `None` if it does not exist
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<Cluster>, WebhookError>;
}

/// [`ClusterLookup`] against the management cluster
pub struct KubeClusterLookup {
    client: Client,
}

impl KubeClusterLookup {
    /// Create a lookup using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterLookup for KubeClusterLookup {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Cluster>, WebhookError> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Shared state for the webhook handlers
pub struct WebhookState {
    /// Cluster resolution
    pub clusters: Arc<dyn ClusterLookup>,
}

/// Handle a validating admission review for a Machine
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = validate_machine(state.clusters.as_ref(), &req).await;
    Json(response.into_review())
}

/// Decide a single Machine admission request
async fn validate_machine(
    clusters: &dyn ClusterLookup,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let uid = request.uid.clone();

    // deletes only carry the old object
    let Some(obj) = request.old_object.as_ref().or(request.object.as_ref()) else {
        debug!(uid = %uid, "No machine object in request, allowing");
        return AdmissionResponse::from(request);
    };
    let machine: Machine = match obj.clone().try_parse() {
        Ok(machine) => machine,
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to decode Machine");
            return errored(request, 400, format!("failed to decode Machine: {e}"));
        }
    };

    if !machine.spec.infrastructure_ref.is_kind(INFRASTRUCTURE_KIND) {
        return AdmissionResponse::from(request);
    }
    if request.operation != Operation::Delete {
        return AdmissionResponse::from(request);
    }

    let machine_name = machine.metadata.name.clone().unwrap_or_default();
    let cluster = match resolve_cluster(clusters, &machine, request).await {
        Ok(cluster) => cluster,
        Err(e) => {
            error!(uid = %uid, machine = %machine_name, error = %e, "Failed to resolve Machine's cluster");
            return errored(request, 500, RESOLUTION_FAILED_MESSAGE);
        }
    };

    if !cluster.is_deleting() {
        info!(
            uid = %uid,
            machine = %machine_name,
            "Denying delete of external machine outside cluster teardown"
        );
        return errored(request, 400, READ_ONLY_MESSAGE);
    }

    AdmissionResponse::from(request)
}

/// The Cluster named by the Machine's cluster-name label, falling back to
/// `spec.clusterName`
async fn resolve_cluster(
    clusters: &dyn ClusterLookup,
    machine: &Machine,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<Cluster, WebhookError> {
    let name = label(&machine.metadata, CLUSTER_NAME_LABEL)
        .filter(|name| !name.is_empty())
        .or(Some(machine.spec.cluster_name.as_str()).filter(|name| !name.is_empty()))
        .ok_or_else(|| WebhookError::InvalidReview("machine names no cluster".to_string()))?;
    let namespace = machine
        .metadata
        .namespace
        .as_deref()
        .or(request.namespace.as_deref())
        .ok_or_else(|| WebhookError::InvalidReview("machine has no namespace".to_string()))?;

    clusters
        .get_cluster(namespace, name)
        .await?
        .ok_or_else(|| WebhookError::InvalidReview(format!("cluster {namespace}/{name} not found")))
}

fn errored(
    request: &AdmissionRequest<DynamicObject>,
    code: u16,
    message: impl ToString,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = code;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::webhook_router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rstest::rstest;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn machine_json(infrastructure_kind: &str, cluster_label: bool) -> Value {
        let mut labels = serde_json::Map::new();
        if cluster_label {
            labels.insert(CLUSTER_NAME_LABEL.to_string(), json!("edge-01"));
        }
        json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "n1", "namespace": "default", "labels": labels},
            "spec": {
                "clusterName": "edge-01",
                "bootstrap": {"dataSecretName": "non-existent-secret"},
                "infrastructureRef": {
                    "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta1",
                    "kind": infrastructure_kind,
                    "name": "n1"
                }
            }
        })
    }

    fn review(operation: &str, machine: Value) -> Value {
        let (object, old_object) = if operation == "DELETE" {
            (Value::Null, machine)
        } else {
            (machine, Value::Null)
        };
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "7f0b2c1e",
                "kind": {"group": "cluster.x-k8s.io", "version": "v1beta1", "kind": "Machine"},
                "resource": {"group": "cluster.x-k8s.io", "version": "v1beta1", "resource": "machines"},
                "name": "n1",
                "namespace": "default",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": object,
                "oldObject": old_object
            }
        })
    }

    fn cluster(deleting: bool) -> Cluster {
        let mut cluster = Cluster::new("edge-01", Default::default());
        cluster.metadata.namespace = Some("default".to_string());
        if deleting {
            cluster.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        }
        cluster
    }

    fn lookup_returning(cluster: Option<Cluster>) -> MockClusterLookup {
        let mut lookup = MockClusterLookup::new();
        lookup
            .expect_get_cluster()
            .withf(|ns, name| ns == "default" && name == "edge-01")
            .returning(move |_, _| Ok(cluster.clone()));
        lookup
    }

    async fn post(lookup: MockClusterLookup, body: Value) -> Value {
        let router = webhook_router(Arc::new(WebhookState {
            clusters: Arc::new(lookup),
        }));
        let request = Request::builder()
            .method("POST")
            .uri(MACHINE_VALIDATE_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let review: Value = serde_json::from_slice(&body).unwrap();
        review["response"].clone()
    }

    /// Story: an operator runs `kubectl delete machine` on a mirrored node
    ///
    /// The Cluster is healthy, so the delete is refused with the read-only
    /// message. Deleting the whole Cluster later lets the same Machine go.
    #[tokio::test]
    async fn story_mirrored_machine_survives_a_direct_delete() {
        let response = post(
            lookup_returning(Some(cluster(false))),
            review("DELETE", machine_json("ExternalMachine", true)),
        )
        .await;
        assert_eq!(response["allowed"], false);
        assert_eq!(response["uid"], "7f0b2c1e");
        assert_eq!(
            response["status"]["message"],
            "externally-sourced machines are read-only outside of full cluster teardown"
        );

        let response = post(
            lookup_returning(Some(cluster(true))),
            review("DELETE", machine_json("ExternalMachine", true)),
        )
        .await;
        assert_eq!(response["allowed"], true);
    }

    #[rstest]
    #[case::create_external("CREATE", "ExternalMachine")]
    #[case::update_external("UPDATE", "ExternalMachine")]
    #[case::delete_other_provider("DELETE", "DockerMachine")]
    #[tokio::test]
    async fn requests_outside_the_guard_are_allowed(#[case] operation: &str, #[case] kind: &str) {
        let mut lookup = MockClusterLookup::new();
        lookup.expect_get_cluster().never();

        let response = post(lookup, review(operation, machine_json(kind, true))).await;
        assert_eq!(response["allowed"], true);
    }

    #[tokio::test]
    async fn cluster_name_falls_back_to_spec() {
        let response = post(
            lookup_returning(Some(cluster(false))),
            review("DELETE", machine_json("ExternalMachine", false)),
        )
        .await;
        assert_eq!(response["allowed"], false);
        assert_eq!(response["status"]["message"], READ_ONLY_MESSAGE);
    }

    #[tokio::test]
    async fn unresolvable_cluster_is_a_server_error() {
        let response = post(
            lookup_returning(None),
            review("DELETE", machine_json("ExternalMachine", true)),
        )
        .await;
        assert_eq!(response["allowed"], false);
        assert_eq!(response["status"]["code"], 500);
        // details stay in the logs
        assert_eq!(response["status"]["message"], RESOLUTION_FAILED_MESSAGE);
    }

    #[tokio::test]
    async fn lookup_failure_is_a_server_error() {
        let mut lookup = MockClusterLookup::new();
        lookup
            .expect_get_cluster()
            .returning(|_, _| Err(WebhookError::Server("connection reset".to_string())));

        let response = post(lookup, review("DELETE", machine_json("ExternalMachine", true))).await;
        assert_eq!(response["allowed"], false);
        assert_eq!(response["status"]["code"], 500);
    }

    #[tokio::test]
    async fn review_without_request_is_invalid() {
        let response = post(
            MockClusterLookup::new(),
            json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"}),
        )
        .await;
        assert_eq!(response["allowed"], false);
    }

    #[tokio::test]
    async fn undecodable_machine_is_rejected() {
        let mut machine = machine_json("ExternalMachine", true);
        machine["spec"]["infrastructureRef"] = json!("not-an-object");

        let response = post(MockClusterLookup::new(), review("DELETE", machine)).await;
        assert_eq!(response["allowed"], false);
        assert_eq!(response["status"]["code"], 400);
    }
}
