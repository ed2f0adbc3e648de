//! Owner and pause resolution shared by the reconcilers

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use cape_common::crd::{Cluster, Machine};
use cape_common::kube_utils::{has_annotation, label, owner_of_kind};
use cape_common::{Error, CAPI_GROUP, CLUSTER_NAME_LABEL, PAUSED_ANNOTATION, WATCH_FILTER_LABEL};

use crate::client::KubeClient;

/// The Cluster named by an object's owner references
///
/// `None` when no Cluster owner is set yet or the owner no longer exists.
pub async fn owner_cluster(
    client: &dyn KubeClient,
    meta: &ObjectMeta,
) -> Result<Option<Cluster>, Error> {
    let (Some(owner), Some(namespace)) = (
        owner_of_kind(meta, CAPI_GROUP, "Cluster"),
        meta.namespace.as_deref(),
    ) else {
        return Ok(None);
    };
    client.get_cluster(namespace, &owner.name).await
}

/// The Machine named by an object's owner references
pub async fn owner_machine(
    client: &dyn KubeClient,
    meta: &ObjectMeta,
) -> Result<Option<Machine>, Error> {
    let (Some(owner), Some(namespace)) = (
        owner_of_kind(meta, CAPI_GROUP, "Machine"),
        meta.namespace.as_deref(),
    ) else {
        return Ok(None);
    };
    client.get_machine(namespace, &owner.name).await
}

/// Name of the Cluster a Machine belongs to, from its cluster-name label
pub fn cluster_name_label(meta: &ObjectMeta) -> Option<&str> {
    label(meta, CLUSTER_NAME_LABEL).filter(|name| !name.is_empty())
}

/// True when reconciliation is halted for `meta`
///
/// Either the Cluster is paused (spec or annotation) or the resource
/// itself carries the pause annotation.
pub fn is_paused(cluster: &Cluster, meta: &ObjectMeta) -> bool {
    cluster.spec.paused
        || has_annotation(&cluster.metadata, PAUSED_ANNOTATION)
        || has_annotation(meta, PAUSED_ANNOTATION)
}

/// True when the object belongs to this controller instance's shard
///
/// Without a filter every object matches.
pub fn matches_watch_filter(meta: &ObjectMeta, filter: Option<&str>) -> bool {
    match filter {
        Some(value) => label(meta, WATCH_FILTER_LABEL) == Some(value),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use cape_common::crd::ClusterSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn owned_by(kind: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some("child".to_string()),
            namespace: Some("default".to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "cluster.x-k8s.io/v1beta1".to_string(),
                kind: kind.to_string(),
                name: name.to_string(),
                uid: "uid-1".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn annotated(key: &str) -> ObjectMeta {
        ObjectMeta {
            annotations: Some(BTreeMap::from([(key.to_string(), "true".to_string())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn owner_cluster_is_fetched_from_owner_namespace() {
        let mut client = MockKubeClient::new();
        client
            .expect_get_cluster()
            .withf(|ns, name| ns == "default" && name == "edge-01")
            .times(1)
            .returning(|_, name| Ok(Some(Cluster::new(name, ClusterSpec::default()))));

        let cluster = owner_cluster(&client, &owned_by("Cluster", "edge-01"))
            .await
            .unwrap();
        assert!(cluster.is_some());
    }

    #[tokio::test]
    async fn missing_owner_needs_no_lookup() {
        // any call on the mock would panic
        let client = MockKubeClient::new();
        let meta = ObjectMeta {
            namespace: Some("default".to_string()),
            ..Default::default()
        };
        assert!(owner_cluster(&client, &meta).await.unwrap().is_none());
        assert!(owner_machine(&client, &owned_by("Cluster", "edge-01"))
            .await
            .unwrap()
            .is_none());
    }

    #[rstest]
    #[case::running(false, ObjectMeta::default(), ObjectMeta::default(), false)]
    #[case::spec_paused(true, ObjectMeta::default(), ObjectMeta::default(), true)]
    #[case::cluster_annotated(false, annotated(PAUSED_ANNOTATION), ObjectMeta::default(), true)]
    #[case::resource_annotated(false, ObjectMeta::default(), annotated(PAUSED_ANNOTATION), true)]
    #[case::unrelated_annotation(false, annotated("other"), annotated("other"), false)]
    fn pause_sources(
        #[case] spec_paused: bool,
        #[case] cluster_meta: ObjectMeta,
        #[case] resource_meta: ObjectMeta,
        #[case] paused: bool,
    ) {
        let mut cluster = Cluster::new(
            "edge-01",
            ClusterSpec {
                paused: spec_paused,
                ..Default::default()
            },
        );
        cluster.metadata = cluster_meta;
        assert_eq!(is_paused(&cluster, &resource_meta), paused);
    }

    #[test]
    fn empty_cluster_label_counts_as_missing() {
        let mut meta = ObjectMeta {
            labels: Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), String::new())])),
            ..Default::default()
        };
        assert_eq!(cluster_name_label(&meta), None);
        meta.labels = Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            "edge-01".to_string(),
        )]));
        assert_eq!(cluster_name_label(&meta), Some("edge-01"));
    }

    #[test]
    fn watch_filter_matches_label_value() {
        let meta = ObjectMeta {
            labels: Some(BTreeMap::from([(
                WATCH_FILTER_LABEL.to_string(),
                "shard-a".to_string(),
            )])),
            ..Default::default()
        };
        assert!(matches_watch_filter(&meta, None));
        assert!(matches_watch_filter(&meta, Some("shard-a")));
        assert!(!matches_watch_filter(&meta, Some("shard-b")));
        assert!(!matches_watch_filter(&ObjectMeta::default(), Some("shard-a")));
    }
}
