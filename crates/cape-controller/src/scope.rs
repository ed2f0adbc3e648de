//! Per-reconcile unit of work over a managed resource
//!
//! A [`Scope`] snapshots the resource when opened. Reconcile logic mutates
//! the wrapped resource in memory; nothing reaches the store until
//! [`Scope::close`] diffs the result against the snapshot and persists it.
//!
//! # Persistence
//!
//! Metadata (labels, annotations, finalizers, owner references) and status
//! are written with two JSON patches, main resource first. Each patch pins
//! `metadata.resourceVersion` to the version the diff was computed
//! against, so the store answers 409 when another writer got there first.
//! On a conflict the scope re-reads the object, replays its own changes on
//! the fresh copy, and tries again a bounded number of times.
//!
//! A failed close leaves the store as it was: status is a single patch, so
//! either the whole new status is visible or none of it is.

use std::sync::Arc;
use std::time::Duration;

use json_patch::Patch as JsonPatch;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use cape_common::crd::{
    ExternalCluster, ExternalClusterStatus, ExternalControlPlane, ExternalControlPlaneStatus,
    ExternalMachine, ExternalMachineStatus,
};
use cape_common::retry::{retry_if, RetryConfig};
use cape_common::Error;

use crate::client::{KubeClient, ObjectTarget, Subresource};

/// Metadata sections a scope is allowed to change
const TRACKED_METADATA: [&str; 4] = ["labels", "annotations", "finalizers", "ownerReferences"];

/// Attempts made to persist before giving up on conflicts
pub const CONFLICT_ATTEMPTS: u32 = 5;

/// Scope over an ExternalCluster
pub type ClusterScope = Scope<ExternalCluster>;
/// Scope over an ExternalControlPlane
pub type ControlPlaneScope = Scope<ExternalControlPlane>;
/// Scope over an ExternalMachine
pub type MachineScope = Scope<ExternalMachine>;

/// Snapshot-at-open, patch-at-close wrapper around a managed resource
pub struct Scope<K> {
    resource: K,
    snapshot: Value,
    target: ObjectTarget,
    client: Arc<dyn KubeClient>,
    retry: RetryConfig,
}

impl<K> Scope<K>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    /// Open a scope; the resource must have a name and a namespace
    pub fn open(resource: K, client: Arc<dyn KubeClient>) -> Result<Self, Error> {
        let kind = K::kind(&()).to_string();
        let meta = resource.meta();
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::missing_field(kind.clone(), None, "metadata.name"))?;
        let namespace = meta
            .namespace
            .clone()
            .ok_or_else(|| Error::missing_field(kind, Some(&name), "metadata.namespace"))?;

        let snapshot = serde_json::to_value(&resource)?;
        Ok(Self {
            resource,
            snapshot,
            target: ObjectTarget::of::<K>(&namespace, &name),
            client,
            retry: RetryConfig {
                max_attempts: CONFLICT_ATTEMPTS,
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(1),
                backoff_multiplier: 2.0,
            },
        })
    }

    /// Name of the wrapped resource
    pub fn name(&self) -> &str {
        &self.target.name
    }

    /// Namespace of the wrapped resource
    pub fn namespace(&self) -> &str {
        &self.target.namespace
    }

    /// `namespace/name` of the wrapped resource
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.target.namespace, self.target.name)
    }

    /// The wrapped resource as currently mutated
    pub fn resource(&self) -> &K {
        &self.resource
    }

    /// Mutable metadata of the wrapped resource
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        self.resource.meta_mut()
    }

    /// Persist every change made since open
    ///
    /// Issues no calls when nothing changed.
    pub async fn close(self) -> Result<(), Error> {
        let desired = serde_json::to_value(&self.resource)?;
        if !metadata_changed(&self.snapshot, &desired) && !status_changed(&self.snapshot, &desired)
        {
            return Ok(());
        }

        let pending = Mutex::new(Pending {
            base: self.snapshot.clone(),
            desired,
        });
        let operation = format!("persist {}", self.target);
        let result = retry_if(
            &self.retry,
            &operation,
            || self.persist_once(&pending),
            Error::is_conflict,
        )
        .await;

        match result {
            Err(e) if e.is_conflict() => Err(Error::conflict(
                self.target.kind(),
                self.namespaced_name(),
                format!("gave up after {} attempts: {}", self.retry.max_attempts, e),
            )),
            other => other,
        }
    }

    /// Close the scope and merge the outcome with the reconcile body's
    ///
    /// An error from the body wins; a close error is only returned when
    /// the body succeeded.
    pub async fn finish<T>(self, result: Result<T, Error>) -> Result<T, Error> {
        let name = self.namespaced_name();
        let closed = self.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(body_err), Ok(())) => Err(body_err),
            (Err(body_err), Err(close_err)) => {
                warn!(
                    resource = %name,
                    error = %close_err,
                    "Failed to persist status after reconcile error"
                );
                Err(body_err)
            }
        }
    }

    async fn persist_once(&self, pending: &Mutex<Pending>) -> Result<(), Error> {
        let mut pending = pending.lock().await;
        match persist(self.client.as_ref(), &self.target, &pending.base, &pending.desired).await {
            Err(e) if e.is_conflict() => {
                debug!(resource = %self.target, error = %e, "Write conflict, rebasing on a fresh copy");
                if let Some(fresh) = self.client.get_object(&self.target).await? {
                    pending.desired = rebase(&pending.base, &pending.desired, &fresh);
                    pending.base = fresh;
                }
                Err(e)
            }
            other => other,
        }
    }
}

impl Scope<ExternalCluster> {
    /// Mutable status of the ExternalCluster
    pub fn status_mut(&mut self) -> &mut ExternalClusterStatus {
        self.resource.status.get_or_insert_with(Default::default)
    }
}

impl Scope<ExternalControlPlane> {
    /// Mutable status of the ExternalControlPlane
    pub fn status_mut(&mut self) -> &mut ExternalControlPlaneStatus {
        self.resource.status.get_or_insert_with(Default::default)
    }
}

impl Scope<ExternalMachine> {
    /// Mutable status of the ExternalMachine
    pub fn status_mut(&mut self) -> &mut ExternalMachineStatus {
        self.resource.status.get_or_insert_with(Default::default)
    }
}

/// The version a diff is computed against and the state to reach
struct Pending {
    base: Value,
    desired: Value,
}

fn section<'a>(obj: &'a Value, name: &str) -> Option<&'a Value> {
    obj.get("metadata")?.get(name).filter(|v| !v.is_null())
}

fn status_of(obj: &Value) -> Option<&Value> {
    obj.get("status").filter(|v| !v.is_null())
}

fn metadata_changed(base: &Value, desired: &Value) -> bool {
    TRACKED_METADATA
        .iter()
        .any(|name| section(base, name) != section(desired, name))
}

fn status_changed(base: &Value, desired: &Value) -> bool {
    status_of(base) != status_of(desired)
}

fn resource_version(obj: &Value, target: &ObjectTarget) -> Result<String, Error> {
    obj.pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::missing_field(target.kind(), Some(&target.name), "metadata.resourceVersion")
        })
}

fn version_pin(resource_version: &str) -> Value {
    json!({
        "op": "replace",
        "path": "/metadata/resourceVersion",
        "value": resource_version,
    })
}

/// Operations moving one top-level member from `before` to `after`
fn member_ops(path: &str, before: Option<&Value>, after: Option<&Value>) -> Option<Value> {
    match (before, after) {
        (b, a) if b == a => None,
        (_, Some(value)) => Some(json!({ "op": "add", "path": path, "value": value })),
        (Some(_), None) => Some(json!({ "op": "remove", "path": path })),
        (None, None) => None,
    }
}

/// Build the metadata patch, `None` when metadata is unchanged
pub(crate) fn metadata_patch(
    base: &Value,
    desired: &Value,
    resource_version: &str,
) -> Result<Option<JsonPatch>, Error> {
    let changes: Vec<Value> = TRACKED_METADATA
        .iter()
        .filter_map(|name| {
            member_ops(
                &format!("/metadata/{name}"),
                section(base, name),
                section(desired, name),
            )
        })
        .collect();
    if changes.is_empty() {
        return Ok(None);
    }
    let mut ops = vec![version_pin(resource_version)];
    ops.extend(changes);
    Ok(Some(serde_json::from_value(Value::Array(ops))?))
}

/// Build the status patch, `None` when status is unchanged
pub(crate) fn status_patch(
    base: &Value,
    desired: &Value,
    resource_version: &str,
) -> Result<Option<JsonPatch>, Error> {
    let Some(change) = member_ops("/status", status_of(base), status_of(desired)) else {
        return Ok(None);
    };
    let ops = vec![version_pin(resource_version), change];
    Ok(Some(serde_json::from_value(Value::Array(ops))?))
}

async fn persist(
    client: &dyn KubeClient,
    target: &ObjectTarget,
    base: &Value,
    desired: &Value,
) -> Result<(), Error> {
    let mut version = resource_version(base, target)?;

    if let Some(patch) = metadata_patch(base, desired, &version)? {
        let persisted = client.patch_object(target, Subresource::Main, &patch).await?;
        version = resource_version(&persisted, target)?;
    }
    if let Some(patch) = status_patch(base, desired, &version)? {
        client.patch_object(target, Subresource::Status, &patch).await?;
    }
    Ok(())
}

/// Replay the changes between `base` and `ours` on top of `fresh`
///
/// Map sections merge key by key and list sections merge as sets. Status
/// is owned by the controller and replaces whatever the fresh copy holds.
pub(crate) fn rebase(base: &Value, ours: &Value, fresh: &Value) -> Value {
    let mut merged = fresh.clone();
    for name in TRACKED_METADATA {
        let value = merge_section(section(base, name), section(ours, name), section(fresh, name));
        if let Some(meta) = merged.get_mut("metadata").and_then(Value::as_object_mut) {
            match value {
                Some(v) => {
                    meta.insert(name.to_string(), v);
                }
                None => {
                    meta.remove(name);
                }
            }
        }
    }
    if let Some(obj) = merged.as_object_mut() {
        match status_of(ours) {
            Some(status) => {
                obj.insert("status".to_string(), status.clone());
            }
            None => {
                obj.remove("status");
            }
        }
    }
    merged
}

fn merge_section(base: Option<&Value>, ours: Option<&Value>, fresh: Option<&Value>) -> Option<Value> {
    if base == ours {
        return fresh.cloned();
    }
    let empty_map = serde_json::Map::new();
    let as_map = |v: Option<&Value>| v.and_then(Value::as_object).cloned();

    if ours.is_some_and(Value::is_object) || base.is_some_and(Value::is_object) {
        let base_map = as_map(base).unwrap_or_else(|| empty_map.clone());
        let ours_map = as_map(ours).unwrap_or_else(|| empty_map.clone());
        let mut out = as_map(fresh).unwrap_or_default();
        for (key, value) in &ours_map {
            if base_map.get(key) != Some(value) {
                out.insert(key.clone(), value.clone());
            }
        }
        for key in base_map.keys() {
            if !ours_map.contains_key(key) {
                out.remove(key);
            }
        }
        return (!out.is_empty()).then_some(Value::Object(out));
    }

    let as_list = |v: Option<&Value>| {
        v.and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let base_list = as_list(base);
    let ours_list = as_list(ours);
    let mut out = as_list(fresh);
    out.retain(|item| ours_list.contains(item) || !base_list.contains(item));
    for item in &ours_list {
        if !base_list.contains(item) && !out.contains(item) {
            out.push(item.clone());
        }
    }
    (!out.is_empty()).then_some(Value::Array(out))
}
