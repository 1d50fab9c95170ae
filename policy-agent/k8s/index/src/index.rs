//! Adapts the [`NetworkPolicyManager`] to the `kubert` index interfaces so that it can be driven
//! directly by resource watches.
//!
//! Pods and policies may be observed before the namespace that contains them. These are held
//! until the namespace is applied and are then replayed in the order they were received.

use crate::{metrics::IndexMetrics, NetworkPolicyManager};
use ahash::AHashMap as HashMap;
use netpol_agent_core::Error;
use netpol_agent_k8s_api::{self as k8s, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug)]
pub struct Index {
    manager: NetworkPolicyManager,

    /// Resources waiting for their namespace, by namespace.
    pending: HashMap<String, Pending>,

    metrics: IndexMetrics,
}

#[derive(Debug, Default)]
struct Pending {
    pods: Vec<k8s::Pod>,
    policies: Vec<k8s::NetworkPolicy>,
}

// === impl Index ===

impl Index {
    pub fn new(manager: NetworkPolicyManager, metrics: IndexMetrics) -> Self {
        Self {
            manager,
            pending: HashMap::default(),
            metrics,
        }
    }

    pub fn shared(manager: NetworkPolicyManager, metrics: IndexMetrics) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(manager, metrics)))
    }

    #[inline]
    pub fn manager(&self) -> &NetworkPolicyManager {
        &self.manager
    }

    #[inline]
    pub fn metrics(&self) -> &IndexMetrics {
        &self.metrics
    }

    /// Returns the number of resources waiting for `namespace`.
    pub fn pending(&self, namespace: &str) -> usize {
        self.pending
            .get(namespace)
            .map(|p| p.pods.len() + p.policies.len())
            .unwrap_or(0)
    }

    fn apply_pod(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        if !self.manager.namespaces().contains(&namespace) {
            debug!(%namespace, pod = %pod.name_any(), "Waiting for namespace");
            let pending = &mut self.pending.entry(namespace).or_default().pods;
            pending.retain(|p| p.name_any() != pod.name_any());
            pending.push(pod);
            self.set_sizes();
            return;
        }

        let res = self.manager.add_pod(&pod);
        self.record("pod", "apply", res);
    }

    fn apply_policy(&mut self, policy: k8s::NetworkPolicy) {
        let namespace = policy.namespace().unwrap_or_default();
        let Some(ns) = self.manager.namespaces().get(&namespace) else {
            debug!(%namespace, policy = %policy.name_any(), "Waiting for namespace");
            let pending = &mut self.pending.entry(namespace).or_default().policies;
            pending.retain(|p| p.name_any() != policy.name_any());
            pending.push(policy);
            self.set_sizes();
            return;
        };

        let applied = ns.policy(&policy.name_any()).cloned();
        let res = match applied {
            Some(old) => self.manager.update_network_policy(&old, &policy),
            None => self.manager.add_network_policy(&policy),
        };
        self.record("networkpolicy", "apply", res);
    }

    /// Applies the resources that were waiting for `namespace`.
    fn replay(&mut self, namespace: &str) {
        let Some(Pending { pods, policies }) = self.pending.remove(namespace) else {
            return;
        };
        info!(
            %namespace,
            pods = pods.len(),
            policies = policies.len(),
            "Replaying resources"
        );
        for pod in pods {
            self.apply_pod(pod);
        }
        for policy in policies {
            self.apply_policy(policy);
        }
    }

    fn record(&self, kind: &'static str, op: &'static str, res: Result<(), Error>) {
        match res {
            Ok(()) => {}
            Err(error) if op == "delete" && error.is_not_found() => {
                debug!(%kind, %error, "Ignoring delete");
            }
            Err(error) => {
                warn!(%kind, %op, %error, "Failed to update network policy state");
                self.metrics.failure(kind, op);
            }
        }
        self.set_sizes();
    }

    fn set_sizes(&self) {
        let policies = self
            .manager
            .namespaces()
            .iter()
            .map(|ns| ns.policy_count())
            .sum();
        let pending = self
            .pending
            .values()
            .map(|p| p.pods.len() + p.policies.len())
            .sum();
        self.metrics
            .set_sizes(self.manager.namespaces().len(), policies, pending);
    }
}

impl kubert::index::IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, ns: k8s::Namespace) {
        self.metrics.apply("namespace");
        let name = ns.name_any();
        let res = self.manager.add_namespace(&ns);
        let registered = res.is_ok();
        self.record("namespace", "apply", res);
        if registered {
            self.replay(&name);
        }
    }

    fn delete(&mut self, name: String) {
        self.metrics.delete("namespace");
        self.pending.remove(&name);
        let ns = k8s::Namespace {
            metadata: k8s::ObjectMeta {
                name: Some(name),
                ..Default::default()
            },
            ..Default::default()
        };
        let res = self.manager.delete_namespace(&ns);
        self.record("namespace", "delete", res);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        self.metrics.apply("pod");
        self.apply_pod(pod);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.metrics.delete("pod");
        if let Some(pending) = self.pending.get_mut(&namespace) {
            pending.pods.retain(|p| p.name_any() != name);
        }
        let pod = k8s::Pod {
            metadata: k8s::ObjectMeta {
                namespace: Some(namespace),
                name: Some(name),
                ..Default::default()
            },
            ..Default::default()
        };
        let res = self.manager.delete_pod(&pod);
        self.record("pod", "delete", res);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::NetworkPolicy> for Index {
    fn apply(&mut self, policy: k8s::NetworkPolicy) {
        self.metrics.apply("networkpolicy");
        self.apply_policy(policy);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.metrics.delete("networkpolicy");
        if let Some(pending) = self.pending.get_mut(&namespace) {
            pending.policies.retain(|p| p.name_any() != name);
        }
        let policy = k8s::NetworkPolicy {
            metadata: k8s::ObjectMeta {
                namespace: Some(namespace),
                name: Some(name),
                ..Default::default()
            },
            ..Default::default()
        };
        let res = self.manager.delete_network_policy(&policy);
        self.record("networkpolicy", "delete", res);
    }
}
