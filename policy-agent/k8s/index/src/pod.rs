use crate::NetworkPolicyManager;
use netpol_agent_core::{Error, Ipv4Net};
use netpol_agent_k8s_api::{Labels, Pod, ResourceExt};
use std::net::Ipv4Addr;
use tracing::debug;

/// The parts of a pod that determine its tag membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PodEntry {
    pub(crate) name: String,
    pub(crate) labels: Labels,

    /// Unset for host-network pods and for pods without an IPv4 address, which never become tag
    /// members.
    pub(crate) addr: Option<Ipv4Net>,
}

// === impl PodEntry ===

impl PodEntry {
    pub(crate) fn from_pod(pod: &Pod) -> Self {
        let host_network = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.host_network)
            .unwrap_or(false);
        let addr = if host_network {
            None
        } else {
            pod.status
                .as_ref()
                .and_then(|status| status.pod_ip.as_deref())
                .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
                .map(Ipv4Net::from)
        };

        Self {
            name: pod.name_any(),
            labels: pod.metadata.labels.clone().into(),
            addr,
        }
    }
}

// === impl NetworkPolicyManager ===

impl NetworkPolicyManager {
    /// Records a pod and adds its address to every tag that selects it.
    ///
    /// A pod that is already known is updated.
    pub fn add_pod(&mut self, pod: &Pod) -> Result<(), Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let uid = pod.uid().unwrap_or_else(|| pod.name_any());
        let entry = PodEntry::from_pod(pod);

        let ns = self
            .namespaces
            .get(&namespace)
            .ok_or_else(|| Error::not_found("namespace", &namespace))?;
        if let Some(existing) = ns.pods.get(&uid) {
            if *existing == entry {
                return Ok(());
            }
            self.remove_pod(&namespace, &uid)?;
        }

        let ports = self.fabric.ports()?;
        let Some(ns) = self.namespaces.get_mut(&namespace) else {
            return Err(Error::not_found("namespace", &namespace));
        };
        ns.pods.insert(uid.clone(), entry.clone());

        let Some(addr) = entry.addr else {
            debug!(%namespace, pod = %entry.name, "Pod has no address");
            return Ok(());
        };
        let sets = self.selecting_sets(&namespace, &entry.labels);
        for port in &ports {
            for set in &sets {
                if self.fabric.has_tag(port, set) {
                    self.fabric.add_to_tag(port, set, addr)?;
                }
            }
        }
        debug!(%namespace, pod = %entry.name, %addr, tags = sets.len(), "Added pod");
        Ok(())
    }

    #[inline]
    pub fn update_pod(&mut self, pod: &Pod) -> Result<(), Error> {
        self.add_pod(pod)
    }

    /// Forgets a pod and removes its address from every tag that selects it.
    ///
    /// The pod is found by UID or, when the snapshot carries none, by name.
    pub fn delete_pod(&mut self, pod: &Pod) -> Result<(), Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let ns = self
            .namespaces
            .get(&namespace)
            .ok_or_else(|| Error::not_found("namespace", &namespace))?;
        let uid = match pod.uid() {
            Some(uid) => uid,
            None => ns
                .pods
                .iter()
                .find(|(_, entry)| entry.name == name)
                .map(|(uid, _)| uid.clone())
                .ok_or_else(|| Error::not_found("pod", format!("{namespace}/{name}")))?,
        };
        self.remove_pod(&namespace, &uid)
    }

    pub(crate) fn remove_pod(&mut self, namespace: &str, uid: &str) -> Result<(), Error> {
        let ports = self.fabric.ports()?;
        let entry = self
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.pods.remove(uid))
            .ok_or_else(|| Error::not_found("pod", format!("{namespace}/{uid}")))?;

        let Some(addr) = entry.addr else {
            return Ok(());
        };
        let sets = self.selecting_sets(namespace, &entry.labels);
        for port in &ports {
            for set in &sets {
                // Another pod may have been assigned the same address.
                if self.still_holds(namespace, set, addr) {
                    continue;
                }
                self.fabric.delete_from_tag(port, set, addr)?;
            }
        }
        debug!(%namespace, pod = %entry.name, %addr, "Removed pod");
        Ok(())
    }

    /// Lists the registered pod tags that select a pod with `labels` in `namespace`.
    fn selecting_sets(&self, namespace: &str, labels: &Labels) -> Vec<String> {
        let Some(ns) = self.namespaces.get(namespace) else {
            return Vec::new();
        };
        self.namespaces
            .pod_sets(ns)
            .filter(|(_, sel)| sel.labels.matches(labels))
            .map(|(name, _)| name.to_string())
            .collect()
    }

    fn still_holds(&self, namespace: &str, set: &str, addr: Ipv4Net) -> bool {
        let Some(ns) = self.namespaces.get(namespace) else {
            return false;
        };
        self.namespaces
            .pod_sets(ns)
            .find(|(name, _)| *name == set)
            .is_some_and(|(_, sel)| self.namespaces.pod_members(sel).contains(&addr))
    }
}
