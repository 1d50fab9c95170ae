use crate::{
    namespace::NamespaceIndex,
    parse::{self, Compiled},
    selection::{NsSelection, PodSelection},
};
use netpol_agent_core::{tag, Error, Fabric, Ipv4Net, PortId};
use netpol_agent_k8s_api::{Labels, Namespace, NetworkPolicy, ResourceExt, Selector};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Applies namespaces, pods and policies to every active port.
///
/// Each operation enumerates the active ports and then works through them in order. A failure
/// aborts the operation and is returned; whatever was already applied, on earlier ports or earlier
/// steps, is left in place.
///
/// Every mutation takes `&mut self`. At runtime the manager lives inside the [`SharedIndex`], whose
/// `RwLock` is the single lock serializing all mutations, so at most one is in flight at a time.
///
/// [`SharedIndex`]: crate::SharedIndex
pub struct NetworkPolicyManager {
    pub(crate) namespaces: NamespaceIndex,
    pub(crate) fabric: Fabric,
}

impl NetworkPolicyManager {
    pub fn new(fabric: Fabric) -> Self {
        Self {
            namespaces: NamespaceIndex::new(),
            fabric,
        }
    }

    #[inline]
    pub fn namespaces(&self) -> &NamespaceIndex {
        &self.namespaces
    }

    #[inline]
    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Registers a namespace, creating its tag and listing it in the all-namespaces NLTag and in
    /// the NLTag of each of its labels.
    ///
    /// A namespace that is already known is updated, and its tag and listings are re-applied on
    /// every port. A namespace is registered only once every port has been programmed, so a
    /// failed add is retried from the start.
    pub fn add_namespace(&mut self, ns: &Namespace) -> Result<(), Error> {
        let name = ns.name_any();
        let known = self.namespaces.contains(&name);
        if known {
            self.update_namespace(ns)?;
        }

        let ports = self.fabric.ports()?;
        let labels = Labels::from(ns.metadata.labels.clone());
        for (k, v) in labels.iter() {
            let (list, selection) = label_list(k, v);
            self.namespaces.register_list(&list, &selection);
        }

        for port in &ports {
            self.ensure_pod_set(port, &tag::namespace_tag(&name), &PodSelection::namespace(&name))?;
            self.ensure_ns_list(port, tag::ALL_NAMESPACES, &NsSelection::default())?;
            for (k, v) in labels.iter() {
                let (list, selection) = label_list(k, v);
                self.ensure_ns_list(port, &list, &selection)?;
            }
            self.list_namespace(port, &name, &labels)?;
        }

        if !known {
            self.namespaces.insert(&name, labels);
            info!(namespace = %name, "Added namespace");
        }
        Ok(())
    }

    /// Applies a change to a namespace's labels.
    pub fn update_namespace(&mut self, ns: &Namespace) -> Result<(), Error> {
        let name = ns.name_any();
        let old = self
            .namespaces
            .get(&name)
            .ok_or_else(|| Error::not_found("namespace", &name))?
            .labels()
            .clone();
        let new = Labels::from(ns.metadata.labels.clone());
        if old == new {
            return Ok(());
        }

        let ports = self.fabric.ports()?;
        for (k, _, v) in old.diff(&new) {
            if let Some(v) = v {
                let (list, selection) = label_list(k, v);
                self.namespaces.register_list(&list, &selection);
            }
        }

        // Pods that were selected only through the old labels leave the cross-namespace tags.
        let pods = self.pod_addrs(&name);
        for port in &ports {
            self.unlist_namespace(port, &name, |sel| sel.selects(&old) && !sel.selects(&new))?;
            let sets = self
                .namespaces
                .cross_namespace_sets()
                .filter(|(_, sel)| {
                    sel.selects_namespace(&name, &old) && !sel.selects_namespace(&name, &new)
                })
                .map(|(set, sel)| (set.to_string(), sel.clone()))
                .collect::<Vec<_>>();
            for (set, sel) in &sets {
                for (labels, addr) in &pods {
                    if sel.labels.matches(labels) {
                        self.fabric.delete_from_tag(port, set, *addr)?;
                    }
                }
            }
        }

        if let Some(entry) = self.namespaces.get_mut(&name) {
            entry.set_labels(new.clone());
        }

        for port in &ports {
            for (k, v) in new.iter() {
                let (list, selection) = label_list(k, v);
                self.ensure_ns_list(port, &list, &selection)?;
            }
            self.list_namespace(port, &name, &new)?;

            let sets = self
                .namespaces
                .cross_namespace_sets()
                .filter(|(_, sel)| {
                    !sel.selects_namespace(&name, &old) && sel.selects_namespace(&name, &new)
                })
                .map(|(set, sel)| (set.to_string(), sel.clone()))
                .collect::<Vec<_>>();
            for (set, sel) in &sets {
                if !self.fabric.has_tag(port, set) {
                    continue;
                }
                for (labels, addr) in &pods {
                    if sel.labels.matches(labels) {
                        self.fabric.add_to_tag(port, set, *addr)?;
                    }
                }
            }
        }

        info!(namespace = %name, "Updated namespace labels");
        Ok(())
    }

    /// Removes a namespace along with its policies, pods and tags.
    ///
    /// The registered labels are authoritative, so the snapshot only needs to carry a name.
    /// Unknown namespaces are ignored.
    pub fn delete_namespace(&mut self, ns: &Namespace) -> Result<(), Error> {
        let name = ns.name_any();
        let Some(entry) = self.namespaces.get(&name) else {
            debug!(namespace = %name, "Namespace not registered");
            return Ok(());
        };
        let policies = entry.policies.values().cloned().collect::<Vec<_>>();
        let pods = entry.pods.keys().cloned().collect::<Vec<_>>();

        let ports = self.fabric.ports()?;
        for policy in &policies {
            self.delete_network_policy(policy)?;
        }
        for uid in &pods {
            self.remove_pod(&name, uid)?;
        }

        let sets = self
            .namespaces
            .get(&name)
            .map(|entry| {
                let mut sets = entry.set_names().map(str::to_string).collect::<Vec<_>>();
                // The namespace tag goes last, once no other tag of this namespace can refer to it.
                sets.sort_by_key(|set| set.starts_with("ns:"));
                sets
            })
            .unwrap_or_default();
        for port in &ports {
            self.unlist_namespace(port, &name, |_| true)?;
            for set in &sets {
                self.fabric.delete_tag(port, set)?;
            }
        }

        self.namespaces.remove(&name);
        info!(namespace = %name, "Deleted namespace");
        Ok(())
    }

    /// Rebuilds the membership of the all-namespaces NLTag on `port` from the registry.
    pub fn init_all_ns_list(&mut self, port: &PortId) -> Result<(), Error> {
        self.fabric.ensure_nl_tag(port, tag::ALL_NAMESPACES)?;
        let names = self.namespaces.list_members(&NsSelection::default());
        for name in &names {
            let ns_tag = tag::namespace_tag(name);
            self.ensure_pod_set(port, &ns_tag, &PodSelection::namespace(name))?;
            self.fabric
                .add_to_nl_tag(port, tag::ALL_NAMESPACES, &ns_tag)?;
        }

        let stale = self
            .fabric
            .nl_tag_members(port, tag::ALL_NAMESPACES)
            .into_iter()
            .flatten()
            .filter(|member| {
                !names
                    .iter()
                    .any(|name| tag::namespace_tag(name) == **member)
            })
            .cloned()
            .collect::<Vec<_>>();
        for member in &stale {
            self.fabric
                .delete_from_nl_tag(port, tag::ALL_NAMESPACES, member)?;
        }

        debug!(%port, namespaces = names.len(), "Initialized all-namespaces list");
        Ok(())
    }

    /// Removes every namespace from the all-namespaces NLTag on `port`.
    pub fn uninit_all_ns_list(&mut self, port: &PortId) -> Result<(), Error> {
        let members = self
            .fabric
            .nl_tag_members(port, tag::ALL_NAMESPACES)
            .into_iter()
            .flatten()
            .cloned()
            .collect::<Vec<_>>();
        for member in &members {
            self.fabric
                .delete_from_nl_tag(port, tag::ALL_NAMESPACES, member)?;
        }
        debug!(%port, "Cleared all-namespaces list");
        Ok(())
    }

    /// Compiles a policy and applies its tags, NLTags and rules to every active port.
    ///
    /// A policy that is already applied under the same name is replaced, but only once the new
    /// one compiles.
    pub fn add_network_policy(&mut self, policy: &NetworkPolicy) -> Result<(), Error> {
        let namespace = policy.namespace().unwrap_or_default();
        let name = policy.name_any();
        let existing = self
            .namespaces
            .get(&namespace)
            .ok_or_else(|| Error::not_found("namespace", &namespace))?
            .policy(&name)
            .cloned();
        let compiled = parse::parse_policy(policy)?;
        if let Some(existing) = existing {
            self.delete_network_policy(&existing)?;
        }

        let ports = self.fabric.ports()?;
        let holder = format!("{namespace}/{name}");
        self.register(&namespace, &compiled);

        for port in &ports {
            self.ensure_pod_set(
                port,
                &tag::namespace_tag(&namespace),
                &PodSelection::namespace(&namespace),
            )?;
            for (set, selection) in &compiled.pod_tags {
                self.ensure_pod_set(port, set, selection)?;
            }
            for (set, nets) in &compiled.ip_tags {
                self.ensure_address_set(port, set, nets)?;
            }
            for (list, selection) in &compiled.ns_lists {
                self.ensure_ns_list(port, list, selection)?;
            }
            self.init_all_ns_list(port)?;
            for rule in &compiled.rules {
                self.fabric.add_rule(port, &holder, rule)?;
            }
        }

        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            ns.policies.insert(name.clone(), policy.clone());
        }
        info!(%namespace, policy = %name, rules = compiled.rules.len(), "Applied policy");
        Ok(())
    }

    /// Removes the rules of an applied policy from every active port.
    ///
    /// The policy is recompiled from the applied snapshot, so `policy` only needs to carry a
    /// namespace and name. Its tags and NLTags are left in place.
    pub fn delete_network_policy(&mut self, policy: &NetworkPolicy) -> Result<(), Error> {
        let namespace = policy.namespace().unwrap_or_default();
        let name = policy.name_any();
        let applied = self
            .namespaces
            .get(&namespace)
            .and_then(|ns| ns.policy(&name))
            .cloned()
            .ok_or_else(|| Error::not_found("policy", format!("{namespace}/{name}")))?;

        let compiled = parse::parse_policy(&applied)?;
        let ports = self.fabric.ports()?;
        let holder = format!("{namespace}/{name}");
        for port in &ports {
            for rule in &compiled.rules {
                self.fabric.delete_rule(port, &holder, rule)?;
            }
        }

        if let Some(ns) = self.namespaces.get_mut(&namespace) {
            ns.policies.remove(&name);
        }
        info!(%namespace, policy = %name, "Deleted policy");
        Ok(())
    }

    /// Replaces `old` with `new`.
    ///
    /// This is not atomic: if `new` cannot be applied, `old` remains deleted.
    pub fn update_network_policy(
        &mut self,
        old: &NetworkPolicy,
        new: &NetworkPolicy,
    ) -> Result<(), Error> {
        let namespace = old.namespace().unwrap_or_default();
        let applied = self
            .namespaces
            .get(&namespace)
            .is_some_and(|ns| ns.policy(&old.name_any()).is_some());
        if applied {
            self.delete_network_policy(old)?;
        }
        self.add_network_policy(new)
    }

    fn register(&mut self, namespace: &str, compiled: &Compiled) {
        for (set, selection) in &compiled.pod_tags {
            self.namespaces.register_pods(set, selection);
        }
        for (set, nets) in &compiled.ip_tags {
            self.namespaces.register_addresses(namespace, set, nets);
        }
        for (list, selection) in &compiled.ns_lists {
            self.namespaces.register_list(list, selection);
        }
    }

    /// Creates a pod tag on `port` and fills it with the addresses it selects.
    fn ensure_pod_set(
        &mut self,
        port: &PortId,
        name: &str,
        selection: &PodSelection,
    ) -> Result<(), Error> {
        if !self.fabric.ensure_tag(port, name)? {
            return Ok(());
        }
        for addr in self.namespaces.pod_members(selection) {
            self.fabric.add_to_tag(port, name, addr)?;
        }
        Ok(())
    }

    /// Creates an ipBlock tag on `port` and makes its members exactly `nets`.
    fn ensure_address_set(
        &mut self,
        port: &PortId,
        name: &str,
        nets: &BTreeSet<Ipv4Net>,
    ) -> Result<(), Error> {
        self.fabric.ensure_tag(port, name)?;
        let stale = self
            .fabric
            .tag_members(port, name)
            .into_iter()
            .flatten()
            .filter(|net| !nets.contains(net))
            .copied()
            .collect::<Vec<_>>();
        for net in stale {
            self.fabric.delete_from_tag(port, name, net)?;
        }
        for net in nets {
            self.fabric.add_to_tag(port, name, *net)?;
        }
        Ok(())
    }

    /// Creates an NLTag on `port` and lists the tags of the namespaces it selects.
    fn ensure_ns_list(
        &mut self,
        port: &PortId,
        name: &str,
        selection: &NsSelection,
    ) -> Result<(), Error> {
        if !self.fabric.ensure_nl_tag(port, name)? {
            return Ok(());
        }
        for ns in self.namespaces.list_members(selection) {
            let ns_tag = tag::namespace_tag(&ns);
            self.ensure_pod_set(port, &ns_tag, &PodSelection::namespace(&ns))?;
            self.fabric.add_to_nl_tag(port, name, &ns_tag)?;
        }
        Ok(())
    }

    /// Adds a namespace's tag to every NLTag on `port` that selects `labels`.
    fn list_namespace(&mut self, port: &PortId, name: &str, labels: &Labels) -> Result<(), Error> {
        let ns_tag = tag::namespace_tag(name);
        let lists = self
            .namespaces
            .lists()
            .filter(|(_, sel)| sel.selects(labels))
            .map(|(list, _)| list.to_string())
            .collect::<Vec<_>>();
        for list in &lists {
            if self.fabric.has_nl_tag(port, list) {
                self.fabric.add_to_nl_tag(port, list, &ns_tag)?;
            }
        }
        Ok(())
    }

    /// Removes a namespace's tag from the NLTags on `port` for which `remove` holds.
    fn unlist_namespace(
        &mut self,
        port: &PortId,
        name: &str,
        remove: impl Fn(&NsSelection) -> bool,
    ) -> Result<(), Error> {
        let ns_tag = tag::namespace_tag(name);
        let lists = self
            .namespaces
            .lists()
            .filter(|(_, sel)| remove(sel))
            .map(|(list, _)| list.to_string())
            .collect::<Vec<_>>();
        for list in &lists {
            self.fabric.delete_from_nl_tag(port, list, &ns_tag)?;
        }
        Ok(())
    }

    fn pod_addrs(&self, namespace: &str) -> Vec<(Labels, Ipv4Net)> {
        self.namespaces
            .get(namespace)
            .into_iter()
            .flat_map(|ns| ns.pods.values())
            .filter_map(|pod| Some((pod.labels.clone(), pod.addr?)))
            .collect()
    }
}

/// The NLTag listing the namespaces labeled `key=value`.
fn label_list(key: &str, value: &str) -> (String, NsSelection) {
    let selection = Selector::from_iter(Some((key.to_string(), value.to_string())));
    (tag::ns_label_list(key, value), NsSelection(selection))
}

impl std::fmt::Debug for NetworkPolicyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkPolicyManager")
            .field("namespaces", &self.namespaces.len())
            .finish_non_exhaustive()
    }
}
