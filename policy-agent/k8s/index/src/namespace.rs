use crate::{
    pod::PodEntry,
    selection::{NsSelection, PodScope, PodSelection, SetKind},
};
use ahash::AHashMap as HashMap;
use netpol_agent_core::{tag, Ipv4Net};
use netpol_agent_k8s_api::{Labels, NetworkPolicy};
use std::collections::BTreeSet;

/// Holds the state of every known namespace.
///
/// The sentinel entry is keyed by [`tag::ALL_NAMESPACES`]. It owns the sets that are not scoped to
/// a single namespace: the NLTags and the cross-namespace pod tags. The backend that programs all
/// of these sets belongs to the sentinel and is held by the [`NetworkPolicyManager`] on its behalf;
/// ordinary entries never own one.
///
/// [`NetworkPolicyManager`]: crate::NetworkPolicyManager
#[derive(Debug)]
pub struct NamespaceIndex {
    all: Namespace,
    by_name: HashMap<String, Namespace>,
}

#[derive(Debug)]
pub struct Namespace {
    name: String,
    labels: Labels,

    /// The tags and NLTags registered against this namespace, by name.
    pub(crate) sets: HashMap<String, SetKind>,

    /// Pods by UID.
    pub(crate) pods: HashMap<String, PodEntry>,

    /// Applied policies by name.
    pub(crate) policies: HashMap<String, NetworkPolicy>,
}

// === impl NamespaceIndex ===

impl Default for NamespaceIndex {
    fn default() -> Self {
        let mut all = Namespace::new(tag::ALL_NAMESPACES, Labels::default());
        all.sets.insert(
            tag::ALL_NAMESPACES.to_string(),
            SetKind::Namespaces(NsSelection::default()),
        );
        Self {
            all,
            by_name: HashMap::default(),
        }
    }
}

impl NamespaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Namespace> {
        self.by_name.get(name)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Namespace> {
        self.by_name.get_mut(name)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// The sentinel entry.
    #[inline]
    pub fn all(&self) -> &Namespace {
        &self.all
    }

    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.by_name.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub(crate) fn insert(&mut self, name: &str, labels: Labels) {
        let mut ns = Namespace::new(name, labels);
        ns.sets.insert(
            tag::namespace_tag(name),
            SetKind::Pods(PodSelection::namespace(name)),
        );
        self.by_name.insert(name.to_string(), ns);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Namespace> {
        self.by_name.remove(name)
    }

    /// Records a pod tag against the namespace it is scoped to, or against the sentinel if it
    /// spans namespaces.
    pub(crate) fn register_pods(&mut self, name: &str, selection: &PodSelection) {
        let owner = match &selection.scope {
            PodScope::Namespace(ns) => match self.by_name.get_mut(ns) {
                Some(owner) => owner,
                None => return,
            },
            PodScope::Namespaces(_) => &mut self.all,
        };
        owner
            .sets
            .entry(name.to_string())
            .or_insert_with(|| SetKind::Pods(selection.clone()));
    }

    /// Records an ipBlock tag against `namespace`, replacing the networks of an earlier
    /// registration under the same name.
    pub(crate) fn register_addresses(
        &mut self,
        namespace: &str,
        name: &str,
        nets: &BTreeSet<Ipv4Net>,
    ) {
        if let Some(owner) = self.by_name.get_mut(namespace) {
            owner
                .sets
                .insert(name.to_string(), SetKind::Addresses(nets.clone()));
        }
    }

    pub(crate) fn register_list(&mut self, name: &str, selection: &NsSelection) {
        self.all
            .sets
            .entry(name.to_string())
            .or_insert_with(|| SetKind::Namespaces(selection.clone()));
    }

    /// Iterates over the registered NLTags.
    pub fn lists(&self) -> impl Iterator<Item = (&str, &NsSelection)> {
        self.all.sets.iter().filter_map(|(name, kind)| match kind {
            SetKind::Namespaces(sel) => Some((name.as_str(), sel)),
            _ => None,
        })
    }

    /// Iterates over the registered pod tags that may hold pods in `namespace`.
    pub fn pod_sets<'a>(
        &'a self,
        namespace: &'a Namespace,
    ) -> impl Iterator<Item = (&'a str, &'a PodSelection)> + 'a {
        namespace
            .sets
            .iter()
            .chain(self.all.sets.iter())
            .filter_map(move |(name, kind)| match kind {
                SetKind::Pods(sel) if sel.selects_namespace(&namespace.name, &namespace.labels) => {
                    Some((name.as_str(), sel))
                }
                _ => None,
            })
    }

    /// Iterates over the registered pod tags that span namespaces.
    pub fn cross_namespace_sets(&self) -> impl Iterator<Item = (&str, &PodSelection)> {
        self.all.sets.iter().filter_map(|(name, kind)| match kind {
            SetKind::Pods(sel) => Some((name.as_str(), sel)),
            _ => None,
        })
    }

    /// Returns the addresses of every pod a selection holds.
    pub fn pod_members(&self, selection: &PodSelection) -> BTreeSet<Ipv4Net> {
        self.by_name
            .values()
            .filter(|ns| selection.selects_namespace(&ns.name, &ns.labels))
            .flat_map(|ns| ns.pods.values())
            .filter(|pod| selection.labels.matches(&pod.labels))
            .filter_map(|pod| pod.addr)
            .collect()
    }

    /// Returns the names of the namespaces a selection lists.
    pub fn list_members(&self, selection: &NsSelection) -> Vec<String> {
        let mut names = self
            .by_name
            .values()
            .filter(|ns| selection.selects(&ns.labels))
            .map(|ns| ns.name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

// === impl Namespace ===

impl Namespace {
    pub(crate) fn new(name: impl Into<String>, labels: Labels) -> Self {
        Self {
            name: name.into(),
            labels,
            sets: HashMap::default(),
            pods: HashMap::default(),
            policies: HashMap::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub(crate) fn set_labels(&mut self, labels: Labels) {
        self.labels = labels;
    }

    /// The name of the tag holding every pod in this namespace.
    pub fn tag(&self) -> String {
        tag::namespace_tag(&self.name)
    }

    pub fn policy(&self, name: &str) -> Option<&NetworkPolicy> {
        self.policies.get(name)
    }

    pub fn policy_count(&self) -> usize {
        self.policies.len()
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    /// Iterates over the names of the tags registered against this namespace.
    pub fn set_names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }
}
