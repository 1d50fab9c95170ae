//! Describes which namespaces or pods each registered tag and NLTag holds, so that membership can
//! be maintained as pods and namespaces change.

use netpol_agent_core::{tag, Ipv4Net};
use netpol_agent_k8s_api::{Labels, Selector};
use std::collections::BTreeSet;

/// The pods whose addresses a tag holds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodSelection {
    pub scope: PodScope,
    pub labels: Selector,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PodScope {
    /// Pods in a single namespace.
    Namespace(String),

    /// Pods in every namespace whose labels match.
    Namespaces(Selector),
}

/// The namespaces whose tags an NLTag lists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NsSelection(pub Selector);

/// What a registered tag or NLTag holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetKind {
    Pods(PodSelection),
    Namespaces(NsSelection),

    /// A fixed set of networks from a policy's ipBlock peer.
    Addresses(BTreeSet<Ipv4Net>),
}

// === impl PodSelection ===

impl PodSelection {
    /// Selects every pod in `namespace`.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            scope: PodScope::Namespace(namespace.into()),
            labels: Selector::default(),
        }
    }

    pub fn in_namespace(namespace: impl Into<String>, labels: Selector) -> Self {
        Self {
            scope: PodScope::Namespace(namespace.into()),
            labels,
        }
    }

    pub fn across_namespaces(namespaces: Selector, labels: Selector) -> Self {
        Self {
            scope: PodScope::Namespaces(namespaces),
            labels,
        }
    }

    pub fn tag(&self) -> String {
        match &self.scope {
            PodScope::Namespace(ns) => tag::pod_selector_tag(ns, self.labels.as_map()),
            PodScope::Namespaces(nss) => {
                tag::cross_namespace_tag(nss.as_map(), self.labels.as_map())
            }
        }
    }

    /// The namespace that owns this selection, if it is scoped to one.
    pub fn home(&self) -> Option<&str> {
        match &self.scope {
            PodScope::Namespace(ns) => Some(ns),
            PodScope::Namespaces(_) => None,
        }
    }

    pub fn selects_namespace(&self, namespace: &str, ns_labels: &Labels) -> bool {
        match &self.scope {
            PodScope::Namespace(ns) => ns == namespace,
            PodScope::Namespaces(nss) => nss.matches(ns_labels),
        }
    }

    pub fn selects(&self, namespace: &str, ns_labels: &Labels, pod_labels: &Labels) -> bool {
        self.selects_namespace(namespace, ns_labels) && self.labels.matches(pod_labels)
    }
}

// === impl NsSelection ===

impl NsSelection {
    pub fn tag(&self) -> String {
        tag::ns_selector_list(self.0.as_map())
    }

    #[inline]
    pub fn selects(&self, ns_labels: &Labels) -> bool {
        self.0.matches(ns_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags() {
        assert_eq!(PodSelection::namespace("default").tag(), "ns:default");
        assert_eq!(
            PodSelection::in_namespace("default", Selector::from_iter(Some(("app", "web")))).tag(),
            "pod:default/app=web"
        );
        assert_eq!(
            PodSelection::across_namespaces(
                Selector::from_iter(Some(("team", "a"))),
                Selector::from_iter(Some(("app", "web"))),
            )
            .tag(),
            "pod:[team=a]/app=web"
        );
        assert_eq!(NsSelection::default().tag(), tag::ALL_NAMESPACES);
    }

    #[test]
    fn selects() {
        let team_a = Labels::from_iter(Some(("team", "a")));
        let web = Labels::from_iter(vec![("app", "web"), ("tier", "frontend")]);

        let sel = PodSelection::in_namespace("default", Selector::from_iter(Some(("app", "web"))));
        assert!(sel.selects("default", &Labels::default(), &web));
        assert!(!sel.selects("other", &Labels::default(), &web));

        let sel = PodSelection::across_namespaces(
            Selector::from_iter(Some(("team", "a"))),
            Selector::from_iter(Some(("app", "web"))),
        );
        assert!(sel.selects("anywhere", &team_a, &web));
        assert!(!sel.selects("anywhere", &Labels::default(), &web));
        assert!(sel.home().is_none());

        assert!(NsSelection::default().selects(&Labels::default()));
        assert!(!NsSelection(Selector::from_iter(Some(("team", "b")))).selects(&team_a));
    }
}
