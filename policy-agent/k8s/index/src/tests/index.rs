use super::*;
use crate::{Index, IndexMetrics};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use maplit::{btreemap, btreeset};

impl TestConfig {
    /// Builds an index over the test backend.
    fn index(&self) -> Index {
        let fabric = Fabric::new(
            self.backend.clone(),
            self.backend.clone(),
            self.backend.clone(),
        );
        Index::new(NetworkPolicyManager::new(fabric), IndexMetrics::default())
    }
}

fn policy() -> k8s::NetworkPolicy {
    mk_policy(
        "ns-0",
        "web",
        btreemap! { "app" => "web" },
        vec!["Ingress"],
        vec![allow_ingress(vec![], vec![port("TCP", 80)])],
        vec![],
    )
}

#[test]
fn resources_wait_for_their_namespace() {
    let test = TestConfig::default();
    let mut index = test.index();

    IndexNamespacedResource::apply(
        &mut index,
        mk_pod("ns-0", "pod-0", Some("10.0.0.1"), Some(("app", "web"))),
    );
    IndexNamespacedResource::apply(&mut index, policy());
    assert_eq!(index.pending("ns-0"), 2);
    assert!(test.rules().is_empty());

    IndexClusterResource::apply(&mut index, mk_ns("ns-0", None));
    assert_eq!(index.pending("ns-0"), 0);
    assert_eq!(
        test.tag_members("pod:ns-0/app=web"),
        btreeset! { "10.0.0.1/32".to_string() }
    );
    assert_eq!(test.rules().len(), 2);
}

#[test]
fn pending_resources_can_be_deleted() {
    let test = TestConfig::default();
    let mut index = test.index();

    IndexNamespacedResource::apply(&mut index, policy());
    IndexNamespacedResource::<k8s::NetworkPolicy>::delete(
        &mut index,
        "ns-0".to_string(),
        "web".to_string(),
    );
    assert_eq!(index.pending("ns-0"), 0);

    IndexClusterResource::apply(&mut index, mk_ns("ns-0", None));
    assert!(test.rules().is_empty());
}

#[test]
fn applies_update_policies() {
    let test = TestConfig::default();
    let mut index = test.index();
    IndexClusterResource::apply(&mut index, mk_ns("ns-0", None));
    IndexNamespacedResource::apply(&mut index, policy());

    let mut updated = policy();
    if let Some(spec) = updated.spec.as_mut() {
        spec.ingress = Some(vec![allow_ingress(vec![], vec![port("TCP", 443)])]);
    }
    IndexNamespacedResource::apply(&mut index, updated);
    assert_eq!(
        test.rules(),
        btreeset! {
            "Allow Ingress pod:ns-0/app=web from * Tcp:443 prio=1000".to_string(),
            "Deny Ingress pod:ns-0/app=web from * any prio=2000".to_string(),
        }
    );

    IndexNamespacedResource::<k8s::NetworkPolicy>::delete(
        &mut index,
        "ns-0".to_string(),
        "web".to_string(),
    );
    assert!(test.rules().is_empty());

    IndexClusterResource::<k8s::Namespace>::delete(&mut index, "ns-0".to_string());
    assert!(index.manager().namespaces().is_empty());
}

#[test]
fn failures_are_recorded() {
    let test = TestConfig::default();
    let mut index = test.index();
    IndexClusterResource::apply(&mut index, mk_ns("ns-0", None));

    test.backend.fail_on("add");
    IndexNamespacedResource::apply(&mut index, policy());
    assert_eq!(index.metrics().failures("networkpolicy", "apply"), 1);
    assert!(index
        .manager()
        .namespaces()
        .get("ns-0")
        .unwrap()
        .policy("web")
        .is_none());

    // Deleting a policy that was never applied is not a failure.
    test.backend.clear_failures();
    IndexNamespacedResource::<k8s::NetworkPolicy>::delete(
        &mut index,
        "ns-0".to_string(),
        "web".to_string(),
    );
    assert_eq!(index.metrics().failures("networkpolicy", "delete"), 0);
}
