use super::*;
use maplit::{btreemap, btreeset};

fn web_policy() -> k8s::NetworkPolicy {
    mk_policy(
        "ns-0",
        "web",
        btreemap! { "app" => "web", "tier" => "frontend" },
        vec!["Ingress"],
        vec![allow_ingress(
            vec![peer_ns(
                btreemap! { "team" => "a" },
                Some(btreemap! { "app" => "api" }),
            )],
            vec![port("TCP", 8080)],
        )],
        vec![],
    )
}

#[test]
fn pods_join_namespace_and_label_tags() {
    let mut test = TestConfig::default();
    test.manager.add_namespace(&mk_ns("ns-0", None)).unwrap();
    test.manager
        .add_pod(&mk_pod("ns-0", "pod-0", Some("10.0.0.1"), Some(("app", "web"))))
        .unwrap();
    assert_eq!(
        test.tag_members("ns:ns-0"),
        btreeset! { "10.0.0.1/32".to_string() }
    );

    // Tags created after the pod are populated from the registry.
    test.manager.add_network_policy(&web_policy()).unwrap();
    assert_eq!(
        test.tag_members("pod:ns-0/app=web"),
        btreeset! { "10.0.0.1/32".to_string() }
    );
    assert!(test.tag_members("pod:ns-0/tier=frontend").is_empty());
    assert!(test.tag_members("pod:ns-0/app=web&tier=frontend").is_empty());

    // Pods created after the tags are added to them.
    test.manager
        .add_pod(&mk_pod(
            "ns-0",
            "pod-1",
            Some("10.0.0.2"),
            vec![("app", "web"), ("tier", "frontend")],
        ))
        .unwrap();
    assert_eq!(
        test.tag_members("pod:ns-0/app=web"),
        btreeset! { "10.0.0.1/32".to_string(), "10.0.0.2/32".to_string() }
    );
    assert_eq!(
        test.tag_members("pod:ns-0/app=web&tier=frontend"),
        btreeset! { "10.0.0.2/32".to_string() }
    );
    assert_eq!(
        test.tag_members("ns:ns-0"),
        btreeset! { "10.0.0.1/32".to_string(), "10.0.0.2/32".to_string() }
    );
}

#[test]
fn pod_updates_move_addresses() {
    let mut test = TestConfig::default();
    test.manager.add_namespace(&mk_ns("ns-0", None)).unwrap();
    test.manager.add_network_policy(&web_policy()).unwrap();
    test.manager
        .add_pod(&mk_pod("ns-0", "pod-0", None, Some(("app", "web"))))
        .unwrap();
    assert!(test.tag_members("pod:ns-0/app=web").is_empty());

    // The pod is assigned an address.
    test.manager
        .update_pod(&mk_pod("ns-0", "pod-0", Some("10.0.0.1"), Some(("app", "web"))))
        .unwrap();
    assert_eq!(
        test.tag_members("pod:ns-0/app=web"),
        btreeset! { "10.0.0.1/32".to_string() }
    );

    // The pod is relabeled.
    test.manager
        .update_pod(&mk_pod("ns-0", "pod-0", Some("10.0.0.1"), Some(("app", "db"))))
        .unwrap();
    assert!(test.tag_members("pod:ns-0/app=web").is_empty());
    assert_eq!(
        test.tag_members("ns:ns-0"),
        btreeset! { "10.0.0.1/32".to_string() }
    );

    let mut pod = mk_pod("ns-0", "pod-0", None, None);
    pod.metadata.uid = None;
    test.manager.delete_pod(&pod).unwrap();
    assert!(test.tag_members("ns:ns-0").is_empty());
    assert_eq!(
        test.manager.namespaces().get("ns-0").unwrap().pod_count(),
        0
    );
}

#[test]
fn host_network_pods_are_not_members() {
    let mut test = TestConfig::default();
    test.manager.add_namespace(&mk_ns("ns-0", None)).unwrap();

    let mut pod = mk_pod("ns-0", "pod-0", Some("192.168.1.10"), None);
    if let Some(spec) = pod.spec.as_mut() {
        spec.host_network = Some(true);
    }
    test.manager.add_pod(&pod).unwrap();
    test.manager
        .add_pod(&mk_pod("ns-0", "pod-1", Some("fd00::1"), None))
        .unwrap();

    assert!(test.tag_members("ns:ns-0").is_empty());
    assert_eq!(
        test.manager.namespaces().get("ns-0").unwrap().pod_count(),
        2
    );
}

#[test]
fn reused_addresses_are_retained() {
    let mut test = TestConfig::default();
    test.manager.add_namespace(&mk_ns("ns-0", None)).unwrap();
    test.manager
        .add_pod(&mk_pod("ns-0", "old", Some("10.0.0.1"), None))
        .unwrap();
    test.manager
        .add_pod(&mk_pod("ns-0", "new", Some("10.0.0.1"), None))
        .unwrap();

    test.manager
        .delete_pod(&mk_pod("ns-0", "old", None, None))
        .unwrap();
    assert_eq!(
        test.tag_members("ns:ns-0"),
        btreeset! { "10.0.0.1/32".to_string() }
    );
}

#[test]
fn cross_namespace_tags_follow_namespace_labels() {
    let mut test = TestConfig::default();
    test.manager.add_namespace(&mk_ns("ns-0", None)).unwrap();
    test.manager.add_namespace(&mk_ns("ns-1", None)).unwrap();
    test.manager
        .add_pod(&mk_pod("ns-1", "api", Some("10.0.1.1"), Some(("app", "api"))))
        .unwrap();
    test.manager.add_network_policy(&web_policy()).unwrap();
    assert!(test.tag_members("pod:[team=a]/app=api").is_empty());

    test.manager
        .update_namespace(&mk_ns("ns-1", Some(("team", "a"))))
        .unwrap();
    assert_eq!(
        test.tag_members("pod:[team=a]/app=api"),
        btreeset! { "10.0.1.1/32".to_string() }
    );

    test.manager
        .update_namespace(&mk_ns("ns-1", Some(("team", "b"))))
        .unwrap();
    assert!(test.tag_members("pod:[team=a]/app=api").is_empty());
}

#[test]
fn pods_require_namespace() {
    let mut test = TestConfig::default();
    assert!(test
        .manager
        .add_pod(&mk_pod("ns-0", "pod-0", Some("10.0.0.1"), None))
        .unwrap_err()
        .is_not_found());
}
