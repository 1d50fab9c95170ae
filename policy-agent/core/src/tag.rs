//! Names of the address-set primitives programmed on each port.
//!
//! Kubernetes namespace names may not contain `:`, `/`, `=` or `&`, and label keys and values may
//! not contain `:`, `=` or `&`, so the names below never collide across kinds.

use std::collections::BTreeMap;

/// The NLTag listing every namespace tag.
pub const ALL_NAMESPACES: &str = "all-namespaces";

const NAMESPACE_PREFIX: &str = "ns:";
const POD_PREFIX: &str = "pod:";
const NS_LABEL_PREFIX: &str = "nslabel:";
const IP_BLOCK_PREFIX: &str = "ipblock:";

/// The tag holding the addresses of every pod in `namespace`.
pub fn namespace_tag(namespace: &str) -> String {
    format!("{NAMESPACE_PREFIX}{namespace}")
}

/// The NLTag listing the namespaces labeled `key=value`.
pub fn ns_label_list(key: &str, value: &str) -> String {
    format!("{NS_LABEL_PREFIX}{key}={value}")
}

/// The NLTag listing the namespaces that carry every label in `labels`.
///
/// An empty label set selects every namespace.
pub fn ns_selector_list(labels: &BTreeMap<String, String>) -> String {
    if labels.is_empty() {
        return ALL_NAMESPACES.to_string();
    }
    format!("{NS_LABEL_PREFIX}{}", join_labels(labels))
}

/// The tag holding the pods in `namespace` labeled `key=value`.
pub fn pod_label_tag(namespace: &str, key: &str, value: &str) -> String {
    format!("{POD_PREFIX}{namespace}/{key}={value}")
}

/// The tag holding the pods in `namespace` that carry every label in `labels`.
///
/// An empty label set selects every pod in the namespace.
pub fn pod_selector_tag(namespace: &str, labels: &BTreeMap<String, String>) -> String {
    if labels.is_empty() {
        return namespace_tag(namespace);
    }
    format!("{POD_PREFIX}{namespace}/{}", join_labels(labels))
}

/// The tag holding the pods that carry every label in `pod_labels` in any namespace carrying
/// every label in `ns_labels`.
pub fn cross_namespace_tag(
    ns_labels: &BTreeMap<String, String>,
    pod_labels: &BTreeMap<String, String>,
) -> String {
    let scope = if ns_labels.is_empty() {
        "*".to_string()
    } else {
        format!("[{}]", join_labels(ns_labels))
    };
    let pods = if pod_labels.is_empty() {
        "*".to_string()
    } else {
        join_labels(pod_labels)
    };
    format!("{POD_PREFIX}{scope}/{pods}")
}

/// The tag holding the addresses of the `index`th ipBlock peer of a policy.
///
/// Peers are counted across the policy's ingress rules and then its egress rules.
pub fn ip_block_tag(namespace: &str, policy: &str, index: usize) -> String {
    format!("{IP_BLOCK_PREFIX}{namespace}/{policy}/{index}")
}

/// Splits a single-label pod tag into its `(namespace, key, value)` parts.
pub fn parse_pod_label_tag(tag: &str) -> Option<(&str, &str, &str)> {
    let rest = tag.strip_prefix(POD_PREFIX)?;
    let (namespace, label) = rest.split_once('/')?;
    if namespace.starts_with('[') || namespace == "*" || label.contains('&') {
        return None;
    }
    let (key, value) = label.split_once('=')?;
    Some((namespace, key, value))
}

fn join_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}
