//! Compiles a `NetworkPolicy` into the tags, NLTags and rules that enforce it.
//!
//! Compilation is pure: it never consults the registry or the backend. Which addresses a tag holds
//! is described by the [`PodSelection`] or [`NsSelection`] recorded alongside each name and is
//! resolved when the tag is created on a port. IP-block tags are the exception: their members are
//! fixed when the policy is compiled.

use crate::selection::{NsSelection, PodSelection};
use netpol_agent_core::{cidr, tag, Direction, Error, Ipv4Net, PortRange, Protocol, Remote, Rule};
use netpol_agent_k8s_api::{
    IntOrString, LabelSelector, NetworkPolicy, NetworkPolicyPeer, NetworkPolicyPort, ResourceExt,
    Selector,
};
use std::collections::{BTreeMap, BTreeSet};

/// The primitives that enforce a policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Compiled {
    /// Tags that must exist before the rules are applied, by name.
    pub pod_tags: BTreeMap<String, PodSelection>,

    /// NLTags that must exist before the rules are applied, by name.
    pub ns_lists: BTreeMap<String, NsSelection>,

    /// Tags holding the networks of the policy's ipBlock peers, by name.
    pub ip_tags: BTreeMap<String, BTreeSet<Ipv4Net>>,

    pub rules: BTreeSet<Rule>,
}

/// Compiles a policy.
///
/// Identical policies always compile to identical output.
pub fn parse_policy(policy: &NetworkPolicy) -> Result<Compiled, Error> {
    let name = policy_ref(policy);
    let namespace = policy.namespace().unwrap_or_default();
    let policy_name = policy.name_any();
    let peers = Peers {
        policy: &name,
        namespace: &namespace,
        name: &policy_name,
    };
    let spec = policy.spec.clone().unwrap_or_default();

    let mut compiled = Compiled::default();
    let target_labels = selector(&name, Some(&spec.pod_selector))?;
    let target = compiled.pod_selection(PodSelection::in_namespace(&namespace, target_labels));

    let (ingress, egress) = effective_types(policy)?;
    if ingress {
        for rule in spec.ingress.iter().flatten() {
            let remotes = compiled.peers(peers, rule.from.as_deref())?;
            let ports = ports(&name, rule.ports.as_deref())?;
            compiled.allow(Direction::Ingress, &target, remotes, &ports);
        }
        compiled
            .rules
            .insert(Rule::deny_all(Direction::Ingress, &target));
    }
    if egress {
        for rule in spec.egress.iter().flatten() {
            let remotes = compiled.peers(peers, rule.to.as_deref())?;
            let ports = ports(&name, rule.ports.as_deref())?;
            compiled.allow(Direction::Egress, &target, remotes, &ports);
        }
        compiled
            .rules
            .insert(Rule::deny_all(Direction::Egress, &target));
    }

    Ok(compiled)
}

/// Returns the names of the tags that hold the pods a policy applies to.
///
/// Each label in the pod selector has its own tag; a selector with several labels also has a tag
/// for their intersection. An empty selector is represented by the namespace tag.
pub fn target_tags(policy: &NetworkPolicy) -> Result<Vec<String>, Error> {
    let namespace = policy.namespace().unwrap_or_default();
    let pod_selector = policy.spec.as_ref().map(|spec| &spec.pod_selector);
    let labels = selector(&policy_ref(policy), pod_selector)?;
    Ok(pod_tags(&namespace, &labels).collect())
}

/// Reports whether a policy explicitly lists the `Ingress` and `Egress` policy types.
pub fn policy_types(policy: &NetworkPolicy) -> (bool, bool) {
    let types = policy
        .spec
        .as_ref()
        .and_then(|spec| spec.policy_types.as_deref())
        .unwrap_or_default();
    (
        types.iter().any(|t| t == "Ingress"),
        types.iter().any(|t| t == "Egress"),
    )
}

/// Determines the directions a policy governs.
///
/// Without explicit policy types, a policy always governs ingress and governs egress only when it
/// has egress rules.
fn effective_types(policy: &NetworkPolicy) -> Result<(bool, bool), Error> {
    let spec = policy.spec.as_ref();
    let types = spec
        .and_then(|spec| spec.policy_types.as_deref())
        .unwrap_or_default();
    if types.is_empty() {
        let has_egress = spec
            .and_then(|spec| spec.egress.as_ref())
            .is_some_and(|rules| !rules.is_empty());
        return Ok((true, has_egress));
    }

    if let Some(unknown) = types.iter().find(|t| *t != "Ingress" && *t != "Egress") {
        return Err(Error::malformed(
            policy_ref(policy),
            format!("unknown policy type {unknown:?}"),
        ));
    }
    Ok(policy_types(policy))
}

fn policy_ref(policy: &NetworkPolicy) -> String {
    format!(
        "{}/{}",
        policy.namespace().unwrap_or_default(),
        policy.name_any()
    )
}

fn selector(policy: &str, selector: Option<&LabelSelector>) -> Result<Selector, Error> {
    Selector::from_optional(selector).map_err(|error| Error::malformed(policy, error))
}

/// Lists the per-label tags of a pod selector followed by its intersection tag.
fn pod_tags<'a>(namespace: &'a str, labels: &'a Selector) -> impl Iterator<Item = String> + 'a {
    let per_label = labels
        .iter()
        .map(move |(k, v)| tag::pod_label_tag(namespace, k, v));
    let intersection =
        (labels.as_map().len() != 1).then(|| tag::pod_selector_tag(namespace, labels.as_map()));
    per_label.chain(intersection)
}

fn ports(
    policy: &str,
    ports: Option<&[NetworkPolicyPort]>,
) -> Result<Vec<(Option<Protocol>, Option<PortRange>)>, Error> {
    let ports = ports.unwrap_or_default();
    if ports.is_empty() {
        return Ok(vec![(None, None)]);
    }

    ports
        .iter()
        .map(|port| {
            let protocol = match port.protocol.as_deref() {
                None | Some("TCP") => Protocol::Tcp,
                Some("UDP") => Protocol::Udp,
                Some("SCTP") => Protocol::Sctp,
                Some(other) => {
                    return Err(Error::malformed(
                        policy,
                        format!("unsupported protocol {other:?}"),
                    ))
                }
            };

            let start = match &port.port {
                None => {
                    if port.end_port.is_some() {
                        return Err(Error::malformed(policy, "endPort requires a port"));
                    }
                    return Ok((Some(protocol), None));
                }
                Some(IntOrString::Int(n)) => port_number(policy, *n)?,
                Some(IntOrString::String(s)) => match s.parse::<i32>() {
                    Ok(n) => port_number(policy, n)?,
                    Err(_) => {
                        return Err(Error::malformed(
                            policy,
                            format!("named port {s:?} is not supported"),
                        ))
                    }
                },
            };
            let end = match port.end_port {
                Some(end) => port_number(policy, end)?,
                None => start,
            };
            if end < start {
                return Err(Error::malformed(
                    policy,
                    format!("endPort {end} precedes port {start}"),
                ));
            }

            Ok((Some(protocol), Some(PortRange { start, end })))
        })
        .collect()
}

fn port_number(policy: &str, n: i32) -> Result<u16, Error> {
    u16::try_from(n)
        .ok()
        .filter(|n| *n != 0)
        .ok_or_else(|| Error::malformed(policy, format!("invalid port {n}")))
}

/// Identifies the policy whose peers are being compiled.
#[derive(Copy, Clone)]
struct Peers<'a> {
    /// `namespace/name`, for errors.
    policy: &'a str,
    namespace: &'a str,
    name: &'a str,
}

// === impl Compiled ===

impl Compiled {
    /// Records the tags for a pod selection and returns the name of the tag rules should use.
    fn pod_selection(&mut self, selection: PodSelection) -> String {
        if let Some(ns) = selection.home() {
            for (k, v) in selection.labels.iter() {
                let labels = Selector::from_iter(Some((k.to_string(), v.to_string())));
                self.pod_tags.insert(
                    tag::pod_label_tag(ns, k, v),
                    PodSelection::in_namespace(ns, labels),
                );
            }
        }
        let name = selection.tag();
        self.pod_tags.insert(name.clone(), selection);
        name
    }

    fn ns_selection(&mut self, selection: NsSelection) -> String {
        for (k, v) in selection.0.iter() {
            let labels = Selector::from_iter(Some((k.to_string(), v.to_string())));
            self.ns_lists
                .insert(tag::ns_label_list(k, v), NsSelection(labels));
        }
        let name = selection.tag();
        self.ns_lists.insert(name.clone(), selection);
        name
    }

    fn peers(
        &mut self,
        scope: Peers<'_>,
        peers: Option<&[NetworkPolicyPeer]>,
    ) -> Result<Vec<Remote>, Error> {
        let Peers {
            policy,
            namespace,
            name: policy_name,
        } = scope;
        let peers = peers.unwrap_or_default();
        if peers.is_empty() {
            return Ok(vec![Remote::Any]);
        }

        let mut remotes = Vec::new();
        for peer in peers {
            if let Some(block) = &peer.ip_block {
                if peer.pod_selector.is_some() || peer.namespace_selector.is_some() {
                    return Err(Error::malformed(
                        policy,
                        "ipBlock may not be combined with a selector",
                    ));
                }
                if block.cidr.is_empty() {
                    return Err(Error::malformed(policy, "ipBlock has an empty cidr"));
                }
                let except = block.except.as_deref().unwrap_or_default();
                let nets = cidr::resolve_block(&block.cidr, except)?;
                let name = tag::ip_block_tag(namespace, policy_name, self.ip_tags.len());
                self.ip_tags
                    .insert(name.clone(), nets.into_iter().collect());
                remotes.push(Remote::Tag(name));
                continue;
            }

            match (&peer.namespace_selector, &peer.pod_selector) {
                (None, None) => {
                    return Err(Error::malformed(policy, "peer selects nothing"));
                }
                (None, Some(pods)) => {
                    let labels = selector(policy, Some(pods))?;
                    let name = self.pod_selection(PodSelection::in_namespace(namespace, labels));
                    remotes.push(Remote::Tag(name));
                }
                (Some(nss), pods) => {
                    let nss = selector(policy, Some(nss))?;
                    let pods = selector(policy, pods.as_ref())?;
                    if pods.is_empty() {
                        let name = self.ns_selection(NsSelection(nss));
                        remotes.push(Remote::List(name));
                    } else {
                        let name =
                            self.pod_selection(PodSelection::across_namespaces(nss, pods));
                        remotes.push(Remote::Tag(name));
                    }
                }
            }
        }
        Ok(remotes)
    }

    fn allow(
        &mut self,
        direction: Direction,
        target: &str,
        remotes: Vec<Remote>,
        ports: &[(Option<Protocol>, Option<PortRange>)],
    ) {
        for remote in remotes {
            for (protocol, range) in ports {
                self.rules.insert(Rule::allow(
                    direction,
                    target,
                    remote.clone(),
                    *protocol,
                    *range,
                ));
            }
        }
    }
}
