//! Network policy index
//!
//! The index compiles Kubernetes `NetworkPolicy` resources into the tags, NLTags and rules
//! programmed on each of the node's ports. It watches the following cluster resources:
//!
//! - Each `Namespace` has a tag holding the addresses of its pods and is listed in the
//!   all-namespaces NLTag and in an NLTag for each of its labels.
//! - Each `Pod` contributes its IPv4 address to the tags that select it: its namespace's tag,
//!   per-label tags, and the tags of policy selectors that match it.
//! - Each `NetworkPolicy` selects target pods in its namespace and admits traffic from (or to)
//!   pods, namespaces and IP blocks. It compiles to a set of allow rules and a catch-all deny
//!   rule for every direction it governs.
//!
//! ```text
//! [ NetworkPolicy ] -> [ Rule ] -> [ NLTag ] -> [ Tag ] <- [ Pod ]
//!                                      ^
//!                                [ Namespace ]
//! ```
//!
//! A tag must exist before anything refers to it, so a policy's tags and NLTags are created and
//! populated on each port before its rules are applied. Tags are not removed when the policies
//! that created them are deleted; they are removed with their namespace.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod index;
mod manager;
mod metrics;
pub mod namespace;
pub mod parse;
mod pod;
pub mod selection;


pub use self::{
    index::{Index, SharedIndex},
    manager::NetworkPolicyManager,
    metrics::IndexMetrics,
    namespace::{Namespace, NamespaceIndex},
    parse::{parse_policy, policy_types, target_tags, Compiled},
};
