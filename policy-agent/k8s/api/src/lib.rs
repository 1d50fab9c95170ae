#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::{Labels, Selector, UnsupportedSelector};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Namespace, Pod, PodIP, PodSpec, PodStatus},
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
            NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
        util::intstr::IntOrString,
    },
};
pub use kube::api::{ObjectMeta, ResourceExt};
