#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cidr;
mod error;
mod fabric;
pub mod memory;
mod rule;
pub mod tag;

pub use self::{
    error::Error,
    fabric::{Fabric, PortId, PortSource, RuleManager, TagManager},
    rule::{Action, Direction, PortRange, Protocol, Remote, Rule, ALLOW_PRIORITY, DENY_PRIORITY},
};
pub use ipnet::Ipv4Net;
