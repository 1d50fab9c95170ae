#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use netpol_agent_core as core;
pub use netpol_agent_k8s_api as k8s;
pub use netpol_agent_k8s_index as index;

mod args;

pub use self::args::Args;
