//! An in-memory backend.
//!
//! The backend holds the primitives programmed on a fixed set of ports. Clones share state, so a
//! clone retained by the caller observes everything programmed through the [`Fabric`].
//!
//! [`Fabric`]: crate::Fabric

use crate::{PortId, PortSource, Rule, RuleManager, TagManager};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{anyhow, bail, ensure, Result};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

#[derive(Clone, Debug, Default)]
pub struct Backend(Arc<Mutex<State>>);

#[derive(Debug, Default)]
struct State {
    ports: Vec<PortId>,
    by_port: HashMap<PortId, PortState>,

    /// Operations (by method name) that fail until cleared.
    failures: HashSet<&'static str>,

    /// Operations that fail on a single port until cleared.
    port_failures: HashSet<(&'static str, PortId)>,
}

#[derive(Debug, Default)]
struct PortState {
    tags: BTreeMap<String, BTreeSet<Ipv4Net>>,
    lists: BTreeMap<String, BTreeSet<String>>,
    rules: BTreeSet<Rule>,
}

// === impl Backend ===

impl Backend {
    pub fn new<P>(ports: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<PortId>,
    {
        let backend = Self::default();
        backend.set_ports(ports);
        backend
    }

    /// Replaces the set of active ports. State programmed on removed ports is retained.
    pub fn set_ports<P>(&self, ports: impl IntoIterator<Item = P>)
    where
        P: Into<PortId>,
    {
        self.0.lock().ports = ports.into_iter().map(Into::into).collect();
    }

    /// Causes every subsequent call to the named method (e.g. `"add"`, `"create_tag"`,
    /// `"ports"`) to fail.
    pub fn fail_on(&self, op: &'static str) {
        self.0.lock().failures.insert(op);
    }

    /// Like [`Backend::fail_on`], but only for calls on `port`.
    pub fn fail_on_port(&self, op: &'static str, port: impl Into<PortId>) {
        self.0.lock().port_failures.insert((op, port.into()));
    }

    pub fn clear_failures(&self) {
        let mut state = self.0.lock();
        state.failures.clear();
        state.port_failures.clear();
    }

    pub fn tags(&self, port: &PortId) -> Vec<String> {
        self.read(port, |state| state.tags.keys().cloned().collect())
    }

    pub fn tag_members(&self, port: &PortId, tag: &str) -> Option<BTreeSet<Ipv4Net>> {
        self.read(port, |state| state.tags.get(tag).cloned())
    }

    pub fn nl_tags(&self, port: &PortId) -> Vec<String> {
        self.read(port, |state| state.lists.keys().cloned().collect())
    }

    pub fn nl_tag_members(&self, port: &PortId, list: &str) -> Option<BTreeSet<String>> {
        self.read(port, |state| state.lists.get(list).cloned())
    }

    pub fn rules(&self, port: &PortId) -> Vec<Rule> {
        self.read(port, |state| state.rules.iter().cloned().collect())
    }

    fn read<T: Default>(&self, port: &PortId, f: impl FnOnce(&PortState) -> T) -> T {
        self.0.lock().by_port.get(port).map(f).unwrap_or_default()
    }

    fn write<T>(
        &self,
        op: &'static str,
        port: &PortId,
        f: impl FnOnce(&mut PortState) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.0.lock();
        if state.failures.contains(op) || state.port_failures.contains(&(op, port.clone())) {
            bail!("injected {op} failure");
        }
        ensure!(state.ports.contains(port), "unknown port {port}");
        f(state.by_port.entry(port.clone()).or_default())
    }
}

impl TagManager for Backend {
    fn create_tag(&mut self, port: &PortId, name: &str) -> Result<()> {
        self.write("create_tag", port, |state| {
            state.tags.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    fn delete_tag(&mut self, port: &PortId, name: &str) -> Result<()> {
        self.write("delete_tag", port, |state| {
            state.tags.remove(name);
            Ok(())
        })
    }

    fn add_to_tag(&mut self, port: &PortId, tag: &str, member: Ipv4Net) -> Result<()> {
        self.write("add_to_tag", port, |state| {
            state
                .tags
                .get_mut(tag)
                .ok_or_else(|| anyhow!("no such tag {tag}"))?
                .insert(member);
            Ok(())
        })
    }

    fn delete_from_tag(&mut self, port: &PortId, tag: &str, member: Ipv4Net) -> Result<()> {
        self.write("delete_from_tag", port, |state| {
            if let Some(members) = state.tags.get_mut(tag) {
                members.remove(&member);
            }
            Ok(())
        })
    }

    fn create_nl_tag(&mut self, port: &PortId, name: &str) -> Result<()> {
        self.write("create_nl_tag", port, |state| {
            state.lists.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    fn delete_nl_tag(&mut self, port: &PortId, name: &str) -> Result<()> {
        self.write("delete_nl_tag", port, |state| {
            state.lists.remove(name);
            Ok(())
        })
    }

    fn add_to_nl_tag(&mut self, port: &PortId, list: &str, member: &str) -> Result<()> {
        self.write("add_to_nl_tag", port, |state| {
            state
                .lists
                .get_mut(list)
                .ok_or_else(|| anyhow!("no such nltag {list}"))?
                .insert(member.to_string());
            Ok(())
        })
    }

    fn delete_from_nl_tag(&mut self, port: &PortId, list: &str, member: &str) -> Result<()> {
        self.write("delete_from_nl_tag", port, |state| {
            if let Some(members) = state.lists.get_mut(list) {
                members.remove(member);
            }
            Ok(())
        })
    }
}

impl RuleManager for Backend {
    fn add(&mut self, port: &PortId, rule: &Rule) -> Result<()> {
        self.write("add", port, |state| {
            ensure!(state.rules.insert(rule.clone()), "rule already exists: {rule}");
            Ok(())
        })
    }

    fn delete(&mut self, port: &PortId, rule: &Rule) -> Result<()> {
        self.write("delete", port, |state| {
            ensure!(state.rules.remove(rule), "no such rule: {rule}");
            Ok(())
        })
    }
}

impl PortSource for Backend {
    fn ports(&self) -> Result<Vec<PortId>> {
        let state = self.0.lock();
        if state.failures.contains("ports") {
            bail!("injected ports failure");
        }
        Ok(state.ports.clone())
    }
}
