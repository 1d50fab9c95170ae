//! The boundary with the firewall backend.
//!
//! A backend programs three kinds of primitives on each port: tags (flat address sets), NLTags
//! (named lists of tags and NLTags) and rules. The [`Fabric`] owns the single backend instance and
//! records what has been programmed on each port so that every mutation can be checked against
//! the primitives it depends on:
//!
//! ```text
//! [ Rule ] -> [ NLTag ] -> [ Tag ]
//!     \________________________^
//! ```
//!
//! A tag or NLTag must exist before a rule or NLTag refers to it, and it may not be deleted while
//! anything still refers to it.

use crate::{Error, Remote, Rule};
use ahash::AHashMap as HashMap;
use ipnet::Ipv4Net;
use std::{collections::BTreeSet, fmt};
use tracing::{debug, trace};

/// Identifies a network interface that carries its own copy of the compiled rule set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(String);

/// Programs tags and NLTags on a port.
///
/// Creating something that already exists and deleting something that is already absent must
/// succeed; errors are reserved for backend failures.
pub trait TagManager: Send + Sync {
    fn create_tag(&mut self, port: &PortId, name: &str) -> anyhow::Result<()>;

    fn delete_tag(&mut self, port: &PortId, name: &str) -> anyhow::Result<()>;

    fn add_to_tag(&mut self, port: &PortId, tag: &str, member: Ipv4Net) -> anyhow::Result<()>;

    fn delete_from_tag(&mut self, port: &PortId, tag: &str, member: Ipv4Net)
        -> anyhow::Result<()>;

    fn create_nl_tag(&mut self, port: &PortId, name: &str) -> anyhow::Result<()>;

    fn delete_nl_tag(&mut self, port: &PortId, name: &str) -> anyhow::Result<()>;

    fn add_to_nl_tag(&mut self, port: &PortId, list: &str, member: &str) -> anyhow::Result<()>;

    fn delete_from_nl_tag(&mut self, port: &PortId, list: &str, member: &str)
        -> anyhow::Result<()>;
}

/// Programs rules on a port.
pub trait RuleManager: Send + Sync {
    fn add(&mut self, port: &PortId, rule: &Rule) -> anyhow::Result<()>;

    fn delete(&mut self, port: &PortId, rule: &Rule) -> anyhow::Result<()>;
}

/// Enumerates the ports that must carry the rule set.
pub trait PortSource: Send + Sync {
    fn ports(&self) -> anyhow::Result<Vec<PortId>>;
}

/// Owns the backend and tracks what has been programmed on each port.
pub struct Fabric {
    tags: Box<dyn TagManager>,
    rules: Box<dyn RuleManager>,
    ports: Box<dyn PortSource>,
    state: HashMap<PortId, PortState>,
}

#[derive(Debug, Default)]
struct PortState {
    tags: HashMap<String, BTreeSet<Ipv4Net>>,
    lists: HashMap<String, BTreeSet<String>>,

    /// Identical rules may be produced by more than one policy, so each is programmed once and
    /// records the keys of the policies holding it.
    rules: HashMap<Rule, BTreeSet<String>>,
}

// === impl PortId ===

impl PortId {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PortId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for PortId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl Fabric ===

impl Fabric {
    pub fn new(
        tags: impl TagManager + 'static,
        rules: impl RuleManager + 'static,
        ports: impl PortSource + 'static,
    ) -> Self {
        Self {
            tags: Box::new(tags),
            rules: Box::new(rules),
            ports: Box::new(ports),
            state: HashMap::default(),
        }
    }

    /// Lists the ports that are currently active.
    pub fn ports(&self) -> Result<Vec<PortId>, Error> {
        self.ports
            .ports()
            .map_err(|error| Error::backend("list ports", None, error))
    }

    /// Creates a tag if it does not already exist on `port`.
    ///
    /// Returns true if the tag was created.
    pub fn ensure_tag(&mut self, port: &PortId, name: &str) -> Result<bool, Error> {
        let state = self.state.entry(port.clone()).or_default();
        if state.tags.contains_key(name) {
            return Ok(false);
        }

        self.tags
            .create_tag(port, name)
            .map_err(|error| Error::backend("create tag", Some(port), error))?;
        state.tags.insert(name.to_string(), BTreeSet::new());
        debug!(%port, tag = %name, "Created tag");
        Ok(true)
    }

    /// Deletes a tag once nothing refers to it.
    pub fn delete_tag(&mut self, port: &PortId, name: &str) -> Result<(), Error> {
        let Some(state) = self.state.get_mut(port) else {
            return Ok(());
        };
        if !state.tags.contains_key(name) {
            return Ok(());
        }
        state.check_unreferenced("tag", name)?;

        self.tags
            .delete_tag(port, name)
            .map_err(|error| Error::backend("delete tag", Some(port), error))?;
        state.tags.remove(name);
        debug!(%port, tag = %name, "Deleted tag");
        Ok(())
    }

    pub fn add_to_tag(&mut self, port: &PortId, tag: &str, member: Ipv4Net) -> Result<(), Error> {
        let members = self
            .state
            .get_mut(port)
            .and_then(|state| state.tags.get_mut(tag))
            .ok_or_else(|| Error::not_found("tag", tag))?;
        if members.contains(&member) {
            return Ok(());
        }

        self.tags
            .add_to_tag(port, tag, member)
            .map_err(|error| Error::backend("add to tag", Some(port), error))?;
        members.insert(member);
        trace!(%port, %tag, %member, "Added tag member");
        Ok(())
    }

    pub fn delete_from_tag(
        &mut self,
        port: &PortId,
        tag: &str,
        member: Ipv4Net,
    ) -> Result<(), Error> {
        let Some(members) = self
            .state
            .get_mut(port)
            .and_then(|state| state.tags.get_mut(tag))
        else {
            return Ok(());
        };
        if !members.contains(&member) {
            return Ok(());
        }

        self.tags
            .delete_from_tag(port, tag, member)
            .map_err(|error| Error::backend("delete from tag", Some(port), error))?;
        members.remove(&member);
        trace!(%port, %tag, %member, "Removed tag member");
        Ok(())
    }

    /// Creates an NLTag if it does not already exist on `port`.
    ///
    /// Returns true if the NLTag was created.
    pub fn ensure_nl_tag(&mut self, port: &PortId, name: &str) -> Result<bool, Error> {
        let state = self.state.entry(port.clone()).or_default();
        if state.lists.contains_key(name) {
            return Ok(false);
        }

        self.tags
            .create_nl_tag(port, name)
            .map_err(|error| Error::backend("create nltag", Some(port), error))?;
        state.lists.insert(name.to_string(), BTreeSet::new());
        debug!(%port, nltag = %name, "Created NLTag");
        Ok(true)
    }

    /// Deletes an NLTag once nothing refers to it.
    pub fn delete_nl_tag(&mut self, port: &PortId, name: &str) -> Result<(), Error> {
        let Some(state) = self.state.get_mut(port) else {
            return Ok(());
        };
        if !state.lists.contains_key(name) {
            return Ok(());
        }
        state.check_unreferenced("nltag", name)?;

        self.tags
            .delete_nl_tag(port, name)
            .map_err(|error| Error::backend("delete nltag", Some(port), error))?;
        state.lists.remove(name);
        debug!(%port, nltag = %name, "Deleted NLTag");
        Ok(())
    }

    /// Adds a tag or NLTag to an NLTag. Both must already exist on `port`.
    pub fn add_to_nl_tag(&mut self, port: &PortId, list: &str, member: &str) -> Result<(), Error> {
        let state = self
            .state
            .get_mut(port)
            .ok_or_else(|| Error::not_found("nltag", list))?;
        if !state.tags.contains_key(member) && !state.lists.contains_key(member) {
            return Err(Error::not_found("tag", member));
        }
        let members = state
            .lists
            .get_mut(list)
            .ok_or_else(|| Error::not_found("nltag", list))?;
        if members.contains(member) {
            return Ok(());
        }

        self.tags
            .add_to_nl_tag(port, list, member)
            .map_err(|error| Error::backend("add to nltag", Some(port), error))?;
        members.insert(member.to_string());
        debug!(%port, nltag = %list, %member, "Added NLTag member");
        Ok(())
    }

    pub fn delete_from_nl_tag(
        &mut self,
        port: &PortId,
        list: &str,
        member: &str,
    ) -> Result<(), Error> {
        let Some(members) = self
            .state
            .get_mut(port)
            .and_then(|state| state.lists.get_mut(list))
        else {
            return Ok(());
        };
        if !members.contains(member) {
            return Ok(());
        }

        self.tags
            .delete_from_nl_tag(port, list, member)
            .map_err(|error| Error::backend("delete from nltag", Some(port), error))?;
        members.remove(member);
        debug!(%port, nltag = %list, %member, "Removed NLTag member");
        Ok(())
    }

    /// Programs a rule on behalf of `holder`. Every tag and NLTag it refers to must already exist
    /// on `port`.
    ///
    /// The rule is programmed once, when its first holder adds it. Adding it again for the same
    /// holder has no effect.
    pub fn add_rule(&mut self, port: &PortId, holder: &str, rule: &Rule) -> Result<(), Error> {
        let state = self.state.entry(port.clone()).or_default();
        if !state.tags.contains_key(&rule.target) {
            return Err(Error::not_found("tag", &rule.target));
        }
        match &rule.remote {
            Remote::Tag(name) if !state.tags.contains_key(name) => {
                return Err(Error::not_found("tag", name));
            }
            Remote::List(name) if !state.lists.contains_key(name) => {
                return Err(Error::not_found("nltag", name));
            }
            _ => {}
        }

        if let Some(holders) = state.rules.get_mut(rule) {
            if holders.insert(holder.to_string()) {
                trace!(%port, %rule, %holder, refs = holders.len(), "Rule already programmed");
            }
            return Ok(());
        }

        self.rules
            .add(port, rule)
            .map_err(|error| Error::backend("add rule", Some(port), error))?;
        state
            .rules
            .insert(rule.clone(), BTreeSet::from([holder.to_string()]));
        debug!(%port, %rule, %holder, "Added rule");
        Ok(())
    }

    /// Releases `holder`'s hold on a rule. The rule is deleted from the backend when its last
    /// holder releases it.
    ///
    /// Rules that `holder` does not hold on `port` are ignored.
    pub fn delete_rule(&mut self, port: &PortId, holder: &str, rule: &Rule) -> Result<(), Error> {
        let Some(holders) = self
            .state
            .get_mut(port)
            .and_then(|state| state.rules.get_mut(rule))
            .filter(|holders| holders.contains(holder))
        else {
            debug!(%port, %rule, %holder, "Rule not held");
            return Ok(());
        };
        if holders.len() > 1 {
            holders.remove(holder);
            trace!(%port, %rule, %holder, refs = holders.len(), "Released rule");
            return Ok(());
        }

        self.rules
            .delete(port, rule)
            .map_err(|error| Error::backend("delete rule", Some(port), error))?;
        if let Some(state) = self.state.get_mut(port) {
            state.rules.remove(rule);
        }
        debug!(%port, %rule, %holder, "Deleted rule");
        Ok(())
    }

    pub fn has_tag(&self, port: &PortId, name: &str) -> bool {
        self.state
            .get(port)
            .is_some_and(|state| state.tags.contains_key(name))
    }

    pub fn has_nl_tag(&self, port: &PortId, name: &str) -> bool {
        self.state
            .get(port)
            .is_some_and(|state| state.lists.contains_key(name))
    }

    pub fn tag_members(&self, port: &PortId, name: &str) -> Option<&BTreeSet<Ipv4Net>> {
        self.state.get(port)?.tags.get(name)
    }

    pub fn nl_tag_members(&self, port: &PortId, name: &str) -> Option<&BTreeSet<String>> {
        self.state.get(port)?.lists.get(name)
    }

    /// Iterates over the rules programmed on `port`.
    pub fn rules(&self, port: &PortId) -> impl Iterator<Item = &Rule> + '_ {
        self.state
            .get(port)
            .into_iter()
            .flat_map(|state| state.rules.keys())
    }
}

// === impl PortState ===

impl PortState {
    fn check_unreferenced(&self, kind: &'static str, name: &str) -> Result<(), Error> {
        if let Some((list, _)) = self
            .lists
            .iter()
            .find(|(_, members)| members.contains(name))
        {
            return Err(Error::InUse {
                kind,
                name: name.to_string(),
                referrer: format!("nltag {list}"),
            });
        }

        if let Some(rule) = self.rules.keys().find(|rule| rule.refers_to(name)) {
            return Err(Error::InUse {
                kind,
                name: name.to_string(),
                referrer: format!("rule {rule}"),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory, Direction, PortRange, Protocol};

    fn fabric() -> (Fabric, memory::Backend, PortId) {
        let backend = memory::Backend::new(["eth0"]);
        let fabric = Fabric::new(backend.clone(), backend.clone(), backend.clone());
        (fabric, backend, PortId::from("eth0"))
    }

    fn allow_from(target: &str, remote: Remote) -> Rule {
        Rule::allow(
            Direction::Ingress,
            target,
            remote,
            Some(Protocol::Tcp),
            Some(PortRange::single(80)),
        )
    }

    #[test]
    fn creates_are_idempotent() {
        let (mut fabric, backend, port) = fabric();
        assert!(fabric.ensure_tag(&port, "ns:a").unwrap());
        assert!(!fabric.ensure_tag(&port, "ns:a").unwrap());
        assert!(fabric.ensure_nl_tag(&port, "all-namespaces").unwrap());
        assert!(!fabric.ensure_nl_tag(&port, "all-namespaces").unwrap());
        assert_eq!(backend.tags(&port), vec!["ns:a".to_string()]);
        assert_eq!(backend.nl_tags(&port), vec!["all-namespaces".to_string()]);
    }

    #[test]
    fn members_require_existing_primitives() {
        let (mut fabric, _, port) = fabric();
        let net = "10.0.0.1/32".parse().unwrap();
        assert!(fabric.add_to_tag(&port, "ns:a", net).unwrap_err().is_not_found());

        fabric.ensure_nl_tag(&port, "all-namespaces").unwrap();
        assert!(fabric
            .add_to_nl_tag(&port, "all-namespaces", "ns:a")
            .unwrap_err()
            .is_not_found());

        fabric.ensure_tag(&port, "ns:a").unwrap();
        fabric.add_to_tag(&port, "ns:a", net).unwrap();
        fabric.add_to_nl_tag(&port, "all-namespaces", "ns:a").unwrap();
        assert_eq!(
            fabric.nl_tag_members(&port, "all-namespaces").unwrap().len(),
            1
        );
        assert!(fabric.tag_members(&port, "ns:a").unwrap().contains(&net));
    }

    #[test]
    fn listed_tags_cannot_be_deleted() {
        let (mut fabric, backend, port) = fabric();
        fabric.ensure_tag(&port, "ns:a").unwrap();
        fabric.ensure_nl_tag(&port, "all-namespaces").unwrap();
        fabric.add_to_nl_tag(&port, "all-namespaces", "ns:a").unwrap();

        assert!(matches!(
            fabric.delete_tag(&port, "ns:a"),
            Err(Error::InUse { .. })
        ));
        assert_eq!(backend.tags(&port), vec!["ns:a".to_string()]);

        fabric
            .delete_from_nl_tag(&port, "all-namespaces", "ns:a")
            .unwrap();
        fabric.delete_tag(&port, "ns:a").unwrap();
        assert!(backend.tags(&port).is_empty());

        // Deleting an absent tag is not an error.
        fabric.delete_tag(&port, "ns:a").unwrap();
    }

    #[test]
    fn rules_require_referenced_tags() {
        let (mut fabric, _, port) = fabric();
        let rule = allow_from("ns:a", Remote::List("nslabel:team=a".to_string()));
        assert!(fabric.add_rule(&port, "a/p", &rule).unwrap_err().is_not_found());

        fabric.ensure_tag(&port, "ns:a").unwrap();
        assert!(fabric.add_rule(&port, "a/p", &rule).unwrap_err().is_not_found());

        fabric.ensure_nl_tag(&port, "nslabel:team=a").unwrap();
        fabric.add_rule(&port, "a/p", &rule).unwrap();

        assert!(matches!(
            fabric.delete_nl_tag(&port, "nslabel:team=a"),
            Err(Error::InUse { .. })
        ));
    }

    #[test]
    fn shared_rules_are_held() {
        let (mut fabric, backend, port) = fabric();
        fabric.ensure_tag(&port, "ns:a").unwrap();
        let rule = allow_from("ns:a", Remote::Any);

        fabric.add_rule(&port, "a/one", &rule).unwrap();
        fabric.add_rule(&port, "a/two", &rule).unwrap();
        assert_eq!(backend.rules(&port), vec![rule.clone()]);

        fabric.delete_rule(&port, "a/one", &rule).unwrap();
        assert_eq!(backend.rules(&port), vec![rule.clone()]);

        fabric.delete_rule(&port, "a/two", &rule).unwrap();
        assert!(backend.rules(&port).is_empty());
        assert_eq!(fabric.rules(&port).count(), 0);

        // Unknown rules are ignored.
        fabric.delete_rule(&port, "a/two", &rule).unwrap();
    }

    #[test]
    fn repeated_holds_are_idempotent() {
        let (mut fabric, backend, port) = fabric();
        fabric.ensure_tag(&port, "ns:a").unwrap();
        let rule = allow_from("ns:a", Remote::Any);

        // A holder that adds a rule twice releases it with a single delete.
        fabric.add_rule(&port, "a/one", &rule).unwrap();
        fabric.add_rule(&port, "a/one", &rule).unwrap();
        fabric.delete_rule(&port, "a/one", &rule).unwrap();
        assert!(backend.rules(&port).is_empty());

        // Releasing twice never removes another holder's rule.
        fabric.add_rule(&port, "a/one", &rule).unwrap();
        fabric.add_rule(&port, "a/two", &rule).unwrap();
        fabric.delete_rule(&port, "a/one", &rule).unwrap();
        fabric.delete_rule(&port, "a/one", &rule).unwrap();
        assert_eq!(backend.rules(&port), vec![rule.clone()]);

        fabric.delete_rule(&port, "a/two", &rule).unwrap();
        assert!(backend.rules(&port).is_empty());
    }

    #[test]
    fn failed_rule_deletes_keep_the_holder() {
        let (mut fabric, backend, port) = fabric();
        fabric.ensure_tag(&port, "ns:a").unwrap();
        let rule = allow_from("ns:a", Remote::Any);
        fabric.add_rule(&port, "a/one", &rule).unwrap();

        backend.fail_on("delete");
        assert!(matches!(
            fabric.delete_rule(&port, "a/one", &rule),
            Err(Error::BackendFailure { op: "delete rule", .. })
        ));
        assert_eq!(fabric.rules(&port).count(), 1);

        backend.clear_failures();
        fabric.delete_rule(&port, "a/one", &rule).unwrap();
        assert!(backend.rules(&port).is_empty());
    }

    #[test]
    fn backend_failures_leave_state_unchanged() {
        let (mut fabric, backend, port) = fabric();
        backend.fail_on("create_tag");
        let error = fabric.ensure_tag(&port, "ns:a").unwrap_err();
        assert!(matches!(error, Error::BackendFailure { op: "create tag", .. }));
        assert!(!fabric.has_tag(&port, "ns:a"));

        backend.clear_failures();
        assert!(fabric.ensure_tag(&port, "ns:a").unwrap());
    }
}
