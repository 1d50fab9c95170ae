use std::fmt;

/// Precedence of allow rules. Lower values are evaluated first.
pub const ALLOW_PRIORITY: u16 = 1000;

/// Precedence of the catch-all deny rule emitted for each direction a policy governs.
pub const DENY_PRIORITY: u16 = 2000;

/// A firewall rule programmed on a port.
///
/// Rules have no synthetic identity: two rules are the same rule if every field is equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rule {
    pub direction: Direction,

    /// The tag holding the addresses the policy applies to.
    pub target: String,

    /// The source (ingress) or destination (egress) the rule matches.
    pub remote: Remote,

    /// `None` matches every protocol.
    pub protocol: Option<Protocol>,

    /// `None` matches every port.
    pub ports: Option<PortRange>,

    pub action: Action,
    pub priority: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Remote {
    /// Matches every address.
    Any,

    /// Matches the members of a tag.
    Tag(String),

    /// Matches the members of every tag an NLTag lists, transitively.
    List(String),
}

/// An inclusive range of port numbers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

// === impl Rule ===

impl Rule {
    pub fn allow(
        direction: Direction,
        target: impl Into<String>,
        remote: Remote,
        protocol: Option<Protocol>,
        ports: Option<PortRange>,
    ) -> Self {
        Self {
            direction,
            target: target.into(),
            remote,
            protocol,
            ports,
            action: Action::Allow,
            priority: ALLOW_PRIORITY,
        }
    }

    /// Denies all traffic in `direction` for `target` that no allow rule admits.
    pub fn deny_all(direction: Direction, target: impl Into<String>) -> Self {
        Self {
            direction,
            target: target.into(),
            remote: Remote::Any,
            protocol: None,
            ports: None,
            action: Action::Deny,
            priority: DENY_PRIORITY,
        }
    }

    /// Returns true if this rule refers to the tag or NLTag `name`.
    pub fn refers_to(&self, name: &str) -> bool {
        self.target == name
            || matches!(&self.remote, Remote::Tag(n) | Remote::List(n) if n == name)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} {} {} {} ",
            self.action,
            self.direction,
            self.target,
            match self.direction {
                Direction::Ingress => "from",
                Direction::Egress => "to",
            },
            self.remote,
        )?;
        match self.protocol {
            Some(proto) => write!(f, "{proto:?}")?,
            None => f.write_str("any")?,
        }
        if let Some(ports) = self.ports {
            write!(f, ":{ports}")?;
        }
        write!(f, " prio={}", self.priority)
    }
}

// === impl Remote ===

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Tag(name) => write!(f, "tag({name})"),
            Self::List(name) => write!(f, "list({name})"),
        }
    }
}

// === impl PortRange ===

impl PortRange {
    #[inline]
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    #[inline]
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}
