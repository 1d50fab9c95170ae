use crate::PortId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An IP address or CIDR could not be parsed.
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    /// A policy could not be compiled into tags and rules.
    #[error("malformed policy {policy}: {reason}")]
    MalformedPolicy { policy: String, reason: String },

    /// A call into the tag manager, rule manager or port enumeration failed.
    #[error("{op} failed{}: {source}", on_port(.port))]
    BackendFailure {
        op: &'static str,
        port: Option<PortId>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// A tag or list cannot be removed while another primitive refers to it.
    #[error("{kind} {name} is still referenced by {referrer}")]
    InUse {
        kind: &'static str,
        name: String,
        referrer: String,
    },
}

impl Error {
    pub(crate) fn backend(op: &'static str, port: Option<&PortId>, error: anyhow::Error) -> Self {
        Self::BackendFailure {
            op,
            port: port.cloned(),
            source: error.into(),
        }
    }

    pub fn malformed(policy: impl ToString, reason: impl ToString) -> Self {
        Self::MalformedPolicy {
            policy: policy.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl ToString) -> Self {
        Self::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn on_port(port: &Option<PortId>) -> String {
    port.as_ref()
        .map(|port| format!(" on port {port}"))
        .unwrap_or_default()
}
