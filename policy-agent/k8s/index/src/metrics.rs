use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    applies: Family<KindLabels, Counter>,
    deletes: Family<KindLabels, Counter>,
    failures: Family<OpLabels, Counter>,
    namespaces: Gauge,
    policies: Gauge,
    pending: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OpLabels {
    kind: String,
    op: String,
}

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "applies",
            "Count of resource applies",
            metrics.applies.clone(),
        );
        prom.register(
            "deletes",
            "Count of resource deletes",
            metrics.deletes.clone(),
        );
        prom.register(
            "failures",
            "Count of resource updates that could not be applied to the backend",
            metrics.failures.clone(),
        );
        prom.register(
            "namespaces",
            "Gauge of the number of registered namespaces",
            metrics.namespaces.clone(),
        );
        prom.register(
            "policies",
            "Gauge of the number of applied network policies",
            metrics.policies.clone(),
        );
        prom.register(
            "pending",
            "Gauge of the number of resources waiting for their namespace",
            metrics.pending.clone(),
        );
        metrics
    }

    pub(crate) fn apply(&self, kind: &str) {
        self.applies
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub(crate) fn delete(&self, kind: &str) {
        self.deletes
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub(crate) fn failure(&self, kind: &str, op: &str) {
        self.failures
            .get_or_create(&OpLabels {
                kind: kind.to_string(),
                op: op.to_string(),
            })
            .inc();
    }

    pub(crate) fn set_sizes(&self, namespaces: usize, policies: usize, pending: usize) {
        self.namespaces.set(namespaces as i64);
        self.policies.set(policies as i64);
        self.pending.set(pending as i64);
    }

    #[cfg(test)]
    pub(crate) fn failures(&self, kind: &str, op: &str) -> u64 {
        self.failures
            .get_or_create(&OpLabels {
                kind: kind.to_string(),
                op: op.to_string(),
            })
            .get()
    }
}
