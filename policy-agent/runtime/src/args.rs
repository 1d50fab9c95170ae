use crate::{
    core::{memory, Fabric, PortId},
    index::{Index, IndexMetrics, NetworkPolicyManager},
    k8s,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "netpol-agent", about = "A node-local Kubernetes NetworkPolicy agent")]
pub struct Args {
    #[clap(long, default_value = "netpol=info,warn", env = "NETPOL_AGENT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Comma-separated names of the ports that carry the compiled rule set.
    #[clap(long, default_value = "eth0", env = "NETPOL_AGENT_PORTS")]
    ports: Ports,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            ports: Ports(ports),
        } = self;

        let mut prom = <Registry>::default();
        let metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Every port starts with an all-namespaces list before any resource is indexed.
        let backend = memory::Backend::new(ports);
        let mut manager =
            NetworkPolicyManager::new(Fabric::new(backend.clone(), backend.clone(), backend));
        for port in manager.fabric().ports()? {
            manager.init_all_ns_list(&port)?;
            info!(%port, "Initialized port");
        }
        let index = Index::shared(manager, metrics);

        // Spawn resource watches.

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces)
                .instrument(info_span!("namespaces")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")),
        );

        let policies = runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index, policies)
                .instrument(info_span!("networkpolicies")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Ports(Vec<PortId>);

impl std::str::FromStr for Ports {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let ports = s
            .split(',')
            .map(str::trim)
            .map(|name| {
                if name.is_empty() {
                    bail!("empty port name in {s:?}");
                }
                Ok(PortId::from(name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(ports))
    }
}
