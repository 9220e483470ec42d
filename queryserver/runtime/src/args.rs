use crate::{k8s, summary::SummaryGauges};
use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::api::{
    core::v1::{Namespace, Node, Pod, ServiceAccount},
    networking::v1::NetworkPolicy,
};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use queryserver_index::{IndexMetrics, QueryServer};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "queryserver", about = "Answers questions about network policies")]
pub struct Args {
    #[clap(long, default_value = "queryserver=info,warn", env = "QUERYSERVER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Queries that have not completed within this timeout fail.
    #[clap(long, default_value = "10000")]
    query_timeout_ms: u64,

    /// How often the exported summary gauges are recomputed.
    #[clap(long, default_value = "30")]
    summary_refresh_secs: u64,

    /// Disables indexing of Kubernetes NetworkPolicy resources.
    #[clap(long)]
    network_policies_disabled: bool,
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
            query_timeout_ms,
            summary_refresh_secs,
            network_policies_disabled,
        } = self;

        let mut prom = <Registry>::default();
        let index_metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"));
        let summary_gauges = SummaryGauges::register(&mut prom);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // No time series source is configured, so historical summaries are unavailable.
        let server = QueryServer::spawn(index_metrics, None);
        let index = k8s::Index::shared(server.clone());

        // Spawn resource watches.

        let namespaces = runtime.watch_all::<Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        let service_accounts = runtime.watch_all::<ServiceAccount>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), service_accounts)
                .instrument(info_span!("serviceaccounts")),
        );

        let nodes = runtime.watch_all::<Node>(watcher::Config::default());
        tokio::spawn(kubert::index::cluster(index.clone(), nodes).instrument(info_span!("nodes")));

        let pods = runtime.watch_all::<Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        if network_policies_disabled {
            info!("NetworkPolicy indexing disabled");
        } else {
            let network_policies = runtime.watch_all::<NetworkPolicy>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(index, network_policies)
                    .instrument(info_span!("networkpolicies")),
            );
        }

        tokio::spawn(
            summary_gauges
                .refresh(
                    server,
                    Duration::from_secs(summary_refresh_secs),
                    Duration::from_millis(query_timeout_ms),
                )
                .instrument(info_span!("summary")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
