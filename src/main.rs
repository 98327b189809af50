#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use auto_instrumentation_policy::{
    Actuator, ConfigMapLoader, ConfigMapRef, KubeOrchestrator,
};
use clap::Parser;
use tracing::{info_span, Instrument};

#[derive(Parser)]
#[clap(name = "auto-instrumentation-policy", version)]
struct Args {
    /// The tracing filter used for logs
    #[clap(
        long,
        env = "AUTO_INSTRUMENTATION_POLICY_LOG",
        default_value = "auto_instrumentation_policy=info,warn"
    )]
    log_level: kubert::LogFilter,

    /// The logging format
    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace of the policy ConfigMap
    #[clap(long, default_value = "default")]
    config_map_namespace: String,

    /// The name of the policy ConfigMap
    #[clap(long, default_value = "auto-instrumentation-config")]
    config_map_name: String,

    /// The ConfigMap data key holding the policy document
    #[clap(long, default_value = "config.yaml")]
    config_map_key: String,

    /// The namespace restarted when a criterion doesn't constrain `k8s_namespace`
    #[clap(long, default_value = "default")]
    default_namespace: String,

    /// The maximum number of concurrent restarts per criterion
    #[clap(long, default_value = "8")]
    max_concurrent_restarts: usize,

    /// Prints the committed policy at this interval whenever it changes
    #[clap(long)]
    dump_policy_interval: Option<humantime::Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        config_map_namespace,
        config_map_name,
        config_map_key,
        default_namespace,
        max_concurrent_restarts,
        dump_policy_interval,
    } = Args::parse();

    let rt = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;

    let actuator = Actuator::new(KubeOrchestrator::new(rt.client()), rt.shutdown_handle())
        .with_default_namespace(default_namespace)
        .with_max_concurrent(max_concurrent_restarts);
    let source = ConfigMapRef {
        namespace: config_map_namespace,
        name: config_map_name,
        key: config_map_key,
    };
    let config = ConfigMapLoader::new(rt.client(), source, actuator);

    if let Some(every) = dump_policy_interval {
        config.policy().dump(every.into());
    }

    let shutdown = rt.shutdown_handle();
    tokio::spawn(
        async move {
            if let Err(error) = auto_instrumentation_policy::run(config, shutdown).await {
                tracing::error!(%error, "policy reconciliation failed");
            }
        }
        .instrument(info_span!("policy")),
    );

    // Block the main thread on the shutdown signal. Once it fires, wait for
    // the background tasks to complete before exiting.
    if rt.run().await.is_err() {
        bail!("Aborted");
    }

    Ok(())
}
