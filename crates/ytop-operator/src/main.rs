//! ytop - Kubernetes operator for Ytsaurus clusters

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use ytop_common::crd::Ytsaurus;
use ytop_common::telemetry::{init_telemetry, TelemetryConfig};
use ytop_common::FIELD_MANAGER;
use ytop_operator::controller::{Context, ControllerConfig};
use ytop_operator::controller_runner::build_controllers;

/// ytop - drives Ytsaurus clusters toward their declared spec
#[derive(Parser, Debug)]
#[command(name = "ytop", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(ControllerArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Compute and report statuses without writing owned objects
    #[arg(long, env = "YTOP_DRY_RUN")]
    dry_run: bool,

    /// Only watch Ytsaurus resources in this namespace
    #[arg(long, env = "YTOP_NAMESPACE")]
    namespace: Option<String>,

    /// Requeue interval (seconds) of a running cluster with every component ready
    #[arg(long, env = "YTOP_REQUEUE_READY_SECS", default_value_t = 60)]
    requeue_ready_secs: u64,

    /// Requeue interval (seconds) while a cluster is converging
    #[arg(long, env = "YTOP_REQUEUE_PROGRESS_SECS", default_value_t = 5)]
    requeue_progress_secs: u64,

    /// Requeue interval (seconds) after a retryable error
    #[arg(long, env = "YTOP_REQUEUE_ERROR_SECS", default_value_t = 30)]
    requeue_error_secs: u64,

    /// Upper bound (seconds) on one reconciliation tick
    #[arg(long, env = "YTOP_TICK_TIMEOUT_SECS", default_value_t = 120)]
    tick_timeout_secs: u64,

    /// Do not install the Ytsaurus CRD on startup
    #[arg(long, env = "YTOP_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,
}

impl ControllerArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            dry_run: self.dry_run,
            requeue_ready: Duration::from_secs(self.requeue_ready_secs),
            requeue_progress: Duration::from_secs(self.requeue_progress_secs),
            requeue_error: Duration::from_secs(self.requeue_error_secs),
            tick_timeout: Duration::from_secs(self.tick_timeout_secs),
        }
    }

    /// Arguments of a bare `ytop` invocation, still honoring env overrides
    fn from_env() -> Self {
        #[derive(Parser)]
        struct Bare {
            #[command(flatten)]
            args: ControllerArgs,
        }
        Bare::parse_from(["ytop"]).args
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Ytsaurus::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::from_env()).await,
    }
}

/// Install the Ytsaurus CRD with server-side apply
///
/// This keeps the CRD version in lockstep with the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Ytsaurus CRD...");
    crds.patch(
        "ytsaurus.cluster.ytsaurus.tech",
        &params,
        &Patch::Apply(&Ytsaurus::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Ytsaurus CRD: {}", e))?;
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(dry_run = args.dry_run, "ytop controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !args.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let ctx = Arc::new(Context::new(client.clone(), args.controller_config()));
    let controllers = build_controllers(client, ctx, args.namespace.as_deref());
    futures::future::join_all(controllers).await;

    tracing::info!("ytop controller shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn controller_flags_map_to_config() {
        let cli = Cli::parse_from([
            "ytop",
            "controller",
            "--dry-run",
            "--namespace",
            "yt",
            "--requeue-progress-secs",
            "2",
        ]);
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        assert_eq!(args.namespace.as_deref(), Some("yt"));
        let config = args.controller_config();
        assert!(config.dry_run);
        assert_eq!(config.requeue_progress, Duration::from_secs(2));
        assert_eq!(config.requeue_ready, Duration::from_secs(60));
    }

    #[test]
    fn crd_is_namespaced_under_ytsaurus_group() {
        let crd = Ytsaurus::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("ytsaurus.cluster.ytsaurus.tech")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
