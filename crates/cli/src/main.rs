#![forbid(unsafe_code)]

use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_controller::inputs::Resolution;
use keel_controller::{
    new_redacted_cluster_machine_config_controller, Controller, ControllerConfig, DependencySet,
    DependencyVersionTracker, InputReconciler, InputsOutcome,
};
use keel_core::kinds::{ClusterMachineConfigSpec, ClusterMachineSpec, RedactedClusterMachineConfigSpec, LABEL_CLUSTER};
use keel_core::{Delta, ResourceKey};
use keel_kubehub::KubeStore;
use keel_redact::SecretFields;
use keel_store::get_opt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel machine config controllers, one shot")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the machine config pipeline (default: KEEL_NAMESPACE or "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the redacted form of a machine configuration file ("-" reads stdin)
    Redact { file: PathBuf },
    /// Stamp a machine's ClusterMachineConfig with the versions of its inputs
    ReconcileInputs {
        machine: String,
        /// Also track MachineConfigGenOptions
        #[arg(long = "with-gen-options", action = ArgAction::SetTrue)]
        with_gen_options: bool,
    },
    /// Sync the RedactedClusterMachineConfig of one ClusterMachineConfig
    Transform { config: String },
    /// Show the input stamp a machine's config would get, without writing it
    Stamp {
        machine: String,
        #[arg(long = "with-gen-options", action = ArgAction::SetTrue)]
        with_gen_options: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancelled on Ctrl-C so in-flight store calls stop without writing.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });
    cancel
}

fn read_input(file: &PathBuf) -> Result<Vec<u8>> {
    if file.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read(file).with_context(|| format!("reading {}", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut cfg = ControllerConfig::from_env();
    if let Some(ns) = cli.namespace.clone() {
        cfg.namespace = ns;
    }

    match cli.command {
        Commands::Redact { file } => {
            let data = read_input(&file)?;
            let out = keel_redact::redact(&data, &SecretFields::machine_config())?;
            match cli.output {
                Output::Human => print!("{out}"),
                Output::Json => println!("{}", serde_json::json!({ "data": out })),
            }
        }
        Commands::ReconcileInputs { machine, with_gen_options } => {
            let cancel = cancel_on_ctrl_c();
            let st = KubeStore::try_default().await?;
            let key = ResourceKey::of::<ClusterMachineSpec>(cfg.namespace.as_str(), machine.as_str());
            let Some(trigger) = get_opt::<ClusterMachineSpec>(&st, &cancel, &key).await? else {
                anyhow::bail!("{key} not found");
            };
            let rec = InputReconciler::from_config(&cfg).with_gen_options(cfg.with_gen_options || with_gen_options);
            let outcome = rec.reconcile_config_inputs(&st, &cancel, &trigger).await?;
            info!(machine = %machine, outcome = ?outcome, "reconcile-inputs done");
            print_outcome(cli.output, &machine, &outcome);
        }
        Commands::Transform { config } => {
            let cancel = cancel_on_ctrl_c();
            let st = KubeStore::try_default().await?;
            let ctrl = new_redacted_cluster_machine_config_controller().with_retry(cfg.retry);
            let key = ResourceKey::of::<ClusterMachineConfigSpec>(cfg.namespace.as_str(), config.as_str());
            match get_opt::<ClusterMachineConfigSpec>(&st, &cancel, &key).await? {
                // A tearing-down source is handled by the controller like a deleted one.
                Some(source) => ctrl.reconcile(&st, &cancel, &Delta::applied(source.to_raw()?)).await?,
                None => ctrl.on_source_deleted(&st, &cancel, &key).await?,
            }
            let target_key = ctrl.mapper().forward(&key);
            let target = get_opt::<RedactedClusterMachineConfigSpec>(&st, &cancel, &target_key).await?;
            match (cli.output, target) {
                (Output::Human, Some(t)) => println!("{} @ {}", t.key(), t.metadata.version),
                (Output::Human, None) => println!("{target_key} removed"),
                (Output::Json, t) => println!(
                    "{}",
                    serde_json::json!({
                        "key": target_key.to_string(),
                        "version": t.map(|t| t.metadata.version.get()),
                    })
                ),
            }
        }
        Commands::Stamp { machine, with_gen_options } => {
            let cancel = cancel_on_ctrl_c();
            let st = KubeStore::try_default().await?;
            let key = ResourceKey::of::<ClusterMachineSpec>(cfg.namespace.as_str(), machine.as_str());
            let Some(trigger) = get_opt::<ClusterMachineSpec>(&st, &cancel, &key).await? else {
                anyhow::bail!("{key} not found");
            };
            let Some(cluster) = trigger.metadata.label(LABEL_CLUSTER) else {
                anyhow::bail!("{key} has no {LABEL_CLUSTER} label");
            };
            let deps = DependencySet::for_cluster_machine(&cfg.namespace, cluster, &machine, cfg.with_gen_options || with_gen_options);
            match DependencyVersionTracker::resolve(&st, &cancel, &deps).await? {
                Resolution::Missing(missing) => println!("incomplete: {missing} missing"),
                Resolution::Complete(found) => {
                    let versions = DependencyVersionTracker::input_versions(&found);
                    let fingerprint = DependencyVersionTracker::fingerprint(&found);
                    match cli.output {
                        Output::Human => {
                            for (kind, version) in &versions {
                                println!("{kind} {version}");
                            }
                            println!("fingerprint {fingerprint}");
                        }
                        Output::Json => println!(
                            "{}",
                            serde_json::json!({ "inputVersions": versions, "fingerprint": fingerprint.to_hex() })
                        ),
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_outcome(output: Output, machine: &str, outcome: &InputsOutcome) {
    let (status, detail) = match outcome {
        InputsOutcome::SourceMissing => ("source-missing", String::new()),
        InputsOutcome::Unassigned => ("unassigned", String::new()),
        InputsOutcome::Deferred { missing } => ("deferred", missing.to_string()),
        InputsOutcome::Unchanged { fingerprint } => ("unchanged", fingerprint.to_hex()),
        InputsOutcome::Stamped { fingerprint, version } => ("stamped", format!("{fingerprint} @ {version}")),
    };
    match output {
        Output::Human if detail.is_empty() => println!("{machine}: {status}"),
        Output::Human => println!("{machine}: {status} ({detail})"),
        Output::Json => println!("{}", serde_json::json!({ "machine": machine, "status": status, "detail": detail })),
    }
}
