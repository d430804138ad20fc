use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use converge_await::{AwaitError, AwaitRequest, Engine, EngineSettings, Registry};
use converge_core::{gvk_key, gvk_of, parse_gvk_key, DEFAULT_NAMESPACE};
use converge_kubehub::{ClientSet, KubeClientSet};
use kube::core::{DynamicObject, GroupVersionKind, ObjectMeta, TypeMeta};
use kube::ResourceExt;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "convergectl", version, about = "Wait for cluster changes to converge")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Phase {
    Create,
    Update,
    Read,
    Delete,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List kinds with built-in await semantics
    Kinds,
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Wait for an object to converge
    Wait {
        /// GVK key, e.g. "apps/v1/Deployment"
        gvk: Option<String>,
        /// Object name
        name: Option<String>,
        /// Read the target from a manifest instead
        #[arg(short = 'f', long = "filename", conflicts_with_all = ["gvk", "name"])]
        file: Option<std::path::PathBuf>,
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Which operation to wait for
        #[arg(long = "for", value_enum, default_value_t = Phase::Create)]
        phase: Phase,
        /// Timeout in seconds; the kind's default when absent
        #[arg(long = "timeout")]
        timeout: Option<u64>,
    },
}

#[derive(Debug, Serialize)]
struct KindRow {
    gvk: String,
    create: bool,
    update: bool,
    read: bool,
    delete: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    gvk: String,
    namespace: String,
    name: String,
    phase: String,
    ok: bool,
    elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sub_errors: Vec<String>,
}

fn init_tracing() {
    let env = std::env::var("CONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Bare object carrying only identity, for targets that no longer exist.
fn stub(gvk: &GroupVersionKind, name: &str, namespace: &str) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: converge_core::api_version(gvk), kind: gvk.kind.clone() }),
        metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), ..Default::default() },
        data: serde_json::Value::Object(Default::default()),
    }
}

/// `--ns` only fills in what the manifest leaves unset.
fn default_namespace(mut obj: DynamicObject, namespace: Option<&str>) -> DynamicObject {
    if obj.metadata.namespace.as_deref().unwrap_or("").is_empty() {
        if let Some(ns) = namespace {
            obj.metadata.namespace = Some(ns.to_string());
        }
    }
    obj
}

fn load_manifest(path: &std::path::Path) -> Result<DynamicObject> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let obj: DynamicObject = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    gvk_of(&obj).map_err(|e| anyhow!("{}: {}", path.display(), e))?;
    Ok(obj)
}

/// Submitted object plus its live counterpart, when there is one.
async fn target(
    clients: &KubeClientSet,
    inputs: DynamicObject,
    phase: Phase,
) -> Result<(DynamicObject, DynamicObject)> {
    let gvk = gvk_of(&inputs)?;
    let ns = inputs.namespace().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let client = clients.resource_client(&gvk, Some(&ns)).await?;
    match client.get(&inputs.name_any()).await {
        Ok(live) => Ok((inputs, live)),
        Err(e) if e.is_not_found() && phase == Phase::Delete => Ok((inputs.clone(), inputs)),
        Err(e) => Err(e.into()),
    }
}

fn print_report(output: Output, report: &Report) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Human => {
            let status = if report.ok { "converged" } else { "not converged" };
            println!(
                "{} {}/{} • {} • {} ({} ms)",
                report.gvk, report.namespace, report.name, report.phase, status, report.elapsed_ms
            );
            if let Some(e) = &report.error {
                println!("  {}", e);
            }
            for s in &report.sub_errors {
                println!("    * {}", s);
            }
        }
    }
    Ok(())
}

async fn wait(engine: &Engine, clients: &KubeClientSet, inputs: DynamicObject, phase: Phase, timeout: Option<u64>) -> Result<Report> {
    let gvk = gvk_of(&inputs)?;
    let (inputs, live) = target(clients, inputs, phase).await?;
    let cancel = CancellationToken::new();
    let mut req = AwaitRequest::new(live.clone()).with_inputs(inputs).with_cancel(cancel.clone());
    if let Some(secs) = timeout {
        req = req.with_timeout(Duration::from_secs(secs));
    }

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; cancelling await");
                cancel.cancel();
            }
        }
    });

    let started = Instant::now();
    let res: Result<(), AwaitError> = match phase {
        Phase::Create => engine.creation(req).await.map(drop),
        Phase::Update => engine.update(req, live.clone(), live.clone()).await.map(drop),
        Phase::Read => engine.read(req).await.map(drop),
        Phase::Delete => engine.deletion(req).await,
    };
    let (error, sub_errors) = match &res {
        Ok(()) => (None, Vec::new()),
        Err(e) => (Some(e.to_string()), e.sub_errors().to_vec()),
    };
    Ok(Report {
        gvk: gvk_key(&gvk),
        namespace: live.namespace().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
        name: live.name_any(),
        phase: format!("{:?}", phase).to_lowercase(),
        ok: res.is_ok(),
        elapsed_ms: started.elapsed().as_millis(),
        error,
        sub_errors,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let registry = Registry::builtin();

    match cli.command {
        Commands::Kinds => {
            let rows: Vec<KindRow> = registry
                .kinds()
                .into_iter()
                .map(|(gvk, spec)| {
                    let [create, update, read, delete] = spec.slots();
                    KindRow { gvk: gvk_key(&gvk), create, update, read, delete }
                })
                .collect();
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                Output::Human => {
                    let flag = |b: bool, c: char| if b { c } else { '-' };
                    for r in rows {
                        println!(
                            "{}{}{}{} {}",
                            flag(r.create, 'c'),
                            flag(r.update, 'u'),
                            flag(r.read, 'r'),
                            flag(r.delete, 'd'),
                            r.gvk
                        );
                    }
                }
            }
        }
        Commands::Discover => {
            let clients = KubeClientSet::try_default().await?;
            let resources = clients.discover().await?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let known = if registry.lookup(&GroupVersionKind::gvk(&r.group, &r.version, &r.kind)).is_some() {
                            "await"
                        } else {
                            "-"
                        };
                        println!("{} • {} • {}", r.gvk_key(), scope, known);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Wait { gvk, name, file, namespace, phase, timeout } => {
            let inputs = match (file, gvk, name) {
                (Some(path), _, _) => default_namespace(load_manifest(&path)?, namespace.as_deref()),
                (None, Some(gvk), Some(name)) => {
                    let gvk = parse_gvk_key(&gvk)?;
                    stub(&gvk, &name, namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE))
                }
                _ => return Err(anyhow!("wait needs either <gvk> <name> or -f <manifest>")),
            };
            info!(gvk = ?gvk_of(&inputs).ok().map(|g| gvk_key(&g)), name = %inputs.name_any(), ?phase, "wait invoked");
            let clients = Arc::new(KubeClientSet::try_default().await?);
            let engine = Engine::new(registry, clients.clone()).with_settings(EngineSettings::from_env());
            let report = wait(&engine, &clients, inputs, phase, timeout).await?;
            print_report(cli.output, &report)?;
            if !report.ok {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(metadata: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": metadata}))
            .expect("valid object")
    }

    #[test]
    fn ns_flag_fills_missing_manifest_namespace() {
        let obj = default_namespace(manifest(json!({"name": "web"})), Some("staging"));
        assert_eq!(obj.namespace().as_deref(), Some("staging"));
    }

    #[test]
    fn manifest_namespace_wins_over_ns_flag() {
        let obj = default_namespace(manifest(json!({"name": "web", "namespace": "prod"})), Some("staging"));
        assert_eq!(obj.namespace().as_deref(), Some("prod"));
        let obj = default_namespace(manifest(json!({"name": "web"})), None);
        assert_eq!(obj.namespace(), None);
    }

    #[test]
    fn stub_carries_identity_only() {
        let gvk = parse_gvk_key("apps/v1/Deployment").expect("gvk");
        let obj = stub(&gvk, "web", "prod");
        assert_eq!(gvk_of(&obj).expect("gvk"), gvk);
        assert_eq!(obj.name_any(), "web");
        assert_eq!(obj.namespace().as_deref(), Some("prod"));
    }
}
