use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use longhall_api::{
    ApiError, EntitlementProvider, ScaleRequest, ServerController, ServerRequest, ServerView, Settings, StaticPlans,
    Tenant, TenantId,
};
use longhall_kubehub::{EchoIngress, IngressSource, KubeCluster, StaticIngress};
use longhall_persist::SqliteStore;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "longhallctl", version, about = "Provision and manage per-tenant game servers")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace holding the servers (overrides LONGHALL_NAMESPACE)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Tenant the command acts for
    #[arg(long, global = true, env = "LONGHALL_TENANT")]
    tenant: Option<String>,

    /// Billing subscription used to look up plan limits
    #[arg(long, global = true, env = "LONGHALL_SUBSCRIPTION", default_value = "basic")]
    subscription: String,

    /// Skip the IP echo lookup and report this address instead
    #[arg(long = "ingress-ip", global = true)]
    ingress_ip: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a server from a request file (YAML or JSON, "-" for stdin)
    Create { file: String },
    /// Change the launch configuration of the running server
    Patch { file: String },
    /// Start (1) or stop (0) the server
    Scale {
        #[arg(long)]
        replicas: i32,
    },
    /// Remove the server, its storage and its record
    Delete,
    /// Print the stored server
    Show,
}

fn init_tracing() {
    let env = std::env::var("LONGHALL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LONGHALL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LONGHALL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Parse a request body. YAML is a superset of JSON, so one parser covers both.
fn parse_request(text: &str) -> Result<ServerRequest> { serde_yaml::from_str(text).context("parsing server request") }

fn read_request(path: &str) -> Result<ServerRequest> {
    let text = if path == "-" {
        std::io::read_to_string(std::io::stdin()).context("reading request from stdin")?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?
    };
    parse_request(&text)
}

fn render_view(v: &ServerView) {
    println!("TENANT          STATE        ADDRESS              CPU  MEM(Gi)  WORLD");
    println!(
        "{:<15} {:<12} {:<20} {:<4} {:<8} {}",
        v.server.tenant,
        v.server.state,
        format!("{}:{}", v.server.server_ip, v.server.port),
        v.server.cpu_requests,
        v.server.memory_requests,
        v.world.world,
    );
}

fn open_store(settings: &Settings) -> Result<SqliteStore> {
    match &settings.db_path {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_default(),
    }
}

async fn controller(cli: &Cli, settings: &Settings) -> Result<ServerController> {
    let mut manifests = settings.manifests.clone();
    if let Some(ns) = &cli.namespace {
        manifests.namespace = ns.clone();
    }
    let cluster = KubeCluster::try_default(&manifests.namespace, settings.call_timeout).await?;
    let ingress: Arc<dyn IngressSource> = match &cli.ingress_ip {
        Some(ip) => Arc::new(StaticIngress(ip.clone())),
        None => Arc::new(EchoIngress::new(settings.ingress_url.clone(), settings.call_timeout)?),
    };
    let store = open_store(settings)?;
    let plans: Arc<dyn EntitlementProvider> = match &settings.plans_path {
        Some(path) => Arc::new(StaticPlans::from_path(path)?),
        None => Arc::new(StaticPlans::builtin()),
    };
    Ok(ServerController::new(Arc::new(cluster), ingress, Arc::new(store), plans, manifests).with_settle(settings.settle))
}

fn report<T: serde::Serialize>(output: Output, res: Result<T, ApiError>, human: impl FnOnce(&T)) -> Result<()> {
    match (res, output) {
        (Ok(v), Output::Human) => human(&v),
        (Ok(v), Output::Json) => println!("{}", serde_json::to_string_pretty(&v)?),
        (Err(e), Output::Human) => {
            error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
        (Err(e), Output::Json) => {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "error": e }))?);
            std::process::exit(1);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = Settings::from_env();

    let raw_tenant = cli.tenant.clone().context("--tenant (or LONGHALL_TENANT) is required")?;
    let tenant = Tenant { id: TenantId::parse(&raw_tenant)?, subscription: cli.subscription.clone() };
    info!(tenant = %tenant.id, subscription = %tenant.subscription, command = ?cli.command, "longhallctl invoked");

    match &cli.command {
        Commands::Create { file } => {
            let req = read_request(file)?;
            let ctl = controller(&cli, &settings).await?;
            report(cli.output, ctl.create(&req, &tenant).await, render_view)
        }
        Commands::Patch { file } => {
            let req = read_request(file)?;
            let ctl = controller(&cli, &settings).await?;
            report(cli.output, ctl.patch(&req, &tenant).await, render_view)
        }
        Commands::Scale { replicas } => {
            let ctl = controller(&cli, &settings).await?;
            report(cli.output, ctl.scale(ScaleRequest { replicas: *replicas }, &tenant).await, render_view)
        }
        Commands::Delete => {
            let ctl = controller(&cli, &settings).await?;
            report(cli.output, ctl.delete(&tenant).await, |names: &Vec<String>| {
                for n in names {
                    println!("deleted {}", n);
                }
            })
        }
        // Reading the record needs no cluster connection.
        Commands::Show => {
            let store = open_store(&settings)?;
            report(cli.output, ServerView::lookup(&store, &tenant.id), render_view)
        }
    }
}
