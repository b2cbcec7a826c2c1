//! `gh-ci-broker`: the autoscaling CI runner broker's single binary,
//! with one subcommand per component that needs a process to live in —
//! `run` fronts the webhook ingress, `hostctl` is the per-host
//! scheduler, `wait-for-job` is the in-VM job-lease bootstrap. Follows
//! the familiar `Opt`/`main`/`run` split for a multi-role daemon
//! binary, trimmed of the Lua policy engine and privilege-dropping
//! this system has no use for (the webhook server and host scheduler
//! are not expected to bind privileged ports or run as root).

use anyhow::Context;
use ci_broker_billing::{BillingCache, BillingLookup, StubBillingLookup};
use ci_broker_classify::{router, AppState};
use ci_broker_host::HostScheduler;
use ci_broker_lifecycle::LifeCycle;
use ci_broker_logging::{DiagnosticFormat, LoggingConfig};
use ci_broker_provider::NullProvider;
use ci_broker_queue::{NatsConfig, WorkQueue};
use ci_broker_secrets::KeySource;
use ci_broker_slots::SlotPool;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// How long `wait-for-job` sleeps between empty lease attempts.
const WAIT_FOR_JOB_POLL: Duration = Duration::from_secs(10);

/// Autoscaling broker for self-hosted CI runners: webhook ingress,
/// durable work queue wiring, and the per-host microVM scheduler.
#[derive(Debug, Parser)]
#[command(about, version = version_info::broker_version())]
struct Opt {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the webhook ingress HTTP server.
    Run(RunOpts),
    /// Run the per-host scheduler that pulls queued jobs and drains
    /// completions for this host.
    Hostctl(HostctlOpts),
    /// Claim exactly one queued job for this host and exit; used by the
    /// in-VM runner bootstrap before it registers with the upstream
    /// service.
    WaitForJob(WaitForJobOpts),
}

#[derive(Debug, Parser)]
struct MessagingOpts {
    /// NATS server address(es); may be repeated.
    #[arg(long = "nats-server", default_value = "127.0.0.1:4222")]
    nats_servers: Vec<String>,

    /// Subject/stream name prefix; the two streams this process manages
    /// are named `<prefix>queued` and `<prefix>completed`.
    #[arg(long, default_value = "ghactions.")]
    stream_prefix: String,
}

impl MessagingOpts {
    async fn connect(&self) -> anyhow::Result<Arc<dyn WorkQueue>> {
        let queue = NatsConfig::from_env(self.nats_servers.clone())
            .connect()
            .await
            .context("connecting to NATS")?;
        Ok(Arc::new(queue))
    }
}

#[derive(Debug, Parser)]
struct DiagnosticOpts {
    /// Directory where diagnostic log files will be placed. If omitted,
    /// diagnostics are printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

impl DiagnosticOpts {
    fn init(&self, filter_env_var: &'static str, default_filter: &'static str) -> anyhow::Result<()> {
        LoggingConfig {
            log_dir: self.diag_log_dir.clone(),
            filter_env_var,
            default_filter,
            diag_format: self.diag_format,
        }
        .init()
    }
}

#[derive(Debug, Parser)]
struct RunOpts {
    #[command(flatten)]
    messaging: MessagingOpts,
    #[command(flatten)]
    diag: DiagnosticOpts,

    /// Address to bind the webhook ingress HTTP server to.
    #[arg(long, default_value = "0.0.0.0:8000")]
    bind_address: SocketAddr,

    /// Source for the webhook HMAC secret: a bare value, `file:<path>`,
    /// or `env:<VAR>`.
    #[arg(long)]
    secret: KeySource,
}

#[derive(Debug, Parser)]
struct HostctlOpts {
    #[command(flatten)]
    messaging: MessagingOpts,
    #[command(flatten)]
    diag: DiagnosticOpts,

    /// Number of runner slots on this host.
    #[arg(long, default_value_t = 4)]
    num_slots: usize,

    /// Completion-drain concurrency. MUST be 1 unless the provider's
    /// `stop_runner` is independently verified safe for concurrent
    /// invocation on distinct slots — this is the completion
    /// concurrency knob, independent of `num_slots` (the start
    /// concurrency knob).
    #[arg(long, default_value_t = 1)]
    num_workers: usize,

    /// Name of the registered `Provider` implementation to use.
    #[arg(long, default_value = "null")]
    provider: String,

    /// This host's own name, used to derive the `<prefix>completed.<hostname>`
    /// subject and to compose runner-names. Defaults to the OS hostname.
    #[arg(long)]
    hostname: Option<String>,

    /// Root directory for per-slot scratch directories.
    #[arg(long, default_value = "/var/tmp/gh-ci-broker")]
    scratch_dir: PathBuf,
}

#[derive(Debug, Parser)]
struct WaitForJobOpts {
    #[command(flatten)]
    messaging: MessagingOpts,
    #[command(flatten)]
    diag: DiagnosticOpts,

    /// Where to write the shell-sourceable `runner_scope`/`labels`
    /// variables once a job is picked.
    #[arg(long, default_value = "job_vars.txt")]
    job_vars_file: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move { dispatch(opt).await })
}

async fn dispatch(opt: Opt) -> anyhow::Result<()> {
    match opt.cmd {
        Command::Run(opts) => run(opts).await,
        Command::Hostctl(opts) => hostctl(opts).await,
        Command::WaitForJob(opts) => wait_for_job(opts).await,
    }
}

async fn run(opts: RunOpts) -> anyhow::Result<()> {
    opts.diag.init("GH_CI_BROKER_LOG", "ci_broker_classify=info,ci_broker=info")?;
    let mut lifecycle = LifeCycle::new();

    let queue = opts.messaging.connect().await?;
    queue
        .ensure_stream(&format!("{}queued", opts.messaging.stream_prefix))
        .await
        .context("ensuring queued stream exists")?;
    queue
        .ensure_stream(&format!("{}completed", opts.messaging.stream_prefix))
        .await
        .context("ensuring completed stream exists")?;

    let prefix = opts.messaging.stream_prefix.clone();
    let state = AppState {
        queue,
        secret: Arc::new(opts.secret),
        prefix: prefix.clone(),
        billing: Arc::new(BillingCache::new(Box::new(StubBillingLookup) as Box<dyn BillingLookup>)),
        status: Arc::new(move || serde_json::json!({"role": "webhook", "stream_prefix": prefix})),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(opts.bind_address)
        .await
        .with_context(|| format!("binding webhook listener on {}", opts.bind_address))?;
    info!(address = %opts.bind_address, "webhook ingress listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("webhook server exited")?;
        }
        _ = lifecycle.wait_for_shutdown() => {
            info!("webhook ingress shutting down");
        }
    }
    Ok(())
}

async fn hostctl(opts: HostctlOpts) -> anyhow::Result<()> {
    opts.diag.init("GH_CI_BROKER_LOG", "ci_broker_host=info,ci_broker=info")?;
    let mut lifecycle = LifeCycle::new();

    let hostname = opts
        .hostname
        .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());

    let pool = Arc::new(SlotPool::new(opts.num_slots, opts.scratch_dir.clone()));
    let provider = ci_broker_provider::build(&opts.provider, pool).unwrap_or_else(|err| {
        error!(%err, provider = %opts.provider, "falling back to the null provider");
        NullProvider::new(Arc::new(SlotPool::new(opts.num_slots, opts.scratch_dir)))
            as Arc<dyn ci_broker_provider::Provider>
    });

    let queue = opts.messaging.connect().await?;
    let scheduler = HostScheduler::new(
        provider,
        queue,
        hostname.clone(),
        opts.messaging.stream_prefix,
        opts.num_workers,
    );

    info!(hostname, num_slots = opts.num_slots, "host scheduler starting");
    scheduler.run().await?;

    lifecycle.wait_for_shutdown().await;
    info!("host scheduler shutting down");
    Ok(())
}

async fn wait_for_job(opts: WaitForJobOpts) -> anyhow::Result<()> {
    opts.diag.init("GH_CI_BROKER_LOG", "ci_broker_lease=info,ci_broker=info")?;

    let queue = opts.messaging.connect().await?;
    let prefix = opts.messaging.stream_prefix;

    info!("waiting for a job to be leased");
    let leased = loop {
        match ci_broker_lease::try_lease(queue.as_ref(), &prefix).await {
            Ok(Some(leased)) => break leased,
            Ok(None) => {
                tokio::time::sleep(WAIT_FOR_JOB_POLL).await;
            }
            Err(err) => {
                error!(%err, "lease attempt failed, retrying");
                tokio::time::sleep(WAIT_FOR_JOB_POLL).await;
            }
        }
    };

    info!(label = %leased.label, scope = %leased.runner_scope(), "job picked");
    write_job_vars(&opts.job_vars_file, &leased).await?;
    Ok(())
}

async fn write_job_vars(path: &PathBuf, leased: &ci_broker_lease::LeasedJob) -> anyhow::Result<()> {
    let labels = leased.event.labels().join(",");
    let contents = format!(
        "runner_scope={}\nlabels={}\n",
        shell_quote(&leased.runner_scope()),
        shell_quote(&labels),
    );
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

/// Single-quote a value for safe sourcing from a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
