use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;

use sockudo_wstest::logging::init_tracing;
use sockudo_wstest::session::{SessionConfig, DEFAULT_AGENT};
use sockudo_wstest::spec::{ProtocolOptions, CASE_SET, DEFAULT_URL};
use sockudo_wstest::testee::{bind_testee, run_testee_server, TesteeClient};
use sockudo_wstest::wamp::{run_fuzzing_wamp_client, run_wamp_testee_server, Broker};
use sockudo_wstest::{run_fuzzing_client, CaseCatalog, FuzzingServer, Mode, Spec};

/// wstest: WebSocket conformance fuzzing harness.
#[derive(Debug, Parser)]
#[command(name = "wstest", version, about, long_about = None, propagate_version = true)]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Wait for testee clients and run cases on their connections.
    #[command(name = "fuzzingserver")]
    FuzzingServer(FuzzingServerArgs),

    /// Connect to testee servers and run cases against them.
    #[command(name = "fuzzingclient")]
    FuzzingClient(SpecArgs),

    /// Echo server to test the fuzzing client with.
    #[command(name = "testeeserver")]
    TesteeServer(TesteeArgs),

    /// Echo client that runs every case of a fuzzing server.
    #[command(name = "testeeclient")]
    TesteeClient(TesteeArgs),

    /// Connect to WAMP brokers and run the WAMP cases against them.
    #[command(name = "fuzzingwampclient")]
    FuzzingWampClient(SpecArgs),

    /// WAMP broker to test the WAMP fuzzing client with.
    #[command(name = "wamptesteeserver")]
    WampTesteeServer(TesteeArgs),

    /// Print the cases a spec selects.
    #[command(name = "listcases")]
    ListCases(SpecArgs),
}

#[derive(Debug, Args)]
struct SpecArgs {
    /// Spec file; a template is written to the working directory when omitted.
    #[arg(long, short)]
    spec: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct FuzzingServerArgs {
    #[command(flatten)]
    spec: SpecArgs,

    /// Serve the report directory over HTTP on this port.
    #[arg(long)]
    webport: Option<u16>,
}

#[derive(Debug, Args)]
struct TesteeArgs {
    /// WebSocket URL to listen on or connect to.
    #[arg(long, short, default_value = DEFAULT_URL)]
    url: String,

    /// Agent name reported to the peer.
    #[arg(long, short)]
    agent: Option<String>,
}

/// Load the spec, or write the mode's template and use that
fn load_spec(path: Option<&Path>, mode: Mode) -> Result<Spec> {
    if let Some(path) = path {
        return Ok(Spec::load(path)?);
    }
    let template = PathBuf::from(mode.template_file());
    if template.exists() {
        tracing::info!(path = %template.display(), "using existing spec");
        return Ok(Spec::load(&template)?);
    }
    let spec = Spec::template(mode);
    std::fs::write(&template, spec.to_json_pretty()?)
        .with_context(|| format!("writing {}", template.display()))?;
    tracing::info!(path = %template.display(), "no spec given, wrote template");
    Ok(spec)
}

/// Broadcast a shutdown on ctrl-c
fn stop_on_ctrl_c(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            let _ = shutdown.send(());
        }
    });
}

async fn fuzzing_server(args: FuzzingServerArgs, catalog: Arc<CaseCatalog>) -> Result<()> {
    let mut spec = load_spec(args.spec.spec.as_deref(), Mode::FuzzingServer)?;
    if args.webport.is_some() {
        spec.webport = args.webport;
    }
    let server = FuzzingServer::bind(&spec, catalog).await?;
    stop_on_ctrl_c(server.shutdown_handle());
    server.run().await?;
    Ok(())
}

fn print_summary(path: &Path) -> Result<()> {
    let summary =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    println!("{}", summary);
    Ok(())
}

async fn fuzzing_client(args: SpecArgs, catalog: Arc<CaseCatalog>) -> Result<()> {
    let spec = load_spec(args.spec.as_deref(), Mode::FuzzingClient)?;
    let run = run_fuzzing_client(spec, catalog).await?;
    print_summary(&run.reports.summary)
}

async fn fuzzing_wamp_client(args: SpecArgs) -> Result<()> {
    let spec = load_spec(args.spec.as_deref(), Mode::FuzzingWampClient)?;
    let catalog = Arc::new(CaseCatalog::wamp().context("building WAMP case catalog")?);
    let run = run_fuzzing_wamp_client(spec, catalog).await?;
    print_summary(&run.reports.summary)
}

async fn testee_server(args: TesteeArgs) -> Result<()> {
    let agent = args.agent.unwrap_or_else(|| DEFAULT_AGENT.to_string());
    let config = SessionConfig::from_options(&ProtocolOptions::default(), agent);
    let (listener, _) = bind_testee(&args.url).await?;
    let (shutdown, _) = broadcast::channel(1);
    stop_on_ctrl_c(shutdown.clone());
    run_testee_server(listener, config, shutdown).await?;
    Ok(())
}

async fn wamp_testee_server(args: TesteeArgs) -> Result<()> {
    let agent = args.agent.unwrap_or_else(|| DEFAULT_AGENT.to_string());
    let config = SessionConfig::from_options(&ProtocolOptions::default(), agent.clone());
    let (listener, addr) = bind_testee(&args.url).await?;
    tracing::info!(%addr, "WAMP testee broker listening");
    let (shutdown, _) = broadcast::channel(1);
    stop_on_ctrl_c(shutdown.clone());
    run_wamp_testee_server(listener, config, Arc::new(Broker::testsuite(agent)), shutdown).await?;
    Ok(())
}

async fn testee_client(args: TesteeArgs) -> Result<()> {
    let agent = args.agent.unwrap_or_else(|| DEFAULT_AGENT.to_string());
    let client = TesteeClient::new(&args.url, agent, SessionConfig::default())?;
    let count = client.run_all().await?;
    tracing::info!(cases = count, "testee client finished");
    Ok(())
}

fn list_cases(args: SpecArgs) -> Result<()> {
    let spec = match args.spec {
        Some(path) => Spec::load(path)?,
        None => Spec::default(),
    };
    let catalog = CaseCatalog::for_case_set(spec.case_set.as_deref().unwrap_or(CASE_SET))?;
    for id in spec.server_cases(&catalog)? {
        if let Some(case) = catalog.get(&id) {
            println!("{:<10} {}", id, case.pretty_description());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let standard = || -> Result<Arc<CaseCatalog>> {
        Ok(Arc::new(CaseCatalog::standard().context("building case catalog")?))
    };
    match cli.command {
        Command::FuzzingServer(args) => fuzzing_server(args, standard()?).await,
        Command::FuzzingClient(args) => fuzzing_client(args, standard()?).await,
        Command::FuzzingWampClient(args) => fuzzing_wamp_client(args).await,
        Command::TesteeServer(args) => testee_server(args).await,
        Command::WampTesteeServer(args) => wamp_testee_server(args).await,
        Command::TesteeClient(args) => testee_client(args).await,
        Command::ListCases(args) => list_cases(args),
    }
}
