use std::{env, path::PathBuf, process, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use url::Url;

use gateway_client::client::{Gateway, HttpGateway};
use zapflow::{
    campaign::{InMemoryCampaignStore, dispatcher::CampaignDispatcher},
    config::{ConfigManager, EnvConfigManager, keys},
    crm::{CrmStore, InMemoryCrmStore, scheduler::StageAutomationScheduler},
    flow::{
        engine::{FlowEngine, NoopHooks},
        resolver::{FlowResolver, InMemoryFlowStore},
        session::InMemorySessionStore,
    },
    llm::{OllamaClient, SharedLlm},
    logger::init_tracing,
    runtime::{Runtime, RuntimeConfig},
    schema::write_schema,
};

#[derive(Parser, Debug)]
#[command(
    name = "zapflow",
    about = "WhatsApp flow, campaign and CRM automation worker",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the worker process
    Run(RunArgs),

    /// Emit the JSON-Schema contracts consumed by the flow editor
    Schema,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// .env file holding gateway and LLM credentials
    #[arg(long, default_value = "./.env")]
    env_file: PathBuf,
}

/// Root directory for logs and schema exports.
fn resolve_root_dir() -> PathBuf {
    match env::var("ZAPFLOW_ROOT") {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from("./zapflow"),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        log_level: "info".to_string(),
        env_file: PathBuf::from("./.env"),
    })) {
        Commands::Run(args) => run(resolve_root_dir(), args).await,
        Commands::Schema => {
            let out_dir = resolve_root_dir().join("schemas");
            write_schema(out_dir.clone())?;
            println!("Schemas written to {}", out_dir.display());
            process::exit(0);
        }
    }
}

async fn run(root: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(root.join("logs"))?;
    init_tracing(
        root.clone(),
        "logs/zapflow.log".to_string(),
        "logs/zapflow-audit.log".to_string(),
        args.log_level,
    )?;
    info!("zapflow worker starting up");

    let config = ConfigManager(EnvConfigManager::new(args.env_file));

    let gateway_url = config
        .0
        .get(keys::GATEWAY_URL)
        .await
        .context("GATEWAY_URL is not configured")?;
    let gateway_token = config.0.get(keys::GATEWAY_TOKEN).await.unwrap_or_default();
    let gateway: Gateway = Arc::new(HttpGateway::new(Url::parse(&gateway_url)?, gateway_token));

    let llm: SharedLlm = Arc::new(OllamaClient::from_config(&config).await);

    let resolver = FlowResolver::new(InMemoryFlowStore::new());
    let engine = FlowEngine::new(
        resolver.clone(),
        InMemorySessionStore::new(),
        gateway.clone(),
        llm,
        Arc::new(NoopHooks),
    );
    let dispatcher = CampaignDispatcher::new(InMemoryCampaignStore::new(), gateway);
    let crm: CrmStore = InMemoryCrmStore::new();
    let scheduler = StageAutomationScheduler::new(crm, engine.clone(), resolver.clone());

    let runtime = Runtime::new(
        engine,
        resolver,
        dispatcher,
        scheduler,
        RuntimeConfig::default(),
    );
    runtime.start();
    info!("zapflow worker up, waiting for ctrl-c");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    runtime.shutdown().await;
    Ok(())
}
