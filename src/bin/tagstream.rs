//! Command-line front end: classify or extract a JSON list of documents.
//!
//! ```bash
//! TAGSTREAM_TOKEN=... tagstream --model cl_pi3C7JiL --rpm 120 --batch 20 --file data.json
//! RUST_LOG=tagstream=debug tagstream --config run.json --file data.json
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result, bail};
use secrecy::SecretString;
use tagstream::{
    AppConfig, AuthScheme, Client, ClientConfig, Document, PipelineEvent, Task, TaskKind,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "tagstream", version, about)]
struct Cli {
    /// API token
    #[arg(long, env = "TAGSTREAM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Classifier or extractor id
    #[arg(long)]
    model: Option<String>,

    /// classify | extract
    #[arg(long)]
    task: Option<TaskKind>,

    /// Requests per minute; keep it below the provider's limit
    #[arg(long)]
    rpm: Option<u32>,

    /// Documents per batch
    #[arg(long)]
    batch: Option<usize>,

    /// JSON file holding an array of document texts
    #[arg(long, default_value = "data.json")]
    file: PathBuf,

    /// API base URL
    #[arg(long, env = "TAGSTREAM_BASE_URL")]
    base_url: Option<String>,

    /// Authorization scheme: bearer | token
    #[arg(long)]
    auth_scheme: Option<AuthScheme>,

    /// Tag documents with sequential external ids
    #[arg(long)]
    ids: bool,

    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let (client_config, task, batch_size) = resolve(&cli)?;

    let texts = load_documents(&cli.file)?;
    info!(file = %cli.file.display(), documents = texts.len(), "documents loaded");

    let documents: Vec<Document> = texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| {
            let document = Document::new(text);
            if cli.ids {
                document.with_external_id(i.to_string())
            } else {
                document
            }
        })
        .collect();
    let batches = documents.len().div_ceil(batch_size.max(1));
    info!(batch_size, batches, "starting run");

    let client = Client::new(client_config)?;
    let (mut stream, handle) = client.run(&task, documents, batch_size)?;

    let mut results = 0usize;
    let mut failures = 0usize;
    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(PipelineEvent::Result(result)) => {
                    results += 1;
                    println!("{}", serde_json::to_string(&result)?);
                }
                Some(PipelineEvent::Failure(failure)) => {
                    failures += 1;
                    warn!(
                        batch = failure.batch,
                        documents = failure.documents,
                        error = %failure.error,
                        "batch failed"
                    );
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                handle.shutdown();
            }
        }
    }

    info!(results, failures, "run finished");
    match client.quota().await {
        Some(quota) => println!("Remaining credits: {} / {}", quota.remaining, quota.limit),
        None => println!("Remaining credits: unknown"),
    }
    Ok(())
}

fn resolve(cli: &Cli) -> Result<(ClientConfig, Task, usize)> {
    let file_config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read(path)
                .wrap_err_with(|| format!("reading config {}", path.display()))?;
            Some(
                serde_json::from_slice::<AppConfig>(&raw)
                    .wrap_err_with(|| format!("parsing config {}", path.display()))?,
            )
        }
        None => None,
    };

    let mut client_config = match &file_config {
        Some(config) => config.api.client_config(),
        None => ClientConfig {
            api_key: None,
            base_url: "https://api.monkeylearn.com".to_string(),
            auth_scheme: AuthScheme::Token,
            requests_per_minute: 120,
            timeout: Duration::from_secs(30),
            max_concurrent_requests: 300,
        },
    };

    if let Some(token) = &cli.token {
        client_config.api_key = Some(SecretString::from(token.as_str()));
    }
    if client_config.api_key.is_none() {
        bail!("an API token is required (--token or TAGSTREAM_TOKEN)");
    }
    if let Some(base_url) = &cli.base_url {
        client_config.base_url = base_url.clone();
    }
    if let Some(auth_scheme) = cli.auth_scheme {
        client_config.auth_scheme = auth_scheme;
    }
    if let Some(rpm) = cli.rpm {
        client_config.requests_per_minute = rpm;
    }

    let task = match (file_config.as_ref().map(|c| &c.run), &cli.model) {
        (_, Some(model)) => Task::new(cli.task.unwrap_or_default(), model.as_str()),
        (Some(run), None) => {
            let mut run = run.clone();
            if let Some(kind) = cli.task {
                run.task = kind;
                run.endpoint_template = None;
            }
            run.task()?
        }
        (None, None) => bail!("a model id is required (--model or a config file)"),
    };

    let batch_size = cli
        .batch
        .or(file_config.as_ref().map(|c| c.run.batch_size))
        .unwrap_or(1);

    Ok((client_config, task, batch_size))
}

fn load_documents(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("tagstream=info"))
        .wrap_err("creating log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| eyre::eyre!("initializing tracing: {err}"))
}
