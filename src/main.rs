use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use paper_digest::{
    ArxivSource, CancelSignal, DedupConfig, DedupStore, Dispatcher, DispatcherConfig,
    HttpInferenceClient, Pipeline, RunState, SmtpChannel, Summarizer, SummarizerConfig,
};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "paper-digest",
    about = "Collects new AI papers, summarizes them with a language model, and emails a digest"
)]
struct Args {
    /// SQLite database holding dedup state
    #[arg(long, default_value = "paper-digest.db")]
    database: String,

    /// File with one recipient address per line
    #[arg(long)]
    recipients: String,

    /// Look-back window in hours for new papers
    #[arg(long, default_value_t = 168)]
    since_hours: i64,

    /// arXiv categories to watch (repeatable)
    #[arg(long = "category", default_values_t = ["cs.AI".to_string(), "cs.LG".to_string(), "cs.CL".to_string()])]
    categories: Vec<String>,

    /// Maximum candidate papers per run
    #[arg(long, default_value_t = 25)]
    max_papers: usize,

    /// Inference endpoint URL
    #[arg(long)]
    inference_endpoint: String,

    /// Model name passed to the inference endpoint
    #[arg(long, default_value = "gemma-2-27b-it")]
    model: String,

    /// SMTP relay host
    #[arg(long)]
    smtp_host: String,

    #[arg(long, default_value_t = 587)]
    smtp_port: u16,

    /// Sender address for digest emails
    #[arg(long, default_value = "digest@localhost")]
    from_address: String,

    /// Delivery batch size
    #[arg(long, default_value_t = 50)]
    batch_size: usize,
}

fn load_recipients(path: &str) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    info!("starting paper digest run");

    let recipients = load_recipients(&args.recipients)
        .with_context(|| format!("could not read recipient list {}", args.recipients))?;
    if recipients.is_empty() {
        bail!("no recipients found in {}", args.recipients);
    }
    info!("loaded {} recipients", recipients.len());

    let dedup = Arc::new(
        DedupStore::connect(
            &format!("sqlite://{}", args.database),
            DedupConfig::default(),
        )
        .await?,
    );

    let source = Arc::new(ArxivSource::new(args.categories.clone(), args.max_papers, 30)?);

    let summarizer_config = SummarizerConfig::default();
    let inference = Arc::new(HttpInferenceClient::new(
        &args.inference_endpoint,
        &args.model,
        env::var("INFERENCE_API_KEY").ok(),
        summarizer_config.request_timeout_secs,
    )?);
    let summarizer = Summarizer::new(inference, summarizer_config);

    // SMTP credentials come from the environment, never from flags
    let smtp_credentials = match (env::var("SMTP_USERNAME"), env::var("SMTP_PASSWORD")) {
        (Ok(username), Ok(password)) => Some((username, password)),
        _ => {
            warn!("SMTP_USERNAME/SMTP_PASSWORD not set, connecting without authentication");
            None
        }
    };
    let channel = Arc::new(SmtpChannel::new(
        &args.smtp_host,
        args.smtp_port,
        smtp_credentials,
        &args.from_address,
    )?);
    let dispatcher = Dispatcher::new(
        channel,
        DispatcherConfig {
            batch_size: args.batch_size,
            ..DispatcherConfig::default()
        },
    );

    let pipeline = Pipeline::new(source, dedup, summarizer, dispatcher, recipients);

    let cancel = CancelSignal::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("cancellation requested, finishing in-flight calls");
                cancel.cancel();
            }
        });
    }

    let since = Utc::now() - chrono::Duration::hours(args.since_hours);
    let report = pipeline.run(since, &cancel).await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.final_state == RunState::Aborted {
        std::process::exit(1);
    }
    Ok(())
}
