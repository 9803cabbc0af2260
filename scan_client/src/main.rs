use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use scan_client::{
    config::DEFAULT_API_BASE, utils, AnalysisClient, AnalyzeOutcome, ClientConfig, FilePick,
    Workflow, WorkflowSnapshot,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Submit an MRI scan for analysis", long_about = None)]
struct Args {
    /// Image file to analyze
    #[arg(short, long)]
    image: PathBuf,

    /// Base endpoint of the inference backend
    #[arg(long, env = "API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Request timeout in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout_secs: u64,

    /// Keep retrying an unreachable backend for this many seconds
    #[arg(short, long, default_value_t = 0)]
    retry_window_secs: u64,

    /// Download the heatmap to this file
    #[arg(short, long)]
    save_heatmap: Option<PathBuf>,

    /// Write the final workflow state as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scan_client=info")),
        )
        .init();

    let args = Args::parse();

    let config = ClientConfig::new(&args.api_base)?
        .with_timeout(Duration::from_secs(args.timeout_secs))
        .with_retry_window(Duration::from_secs(args.retry_window_secs));
    let client = Arc::new(AnalysisClient::new(config)?);

    let workflow = Workflow::from_client(client.clone());
    workflow.select(FilePick::from_path(&args.image).await?);

    let outcome = workflow.analyze().await;
    let snapshot = workflow.snapshot();
    render(&snapshot, outcome);

    if let Some(path) = &args.save_heatmap {
        match workflow.heatmap() {
            Some(heatmap) => match client.fetch_heatmap(&heatmap).await {
                Ok(bytes) => utils::save_bytes(&bytes, path)?,
                Err(e) => warn!(error = %e, "heatmap could not be downloaded"),
            },
            None => warn!("no heatmap to download"),
        }
    }

    if let Some(path) = &args.report {
        utils::save_json(&serde_json::to_value(&snapshot)?, path)?;
    }

    workflow.clear();
    Ok(())
}

fn render(snapshot: &WorkflowSnapshot, outcome: AnalyzeOutcome) {
    println!(
        "Scan:       {}",
        snapshot.file_name.as_deref().unwrap_or("-")
    );
    match &snapshot.result {
        Some(result) => {
            println!("Diagnosis:  {}", result.prediction_label);
            println!("Confidence: {}%", result.confidence_percent);
        }
        None => println!("Diagnosis:  waiting for scan ({outcome:?})"),
    }
    if let Some(url) = &snapshot.heatmap_url {
        println!("Heatmap:    {url}");
    }
    if let Some(error) = &snapshot.last_error {
        eprintln!("Error:      {error}");
    }
}
