use std::io::BufRead;

use anyhow::{Context, Result, bail};
use index_sender::{DataSender, SenderRegistry};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: index_sender <server> <data-source> [update-threshold]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(server), Some(data_source)) = (args.next(), args.next()) else {
        bail!(USAGE);
    };
    let update_threshold = match args.next() {
        Some(value) => value.parse().context("update threshold must be a number")?,
        None => 100,
    };

    // One registry for the whole process
    let registry = SenderRegistry::new();
    let sender = DataSender::builder()
        .to_server(server)
        .of_data_source(data_source)
        .update_threshold(update_threshold)
        .build(&registry)?;

    // Each line is `delete <id>`, `update <json object>` or a delimited row
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = if let Some(id) = line.strip_prefix("delete ") {
            sender.delete(id.trim())
        } else if let Some(json) = line.strip_prefix("update ") {
            let row: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(json).context("update expects a JSON object")?;
            sender.update(&row)
        } else {
            sender.add_row(line)
        };

        if let Err(e) = result {
            if e.is_validation() {
                tracing::warn!(line, error = %e, "skipping invalid line");
            } else {
                tracing::error!(line, error = %e, "write failed");
            }
        }
    }

    let summary = registry.close_all();
    tracing::info!(flushed = summary.flushed, failed = summary.failed, "all senders closed");
    if summary.failed > 0 {
        bail!("{} batches could not be delivered", summary.failed);
    }

    Ok(())
}
