use std::collections::HashMap;
use std::env;

use marklogic_client::{DatabaseClient, HttpQueryBatcher};
use numaflow_marklogic::{FlowUnit, QueryMarkLogic, RunContext, RunOutcome};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::schedule::Trigger;
use crate::state::StateBackend;

mod config;
mod error;
mod output;
mod schedule;
mod setup_tracing;
mod state;

/// Attribute of the trigger unit carrying the scheduled fire time.
const TRIGGER_TIME_ATTRIBUTE: &str = "marklogic.trigger.time";
const OUTPUT_CHANNEL_SIZE: usize = 500;

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing::register();

    // Setup the CryptoProvider (controls core cryptography used by rustls) for the process
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| Error::Config("Failed to install the default CryptoProvider".to_string()))?;

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<()> {
    let env_vars: HashMap<String, String> = env::vars().collect();
    let settings = Settings::load(&env_vars)?;
    let trigger = Trigger::new(&settings.trigger)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(?e, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Received Ctrl-C, shutting down");
            cancel.cancel();
        }
    });

    let state = StateBackend::new(settings.jetstream.as_ref()).await?;
    let client = DatabaseClient::new(&settings.client)?;
    info!(url = client.base_url(), "Connected MarkLogic client");
    let batcher = HttpQueryBatcher::new(client, settings.client.retry.clone());
    let processor = QueryMarkLogic::new(settings.query, batcher, state)?;

    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
    let writer = tokio::spawn(output::write_lines(rx, tokio::io::stdout()));

    let processor = &processor;
    let ticks = schedule::run_scheduled(&trigger, &cancel, |fire_time| {
        let context = RunContext {
            incoming: Some(
                FlowUnit::new("").with_attribute(TRIGGER_TIME_ATTRIBUTE, fire_time.to_rfc3339()),
            ),
            output: tx.clone(),
            cancel: cancel.clone(),
        };
        let cancel = cancel.clone();
        async move { handle_outcome(processor.run(context).await, &cancel) }
    })
    .await;
    info!(ticks, "Schedule stopped");

    drop(tx);
    let written = writer
        .await
        .map_err(|e| Error::Output(format!("Output writer panicked: {e}")))??;
    info!(written, "Flushed output");
    Ok(())
}

/// Logs the outcome of a scheduled run and stops the schedule once the output is closed.
fn handle_outcome(result: numaflow_marklogic::Result<RunOutcome>, cancel: &CancellationToken) {
    match result {
        Ok(outcome) => info!(
            job_id = outcome.job_id,
            emitted = outcome.emitted,
            watermark = ?outcome.watermark,
            "Query run completed"
        ),
        Err(e @ numaflow_marklogic::Error::Output(_)) => {
            error!(?e, "Output is closed, stopping the schedule");
            cancel.cancel();
        }
        Err(e) if e.is_retriable() => {
            warn!(?e, "Query run failed, retrying on the next schedule")
        }
        Err(e) => error!(?e, "Query run failed"),
    }
}
