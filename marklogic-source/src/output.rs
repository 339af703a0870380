use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use numaflow_marklogic::Routed;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// Writes every routed unit as one JSON line until the channel is closed. Payloads are base64
/// encoded since documents may be binary.
pub(crate) async fn write_lines<W>(mut rx: mpsc::Receiver<Routed>, mut writer: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(routed) = rx.recv().await {
        let line = json!({
            "relationship": routed.relationship.as_str(),
            "attributes": routed.unit.attributes,
            "payload": BASE64_STANDARD.encode(&routed.unit.payload),
        });
        let mut line = serde_json::to_vec(&line)
            .map_err(|e| Error::Output(format!("Failed to encode unit: {e}")))?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(|e| Error::Output(format!("Failed to write unit: {e}")))?;
        written += 1;
    }
    writer
        .flush()
        .await
        .map_err(|e| Error::Output(format!("Failed to flush output: {e}")))?;
    debug!(written, "Output channel closed");
    Ok(written)
}
