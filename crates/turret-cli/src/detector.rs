use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use turret_vision::Detection;

/// Detection frame source: newline-delimited JSON, one array of
/// detections per line. Stands in for the external NN detector; point
/// it at a FIFO for a live feed or a file for replay.
pub struct DetectionSource {
    reader: BufReader<File>,
}

impl DetectionSource {
    pub async fn open(path: &str) -> Result<Self> {
        let f = File::open(path)
            .await
            .with_context(|| format!("open detection source {}", path))?;
        Ok(Self { reader: BufReader::new(f) })
    }

    /// Next frame of detections. At EOF this waits for more input, so
    /// a FIFO behaves like a live detector.
    pub async fn next_frame(&mut self) -> Result<Vec<Detection>> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await.context("read detection frame")?;
            if n == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                continue;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Vec<Detection>>(trimmed) {
                Ok(frame) => return Ok(frame),
                Err(e) => {
                    warn!(error = %e, "detector: skipping malformed frame line");
                }
            }
        }
    }
}
