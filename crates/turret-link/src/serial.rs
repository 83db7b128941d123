use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Line-oriented serial transport to the motor/laser controller, one
/// JSON object per line in each direction. Split so the read loop and
/// the command writer can run as separate tasks.
pub struct SerialReader {
    reader: BufReader<ReadHalf<SerialStream>>,
}

pub struct SerialWriter {
    writer: WriteHalf<SerialStream>,
}

pub fn open(dev: &str, baud: u32) -> Result<(SerialReader, SerialWriter)> {
    let port = tokio_serial::new(dev, baud)
        .open_native_async()
        .with_context(|| format!("open controller serial {}", dev))?;
    let (r, w) = tokio::io::split(port);
    Ok((SerialReader { reader: BufReader::new(r) }, SerialWriter { writer: w }))
}

impl SerialReader {
    /// Next complete line, or None on EOF.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.context("serial read")?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

impl SerialWriter {
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await.context("serial write")?;
        self.writer.write_all(b"\n").await.context("serial write")?;
        self.writer.flush().await.context("serial flush")?;
        Ok(())
    }
}
