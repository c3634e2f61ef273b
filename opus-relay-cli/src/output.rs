use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::SinkExt;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use opus_relay::{ContentDescriptor, Selection};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes Opus packets as length-delimited frames.
pub struct PacketWriter {
    framed: FramedWrite<BoxedWriter, LengthDelimitedCodec>,
    packets: u64,
    bytes: u64,
}

impl PacketWriter {
    pub async fn open(path: &Path, stdout: bool) -> Result<Self> {
        let writer: BoxedWriter = if stdout {
            Box::new(tokio::io::stdout())
        } else {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Box::new(tokio::io::BufWriter::new(file))
        };
        Ok(Self::new(writer))
    }

    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            framed: FramedWrite::new(writer, LengthDelimitedCodec::new()),
            packets: 0,
            bytes: 0,
        }
    }

    pub async fn write_packet(&mut self, packet: Bytes) -> Result<()> {
        self.bytes += packet.len() as u64;
        self.packets += 1;
        self.framed.send(packet).await?;
        Ok(())
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub async fn finish(mut self) -> Result<()> {
        SinkExt::<Bytes>::flush(&mut self.framed).await?;
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}

/// JSON summary printed by `--info-only`.
pub fn info_json(descriptor: &ContentDescriptor, selection: &Selection) -> serde_json::Value {
    json!({
        "id": descriptor.id,
        "title": descriptor.title,
        "duration_secs": descriptor.duration_secs,
        "is_live": descriptor.is_live,
        "path": selection.path(),
        "format": selection.format(),
        "formats": descriptor.formats.len(),
    })
}
