//! JSON-lines framing over any async byte stream
//!
//! Used on both ends of the worker pipe, and by `serve` on stdio.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::error::{KgError, Result};

/// Serialize one message as a newline-terminated line
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next raw non-blank line, `None` at end of stream
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        while let Some(line) = self.lines.next_line().await? {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
        Ok(None)
    }

    /// Next decoded message. A malformed line is an `Ipc` error; the stream
    /// stays usable.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let Some(line) = self.next_line().await? else {
            return Ok(None);
        };
        serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| KgError::ipc(format!("malformed message: {}", e)))
    }
}

pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let line = encode_line(msg)?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker_process::protocol::{ChildMessage, ParentMessage};

    #[tokio::test]
    async fn test_lines_survive_malformed_input() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = MessageWriter::new(client);
        let mut reader = MessageReader::new(server);

        writer.send(&ParentMessage::Stop).await.unwrap();
        // Garbage and blank lines between messages
        let (_, mut raw) = tokio::io::split(writer.inner);
        raw.write_all(b"\n{not json}\n").await.unwrap();
        raw.write_all(encode_line(&ChildMessage::error("boom", true)).unwrap().as_bytes())
            .await
            .unwrap();
        drop(raw);

        assert_eq!(reader.next::<ParentMessage>().await.unwrap(), Some(ParentMessage::Stop));
        assert!(matches!(
            reader.next::<ChildMessage>().await,
            Err(KgError::Ipc { .. })
        ));
        assert_eq!(
            reader.next::<ChildMessage>().await.unwrap(),
            Some(ChildMessage::error("boom", true))
        );
        assert_eq!(reader.next::<ChildMessage>().await.unwrap(), None);
    }
}
