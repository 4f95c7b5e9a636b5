//! Newline-delimited JSON framing for envelopes over byte streams.
//!
//! One envelope per line. Lines longer than [`MAX_LINE_BYTES`] and lines that
//! fail to parse are logged and skipped; the stream stays usable.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::ipc::envelope::Envelope;
use crate::ipc::Link;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_LINE_BYTES: usize = 1 << 20;

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(envelope)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode(line: &[u8]) -> Result<Envelope> {
    Ok(serde_json::from_slice(line.trim_ascii())?)
}

/// Read envelopes from `reader` until EOF, forwarding each to `tx`.
///
/// Returns when the stream ends or the receiving side is dropped.
pub async fn read_envelopes<R>(reader: R, tx: mpsc::UnboundedSender<Envelope>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(4096);

    loop {
        line.clear();
        let limit = (MAX_LINE_BYTES + 1) as u64;
        let n = (&mut reader).take(limit).read_until(b'\n', &mut line).await?;
        if n == 0 {
            debug!("envelope stream reached EOF");
            return Ok(());
        }

        if line.last() != Some(&b'\n') && line.len() > MAX_LINE_BYTES {
            warn!(bytes = line.len(), "dropping oversized envelope line");
            discard_line(&mut reader).await?;
            continue;
        }
        if line.trim_ascii().is_empty() {
            continue;
        }

        match decode(&line) {
            Ok(envelope) => {
                if tx.send(envelope).is_err() {
                    return Ok(());
                }
            }
            Err(e) => warn!("dropping malformed envelope line: {e}"),
        }
    }
}

/// Write every envelope received on `rx` to `writer`, flushing per line.
pub async fn write_envelopes<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Envelope>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let bytes = encode(&envelope)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Turn a byte stream pair into a [`Link`] by spawning a reader and a writer task.
pub fn spawn_stream_link<R, W>(reader: R, writer: W) -> Link
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        if let Err(e) = read_envelopes(reader, inbound_tx).await {
            warn!("envelope reader stopped: {e}");
        }
    });
    tokio::spawn(async move {
        if let Err(e) = write_envelopes(writer, outbound_rx).await {
            warn!("envelope writer stopped: {e}");
        }
    });

    Link {
        tx: outbound_tx,
        rx: inbound_rx,
    }
}

async fn discard_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = buf.len();
        reader.consume(len);
    }
}
