use anyhow::{Context, Result};
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{PipelineError, Session, SessionStats};

/// Line-delimited JSON engine over TCP. Serves one client at a time; every
/// connection gets a fresh session.
pub struct EngineServer {
    config: EngineConfig,
}

impl EngineServer {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!("Regime engine listening on {}", addr);
        Ok(listener)
    }

    /// Accept and serve connections until `shutdown` resolves.
    pub async fn run<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted.context("accept failed")?,
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    return Ok(());
                }
            };

            if self.config.server.nodelay {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
            }
            info!("Client connected: {}", peer);

            tokio::select! {
                result = serve_connection(&self.config, stream) => match result {
                    Ok(stats) => stats.log_summary(),
                    Err(e) => warn!("Connection {} ended with error: {:#}", peer, e),
                },
                _ = &mut shutdown => {
                    info!("Shutting down with client {} still connected", peer);
                    return Ok(());
                }
            }
            info!("Client disconnected: {}", peer);
        }
    }
}

/// Outcome of reading one request line.
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    TooLong,
    Unterminated,
    Eof,
}

/// Read up to and including the next newline, buffering at most `max` bytes.
/// An oversized line is consumed through its newline without being kept.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader).take(max as u64).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        return Ok(LineRead::Line);
    }
    if n < max {
        return Ok(LineRead::Unterminated);
    }

    let mut skipped = Vec::new();
    loop {
        skipped.clear();
        let k = (&mut *reader).take(max as u64).read_until(b'\n', &mut skipped).await?;
        if k == 0 || skipped.last() == Some(&b'\n') {
            return Ok(LineRead::TooLong);
        }
    }
}

/// Run one session over a byte stream until the peer closes it.
pub async fn serve_connection<S>(config: &EngineConfig, stream: S) -> Result<SessionStats>
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut session = Session::new(config);
    let max_line = config.server.max_line_bytes;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = match read_line_capped(&mut reader, &mut buf, max_line).await {
            Ok(read) => read,
            Err(e) => {
                info!("Read failed, closing session: {}", e);
                break;
            }
        };

        let response = match read {
            LineRead::Eof => break,
            LineRead::Unterminated => {
                debug!("Discarding {} bytes of unterminated input at EOF", buf.len());
                break;
            }
            LineRead::TooLong => Some(session.reject(&PipelineError::MalformedInput(format!(
                "line exceeds {} bytes",
                max_line
            )))),
            LineRead::Line => match std::str::from_utf8(&buf) {
                Ok(line) => session.process_line(line),
                Err(e) => Some(session.reject(&PipelineError::MalformedInput(e.to_string()))),
            },
        };
        if let Some(response) = response {
            writer
                .write_all(response.to_line()?.as_bytes())
                .await
                .context("failed to write response")?;
        }
    }

    if let Err(e) = writer.flush().await {
        debug!("Flush on close failed: {}", e);
    }
    Ok(session.stats().clone())
}
