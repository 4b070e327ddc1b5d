//! Hash-engine bridges.
//!
//! The stdio bridge speaks newline-delimited JSON: every [`WorkEvent`] is
//! written as one line to the engine, and every line read back must be a
//! [`Candidate`]. Malformed lines are logged and skipped.

use anyhow::Result;
use clap::ValueEnum;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use minewarden_core::{Candidate, EngineChannels};
use minewarden_stratum::WorkEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineMode {
    /// Work as JSON lines on stdout, candidates as JSON lines on stdin
    Stdio,
    /// Drop work events; useful to check pool connectivity
    None,
}

pub async fn run(mode: EngineMode, engine: EngineChannels, cancel: CancellationToken) -> Result<()> {
    match mode {
        EngineMode::Stdio => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            bridge(engine, stdin, tokio::io::stdout(), cancel).await
        }
        EngineMode::None => {
            let EngineChannels { mut work_rx, .. } = engine;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = work_rx.recv() => match event {
                        Some(event) => debug!(?event, "Work event dropped (no engine)"),
                        None => break,
                    },
                }
            }
            Ok(())
        }
    }
}

/// Pump work events to `writer` and candidates from `reader` until cancelled
/// or the miner stops producing work.
pub async fn bridge<R, W>(
    engine: EngineChannels,
    reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let EngineChannels {
        mut work_rx,
        candidate_tx,
    } = engine;
    let mut lines = reader.lines();
    let mut candidate_tx = Some(candidate_tx);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = work_rx.recv() => {
                let Some(event) = event else { break };
                write_event(&mut writer, &event).await?;
            }
            line = lines.next_line(), if candidate_tx.is_some() => match line? {
                Some(line) => {
                    if let Some(tx) = &candidate_tx {
                        forward_candidate(tx, &line).await;
                    }
                }
                None => {
                    info!("Hash engine closed its output");
                    candidate_tx = None;
                }
            },
        }
    }

    writer.flush().await?;
    Ok(())
}

async fn write_event<W: AsyncWrite + Unpin>(writer: &mut W, event: &WorkEvent) -> Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn forward_candidate(tx: &mpsc::Sender<Candidate>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<Candidate>(line) {
        Ok(candidate) => {
            if tx.send(candidate).await.is_err() {
                debug!("Share submitter stopped, candidate dropped");
            }
        }
        Err(e) => warn!("Ignoring malformed candidate line: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::io::{duplex, AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let (work_tx, work_rx) = mpsc::channel(8);
        let (candidate_tx, mut candidate_rx) = mpsc::channel(8);
        let engine = EngineChannels {
            work_rx,
            candidate_tx,
        };

        let (mut engine_in, bridge_in) = duplex(4096);
        let (bridge_out, mut engine_out) = duplex(4096);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge(
            engine,
            BufReader::new(bridge_in),
            bridge_out,
            cancel.clone(),
        ));

        work_tx.send(WorkEvent::Reset).await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = engine_out.read(&mut buf).await.unwrap();
        let line: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(line["type"], "reset");

        engine_in
            .write_all(b"not json\n{\"job_id\":\"abc\",\"nonce\":4660,\"extranonce2\":\"00000001\"}\n")
            .await
            .unwrap();
        let candidate = candidate_rx.recv().await.unwrap();
        assert_eq!(candidate.job_id, "abc");
        assert_eq!(candidate.nonce, 0x1234);
        assert_eq!(candidate.ntime, None);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bridge_stops_when_work_ends() {
        let (work_tx, work_rx) = mpsc::channel(8);
        let (candidate_tx, _candidate_rx) = mpsc::channel(8);
        let (_engine_in, bridge_in) = duplex(64);
        let (bridge_out, _engine_out) = duplex(64);

        drop(work_tx);
        bridge(
            EngineChannels {
                work_rx,
                candidate_tx,
            },
            BufReader::new(bridge_in),
            bridge_out,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }
}
