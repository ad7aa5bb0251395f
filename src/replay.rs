//! Replays recorded ODAS output files into a running relay at real-time speed.
//!
//! `odaslive` can write its SST and SSL streams to files instead of sockets.
//! This module splits those files back into frames and pushes them to the
//! relay's tracking and potential ports, one frame per hop.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use odas_core::{Category, RelayError};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// ODAS hop size over sample rate: 128 / 16000 s.
pub const DEFAULT_HOP: Duration = Duration::from_millis(8);

const PROGRESS_EVERY: usize = 100;
const LOOP_PAUSE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub host: String,
    pub tracking_port: u16,
    pub potential_port: u16,
    pub sst_path: PathBuf,
    pub ssl_path: PathBuf,
    pub hop: Duration,
    pub looping: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            tracking_port: 9000,
            potential_port: 9001,
            sst_path: PathBuf::from("sst_output.json"),
            ssl_path: PathBuf::from("ssl_output.json"),
            hop: DEFAULT_HOP,
            looping: false,
        }
    }
}

/// Totals for a finished replay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub passes: usize,
    pub frames_sent: usize,
}

fn frame_separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"\}\s*\{").expect("static regex"))
}

/// Split a recorded ODAS file into newline-terminated frames.
///
/// Frames in the file may be separated by any whitespace; on the wire each is
/// sent trimmed and followed by exactly one newline.
pub fn parse_frames(content: &str) -> Vec<String> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    frame_separator()
        .split(content)
        .filter_map(|raw| {
            let mut frame = String::with_capacity(raw.len() + 3);
            if !raw.trim().starts_with('{') {
                frame.push('{');
            }
            frame.push_str(raw);
            if !frame.trim().ends_with('}') {
                frame.push('}');
            }
            let frame = frame.trim();
            (!frame.is_empty()).then(|| format!("{frame}\n"))
        })
        .collect()
}

async fn load_frames(path: &Path) -> Result<Vec<String>, RelayError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RelayError::Replay(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_frames(&content))
}

async fn connect(host: &str, port: u16, category: Category) -> Result<TcpStream, RelayError> {
    let stream = TcpStream::connect((host, port)).await.map_err(|e| {
        RelayError::Replay(format!(
            "could not connect to {category} port {host}:{port} ({e}); is the relay running?"
        ))
    })?;
    stream.set_nodelay(true)?;
    tracing::info!(category = category.label(), host, port, "Connected to relay");
    Ok(stream)
}

/// Stream both files to the relay. Returns once a single pass completes,
/// or never when looping.
pub async fn run(config: ReplayConfig) -> Result<ReplayStats, RelayError> {
    let ssl_frames = load_frames(&config.ssl_path).await?;
    let sst_frames = load_frames(&config.sst_path).await?;

    let n_frames = ssl_frames.len().min(sst_frames.len());
    if n_frames == 0 {
        return Err(RelayError::Replay("no frames to replay".into()));
    }
    tracing::info!(
        ssl = ssl_frames.len(),
        sst = sst_frames.len(),
        replaying = n_frames,
        duration_secs = (n_frames as f64 * config.hop.as_secs_f64()),
        "Loaded recordings"
    );

    let mut stats = ReplayStats::default();
    loop {
        let mut track = connect(&config.host, config.tracking_port, Category::Tracking).await?;
        let mut pot = connect(&config.host, config.potential_port, Category::Potential).await?;

        let mut ticker = tokio::time::interval(config.hop);
        let mut sent = 0;
        for i in 0..n_frames {
            ticker.tick().await;

            let result = async {
                pot.write_all(ssl_frames[i].as_bytes()).await?;
                track.write_all(sst_frames[i].as_bytes()).await
            }
            .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "Relay disconnected");
                break;
            }
            sent += 1;

            if sent % PROGRESS_EVERY == 0 {
                tracing::info!(
                    sent,
                    total = n_frames,
                    elapsed_secs = sent as f64 * config.hop.as_secs_f64(),
                    "Replay progress"
                );
            }
        }

        stats.passes += 1;
        stats.frames_sent += sent;
        tracing::info!(sent, total = n_frames, "Replay pass finished");

        let _ = track.shutdown().await;
        let _ = pot.shutdown().await;

        if !config.looping {
            return Ok(stats);
        }
        tracing::info!("Looping, restarting in 2 seconds");
        tokio::time::sleep(LOOP_PAUSE).await;
    }
}
