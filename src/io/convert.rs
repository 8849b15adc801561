use std::{
    io::{Read, Seek, SeekFrom},
    path::Path,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};

use crate::{config::TARGET_SAMPLE_RATE, error::Result};

const CONVERTIBLE: &[&str] = &["mp3", "ogg", "m4a", "flac", "wav", "aac", "opus", "wma"];

pub fn is_convertible(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CONVERTIBLE.iter().any(|c| c.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Converts `input` to 16-bit PCM WAV at the pipeline sample rate using an
/// external converter. The converter is killed after `timeout`.
///
/// Converter diagnostics go to an unlinked temp file so a chatty converter
/// never blocks on a full pipe.
pub fn convert_to_wav(ffmpeg: &str, input: &Path, output: &Path, timeout: Duration) -> Result<()> {
    let mut diagnostics = tempfile::tempfile().context("Failed to create converter log")?;
    let mut child = Command::new(ffmpeg)
        .arg("-i")
        .arg(input)
        .args(["-y", "-loglevel", "error", "-acodec", "pcm_s16le", "-ar"])
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(diagnostics.try_clone()?))
        .spawn()
        .with_context(|| format!("Failed to run converter `{ffmpeg}`"))?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() > timeout {
            child.kill().ok();
            child.wait().ok();
            return Err(anyhow!("converter timed out after {}s", timeout.as_secs()).into());
        }
        thread::sleep(Duration::from_millis(50));
    };

    if !status.success() {
        let mut raw = Vec::new();
        if diagnostics.seek(SeekFrom::Start(0)).is_ok() {
            diagnostics.read_to_end(&mut raw).ok();
        }
        let stderr: String = String::from_utf8_lossy(&raw).chars().take(500).collect();
        return Err(anyhow!("converter exited with {status}: {}", stderr.trim()).into());
    }

    if !output.exists() {
        return Err(anyhow!("converter output missing: {}", output.display()).into());
    }
    Ok(())
}
