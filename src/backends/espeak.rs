use super::device::{SpeechPlatform, Utterance};
use super::{Voice, VoiceError};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// espeak-ng's default speaking rate in words per minute.
const BASE_WPM: f32 = 175.0;

/// Native speech through the `espeak-ng` binary, played straight to the sound device.
pub struct EspeakPlatform {
    binary: String,
    timeout: Duration,
    cancelled: Notify,
}

impl EspeakPlatform {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            cancelled: Notify::new(),
        }
    }

    fn args(utterance: &Utterance) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(voice) = &utterance.voice {
            args.push("-v".to_string());
            args.push(voice.clone());
        }
        let wpm = (BASE_WPM * utterance.rate).round().clamp(80.0, 450.0) as u32;
        let pitch = (50.0 * utterance.pitch).round().clamp(0.0, 99.0) as u32;
        let amplitude = (100.0 * utterance.volume).round().clamp(0.0, 200.0) as u32;
        args.extend([
            "-s".to_string(),
            wpm.to_string(),
            "-p".to_string(),
            pitch.to_string(),
            "-a".to_string(),
            amplitude.to_string(),
            "--".to_string(),
            utterance.text.clone(),
        ]);
        args
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Parses `espeak-ng --voices`:
/// `Pty Language Age/Gender VoiceName File Other Languages`
fn parse_voice_list(output: &str) -> Vec<Voice> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 {
                return None;
            }
            Some(Voice {
                id: cols[4].to_string(),
                name: cols[3].replace('_', " "),
                language: cols[1].to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl SpeechPlatform for EspeakPlatform {
    async fn voices(&self) -> Vec<Voice> {
        let output = Command::new(&self.binary)
            .arg("--voices")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => parse_voice_list(&String::from_utf8_lossy(&out.stdout)),
            Ok(out) => {
                warn!("espeak-ng --voices exited with {}", out.status);
                Vec::new()
            }
            Err(e) => {
                warn!("failed to run {}: {}", self.binary, e);
                Vec::new()
            }
        }
    }

    async fn voices_changed(&self) {
        // espeak-ng has no catalog notifications
        std::future::pending::<()>().await
    }

    async fn speak(&self, utterance: Utterance) -> Result<(), VoiceError> {
        let mut child = Command::new(&self.binary)
            .args(Self::args(&utterance))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Speech(format!("failed to start {}: {}", self.binary, e)))?;

        debug!(text = %utterance.text, "espeak speaking");
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = self.cancelled.notified() => Outcome::Cancelled,
            _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = status.map_err(|e| VoiceError::Speech(e.to_string()))?;
                if status.success() {
                    return Ok(());
                }
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                Err(VoiceError::Speech(format!("espeak error: {}", stderr.trim())))
            }
            Outcome::Cancelled => {
                let _ = child.kill().await;
                debug!("espeak utterance cancelled");
                Ok(())
            }
            Outcome::TimedOut => {
                let _ = child.kill().await;
                Err(VoiceError::Speech(format!(
                    "speech timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.notify_waiters();
    }
}
