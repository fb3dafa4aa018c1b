use crate::backends::VoiceError;
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::io::Cursor;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Plays synthesized WAV buffers.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Resolves when playback ends or is stopped.
    async fn play(&self, wav: Vec<u8>) -> Result<(), VoiceError>;

    /// Stops playback immediately and releases the current buffer.
    fn stop(&self);
}

enum Command {
    Play {
        wav: Vec<u8>,
        done: oneshot::Sender<Result<(), VoiceError>>,
    },
    Stop,
}

struct Playing {
    sink: Sink,
    done: oneshot::Sender<Result<(), VoiceError>>,
}

/// Playback on the default output device. The rodio stream is not `Send`, so
/// it lives on a dedicated thread that is driven over a channel.
#[derive(Clone)]
pub struct RodioSink {
    tx: Sender<Command>,
}

impl RodioSink {
    pub fn new() -> Self {
        let (tx, rx) = channel::<Command>();

        thread::spawn(move || {
            // Opened on first use; stays alive on this thread
            let mut output: Option<(OutputStream, OutputStreamHandle)> = None;
            let mut current: Option<Playing> = None;

            loop {
                match next_command(&rx, current.is_some()) {
                    Ok(Some(Command::Play { wav, done })) => {
                        if let Some(previous) = current.take() {
                            previous.sink.stop();
                            let _ = previous.done.send(Ok(()));
                        }
                        if output.is_none() {
                            match OutputStream::try_default() {
                                Ok(stream) => output = Some(stream),
                                Err(e) => {
                                    error!("no audio output device: {}", e);
                                    let _ = done.send(Err(VoiceError::Playback(e.to_string())));
                                    continue;
                                }
                            }
                        }
                        let Some((_, handle)) = output.as_ref() else {
                            continue;
                        };
                        match start(handle, wav) {
                            Ok(sink) => current = Some(Playing { sink, done }),
                            Err(e) => {
                                let _ = done.send(Err(e));
                            }
                        }
                    }
                    Ok(Some(Command::Stop)) => {
                        if let Some(previous) = current.take() {
                            previous.sink.stop();
                            let _ = previous.done.send(Ok(()));
                            debug!("playback stopped");
                        }
                    }
                    Ok(None) => {}
                    Err(_) => break,
                }

                if current.as_ref().is_some_and(|p| p.sink.empty()) {
                    if let Some(finished) = current.take() {
                        let _ = finished.done.send(Ok(()));
                    }
                }
            }
        });

        Self { tx }
    }
}

impl Default for RodioSink {
    fn default() -> Self {
        Self::new()
    }
}

/// How often a playing sink is checked for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Waits for the next command. Idle threads block; while a buffer is playing
/// the wait is bounded so completion can be noticed. `Ok(None)` is a tick.
fn next_command<T>(rx: &Receiver<T>, playing: bool) -> Result<Option<T>, RecvTimeoutError> {
    if !playing {
        return rx.recv().map(Some).map_err(|_| RecvTimeoutError::Disconnected);
    }
    match rx.recv_timeout(POLL_INTERVAL) {
        Ok(command) => Ok(Some(command)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(e) => Err(e),
    }
}

fn start(handle: &OutputStreamHandle, wav: Vec<u8>) -> Result<Sink, VoiceError> {
    use rodio::Source;

    let sink = Sink::try_new(handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
    let source = Decoder::new(Cursor::new(wav))
        .map_err(|e| VoiceError::Playback(format!("failed to decode: {}", e)))?;
    sink.append(source.convert_samples::<f32>());
    Ok(sink)
}

#[async_trait]
impl AudioSink for RodioSink {
    async fn play(&self, wav: Vec<u8>) -> Result<(), VoiceError> {
        let (done, finished) = oneshot::channel();
        self.tx
            .send(Command::Play { wav, done })
            .map_err(|_| VoiceError::Playback("audio thread is gone".to_string()))?;
        finished
            .await
            .map_err(|_| VoiceError::Playback("audio thread dropped the request".to_string()))?
    }

    fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}
