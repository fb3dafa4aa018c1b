use async_trait::async_trait;
use parking_lot::Mutex;
use spellfun::backends::device::{DeviceVoice, SpeechPlatform, Utterance};
use spellfun::backends::neural::{InferenceEngine, NeuralVoice};
use spellfun::backends::piper::PiperEngine;
use spellfun::backends::{DownloadProgress, ProgressCallback, SynthesisBackend, Voice, VoiceError, VoiceMethod};
use spellfun::coordinator::VoiceCoordinator;
use spellfun::engine::AudioSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

mockall::mock! {
    pub Backend {}
    #[async_trait::async_trait]
    impl SynthesisBackend for Backend {
        async fn initialize(&self, voice_id: &str, on_progress: Option<ProgressCallback>) -> Result<(), VoiceError>;
        async fn speak(&self, text: &str, voice_id: &str) -> Result<(), VoiceError>;
        async fn stop(&self);
        fn is_ready(&self) -> bool;
        fn current_voice(&self) -> Option<String>;
    }
}

#[tokio::test]
async fn test_speak_stops_before_playing() {
    let mut seq = mockall::Sequence::new();
    let mut device = MockBackend::new();
    device.expect_stop().times(1).in_sequence(&mut seq).returning(|| ());
    device
        .expect_speak()
        .withf(|text, _| text == "cat")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));

    let coordinator = VoiceCoordinator::new(Arc::new(device), Arc::new(MockBackend::new()), VoiceMethod::Device);
    coordinator.speak("cat", "").await.unwrap();
}

#[tokio::test]
async fn test_blank_text_touches_no_backend() {
    // Any call on either mock would panic
    let coordinator = VoiceCoordinator::new(
        Arc::new(MockBackend::new()),
        Arc::new(MockBackend::new()),
        VoiceMethod::Neural,
    );
    coordinator.speak("   ", "voiceX").await.unwrap();
    coordinator.speak("", "voiceX").await.unwrap();
}

#[tokio::test]
async fn test_neural_speak_initializes_new_voice() {
    let mut neural = MockBackend::new();
    neural.expect_stop().returning(|| ());
    neural.expect_current_voice().returning(|| None);
    neural
        .expect_initialize()
        .withf(|voice_id, _| voice_id == "voiceX")
        .times(1)
        .returning(|_, _| Ok(()));
    neural
        .expect_speak()
        .withf(|text, voice_id| text == "dog" && voice_id == "voiceX")
        .times(1)
        .returning(|_, _| Ok(()));

    let coordinator = VoiceCoordinator::new(Arc::new(MockBackend::new()), Arc::new(neural), VoiceMethod::Neural);
    coordinator.speak("dog", "voiceX").await.unwrap();
    assert!(!coordinator.is_downloading());
}

#[tokio::test]
async fn test_failed_download_is_reported_and_not_cached() {
    let mut neural = MockBackend::new();
    neural.expect_stop().returning(|| ());
    neural.expect_current_voice().returning(|| None);
    neural
        .expect_initialize()
        .times(2)
        .returning(|_, _| Err(VoiceError::Download("offline".to_string())));
    neural.expect_speak().times(0);

    let coordinator = VoiceCoordinator::new(Arc::new(MockBackend::new()), Arc::new(neural), VoiceMethod::Neural);
    let err = coordinator.speak("dog", "voiceX").await.unwrap_err();
    assert_eq!(err, VoiceError::Download("offline".to_string()));
    assert!(!coordinator.is_downloading());

    // The next attempt downloads again
    assert!(coordinator.speak("dog", "voiceX").await.is_err());
}

#[tokio::test]
async fn test_ensure_ready_skips_cached_voice() {
    let mut neural = MockBackend::new();
    neural.expect_current_voice().returning(|| Some("voiceX".to_string()));
    neural.expect_initialize().times(0);

    let coordinator = VoiceCoordinator::new(Arc::new(MockBackend::new()), Arc::new(neural), VoiceMethod::Neural);
    coordinator.ensure_ready("voiceX", None).await.unwrap();
    assert_eq!(coordinator.current_voice_id().as_deref(), Some("voiceX"));
}

struct FixedCatalog(Vec<Voice>);

#[async_trait]
impl SpeechPlatform for FixedCatalog {
    async fn voices(&self) -> Vec<Voice> {
        self.0.clone()
    }

    async fn voices_changed(&self) {
        std::future::pending::<()>().await
    }

    async fn speak(&self, _utterance: Utterance) -> Result<(), VoiceError> {
        Ok(())
    }

    fn cancel(&self) {}
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_set_device_twice_matches_once() {
    let platform = Arc::new(FixedCatalog(vec![
        Voice {
            id: "fr".into(),
            name: "French".into(),
            language: "fr-FR".into(),
        },
        Voice {
            id: "en-us".into(),
            name: "English".into(),
            language: "en-US".into(),
        },
    ]));

    let once = Arc::new(DeviceVoice::new(platform.clone(), "en"));
    let coordinator = VoiceCoordinator::new(once.clone(), Arc::new(MockBackend::new()), VoiceMethod::Device);
    coordinator.set_method(VoiceMethod::Device);
    wait_until(|| coordinator.is_initialized()).await;

    let twice = Arc::new(DeviceVoice::new(platform, "en"));
    let coordinator = VoiceCoordinator::new(twice.clone(), Arc::new(MockBackend::new()), VoiceMethod::Device);
    coordinator.set_method(VoiceMethod::Device);
    coordinator.set_method(VoiceMethod::Device);
    wait_until(|| coordinator.is_initialized()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(coordinator.method(), VoiceMethod::Device);
    assert_eq!(twice.selected_voice(), once.selected_voice());
    assert_eq!(twice.current_voice().as_deref(), Some("en-us"));
}

#[tokio::test]
async fn test_switching_method_silences_previous_backend() {
    let (stopped_tx, stopped_rx) = oneshot::channel::<()>();
    let stopped_tx = Mutex::new(Some(stopped_tx));
    let mut device = MockBackend::new();
    device.expect_stop().times(1).returning(move || {
        if let Some(tx) = stopped_tx.lock().take() {
            let _ = tx.send(());
        }
    });

    let coordinator = VoiceCoordinator::new(Arc::new(device), Arc::new(MockBackend::new()), VoiceMethod::Device);
    coordinator.set_method(VoiceMethod::Neural);
    assert_eq!(coordinator.method(), VoiceMethod::Neural);

    tokio::time::timeout(Duration::from_secs(5), stopped_rx)
        .await
        .expect("device backend was not stopped")
        .unwrap();
}

/// Plays until stopped, logging what a listener would hear.
#[derive(Default)]
struct HeldPlayback {
    events: Mutex<Vec<String>>,
    playing: Mutex<Option<oneshot::Sender<()>>>,
}

impl HeldPlayback {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl SynthesisBackend for HeldPlayback {
    async fn initialize(&self, _voice_id: &str, _on_progress: Option<ProgressCallback>) -> Result<(), VoiceError> {
        Ok(())
    }

    async fn speak(&self, text: &str, _voice_id: &str) -> Result<(), VoiceError> {
        let (tx, rx) = oneshot::channel();
        *self.playing.lock() = Some(tx);
        self.events.lock().push(format!("play:{}", text));
        let _ = rx.await;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(tx) = self.playing.lock().take() {
            let _ = tx.send(());
        }
        self.events.lock().push("stop".to_string());
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn current_voice(&self) -> Option<String> {
        None
    }
}

#[tokio::test]
async fn test_second_word_cuts_off_the_first() {
    let backend = Arc::new(HeldPlayback::default());
    let coordinator = Arc::new(VoiceCoordinator::new(
        backend.clone(),
        Arc::new(MockBackend::new()),
        VoiceMethod::Device,
    ));

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.speak("cat", "").await })
    };
    wait_until(|| backend.events().contains(&"play:cat".to_string())).await;

    let second = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.speak("dog", "").await })
    };
    wait_until(|| backend.events().contains(&"play:dog".to_string())).await;

    // "cat" finished as soon as "dog" stopped it
    tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let events = backend.events();
    let cat = events.iter().position(|e| e == "play:cat").unwrap();
    let dog = events.iter().position(|e| e == "play:dog").unwrap();
    assert!(events[cat..dog].contains(&"stop".to_string()));
    assert_eq!(events.iter().filter(|e| e.starts_with("play:")).last().unwrap(), "play:dog");

    coordinator.stop().await;
    second.await.unwrap().unwrap();
}

/// Downloads block until the gate is opened.
struct GatedEngine {
    gate: tokio::sync::Semaphore,
    downloads: std::sync::atomic::AtomicUsize,
}

impl GatedEngine {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Semaphore::new(0),
            downloads: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn downloads(&self) -> usize {
        self.downloads.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn open(&self) {
        self.gate.add_permits(16);
    }
}

#[async_trait]
impl InferenceEngine for GatedEngine {
    async fn download(&self, _voice_id: &str, _on_progress: Option<ProgressCallback>) -> Result<(), VoiceError> {
        self.downloads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| VoiceError::Download(e.to_string()))?;
        Ok(())
    }

    async fn predict(&self, text: &str, _voice_id: &str) -> Result<Vec<u8>, VoiceError> {
        Ok(text.as_bytes().to_vec())
    }
}

#[derive(Default)]
struct RecordingSink {
    played: Mutex<Vec<String>>,
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, wav: Vec<u8>) -> Result<(), VoiceError> {
        self.played.lock().push(String::from_utf8_lossy(&wav).to_string());
        Ok(())
    }

    fn stop(&self) {}
}

fn neural_coordinator(engine: Arc<GatedEngine>, sink: Arc<RecordingSink>) -> Arc<VoiceCoordinator> {
    let neural = Arc::new(NeuralVoice::new(engine, sink));
    Arc::new(VoiceCoordinator::new(
        Arc::new(MockBackend::new()),
        neural,
        VoiceMethod::Neural,
    ))
}

#[tokio::test]
async fn test_stop_while_downloading_stays_silent() {
    let engine = Arc::new(GatedEngine::new());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = neural_coordinator(engine.clone(), sink.clone());

    let speaking = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.speak("cat", "voiceX").await })
    };
    wait_until(|| engine.downloads() == 1).await;
    assert!(coordinator.is_downloading());

    coordinator.stop().await;
    engine.open();
    speaking.await.unwrap().unwrap();

    assert!(sink.played.lock().is_empty());
    // The download still finished and the voice is cached
    assert_eq!(coordinator.current_voice_id().as_deref(), Some("voiceX"));
    assert!(!coordinator.is_downloading());
}

#[tokio::test]
async fn test_newer_word_wins_while_downloading() {
    let engine = Arc::new(GatedEngine::new());
    let sink = Arc::new(RecordingSink::default());
    let coordinator = neural_coordinator(engine.clone(), sink.clone());

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.speak("cat", "voiceX").await })
    };
    wait_until(|| engine.downloads() == 1).await;

    let second = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.speak("dog", "voiceX").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.downloads(), 1);

    engine.open();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(sink.played.lock().as_slice(), &["dog".to_string()]);
    assert_eq!(engine.downloads(), 1);
    assert!(!coordinator.is_downloading());
}

#[tokio::test]
async fn test_concurrent_ensure_ready_downloads_once() {
    let engine = Arc::new(GatedEngine::new());
    let coordinator = neural_coordinator(engine.clone(), Arc::new(RecordingSink::default()));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_ready("voiceX", None).await })
        })
        .collect();
    wait_until(|| engine.downloads() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    engine.open();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    assert_eq!(engine.downloads(), 1);
    assert_eq!(coordinator.current_voice_id().as_deref(), Some("voiceX"));
}

#[test]
fn test_set_method_without_runtime() {
    // Neither mock expects a call: no background work may start
    let coordinator = VoiceCoordinator::new(
        Arc::new(MockBackend::new()),
        Arc::new(MockBackend::new()),
        VoiceMethod::Neural,
    );
    coordinator.set_method(VoiceMethod::Device);
    assert_eq!(coordinator.method(), VoiceMethod::Device);
}

struct SilentSink;

#[async_trait]
impl AudioSink for SilentSink {
    async fn play(&self, _wav: Vec<u8>) -> Result<(), VoiceError> {
        Ok(())
    }

    fn stop(&self) {}
}

fn catalog_body() -> String {
    serde_json::json!({
        "voiceX": {
            "name": "x",
            "quality": "medium",
            "language": { "name_english": "English" },
            "files": {
                "en/voiceX/voiceX.onnx": { "size_bytes": 1000 },
                "en/voiceX/voiceX.onnx.json": { "size_bytes": 2 }
            }
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_download_reports_progress_to_completion() {
    let mut server = mockito::Server::new_async().await;
    let catalog = server
        .mock("GET", "/voices.json")
        .with_body(catalog_body())
        .expect(1)
        .create_async()
        .await;
    let model = server
        .mock("GET", "/en/voiceX/voiceX.onnx")
        .with_body(vec![7u8; 1000])
        .expect(1)
        .create_async()
        .await;
    let config = server
        .mock("GET", "/en/voiceX/voiceX.onnx.json")
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = PiperEngine::new("piper", dir.path(), server.url(), Duration::from_secs(5)).unwrap();
    let voice = NeuralVoice::new(Arc::new(engine), Arc::new(SilentSink));

    let seen = Arc::new(Mutex::new(Vec::<DownloadProgress>::new()));
    let log = seen.clone();
    let on_progress: ProgressCallback = Arc::new(move |p| log.lock().push(p));
    voice.initialize("voiceX", Some(on_progress.clone())).await.unwrap();

    let model_progress: Vec<DownloadProgress> = seen
        .lock()
        .iter()
        .filter(|p| p.url.ends_with(".onnx"))
        .cloned()
        .collect();
    assert!(!model_progress.is_empty());
    assert!(model_progress.windows(2).all(|w| w[0].loaded <= w[1].loaded));
    let last = model_progress.last().unwrap();
    assert_eq!(last.loaded, 1000);
    assert_eq!(last.loaded, last.total);
    assert_eq!(last.percent(), Some(100));

    assert!(voice.is_ready());
    assert_eq!(std::fs::read(dir.path().join("voiceX.onnx")).unwrap().len(), 1000);
    assert!(!dir.path().join("voiceX.part").exists());

    // Cached voices are not fetched again
    voice.initialize("voiceX", Some(on_progress)).await.unwrap();
    catalog.assert_async().await;
    model.assert_async().await;
    config.assert_async().await;
}

#[tokio::test]
async fn test_download_unknown_voice() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/voices.json")
        .with_body(catalog_body())
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = PiperEngine::new("piper", dir.path(), server.url(), Duration::from_secs(5)).unwrap();
    let voice = NeuralVoice::new(Arc::new(engine), Arc::new(SilentSink));

    let err = voice.initialize("voiceY", None).await.unwrap_err();
    assert_eq!(err, VoiceError::UnknownVoice("voiceY".to_string()));
    assert!(!voice.is_ready());
}

#[tokio::test]
async fn test_catalog_listing_from_repository() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/voices.json")
        .with_body(catalog_body())
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let engine = PiperEngine::new("piper", dir.path(), server.url(), Duration::from_secs(5)).unwrap();
    let voices = engine.list_downloadable_voices().await.unwrap();
    assert_eq!(
        voices,
        vec![Voice {
            id: "voiceX".into(),
            name: "x (medium)".into(),
            language: "English".into(),
        }]
    );
}
