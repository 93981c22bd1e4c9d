//! Speech synthesis gateway.
//!
//! The engine renders into a private scratch directory that exists only for
//! the duration of one call; the bytes are read back into memory and the
//! directory is removed whether or not synthesis succeeded.

use std::io::{Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vistalk_core::config::SpeechConfig;
use vistalk_core::types::AudioArtifact;

/// Seconds of audio assumed per character when the WAV header is unreadable.
const SECONDS_PER_CHAR: f64 = 0.1;

/// Renders text to a WAV file.
pub trait SpeechEngine: Send + Sync {
    fn id(&self) -> &str;

    /// Write speech for `text` to `output`. Blocking.
    fn render(
        &self,
        text: &str,
        voice: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// External TTS program (Kokoro, Piper, espeak-ng, `say`, ...).
pub struct CommandSpeechEngine {
    program: String,
    args: Vec<String>,
    speed: f64,
    lang: String,
    sample_rate: u32,
    timeout: Duration,
}

impl CommandSpeechEngine {
    /// Returns `None` when no command is configured.
    pub fn from_config(config: &SpeechConfig) -> Option<Self> {
        let program = config.command.as_deref()?.trim();
        if program.is_empty() {
            return None;
        }
        Some(Self {
            program: program.to_string(),
            args: config.args.clone(),
            speed: config.speed,
            lang: config.lang.clone(),
            sample_rate: config.sample_rate,
            timeout: config.timeout(),
        })
    }

    /// Substitute placeholders into the configured arguments.
    ///
    /// Returns the arguments and whether `{text}` was consumed by them.
    fn expand_args(&self, text: &str, voice: &str, output: &Path) -> (Vec<String>, bool) {
        let stem = output.with_extension("");
        let mut uses_text = false;
        let args = self
            .args
            .iter()
            .map(|arg| {
                uses_text |= arg.contains("{text}");
                arg.replace("{output_stem}", &stem.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{voice}", voice)
                    .replace("{speed}", &self.speed.to_string())
                    .replace("{sample_rate}", &self.sample_rate.to_string())
                    .replace("{lang}", &self.lang)
                    .replace("{text}", text)
            })
            .collect();
        (args, uses_text)
    }
}

impl SpeechEngine for CommandSpeechEngine {
    fn id(&self) -> &str {
        &self.program
    }

    fn render(
        &self,
        text: &str,
        voice: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let (args, uses_text) = self.expand_args(text, voice, output);
        debug!(program = %self.program, ?args, "Spawning speech engine");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(if uses_text { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawning {}: {e}", self.program))?;

        let stderr = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut s) = stderr {
                let _ = s.read_to_string(&mut buf);
            }
            buf
        });

        // Fed from its own thread so a full pipe cannot stall the deadline below
        let stdin_writer = child.stdin.take().map(|mut stdin| {
            let input = text.as_bytes().to_vec();
            std::thread::spawn(move || {
                // Dropping stdin closes it so the engine sees EOF
                if let Err(e) = stdin.write_all(&input) {
                    debug!(%e, "Speech engine closed stdin early");
                }
            })
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() || Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                if cancel.is_cancelled() {
                    anyhow::bail!("speech synthesis cancelled");
                }
                anyhow::bail!("speech engine timed out after {}s", self.timeout.as_secs());
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        if let Some(writer) = stdin_writer {
            let _ = writer.join();
        }
        let stderr = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            let tail: String = stderr.trim().lines().last().unwrap_or("").to_string();
            anyhow::bail!("speech engine exited with {status}: {tail}");
        }
        Ok(())
    }
}

pub struct SpeechGateway {
    engine: Option<Arc<dyn SpeechEngine>>,
    scratch_dir: Option<PathBuf>,
}

impl SpeechGateway {
    /// `scratch_dir` defaults to the system temp directory.
    pub fn new(engine: Option<Arc<dyn SpeechEngine>>, scratch_dir: Option<PathBuf>) -> Self {
        Self {
            engine,
            scratch_dir,
        }
    }

    pub fn from_config(config: &SpeechConfig) -> Self {
        let engine = CommandSpeechEngine::from_config(config);
        match &engine {
            Some(e) => info!(engine = %e.program, "Speech engine configured"),
            None => info!("No speech engine configured; audio will be reported as unavailable"),
        }
        Self::new(engine.map(|e| Arc::new(e) as Arc<dyn SpeechEngine>), None)
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_some()
    }

    /// Synthesize speech for `text`. Never panics or errors past this point.
    pub fn synthesize(&self, text: &str, voice: &str, cancel: &CancellationToken) -> AudioArtifact {
        let text = text.trim();
        if text.is_empty() {
            return AudioArtifact::failed("no text to synthesize");
        }
        let Some(engine) = &self.engine else {
            return AudioArtifact::failed("speech engine not configured");
        };

        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.render_to_memory(engine.as_ref(), text, voice, cancel)
        }));
        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(artifact)) => {
                debug!(
                    engine = engine.id(),
                    voice,
                    bytes = artifact.bytes.len(),
                    audio_secs = artifact.duration_seconds,
                    duration_secs = elapsed,
                    "Speech synthesized"
                );
                artifact
            }
            Ok(Err(e)) => {
                warn!(engine = engine.id(), %e, duration_secs = elapsed, "Speech synthesis failed");
                AudioArtifact::failed(format!("{e:#}"))
            }
            Err(_) => {
                warn!(engine = engine.id(), "Speech engine panicked");
                AudioArtifact::failed("speech engine panicked")
            }
        }
    }

    fn render_to_memory(
        &self,
        engine: &dyn SpeechEngine,
        text: &str,
        voice: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<AudioArtifact> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("vistalk-tts-");
        let scratch = match &self.scratch_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };

        let output = scratch.path().join("speech.wav");
        let rendered = engine.render(text, voice, &output, cancel).and_then(|()| {
            if !output.exists() {
                anyhow::bail!("speech engine produced no audio file");
            }
            let bytes = std::fs::read(&output)?;
            let duration = wav_duration(&output)
                .unwrap_or_else(|| text.chars().count() as f64 * SECONDS_PER_CHAR);
            Ok(AudioArtifact::wav(bytes, duration))
        });

        if let Err(e) = scratch.close() {
            warn!(%e, "Failed to remove speech scratch directory");
        }
        rendered
    }
}

/// Audio length from the WAV header, `None` when unreadable.
pub fn wav_duration(path: &Path) -> Option<f64> {
    let reader = hound::WavReader::open(path).ok()?;
    let rate = reader.spec().sample_rate;
    if rate == 0 {
        return None;
    }
    Some(reader.duration() as f64 / rate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes `seconds` of silence at 10 kHz.
    fn write_wav(path: &Path, seconds: f64) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 10_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..(seconds * 10_000.0).round() as usize {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    struct SilenceEngine(f64);

    impl SpeechEngine for SilenceEngine {
        fn id(&self) -> &str {
            "silence"
        }

        fn render(
            &self,
            _text: &str,
            _voice: &str,
            output: &Path,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            write_wav(output, self.0);
            Ok(())
        }
    }

    struct GarbageEngine;

    impl SpeechEngine for GarbageEngine {
        fn id(&self) -> &str {
            "garbage"
        }

        fn render(
            &self,
            _text: &str,
            _voice: &str,
            output: &Path,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            std::fs::write(output, b"not a wav")?;
            Ok(())
        }
    }

    struct SilentFailureEngine;

    impl SpeechEngine for SilentFailureEngine {
        fn id(&self) -> &str {
            "nothing"
        }

        fn render(
            &self,
            _text: &str,
            _voice: &str,
            _output: &Path,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn gateway(engine: impl SpeechEngine + 'static, scratch: &Path) -> SpeechGateway {
        let engine: Arc<dyn SpeechEngine> = Arc::new(engine);
        SpeechGateway::new(Some(engine), Some(scratch.to_path_buf()))
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_duration_from_header() {
        let scratch = tempfile::tempdir().unwrap();
        let gw = gateway(SilenceEngine(2.3), scratch.path());
        let artifact = gw.synthesize(
            "Hand me the screwdriver.",
            "am_michael",
            &CancellationToken::new(),
        );

        assert!(artifact.succeeded);
        assert!((artifact.duration_seconds - 2.3).abs() < 1e-3);
        assert_eq!(&artifact.bytes[..4], b"RIFF");
        assert_eq!(entries(scratch.path()), 0);
    }

    #[test]
    fn test_duration_falls_back_to_text_length() {
        let scratch = tempfile::tempdir().unwrap();
        let gw = gateway(GarbageEngine, scratch.path());
        let artifact = gw.synthesize("abcdefghij", "am_michael", &CancellationToken::new());

        assert!(artifact.succeeded);
        assert!((artifact.duration_seconds - 1.0).abs() < 1e-9);
        assert_eq!(entries(scratch.path()), 0);
    }

    #[test]
    fn test_missing_output_is_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let gw = gateway(SilentFailureEngine, scratch.path());
        let artifact = gw.synthesize("hello", "am_michael", &CancellationToken::new());

        assert!(!artifact.succeeded);
        assert!(artifact.bytes.is_empty());
        assert!(artifact.error_detail.unwrap().contains("no audio file"));
        assert_eq!(entries(scratch.path()), 0);
    }

    #[test]
    fn test_empty_text_is_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let gw = gateway(SilenceEngine(1.0), scratch.path());
        let artifact = gw.synthesize("   ", "am_michael", &CancellationToken::new());
        assert!(!artifact.succeeded);
    }

    #[test]
    fn test_unconfigured_gateway() {
        let gw = SpeechGateway::from_config(&SpeechConfig::default());
        assert!(!gw.is_ready());
        let artifact = gw.synthesize("hello", "am_michael", &CancellationToken::new());
        assert!(!artifact.succeeded);
        assert_eq!(
            artifact.error_detail.as_deref(),
            Some("speech engine not configured")
        );
    }

    #[test]
    fn test_expand_args_placeholders() {
        let engine = CommandSpeechEngine::from_config(&SpeechConfig {
            command: Some("kokoro".into()),
            args: vec![
                "--voice={voice}".into(),
                "--speed={speed}".into(),
                "-o".into(),
                "{output}".into(),
                "--prefix={output_stem}".into(),
            ],
            ..SpeechConfig::default()
        })
        .unwrap();

        let (args, uses_text) =
            engine.expand_args("hi", "af_bella", Path::new("/tmp/x/speech.wav"));
        assert_eq!(
            args,
            vec![
                "--voice=af_bella",
                "--speed=1.2",
                "-o",
                "/tmp/x/speech.wav",
                "--prefix=/tmp/x/speech",
            ]
        );
        assert!(!uses_text);
    }

    #[test]
    fn test_blank_command_is_unconfigured() {
        let config = SpeechConfig {
            command: Some("  ".into()),
            ..SpeechConfig::default()
        };
        assert!(CommandSpeechEngine::from_config(&config).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_engine_copies_fixture() {
        let fixtures = tempfile::tempdir().unwrap();
        let fixture = fixtures.path().join("fixture.wav");
        write_wav(&fixture, 0.5);

        let engine = CommandSpeechEngine::from_config(&SpeechConfig {
            command: Some("cp".into()),
            args: vec![fixture.to_string_lossy().into_owned(), "{output}".into()],
            ..SpeechConfig::default()
        })
        .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let gw = gateway(engine, scratch.path());
        let artifact = gw.synthesize("hello", "am_michael", &CancellationToken::new());
        assert!(artifact.succeeded, "{:?}", artifact.error_detail);
        assert!((artifact.duration_seconds - 0.5).abs() < 1e-3);
        assert_eq!(entries(scratch.path()), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_engine_failure_cleans_up() {
        let engine = CommandSpeechEngine::from_config(&SpeechConfig {
            command: Some("false".into()),
            ..SpeechConfig::default()
        })
        .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let gw = gateway(engine, scratch.path());
        let artifact = gw.synthesize("hello", "am_michael", &CancellationToken::new());
        assert!(!artifact.succeeded);
        assert_eq!(entries(scratch.path()), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_engine_honours_cancellation() {
        let engine = CommandSpeechEngine::from_config(&SpeechConfig {
            command: Some("sleep".into()),
            args: vec!["5".into()],
            ..SpeechConfig::default()
        })
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        let scratch = tempfile::tempdir().unwrap();
        let artifact = gateway(engine, scratch.path()).synthesize("hello", "am_michael", &cancel);

        assert!(!artifact.succeeded);
        assert!(artifact.error_detail.unwrap().contains("cancelled"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_engine_drains_stderr_while_reading_stdin() {
        // Fills the stderr pipe before it reads any of its input
        let engine = CommandSpeechEngine::from_config(&SpeechConfig {
            command: Some("sh".into()),
            args: vec![
                "-c".into(),
                r#"head -c 200000 /dev/zero >&2; cat > "$0""#.into(),
                "{output}".into(),
            ],
            timeout_secs: 10,
            ..SpeechConfig::default()
        })
        .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let output = scratch.path().join("speech.wav");
        let text = "a".repeat(200_000);
        engine
            .render(&text, "am_michael", &output, &CancellationToken::new())
            .unwrap();
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 200_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_engine_timeout_applies_while_stdin_is_full() {
        let engine = CommandSpeechEngine::from_config(&SpeechConfig {
            command: Some("sleep".into()),
            args: vec!["5".into()],
            timeout_secs: 1,
            ..SpeechConfig::default()
        })
        .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let output = scratch.path().join("speech.wav");
        let text = "a".repeat(200_000);
        let start = Instant::now();
        let err = engine
            .render(&text, "am_michael", &output, &CancellationToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
