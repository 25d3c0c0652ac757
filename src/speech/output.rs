use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::SpeechConfig;

/// One request to speak a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub locale: String,
    pub rate: f32,
    pub pitch: f32,
}

/// Handle to audio that is currently being played.
pub trait Playback: Send {
    fn cancel(&mut self);
    fn is_active(&mut self) -> bool;
}

pub trait Synthesizer: Send + Sync {
    fn is_available(&self) -> bool;
    fn play(&self, utterance: &Utterance) -> Result<Box<dyn Playback>>;
}

/// Plays one utterance at a time; every new request replaces the last.
pub struct SpeechOutputController {
    synthesizer: Box<dyn Synthesizer>,
    locale: String,
    rate: f32,
    pitch: f32,
    current: Mutex<Option<Box<dyn Playback>>>,
}

impl SpeechOutputController {
    pub fn new(synthesizer: Box<dyn Synthesizer>, config: &SpeechConfig) -> Self {
        Self {
            synthesizer,
            locale: config.locale.clone(),
            rate: config.rate,
            pitch: config.pitch,
            current: Mutex::new(None),
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Box<dyn Playback>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel whatever is playing and start speaking `text`.
    ///
    /// Without a synthesizer on this system this does nothing.
    pub fn speak(&self, text: &str) {
        if !self.synthesizer.is_available() {
            debug!("Speech synthesis unavailable, not speaking");
            return;
        }

        let mut current = self.lock_current();
        if let Some(mut playback) = current.take() {
            playback.cancel();
        }

        let text = prepare_for_speech(text);
        if text.is_empty() {
            return;
        }

        let utterance = Utterance {
            text,
            locale: self.locale.clone(),
            rate: self.rate,
            pitch: self.pitch,
        };
        match self.synthesizer.play(&utterance) {
            Ok(playback) => *current = Some(playback),
            Err(e) => warn!("Failed to start speech playback: {:#}", e),
        }
    }

    pub fn stop(&self) {
        if let Some(mut playback) = self.lock_current().take() {
            playback.cancel();
            debug!("Speech playback stopped");
        }
    }

    pub fn is_busy(&self) -> bool {
        let mut current = self.lock_current();
        let active = current.as_mut().is_some_and(|p| p.is_active());
        if !active {
            *current = None;
        }
        active
    }
}

/// Strip markdown so the synthesizer does not read symbols aloud.
pub fn prepare_for_speech(text: &str) -> String {
    static LINK: OnceLock<Regex> = OnceLock::new();
    static LINE_MARKER: OnceLock<Regex> = OnceLock::new();
    static BULLET: OnceLock<Regex> = OnceLock::new();
    static MARKUP: OnceLock<Regex> = OnceLock::new();
    static SPACE: OnceLock<Regex> = OnceLock::new();

    let link = LINK.get_or_init(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
    // Heading and blockquote markers only count at the start of a line.
    let line_marker = LINE_MARKER.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*(?:#{1,6}[ \t]+|>+[ \t]*)").expect("valid regex")
    });
    let bullet =
        BULLET.get_or_init(|| Regex::new(r"(?m)^\s*(?:[-+•]|\d+\.)\s+").expect("valid regex"));
    let markup = MARKUP.get_or_init(|| Regex::new(r"[*`~]+").expect("valid regex"));
    let space = SPACE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"));

    let text = link.replace_all(text, "$1");
    let text = line_marker.replace_all(&text, "");
    let text = bullet.replace_all(&text, "");
    let text = markup.replace_all(&text, " ");
    space.replace_all(&text, " ").trim().to_string()
}

/// espeak voice name for a BCP 47 locale.
fn espeak_voice(locale: &str) -> String {
    let lower = locale.to_lowercase().replace('_', "-");
    match lower.as_str() {
        "en-us" | "en-gb" => lower,
        _ => lower.split('-').next().unwrap_or("en").to_string(),
    }
}

/// Speaks through an espeak-compatible command line synthesizer.
pub struct CommandSynthesizer {
    program: Option<PathBuf>,
    voice: Option<String>,
}

impl CommandSynthesizer {
    pub fn new(config: &SpeechConfig) -> Self {
        let program = config
            .synthesizers
            .iter()
            .find_map(|name| which::which(name).ok());
        match &program {
            Some(path) => info!("Speech synthesis via {}", path.display()),
            None => info!(
                "No speech synthesizer found (tried {:?}), replies will not be spoken",
                config.synthesizers
            ),
        }
        Self {
            program,
            voice: config.voice.clone(),
        }
    }

    fn args(&self, utterance: &Utterance) -> Vec<String> {
        let voice = self
            .voice
            .clone()
            .unwrap_or_else(|| espeak_voice(&utterance.locale));
        let words_per_minute = (175.0 * utterance.rate).round().clamp(80.0, 450.0) as u32;
        let pitch = (50.0 * utterance.pitch).round().clamp(0.0, 99.0) as u32;
        vec![
            "-v".to_string(),
            voice,
            "-s".to_string(),
            words_per_minute.to_string(),
            "-p".to_string(),
            pitch.to_string(),
            "--".to_string(),
            utterance.text.clone(),
        ]
    }
}

impl Synthesizer for CommandSynthesizer {
    fn is_available(&self) -> bool {
        self.program.is_some()
    }

    fn play(&self, utterance: &Utterance) -> Result<Box<dyn Playback>> {
        let program = self
            .program
            .as_ref()
            .context("no speech synthesizer available")?;
        let child = Command::new(program)
            .args(self.args(utterance))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", program.display()))?;
        debug!("Speaking {} characters", utterance.text.len());
        Ok(Box::new(ProcessPlayback { child }))
    }
}

struct ProcessPlayback {
    child: Child,
}

impl Playback for ProcessPlayback {
    fn cancel(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Synthesizer already finished: {}", e);
        }
    }

    fn is_active(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}
