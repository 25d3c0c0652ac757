//! Single-session speech capture.
//!
//! A [`SpeechInputController`] owns at most one capture device, opened on the
//! first toggle and reused for every later session. Devices report back through
//! an event channel; the controller ignores events that belong to a session it
//! has already moved past. Stopping a session is graceful: the one transcript
//! it still produces for the audio heard so far is delivered.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::SpeechConfig;
use crate::error::AgrivaniError;

/// How long a stopped recognizer may take to print its transcript.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCaptureState {
    Idle,
    Listening,
}

impl std::fmt::Display for VoiceCaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoiceCaptureState::Idle => write!(f, "idle"),
            VoiceCaptureState::Listening => write!(f, "listening"),
        }
    }
}

/// Signals emitted by a capture device, tagged with the session they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    FinalResult { session: u64, transcript: String },
    End { session: u64 },
}

pub trait CaptureDevice: Send {
    fn start(&mut self, session: u64) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

pub trait CaptureBackend: Send + Sync {
    fn is_available(&self) -> bool;
    fn open(&self, events: UnboundedSender<CaptureEvent>) -> Result<Box<dyn CaptureDevice>>;
}

struct CaptureSlot {
    state: VoiceCaptureState,
    device: Option<Box<dyn CaptureDevice>>,
    session: u64,
    /// Session stopped by `toggle` whose final transcript is still expected.
    draining: Option<u64>,
}

pub struct SpeechInputController {
    backend: Box<dyn CaptureBackend>,
    slot: Mutex<CaptureSlot>,
    events_tx: UnboundedSender<CaptureEvent>,
    events_rx: tokio::sync::Mutex<UnboundedReceiver<CaptureEvent>>,
}

impl SpeechInputController {
    pub fn new(backend: Box<dyn CaptureBackend>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            slot: Mutex::new(CaptureSlot {
                state: VoiceCaptureState::Idle,
                device: None,
                session: 0,
                draining: None,
            }),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, CaptureSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> VoiceCaptureState {
        self.lock_slot().state
    }

    pub fn is_listening(&self) -> bool {
        self.state() == VoiceCaptureState::Listening
    }

    /// Start capture when idle, stop it when listening.
    pub fn toggle(&self) -> Result<VoiceCaptureState, AgrivaniError> {
        let mut guard = self.lock_slot();
        let slot = &mut *guard;

        match slot.state {
            VoiceCaptureState::Idle => {
                if !self.backend.is_available() {
                    return Err(AgrivaniError::CapabilityUnavailable(
                        "Voice input not supported on this system.".to_string(),
                    ));
                }

                if slot.device.is_none() {
                    let device = self
                        .backend
                        .open(self.events_tx.clone())
                        .map_err(|e| AgrivaniError::Speech(format!("{:#}", e)))?;
                    info!("Capture device opened");
                    slot.device = Some(device);
                }

                let session = slot.session + 1;
                if let Some(device) = slot.device.as_mut() {
                    device
                        .start(session)
                        .map_err(|e| AgrivaniError::Speech(format!("{:#}", e)))?;
                }

                slot.session = session;
                slot.state = VoiceCaptureState::Listening;
                debug!("Capture session {} listening", session);
            }
            VoiceCaptureState::Listening => {
                slot.state = VoiceCaptureState::Idle;
                slot.draining = Some(slot.session);
                if let Some(device) = slot.device.as_mut() {
                    if let Err(e) = device.stop() {
                        warn!("Failed to stop capture session {}: {:#}", slot.session, e);
                    }
                }
                debug!("Capture session {} stopped", slot.session);
            }
        }

        Ok(slot.state)
    }

    /// Wait for the next event from the capture device.
    pub async fn next_event(&self) -> Option<CaptureEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Apply a device event; returns the transcript when one is delivered.
    pub fn handle_event(&self, event: CaptureEvent) -> Option<String> {
        let mut slot = self.lock_slot();
        let active = (slot.state == VoiceCaptureState::Listening).then_some(slot.session);

        match event {
            CaptureEvent::FinalResult {
                session,
                transcript,
            } => {
                if active == Some(session) {
                    slot.state = VoiceCaptureState::Idle;
                } else if slot.draining == Some(session) {
                    slot.draining = None;
                } else {
                    debug!("Dropping transcript from inactive capture session {}", session);
                    return None;
                }
                info!("Voice input: {}", transcript);
                Some(transcript)
            }
            CaptureEvent::End { session } => {
                if active == Some(session) {
                    slot.state = VoiceCaptureState::Idle;
                    debug!("Capture session {} ended", session);
                }
                if slot.draining == Some(session) {
                    slot.draining = None;
                }
                None
            }
        }
    }
}

/// Recognizer backed by an external program that prints the transcript on
/// stdout and exits when the utterance is complete. Closing its stdin asks it
/// to finish early with what it has heard so far.
pub struct CommandCaptureBackend {
    program: String,
    args: Vec<String>,
    locale: String,
}

impl CommandCaptureBackend {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            program: config.recognizer_command.clone(),
            args: config.recognizer_args.clone(),
            locale: config.locale.clone(),
        }
    }
}

impl CaptureBackend for CommandCaptureBackend {
    fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    fn open(&self, events: UnboundedSender<CaptureEvent>) -> Result<Box<dyn CaptureDevice>> {
        let program = which::which(&self.program)
            .with_context(|| format!("recognizer '{}' not found", self.program))?;
        Ok(Box::new(CommandCaptureDevice {
            program,
            args: self.args.clone(),
            locale: self.locale.clone(),
            events,
            cancel: None,
        }))
    }
}

struct CommandCaptureDevice {
    program: std::path::PathBuf,
    args: Vec<String>,
    locale: String,
    events: UnboundedSender<CaptureEvent>,
    cancel: Option<oneshot::Sender<()>>,
}

impl CaptureDevice for CommandCaptureDevice {
    fn start(&mut self, session: u64) -> Result<()> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env("AGRIVANI_LOCALE", &self.locale)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", self.program))?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancel = Some(cancel_tx);
        tokio::spawn(run_recognizer(child, session, cancel_rx, self.events.clone()));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            // The session may already have finished on its own.
            let _ = cancel.send(());
        }
        Ok(())
    }
}

async fn run_recognizer(
    mut child: Child,
    session: u64,
    mut cancel: oneshot::Receiver<()>,
    events: UnboundedSender<CaptureEvent>,
) {
    let stdin = child.stdin.take();
    let reading = read_transcript(child.stdout.take());
    tokio::pin!(reading);

    let transcript = tokio::select! {
        transcript = &mut reading => transcript,
        _ = &mut cancel => {
            match finish_early(stdin, &mut reading).await {
                Some(transcript) => transcript,
                None => {
                    warn!("Recognizer did not finish within {:?}, killing it", STOP_GRACE);
                    if let Err(e) = child.kill().await {
                        debug!("Recognizer already gone: {}", e);
                    }
                    let _ = events.send(CaptureEvent::End { session });
                    return;
                }
            }
        }
    };

    match child.wait().await {
        Ok(status) if status.success() => {
            if let Some(transcript) = transcript {
                let _ = events.send(CaptureEvent::FinalResult {
                    session,
                    transcript,
                });
            }
        }
        Ok(status) => warn!("Recognizer exited with {}", status),
        Err(e) => warn!("Failed to wait for recognizer: {}", e),
    }

    let _ = events.send(CaptureEvent::End { session });
}

/// Close stdin and give the recognizer `STOP_GRACE` to print its transcript.
async fn finish_early<F>(stdin: Option<ChildStdin>, reading: F) -> Option<Option<String>>
where
    F: std::future::Future<Output = Option<String>>,
{
    drop(stdin);
    tokio::time::timeout(STOP_GRACE, reading).await.ok()
}

async fn read_transcript(stdout: Option<ChildStdout>) -> Option<String> {
    let stdout = stdout?;
    let mut lines = BufReader::new(stdout).lines();
    let mut last = None;
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            last = Some(line.to_string());
        }
    }
    last
}
