//! Conversation orchestration.
//!
//! The orchestrator owns the conversation history, the input buffer and the
//! `pending` flag. A submission claims `pending` under the session lock before
//! awaiting the gateway, so at most one completion call is outstanding per
//! session; submissions made meanwhile are ignored rather than queued.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AgrivaniError;
use crate::gateway::{AssistantGateway, CompletionGateway};
use crate::message::{Conversation, Message};
use crate::speech::{
    CaptureEvent, CommandCaptureBackend, CommandSynthesizer, SpeechInputController,
    SpeechOutputController, VoiceCaptureState,
};

/// Assistant message recorded when the completion service cannot be used.
pub const FALLBACK_MESSAGE: &str = "Error: Unable to connect to AI service.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptyInput,
    Pending,
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnoreReason::EmptyInput => write!(f, "empty input"),
            IgnoreReason::Pending => write!(f, "a reply is still pending"),
        }
    }
}

/// How a submission resolved. Submissions never fail with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Ignored(IgnoreReason),
    Replied(String),
    Failed,
}

struct SessionState {
    conversation: Conversation,
    pending: bool,
    input: String,
}

/// Clears `pending` when dropped, so every accepted submission releases the
/// flag exactly once whether it completes or its future is dropped.
struct PendingGuard<'a> {
    state: &'a Mutex<SessionState>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending = false;
    }
}

pub struct ConversationOrchestrator {
    session_id: Uuid,
    gateway: Arc<dyn CompletionGateway>,
    speech_in: SpeechInputController,
    speech_out: SpeechOutputController,
    quick_questions: Vec<String>,
    state: Mutex<SessionState>,
}

impl ConversationOrchestrator {
    pub fn new(
        greeting: impl Into<String>,
        gateway: Arc<dyn CompletionGateway>,
        speech_in: SpeechInputController,
        speech_out: SpeechOutputController,
    ) -> Self {
        let conversation = Conversation::new(greeting);
        let session_id = conversation.id();
        Self {
            session_id,
            gateway,
            speech_in,
            speech_out,
            quick_questions: Vec::new(),
            state: Mutex::new(SessionState {
                conversation,
                pending: false,
                input: String::new(),
            }),
        }
    }

    /// Wire up the HTTP gateway and the command line speech backends.
    pub fn from_config(config: &Config) -> Result<Self, AgrivaniError> {
        let gateway = AssistantGateway::new(&config.assistant)?;
        let speech_in = SpeechInputController::new(Box::new(CommandCaptureBackend::new(
            &config.speech,
        )));
        let speech_out = SpeechOutputController::new(
            Box::new(CommandSynthesizer::new(&config.speech)),
            &config.speech,
        );

        Ok(Self::new(
            config.conversation.greeting.clone(),
            Arc::new(gateway),
            speech_in,
            speech_out,
        )
        .with_quick_questions(config.conversation.quick_questions.clone()))
    }

    pub fn with_quick_questions(mut self, questions: Vec<String>) -> Self {
        self.quick_questions = questions;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn history(&self) -> Vec<Message> {
        self.lock_state().conversation.messages().to_vec()
    }

    pub fn is_pending(&self) -> bool {
        self.lock_state().pending
    }

    pub fn input(&self) -> String {
        self.lock_state().input.clone()
    }

    pub fn set_input(&self, text: impl Into<String>) {
        self.lock_state().input = text.into();
    }

    pub fn quick_questions(&self) -> &[String] {
        &self.quick_questions
    }

    /// Put a quick question into the input buffer for the user to confirm.
    pub fn choose_quick_question(&self, index: usize) -> Result<String, AgrivaniError> {
        let question = self.quick_questions.get(index).ok_or_else(|| {
            AgrivaniError::InvalidInput(format!(
                "no quick question {} (have {})",
                index + 1,
                self.quick_questions.len()
            ))
        })?;
        self.set_input(question.clone());
        Ok(question.clone())
    }

    /// Fill the input buffer with a voice transcript. Nothing is sent until
    /// the user confirms with [`submit_input`](Self::submit_input).
    pub fn submit_voice_transcript(&self, text: &str) {
        debug!("Voice transcript placed in input buffer");
        self.set_input(text);
    }

    /// Send whatever is in the input buffer.
    ///
    /// The buffer is cleared only when the submission is accepted.
    pub async fn submit_input(&self) -> SubmitOutcome {
        let claimed = {
            let mut state = self.lock_state();
            let input = state.input.clone();
            let claimed = self.claim_turn(&mut state, &input);
            if claimed.is_ok() {
                state.input.clear();
            }
            claimed
        };
        self.run_turn(claimed).await
    }

    pub async fn submit_text(&self, input: &str) -> SubmitOutcome {
        let claimed = {
            let mut state = self.lock_state();
            self.claim_turn(&mut state, input)
        };
        self.run_turn(claimed).await
    }

    /// Record the user turn and claim `pending`; returns the transcript to send.
    fn claim_turn(
        &self,
        state: &mut SessionState,
        input: &str,
    ) -> Result<(Vec<Message>, PendingGuard<'_>), IgnoreReason> {
        if input.trim().is_empty() {
            return Err(IgnoreReason::EmptyInput);
        }
        if state.pending {
            return Err(IgnoreReason::Pending);
        }

        state.conversation.push(Message::user(input));
        state.pending = true;
        let transcript = state.conversation.messages().to_vec();

        Ok((transcript, PendingGuard { state: &self.state }))
    }

    async fn run_turn(
        &self,
        claimed: Result<(Vec<Message>, PendingGuard<'_>), IgnoreReason>,
    ) -> SubmitOutcome {
        let (transcript, guard) = match claimed {
            Ok(turn) => turn,
            Err(reason) => {
                debug!("Submission ignored: {}", reason);
                return SubmitOutcome::Ignored(reason);
            }
        };

        let span = info_span!("turn", session = %self.session_id, messages = transcript.len());
        let result = self
            .gateway
            .complete(&transcript)
            .instrument(span)
            .await;

        match result {
            Ok(reply) => {
                self.lock_state()
                    .conversation
                    .push(Message::assistant(reply.clone()));
                drop(guard);
                info!("Assistant replied ({} chars)", reply.len());
                self.speech_out.speak(&reply);
                SubmitOutcome::Replied(reply)
            }
            Err(e) => {
                error!("AI request failed: {}", e);
                self.lock_state()
                    .conversation
                    .push(Message::assistant(FALLBACK_MESSAGE));
                drop(guard);
                SubmitOutcome::Failed
            }
        }
    }

    pub fn voice_state(&self) -> VoiceCaptureState {
        self.speech_in.state()
    }

    pub fn toggle_voice(&self) -> Result<VoiceCaptureState, AgrivaniError> {
        self.speech_in.toggle()
    }

    pub async fn next_capture_event(&self) -> Option<CaptureEvent> {
        self.speech_in.next_event().await
    }

    /// Apply a capture event; a delivered transcript lands in the input buffer.
    pub fn handle_capture_event(&self, event: CaptureEvent) -> Option<String> {
        let transcript = self.speech_in.handle_event(event)?;
        self.submit_voice_transcript(&transcript);
        Some(transcript)
    }

    pub fn is_speaking(&self) -> bool {
        self.speech_out.is_busy()
    }

    pub fn stop_speaking(&self) {
        self.speech_out.stop();
    }
}
