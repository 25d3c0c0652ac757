//! Conversation flow through the orchestrator with scripted collaborators.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, Notify};

use agrivani::config::SpeechConfig;
use agrivani::speech::{
    CaptureBackend, CaptureDevice, CaptureEvent, Playback, Synthesizer, Utterance,
};
use agrivani::{
    AgrivaniError, CompletionGateway, ConversationOrchestrator, IgnoreReason, Message, Role,
    SpeechInputController, SpeechOutputController, SubmitOutcome, VoiceCaptureState,
    FALLBACK_MESSAGE,
};

const GREETING: &str = "Ask me anything about farming...";

/// Gateway that answers from a script and records every transcript it sees.
#[derive(Default)]
struct ScriptedGateway {
    replies: Mutex<VecDeque<Result<String, AgrivaniError>>>,
    transcripts: Mutex<Vec<Vec<Message>>>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    fn with_replies(replies: Vec<Result<String, AgrivaniError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl CompletionGateway for ScriptedGateway {
    async fn complete(&self, transcript: &[Message]) -> Result<String, AgrivaniError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.transcripts.lock().unwrap().push(transcript.to_vec());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AgrivaniError::NetworkFailure("script exhausted".to_string())))
    }
}

#[derive(Default)]
struct SpokenLog {
    spoken: Mutex<Vec<String>>,
}

struct RecordingSynth(Arc<SpokenLog>);

struct SilentPlayback;

impl Playback for SilentPlayback {
    fn cancel(&mut self) {}

    fn is_active(&mut self) -> bool {
        false
    }
}

impl Synthesizer for RecordingSynth {
    fn is_available(&self) -> bool {
        true
    }

    fn play(&self, utterance: &Utterance) -> anyhow::Result<Box<dyn Playback>> {
        self.0.spoken.lock().unwrap().push(utterance.text.clone());
        Ok(Box::new(SilentPlayback))
    }
}

struct QuietDevice;

impl CaptureDevice for QuietDevice {
    fn start(&mut self, _session: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Capture backend that hands its event sender to the test.
struct LoopbackCapture {
    sender: Arc<Mutex<Option<UnboundedSender<CaptureEvent>>>>,
}

impl CaptureBackend for LoopbackCapture {
    fn is_available(&self) -> bool {
        true
    }

    fn open(&self, events: UnboundedSender<CaptureEvent>) -> anyhow::Result<Box<dyn CaptureDevice>> {
        *self.sender.lock().unwrap() = Some(events);
        Ok(Box::new(QuietDevice))
    }
}

struct Harness {
    orchestrator: Arc<ConversationOrchestrator>,
    gateway: Arc<ScriptedGateway>,
    spoken: Arc<SpokenLog>,
    capture: Arc<Mutex<Option<UnboundedSender<CaptureEvent>>>>,
}

impl Harness {
    fn new(gateway: ScriptedGateway) -> Self {
        let gateway = Arc::new(gateway);
        let spoken = Arc::new(SpokenLog::default());
        let capture = Arc::new(Mutex::new(None));

        let orchestrator = ConversationOrchestrator::new(
            GREETING,
            gateway.clone(),
            SpeechInputController::new(Box::new(LoopbackCapture {
                sender: capture.clone(),
            })),
            SpeechOutputController::new(
                Box::new(RecordingSynth(spoken.clone())),
                &SpeechConfig::default(),
            ),
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            gateway,
            spoken,
            capture,
        }
    }

    fn spoken(&self) -> Vec<String> {
        self.spoken.spoken.lock().unwrap().clone()
    }

    fn emit(&self, event: CaptureEvent) {
        self.capture
            .lock()
            .unwrap()
            .as_ref()
            .expect("capture device opened")
            .send(event)
            .unwrap();
    }
}

async fn wait_until_pending(orchestrator: &ConversationOrchestrator) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !orchestrator.is_pending() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("submission became pending");
}

#[tokio::test]
async fn test_rain_question_end_to_end() {
    let harness = Harness::new(ScriptedGateway::with_replies(vec![Ok(
        "Yes, 60% chance".to_string()
    )]));

    let outcome = harness
        .orchestrator
        .submit_text("Will it rain tomorrow?")
        .await;

    assert_eq!(outcome, SubmitOutcome::Replied("Yes, 60% chance".to_string()));
    assert_eq!(
        harness.orchestrator.history(),
        vec![
            Message::assistant(GREETING),
            Message::user("Will it rain tomorrow?"),
            Message::assistant("Yes, 60% chance"),
        ]
    );
    assert!(!harness.orchestrator.is_pending());
    assert_eq!(harness.spoken(), vec!["Yes, 60% chance"]);
}

#[tokio::test]
async fn test_history_grows_by_two_per_turn() {
    let harness = Harness::new(ScriptedGateway::with_replies(vec![
        Ok("Sow in June.".to_string()),
        Ok("Use DAP at sowing.".to_string()),
        Ok("Irrigate every 10 days.".to_string()),
    ]));

    for (turn, question) in ["When to sow?", "Which fertilizer?", "How often to water?"]
        .iter()
        .enumerate()
    {
        harness.orchestrator.submit_text(question).await;
        assert_eq!(harness.orchestrator.history().len(), 1 + 2 * (turn + 1));
    }

    let roles: Vec<Role> = harness
        .orchestrator
        .history()
        .iter()
        .map(|m| m.role)
        .collect();
    assert_eq!(
        roles,
        vec![
            Role::Assistant,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant,
        ]
    );
}

#[tokio::test]
async fn test_gateway_sees_entire_history() {
    let harness = Harness::new(ScriptedGateway::with_replies(vec![
        Ok("First answer".to_string()),
        Ok("Second answer".to_string()),
    ]));

    harness.orchestrator.submit_text("first").await;
    harness.orchestrator.submit_text("second").await;

    let transcripts = harness.gateway.transcripts.lock().unwrap().clone();
    assert_eq!(transcripts.len(), 2);
    assert_eq!(
        transcripts[1],
        vec![
            Message::assistant(GREETING),
            Message::user("first"),
            Message::assistant("First answer"),
            Message::user("second"),
        ]
    );
}

#[tokio::test]
async fn test_failure_appends_fallback_and_stays_silent() {
    let harness = Harness::new(ScriptedGateway::with_replies(vec![Err(
        AgrivaniError::NetworkFailure("connection refused".to_string()),
    )]));

    let outcome = harness.orchestrator.submit_text("Will it rain?").await;

    assert_eq!(outcome, SubmitOutcome::Failed);
    let history = harness.orchestrator.history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2], Message::assistant(FALLBACK_MESSAGE));
    assert_eq!(FALLBACK_MESSAGE, "Error: Unable to connect to AI service.");
    assert!(!harness.orchestrator.is_pending());
    assert!(harness.spoken().is_empty());
}

#[tokio::test]
async fn test_malformed_reply_does_not_block_next_turn() {
    let harness = Harness::new(ScriptedGateway::with_replies(vec![
        Err(AgrivaniError::MalformedResponse("no choices".to_string())),
        Ok("Recovered".to_string()),
    ]));

    assert_eq!(
        harness.orchestrator.submit_text("one").await,
        SubmitOutcome::Failed
    );
    assert_eq!(
        harness.orchestrator.submit_text("two").await,
        SubmitOutcome::Replied("Recovered".to_string())
    );
    assert_eq!(harness.orchestrator.history().len(), 5);
    assert_eq!(harness.spoken(), vec!["Recovered"]);
}

#[tokio::test]
async fn test_empty_input_is_ignored() {
    let harness = Harness::new(ScriptedGateway::default());

    for input in ["", "   ", "\n\t"] {
        assert_eq!(
            harness.orchestrator.submit_text(input).await,
            SubmitOutcome::Ignored(IgnoreReason::EmptyInput)
        );
    }
    assert_eq!(harness.orchestrator.history().len(), 1);
    assert_eq!(harness.gateway.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_submission_while_pending_is_rejected() {
    let gate = Arc::new(Notify::new());
    let harness = Harness::new(
        ScriptedGateway::with_replies(vec![Ok("Slow answer".to_string())]).gated(gate.clone()),
    );

    let orchestrator = harness.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.submit_text("first question").await });

    wait_until_pending(&harness.orchestrator).await;
    assert_eq!(harness.orchestrator.history().len(), 2);

    let second = harness.orchestrator.submit_text("second question").await;
    assert_eq!(second, SubmitOutcome::Ignored(IgnoreReason::Pending));
    assert_eq!(harness.orchestrator.history().len(), 2);

    gate.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first, SubmitOutcome::Replied("Slow answer".to_string()));
    assert!(!harness.orchestrator.is_pending());
    assert_eq!(harness.orchestrator.history().len(), 3);
    assert_eq!(harness.gateway.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_buffered_input_survives_rejection() {
    let gate = Arc::new(Notify::new());
    let harness = Harness::new(
        ScriptedGateway::with_replies(vec![Ok("a".to_string()), Ok("b".to_string())])
            .gated(gate.clone()),
    );

    let orchestrator = harness.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.submit_text("first").await });
    wait_until_pending(&harness.orchestrator).await;

    harness.orchestrator.set_input("queued thought");
    assert_eq!(
        harness.orchestrator.submit_input().await,
        SubmitOutcome::Ignored(IgnoreReason::Pending)
    );
    assert_eq!(harness.orchestrator.input(), "queued thought");

    gate.notify_one();
    first.await.unwrap();

    let resend = {
        let orchestrator = harness.orchestrator.clone();
        tokio::spawn(async move { orchestrator.submit_input().await })
    };
    wait_until_pending(&harness.orchestrator).await;
    assert!(harness.orchestrator.input().is_empty());
    gate.notify_one();
    assert_eq!(resend.await.unwrap(), SubmitOutcome::Replied("b".to_string()));
}

#[tokio::test]
async fn test_voice_transcript_waits_for_confirmation() {
    let harness = Harness::new(ScriptedGateway::with_replies(vec![Ok(
        "Delay spraying by a day.".to_string(),
    )]));

    harness
        .orchestrator
        .submit_voice_transcript("42mm rain expected");
    assert_eq!(harness.orchestrator.input(), "42mm rain expected");
    assert_eq!(harness.orchestrator.history().len(), 1);
    assert_eq!(harness.gateway.calls.load(Ordering::SeqCst), 0);

    harness.orchestrator.submit_input().await;
    assert_eq!(
        harness.orchestrator.history()[1],
        Message::user("42mm rain expected")
    );
}

#[tokio::test]
async fn test_capture_event_fills_input() {
    let harness = Harness::new(ScriptedGateway::default());

    assert_eq!(
        harness.orchestrator.toggle_voice().unwrap(),
        VoiceCaptureState::Listening
    );
    harness.emit(CaptureEvent::FinalResult {
        session: 1,
        transcript: "Which seeds for black soil?".to_string(),
    });
    harness.emit(CaptureEvent::End { session: 1 });

    let event = harness.orchestrator.next_capture_event().await.unwrap();
    assert_eq!(
        harness.orchestrator.handle_capture_event(event).as_deref(),
        Some("Which seeds for black soil?")
    );
    let event = harness.orchestrator.next_capture_event().await.unwrap();
    assert!(harness.orchestrator.handle_capture_event(event).is_none());

    assert_eq!(harness.orchestrator.voice_state(), VoiceCaptureState::Idle);
    assert_eq!(harness.orchestrator.input(), "Which seeds for black soil?");
    assert_eq!(harness.orchestrator.history().len(), 1);
    assert_eq!(harness.gateway.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_voice_does_not_block_text() {
    let harness = Harness::new(ScriptedGateway::with_replies(vec![Ok("Fine".to_string())]));

    harness.orchestrator.toggle_voice().unwrap();
    let outcome = harness.orchestrator.submit_text("typed while listening").await;

    assert_eq!(outcome, SubmitOutcome::Replied("Fine".to_string()));
    assert_eq!(
        harness.orchestrator.voice_state(),
        VoiceCaptureState::Listening
    );
}

#[tokio::test]
async fn test_typed_submission_ignores_later_transcript() {
    let harness = Harness::new(ScriptedGateway::with_replies(vec![Ok(
        "Sow after the first rains.".to_string(),
    )]));
    harness.orchestrator.toggle_voice().unwrap();
    harness.emit(CaptureEvent::FinalResult {
        session: 1,
        transcript: "noisy transcript".to_string(),
    });

    let typed = "When should I sow groundnut?".to_string();
    let orchestrator = harness.orchestrator.clone();
    let submission = tokio::spawn(async move { orchestrator.submit_text(&typed).await });

    // The transcript lands before the spawned submission gets to run.
    let event = harness.orchestrator.next_capture_event().await.unwrap();
    harness.orchestrator.handle_capture_event(event);

    assert_eq!(
        submission.await.unwrap(),
        SubmitOutcome::Replied("Sow after the first rains.".to_string())
    );
    assert_eq!(
        harness.orchestrator.history()[1],
        Message::user("When should I sow groundnut?")
    );
    assert_eq!(harness.orchestrator.input(), "noisy transcript");
}
