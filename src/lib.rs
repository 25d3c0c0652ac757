pub mod config;
pub mod error;
pub mod gateway;
pub mod message;
pub mod notice;
pub mod orchestrator;
pub mod speech;

pub use config::Config;
pub use error::AgrivaniError;
pub use gateway::{AssistantGateway, CompletionGateway};
pub use message::{Conversation, Message, Role};
pub use notice::Notifier;
pub use orchestrator::{ConversationOrchestrator, IgnoreReason, SubmitOutcome, FALLBACK_MESSAGE};
pub use speech::{SpeechInputController, SpeechOutputController, VoiceCaptureState};
