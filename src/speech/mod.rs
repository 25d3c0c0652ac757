pub mod input;
pub mod output;

pub use input::{
    CaptureBackend, CaptureDevice, CaptureEvent, CommandCaptureBackend, SpeechInputController,
    VoiceCaptureState,
};
pub use output::{
    prepare_for_speech, CommandSynthesizer, Playback, SpeechOutputController, Synthesizer,
    Utterance,
};
