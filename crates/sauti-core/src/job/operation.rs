use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Kind of inference work a job item requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    VoiceDesign,
    CustomVoice,
    VoiceClone,
    VoiceCloneEnhanced,
    Transcribe,
    Diarize,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Self::VoiceDesign,
        Self::CustomVoice,
        Self::VoiceClone,
        Self::VoiceCloneEnhanced,
        Self::Transcribe,
        Self::Diarize,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VoiceDesign => "voice_design",
            Self::CustomVoice => "custom_voice",
            Self::VoiceClone => "voice_clone",
            Self::VoiceCloneEnhanced => "voice_clone_enhanced",
            Self::Transcribe => "transcribe",
            Self::Diarize => "diarize",
        }
    }

    /// Engine family that has to be resident to run this operation.
    pub const fn engine_family(self) -> EngineFamily {
        match self {
            Self::VoiceDesign | Self::CustomVoice | Self::VoiceClone | Self::VoiceCloneEnhanced => {
                EngineFamily::Speech
            }
            Self::Transcribe => EngineFamily::Transcription,
            Self::Diarize => EngineFamily::Diarization,
        }
    }

    /// File extension of the artifact produced for one item.
    pub const fn artifact_extension(self) -> &'static str {
        match self {
            Self::Transcribe | Self::Diarize => "json",
            _ => "wav",
        }
    }

    pub const fn is_synthesis(self) -> bool {
        matches!(self.engine_family(), EngineFamily::Speech)
    }

    /// Operations that consume a previously uploaded audio blob.
    pub const fn requires_audio(self) -> bool {
        matches!(
            self,
            Self::VoiceClone | Self::VoiceCloneEnhanced | Self::Transcribe | Self::Diarize
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown operation: {s}")))
    }
}

/// Heavyweight engine a group of operations runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFamily {
    Speech,
    Transcription,
    Diarization,
}

impl EngineFamily {
    pub const ALL: [EngineFamily; 3] = [Self::Speech, Self::Transcription, Self::Diarization];

    /// Registry name used with the residency coordinator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Speech => "tts",
            Self::Transcription => "asr",
            Self::Diarization => "diarization",
        }
    }

    /// Persistent engines stay warm and are never evicted by a swap.
    pub const fn is_persistent(self) -> bool {
        matches!(self, Self::Diarization)
    }
}

impl fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input language hint accepted on submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Auto,
    En,
    Zh,
    Ja,
    Ko,
    Fr,
    De,
    Es,
    Ru,
    Pt,
    It,
    Nl,
}

impl Language {
    /// Name the speech models expect for this language.
    pub const fn model_name(self) -> &'static str {
        match self {
            Self::Auto => "Auto",
            Self::En => "English",
            Self::Zh => "Chinese",
            Self::Ja => "Japanese",
            Self::Ko => "Korean",
            Self::Fr => "French",
            Self::De => "German",
            Self::Es => "Spanish",
            Self::Ru => "Russian",
            Self::Pt => "Portuguese",
            Self::It => "Italian",
            Self::Nl => "Dutch",
        }
    }
}
