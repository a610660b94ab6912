//! Wire-level submissions and their validation into typed job tasks.

use serde::{Deserialize, Serialize};

use super::operation::{Language, Operation};
use crate::error::{Error, Result};

pub const MAX_BATCH_ITEMS: usize = 512;
const MAX_LABEL_CHARS: usize = 200;
const MAX_CUSTOM_ID_CHARS: usize = 256;
const MAX_TEXT_CHARS: usize = 20_000;
const DEFAULT_TEMPERATURE: f32 = 1.0;
const DEFAULT_DESIGN_INSTRUCT: &str = "Happy";
const DEFAULT_SPEAKER: &str = "Speaker_001";

/// Style instruction, either a single string or a list of fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instruct {
    One(String),
    Many(Vec<String>),
}

impl Instruct {
    fn normalized(&self) -> Option<String> {
        let joined = match self {
            Self::One(value) => value.trim().to_string(),
            Self::Many(values) => values
                .iter()
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
        };
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}

/// One requested unit of work as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub operation: Operation,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ref_audio: Option<String>,
    #[serde(default)]
    pub ref_text: Option<String>,
    #[serde(default)]
    pub instruct: Option<Instruct>,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub num_speakers: Option<u32>,
    #[serde(default)]
    pub min_speakers: Option<u32>,
    #[serde(default)]
    pub max_speakers: Option<u32>,
    #[serde(default)]
    pub custom_id: Option<String>,
}

impl JobSubmission {
    /// Minimal submission for `operation`; remaining fields take their defaults.
    pub fn new(operation: Operation, text: impl Into<String>) -> Self {
        Self {
            operation,
            text: text.into(),
            ref_audio: None,
            ref_text: None,
            instruct: None,
            speaker: None,
            language: Language::default(),
            temperature: None,
            num_speakers: None,
            min_speakers: None,
            max_speakers: None,
            custom_id: None,
        }
    }

    pub fn with_ref_audio(mut self, blob_id: impl Into<String>) -> Self {
        self.ref_audio = Some(blob_id.into());
        self
    }

    pub fn with_custom_id(mut self, custom_id: impl Into<String>) -> Self {
        self.custom_id = Some(custom_id.into());
        self
    }
}

/// A batch of submissions tracked together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub items: Vec<JobSubmission>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Speaker-count hints forwarded to diarization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerHints {
    pub num_speakers: Option<u32>,
    pub min_speakers: Option<u32>,
    pub max_speakers: Option<u32>,
}

/// Validated, operation-specific parameters of a job item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum JobTask {
    VoiceDesign {
        text: String,
        instruct: String,
        language: Language,
    },
    CustomVoice {
        text: String,
        speaker: String,
        instruct: Option<String>,
        language: Language,
    },
    VoiceClone {
        text: String,
        ref_audio: String,
        ref_text: Option<String>,
        language: Language,
    },
    VoiceCloneEnhanced {
        text: String,
        ref_audio: String,
        ref_text: Option<String>,
        language: Language,
    },
    Transcribe {
        audio: String,
        language: Language,
    },
    Diarize {
        audio: String,
        hints: SpeakerHints,
    },
}

impl JobTask {
    pub fn operation(&self) -> Operation {
        match self {
            Self::VoiceDesign { .. } => Operation::VoiceDesign,
            Self::CustomVoice { .. } => Operation::CustomVoice,
            Self::VoiceClone { .. } => Operation::VoiceClone,
            Self::VoiceCloneEnhanced { .. } => Operation::VoiceCloneEnhanced,
            Self::Transcribe { .. } => Operation::Transcribe,
            Self::Diarize { .. } => Operation::Diarize,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::VoiceDesign { text, .. }
            | Self::CustomVoice { text, .. }
            | Self::VoiceClone { text, .. }
            | Self::VoiceCloneEnhanced { text, .. } => text,
            Self::Transcribe { .. } | Self::Diarize { .. } => "",
        }
    }

    pub fn language(&self) -> Language {
        match self {
            Self::VoiceDesign { language, .. }
            | Self::CustomVoice { language, .. }
            | Self::VoiceClone { language, .. }
            | Self::VoiceCloneEnhanced { language, .. }
            | Self::Transcribe { language, .. } => *language,
            Self::Diarize { .. } => Language::Auto,
        }
    }

    /// Blob handle this task reads, if any.
    pub fn audio_handle(&self) -> Option<&str> {
        match self {
            Self::VoiceClone { ref_audio, .. } | Self::VoiceCloneEnhanced { ref_audio, .. } => {
                Some(ref_audio)
            }
            Self::Transcribe { audio, .. } | Self::Diarize { audio, .. } => Some(audio),
            Self::VoiceDesign { .. } | Self::CustomVoice { .. } => None,
        }
    }

    pub fn ref_text(&self) -> Option<&str> {
        match self {
            Self::VoiceClone { ref_text, .. } | Self::VoiceCloneEnhanced { ref_text, .. } => {
                ref_text.as_deref()
            }
            _ => None,
        }
    }

    pub fn instruct(&self) -> Option<&str> {
        match self {
            Self::VoiceDesign { instruct, .. } => Some(instruct),
            Self::CustomVoice { instruct, .. } => instruct.as_deref(),
            _ => None,
        }
    }

    pub fn speaker(&self) -> Option<&str> {
        match self {
            Self::CustomVoice { speaker, .. } => Some(speaker),
            _ => None,
        }
    }

    pub fn speaker_hints(&self) -> SpeakerHints {
        match self {
            Self::Diarize { hints, .. } => *hints,
            _ => SpeakerHints::default(),
        }
    }
}

/// A job that passed validation and is ready to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedJob {
    pub task: JobTask,
    pub temperature: f32,
    pub custom_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    pub label: Option<String>,
    pub jobs: Vec<ValidatedJob>,
}

impl JobSubmission {
    pub fn validate(self) -> Result<ValidatedJob> {
        let temperature = self.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !temperature.is_finite() || temperature <= 0.0 || temperature > 2.0 {
            return Err(Error::InvalidInput(format!(
                "temperature must be within (0, 2], got {temperature}"
            )));
        }

        let operation = self.operation;
        let text = self.text.trim().to_string();
        if operation.is_synthesis() {
            if text.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "text is required for {operation}"
                )));
            }
            if text.chars().count() > MAX_TEXT_CHARS {
                return Err(Error::InvalidInput(format!(
                    "text exceeds {MAX_TEXT_CHARS} characters"
                )));
            }
        }

        let audio = sanitize_optional_text(self.ref_audio.as_deref(), MAX_CUSTOM_ID_CHARS);
        let audio = if operation.requires_audio() {
            Some(audio.ok_or_else(|| {
                Error::InvalidInput(format!("ref_audio is required for {operation}"))
            })?)
        } else {
            None
        };

        let hints = SpeakerHints {
            num_speakers: self.num_speakers,
            min_speakers: self.min_speakers,
            max_speakers: self.max_speakers,
        };
        validate_speaker_hints(&hints)?;

        let instruct = self.instruct.as_ref().and_then(Instruct::normalized);
        let ref_text = sanitize_optional_text(self.ref_text.as_deref(), MAX_TEXT_CHARS);
        let language = self.language;

        let task = match (operation, audio) {
            (Operation::VoiceDesign, _) => JobTask::VoiceDesign {
                text,
                instruct: instruct.unwrap_or_else(|| DEFAULT_DESIGN_INSTRUCT.to_string()),
                language,
            },
            (Operation::CustomVoice, _) => JobTask::CustomVoice {
                text,
                speaker: sanitize_optional_text(self.speaker.as_deref(), 120)
                    .unwrap_or_else(|| DEFAULT_SPEAKER.to_string()),
                instruct,
                language,
            },
            (Operation::VoiceClone, Some(ref_audio)) => JobTask::VoiceClone {
                text,
                ref_audio,
                ref_text,
                language,
            },
            (Operation::VoiceCloneEnhanced, Some(ref_audio)) => JobTask::VoiceCloneEnhanced {
                text,
                ref_audio,
                ref_text,
                language,
            },
            (Operation::Transcribe, Some(audio)) => JobTask::Transcribe { audio, language },
            (Operation::Diarize, Some(audio)) => JobTask::Diarize { audio, hints },
            (operation, None) => {
                return Err(Error::InvalidInput(format!(
                    "ref_audio is required for {operation}"
                )))
            }
        };

        Ok(ValidatedJob {
            task,
            temperature,
            custom_id: sanitize_optional_text(self.custom_id.as_deref(), MAX_CUSTOM_ID_CHARS),
        })
    }
}

impl BatchSubmission {
    pub fn validate(self) -> Result<ValidatedBatch> {
        if self.items.is_empty() {
            return Err(Error::InvalidInput(
                "Batch items list cannot be empty".to_string(),
            ));
        }
        if self.items.len() > MAX_BATCH_ITEMS {
            return Err(Error::InvalidInput(format!(
                "Batch holds {} items, the limit is {MAX_BATCH_ITEMS}",
                self.items.len()
            )));
        }

        let jobs = self
            .items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| {
                item.validate().map_err(|err| match err {
                    Error::InvalidInput(msg) => Error::InvalidInput(format!("items[{idx}]: {msg}")),
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ValidatedBatch {
            label: sanitize_optional_text(self.label.as_deref(), MAX_LABEL_CHARS),
            jobs,
        })
    }
}

fn validate_speaker_hints(hints: &SpeakerHints) -> Result<()> {
    for (name, value) in [
        ("num_speakers", hints.num_speakers),
        ("min_speakers", hints.min_speakers),
        ("max_speakers", hints.max_speakers),
    ] {
        if value == Some(0) {
            return Err(Error::InvalidInput(format!("{name} must be at least 1")));
        }
    }
    if let (Some(min), Some(max)) = (hints.min_speakers, hints.max_speakers) {
        if min > max {
            return Err(Error::InvalidInput(format!(
                "min_speakers ({min}) exceeds max_speakers ({max})"
            )));
        }
    }
    Ok(())
}

fn sanitize_optional_text(raw: Option<&str>, max_chars: usize) -> Option<String> {
    let normalized = raw
        .unwrap_or("")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized.chars().take(max_chars).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_design_defaults_instruction() {
        let job = JobSubmission::new(Operation::VoiceDesign, "  Hello there ")
            .validate()
            .unwrap();
        assert_eq!(
            job.task,
            JobTask::VoiceDesign {
                text: "Hello there".to_string(),
                instruct: "Happy".to_string(),
                language: Language::Auto,
            }
        );
        assert_eq!(job.temperature, 1.0);
    }

    #[test]
    fn instruct_list_is_joined() {
        let mut submission = JobSubmission::new(Operation::CustomVoice, "Hi");
        submission.instruct = Some(Instruct::Many(vec![
            "calm".to_string(),
            " ".to_string(),
            "slow".to_string(),
        ]));
        let job = submission.validate().unwrap();
        assert_eq!(job.task.instruct(), Some("calm, slow"));
        assert_eq!(job.task.speaker(), Some("Speaker_001"));
    }

    #[test]
    fn clone_requires_reference_audio() {
        let err = JobSubmission::new(Operation::VoiceClone, "Hi")
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(msg) if msg.contains("ref_audio")));
    }

    #[test]
    fn transcribe_does_not_need_text() {
        let job = JobSubmission::new(Operation::Transcribe, "")
            .with_ref_audio("abc")
            .validate()
            .unwrap();
        assert_eq!(job.task.audio_handle(), Some("abc"));
        assert_eq!(job.task.operation(), Operation::Transcribe);
    }

    #[test]
    fn rejects_out_of_range_temperature_and_hints() {
        let mut hot = JobSubmission::new(Operation::VoiceDesign, "Hi");
        hot.temperature = Some(0.0);
        assert!(hot.validate().is_err());

        let mut diarize = JobSubmission::new(Operation::Diarize, "").with_ref_audio("abc");
        diarize.min_speakers = Some(4);
        diarize.max_speakers = Some(2);
        assert!(diarize.validate().is_err());
    }

    #[test]
    fn batch_errors_name_the_offending_item() {
        let batch = BatchSubmission {
            items: vec![
                JobSubmission::new(Operation::VoiceDesign, "ok"),
                JobSubmission::new(Operation::VoiceDesign, "   "),
            ],
            label: Some("  nightly   run ".to_string()),
        };
        let err = batch.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(msg) if msg.starts_with("items[1]")));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let batch = BatchSubmission {
            items: Vec::new(),
            label: None,
        };
        assert!(batch.validate().is_err());
    }

    #[test]
    fn submission_accepts_wire_schema() {
        let raw = r#"{
            "operation": "voice_clone",
            "text": "Hello",
            "ref_audio": "f00d",
            "instruct": ["warm", "bright"],
            "language": "en",
            "temperature": 0.7,
            "custom_id": "row-17"
        }"#;
        let submission: JobSubmission = serde_json::from_str(raw).unwrap();
        let job = submission.validate().unwrap();
        assert_eq!(job.custom_id.as_deref(), Some("row-17"));
        assert_eq!(job.task.language(), Language::En);
        assert!((job.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn task_serializes_with_operation_tag() {
        let task = JobTask::Diarize {
            audio: "abc".to_string(),
            hints: SpeakerHints {
                num_speakers: Some(2),
                ..SpeakerHints::default()
            },
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["operation"], "diarize");
        let back: JobTask = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }
}
