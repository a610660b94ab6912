//! Contract between the scheduler and the batched compute collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::blob_store::LoadedBlob;
use crate::error::Result;
use crate::job::{EngineFamily, JobItem, Language, Operation, SpeakerHints};

/// Group-level sampling parameters for synthesis calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_new_tokens: usize,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_new_tokens: 2048,
            top_p: 0.8,
            top_k: 20,
            repetition_penalty: 1.05,
        }
    }
}

impl SamplingParams {
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            ..Self::default()
        }
    }
}

/// Reference or input audio resolved from the blob store.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAudio {
    pub blob_id: String,
    /// File extension of the stored blob, e.g. `wav`.
    pub format: String,
    pub bytes: Vec<u8>,
}

impl From<LoadedBlob> for ResolvedAudio {
    fn from(blob: LoadedBlob) -> Self {
        let format = blob.location.extension().to_string();
        Self {
            blob_id: blob.location.blob_id,
            format,
            bytes: blob.bytes,
        }
    }
}

/// One same-operation group, laid out as parallel arrays indexed by item.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchBatch {
    pub operation: Operation,
    pub item_ids: Vec<String>,
    pub texts: Vec<String>,
    pub languages: Vec<Language>,
    pub instructs: Vec<Option<String>>,
    pub speakers: Vec<Option<String>>,
    pub ref_audio: Vec<Option<ResolvedAudio>>,
    pub ref_texts: Vec<Option<String>>,
    pub speaker_hints: Vec<SpeakerHints>,
    pub sampling: SamplingParams,
}

impl DispatchBatch {
    pub fn new(operation: Operation, sampling: SamplingParams) -> Self {
        Self {
            operation,
            item_ids: Vec::new(),
            texts: Vec::new(),
            languages: Vec::new(),
            instructs: Vec::new(),
            speakers: Vec::new(),
            ref_audio: Vec::new(),
            ref_texts: Vec::new(),
            speaker_hints: Vec::new(),
            sampling,
        }
    }

    /// Append one item. Every array grows by exactly one entry.
    pub fn push(&mut self, item: &JobItem, audio: Option<ResolvedAudio>) {
        let task = &item.task;
        self.item_ids.push(item.item_id.clone());
        self.texts.push(task.text().to_string());
        self.languages.push(task.language());
        self.instructs.push(task.instruct().map(str::to_string));
        self.speakers.push(task.speaker().map(str::to_string));
        self.ref_audio.push(audio);
        self.ref_texts.push(task.ref_text().map(str::to_string));
        self.speaker_hints.push(task.speaker_hints());
    }

    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    pub fn engine_family(&self) -> EngineFamily {
        self.operation.engine_family()
    }
}

/// Batched accelerator backend.
///
/// Returns one payload per dispatched item, in item order. An `Err` fails the
/// whole group; a short output list fails only the items left without output.
/// Implementations acquire residency for their engine family before running.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn run_batch(&self, batch: DispatchBatch) -> Result<Vec<Vec<u8>>>;
}
