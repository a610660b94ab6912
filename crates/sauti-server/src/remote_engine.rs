//! Compute backend that forwards batches to a remote inference worker over HTTP.
//!
//! The worker exposes one route pair per engine family:
//! `POST <base>/<family>/batch` and `POST <base>/<family>/unload`.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use sauti_core::job::SpeakerHints;
use sauti_core::{
    ComputeBackend, DispatchBatch, EngineFamily, Error, Operation, ResidencyCoordinator,
    ResolvedAudio, Result, SamplingParams, Unloadable,
};

pub fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .no_proxy()
        .user_agent(format!("sauti-server/{}", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("Failed to initialize HTTP client: {e}")))
}

fn family_url(base_url: &str, family: EngineFamily, action: &str) -> String {
    format!("{}/{}/{action}", base_url.trim_end_matches('/'), family.as_str())
}

/// Residency handle for one engine family hosted by the remote worker.
pub struct RemoteEngineHandle {
    client: reqwest::Client,
    base_url: String,
    family: EngineFamily,
}

#[async_trait]
impl Unloadable for RemoteEngineHandle {
    async fn unload(&self) -> Result<()> {
        let url = family_url(&self.base_url, self.family, "unload");
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::InferenceError(format!("Unload request to {url} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InferenceError(format!(
                "Unloading {} failed with {status}: {body}",
                self.family
            )));
        }
        debug!("Remote worker unloaded {}", self.family);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WireAudio<'a> {
    blob_id: &'a str,
    format: &'a str,
    data_base64: String,
}

impl<'a> WireAudio<'a> {
    fn encode(audio: &'a ResolvedAudio) -> Self {
        Self {
            blob_id: &audio.blob_id,
            format: &audio.format,
            data_base64: base64::engine::general_purpose::STANDARD.encode(&audio.bytes),
        }
    }
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    operation: Operation,
    item_ids: &'a [String],
    texts: &'a [String],
    languages: Vec<&'static str>,
    instructs: &'a [Option<String>],
    speakers: &'a [Option<String>],
    ref_audio: Vec<Option<WireAudio<'a>>>,
    ref_texts: &'a [Option<String>],
    speaker_hints: &'a [SpeakerHints],
    sampling: &'a SamplingParams,
}

impl<'a> BatchRequest<'a> {
    fn from_batch(batch: &'a DispatchBatch) -> Self {
        Self {
            operation: batch.operation,
            item_ids: &batch.item_ids,
            texts: &batch.texts,
            languages: batch
                .languages
                .iter()
                .map(|language| language.model_name())
                .collect(),
            instructs: &batch.instructs,
            speakers: &batch.speakers,
            ref_audio: batch
                .ref_audio
                .iter()
                .map(|audio| audio.as_ref().map(WireAudio::encode))
                .collect(),
            ref_texts: &batch.ref_texts,
            speaker_hints: &batch.speaker_hints,
            sampling: &batch.sampling,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    outputs: Vec<String>,
}

fn decode_outputs(response: BatchResponse) -> Result<Vec<Vec<u8>>> {
    response
        .outputs
        .iter()
        .enumerate()
        .map(|(index, encoded)| {
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| {
                    Error::InferenceError(format!("Output {index} is not valid base64: {e}"))
                })
        })
        .collect()
}

pub struct RemoteInferenceBackend {
    client: reqwest::Client,
    base_url: String,
    residency: Arc<ResidencyCoordinator>,
}

impl RemoteInferenceBackend {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        residency: Arc<ResidencyCoordinator>,
    ) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base_url.into(),
            residency,
        })
    }

    pub fn engine_handle(&self, family: EngineFamily) -> RemoteEngineHandle {
        RemoteEngineHandle {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            family,
        }
    }

    /// Register every engine family with the residency coordinator.
    pub async fn register_engines(&self) {
        for family in EngineFamily::ALL {
            self.residency
                .register(
                    family.as_str(),
                    family.is_persistent(),
                    Arc::new(self.engine_handle(family)),
                )
                .await;
        }
    }
}

#[async_trait]
impl ComputeBackend for RemoteInferenceBackend {
    async fn run_batch(&self, batch: DispatchBatch) -> Result<Vec<Vec<u8>>> {
        let family = batch.engine_family();
        self.residency.acquire(family.as_str()).await?;

        let url = family_url(&self.base_url, family, "batch");
        let request = BatchRequest::from_batch(&batch);
        info!("Sending {} {} item(s) to {url}", batch.len(), batch.operation);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::InferenceError(format!("Batch request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InferenceError(format!(
                "Inference worker returned {status}: {body}"
            )));
        }

        let payload = response.json::<BatchResponse>().await.map_err(|e| {
            Error::InferenceError(format!("Invalid inference worker response: {e}"))
        })?;
        decode_outputs(payload)
    }
}
