//! Audio storage, transcription, and speech-synthesis contracts.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

const DEFAULT_AUDIO_MIME_TYPE: &str = "audio/ogg";

pub const VOICE_REASON_EMPTY_AUDIO: &str = "voice_empty_audio";
pub const VOICE_REASON_UNDECODABLE_AUDIO: &str = "voice_undecodable_audio";
pub const VOICE_REASON_EMPTY_TRANSCRIPT: &str = "voice_empty_transcript";
pub const VOICE_REASON_EMPTY_TEXT: &str = "voice_empty_text";
pub const VOICE_REASON_BACKEND_FAILED: &str = "voice_backend_failed";

/// Transcription or synthesis failure reported by a voice provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceProviderError {
    #[error("{provider}: audio payload is empty")]
    EmptyAudio { provider: String },
    #[error("{provider}: audio payload could not be decoded")]
    UndecodableAudio { provider: String },
    #[error("{provider}: transcript is empty")]
    EmptyTranscript { provider: String },
    #[error("{provider}: nothing to synthesise")]
    EmptyText { provider: String },
    #[error("{provider}: {message}")]
    Backend {
        provider: String,
        message: String,
        retryable: bool,
    },
}

impl VoiceProviderError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyAudio { .. } => VOICE_REASON_EMPTY_AUDIO,
            Self::UndecodableAudio { .. } => VOICE_REASON_UNDECODABLE_AUDIO,
            Self::EmptyTranscript { .. } => VOICE_REASON_EMPTY_TRANSCRIPT,
            Self::EmptyText { .. } => VOICE_REASON_EMPTY_TEXT,
            Self::Backend { .. } => VOICE_REASON_BACKEND_FAILED,
        }
    }

    /// Only backend failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { retryable: true, .. })
    }
}

pub type VoiceProviderResult<T> = Result<T, VoiceProviderError>;

/// Archived candidate audio handed to the transcription provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SttRequest {
    pub audio_bytes: Vec<u8>,
    pub mime_type: String,
}

impl SttRequest {
    pub fn new(audio_bytes: Vec<u8>) -> Self {
        Self {
            audio_bytes,
            mime_type: DEFAULT_AUDIO_MIME_TYPE.to_string(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SttResponse {
    pub transcript: String,
}

/// Question text to be voiced after the text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsRequest {
    pub text: String,
    pub voice: Option<String>,
}

impl TtsRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsResponse {
    pub audio_bytes: Vec<u8>,
    pub mime_type: String,
}

#[async_trait]
/// Trait contract for `SttProvider` behavior.
pub trait SttProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn transcribe(&self, request: SttRequest) -> VoiceProviderResult<SttResponse>;
}

#[async_trait]
/// Trait contract for `TtsProvider` behavior.
pub trait TtsProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn synthesize(&self, request: TtsRequest) -> VoiceProviderResult<TtsResponse>;
}

/// Offline provider: the audio bytes are the UTF-8 transcript, and synthesis
/// renders a tagged text payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicVoiceProvider;

const DETERMINISTIC_PROVIDER: &str = "deterministic";

#[async_trait]
impl SttProvider for DeterministicVoiceProvider {
    fn provider_name(&self) -> &'static str {
        DETERMINISTIC_PROVIDER
    }

    async fn transcribe(&self, request: SttRequest) -> VoiceProviderResult<SttResponse> {
        let provider = DETERMINISTIC_PROVIDER.to_string();
        if request.audio_bytes.is_empty() {
            return Err(VoiceProviderError::EmptyAudio { provider });
        }
        let decoded = String::from_utf8(request.audio_bytes)
            .map_err(|_| VoiceProviderError::UndecodableAudio {
                provider: provider.clone(),
            })?;
        let transcript = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
        if transcript.is_empty() {
            return Err(VoiceProviderError::EmptyTranscript { provider });
        }
        Ok(SttResponse { transcript })
    }
}

#[async_trait]
impl TtsProvider for DeterministicVoiceProvider {
    fn provider_name(&self) -> &'static str {
        DETERMINISTIC_PROVIDER
    }

    async fn synthesize(&self, request: TtsRequest) -> VoiceProviderResult<TtsResponse> {
        let question = request.text.trim();
        if question.is_empty() {
            return Err(VoiceProviderError::EmptyText {
                provider: DETERMINISTIC_PROVIDER.to_string(),
            });
        }
        let voice = request.voice.as_deref().unwrap_or("neutral");
        Ok(TtsResponse {
            audio_bytes: format!("[{voice}] {question}").into_bytes(),
            mime_type: DEFAULT_AUDIO_MIME_TYPE.to_string(),
        })
    }
}

/// Audio fetched from the channel and archived in file storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub stored_ref: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioStoreError {
    #[error("audio reference '{0}' not found")]
    NotFound(String),
    #[error("audio storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
/// Trait contract for `AudioStore` behavior.
pub trait AudioStore: Send + Sync {
    /// Fetches the channel media behind `audio_ref` and stores it durably.
    async fn archive(
        &self,
        tenant_id: &str,
        contact_id: &str,
        audio_ref: &str,
    ) -> Result<AudioClip, AudioStoreError>;
}

/// In-memory audio store keyed by channel media reference.
#[derive(Debug, Default)]
pub struct InMemoryAudioStore {
    media: RwLock<HashMap<String, (Vec<u8>, String)>>,
    archived: RwLock<Vec<String>>,
}

impl InMemoryAudioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers channel media so a later `archive` call can find it.
    pub async fn insert_media(&self, audio_ref: &str, bytes: Vec<u8>, mime_type: &str) {
        self.media
            .write()
            .await
            .insert(audio_ref.to_string(), (bytes, mime_type.to_string()));
    }

    pub async fn archived_refs(&self) -> Vec<String> {
        self.archived.read().await.clone()
    }
}

#[async_trait]
impl AudioStore for InMemoryAudioStore {
    async fn archive(
        &self,
        tenant_id: &str,
        contact_id: &str,
        audio_ref: &str,
    ) -> Result<AudioClip, AudioStoreError> {
        let (bytes, mime_type) = self
            .media
            .read()
            .await
            .get(audio_ref)
            .cloned()
            .ok_or_else(|| AudioStoreError::NotFound(audio_ref.to_string()))?;
        let mut archived = self.archived.write().await;
        let stored_ref = format!(
            "memory://{tenant_id}/{contact_id}/{}",
            archived.len().saturating_add(1)
        );
        archived.push(stored_ref.clone());
        Ok(AudioClip {
            stored_ref,
            bytes,
            mime_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn functional_deterministic_stt_collapses_whitespace_in_transcript() {
        let response = DeterministicVoiceProvider
            .transcribe(SttRequest::new(b"  five years \n in retail ".to_vec()))
            .await
            .expect("transcript");
        assert_eq!(response.transcript, "five years in retail");
    }

    #[tokio::test]
    async fn regression_deterministic_stt_rejects_undecodable_and_silent_audio() {
        let error = DeterministicVoiceProvider
            .transcribe(SttRequest::new(vec![0xff, 0xfe]))
            .await
            .expect_err("undecodable");
        assert_eq!(error.reason_code(), VOICE_REASON_UNDECODABLE_AUDIO);
        assert!(!error.is_retryable());

        let error = DeterministicVoiceProvider
            .transcribe(SttRequest::new(b"   ".to_vec()).with_mime_type("audio/mpeg"))
            .await
            .expect_err("silent");
        assert_eq!(error.reason_code(), VOICE_REASON_EMPTY_TRANSCRIPT);
    }

    #[tokio::test]
    async fn unit_deterministic_tts_tags_voice_and_question() {
        let mut request = TtsRequest::new(" Tell us about yourself ");
        request.voice = Some("pt-female".to_string());
        let response = DeterministicVoiceProvider
            .synthesize(request)
            .await
            .expect("audio");
        assert_eq!(
            response.audio_bytes,
            b"[pt-female] Tell us about yourself".to_vec()
        );
        assert_eq!(response.mime_type, "audio/ogg");
    }

    #[tokio::test]
    async fn functional_in_memory_audio_store_archives_known_media() {
        let store = InMemoryAudioStore::new();
        store
            .insert_media("media://1", b"hello".to_vec(), "audio/ogg")
            .await;
        let clip = store.archive("acme", "+1", "media://1").await.expect("archive");
        assert_eq!(clip.bytes, b"hello".to_vec());
        assert_eq!(clip.stored_ref, "memory://acme/+1/1");
        assert_eq!(store.archived_refs().await, vec![clip.stored_ref]);
        assert_eq!(
            store.archive("acme", "+1", "media://missing").await,
            Err(AudioStoreError::NotFound("media://missing".to_string()))
        );
    }
}
