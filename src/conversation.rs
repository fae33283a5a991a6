//! C8: Conversation Driver.
//!
//! Grounded in `core/conversation.py`'s turn-taking loop, generalized behind
//! opaque STT/LLM/TTS trait seams so the driver itself never depends on a
//! specific vendor SDK. Speech/LLM vendor integration is out of scope for
//! this crate; the concrete adapters are an application concern, and only
//! the trait seam lives here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CollaboratorError, PhoneAgentError, Result};
use crate::triage::{PatientContext, TriageAssessor, TriageResult};

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> std::result::Result<String, CollaboratorError>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> std::result::Result<Vec<u8>, CollaboratorError>;
}

#[async_trait]
pub trait DialogPolicy: Send + Sync {
    /// Produces the agent's next utterance given the caller's last
    /// transcribed utterance and accumulated turn history.
    async fn next_turn(
        &self,
        history: &[ConversationTurn],
        caller_utterance: &str,
    ) -> std::result::Result<AgentResponse, CollaboratorError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    Caller,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    pub end_call: bool,
    pub triage_hint: Option<TriageResult>,
}

/// Drives a single call's conversation: transcribe -> policy -> synthesize,
/// accumulating turn history. Holds no vendor-specific state itself.
pub struct ConversationDriver {
    call_id: Uuid,
    stt: std::sync::Arc<dyn SpeechToText>,
    tts: std::sync::Arc<dyn TextToSpeech>,
    policy: std::sync::Arc<dyn DialogPolicy>,
    triage: TriageAssessor,
    history: Vec<ConversationTurn>,
}

impl ConversationDriver {
    pub fn new(
        call_id: Uuid,
        stt: std::sync::Arc<dyn SpeechToText>,
        tts: std::sync::Arc<dyn TextToSpeech>,
        policy: std::sync::Arc<dyn DialogPolicy>,
    ) -> Self {
        Self { call_id, stt, tts, policy, triage: TriageAssessor::new(), history: Vec::new() }
    }

    /// Processes one caller audio turn end to end. Returns the synthesized
    /// agent audio and whether the driver believes the call should end.
    pub async fn process_turn(&mut self, caller_audio: &[u8], patient: &PatientContext) -> Result<(Vec<u8>, bool)> {
        let transcript = self
            .stt
            .transcribe(caller_audio)
            .await
            .map_err(|e| PhoneAgentError::TransientExternal(e.to_string()))?;

        let triage = self.triage.assess(&[], patient, Some(&transcript)).ok();
        self.history.push(ConversationTurn { speaker: Speaker::Caller, text: transcript.clone() });

        let mut response = self
            .policy
            .next_turn(&self.history, &transcript)
            .await
            .map_err(|e| PhoneAgentError::TransientExternal(e.to_string()))?;
        response.triage_hint = triage.clone();

        // An emergency classification always ends the call with an
        // escalation instruction, regardless of what the policy proposed.
        // An utterance triage couldn't even parse (empty transcript) is
        // left to the policy's own judgment rather than forced to continue.
        if matches!(triage.as_ref().map(|t| t.urgency), Some(crate::triage::UrgencyLevel::Emergency)) {
            response.end_call = true;
        }

        self.history.push(ConversationTurn { speaker: Speaker::Agent, text: response.text.clone() });

        let audio = self
            .tts
            .synthesize(&response.text)
            .await
            .map_err(|e| PhoneAgentError::TransientExternal(e.to_string()))?;

        Ok((audio, response.end_call))
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }
}
