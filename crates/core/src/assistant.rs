//! Conversational assistant over a task's results.
//!
//! One conversation per task. The first question of a conversation is
//! prefixed with a digest of the task's output area (log, CSV reports and
//! the list of parcels retrieved).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use geocore_registry::TaskId;
use serde::{Deserialize, Serialize};

use crate::error::AssistantError;
use crate::report;

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";
/// Upper bound on one model round trip, connect to last byte.
pub const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 60;

/// Returned instead of a model answer when no API key is configured.
pub const UNCONFIGURED_NOTICE: &str = "⚠️ **API Key de Gemini no configurada**\n\n\
Para usar el chat, configura la variable de entorno `GEMINI_API_KEY`.\n\n\
Puedes obtener una clave gratuita en: https://aistudio.google.com/apikey";

const SYSTEM_PROMPT: &str = "Eres un experto en Sistemas de Información Geográfica (GIS) y Catastro español.

TU MISIÓN:
- Analizar datos catastrales y cartográficos de España
- Explicar afecciones urbanísticas y ambientales
- Interpretar superficies, coordenadas y geometrías
- Responder preguntas sobre normativa catastral española

CONOCIMIENTOS CLAVE:
- Catastro español: referencias catastrales, polígonos, parcelas
- Afecciones: Red Natura 2000, Montes Públicos, Vías Pecuarias
- Sistemas de coordenadas: EPSG:4326 (WGS84), EPSG:25830 (UTM 30N)
- Normativa: Ley del Suelo, espacios protegidos

ESTILO DE RESPUESTA:
- Conciso y técnico, pero comprensible
- Usa datos específicos del expediente cuando estén disponibles
- Si no tienes información, indícalo claramente
- Proporciona cifras exactas (m², Ha, %)

FORMATO:
- Usa Markdown para estructurar respuestas
- Resalta cifras importantes en **negrita**
- Usa listas cuando enumeres afecciones o datos
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

/// A chat model.
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Answer `message` given the earlier turns of the conversation.
    async fn reply(&self, history: &[ChatTurn], message: &str) -> Result<String, AssistantError>;

    /// Whether `reply` reaches a real model.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Stand-in used when no API key is available.
#[derive(Debug, Default)]
pub struct UnconfiguredAssistant;

#[async_trait]
impl Assistant for UnconfiguredAssistant {
    async fn reply(&self, _history: &[ChatTurn], _message: &str) -> Result<String, AssistantError> {
        Ok(UNCONFIGURED_NOTICE.to_string())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// Google Gemini `generateContent` client.
#[derive(Debug, Clone)]
pub struct GeminiAssistant {
    api_key: String,
    model: String,
    api_url: String,
    timeout: Duration,
}

impl GeminiAssistant {
    pub fn new(api_key: impl Into<String>) -> Self {
        GeminiAssistant {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            api_url: GEMINI_API_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_REPLY_TIMEOUT_SECS),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base URL of the `models` collection.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

/// `GEMINI_API_KEY` (and optionally `GEMINI_MODEL`, `GEMINI_TIMEOUT_SECS`)
/// select the model; without a key the unconfigured notice is returned.
pub fn assistant_from_env() -> Arc<dyn Assistant> {
    match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            let mut assistant = GeminiAssistant::new(key.trim());
            if let Ok(model) = std::env::var("GEMINI_MODEL") {
                if !model.trim().is_empty() {
                    assistant = assistant.with_model(model.trim());
                }
            }
            match std::env::var("GEMINI_TIMEOUT_SECS").map(|v| v.trim().parse::<u64>()) {
                Ok(Ok(secs)) if secs > 0 => {
                    assistant = assistant.with_timeout(Duration::from_secs(secs));
                }
                Ok(_) => tracing::warn!("ignoring invalid GEMINI_TIMEOUT_SECS"),
                Err(_) => {}
            }
            Arc::new(assistant)
        }
        _ => {
            tracing::info!("GEMINI_API_KEY not set; chat answers with a configuration notice");
            Arc::new(UnconfiguredAssistant)
        }
    }
}

// ── Gemini wire format ───────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    system_instruction: Content,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

fn text_content(role: &str, text: &str) -> Content {
    Content {
        role: Some(role.to_string()),
        parts: vec![Part {
            text: Some(text.to_string()),
        }],
    }
}

fn build_request(history: &[ChatTurn], message: &str) -> GenerateRequest {
    let mut contents: Vec<Content> = history
        .iter()
        .map(|turn| {
            let role = match turn.role {
                ChatRole::User => "user",
                ChatRole::Model => "model",
            };
            text_content(role, &turn.text)
        })
        .collect();
    contents.push(text_content("user", message));
    GenerateRequest {
        contents,
        system_instruction: Content {
            role: None,
            parts: vec![Part {
                text: Some(SYSTEM_PROMPT.to_string()),
            }],
        },
        generation_config: GenerationConfig {
            temperature: 0.7,
            top_p: 0.95,
            max_output_tokens: 2048,
        },
    }
}

fn parse_response(response: GenerateResponse) -> Result<String, AssistantError> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if text.is_empty() {
        return Err(AssistantError::Parse(
            "response contained no text".to_string(),
        ));
    }
    Ok(text)
}

#[async_trait]
impl Assistant for GeminiAssistant {
    async fn reply(&self, history: &[ChatTurn], message: &str) -> Result<String, AssistantError> {
        let request = build_request(history, message);
        let url = format!("{}/{}:generateContent", self.api_url, self.model);
        let api_key = self.api_key.clone();
        let timeout = self.timeout;

        // ureq is synchronous, so wrap in spawn_blocking
        let response = tokio::task::spawn_blocking(move || {
            let agent: ureq::Agent = ureq::Agent::config_builder()
                .timeout_global(Some(timeout))
                .build()
                .into();
            agent
                .post(&url)
                .header("x-goog-api-key", &api_key)
                .header("content-type", "application/json")
                .send_json(&request)
                .map_err(|e| AssistantError::Request(e.to_string()))?
                .into_body()
                .read_json::<GenerateResponse>()
                .map_err(|e| AssistantError::Parse(e.to_string()))
        })
        .await
        .map_err(|e| AssistantError::Worker(format!("task join error: {}", e)))??;

        parse_response(response)
    }
}

// ── Sessions ─────────────────────────────────────────────────────────────────

/// Conversations keyed by task id.
pub struct ChatSessions {
    assistant: Arc<dyn Assistant>,
    output_root: PathBuf,
    sessions: DashMap<TaskId, Arc<tokio::sync::Mutex<Vec<ChatTurn>>>>,
}

impl ChatSessions {
    pub fn new(assistant: Arc<dyn Assistant>, output_root: impl Into<PathBuf>) -> Self {
        ChatSessions {
            assistant,
            output_root: output_root.into(),
            sessions: DashMap::new(),
        }
    }

    /// Send one user message and record both turns on success.
    ///
    /// The session lock is held only to copy the history and to record the
    /// answer, never while the model is working.
    pub async fn send(&self, task_id: &TaskId, message: &str) -> Result<String, AssistantError> {
        let session = self
            .sessions
            .entry(task_id.clone())
            .or_default()
            .value()
            .clone();
        let earlier = session.lock().await.clone();

        let prompt = if earlier.is_empty() {
            let context = project_context(&self.output_root, task_id).await;
            format!("{}\n\n**PREGUNTA DEL USUARIO:**\n{}", context, message)
        } else {
            message.to_string()
        };

        let answer = self.assistant.reply(&earlier, &prompt).await?;
        if self.assistant.is_configured() {
            let mut history = session.lock().await;
            history.push(ChatTurn {
                role: ChatRole::User,
                text: prompt,
            });
            history.push(ChatTurn {
                role: ChatRole::Model,
                text: answer.clone(),
            });
        }
        Ok(answer)
    }

    pub fn history(&self, task_id: &TaskId) -> Vec<ChatTurn> {
        self.sessions
            .get(task_id)
            .and_then(|s| s.value().try_lock().ok().map(|h| h.clone()))
            .unwrap_or_default()
    }

    /// Forget the conversation. Returns whether one existed.
    pub fn clear(&self, task_id: &TaskId) -> bool {
        self.sessions.remove(task_id).is_some()
    }
}

/// Markdown digest of a task's output area.
pub async fn project_context(output_root: &Path, task_id: &TaskId) -> String {
    let dir = output_root.join(task_id.as_str());
    if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
        return "⚠️ Proyecto no encontrado. No hay datos disponibles.".to_string();
    }

    let mut parts = vec![
        format!("# EXPEDIENTE CATASTRAL: {}", task_id),
        "\n## ARCHIVOS DISPONIBLES:\n".to_string(),
    ];
    let sections = [
        (report::LOG_FILE, "### LOG DEL EXPEDIENTE:", ""),
        (report::PARCELS_FILE, "### DATOS CATASTRALES (CSV):", "csv"),
        (report::AFFECTIONS_FILE, "### ANÁLISIS DE AFECCIONES:", "csv"),
    ];
    for (file, title, lang) in sections {
        if let Ok(text) = tokio::fs::read_to_string(dir.join(file)).await {
            parts.push(title.to_string());
            parts.push(format!("```{}\n{}\n```\n", lang, text));
        }
    }

    let mut payloads = Vec::new();
    if let Ok(mut read_dir) = tokio::fs::read_dir(&dir).await {
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".gml") {
                payloads.push(stem.to_string());
            }
        }
    }
    if !payloads.is_empty() {
        payloads.sort();
        parts.push(format!("### PARCELAS PROCESADAS: {}", payloads.len()));
        for stem in &payloads {
            // strip the NNNN_ ordinal
            let reference = stem.split_once('_').map(|(_, r)| r).unwrap_or(stem);
            parts.push(format!("- {}", reference));
        }
        parts.push(String::new());
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records what it was asked and echoes the message length.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(usize, String)>>,
    }

    #[async_trait]
    impl Assistant for Recorder {
        async fn reply(&self, history: &[ChatTurn], message: &str) -> Result<String, AssistantError> {
            self.calls
                .lock()
                .unwrap()
                .push((history.len(), message.to_string()));
            Ok(format!("ok {}", history.len()))
        }
    }

    #[tokio::test]
    async fn first_message_carries_project_context() {
        let root = tempfile::TempDir::new().unwrap();
        let id = TaskId::from("t1");
        let dir = root.path().join("t1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(report::PARCELS_FILE), "referencia,crs\nR1,EPSG:25830\n").unwrap();
        std::fs::write(dir.join("0001_R1.gml"), "<gml/>").unwrap();

        let recorder = Arc::new(Recorder::default());
        let sessions = ChatSessions::new(recorder.clone(), root.path());
        assert_eq!(sessions.send(&id, "¿Qué área tiene?").await.unwrap(), "ok 0");
        assert_eq!(sessions.send(&id, "¿Y la capa?").await.unwrap(), "ok 2");

        let calls = recorder.calls.lock().unwrap().clone();
        assert!(calls[0].1.contains("# EXPEDIENTE CATASTRAL: t1"));
        assert!(calls[0].1.contains("R1,EPSG:25830"));
        assert!(calls[0].1.contains("### PARCELAS PROCESADAS: 1\n- R1"));
        assert!(calls[0].1.ends_with("¿Qué área tiene?"));
        assert_eq!(calls[1], (2, "¿Y la capa?".to_string()));
        assert_eq!(sessions.history(&id).len(), 4);

        assert!(sessions.clear(&id));
        assert!(!sessions.clear(&id));
        assert!(sessions.history(&id).is_empty());
    }

    #[tokio::test]
    async fn unconfigured_assistant_returns_notice() {
        let root = tempfile::TempDir::new().unwrap();
        let sessions = ChatSessions::new(Arc::new(UnconfiguredAssistant), root.path());
        let answer = sessions.send(&TaskId::from("x"), "hola").await.unwrap();
        assert!(answer.contains("API Key de Gemini no configurada"));
        assert!(sessions.history(&TaskId::from("x")).is_empty());
    }

    /// Holds every reply until released.
    struct Gate {
        release: tokio::sync::Notify,
        started: tokio::sync::Notify,
    }

    #[async_trait]
    impl Assistant for Gate {
        async fn reply(&self, _history: &[ChatTurn], _message: &str) -> Result<String, AssistantError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok("listo".to_string())
        }
    }

    #[tokio::test]
    async fn session_is_readable_while_model_is_answering() {
        let root = tempfile::TempDir::new().unwrap();
        let gate = Arc::new(Gate {
            release: tokio::sync::Notify::new(),
            started: tokio::sync::Notify::new(),
        });
        let sessions = Arc::new(ChatSessions::new(gate.clone(), root.path()));
        let id = TaskId::from("t");

        let sender = Arc::clone(&sessions);
        let sender_id = id.clone();
        let pending = tokio::spawn(async move { sender.send(&sender_id, "hola").await });
        gate.started.notified().await;

        // The pending call must not hold the session.
        let session = sessions.sessions.get(&id).unwrap().value().clone();
        assert!(session.try_lock().is_ok());
        assert!(sessions.history(&id).is_empty());

        gate.release.notify_one();
        assert_eq!(pending.await.unwrap().unwrap(), "listo");
        assert_eq!(sessions.history(&id).len(), 2);
    }

    #[tokio::test]
    async fn gemini_reply_gives_up_after_timeout() {
        // Accepts connections and never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = std::thread::spawn(move || {
            let held: Vec<_> = listener.incoming().take(1).collect();
            std::thread::sleep(Duration::from_secs(3));
            drop(held);
        });

        let assistant = GeminiAssistant::new("clave")
            .with_api_url(format!("http://{}/v1beta/models", addr))
            .with_timeout(Duration::from_millis(300));
        let outcome =
            tokio::time::timeout(Duration::from_secs(2), assistant.reply(&[], "hola")).await;
        assert!(matches!(outcome, Ok(Err(AssistantError::Request(_)))), "{:?}", outcome);
        silent.join().unwrap();
    }

    #[tokio::test]
    async fn missing_project_is_reported_in_context() {
        let root = tempfile::TempDir::new().unwrap();
        let context = project_context(root.path(), &TaskId::from("nope")).await;
        assert!(context.contains("Proyecto no encontrado"));
    }

    #[test]
    fn request_maps_roles_and_generation_settings() {
        let history = vec![
            ChatTurn {
                role: ChatRole::User,
                text: "a".to_string(),
            },
            ChatTurn {
                role: ChatRole::Model,
                text: "b".to_string(),
            },
        ];
        let json = serde_json::to_value(build_request(&history, "c")).unwrap();
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][2]["parts"][0]["text"], "c");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 2048);
        assert!(json["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn response_text_is_joined_from_parts() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hola "},{"text":"mundo"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(parse_response(response).unwrap(), "Hola mundo");

        let empty: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(parse_response(empty).is_err());
    }
}
