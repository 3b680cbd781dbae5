//! Generation Collaborator
//!
//! The relay treats generation as an opaque producer: a message
//! history goes in, a finite fragment stream comes out, terminated by
//! exactly one `finish` or `error`. The mock responder mirrors the
//! original demo producer: canned replies streamed character by
//! character, plus three keyword-triggered tools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::stream::BoxStream;
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::protocol::{Fragment, Message, Part, Role};

/// Collaborator failure. The relay converts this into a terminal
/// `error` fragment; it never aborts the conversation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct GenerationError(pub String);

pub trait Responder: Send + Sync {
    /// Produce the fragment stream for one assistant turn. The stream
    /// is finite and potentially slow; callers must not assume it can
    /// be cancelled remotely.
    fn respond(&self, history: &[Message]) -> BoxStream<'static, Result<Fragment, GenerationError>>;
}

/// Pacing knobs for the mock responder. Tests shrink these to zero.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Delay between consecutive `text-delta` fragments.
    pub char_delay: Duration,
    /// Simulated execution time of the server-side weather tool.
    pub tool_delay: Duration,
    /// Pause before the terminal `finish`.
    pub finish_delay: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        ResponderConfig {
            char_delay: Duration::from_millis(30),
            tool_delay: Duration::from_secs(2),
            finish_delay: Duration::from_secs(1),
        }
    }
}

impl ResponderConfig {
    pub fn fast() -> Self {
        ResponderConfig {
            char_delay: Duration::ZERO,
            tool_delay: Duration::ZERO,
            finish_delay: Duration::ZERO,
        }
    }
}

const MOCK_RESPONSES: &[&str] = &[
    "Bonjour ! Comment puis-je vous aider aujourd'hui ?",
    "Hmm... Très bien je vois. Pouvez-vous me donner plus de détails ?",
    "Ok? Je vous écoute.",
    "D'accord. Et ensuite ? Avez-vous d'autres questions ?",
];

const WEATHER_CONDITIONS: &[&str] = &["sunny", "cloudy", "rainy", "snowy", "windy"];

const WEATHER_KEYWORDS: &[&str] = &["météo", "weather", "temps", "température"];
const CONFIRMATION_KEYWORDS: &[&str] = &["confirmer", "confirmation", "êtes-vous sûr", "voulez-vous"];
const LOCATION_KEYWORDS: &[&str] = &["où", "position", "location", "localisation"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolIntent {
    Weather,
    Confirmation,
    Location,
}

/// Mock producer with a rotating reply index shared across turns.
pub struct MockResponder {
    config: ResponderConfig,
    response_index: AtomicUsize,
}

impl MockResponder {
    pub fn new(config: ResponderConfig) -> Self {
        MockResponder {
            config,
            response_index: AtomicUsize::new(0),
        }
    }
}

impl Responder for MockResponder {
    fn respond(&self, history: &[Message]) -> BoxStream<'static, Result<Fragment, GenerationError>> {
        let config = self.config.clone();
        let user_text = last_user_text(history);
        let first_turn = history.len() == 1;
        let response = MOCK_RESPONSES
            [self.response_index.fetch_add(1, Ordering::Relaxed) % MOCK_RESPONSES.len()]
        .to_string();

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            if let Err(e) = run_turn(&tx, config, user_text, first_turn, response).await {
                warn!("Mock responder stream dropped by consumer: {e}");
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

type SendError = mpsc::error::SendError<Result<Fragment, GenerationError>>;

async fn run_turn(
    tx: &mpsc::Sender<Result<Fragment, GenerationError>>,
    config: ResponderConfig,
    user_text: String,
    first_turn: bool,
    response: String,
) -> Result<(), SendError> {
    let emit = |fragment: Fragment| tx.send(Ok(fragment));

    emit(Fragment::Start {
        message_id: Some(chunk_id()),
    })
    .await?;
    if first_turn {
        emit(Fragment::Data {
            kind: "custom".to_string(),
            data: json!({ "foo": chrono::Utc::now().timestamp_millis() }),
        })
        .await?;
    }
    emit(Fragment::StartStep).await?;

    match detect_tool_intent(&user_text) {
        Some(intent) => {
            let tool_call_id = chunk_id();
            let (tool_name, input) = match intent {
                ToolIntent::Weather => (
                    "getWeatherInformation",
                    json!({ "city": extract_city(&user_text) }),
                ),
                ToolIntent::Confirmation => (
                    "askForConfirmation",
                    json!({ "message": "Voulez-vous vraiment continuer ?" }),
                ),
                ToolIntent::Location => ("getLocation", json!({})),
            };
            emit(Fragment::ToolInputAvailable {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.to_string(),
                input,
            })
            .await?;

            // Only the weather tool executes server-side; the other
            // two are resolved by the viewer.
            if intent == ToolIntent::Weather {
                tokio::time::sleep(config.tool_delay).await;
                let condition = {
                    let mut rng = rand::rng();
                    WEATHER_CONDITIONS[rng.random_range(0..WEATHER_CONDITIONS.len())]
                };
                emit(Fragment::ToolOutputAvailable {
                    tool_call_id,
                    output: json!(condition),
                })
                .await?;
            }
        }
        None => {
            let text_id = chunk_id();
            emit(Fragment::TextStart { id: text_id.clone() }).await?;
            for c in response.chars() {
                emit(Fragment::TextDelta {
                    id: text_id.clone(),
                    delta: c.to_string(),
                })
                .await?;
                tokio::time::sleep(config.char_delay).await;
            }
            emit(Fragment::TextEnd { id: text_id }).await?;
        }
    }

    emit(Fragment::FinishStep).await?;
    tokio::time::sleep(config.finish_delay).await;
    emit(Fragment::Finish).await
}

fn chunk_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn last_user_text(history: &[Message]) -> String {
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .and_then(|m| {
            m.parts.iter().find_map(|p| match p {
                Part::Text { text, .. } => Some(text.clone()),
                _ => None,
            })
        })
        .unwrap_or_default()
}

fn detect_tool_intent(user_text: &str) -> Option<ToolIntent> {
    let text = user_text.to_lowercase();
    let matches_any = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));
    if matches_any(WEATHER_KEYWORDS) {
        return Some(ToolIntent::Weather);
    }
    if matches_any(CONFIRMATION_KEYWORDS) {
        return Some(ToolIntent::Confirmation);
    }
    if matches_any(LOCATION_KEYWORDS) {
        return Some(ToolIntent::Location);
    }
    None
}

/// Pull the city out of phrases like "météo à Paris" / "le temps pour
/// Lyon". Falls back to Paris when no preposition is found.
fn extract_city(user_text: &str) -> String {
    const PREPOSITIONS: &[&str] = &["à", "pour", "de", "dans"];
    let words: Vec<&str> = user_text.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        if PREPOSITIONS.contains(&word.to_lowercase().as_str()) && i + 1 < words.len() {
            let city = words[i + 1..]
                .join(" ")
                .trim_end_matches(['?', '!', '.', ','])
                .trim()
                .to_string();
            if !city.is_empty() {
                return city;
            }
        }
    }
    "Paris".to_string()
}

/// Test collaborator that violates its contract partway through a
/// text reply, exercising the relay's error synthesis.
#[cfg(test)]
pub struct FailingResponder {
    pub fail_after_deltas: usize,
}

#[cfg(test)]
impl Responder for FailingResponder {
    fn respond(&self, _history: &[Message]) -> BoxStream<'static, Result<Fragment, GenerationError>> {
        let n = self.fail_after_deltas;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let _ = tx.send(Ok(Fragment::Start { message_id: Some("fail-1".into()) })).await;
            let _ = tx.send(Ok(Fragment::TextStart { id: "t1".into() })).await;
            for _ in 0..n {
                let _ = tx
                    .send(Ok(Fragment::TextDelta { id: "t1".into(), delta: "x".into() }))
                    .await;
            }
            let _ = tx.send(Err(GenerationError("mock failure".into()))).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }
}
