//! Wire Protocol Types
//!
//! Fragments, message parts, and the frames exchanged over the
//! conversation WebSocket. Field names follow the producer's wire
//! format (camelCase keys, kebab-case `type` tags).

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// Frame-level decode failure. The frame is dropped and the
/// connection stays alive.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown fragment type `{0}`")]
    UnknownType(String),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle of a streamed text part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextState {
    Streaming,
    Done,
}

/// Lifecycle of a tool invocation part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
}

impl ToolState {
    /// Position in the forward-only walk. The two output states share
    /// a rank: they are alternative terminals, not an ordering.
    pub fn rank(self) -> u8 {
        match self {
            ToolState::InputStreaming => 0,
            ToolState::InputAvailable => 1,
            ToolState::OutputAvailable | ToolState::OutputError => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ToolState::OutputAvailable | ToolState::OutputError)
    }

    fn wire_name(self) -> &'static str {
        match self {
            ToolState::InputStreaming => "input-streaming",
            ToolState::InputAvailable => "input-available",
            ToolState::OutputAvailable => "output-available",
            ToolState::OutputError => "output-error",
        }
    }
}

/// One renderable unit inside a message.
///
/// Tool and data parts carry an open tag set on the wire
/// (`tool-<toolName>`, `data-<kind>`), so serde derives cannot cover
/// them; serialization goes through [`Part::to_value`] /
/// [`Part::from_value`].
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text {
        /// Producer chunk id, used to route `text-delta` fragments.
        /// Absent on client-authored parts.
        id: Option<String>,
        text: String,
        state: Option<TextState>,
    },
    Tool {
        tool_call_id: String,
        tool_name: String,
        state: ToolState,
        input: Option<Value>,
        output: Option<Value>,
        error_text: Option<String>,
    },
    Data {
        kind: String,
        data: Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            id: None,
            text: text.into(),
            state: None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Part::Text { id, text, state } => {
                let mut map = Map::new();
                map.insert("type".into(), json!("text"));
                if let Some(id) = id {
                    map.insert("id".into(), json!(id));
                }
                map.insert("text".into(), json!(text));
                if let Some(state) = state {
                    let name = match state {
                        TextState::Streaming => "streaming",
                        TextState::Done => "done",
                    };
                    map.insert("state".into(), json!(name));
                }
                Value::Object(map)
            }
            Part::Tool {
                tool_call_id,
                tool_name,
                state,
                input,
                output,
                error_text,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), json!(format!("tool-{tool_name}")));
                map.insert("toolCallId".into(), json!(tool_call_id));
                map.insert("state".into(), json!(state.wire_name()));
                if let Some(input) = input {
                    map.insert("input".into(), input.clone());
                }
                if let Some(output) = output {
                    map.insert("output".into(), output.clone());
                }
                if let Some(error_text) = error_text {
                    map.insert("errorText".into(), json!(error_text));
                }
                Value::Object(map)
            }
            Part::Data { kind, data } => json!({
                "type": format!("data-{kind}"),
                "data": data,
            }),
        }
    }

    pub fn from_value(v: &Value) -> Result<Self, ProtocolError> {
        let map = v.as_object().ok_or(ProtocolError::NotAnObject)?;
        let tag = str_field(map, "type")?;
        if tag == "text" {
            return Ok(Part::Text {
                id: opt_str_field(map, "id"),
                text: str_field(map, "text")?,
                state: match map.get("state") {
                    Some(s) => Some(serde_json::from_value(s.clone())?),
                    None => None,
                },
            });
        }
        if let Some(tool_name) = tag.strip_prefix("tool-") {
            return Ok(Part::Tool {
                tool_call_id: str_field(map, "toolCallId")?,
                tool_name: tool_name.to_string(),
                state: serde_json::from_value(
                    map.get("state")
                        .ok_or(ProtocolError::MissingField("state"))?
                        .clone(),
                )?,
                input: map.get("input").cloned(),
                output: map.get("output").cloned(),
                error_text: opt_str_field(map, "errorText"),
            });
        }
        if let Some(kind) = tag.strip_prefix("data-") {
            return Ok(Part::Data {
                kind: kind.to_string(),
                data: map.get("data").cloned().unwrap_or(Value::Null),
            });
        }
        Err(ProtocolError::UnknownType(tag))
    }
}

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Part::from_value(&v).map_err(D::Error::custom)
    }
}

/// One turn in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    /// Set when an `error` fragment closed this message; surfaced to
    /// viewers so a truncated reply is never silent.
    #[serde(
        default,
        rename = "errorText",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_text: Option<String>,
}

impl Message {
    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Message {
            id: id.into(),
            role: Role::User,
            parts: vec![Part::text(text)],
            error_text: None,
        }
    }

    pub fn assistant(id: impl Into<String>) -> Self {
        Message {
            id: id.into(),
            role: Role::Assistant,
            parts: Vec::new(),
            error_text: None,
        }
    }
}

/// Atomic streamed update describing one increment of generation.
///
/// Tag set is closed except for `data-<kind>`, handled by
/// [`Fragment::to_value`] / [`Fragment::from_value`].
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Start { message_id: Option<String> },
    StartStep,
    FinishStep,
    Finish,
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    ToolInputStart { tool_call_id: String, tool_name: String },
    ToolInputDelta { tool_call_id: String, input_text_delta: String },
    ToolInputAvailable { tool_call_id: String, tool_name: String, input: Value },
    ToolOutputAvailable { tool_call_id: String, output: Value },
    ToolOutputError { tool_call_id: String, error_text: String },
    Data { kind: String, data: Value },
    Error { error_text: String },
}

impl Fragment {
    /// Terminal fragments close the open message and end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Fragment::Finish | Fragment::Error { .. })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Fragment::Start { message_id } => {
                let mut map = Map::new();
                map.insert("type".into(), json!("start"));
                if let Some(id) = message_id {
                    map.insert("messageId".into(), json!(id));
                }
                Value::Object(map)
            }
            Fragment::StartStep => json!({ "type": "start-step" }),
            Fragment::FinishStep => json!({ "type": "finish-step" }),
            Fragment::Finish => json!({ "type": "finish" }),
            Fragment::TextStart { id } => json!({ "type": "text-start", "id": id }),
            Fragment::TextDelta { id, delta } => {
                json!({ "type": "text-delta", "id": id, "delta": delta })
            }
            Fragment::TextEnd { id } => json!({ "type": "text-end", "id": id }),
            Fragment::ToolInputStart {
                tool_call_id,
                tool_name,
            } => json!({
                "type": "tool-input-start",
                "toolCallId": tool_call_id,
                "toolName": tool_name,
            }),
            Fragment::ToolInputDelta {
                tool_call_id,
                input_text_delta,
            } => json!({
                "type": "tool-input-delta",
                "toolCallId": tool_call_id,
                "inputTextDelta": input_text_delta,
            }),
            Fragment::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => json!({
                "type": "tool-input-available",
                "toolCallId": tool_call_id,
                "toolName": tool_name,
                "input": input,
            }),
            Fragment::ToolOutputAvailable {
                tool_call_id,
                output,
            } => json!({
                "type": "tool-output-available",
                "toolCallId": tool_call_id,
                "output": output,
            }),
            Fragment::ToolOutputError {
                tool_call_id,
                error_text,
            } => json!({
                "type": "tool-output-error",
                "toolCallId": tool_call_id,
                "errorText": error_text,
            }),
            Fragment::Data { kind, data } => json!({
                "type": format!("data-{kind}"),
                "data": data,
            }),
            Fragment::Error { error_text } => {
                json!({ "type": "error", "errorText": error_text })
            }
        }
    }

    pub fn from_value(v: &Value) -> Result<Self, ProtocolError> {
        let map = v.as_object().ok_or(ProtocolError::NotAnObject)?;
        let tag = str_field(map, "type")?;
        if let Some(kind) = tag.strip_prefix("data-") {
            return Ok(Fragment::Data {
                kind: kind.to_string(),
                data: map.get("data").cloned().unwrap_or(Value::Null),
            });
        }
        let fragment = match tag.as_str() {
            "start" => Fragment::Start {
                message_id: opt_str_field(map, "messageId"),
            },
            "start-step" => Fragment::StartStep,
            "finish-step" => Fragment::FinishStep,
            "finish" => Fragment::Finish,
            "text-start" => Fragment::TextStart {
                id: str_field(map, "id")?,
            },
            "text-delta" => Fragment::TextDelta {
                id: str_field(map, "id")?,
                delta: str_field(map, "delta")?,
            },
            "text-end" => Fragment::TextEnd {
                id: str_field(map, "id")?,
            },
            "tool-input-start" => Fragment::ToolInputStart {
                tool_call_id: str_field(map, "toolCallId")?,
                tool_name: str_field(map, "toolName")?,
            },
            "tool-input-delta" => Fragment::ToolInputDelta {
                tool_call_id: str_field(map, "toolCallId")?,
                input_text_delta: str_field(map, "inputTextDelta")?,
            },
            "tool-input-available" => Fragment::ToolInputAvailable {
                tool_call_id: str_field(map, "toolCallId")?,
                tool_name: str_field(map, "toolName")?,
                input: map.get("input").cloned().unwrap_or(Value::Null),
            },
            "tool-output-available" => Fragment::ToolOutputAvailable {
                tool_call_id: str_field(map, "toolCallId")?,
                output: map.get("output").cloned().unwrap_or(Value::Null),
            },
            "tool-output-error" => Fragment::ToolOutputError {
                tool_call_id: str_field(map, "toolCallId")?,
                error_text: str_field(map, "errorText")?,
            },
            "error" => Fragment::Error {
                error_text: str_field(map, "errorText")?,
            },
            _ => return Err(ProtocolError::UnknownType(tag)),
        };
        Ok(fragment)
    }
}

impl Serialize for Fragment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fragment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Fragment::from_value(&v).map_err(D::Error::custom)
    }
}

fn str_field(map: &Map<String, Value>, name: &'static str) -> Result<String, ProtocolError> {
    map.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProtocolError::MissingField(name))
}

fn opt_str_field(map: &Map<String, Value>, name: &str) -> Option<String> {
    map.get(name).and_then(Value::as_str).map(str::to_string)
}

/// What caused a submission (mirrors the chat UI's trigger kinds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    SubmitMessage,
    RegenerateMessage,
}

/// Client-submitted snapshot of the full message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitFrame {
    pub messages: Vec<Message>,
    pub trigger: Trigger,
    /// Correlation id, echoed back to sibling viewers.
    pub id: String,
}

// Unit-enum tags give the untagged frame enums a required
// discriminator field, so dispatch is field-driven rather than
// content sniffing.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortTag {
    #[serde(rename = "abort")]
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitTag {
    #[serde(rename = "init-messages")]
    InitMessages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncTag {
    #[serde(rename = "resync")]
    Resync,
}

/// Best-effort cancellation notice for the in-flight submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortFrame {
    #[serde(rename = "type")]
    pub tag: AbortTag,
    #[serde(rename = "chatId")]
    pub chat_id: String,
}

/// Full-log snapshot pushed on attach and on explicit request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitFrame {
    pub trigger: InitTag,
    pub messages: Vec<Message>,
}

/// A sibling viewer's submitted message, echoed verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoFrame {
    pub message: Message,
    pub trigger: Trigger,
    pub id: String,
}

/// Out-of-band signal: discard incremental state and re-fetch the log
/// via the read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncFrame {
    pub signal: ResyncTag,
}

impl ResyncFrame {
    pub fn new() -> Self {
        ResyncFrame {
            signal: ResyncTag::Resync,
        }
    }
}

impl Default for ResyncFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames sent FROM the client TO the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Submit(SubmitFrame),
    Abort(AbortFrame),
}

/// Frames sent FROM the server TO the client.
///
/// Variant order matters: serde tries them in sequence, and each is
/// gated by a distinct required field (`trigger` + `messages`,
/// `trigger` + `message`, `signal`, `type`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Init(InitFrame),
    Echo(EchoFrame),
    Resync(ResyncFrame),
    Fragment(Fragment),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_text_delta_serde() {
        let frag = Fragment::TextDelta {
            id: "t1".to_string(),
            delta: "é".to_string(),
        };
        let json = serde_json::to_value(&frag).unwrap();
        assert_eq!(json["type"], "text-delta");
        assert_eq!(json["id"], "t1");
        assert_eq!(json["delta"], "é");
        let rt: Fragment = serde_json::from_value(json).unwrap();
        assert_eq!(rt, frag);
    }

    #[test]
    fn fragment_start_omits_absent_message_id() {
        let json = serde_json::to_value(Fragment::Start { message_id: None }).unwrap();
        assert_eq!(json["type"], "start");
        assert!(json.get("messageId").is_none());

        let json =
            serde_json::to_value(Fragment::Start { message_id: Some("m1".into()) }).unwrap();
        assert_eq!(json["messageId"], "m1");
    }

    #[test]
    fn fragment_tool_fields_are_camel_case() {
        let frag = Fragment::ToolInputAvailable {
            tool_call_id: "call-1".to_string(),
            tool_name: "getWeatherInformation".to_string(),
            input: json!({ "city": "Paris" }),
        };
        let json = serde_json::to_value(&frag).unwrap();
        assert_eq!(json["type"], "tool-input-available");
        assert_eq!(json["toolCallId"], "call-1");
        assert_eq!(json["toolName"], "getWeatherInformation");
        assert_eq!(json["input"]["city"], "Paris");
    }

    #[test]
    fn fragment_data_open_kind() {
        let frag = Fragment::Data {
            kind: "custom".to_string(),
            data: json!({ "foo": 42 }),
        };
        let json = serde_json::to_value(&frag).unwrap();
        assert_eq!(json["type"], "data-custom");
        let rt: Fragment = serde_json::from_value(json).unwrap();
        assert_eq!(rt, frag);
    }

    #[test]
    fn fragment_unknown_type_rejected() {
        let err = Fragment::from_value(&json!({ "type": "warp" })).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "warp"));
    }

    #[test]
    fn fragment_roundtrip_all_variants() {
        let variants = vec![
            Fragment::Start { message_id: Some("m".into()) },
            Fragment::StartStep,
            Fragment::FinishStep,
            Fragment::Finish,
            Fragment::TextStart { id: "t".into() },
            Fragment::TextDelta { id: "t".into(), delta: "x".into() },
            Fragment::TextEnd { id: "t".into() },
            Fragment::ToolInputStart {
                tool_call_id: "c".into(),
                tool_name: "getLocation".into(),
            },
            Fragment::ToolInputDelta {
                tool_call_id: "c".into(),
                input_text_delta: "{".into(),
            },
            Fragment::ToolInputAvailable {
                tool_call_id: "c".into(),
                tool_name: "getLocation".into(),
                input: json!({}),
            },
            Fragment::ToolOutputAvailable { tool_call_id: "c".into(), output: json!("ok") },
            Fragment::ToolOutputError {
                tool_call_id: "c".into(),
                error_text: "boom".into(),
            },
            Fragment::Data { kind: "custom".into(), data: json!(null) },
            Fragment::Error { error_text: "boom".into() },
        ];
        for frag in variants {
            let s = serde_json::to_string(&frag).unwrap();
            let rt: Fragment = serde_json::from_str(&s).unwrap();
            assert_eq!(rt, frag);
        }
    }

    #[test]
    fn part_tool_tag_carries_tool_name() {
        let part = Part::Tool {
            tool_call_id: "call-1".to_string(),
            tool_name: "getWeatherInformation".to_string(),
            state: ToolState::OutputAvailable,
            input: Some(json!({ "city": "Paris" })),
            output: Some(json!("sunny")),
            error_text: None,
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "tool-getWeatherInformation");
        assert_eq!(json["state"], "output-available");
        assert_eq!(json["output"], "sunny");
        assert!(json.get("errorText").is_none());
        let rt: Part = serde_json::from_value(json).unwrap();
        assert_eq!(rt, part);
    }

    #[test]
    fn part_user_text_minimal_shape() {
        // Client-authored text part: no id, no state.
        let part: Part = serde_json::from_value(json!({
            "type": "text",
            "text": "météo à Paris",
        }))
        .unwrap();
        assert_eq!(part, Part::text("météo à Paris"));
        let json = serde_json::to_value(&part).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("state").is_none());
    }

    #[test]
    fn tool_state_ranks_forward_only() {
        assert!(ToolState::InputStreaming.rank() < ToolState::InputAvailable.rank());
        assert!(ToolState::InputAvailable.rank() < ToolState::OutputAvailable.rank());
        assert_eq!(
            ToolState::OutputAvailable.rank(),
            ToolState::OutputError.rank()
        );
        assert!(ToolState::OutputError.is_terminal());
        assert!(!ToolState::InputAvailable.is_terminal());
    }

    #[test]
    fn message_error_text_skipped_when_none() {
        let msg = Message::user("m1", "salut");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("errorText").is_none());
    }

    #[test]
    fn server_frame_dispatch_by_discriminator() {
        let init: ServerFrame = serde_json::from_value(json!({
            "trigger": "init-messages",
            "messages": [],
        }))
        .unwrap();
        assert!(matches!(init, ServerFrame::Init(_)));

        let echo: ServerFrame = serde_json::from_value(json!({
            "trigger": "submit-message",
            "id": "c1",
            "message": { "id": "m1", "role": "user", "parts": [] },
        }))
        .unwrap();
        assert!(matches!(echo, ServerFrame::Echo(_)));

        let resync: ServerFrame = serde_json::from_value(json!({ "signal": "resync" })).unwrap();
        assert!(matches!(resync, ServerFrame::Resync(_)));

        let frag: ServerFrame = serde_json::from_value(json!({ "type": "finish" })).unwrap();
        assert!(matches!(frag, ServerFrame::Fragment(Fragment::Finish)));
    }

    #[test]
    fn client_frame_dispatch() {
        let submit: ClientFrame = serde_json::from_value(json!({
            "messages": [{ "id": "m1", "role": "user", "parts": [] }],
            "trigger": "submit-message",
            "id": "conv-1",
        }))
        .unwrap();
        match submit {
            ClientFrame::Submit(f) => {
                assert_eq!(f.messages.len(), 1);
                assert_eq!(f.trigger, Trigger::SubmitMessage);
            }
            _ => panic!("Expected Submit"),
        }

        let abort: ClientFrame =
            serde_json::from_value(json!({ "type": "abort", "chatId": "conv-1" })).unwrap();
        assert!(matches!(abort, ClientFrame::Abort(_)));
    }

    #[test]
    fn server_frame_echo_roundtrip() {
        let frame = ServerFrame::Echo(EchoFrame {
            message: Message::user("m1", "salut"),
            trigger: Trigger::SubmitMessage,
            id: "corr-1".to_string(),
        });
        let s = serde_json::to_string(&frame).unwrap();
        let rt: ServerFrame = serde_json::from_str(&s).unwrap();
        match rt {
            ServerFrame::Echo(e) => {
                assert_eq!(e.message.id, "m1");
                assert_eq!(e.id, "corr-1");
            }
            _ => panic!("Expected Echo"),
        }
    }
}
