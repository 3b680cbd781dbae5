//! Message Folder
//!
//! Deterministic reducer that folds an ordered fragment sequence into
//! the per-conversation message log. Replay-safe: folding the same
//! sequence into a fresh log twice yields identical logs, which is
//! what lets a reconnecting viewer resynchronize by re-reading.

use std::collections::HashMap;

use crate::protocol::{Fragment, Message, Part, Role, TextState, ToolState};

/// A fragment referenced state the log does not have. The fragment is
/// dropped and the log stays in its last-known-good state; this is a
/// producer bug, not a protocol abort.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FoldError {
    #[error("no open message for `{kind}` fragment")]
    NoOpenMessage { kind: &'static str },
    #[error("text part `{id}` not found in open message")]
    UnknownTextId { id: String },
    #[error("tool call `{tool_call_id}` not found in open message")]
    UnknownToolCall { tool_call_id: String },
    #[error("tool call `{tool_call_id}` cannot move from {from:?} to {to:?}")]
    ToolStateRegression {
        tool_call_id: String,
        from: ToolState,
        to: ToolState,
    },
}

/// Ordered message sequence for one conversation. Append-only except
/// that the last message is updated in place while it is open.
#[derive(Debug, Default)]
pub struct ConversationLog {
    messages: Vec<Message>,
    open: bool,
    /// Partial tool input accumulated from `tool-input-delta`
    /// fragments, keyed by toolCallId. Not viewer-visible until the
    /// producer sends `tool-input-available`.
    pending_tool_input: HashMap<String, String>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Replace the whole log with a client-submitted snapshot
    /// (last-writer-wins). The snapshot is settled state, so any open
    /// message and pending input are discarded.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.open = false;
        self.pending_tool_input.clear();
    }

    /// Fold one fragment into the log.
    pub fn fold(&mut self, fragment: &Fragment) -> Result<(), FoldError> {
        match fragment {
            Fragment::Start { message_id } => {
                if !self.open {
                    // Derive a deterministic id when the producer did
                    // not supply one, so replay from scratch
                    // reproduces the same log.
                    let id = message_id
                        .clone()
                        .unwrap_or_else(|| format!("assistant-{}", self.messages.len()));
                    self.messages.push(Message {
                        id,
                        role: Role::Assistant,
                        parts: Vec::new(),
                        error_text: None,
                    });
                    self.open = true;
                }
                Ok(())
            }
            Fragment::StartStep | Fragment::FinishStep => Ok(()),
            Fragment::TextStart { id } => {
                let message = self.open_message("text-start")?;
                message.parts.push(Part::Text {
                    id: Some(id.clone()),
                    text: String::new(),
                    state: Some(TextState::Streaming),
                });
                Ok(())
            }
            Fragment::TextDelta { id, delta } => {
                let part = self.text_part_mut(id)?;
                if let Part::Text { text, .. } = part {
                    text.push_str(delta);
                }
                Ok(())
            }
            Fragment::TextEnd { id } => {
                let part = self.text_part_mut(id)?;
                if let Part::Text { state, .. } = part {
                    *state = Some(TextState::Done);
                }
                Ok(())
            }
            Fragment::ToolInputStart {
                tool_call_id,
                tool_name,
            } => {
                let message = self.open_message("tool-input-start")?;
                message.parts.push(Part::Tool {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    state: ToolState::InputStreaming,
                    input: None,
                    output: None,
                    error_text: None,
                });
                self.pending_tool_input
                    .insert(tool_call_id.clone(), String::new());
                Ok(())
            }
            Fragment::ToolInputDelta {
                tool_call_id,
                input_text_delta,
            } => {
                let buffer = self.pending_tool_input.get_mut(tool_call_id).ok_or_else(|| {
                    FoldError::UnknownToolCall {
                        tool_call_id: tool_call_id.clone(),
                    }
                })?;
                buffer.push_str(input_text_delta);
                Ok(())
            }
            Fragment::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                self.pending_tool_input.remove(tool_call_id);
                // Producers may emit the complete input without a
                // preceding tool-input-start; accept a standalone part.
                if self.find_tool_part(tool_call_id).is_none() {
                    let message = self.open_message("tool-input-available")?;
                    message.parts.push(Part::Tool {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        state: ToolState::InputAvailable,
                        input: Some(input.clone()),
                        output: None,
                        error_text: None,
                    });
                    return Ok(());
                }
                self.advance_tool(tool_call_id, ToolState::InputAvailable, |part| {
                    if let Part::Tool { input: slot, .. } = part {
                        *slot = Some(input.clone());
                    }
                })
            }
            Fragment::ToolOutputAvailable {
                tool_call_id,
                output,
            } => self.advance_tool(tool_call_id, ToolState::OutputAvailable, |part| {
                if let Part::Tool { output: slot, .. } = part {
                    *slot = Some(output.clone());
                }
            }),
            Fragment::ToolOutputError {
                tool_call_id,
                error_text,
            } => self.advance_tool(tool_call_id, ToolState::OutputError, |part| {
                if let Part::Tool { error_text: slot, .. } = part {
                    *slot = Some(error_text.clone());
                }
            }),
            Fragment::Data { kind, data } => {
                let message = self.open_message("data")?;
                message.parts.push(Part::Data {
                    kind: kind.clone(),
                    data: data.clone(),
                });
                Ok(())
            }
            Fragment::Finish => {
                self.open = false;
                self.pending_tool_input.clear();
                Ok(())
            }
            Fragment::Error { error_text } => {
                // Partially streamed parts keep their text; the
                // message-level marker makes the truncation visible.
                if self.open {
                    if let Some(last) = self.messages.last_mut() {
                        last.error_text = Some(error_text.clone());
                    }
                } else {
                    // Generation failed before any `start`; record the
                    // failure as a closed, empty assistant message so
                    // it is never silent.
                    let id = format!("assistant-{}", self.messages.len());
                    let mut message = Message::assistant(id);
                    message.error_text = Some(error_text.clone());
                    self.messages.push(message);
                }
                self.open = false;
                self.pending_tool_input.clear();
                Ok(())
            }
        }
    }

    fn open_message(&mut self, kind: &'static str) -> Result<&mut Message, FoldError> {
        if !self.open {
            return Err(FoldError::NoOpenMessage { kind });
        }
        self.messages
            .last_mut()
            .ok_or(FoldError::NoOpenMessage { kind })
    }

    fn text_part_mut(&mut self, id: &str) -> Result<&mut Part, FoldError> {
        if !self.open {
            return Err(FoldError::UnknownTextId { id: id.to_string() });
        }
        self.messages
            .last_mut()
            .and_then(|m| {
                m.parts.iter_mut().find(|p| {
                    matches!(p, Part::Text { id: Some(part_id), .. } if part_id == id)
                })
            })
            .ok_or_else(|| FoldError::UnknownTextId { id: id.to_string() })
    }

    fn find_tool_part(&self, tool_call_id: &str) -> Option<&Part> {
        if !self.open {
            return None;
        }
        self.messages.last().and_then(|m| {
            m.parts.iter().find(
                |p| matches!(p, Part::Tool { tool_call_id: id, .. } if id == tool_call_id),
            )
        })
    }

    /// Move a tool part forward to `to`, applying `update` on success.
    /// A transition that would move backward, or out of a terminal
    /// state, is rejected.
    fn advance_tool(
        &mut self,
        tool_call_id: &str,
        to: ToolState,
        update: impl FnOnce(&mut Part),
    ) -> Result<(), FoldError> {
        if !self.open {
            return Err(FoldError::UnknownToolCall {
                tool_call_id: tool_call_id.to_string(),
            });
        }
        let part = self
            .messages
            .last_mut()
            .and_then(|m| {
                m.parts.iter_mut().find(
                    |p| matches!(p, Part::Tool { tool_call_id: id, .. } if id == tool_call_id),
                )
            })
            .ok_or_else(|| FoldError::UnknownToolCall {
                tool_call_id: tool_call_id.to_string(),
            })?;
        if let Part::Tool { state, .. } = part {
            if state.is_terminal() || to.rank() < state.rank() {
                return Err(FoldError::ToolStateRegression {
                    tool_call_id: tool_call_id.to_string(),
                    from: *state,
                    to,
                });
            }
            *state = to;
        }
        update(part);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fold_all(log: &mut ConversationLog, fragments: &[Fragment]) {
        for fragment in fragments {
            log.fold(fragment).unwrap();
        }
    }

    fn text_reply(message_id: &str, text_id: &str, text: &str) -> Vec<Fragment> {
        let mut fragments = vec![
            Fragment::Start { message_id: Some(message_id.to_string()) },
            Fragment::StartStep,
            Fragment::TextStart { id: text_id.to_string() },
        ];
        for c in text.chars() {
            fragments.push(Fragment::TextDelta {
                id: text_id.to_string(),
                delta: c.to_string(),
            });
        }
        fragments.push(Fragment::TextEnd { id: text_id.to_string() });
        fragments.push(Fragment::FinishStep);
        fragments.push(Fragment::Finish);
        fragments
    }

    #[test]
    fn text_stream_accumulates_in_order() {
        let mut log = ConversationLog::new();
        fold_all(&mut log, &text_reply("m1", "t1", "Bonjour !"));
        assert!(!log.is_open());
        let msg = log.messages().last().unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.role, Role::Assistant);
        match &msg.parts[0] {
            Part::Text { text, state, .. } => {
                assert_eq!(text, "Bonjour !");
                assert_eq!(*state, Some(TextState::Done));
            }
            other => panic!("Expected text part, got {other:?}"),
        }
    }

    #[test]
    fn replay_from_scratch_is_deterministic() {
        let mut fragments = text_reply("m1", "t1", "ok");
        fragments.splice(
            2..2,
            [Fragment::Data { kind: "custom".into(), data: json!({ "foo": 1 }) }],
        );
        // No messageId on a second turn: derived ids must also replay.
        fragments.extend(text_reply("", "t2", "encore").into_iter().map(|f| match f {
            Fragment::Start { .. } => Fragment::Start { message_id: None },
            other => other,
        }));

        let mut first = ConversationLog::new();
        let mut second = ConversationLog::new();
        fold_all(&mut first, &fragments);
        fold_all(&mut second, &fragments);
        assert_eq!(first.messages(), second.messages());
    }

    #[test]
    fn start_is_idempotent_while_open() {
        let mut log = ConversationLog::new();
        log.fold(&Fragment::Start { message_id: Some("m1".into()) }).unwrap();
        log.fold(&Fragment::Start { message_id: Some("m2".into()) }).unwrap();
        assert_eq!(log.messages().len(), 1);
        assert_eq!(log.messages()[0].id, "m1");
    }

    #[test]
    fn at_most_one_open_message() {
        let mut log = ConversationLog::new();
        fold_all(&mut log, &text_reply("m1", "t1", "a"));
        log.fold(&Fragment::Start { message_id: Some("m2".into()) }).unwrap();
        assert_eq!(log.messages().len(), 2);
        assert!(log.is_open());
        // Only the last message can be the open one.
        assert_eq!(log.messages().last().unwrap().id, "m2");
    }

    #[test]
    fn weather_tool_scenario() {
        let mut log = ConversationLog::new();
        log.replace(vec![Message::user("u1", "météo à Paris")]);
        fold_all(
            &mut log,
            &[
                Fragment::Start { message_id: Some("m1".into()) },
                Fragment::StartStep,
                Fragment::ToolInputAvailable {
                    tool_call_id: "call-1".into(),
                    tool_name: "getWeatherInformation".into(),
                    input: json!({ "city": "Paris" }),
                },
                Fragment::ToolOutputAvailable {
                    tool_call_id: "call-1".into(),
                    output: json!("sunny"),
                },
                Fragment::FinishStep,
                Fragment::Finish,
            ],
        );
        let msg = log.messages().last().unwrap();
        assert_eq!(msg.parts.len(), 1);
        match &msg.parts[0] {
            Part::Tool { state, output, tool_name, .. } => {
                assert_eq!(*state, ToolState::OutputAvailable);
                assert_eq!(output.as_ref().unwrap(), &json!("sunny"));
                assert_eq!(tool_name, "getWeatherInformation");
            }
            other => panic!("Expected tool part, got {other:?}"),
        }
    }

    #[test]
    fn tool_input_deltas_buffer_until_available() {
        let mut log = ConversationLog::new();
        log.fold(&Fragment::Start { message_id: Some("m1".into()) }).unwrap();
        log.fold(&Fragment::ToolInputStart {
            tool_call_id: "call-1".into(),
            tool_name: "askForConfirmation".into(),
        })
        .unwrap();
        log.fold(&Fragment::ToolInputDelta {
            tool_call_id: "call-1".into(),
            input_text_delta: "{\"message\":".into(),
        })
        .unwrap();
        // Deltas are not viewer-visible: part still has no input.
        match &log.messages()[0].parts[0] {
            Part::Tool { state, input, .. } => {
                assert_eq!(*state, ToolState::InputStreaming);
                assert!(input.is_none());
            }
            other => panic!("Expected tool part, got {other:?}"),
        }
        log.fold(&Fragment::ToolInputAvailable {
            tool_call_id: "call-1".into(),
            tool_name: "askForConfirmation".into(),
            input: json!({ "message": "Voulez-vous vraiment continuer ?" }),
        })
        .unwrap();
        match &log.messages()[0].parts[0] {
            Part::Tool { state, input, .. } => {
                assert_eq!(*state, ToolState::InputAvailable);
                assert!(input.is_some());
            }
            other => panic!("Expected tool part, got {other:?}"),
        }
    }

    #[test]
    fn tool_state_never_walks_backward() {
        let mut log = ConversationLog::new();
        log.fold(&Fragment::Start { message_id: Some("m1".into()) }).unwrap();
        log.fold(&Fragment::ToolInputAvailable {
            tool_call_id: "call-1".into(),
            tool_name: "getLocation".into(),
            input: json!({}),
        })
        .unwrap();
        log.fold(&Fragment::ToolOutputAvailable {
            tool_call_id: "call-1".into(),
            output: json!("Paris"),
        })
        .unwrap();

        // Output state is terminal: both further outputs and a late
        // input regression are rejected.
        let err = log
            .fold(&Fragment::ToolOutputError {
                tool_call_id: "call-1".into(),
                error_text: "late".into(),
            })
            .unwrap_err();
        assert!(matches!(err, FoldError::ToolStateRegression { .. }));
        let err = log
            .fold(&Fragment::ToolInputAvailable {
                tool_call_id: "call-1".into(),
                tool_name: "getLocation".into(),
                input: json!({}),
            })
            .unwrap_err();
        assert!(matches!(err, FoldError::ToolStateRegression { .. }));

        // Log kept its last-known-good state.
        match &log.messages()[0].parts[0] {
            Part::Tool { state, output, .. } => {
                assert_eq!(*state, ToolState::OutputAvailable);
                assert_eq!(output.as_ref().unwrap(), &json!("Paris"));
            }
            other => panic!("Expected tool part, got {other:?}"),
        }
    }

    #[test]
    fn unknown_ids_are_fold_errors() {
        let mut log = ConversationLog::new();
        log.fold(&Fragment::Start { message_id: Some("m1".into()) }).unwrap();
        let err = log
            .fold(&Fragment::TextDelta { id: "ghost".into(), delta: "x".into() })
            .unwrap_err();
        assert_eq!(err, FoldError::UnknownTextId { id: "ghost".into() });
        let err = log
            .fold(&Fragment::ToolOutputAvailable {
                tool_call_id: "ghost".into(),
                output: json!(null),
            })
            .unwrap_err();
        assert_eq!(err, FoldError::UnknownToolCall { tool_call_id: "ghost".into() });
        // The failed folds left nothing behind.
        assert!(log.messages()[0].parts.is_empty());
    }

    #[test]
    fn error_keeps_partial_text_and_marks_message() {
        let mut log = ConversationLog::new();
        fold_all(
            &mut log,
            &[
                Fragment::Start { message_id: Some("m1".into()) },
                Fragment::TextStart { id: "t1".into() },
                Fragment::TextDelta { id: "t1".into(), delta: "Bonj".into() },
                Fragment::Error { error_text: "boom".into() },
            ],
        );
        assert!(!log.is_open());
        let msg = log.messages().last().unwrap();
        assert_eq!(msg.error_text.as_deref(), Some("boom"));
        match &msg.parts[0] {
            Part::Text { text, state, .. } => {
                assert_eq!(text, "Bonj");
                assert_eq!(*state, Some(TextState::Streaming));
            }
            other => panic!("Expected text part, got {other:?}"),
        }
    }

    #[test]
    fn error_before_start_is_still_visible() {
        let mut log = ConversationLog::new();
        log.fold(&Fragment::Error { error_text: "no responder".into() }).unwrap();
        let msg = log.messages().last().unwrap();
        assert_eq!(msg.error_text.as_deref(), Some("no responder"));
        assert!(msg.parts.is_empty());
        assert!(!log.is_open());
    }

    #[test]
    fn replace_discards_open_state() {
        let mut log = ConversationLog::new();
        log.fold(&Fragment::Start { message_id: Some("m1".into()) }).unwrap();
        assert!(log.is_open());
        log.replace(vec![Message::user("u1", "salut")]);
        assert!(!log.is_open());
        assert_eq!(log.messages().len(), 1);
        assert_eq!(log.messages()[0].id, "u1");
    }
}
