//! Broadcast Relay
//!
//! Drives one submission end to end: replace the log with the
//! client's snapshot, echo the new message to sibling viewers, then
//! tee the collaborator's fragment stream — each fragment is folded
//! into the log and broadcast to every attached connection, in order.
//! The stream always ends with a terminal fragment on the wire, even
//! when the collaborator fails, hangs up early, or gets aborted.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::protocol::{EchoFrame, Fragment, ResyncFrame, ServerFrame, SubmitFrame};
use crate::registry::Conversation;
use crate::responder::Responder;

/// Handle one submit frame from `triggered_by`. Holds the
/// conversation's submit lock for the whole generation, so concurrent
/// submissions from other viewers queue up behind it.
pub async fn submit(
    conversation: Arc<Conversation>,
    responder: Arc<dyn Responder>,
    frame: SubmitFrame,
    triggered_by: &str,
) {
    let _guard = conversation.submit_lock.lock().await;
    let abort = conversation.begin_submission().await;

    debug!(
        conversation = %conversation.id,
        messages = frame.messages.len(),
        "Submission started"
    );

    {
        let mut log = conversation.log.write().await;
        log.replace(frame.messages.clone());
    }

    // Siblings see the submitted message verbatim; the submitter
    // already holds it locally.
    if let Some(message) = frame.messages.last() {
        let echo = ServerFrame::Echo(EchoFrame {
            message: message.clone(),
            trigger: frame.trigger,
            id: frame.id.clone(),
        });
        conversation.broadcast_except(&echo, triggered_by).await;
    }

    let mut stream = responder.respond(&frame.messages);
    let mut aborted = false;

    loop {
        let item = tokio::select! {
            biased;
            _ = abort.cancelled() => {
                aborted = true;
                break;
            }
            item = stream.next() => item,
        };
        match item {
            Some(Ok(fragment)) => {
                let terminal = fragment.is_terminal();
                tee(&conversation, fragment).await;
                if terminal {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(conversation = %conversation.id, "Generation failed: {e}");
                tee(&conversation, Fragment::Error { error_text: e.to_string() }).await;
                break;
            }
            None => {
                // Stream ended without finish/error. Close the
                // message ourselves so no viewer is left with an open
                // placeholder.
                let open = conversation.log.read().await.is_open();
                if open {
                    warn!(conversation = %conversation.id, "Generation ended without a terminal fragment");
                    tee(
                        &conversation,
                        Fragment::Error {
                            error_text: "generation ended unexpectedly".to_string(),
                        },
                    )
                    .await;
                }
                break;
            }
        }
    }

    if aborted {
        debug!(conversation = %conversation.id, "Submission aborted");
        tee(&conversation, Fragment::Error { error_text: "aborted".to_string() }).await;
    }

    // Lossy connections may have missed fragments to backpressure;
    // the resync nudge tells non-trigger viewers to re-fetch the log.
    conversation
        .broadcast_except(&ServerFrame::Resync(ResyncFrame::new()), triggered_by)
        .await;

    conversation.end_submission().await;
    debug!(conversation = %conversation.id, "Submission finished");
}

/// Fold one fragment into the log, then fan it out to every attached
/// connection. Fold failures are logged and the fragment still goes
/// out: viewers apply their own folding and may tolerate what we
/// could not.
async fn tee(conversation: &Conversation, fragment: Fragment) {
    {
        let mut log = conversation.log.write().await;
        if let Err(e) = log.fold(&fragment) {
            warn!(conversation = %conversation.id, "Fold rejected fragment: {e}");
        }
    }
    conversation.broadcast(&ServerFrame::Fragment(fragment)).await;
}
