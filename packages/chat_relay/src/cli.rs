//! Interactive terminal viewer.
//!
//! Joins a conversation over the reconnecting transport, folds the
//! fragment stream into a local log, and prints deltas as they
//! arrive. Sibling submissions and resync nudges show up inline.

use anyhow::Result;
use futures::StreamExt;
use std::io::Write;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::FileConfig;
use crate::fold::ConversationLog;
use crate::protocol::{Fragment, Message, Trigger};
use crate::transport::{ChatTransport, FragmentStream, TransportConfig, TransportEvent};

pub async fn chat_command(
    conversation: String,
    server_url: String,
    file_config: FileConfig,
) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chat_relay=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let (transport, mut events) = ChatTransport::new(TransportConfig {
        server_url,
        conversation_id: conversation.clone(),
        reconnect_delay: file_config.client.reconnect_delay(),
    });
    if let Err(e) = transport.connect().await {
        eprintln!("[not connected yet: {e}; submissions will be queued]");
    }

    println!("Joined conversation {conversation:?}. Type a message, /abort, or /quit.");

    let mut log = ConversationLog::new();
    let mut current: Option<FragmentStream> = None;
    let mut abort = CancellationToken::new();
    let mut submitted = 0u64;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim().to_string();
                match line.as_str() {
                    "" => {}
                    "/quit" => break,
                    "/abort" => abort.cancel(),
                    _ => {
                        if current.is_some() {
                            println!("[a submission is already streaming; /abort it first]");
                            continue;
                        }
                        submitted += 1;
                        let mut messages = log.snapshot();
                        messages.push(Message::user(format!("user-{submitted}"), line));
                        log.replace(messages.clone());

                        abort = CancellationToken::new();
                        match transport
                            .send_messages(messages, Trigger::SubmitMessage, abort.clone())
                            .await
                        {
                            Ok(stream) => current = Some(stream),
                            Err(e) => println!("[submit failed: {e}]"),
                        }
                    }
                }
            }

            fragment = async { current.as_mut().unwrap().next().await }, if current.is_some() => {
                match fragment {
                    Some(Ok(fragment)) => {
                        render(&fragment);
                        if let Err(e) = log.fold(&fragment) {
                            warn!("Fold rejected fragment: {e}");
                        }
                        if fragment.is_terminal() {
                            current = None;
                        }
                    }
                    Some(Err(e)) => {
                        println!("\n[stream ended: {e}]");
                        current = None;
                    }
                    None => current = None,
                }
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    TransportEvent::InitMessages(messages) => {
                        for message in &messages {
                            print_history_line(message);
                        }
                        log.replace(messages);
                    }
                    TransportEvent::SiblingSubmitted { message, .. } => {
                        print_history_line(&message);
                        let mut messages = log.snapshot();
                        messages.push(message);
                        log.replace(messages);
                    }
                    TransportEvent::Resync => {
                        match transport.fetch_log().await {
                            Ok(messages) => {
                                log.replace(messages);
                                println!("[resynced: {} messages]", log.messages().len());
                            }
                            Err(e) => println!("[resync failed: {e}]"),
                        }
                    }
                }
            }
        }
    }

    transport.close().await;
    Ok(())
}

fn render(fragment: &Fragment) {
    match fragment {
        Fragment::TextDelta { delta, .. } => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        Fragment::TextEnd { .. } => println!(),
        Fragment::ToolInputAvailable { tool_name, input, .. } => {
            println!("[tool {tool_name}: {input}]");
        }
        Fragment::ToolOutputAvailable { output, .. } => {
            println!("[tool result: {output}]");
        }
        Fragment::Error { error_text } => println!("[error: {error_text}]"),
        _ => {}
    }
}

fn print_history_line(message: &Message) {
    use crate::protocol::{Part, Role};
    let who = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    for part in &message.parts {
        if let Part::Text { text, .. } = part {
            println!("[{who}] {text}");
        }
    }
}
