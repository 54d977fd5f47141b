use eyre::{Result, bail};
use futures::StreamExt;
use tracing::{debug, warn};

use super::conversation_state::{ConversationState, Message, Role};
use super::render::Renderer;
use crate::completion::{ChunkStream, CompletionBackend, Credential};
use crate::error::TurnError;

/// Where the current turn is. `Idle` is both the start state and the state
/// between turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingResponse,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The reply was streamed and stored. `encoding_fallback` is set when some
    /// of it had to be shown lossily.
    Completed {
        content: String,
        encoding_fallback: bool,
    },
    /// The turn failed; only the user message was stored.
    Failed(TurnError),
    /// The turn was abandoned by the user while waiting or streaming.
    Cancelled,
    /// No credential is set, so nothing was sent or stored.
    CredentialMissing,
}

/// One chat session: the conversation, the key it is sent with and the
/// backend it is sent to.
pub struct Session<B> {
    backend: B,
    conversation: ConversationState,
    credential: Option<Credential>,
    history_window: usize,
    state: TurnState,
}

impl<B: CompletionBackend> Session<B> {
    pub fn new(backend: B, credential: Option<Credential>, history_window: usize) -> Self {
        Self {
            backend,
            conversation: ConversationState::new(),
            credential,
            history_window,
            state: TurnState::Idle,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub fn set_credential(&mut self, credential: Option<Credential>) {
        self.credential = credential;
    }

    /// Starts the conversation over. The credential is kept.
    pub fn reset(&mut self) {
        self.conversation.clear();
        self.state = TurnState::Idle;
    }

    /// Returns to `Idle` after the future driving `submit` was dropped
    /// mid-turn. The conversation keeps the user message only.
    pub fn abandon_turn(&mut self) {
        if self.state != TurnState::Idle {
            self.transition(TurnState::Failed);
            self.transition(TurnState::Idle);
        }
    }

    fn transition(&mut self, next: TurnState) {
        debug!("Turn state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs one turn: stores `input`, sends the history, streams the reply to
    /// `renderer` and stores the finished reply.
    ///
    /// Provider failures are reported through the outcome. The `Err` case is
    /// reserved for the terminal itself failing.
    pub async fn submit(&mut self, input: &str, renderer: &mut Renderer<'_>) -> Result<TurnOutcome> {
        let Some(credential) = self.credential.clone() else {
            debug!("Turn rejected before sending: no credential");
            return Ok(TurnOutcome::CredentialMissing);
        };

        if self.state != TurnState::Idle {
            bail!("A turn is already in progress");
        }

        self.conversation.append(Message::user(input));
        self.transition(TurnState::AwaitingResponse);

        let sent = {
            let history = self.conversation.replay_window(self.history_window);
            self.backend.send(history, &credential).await
        };
        let outcome = match sent {
            Ok(stream) => self.stream_reply(stream, renderer).await,
            Err(e) => Ok(TurnOutcome::Failed(e)),
        };

        match &outcome {
            Ok(TurnOutcome::Completed { content, .. }) => {
                self.conversation.append(Message::assistant(content.as_str()));
                debug!("Conversation now holds {} messages", self.conversation.len());
                self.transition(TurnState::Completed);
            }
            Ok(TurnOutcome::Failed(e)) => {
                warn!("Turn failed: {}", e);
                self.transition(TurnState::Failed);
            }
            _ => self.transition(TurnState::Failed),
        }
        self.transition(TurnState::Idle);

        outcome
    }

    async fn stream_reply(&mut self, mut stream: ChunkStream, renderer: &mut Renderer<'_>) -> Result<TurnOutcome> {
        let mut content = String::new();
        let mut streaming = false;

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    if !streaming {
                        streaming = true;
                        self.transition(TurnState::Streaming);
                        renderer.role_header(Role::Assistant)?;
                    }
                    renderer.write_chunk(&chunk)?;
                    content.push_str(&chunk);
                }
                Err(e) => {
                    if streaming {
                        renderer.end_message()?;
                    }
                    return Ok(TurnOutcome::Failed(e));
                }
            }
        }

        if content.is_empty() {
            return Ok(TurnOutcome::Failed(TurnError::Provider(
                "the model returned an empty response".to_string(),
            )));
        }

        renderer.end_message()?;
        debug!("Reply complete ({} bytes)", content.len());

        Ok(TurnOutcome::Completed {
            content,
            encoding_fallback: renderer.take_encoding_fallback(),
        })
    }
}
