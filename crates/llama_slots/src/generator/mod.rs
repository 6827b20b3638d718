//! Implements the [`ResponseGenerator`], which turns a conversation and a session into a
//! cancellable stream of text.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::snapshot;
use crate::message::ConversationMessage;
use crate::session::{InferenceSession, SessionHandle, StopReason};
use crate::SharedConfig;

mod filter;

pub use filter::{FullResponseFilter, PassthroughFilter, SentenceFilter, TokenFilter};

/// Turns role-tagged messages into the exact text fed to the tokenizer.
pub trait PromptFormatter: Send + Sync {
    /// Formats `messages`, prefixed by `system_prompt` if one is given.
    fn format(&self, messages: &[ConversationMessage], system_prompt: Option<&str>) -> String;
}

/// How a generated turn ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Generation stopped on its own (end of generation or the token limit).
    Completed,
    /// The consumer or the session cancelled generation.
    Cancelled,
    /// The prompt could not be ingested or decoding failed. Whatever streamed before the
    /// failure was still delivered.
    Failed(String),
}

/// Drives sessions to answer conversations.
#[derive(Clone)]
pub struct ResponseGenerator {
    formatter: Arc<dyn PromptFormatter>,
    config: SharedConfig,
}

/// Everything a blocking worker needs to run one turn.
struct Turn {
    history: Vec<ConversationMessage>,
    system_prompt: String,
    new_message: ConversationMessage,
    formatter: Arc<dyn PromptFormatter>,
    max_tokens: usize,
}

impl ResponseGenerator {
    /// Creates a generator formatting prompts with `formatter`.
    pub fn new(formatter: Arc<dyn PromptFormatter>, config: SharedConfig) -> Self {
        Self { formatter, config }
    }

    /// The formatter prompts are built with.
    pub fn formatter(&self) -> &Arc<dyn PromptFormatter> {
        &self.formatter
    }

    /// Starts answering `new_message` with `session`, streaming the units `filter` emits.
    ///
    /// On a fresh context (decode position 0) the last `history_length` messages of
    /// `history` are replayed behind `system_prompt`; otherwise only `new_message` is
    /// appended to what the context already holds. Once the turn ends, the session is
    /// rolled over if the next turn might not fit.
    ///
    /// Must be called from within a tokio runtime.
    pub fn generate(
        &self,
        session: &SessionHandle,
        history: &[ConversationMessage],
        system_prompt: &str,
        new_message: ConversationMessage,
        filter: Box<dyn TokenFilter>,
    ) -> ResponseStream {
        let config = snapshot(&self.config);
        let skip = history.len().saturating_sub(config.history_length);

        let turn = Turn {
            history: history[skip..].to_vec(),
            system_prompt: system_prompt.to_string(),
            new_message,
            formatter: self.formatter.clone(),
            max_tokens: config.max_tokens as usize,
        };

        let (tx, rx) = unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let token = CancellationToken::new();

        let session = session.clone();
        let task_token = token.clone();

        tokio::spawn(async move {
            let guard = tokio::select! {
                _ = task_token.cancelled() => {
                    debug!(session = session.id(), "Cancelled before the session was free");
                    let _ = outcome_tx.send(TurnOutcome::Cancelled);
                    return;
                }
                guard = session.lock_owned() => guard,
            };

            let worker = tokio::task::spawn_blocking(move || {
                let mut guard = guard;
                run_turn(&mut guard, turn, filter, &tx, &task_token)
            });

            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(err) => TurnOutcome::Failed(format!("generation worker failed: {err}")),
            };

            let _ = outcome_tx.send(outcome);
        });

        ResponseStream {
            rx,
            token,
            outcome_rx: Some(outcome_rx),
            outcome: None,
        }
    }
}

fn run_turn(
    session: &mut InferenceSession,
    turn: Turn,
    mut filter: Box<dyn TokenFilter>,
    tx: &UnboundedSender<String>,
    token: &CancellationToken,
) -> TurnOutcome {
    let Turn {
        mut history,
        system_prompt,
        new_message,
        formatter,
        max_tokens,
    } = turn;

    let ingested = if session.decode_position() == 0 {
        history.push(new_message);
        let prompt = formatter.format(&history, Some(&system_prompt));
        debug!(session = session.id(), messages = history.len(), "Priming fresh context");
        session.completion_init(&prompt)
    } else {
        let prompt = formatter.format(&[new_message], None);
        session.append_user_message(&prompt)
    };

    let outcome = match ingested {
        Ok(()) => generate_tokens(session, max_tokens, filter.as_mut(), tx, token),
        Err(err) => {
            warn!(session = session.id(), "Could not ingest prompt: {err}");
            TurnOutcome::Failed(err.to_string())
        }
    };

    for unit in filter.flush() {
        let _ = tx.send(unit);
    }

    if session.check_reset_pending() {
        info!(session = session.id(), "Context nearly full, rolling over");
        session.clear_context(true);
    }

    outcome
}

fn generate_tokens(
    session: &mut InferenceSession,
    max_tokens: usize,
    filter: &mut dyn TokenFilter,
    tx: &UnboundedSender<String>,
    token: &CancellationToken,
) -> TurnOutcome {
    let mut current = 0;

    loop {
        if token.is_cancelled() || tx.is_closed() {
            debug!(session = session.id(), "Generation cancelled by consumer");
            return TurnOutcome::Cancelled;
        }

        let Some(fragment) = session.completion_loop(max_tokens, &mut current) else {
            break;
        };

        if fragment.is_empty() {
            continue;
        }

        for unit in filter.process(&fragment) {
            if tx.send(unit).is_err() {
                return TurnOutcome::Cancelled;
            }
        }
    }

    debug!(session = session.id(), tokens = current, "Generation finished");

    match session.stop_reason() {
        Some(StopReason::Cancelled) => TurnOutcome::Cancelled,
        Some(StopReason::DecodeFailed) => TurnOutcome::Failed("decoding failed".into()),
        Some(StopReason::NoContext) => TurnOutcome::Failed("session has no context".into()),
        _ => TurnOutcome::Completed,
    }
}

/// The units of one generated turn.
///
/// Dropping the stream cancels generation; the session stops within one token.
pub struct ResponseStream {
    rx: UnboundedReceiver<String>,
    token: CancellationToken,
    outcome_rx: Option<oneshot::Receiver<TurnOutcome>>,
    outcome: Option<TurnOutcome>,
}

impl ResponseStream {
    /// Resolves to the next unit, or `None` once the turn is over.
    pub async fn next_unit(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Asks generation to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the rest of the turn and concatenates every remaining unit.
    pub async fn collect_text(&mut self) -> String {
        let mut text = String::new();
        while let Some(unit) = self.rx.recv().await {
            text.push_str(&unit);
        }
        text
    }

    /// Waits for the turn to end and reports how it ended.
    pub async fn outcome(&mut self) -> TurnOutcome {
        if let Some(rx) = self.outcome_rx.take() {
            let outcome = rx.await.unwrap_or_else(|_| {
                TurnOutcome::Failed("generation task ended unexpectedly".into())
            });
            self.outcome = Some(outcome);
        }

        self.outcome
            .clone()
            .unwrap_or_else(|| TurnOutcome::Failed("outcome unavailable".into()))
    }
}

impl Stream for ResponseStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
