//! The [`ActionNode`] builder and the values actions produce.

use std::collections::HashMap;
use std::fmt;

use derive_more::Deref;
use tokio::sync::mpsc::UnboundedSender;

use crate::generator::TokenFilter;
use crate::message::ConversationMessage;

/// Which slot an action runs against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// The always-resident chat session.
    Chat,
    /// The heavier thinking session, whose context only lives while actions need it.
    Thinking,
}

/// The final prompt of an action, built once its dependencies have results.
#[derive(Clone, Debug)]
pub struct PreparedAction {
    /// The system prompt used when the context is primed from scratch.
    pub system_prompt: String,

    /// Messages replayed when the session starts from an empty context.
    pub history: Vec<ConversationMessage>,

    /// The message to answer.
    pub message: ConversationMessage,

    /// Clear the session's context before generating, so `history` is replayed.
    pub fresh_context: bool,
}

impl PreparedAction {
    /// A prompt with no history that continues whatever the context holds.
    pub fn new(system_prompt: impl Into<String>, message: ConversationMessage) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            message,
            fresh_context: false,
        }
    }

    /// Replays `history` if the context is empty.
    pub fn with_history(mut self, history: Vec<ConversationMessage>) -> Self {
        self.history = history;
        self
    }

    /// Clears the session's context first, so the history is replayed.
    pub fn fresh(mut self) -> Self {
        self.fresh_context = true;
        self
    }
}

/// What an action produced.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionOutput {
    /// Generated text.
    Text(String),
    /// A function call extracted by the action's processor.
    FunctionCall {
        /// The function to call.
        name: String,
        /// Its raw, unparsed arguments.
        arguments: String,
    },
    /// The action failed; dependents still run, in degraded mode.
    Failed(String),
}

/// The recorded result of an action.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionResult {
    /// What the action produced.
    pub output: ActionOutput,

    /// Whether the action's processor ran and produced the output.
    pub processed: bool,

    /// Whether one of the action's dependencies failed or was itself degraded.
    pub degraded: bool,
}

impl ActionResult {
    pub(crate) fn failed(reason: impl Into<String>, degraded: bool) -> Self {
        Self {
            output: ActionOutput::Failed(reason.into()),
            processed: false,
            degraded,
        }
    }

    /// Whether the action failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.output, ActionOutput::Failed(_))
    }

    /// The generated text, if the action produced plain text.
    pub fn text(&self) -> Option<&str> {
        match &self.output {
            ActionOutput::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// The results of an action's dependencies, keyed by action id.
#[derive(Clone, Debug, Default, Deref)]
pub struct DependencyResults(HashMap<String, ActionResult>);

impl DependencyResults {
    pub(crate) fn new(results: HashMap<String, ActionResult>) -> Self {
        Self(results)
    }

    /// The text produced by dependency `id`.
    pub fn text(&self, id: &str) -> Option<&str> {
        self.0.get(id).and_then(ActionResult::text)
    }

    /// Whether any dependency failed or was degraded itself.
    pub fn degraded(&self) -> bool {
        self.0.values().any(|result| result.is_failed() || result.degraded)
    }
}

pub(crate) type PrepareFn = Box<dyn FnOnce(&DependencyResults) -> PreparedAction + Send>;
pub(crate) type ProcessFn = Box<dyn FnOnce(&str) -> Option<ActionOutput> + Send>;
pub(crate) type CompleteFn = Box<dyn FnOnce(&ActionResult) + Send>;

/// One schedulable inference task.
pub struct ActionNode {
    pub(crate) id: String,
    pub(crate) kind: SessionKind,
    pub(crate) dependencies: Vec<String>,
    pub(crate) prepare: PrepareFn,
    pub(crate) processor: Option<ProcessFn>,
    pub(crate) on_complete: Option<CompleteFn>,
    pub(crate) filter: Option<Box<dyn TokenFilter>>,
    pub(crate) stream: Option<UnboundedSender<String>>,
}

impl ActionNode {
    /// Creates an action. `prepare` runs right before generation, with the results of every
    /// dependency available.
    pub fn new<F>(id: impl Into<String>, kind: SessionKind, prepare: F) -> Self
    where
        F: FnOnce(&DependencyResults) -> PreparedAction + Send + 'static,
    {
        Self {
            id: id.into(),
            kind,
            dependencies: Vec::new(),
            prepare: Box::new(prepare),
            processor: None,
            on_complete: None,
            filter: None,
            stream: None,
        }
    }

    /// Runs this action only once `id` has a result.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Post-processes the generated text. Returning `None` keeps the raw text.
    pub fn with_processor<F>(mut self, processor: F) -> Self
    where
        F: FnOnce(&str) -> Option<ActionOutput> + Send + 'static,
    {
        self.processor = Some(Box::new(processor));
        self
    }

    /// Called with the result once it is known, including when the action is cancelled
    /// while running.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&ActionResult) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Groups streamed text with `filter` instead of forwarding every fragment.
    pub fn with_filter(mut self, filter: Box<dyn TokenFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Forwards every streamed unit to `sender` while the action runs.
    pub fn stream_to(mut self, sender: UnboundedSender<String>) -> Self {
        self.stream = Some(sender);
        self
    }

    /// The action's unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The slot the action runs against.
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Ids of the actions that must finish first.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

impl fmt::Debug for ActionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
