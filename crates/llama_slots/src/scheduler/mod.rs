//! Implements the [`ActionScheduler`], which runs graphs of inference actions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::snapshot;
use crate::generator::{PassthroughFilter, ResponseGenerator, TurnOutcome};
use crate::registry::SessionRegistry;
use crate::SharedConfig;

mod action;

pub use action::{
    ActionNode, ActionOutput, ActionResult, DependencyResults, PreparedAction, SessionKind,
};

/// An error raised while submitting or running actions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Two actions share an id, or an id already has a recorded result.
    #[error("action \"{0}\" was submitted twice")]
    DuplicateAction(String),

    /// An action depends on an id that is neither in the batch nor recorded.
    #[error("action \"{action}\" depends on unknown action \"{dependency}\"")]
    UnknownDependency {
        /// The dependent action.
        action: String,

        /// The missing dependency.
        dependency: String,
    },

    /// The dependencies of these actions form a cycle.
    #[error("dependency cycle between {0:?}")]
    DependencyCycle(Vec<String>),

    /// The batch did not finish in time; everything outstanding was cancelled.
    #[error("batch did not complete within {0:?}")]
    BatchTimedOut(Duration),
}

/// Completion callbacks owed to their actions, run once the scheduler lock is released.
type Completions = Vec<(action::CompleteFn, ActionResult)>;

struct Pending {
    batch: u64,
    node: ActionNode,
}

struct Running {
    batch: u64,
    abort: AbortHandle,
    on_complete: Option<action::CompleteFn>,
}

#[derive(Default)]
struct SchedulerState {
    next_batch: u64,
    pending: HashMap<String, Pending>,
    running: HashMap<String, Running>,
    results: HashMap<String, ActionResult>,
}

impl SchedulerState {
    fn is_known(&self, id: &str) -> bool {
        self.results.contains_key(id)
            || self.pending.contains_key(id)
            || self.running.contains_key(id)
    }

    fn outstanding(&self, batch: u64) -> bool {
        self.pending.values().any(|pending| pending.batch == batch)
            || self.running.values().any(|running| running.batch == batch)
    }
}

/// Executes [`ActionNode`]s once their dependencies have results.
///
/// Cloning a scheduler creates a new reference to the same state, so
/// [`ActionScheduler::cancel_all`] can be called while a batch runs elsewhere. Batches
/// submitted concurrently run independently: each waits only for its own actions, and a
/// batch that times out cancels only its own actions.
#[derive(Clone)]
pub struct ActionScheduler {
    registry: SessionRegistry,
    generator: ResponseGenerator,
    config: SharedConfig,
    state: Arc<Mutex<SchedulerState>>,
}

impl ActionScheduler {
    /// Creates a scheduler running actions on `registry`'s sessions.
    pub fn new(
        registry: SessionRegistry,
        generator: ResponseGenerator,
        config: SharedConfig,
    ) -> Self {
        Self {
            registry,
            generator,
            config,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a single action and returns its result.
    pub async fn execute(&self, node: ActionNode) -> Result<ActionResult, SchedulerError> {
        let id = node.id.clone();
        let mut results = self.run_batch(vec![node]).await?;

        Ok(results
            .remove(&id)
            .unwrap_or_else(|| ActionResult::failed("cancelled", false)))
    }

    /// Runs every action in `nodes`, each as soon as its dependencies have results, and
    /// returns the results of the batch.
    ///
    /// Dependencies may also name actions recorded by earlier batches or still running in
    /// another one. A failed action still unblocks its dependents, which run with
    /// [`ActionResult::degraded`] set.
    ///
    /// The batch is rejected before anything runs if ids collide, a dependency is unknown,
    /// or the dependencies form a cycle. If the batch exceeds the configured ceiling, its
    /// outstanding actions are cancelled.
    pub async fn run_batch(
        &self,
        nodes: Vec<ActionNode>,
    ) -> Result<HashMap<String, ActionResult>, SchedulerError> {
        let ids: Vec<String> = nodes.iter().map(|node| node.id.clone()).collect();

        let batch = {
            let mut state = self.lock();
            validate(&nodes, |id| state.is_known(id))?;

            let batch = state.next_batch;
            state.next_batch += 1;

            for node in nodes {
                state.pending.insert(node.id.clone(), Pending { batch, node });
            }
            batch
        };

        let config = snapshot(&self.config);
        info!(batch, actions = ids.len(), "Running action batch");

        let settled = tokio::time::timeout(
            config.batch_timeout(),
            self.settle(batch, config.scheduler_tick()),
        )
        .await;

        if settled.is_err() {
            error!(batch, "Action batch timed out, cancelling its outstanding work");
            self.cancel_matching(|b| b == batch);
            return Err(SchedulerError::BatchTimedOut(config.batch_timeout()));
        }

        let state = self.lock();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.results.get(&id).cloned().map(|result| (id, result)))
            .collect())
    }

    /// Launches the ready actions of `batch` and records finished ones until none of them
    /// is left.
    async fn settle(&self, batch: u64, tick: Duration) {
        let (done_tx, done_rx) = flume::unbounded::<(String, ActionResult)>();
        let mut ticker = tokio::time::interval(tick);

        loop {
            let recorded: Completions = {
                let mut state = self.lock();
                done_rx
                    .try_iter()
                    .filter_map(|(id, result)| record(&mut state, id, result))
                    .collect()
            };
            run_callbacks(recorded);

            let (stranded, outstanding) = {
                let mut state = self.lock();
                let stranded = self.launch_ready(&mut state, batch, &done_tx);
                (stranded, state.outstanding(batch))
            };
            let progressed = !stranded.is_empty();
            run_callbacks(stranded);

            if !outstanding {
                break;
            }
            if progressed {
                continue;
            }

            tokio::select! {
                Ok((id, result)) = done_rx.recv_async() => {
                    let completion = record(&mut self.lock(), id, result);
                    run_callbacks(completion);
                }
                _ = ticker.tick() => trace!(batch, "Scheduler tick"),
            }
        }
    }

    /// Starts every action of `batch` whose dependencies all have results.
    ///
    /// An action whose dependency vanished (cancelled before it ran, or its result cleared)
    /// can never start; it is recorded as failed instead, and its callback is returned.
    fn launch_ready(
        &self,
        state: &mut SchedulerState,
        batch: u64,
        done_tx: &flume::Sender<(String, ActionResult)>,
    ) -> Completions {
        let mut ready = Vec::new();
        let mut stranded = Vec::new();

        for (id, pending) in state.pending.iter().filter(|(_, p)| p.batch == batch) {
            let mut waiting = false;
            let mut lost = None;

            for dependency in &pending.node.dependencies {
                if state.results.contains_key(dependency) {
                    continue;
                }
                if state.pending.contains_key(dependency) || state.running.contains_key(dependency)
                {
                    waiting = true;
                } else {
                    lost = Some(dependency.clone());
                    break;
                }
            }

            match lost {
                Some(dependency) => stranded.push((id.clone(), dependency)),
                None if !waiting => ready.push(id.clone()),
                None => {}
            }
        }

        let mut completions = Vec::new();
        for (id, dependency) in stranded {
            let Some(Pending { node, .. }) = state.pending.remove(&id) else {
                continue;
            };

            warn!(action = id, dependency, "Dependency is gone, action cannot run");
            let reason = format!("dependency \"{dependency}\" was cancelled");
            let result = ActionResult::failed(reason, true);
            state.results.insert(id, result.clone());
            if let Some(callback) = node.on_complete {
                completions.push((callback, result));
            }
        }

        for id in ready {
            let Some(Pending { mut node, .. }) = state.pending.remove(&id) else {
                continue;
            };

            let dependencies = DependencyResults::new(
                node.dependencies
                    .iter()
                    .filter_map(|dep| state.results.get(dep).map(|r| (dep.clone(), r.clone())))
                    .collect(),
            );

            debug!(action = id, kind = ?node.kind, batch, "Launching action");

            let on_complete = node.on_complete.take();
            let scheduler = self.clone();
            let done_tx = done_tx.clone();
            let task_id = id.clone();

            let handle = tokio::spawn(async move {
                let result = scheduler.run_action(node, dependencies).await;
                let _ = done_tx.send((task_id, result));
            });

            state.running.insert(
                id,
                Running {
                    batch,
                    abort: handle.abort_handle(),
                    on_complete,
                },
            );
        }

        completions
    }

    async fn run_action(&self, node: ActionNode, dependencies: DependencyResults) -> ActionResult {
        let ActionNode {
            id,
            kind,
            prepare,
            processor,
            filter,
            stream,
            ..
        } = node;

        let config = snapshot(&self.config);
        let degraded = dependencies.degraded();
        if degraded {
            warn!(action = id, "Running with failed dependencies");
        }

        let session_id = match kind {
            SessionKind::Chat => config.chat_session_id.clone(),
            SessionKind::Thinking => config.thinking_session_id.clone(),
        };

        let lease = match kind {
            SessionKind::Thinking => {
                match self.registry.acquire_session_context(&session_id).await {
                    Ok(lease) => Some(lease),
                    Err(err) => {
                        error!(action = id, "Could not acquire thinking session: {err}");
                        return ActionResult::failed(err.to_string(), degraded);
                    }
                }
            }
            SessionKind::Chat => None,
        };

        let Some(session) = self.registry.get(&session_id).await else {
            return ActionResult::failed(format!("no session named \"{session_id}\""), degraded);
        };

        let prepared = prepare(&dependencies);

        if prepared.fresh_context {
            if let Err(err) = session.clear_context(true).await {
                return ActionResult::failed(err.to_string(), degraded);
            }
        }

        let filter = filter.unwrap_or_else(|| Box::new(PassthroughFilter));
        let generation = async {
            let mut response = self.generator.generate(
                &session,
                &prepared.history,
                &prepared.system_prompt,
                prepared.message,
                filter,
            );

            let mut text = String::new();
            while let Some(unit) = response.next_unit().await {
                if let Some(stream) = &stream {
                    let _ = stream.send(unit.clone());
                }
                text.push_str(&unit);
            }

            (text, response.outcome().await)
        };

        let outcome = tokio::time::timeout(config.action_timeout(), generation).await;

        if let Some(lease) = lease {
            if let Err(err) = lease.release().await {
                warn!(action = id, "Failed to release thinking session: {err}");
            }
        }

        let result = match outcome {
            Err(_) => {
                error!(action = id, "Action timed out");
                ActionResult::failed("timed out", degraded)
            }
            Ok((_, TurnOutcome::Cancelled)) => ActionResult::failed("cancelled", degraded),
            Ok((_, TurnOutcome::Failed(reason))) => ActionResult::failed(reason, degraded),
            Ok((text, TurnOutcome::Completed)) => {
                match processor.and_then(|process| process(&text)) {
                    Some(output) => ActionResult {
                        output,
                        processed: true,
                        degraded,
                    },
                    None => ActionResult {
                        output: ActionOutput::Text(text),
                        processed: false,
                        degraded,
                    },
                }
            }
        };

        debug!(action = id, failed = result.is_failed(), "Action finished");
        result
    }

    /// Cancels every running action and drops every pending one, across all batches.
    ///
    /// Running actions are recorded as failed with reason `"cancelled"`, and their
    /// completion callbacks are called with that result. Pending actions never started, so
    /// they get neither a result nor a callback.
    pub fn cancel_all(&self) {
        self.cancel_matching(|_| true);
    }

    fn cancel_matching(&self, matches: impl Fn(u64) -> bool) {
        let (dropped, completions) = {
            let mut state = self.lock();

            let dropped: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, pending)| matches(pending.batch))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &dropped {
                state.pending.remove(id);
            }

            let aborted: Vec<String> = state
                .running
                .iter()
                .filter(|(_, running)| matches(running.batch))
                .map(|(id, _)| id.clone())
                .collect();

            let mut completions = Vec::new();
            for id in aborted {
                let Some(running) = state.running.remove(&id) else {
                    continue;
                };

                running.abort.abort();
                let result = ActionResult::failed("cancelled", false);
                state.results.insert(id, result.clone());
                if let Some(callback) = running.on_complete {
                    completions.push((callback, result));
                }
            }

            (dropped.len(), completions)
        };

        info!(dropped, aborted = completions.len(), "Cancelled actions");
        run_callbacks(completions);
    }

    /// The recorded result of action `id`.
    pub fn get_result(&self, id: &str) -> Option<ActionResult> {
        self.lock().results.get(id).cloned()
    }

    /// Whether nothing is pending or running.
    pub fn all_nodes_complete(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.running.is_empty()
    }

    /// Forgets every recorded result.
    pub fn clear_results(&self) {
        self.lock().results.clear();
    }
}

fn run_callbacks(completions: impl IntoIterator<Item = (action::CompleteFn, ActionResult)>) {
    for (callback, result) in completions {
        callback(&result);
    }
}

/// Records the result of a running action and hands back its callback. Results of actions
/// that were cancelled in the meantime are discarded.
fn record(
    state: &mut SchedulerState,
    id: String,
    result: ActionResult,
) -> Option<(action::CompleteFn, ActionResult)> {
    let Some(running) = state.running.remove(&id) else {
        debug!(action = id, "Discarding result of cancelled action");
        return None;
    };

    state.results.insert(id, result.clone());
    running.on_complete.map(|callback| (callback, result))
}

/// Checks a batch before it is admitted. `is_known` reports ids that are already recorded,
/// pending, or running.
fn validate(nodes: &[ActionNode], is_known: impl Fn(&str) -> bool) -> Result<(), SchedulerError> {
    let mut ids = HashSet::new();
    for node in nodes {
        if is_known(&node.id) || !ids.insert(node.id.as_str()) {
            return Err(SchedulerError::DuplicateAction(node.id.clone()));
        }
    }

    for node in nodes {
        for dependency in &node.dependencies {
            if !ids.contains(dependency.as_str()) && !is_known(dependency) {
                return Err(SchedulerError::UnknownDependency {
                    action: node.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    // Kahn's algorithm over the edges inside the batch.
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in nodes {
        for dependency in &node.dependencies {
            if ids.contains(dependency.as_str()) {
                *in_degree.entry(node.id.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(node.id.as_str());
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut visited = 0;

    while let Some(id) = queue.pop_front() {
        visited += 1;

        for &dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if visited < nodes.len() {
        let mut cycle: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        cycle.sort();
        return Err(SchedulerError::DependencyCycle(cycle));
    }

    Ok(())
}
