use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::unbounded_channel;

use llama_slots::{
    ActionNode, ActionOutput, Config, ConversationMessage, PreparedAction, SchedulerError,
    SentenceFilter, SessionKind,
};

use crate::{test_config, Harness, ScriptedBackend};

fn ask(text: &str) -> PreparedAction {
    PreparedAction::new("You are terse.", ConversationMessage::user(text))
}

async fn with_chat(backend: ScriptedBackend, config: Config) -> Harness {
    let harness = Harness::with_config(backend, config);
    let path = harness.model("chat.gguf");
    harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();
    harness
}

#[tokio::test]
async fn dependents_run_after_their_dependencies() {
    let harness = with_chat(ScriptedBackend::with_replies(["alpha", "beta"]), test_config()).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::new(Mutex::new(None));

    let a = {
        let order = order.clone();
        ActionNode::new("a", SessionKind::Chat, |_| ask("first"))
            .on_complete(move |_| order.lock().unwrap().push("a"))
    };

    let b = {
        let order = order.clone();
        let observed = observed.clone();
        ActionNode::new("b", SessionKind::Chat, move |deps| {
            *observed.lock().unwrap() = deps.text("a").map(str::to_string);
            ask("second")
        })
        .depends_on("a")
        .on_complete(move |_| order.lock().unwrap().push("b"))
    };

    // Submission order does not matter.
    let results = harness.runtime.scheduler().run_batch(vec![b, a]).await.unwrap();

    assert_eq!(results["a"].output, ActionOutput::Text("alpha".into()));
    assert_eq!(results["b"].output, ActionOutput::Text("beta".into()));
    assert!(!results["b"].degraded);
    assert_eq!(*order.lock().unwrap(), ["a", "b"]);
    assert_eq!(observed.lock().unwrap().as_deref(), Some("alpha"));
    assert!(harness.runtime.scheduler().all_nodes_complete());
}

#[tokio::test]
async fn failed_dependencies_degrade_instead_of_blocking() {
    // No thinking session exists, so "plan" fails.
    let harness = with_chat(ScriptedBackend::with_replies(["fallback"]), test_config()).await;
    let saw_failure = Arc::new(Mutex::new(false));

    let plan = ActionNode::new("plan", SessionKind::Thinking, |_| ask("plan"));
    let reply = {
        let saw_failure = saw_failure.clone();
        ActionNode::new("reply", SessionKind::Chat, move |deps| {
            *saw_failure.lock().unwrap() = deps["plan"].is_failed() && deps.degraded();
            ask("answer anyway")
        })
        .depends_on("plan")
    };

    let results = harness
        .runtime
        .scheduler()
        .run_batch(vec![plan, reply])
        .await
        .unwrap();

    assert!(results["plan"].is_failed());
    assert_eq!(results["reply"].text(), Some("fallback"));
    assert!(results["reply"].degraded);
    assert!(*saw_failure.lock().unwrap());
}

#[tokio::test]
async fn thinking_actions_hold_the_context_only_while_running() {
    let harness = with_chat(ScriptedBackend::with_replies(["deep thought"]), test_config()).await;
    let registry = harness.runtime.registry();
    let path = harness.model("think.gguf");
    let thinking = registry.get_or_create("thinking", Some(path.as_path())).await;

    let result = harness
        .runtime
        .scheduler()
        .execute(ActionNode::new("think", SessionKind::Thinking, |_| {
            ask("ponder").fresh()
        }))
        .await
        .unwrap();

    assert_eq!(result.text(), Some("deep thought"));
    assert_eq!(registry.context_users("thinking").await, 0);
    assert!(!thinking.lock().await.has_context());
    assert!(thinking.lock().await.has_weights());
}

#[tokio::test]
async fn processors_turn_text_into_function_calls() {
    let harness = with_chat(
        ScriptedBackend::with_replies(["call:search(rust)", "just text"]),
        test_config(),
    )
    .await;

    fn parse(text: &str) -> Option<ActionOutput> {
        let call = text.strip_prefix("call:")?;
        let (name, rest) = call.split_once('(')?;
        Some(ActionOutput::FunctionCall {
            name: name.to_string(),
            arguments: rest.trim_end_matches(')').to_string(),
        })
    }

    let scheduler = harness.runtime.scheduler();

    let called = scheduler
        .execute(
            ActionNode::new("tool", SessionKind::Chat, |_| ask("search")).with_processor(parse),
        )
        .await
        .unwrap();
    assert_eq!(
        called.output,
        ActionOutput::FunctionCall {
            name: "search".into(),
            arguments: "rust".into(),
        }
    );
    assert!(called.processed);

    let plain = scheduler
        .execute(ActionNode::new("chat", SessionKind::Chat, |_| ask("talk")).with_processor(parse))
        .await
        .unwrap();
    assert_eq!(plain.text(), Some("just text"));
    assert!(!plain.processed);
}

#[tokio::test]
async fn streamed_units_are_forwarded() {
    let harness = with_chat(
        ScriptedBackend::with_replies(["Hello there. How are you?"]),
        test_config(),
    )
    .await;
    let (tx, mut rx) = unbounded_channel();

    let result = harness
        .runtime
        .scheduler()
        .execute(
            ActionNode::new("speak", SessionKind::Chat, |_| ask("greet"))
                .with_filter(Box::new(SentenceFilter::new(5)))
                .stream_to(tx),
        )
        .await
        .unwrap();

    let mut units = Vec::new();
    while let Ok(unit) = rx.try_recv() {
        units.push(unit);
    }

    assert_eq!(units, ["Hello there.", " How are you?"]);
    assert_eq!(result.text(), Some("Hello there. How are you?"));
}

#[tokio::test]
async fn invalid_batches_are_rejected_before_running() {
    let harness = with_chat(ScriptedBackend::new(), test_config()).await;
    let scheduler = harness.runtime.scheduler();

    let cycle = vec![
        ActionNode::new("a", SessionKind::Chat, |_| ask("a")).depends_on("b"),
        ActionNode::new("b", SessionKind::Chat, |_| ask("b")).depends_on("a"),
    ];
    assert_eq!(
        scheduler.run_batch(cycle).await.unwrap_err(),
        SchedulerError::DependencyCycle(vec!["a".into(), "b".into()])
    );

    let unknown = vec![ActionNode::new("a", SessionKind::Chat, |_| ask("a")).depends_on("zzz")];
    assert!(matches!(
        scheduler.run_batch(unknown).await,
        Err(SchedulerError::UnknownDependency { .. })
    ));

    assert!(scheduler.all_nodes_complete());
    assert_eq!(harness.backend.sampled_tokens(), 0);
}

#[tokio::test]
async fn recorded_results_persist_until_cleared() {
    let harness = with_chat(
        ScriptedBackend::with_replies(["one", "two", "three"]),
        test_config(),
    )
    .await;
    let scheduler = harness.runtime.scheduler();

    scheduler
        .execute(ActionNode::new("a", SessionKind::Chat, |_| ask("a")))
        .await
        .unwrap();
    assert_eq!(scheduler.get_result("a").unwrap().text(), Some("one"));

    // A later batch may depend on an earlier result.
    let b = scheduler
        .execute(
            ActionNode::new("b", SessionKind::Chat, |deps| {
                ask(deps.text("a").unwrap_or("missing"))
            })
            .depends_on("a"),
        )
        .await
        .unwrap();
    assert_eq!(b.text(), Some("two"));

    assert_eq!(
        scheduler
            .execute(ActionNode::new("a", SessionKind::Chat, |_| ask("a")))
            .await
            .unwrap_err(),
        SchedulerError::DuplicateAction("a".into())
    );

    scheduler.clear_results();
    assert!(scheduler.get_result("a").is_none());
    let again = scheduler
        .execute(ActionNode::new("a", SessionKind::Chat, |_| ask("a")))
        .await
        .unwrap();
    assert_eq!(again.text(), Some("three"));
}

#[tokio::test]
async fn slow_actions_time_out() {
    let config = Config {
        action_timeout_ms: 100,
        ..test_config()
    };
    let harness = with_chat(ScriptedBackend::with_replies(["z".repeat(60)]), config).await;
    harness.backend.set_token_delay(Duration::from_millis(20));

    let result = harness
        .runtime
        .scheduler()
        .execute(ActionNode::new("slow", SessionKind::Chat, |_| ask("ramble")))
        .await
        .unwrap();

    assert_eq!(result.output, ActionOutput::Failed("timed out".into()));
}

#[tokio::test]
async fn batches_past_their_ceiling_are_cancelled() {
    let config = Config {
        batch_timeout_ms: 150,
        ..test_config()
    };
    let harness = with_chat(ScriptedBackend::with_replies(["z".repeat(60)]), config).await;
    harness.backend.set_token_delay(Duration::from_millis(20));
    let scheduler = harness.runtime.scheduler();

    let nodes = vec![
        ActionNode::new("slow", SessionKind::Chat, |_| ask("ramble")),
        ActionNode::new("after", SessionKind::Chat, |_| ask("never")).depends_on("slow"),
    ];

    assert_eq!(
        scheduler.run_batch(nodes).await.unwrap_err(),
        SchedulerError::BatchTimedOut(Duration::from_millis(150))
    );
    assert_eq!(
        scheduler.get_result("slow").unwrap().output,
        ActionOutput::Failed("cancelled".into())
    );
    assert!(scheduler.get_result("after").is_none());
    assert!(scheduler.all_nodes_complete());

    // The aborted generation lets go of the session.
    let chat = harness.runtime.registry().get("chat").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), chat.lock())
        .await
        .expect("cancelled action kept the session locked");
}

#[tokio::test]
async fn an_idle_cancel_does_not_fail_the_next_action() {
    let harness = with_chat(ScriptedBackend::with_replies(["fine"]), test_config()).await;
    let chat = harness.runtime.registry().get("chat").await.unwrap();

    chat.cancel();

    let result = harness
        .runtime
        .scheduler()
        .execute(ActionNode::new("next", SessionKind::Chat, |_| ask("hello")))
        .await
        .unwrap();
    assert_eq!(result.text(), Some("fine"));
}

async fn with_thinking(harness: &Harness) {
    let path = harness.model("think.gguf");
    harness
        .runtime
        .registry()
        .get_or_create("thinking", Some(path.as_path()))
        .await;
}

#[tokio::test]
async fn concurrent_batches_settle_independently() {
    let long_reply = "z".repeat(60);
    let harness = with_chat(
        ScriptedBackend::with_replies([long_reply.clone(), "hi".to_string()]),
        test_config(),
    )
    .await;
    with_thinking(&harness).await;
    harness.backend.set_token_delay(Duration::from_millis(10));
    let scheduler = harness.runtime.scheduler().clone();

    let long = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .run_batch(vec![ActionNode::new("long", SessionKind::Chat, |_| {
                    ask("ramble")
                })])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let short = scheduler
        .execute(ActionNode::new("short", SessionKind::Thinking, |_| ask("quick")))
        .await
        .unwrap();

    assert_eq!(short.text(), Some("hi"));
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(scheduler.get_result("long").is_none());
    assert!(!scheduler.all_nodes_complete());

    let long = long.await.unwrap().unwrap();
    assert_eq!(long["long"].text(), Some(long_reply.as_str()));
    assert!(scheduler.all_nodes_complete());
}

#[tokio::test]
async fn a_timed_out_batch_leaves_other_batches_running() {
    let steady_reply = "y".repeat(30);
    let harness = with_chat(
        ScriptedBackend::with_replies([steady_reply.clone(), "z".repeat(60)]),
        test_config(),
    )
    .await;
    with_thinking(&harness).await;
    harness.backend.set_token_delay(Duration::from_millis(10));
    let scheduler = harness.runtime.scheduler().clone();

    let steady = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .run_batch(vec![ActionNode::new("steady", SessionKind::Chat, |_| {
                    ask("keep going")
                })])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Only batches submitted from now on get the short ceiling.
    harness.runtime.config().write().unwrap().batch_timeout_ms = 150;

    let seen = Arc::new(Mutex::new(None));
    let slow = {
        let seen = seen.clone();
        ActionNode::new("slow", SessionKind::Thinking, |_| ask("ramble"))
            .on_complete(move |result| *seen.lock().unwrap() = Some(result.output.clone()))
    };

    assert_eq!(
        scheduler.run_batch(vec![slow]).await.unwrap_err(),
        SchedulerError::BatchTimedOut(Duration::from_millis(150))
    );
    assert_eq!(
        *seen.lock().unwrap(),
        Some(ActionOutput::Failed("cancelled".into()))
    );

    let steady = steady.await.unwrap().unwrap();
    assert_eq!(steady["steady"].text(), Some(steady_reply.as_str()));
}
