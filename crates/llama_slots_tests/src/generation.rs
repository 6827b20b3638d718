use std::time::Duration;

use futures::StreamExt;

use llama_slots::{
    Config, ConversationMessage, FullResponseFilter, PassthroughFilter, SentenceFilter,
    TurnOutcome,
};

use crate::{test_config, Harness, ScriptedBackend};

const REPLY: &str = "Hello there. How are you?";

async fn loaded(harness: &Harness) -> llama_slots::SessionHandle {
    let path = harness.model("m.gguf");
    harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap()
}

#[tokio::test]
async fn streams_the_whole_reply() {
    let harness = Harness::new(ScriptedBackend::with_replies([REPLY]));
    let chat = loaded(&harness).await;

    let mut response = harness.runtime.generator().generate(
        &chat,
        &[],
        "Be brief.",
        ConversationMessage::user("Hi!"),
        Box::new(PassthroughFilter),
    );

    let units: Vec<String> = (&mut response).collect().await;
    assert_eq!(units.len(), REPLY.len());
    assert_eq!(units.concat(), REPLY);
    assert_eq!(response.outcome().await, TurnOutcome::Completed);
}

#[tokio::test]
async fn sentence_filter_groups_the_stream() {
    let harness = Harness::new(ScriptedBackend::with_replies([REPLY]));
    let chat = loaded(&harness).await;

    let mut response = harness.runtime.generator().generate(
        &chat,
        &[],
        "",
        ConversationMessage::user("Hi!"),
        Box::new(SentenceFilter::new(5)),
    );

    let mut units = Vec::new();
    while let Some(unit) = response.next_unit().await {
        units.push(unit);
    }

    assert_eq!(units, ["Hello there.", " How are you?"]);
    assert_eq!(response.outcome().await, TurnOutcome::Completed);
}

#[tokio::test]
async fn full_response_filter_emits_once() {
    let harness = Harness::new(ScriptedBackend::with_replies([REPLY]));
    let chat = loaded(&harness).await;

    let mut response = harness.runtime.generator().generate(
        &chat,
        &[],
        "",
        ConversationMessage::user("Hi!"),
        Box::new(FullResponseFilter::new()),
    );

    assert_eq!(response.next_unit().await.as_deref(), Some(REPLY));
    assert_eq!(response.next_unit().await, None);
}

#[tokio::test]
async fn fresh_context_replays_recent_history_then_appends() {
    let harness = Harness::new(ScriptedBackend::with_replies(["one", "two"]));
    let chat = loaded(&harness).await;
    let generator = harness.runtime.generator();

    let history: Vec<_> = (0..6)
        .map(|i| ConversationMessage::user(format!("m{i}")))
        .collect();

    let mut response = generator.generate(
        &chat,
        &history,
        "Be brief.",
        ConversationMessage::user("now"),
        Box::new(PassthroughFilter),
    );
    assert_eq!(response.collect_text().await, "one");
    assert_eq!(response.outcome().await, TurnOutcome::Completed);

    assert_eq!(
        harness.backend.primed_prompts(),
        ["system: Be brief.\nuser: m2\nuser: m3\nuser: m4\nuser: m5\nuser: now\n"]
    );
    let after_first = chat.decode_position().await;

    let mut response = generator.generate(
        &chat,
        &history,
        "Be brief.",
        ConversationMessage::user("again"),
        Box::new(PassthroughFilter),
    );
    assert_eq!(response.collect_text().await, "two");

    // Only the new message was appended; nothing was primed again.
    assert_eq!(harness.backend.primed_prompts().len(), 1);
    assert_eq!(
        chat.decode_position().await,
        after_first + "user: again\n".len() + "two".len()
    );
}

#[tokio::test]
async fn cancelling_stops_generation_within_a_token() {
    let reply = "a".repeat(60);
    let harness = Harness::new(ScriptedBackend::with_replies([reply.clone()]));
    harness.backend.set_token_delay(Duration::from_millis(10));
    let chat = loaded(&harness).await;

    let mut response = harness.runtime.generator().generate(
        &chat,
        &[],
        "",
        ConversationMessage::user("Go on."),
        Box::new(PassthroughFilter),
    );

    assert_eq!(response.next_unit().await.as_deref(), Some("a"));
    response.cancel();

    assert_eq!(response.outcome().await, TurnOutcome::Cancelled);
    assert!(harness.backend.sampled_tokens() < reply.len());

    // The session is free again and keeps what was decoded.
    assert!(chat.decode_position().await > 0);
}

#[tokio::test]
async fn cancelling_an_idle_session_does_not_stop_later_turns() {
    let harness = Harness::new(ScriptedBackend::with_replies(["first", "second"]));
    let chat = loaded(&harness).await;
    let generator = harness.runtime.generator();

    chat.cancel();

    for expected in ["first", "second"] {
        let mut response = generator.generate(
            &chat,
            &[],
            "",
            ConversationMessage::user("Hi!"),
            Box::new(PassthroughFilter),
        );
        assert_eq!(response.collect_text().await, expected);
        assert_eq!(response.outcome().await, TurnOutcome::Completed);
    }

    assert!(!chat.is_cancelled());
}

#[tokio::test]
async fn cancelling_the_session_mid_turn_stops_it() {
    let reply = "c".repeat(60);
    let harness = Harness::new(ScriptedBackend::with_replies([reply.clone()]));
    harness.backend.set_token_delay(Duration::from_millis(10));
    let chat = loaded(&harness).await;

    let mut response = harness.runtime.generator().generate(
        &chat,
        &[],
        "",
        ConversationMessage::user("Go on."),
        Box::new(PassthroughFilter),
    );

    assert_eq!(response.next_unit().await.as_deref(), Some("c"));
    chat.cancel();

    assert_eq!(response.outcome().await, TurnOutcome::Cancelled);
    assert!(harness.backend.sampled_tokens() < reply.len());
}

#[tokio::test]
async fn dropping_the_stream_releases_the_session() {
    let harness = Harness::new(ScriptedBackend::with_replies(["b".repeat(60)]));
    harness.backend.set_token_delay(Duration::from_millis(10));
    let chat = loaded(&harness).await;

    let mut response = harness.runtime.generator().generate(
        &chat,
        &[],
        "",
        ConversationMessage::user("Go on."),
        Box::new(PassthroughFilter),
    );
    assert!(response.next_unit().await.is_some());
    drop(response);

    let session = tokio::time::timeout(Duration::from_secs(5), chat.lock())
        .await
        .expect("generation kept the session locked");
    assert!(harness.backend.sampled_tokens() < 60);
    drop(session);
}

#[tokio::test]
async fn failed_ingestion_is_reported_beside_the_stream() {
    let harness = Harness::new(ScriptedBackend::new());
    let chat = loaded(&harness).await;

    harness.backend.fail_next_decode();
    let mut response = harness.runtime.generator().generate(
        &chat,
        &[],
        "",
        ConversationMessage::user("Hi!"),
        Box::new(PassthroughFilter),
    );

    assert_eq!(response.next_unit().await, None);
    assert!(matches!(response.outcome().await, TurnOutcome::Failed(_)));
}

#[tokio::test]
async fn nearly_full_context_rolls_over_after_the_turn() {
    let harness = Harness::new(ScriptedBackend::with_replies(["ok", "fresh"]));
    let chat = loaded(&harness).await;
    let generator = harness.runtime.generator();

    let long = "w".repeat(170);
    let mut response = generator.generate(
        &chat,
        &[],
        "",
        ConversationMessage::user(long),
        Box::new(PassthroughFilter),
    );
    assert_eq!(response.collect_text().await, "ok");
    assert_eq!(response.outcome().await, TurnOutcome::Completed);

    assert_eq!(chat.decode_position().await, 0);
    assert!(chat.lock().await.is_restarted());

    // The next turn primes the rolled-over context from scratch.
    let mut response = generator.generate(
        &chat,
        &[],
        "",
        ConversationMessage::user("hi"),
        Box::new(PassthroughFilter),
    );
    assert_eq!(response.collect_text().await, "fresh");
    assert_eq!(harness.backend.primed_prompts().len(), 2);
}

#[tokio::test]
async fn config_changes_apply_to_later_turns() {
    let config = Config {
        max_tokens: 64,
        ..test_config()
    };
    let harness = Harness::with_config(ScriptedBackend::with_replies(["abcdefgh"]), config);
    let chat = loaded(&harness).await;

    harness.runtime.config().write().unwrap().max_tokens = 3;

    let mut response = harness.runtime.generator().generate(
        &chat,
        &[],
        "",
        ConversationMessage::user("Hi!"),
        Box::new(PassthroughFilter),
    );
    assert_eq!(response.collect_text().await, "abc");
    assert_eq!(response.outcome().await, TurnOutcome::Completed);
}
