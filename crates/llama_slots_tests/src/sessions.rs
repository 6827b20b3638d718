use std::collections::HashSet;

use llama_slots::{RegistryError, SessionError, SessionState, StopReason, WeightsLoadError};

use crate::{Harness, ScriptedBackend};

#[tokio::test]
async fn load_builds_a_context_sized_from_the_config() {
    let harness = Harness::new(ScriptedBackend::new());
    let path = harness.model("m.gguf");

    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();

    assert_eq!(chat.state().await, SessionState::Loaded);

    let sequence_id = chat.lock().await.sequence_id();
    let params = harness.backend.last_context_params().unwrap();
    assert_eq!(params.n_ctx, 256 + 32);
    assert_eq!(params.n_batch, 32);
    assert_eq!(params.n_seq_max, sequence_id as u32 + 1);
    assert!((1..=8).contains(&params.n_threads));
    assert!(!params.flash_attention);
}

#[tokio::test]
async fn decode_position_advances_by_decoded_tokens() {
    let harness = Harness::new(ScriptedBackend::with_replies(["xyz"]));
    let path = harness.model("m.gguf");
    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();

    chat.completion_init("Hello").await.unwrap();
    // "Hello" plus the BOS token.
    assert_eq!(chat.decode_position().await, 6);

    let mut session = chat.lock().await;
    let mut current = 0;
    assert_eq!(session.completion_loop(64, &mut current).as_deref(), Some("x"));
    assert_eq!(session.completion_loop(64, &mut current).as_deref(), Some("y"));
    assert_eq!(current, 2);
    assert_eq!(session.decode_position(), 8);

    session.append_user_message("ab").unwrap();
    assert_eq!(session.decode_position(), 10);
    assert_eq!(session.tokens().len(), 10);
}

#[tokio::test]
async fn generation_stops_on_end_of_generation_and_max_tokens() {
    let harness = Harness::new(ScriptedBackend::with_replies(["ab", "abcdef"]));
    let path = harness.model("m.gguf");
    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();

    let mut session = chat.lock().await;
    session.completion_init("one").unwrap();

    let mut current = 0;
    let mut text = String::new();
    while let Some(piece) = session.completion_loop(64, &mut current) {
        text.push_str(&piece);
    }
    assert_eq!(text, "ab");
    assert_eq!(session.stop_reason(), Some(StopReason::EndOfGeneration));

    session.append_user_message("two").unwrap();

    let mut current = 0;
    let mut text = String::new();
    while let Some(piece) = session.completion_loop(3, &mut current) {
        text.push_str(&piece);
    }
    assert_eq!(text, "abc");
    assert_eq!(current, 3);
    assert_eq!(session.stop_reason(), Some(StopReason::MaxTokens));
}

#[tokio::test]
async fn split_codepoints_are_held_back_until_complete() {
    let harness = Harness::new(ScriptedBackend::with_replies(["é!"]));
    let path = harness.model("m.gguf");
    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();

    let mut session = chat.lock().await;
    session.completion_init("hi").unwrap();

    let mut current = 0;
    assert_eq!(session.completion_loop(64, &mut current).as_deref(), Some(""));
    assert_eq!(session.completion_loop(64, &mut current).as_deref(), Some("é"));
    assert_eq!(session.completion_loop(64, &mut current).as_deref(), Some("!"));
    assert_eq!(session.completion_loop(64, &mut current), None);
    assert_eq!(current, 3);
}

#[tokio::test]
async fn cancellation_stops_at_the_next_token() {
    let harness = Harness::new(ScriptedBackend::with_replies(["abcdef"]));
    let path = harness.model("m.gguf");
    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();

    chat.completion_init("go").await.unwrap();

    let mut session = chat.lock().await;
    let mut current = 0;
    assert!(session.completion_loop(64, &mut current).is_some());

    chat.cancel();
    assert_eq!(session.completion_loop(64, &mut current), None);
    assert_eq!(session.stop_reason(), Some(StopReason::Cancelled));
    assert_eq!(current, 1);
}

#[tokio::test]
async fn reset_check_is_stable_until_the_context_is_cleared() {
    let harness = Harness::new(ScriptedBackend::new());
    let path = harness.model("m.gguf");
    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();

    chat.completion_init("short").await.unwrap();
    assert!(!chat.check_reset_pending().await);

    // 160 + batch (32) + max tokens (64) reaches the 256 token context.
    chat.append_user_message("x".repeat(160)).await.unwrap();
    assert!(chat.check_reset_pending().await);
    assert!(chat.check_reset_pending().await);

    chat.clear_context(true).await.unwrap();
    assert!(!chat.check_reset_pending().await);
    assert_eq!(chat.decode_position().await, 0);
    assert!(chat.lock().await.is_restarted());
    assert_eq!(harness.backend.kv_tokens(), 0);
}

#[tokio::test]
async fn long_prompts_are_split_into_batches() {
    let harness = Harness::new(ScriptedBackend::new());
    let path = harness.model("m.gguf");
    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();

    let before = harness.backend.counters().decodes;
    chat.completion_init("y".repeat(99)).await.unwrap();

    // 100 tokens in batches of 32.
    assert_eq!(harness.backend.counters().decodes - before, 4);
    assert_eq!(chat.decode_position().await, 100);
}

#[tokio::test]
async fn ingestion_errors_are_reported() {
    let harness = Harness::new(ScriptedBackend::new());
    let path = harness.model("m.gguf");
    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();

    assert_eq!(
        chat.append_user_message("").await,
        Err(SessionError::TokenizationEmpty)
    );

    assert_eq!(
        chat.completion_init("z".repeat(300)).await,
        Err(SessionError::ContextFull {
            requested: 301,
            available: 288,
        })
    );
    assert_eq!(chat.decode_position().await, 0);

    harness.backend.fail_next_decode();
    assert_eq!(
        chat.completion_init("hello").await,
        Err(SessionError::DecodeFailed(1))
    );
    assert_eq!(chat.decode_position().await, 0);

    chat.completion_init("hello").await.unwrap();
    assert_eq!(chat.decode_position().await, 6);
}

#[tokio::test]
async fn load_failures_move_the_session_to_error() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();

    let missing = harness.missing("nope.gguf");
    let err = registry.load_session("chat", &missing).await.unwrap_err();
    assert_eq!(
        err,
        RegistryError::Session(SessionError::Weights(WeightsLoadError::DoesNotExist(
            missing
        )))
    );

    let chat = registry.get("chat").await.unwrap();
    assert!(matches!(chat.state().await, SessionState::Error(_)));
    assert!(!chat.lock().await.has_weights());

    harness.backend.fail_contexts(true);
    let path = harness.model("m.gguf");
    let err = chat.load_model(&path).await.unwrap_err();
    assert!(matches!(err, SessionError::ContextInit(_)));
    assert!(matches!(chat.state().await, SessionState::Error(_)));

    harness.backend.fail_contexts(false);
    chat.load_model(&path).await.unwrap();
    assert_eq!(chat.state().await, SessionState::Loaded);

    // The failed attempt did not take an extra reference.
    let key = chat.lock().await.weights_key().unwrap().to_string();
    assert_eq!(harness.runtime.weights().ref_count(&key), 1);
}

#[tokio::test]
async fn loading_other_weights_releases_the_previous_ones() {
    let harness = Harness::new(ScriptedBackend::new());
    let first = harness.model("first.gguf");
    let second = harness.model("second.gguf");

    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &first)
        .await
        .unwrap();
    chat.load_model(&second).await.unwrap();

    assert_eq!(harness.backend.live_models(), 1);
    assert_eq!(harness.backend.live_contexts(), 1);
    assert_eq!(chat.lock().await.model_path(), Some(second.as_path()));

    // Reloading the same weights rebuilds the context only.
    chat.load_model(&second).await.unwrap();
    assert_eq!(harness.backend.counters().models_loaded, 2);
    assert_eq!(harness.backend.counters().contexts_created, 3);
}

#[tokio::test]
async fn context_only_unload_keeps_weights_and_rebuilds_lazily() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();
    let weights = harness.runtime.weights();
    let path = harness.model("m.gguf");

    let chat = registry.load_session("chat", &path).await.unwrap();
    let key = chat.lock().await.weights_key().unwrap().to_string();
    chat.completion_init("hello").await.unwrap();

    registry.unload_context_only("chat").await.unwrap();
    assert_eq!(weights.ref_count(&key), 1);
    assert!(!chat.lock().await.has_context());
    assert_eq!(chat.state().await, SessionState::Unloaded);
    assert_eq!(harness.backend.live_contexts(), 0);

    chat.completion_init("hello again").await.unwrap();
    assert!(chat.decode_position().await > 0);
    assert_eq!(harness.backend.counters().contexts_created, 2);
    assert_eq!(harness.backend.counters().models_loaded, 1);

    registry.unload_fully("chat").await.unwrap();
    assert_eq!(weights.ref_count(&key), 0);
    assert!(!registry.contains("chat").await);
    assert_eq!(harness.backend.live_models(), 0);
}

#[tokio::test]
async fn live_sessions_never_share_sequence_ids() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();

    let mut ids = HashSet::new();
    for name in ["a", "b", "c", "d"] {
        let session = registry.get_or_create(name, None).await;
        assert!(ids.insert(session.lock().await.sequence_id()));
    }
    assert_eq!(registry.sequences().in_use(), 4);

    let b = registry.get("b").await.unwrap();
    let released = b.lock().await.sequence_id();
    registry.unload_fully("b").await.unwrap();
    assert_eq!(registry.sequences().in_use(), 3);

    let e = registry.get_or_create("e", None).await;
    assert_eq!(e.lock().await.sequence_id(), released);
}

#[tokio::test]
async fn switching_agents_swaps_the_active_adapter() {
    let harness = Harness::new(ScriptedBackend::new());
    let path = harness.model("m.gguf");
    let planner = harness.file("planner.lora", b"adapter");
    let critic = harness.file("critic.lora", b"adapter");

    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();
    chat.completion_init("hello").await.unwrap();

    assert_eq!(chat.switch_agent(&planner).await, Ok(true));
    assert_eq!(harness.backend.attached_adapters(), vec![planner.clone()]);
    assert_eq!(chat.decode_position().await, 0);
    assert!(!chat.is_cancelled());

    assert_eq!(chat.switch_agent(&planner).await, Ok(false));
    assert_eq!(harness.backend.counters().adapters_loaded, 1);

    assert_eq!(chat.switch_agent(harness.missing("ghost.lora")).await, Ok(false));
    assert_eq!(harness.backend.attached_adapters(), vec![planner]);

    assert_eq!(chat.switch_agent(&critic).await, Ok(true));
    assert_eq!(harness.backend.attached_adapters(), vec![critic.clone()]);
    assert_eq!(harness.backend.live_adapters(), 1);
    assert_eq!(chat.lock().await.active_adapters(), vec![critic]);

    harness.runtime.shutdown().await;
    assert_eq!(harness.backend.live_adapters(), 0);
}

#[tokio::test]
async fn failed_adapter_attach_frees_the_adapter() {
    let harness = Harness::new(ScriptedBackend::new());
    let path = harness.model("m.gguf");
    let adapter = harness.file("planner.lora", b"adapter");

    let chat = harness
        .runtime
        .registry()
        .load_session("chat", &path)
        .await
        .unwrap();

    harness.backend.fail_adapters(true);
    assert!(matches!(
        chat.switch_agent(&adapter).await,
        Err(SessionError::Adapter(_))
    ));
    assert_eq!(harness.backend.live_adapters(), 0);
    assert!(chat.lock().await.active_adapters().is_empty());
}
