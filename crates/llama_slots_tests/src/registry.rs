use std::time::Duration;

use llama_slots::{RegistryError, SessionError};

use crate::{Harness, ScriptedBackend};

#[tokio::test]
async fn first_session_becomes_the_default() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();

    assert!(registry.get_default().await.is_none());

    registry.get_or_create("b", None).await;
    registry.get_or_create("a", None).await;
    registry.get_or_create("c", None).await;

    assert_eq!(registry.default_id().await.as_deref(), Some("b"));
    assert_eq!(registry.ids().await, ["a", "b", "c"]);

    assert!(registry.set_default("c").await);
    assert!(!registry.set_default("missing").await);
    assert_eq!(registry.get_default().await.unwrap().id(), "c");

    registry.unload_fully("c").await.unwrap();
    assert_eq!(registry.default_id().await.as_deref(), Some("a"));

    assert_eq!(
        registry.unload_fully("c").await,
        Err(RegistryError::SessionNotFound("c".into()))
    );
}

#[tokio::test]
async fn get_or_create_returns_the_existing_session() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();

    let first = registry.get_or_create("chat", None).await;
    let second = registry.get_or_create("chat", None).await;

    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(registry.ids().await.len(), 1);
}

#[tokio::test]
async fn shared_sessions_need_resident_weights_and_a_free_id() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();
    let path = harness.model("m.gguf");

    assert_eq!(
        registry.create_shared_session("think", "m").await.unwrap_err(),
        RegistryError::WeightsNotLoaded("m".into())
    );

    let chat = registry.load_session("chat", &path).await.unwrap();
    let key = chat.lock().await.weights_key().unwrap().to_string();

    assert_eq!(
        registry.create_shared_session("chat", &key).await.unwrap_err(),
        RegistryError::SessionExists("chat".into())
    );

    let think = registry.create_shared_session("think", &key).await.unwrap();
    assert_eq!(harness.runtime.weights().ref_count(&key), 2);
    assert_eq!(harness.backend.counters().models_loaded, 1);

    // The shared session builds its context on first use.
    assert!(!think.lock().await.has_context());
    think.completion_init("hello").await.unwrap();
    assert_eq!(harness.backend.live_contexts(), 2);
}

#[tokio::test]
async fn thinking_context_lives_while_leased() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();
    let path = harness.model("think.gguf");

    let thinking = registry.get_or_create("thinking", Some(path.as_path())).await;
    assert!(!thinking.lock().await.has_weights());

    let first = registry.acquire_thinking_session().await.unwrap();
    let second = registry.acquire_session_context("thinking").await.unwrap();
    assert_eq!(first.session_id(), "thinking");
    assert_eq!(registry.context_users("thinking").await, 2);
    assert_eq!(harness.backend.counters().contexts_created, 1);

    first.release().await.unwrap();
    assert!(thinking.lock().await.has_context());

    second.release().await.unwrap();
    assert_eq!(registry.context_users("thinking").await, 0);
    assert!(!thinking.lock().await.has_context());
    assert!(thinking.lock().await.has_weights());
    assert_eq!(harness.backend.live_contexts(), 0);
    assert_eq!(harness.backend.live_models(), 1);

    let again = registry.acquire_thinking_session().await.unwrap();
    assert!(thinking.lock().await.has_context());
    assert_eq!(harness.backend.counters().contexts_created, 2);
    assert_eq!(harness.backend.counters().models_loaded, 1);
    again.release().await.unwrap();

    // Over-release is tolerated.
    registry.release_thinking_session().await.unwrap();
    assert_eq!(registry.context_users("thinking").await, 0);
}

#[tokio::test]
async fn dropped_leases_are_released_in_the_background() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();
    let path = harness.model("think.gguf");

    registry.get_or_create("thinking", Some(path.as_path())).await;
    let lease = registry.acquire_thinking_session().await.unwrap();
    drop(lease);

    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.context_users("thinking").await > 0 || harness.backend.live_contexts() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dropped lease was never released");
}

#[tokio::test]
async fn leases_need_a_known_loadable_session() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();

    assert!(matches!(
        registry.acquire_session_context("ghost").await,
        Err(RegistryError::SessionNotFound(_))
    ));

    registry.get_or_create("empty", None).await;
    assert!(matches!(
        registry.acquire_session_context("empty").await,
        Err(RegistryError::Session(SessionError::NotLoaded))
    ));
    assert_eq!(registry.context_users("empty").await, 0);
}

#[tokio::test]
async fn shutdown_releases_everything() {
    let harness = Harness::new(ScriptedBackend::new());
    let registry = harness.runtime.registry();
    let path = harness.model("m.gguf");

    let chat = registry.load_session("chat", &path).await.unwrap();
    let key = chat.lock().await.weights_key().unwrap().to_string();
    registry.create_shared_session("think", &key).await.unwrap();
    registry.load_session("other", harness.model("other.gguf")).await.unwrap();

    harness.runtime.shutdown().await;

    assert!(registry.ids().await.is_empty());
    assert!(harness.runtime.weights().list_loaded().is_empty());
    assert_eq!(harness.backend.live_models(), 0);
    assert_eq!(harness.backend.live_contexts(), 0);
    assert_eq!(registry.sequences().in_use(), 0);
}
