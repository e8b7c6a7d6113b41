//! A daemon orchestrator and a viewer talking over the in-memory relay.

#![allow(unused_results)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tether_core::ids::{SessionId, UserId};
use tether_core::messages::{
    InteractiveAction, InteractivePayload, MessageBody, MessageType,
};
use tether_core::models::{MachineStatus, Role};
use tether_runtime::testing::{FakeTerminal, ScriptedEngine};
use tether_runtime::{Collaborators, EngineEvent, OrchestratorConfig, SessionOrchestrator};
use tether_settings::MemorySettingsStore;
use tether_store::{BridgeStore, MemoryStore};
use tether_transport::{MemoryRelay, TransportConfig, ViewerSession};

struct Bridge {
    relay: MemoryRelay,
    store: Arc<MemoryStore>,
    settings: Arc<MemorySettingsStore>,
    engine: Arc<ScriptedEngine>,
    orchestrator: SessionOrchestrator,
}

impl Bridge {
    fn new() -> Self {
        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let settings = Arc::new(MemorySettingsStore::new());
        let engine = Arc::new(ScriptedEngine::new());
        let orchestrator = SessionOrchestrator::new(
            OrchestratorConfig::new(UserId::from("u1"), "box1", "/tmp"),
            Collaborators {
                relay: Arc::new(relay.client()),
                store: store.clone(),
                settings: settings.clone(),
                engine: engine.clone(),
                terminal: Arc::new(FakeTerminal::new()),
            },
        );
        Self {
            relay,
            store,
            settings,
            engine,
            orchestrator,
        }
    }

    async fn viewer(&self, session_id: &SessionId) -> ViewerSession {
        ViewerSession::open(
            session_id.clone(),
            Arc::new(self.relay.client()),
            self.store.clone(),
            TransportConfig::default(),
        )
        .await
        .unwrap()
    }
}

fn system(session: &str, model: &str) -> EngineEvent {
    EngineEvent::System {
        session_id: Some(session.into()),
        model: Some(model.into()),
        commands: vec!["clear".into(), "compact".into()],
        content: None,
    }
}

fn assistant(text: &str) -> EngineEvent {
    EngineEvent::Assistant { text: text.into() }
}

fn done(session: &str, text: &str) -> EngineEvent {
    EngineEvent::Result {
        session_id: Some(session.into()),
        text: text.into(),
        is_error: false,
    }
}

#[tokio::test]
async fn input_produces_output_then_commands() {
    let bridge = Bridge::new();
    bridge
        .engine
        .push_turn(vec![system("tok-1", "sonnet"), assistant("Hello from the engine"), done("tok-1", "Hello from the engine")]);
    let sid = bridge.orchestrator.start().await.unwrap();
    let viewer = bridge.viewer(&sid).await;

    let mut outputs = viewer.dispatcher().subscribe(MessageType::Output);
    let mut commands = viewer.dispatcher().subscribe(MessageType::Commands);
    viewer.send_input("say hello", Vec::new()).await.unwrap();

    let output = tokio::time::timeout(Duration::from_secs(5), outputs.recv()).await.unwrap().unwrap();
    assert_eq!(output.content(), Some("Hello from the engine"));
    let listed = tokio::time::timeout(Duration::from_secs(5), commands.recv()).await.unwrap().unwrap();
    let MessageBody::Commands { commands } = listed.body else {
        panic!("unexpected body");
    };
    let names: Vec<_> = commands.into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["clear", "compact"]);

    // Both sides' history types were persisted.
    let rows = bridge.store.list_messages(&sid, None).await.unwrap();
    let kinds: Vec<_> = rows.iter().map(|r| r.kind).collect();
    assert!(kinds.contains(&MessageType::Input));
    assert!(kinds.contains(&MessageType::Output));

    let session = bridge.store.get_session(&sid).await.unwrap().unwrap();
    assert_eq!(session.title.as_deref(), Some("say hello"));
    assert_eq!(session.resume_token.as_deref(), Some("tok-1"));

    bridge.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn model_change_starts_a_seeded_fresh_engine_session() {
    let bridge = Bridge::new();
    bridge.engine.push_turn(vec![system("tok-1", "sonnet"), assistant("first"), done("tok-1", "first")]);
    bridge.engine.push_turn(vec![system("tok-2", "claude-opus-4"), assistant("second"), done("tok-2", "second")]);
    let sid = bridge.orchestrator.start().await.unwrap();
    let viewer = bridge.viewer(&sid).await;

    let mut commands = viewer.dispatcher().subscribe(MessageType::Commands);
    viewer.send_input("one", Vec::new()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), commands.recv()).await.unwrap().unwrap();

    let mut models = viewer.dispatcher().subscribe(MessageType::Model);
    viewer.change_model("opus").await.unwrap();
    let announced = tokio::time::timeout(Duration::from_secs(5), models.recv()).await.unwrap().unwrap();
    assert_eq!(announced.body, MessageBody::model("opus"));
    assert_eq!(bridge.orchestrator.adapter().resume_token(), None);

    let mut outputs = viewer.dispatcher().subscribe(MessageType::Output);
    viewer.send_input("two", Vec::new()).await.unwrap();
    let output = tokio::time::timeout(Duration::from_secs(5), outputs.recv()).await.unwrap().unwrap();
    assert_eq!(output.content(), Some("second"));

    let requests = bridge.engine.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].resume, None);
    assert_eq!(requests[1].model.as_deref(), Some("opus"));
    let seeded: Vec<_> = requests[1].seed_context.iter().map(|t| (t.role, t.content.as_str())).collect();
    assert_eq!(seeded, vec![(Role::User, "one"), (Role::Assistant, "first")]);

    bridge.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn interactive_vim_toggle_writes_settings() {
    let bridge = Bridge::new();
    let sid = bridge.orchestrator.start().await.unwrap();
    let viewer = bridge.viewer(&sid).await;

    let mut confirms = viewer.dispatcher().subscribe(MessageType::InteractiveConfirm);
    viewer
        .apply_interactive(InteractivePayload {
            command: "vim".into(),
            action: InteractiveAction::Toggle,
            key: None,
            value: json!(true),
        })
        .await
        .unwrap();
    let confirm = tokio::time::timeout(Duration::from_secs(5), confirms.recv()).await.unwrap().unwrap();
    let MessageBody::InteractiveConfirm {
        interactive_command,
        interactive_result,
    } = confirm.body
    else {
        panic!("unexpected body");
    };
    assert_eq!(interactive_command, "vim");
    assert!(interactive_result.success);
    assert_eq!(bridge.settings.snapshot(), json!({"vim": true}));

    bridge.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn viewer_ping_is_answered_with_its_seq() {
    let bridge = Bridge::new();
    let sid = bridge.orchestrator.start().await.unwrap();
    let viewer = bridge.viewer(&sid).await;

    let mut pongs = viewer.dispatcher().subscribe(MessageType::Pong);
    let ping = viewer.ping().await.unwrap();
    let pong = tokio::time::timeout(Duration::from_secs(5), pongs.recv()).await.unwrap().unwrap();
    assert_eq!(pong.body, MessageBody::Pong { ping_seq: ping.seq });

    bridge.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn models_request_lists_the_fallback_catalog() {
    let bridge = Bridge::new();
    let sid = bridge.orchestrator.start().await.unwrap();
    let viewer = bridge.viewer(&sid).await;

    let mut catalogs = viewer.dispatcher().subscribe(MessageType::Models);
    viewer.request_models().await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), catalogs.recv()).await.unwrap().unwrap();
    let MessageBody::Models { available_models } = reply.body else {
        panic!("unexpected body");
    };
    let ids: Vec<_> = available_models.into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["sonnet", "opus", "haiku"]);

    bridge.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn existing_machine_is_reused_and_stays_online_after_stop() {
    let bridge = Bridge::new();
    let existing = bridge
        .store
        .register_machine(&UserId::from("u1"), "box1", "box1")
        .await
        .unwrap();
    bridge
        .store
        .set_machine_status(&existing.id, MachineStatus::Offline)
        .await
        .unwrap();

    let sid = bridge.orchestrator.start().await.unwrap();
    let session = bridge.store.get_session(&sid).await.unwrap().unwrap();
    assert_eq!(session.machine_id, existing.id);
    assert_eq!(bridge.store.machine_count(), 1);
    let machine = bridge.store.get_machine(&existing.id).await.unwrap().unwrap();
    assert_eq!(machine.status, MachineStatus::Online);

    bridge.orchestrator.stop().await.unwrap();
    let machine = bridge.store.get_machine(&existing.id).await.unwrap().unwrap();
    assert_eq!(machine.status, MachineStatus::Online);
}

#[tokio::test]
async fn reopened_viewer_replays_history() {
    let bridge = Bridge::new();
    bridge.engine.push_turn(vec![assistant("answer"), done("tok", "answer")]);
    let sid = bridge.orchestrator.start().await.unwrap();
    let viewer = bridge.viewer(&sid).await;
    let mut commands = viewer.dispatcher().subscribe(MessageType::Commands);
    viewer.send_input("question", Vec::new()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), commands.recv()).await.unwrap().unwrap();
    viewer.close().await.unwrap();

    let again = bridge.viewer(&sid).await;
    let contents: Vec<_> = again
        .messages()
        .iter()
        .filter_map(|m| m.content().map(str::to_owned))
        .collect();
    assert_eq!(contents, vec!["question", "answer"]);

    bridge.orchestrator.stop().await.unwrap();
}
