use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use assembler::{AssemblerConfig, MediaTool, MediaToolError, WaitPolicy};
use common_net::telemetry;
use futures_util::{SinkExt, StreamExt};
use pocketbase::PocketBaseClient;
use reqwest::StatusCode;
use session_manager::SessionManagerState;
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type BoxError = common_net::metrics::BoxError;
type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// Mirror writes go to an unroutable port; they fail fast with a warning
// and the hub keeps working, which is exactly the behavior under test.
const DEAD_POCKETBASE: &str = "http://127.0.0.1:1";

/// Byte-level stand-in for ffmpeg: repair copies, concat appends every
/// manifest entry in order.
struct StubTool;

#[async_trait::async_trait]
impl MediaTool for StubTool {
    async fn repair(&self, input: &Path, output: &Path) -> Result<(), MediaToolError> {
        let bytes = tokio::fs::read(input).await.map_err(spawn_err)?;
        tokio::fs::write(output, bytes).await.map_err(spawn_err)?;
        Ok(())
    }

    async fn concat(
        &self,
        manifest: &Path,
        workdir: &Path,
        output: &Path,
    ) -> Result<(), MediaToolError> {
        let listing = tokio::fs::read_to_string(manifest).await.map_err(spawn_err)?;
        let mut merged = Vec::new();
        for line in listing.lines() {
            let name = line
                .trim()
                .strip_prefix("file '")
                .and_then(|rest| rest.strip_suffix('\''))
                .expect("manifest line shape");
            merged.extend(tokio::fs::read(workdir.join(name)).await.map_err(spawn_err)?);
        }
        tokio::fs::write(output, merged).await.map_err(spawn_err)?;
        Ok(())
    }
}

fn spawn_err(source: std::io::Error) -> MediaToolError {
    MediaToolError::Spawn {
        tool: "stub".to_string(),
        source,
    }
}

struct TestHub {
    addr: SocketAddr,
    staging: tempfile::TempDir,
    output: tempfile::TempDir,
    _shutdown_tx: common_net::shutdown::ShutdownSender,
}

impl TestHub {
    fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn ws_url(&self, session_id: &str, user: &str) -> String {
        format!("ws://{}/ws/{}?user={}", self.addr, session_id, user)
    }
}

async fn spawn_hub() -> Result<TestHub, BoxError> {
    telemetry::init("gateway-test");

    let staging = tempfile::tempdir()?;
    let output = tempfile::tempdir()?;

    let sessions = SessionManagerState::shared(DEAD_POCKETBASE);
    let chunks = assembler::ChunkStore::new(staging.path());
    let (scheduler, queue) = assembler::scheduler();

    let (shutdown_tx, shutdown_rx) = common_net::shutdown::channel();
    let assembler_config = AssemblerConfig {
        metrics_addr: "127.0.0.1:0".parse()?,
        staging_dir: staging.path().to_path_buf(),
        output_dir: output.path().to_path_buf(),
        wait: WaitPolicy {
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(25),
        },
        max_concurrent_jobs: 2,
        ready_tx: None,
    };
    tokio::spawn(assembler::run(
        assembler_config,
        queue,
        sessions.clone(),
        Arc::new(StubTool),
        shutdown_rx.clone(),
    ));

    let state = gateway::HubState::new(
        sessions,
        chunks,
        scheduler,
        PocketBaseClient::new(DEAD_POCKETBASE),
    );
    let (ready_tx, ready_rx) = oneshot::channel();
    let config = gateway::GatewayConfig {
        bind_addr: "127.0.0.1:0".parse()?,
        ready_tx: Some(ready_tx),
    };
    tokio::spawn(gateway::run(config, state, shutdown_rx));
    let addr = ready_rx.await?;

    Ok(TestHub {
        addr,
        staging,
        output,
        _shutdown_tx: shutdown_tx,
    })
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .expect("reqwest client")
}

async fn create_session(base: &str, host: &str) -> serde_json::Value {
    let resp = client()
        .post(format!("{base}/sessions"))
        .json(&serde_json::json!({
            "title": "launch stream",
            "description": "",
            "host_user_id": host,
        }))
        .send()
        .await
        .expect("create session");
    assert_eq!(StatusCode::CREATED, resp.status());
    resp.json().await.expect("session body")
}

async fn start_session(base: &str, session_id: &str, user: &str) -> reqwest::Response {
    client()
        .post(format!("{base}/sessions/{session_id}/start"))
        .json(&serde_json::json!({ "user_id": user }))
        .send()
        .await
        .expect("start request")
}

async fn end_session(base: &str, session_id: &str, user: &str) -> serde_json::Value {
    let resp = client()
        .post(format!("{base}/sessions/{session_id}/end"))
        .json(&serde_json::json!({ "user_id": user }))
        .send()
        .await
        .expect("end request");
    assert_eq!(StatusCode::OK, resp.status());
    resp.json().await.expect("end body")
}

async fn connect(hub: &TestHub, session_id: &str, user: &str) -> WsClient {
    let (socket, _) = connect_async(hub.ws_url(session_id, user))
        .await
        .expect("ws connect");
    socket
}

async fn recv_event(socket: &mut WsClient) -> serde_json::Value {
    let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed")
        .expect("socket error");
    match frame {
        Message::Text(text) => serde_json::from_str(&text).expect("json frame"),
        other => panic!("unexpected frame: {other:?}"),
    }
}

async fn send_json(socket: &mut WsClient, value: serde_json::Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("ws send");
}

// Joins land on the server as part of the upgrade task; give it a beat
// before the first broadcast so no frame is sent into an empty group.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn http_endpoints_work() -> Result<(), BoxError> {
    let hub = spawn_hub().await?;
    let base = hub.base();
    let client = client();

    let health = client.get(format!("{base}/healthz")).send().await?;
    assert_eq!(StatusCode::OK, health.status());

    let version_resp = client.get(format!("{base}/version")).send().await?;
    assert_eq!(StatusCode::OK, version_resp.status());
    let version_body: serde_json::Value = version_resp.json().await?;
    assert_eq!("gateway", version_body["name"]);

    let metrics_resp = client.get(format!("{base}/metrics")).send().await?;
    assert_eq!(StatusCode::OK, metrics_resp.status());
    let metrics_text = metrics_resp.text().await?;
    assert!(metrics_text.contains("gateway_http_requests_total"));

    Ok(())
}

#[tokio::test]
async fn session_lifecycle_over_http() -> Result<(), BoxError> {
    let hub = spawn_hub().await?;
    let base = hub.base();

    let session = create_session(&base, "host").await;
    let session_id = session["id"].as_str().expect("session id").to_string();
    assert_eq!("created", session["state"]);

    // Only the host may move the lifecycle forward.
    let forbidden = start_session(&base, &session_id, "impostor").await;
    assert_eq!(StatusCode::FORBIDDEN, forbidden.status());

    let live = start_session(&base, &session_id, "host").await;
    assert_eq!(StatusCode::OK, live.status());
    let live_body: serde_json::Value = live.json().await?;
    assert_eq!("live", live_body["state"]);

    let again = start_session(&base, &session_id, "host").await;
    assert_eq!(StatusCode::CONFLICT, again.status());

    let ended = end_session(&base, &session_id, "host").await;
    assert_eq!(true, ended["assembly_scheduled"]);

    // A second end is a no-op and must not schedule another job.
    let ended_again = end_session(&base, &session_id, "host").await;
    assert_eq!(false, ended_again["assembly_scheduled"]);

    let missing = start_session(&base, "no-such-session", "host").await;
    assert_eq!(StatusCode::NOT_FOUND, missing.status());

    Ok(())
}

#[tokio::test]
async fn ws_upgrade_requires_a_known_session() -> Result<(), BoxError> {
    let hub = spawn_hub().await?;
    assert!(connect_async(hub.ws_url("no-such-session", "alice"))
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn offer_reaches_the_other_endpoint_but_not_the_sender() -> Result<(), BoxError> {
    let hub = spawn_hub().await?;
    let base = hub.base();

    let session = create_session(&base, "host").await;
    let session_id = session["id"].as_str().expect("session id").to_string();
    start_session(&base, &session_id, "host").await;

    let mut host = connect(&hub, &session_id, "host").await;
    let mut viewer = connect(&hub, &session_id, "viewer").await;
    settle().await;

    send_json(
        &mut host,
        serde_json::json!({ "type": "offer", "data": { "sdp": "v=0" } }),
    )
    .await;

    let relayed = recv_event(&mut viewer).await;
    assert_eq!("offer", relayed["type"]);
    assert_eq!("v=0", relayed["data"]["sdp"]);

    // The sender gets no echo: the next frame the host sees is the chat
    // the viewer sends afterwards, not its own offer.
    send_json(
        &mut viewer,
        serde_json::json!({ "type": "chat", "username": "viewer", "message": "hi" }),
    )
    .await;
    let next_on_host = recv_event(&mut host).await;
    assert_eq!("chat", next_on_host["type"]);

    Ok(())
}

#[tokio::test]
async fn chat_fans_out_to_everyone_with_a_timestamp() -> Result<(), BoxError> {
    let hub = spawn_hub().await?;
    let base = hub.base();

    let session = create_session(&base, "host").await;
    let session_id = session["id"].as_str().expect("session id").to_string();
    start_session(&base, &session_id, "host").await;

    let mut host = connect(&hub, &session_id, "host").await;
    let mut viewer = connect(&hub, &session_id, "viewer").await;
    settle().await;

    send_json(
        &mut host,
        serde_json::json!({ "type": "chat", "username": "host", "message": "welcome" }),
    )
    .await;

    for socket in [&mut host, &mut viewer] {
        let event = recv_event(socket).await;
        assert_eq!("chat", event["type"]);
        assert_eq!("welcome", event["message"]);
        assert!(!event["timestamp"].as_str().unwrap_or_default().is_empty());
    }

    Ok(())
}

#[tokio::test]
async fn poll_lifecycle_over_the_socket() -> Result<(), BoxError> {
    let hub = spawn_hub().await?;
    let base = hub.base();

    let session = create_session(&base, "host").await;
    let session_id = session["id"].as_str().expect("session id").to_string();
    start_session(&base, &session_id, "host").await;

    let mut host = connect(&hub, &session_id, "host").await;
    let mut viewer = connect(&hub, &session_id, "viewer").await;
    settle().await;

    send_json(
        &mut host,
        serde_json::json!({
            "type": "poll_start",
            "question": "favorite color?",
            "options": ["red", "blue"],
        }),
    )
    .await;

    let started = recv_event(&mut viewer).await;
    assert_eq!("poll_start", started["type"]);
    let poll_id = started["poll_id"].as_str().expect("poll id").to_string();
    let started_on_host = recv_event(&mut host).await;
    assert_eq!("poll_start", started_on_host["type"]);

    send_json(
        &mut viewer,
        serde_json::json!({ "type": "poll_vote", "poll_id": poll_id, "option": 1 }),
    )
    .await;

    let update = recv_event(&mut host).await;
    assert_eq!("poll_update", update["type"]);
    assert_eq!(0, update["results"][0]["votes"]);
    assert_eq!(1, update["results"][1]["votes"]);
    assert_eq!(100, update["results"][1]["percentage"]);
    let update_on_viewer = recv_event(&mut viewer).await;
    assert_eq!("poll_update", update_on_viewer["type"]);

    // Ending someone else's poll fails, and only the offender hears it.
    send_json(
        &mut viewer,
        serde_json::json!({ "type": "poll_end", "poll_id": poll_id }),
    )
    .await;
    let rejection = recv_event(&mut viewer).await;
    assert_eq!("error", rejection["type"]);
    assert_eq!("unauthorized", rejection["code"]);

    send_json(
        &mut host,
        serde_json::json!({ "type": "poll_end", "poll_id": poll_id }),
    )
    .await;
    let ended = recv_event(&mut viewer).await;
    assert_eq!("poll_end", ended["type"]);

    Ok(())
}

#[tokio::test]
async fn recording_pipeline_runs_end_to_end() -> Result<(), BoxError> {
    let hub = spawn_hub().await?;
    let base = hub.base();
    let client = client();

    let session = create_session(&base, "host").await;
    let session_id = session["id"].as_str().expect("session id").to_string();
    start_session(&base, &session_id, "host").await;

    for (index, payload) in [(0u64, "AA"), (1, "BB"), (2, "CC")] {
        let resp = client
            .post(format!("{base}/sessions/{session_id}/chunks/{index}"))
            .body(payload.as_bytes().to_vec())
            .send()
            .await?;
        assert_eq!(StatusCode::NO_CONTENT, resp.status());
    }

    let ended = end_session(&base, &session_id, "host").await;
    assert_eq!(true, ended["assembly_scheduled"]);

    // Assembly runs in the background; poll the session until it lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let recorded = loop {
        let body: serde_json::Value = client
            .get(format!("{base}/sessions/{session_id}"))
            .send()
            .await?
            .json()
            .await?;
        if body["state"] == "recorded" {
            break body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never reached recorded: {body}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let recording_path = recorded["recording_path"].as_str().expect("recording path");
    assert!(recording_path.ends_with(&format!("{session_id}.webm")));
    let merged = tokio::fs::read(hub.output.path().join(format!("{session_id}.webm"))).await?;
    assert_eq!(b"AABBCC".to_vec(), merged);

    // Staging is cleaned up once the recording exists.
    assert!(!hub.staging.path().join(&session_id).exists());

    Ok(())
}

#[tokio::test]
async fn chunk_upload_requires_a_known_session() -> Result<(), BoxError> {
    let hub = spawn_hub().await?;
    let resp = client()
        .post(format!("{}/sessions/ghost/chunks/0", hub.base()))
        .body(b"AA".to_vec())
        .send()
        .await?;
    assert_eq!(StatusCode::NOT_FOUND, resp.status());
    Ok(())
}
