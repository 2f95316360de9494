//! End-to-end plugin scenarios over a real WebSocket connection to the
//! server role.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use examiner_core::{Plugin, PluginConnection, Responder};
use examiner_server::ServerConnectionManager;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Deserialize)]
struct DisplayMessage {
    message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ticker {
    symbol: String,
    price: f64,
    tags: Vec<String>,
}

/// The canonical example plugin: greets back whatever it is shown.
#[derive(Default)]
struct ExamplePlugin {
    connection: Mutex<Option<Arc<PluginConnection>>>,
    disconnects: AtomicUsize,
}

impl Plugin for ExamplePlugin {
    fn identifier(&self) -> &str {
        "Example"
    }

    fn on_connect(&self, connection: Arc<PluginConnection>) {
        connection.receive("displayMessage", |params: DisplayMessage, responder: Responder| {
            let greeting = format!("Hello from app! I received params: {}", params.message);
            let _ = responder.success(&json!({ "greeting": greeting }));
        });
        *self.connection.lock().unwrap() = Some(connection);
    }

    fn on_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connection.lock().unwrap().take();
    }
}

struct Quiet(String, bool);

impl Plugin for Quiet {
    fn identifier(&self) -> &str {
        &self.0
    }

    fn on_connect(&self, _connection: Arc<PluginConnection>) {}

    fn on_disconnect(&self) {}

    fn runs_in_background(&self) -> bool {
        self.1
    }
}

async fn start(manager: &ServerConnectionManager) -> Ws {
    init_tracing();
    let addr: SocketAddr = manager
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> Value {
    let next = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str::<Value>(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    });
    next.await.expect("no reply within 5s")
}

#[tokio::test]
async fn init_then_execute_returns_greeting() {
    let manager = ServerConnectionManager::new();
    manager.add_plugin(Arc::new(ExamplePlugin::default()));
    let mut ws = start(&manager).await;

    send(&mut ws, json!({"method": "init", "params": {"plugin": "Example"}})).await;
    send(
        &mut ws,
        json!({
            "method": "execute",
            "id": 7,
            "params": {"api": "Example", "method": "displayMessage", "params": {"message": "hi"}}
        }),
    )
    .await;

    // init is a notification: the first frame back answers execute.
    assert_eq!(
        recv(&mut ws).await,
        json!({"success": {"greeting": "Hello from app! I received params: hi"}, "id": 7})
    );
}

#[tokio::test]
async fn plugin_listings_follow_registration_order() {
    let manager = ServerConnectionManager::new();
    manager.add_plugin(Arc::new(Quiet("Network".into(), true)));
    manager.add_plugin(Arc::new(ExamplePlugin::default()));
    manager.add_plugin(Arc::new(Quiet("Preferences".into(), true)));
    let mut ws = start(&manager).await;

    send(&mut ws, json!({"method": "getPlugins", "id": 1})).await;
    assert_eq!(
        recv(&mut ws).await,
        json!({"success": {"plugins": ["Network", "Example", "Preferences"]}, "id": 1})
    );

    send(&mut ws, json!({"method": "getBackgroundPlugins", "id": 2})).await;
    assert_eq!(
        recv(&mut ws).await,
        json!({"success": {"plugins": ["Network", "Preferences"]}, "id": 2})
    );
}

#[tokio::test]
async fn errors_are_answered_and_connection_survives() {
    let manager = ServerConnectionManager::new();
    manager.add_plugin(Arc::new(ExamplePlugin::default()));
    let mut ws = start(&manager).await;

    // Dropped without a reply.
    ws.send(Message::text("{not json")).await.unwrap();
    send(&mut ws, json!({"method": "teleport", "id": 3})).await;

    send(
        &mut ws,
        json!({"method": "execute", "id": 4, "params": {"api": "Missing", "method": "x"}}),
    )
    .await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["id"], 4);
    assert_eq!(reply["error"]["name"], "PluginNotFound");

    send(&mut ws, json!({"method": "init", "params": {"plugin": "Example"}})).await;
    send(
        &mut ws,
        json!({
            "method": "execute",
            "id": 5,
            "params": {"api": "Example", "method": "displayMessage", "params": {"wrong": 1}}
        }),
    )
    .await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply["id"], 5);
    assert_eq!(reply["error"]["name"], "ParamsMismatch");

    send(
        &mut ws,
        json!({"method": "isMethodSupported", "id": 6, "params": {"api": "Example", "method": "displayMessage"}}),
    )
    .await;
    assert_eq!(
        recv(&mut ws).await,
        json!({"success": {"isSupported": true}, "id": 6})
    );
}

#[tokio::test]
async fn plugin_notifications_reach_the_desktop_intact() {
    let manager = ServerConnectionManager::new();
    let example = Arc::new(ExamplePlugin::default());
    manager.add_plugin(example.clone());
    let mut ws = start(&manager).await;

    send(&mut ws, json!({"method": "init", "params": {"plugin": "Example"}})).await;
    let connection = loop {
        if let Some(connection) = example.connection.lock().unwrap().clone() {
            break connection;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let original = Ticker {
        symbol: "ACME".into(),
        price: 12.5,
        tags: vec!["a".into(), "b \"quoted\"".into()],
    };
    connection.send("tick", &original).unwrap();

    let frame = recv(&mut ws).await;
    assert_eq!(frame["method"], "execute");
    assert_eq!(frame["params"]["api"], "Example");
    assert_eq!(frame["params"]["method"], "tick");
    assert!(frame.get("id").is_none());
    let decoded: Ticker = serde_json::from_value(frame["params"]["params"].clone()).unwrap();
    assert_eq!(decoded, original);
}

#[tokio::test]
async fn deinit_disconnects_plugin() {
    let manager = ServerConnectionManager::new();
    let example = Arc::new(ExamplePlugin::default());
    manager.add_plugin(example.clone());
    let mut ws = start(&manager).await;

    send(&mut ws, json!({"method": "init", "params": {"plugin": "Example"}})).await;
    send(&mut ws, json!({"method": "deinit", "params": {"plugin": "Example"}})).await;
    send(
        &mut ws,
        json!({
            "method": "execute",
            "id": 9,
            "params": {"api": "Example", "method": "displayMessage", "params": {"message": "late"}}
        }),
    )
    .await;

    let reply = recv(&mut ws).await;
    assert_eq!(reply["id"], 9);
    assert!(reply.get("success").is_none());
    assert_eq!(example.disconnects.load(Ordering::SeqCst), 1);
    assert!(manager.dispatcher().connected_plugins().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_while_serving() {
    let manager = Arc::new(ServerConnectionManager::new());
    manager.add_plugin(Arc::new(ExamplePlugin::default()));
    let mut ws = start(&manager).await;

    let registrars: Vec<_> = (0..4)
        .map(|t| {
            let manager = manager.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    manager.add_plugin(Arc::new(Quiet(format!("p{t}-{i}"), i % 2 == 0)));
                }
            })
        })
        .collect();

    send(&mut ws, json!({"method": "init", "params": {"plugin": "Example"}})).await;
    for id in 0..50 {
        send(
            &mut ws,
            json!({
                "method": "execute",
                "id": id,
                "params": {"api": "Example", "method": "displayMessage", "params": {"message": id.to_string()}}
            }),
        )
        .await;
        let reply = recv(&mut ws).await;
        assert_eq!(reply["id"], id);
        assert!(reply["success"]["greeting"].is_string());
    }

    for registrar in registrars {
        registrar.join().unwrap();
    }

    send(&mut ws, json!({"method": "getPlugins", "id": 100})).await;
    let reply = recv(&mut ws).await;
    let plugins: Vec<String> = serde_json::from_value(reply["success"]["plugins"].clone()).unwrap();
    assert_eq!(plugins.len(), 401);
    assert_eq!(plugins[0], "Example");
    let mut unique = plugins.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 401, "no duplicated entries");
    for t in 0..4 {
        let own: Vec<_> = plugins
            .iter()
            .filter(|p| p.starts_with(&format!("p{t}-")))
            .collect();
        let expected: Vec<String> = (0..100).map(|i| format!("p{t}-{i}")).collect();
        assert_eq!(own, expected.iter().collect::<Vec<_>>(), "per-thread order kept");
    }

    manager.stop();
}
