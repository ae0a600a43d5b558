//! Shared harness: a real gateway on an ephemeral port plus a small
//! WebSocket client that speaks the frame protocol.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tempfile::TempDir,
    tokio::net::TcpStream,
    tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message},
};

use {
    clawgate_config::GatewayConfig,
    clawgate_gateway::{
        GatewayServices, GatewayState, build_gateway_app, methods::MethodRegistry,
    },
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: Arc<GatewayState>,
    _state_dir: TempDir,
}

impl TestGateway {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Connect an operator with admin rights.
    pub async fn operator(&self) -> WsClient {
        let mut client = WsClient::connect(&self.ws_url()).await;
        let res = client.handshake(json!({})).await;
        assert_eq!(res["ok"], true, "{res}");
        client
    }

    /// Connect a bridge node with the given client id.
    pub async fn node(&self, node_id: &str) -> WsClient {
        let mut client = WsClient::connect(&self.ws_url()).await;
        let res = client
            .handshake(json!({
                "role": "node",
                "client": {"id": node_id, "version": "1.0", "platform": "macos"},
            }))
            .await;
        assert_eq!(res["ok"], true, "{res}");
        client
    }
}

pub async fn start() -> TestGateway {
    start_with(GatewayConfig::default(), GatewayServices::noop()).await
}

pub async fn start_with(mut config: GatewayConfig, services: GatewayServices) -> TestGateway {
    let state_dir = tempfile::tempdir().unwrap();
    config.gateway.state_dir = Some(state_dir.path().to_path_buf());

    let state = GatewayState::new(config, services);
    let methods = Arc::new(MethodRegistry::new());
    let app = build_gateway_app(Arc::clone(&state), methods);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestGateway {
        addr,
        state,
        _state_dir: state_dir,
    }
}

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Frames read while waiting for something else.
    backlog: VecDeque<Value>,
    next_id: u64,
}

impl WsClient {
    pub async fn connect(url: &str) -> Self {
        let (stream, _) = connect_async(url).await.unwrap();
        Self {
            stream,
            backlog: VecDeque::new(),
            next_id: 0,
        }
    }

    pub async fn send(&mut self, frame: Value) {
        self.stream
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    /// Next text frame off the wire, skipping the backlog.
    async fn read(&mut self) -> Option<Value> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for a frame")?;
            match msg.ok()? {
                Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Wait for the first frame matching `pred`, buffering everything else.
    pub async fn wait_for(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        if let Some(pos) = self.backlog.iter().position(&pred) {
            return self.backlog.remove(pos).unwrap();
        }
        loop {
            let frame = self.read().await.expect("connection closed");
            if pred(&frame) {
                return frame;
            }
            self.backlog.push_back(frame);
        }
    }

    pub async fn handshake(&mut self, overrides: Value) -> Value {
        let mut frame = json!({
            "type": "connect",
            "id": "hs",
            "client": {"id": "test-client", "version": "0.0.1", "platform": "test"},
        });
        if let (Some(base), Some(extra)) = (frame.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        self.send(frame).await;
        self.wait_for(|f| f["type"] == "res" && f["id"] == "hs").await
    }

    /// Send a request and wait for its response frame.
    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = format!("r{}", self.next_id);
        self.send(json!({"type": "req", "id": id, "method": method, "params": params}))
            .await;
        self.wait_for(|f| f["type"] == "res" && f["id"] == id.as_str())
            .await
    }

    /// Payload of a successful request; panics on an error response.
    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        let res = self.request(method, params).await;
        assert_eq!(res["ok"], true, "{method} failed: {res}");
        res["payload"].clone()
    }

    /// Error code of a failed request.
    pub async fn call_err(&mut self, method: &str, params: Value) -> String {
        let res = self.request(method, params).await;
        assert_eq!(res["ok"], false, "{method} unexpectedly succeeded: {res}");
        res["error"]["code"].as_str().unwrap().to_string()
    }

    pub async fn event(&mut self, name: &str, pred: impl Fn(&Value) -> bool) -> Value {
        self.wait_for(|f| f["type"] == "event" && f["event"] == name && pred(&f["payload"]))
            .await
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
