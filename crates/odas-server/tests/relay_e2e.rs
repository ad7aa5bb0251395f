//! End-to-end: producer sockets in, WebSocket envelopes out.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use odas_core::Category;
use odas_server::{start, RelayConfig, ServerHandle};
use odas_telemetry::{names, MetricsRecorder};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SST_FRAME_1: &str = "{\n    \"timeStamp\": 1,\n    \"src\": [\n        { \"id\": 7, \"tag\": \"dynamic\", \"x\": 0.5, \"y\": 0.5, \"z\": 0.7, \"activity\": 0.9 }\n    ]\n}\n";
const SST_FRAME_2: &str = "{\n    \"timeStamp\": 2,\n    \"src\": [\n        { \"id\": 7, \"tag\": \"dynamic\", \"x\": 0.4, \"y\": 0.6, \"z\": 0.7, \"activity\": 0.8 }\n    ]\n}\n";
const SSL_FRAME_1: &str = "{\n    \"timeStamp\": 1,\n    \"src\": [\n        { \"x\": 0.1, \"y\": 0.2, \"z\": 0.9, \"E\": 0.3 }\n    ]\n}\n";

async fn start_relay() -> (ServerHandle, Arc<MetricsRecorder>) {
    let metrics = Arc::new(MetricsRecorder::new());
    let config = RelayConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        http_port: 0,
        tracking_port: 0,
        potential_port: 0,
        ..Default::default()
    };
    let handle = start(config, Arc::clone(&metrics)).await.unwrap();
    (handle, metrics)
}

async fn subscribe(handle: &ServerHandle) -> Ws {
    let before = handle.hub().count();
    let url = format!("ws://127.0.0.1:{}/", handle.http_port);
    let (ws, _) = connect_async(url.as_str()).await.unwrap();

    // Registration happens after the upgrade completes on the server side.
    wait_for(|| handle.hub().count() > before).await;
    ws
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_envelope(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("websocket closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn producer(handle: &ServerHandle, category: Category) -> TcpStream {
    TcpStream::connect(("127.0.0.1", handle.upstream_port(category)))
        .await
        .unwrap()
}

#[tokio::test]
async fn tracking_stream_reaches_browser() {
    let (handle, _) = start_relay().await;
    let mut ws = subscribe(&handle).await;

    let mut sst = producer(&handle, Category::Tracking).await;
    assert_eq!(
        next_envelope(&mut ws).await,
        json!({"type": "status", "data": {"tracking": true}})
    );

    // Split the first frame mid-token to exercise reassembly.
    let (head, tail) = SST_FRAME_1.split_at(20);
    sst.write_all(head.as_bytes()).await.unwrap();
    sst.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    sst.write_all(tail.as_bytes()).await.unwrap();
    sst.write_all(SST_FRAME_2.as_bytes()).await.unwrap();

    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], "tracking");
    assert_eq!(envelope["data"]["timeStamp"], 1);
    assert_eq!(envelope["data"]["src"][0]["id"], 7);

    drop(sst);
    assert_eq!(
        next_envelope(&mut ws).await,
        json!({"type": "status", "data": {"tracking": false}})
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn categories_are_tagged_independently() {
    let (handle, _) = start_relay().await;
    let mut ws = subscribe(&handle).await;

    let mut ssl = producer(&handle, Category::Potential).await;
    assert_eq!(
        next_envelope(&mut ws).await,
        json!({"type": "status", "data": {"potential": true}})
    );

    ssl.write_all(SSL_FRAME_1.as_bytes()).await.unwrap();
    ssl.write_all(b"{\n    \"timeStamp\": 2,\n    \"src\": []\n}\n").await.unwrap();

    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], "potential");
    assert_eq!(envelope["data"]["src"][0]["E"], 0.3);

    handle.shutdown().await;
}

#[tokio::test]
async fn every_subscriber_receives_and_one_leaving_does_not_matter() {
    let (handle, metrics) = start_relay().await;
    let mut first = subscribe(&handle).await;
    let mut second = subscribe(&handle).await;

    let mut sst = producer(&handle, Category::Tracking).await;
    for ws in [&mut first, &mut second] {
        assert_eq!(next_envelope(ws).await["data"]["tracking"], true);
    }

    first.close(None).await.unwrap();
    wait_for(|| handle.hub().count() == 1).await;

    sst.write_all(SST_FRAME_1.as_bytes()).await.unwrap();
    sst.write_all(SST_FRAME_2.as_bytes()).await.unwrap();

    let envelope = next_envelope(&mut second).await;
    assert_eq!(envelope["type"], "tracking");
    assert_eq!(envelope["data"]["timeStamp"], 1);
    assert_eq!(metrics.gauge_get(names::SUBSCRIBERS_ACTIVE, &[]), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn late_subscriber_misses_earlier_frames() {
    let (handle, _) = start_relay().await;
    let mut early = subscribe(&handle).await;

    let mut sst = producer(&handle, Category::Tracking).await;
    assert_eq!(next_envelope(&mut early).await["type"], "status");
    sst.write_all(SST_FRAME_1.as_bytes()).await.unwrap();
    sst.write_all(SST_FRAME_2.as_bytes()).await.unwrap();
    assert_eq!(next_envelope(&mut early).await["data"]["timeStamp"], 1);

    let mut late = subscribe(&handle).await;
    sst.write_all(b"{\n    \"timeStamp\": 3,\n    \"src\": []\n}\n").await.unwrap();

    let envelope = next_envelope(&mut late).await;
    assert_eq!(envelope["type"], "tracking");
    assert_eq!(envelope["data"]["timeStamp"], 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn health_reports_upstream_state() {
    let (handle, _) = start_relay().await;
    let _sst = producer(&handle, Category::Tracking).await;

    let url = format!("http://127.0.0.1:{}/health", handle.http_port);
    let mut body = Value::Null;
    for _ in 0..100 {
        body = reqwest::get(&url).await.unwrap().json().await.unwrap();
        if body["upstream"]["tracking"] == true {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(body["upstream"]["tracking"], true);
    assert_eq!(body["upstream"]["potential"], false);

    handle.shutdown().await;
}

#[tokio::test]
async fn browser_messages_are_ignored() {
    let (handle, _) = start_relay().await;
    let mut ws = subscribe(&handle).await;

    ws.send(Message::Text("hello relay".into())).await.unwrap();

    let _sst = producer(&handle, Category::Tracking).await;
    assert_eq!(
        next_envelope(&mut ws).await,
        json!({"type": "status", "data": {"tracking": true}})
    );
    assert_eq!(handle.hub().count(), 1);

    handle.shutdown().await;
}
