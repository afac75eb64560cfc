//! Web terminal over real sockets with a `/bin/sh` agent behind it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentdeck_app::share::TerminalShare;
use agentdeck_app::webterm::{WebConfig, WebTerminal, CLOSE_DISCONNECTED};
use agentdeck_pty::{ProcessProxy, WindowSize};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ECHO_AGENT: &str = "while IFS= read -r line; do printf 'agent:%s\\n' \"$line\"; done";

fn local_config(user: Option<&str>, pass: Option<&str>) -> WebConfig {
    WebConfig {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        user: user.map(String::from),
        pass: pass.map(String::from),
    }
}

fn echo_proxy() -> Arc<ProcessProxy> {
    let proxy = Arc::new(ProcessProxy::new(
        "/bin/sh",
        vec!["-c".into(), ECHO_AGENT.into()],
    ));
    proxy.start(WindowSize::default()).unwrap();
    proxy
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

async fn next_text(socket: &mut Socket) -> String {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return text;
        }
    }
}

async fn wait_for_clients(web: &WebTerminal, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while web.list_clients().len() != count {
        assert!(Instant::now() < deadline, "client count never reached {count}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn raw_get(addr: SocketAddr, path: &str, auth: Option<&str>) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    if let Some(auth) = auth {
        request.push_str(&format!("Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_output_and_input_round_trip() {
    let proxy = echo_proxy();
    let web = WebTerminal::bind(local_config(None, None), "Echo", Some(proxy.clone()))
        .await
        .unwrap();
    let mut socket = connect(web.local_addr()).await;

    assert_eq!(next_text(&mut socket).await, r#"{"type":"agent","name":"Echo"}"#);
    wait_for_clients(&web, 1).await;

    socket
        .send(Message::Binary(b"from-browser\n".to_vec()))
        .await
        .unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !String::from_utf8_lossy(&seen).contains("agent:from-browser") {
        assert!(Instant::now() < deadline, "got {:?}", String::from_utf8_lossy(&seen));
        if let Ok(Some(Ok(Message::Binary(data)))) =
            tokio::time::timeout(Duration::from_millis(500), socket.next()).await
        {
            seen.extend_from_slice(&data);
        }
    }

    web.stop().unwrap();
    tokio::task::spawn_blocking(move || proxy.stop()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_sends_reason_and_close_code() {
    let web = WebTerminal::bind(local_config(None, None), "Echo", None)
        .await
        .unwrap();
    let mut socket = connect(web.local_addr()).await;
    next_text(&mut socket).await;
    wait_for_clients(&web, 1).await;

    let clients = web.list_clients();
    assert_eq!(clients[0].id, "client-1");
    assert!(clients[0].addr.starts_with("127.0.0.1:"));
    web.disconnect_client("client-1").unwrap();

    assert_eq!(
        next_text(&mut socket).await,
        r#"{"type":"disconnect","reason":"Disconnected by server"}"#
    );
    let close = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match close {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), CLOSE_DISCONNECTED);
            assert_eq!(frame.reason, "Disconnected by server");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    assert!(web.list_clients().is_empty());
    assert!(web.disconnect_client("client-1").is_err());
    web.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_switch_notifies_clients() {
    let web = WebTerminal::bind(local_config(None, None), "Echo", None)
        .await
        .unwrap();
    let mut socket = connect(web.local_addr()).await;
    next_text(&mut socket).await;
    wait_for_clients(&web, 1).await;

    web.set_agent_name("Codex");
    web.broadcast_reset();
    assert_eq!(next_text(&mut socket).await, r#"{"type":"agent","name":"Codex"}"#);
    assert_eq!(next_text(&mut socket).await, r#"{"type":"reset"}"#);

    // Resize requests are accepted and ignored.
    socket
        .send(Message::Text(r#"{"type":"resize","cols":100,"rows":40}"#.into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(web.list_clients().len(), 1);

    web.stop().unwrap();
    let text = next_text(&mut socket).await;
    assert!(text.contains("Server shutting down"), "{text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_basic_auth_guards_ws_but_not_health() {
    let web = WebTerminal::bind(local_config(Some("me"), Some("pw")), "Echo", None)
        .await
        .unwrap();
    let addr = web.local_addr();

    let denied = raw_get(addr, "/ws", None).await;
    assert!(denied.starts_with("HTTP/1.1 401"), "{denied}");
    assert!(denied.to_lowercase().contains("www-authenticate: basic"));

    let health = raw_get(addr, "/health", None).await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");
    assert!(health.contains(r#""status":"ok""#));

    let auth = format!("Basic {}", STANDARD.encode("me:pw"));
    let page = raw_get(addr, "/", Some(&auth)).await;
    assert!(page.starts_with("HTTP/1.1 200"), "{page}");

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", HeaderValue::from_str(&auth).unwrap());
    let (mut socket, _) = connect_async(request).await.unwrap();
    assert_eq!(next_text(&mut socket).await, r#"{"type":"agent","name":"Echo"}"#);

    web.stop().unwrap();
}

#[tokio::test]
async fn test_port_fallback() {
    let taken = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let port = taken.local_addr().unwrap().port();
    let config = WebConfig {
        port,
        ..local_config(None, None)
    };
    match WebTerminal::bind(config, "Echo", None).await {
        Ok(web) => {
            let bound = web.local_addr().port();
            assert!(bound > port && bound <= port.saturating_add(10), "bound {bound}");
            web.stop().unwrap();
        }
        // Every fallback can be busy on a crowded host; binding must then fail cleanly.
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse),
    }
}
