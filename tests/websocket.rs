use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use xmpp_engine::server::InMemoryAuthenticationService;
use xmpp_engine::XmppServer;

async fn next_text<S>(ws: &mut S) -> String
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = frame {
            return text;
        }
    }
}

#[tokio::test]
async fn test_websocket_open_gets_open_and_features() {
    let server = XmppServer::builder("example.org")
        .bind("127.0.0.1:0")
        .websocket("127.0.0.1:0")
        .authentication(InMemoryAuthenticationService::new().with_user("alice", "secret"))
        .build();
    server.start().await.expect("start");
    let addr = server.websocket_addr().expect("websocket listener");

    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.expect("handshake");
    ws.send(Message::Text(
        "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='example.org' version='1.0'/>"
            .to_string(),
    ))
    .await
    .expect("send open");

    let open = next_text(&mut ws).await;
    assert!(open.starts_with("<open"), "got {open}");
    assert!(open.contains("urn:ietf:params:xml:ns:xmpp-framing"));
    assert!(open.contains("from=\"example.org\"") || open.contains("from='example.org'"));

    let features = next_text(&mut ws).await;
    assert!(features.starts_with("<features"), "got {features}");
    assert!(features.contains("http://etherx.jabber.org/streams"));
    assert!(features.contains("<mechanism>PLAIN</mechanism>"));
    // STARTTLS is never offered over WebSocket.
    assert!(!features.contains("starttls"));
    assert_eq!(server.connection_count(), 1);

    ws.send(Message::Text(
        "<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>".to_string(),
    ))
    .await
    .expect("send close");
    let close = next_text(&mut ws).await;
    assert!(close.starts_with("<close"), "got {close}");

    server.stop().await.expect("stop");
}
