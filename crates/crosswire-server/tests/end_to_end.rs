//! A server and real clients on an in-memory Ethernet segment.

use std::sync::Arc;
use std::time::Duration;

use crosswire_client::admin::AdminClient;
use crosswire_client::{ChannelClient, ClientConfig, ClientError, Incoming};
use crosswire_server::api::{build_router, AppState};
use crosswire_server::{Server, ServerConfig};
use crosswire_shared::protocol::Message;
use crosswire_shared::types::{TransportMode, UserStatus};
use crosswire_shared::Identity;
use crosswire_store::Database;
use crosswire_transport::raw::{MemoryHub, RawTransport};
use crosswire_transport::{MacAddr, Transport, TransportConfig};

const CHANNEL: &str = "e2e-channel";
const PASSWORD: &str = "open sesame";
const TOKEN: &str = "admin-token";
const WAIT: Duration = Duration::from_secs(5);

fn raw(hub: &MemoryHub, last: u8) -> Arc<RawTransport> {
    let link = hub.attach(MacAddr([2, 0, 0, 0, 0, last]));
    let config = TransportConfig {
        mode: TransportMode::Arp,
        ..TransportConfig::default()
    };
    Arc::new(RawTransport::new(config, Arc::new(link)))
}

async fn start_server(hub: &MemoryHub) -> Arc<Server> {
    let config = ServerConfig {
        channel_id: CHANNEL.into(),
        channel_name: "end to end".into(),
        channel_password: PASSWORD.into(),
        max_members: 2,
        transport_mode: TransportMode::Arp,
        admin_token: Some(TOKEN.into()),
        ..ServerConfig::default()
    };
    let db = Arc::new(Database::open_in_memory().unwrap());
    let server = Server::new(config, db, raw(hub, 0xfe)).await.unwrap();
    server.start().await.unwrap();
    server
}

async fn client(hub: &MemoryHub, last: u8, nickname: &str, password: &str) -> ChannelClient {
    let transport = raw(hub, last);
    transport.start().await.unwrap();
    let mut config = ClientConfig::new(CHANNEL, password, nickname);
    config.response_timeout = WAIT;
    ChannelClient::new(config, Identity::generate(), transport)
        .await
        .unwrap()
}

async fn recv_text(client: &ChannelClient, text: &str) -> Message {
    loop {
        let msg = client.recv_message(WAIT).await.unwrap();
        if msg.text_body() == Some(text) {
            return msg;
        }
    }
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn test_join_send_and_verify() {
    let hub = MemoryHub::new();
    let server = start_server(&hub).await;

    let alice = client(&hub, 1, "alice", PASSWORD).await;
    let joined = alice.join().await.unwrap();
    assert!(joined.success);
    assert_eq!(alice.server_public_key().unwrap(), server.public_key().to_vec());
    let alice_id = alice.member_id().unwrap();

    // Persisted before it is broadcast, so a later sync must see it.
    let sent = alice.send_text("hello").await.unwrap();
    let echoed = recv_text(&alice, "hello").await;
    assert_eq!(echoed.id, sent.id);

    let bob = client(&hub, 2, "bob", PASSWORD).await;
    bob.join().await.unwrap();
    assert!(bob.members().iter().any(|m| m.id == alice_id));

    let request_id = bob.request_sync(None).await.unwrap();
    let sync = loop {
        if let Incoming::Sync(sync) = bob.recv(WAIT).await.unwrap() {
            break sync;
        }
    };
    assert_eq!(sync.request_id.as_deref(), Some(request_id.as_str()));
    assert!(sync.messages.iter().any(|m| m.id == sent.id));
    assert!(!sync.has_more);

    alice.send_text("hi bob").await.unwrap();
    let got = recv_text(&bob, "hi bob").await;
    assert_eq!(got.original_sender_id.as_deref(), Some(alice_id.as_str()));
    assert_eq!(got.sender_nickname, "alice");
    assert_eq!(got.channel_id, CHANNEL);

    server.shutdown().await;
}

#[tokio::test]
async fn test_full_channel_and_wrong_password() {
    let hub = MemoryHub::new();
    let server = start_server(&hub).await;

    let alice = client(&hub, 1, "alice", PASSWORD).await;
    alice.join().await.unwrap();
    let bob = client(&hub, 2, "bob", PASSWORD).await;
    bob.join().await.unwrap();

    let carol = client(&hub, 3, "carol", PASSWORD).await;
    match carol.join().await {
        Err(ClientError::Rejected(reason)) => assert_eq!(reason, "channel is full"),
        other => panic!("expected a full channel, got {other:?}"),
    }

    let mallory = client(&hub, 4, "mallory", "guess").await;
    assert!(matches!(mallory.join().await, Err(ClientError::Crypto(_))));
    assert_eq!(server.channel().total_count().await, 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_moderation_over_admin_api() {
    let hub = MemoryHub::new();
    let server = start_server(&hub).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState {
        server: server.clone(),
    });
    tokio::spawn(async move { axum::serve(listener, app).await });
    let admin = AdminClient::new(&format!("http://{addr}"), Some(TOKEN.into())).unwrap();
    assert_eq!(admin.health().await.unwrap().channel_id, CHANNEL);

    let alice = client(&hub, 1, "alice", PASSWORD).await;
    alice.join().await.unwrap();
    let bob = client(&hub, 2, "bob", PASSWORD).await;
    bob.join().await.unwrap();
    let alice_id = alice.member_id().unwrap();

    let members = admin.members().await.unwrap();
    assert_eq!(members.len(), 2);

    admin.mute(&alice_id, None, "cool off").await.unwrap();
    alice.send_text("still talking").await.unwrap();
    wait_for(|| {
        let server = server.clone();
        async move { server.stats().await.router.rejected >= 1 }
    })
    .await;

    admin.unmute(&alice_id).await.unwrap();
    alice.send_text("sorry").await.unwrap();
    loop {
        let msg = bob.recv_message(WAIT).await.unwrap();
        assert_ne!(msg.text_body(), Some("still talking"));
        if msg.text_body() == Some("sorry") {
            break;
        }
    }

    let anonymous = AdminClient::new(&format!("http://{addr}"), None).unwrap();
    let err = anonymous.kick(&alice_id, "bye").await.unwrap_err();
    assert!(err.is_forbidden());

    bob.leave().await.unwrap();
    let bob_id = members
        .iter()
        .map(|m| m.info.id.clone())
        .find(|id| *id != alice_id)
        .unwrap();
    wait_for(|| {
        let server = server.clone();
        let bob_id = bob_id.clone();
        async move {
            server
                .channel()
                .get_member(&bob_id)
                .await
                .is_ok_and(|m| m.status == UserStatus::Offline)
        }
    })
    .await;

    admin.kick(&alice_id, "bye").await.unwrap();
    assert!(!server.channel().has_member(&alice_id).await);

    server.shutdown().await;
}
