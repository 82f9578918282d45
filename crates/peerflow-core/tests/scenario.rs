//! Two clients, one in-process relay, loopback peer connections.

use bytes::Bytes;
use peerflow_core::{
    ClientConfig, ClientEvent, EntryKind, LocalIdentity, LocalSignaling, Origin, OutgoingFile, PeerClient,
};
use relay_core::{DeviceClass, PeerStatus, RelayConfig, RelayHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use transport_rtc::loopback::{LoopbackFactory, LoopbackNetwork};

struct Node {
    client: PeerClient,
    factory: Arc<LoopbackFactory>,
}

impl Node {
    fn id(&self) -> String {
        self.client.local_id().to_string()
    }
}

fn spawn_node(relay: &RelayHandle, net: &Arc<LoopbackNetwork>, name: &str, config: ClientConfig) -> Node {
    let identity = LocalIdentity::generate(Some(name.to_string()), DeviceClass::Desktop);
    let (link, events) = LocalSignaling::connect(relay, &identity);
    let factory = Arc::new(net.factory(identity.peer_id.clone()));
    let client = PeerClient::new(identity, config, Arc::new(link), factory.clone());
    client.attach(events);
    Node { client, factory }
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<ClientEvent>, pred: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("event did not arrive")
}

async fn connect_pair(a: &Node, b: &Node) {
    let (a_id, b_id) = (a.id(), b.id());
    eventually("peers to see each other", || {
        a.client.status(&b_id) == Some(PeerStatus::Available)
            && b.client.status(&a_id) == Some(PeerStatus::Available)
    })
    .await;

    a.client.connect_to_peer(&b_id).await.unwrap();
    eventually("channel to open", || {
        a.client.status(&b_id) == Some(PeerStatus::Connected)
            && b.client.status(&a_id) == Some(PeerStatus::Connected)
    })
    .await;
}

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

#[tokio::test]
async fn test_register_connect_and_send_file() {
    let (relay, _task) = RelayHandle::spawn(RelayConfig::default());
    let net = LoopbackNetwork::new();
    let a = spawn_node(&relay, &net, "RedLion", ClientConfig::default());
    let b = spawn_node(&relay, &net, "BlueRiver", ClientConfig::default());
    let c = spawn_node(&relay, &net, "CyanHawk", ClientConfig::default());
    let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());

    connect_pair(&a, &b).await;

    // connected only towards each other
    assert_eq!(a.client.status(&c_id), Some(PeerStatus::Available));
    assert_eq!(c.client.status(&a_id), Some(PeerStatus::Available));
    assert_eq!(c.client.status(&b_id), Some(PeerStatus::Available));
    assert!(a.client.peers().iter().all(|p| p.id != a_id));

    let mut b_events = b.client.subscribe();
    let data = pattern(40000);
    let sent = a
        .client
        .send_file(&b_id, OutgoingFile::new("test.bin", "application/octet-stream", data.clone()))
        .await
        .unwrap();
    assert_eq!(sent.size, 40000);

    let ev = next_matching(&mut b_events, |ev| {
        matches!(ev, ClientEvent::Appended { entry, .. } if entry.as_file().is_some())
    })
    .await;
    let ClientEvent::Appended { remote_id, entry } = ev else {
        unreachable!()
    };
    assert_eq!(remote_id, a_id);
    assert_eq!(entry.origin, Origin::Remote);
    let received = entry.as_file().unwrap();
    assert_eq!(received.name, "test.bin");
    assert_eq!(received.size, 40000);
    assert_eq!(received.data, data);
    assert_eq!(received.digest, sent.digest);

    let a_log = a.client.conversation(&b_id);
    assert_eq!(a_log.len(), 1);
    assert_eq!(a_log[0].origin, Origin::Local);

    // text both ways
    b.client.send_message(&a_id, "got it").await.unwrap();
    eventually("reply to arrive", || {
        a.client
            .conversation(&b_id)
            .iter()
            .any(|e| e.kind == EntryKind::Message("got it".into()) && e.origin == Origin::Remote)
    })
    .await;
}

#[tokio::test]
async fn test_transfer_discarded_when_connection_fails() {
    let (relay, _task) = RelayHandle::spawn(RelayConfig::default());
    let net = LoopbackNetwork::new();
    let slow = ClientConfig {
        chunk_pause_ms: 40,
        ..ClientConfig::default()
    };
    let a = spawn_node(&relay, &net, "GreenBear", slow);
    let b = spawn_node(&relay, &net, "OrangeSky", ClientConfig::default());
    let (a_id, b_id) = (a.id(), b.id());

    connect_pair(&a, &b).await;
    let mut b_events = b.client.subscribe();

    let sender = a.client.clone();
    let target = b_id.clone();
    let transfer = tokio::spawn(async move {
        sender
            .send_file(&target, OutgoingFile::new("big.bin", "application/octet-stream", pattern(10 * 16384)))
            .await
    });

    next_matching(&mut b_events, |ev| matches!(ev, ClientEvent::TransferProgress { .. })).await;
    b.factory
        .connection_to(&a_id)
        .expect("b has a connection to a")
        .fail();

    next_matching(&mut b_events, |ev| matches!(ev, ClientEvent::TransferDiscarded { .. })).await;
    assert!(transfer.await.unwrap().is_err());

    eventually("both sides to drop back to available", || {
        a.client.status(&b_id) == Some(PeerStatus::Available)
            && b.client.status(&a_id) == Some(PeerStatus::Available)
    })
    .await;
    assert!(b
        .client
        .conversation(&a_id)
        .iter()
        .all(|e| e.as_file().is_none()));

    // a fresh session works after the failure
    eventually("sessions to be released", || {
        !a.client.has_session(&b_id) && !b.client.has_session(&a_id)
    })
    .await;
    connect_pair(&a, &b).await;
    a.client.send_message(&b_id, "again").await.unwrap();
    eventually("message after reconnect", || {
        b.client
            .conversation(&a_id)
            .iter()
            .any(|e| e.kind == EntryKind::Message("again".into()))
    })
    .await;
}

#[tokio::test]
async fn test_goodbye_removes_peer_from_directory() {
    let (relay, _task) = RelayHandle::spawn(RelayConfig::default());
    let net = LoopbackNetwork::new();
    let a = spawn_node(&relay, &net, "PurpleWolf", ClientConfig::default());

    let identity = LocalIdentity::generate(Some("YellowOcean".into()), DeviceClass::Mobile);
    let b_id = identity.peer_id.clone();
    let (link, _events) = LocalSignaling::connect(&relay, &identity);

    eventually("b to be listed", || a.client.status(&b_id).is_some()).await;
    let listed = a.client.peers().into_iter().find(|p| p.id == b_id).unwrap();
    assert_eq!(listed.name, "YellowOcean");
    assert_eq!(listed.device_type, DeviceClass::Mobile);

    link.close();
    eventually("b to leave", || a.client.status(&b_id).is_none()).await;
}
