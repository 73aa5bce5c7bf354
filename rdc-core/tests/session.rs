//! Session lifecycle against scripted peers: a mock transport replaying
//! a rejected channel join, and an in-process server over a duplex pipe
//! that activates the share, rings the bell and disconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rdc_core::cache::RecordHeader;
use rdc_core::codec::{Frame, TpktCodec};
use rdc_core::session::channels::ChannelRegistration;
use rdc_core::session::{gcc, iso, mcs};
use rdc_core::{
    ChannelHandler, ChannelOptions, ChannelOutbox, ConnectionError, PersistentCache,
    RecordingPresenter, Session, SessionConfig,
};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

// ── Helpers ──────────────────────────────────────────────────────

const USER_ID: u16 = 6;
const IO_CHANNEL: u16 = 1003;

fn config() -> SessionConfig {
    SessionConfig {
        host: "mock".into(),
        username: "alice".into(),
        encryption: false,
        connect_timeout_ms: 2_000,
        ..Default::default()
    }
}

fn x224(data: &[u8]) -> Vec<u8> {
    let len = (data.len() + 7) as u16;
    let mut v = vec![3, 0];
    v.extend_from_slice(&len.to_be_bytes());
    v.extend_from_slice(&[2, 0xf0, 0x80]);
    v.extend_from_slice(data);
    v
}

fn connection_confirm() -> Vec<u8> {
    vec![3, 0, 0, 11, 6, 0xd0, 0, 0, 0x12, 0x34, 0]
}

/// Connect-Response carrying server core and network blocks.
fn connect_response(channel_ids: &[u16]) -> Vec<u8> {
    let mut blocks = Vec::new();
    blocks.extend_from_slice(&0x0c01u16.to_le_bytes());
    blocks.extend_from_slice(&8u16.to_le_bytes());
    blocks.extend_from_slice(&0x0008_0004u32.to_le_bytes());
    blocks.extend_from_slice(&0x0c03u16.to_le_bytes());
    blocks.extend_from_slice(&(8 + 2 * channel_ids.len() as u16).to_le_bytes());
    blocks.extend_from_slice(&IO_CHANNEL.to_le_bytes());
    blocks.extend_from_slice(&(channel_ids.len() as u16).to_le_bytes());
    for id in channel_ids {
        blocks.extend_from_slice(&id.to_le_bytes());
    }

    let mut user_data = vec![0u8; 21];
    user_data.push(blocks.len() as u8);
    user_data.extend_from_slice(&blocks);

    let mut body = vec![0x0a, 1, 0, 0x02, 1, 0, 0x30, 2, 0, 0];
    body.extend_from_slice(&[0x04, user_data.len() as u8]);
    body.extend_from_slice(&user_data);

    let mut pdu = vec![0x7f, 0x66, 0x82];
    pdu.extend_from_slice(&(body.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&body);
    x224(&pdu)
}

fn attach_user_confirm() -> Vec<u8> {
    let [hi, lo] = USER_ID.to_be_bytes();
    x224(&[(11 << 2) | 2, 0, hi, lo])
}

fn join_confirm(result: u8) -> Vec<u8> {
    x224(&[(15 << 2) | 2, result, 0, USER_ID as u8])
}

/// Send-data-indication on the I/O channel with an empty security header.
fn indication(share: &[u8]) -> Vec<u8> {
    let mut payload = vec![0, 0, 0, 0];
    payload.extend_from_slice(share);
    let mut pdu = vec![26 << 2, 0, 1];
    pdu.extend_from_slice(&IO_CHANNEL.to_be_bytes());
    pdu.push(0x70);
    let len = payload.len() as u16;
    if len >= 0x80 {
        pdu.extend_from_slice(&(len | 0x8000).to_be_bytes());
    } else {
        pdu.push(len as u8);
    }
    pdu.extend_from_slice(&payload);
    x224(&pdu)
}

fn demand_active() -> Vec<u8> {
    let mut caps = vec![1, 0, 0, 0];
    caps.extend_from_slice(&2u16.to_le_bytes());
    caps.extend_from_slice(&28u16.to_le_bytes());
    for v in [16u16, 1, 1, 1, 800, 600, 0, 1, 1, 0, 1, 0] {
        caps.extend_from_slice(&v.to_le_bytes());
    }
    let mut body = 0x0001_03eau32.to_le_bytes().to_vec();
    body.extend_from_slice(&4u16.to_le_bytes());
    body.extend_from_slice(&(caps.len() as u16).to_le_bytes());
    body.extend_from_slice(b"RDP\0");
    body.extend_from_slice(&caps);
    share_control(0x11, &body)
}

fn bell() -> Vec<u8> {
    let mut body = 0x0001_03eau32.to_le_bytes().to_vec();
    body.extend_from_slice(&[0, 1, 4, 0, 34, 0, 18, 0]);
    share_control(0x17, &body)
}

fn share_control(pdu_type: u16, body: &[u8]) -> Vec<u8> {
    let mut v = ((body.len() + 6) as u16).to_le_bytes().to_vec();
    v.extend_from_slice(&pdu_type.to_le_bytes());
    v.extend_from_slice(&1002u16.to_le_bytes());
    v.extend_from_slice(body);
    v
}

async fn next(framed: &mut Framed<DuplexStream, TpktCodec>) {
    match framed.next().await {
        Some(Ok(Frame::X224(_))) => {}
        other => panic!("unexpected client frame: {other:?}"),
    }
}

/// Play the server side up to and including the client's logon info.
async fn accept_until_logon(framed: &mut Framed<DuplexStream, TpktCodec>) {
    // connection request
    next(framed).await;
    framed.send(Bytes::from(connection_confirm())).await.unwrap();
    // connect initial
    next(framed).await;
    framed.send(Bytes::from(connect_response(&[]))).await.unwrap();
    // erect domain, attach user
    next(framed).await;
    next(framed).await;
    framed.send(Bytes::from(attach_user_confirm())).await.unwrap();
    // user and I/O channel joins
    for _ in 0..2 {
        next(framed).await;
        framed.send(Bytes::from(join_confirm(0))).await.unwrap();
    }
    // logon info
    next(framed).await;
}

struct Tracked {
    closed: Arc<AtomicBool>,
}

impl ChannelHandler for Tracked {
    fn on_message(&mut self, _message: &[u8], _outbox: &mut ChannelOutbox) {}

    fn on_disconnected(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_channel_join_leaves_a_clean_disconnected_session() {
    let cfg = config();
    let options = ChannelOptions::INITIALIZED;
    let regs = [ChannelRegistration::new("cliprdr", options)];
    let user_data = gcc::client_data(&cfg, &regs);

    let mock = tokio_test::io::Builder::new()
        .write(&iso::connection_request("alice"))
        .read(&connection_confirm())
        .write(&mcs::connect_initial(&user_data).unwrap())
        .read(&connect_response(&[1004]))
        .write(&mcs::erect_domain_request().unwrap())
        .write(&mcs::attach_user_request().unwrap())
        .read(&attach_user_confirm())
        .write(&mcs::channel_join_request(USER_ID, 1001 + USER_ID).unwrap())
        .read(&join_confirm(0))
        .write(&mcs::channel_join_request(USER_ID, IO_CHANNEL).unwrap())
        .read(&join_confirm(0))
        .write(&mcs::channel_join_request(USER_ID, 1004).unwrap())
        .read(&join_confirm(1))
        .build();

    let closed = Arc::new(AtomicBool::new(false));
    let mut session = Session::new(cfg).unwrap();
    session
        .register_channel(
            "cliprdr",
            options,
            Box::new(Tracked {
                closed: Arc::clone(&closed),
            }),
        )
        .unwrap();

    let err = session.connect_with(mock).await.unwrap_err();
    assert_eq!(err.kind(), ConnectionError::General);
    assert_eq!(session.error(), ConnectionError::General);
    assert!(session.state().is_disconnected());
    assert_eq!(session.open_channel_count(), 0);
    assert!(closed.load(Ordering::SeqCst));

    // disconnect after a failed attempt is a no-op
    session.disconnect().await;
    assert_eq!(session.error(), ConnectionError::General);
}

#[tokio::test]
async fn silent_peer_times_out() {
    let (client, _server) = tokio::io::duplex(4096);
    let mut session = Session::new(SessionConfig {
        connect_timeout_ms: 50,
        ..config()
    })
    .unwrap();
    session.connect_with(client).await.unwrap_err();
    assert_eq!(session.error(), ConnectionError::TimeOut);
    assert!(session.state().is_disconnected());
}

#[tokio::test]
async fn activates_runs_and_ends_on_server_disconnect() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let peer = tokio::spawn(async move {
        let mut framed = Framed::new(server, TpktCodec);
        accept_until_logon(&mut framed).await;
        framed.send(Bytes::from(indication(&demand_active()))).await.unwrap();
        // confirm active, synchronise, two controls, input sync, fonts
        for _ in 0..6 {
            next(&mut framed).await;
        }
        framed.send(Bytes::from(indication(&bell()))).await.unwrap();
        framed.send(Bytes::from(x224(&[8 << 2, 0x80]))).await.unwrap();
        while framed.next().await.is_some() {}
    });

    let mut session = Session::new(config()).unwrap();
    let stats = session.stats();
    session.connect_with(client).await.unwrap();
    assert!(session.state().is_active());
    assert_eq!(session.desktop(), (800, 600, 16));

    let mut presenter = RecordingPresenter::default();
    tokio::time::timeout(Duration::from_secs(5), session.run(&mut presenter))
        .await
        .expect("run did not return")
        .unwrap();

    assert_eq!(presenter.bells, 1);
    assert_eq!(presenter.size, Some((800, 600)));
    assert!(session.state().is_disconnected());
    assert_eq!(session.error(), ConnectionError::None);
    assert_eq!(stats.borrow().activations, 1);
    assert_eq!(stats.borrow().frames, 2);
    peer.await.unwrap();
}

#[tokio::test]
async fn data_pdu_before_demand_active_is_unwrapped() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let peer = tokio::spawn(async move {
        let mut framed = Framed::new(server, TpktCodec);
        accept_until_logon(&mut framed).await;
        // a data PDU ahead of the demand active, each with its own
        // security header
        framed.send(Bytes::from(indication(&bell()))).await.unwrap();
        framed.send(Bytes::from(indication(&demand_active()))).await.unwrap();
        for _ in 0..6 {
            next(&mut framed).await;
        }
        while framed.next().await.is_some() {}
    });

    let mut session = Session::new(config()).unwrap();
    session.connect_with(client).await.unwrap();
    assert!(session.state().is_active());
    assert_eq!(session.desktop(), (800, 600, 16));

    session.disconnect().await;
    assert!(session.state().is_disconnected());
    assert_eq!(session.error(), ConnectionError::None);
    peer.await.unwrap();
}

// ── Persistent cache ─────────────────────────────────────────────

#[test]
fn touching_a_persistent_record_keeps_its_content() {
    let dir = std::env::temp_dir().join(format!("rdc-session-pst-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();

    let key = [0x48; 8];
    let pixels: Vec<u8> = (0..8).collect();
    let header = RecordHeader {
        key,
        width: 2,
        height: 2,
        length: pixels.len() as u16,
        stamp: 100,
    };
    let mut file = header.to_bytes().to_vec();
    file.extend_from_slice(&pixels);
    std::fs::write(dir.join("pstcache_2_2"), &file).unwrap();

    let mut cache = PersistentCache::open(&dir, 2, &[2]).unwrap();
    let listed = cache.enumerate(2).unwrap();
    let (idx, found) = listed
        .iter()
        .find(|(_, h)| h.key == key)
        .copied()
        .expect("hash not enumerated");
    assert_eq!(found.stamp, 100);

    cache.touch(2, idx, 200).unwrap();
    let entry = cache.load(2, idx).unwrap().unwrap();
    assert_eq!(entry.header.stamp, 200);
    assert_eq!(entry.header.key, key);
    assert_eq!(entry.data, pixels);

    drop(cache);
    let _ = std::fs::remove_dir_all(&dir);
}
