//! End-to-end transfers over localhost.
//!
//! A datagram relay sits between client and server where a test needs loss
//! or corruption injection; the relay tracks the responder-side source
//! address so the session's ephemeral-port migration still works through it.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rudder::frame::{Frame, FRAME_LEN, PAYLOAD_OFFSET};
use rudder::{Client, RudderError, Server};
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

async fn start_server() -> (SocketAddr, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), root.path()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });
    (addr, root)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll until `path` holds exactly `expected`; the responder commits its
/// sink just after acking END, so the requester can briefly race it.
async fn wait_for_file(path: &Path, expected: &[u8]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(bytes) = std::fs::read(path) {
            if bytes == expected {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} never matched the expected {} bytes",
            path.display(),
            expected.len()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    ToServer,
    ToClient,
}

enum Verdict {
    Pass,
    Drop,
    Corrupt,
}

fn apply_policy<P>(policy: &mut P, dir: Dir, buf: &mut [u8]) -> bool
where
    P: FnMut(Dir, &Frame) -> Verdict,
{
    // Undecodable datagrams pass through untouched.
    let Ok(frame) = Frame::decode(buf) else { return true };
    match policy(dir, &frame) {
        Verdict::Pass => true,
        Verdict::Drop => false,
        Verdict::Corrupt => {
            buf[PAYLOAD_OFFSET] ^= 0x01;
            true
        }
    }
}

/// Start a relay in front of `server` and return the address clients should
/// talk to. `policy` decides the fate of every decodable frame.
async fn start_relay<P>(server: SocketAddr, mut policy: P) -> SocketAddr
where
    P: FnMut(Dir, &Frame) -> Verdict + Send + 'static,
{
    let client_side = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_side = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = client_side.local_addr().unwrap();

    tokio::spawn(async move {
        let mut client: Option<SocketAddr> = None;
        let mut server = server;
        let mut inbound = vec![0u8; FRAME_LEN];
        let mut outbound = vec![0u8; FRAME_LEN];
        loop {
            tokio::select! {
                received = client_side.recv_from(&mut inbound) => {
                    let Ok((len, from)) = received else { break };
                    client = Some(from);
                    let buf = &mut inbound[..len];
                    if apply_policy(&mut policy, Dir::ToServer, buf) {
                        let _ = server_side.send_to(buf, server).await;
                    }
                }
                received = server_side.recv_from(&mut outbound) => {
                    let Ok((len, from)) = received else { break };
                    // The worker's first reply migrates the session to its
                    // ephemeral port; follow it.
                    server = from;
                    let buf = &mut outbound[..len];
                    if let Some(client) = client {
                        if apply_policy(&mut policy, Dir::ToClient, buf) {
                            let _ = client_side.send_to(buf, client).await;
                        }
                    }
                }
            }
        }
    });
    relay_addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clean_upload_delivers_identical_bytes() {
    let (server, server_root) = start_server().await;
    let client_root = tempfile::tempdir().unwrap();
    let contents = patterned(2560);
    let source = client_root.path().join("clean.bin");
    std::fs::write(&source, &contents).unwrap();

    let client = Client::new(server, client_root.path());
    let bytes = timeout(TEST_TIMEOUT, client.upload(&source)).await.unwrap().unwrap();
    assert_eq!(bytes, 2560);

    wait_for_file(&server_root.path().join("received_clean.bin"), &contents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clean_download_delivers_identical_bytes() {
    let (server, server_root) = start_server().await;
    let contents = patterned(4000);
    std::fs::write(server_root.path().join("served.bin"), &contents).unwrap();

    let client_root = tempfile::tempdir().unwrap();
    let client = Client::new(server, client_root.path());
    let bytes = timeout(TEST_TIMEOUT, client.download("served.bin")).await.unwrap().unwrap();
    assert_eq!(bytes, 4000);
    assert_eq!(
        std::fs::read(client_root.path().join("downloaded_served.bin")).unwrap(),
        contents
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_data_frame_is_selectively_retransmitted() {
    let (server, server_root) = start_server().await;
    let mut dropped = false;
    let relay = start_relay(server, move |dir, frame| {
        if dir == Dir::ToServer && !dropped {
            if let Frame::Data { seq: 1, .. } = frame {
                dropped = true;
                return Verdict::Drop;
            }
        }
        Verdict::Pass
    })
    .await;

    let client_root = tempfile::tempdir().unwrap();
    let contents = patterned(2560);
    let source = client_root.path().join("lossy.bin");
    std::fs::write(&source, &contents).unwrap();

    let client = Client::new(relay, client_root.path());
    let bytes = timeout(TEST_TIMEOUT, client.upload(&source)).await.unwrap().unwrap();
    assert_eq!(bytes, 2560);

    wait_for_file(&server_root.path().join("received_lossy.bin"), &contents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_ack_causes_harmless_duplicate() {
    let (server, server_root) = start_server().await;
    // The first Ack(0) toward the client is the handshake; the second is
    // the acknowledgement of DATA seq 0. Drop that one once.
    let mut acks_for_zero = 0;
    let relay = start_relay(server, move |dir, frame| {
        if dir == Dir::ToClient {
            if let Frame::Ack { seq: 0 } = frame {
                acks_for_zero += 1;
                if acks_for_zero == 2 {
                    return Verdict::Drop;
                }
            }
        }
        Verdict::Pass
    })
    .await;

    let client_root = tempfile::tempdir().unwrap();
    let contents = patterned(2560);
    let source = client_root.path().join("ackloss.bin");
    std::fs::write(&source, &contents).unwrap();

    let client = Client::new(relay, client_root.path());
    timeout(TEST_TIMEOUT, client.upload(&source)).await.unwrap().unwrap();

    // The duplicate DATA seq 0 must have been re-acked, not re-written.
    wait_for_file(&server_root.path().join("received_ackloss.bin"), &contents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupted_payload_is_dropped_and_resent() {
    let (server, server_root) = start_server().await;
    let mut corrupted = false;
    let relay = start_relay(server, move |dir, frame| {
        if dir == Dir::ToServer && !corrupted {
            if let Frame::Data { seq: 2, .. } = frame {
                corrupted = true;
                return Verdict::Corrupt;
            }
        }
        Verdict::Pass
    })
    .await;

    let client_root = tempfile::tempdir().unwrap();
    let contents = patterned(2560);
    let source = client_root.path().join("flipped.bin");
    std::fs::write(&source, &contents).unwrap();

    let client = Client::new(relay, client_root.path());
    timeout(TEST_TIMEOUT, client.upload(&source)).await.unwrap().unwrap();

    wait_for_file(&server_root.path().join("received_flipped.bin"), &contents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn randomized_loss_still_completes() {
    let (server, server_root) = start_server().await;
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
    let relay = start_relay(server, move |dir, frame| {
        if dir == Dir::ToServer && matches!(frame, Frame::Data { .. }) && rng.random_bool(0.2) {
            return Verdict::Drop;
        }
        Verdict::Pass
    })
    .await;

    let client_root = tempfile::tempdir().unwrap();
    let contents = patterned(8 * 1024);
    let source = client_root.path().join("stress.bin");
    std::fs::write(&source, &contents).unwrap();

    let client = Client::new(relay, client_root.path());
    let bytes = timeout(TEST_TIMEOUT, client.upload(&source)).await.unwrap().unwrap();
    assert_eq!(bytes, 8 * 1024);

    wait_for_file(&server_root.path().join("received_stress.bin"), &contents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_stay_isolated() {
    let (server, server_root) = start_server().await;
    let root_a = tempfile::tempdir().unwrap();
    let root_b = tempfile::tempdir().unwrap();

    let contents_a = patterned(3 * 1024);
    let contents_b: Vec<u8> = patterned(5 * 1024).into_iter().rev().collect();
    let source_a = root_a.path().join("first.bin");
    let source_b = root_b.path().join("second.bin");
    std::fs::write(&source_a, &contents_a).unwrap();
    std::fs::write(&source_b, &contents_b).unwrap();

    let client_a = Client::new(server, root_a.path());
    let client_b = Client::new(server, root_b.path());
    let (a, b) = tokio::join!(
        timeout(TEST_TIMEOUT, client_a.upload(&source_a)),
        timeout(TEST_TIMEOUT, client_b.upload(&source_b)),
    );
    assert_eq!(a.unwrap().unwrap(), 3 * 1024);
    assert_eq!(b.unwrap().unwrap(), 5 * 1024);

    wait_for_file(&server_root.path().join("received_first.bin"), &contents_a).await;
    wait_for_file(&server_root.path().join("received_second.bin"), &contents_b).await;

    // The well-known port must still accept new requests.
    let contents_c = patterned(100);
    let source_c = root_a.path().join("third.bin");
    std::fs::write(&source_c, &contents_c).unwrap();
    timeout(TEST_TIMEOUT, client_a.upload(&source_c)).await.unwrap().unwrap();
    wait_for_file(&server_root.path().join("received_third.bin"), &contents_c).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_length_file_uploads_empty_sink() {
    let (server, server_root) = start_server().await;
    let client_root = tempfile::tempdir().unwrap();
    let source = client_root.path().join("empty.bin");
    std::fs::write(&source, b"").unwrap();

    let client = Client::new(server, client_root.path());
    let bytes = timeout(TEST_TIMEOUT, client.upload(&source)).await.unwrap().unwrap();
    assert_eq!(bytes, 0);

    wait_for_file(&server_root.path().join("received_empty.bin"), b"").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn window_sized_file_never_stalls() {
    let (server, server_root) = start_server().await;
    let client_root = tempfile::tempdir().unwrap();
    // Exactly WINDOW_SIZE frames of MAX_PAYLOAD bytes each.
    let contents = patterned(5 * 1024);
    let source = client_root.path().join("exact.bin");
    std::fs::write(&source, &contents).unwrap();

    let client = Client::new(server, client_root.path());
    let bytes = timeout(TEST_TIMEOUT, client.upload(&source)).await.unwrap().unwrap();
    assert_eq!(bytes, 5 * 1024);
    wait_for_file(&server_root.path().join("received_exact.bin"), &contents).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_then_download_round_trips() {
    let (server, server_root) = start_server().await;
    let client_root = tempfile::tempdir().unwrap();
    let contents = patterned(3000);
    let source = client_root.path().join("cycle.bin");
    std::fs::write(&source, &contents).unwrap();

    let client = Client::new(server, client_root.path());
    timeout(TEST_TIMEOUT, client.upload(&source)).await.unwrap().unwrap();
    wait_for_file(&server_root.path().join("received_cycle.bin"), &contents).await;

    timeout(TEST_TIMEOUT, client.download("received_cycle.bin")).await.unwrap().unwrap();
    assert_eq!(
        std::fs::read(client_root.path().join("downloaded_received_cycle.bin")).unwrap(),
        contents
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_remote_file_surfaces_refusal_and_removes_partial() {
    let (server, _server_root) = start_server().await;
    let client_root = tempfile::tempdir().unwrap();
    let client = Client::new(server, client_root.path());

    let err = timeout(TEST_TIMEOUT, client.download("absent.bin")).await.unwrap().unwrap_err();
    match err {
        RudderError::RemoteRefusal(message) => assert!(message.contains("absent.bin")),
        other => panic!("expected remote refusal, got {other:?}"),
    }
    assert!(!client_root.path().join("downloaded_absent.bin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_local_file_never_reaches_the_wire() {
    // The request must not be sent at all, so no server is needed.
    let client_root = tempfile::tempdir().unwrap();
    let client = Client::new("127.0.0.1:9".parse().unwrap(), client_root.path());

    let err = timeout(TEST_TIMEOUT, client.upload(client_root.path().join("nope.bin")))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RudderError::NoSuchFile(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_server_times_out_the_handshake() {
    let parked = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead = parked.local_addr().unwrap();
    drop(parked);

    let client_root = tempfile::tempdir().unwrap();
    let source = client_root.path().join("stranded.bin");
    std::fs::write(&source, b"nobody listening").unwrap();

    let client = Client::new(dead, client_root.path());
    let err = timeout(TEST_TIMEOUT, client.upload(&source)).await.unwrap().unwrap_err();
    assert!(matches!(err, RudderError::HandshakeFail));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn traversal_filenames_are_rejected_locally() {
    let client_root = tempfile::tempdir().unwrap();
    let client = Client::new("127.0.0.1:9".parse().unwrap(), client_root.path());

    let err = timeout(TEST_TIMEOUT, client.download("../escape.bin")).await.unwrap().unwrap_err();
    assert!(matches!(err, RudderError::InvalidFilename(_)));
}
