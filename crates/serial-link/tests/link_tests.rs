use serial_link::{FramedLink, LinkError, SerialConfig};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use twc_protocol::{encode, Command};
use types::TwcId;

fn plug_state_body() -> Vec<u8> {
    let mut body = vec![0xFD, 0xB4, 0x12, 0x34, 0x01];
    body.resize(15, 0);
    body
}

#[tokio::test]
async fn send_writes_an_encoded_frame() {
    let (local, mut peer) = duplex(1024);
    let mut link = FramedLink::new(local, &SerialConfig::default());

    let command = Command::LinkReady1 {
        primary: TwcId::new(0x77, 0x77),
        signature: 0x77,
    };
    link.send_command(&command).await.expect("send");

    let expected = encode(&command.body());
    let mut received = vec![0u8; expected.len()];
    peer.read_exact(&mut received).await.expect("read");
    assert_eq!(received, expected);
    assert_eq!(link.stats().frames_sent, 1);
}

#[tokio::test]
async fn receive_keeps_valid_frames_and_drops_corrupt_ones() {
    let (local, mut peer) = duplex(1024);
    let mut link = FramedLink::new(local, &SerialConfig::default());

    let body = plug_state_body();
    let good = encode(&body);
    let mut corrupt = good.clone();
    corrupt[5] ^= 0x01;

    let mut stream = vec![0x00, 0x01];
    stream.extend_from_slice(&corrupt);
    stream.extend_from_slice(&good);
    peer.write_all(&stream).await.expect("write");

    let bodies = link.receive().await.expect("receive");
    assert_eq!(bodies, vec![body]);

    let stats = link.stats();
    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.frames_rejected, 1);
    assert_eq!(stats.bytes_discarded, 2);
}

#[tokio::test]
async fn receive_returns_nothing_when_the_line_is_idle() {
    let (local, _peer) = duplex(1024);
    let mut link = FramedLink::new(local, &SerialConfig::default());

    let bodies = link.receive().await.expect("receive");
    assert!(bodies.is_empty());
}

#[tokio::test]
async fn receive_reports_a_closed_peer() {
    let (local, peer) = duplex(1024);
    let mut link = FramedLink::new(local, &SerialConfig::default());
    drop(peer);

    assert!(matches!(link.receive().await, Err(LinkError::Closed)));
}
