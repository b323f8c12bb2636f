use twc_protocol::{
    checksum, decode, encode, Command, FrameAccumulator, FrameError, Message, PollKind,
};
use types::{CentiAmps, PlugState, TwcId};

fn ready_to_link_body(extra: usize) -> Vec<u8> {
    let mut body = vec![0xFD, 0xE2, 0xAB, 0xCD, 0x77, 0x1F, 0x40, 0, 0, 0, 0, 0, 0];
    body.extend(std::iter::repeat(0).take(extra));
    body
}

#[test]
fn decode_reverses_encode_for_each_frame_length() {
    let bodies = [
        ready_to_link_body(0),
        ready_to_link_body(2),
        {
            let mut body = vec![0xFD, 0xEB, 0x01, 0x02];
            body.extend_from_slice(&[0, 0, 0x10, 0x20, 0x00, 0xF0, 0, 0, 0, 0, 0x20, 0, 0]);
            body.extend_from_slice(&[0, 0]);
            body
        },
    ];

    for body in bodies {
        let raw = encode(&body);
        assert_eq!(raw.first(), Some(&0xC0));
        assert_eq!(raw.last(), Some(&0xC0));
        assert_eq!(decode(&raw).expect("decode"), body);
    }
}

#[test]
fn escaped_bytes_survive_the_round_trip() {
    // Body bytes colliding with the delimiter and the escape byte, more than once.
    let body = vec![
        0xFD, 0xE0, 0xC0, 0xDB, 0x77, 0x77, 0xC0, 0xDB, 0x00, 0x00, 0xC0, 0x00, 0x00,
    ];
    let raw = encode(&body);
    let inner = &raw[1..raw.len() - 1];
    assert!(!inner.contains(&0xC0), "delimiter leaked into frame body");
    assert_eq!(decode(&raw).expect("decode"), body);
}

#[test]
fn single_bit_flip_is_rejected() {
    let mut body = ready_to_link_body(2);
    body[3] = 0x10;
    let mut raw = encode(&body);
    raw[4] ^= 0x01;

    match decode(&raw) {
        Err(FrameError::Checksum { computed, received }) => {
            assert_eq!(received, checksum(&body));
            assert_ne!(computed, received);
        }
        other => panic!("expected checksum error, got {other:?}"),
    }
}

#[test]
fn unexpected_lengths_are_rejected() {
    let raw = encode(&[0xFD, 0xB4, 0x01, 0x02, 0x01]);
    assert_eq!(decode(&raw), Err(FrameError::Length(6)));

    let raw = encode(&[0u8; 16]);
    assert_eq!(decode(&raw), Err(FrameError::Length(17)));
}

#[test]
fn accumulator_discards_noise_and_restarts_on_early_delimiter() {
    let body = ready_to_link_body(2);
    let frame = encode(&body);

    let mut stream = vec![0x11, 0x22, 0x33];
    // A truncated frame cut short by the next frame's delimiter.
    stream.extend_from_slice(&[0xC0, 0xFD, 0xE2, 0x01]);
    stream.extend_from_slice(&frame);
    stream.extend_from_slice(&frame);

    let mut acc = FrameAccumulator::new();
    let frames = acc.extend(&stream);

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], frame);
    assert_eq!(decode(&frames[1]).expect("decode"), body);
    assert_eq!(acc.take_discarded(), 3 + 4);
    assert_eq!(acc.pending(), 0);
}

#[test]
fn accumulator_holds_partial_frames_across_reads() {
    let frame = encode(&ready_to_link_body(0));
    let (head, tail) = frame.split_at(7);

    let mut acc = FrameAccumulator::new();
    assert!(acc.extend(head).is_empty());
    assert_eq!(acc.pending(), head.len());
    let frames = acc.extend(tail);
    assert_eq!(frames, vec![frame]);
}

#[test]
fn ready_to_link_reports_frame_length() {
    for (extra, frame_len) in [(0usize, 14usize), (2, 16)] {
        match Message::parse(&ready_to_link_body(extra)) {
            Some(Message::ReadyToLink(msg)) => {
                assert_eq!(msg.twc_id, TwcId::new(0xAB, 0xCD));
                assert_eq!(msg.signature, 0x77);
                assert_eq!(msg.max_amps, CentiAmps(8000));
                assert_eq!(msg.frame_len, frame_len);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn ready_to_link_requires_zero_padding() {
    let mut body = ready_to_link_body(2);
    body[9] = 0x01;
    assert_eq!(Message::parse(&body), None);
}

#[test]
fn secondary_heartbeat_fields() {
    let body = [
        0xFD, 0xE0, 0x12, 0x34, 0x77, 0x77, 0x01, 0x0C, 0x80, 0x0B, 0xB8, 0x00, 0x00, 0x00, 0x00,
    ];
    match Message::parse(&body) {
        Some(Message::SecondaryHeartbeat(hb)) => {
            assert_eq!(hb.twc_id, TwcId::new(0x12, 0x34));
            assert_eq!(hb.primary_id, TwcId::new(0x77, 0x77));
            assert_eq!(hb.state, 1);
            assert_eq!(hb.amps_max, CentiAmps(3200));
            assert_eq!(hb.amps_actual, CentiAmps(3000));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn periodic_poll_data_fields() {
    let body = [
        0xFD, 0xEB, 0x12, 0x34, 0x00, 0x00, 0x01, 0x00, 0x00, 0xF0, 0x00, 0x00, 0x00, 0x00, 0x40,
        0x00, 0x00, 0x00, 0x00,
    ];
    match Message::parse(&body) {
        Some(Message::PeriodicPollData(poll)) => {
            assert_eq!(poll.kwh, 256);
            assert_eq!(poll.phase_volts, [240, 0, 0]);
            assert_eq!(poll.phase_amps, [32, 0, 0]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn vin_fragments_map_zero_to_unknown() {
    let mut body = vec![0xFD, 0xEE, 0x12, 0x34];
    body.extend_from_slice(b"5YJ3E1E");
    body.extend_from_slice(&[0, 0]);
    match Message::parse(&body) {
        Some(Message::VinStart(fragment)) => assert_eq!(fragment.text.as_deref(), Some("5YJ3E1E")),
        other => panic!("unexpected {other:?}"),
    }

    let mut body = vec![0xFD, 0xF1, 0x12, 0x34, 0, 0, 0];
    body.extend_from_slice(&[0u8; 8]);
    match Message::parse(&body) {
        Some(Message::VinEnd(fragment)) => assert_eq!(fragment.text, None),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn plug_state_and_foreign_primary() {
    let mut body = vec![0xFD, 0xB4, 0x12, 0x34, 0x01];
    body.extend_from_slice(&[0u8; 10]);
    assert_eq!(
        Message::parse(&body),
        Some(Message::PlugState {
            twc_id: TwcId::new(0x12, 0x34),
            plug_state: PlugState::PluggedCharging,
        })
    );

    let mut body = vec![0xFC, 0xE1, 0x55, 0x66, 0x77];
    body.extend_from_slice(&[0u8; 10]);
    assert_eq!(
        Message::parse(&body),
        Some(Message::PrimaryAnnounce {
            twc_id: TwcId::new(0x55, 0x66),
        })
    );
}

#[test]
fn unknown_messages_are_not_classified() {
    assert_eq!(Message::parse(&[0xFD, 0x19, 0x12, 0x34, 0, 0, 0, 0, 0, 0, 0, 0, 0]), None);
    assert_eq!(Message::parse(&[0xFD]), None);
}

#[test]
fn outbound_commands_decode_cleanly() {
    let primary = TwcId::new(0x77, 0x77);
    let secondary = TwcId::new(0xC0, 0xDB);
    let command = Command::Poll {
        primary,
        secondary,
        kind: PollKind::Stats,
    };
    let body = command.body();
    assert_eq!(&body[..2], &[0xFB, 0xEB]);
    assert_eq!(decode(&encode(&body)).expect("decode"), body);
}
