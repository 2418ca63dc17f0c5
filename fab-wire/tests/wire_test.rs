use fab_wire::{
    ACK_LEN, ADDR_CAP, AckMsg, INITIAL_LEN, InitialMsg, MAX_RIOVS, MrKey, PROGRESS_LEN,
    ProgressMsg, RIOV_LEN, RemoteIov, VECTOR_CAP, VectorMsg, WireError,
};

fn triple(i: u64) -> RemoteIov {
    RemoteIov {
        addr: i * 64,
        len: 23 + i,
        key: MrKey(0x1000 + i),
    }
}

#[test]
fn test_vector_full_window_accepted() {
    let msg = VectorMsg {
        iovs: (0..MAX_RIOVS as u64).map(triple).collect(),
    };
    let mut buf = [0u8; VECTOR_CAP];
    let used = msg.encode(&mut buf).unwrap();
    assert_eq!(used, 4 + MAX_RIOVS * RIOV_LEN);

    let back = VectorMsg::decode(&buf[..used]).unwrap();
    assert_eq!(back, msg);
}

#[test]
fn test_vector_thirteen_segments_rejected() {
    // Hand-build a frame claiming 13 triples; encode() refuses to produce one.
    let mut buf = vec![0u8; 4 + 13 * RIOV_LEN];
    buf[..4].copy_from_slice(&13u32.to_be_bytes());
    assert_eq!(
        VectorMsg::decode(&buf),
        Err(WireError::TooManySegments { niovs: 13 })
    );

    let msg = VectorMsg {
        iovs: (0..13).map(triple).collect(),
    };
    let mut out = vec![0u8; 4 + 13 * RIOV_LEN];
    assert!(msg.encode(&mut out).is_err());
}

#[test]
fn test_vector_ragged_body_rejected() {
    let msg = VectorMsg {
        iovs: vec![triple(1), triple(2)],
    };
    let mut buf = [0u8; VECTOR_CAP];
    let used = msg.encode(&mut buf).unwrap();

    // A trailing byte that is not part of a whole triple.
    assert!(matches!(
        VectorMsg::decode(&buf[..used + 1]),
        Err(WireError::RaggedVector { niovs: 2, .. })
    ));
    // A whole triple missing relative to the declared count.
    assert!(matches!(
        VectorMsg::decode(&buf[..used - RIOV_LEN]),
        Err(WireError::RaggedVector { niovs: 2, .. })
    ));
}

#[test]
fn test_vector_short_header_rejected() {
    assert_eq!(
        VectorMsg::decode(&[0u8; 3]),
        Err(WireError::Truncated { need: 4, got: 3 })
    );
    assert_eq!(
        VectorMsg::decode(&[]),
        Err(WireError::Truncated { need: 4, got: 0 })
    );
}

#[test]
fn test_vector_empty_is_eof() {
    let msg = VectorMsg::default();
    let mut buf = [0u8; VECTOR_CAP];
    let used = msg.encode(&mut buf).unwrap();
    assert_eq!(used, 4);

    let back = VectorMsg::decode(&buf[..4]).unwrap();
    assert!(back.is_eof());
}

#[test]
fn test_progress_roundtrip_and_length() {
    let msg = ProgressMsg {
        nfilled: 780_000,
        nleftover: 1,
    };
    let mut buf = [0u8; PROGRESS_LEN];
    assert_eq!(msg.encode(&mut buf).unwrap(), PROGRESS_LEN);
    assert_eq!(ProgressMsg::decode(&buf).unwrap(), msg);

    assert_eq!(
        ProgressMsg::decode(&buf[..15]),
        Err(WireError::BadProgressLength { got: 15 })
    );
    let long = [0u8; 17];
    assert_eq!(
        ProgressMsg::decode(&long),
        Err(WireError::BadProgressLength { got: 17 })
    );
}

#[test]
fn test_progress_big_endian_layout() {
    let msg = ProgressMsg {
        nfilled: 0x0102_0304_0506_0708,
        nleftover: 0,
    };
    let mut buf = [0u8; PROGRESS_LEN];
    msg.encode(&mut buf).unwrap();
    assert_eq!(&buf[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_initial_roundtrip() {
    let msg = InitialMsg {
        nonce: [7u8; 16],
        nsources: 1,
        id: 0,
        addr: b"127.0.0.1:4242".to_vec(),
    };
    let mut buf = [0u8; INITIAL_LEN];
    msg.encode(&mut buf).unwrap();
    let back = InitialMsg::decode(&buf).unwrap();
    assert_eq!(back, msg);
}

#[test]
fn test_initial_addr_bounds() {
    let msg = InitialMsg {
        nonce: [0u8; 16],
        nsources: 1,
        id: 0,
        addr: vec![0xAB; ADDR_CAP + 1],
    };
    let mut buf = [0u8; INITIAL_LEN];
    assert_eq!(
        msg.encode(&mut buf),
        Err(WireError::AddrTooLong { len: ADDR_CAP + 1 })
    );

    // A frame whose addrlen field overruns the fixed field is rejected too.
    let good = InitialMsg {
        nonce: [0u8; 16],
        nsources: 1,
        id: 0,
        addr: vec![1, 2, 3],
    };
    good.encode(&mut buf).unwrap();
    buf[24..28].copy_from_slice(&((ADDR_CAP as u32) + 1).to_be_bytes());
    assert!(matches!(
        InitialMsg::decode(&buf),
        Err(WireError::AddrTooLong { .. })
    ));
}

#[test]
fn test_ack_roundtrip_and_truncation() {
    let msg = AckMsg {
        addr: b"192.168.0.9:4242".to_vec(),
    };
    let mut buf = [0u8; ACK_LEN];
    msg.encode(&mut buf).unwrap();
    assert_eq!(AckMsg::decode(&buf).unwrap(), msg);

    assert!(matches!(
        AckMsg::decode(&buf[..ACK_LEN - 1]),
        Err(WireError::Truncated { .. })
    ));
}
