use fab_wire::{MrKey, ProgressMsg, RemoteIov, VECTOR_CAP, VectorMsg};
use proptest::prelude::*;

proptest! {
    /// Decoding never panics, whatever bytes arrive off the wire.
    #[test]
    fn decode_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..600)) {
        let _ = VectorMsg::decode(&bytes);
        let _ = ProgressMsg::decode(&bytes);
        let _ = fab_wire::InitialMsg::decode(&bytes);
        let _ = fab_wire::AckMsg::decode(&bytes);
    }

    /// Any in-window vector survives an encode/decode trip intact.
    #[test]
    fn vector_roundtrip(iovs in proptest::collection::vec((any::<u64>(), any::<u64>(), any::<u64>()), 0..=12)) {
        let msg = VectorMsg {
            iovs: iovs
                .into_iter()
                .map(|(addr, len, key)| RemoteIov { addr, len, key: MrKey(key) })
                .collect(),
        };
        let mut buf = [0u8; VECTOR_CAP];
        let used = msg.encode(&mut buf).unwrap();
        prop_assert_eq!(VectorMsg::decode(&buf[..used]).unwrap(), msg);
    }
}
