//! Property-based tests for the BPv7 bundle codec.
//!
//! These verify roundtrip correctness for the CBOR primitives and whole
//! bundles across the value range, plus CRC rejection of corrupted input.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use waypost_cbor::primitives::{write_uint, CborReader};
use waypost_cbor::{decode_bundle, encode_bundle};
use waypost_common::block::CanonicalData;
use waypost_common::{
    AdminRecord, BlockType, CanonicalHeader, CreationTimestamp, CrcType, CustodyAcceptPayload,
    IpnAddr, PrimaryFields,
};

// ─── Strategies ─────────────────────────────────────────────────────────────

/// Values spanning every CBOR head width.
fn uint_value() -> impl Strategy<Value = u64> {
    prop_oneof![
        0u64..24,
        24u64..256,
        256u64..65_536,
        65_536u64..=u32::MAX as u64,
        u32::MAX as u64 + 1..=u64::MAX,
    ]
}

fn ipn_addr() -> impl Strategy<Value = IpnAddr> {
    (0u64..1_000_000, 0u64..65_536).prop_map(|(node, service)| IpnAddr { node, service })
}

fn crc_type() -> impl Strategy<Value = CrcType> {
    prop_oneof![Just(CrcType::Crc16), Just(CrcType::Crc32c)]
}

fn primary() -> impl Strategy<Value = PrimaryFields> {
    (
        crc_type(),
        ipn_addr(),
        ipn_addr(),
        ipn_addr(),
        uint_value(),
        0u64..1u64 << 40,
        0u64..1u64 << 32,
    )
        .prop_map(
            |(crc_type, destination, source, report_to, time, sequence, lifetime)| PrimaryFields {
                flags: 0,
                crc_type,
                destination,
                source,
                report_to,
                timestamp: CreationTimestamp {
                    time: time % (1 << 40),
                    sequence,
                },
                lifetime,
            },
        )
}

fn extension_block() -> impl Strategy<Value = (CanonicalHeader, CanonicalData)> {
    prop_oneof![
        (2u64..100, any::<u64>()).prop_map(|(num, age)| {
            (
                CanonicalHeader {
                    block_type: BlockType::BundleAge,
                    block_num: num,
                    flags: 0,
                    crc_type: CrcType::Crc16,
                },
                CanonicalData::BundleAge(age),
            )
        }),
        (2u64..100, ipn_addr()).prop_map(|(num, addr)| {
            (
                CanonicalHeader {
                    block_type: BlockType::PreviousNode,
                    block_num: num,
                    flags: 0,
                    crc_type: CrcType::Crc32c,
                },
                CanonicalData::PreviousNode(addr),
            )
        }),
        (2u64..100, ipn_addr()).prop_map(|(num, addr)| {
            (
                CanonicalHeader {
                    block_type: BlockType::CustodyTracking,
                    block_num: num,
                    flags: 0,
                    crc_type: CrcType::Crc16,
                },
                CanonicalData::CustodyTracking {
                    current_custodian: addr,
                },
            )
        }),
    ]
}

fn payload_block() -> impl Strategy<Value = (CanonicalHeader, CanonicalData)> {
    (crc_type(), proptest::collection::vec(any::<u8>(), 0..512)).prop_map(|(crc_type, data)| {
        (
            CanonicalHeader {
                block_type: BlockType::Payload,
                block_num: 1,
                flags: 0,
                crc_type,
            },
            CanonicalData::Payload(Bytes::from(data)),
        )
    })
}

// ─── Properties ─────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn uint_roundtrip(val in uint_value()) {
        let mut buf = BytesMut::new();
        write_uint(&mut buf, val);
        let mut rd = CborReader::new(&buf);
        prop_assert_eq!(rd.read_uint().unwrap(), val);
        prop_assert_eq!(rd.remaining(), 0);
    }

    #[test]
    fn bundle_roundtrip(
        pri in primary(),
        exts in proptest::collection::vec(extension_block(), 0..4),
        payload in payload_block(),
    ) {
        let mut blocks = exts.clone();
        blocks.push(payload);
        let wire = encode_bundle(&pri, &blocks);
        let decoded = decode_bundle(&wire).unwrap();

        prop_assert_eq!(decoded.primary, pri);
        prop_assert_eq!(decoded.blocks.len(), blocks.len());
        // Payload comes out last; extension blocks keep their relative order.
        let mut expected: Vec<&(CanonicalHeader, CanonicalData)> = exts.iter().collect();
        expected.push(blocks.last().unwrap());
        for (got, want) in decoded.blocks.iter().zip(expected) {
            prop_assert_eq!(got.header, want.0);
            prop_assert_eq!(&got.data, &want.1);
        }
    }

    #[test]
    fn reencode_of_decode_is_identical(
        pri in primary(),
        exts in proptest::collection::vec(extension_block(), 0..4),
        payload in payload_block(),
    ) {
        let mut blocks = exts;
        blocks.push(payload);
        let wire = encode_bundle(&pri, &blocks);
        let decoded = decode_bundle(&wire).unwrap();
        let logical: Vec<_> = decoded
            .blocks
            .iter()
            .map(|b| (b.header, b.data.clone()))
            .collect();
        let rewire = encode_bundle(&decoded.primary, &logical);
        prop_assert_eq!(&wire[..], &rewire[..]);
    }

    #[test]
    fn single_bit_corruption_is_rejected(
        pri in primary(),
        payload in payload_block(),
        bit in 0usize..64,
    ) {
        let wire = encode_bundle(&pri, &[payload]);
        // Flip a bit somewhere inside the primary block span.
        let idx = 1 + (bit % (wire.len() - 2));
        let mut bad = wire.clone();
        bad[idx] ^= 1 << (bit % 8);
        // Either a structural decode error or a CRC mismatch; never success
        // with different bytes silently accepted.
        if let Ok(decoded) = decode_bundle(&bad) {
            let logical: Vec<_> = decoded
                .blocks
                .iter()
                .map(|b| (b.header, b.data.clone()))
                .collect();
            let rewire = encode_bundle(&decoded.primary, &logical);
            prop_assert_eq!(&rewire[..], &bad[..]);
        }
    }
}

#[test]
fn custody_accept_admin_record_roundtrip() {
    let pri = PrimaryFields {
        flags: waypost_common::block::bundle_flags::IS_ADMIN_RECORD
            | waypost_common::block::bundle_flags::MUST_NOT_FRAGMENT,
        crc_type: CrcType::Crc16,
        destination: IpnAddr::new(5, 1),
        source: IpnAddr::new(10, 1),
        report_to: IpnAddr::new(10, 1),
        timestamp: CreationTimestamp {
            time: 123_456,
            sequence: 0,
        },
        lifetime: 86_400_000,
    };
    let payload = (
        CanonicalHeader {
            block_type: BlockType::CustodyAcceptPayload,
            block_num: 1,
            flags: 0,
            crc_type: CrcType::Crc16,
        },
        CanonicalData::Admin(AdminRecord::CustodyAccept(CustodyAcceptPayload {
            flow_source_eid: IpnAddr::new(20, 2),
            sequence_nums: vec![100, 101, 102],
        })),
    );
    let wire = encode_bundle(&pri, &[payload.clone()]);
    let decoded = decode_bundle(&wire).unwrap();
    assert_eq!(decoded.blocks.len(), 1);
    assert_eq!(decoded.blocks[0].header.block_type, BlockType::CustodyAcceptPayload);
    assert_eq!(decoded.blocks[0].data, payload.1);
}


