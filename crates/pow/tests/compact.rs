use chimed_pow::difficulty::{
    compact_to_target, compact_to_u256, hash_meets_target, target_to_compact, u256_to_compact,
    CompactError,
};
use primitive_types::U256;

#[test]
fn compact_to_target_roundtrip() {
    for bits in [0x1d00ffffu32, 0x1b04be6a, 0x1e0fffff, 0x207fffff, 0x03123456, 0x04123456] {
        let target = compact_to_target(bits).expect("target");
        assert_eq!(target_to_compact(&target), bits);
    }
}

#[test]
fn compact_target_layout() {
    let bits = 0x207fffff;
    let target = compact_to_target(bits).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
}

#[test]
fn roundtrip_stays_within_one_ulp() {
    // Encoding keeps only the top three bytes; re-decoding must never
    // produce a larger value than re-encoding started from.
    for value in [
        U256::from(0x12345678u64),
        U256::from(0xffffffffu64),
        U256::from(1u64) << 200,
        (U256::from(1u64) << 200) + U256::from(0x1234u64),
    ] {
        let bits = u256_to_compact(value);
        let decoded = compact_to_u256(bits).expect("decode");
        assert!(decoded <= value);

        let exponent = (bits >> 24) as usize;
        let ulp = if exponent <= 3 {
            U256::from(1u64)
        } else {
            U256::from(1u64) << (8 * (exponent - 3))
        };
        assert!(value - decoded < ulp);
    }
}

#[test]
fn zero_and_small_values() {
    assert_eq!(u256_to_compact(U256::zero()), 0);
    assert_eq!(compact_to_u256(0).expect("zero"), U256::zero());

    assert_eq!(u256_to_compact(U256::from(0x80u64)), 0x0200_8000);
    assert_eq!(
        compact_to_u256(0x0200_8000).expect("decode"),
        U256::from(0x80u64)
    );
}

#[test]
fn sign_and_overflow_flags() {
    assert_eq!(compact_to_u256(0x0180_3456), Err(CompactError::Negative));
    assert_eq!(compact_to_u256(0x2312_3456), Err(CompactError::Overflow));
    assert_eq!(compact_to_u256(0x2201_2345), Err(CompactError::Overflow));
    // A zero mantissa carries no sign and cannot overflow.
    assert_eq!(compact_to_u256(0x0080_0000).expect("zero word"), U256::zero());
    assert_eq!(compact_to_u256(0xff00_0000).expect("zero word"), U256::zero());
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    let smaller = [0x00u8; 32];
    let larger = [0xffu8; 32];
    assert!(hash_meets_target(&smaller, &target));
    assert!(!hash_meets_target(&larger, &target));
    assert!(hash_meets_target(&target, &target));
}
