//! CONTEXT: Tests for the `struct rtprio` wire layout
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 2 integration tests
//!
//! TEST_SCENARIOS:
//!   - every_class_survives_encoding(): each scheduling class decodes to itself
//!   - trailing_bytes_ignored(): oversized buffers decode from the first four bytes
use kaccess_abi::rtprio::{RtPrioType, SchedulingClass, RTP_PRIO_MAX};

#[test]
fn every_class_survives_encoding() {
    for class in SchedulingClass::ALL {
        let rtp = RtPrioType::new(class, RTP_PRIO_MAX);
        assert_eq!(RtPrioType::decode(&rtp.encode()), Ok(rtp));
    }
}

#[test]
fn trailing_bytes_ignored() {
    let buf = [2u8, 0, 5, 0, 0xff, 0xff];
    let rtp = RtPrioType::decode(&buf).unwrap();
    assert_eq!(rtp.class(), SchedulingClass::Realtime);
    assert_eq!(rtp.priority(), 5);
}
