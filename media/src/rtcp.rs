// RTP Control Protocol report generation.
//
// Only the receiver-report struct is produced here; scheduling and sending
// RTCP is a transport concern that lives outside this crate.

use bytes::Bytes;
pub use rtcp::receiver_report::ReceiverReport;
pub use rtcp::reception_report::ReceptionReport;

// RTCP packet types occupy 200..=206 in the second header byte, where an
// RTP packet would carry marker + payload type.
const RTCP_PT_MIN: u8 = 200;
const RTCP_PT_MAX: u8 = 206;

pub fn is_rtcp(buf: &[u8]) -> bool {
    match buf.get(1) {
        Some(pt) => (RTCP_PT_MIN..=RTCP_PT_MAX).contains(pt),
        None => false,
    }
}

pub fn receiver_report(
    ssrc: u32,
    remote_ssrc: u32,
    fraction_lost: u8,
    total_lost: u32,
    highest_sequence: u32,
    jitter: u32,
) -> ReceiverReport {
    ReceiverReport {
        ssrc,
        reports: vec![ReceptionReport {
            ssrc: remote_ssrc,
            fraction_lost,
            total_lost,
            last_sequence_number: highest_sequence,
            jitter,
            last_sender_report: 0,
            delay: 0,
        }],
        profile_extensions: Bytes::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc_util::Marshal;

    #[test]
    fn test_is_rtcp() {
        assert!(is_rtcp(&[0x80, 200, 0, 0]));
        assert!(is_rtcp(&[0x80, 206, 0, 0]));
        assert!(!is_rtcp(&[0x80, 0, 0, 0]));
        assert!(!is_rtcp(&[0x80, 96, 0, 0]));
        assert!(!is_rtcp(&[0x80]));
    }

    #[test]
    fn test_receiver_report_marshals() {
        let report = receiver_report(1, 2, 64, 10, 0x0001_ffff, 3);
        let wire = report.marshal().unwrap();
        assert!(is_rtcp(&wire));
        assert_eq!(report.reports[0].fraction_lost, 64);
    }
}
