// Session description handling: the canned audio offer/answer body we
// emit, and the minimal scan that pulls the peer's audio endpoint out of
// an incoming body. Full offer/answer negotiation is out of scope.

use std::fmt;

/// The fixed G.711 audio session body. Line order is significant and every
/// line is CRLF-terminated.
pub struct SessionDescription {
    pub user: String,
    pub local_ip: String,
    pub rtp_port: u16,
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o={} 1234567890 1234567890 IN IP4 {}\r\n",
            self.user, self.local_ip
        )?;
        write!(f, "s=VoIP Call\r\n")?;
        write!(f, "c=IN IP4 {}\r\n", self.local_ip)?;
        write!(f, "t=0 0\r\n")?;
        write!(f, "m=audio {} RTP/AVP 0 8\r\n", self.rtp_port)?;
        write!(f, "a=rtpmap:0 PCMU/8000\r\n")?;
        write!(f, "a=rtpmap:8 PCMA/8000\r\n")?;
        write!(f, "a=ptime:20\r\n")?;
        write!(f, "a=maxptime:40\r\n")?;
        Ok(())
    }
}

/// First `c=` address and `m=audio` port of a session body, enough to know
/// where to send RTP.
pub fn audio_endpoint(body: &str) -> Option<(String, u16)> {
    let mut ip = None;
    let mut port = None;
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("c=") {
            // c=IN IP4 <address>
            if ip.is_none() {
                ip = rest.split_whitespace().nth(2).map(|s| s.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            if port.is_none() {
                port = rest
                    .split_whitespace()
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
            }
        }
    }
    Some((ip?, port?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canned_body() {
        let sdp = SessionDescription {
            user: "alice".to_string(),
            local_ip: "192.168.1.100".to_string(),
            rtp_port: 10002,
        };
        let body = sdp.to_string();
        let lines: Vec<&str> = body.split("\r\n").collect();
        assert_eq!(lines[0], "v=0");
        assert_eq!(lines[1], "o=alice 1234567890 1234567890 IN IP4 192.168.1.100");
        assert_eq!(lines[2], "s=VoIP Call");
        assert_eq!(lines[3], "c=IN IP4 192.168.1.100");
        assert_eq!(lines[4], "t=0 0");
        assert_eq!(lines[5], "m=audio 10002 RTP/AVP 0 8");
        assert_eq!(lines[6], "a=rtpmap:0 PCMU/8000");
        assert_eq!(lines[7], "a=rtpmap:8 PCMA/8000");
        assert_eq!(lines[8], "a=ptime:20");
        assert_eq!(lines[9], "a=maxptime:40");
    }

    #[test]
    fn test_audio_endpoint_roundtrip() {
        let sdp = SessionDescription {
            user: "bob".to_string(),
            local_ip: "10.0.0.7".to_string(),
            rtp_port: 10044,
        };
        assert_eq!(
            audio_endpoint(&sdp.to_string()),
            Some(("10.0.0.7".to_string(), 10044))
        );
    }

    #[test]
    fn test_audio_endpoint_missing() {
        assert_eq!(audio_endpoint("v=0\r\ns=call\r\n"), None);
    }
}
