use std::fmt;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str;
use std::str::FromStr;

use anyhow::{Error, Result};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use strum_macros;
use strum_macros::EnumString;
use thiserror::Error;

lazy_static! {
    static ref TAG_REGEX: Regex = Regex::new(r"tag=([^;>\s]+)").unwrap();
    static ref BRANCH_REGEX: Regex = Regex::new(r"branch=([^;>\s]+)").unwrap();
    static ref URI_USER_REGEX: Regex = Regex::new(r"sips?:([^@;>\s]+)@").unwrap();
}

#[derive(strum_macros::Display, EnumString, Debug, PartialEq, Eq, Hash, Clone)]
pub enum Method {
    INVITE,
    ACK,
    BYE,
    CANCEL,
    REGISTER,
    OPTIONS,
    INFO,
    UPDATE,
    PRACK,
    SUBSCRIBE,
    NOTIFY,
    MESSAGE,
    REFER,
}

impl Default for Method {
    fn default() -> Self {
        Method::INVITE
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed sip message")]
    MalformedMessage,
    #[error("message is not a request")]
    NotRequest,
    #[error("message is not a response")]
    NotResponse,
    #[error("via header is not in message")]
    NoVia,
    #[error("invalid cseq header")]
    InvalidCseq,
}

#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct Cseq {
    pub seq: u32,
    pub method: Method,
}

impl FromStr for Cseq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().splitn(2, ' ').collect();
        if parts.len() != 2 {
            Err(MessageError::InvalidCseq)?;
        }
        let seq = parts[0]
            .parse::<u32>()
            .map_err(|_| MessageError::InvalidCseq)?;
        let method = Method::from_str(parts[1].trim())
            .map_err(|_| MessageError::InvalidCseq)?;
        Ok(Cseq { seq, method })
    }
}

impl Display for Cseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A SIP request or response.
///
/// Requests carry `method` + `request_uri`, responses `code` + `status`.
/// Headers are an ordered map with lowercased names, so lookups are
/// case-insensitive; repeated headers fold into one comma-joined value.
#[derive(Default, Debug, Clone)]
pub struct Message {
    pub method: Option<Method>,
    pub request_uri: Option<String>,
    pub code: Option<i32>,
    pub status: Option<String>,
    pub version: String,
    pub headers: IndexMap<String, String>,
    pub body: Vec<u8>,

    /// Where the message came from or goes to; transport annotation only,
    /// never serialized.
    pub remote: Option<SocketAddr>,
}

impl Message {
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.code.is_some()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    /// Insert or replace a header, keeping first-insertion order.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_lowercase(), value.into());
    }

    /// Append a header; an existing value under the same name is extended
    /// with a comma, the way repeated headers combine on the wire.
    pub fn add_header(&mut self, name: &str, value: &str) {
        let key = name.to_lowercase();
        match self.headers.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.headers.insert(key, value.to_string());
            }
        }
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.shift_remove(&name.to_lowercase())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("call-id")
    }

    pub fn cseq(&self) -> Result<Cseq> {
        let value = self.header("cseq").ok_or(MessageError::InvalidCseq)?;
        Cseq::from_str(value)
    }

    /// `tag=` parameter of a header value, terminated by `;`, `>`,
    /// whitespace, or the end of the value.
    pub fn tag(value: &str) -> Option<String> {
        TAG_REGEX
            .captures(value)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("from").and_then(Message::tag)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("to").and_then(Message::tag)
    }

    /// Branch parameter of the topmost Via.
    pub fn branch(&self) -> Option<String> {
        let via = self.header("via")?;
        BRANCH_REGEX
            .captures(via)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// User part of the first SIP URI inside a header value or request URI.
    pub fn uri_user(value: &str) -> Option<String> {
        URI_USER_REGEX
            .captures(value)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// A response seeded with the request's Via, From, To, Call-ID and
    /// CSeq. Adding a to-tag for non-100 responses is the caller's job, as
    /// is replacing the zero Content-Length when a body is attached.
    pub fn response_to(req: &Message, code: i32, status: &str) -> Message {
        let mut resp = Message {
            code: Some(code),
            status: Some(status.to_string()),
            version: "SIP/2.0".to_string(),
            remote: req.remote,
            ..Default::default()
        };
        for name in ["via", "from", "to", "call-id", "cseq"] {
            if let Some(value) = req.header(name) {
                resp.set_header(name, value);
            }
        }
        resp.set_header("content-length", "0");
        resp
    }

    /// Attach a body, maintaining Content-Length and Content-Type. The
    /// serializer itself never computes Content-Length.
    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) {
        self.set_header("content-type", content_type);
        self.set_header("content-length", body.len().to_string());
        self.body = body;
    }

    pub fn parse(input: &[u8]) -> Result<Message> {
        if input.is_empty() {
            Err(MessageError::MalformedMessage)?;
        }
        let text =
            str::from_utf8(input).map_err(|_| MessageError::MalformedMessage)?;

        let (head, body) = split_head_and_body(text);

        let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));
        let start_line =
            lines.next().ok_or(MessageError::MalformedMessage)?.trim();

        let mut msg = Message {
            version: "SIP/2.0".to_string(),
            body: body.as_bytes().to_vec(),
            ..Default::default()
        };

        if start_line.starts_with("SIP/") {
            let parts: Vec<&str> = start_line.splitn(3, ' ').collect();
            if parts.len() < 3 {
                Err(MessageError::MalformedMessage)?;
            }
            msg.version = parts[0].to_string();
            msg.code = Some(
                parts[1]
                    .parse::<i32>()
                    .map_err(|_| MessageError::MalformedMessage)?,
            );
            msg.status = Some(parts[2].trim().to_string());
        } else {
            let parts: Vec<&str> = start_line.split_whitespace().collect();
            if parts.len() < 3 {
                Err(MessageError::MalformedMessage)?;
            }
            msg.method = Some(
                Method::from_str(parts[0])
                    .map_err(|_| MessageError::MalformedMessage)?,
            );
            msg.request_uri = Some(parts[1].to_string());
            msg.version = parts[2].to_string();
        }

        let mut current: Option<(String, String)> = None;
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation line, folded in with a single space.
                if let Some((_, value)) = current.as_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = current.take() {
                msg.add_header(&name, &value);
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            current = Some((name.trim().to_lowercase(), value.trim().to_string()));
        }
        if let Some((name, value)) = current.take() {
            msg.add_header(&name, &value);
        }

        Ok(msg)
    }

    /// Wire form. CRLF line endings always, body appended verbatim.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        if self.is_request() {
            out.extend_from_slice(
                format!(
                    "{} {} {}\r\n",
                    self.method.as_ref().unwrap_or(&Method::INVITE),
                    self.request_uri.as_deref().unwrap_or_default(),
                    self.version,
                )
                .as_bytes(),
            );
        } else {
            out.extend_from_slice(
                format!(
                    "{} {} {}\r\n",
                    self.version,
                    self.code.unwrap_or(0),
                    self.status.as_deref().unwrap_or_default(),
                )
                .as_bytes(),
            );
        }
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn split_head_and_body(input: &str) -> (&str, &str) {
    // CRLF is what we emit, but bare LF is tolerated on input.
    if let Some(pos) = input.find("\r\n\r\n") {
        let (head, rest) = input.split_at(pos);
        return (head, &rest[4..]);
    }
    if let Some(pos) = input.find("\n\n") {
        let (head, rest) = input.split_at(pos);
        return (head, &rest[2..]);
    }
    (input, "")
}

impl FromStr for Message {
    type Err = Error;

    fn from_str(s: &str) -> Result<Message, Error> {
        Message::parse(s.as_bytes())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK123456\r\n\
        From: <sip:alice@example.com>;tag=abc123\r\n\
        To: <sip:bob@example.com>\r\n\
        Call-ID: call123@192.168.1.100\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_invite() {
        let msg = Message::from_str(INVITE).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method, Some(Method::INVITE));
        assert_eq!(msg.request_uri.as_deref(), Some("sip:bob@example.com"));
        assert_eq!(msg.call_id(), Some("call123@192.168.1.100"));
        let cseq = msg.cseq().unwrap();
        assert_eq!(cseq.seq, 1);
        assert_eq!(cseq.method, Method::INVITE);
        assert_eq!(msg.from_tag().as_deref(), Some("abc123"));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.branch().as_deref(), Some("z9hG4bK123456"));
    }

    #[test]
    fn test_parse_response() {
        let msg = Message::from_str(
            "SIP/2.0 180 Ringing\r\nCSeq: 2 INVITE\r\nCall-ID: x\r\n\r\n",
        )
        .unwrap();
        assert!(msg.is_response());
        assert_eq!(msg.code, Some(180));
        assert_eq!(msg.status.as_deref(), Some("Ringing"));
        assert_eq!(msg.version, "SIP/2.0");
    }

    #[test]
    fn test_header_case_insensitive() {
        let msg = Message::from_str(INVITE).unwrap();
        assert_eq!(msg.header("CALL-ID"), msg.header("call-id"));
        assert_eq!(msg.header("CSeq"), msg.header("cseq"));
        assert_eq!(msg.header("VIA"), msg.header("Via"));
    }

    #[test]
    fn test_roundtrip() {
        let msg = Message::from_str(INVITE).unwrap();
        let reparsed = Message::parse(&msg.to_bytes()).unwrap();
        assert_eq!(reparsed.method, msg.method);
        assert_eq!(reparsed.request_uri, msg.request_uri);
        assert_eq!(reparsed.version, msg.version);
        assert_eq!(
            reparsed.headers().collect::<Vec<_>>(),
            msg.headers().collect::<Vec<_>>()
        );
        assert_eq!(reparsed.body, msg.body);
    }

    #[test]
    fn test_roundtrip_with_body() {
        let mut msg = Message {
            method: Some(Method::MESSAGE),
            request_uri: Some("sip:bob@example.com".to_string()),
            version: "SIP/2.0".to_string(),
            ..Default::default()
        };
        msg.set_header("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKxyz");
        msg.set_header("Call-ID", "abc");
        msg.set_body(b"hello there".to_vec(), "text/plain");

        let reparsed = Message::parse(&msg.to_bytes()).unwrap();
        assert_eq!(reparsed.body, b"hello there");
        assert_eq!(reparsed.header("content-length"), Some("11"));
        assert_eq!(reparsed.header("content-type"), Some("text/plain"));
    }

    #[test]
    fn test_lf_only_tolerated() {
        let msg = Message::from_str(
            "BYE sip:a@b SIP/2.0\nCall-ID: lf1\nCSeq: 3 BYE\n\nrest",
        )
        .unwrap();
        assert_eq!(msg.method, Some(Method::BYE));
        assert_eq!(msg.call_id(), Some("lf1"));
        assert_eq!(msg.body, b"rest");
    }

    #[test]
    fn test_continuation_folded() {
        let msg = Message::from_str(
            "OPTIONS sip:a@b SIP/2.0\r\nSubject: first\r\n second\r\n\tthird\r\n\r\n",
        )
        .unwrap();
        assert_eq!(msg.header("subject"), Some("first second third"));
    }

    #[test]
    fn test_repeated_headers_fold() {
        let msg = Message::from_str(
            "OPTIONS sip:a@b SIP/2.0\r\nRoute: <sip:p1>\r\nRoute: <sip:p2>\r\n\r\n",
        )
        .unwrap();
        assert_eq!(msg.header("route"), Some("<sip:p1>, <sip:p2>"));
    }

    #[test]
    fn test_malformed() {
        assert!(Message::parse(b"").is_err());
        assert!(Message::from_str("INVITE sip:a@b\r\n\r\n").is_err());
        assert!(Message::from_str("SIP/2.0 two hundred OK\r\n\r\n").is_err());
    }

    #[test]
    fn test_response_builder_seeds_headers() {
        let req = Message::from_str(INVITE).unwrap();
        let resp = Message::response_to(&req, 180, "Ringing");
        assert_eq!(resp.code, Some(180));
        assert_eq!(resp.header("via"), req.header("via"));
        assert_eq!(resp.header("from"), req.header("from"));
        assert_eq!(resp.header("to"), req.header("to"));
        assert_eq!(resp.header("call-id"), req.header("call-id"));
        assert_eq!(resp.header("cseq"), req.header("cseq"));
        assert_eq!(resp.header("content-length"), Some("0"));
    }

    #[test]
    fn test_uri_user() {
        assert_eq!(
            Message::uri_user("<sip:alice@example.com>;tag=1"),
            Some("alice".to_string())
        );
        assert_eq!(
            Message::uri_user("\"Bob\" <sips:bob@host:5061>"),
            Some("bob".to_string())
        );
        assert_eq!(Message::uri_user("<sip:example.com>"), None);
    }

    #[test]
    fn test_tag_terminators() {
        assert_eq!(
            Message::tag("<sip:a@b>;tag=x7;other=1").as_deref(),
            Some("x7")
        );
        assert_eq!(
            Message::tag("<sip:a@b;tag=inner>").as_deref(),
            Some("inner")
        );
        assert_eq!(Message::tag("sip:a@b;tag=sp ace").as_deref(), Some("sp"));
        assert_eq!(Message::tag("<sip:a@b>"), None);
    }
}
