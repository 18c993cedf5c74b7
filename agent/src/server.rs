use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use async_channel::{Receiver, Sender};
use media::packet::PayloadType;
use media::sdp::{self, SessionDescription};
use media::transport::RtpTransport;
use media::RtpSession;
use sip::message::{Cseq, Message, Method};
use sip::transaction::{self, TimerEvent, TransactionManager, TransactionType};
use sip::transport::SipEvent;
use sip::udp::UdpTransport;
use tracing::{debug, info, warn};

use crate::call::{AgentStats, Call, CallState, CallSummary, Registration};
use crate::config::Config;

const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER";

/// Internal events the agent schedules for itself.
pub enum AgentEvent {
    /// Ring interval elapsed; answer the call.
    Answer(String),
}

/// The user agent: owns the user table, the call table, the transaction
/// manager and the counters. Everything runs on one event loop; timers and
/// the transport feed it through channels.
pub struct UserAgent {
    config: Config,
    local_ip: String,
    transport: UdpTransport,
    transactions: TransactionManager,
    sip_events: Receiver<SipEvent>,
    timer_events: Receiver<TimerEvent>,
    agent_tx: Sender<AgentEvent>,
    agent_rx: Receiver<AgentEvent>,

    users: HashMap<String, Registration>,
    calls: HashMap<String, Call>,
    registered: bool,

    calls_received: u64,
    calls_completed: u64,
    calls_failed: u64,
    parse_errors: u64,
    started: Instant,
}

impl UserAgent {
    pub async fn new(config: Config) -> Result<UserAgent> {
        let local_ip = config.local_ip();
        let transport =
            UdpTransport::bind(&format!("0.0.0.0:{}", config.sip_port)).await?;
        info!("sip listening on {}", transport.local_addr());

        let (sip_tx, sip_events) = async_channel::unbounded();
        transport.listen(sip_tx);

        let (timer_tx, timer_events) = async_channel::unbounded();
        let transactions = TransactionManager::new(transport.clone(), timer_tx);

        let (agent_tx, agent_rx) = async_channel::unbounded();

        Ok(UserAgent {
            config,
            local_ip,
            transport,
            transactions,
            sip_events,
            timer_events,
            agent_tx,
            agent_rx,
            users: HashMap::new(),
            calls: HashMap::new(),
            registered: false,
            calls_received: 0,
            calls_completed: 0,
            calls_failed: 0,
            parse_errors: 0,
            started: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Serve until the transport closes. One select loop; nothing runs off
    /// this executor except socket pumps and sleep timers.
    pub async fn run(&mut self) -> Result<()> {
        // Receivers are cloned out so the select borrows locals while the
        // handlers borrow the agent.
        let sip_events = self.sip_events.clone();
        let timer_events = self.timer_events.clone();
        let agent_rx = self.agent_rx.clone();
        loop {
            tokio::select! {
                event = sip_events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(_) => break,
                    }
                }
                event = timer_events.recv() => {
                    if let Ok(event) = event {
                        if let Err(e) = self.transactions.handle_timer(event).await
                        {
                            debug!("timer event error: {e}");
                        }
                        self.reap_timeouts();
                    }
                }
                event = agent_rx.recv() => {
                    if let Ok(event) = event {
                        if let Err(e) = self.handle_agent_event(event).await {
                            warn!("agent event error: {e}");
                        }
                    }
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Terminate every active call, then let go of the transport.
    async fn shutdown(&mut self) {
        let ids: Vec<String> = self.calls.keys().cloned().collect();
        for id in ids {
            self.finish_call(&id);
        }
    }

    pub async fn handle_event(&mut self, event: SipEvent) {
        match event {
            SipEvent::Message(msg) => self.handle_msg(msg).await,
            SipEvent::ParseError => self.parse_errors += 1,
            SipEvent::Error(e) => warn!("transport error: {e}"),
        }
    }

    pub async fn handle_msg(&mut self, msg: Message) {
        let passed = match self.transactions.handle_msg(msg).await {
            Ok(passed) => passed,
            Err(e) => {
                self.parse_errors += 1;
                warn!("unroutable sip message: {e}");
                return;
            }
        };
        for msg in passed {
            let result = if msg.is_request() {
                self.handle_request(msg).await
            } else {
                self.handle_response(msg).await
            };
            if let Err(e) = result {
                warn!("sip dispatch error: {e}");
            }
        }
        self.reap_timeouts();
    }

    async fn handle_request(&mut self, msg: Message) -> Result<()> {
        match msg.method.clone() {
            Some(Method::REGISTER) => self.on_register(msg).await,
            Some(Method::INVITE) => self.on_invite(msg).await,
            Some(Method::ACK) => self.on_ack(msg),
            Some(Method::BYE) | Some(Method::CANCEL) => self.on_bye(msg).await,
            Some(Method::OPTIONS) => self.on_options(msg).await,
            _ => self.on_unsupported(msg).await,
        }
    }

    async fn on_register(&mut self, msg: Message) -> Result<()> {
        let user = msg.header("from").and_then(Message::uri_user);
        let contact = msg.header("contact").map(|c| c.to_string());
        let (Some(user), Some(contact), Some(remote)) =
            (user, contact, msg.remote)
        else {
            return self.reject(&msg, 400, "Bad Request").await;
        };

        let expires = msg
            .header("expires")
            .and_then(|e| e.parse::<u32>().ok())
            .unwrap_or(self.config.registration_expires);

        info!("register {user} at {remote} expires {expires}");
        self.users.insert(
            user.clone(),
            Registration {
                user,
                contact: contact.clone(),
                expires,
                remote,
                registered_at: Instant::now(),
            },
        );

        let mut resp = Message::response_to(&msg, 200, "OK");
        ensure_to_tag(&mut resp);
        resp.set_header("contact", contact);
        resp.set_header("expires", expires.to_string());
        self.transactions.respond(&msg, resp).await
    }

    async fn on_invite(&mut self, msg: Message) -> Result<()> {
        self.calls_received += 1;

        let callid = msg.call_id().map(|c| c.to_string());
        let (Some(callid), Some(from), Some(to), Some(remote)) = (
            callid,
            msg.header("from").map(|v| v.to_string()),
            msg.header("to").map(|v| v.to_string()),
            msg.remote,
        ) else {
            self.calls_failed += 1;
            return self.reject(&msg, 400, "Bad Request").await;
        };

        let user = Message::uri_user(&to);
        let known = user
            .as_deref()
            .map(|user| self.lookup_user(user).is_some())
            .unwrap_or(false);
        if !known {
            self.calls_failed += 1;
            return self.reject(&msg, 404, "Not Found").await;
        }

        if self.calls.contains_key(&callid) {
            warn!("invite for already active call {callid}");
            return self.reject(&msg, 486, "Busy Here").await;
        }

        let mut ringing = Message::response_to(&msg, 180, "Ringing");
        let to_tag = ensure_to_tag(&mut ringing);

        self.calls.insert(
            callid.clone(),
            Call {
                id: callid.clone(),
                local: to,
                remote: from,
                from_tag: msg.from_tag().unwrap_or_default(),
                to_tag: Some(to_tag),
                local_cseq: 1,
                remote_cseq: msg.cseq().map(|c| c.seq).unwrap_or(1),
                state: CallState::Incoming,
                started_at: Instant::now(),
                answered_at: None,
                ended_at: None,
                remote_addr: remote,
                remote_media: sdp::audio_endpoint(
                    &String::from_utf8_lossy(&msg.body),
                ),
                request: Some(msg.clone()),
                pending_media: None,
                media: None,
            },
        );

        self.transactions.respond(&msg, ringing).await?;

        // Auto-answer once the ring interval elapses.
        let agent_tx = self.agent_tx.clone();
        let ring = self.config.ring_duration();
        let id = callid.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ring).await;
            let _ = agent_tx.send(AgentEvent::Answer(id)).await;
        });

        Ok(())
    }

    pub async fn handle_agent_event(&mut self, event: AgentEvent) -> Result<()> {
        match event {
            AgentEvent::Answer(callid) => self.answer(&callid).await,
        }
    }

    /// Produce the 200 with the session body. Media is allocated here so
    /// the body can name the port; the loop starts on ACK.
    async fn answer(&mut self, callid: &str) -> Result<()> {
        let Some(call) = self.calls.get(callid) else {
            return Ok(());
        };
        if call.state != CallState::Incoming {
            return Ok(());
        }
        let Some(req) = call.request.clone() else {
            return Ok(());
        };

        let rtp = RtpTransport::bind(
            "0.0.0.0",
            self.config.rtp_port,
            self.config.rtp_port_range,
        )
        .await?;
        let session =
            RtpSession::new(PayloadType::Pcmu, &self.config.session_config());

        let body = SessionDescription {
            user: self.config.user.clone(),
            local_ip: self.local_ip.clone(),
            rtp_port: rtp.local_port(),
        }
        .to_string();

        let mut ok = Message::response_to(&req, 200, "OK");
        if let Some(call) = self.calls.get_mut(callid) {
            if let Some(tag) = call.to_tag.clone() {
                set_to_tag(&mut ok, &tag);
            } else {
                call.to_tag = Some(ensure_to_tag(&mut ok));
            }
            call.pending_media = Some((session, rtp));
        }
        ok.set_header(
            "contact",
            format!(
                "<sip:{}@{}:{}>",
                self.config.user,
                self.local_ip,
                self.local_addr().port()
            ),
        );
        ok.set_body(body.into_bytes(), "application/sdp");

        self.transactions.respond(&req, ok).await
    }

    fn on_ack(&mut self, msg: Message) -> Result<()> {
        let Some(call) = msg.call_id().and_then(|id| self.calls.get_mut(id))
        else {
            debug!("ack without matching call");
            return Ok(());
        };
        if !matches!(call.state, CallState::Incoming | CallState::Ringing) {
            return Ok(());
        }

        call.state = CallState::Established;
        call.answered_at = Some(Instant::now());
        info!("call {} established", call.id);

        if let Some((session, rtp)) = call.pending_media.take() {
            let remote = call
                .remote_media
                .as_ref()
                .and_then(|(host, port)| {
                    format!("{host}:{port}").parse::<SocketAddr>().ok()
                })
                .unwrap_or_else(|| {
                    // No usable session body from the peer: aim media at
                    // its signaling address.
                    call.remote_addr
                });
            call.media = Some(media::transport::spawn(session, rtp, remote));
        }

        Ok(())
    }

    async fn on_bye(&mut self, msg: Message) -> Result<()> {
        let callid = msg.call_id().map(|c| c.to_string()).unwrap_or_default();
        if !self.calls.contains_key(&callid) {
            return self
                .reject(&msg, 481, "Call/Transaction Does Not Exist")
                .await;
        }

        let mut resp = Message::response_to(&msg, 200, "OK");
        ensure_to_tag(&mut resp);
        self.transactions.respond(&msg, resp).await?;

        // A CANCEL also kills the pending INVITE transaction.
        if msg.method == Some(Method::CANCEL) {
            let invite = self
                .calls
                .get(&callid)
                .and_then(|call| call.request.clone());
            if let Some(invite) = invite {
                let mut terminated =
                    Message::response_to(&invite, 487, "Request Terminated");
                ensure_to_tag(&mut terminated);
                if let Err(e) =
                    self.transactions.respond(&invite, terminated).await
                {
                    debug!("487 for cancelled invite not sent: {e}");
                }
            }
        }

        self.finish_call(&callid);
        Ok(())
    }

    async fn on_options(&mut self, msg: Message) -> Result<()> {
        let mut resp = Message::response_to(&msg, 200, "OK");
        ensure_to_tag(&mut resp);
        resp.set_header("allow", ALLOW);
        resp.set_header("accept", "application/sdp");
        self.transactions.respond(&msg, resp).await
    }

    async fn on_unsupported(&mut self, msg: Message) -> Result<()> {
        self.reject(&msg, 501, "Not Implemented").await
    }

    async fn reject(&mut self, msg: &Message, code: i32, status: &str) -> Result<()> {
        let mut resp = Message::response_to(msg, code, status);
        ensure_to_tag(&mut resp);
        self.transactions.respond(msg, resp).await
    }

    async fn handle_response(&mut self, msg: Message) -> Result<()> {
        let cseq = msg.cseq()?;
        let code = msg.code.unwrap_or(0);

        match cseq.method {
            Method::REGISTER => {
                if (200..300).contains(&code) {
                    info!("registration accepted");
                    self.registered = true;
                } else if code >= 300 {
                    warn!("registration rejected with {code}");
                    self.registered = false;
                }
                Ok(())
            }
            Method::INVITE => self.on_invite_response(msg, code).await,
            _ => Ok(()),
        }
    }

    async fn on_invite_response(&mut self, msg: Message, code: i32) -> Result<()> {
        let Some(callid) = msg.call_id().map(|c| c.to_string()) else {
            return Ok(());
        };
        let Some(call) = self.calls.get_mut(&callid) else {
            debug!("invite response for unknown call {callid}");
            return Ok(());
        };

        match code {
            code if code < 200 => {
                if call.state == CallState::Calling && code >= 180 {
                    call.state = CallState::Ringing;
                }
                Ok(())
            }
            code if code < 300 => {
                call.state = CallState::Established;
                call.answered_at = Some(Instant::now());
                call.to_tag = msg.to_tag();
                call.remote_media = sdp::audio_endpoint(
                    &String::from_utf8_lossy(&msg.body),
                );

                let ack = self.build_ack(&callid, &msg)?;
                let remote = msg.remote.unwrap_or(
                    self.calls.get(&callid).map(|c| c.remote_addr).unwrap(),
                );
                self.transport.send(&ack, remote).await?;

                self.start_media(&callid);
                Ok(())
            }
            _ => {
                info!("call {callid} failed with {code}");
                let call = self.calls.get_mut(&callid).unwrap();
                call.state = CallState::Failed;
                self.finish_call(&callid);
                Ok(())
            }
        }
    }

    /// The ACK for a 2xx: a standalone request built from the response
    /// headers, on a fresh branch.
    fn build_ack(&mut self, callid: &str, resp: &Message) -> Result<Message> {
        let call = self.calls.get(callid);
        let request_uri = resp
            .header("contact")
            .and_then(contact_uri)
            .or_else(|| {
                call.and_then(|c| c.request.as_ref())
                    .and_then(|r| r.request_uri.clone())
            })
            .unwrap_or_default();

        let mut ack = Message {
            method: Some(Method::ACK),
            request_uri: Some(request_uri),
            version: "SIP/2.0".to_string(),
            ..Default::default()
        };
        ack.set_header(
            "via",
            format!(
                "SIP/2.0/UDP {}:{};branch={}",
                self.local_ip,
                self.local_addr().port(),
                transaction::branch()
            ),
        );
        for name in ["from", "to", "call-id"] {
            if let Some(value) = resp.header(name) {
                ack.set_header(name, value);
            }
        }
        let seq = resp.cseq().map(|c| c.seq).unwrap_or(1);
        ack.set_header(
            "cseq",
            Cseq {
                seq,
                method: Method::ACK,
            }
            .to_string(),
        );
        ack.set_header("max-forwards", "70");
        ack.set_header("content-length", "0");
        Ok(ack)
    }

    fn start_media(&mut self, callid: &str) {
        let Some(call) = self.calls.get_mut(callid) else {
            return;
        };
        let Some((session, rtp)) = call.pending_media.take() else {
            return;
        };
        let remote = call
            .remote_media
            .as_ref()
            .and_then(|(host, port)| {
                format!("{host}:{port}").parse::<SocketAddr>().ok()
            })
            .unwrap_or(call.remote_addr);
        call.media = Some(media::transport::spawn(session, rtp, remote));
    }

    /// Move a call out of the active set, stopping its media and folding
    /// its outcome into the totals. The outcome is judged by the state the
    /// call held before it went terminal.
    fn finish_call(&mut self, callid: &str) {
        let Some(mut call) = self.calls.remove(callid) else {
            return;
        };
        let reached_established =
            call.state == CallState::Established || call.answered_at.is_some();

        if !call.is_terminal() {
            call.state = if reached_established {
                CallState::Terminated
            } else {
                CallState::Failed
            };
        }
        call.ended_at = Some(Instant::now());

        if let Some(media) = call.media.take() {
            media.stop();
        }

        if reached_established {
            self.calls_completed += 1;
        } else {
            self.calls_failed += 1;
        }
        info!(
            "call {} finished {} (completed {} failed {})",
            call.id, call.state, self.calls_completed, self.calls_failed
        );
    }

    /// Transaction-layer timeouts: a timed-out INVITE client transaction
    /// fails its call; a timed-out REGISTER clears the registered flag.
    fn reap_timeouts(&mut self) {
        for key in self.transactions.take_timeouts() {
            warn!("transaction timeout: {key}");
            if key.tx_type != TransactionType::Client {
                continue;
            }
            match key.method {
                Method::INVITE => {
                    if let Some(call) = self.calls.get_mut(&key.callid) {
                        if call.state != CallState::Established {
                            call.state = CallState::Failed;
                            self.finish_call(&key.callid.clone());
                        }
                    }
                }
                Method::REGISTER => {
                    self.registered = false;
                }
                _ => {}
            }
        }
    }

    fn lookup_user(&mut self, user: &str) -> Option<&Registration> {
        if self.users.get(user).map(|r| r.expired()).unwrap_or(false) {
            self.users.remove(user);
        }
        self.users.get(user)
    }

    /// Send a REGISTER for our own identity to a registrar.
    pub async fn register(&mut self, registrar: SocketAddr) -> Result<()> {
        let user = self.config.user.clone();
        let host = registrar.ip();
        let mut msg = Message {
            method: Some(Method::REGISTER),
            request_uri: Some(format!("sip:{host}")),
            version: "SIP/2.0".to_string(),
            remote: Some(registrar),
            ..Default::default()
        };
        msg.set_header(
            "via",
            format!(
                "SIP/2.0/UDP {}:{};branch={}",
                self.local_ip,
                self.local_addr().port(),
                transaction::branch()
            ),
        );
        msg.set_header(
            "from",
            format!(
                "<sip:{user}@{host}>;tag={}",
                lark_utils::rand_string(10)
            ),
        );
        msg.set_header("to", format!("<sip:{user}@{host}>"));
        msg.set_header("call-id", lark_utils::uuid());
        msg.set_header("cseq", "1 REGISTER");
        msg.set_header(
            "contact",
            format!(
                "<sip:{user}@{}:{}>",
                self.local_ip,
                self.local_addr().port()
            ),
        );
        msg.set_header(
            "expires",
            self.config.registration_expires.to_string(),
        );
        msg.set_header("max-forwards", "70");
        msg.set_header("content-length", "0");

        self.transactions.send_request(&msg).await?;
        Ok(())
    }

    /// Place a call: allocate media, send the INVITE with our session
    /// body, and track the dialog in Calling state.
    pub async fn invite(
        &mut self,
        target: &str,
        server: SocketAddr,
    ) -> Result<String> {
        let user = self.config.user.clone();
        let host = server.ip();
        let callid = lark_utils::uuid();
        let from_tag = lark_utils::rand_string(10);

        let rtp = RtpTransport::bind(
            "0.0.0.0",
            self.config.rtp_port,
            self.config.rtp_port_range,
        )
        .await?;
        let session =
            RtpSession::new(PayloadType::Pcmu, &self.config.session_config());
        let body = SessionDescription {
            user: user.clone(),
            local_ip: self.local_ip.clone(),
            rtp_port: rtp.local_port(),
        }
        .to_string();

        let from = format!("<sip:{user}@{host}>;tag={from_tag}");
        let to = format!("<sip:{target}@{host}>");

        let mut msg = Message {
            method: Some(Method::INVITE),
            request_uri: Some(format!("sip:{target}@{host}")),
            version: "SIP/2.0".to_string(),
            remote: Some(server),
            ..Default::default()
        };
        msg.set_header(
            "via",
            format!(
                "SIP/2.0/UDP {}:{};branch={}",
                self.local_ip,
                self.local_addr().port(),
                transaction::branch()
            ),
        );
        msg.set_header("from", from.clone());
        msg.set_header("to", to.clone());
        msg.set_header("call-id", callid.clone());
        msg.set_header("cseq", "1 INVITE");
        msg.set_header(
            "contact",
            format!(
                "<sip:{user}@{}:{}>",
                self.local_ip,
                self.local_addr().port()
            ),
        );
        msg.set_header("max-forwards", "70");
        msg.set_body(body.into_bytes(), "application/sdp");

        self.calls.insert(
            callid.clone(),
            Call {
                id: callid.clone(),
                local: from,
                remote: to,
                from_tag,
                to_tag: None,
                local_cseq: 1,
                remote_cseq: 0,
                state: CallState::Calling,
                started_at: Instant::now(),
                answered_at: None,
                ended_at: None,
                remote_addr: server,
                remote_media: None,
                request: Some(msg.clone()),
                pending_media: Some((session, rtp)),
                media: None,
            },
        );

        self.transactions.send_request(&msg).await?;
        Ok(callid)
    }

    /// Hang up a local call with an in-dialog BYE.
    pub async fn bye(&mut self, callid: &str) -> Result<()> {
        let local_port = self.local_addr().port();
        let Some(call) = self.calls.get_mut(callid) else {
            return Ok(());
        };
        call.local_cseq += 1;

        let mut to = call.remote.clone();
        if let Some(tag) = call.to_tag.as_ref() {
            if Message::tag(&to).is_none() {
                to = format!("{to};tag={tag}");
            }
        }

        let mut msg = Message {
            method: Some(Method::BYE),
            request_uri: call
                .request
                .as_ref()
                .and_then(|r| r.request_uri.clone()),
            version: "SIP/2.0".to_string(),
            remote: Some(call.remote_addr),
            ..Default::default()
        };
        msg.set_header(
            "via",
            format!(
                "SIP/2.0/UDP {}:{};branch={}",
                self.local_ip,
                local_port,
                transaction::branch()
            ),
        );
        msg.set_header("from", call.local.clone());
        msg.set_header("to", to);
        msg.set_header("call-id", callid);
        msg.set_header(
            "cseq",
            Cseq {
                seq: call.local_cseq,
                method: Method::BYE,
            }
            .to_string(),
        );
        msg.set_header("max-forwards", "70");
        msg.set_header("content-length", "0");

        self.transactions.send_request(&msg).await?;
        self.finish_call(callid);
        Ok(())
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            calls_received: self.calls_received,
            calls_completed: self.calls_completed,
            calls_failed: self.calls_failed,
            active_calls: self.calls.len(),
            registered_users: self.users.len(),
            transactions: self.transactions.len(),
            parse_errors: self.parse_errors,
            uptime: self.started.elapsed(),
        }
    }

    pub fn registered_users(&self) -> Vec<Registration> {
        self.users.values().cloned().collect()
    }

    pub fn active_calls(&self) -> Vec<CallSummary> {
        self.calls
            .values()
            .map(|call| CallSummary {
                id: call.id.clone(),
                state: call.state,
                local: call.local.clone(),
                remote: call.remote.clone(),
                duration: call.started_at.elapsed(),
            })
            .collect()
    }
}

/// Add a to-tag if the To header does not carry one yet; returns the tag
/// in effect.
fn ensure_to_tag(resp: &mut Message) -> String {
    let to = resp.header("to").unwrap_or_default().to_string();
    if let Some(tag) = Message::tag(&to) {
        return tag;
    }
    let tag = lark_utils::rand_string(10);
    resp.set_header("to", format!("{to};tag={tag}"));
    tag
}

fn set_to_tag(resp: &mut Message, tag: &str) {
    let to = resp.header("to").unwrap_or_default().to_string();
    if Message::tag(&to).is_none() {
        resp.set_header("to", format!("{to};tag={tag}"));
    }
}

/// URI inside the angle brackets of a Contact-style value.
fn contact_uri(value: &str) -> Option<String> {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return Some(value[start + 1..end].to_string());
        }
    }
    let uri = value.split(';').next()?.trim();
    if uri.is_empty() {
        None
    } else {
        Some(uri.to_string())
    }
}
