use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use async_channel::Sender;
use strum_macros;
use strum_macros::EnumString;
use thiserror::Error;
use tracing::debug;

use super::fsm::{self, Input, State};
use super::message::{Cseq, Message, MessageError, Method};
use super::udp::UdpTransport;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction does not exist")]
    TransactionNotExist,
    #[error("transaction already exists")]
    TransactionExist,
    #[error("transaction got invalid message")]
    TransactionNotValidMessage,
    #[error("message has no destination address")]
    AddrInvalid,
}

#[derive(strum_macros::Display, EnumString, PartialEq, Eq, Clone, Debug)]
pub enum TransactionType {
    Client,
    Server,
}

/// A branch token: the RFC 3261 magic cookie plus a random suffix.
pub fn branch() -> String {
    format!("z9hG4bK{}", lark_utils::rand_string(10))
}

/// Matching key for requests, retransmissions and responses:
/// branch, Call-ID, CSeq sequence and From header, plus the role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub callid: String,
    pub cseq: u32,
    pub from: String,
    pub tx_type: TransactionType,
    encoded: String,
}

impl TransactionKey {
    fn new(
        branch: String,
        method: Method,
        callid: String,
        cseq: u32,
        from: String,
        tx_type: TransactionType,
    ) -> TransactionKey {
        TransactionKey {
            encoded: format!(
                "{}|{}|{}|{}|{}|{}",
                &branch, &method, &callid, cseq, &from, &tx_type
            ),
            branch,
            method,
            callid,
            cseq,
            from,
            tx_type,
        }
    }
}

impl Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.encoded)
    }
}

/// Timer firing routed back to the owning executor. The epoch lets the
/// manager ignore firings that outlived their transaction incarnation.
#[derive(Debug, Clone)]
pub struct TimerEvent {
    pub key: TransactionKey,
    pub epoch: u64,
    pub input: Input,
}

struct TransactionState {
    state: State,
    request: Message,
    last_response: Option<Message>,
    response: Option<Message>,
    remote: SocketAddr,
    resend_count: usize,
    epoch: u64,
}

/// Owns every live transaction. All mutation happens on the executor that
/// owns the manager; timers re-enter through the event channel rather than
/// touching state from their own tasks.
pub struct TransactionManager {
    transactions: HashMap<String, TransactionState>,
    transport: UdpTransport,
    timer_tx: Sender<TimerEvent>,
    epochs: u64,
    timeouts: Vec<TransactionKey>,
    passups: Vec<Message>,
}

impl TransactionManager {
    pub const T1: Duration = Duration::from_millis(500);
    pub const T2: Duration = Duration::from_secs(4);
    pub const TIMER_B: Duration = Duration::from_secs(32);
    pub const TIMER_D: Duration = Duration::from_secs(32);
    pub const TIMER_F: Duration = Duration::from_secs(32);
    pub const TIMER_H: Duration = Duration::from_secs(32);
    pub const TIMER_I: Duration = Duration::from_secs(32);
    pub const TIMER_J: Duration = Duration::from_secs(32);
    pub const TIMER_K: Duration = Duration::from_secs(5);
    pub const MAX_RETRANSMITS: usize = 10;

    pub fn new(
        transport: UdpTransport,
        timer_tx: Sender<TimerEvent>,
    ) -> TransactionManager {
        TransactionManager {
            transactions: HashMap::new(),
            transport,
            timer_tx,
            epochs: 0,
            timeouts: Vec::new(),
            passups: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.transactions.contains_key(&key.encoded)
    }

    pub fn state_of(&self, key: &TransactionKey) -> Option<State> {
        self.transactions.get(&key.encoded).map(|tx| tx.state)
    }

    pub fn epoch_of(&self, key: &TransactionKey) -> Option<u64> {
        self.transactions.get(&key.encoded).map(|tx| tx.epoch)
    }

    /// Derive the matching key from a message. ACKs match the INVITE
    /// server transaction they acknowledge; response keys take the method
    /// from CSeq.
    pub fn key_for(
        msg: &Message,
        tx_type: &TransactionType,
    ) -> Result<TransactionKey> {
        let branch = msg.branch().ok_or(MessageError::NoVia)?;
        let cseq = msg.cseq()?;
        let method = match msg.is_request() {
            true => match msg.method.as_ref().unwrap_or(&Method::INVITE) {
                &Method::ACK => Method::INVITE,
                m => m.clone(),
            },
            false => cseq.method,
        };
        let callid = msg.call_id().unwrap_or_default().to_string();
        let from = msg.header("from").unwrap_or_default().to_string();
        Ok(TransactionKey::new(
            branch,
            method,
            callid,
            cseq.seq,
            from,
            tx_type.clone(),
        ))
    }

    fn get(&self, key: &TransactionKey) -> Result<&TransactionState> {
        self.transactions
            .get(&key.encoded)
            .ok_or_else(|| TransactionError::TransactionNotExist.into())
    }

    fn get_mut(&mut self, key: &TransactionKey) -> Result<&mut TransactionState> {
        self.transactions
            .get_mut(&key.encoded)
            .ok_or_else(|| TransactionError::TransactionNotExist.into())
    }

    fn create(
        &mut self,
        key: &TransactionKey,
        msg: &Message,
        state: State,
        remote: SocketAddr,
    ) -> Result<()> {
        if self.contains(key) {
            Err(TransactionError::TransactionExist)?;
        }
        self.epochs += 1;
        self.transactions.insert(
            key.encoded.clone(),
            TransactionState {
                state,
                request: msg.clone(),
                last_response: None,
                response: None,
                remote,
                resend_count: 0,
                epoch: self.epochs,
            },
        );
        Ok(())
    }

    /// Send a request, creating its client transaction and arming the
    /// retransmit and give-up timers.
    pub async fn send_request(&mut self, msg: &Message) -> Result<TransactionKey> {
        if !msg.is_request() {
            Err(MessageError::NotRequest)?;
        }
        let remote = msg.remote.ok_or(TransactionError::AddrInvalid)?;
        let key = Self::key_for(msg, &TransactionType::Client)?;

        let state = match key.method {
            Method::INVITE => State::Calling,
            _ => State::Trying,
        };
        self.create(&key, msg, state, remote)?;

        match key.method {
            Method::INVITE => {
                self.register_timer(&key, Self::T1, Input::TimerA);
                self.register_timer(&key, Self::TIMER_B, Input::TimerB);
            }
            _ => {
                self.register_timer(&key, Self::T1, Input::TimerE);
                self.register_timer(&key, Self::TIMER_F, Input::TimerF);
            }
        }

        self.transport.send(msg, remote).await?;
        Ok(key)
    }

    /// Register a server transaction for a request passed up to the agent.
    pub fn create_server(&mut self, msg: &Message) -> Result<TransactionKey> {
        let remote = msg.remote.ok_or(TransactionError::AddrInvalid)?;
        let key = Self::key_for(msg, &TransactionType::Server)?;
        let state = match key.method {
            Method::INVITE => State::Proceeding,
            _ => State::Trying,
        };
        self.create(&key, msg, state, remote)?;
        Ok(key)
    }

    /// Route an inbound message. Requests that match a live server
    /// transaction are absorbed (retransmissions replay the last
    /// response); fresh requests get a server transaction and are handed
    /// back for dispatch. Responses feed their client transaction and are
    /// handed back when the machine passes them up.
    pub async fn handle_msg(&mut self, msg: Message) -> Result<Vec<Message>> {
        if msg.is_request() {
            let key = Self::key_for(&msg, &TransactionType::Server)?;
            if self.contains(&key) {
                let input = match msg.method.as_ref() {
                    Some(Method::ACK) => Input::Ack,
                    Some(m) if *m == key.method => Input::Req,
                    _ => Err(TransactionError::TransactionNotValidMessage)?,
                };
                fsm::spin(self, &key, input).await?;
                return Ok(self.take_passups());
            }
            // An ACK for a 2xx stands alone; everything else opens a
            // server transaction before dispatch.
            if msg.method != Some(Method::ACK) {
                self.create_server(&msg)?;
            }
            return Ok(vec![msg]);
        }

        let key = Self::key_for(&msg, &TransactionType::Client)?;
        if !self.contains(&key) {
            debug!("response without transaction dropped: {}", key);
            return Ok(Vec::new());
        }
        let code = msg.code.unwrap_or(0);
        self.get_mut(&key)?.response = Some(msg);
        let input = match code {
            code if code < 200 => Input::Resp1xx,
            code if code < 300 => Input::Resp2xx,
            _ => Input::Resp300to699,
        };
        fsm::spin(self, &key, input).await?;
        Ok(self.take_passups())
    }

    /// Send a response through the matching server transaction.
    pub async fn respond(&mut self, req: &Message, resp: Message) -> Result<()> {
        let key = Self::key_for(req, &TransactionType::Server)?;
        if !self.contains(&key) {
            Err(TransactionError::TransactionNotExist)?;
        }
        let code = resp.code.ok_or(MessageError::NotResponse)?;
        self.get_mut(&key)?.last_response = Some(resp);
        let input = match code {
            code if code < 200 => Input::Resp1xx,
            code if code < 300 => Input::Resp2xx,
            _ => Input::Resp300to699,
        };
        fsm::spin(self, &key, input).await
    }

    /// A timer fired. Stale firings, from a transaction that terminated or
    /// was replaced, are dropped here; live ones spin the machine.
    pub async fn handle_timer(&mut self, event: TimerEvent) -> Result<()> {
        match self.epoch_of(&event.key) {
            Some(epoch) if epoch == event.epoch => {
                fsm::spin(self, &event.key, event.input).await
            }
            _ => Ok(()),
        }
    }

    /// Transactions that hit a timeout since the last call.
    pub fn take_timeouts(&mut self) -> Vec<TransactionKey> {
        std::mem::take(&mut self.timeouts)
    }

    fn take_passups(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.passups)
    }

    pub(crate) fn state(&self, key: &TransactionKey) -> Result<State> {
        Ok(self.get(key)?.state)
    }

    pub(crate) fn set_state(
        &mut self,
        key: &TransactionKey,
        state: State,
    ) -> Result<()> {
        self.get_mut(key)?.state = state;
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: &TransactionKey) {
        self.transactions.remove(&key.encoded);
    }

    pub(crate) fn passup(&mut self, key: &TransactionKey) {
        let response = self
            .transactions
            .get(&key.encoded)
            .and_then(|tx| tx.response.clone());
        if let Some(response) = response {
            self.passups.push(response);
        }
    }

    pub(crate) fn note_timeout(&mut self, key: &TransactionKey) {
        self.timeouts.push(key.clone());
    }

    /// Exponential backoff for retransmit timers, doubling from T1 and
    /// capped at T2.
    pub(crate) fn backoff(&self, resend_count: usize) -> Duration {
        let mut duration = Self::T1;
        for _ in 0..resend_count {
            duration *= 2;
            if duration >= Self::T2 {
                return Self::T2;
            }
        }
        duration
    }

    pub(crate) fn resends_exhausted(&self, key: &TransactionKey) -> bool {
        self.get(key)
            .map(|tx| tx.resend_count >= Self::MAX_RETRANSMITS)
            .unwrap_or(true)
    }

    pub(crate) fn bump_resend_count(&mut self, key: &TransactionKey) -> usize {
        match self.get_mut(key) {
            Ok(tx) => {
                tx.resend_count += 1;
                tx.resend_count
            }
            Err(_) => 0,
        }
    }

    /// Retransmit the original request; returns the new resend count.
    pub(crate) async fn resend_request(&mut self, key: &TransactionKey) -> usize {
        if let Ok(tx) = self.get(key) {
            let msg = tx.request.clone();
            let remote = tx.remote;
            let _ = self.transport.send(&msg, remote).await;
        }
        self.bump_resend_count(key)
    }

    /// Send (or replay) the last response recorded for a server
    /// transaction.
    pub(crate) async fn reply_last(&mut self, key: &TransactionKey) -> Result<()> {
        let (resp, remote) = {
            let tx = self.get(key)?;
            match tx.last_response.as_ref() {
                Some(resp) => (resp.clone(), tx.remote),
                None => return Ok(()),
            }
        };
        self.transport.send(&resp, remote).await?;
        Ok(())
    }

    /// The transaction layer's own ACK for a non-2xx final response, built
    /// from the stored request with the To taken from the response so the
    /// peer's tag survives.
    pub(crate) async fn send_ack(&mut self, key: &TransactionKey) -> Result<()> {
        let (mut ack, remote) = {
            let tx = self.get(key)?;
            let req = &tx.request;
            let mut ack = Message {
                method: Some(Method::ACK),
                request_uri: req.request_uri.clone(),
                version: "SIP/2.0".to_string(),
                ..Default::default()
            };
            for name in ["via", "from", "call-id"] {
                if let Some(value) = req.header(name) {
                    ack.set_header(name, value);
                }
            }
            let to = tx
                .response
                .as_ref()
                .and_then(|resp| resp.header("to"))
                .or_else(|| req.header("to"));
            if let Some(to) = to {
                ack.set_header("to", to);
            }
            (ack, tx.remote)
        };
        ack.set_header(
            "cseq",
            Cseq {
                seq: key.cseq,
                method: Method::ACK,
            }
            .to_string(),
        );
        ack.set_header("max-forwards", "70");
        ack.set_header("content-length", "0");
        self.transport.send(&ack, remote).await?;
        Ok(())
    }

    /// Arm a cancellable timer: a sleep task that reports back through the
    /// event channel. The epoch check on delivery makes cancellation exact
    /// even though the sleep itself is never interrupted.
    pub(crate) fn register_timer(
        &mut self,
        key: &TransactionKey,
        duration: Duration,
        input: Input,
    ) {
        let Some(epoch) = self.epoch_of(key) else {
            return;
        };
        let event = TimerEvent {
            key: key.clone(),
            epoch,
            input,
        };
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = timer_tx.send(event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tokio::net::UdpSocket;

    async fn setup() -> (
        TransactionManager,
        UdpSocket,
        SocketAddr,
        async_channel::Receiver<TimerEvent>,
    ) {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let (timer_tx, timer_rx) = async_channel::unbounded();
        (
            TransactionManager::new(transport, timer_tx),
            peer,
            peer_addr,
            timer_rx,
        )
    }

    fn invite(remote: SocketAddr) -> Message {
        let mut msg = Message {
            method: Some(Method::INVITE),
            request_uri: Some("sip:bob@example.com".to_string()),
            version: "SIP/2.0".to_string(),
            remote: Some(remote),
            ..Default::default()
        };
        msg.set_header(
            "via",
            "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKtest1",
        );
        msg.set_header("from", "<sip:alice@example.com>;tag=f1");
        msg.set_header("to", "<sip:bob@example.com>");
        msg.set_header("call-id", "tx-test-1");
        msg.set_header("cseq", "1 INVITE");
        msg.set_header("content-length", "0");
        msg
    }

    fn response_for(req: &Message, code: i32, status: &str) -> Message {
        let mut resp = Message::response_to(req, code, status);
        if code > 100 {
            let to = format!("{};tag=t1", req.header("to").unwrap());
            resp.set_header("to", to);
        }
        resp
    }

    async fn recv_msg(peer: &UdpSocket) -> Message {
        let mut buf = [0u8; 4096];
        let (n, _) = tokio::time::timeout(
            Duration::from_millis(500),
            peer.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        Message::parse(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_invite_client_success_path() {
        let (mut mgr, peer, peer_addr, _timers) = setup().await;
        let req = invite(peer_addr);
        let key = mgr.send_request(&req).await.unwrap();
        assert_eq!(mgr.state_of(&key), Some(State::Calling));

        // The request went out on the wire.
        let wire = recv_msg(&peer).await;
        assert_eq!(wire.method, Some(Method::INVITE));

        let passups = mgr
            .handle_msg(response_for(&req, 180, "Ringing"))
            .await
            .unwrap();
        assert_eq!(passups.len(), 1);
        assert_eq!(passups[0].code, Some(180));
        assert_eq!(mgr.state_of(&key), Some(State::Proceeding));

        let passups = mgr
            .handle_msg(response_for(&req, 200, "OK"))
            .await
            .unwrap();
        assert_eq!(passups.len(), 1);
        assert_eq!(passups[0].code, Some(200));
        // 2xx short-circuits the transaction away.
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_invite_client_failure_sends_ack() {
        let (mut mgr, peer, peer_addr, _timers) = setup().await;
        let req = invite(peer_addr);
        let key = mgr.send_request(&req).await.unwrap();
        recv_msg(&peer).await;

        let passups = mgr
            .handle_msg(response_for(&req, 486, "Busy Here"))
            .await
            .unwrap();
        assert_eq!(passups[0].code, Some(486));
        assert_eq!(mgr.state_of(&key), Some(State::Completed));

        // The transaction layer, not the agent, acknowledged the failure.
        let ack = recv_msg(&peer).await;
        assert_eq!(ack.method, Some(Method::ACK));
        assert_eq!(ack.cseq().unwrap().seq, 1);
        assert_eq!(ack.to_tag().as_deref(), Some("t1"));

        // Timer D reaps it.
        let epoch = mgr.epoch_of(&key).unwrap();
        mgr.handle_timer(TimerEvent {
            key: key.clone(),
            epoch,
            input: Input::TimerD,
        })
        .await
        .unwrap();
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_timer_a_retransmits_until_capped() {
        let (mut mgr, peer, peer_addr, _timers) = setup().await;
        let req = invite(peer_addr);
        let key = mgr.send_request(&req).await.unwrap();
        recv_msg(&peer).await;

        let epoch = mgr.epoch_of(&key).unwrap();
        for _ in 0..TransactionManager::MAX_RETRANSMITS {
            mgr.handle_timer(TimerEvent {
                key: key.clone(),
                epoch,
                input: Input::TimerA,
            })
            .await
            .unwrap();
            assert_eq!(recv_msg(&peer).await.method, Some(Method::INVITE));
        }
        assert_eq!(mgr.state_of(&key), Some(State::Calling));

        // The eleventh firing exceeds the retransmit budget.
        mgr.handle_timer(TimerEvent {
            key: key.clone(),
            epoch,
            input: Input::TimerA,
        })
        .await
        .unwrap();
        assert!(mgr.is_empty());
        assert_eq!(mgr.take_timeouts(), vec![key]);
    }

    #[tokio::test]
    async fn test_termination_is_final() {
        let (mut mgr, peer, peer_addr, _timers) = setup().await;
        let req = invite(peer_addr);
        let key = mgr.send_request(&req).await.unwrap();
        recv_msg(&peer).await;
        let epoch = mgr.epoch_of(&key).unwrap();

        mgr.handle_msg(response_for(&req, 200, "OK")).await.unwrap();
        assert!(mgr.is_empty());

        // Late timers are dropped by the epoch check; no state comes back.
        for input in [Input::TimerA, Input::TimerB] {
            mgr.handle_timer(TimerEvent {
                key: key.clone(),
                epoch,
                input,
            })
            .await
            .unwrap();
        }
        assert!(mgr.is_empty());
        assert!(mgr.take_timeouts().is_empty());
    }

    #[tokio::test]
    async fn test_one_client_transaction_per_callid_cseq() {
        let (mut mgr, _peer, peer_addr, _timers) = setup().await;
        let req = invite(peer_addr);
        mgr.send_request(&req).await.unwrap();
        let err = mgr.send_request(&req).await.unwrap_err();
        assert!(err
            .downcast_ref::<TransactionError>()
            .map(|e| matches!(e, TransactionError::TransactionExist))
            .unwrap_or(false));
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn test_server_retransmit_replays_response() {
        let (mut mgr, peer, peer_addr, _timers) = setup().await;
        let mut req = invite(peer_addr);
        req.remote = Some(peer_addr);

        // First delivery opens the transaction and passes the request up.
        let passed = mgr.handle_msg(req.clone()).await.unwrap();
        assert_eq!(passed.len(), 1);
        let key = TransactionManager::key_for(&req, &TransactionType::Server)
            .unwrap();
        assert_eq!(mgr.state_of(&key), Some(State::Proceeding));

        mgr.respond(&req, response_for(&req, 180, "Ringing"))
            .await
            .unwrap();
        assert_eq!(recv_msg(&peer).await.code, Some(180));

        // A retransmitted INVITE is absorbed and answered from the cache.
        let passed = mgr.handle_msg(req.clone()).await.unwrap();
        assert!(passed.is_empty());
        assert_eq!(recv_msg(&peer).await.code, Some(180));
    }

    #[tokio::test]
    async fn test_server_error_response_then_ack_confirms() {
        let (mut mgr, peer, peer_addr, _timers) = setup().await;
        let req = invite(peer_addr);
        mgr.handle_msg(req.clone()).await.unwrap();
        let key = TransactionManager::key_for(&req, &TransactionType::Server)
            .unwrap();

        mgr.respond(&req, response_for(&req, 404, "Not Found"))
            .await
            .unwrap();
        assert_eq!(recv_msg(&peer).await.code, Some(404));
        assert_eq!(mgr.state_of(&key), Some(State::Completed));

        let mut ack = invite(peer_addr);
        ack.method = Some(Method::ACK);
        ack.set_header("cseq", "1 ACK");
        let passed = mgr.handle_msg(ack).await.unwrap();
        assert!(passed.is_empty());
        assert_eq!(mgr.state_of(&key), Some(State::Confirmed));

        let epoch = mgr.epoch_of(&key).unwrap();
        mgr.handle_timer(TimerEvent {
            key: key.clone(),
            epoch,
            input: Input::TimerI,
        })
        .await
        .unwrap();
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_ack_for_2xx_passes_through() {
        let (mut mgr, peer, peer_addr, _timers) = setup().await;
        let req = invite(peer_addr);
        mgr.handle_msg(req.clone()).await.unwrap();

        mgr.respond(&req, response_for(&req, 200, "OK")).await.unwrap();
        assert_eq!(recv_msg(&peer).await.code, Some(200));
        // 2xx terminates the INVITE server transaction at once.
        assert!(mgr.is_empty());

        let mut ack = invite(peer_addr);
        ack.method = Some(Method::ACK);
        ack.set_header("cseq", "1 ACK");
        let passed = mgr.handle_msg(ack).await.unwrap();
        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].method, Some(Method::ACK));
        // And no stray transaction was created for the ACK.
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_non_invite_f_timeout() {
        let (mut mgr, peer, peer_addr, _timers) = setup().await;
        let mut req = invite(peer_addr);
        req.method = Some(Method::REGISTER);
        req.set_header("cseq", "2 REGISTER");
        let key = mgr.send_request(&req).await.unwrap();
        recv_msg(&peer).await;
        assert_eq!(mgr.state_of(&key), Some(State::Trying));

        let epoch = mgr.epoch_of(&key).unwrap();
        mgr.handle_timer(TimerEvent {
            key: key.clone(),
            epoch,
            input: Input::TimerF,
        })
        .await
        .unwrap();
        assert!(mgr.is_empty());
        assert_eq!(mgr.take_timeouts(), vec![key]);
    }

    #[tokio::test]
    async fn test_backoff_doubles_to_cap() {
        let (mgr, _peer, _peer_addr, _timers) = setup().await;
        assert_eq!(mgr.backoff(0), Duration::from_millis(500));
        assert_eq!(mgr.backoff(1), Duration::from_millis(1000));
        assert_eq!(mgr.backoff(2), Duration::from_millis(2000));
        assert_eq!(mgr.backoff(3), Duration::from_secs(4));
        assert_eq!(mgr.backoff(8), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_branch_format() {
        let b = branch();
        assert!(b.starts_with("z9hG4bK"));
        assert!(b.len() >= "z9hG4bK".len() + 7);
        assert_ne!(branch(), branch());
    }

    #[tokio::test]
    async fn test_key_matches_request_and_response() {
        let req = Message::from_str(
            "REGISTER sip:example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKabc\r\n\
             From: <sip:alice@example.com>;tag=99\r\n\
             To: <sip:alice@example.com>\r\n\
             Call-ID: reg-1\r\n\
             CSeq: 7 REGISTER\r\n\r\n",
        )
        .unwrap();
        let resp = Message::response_to(&req, 200, "OK");
        let req_key =
            TransactionManager::key_for(&req, &TransactionType::Client).unwrap();
        let resp_key =
            TransactionManager::key_for(&resp, &TransactionType::Client).unwrap();
        assert_eq!(req_key, resp_key);
        assert_eq!(req_key.cseq, 7);
        assert_eq!(req_key.branch, "z9hG4bKabc");
    }
}
