use std::net::SocketAddr;
use std::str;
use std::sync::Arc;

use anyhow::{Error, Result};
use async_channel::Sender;
use tokio::net::UdpSocket;
use tracing::{error, warn};

use super::message::Message;
use super::transport::SipEvent;

/// The datagram transport for signaling. Binding happens once at startup;
/// a bind failure is fatal and propagates to the caller.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: &str) -> Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the receive loop, delivering parsed messages to the event
    /// channel. Parse failures are reported as events so the owner can
    /// count them; they never tear the loop down.
    pub fn listen(&self, events: Sender<SipEvent>) {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = [0; 4096];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, addr)) => {
                        let event = match parse_datagram(&buf[..n], addr) {
                            Ok(msg) => SipEvent::Message(msg),
                            Err(e) => {
                                warn!("sip parse error from {addr}: {e}");
                                SipEvent::ParseError
                            }
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!("udp socket receive error {e}");
                        let _ = events.send(SipEvent::Error(e.to_string())).await;
                        return;
                    }
                }
            }
        });
    }

    pub async fn send(&self, msg: &Message, dest: SocketAddr) -> Result<usize, Error> {
        let result = self.socket.send_to(&msg.to_bytes(), dest).await;
        if let Err(e) = result.as_ref() {
            error!("udp socket send error {e}");
        }
        Ok(result?)
    }
}

fn parse_datagram(buf: &[u8], addr: SocketAddr) -> Result<Message> {
    str::from_utf8(buf)?;
    let mut msg = Message::parse(buf)?;
    msg.remote = Some(addr);
    Ok(msg)
}
