// Media-side UDP plumbing: RTP socket allocation inside the configured
// port window, and the per-call loop that paces outgoing frames and feeds
// received datagrams through the session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use codec::{Codec, PCMA, PCMU};
use lark_timer::Pacer;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::packet::PayloadType;
use crate::rtcp;
use crate::stream::{RtpSession, StreamStats};

const FRAME_INTERVAL: Duration = Duration::from_millis(20);
const SAMPLES_PER_FRAME: usize = 160;
const BIND_ATTEMPTS: usize = 32;

#[derive(Debug, Error)]
pub enum MediaTransportError {
    #[error("no available rtp port")]
    NoPort,
}

pub enum MediaCommand {
    Stop,
}

/// An RTP socket bound to a random even port inside `[base, base + span)`.
pub struct RtpTransport {
    socket: Arc<UdpSocket>,
    local_port: u16,
}

impl RtpTransport {
    pub async fn bind(local_ip: &str, base: u16, span: u16) -> Result<RtpTransport> {
        for _ in 0..BIND_ATTEMPTS {
            let port = lark_utils::rand_even_port(base, span);
            match UdpSocket::bind(format!("{}:{}", local_ip, port)).await {
                Ok(socket) => {
                    return Ok(RtpTransport {
                        socket: Arc::new(socket),
                        local_port: port,
                    });
                }
                Err(_) => continue,
            }
        }
        Err(MediaTransportError::NoPort)?
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub async fn send(&self, buf: &[u8], remote: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(buf, remote).await?)
    }
}

/// Control handle the call owner keeps while the media loop runs.
pub struct MediaHandle {
    session: Arc<Mutex<RtpSession>>,
    commands: UnboundedSender<MediaCommand>,
    local_port: u16,
}

impl MediaHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn stats(&self) -> StreamStats {
        self.session.lock().stats()
    }

    pub fn receiver_report(&self) -> rtcp::ReceiverReport {
        self.session.lock().receiver_report()
    }

    pub fn stop(&self) {
        let _ = self.commands.send(MediaCommand::Stop);
    }
}

/// Start the media loop for an established call and hand back its control
/// handle. The loop owns the socket; the session is shared for snapshots.
pub fn spawn(
    session: RtpSession,
    transport: RtpTransport,
    remote: SocketAddr,
) -> MediaHandle {
    let (commands, command_rx) = unbounded_channel();
    let local_port = transport.local_port();
    let session = Arc::new(Mutex::new(session));

    let runner = MediaRunner {
        session: session.clone(),
        transport,
        remote,
        commands: command_rx,
    };
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            warn!("media loop ended with error: {e}");
        }
    });

    MediaHandle {
        session,
        commands,
        local_port,
    }
}

struct MediaRunner {
    session: Arc<Mutex<RtpSession>>,
    transport: RtpTransport,
    remote: SocketAddr,
    commands: UnboundedReceiver<MediaCommand>,
}

impl MediaRunner {
    async fn run(self) -> Result<()> {
        let MediaRunner {
            session,
            transport,
            remote,
            mut commands,
        } = self;

        let payload_type = session.lock().payload_type();
        let mut encoder: Box<dyn Codec> = match payload_type {
            PayloadType::Pcma => Box::new(PCMA::new()),
            _ => Box::new(PCMU::new()),
        };
        let mut decoder: Box<dyn Codec> = match payload_type {
            PayloadType::Pcma => Box::new(PCMA::new()),
            _ => Box::new(PCMU::new()),
        };

        // Socket pump: datagrams flow to the loop through a channel so the
        // select below only ever borrows locals.
        let (packet_tx, mut packets) = unbounded_channel();
        let pump_socket = transport.socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match pump_socket.recv_from(&mut buf).await {
                    Ok((n, _)) => {
                        let packet = Bytes::copy_from_slice(&buf[..n]);
                        if packet_tx.send((packet, Instant::now())).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("rtp socket receive error: {e}");
                        return;
                    }
                }
            }
        });

        // No audio device is wired in, so the outgoing stream carries
        // encoded silence at the nominal frame rate.
        let silence = [0i16; SAMPLES_PER_FRAME];
        let mut frame = [0u8; SAMPLES_PER_FRAME];
        let mut pcm = [0i16; SAMPLES_PER_FRAME];
        let mut first = true;

        let mut pacer = Pacer::new(FRAME_INTERVAL);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(MediaCommand::Stop) | None => break,
                    }
                }
                _ = pacer.tick() => {
                    let n = encoder.encode(&silence, &mut frame)?;
                    let packet = {
                        let mut session = session.lock();
                        if !session.is_active() {
                            break;
                        }
                        session.create_packet(
                            Bytes::copy_from_slice(&frame[..n]),
                            first,
                        )
                    };
                    first = false;
                    if let Err(e) =
                        transport.send(&packet.serialize(), remote).await
                    {
                        warn!("rtp send error: {e}");
                    }

                    let released = session.lock().poll(Instant::now());
                    for packet in released {
                        // Decoded audio has nowhere to go without a device;
                        // decoding still validates the payload path.
                        let _ = decoder.decode(&packet.payload, &mut pcm);
                    }
                }
                received = packets.recv() => {
                    let Some((data, arrived)) = received else {
                        break;
                    };
                    if rtcp::is_rtcp(&data) {
                        debug!("rtcp packet ignored");
                        continue;
                    }
                    let released =
                        session.lock().receive_packet(&data, arrived);
                    for packet in released {
                        let _ = decoder.decode(&packet.payload, &mut pcm);
                    }
                }
            }
        }

        session.lock().stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SessionConfig;

    #[tokio::test]
    async fn test_bind_in_range() {
        let transport = RtpTransport::bind("127.0.0.1", 10000, 100).await.unwrap();
        let port = transport.local_port();
        assert!((10000..10100).contains(&port));
        assert_eq!(port % 2, 0);
    }

    #[tokio::test]
    async fn test_media_loop_sends_and_receives() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let transport = RtpTransport::bind("127.0.0.1", 20000, 100).await.unwrap();
        let local_port = transport.local_port();
        let session = RtpSession::new(PayloadType::Pcmu, &SessionConfig::default());
        let handle = spawn(session, transport, peer_addr);

        // The pacer should emit a frame within a couple of intervals.
        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(
            Duration::from_millis(500),
            peer.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        let packet = crate::packet::RtpPacket::parse(&buf[..n]).unwrap();
        assert!(packet.is_valid());
        assert_eq!(packet.payload_type, 0);
        assert_eq!(packet.payload.len(), SAMPLES_PER_FRAME);

        // Loop one packet back in and wait for it to land in the stats.
        let echo = crate::packet::RtpPacket {
            payload_type: 0,
            sequence: 1,
            timestamp: 160,
            ssrc: 7,
            payload: Bytes::from(vec![0xffu8; 160]),
            ..Default::default()
        };
        peer.send_to(
            &echo.serialize(),
            format!("127.0.0.1:{local_port}"),
        )
        .await
        .unwrap();

        let mut received = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if handle.stats().packets_received == 1 {
                received = true;
                break;
            }
        }
        assert!(received);

        handle.stop();
    }
}
