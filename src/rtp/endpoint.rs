//! Per-call UDP endpoint: one socket, one receive task, one paced send
//! task, joined to the rest of the call by bounded channels.

use super::{codec, Codec, PacketWriter};
use crate::constants::*;
use bytes::BytesMut;
use flume::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use rand::random;
use std::{
    error::Error as StdError,
    fmt,
    io::Error as IoError,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    net::UdpSocket,
    select, spawn,
    time::{sleep_until, timeout, Duration, Instant},
};
use tracing::{debug, instrument, trace, warn};

/// Errors raised while binding or driving an [`RtpEndpoint`].
#[derive(Debug)]
#[non_exhaustive]
pub enum EndpointError {
    /// Every port in the configured RTP range was already bound.
    NoPortAvailable,
    /// The socket could not be created on the chosen port.
    BindFailed(IoError),
    /// The endpoint has not been started, or has already been stopped.
    NotStarted,
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::NoPortAvailable => {
                write!(f, "no free UDP port in the RTP range")
            },
            EndpointError::BindFailed(e) => write!(f, "failed to bind RTP socket: {e}"),
            EndpointError::NotStarted => write!(f, "endpoint is not running"),
        }
    }
}

impl StdError for EndpointError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            EndpointError::BindFailed(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EndpointError>;

/// Counters exposed for observability and tests.
#[derive(Debug, Default)]
pub struct EndpointStats {
    /// Datagrams which failed RTP validation and were dropped.
    pub invalid_frames: AtomicU64,
    /// Silence frames inserted by the egress scheduler on underflow.
    pub filler_frames: AtomicU64,
}

/// A call's RTP leg.
///
/// Owns the UDP socket bound inside [`RTP_PORT_RANGE`]. Ingress datagrams
/// are parsed, scrubbed, and batched into chunks on a bounded channel;
/// egress audio is queued in arbitrary-sized chunks and repacketized into
/// paced 20ms frames with strictly monotonic sequence/timestamp.
pub struct RtpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    stats: Arc<EndpointStats>,
    packet_interval: Duration,

    running: bool,
    ingress_rx: Option<Receiver<Vec<u8>>>,
    egress_tx: Option<Sender<Vec<u8>>>,
    rx_stop: Option<Sender<()>>,
    tx_stop: Option<Sender<()>>,
}

impl RtpEndpoint {
    /// Binds a socket on the first free port of the RTP range.
    pub async fn bind(local_ip: IpAddr) -> Result<Self> {
        let (socket, local_addr) = bind_in_range(local_ip).await?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            remote: Arc::new(Mutex::new(None)),
            stats: Arc::new(EndpointStats::default()),
            packet_interval: TIMESTEP_LENGTH,
            running: false,
            ingress_rx: None,
            egress_tx: None,
            rx_stop: None,
            tx_stop: None,
        })
    }

    /// Overrides the egress packet interval (default: exactly 20ms).
    #[must_use]
    pub fn packet_interval(mut self, packet_interval: Duration) -> Self {
        self.packet_interval = packet_interval;
        self
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The remote peer, preconfigured or learned from the first datagram.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    pub fn stats(&self) -> Arc<EndpointStats> {
        Arc::clone(&self.stats)
    }

    /// Spawns the receive and paced-send tasks.
    ///
    /// A `None` remote is learned from the first ingress datagram;
    /// nothing is transmitted until then.
    #[instrument(skip(self), fields(local = %self.local_addr))]
    pub fn start(&mut self, remote: Option<SocketAddr>, codec: Codec) {
        if self.running {
            return;
        }

        *self.remote.lock() = remote;

        let (ingress_tx, ingress_rx) = flume::bounded(AUDIO_QUEUE_DEPTH);
        let (egress_tx, egress_rx) = flume::bounded(AUDIO_QUEUE_DEPTH);
        let (rx_stop_tx, rx_stop_rx) = flume::bounded(1);
        let (tx_stop_tx, tx_stop_rx) = flume::bounded(1);

        spawn(ingress_runner(
            Arc::clone(&self.socket),
            Arc::clone(&self.remote),
            Arc::clone(&self.stats),
            codec,
            ingress_tx,
            rx_stop_rx,
        ));

        spawn(egress_runner(
            Arc::clone(&self.socket),
            Arc::clone(&self.remote),
            Arc::clone(&self.stats),
            codec,
            self.packet_interval,
            egress_rx,
            tx_stop_rx,
        ));

        self.ingress_rx = Some(ingress_rx);
        self.egress_tx = Some(egress_tx);
        self.rx_stop = Some(rx_stop_tx);
        self.tx_stop = Some(tx_stop_tx);
        self.running = true;
    }

    /// The stream of batched caller-audio chunks.
    ///
    /// Ends when the endpoint is stopped.
    pub fn ingress(&self) -> Result<Receiver<Vec<u8>>> {
        self.ingress_rx.clone().ok_or(EndpointError::NotStarted)
    }

    /// Sender half of the egress queue, for wiring to an audio producer.
    pub fn egress_sender(&self) -> Result<Sender<Vec<u8>>> {
        self.egress_tx.clone().ok_or(EndpointError::NotStarted)
    }

    /// Queues audio for paced transmission.
    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        let tx = self.egress_tx.as_ref().ok_or(EndpointError::NotStarted)?;

        tx.send_async(payload)
            .await
            .map_err(|_| EndpointError::NotStarted)
    }

    /// Stops both tasks and closes down the channels. Idempotent.
    pub fn stop(&mut self) {
        // Sends to already-finished tasks just error; that's fine.
        if let Some(stop) = self.rx_stop.take() {
            drop(stop.try_send(()));
        }
        if let Some(stop) = self.tx_stop.take() {
            drop(stop.try_send(()));
        }

        self.ingress_rx = None;
        self.egress_tx = None;
        self.running = false;
    }
}

impl Drop for RtpEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn bind_in_range(local_ip: IpAddr) -> Result<(UdpSocket, SocketAddr)> {
    let mut last_err = None;

    for port in RTP_PORT_RANGE {
        match UdpSocket::bind((local_ip, port)).await {
            Ok(socket) => {
                let addr = socket.local_addr().map_err(EndpointError::BindFailed)?;
                trace!("RTP socket bound to {addr}.");
                return Ok((socket, addr));
            },
            Err(e) => {
                last_err = Some(e);
                continue;
            },
        }
    }

    debug!("RTP port range exhausted: {last_err:?}");
    Err(EndpointError::NoPortAvailable)
}

struct IngressTask {
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    stats: Arc<EndpointStats>,
    codec: Codec,
    tx: Sender<Vec<u8>>,
    stop: Receiver<()>,
    batch: Vec<u8>,
}

impl IngressTask {
    async fn run(&mut self) {
        let mut byte_dest: Option<BytesMut> = None;

        loop {
            if byte_dest.is_none() {
                byte_dest = Some(BytesMut::zeroed(RTP_PACKET_MAX));
            }

            select! {
                recv = self.socket.recv_from(byte_dest.as_mut().unwrap()) => {
                    let Ok((len, addr)) = recv else {
                        // Socket errors on UDP reads are transient; keep going.
                        continue;
                    };

                    let mut pkt = byte_dest.take().unwrap();
                    pkt.truncate(len);

                    self.learn_remote(addr);

                    if !self.process_datagram(&pkt).await {
                        break;
                    }
                },
                _ = self.stop.recv_async() => break,
            }
        }
    }

    fn learn_remote(&self, addr: SocketAddr) {
        let mut remote = self.remote.lock();
        if remote.is_none() {
            debug!("Learned remote RTP endpoint {addr} from first datagram.");
            *remote = Some(addr);
        }
    }

    /// Returns `false` once the downstream consumer is gone.
    async fn process_datagram(&mut self, datagram: &[u8]) -> bool {
        let payload = match codec::parse(datagram) {
            Ok(frame) => frame.payload,
            Err(_) => {
                self.stats.invalid_frames.fetch_add(1, Ordering::Relaxed);
                return true;
            },
        };

        let mut payload = payload.to_vec();
        if self.codec == Codec::Ulaw {
            codec::scrub_silence(&mut payload);
        }

        self.batch.extend_from_slice(&payload);

        while self.batch.len() >= INGRESS_BATCH_BYTES {
            let rest = self.batch.split_off(INGRESS_BATCH_BYTES);
            let chunk = std::mem::replace(&mut self.batch, rest);

            // Bounded queue: a stalled consumer applies backpressure here.
            if self.tx.send_async(chunk).await.is_err() {
                return false;
            }
        }

        true
    }
}

#[instrument(skip_all)]
async fn ingress_runner(
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    stats: Arc<EndpointStats>,
    codec: Codec,
    tx: Sender<Vec<u8>>,
    stop: Receiver<()>,
) {
    trace!("RTP receive task started.");

    let mut task = IngressTask {
        socket,
        remote,
        stats,
        codec,
        tx,
        stop,
        batch: Vec::with_capacity(2 * INGRESS_BATCH_BYTES),
    };

    task.run().await;

    trace!("RTP receive task stopped.");
}

struct EgressTask {
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    stats: Arc<EndpointStats>,
    interval: Duration,
    rx: Receiver<Vec<u8>>,
    stop: Receiver<()>,
    writer: PacketWriter,
    buffer: Vec<u8>,
}

impl EgressTask {
    async fn run(&mut self) {
        if !self.prime().await {
            return;
        }

        let mut deadline = Instant::now();

        loop {
            // Top up from the queue without blocking the schedule.
            loop {
                match self.rx.try_recv() {
                    Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            let frame = if self.buffer.len() >= FRAME_SIZE {
                let rest = self.buffer.split_off(FRAME_SIZE);
                std::mem::replace(&mut self.buffer, rest)
            } else {
                match timeout(EGRESS_UNDERFLOW_WAIT, self.rx.recv_async()).await {
                    Ok(Ok(chunk)) => {
                        self.buffer.extend_from_slice(&chunk);
                        continue;
                    },
                    Ok(Err(_)) => return,
                    Err(_) => {
                        // Keep the clock running through TTS gaps.
                        self.stats.filler_frames.fetch_add(1, Ordering::Relaxed);
                        vec![ULAW_SILENCE; FRAME_SIZE]
                    },
                }
            };

            // Re-base after a stall so we pace forward rather than burst.
            let now = Instant::now();
            if now > deadline + self.interval {
                deadline = now;
            }

            select! {
                () = sleep_until(deadline) => {},
                _ = self.stop.recv_async() => return,
            }

            if !self.transmit(&frame).await {
                return;
            }

            deadline += self.interval;
        }
    }

    /// Accumulates the priming buffer before the first transmission.
    async fn prime(&mut self) -> bool {
        let target = PRIMING_FRAMES * FRAME_SIZE;

        while self.buffer.len() < target {
            select! {
                chunk = self.rx.recv_async() => match chunk {
                    Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                    Err(_) => return false,
                },
                _ = self.stop.recv_async() => return false,
            }
        }

        trace!("Egress priming buffer filled ({} bytes).", self.buffer.len());
        true
    }

    async fn transmit(&mut self, frame: &[u8]) -> bool {
        let Some(remote) = *self.remote.lock() else {
            // Remote not yet learned; drop the frame but keep cadence.
            return true;
        };

        let wire = self.writer.frame(frame);

        match self.socket.send_to(wire, remote).await {
            Ok(_) => {
                self.writer.advance(frame.len() as u32);
                true
            },
            Err(e) => {
                warn!("RTP send error: {e:?}.");
                // Transient send failures shouldn't kill the call leg.
                true
            },
        }
    }
}

#[instrument(skip_all)]
async fn egress_runner(
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    stats: Arc<EndpointStats>,
    codec: Codec,
    interval: Duration,
    rx: Receiver<Vec<u8>>,
    stop: Receiver<()>,
) {
    trace!("RTP transmit task started.");

    let mut task = EgressTask {
        socket,
        remote,
        stats,
        interval,
        rx,
        stop,
        writer: PacketWriter::new(codec.payload_type(), random::<u32>()),
        buffer: Vec::with_capacity(2 * PRIMING_FRAMES * FRAME_SIZE),
    };

    task.run().await;

    trace!("RTP transmit task stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::parse;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn bind_lands_in_rtp_range() {
        let endpoint = RtpEndpoint::bind(LOCALHOST).await.unwrap();
        assert!(RTP_PORT_RANGE.contains(&endpoint.local_addr().port()));
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn ingress_batches_caller_audio() {
        let mut endpoint = RtpEndpoint::bind(LOCALHOST).await.unwrap();
        endpoint.start(None, Codec::Ulaw);
        let ingress = endpoint.ingress().unwrap();

        let sender = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();

        // 600-byte batches need four 160-byte frames.
        for seq in 0..4u16 {
            let pkt = crate::rtp::build_packet(
                discortp::rtp::RtpType::Pcmu,
                seq,
                u32::from(seq) * FRAME_SIZE as u32,
                0xABCD,
                &[0x20; FRAME_SIZE],
            );
            sender.send_to(&pkt, endpoint.local_addr()).await.unwrap();
        }

        let chunk = ingress.recv_async().await.unwrap();
        assert_eq!(chunk.len(), INGRESS_BATCH_BYTES);
        assert!(chunk.iter().all(|&b| b == 0x20));

        endpoint.stop();
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn invalid_datagrams_are_counted_and_dropped() {
        let mut endpoint = RtpEndpoint::bind(LOCALHOST).await.unwrap();
        endpoint.start(None, Codec::Ulaw);
        let stats = endpoint.stats();

        let sender = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        sender
            .send_to(&[0x00, 0x01, 0x02], endpoint.local_addr())
            .await
            .unwrap();

        // Give the receive task a moment to see the datagram.
        for _ in 0..50 {
            if stats.invalid_frames.load(Ordering::Relaxed) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(stats.invalid_frames.load(Ordering::Relaxed), 1);
        endpoint.stop();
    }

    #[tokio::test]
    #[ntest::timeout(30_000)]
    async fn egress_paces_monotonic_frames() {
        let mut endpoint = RtpEndpoint::bind(LOCALHOST).await.unwrap();

        let receiver = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let remote = receiver.local_addr().unwrap();

        endpoint.start(Some(remote), Codec::Ulaw);

        // Enough audio for priming plus a few paced frames.
        let audio = vec![0x55u8; (PRIMING_FRAMES + 5) * FRAME_SIZE];
        endpoint.send(audio).await.unwrap();

        let mut buf = [0u8; RTP_PACKET_MAX];
        let mut last: Option<(u16, u32)> = None;

        for _ in 0..5 {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            let frame = parse(&buf[..len]).unwrap();
            assert_eq!(frame.payload.len(), FRAME_SIZE);

            if let Some((seq, ts)) = last {
                assert_eq!(frame.sequence, seq.wrapping_add(1));
                assert_eq!(frame.timestamp, ts.wrapping_add(FRAME_SIZE as u32));
            }
            last = Some((frame.sequence, frame.timestamp));
        }

        endpoint.stop();
    }

    #[tokio::test]
    #[ntest::timeout(10_000)]
    async fn stop_is_idempotent() {
        let mut endpoint = RtpEndpoint::bind(LOCALHOST).await.unwrap();
        endpoint.start(None, Codec::Ulaw);
        let ingress = endpoint.ingress().unwrap();

        endpoint.stop();
        endpoint.stop();

        assert!(ingress.recv_async().await.is_err());
        assert!(endpoint.send(vec![0u8; FRAME_SIZE]).await.is_err());
    }
}
