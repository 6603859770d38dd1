//! Framed bidirectional session over one TCP stream.
//!
//! Two pump threads own the stream halves. The read pump blocks on framing
//! and pushes decoded packets into a bounded queue with backpressure; the
//! write pump drains a bounded outbound queue and is fed fast-fail, so a
//! stalled peer surfaces as `QueueFull` at the caller instead of a blocked
//! application thread. Close is idempotent from any thread.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use minstant::Instant;

use crate::codec::FrameCodec;
use crate::config::RemotingConfig;
use crate::error::RemotingError;
use crate::packet::Packet;
use crate::trace::{debug, warn};

/// Builds one fresh framing codec per pump thread.
pub type FrameCodecFactory = Arc<dyn Fn() -> Box<dyn FrameCodec> + Send + Sync>;

/// An outbound packet plus an optional failure hook. The hook runs exactly
/// once if and only if the packet cannot be delivered to the kernel:
/// rejected at enqueue, failed to encode, or lost to a dead connection.
pub struct Outbound {
    pub packet: Packet,
    pub on_fail: Option<Box<dyn FnOnce(RemotingError) + Send>>,
}

impl Outbound {
    #[must_use]
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            on_fail: None,
        }
    }

    #[must_use]
    pub fn with_fail_hook(
        packet: Packet,
        on_fail: impl FnOnce(RemotingError) + Send + 'static,
    ) -> Self {
        Self {
            packet,
            on_fail: Some(Box::new(on_fail)),
        }
    }

    fn fail(self, err: RemotingError) {
        if let Some(hook) = self.on_fail {
            hook(err);
        }
    }
}

struct Shared {
    closed: AtomicBool,
    // Dropping this sender tells the write pump to drain and exit.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    // Millis since `anchor`; avoids an Instant behind a lock.
    last_io_ms: AtomicU64,
    anchor: Instant,
}

impl Shared {
    fn touch(&self) {
        let ms = self.anchor.elapsed().as_millis() as u64;
        self.last_io_ms.store(ms, Ordering::Relaxed);
    }

    fn close(&self, stream: &TcpStream) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.lock().unwrap().take();
        // Unblock the read pump; it exits on the resulting zero-read/error.
        let _ = stream.shutdown(Shutdown::Read);
    }
}

pub struct Session {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    packets: Receiver<Packet>,
    writes: Sender<Outbound>,
    shared: Arc<Shared>,
    stream: TcpStream,
}

impl Session {
    /// Take ownership of a connected stream and start both pumps.
    ///
    /// # Errors
    ///
    /// `Io` if socket options cannot be applied or the pump threads cannot
    /// be spawned.
    pub fn open(
        stream: TcpStream,
        codec_factory: &FrameCodecFactory,
        config: &RemotingConfig,
    ) -> Result<Self, RemotingError> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        configure_socket(&stream, config)?;

        let (packet_tx, packet_rx) = bounded(config.read_queue_size);
        let (write_tx, write_rx) = bounded::<Outbound>(config.write_queue_size);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            last_io_ms: AtomicU64::new(0),
            anchor: Instant::now(),
        });

        let read_stream = stream.try_clone()?;
        let read_shared = Arc::clone(&shared);
        let mut read_codec = codec_factory();
        let read_buffer = config.read_buffer_size;
        thread::Builder::new()
            .name(format!("javelin-read-{remote_addr}"))
            .spawn(move || {
                read_pump(read_stream, read_codec.as_mut(), &packet_tx, &read_shared, read_buffer);
            })
            .map_err(RemotingError::from)?;

        let write_stream = stream.try_clone()?;
        let write_shared = Arc::clone(&shared);
        let mut write_codec = codec_factory();
        let write_buffer = config.write_buffer_size;
        thread::Builder::new()
            .name(format!("javelin-write-{remote_addr}"))
            .spawn(move || {
                write_pump(
                    write_stream,
                    write_codec.as_mut(),
                    &write_rx,
                    &shutdown_rx,
                    &write_shared,
                    write_buffer,
                );
            })
            .map_err(RemotingError::from)?;

        Ok(Self {
            local_addr,
            remote_addr,
            packets: packet_rx,
            writes: write_tx,
            shared,
            stream,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Inbound packets, in arrival order. Disconnects when the session
    /// closes and the queue drains.
    #[must_use]
    pub fn packet_receiver(&self) -> Receiver<Packet> {
        self.packets.clone()
    }

    /// Enqueue a packet without blocking. A full queue fails fast with
    /// `QueueFull`; the failure hook also runs for every rejection here.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the outbound queue is at capacity,
    /// `ConnectionClosed` when the session is closed.
    pub fn write(&self, outbound: Outbound) -> Result<(), RemotingError> {
        if self.is_closed() {
            let err = RemotingError::ConnectionClosed;
            outbound.fail(err.clone());
            return Err(err);
        }
        match self.writes.try_send(outbound) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(outbound)) => {
                let err = RemotingError::QueueFull("session write queue is full".into());
                outbound.fail(err.clone());
                Err(err)
            }
            Err(TrySendError::Disconnected(outbound)) => {
                let err = RemotingError::ConnectionClosed;
                outbound.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Time since the last inbound or outbound activity.
    #[must_use]
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.shared.last_io_ms.load(Ordering::Relaxed));
        self.shared.anchor.elapsed().saturating_sub(last)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the session: the write pump drains what it can, flushes, and
    /// shuts the socket down. Safe to call from any thread, any number of
    /// times.
    pub fn close(&self) {
        self.shared.close(&self.stream);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn configure_socket(stream: &TcpStream, config: &RemotingConfig) -> Result<(), RemotingError> {
    rustix::net::sockopt::set_socket_keepalive(stream, true).map_err(std::io::Error::from)?;
    rustix::net::sockopt::set_socket_send_buffer_size(stream, config.write_buffer_size)
        .map_err(std::io::Error::from)?;
    rustix::net::sockopt::set_socket_recv_buffer_size(stream, config.read_buffer_size)
        .map_err(std::io::Error::from)?;
    Ok(())
}

fn read_pump(
    stream: TcpStream,
    codec: &mut dyn FrameCodec,
    packets: &Sender<Packet>,
    shared: &Shared,
    buffer: usize,
) {
    let mut reader = BufReader::with_capacity(buffer, stream);
    loop {
        let frame = match codec.read_frame(&mut reader) {
            Ok(frame) => frame,
            Err(_err) => {
                if !shared.closed.load(Ordering::Acquire) {
                    debug!(error = %_err, "read pump stopping");
                }
                break;
            }
        };
        let packet = match codec.decode(frame) {
            Ok(packet) => packet,
            Err(_err) => {
                warn!(error = %_err, "undecodable frame, closing session");
                break;
            }
        };
        shared.touch();
        // Backpressure: a full read queue stalls the reader, and the
        // kernel receive window stalls the peer.
        if packets.send(packet).is_err() {
            break;
        }
    }
    shared.close(reader.get_ref());
}

fn write_pump(
    stream: TcpStream,
    codec: &mut dyn FrameCodec,
    writes: &Receiver<Outbound>,
    shutdown: &Receiver<()>,
    shared: &Shared,
    buffer: usize,
) {
    let mut writer = BufWriter::with_capacity(buffer, &stream);
    loop {
        select! {
            recv(writes) -> outbound => {
                let Ok(outbound) = outbound else { break };
                if !flush_one(&mut writer, codec, outbound, shared) {
                    // Fail everything still queued so no hook is lost.
                    for stale in writes.try_iter() {
                        stale.fail(RemotingError::ConnectionClosed);
                    }
                    shared.close(&stream);
                    return;
                }
            }
            recv(shutdown) -> _ => {
                // Closing: best-effort drain of what was already accepted.
                for outbound in writes.try_iter() {
                    if !flush_one(&mut writer, codec, outbound, shared) {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.flush();
    let _ = stream.shutdown(Shutdown::Both);
}

/// Encode and write one packet. Returns false only on a transport error.
fn flush_one(
    writer: &mut BufWriter<&TcpStream>,
    codec: &mut dyn FrameCodec,
    outbound: Outbound,
    shared: &Shared,
) -> bool {
    let wire = match codec.encode(&outbound.packet) {
        Ok(wire) => wire,
        Err(err) => {
            // Encode failures are local to the packet; the session lives on.
            outbound.fail(err);
            return true;
        }
    };
    if let Err(err) = writer.write_all(&wire).and_then(|()| writer.flush()) {
        warn!(error = %err, "write pump stopping");
        outbound.fail(RemotingError::from(err));
        return false;
    }
    shared.touch();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    use crate::codec::HeaderFrameCodec;
    use crate::packet::MAX_PACKET_BYTES;

    fn factory() -> FrameCodecFactory {
        Arc::new(|| Box::new(HeaderFrameCodec::new(MAX_PACKET_BYTES)) as Box<dyn FrameCodec>)
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn packets_cross_the_loopback() {
        let (a, b) = pair();
        let config = RemotingConfig::default();
        let left = Session::open(a, &factory(), &config).unwrap();
        let right = Session::open(b, &factory(), &config).unwrap();

        left.write(Outbound::new(Packet::response(5, 1, b"hello".to_vec())))
            .unwrap();
        let got = right
            .packet_receiver()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(got.header.opaque, 5);
        assert_eq!(got.data, b"hello");

        right
            .write(Outbound::new(Packet::response(5, 2, b"world".to_vec())))
            .unwrap();
        let back = left
            .packet_receiver()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(back.data, b"world");
    }

    #[test]
    fn close_is_idempotent_and_disconnects_receiver() {
        let (a, b) = pair();
        let config = RemotingConfig::default();
        let left = Session::open(a, &factory(), &config).unwrap();
        let right = Session::open(b, &factory(), &config).unwrap();

        left.close();
        left.close();
        assert!(left.is_closed());
        assert!(matches!(
            left.write(Outbound::new(Packet::new(1, b"x".to_vec()))),
            Err(RemotingError::ConnectionClosed)
        ));
        // Peer sees EOF and winds down too.
        assert!(right
            .packet_receiver()
            .recv_timeout(Duration::from_secs(2))
            .is_err());
    }

    #[test]
    fn failure_hook_runs_on_rejected_write() {
        let (a, _b) = pair();
        let config = RemotingConfig::default();
        let left = Session::open(a, &factory(), &config).unwrap();
        left.close();

        let hook_err = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&hook_err);
        let outbound = Outbound::with_fail_hook(Packet::new(1, b"x".to_vec()), move |err| {
            *sink.lock().unwrap() = Some(err);
        });
        assert!(left.write(outbound).is_err());
        assert!(matches!(
            hook_err.lock().unwrap().take(),
            Some(RemotingError::ConnectionClosed)
        ));
    }

    #[test]
    fn idle_grows_without_traffic() {
        let (a, b) = pair();
        let config = RemotingConfig::default();
        let left = Session::open(a, &factory(), &config).unwrap();
        let right = Session::open(b, &factory(), &config).unwrap();

        left.write(Outbound::new(Packet::new(1, b"tick".to_vec())))
            .unwrap();
        let _ = right
            .packet_receiver()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(right.idle() >= Duration::from_millis(100));
    }

    #[test]
    fn oversize_body_fails_locally_session_survives() {
        let (a, b) = pair();
        let config = RemotingConfig::default();
        let small = Arc::new(move || {
            Box::new(HeaderFrameCodec::new(64)) as Box<dyn FrameCodec>
        }) as FrameCodecFactory;
        let left = Session::open(a, &small, &config).unwrap();
        let right = Session::open(b, &factory(), &config).unwrap();

        let failures = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&failures);
        left.write(Outbound::with_fail_hook(
            Packet::new(1, vec![0u8; 1024]),
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        ))
        .unwrap();
        left.write(Outbound::new(Packet::new(1, b"small".to_vec())))
            .unwrap();

        let got = right
            .packet_receiver()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(got.data, b"small");
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(!left.is_closed());
    }
}
