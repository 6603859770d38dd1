//! Request/response orchestration over one session.
//!
//! `RpcClient` ties the pieces together: it assigns correlation ids,
//! registers a future in the pending table, writes the packet fast-fail,
//! and parks the caller on the future. Inbound packets are demultiplexed
//! onto dispatch slots and handed to the application handler, which settles
//! response futures through [`RpcClient::complete`].

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::codec::PayloadCodec;
use crate::config::RemotingConfig;
use crate::dispatch::Slots;
use crate::error::RemotingError;
use crate::future::Future;
use crate::packet::Packet;
use crate::pending::PendingTable;
use crate::session::{FrameCodecFactory, Outbound, Session};
use crate::timing::TimerWheel;
use crate::trace::debug;

/// Everything a handler gets per inbound packet: the raw packet, the
/// decoded payload (or the decode error), and the client for replies and
/// response completion.
pub struct TContext<C: PayloadCodec> {
    pub packet: Packet,
    pub payload: Option<C::Value>,
    pub err: Option<RemotingError>,
    pub client: Arc<RpcClient<C>>,
}

/// Application-side packet handler. Runs on dispatch slots, so a slow
/// handler backpressures the demux thread, not the read pump.
pub trait Dispatch<C: PayloadCodec>: Send + Sync + 'static {
    fn dispatch(&self, ctx: TContext<C>);
}

impl<C, F> Dispatch<C> for F
where
    C: PayloadCodec,
    F: Fn(TContext<C>) + Send + Sync + 'static,
{
    fn dispatch(&self, ctx: TContext<C>) {
        self(ctx);
    }
}

pub struct RpcClient<C: PayloadCodec> {
    session: Session,
    codec: Arc<C>,
    handler: Arc<dyn Dispatch<C>>,
    pending: PendingTable<C::Value>,
    slots: Slots,
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    idle_window: Duration,
    max_frame_bytes: usize,
}

impl<C: PayloadCodec> RpcClient<C> {
    /// Dial `addr` with a private wheel and slot pool.
    ///
    /// # Errors
    ///
    /// `Io` if the dial or session setup fails.
    pub fn connect(
        addr: SocketAddr,
        config: &RemotingConfig,
        codec: Arc<C>,
        frame_factory: &FrameCodecFactory,
        handler: Arc<dyn Dispatch<C>>,
    ) -> Result<Arc<Self>, RemotingError> {
        let stream = TcpStream::connect(addr)?;
        let slots = Slots::new(config.max_dispatch, "javelin-dispatch");
        let wheel = TimerWheel::new(config.tick_granularity_hint, slots.clone());
        Self::start(stream, config, codec, frame_factory, handler, wheel, slots)
    }

    /// Wrap an already-connected stream; the wheel and slots are shared
    /// with the caller (one wheel per server, not per connection).
    ///
    /// # Errors
    ///
    /// `Io` if session setup fails.
    pub fn start(
        stream: TcpStream,
        config: &RemotingConfig,
        codec: Arc<C>,
        frame_factory: &FrameCodecFactory,
        handler: Arc<dyn Dispatch<C>>,
        wheel: TimerWheel,
        slots: Slots,
    ) -> Result<Arc<Self>, RemotingError> {
        let session = Session::open(stream, frame_factory, config)?;
        let pending = PendingTable::new(config.max_pending, wheel);
        let (cancel_tx, cancel_rx) = bounded(0);
        let client = Arc::new(Self {
            session,
            codec,
            handler,
            pending,
            slots,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
            idle_window: config.idle_window,
            max_frame_bytes: config.max_frame_bytes,
        });

        let demux = Arc::clone(&client);
        let remote = client.session.remote_addr();
        thread::Builder::new()
            .name(format!("javelin-demux-{remote}"))
            .spawn(move || {
                for packet in demux.session.packet_receiver().iter() {
                    let me = Arc::clone(&demux);
                    demux.slots.dispatch_wait(move || me.on_packet(packet));
                }
                debug!(%remote, "demux stopping");
            })
            .map_err(RemotingError::from)?;

        Ok(client)
    }

    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.session.local_addr()
    }

    /// Send a request packet and block for its response or its TTL.
    ///
    /// # Errors
    ///
    /// `Codec` for an oversize body, `QueueFull` when the write queue or
    /// the pending table rejects the request, `Timeout` when the TTL wins,
    /// `Cancelled` after shutdown, `ConnectionClosed` when the transport
    /// dies first.
    pub fn write_and_get(
        &self,
        mut packet: Packet,
        timeout: Duration,
    ) -> Result<C::Value, RemotingError> {
        if packet.data.len() > self.max_frame_bytes {
            return Err(RemotingError::Codec(format!(
                "request body of {} bytes exceeds max frame {}",
                packet.data.len(),
                self.max_frame_bytes
            )));
        }
        self.fill_opaque(&mut packet);
        let future = Future::new(packet.header.opaque);
        let timeout_rx = self.pending.attach(future.clone(), timeout)?;

        let on_fail = {
            let future = future.clone();
            move |err: RemotingError| {
                future.complete(Err(err));
            }
        };
        self.session
            .write(Outbound::with_fail_hook(packet, on_fail))?;
        future.get(&timeout_rx, &self.cancel_rx)
    }

    /// Marshal `value` and issue it as a request with command `cmd_type`.
    ///
    /// # Errors
    ///
    /// As [`RpcClient::write_and_get`], plus `Codec` if marshalling fails.
    pub fn call(
        &self,
        cmd_type: u8,
        value: &C::Value,
        timeout: Duration,
    ) -> Result<C::Value, RemotingError> {
        let body = self.codec.marshal(value)?;
        self.write_and_get(Packet::new(cmd_type, body), timeout)
    }

    /// Fire-and-forget send.
    ///
    /// # Errors
    ///
    /// `QueueFull` or `ConnectionClosed` from the session queue.
    pub fn write(&self, mut packet: Packet) -> Result<(), RemotingError> {
        self.fill_opaque(&mut packet);
        self.session.write(Outbound::new(packet))
    }

    /// Send a response correlated to a received request.
    ///
    /// # Errors
    ///
    /// `Codec` if marshalling fails, `QueueFull`/`ConnectionClosed` from
    /// the session queue.
    pub fn reply(&self, opaque: i32, cmd_type: u8, value: &C::Value) -> Result<(), RemotingError> {
        let body = self.codec.marshal(value)?;
        self.session
            .write(Outbound::new(Packet::response(opaque, cmd_type, body)))
    }

    /// Settle the pending request registered under `opaque` with a
    /// response value. Handlers call this for packets they recognize as
    /// responses; unknown or late opaques are ignored.
    pub fn complete(&self, opaque: i32, value: C::Value) {
        self.pending.detach(opaque, value);
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True once the session has seen no traffic for the idle window.
    #[must_use]
    pub fn idle(&self) -> bool {
        self.session.idle() >= self.idle_window
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Cancel every parked `write_and_get` and close the session.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.cancel_tx.lock().unwrap().take();
        self.session.close();
    }

    // Requests get a fresh opaque; anything pre-assigned (responses, or a
    // caller reusing a correlation id) passes through untouched.
    fn fill_opaque(&self, packet: &mut Packet) {
        if packet.header.opaque <= 0 {
            packet.header.opaque = self.pending.next_opaque();
        }
    }

    fn on_packet(self: Arc<Self>, packet: Packet) {
        let (payload, err) = match self.codec.unmarshal(&packet.data) {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e)),
        };
        let client = Arc::clone(&self);
        self.handler.dispatch(TContext {
            packet,
            payload,
            err,
            client,
        });
    }
}
