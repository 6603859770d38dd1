//! Binary RPC transport core.
//!
//! javelin frames packets over a byte stream, correlates asynchronous
//! requests to responses via opaque ids, and manages large numbers of
//! timeouts on a single timer-wheel thread. It is the plumbing under a
//! request/response network service, not a service framework: callers bring
//! their own payload encoding and dispatch logic.
//!
//! # Layers
//!
//! - [`timing`]: timer wheel: one command-loop thread owns an indexed
//!   min-heap of deadlines; add/update/cancel arrive as messages.
//! - [`future`] + [`pending`]: a single-assignment [`Future`] and a
//!   capacity-bounded table mapping opaque id → future, TTL-armed on the
//!   wheel.
//! - [`session`]: per-connection read/write pump threads with bounded
//!   queues and idle tracking.
//! - [`client`] / [`server`]: compose a session, a frame codec, a payload
//!   codec, the pending table, and a dispatch handler into a synchronous
//!   `call` over the asynchronous wire.
//!
//! Shared mutable structures (timer heap, pending map) are each owned by
//! exactly one loop thread; everything else talks to them over bounded
//! channels.

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod future;
pub mod net;
pub mod packet;
pub mod pending;
pub mod server;
pub mod session;
pub mod timing;
pub mod trace;

pub use client::{Dispatch, RpcClient, TContext};
pub use codec::{BytesCodec, FrameCodec, HeaderFrameCodec, JsonCodec, LineFrameCodec, PayloadCodec, RawFrameCodec};
pub use config::RemotingConfig;
pub use dispatch::Slots;
pub use error::RemotingError;
pub use future::Future;
pub use net::{StopHandle, StopListener};
pub use packet::{Packet, PacketHeader, MAX_PACKET_BYTES, OPAQUE_UNSET, PACKET_HEADER_LEN};
pub use pending::PendingTable;
pub use server::RpcServer;
pub use session::{FrameCodecFactory, Outbound, Session};
pub use timing::TimerWheel;
