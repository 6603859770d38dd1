//! Accept-side composition: one listener, one shared wheel and slot pool,
//! one `RpcClient` per accepted connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::client::{Dispatch, RpcClient};
use crate::codec::PayloadCodec;
use crate::config::RemotingConfig;
use crate::dispatch::Slots;
use crate::error::RemotingError;
use crate::net::{StopHandle, StopListener};
use crate::session::FrameCodecFactory;
use crate::timing::TimerWheel;
use crate::trace::{debug, error, info, warn};

pub struct RpcServer<C: PayloadCodec> {
    local_addr: SocketAddr,
    stop: StopHandle,
    clients: Arc<Mutex<Vec<Arc<RpcClient<C>>>>>,
    wheel: TimerWheel,
    reaper_id: u32,
}

impl<C: PayloadCodec> RpcServer<C> {
    /// Bind `addr` and start accepting. Every connection shares the
    /// server's wheel and dispatch slots but gets its own session and
    /// pending table.
    ///
    /// # Errors
    ///
    /// `Io` if the bind fails.
    pub fn serve(
        addr: SocketAddr,
        config: &RemotingConfig,
        codec: Arc<C>,
        frame_factory: FrameCodecFactory,
        handler: Arc<dyn Dispatch<C>>,
    ) -> Result<Arc<Self>, RemotingError> {
        let (mut listener, stop) = StopListener::bind(addr)?;
        let local_addr = listener.local_addr();
        info!(%local_addr, "listening");
        let slots = Slots::new(config.max_dispatch, "javelin-serve");
        let wheel = TimerWheel::new(config.tick_granularity_hint, slots.clone());
        let clients: Arc<Mutex<Vec<Arc<RpcClient<C>>>>> = Arc::new(Mutex::new(Vec::new()));

        // Sweep idle and dead connections once per idle window.
        let sweep = Arc::clone(&clients);
        let reaper_id = wheel.repeated_timer(
            config.idle_window,
            Arc::new(move |_| {
                let mut clients = sweep.lock().unwrap();
                for client in clients.iter() {
                    if client.idle() {
                        debug!(remote = %client.remote_addr(), "closing idle connection");
                        client.shutdown();
                    }
                }
                clients.retain(|c| !c.is_closed());
            }),
            None,
        );

        let accept_config = config.clone();
        let accept_codec = Arc::clone(&codec);
        let accept_clients = Arc::clone(&clients);
        let accept_wheel = wheel.clone();
        thread::Builder::new()
            .name(format!("javelin-accept-{local_addr}"))
            .spawn(move || loop {
                let stream = match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        stream
                    }
                    Err(RemotingError::ConnectionClosed) => {
                        debug!(%local_addr, "accept loop stopping");
                        return;
                    }
                    Err(_err) => {
                        error!(error = %_err, "accept failed");
                        continue;
                    }
                };
                match RpcClient::start(
                    stream,
                    &accept_config,
                    Arc::clone(&accept_codec),
                    &frame_factory,
                    Arc::clone(&handler),
                    accept_wheel.clone(),
                    slots.clone(),
                ) {
                    Ok(client) => accept_clients.lock().unwrap().push(client),
                    Err(_err) => warn!(error = %_err, "session setup failed"),
                }
            })
            .map_err(RemotingError::from)?;

        Ok(Arc::new(Self {
            local_addr,
            stop,
            clients,
            wheel,
            reaper_id,
        }))
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently alive.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|c| !c.is_closed());
        clients.len()
    }

    /// Stop accepting, close every connection, and disarm the idle reaper.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.stop.stop();
        self.wheel.cancel_timer(self.reaper_id);
        let clients = std::mem::take(&mut *self.clients.lock().unwrap());
        for client in clients {
            client.shutdown();
        }
    }
}

impl<C: PayloadCodec> Drop for RpcServer<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::client::TContext;
    use crate::codec::{BytesCodec, FrameCodec, HeaderFrameCodec};
    use crate::packet::{Packet, MAX_PACKET_BYTES};

    fn factory() -> FrameCodecFactory {
        Arc::new(|| Box::new(HeaderFrameCodec::new(MAX_PACKET_BYTES)) as Box<dyn FrameCodec>)
    }

    fn echo_server(config: &RemotingConfig) -> Arc<RpcServer<BytesCodec>> {
        let handler = Arc::new(|ctx: TContext<BytesCodec>| {
            if let Some(payload) = ctx.payload {
                let _ = ctx
                    .client
                    .reply(ctx.packet.header.opaque, ctx.packet.header.cmd_type, &payload);
            }
        });
        RpcServer::serve(
            "127.0.0.1:0".parse().unwrap(),
            config,
            Arc::new(BytesCodec),
            factory(),
            handler,
        )
        .unwrap()
    }

    fn response_handler() -> Arc<dyn Dispatch<BytesCodec>> {
        Arc::new(|ctx: TContext<BytesCodec>| {
            if let Some(payload) = ctx.payload {
                ctx.client.complete(ctx.packet.header.opaque, payload);
            }
        })
    }

    #[test]
    fn serves_concurrent_clients() {
        let config = RemotingConfig::default();
        let server = echo_server(&config);
        let addr = server.local_addr();

        let mut joins = Vec::new();
        for i in 0..4u8 {
            let config = config.clone();
            joins.push(thread::spawn(move || {
                let client = RpcClient::connect(
                    addr,
                    &config,
                    Arc::new(BytesCodec),
                    &factory(),
                    response_handler(),
                )
                .unwrap();
                let body = vec![i; 32];
                let reply = client.call(1, &body, Duration::from_secs(5)).unwrap();
                assert_eq!(reply, body);
                client.shutdown();
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        server.shutdown();
    }

    #[test]
    fn shutdown_stops_accepting() {
        let config = RemotingConfig::default();
        let server = echo_server(&config);
        let addr = server.local_addr();
        server.shutdown();
        thread::sleep(Duration::from_millis(100));

        // Either the connect is refused outright or the dead session
        // surfaces on first use.
        let outcome = RpcClient::connect(
            addr,
            &config,
            Arc::new(BytesCodec),
            &factory(),
            response_handler(),
        )
        .and_then(|client| {
            client.write_and_get(Packet::new(1, b"late".to_vec()), Duration::from_millis(500))
        });
        assert!(outcome.is_err());
    }
}
