//! Transport configuration.
//!
//! One plain struct consumed by sessions, clients and servers. How these
//! values are loaded (files, flags, env) is the embedding application's
//! business, not ours.

use std::time::Duration;

use crate::packet::MAX_PACKET_BYTES;

/// Tunables for one transport instance.
///
/// Queue capacities bound memory per connection; the idle window and tick
/// hint feed keep-alive logic and the timer wheel respectively.
#[derive(Debug, Clone)]
pub struct RemotingConfig {
    /// Buffered-reader capacity for the session read pump, bytes.
    pub read_buffer_size: usize,
    /// Buffered-writer capacity for the session write pump, bytes.
    pub write_buffer_size: usize,
    /// Bounded read-queue capacity (decoded packets awaiting dispatch).
    pub read_queue_size: usize,
    /// Bounded write-queue capacity (packets awaiting serialization).
    /// Enqueue beyond this fails fast with `QueueFull`.
    pub write_queue_size: usize,
    /// A connection with no successful I/O for this long reports idle.
    pub idle_window: Duration,
    /// Maximum concurrently executing dispatch handlers per connection.
    pub max_dispatch: usize,
    /// Maximum outstanding correlation ids per connection; insertion beyond
    /// this evicts the oldest unresolved entry.
    pub max_pending: usize,
    /// Typical timeout scale; the timer wheel derives its tick granularity
    /// from this.
    pub tick_granularity_hint: Duration,
    /// Hard ceiling on one frame, enforced before any body allocation.
    pub max_frame_bytes: usize,
}

impl RemotingConfig {
    /// # Panics
    ///
    /// Panics if any queue capacity, the dispatch cap, or the pending cap
    /// is zero.
    #[must_use]
    fn new_validated(
        read_buffer_size: usize,
        write_buffer_size: usize,
        read_queue_size: usize,
        write_queue_size: usize,
        idle_window: Duration,
        max_dispatch: usize,
        max_pending: usize,
        tick_granularity_hint: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        assert!(read_queue_size > 0, "read_queue_size must be > 0");
        assert!(write_queue_size > 0, "write_queue_size must be > 0");
        assert!(max_dispatch > 0, "max_dispatch must be > 0");
        assert!(max_pending > 0, "max_pending must be > 0");

        Self {
            read_buffer_size,
            write_buffer_size,
            read_queue_size,
            write_queue_size,
            idle_window,
            max_dispatch,
            max_pending,
            tick_granularity_hint,
            max_frame_bytes,
        }
    }

    /// Builder-style setter for the write-queue capacity.
    #[must_use]
    pub fn with_write_queue_size(mut self, n: usize) -> Self {
        assert!(n > 0, "write_queue_size must be > 0");
        self.write_queue_size = n;
        self
    }

    /// Builder-style setter for the read-queue capacity.
    #[must_use]
    pub fn with_read_queue_size(mut self, n: usize) -> Self {
        assert!(n > 0, "read_queue_size must be > 0");
        self.read_queue_size = n;
        self
    }

    /// Builder-style setter for the idle window.
    #[must_use]
    pub const fn with_idle_window(mut self, window: Duration) -> Self {
        self.idle_window = window;
        self
    }

    /// Builder-style setter for the pending-table capacity.
    #[must_use]
    pub fn with_max_pending(mut self, n: usize) -> Self {
        assert!(n > 0, "max_pending must be > 0");
        self.max_pending = n;
        self
    }

    /// Builder-style setter for the dispatch concurrency cap.
    #[must_use]
    pub fn with_max_dispatch(mut self, n: usize) -> Self {
        assert!(n > 0, "max_dispatch must be > 0");
        self.max_dispatch = n;
        self
    }

    /// Builder-style setter for the tick granularity hint.
    #[must_use]
    pub const fn with_tick_granularity_hint(mut self, hint: Duration) -> Self {
        self.tick_granularity_hint = hint;
        self
    }
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self::new_validated(
            64 * 1024,
            64 * 1024,
            1000,
            1000,
            Duration::from_secs(10),
            8,
            16_000,
            Duration::from_secs(5),
            MAX_PACKET_BYTES,
        )
    }
}
