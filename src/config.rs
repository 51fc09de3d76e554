use std::time::Duration;

/// Tunables for a multi-client PCM, applied at construction.
#[derive(Debug, Clone, Copy)]
pub struct MultiOptions {
    /// Master switch; when false `multi_enabled` reports the whole subsystem
    /// as bypassed.
    pub enabled: bool,
    /// Upper bound on concurrently connected clients.
    pub max_clients: usize,
    /// Mix buffer capacity, in periods.
    pub buffer_periods: usize,
    /// Periods that must be mixed before the transport is woken, and the
    /// bound (plus one period) on how far a client may run ahead of the mix.
    pub mix_threshold: usize,
    /// Periods a playback client buffers locally before it starts feeding
    /// the mix.
    pub client_threshold: usize,
    /// Settle time between a drained pipe and the drain acknowledgement,
    /// covering frames still in flight on the Bluetooth side.
    pub drain_settle: Duration,
}

impl Default for MultiOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_clients: 32,
            buffer_periods: 16,
            mix_threshold: 2,
            client_threshold: 2,
            drain_settle: Duration::from_millis(300),
        }
    }
}

impl MultiOptions {
    /// Client byte buffers hold one period more than the start threshold.
    pub(crate) fn client_buffer_periods(&self) -> usize {
        self.client_threshold + 1
    }
}
