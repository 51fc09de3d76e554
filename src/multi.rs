//! Per-transport-PCM dispatcher.
//!
//! One `PcmMulti` sits between a transport I/O thread and any number of
//! local clients. For playback a worker thread mixes client streams into
//! the ring buffer that [`PcmMulti::read`] drains; for capture
//! [`PcmMulti::write`] fans decoded samples out to every running client
//! while the worker only watches control sockets and hang-ups.

use crate::client::{self, Client, ClientCtx, ClientState, EventKind};
use crate::config::MultiOptions;
use crate::error::{Error, Result};
use crate::mix_buffer::MixBuffer;
use crate::poll::{EV_HUP, EV_IN, EventCounter, Poller};
use crate::transport::{Direction, TransportPcm, TransportSignal};
use nix::libc;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// Wake-up values at or above this marker request worker shutdown; any
/// lesser value means data/attention.
const WAKE_SHUTDOWN: u64 = 0xDEAD_0000;

/// Event-loop token reserved for the wake-up counter.
const WAKE_TOKEN: u64 = u64::MAX;

/// Whether multi-client support applies to this PCM at all.
pub fn multi_enabled(options: &MultiOptions, pcm: &TransportPcm) -> bool {
    options.enabled && pcm.format().mixable()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiState {
    Init,
    Running,
    Paused,
    Finished,
}

/// Relaxed loads are fine everywhere; transitions happen on the worker or
/// under the client lock.
struct AtomicState(AtomicU8);

impl AtomicState {
    fn new(state: MultiState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> MultiState {
        match self.0.load(Ordering::Relaxed) {
            0 => MultiState::Init,
            1 => MultiState::Running,
            2 => MultiState::Paused,
            _ => MultiState::Finished,
        }
    }

    fn set(&self, state: MultiState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }
}

/// Mix buffer and the transport hand-shake flag, guarded together.
struct BufferSlot {
    mix: Option<MixBuffer>,
    ready: bool,
}

struct ClientSet {
    list: Vec<Client>,
    /// Number of clients currently counted as active; maintained by
    /// [`Client::set_state`] only.
    active: usize,
    next_id: u64,
}

struct Inner {
    pcm: Arc<TransportPcm>,
    options: MultiOptions,
    poller: Poller,
    /// Worker wake-up counter; also carries the shutdown marker.
    wake: EventCounter,
    state: AtomicState,
    period_frames: AtomicUsize,
    period_bytes: AtomicUsize,
    buffer: Mutex<BufferSlot>,
    cond: Condvar,
    clients: Mutex<ClientSet>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn lock_buffer(&self) -> MutexGuard<'_, BufferSlot> {
        self.buffer.lock().expect("buffer mutex poisoned")
    }

    fn lock_clients(&self) -> MutexGuard<'_, ClientSet> {
        self.clients.lock().expect("client mutex poisoned")
    }

    fn client_ctx<'a>(&'a self, active: &'a mut usize) -> ClientCtx<'a> {
        let channels = self.pcm.channels();
        ClientCtx {
            poller: &self.poller,
            direction: self.pcm.direction(),
            options: &self.options,
            period_bytes: self.period_bytes.load(Ordering::Relaxed),
            period_samples: self.period_frames.load(Ordering::Relaxed) * channels,
            frame_bytes: self.pcm.format().frame_bytes(channels),
            channels,
            active,
        }
    }
}

pub struct PcmMulti {
    inner: Arc<Inner>,
}

impl PcmMulti {
    pub fn new(pcm: Arc<TransportPcm>, options: MultiOptions) -> Result<Self> {
        let poller = Poller::new()?;
        let wake = EventCounter::new(false)?;
        poller.add(wake.as_raw_fd(), EV_IN, WAKE_TOKEN)?;
        Ok(Self {
            inner: Arc::new(Inner {
                pcm,
                options,
                poller,
                wake,
                state: AtomicState::new(MultiState::Init),
                period_frames: AtomicUsize::new(0),
                period_bytes: AtomicUsize::new(0),
                buffer: Mutex::new(BufferSlot {
                    mix: None,
                    ready: false,
                }),
                cond: Condvar::new(),
                clients: Mutex::new(ClientSet {
                    list: Vec::new(),
                    active: 0,
                    next_id: 0,
                }),
                worker: Mutex::new(None),
            }),
        })
    }

    pub fn state(&self) -> MultiState {
        self.inner.state.get()
    }

    /// Marks the whole stream paused on behalf of the transport layer. A
    /// client resuming flips it back and re-arms the decoder.
    pub fn pause(&self) {
        self.inner.state.set(MultiState::Paused);
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock_clients().list.len()
    }

    /// Latency contributed by the mix and client pre-roll thresholds.
    pub fn delay(&self) -> Duration {
        let rate = self.inner.pcm.rate();
        if rate == 0 {
            return Duration::ZERO;
        }
        let period_frames = self.inner.period_frames.load(Ordering::Relaxed) as u64;
        let periods =
            (self.inner.options.mix_threshold + self.inner.options.client_threshold) as u64;
        Duration::from_micros(period_frames * periods * 1_000_000 / u64::from(rate))
    }

    /// Sets up buffer parameters and enables client audio I/O.
    ///
    /// `transfer_samples` is the largest number of samples moved between the
    /// transport I/O thread and this dispatcher in a single transfer.
    pub fn init(&self, transfer_samples: usize) -> Result<()> {
        debug!("initializing multi-client support");
        let inner = &self.inner;
        let channels = inner.pcm.channels();

        inner.state.set(MultiState::Init);
        let period_frames = transfer_samples / channels;
        let period_bytes = period_frames * inner.pcm.format().frame_bytes(channels);
        inner.period_frames.store(period_frames, Ordering::Relaxed);
        inner.period_bytes.store(period_bytes, Ordering::Relaxed);

        if inner.pcm.direction() == Direction::Playback {
            let mix = MixBuffer::new(
                inner.pcm.format(),
                channels,
                inner.options.buffer_periods * period_frames,
                period_frames,
                inner.options.mix_threshold,
            )?;
            let mut slot = inner.lock_buffer();
            slot.mix = Some(mix);
            slot.ready = false;
        }

        // Initialize clients whose registration preceded the parameters;
        // any that fail are evicted.
        {
            let mut set = inner.lock_clients();
            let ClientSet { list, active, .. } = &mut *set;
            let mut ctx = inner.client_ctx(active);
            let mut i = 0;
            while i < list.len() {
                if list[i].state == ClientState::Init && list[i].init(&mut ctx).is_err() {
                    let mut failed = list.remove(i);
                    failed.set_state(ClientState::Finished, &mut ctx);
                    failed.release(&inner.poller);
                    continue;
                }
                i += 1;
            }
        }

        if inner.pcm.direction() == Direction::Capture && self.client_count() > 0 {
            self.start_worker()?;
        }
        Ok(())
    }

    /// Registers a new client stream and starts the worker if necessary.
    pub fn add_client(&self, pcm_fd: OwnedFd, control_fd: OwnedFd) -> Result<()> {
        let inner = &self.inner;
        if self.client_count() >= inner.options.max_clients {
            return Err(Error::TooManyClients);
        }

        if inner.pcm.direction() == Direction::Capture
            && inner.state.get() == MultiState::Finished
        {
            // The previous worker generation has ended; clean it up before
            // admitting a new one.
            self.reset();
        }

        inner.pcm.ensure_handoff()?;

        if let Err(e) = self.register_client(pcm_fd, control_fd) {
            inner.pcm.release();
            return Err(e);
        }
        if let Err(e) = self.start_worker() {
            inner.pcm.release();
            return Err(e);
        }
        Ok(())
    }

    fn register_client(&self, pcm_fd: OwnedFd, control_fd: OwnedFd) -> Result<()> {
        let inner = &self.inner;
        let direction = inner.pcm.direction();

        let mut set = inner.lock_clients();
        let id = set.next_id;
        set.next_id += 1;

        let ClientSet { list, active, .. } = &mut *set;
        let mut new_client = Client::new(id, pcm_fd, control_fd, &inner.poller, direction)?;

        // Initialization is postponed until the multi itself has been
        // given its transfer parameters.
        if inner.period_bytes.load(Ordering::Relaxed) > 0 {
            let mut ctx = inner.client_ctx(active);
            if let Err(e) = new_client.init(&mut ctx) {
                new_client.release(&inner.poller);
                return Err(e);
            }
        }
        list.push(new_client);

        match direction {
            Direction::Playback => {
                if inner.state.get() == MultiState::Finished {
                    inner.state.set(MultiState::Init);
                }
            }
            Direction::Capture => {
                if inner.state.get() == MultiState::Init {
                    inner.state.set(MultiState::Running);
                }
            }
        }
        debug!(client = id, total = list.len(), "new client");
        Ok(())
    }

    fn start_worker(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock().expect("worker mutex poisoned");
        if worker.is_some() {
            return Ok(());
        }
        let name = match self.inner.pcm.direction() {
            Direction::Playback => "pcm-mix",
            Direction::Capture => "pcm-snoop",
        };
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match inner.pcm.direction() {
                Direction::Playback => mix_loop(&inner),
                Direction::Capture => snoop_loop(&inner),
            })
            .map_err(|e| {
                error!("cannot start {name} worker: {e}");
                Error::Io(e)
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Reads mixed samples on behalf of the transport encoder.
    ///
    /// Blocks until the worker has refilled the mix, then drains at most
    /// one period. `Ok(0)` means the stream has finished and the hand-off
    /// has been released.
    pub fn read(&self, out: &mut [u8], samples: usize) -> Result<usize> {
        let inner = &self.inner;

        // Clear the "samples available" notification, then prompt the
        // worker for one refill.
        inner.pcm.clear_handoff()?;
        inner.wake.post(1)?;

        let mut slot = inner.lock_buffer();
        let mut state = inner.state.get();
        while state == MultiState::Running && !slot.ready {
            slot = inner.cond.wait(slot).expect("buffer mutex poisoned");
            state = inner.state.get();
        }
        slot.ready = false;

        match state {
            MultiState::Running => {
                let scales = inner.pcm.scales();
                let Some(mix) = slot.mix.as_mut() else {
                    return Err(Error::Again);
                };
                let n = mix.read(out, samples, &scales);
                if n == 0 { Err(Error::Again) } else { Ok(n) }
            }
            MultiState::Init => Err(Error::Again),
            MultiState::Finished => {
                drop(slot);
                inner.pcm.release();
                Ok(0)
            }
            MultiState::Paused => Err(Error::Io(io::Error::from_raw_os_error(libc::EIO))),
        }
    }

    /// Fans decoded samples out to every running capture client. Returns
    /// the number of samples consumed; 0 once the worker has finished.
    pub fn write(&self, data: &[u8]) -> usize {
        let inner = &self.inner;
        let samples = data.len() / inner.pcm.format().sample_bytes();

        let mut set = inner.lock_clients();
        if inner.state.get() == MultiState::Finished {
            drop(set);
            inner.pcm.release();
            return 0;
        }

        let ClientSet { list, active, .. } = &mut *set;
        let mut ctx = inner.client_ctx(active);
        let mut i = 0;
        while i < list.len() {
            if list[i].state == ClientState::Running {
                list[i].write(data, &mut ctx);
            }
            if list[i].state == ClientState::Finished {
                let mut finished = list.remove(i);
                finished.release(&inner.poller);
                debug!(total = list.len(), "removed client");
            } else {
                i += 1;
            }
        }
        samples
    }

    /// Stops the worker and evicts all clients so the next generation can
    /// start from scratch.
    pub fn reset(&self) {
        self.cleanup();
        self.inner.state.set(MultiState::Init);
    }

    fn cleanup(&self) {
        let handle = self
            .inner
            .worker
            .lock()
            .expect("worker mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = self.inner.wake.post(WAKE_SHUTDOWN);
            let _ = handle.join();
        }

        if self.inner.pcm.direction() == Direction::Playback {
            let mut slot = self.inner.lock_buffer();
            slot.mix = None;
            slot.ready = false;
        }

        let mut set = self.inner.lock_clients();
        let ClientSet { list, active, .. } = &mut *set;
        let mut ctx = self.inner.client_ctx(active);
        while let Some(mut removed) = list.pop() {
            removed.set_state(ClientState::Finished, &mut ctx);
            removed.release(&self.inner.poller);
        }
    }
}

impl Drop for PcmMulti {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn stop_if_no_clients(inner: &Inner) {
    inner.pcm.release();
    inner.pcm.ops().signal(TransportSignal::Close);
    inner.pcm.ops().stop_if_no_clients();
}

/// Adds pending client bytes to the mix and publishes the result to the
/// transport thread waiting in [`PcmMulti::read`].
fn refill_mix(inner: &Inner) {
    let mut slot = inner.lock_buffer();
    {
        let mut set = inner.lock_clients();
        let ClientSet { list, active, .. } = &mut *set;
        let mut ctx = inner.client_ctx(active);
        if let Some(mix) = slot.mix.as_mut() {
            for c in list.iter_mut() {
                c.deliver(mix, &mut ctx);
            }
        }
    }
    slot.ready = true;
    inner.cond.notify_one();
}

/// Handles one client readiness event on the mix thread. Returns true when
/// the client was removed, which invalidates the readiness array.
fn mix_client_event(inner: &Inner, id: u64, kind: EventKind) -> bool {
    let mut slot = inner.lock_buffer();
    let mut set = inner.lock_clients();
    let ClientSet { list, active, .. } = &mut *set;
    let Some(idx) = list.iter().position(|c| c.id == id) else {
        return false;
    };
    let mut ctx = inner.client_ctx(active);

    match kind {
        EventKind::Pcm => list[idx].handle_pcm(&mut ctx),
        EventKind::Control => list[idx].handle_control(&mut ctx, slot.mix.as_mut()),
        EventKind::Drain => list[idx].handle_drain(&mut ctx),
    }

    if list[idx].state == ClientState::Finished {
        let mut finished = list.remove(idx);
        finished.release(&inner.poller);
        debug!(total = list.len(), "removed client");
        true
    } else {
        false
    }
}

/// The playback worker: feeds the mix from client pipes and paces the
/// transport through the hand-off counter.
fn mix_loop(inner: &Inner) {
    let max_events = 1 + inner.options.max_clients * 3;
    let mut events = Vec::new();
    debug!("starting pcm mix loop");

    'run: loop {
        let count = match inner.poller.wait(&mut events, max_events) {
            Ok(count) => count,
            Err(e) => {
                error!("event wait failed: {e}");
                break 'run;
            }
        };

        for n in 0..count {
            let token = events[n].u64;
            if token == WAKE_TOKEN {
                let value = inner.wake.drain().unwrap_or(0);
                if value >= WAKE_SHUTDOWN {
                    break 'run;
                }
                // One mix refill per transport wake.
                refill_mix(inner);
                break;
            }
            let (id, kind) = client::split_token(token);
            let Some(kind) = kind else { continue };
            if mix_client_event(inner, id, kind) {
                // Re-poll: the readiness array is stale after a removal.
                break;
            }
        }

        // Housekeeping after each event batch.
        let mut transport_gone = false;
        let mut drop_transport = false;
        {
            let mut slot = inner.lock_buffer();
            let mut set = inner.lock_clients();
            if set.list.is_empty() {
                inner.state.set(MultiState::Finished);
                if let Some(mix) = slot.mix.as_mut() {
                    mix.clear();
                }
                transport_gone = true;
            } else if set.list.len() == 1 && set.list[0].drop_pending {
                // With other clients streaming the mix is left alone; the
                // last client's drop may clear it.
                if let Some(mix) = slot.mix.as_mut() {
                    mix.clear();
                }
                set.list[0].drop_pending = false;
                drop_transport = true;
            }
        }
        if transport_gone {
            stop_if_no_clients(inner);
            continue;
        }
        if drop_transport {
            inner.pcm.ops().drop_frames();
        }

        match inner.state.get() {
            MultiState::Init => {
                let mut wake_transport = false;
                {
                    let mut slot = inner.lock_buffer();
                    let mut set = inner.lock_clients();
                    if set.active > 0 {
                        let ClientSet { list, active, .. } = &mut *set;
                        let mut ctx = inner.client_ctx(active);
                        if let Some(mix) = slot.mix.as_mut() {
                            for c in list.iter_mut() {
                                c.deliver(mix, &mut ctx);
                            }
                            if mix.at_threshold() {
                                inner.state.set(MultiState::Running);
                                wake_transport = true;
                            }
                        }
                    }
                }
                if wake_transport {
                    inner.pcm.wake();
                }
            }
            MultiState::Running => {
                let starved = inner
                    .lock_buffer()
                    .mix
                    .as_ref()
                    .is_none_or(|mix| mix.empty());
                if starved {
                    inner.state.set(MultiState::Init);
                } else {
                    inner.pcm.wake();
                }
            }
            _ => {}
        }
    }

    inner.state.set(MultiState::Finished);
    inner.cond.notify_all();
    inner.pcm.wake();
    debug!("mix loop terminated");
}

enum SnoopOutcome {
    None,
    /// A client was removed; the readiness array is stale.
    Removed,
    LastRemoved,
    ResumeTransport,
}

fn snoop_client_event(inner: &Inner, id: u64, kind: EventKind, flags: u32) -> SnoopOutcome {
    let mut set = inner.lock_clients();
    let ClientSet { list, active, .. } = &mut *set;
    let Some(idx) = list.iter().position(|c| c.id == id) else {
        return SnoopOutcome::None;
    };
    let mut ctx = inner.client_ctx(active);

    if flags & EV_HUP != 0 {
        list[idx].handle_close(kind, &mut ctx);
        let mut finished = list.remove(idx);
        finished.release(&inner.poller);
        debug!(total = list.len(), "removed client");
        if list.is_empty() {
            inner.state.set(MultiState::Finished);
            SnoopOutcome::LastRemoved
        } else {
            SnoopOutcome::Removed
        }
    } else {
        if kind == EventKind::Control {
            list[idx].handle_control(&mut ctx, None);
        }
        // A resumed client may need the decoder re-armed.
        if inner.state.get() == MultiState::Paused && *ctx.active > 0 {
            inner.state.set(MultiState::Running);
            SnoopOutcome::ResumeTransport
        } else {
            SnoopOutcome::None
        }
    }
}

/// The capture worker: only control traffic and hang-ups; the data path
/// runs on the transport thread through [`PcmMulti::write`].
fn snoop_loop(inner: &Inner) {
    let max_events = 1 + inner.options.max_clients * 3;
    let mut events = Vec::new();
    debug!("starting pcm snoop loop");

    'run: loop {
        let count = match inner.poller.wait(&mut events, max_events) {
            Ok(count) => count,
            Err(e) => {
                error!("event wait failed: {e}");
                break 'run;
            }
        };

        for n in 0..count {
            let token = events[n].u64;
            let flags = events[n].events;
            if token == WAKE_TOKEN {
                let value = inner.wake.drain().unwrap_or(0);
                if value >= WAKE_SHUTDOWN {
                    break 'run;
                }
                continue;
            }
            let (id, kind) = client::split_token(token);
            let Some(kind) = kind else { continue };
            match snoop_client_event(inner, id, kind, flags) {
                SnoopOutcome::None => {}
                SnoopOutcome::Removed => break,
                SnoopOutcome::LastRemoved => {
                    stop_if_no_clients(inner);
                    break;
                }
                SnoopOutcome::ResumeTransport => inner.pcm.ops().resume(),
            }
        }
    }

    inner.state.set(MultiState::Finished);
    debug!("snoop loop terminated");
}
