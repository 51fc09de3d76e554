//! Per-client stream state: a data pipe, a control socket and, for
//! playback, a drain settle timer, driven by the dispatcher's event loop.

use crate::config::MultiOptions;
use crate::error::{Error, Result};
use crate::mix_buffer::MixBuffer;
use crate::poll::{self, EV_IN, EV_OUT, IoStatus, Poller, SettleTimer};
use crate::transport::Direction;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::{debug, error, warn};

const CTRL_DRAIN: &[u8] = b"Drain";
const CTRL_DROP: &[u8] = b"Drop";
const CTRL_PAUSE: &[u8] = b"Pause";
const CTRL_RESUME: &[u8] = b"Resume";

const REPLY_OK: &[u8] = b"OK";
const REPLY_INVALID: &[u8] = b"Invalid";

/// Bytes discarded from the data pipe on a drop request.
const DROP_DISCARD_LIMIT: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    /// Registered, buffer not yet allocated.
    Init,
    /// Ready, not yet streaming.
    Idle,
    Running,
    Paused,
    /// Drain requested; still reading the pipe and feeding the mix.
    Draining1,
    /// Pipe fully consumed; waiting out the settle timer.
    Draining2,
    Finished,
}

/// Which of a client's descriptors produced a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Pcm = 0,
    Control = 1,
    Drain = 2,
}

pub(crate) fn token(id: u64, kind: EventKind) -> u64 {
    (id << 2) | kind as u64
}

pub(crate) fn split_token(token: u64) -> (u64, Option<EventKind>) {
    let kind = match token & 0x3 {
        0 => Some(EventKind::Pcm),
        1 => Some(EventKind::Control),
        2 => Some(EventKind::Drain),
        _ => None,
    };
    (token >> 2, kind)
}

/// Dispatcher state a client needs while handling an event. `active` is the
/// parent's running-client count, adjusted only by [`Client::set_state`].
pub(crate) struct ClientCtx<'a> {
    pub poller: &'a Poller,
    pub direction: Direction,
    pub options: &'a MultiOptions,
    pub period_bytes: usize,
    pub period_samples: usize,
    pub frame_bytes: usize,
    pub channels: usize,
    pub active: &'a mut usize,
}

pub(crate) struct Client {
    pub(crate) id: u64,
    pcm_fd: Option<OwnedFd>,
    control_fd: Option<OwnedFd>,
    drain_timer: Option<SettleTimer>,
    pub(crate) state: ClientState,
    /// Pre-period byte buffer (playback only).
    buffer: Vec<u8>,
    /// Bytes currently buffered from the pipe.
    in_offset: usize,
    /// Mix cursor; negative means ahead of the mix head by that many samples.
    out_offset: isize,
    /// Mix availability snapshot while waiting for the drain to complete.
    drain_avail: usize,
    /// Set by a drop request; consumed by the dispatcher once it is safe to
    /// clear the mix.
    pub(crate) drop_pending: bool,
    /// Whether the data pipe is currently enabled in the event set.
    watch: bool,
}

impl Client {
    /// Registers both descriptors (and, for playback, a fresh settle timer)
    /// with the event loop. The client starts in `Init` with the pipe muted.
    pub(crate) fn new(
        id: u64,
        pcm_fd: OwnedFd,
        control_fd: OwnedFd,
        poller: &Poller,
        direction: Direction,
    ) -> io::Result<Self> {
        poller.add(pcm_fd.as_raw_fd(), 0, token(id, EventKind::Pcm))?;
        if let Err(e) = poller.add(control_fd.as_raw_fd(), EV_IN, token(id, EventKind::Control)) {
            poller.remove(pcm_fd.as_raw_fd());
            return Err(e);
        }

        let mut drain_timer = None;
        if direction == Direction::Playback {
            let timer = match SettleTimer::new() {
                Ok(timer) => timer,
                Err(e) => {
                    poller.remove(pcm_fd.as_raw_fd());
                    poller.remove(control_fd.as_raw_fd());
                    return Err(e);
                }
            };
            if let Err(e) = poller.add(timer.as_raw_fd(), EV_IN, token(id, EventKind::Drain)) {
                poller.remove(pcm_fd.as_raw_fd());
                poller.remove(control_fd.as_raw_fd());
                return Err(e);
            }
            drain_timer = Some(timer);
        }

        Ok(Self {
            id,
            pcm_fd: Some(pcm_fd),
            control_fd: Some(control_fd),
            drain_timer,
            state: ClientState::Init,
            buffer: Vec::new(),
            in_offset: 0,
            out_offset: 0,
            drain_avail: usize::MAX,
            drop_pending: false,
            watch: false,
        })
    }

    /// Allocates the byte buffer and enables streaming. Capture clients are
    /// active immediately.
    pub(crate) fn init(&mut self, ctx: &mut ClientCtx<'_>) -> Result<()> {
        if ctx.direction == Direction::Playback {
            let size = ctx.options.client_buffer_periods() * ctx.period_bytes;
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(size)
                .map_err(|_| Error::OutOfMemory)?;
            buffer.resize(size, 0);
            self.buffer = buffer;
            self.set_state(ClientState::Idle, ctx);
            self.watch_pcm(ctx, true);
        } else {
            self.set_state(ClientState::Running, ctx);
        }
        Ok(())
    }

    pub(crate) fn is_active(&self, direction: Direction) -> bool {
        match direction {
            Direction::Playback => {
                matches!(self.state, ClientState::Running | ClientState::Draining1)
            }
            Direction::Capture => self.state == ClientState::Running,
        }
    }

    /// The single place a client changes state. Keeps the parent's active
    /// count equal to the number of active clients, and applies the
    /// entry side-effects of the new state.
    pub(crate) fn set_state(&mut self, new: ClientState, ctx: &mut ClientCtx<'_>) {
        if new == self.state {
            return;
        }
        if ctx.direction == Direction::Playback && new == ClientState::Running {
            match self.state {
                ClientState::Idle => {
                    // Pre-roll: the write head enters mix_threshold periods
                    // ahead of the mix, less whatever is already buffered.
                    let buffered = (self.in_offset * ctx.channels / ctx.frame_bytes) as isize;
                    self.out_offset =
                        buffered - (ctx.options.mix_threshold * ctx.period_samples) as isize;
                }
                // A resume that arrives mid-drain is ignored.
                ClientState::Draining1 => return,
                _ => {}
            }
        }
        if new == ClientState::Idle {
            self.drain_avail = usize::MAX;
        }
        let was_active = self.is_active(ctx.direction);
        self.state = new;
        let is_active = self.is_active(ctx.direction);
        if was_active && !is_active {
            *ctx.active -= 1;
        } else if !was_active && is_active {
            *ctx.active += 1;
        }
    }

    fn watch_pcm(&mut self, ctx: &ClientCtx<'_>, enabled: bool) {
        if self.watch == enabled {
            return;
        }
        let Some(fd) = &self.pcm_fd else { return };
        let events = if !enabled {
            0
        } else if ctx.direction == Direction::Playback {
            EV_IN
        } else {
            EV_OUT
        };
        let _ = ctx
            .poller
            .modify(fd.as_raw_fd(), events, token(self.id, EventKind::Pcm));
        self.watch = enabled;
    }

    fn close_pcm(&mut self, poller: &Poller) {
        if let Some(fd) = self.pcm_fd.take() {
            poller.remove(fd.as_raw_fd());
            self.watch = false;
        }
    }

    fn close_control(&mut self, poller: &Poller) {
        if let Some(fd) = self.control_fd.take() {
            poller.remove(fd.as_raw_fd());
        }
    }

    /// Reads from the pipe into the tail of the byte buffer.
    fn fill_from_pipe(&mut self) -> io::Result<IoStatus> {
        let Some(fd) = &self.pcm_fd else {
            return Ok(IoStatus::Closed);
        };
        if self.in_offset == self.buffer.len() {
            return Ok(IoStatus::WouldBlock);
        }
        let status = poll::read_nonblock(fd.as_raw_fd(), &mut self.buffer[self.in_offset..])?;
        if let IoStatus::Transferred(n) = status {
            self.in_offset += n;
        }
        Ok(status)
    }

    /// Playback data pipe became readable.
    pub(crate) fn handle_pcm(&mut self, ctx: &mut ClientCtx<'_>) {
        match self.fill_from_pipe() {
            Ok(IoStatus::Transferred(_)) => {}
            Ok(IoStatus::WouldBlock) => self.watch_pcm(ctx, false),
            Ok(IoStatus::Closed) | Err(_) => {
                self.close_pcm(ctx.poller);
                self.set_state(ClientState::Finished, ctx);
                return;
            }
        }

        // Start feeding the mix once enough periods are buffered locally.
        if self.state == ClientState::Idle
            && self.in_offset > ctx.options.client_threshold * ctx.period_bytes
        {
            self.set_state(ClientState::Running, ctx);
        }
    }

    /// Moves buffered bytes into the mix; called whenever the mix wants
    /// more data. Also advances the drain handshake.
    pub(crate) fn deliver(&mut self, mix: &mut MixBuffer, ctx: &mut ClientCtx<'_>) {
        if !matches!(self.state, ClientState::Running | ClientState::Draining1) {
            return;
        }

        if self.state == ClientState::Draining1 {
            match self.fill_from_pipe() {
                Ok(IoStatus::Closed) | Err(_) => {
                    self.close_pcm(ctx.poller);
                    self.set_state(ClientState::Finished, ctx);
                    return;
                }
                Ok(status) => {
                    if self.in_offset == 0 && status == IoStatus::WouldBlock {
                        let mix_avail = mix.pending(self.out_offset);
                        // `>` detects the mix head wrapping past this cursor.
                        if mix_avail == 0 || mix_avail > self.drain_avail {
                            self.set_state(ClientState::Draining2, ctx);
                            if let Some(timer) = &self.drain_timer {
                                let _ = timer.arm(ctx.options.drain_settle);
                            }
                            return;
                        }
                        self.drain_avail = mix_avail;
                    }
                }
            }
        }

        if self.in_offset > 0 {
            let consumed = mix.add(&mut self.out_offset, &self.buffer[..self.in_offset]);
            if consumed > 0 {
                self.buffer.copy_within(consumed..self.in_offset, 0);
                self.in_offset -= consumed;
                // The byte buffer has room again.
                self.watch_pcm(ctx, true);
            }
        }
    }

    /// The settle timer fired.
    pub(crate) fn handle_drain(&mut self, ctx: &mut ClientCtx<'_>) {
        if self.state != ClientState::Draining2 {
            return;
        }
        debug!(client = self.id, "drain complete");
        self.set_state(ClientState::Idle, ctx);
        if let Some(timer) = &self.drain_timer {
            let _ = timer.disarm();
        }
        self.watch_pcm(ctx, true);
        self.in_offset = 0;
        self.reply(REPLY_OK);
    }

    /// A command arrived on the control socket.
    pub(crate) fn handle_control(&mut self, ctx: &mut ClientCtx<'_>, mix: Option<&mut MixBuffer>) {
        let mut command = [0u8; 6];
        let len = {
            let Some(fd) = &self.control_fd else { return };
            match poll::read_nonblock(fd.as_raw_fd(), &mut command) {
                Ok(IoStatus::Transferred(n)) => n,
                Ok(IoStatus::WouldBlock) => return,
                Ok(IoStatus::Closed) | Err(_) => {
                    self.close_control(ctx.poller);
                    self.set_state(ClientState::Finished, ctx);
                    return;
                }
            }
        };

        if matches!(self.state, ClientState::Draining1 | ClientState::Draining2) {
            // A well-behaved client blocks during drain, but not all clients
            // are well behaved. Settle the drain before the new command.
            self.handle_drain(ctx);
        }

        let command = &command[..len];
        if command == CTRL_DRAIN {
            self.begin_drain(ctx);
        } else if command == CTRL_DROP {
            self.drop_stream(ctx);
            self.reply(REPLY_OK);
        } else if command == CTRL_PAUSE {
            self.pause(ctx, mix);
            self.reply(REPLY_OK);
        } else if command == CTRL_RESUME {
            self.resume(ctx);
            self.reply(REPLY_OK);
        } else {
            warn!(
                client = self.id,
                "invalid control command: {:?}",
                String::from_utf8_lossy(command)
            );
            self.reply(REPLY_INVALID);
        }
    }

    /// The drain acknowledgement is deferred until the settle timer fires.
    fn begin_drain(&mut self, ctx: &mut ClientCtx<'_>) {
        debug!(client = self.id, "drain requested");
        if ctx.direction == Direction::Playback && self.state == ClientState::Running {
            self.set_state(ClientState::Draining1, ctx);
            self.watch_pcm(ctx, false);
        } else {
            self.reply(REPLY_OK);
        }
    }

    fn drop_stream(&mut self, ctx: &mut ClientCtx<'_>) {
        debug!(client = self.id, "drop requested");
        if ctx.direction != Direction::Playback {
            return;
        }
        if let Some(timer) = &self.drain_timer {
            let _ = timer.disarm();
        }
        if let Some(fd) = &self.pcm_fd {
            let _ = poll::discard_pending(fd.as_raw_fd(), DROP_DISCARD_LIMIT);
        }
        self.in_offset = 0;
        self.set_state(ClientState::Idle, ctx);
        self.drop_pending = true;
    }

    fn pause(&mut self, ctx: &mut ClientCtx<'_>, mix: Option<&mut MixBuffer>) {
        debug!(client = self.id, "pause requested");
        self.set_state(ClientState::Paused, ctx);
        self.watch_pcm(ctx, false);
        if ctx.direction == Direction::Playback
            && let Some(mix) = mix
        {
            // Snap to a relative cursor so resume re-enters at the mix head.
            // A zero delay means the cursor already sits on the head.
            let delay = mix.delay(self.out_offset);
            if delay > 0 {
                self.out_offset = -(delay as isize);
            }
        }
    }

    fn resume(&mut self, ctx: &mut ClientCtx<'_>) {
        debug!(client = self.id, "resume requested");
        if self.state == ClientState::Idle {
            if ctx.direction == Direction::Playback {
                self.watch_pcm(ctx, true);
                self.drop_pending = false;
            } else {
                self.set_state(ClientState::Running, ctx);
            }
        }
        if self.state == ClientState::Paused {
            self.set_state(ClientState::Running, ctx);
            if ctx.direction == Direction::Playback {
                self.watch_pcm(ctx, true);
            }
        }
    }

    fn reply(&self, message: &[u8]) {
        let Some(fd) = &self.control_fd else { return };
        match poll::write_nonblock(fd.as_raw_fd(), message) {
            Ok(IoStatus::Transferred(n)) if n == message.len() => {}
            _ => error!(client = self.id, "control reply failed"),
        }
    }

    /// Best-effort delivery of decoded samples to a capture client.
    pub(crate) fn write(&mut self, data: &[u8], ctx: &mut ClientCtx<'_>) {
        let mut remaining = data;
        while !remaining.is_empty() {
            let Some(fd) = &self.pcm_fd else { return };
            match poll::write_nonblock(fd.as_raw_fd(), remaining) {
                Ok(IoStatus::Transferred(n)) if n > 0 => remaining = &remaining[n..],
                Ok(IoStatus::WouldBlock) => {
                    // A slow client loses frames; stalling here would starve
                    // the decoder and overrun the controller instead.
                    warn!(client = self.id, "dropping PCM frames: client overrun");
                    return;
                }
                Ok(_) | Err(_) => {
                    self.close_pcm(ctx.poller);
                    self.set_state(ClientState::Finished, ctx);
                    return;
                }
            }
        }
    }

    /// Peer hang-up observed on one of the client's sockets.
    pub(crate) fn handle_close(&mut self, kind: EventKind, ctx: &mut ClientCtx<'_>) {
        match kind {
            EventKind::Pcm => self.close_pcm(ctx.poller),
            EventKind::Control => self.close_control(ctx.poller),
            EventKind::Drain => {}
        }
        self.set_state(ClientState::Finished, ctx);
    }

    /// Deregisters every event source and closes the owned descriptors.
    pub(crate) fn release(&mut self, poller: &Poller) {
        if let Some(timer) = self.drain_timer.take() {
            poller.remove(timer.as_raw_fd());
        }
        self.close_pcm(poller);
        self.close_control(poller);
        self.buffer = Vec::new();
        self.in_offset = 0;
    }
}
