//! Contracts between the mixer and the transport I/O thread.
//!
//! The transport side owns the Bluetooth link, codec and pacing; this module
//! only models the record shared with it and the four outbound operations
//! the dispatcher invokes on it.

use crate::error::{Error, Result};
use crate::format::SampleFormat;
use crate::poll::EventCounter;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Clients feed the mix; the transport encoder drains it.
    Playback,
    /// The transport decoder writes; clients snoop the stream.
    Capture,
}

/// Point-to-point signals from the dispatcher to the transport I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    Open,
    Close,
    Resume,
    Sync,
    Drop,
}

/// Operations the transport layer provides to the dispatcher.
pub trait TransportOps: Send + Sync {
    fn signal(&self, signal: TransportSignal);
    /// Re-arm the encoder/decoder after a pause.
    fn resume(&self);
    /// Discard frames already queued on the transport side.
    fn drop_frames(&self);
    /// Tear down the transport once its last PCM has no clients.
    fn stop_if_no_clients(&self);
}

/// Per-channel volume as supplied by the transport. With soft volume the
/// scale is applied to the mix; without it only a zero scale is honoured,
/// as a hardware mute.
#[derive(Debug, Clone, Copy)]
pub struct ChannelVolume {
    pub scale: f64,
}

/// The transport-PCM record shared between the dispatcher and the transport
/// I/O thread.
pub struct TransportPcm {
    direction: Direction,
    format: SampleFormat,
    channels: usize,
    rate: u32,
    soft_volume: AtomicBool,
    volume: Mutex<Vec<ChannelVolume>>,
    /// Event counter the transport polls for "samples available"; bit
    /// patterns at or above the shutdown marker are reserved.
    handoff: Mutex<Option<EventCounter>>,
    ops: Box<dyn TransportOps>,
}

impl TransportPcm {
    pub fn new(
        direction: Direction,
        format: SampleFormat,
        channels: usize,
        rate: u32,
        ops: Box<dyn TransportOps>,
    ) -> Self {
        Self {
            direction,
            format,
            channels,
            rate,
            soft_volume: AtomicBool::new(false),
            volume: Mutex::new(vec![ChannelVolume { scale: 1.0 }; channels]),
            handoff: Mutex::new(None),
            ops,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn set_soft_volume(&self, enabled: bool) {
        self.soft_volume.store(enabled, Ordering::Relaxed);
    }

    /// Replaces the per-channel volume scales. Extra entries are ignored,
    /// missing ones keep their previous value.
    pub fn set_volume(&self, scales: &[f64]) {
        let mut volume = self.volume.lock().unwrap();
        for (slot, scale) in volume.iter_mut().zip(scales) {
            slot.scale = *scale;
        }
    }

    /// Current per-channel volume settings.
    pub fn volume(&self) -> Vec<ChannelVolume> {
        self.volume.lock().unwrap().clone()
    }

    /// Effective output scales for the next mix read.
    pub(crate) fn scales(&self) -> Vec<f64> {
        let soft = self.soft_volume.load(Ordering::Relaxed);
        self.volume
            .lock()
            .unwrap()
            .iter()
            .map(|v| {
                if soft {
                    v.scale
                } else if v.scale == 0.0 {
                    0.0
                } else {
                    1.0
                }
            })
            .collect()
    }

    /// Creates the hand-off counter if the transport side has not opened
    /// one yet.
    pub(crate) fn ensure_handoff(&self) -> io::Result<()> {
        let mut handoff = self.handoff.lock().unwrap();
        if handoff.is_none() {
            *handoff = Some(EventCounter::new(true)?);
        }
        Ok(())
    }

    /// The fd the transport I/O thread polls for "samples available", while
    /// the hand-off is open.
    pub fn handoff_fd(&self) -> Option<RawFd> {
        self.handoff.lock().unwrap().as_ref().map(|c| c.as_raw_fd())
    }

    /// Clears a pending "samples available" notification.
    pub(crate) fn clear_handoff(&self) -> Result<()> {
        let handoff = self.handoff.lock().unwrap();
        match handoff.as_ref() {
            Some(counter) => {
                counter.drain()?;
                Ok(())
            }
            None => Err(Error::Closed),
        }
    }

    /// Signals the transport I/O thread that samples are available.
    pub(crate) fn wake(&self) {
        if let Some(counter) = self.handoff.lock().unwrap().as_ref() {
            let _ = counter.post(1);
        }
    }

    /// Drops the transport side of the PCM hand-off.
    pub fn release(&self) {
        self.handoff.lock().unwrap().take();
    }

    pub(crate) fn ops(&self) -> &dyn TransportOps {
        &*self.ops
    }
}
