//! Multi-client PCM mixing and fan-out for transport-backed audio links.
//!
//! A [`PcmMulti`] sits between one transport I/O thread (a Bluetooth
//! encoder or decoder) and any number of local clients connected through
//! per-client byte pipes and control sockets. On a playback link the
//! client streams are summed into a fixed-point ring mix; on a capture
//! link the decoded stream is fanned out to every running client. Each
//! client joins, pauses, drains and leaves independently while the
//! transport-facing stream stays a smooth real-time flow.
//!
//! The transport side is abstracted behind [`TransportPcm`] and the
//! [`TransportOps`] contract; everything else (codec work, the control
//! plane, persistent volume storage) lives outside this crate.

mod client;
mod config;
mod error;
mod format;
mod mix_buffer;
mod multi;
mod poll;
mod transport;

pub use config::MultiOptions;
pub use error::{Error, Result};
pub use format::SampleFormat;
pub use mix_buffer::MixBuffer;
pub use multi::{MultiState, PcmMulti, multi_enabled};
pub use transport::{
    ChannelVolume, Direction, TransportOps, TransportPcm, TransportSignal,
};
