//! Fixed-point ring buffer that sums client PCM streams into a single mix.
//!
//! Each playback client owns a signed cursor into the ring. A non-negative
//! cursor is an absolute sample offset; a negative cursor places the
//! client's next write |cursor| samples ahead of the current mix head, which
//! encodes the start-up pre-roll without a separate phase variable.

use crate::error::{Error, Result};
use crate::format::{self, SampleFormat};

/// Accumulator storage, one size class wider than the transport sample so
/// that summing up to the client limit cannot overflow.
enum Accumulator {
    U8(Vec<i16>),
    S16(Vec<i32>),
    S24(Vec<i32>),
    S32(Vec<i64>),
}

impl Accumulator {
    fn alloc(format: SampleFormat, len: usize) -> Result<Self> {
        fn zeroed<T: Copy + Default>(len: usize) -> Result<Vec<T>> {
            let mut data = Vec::new();
            data.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
            data.resize(len, T::default());
            Ok(data)
        }
        match format {
            SampleFormat::U8 => Ok(Accumulator::U8(zeroed(len)?)),
            SampleFormat::S16Le => Ok(Accumulator::S16(zeroed(len)?)),
            SampleFormat::S24Le => Ok(Accumulator::S24(zeroed(len)?)),
            SampleFormat::S32Le => Ok(Accumulator::S32(zeroed(len)?)),
            SampleFormat::S24Le3 => Err(Error::InvalidFormat(format)),
        }
    }

    fn zero(&mut self) {
        match self {
            Accumulator::U8(data) => data.fill(0),
            Accumulator::S16(data) | Accumulator::S24(data) => data.fill(0),
            Accumulator::S32(data) => data.fill(0),
        }
    }
}

pub struct MixBuffer {
    format: SampleFormat,
    channels: usize,
    frame_bytes: usize,
    sample_bytes: usize,
    /// Capacity in samples, including one slack frame.
    size: usize,
    /// Samples per period.
    period: usize,
    /// Periods that must accumulate before the transport starts reading;
    /// the write limit grants clients one period beyond it.
    threshold: usize,
    /// Next sample to be read from the mix.
    mix_offset: usize,
    /// One past the furthest sample written by any client.
    end: usize,
    data: Accumulator,
}

impl MixBuffer {
    pub fn new(
        format: SampleFormat,
        channels: usize,
        buffer_frames: usize,
        period_frames: usize,
        mix_threshold: usize,
    ) -> Result<Self> {
        if !format.mixable() {
            return Err(Error::InvalidFormat(format));
        }
        if channels == 0 || channels > 8 {
            return Err(Error::InvalidChannels(channels));
        }
        // One extra empty frame so that a full buffer is distinguishable
        // from an empty one.
        let size = (buffer_frames + 1) * channels;
        Ok(Self {
            format,
            channels,
            frame_bytes: format.frame_bytes(channels),
            sample_bytes: format.sample_bytes(),
            size,
            period: period_frames * channels,
            threshold: mix_threshold,
            mix_offset: 0,
            end: 0,
            data: Accumulator::alloc(format, size)?,
        })
    }

    fn avail_between(&self, start: usize, end: usize) -> usize {
        if end >= start {
            end - start
        } else {
            self.size + end - start
        }
    }

    /// Samples readable from the mix head.
    pub fn avail(&self) -> usize {
        self.avail_between(self.mix_offset, self.end)
    }

    pub fn empty(&self) -> bool {
        self.mix_offset == self.end
    }

    /// Samples queued between the mix head and `cursor`. A negative cursor
    /// is already ahead of the mix by |cursor| samples and reports that gap.
    pub fn delay(&self, cursor: isize) -> usize {
        if cursor < 0 {
            cursor.unsigned_abs()
        } else {
            self.avail_between(self.mix_offset, cursor as usize)
        }
    }

    /// Samples contributed at `cursor` that the mix has not yet consumed. A
    /// negative cursor has contributed nothing still pending.
    pub fn pending(&self, cursor: isize) -> usize {
        if cursor < 0 {
            0
        } else {
            self.avail_between(self.mix_offset, cursor as usize)
        }
    }

    /// Whether enough periods have accumulated to wake the transport.
    pub fn at_threshold(&self) -> bool {
        self.avail() >= self.threshold * self.period / self.channels
    }

    /// Adds a client byte stream into the mix at the client's cursor.
    ///
    /// Only whole frames enter the mix, and no client may advance more than
    /// one period past the slowest reader: writes stop at
    /// `mix_offset + (threshold + 1) * period`. Returns the number of bytes
    /// consumed and advances `cursor` accordingly.
    pub fn add(&mut self, cursor: &mut isize, data: &[u8]) -> usize {
        let mix_offset = self.mix_offset;
        let avail = self.avail_between(mix_offset, self.end);

        let mut start = if *cursor < 0 {
            mix_offset + cursor.unsigned_abs()
        } else {
            *cursor as usize
        };

        let frames = data.len() / self.frame_bytes;
        let mut samples = frames * self.channels;

        // Unwrapped arithmetic for the limit comparison.
        if start < mix_offset {
            start += self.size;
        }
        let limit = mix_offset + (self.threshold + 1) * self.period;
        if start >= limit {
            return 0;
        }
        if start + samples > limit {
            samples = limit - start;
        }

        for n in 0..samples {
            let idx = (start + n) % self.size;
            match &mut self.data {
                Accumulator::U8(acc) => {
                    acc[idx] += data[n] as i16 - 0x80;
                }
                Accumulator::S16(acc) => {
                    let o = n * 2;
                    acc[idx] += i32::from(i16::from_le_bytes([data[o], data[o + 1]]));
                }
                Accumulator::S24(acc) => {
                    let o = n * 4;
                    let raw = u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
                    acc[idx] += format::s24_widen(raw);
                }
                Accumulator::S32(acc) => {
                    let o = n * 4;
                    acc[idx] += i64::from(i32::from_le_bytes([
                        data[o],
                        data[o + 1],
                        data[o + 2],
                        data[o + 3],
                    ]));
                }
            }
        }

        let new_cursor = (start + samples) % self.size;

        // The end pointer moves only when this write increased availability.
        if self.avail_between(mix_offset, new_cursor) > avail {
            self.end = new_cursor;
        }
        *cursor = new_cursor as isize;

        samples * self.sample_bytes
    }

    /// Reads mixed frames from the mix head, applying per-channel scaling
    /// and saturating to the sample format's signed range.
    ///
    /// At most one period is delivered per call, and consumed accumulator
    /// cells are zeroed behind the read. Returns whole frames, as samples.
    pub fn read(&mut self, out: &mut [u8], samples: usize, scale: &[f64]) -> usize {
        debug_assert_eq!(scale.len(), self.channels);

        let start = self.mix_offset;
        let mut samples = samples.min(out.len() / self.sample_bytes);
        samples -= samples % self.channels;
        if samples > self.period {
            samples = self.period;
        }
        let avail = self.avail_between(start, self.end);
        if samples > avail {
            samples = avail - avail % self.channels;
        }

        let mut out_sample = 0;
        let mut n = 0;
        while n < samples {
            let base = (start + n) % self.size;
            match &mut self.data {
                Accumulator::U8(acc) => {
                    for ch in 0..self.channels {
                        let cell = &mut acc[base + ch];
                        if scale[ch] == 0.0 {
                            *cell = 0;
                        } else {
                            *cell = ((f64::from(*cell) * scale[ch]) as i16)
                                .clamp(i16::from(i8::MIN), i16::from(i8::MAX));
                        }
                        out[out_sample] = (0x80 + *cell) as u8;
                        out_sample += 1;
                        *cell = 0;
                    }
                }
                Accumulator::S16(acc) => {
                    for ch in 0..self.channels {
                        let cell = &mut acc[base + ch];
                        if scale[ch] == 0.0 {
                            *cell = 0;
                        } else {
                            // Identity volume skips the multiply so that a
                            // single unsaturated stream passes bit-exactly.
                            if scale[ch] < 0.99 {
                                *cell = (f64::from(*cell) * scale[ch]) as i32;
                            }
                            *cell = (*cell).clamp(i32::from(i16::MIN), i32::from(i16::MAX));
                        }
                        let o = out_sample * 2;
                        out[o..o + 2].copy_from_slice(&(*cell as i16).to_le_bytes());
                        out_sample += 1;
                        *cell = 0;
                    }
                }
                Accumulator::S24(acc) => {
                    for ch in 0..self.channels {
                        let cell = &mut acc[base + ch];
                        if scale[ch] == 0.0 {
                            *cell = 0;
                        } else {
                            *cell = ((f64::from(*cell) * scale[ch]) as i32)
                                .clamp(format::S24_MIN, format::S24_MAX);
                        }
                        let o = out_sample * 4;
                        out[o..o + 4].copy_from_slice(&format::s24_pack(*cell).to_le_bytes());
                        out_sample += 1;
                        *cell = 0;
                    }
                }
                Accumulator::S32(acc) => {
                    for ch in 0..self.channels {
                        let cell = &mut acc[base + ch];
                        if scale[ch] == 0.0 {
                            *cell = 0;
                        } else {
                            *cell = ((*cell as f64) * scale[ch]) as i64;
                            *cell = (*cell).clamp(i64::from(i32::MIN), i64::from(i32::MAX));
                        }
                        let o = out_sample * 4;
                        out[o..o + 4].copy_from_slice(&(*cell as i32).to_le_bytes());
                        out_sample += 1;
                        *cell = 0;
                    }
                }
            }
            n += self.channels;
        }

        self.mix_offset = (start + n) % self.size;

        samples
    }

    /// Resets both cursors and zeroes the whole accumulator store.
    pub fn clear(&mut self) {
        self.mix_offset = 0;
        self.end = 0;
        self.data.zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_stereo(buffer_frames: usize, period_frames: usize) -> MixBuffer {
        MixBuffer::new(SampleFormat::S16Le, 2, buffer_frames, period_frames, 2).unwrap()
    }

    fn s16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn read_s16(mix: &mut MixBuffer, samples: usize, scale: &[f64]) -> Vec<i16> {
        let mut out = vec![0u8; samples * 2];
        let got = mix.read(&mut out, samples, scale);
        out[..got * 2]
            .chunks(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn rejects_unmixable_format_and_bad_channels() {
        assert!(matches!(
            MixBuffer::new(SampleFormat::S24Le3, 2, 64, 4, 2),
            Err(Error::InvalidFormat(_))
        ));
        assert!(matches!(
            MixBuffer::new(SampleFormat::S16Le, 0, 64, 4, 2),
            Err(Error::InvalidChannels(0))
        ));
        assert!(matches!(
            MixBuffer::new(SampleFormat::S16Le, 9, 64, 4, 2),
            Err(Error::InvalidChannels(9))
        ));
    }

    #[test]
    fn opposite_streams_cancel() {
        let mut mix = s16_stereo(64, 4);
        let mut a = 0isize;
        let mut b = 0isize;
        mix.add(&mut a, &s16_bytes(&[1000; 8]));
        mix.add(&mut b, &s16_bytes(&[-1000; 8]));
        assert_eq!(read_s16(&mut mix, 8, &[1.0, 1.0]), vec![0i16; 8]);
        assert!(mix.empty());
    }

    #[test]
    fn additive_mix_saturates_per_channel() {
        let mut mix = s16_stereo(64, 4);
        let mut a = 0isize;
        let mut b = 0isize;
        mix.add(&mut a, &s16_bytes(&[30000, -30000]));
        mix.add(&mut b, &s16_bytes(&[30000, -30000]));
        assert_eq!(read_s16(&mut mix, 2, &[1.0, 1.0]), vec![32767, -32768]);
    }

    #[test]
    fn identity_scale_passes_bit_exact() {
        let mut mix = s16_stereo(64, 4);
        let mut cursor = 0isize;
        let frames = [1001i16, -7, 32767, -32768, 12345, -12345, 1, 0];
        mix.add(&mut cursor, &s16_bytes(&frames));
        assert_eq!(read_s16(&mut mix, 8, &[1.0, 1.0]), frames.to_vec());
    }

    #[test]
    fn scale_truncates_toward_zero_and_mutes() {
        let mut mix = s16_stereo(64, 4);
        let mut cursor = 0isize;
        mix.add(&mut cursor, &s16_bytes(&[1001, 1001]));
        assert_eq!(read_s16(&mut mix, 2, &[0.5, 0.0]), vec![500, 0]);
    }

    #[test]
    fn writes_stop_one_period_past_the_threshold() {
        let mut mix = s16_stereo(64, 4);
        let mut cursor = 0isize;
        // Limit is (threshold + 1) periods = 24 samples = 48 bytes.
        let bytes = s16_bytes(&[1; 40]);
        assert_eq!(mix.add(&mut cursor, &bytes), 48);
        assert_eq!(cursor, 24);
        assert_eq!(mix.add(&mut cursor, &bytes), 0);

        // Reading one period frees exactly one period of headroom.
        read_s16(&mut mix, 8, &[1.0, 1.0]);
        assert_eq!(mix.add(&mut cursor, &s16_bytes(&[1; 12])), 16);
    }

    #[test]
    fn consumed_cells_are_zeroed_behind_the_read() {
        let mut mix = s16_stereo(64, 4);
        let mut cursor = 0isize;
        mix.add(&mut cursor, &s16_bytes(&[1000; 8]));
        assert_eq!(read_s16(&mut mix, 8, &[1.0, 1.0]), vec![1000; 8]);
        mix.add(&mut cursor, &s16_bytes(&[2000; 8]));
        assert_eq!(read_s16(&mut mix, 8, &[1.0, 1.0]), vec![2000; 8]);
    }

    #[test]
    fn cursors_survive_ring_wrap() {
        // Size is (8 + 1) * 2 = 18 samples, so cycles of 8 wrap quickly.
        let mut mix = s16_stereo(8, 4);
        let mut cursor = 0isize;
        for round in 0i16..6 {
            let value = 100 * (round + 1);
            assert_eq!(mix.add(&mut cursor, &s16_bytes(&[value; 8])), 16);
            assert_eq!(read_s16(&mut mix, 8, &[1.0, 1.0]), vec![value; 8]);
            assert!(mix.empty());
        }
    }

    #[test]
    fn negative_cursor_prerolls_with_silence() {
        let mut mix = s16_stereo(64, 4);
        let mut cursor = -8isize;
        mix.add(&mut cursor, &s16_bytes(&[555; 8]));
        assert_eq!(cursor, 16);
        // One period of untouched accumulator reads back as silence first.
        assert_eq!(read_s16(&mut mix, 8, &[1.0, 1.0]), vec![0i16; 8]);
        assert_eq!(read_s16(&mut mix, 8, &[1.0, 1.0]), vec![555; 8]);
    }

    #[test]
    fn partial_trailing_frame_is_not_consumed() {
        let mut mix = s16_stereo(64, 4);
        let mut cursor = 0isize;
        let bytes = s16_bytes(&[7, 7, 7]); // 1.5 frames
        assert_eq!(mix.add(&mut cursor, &bytes), 4);
        assert_eq!(cursor, 2);
    }

    #[test]
    fn threshold_and_delay_accounting() {
        let mut mix = s16_stereo(64, 4);
        assert!(!mix.at_threshold());
        let mut cursor = 0isize;
        mix.add(&mut cursor, &s16_bytes(&[1; 8]));
        assert!(mix.at_threshold());
        assert_eq!(mix.pending(cursor), 8);
        assert_eq!(mix.delay(cursor), 8);
        assert_eq!(mix.pending(-6), 0);
        assert_eq!(mix.delay(-6), 6);
    }

    #[test]
    fn clear_resets_cursors_and_storage() {
        let mut mix = s16_stereo(64, 4);
        let mut cursor = 0isize;
        mix.add(&mut cursor, &s16_bytes(&[4000; 8]));
        mix.clear();
        assert!(mix.empty());
        let mut fresh = 0isize;
        mix.add(&mut fresh, &s16_bytes(&[1; 8]));
        assert_eq!(read_s16(&mut mix, 8, &[1.0, 1.0]), vec![1; 8]);
    }

    #[test]
    fn u8_streams_mix_around_the_bias_point() {
        let mut mix = MixBuffer::new(SampleFormat::U8, 1, 64, 8, 2).unwrap();
        let mut a = 0isize;
        let mut b = 0isize;
        mix.add(&mut a, &[0x8A, 0x76, 0xFF, 0xFF]);
        mix.add(&mut b, &[0x8A, 0x76, 0xFF, 0xFF]);
        let mut out = [0u8; 4];
        assert_eq!(mix.read(&mut out, 4, &[1.0]), 4);
        // 10 + 10 = 20, -10 - 10 = -20, 127 + 127 saturates at 127.
        assert_eq!(out, [0x94, 0x6C, 0xFF, 0xFF]);
    }

    #[test]
    fn s24_mix_saturates_at_24_bits() {
        let mut mix = MixBuffer::new(SampleFormat::S24Le, 1, 64, 8, 2).unwrap();
        let mut a = 0isize;
        let mut b = 0isize;
        let sample = 7_000_000u32.to_le_bytes();
        mix.add(&mut a, &sample);
        mix.add(&mut b, &sample);
        let mut out = [0u8; 4];
        assert_eq!(mix.read(&mut out, 1, &[1.0]), 1);
        assert_eq!(format::s24_widen(u32::from_le_bytes(out)), format::S24_MAX);
    }

    #[test]
    fn s32_mix_saturates_at_32_bits() {
        let mut mix = MixBuffer::new(SampleFormat::S32Le, 1, 64, 8, 2).unwrap();
        let mut a = 0isize;
        let mut b = 0isize;
        let sample = i32::MAX.to_le_bytes();
        mix.add(&mut a, &sample);
        mix.add(&mut b, &sample);
        let mut out = [0u8; 4];
        assert_eq!(mix.read(&mut out, 1, &[1.0]), 1);
        assert_eq!(i32::from_le_bytes(out), i32::MAX);
    }
}
