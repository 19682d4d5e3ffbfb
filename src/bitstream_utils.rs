// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit level access to codec bitstreams.

use std::io::Write;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitCursorError {
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("exp-golomb code with {0} leading zero bits does not fit in 32 bits")]
    ExpGolombTooLong(usize),
    #[error("stream ended before the end of an exp-golomb prefix")]
    ExpGolombTruncated,
    #[error("value {value} out of range [{min}, {max}]")]
    OutOfRange { value: i64, min: i64, max: i64 },
}

pub type BitCursorResult<T> = std::result::Result<T, BitCursorError>;

/// A sequential, seekable view of a byte buffer as a stream of bits, most
/// significant bit first.
///
/// Reads past the end of the buffer never fail: the missing bits read as
/// zero, the position stays clamped at the end of the buffer and
/// [`BitCursor::overrun`] starts returning `true`. Callers that need to tell
/// a truncated stream from genuine zero fields check [`BitCursor::remaining`]
/// or [`BitCursor::overrun`].
///
/// Emulation prevention bytes must have been removed beforehand, see
/// [`crate::codec::h265::nalu::strip_emulation_prevention`].
#[derive(Clone, Debug)]
pub struct BitCursor<'a> {
    data: &'a [u8],
    /// Current position, in bits. Never greater than `data.len() * 8`.
    position: usize,
    /// Whether a read asked for bits past the end of `data`.
    overrun: bool,
}

impl<'a> BitCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            overrun: false,
        }
    }

    /// Size of the underlying buffer, in bits.
    pub fn size(&self) -> usize {
        self.data.len() * 8
    }

    /// Current bit position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of bits left before the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.size() - self.position
    }

    pub fn at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Whether any read went past the end of the buffer and got zero-filled
    /// bits.
    pub fn overrun(&self) -> bool {
        self.overrun
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.position % 8 == 0
    }

    /// Moves to the absolute bit position `pos`, clamped to the buffer size.
    pub fn seek(&mut self, pos: usize) {
        self.position = std::cmp::min(pos, self.size());
    }

    /// Skips `num_bits` bits. Skipping past the end clamps like a read does.
    pub fn skip_bits(&mut self, num_bits: usize) {
        self.advance(num_bits);
    }

    fn advance(&mut self, num_bits: usize) {
        let target = self.position.saturating_add(num_bits);
        if target > self.size() {
            self.overrun = true;
        }
        self.position = std::cmp::min(target, self.size());
    }

    /// Reads up to 32 bits without any range check on `num_bits`.
    fn read_raw(&mut self, num_bits: usize) -> u32 {
        if num_bits == 0 {
            return 0;
        }

        let first_byte = self.position / 8;
        let shift = self.position % 8;

        // Five bytes always cover 32 bits starting at any bit offset.
        let window = (0..5).fold(0u64, |acc, i| {
            let byte = self.data.get(first_byte + i).copied().unwrap_or(0);
            (acc << 8) | u64::from(byte)
        });

        let value = (window >> (40 - shift - num_bits)) & ((1u64 << num_bits) - 1);
        self.advance(num_bits);

        value as u32
    }

    /// Reads the next `num_bits` bits (up to 32) as an unsigned value, most
    /// significant bit first. Corresponds to `u(n)` and `f(n)`.
    pub fn read<U: TryFrom<u32>>(&mut self, num_bits: usize) -> BitCursorResult<U> {
        if num_bits > 32 {
            return Err(BitCursorError::TooManyBitsRequested(num_bits));
        }

        U::try_from(self.read_raw(num_bits)).map_err(|_| BitCursorError::ConversionFailed)
    }

    /// Reads a single bit.
    pub fn read_bit(&mut self) -> bool {
        self.read_raw(1) == 1
    }

    /// Same as [`BitCursor::read`], without consuming anything.
    pub fn peek<U: TryFrom<u32>>(&self, num_bits: usize) -> BitCursorResult<U> {
        self.clone().read(num_bits)
    }

    /// Reads an unsigned Exp-Golomb coded value. Corresponds to `ue(v)`.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> BitCursorResult<U> {
        let mut leading_zeros = 0;

        loop {
            let window = std::cmp::min(8, self.remaining());
            if window == 0 {
                return Err(BitCursorError::ExpGolombTruncated);
            }

            let bits = self.clone().read_raw(window);
            if bits != 0 {
                let zeros = bits.leading_zeros() as usize - (32 - window);
                leading_zeros += zeros;
                // Consume the zeros and the terminating one bit.
                self.advance(zeros + 1);
                break;
            }

            leading_zeros += window;
            self.advance(window);

            if leading_zeros >= 32 {
                return Err(BitCursorError::ExpGolombTooLong(leading_zeros));
            }
        }

        if leading_zeros >= 32 {
            return Err(BitCursorError::ExpGolombTooLong(leading_zeros));
        }

        let suffix = u64::from(self.read_raw(leading_zeros));
        let value = (1u64 << leading_zeros) - 1 + suffix;

        let value = u32::try_from(value).map_err(|_| BitCursorError::ConversionFailed)?;
        U::try_from(value).map_err(|_| BitCursorError::ConversionFailed)
    }

    /// Reads an unsigned Exp-Golomb value and checks that it is within
    /// `[min, max]`.
    pub fn read_ue_bounded<U: TryFrom<u32>>(&mut self, min: u32, max: u32) -> BitCursorResult<U> {
        let value: u32 = self.read_ue()?;
        if value < min || value > max {
            return Err(BitCursorError::OutOfRange {
                value: value.into(),
                min: min.into(),
                max: max.into(),
            });
        }

        U::try_from(value).map_err(|_| BitCursorError::ConversionFailed)
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> BitCursorResult<U> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed Exp-Golomb coded value. Corresponds to `se(v)`.
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> BitCursorResult<U> {
        let code_num = i64::from(self.read_ue::<u32>()?);

        let value = if code_num % 2 == 0 {
            -(code_num / 2)
        } else {
            (code_num + 1) / 2
        };

        let value = i32::try_from(value).map_err(|_| BitCursorError::ConversionFailed)?;
        U::try_from(value).map_err(|_| BitCursorError::ConversionFailed)
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(&mut self, min: i32, max: i32) -> BitCursorResult<U> {
        let value: i32 = self.read_se()?;
        if value < min || value > max {
            return Err(BitCursorError::OutOfRange {
                value: value.into(),
                min: min.into(),
                max: max.into(),
            });
        }

        U::try_from(value).map_err(|_| BitCursorError::ConversionFailed)
    }
}

#[derive(Error, Debug)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// Packs bits MSB first into bytes written to `W`. The last partial byte is
/// padded with zeros on [`BitWriter::flush`].
pub struct BitWriter<W: Write> {
    out: W,
    /// Number of bits already used in `curr_byte`.
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes the `bits` low bits of `value` (up to 32), MSB first.
    /// Corresponds to `f(n)` and `u(n)`.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let value = value.into();
        for shift in (0..bits).rev() {
            self.write_bit((value >> shift) & 1 == 1)?;
        }

        Ok(bits)
    }

    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= u8::from(bit) << (7 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Outputs the pending partial byte, zero padded.
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Whether some bits are waiting for their byte to be completed.
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::nalu_writer::NaluWriter;

    #[test]
    fn read_msb_first() {
        let data = [0b1010_0101, 0xff, 0x00, 0x81];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(cursor.read::<u8>(1).unwrap(), 1);
        assert_eq!(cursor.read::<u8>(3).unwrap(), 0b010);
        assert_eq!(cursor.read::<u8>(8).unwrap(), 0b0101_1111);
        assert_eq!(cursor.read::<u32>(20).unwrap(), 0xf0081);
        assert!(cursor.at_end());
        assert!(!cursor.overrun());
    }

    #[test]
    fn read_zero_bits() {
        let data = [0xff];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(cursor.read::<u32>(0).unwrap(), 0);
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn read_full_32_bits_unaligned() {
        let data = [0x0f, 0xff, 0xff, 0xff, 0xf0];
        let mut cursor = BitCursor::new(&data);

        cursor.skip_bits(4);
        assert_eq!(cursor.read::<u32>(32).unwrap(), 0xffff_ffff);
        assert_eq!(cursor.remaining(), 4);
    }

    #[test]
    fn too_many_bits() {
        let data = [0u8; 8];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(
            cursor.read::<u64>(33),
            Err(BitCursorError::TooManyBitsRequested(33))
        );
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn conversion_failure() {
        let data = [0xff, 0xff];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(cursor.read::<u8>(9), Err(BitCursorError::ConversionFailed));
    }

    #[test]
    fn read_past_end_is_zero_filled() {
        let data = [0xff];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(cursor.read::<u32>(12).unwrap(), 0xff0);
        assert_eq!(cursor.position(), 8);
        assert!(cursor.at_end());
        assert!(cursor.overrun());

        assert_eq!(cursor.read::<u32>(32).unwrap(), 0);
        assert_eq!(cursor.position(), 8);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn peek_has_no_side_effects() {
        let data = [0xde, 0xad, 0xbe, 0xef];
        let mut cursor = BitCursor::new(&data);

        cursor.skip_bits(3);
        assert_eq!(cursor.peek::<u32>(16).unwrap(), 0xf56d);
        assert_eq!(cursor.position(), 3);
        assert_eq!(cursor.peek::<u32>(32).unwrap(), 0xf56d_f778);
        assert!(!cursor.overrun());
        assert_eq!(cursor.read::<u32>(16).unwrap(), 0xf56d);
    }

    #[test]
    fn seek_and_read_again() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x13, 0x57];

        for start in [0, 3, 7, 13] {
            for n in 1..=32 {
                let mut cursor = BitCursor::new(&data);
                cursor.seek(start);

                let before = cursor.position();
                let first: u32 = cursor.read(n).unwrap();
                cursor.seek(before);
                let second: u32 = cursor.read(n).unwrap();

                assert_eq!(first, second, "start {start}, {n} bits");
                assert_eq!(cursor.position(), before + n);
            }
        }
    }

    #[test]
    fn seek_is_clamped() {
        let data = [0x00, 0x01];
        let mut cursor = BitCursor::new(&data);

        cursor.seek(100);
        assert_eq!(cursor.position(), 16);
        assert!(cursor.at_end());
    }

    #[test]
    fn exp_golomb_known_codes() {
        // 1, 010, 011, 00100, 00101
        let data = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(cursor.read_ue::<u32>().unwrap(), 0);
        assert_eq!(cursor.read_ue::<u32>().unwrap(), 1);
        assert_eq!(cursor.read_ue::<u32>().unwrap(), 2);
        assert_eq!(cursor.read_ue::<u32>().unwrap(), 3);
        assert_eq!(cursor.read_ue::<u32>().unwrap(), 4);
        assert_eq!(cursor.position(), 17);

        let mut cursor = BitCursor::new(&data);
        assert_eq!(cursor.read_se::<i32>().unwrap(), 0);
        assert_eq!(cursor.read_se::<i32>().unwrap(), 1);
        assert_eq!(cursor.read_se::<i32>().unwrap(), -1);
        assert_eq!(cursor.read_se::<i32>().unwrap(), 2);
        assert_eq!(cursor.read_se::<i32>().unwrap(), -2);
    }

    #[test]
    fn exp_golomb_round_trip() {
        let unsigned = [0u32, 1, 2, 7, 8, 255, 256, 65_535, 1 << 20, 0xfffe_fffe];
        let signed = [0i32, 1, -1, 2, -2, 127, -128, 40_000, -40_000, i32::MAX];

        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, false);
            for value in unsigned {
                writer.write_ue(value).unwrap();
            }
            for value in signed {
                writer.write_se(value).unwrap();
            }
            writer.write_f(1, true).unwrap();
        }

        let mut cursor = BitCursor::new(&buf);
        for value in unsigned {
            assert_eq!(cursor.read_ue::<u32>().unwrap(), value);
        }
        for value in signed {
            assert_eq!(cursor.read_se::<i32>().unwrap(), value);
        }
        assert!(cursor.read_bit());
        assert!(!cursor.overrun());
    }

    #[test]
    fn exp_golomb_truncated_prefix_terminates() {
        let data = [0x00, 0x00];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(
            cursor.read_ue::<u32>(),
            Err(BitCursorError::ExpGolombTruncated)
        );
        assert!(cursor.at_end());
    }

    #[test]
    fn exp_golomb_too_long() {
        let data = [0x00, 0x00, 0x00, 0x00, 0x80];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(
            cursor.read_ue::<u32>(),
            Err(BitCursorError::ExpGolombTooLong(32))
        );
    }

    #[test]
    fn exp_golomb_suffix_past_end() {
        // 0000 0001 followed by nothing: the suffix is zero-filled.
        let data = [0x01];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(cursor.read_ue::<u32>().unwrap(), 127);
        assert!(cursor.overrun());
    }

    #[test]
    fn exp_golomb_bounds() {
        // ue(v) == 4
        let data = [0b0010_1000];
        let mut cursor = BitCursor::new(&data);

        assert_eq!(
            cursor.read_ue_max::<u32>(3),
            Err(BitCursorError::OutOfRange {
                value: 4,
                min: 0,
                max: 3
            })
        );

        let mut cursor = BitCursor::new(&data);
        assert_eq!(cursor.read_se_bounded::<i32>(-2, 2).unwrap(), -2);
    }

    #[test]
    fn writer_pads_last_byte() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(3, 0b101u32).unwrap();
            assert!(writer.has_data_pending());
            writer.write_f(8, 0xffu32).unwrap();
            assert!(matches!(
                writer.write_f(33, 0u32),
                Err(BitWriterError::InvalidBitCount)
            ));
        }

        assert_eq!(buf, vec![0b1011_1111, 0b1110_0000]);
    }
}
