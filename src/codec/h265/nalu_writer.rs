// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writer producing h.265 NAL units, used to build synthetic bitstreams.

use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;
use crate::codec::h265::nalu::NaluType;

/// Internal wrapper over [`std::io::Write`] inserting emulation prevention
/// bytes when enabled.
struct EmulationPrevention<W: Write> {
    out: W,
    /// Number of consecutive zero bytes written last.
    zeros: usize,
    ep_enabled: bool,
}

impl<W: Write> EmulationPrevention<W> {
    fn new(writer: W, ep_enabled: bool) -> Self {
        Self {
            out: writer,
            zeros: 0,
            ep_enabled,
        }
    }

    fn write_byte(&mut self, byte: u8) -> std::io::Result<()> {
        if self.ep_enabled && self.zeros >= 2 && byte <= 0x03 {
            self.out.write_all(&[0x03])?;
            self.zeros = 0;
        }

        self.out.write_all(&[byte])?;
        self.zeros = if byte == 0x00 { self.zeros + 1 } else { 0 };

        Ok(())
    }

    /// Writes a start code followed by the 7.3.1.2 NAL unit header. Neither
    /// is subject to emulation prevention.
    fn write_header(
        &mut self,
        type_: NaluType,
        nuh_layer_id: u8,
        nuh_temporal_id_plus1: u8,
    ) -> std::io::Result<()> {
        let type_ = type_ as u8;
        self.out.write_all(&[
            0x00,
            0x00,
            0x00,
            0x01,
            (type_ & 0x3f) << 1 | (nuh_layer_id >> 5) & 0x01,
            (nuh_layer_id & 0x1f) << 3 | (nuh_temporal_id_plus1 & 0x07),
        ])?;
        self.zeros = 0;

        Ok(())
    }
}

impl<W: Write> Write for EmulationPrevention<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for byte in buf {
            self.write_byte(*byte)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error("value increment caused value overflow")]
    Overflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// A writer for h.265 bitstreams, capable of outputting emulation prevention
/// bytes.
pub struct NaluWriter<W: Write>(BitWriter<EmulationPrevention<W>>);

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W, ep_enabled: bool) -> Self {
        Self(BitWriter::new(EmulationPrevention::new(writer, ep_enabled)))
    }

    /// Writes fixed bit size integer (up to 32 bit). Corresponds to `f(n)`
    /// and `u(n)`.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        Ok(self.0.write_f(bits, value)?)
    }

    /// Writes a number in exponential golomb format.
    pub fn write_exp_golomb(&mut self, value: u32) -> NaluWriterResult<()> {
        let value = value.checked_add(1).ok_or(NaluWriterError::Overflow)?;
        let bits = 32 - value.leading_zeros() as usize;
        let zeros = bits - 1;

        self.write_f(zeros, 0u32)?;
        self.write_f(bits, value)?;

        Ok(())
    }

    /// Corresponds to `ue(v)`.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        self.write_exp_golomb(value.into())
    }

    /// Corresponds to `se(v)`.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value: i32 = value.into();
        let abs_value: u32 = value.unsigned_abs();

        if value <= 0 {
            self.write_ue(abs_value.checked_mul(2).ok_or(NaluWriterError::Overflow)?)
        } else {
            self.write_ue(2 * abs_value - 1)
        }
    }

    /// Writes a start code and a NAL unit header. Pending bits are flushed
    /// first.
    pub fn write_header(
        &mut self,
        type_: NaluType,
        nuh_layer_id: u8,
        nuh_temporal_id_plus1: u8,
    ) -> NaluWriterResult<()> {
        self.0.flush()?;
        self.0
            .inner_mut()
            .write_header(type_, nuh_layer_id, nuh_temporal_id_plus1)?;
        Ok(())
    }

    /// Writes rbsp_trailing_bits(): a one bit, then zeros up to the byte
    /// boundary.
    pub fn write_trailing_bits(&mut self) -> NaluWriterResult<()> {
        self.write_f(1, true)?;
        self.0.flush()?;
        Ok(())
    }

    /// Returns `true` if next bits will be aligned to 8
    pub fn aligned(&self) -> bool {
        !self.0.has_data_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::BitCursor;

    #[test]
    fn header_and_trailing_bits() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, true);
            writer.write_header(NaluType::SpsNut, 0, 1).unwrap();
            writer.write_f(3, 0b101u32).unwrap();
            assert!(!writer.aligned());
            writer.write_trailing_bits().unwrap();
            assert!(writer.aligned());
        }

        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x01, 0x42, 0x01, 0b1011_0000]);
    }

    #[test]
    fn emulation_prevention() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, true);
            writer.write_header(NaluType::PpsNut, 0, 1).unwrap();
            writer.write_f(32, 0x0000_0100u32).unwrap();
            writer.write_f(24, 0x00_0003u32).unwrap();
        }

        assert_eq!(
            &buf[6..],
            &[0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x00, 0x03, 0x03]
        );
    }

    #[test]
    fn exp_golomb() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, false);
            writer.write_ue(0u32).unwrap();
            writer.write_ue(3u32).unwrap();
            writer.write_se(-2).unwrap();
            writer.write_se(2).unwrap();
            assert!(matches!(
                writer.write_ue(u32::MAX),
                Err(NaluWriterError::Overflow)
            ));
        }

        let mut r = BitCursor::new(&buf);
        assert_eq!(r.read_ue::<u32>().unwrap(), 0);
        assert_eq!(r.read_ue::<u32>().unwrap(), 3);
        assert_eq!(r.read_se::<i32>().unwrap(), -2);
        assert_eq!(r.read_se::<i32>().unwrap(), 2);
    }
}
