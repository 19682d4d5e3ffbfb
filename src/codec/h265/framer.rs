// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Incremental extraction of NAL units from an Annex B byte stream that
//! arrives in windows of arbitrary size.

use bytes::Buf;
use bytes::BytesMut;

use crate::codec::h265::nalu::find_next_start_code;
use crate::codec::h265::nalu::find_start_code_from;
use crate::codec::h265::nalu::start_code_len;
use crate::codec::h265::nalu::Nalu;

/// Splits an Annex B stream into NAL units.
///
/// Data is fed with [`NalFramer::push`]. A NAL unit is only returned by
/// [`NalFramer::next_nalu`] once the start code of the following one has been
/// seen, so a NAL unit spanning several windows is kept until it is complete.
/// At the end of the stream, [`NalFramer::finish`] returns the last one.
#[derive(Debug, Default)]
pub struct NalFramer {
    buf: BytesMut,
    /// Stream offset of the first byte of `buf`.
    offset: u64,
    /// No start code begins before this position of `buf`.
    scanned: usize,
}

impl NalFramer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a window of the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes received but not returned as part of a NAL unit yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Stream offset of the next byte to be returned.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Drops anything before the first start code. Returns `false` if no
    /// start code is available yet.
    fn sync(&mut self) -> bool {
        if start_code_len(&self.buf).is_some() {
            return true;
        }

        match find_next_start_code(&self.buf) {
            Some(pos) => {
                self.drop_garbage(pos);
                true
            }
            None => {
                // Keep what could be the beginning of a start code.
                self.drop_garbage(self.buf.len().saturating_sub(3));
                false
            }
        }
    }

    fn drop_garbage(&mut self, len: usize) {
        if len == 0 {
            return;
        }

        // leading_zero_8bits may precede a start code.
        if self.buf[..len].iter().any(|&b| b != 0x00) {
            log::warn!(
                "Discarding {} bytes without start code at offset {:#x}",
                len,
                self.offset
            );
        }
        self.discard(len);
    }

    fn discard(&mut self, len: usize) {
        self.buf.advance(len);
        self.offset += len as u64;
        self.scanned = self.scanned.saturating_sub(len);
    }

    fn split(&mut self, len: usize) -> Nalu {
        let mut data = self.buf.split_to(len);
        let start_code_len = start_code_len(&data).unwrap_or(0);

        // trailing_zero_8bits are not part of the NAL unit, whose last byte
        // is never zero.
        let end = data[start_code_len..]
            .iter()
            .rposition(|&b| b != 0x00)
            .map_or(start_code_len, |pos| start_code_len + pos + 1);
        data.truncate(end);

        let nalu = Nalu {
            start_code_len,
            data,
            offset: self.offset,
        };
        self.offset += len as u64;
        self.scanned = 0;

        nalu
    }

    /// Returns the next complete NAL unit, or `None` if more data is needed.
    pub fn next_nalu(&mut self) -> Option<Nalu> {
        if !self.sync() {
            return None;
        }

        match find_start_code_from(&self.buf, self.scanned) {
            Some(end) => Some(self.split(end)),
            None => {
                // A start code may begin in the last two bytes.
                self.scanned = self.buf.len().saturating_sub(2);
                None
            }
        }
    }

    /// Returns the NAL unit left at the end of the stream, if any.
    pub fn finish(&mut self) -> Option<Nalu> {
        if !self.sync() {
            self.discard(self.buf.len());
            return None;
        }

        if let Some(end) = find_start_code_from(&self.buf, self.scanned) {
            return Some(self.split(end));
        }

        let len = self.buf.len();
        let nalu = self.split(len);
        if nalu.payload().is_empty() {
            return None;
        }

        Some(nalu)
    }
}
