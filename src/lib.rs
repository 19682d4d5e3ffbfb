// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A syntax parser for h.265 Annex B elementary streams.
//!
//! [`codec::h265::framer::NalFramer`] splits a byte stream into NAL units,
//! [`codec::h265::parser::Parser`] decodes their parameter sets and slice
//! segment headers, and every decoded syntax element is reported into a
//! [`report::Dict`] that can be serialized as JSON.

pub mod bitstream_utils;
pub mod codec;
pub mod report;
