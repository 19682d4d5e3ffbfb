// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

#![no_main]

use h265_parser::codec::h265::framer::NalFramer;
use h265_parser::codec::h265::parser::Parser;
use h265_parser::report::Dict;
use h265_parser::report::OutputConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = Parser::new();
    let mut framer = NalFramer::new();

    // Vary the window boundaries with the input itself.
    let window = usize::from(data.first().copied().unwrap_or(1)).max(1);
    let mut nalus = vec![];
    for chunk in data.chunks(window) {
        framer.push(chunk);
        nalus.extend(std::iter::from_fn(|| framer.next_nalu()));
    }
    nalus.extend(framer.finish());

    for mut nalu in nalus {
        nalu.strip_emulation_prevention();

        let mut out = Dict::new();
        let _ = parser.parse_nalu(nalu.payload(), &mut out);
        let _ = out.to_json_string(&OutputConfig::default());
    }
});
