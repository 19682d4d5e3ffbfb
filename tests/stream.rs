// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Feeds synthetic Annex B streams through the framer and the parser.

use h265_parser::codec::h265::framer::NalFramer;
use h265_parser::codec::h265::nalu::Nalu;
use h265_parser::codec::h265::nalu::NaluType;
use h265_parser::codec::h265::nalu_writer::NaluWriter;
use h265_parser::codec::h265::nalu_writer::NaluWriterResult;
use h265_parser::codec::h265::parser::ParseError;
use h265_parser::codec::h265::parser::Parser;
use h265_parser::report::Dict;
use h265_parser::report::List;
use h265_parser::report::OutputConfig;

type W<'a> = NaluWriter<&'a mut Vec<u8>>;

/// A NAL unit with its 4-byte start code and emulation prevention bytes.
fn nalu<F>(type_: NaluType, body: F) -> Vec<u8>
where
    F: FnOnce(&mut W<'_>) -> NaluWriterResult<()>,
{
    let mut buf = vec![];
    {
        let mut w = NaluWriter::new(&mut buf, true);
        w.write_header(type_, 0, 1).unwrap();
        body(&mut w).unwrap();
        w.write_trailing_bits().unwrap();
    }
    buf
}

fn write_ptl(w: &mut W<'_>) -> NaluWriterResult<()> {
    w.write_f(2, 0u32)?;
    w.write_f(1, false)?;
    w.write_f(5, 1u32)?; // Main
    w.write_f(32, 0x6000_0000u32)?;
    w.write_f(4, 0b1001u32)?;
    w.write_f(32, 0u32)?;
    w.write_f(12, 0u32)?;
    w.write_f(8, 60u32)?; // level 2
    Ok(())
}

fn vps() -> Vec<u8> {
    nalu(NaluType::VpsNut, |w| {
        w.write_f(4, 0u32)?;
        w.write_f(2, 0b11u32)?;
        w.write_f(6, 0u32)?;
        w.write_f(3, 0u32)?;
        w.write_f(1, true)?;
        w.write_f(16, 0xffffu32)?;
        write_ptl(w)?;
        w.write_f(1, true)?;
        w.write_ue(1u32)?;
        w.write_ue(0u32)?;
        w.write_ue(0u32)?;
        w.write_f(6, 0u32)?;
        w.write_ue(0u32)?; // vps_num_layer_sets_minus1
        w.write_f(1, false)?; // vps_timing_info_present_flag
        w.write_f(1, false)?; // vps_extension_flag
        Ok(())
    })
}

/// 416x240, 16x16 CTBs.
fn sps() -> Vec<u8> {
    nalu(NaluType::SpsNut, |w| {
        w.write_f(4, 0u32)?;
        w.write_f(3, 0u32)?;
        w.write_f(1, true)?;
        write_ptl(w)?;
        w.write_ue(0u32)?; // sps_seq_parameter_set_id
        w.write_ue(1u32)?; // chroma_format_idc
        w.write_ue(416u32)?;
        w.write_ue(240u32)?;
        w.write_f(1, false)?; // conformance_window_flag
        w.write_ue(0u32)?;
        w.write_ue(0u32)?;
        w.write_ue(0u32)?; // log2_max_pic_order_cnt_lsb_minus4
        w.write_f(1, true)?;
        w.write_ue(1u32)?;
        w.write_ue(0u32)?;
        w.write_ue(0u32)?;
        w.write_ue(0u32)?; // log2_min_luma_coding_block_size_minus3
        w.write_ue(1u32)?; // log2_diff_max_min_luma_coding_block_size
        w.write_ue(0u32)?;
        w.write_ue(2u32)?;
        w.write_ue(0u32)?;
        w.write_ue(0u32)?;
        // scaling_list_enabled_flag, amp_enabled_flag,
        // sample_adaptive_offset_enabled_flag, pcm_enabled_flag
        w.write_f(4, 0u32)?;
        w.write_ue(0u32)?; // num_short_term_ref_pic_sets
        // long_term_ref_pics_present_flag, sps_temporal_mvp_enabled_flag,
        // strong_intra_smoothing_enabled_flag, vui_parameters_present_flag,
        // sps_extension_present_flag
        w.write_f(5, 0u32)?;
        Ok(())
    })
}

fn pps() -> Vec<u8> {
    nalu(NaluType::PpsNut, |w| {
        w.write_ue(0u32)?;
        w.write_ue(0u32)?;
        w.write_f(7, 0u32)?;
        w.write_ue(0u32)?;
        w.write_ue(0u32)?;
        w.write_se(0)?; // init_qp_minus26
        w.write_f(3, 0u32)?;
        w.write_se(0)?;
        w.write_se(0)?;
        w.write_f(8, 0u32)?;
        w.write_f(1, false)?; // pps_scaling_list_data_present_flag
        w.write_f(1, false)?; // lists_modification_present_flag
        w.write_ue(0u32)?;
        w.write_f(2, 0u32)?;
        Ok(())
    })
}

/// The slice data starts with `00 00 01`, which needs an emulation prevention
/// byte.
fn idr_slice() -> Vec<u8> {
    nalu(NaluType::IdrWRadl, |w| {
        w.write_f(1, true)?; // first_slice_segment_in_pic_flag
        w.write_f(1, false)?; // no_output_of_prior_pics_flag
        w.write_ue(0u32)?; // slice_pic_parameter_set_id
        w.write_ue(2u32)?; // slice_type
        w.write_se(0)?; // slice_qp_delta
        w.write_trailing_bits()?; // byte_alignment()
        w.write_f(24, 0x00_0001u32)?;
        Ok(())
    })
}

fn aud() -> Vec<u8> {
    nalu(NaluType::AudNut, |w| {
        w.write_f(3, 2u32)?; // pic_type
        Ok(())
    })
}

fn report_nalu(parser: &mut Parser, mut nalu: Nalu, out: &mut Dict) {
    let nal_length = nalu.strip_emulation_prevention();

    out.put_uint("nal_length", nal_length as u64);
    out.put_uint("start_code_bytes", nalu.start_code_len as u64);
    out.put_hex("offset", nalu.offset);

    if let Err(e) = parser.parse_nalu(nalu.payload(), out) {
        out.put_str("error", &e.to_string());
    }
}

/// Frames and parses `stream`, pushed `window` bytes at a time.
fn run(stream: &[u8], window: usize) -> (Parser, List) {
    let mut parser = Parser::new();
    let mut framer = NalFramer::new();
    let mut report = List::new();

    for chunk in stream.chunks(window) {
        framer.push(chunk);
        while let Some(nalu) = framer.next_nalu() {
            report_nalu(&mut parser, nalu, report.put_dict());
        }
    }

    if let Some(nalu) = framer.finish() {
        report_nalu(&mut parser, nalu, report.put_dict());
    }

    (parser, report)
}

#[test]
fn sequence_in_windows() {
    let stream = [vps(), sps(), pps(), idr_slice(), aud()].concat();

    for window in [1, 2, 3, 7, 64, stream.len()] {
        let (parser, report) = run(&stream, window);

        assert_eq!(report.len(), 5, "window size {window}");
        for nal in report.items() {
            let nal = nal.as_dict().unwrap();
            assert!(!nal.contains_key("error"), "window size {window}: {nal:?}");
            assert_eq!(nal.get_uint("start_code_bytes"), Some(4));
        }

        let sps = parser.sps().unwrap();
        assert_eq!(sps.ctb_size_y, 16);
        assert_eq!(sps.pic_width_in_ctbs_y, 26);
        assert_eq!(sps.pic_height_in_ctbs_y, 15);
        assert_eq!(sps.pic_size_in_ctbs_y, 390);
        assert!(parser.vps().is_some());
        assert!(parser.pps().is_some());

        let hdr = parser.slice_header().unwrap();
        assert!(hdr.type_.is_i());
        assert_eq!(hdr.header_bit_size, 24);
        assert_eq!(parser.nalu_header().unwrap().type_, NaluType::AudNut);
    }
}

/// Replaces the 4-byte start code of `nalu` with a 3-byte one.
fn short_start_code(nalu: Vec<u8>) -> Vec<u8> {
    nalu[1..].to_vec()
}

fn nal_lengths(report: &List) -> Vec<Option<u64>> {
    report
        .items()
        .iter()
        .map(|nal| nal.as_dict().and_then(|nal| nal.get_uint("nal_length")))
        .collect()
}

#[test]
fn mixed_start_codes_and_trailing_zeros() {
    let stream = [
        vps(),
        short_start_code(sps()),
        vec![0x00, 0x00], // trailing_zero_8bits
        pps(),
        vec![0x00],
        short_start_code(idr_slice()),
        aud(),
        vec![0x00, 0x00, 0x00],
    ]
    .concat();

    let clean = [vps(), sps(), pps(), idr_slice(), aud()].concat();
    let (_, clean_report) = run(&clean, 4096);
    let clean_lengths = nal_lengths(&clean_report);

    for window in [1, 2, 5, 16, stream.len()] {
        let (parser, report) = run(&stream, window);
        assert_eq!(report.len(), 5, "window size {window}");

        let types: Vec<Option<u64>> = report
            .items()
            .iter()
            .map(|nal| {
                let nal = nal.as_dict().unwrap();
                assert!(!nal.contains_key("error"), "window size {window}: {nal:?}");
                assert!(!nal.contains_key("truncated"), "window size {window}: {nal:?}");
                nal.get_dict("nal_unit_header")
                    .and_then(|h| h.get_uint("nal_unit_type"))
            })
            .collect();
        assert_eq!(
            types,
            vec![Some(32), Some(33), Some(34), Some(19), Some(35)],
            "window size {window}"
        );

        // A zero byte right before 00 00 01 is the zero_byte of a 4-byte
        // start code, the others are dropped.
        let start_codes: Vec<Option<u64>> = report
            .items()
            .iter()
            .map(|nal| nal.as_dict().and_then(|nal| nal.get_uint("start_code_bytes")))
            .collect();
        assert_eq!(
            start_codes,
            vec![Some(4), Some(3), Some(4), Some(4), Some(4)],
            "window size {window}"
        );

        let mut expected = clean_lengths.clone();
        expected[1] = expected[1].map(|len| len - 1);
        assert_eq!(nal_lengths(&report), expected, "window size {window}");

        assert_eq!(parser.sps().unwrap().pic_width_in_ctbs_y, 26);
        assert_eq!(parser.slice_header().unwrap().header_bit_size, 24);
        assert_eq!(parser.nalu_header().unwrap().type_, NaluType::AudNut);
    }
}

#[test]
fn emulation_prevention_is_removed() {
    let slice = idr_slice();
    // 26 01 af 00 00 03 01 80
    assert_eq!(slice.len(), 4 + 8);

    let stream = [vps(), sps(), pps(), slice].concat();
    let (_, report) = run(&stream, 5);

    let nal = report.get(3).and_then(|v| v.as_dict()).unwrap();
    assert_eq!(nal.get_uint("nal_length"), Some(4 + 7));
    assert_eq!(
        nal.get_uint("offset"),
        Some((vps().len() + sps().len() + pps().len()) as u64)
    );
    assert!(nal.contains_key("slice_segment_header"));
}

#[test]
fn errors_stay_local() {
    let stream = [idr_slice(), vps(), sps(), pps(), idr_slice()].concat();
    let (parser, report) = run(&stream, 4096);

    assert_eq!(report.len(), 5);

    let first = report.get(0).and_then(|v| v.as_dict()).unwrap();
    assert!(first.contains_key("error"));

    for nal in &report.items()[1..] {
        assert!(!nal.as_dict().unwrap().contains_key("error"));
    }
    assert!(parser.slice_header().is_some());

    // The same failure is returned when parsing directly.
    let mut parser = Parser::new();
    let slice = idr_slice();
    let mut out = Dict::new();
    assert!(matches!(
        parser.parse_nalu(&slice[4..], &mut out),
        Err(ParseError::MissingParameterSet { kind: "PPS", id: 0 })
    ));
}

#[test]
fn report_as_json() {
    let stream = [vps(), sps(), pps(), idr_slice()].concat();
    let (_, report) = run(&stream, 4096);

    let mut out = Vec::new();
    report.write_json(&mut out, &OutputConfig::default()).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();

    assert_eq!(json[0]["offset"], "0x0");
    assert_eq!(json[0]["nal_unit_header"]["nal_unit_type"], "VPS_NUT (32)");
    assert_eq!(
        json[0]["video_parameter_set"]["profile_tier_level"]["general_level_idc"],
        60
    );
    assert_eq!(json[1]["seq_parameter_set"]["PicWidthInCtbsY"], 26);
    assert_eq!(json[1]["seq_parameter_set"]["pic_height_in_luma_samples"], 240);
    assert_eq!(json[3]["slice_segment_header"]["slice_type"], "I (2)");

    let config = OutputConfig {
        print_hex: false,
        explain_enum: false,
    };
    let mut out = Vec::new();
    report.write_json(&mut out, &config).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();

    assert_eq!(json[0]["offset"], 0);
    assert_eq!(json[3]["nal_unit_header"]["nal_unit_type"], 19);
}
