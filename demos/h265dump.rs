// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! h265dump, a program printing the syntax elements of an h.265 Annex B stream as JSON. The
//! stream is read in windows and the report of each NAL unit is written as soon as it is
//! parsed, so memory use does not grow with the stream size.

use std::fs::File;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;

use h265_parser::codec::h265::framer::NalFramer;
use h265_parser::codec::h265::nalu::Nalu;
use h265_parser::codec::h265::parser::Parser;
use h265_parser::report::Dict;
use h265_parser::report::JsonListWriter;
use h265_parser::report::OutputConfig;

/// Dumps the syntax elements of an h.265 Annex B stream as JSON
#[derive(Debug, FromArgs)]
struct Args {
    /// input file
    #[argh(positional)]
    input: PathBuf,

    /// output file to write the JSON report to. Default: standard output
    #[argh(option)]
    output: Option<PathBuf>,

    /// print hex values as decimal numbers
    #[argh(switch)]
    no_hex: bool,

    /// print enumerated values without their names
    #[argh(switch)]
    no_enum_names: bool,

    /// number of bytes read from the input at a time. Default: 65536
    #[argh(option, default = "65536")]
    window_size: usize,
}

fn report_nalu<W: Write>(
    parser: &mut Parser,
    mut nalu: Nalu,
    writer: &mut JsonListWriter<W>,
) -> anyhow::Result<()> {
    let mut out = Dict::new();
    let nal_length = nalu.strip_emulation_prevention();

    out.put_uint("nal_length", nal_length as u64);
    out.put_uint("start_code_bytes", nalu.start_code_len as u64);
    out.put_hex("offset", nalu.offset);

    if let Err(e) = parser.parse_nalu(nalu.payload(), &mut out) {
        log::warn!("NAL unit at offset {:#x}: {}", nalu.offset, e);
        out.put_str("error", &e.to_string());
    }

    writer.write_dict(&out)?;
    Ok(())
}

fn dump<R: Read, W: Write>(
    mut input: R,
    output: W,
    config: OutputConfig,
    window_size: usize,
) -> anyhow::Result<()> {
    let mut parser = Parser::new();
    let mut framer = NalFramer::new();
    let mut writer = JsonListWriter::new(output, config)?;
    let mut window = vec![0u8; window_size];

    loop {
        let len = input.read(&mut window)?;
        if len == 0 {
            break;
        }

        framer.push(&window[..len]);
        while let Some(nalu) = framer.next_nalu() {
            report_nalu(&mut parser, nalu, &mut writer)?;
        }
    }

    if let Some(nalu) = framer.finish() {
        report_nalu(&mut parser, nalu, &mut writer)?;
    }

    log::debug!("Parsed {} NAL units", writer.len());
    writer.finish()?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    if args.window_size == 0 {
        anyhow::bail!("window-size must be greater than 0");
    }

    let input = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;

    let config = OutputConfig {
        print_hex: !args.no_hex,
        explain_enum: !args.no_enum_names,
    };

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            dump(input, BufWriter::new(file), config, args.window_size)
        }
        None => dump(input, std::io::stdout().lock(), config, args.window_size),
    }
}
