// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Annex B framing of h.265 NAL units.

use bytes::BytesMut;
use enumn::N;

use crate::bitstream_utils::BitCursor;
use crate::codec::h265::parser::ParseError;
use crate::report::Dict;

/// Table 7-1 – NAL unit type codes and NAL unit type classes
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
    Unspec48 = 48,
    Unspec49 = 49,
    Unspec50 = 50,
    Unspec51 = 51,
    Unspec52 = 52,
    Unspec53 = 53,
    Unspec54 = 54,
    Unspec55 = 55,
    Unspec56 = 56,
    Unspec57 = 57,
    Unspec58 = 58,
    Unspec59 = 59,
    Unspec60 = 60,
    Unspec61 = 61,
    Unspec62 = 62,
    Unspec63 = 63,
}

impl NaluType {
    /// Whether this is an IDR NALU.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Whether this is an IRAP NALU.
    pub fn is_irap(&self) -> bool {
        let type_ = *self as u32;
        type_ >= Self::BlaWLp as u32 && type_ <= Self::RsvIrapVcl23 as u32
    }

    /// Whether this is a BLA NALU.
    pub fn is_bla(&self) -> bool {
        matches!(self, Self::BlaWLp | Self::BlaWRadl | Self::BlaNLp)
    }

    /// Whether this is a CRA NALU.
    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    /// Whether this is a RADL NALU.
    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlN | Self::RadlR)
    }

    /// Whether this is a RASL NALU.
    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslN | Self::RaslR)
    }

    /// Whether this NALU carries a slice segment we know how to parse, i.e.
    /// any non-reserved VCL type.
    pub fn is_slice(&self) -> bool {
        let type_ = *self as u32;
        type_ <= Self::RaslR as u32
            || (type_ >= Self::BlaWLp as u32 && type_ <= Self::CraNut as u32)
    }

    /// Whether this is a VCL NALU, reserved types included.
    pub fn is_vcl(&self) -> bool {
        (*self as u32) < Self::VpsNut as u32
    }

    /// Name of the type as given in Table 7-1.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TrailN => "TRAIL_N",
            Self::TrailR => "TRAIL_R",
            Self::TsaN => "TSA_N",
            Self::TsaR => "TSA_R",
            Self::StsaN => "STSA_N",
            Self::StsaR => "STSA_R",
            Self::RadlN => "RADL_N",
            Self::RadlR => "RADL_R",
            Self::RaslN => "RASL_N",
            Self::RaslR => "RASL_R",
            Self::RsvVclN10 => "RSV_VCL_N10",
            Self::RsvVclR11 => "RSV_VCL_R11",
            Self::RsvVclN12 => "RSV_VCL_N12",
            Self::RsvVclR13 => "RSV_VCL_R13",
            Self::RsvVclN14 => "RSV_VCL_N14",
            Self::RsvVclR15 => "RSV_VCL_R15",
            Self::BlaWLp => "BLA_W_LP",
            Self::BlaWRadl => "BLA_W_RADL",
            Self::BlaNLp => "BLA_N_LP",
            Self::IdrWRadl => "IDR_W_RADL",
            Self::IdrNLp => "IDR_N_LP",
            Self::CraNut => "CRA_NUT",
            Self::RsvIrapVcl22 => "RSV_IRAP_VCL22",
            Self::RsvIrapVcl23 => "RSV_IRAP_VCL23",
            Self::RsvVcl24
            | Self::RsvVcl25
            | Self::RsvVcl26
            | Self::RsvVcl27
            | Self::RsvVcl28
            | Self::RsvVcl29
            | Self::RsvVcl30
            | Self::RsvVcl31 => "RSV_VCL",
            Self::VpsNut => "VPS_NUT",
            Self::SpsNut => "SPS_NUT",
            Self::PpsNut => "PPS_NUT",
            Self::AudNut => "AUD_NUT",
            Self::EosNut => "EOS_NUT",
            Self::EobNut => "EOB_NUT",
            Self::FdNut => "FD_NUT",
            Self::PrefixSeiNut => "PREFIX_SEI_NUT",
            Self::SuffixSeiNut => "SUFFIX_SEI_NUT",
            Self::RsvNvcl41
            | Self::RsvNvcl42
            | Self::RsvNvcl43
            | Self::RsvNvcl44
            | Self::RsvNvcl45
            | Self::RsvNvcl46
            | Self::RsvNvcl47 => "RSV_NVCL",
            _ => "UNSPEC",
        }
    }
}

/// 7.3.1.2 NAL unit header syntax.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    /// The NALU type.
    pub type_: NaluType,
    /// Specifies the identifier of the layer to which a VCL NAL unit belongs or
    /// the identifier of a layer to which a non-VCL NAL unit applies.
    pub nuh_layer_id: u8,
    /// Minus 1 specifies a temporal identifier for the NAL unit. The value of
    /// nuh_temporal_id_plus1 shall not be equal to 0.
    pub nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    /// Size of the header, in bytes.
    pub const LEN: usize = 2;

    /// Decodes the header at the position of `r`, reporting its fields to
    /// `out`. Nothing is read unless at least 16 bits are available.
    pub fn parse(r: &mut BitCursor, out: &mut Dict) -> Result<Self, ParseError> {
        if r.remaining() < Self::LEN * 8 {
            return Err(ParseError::TruncatedHeader(r.remaining()));
        }

        let forbidden_zero_bit = r.read_bit();
        out.put_uint("forbidden_zero_bit", forbidden_zero_bit);
        if forbidden_zero_bit {
            return Err(ParseError::ForbiddenZeroBit);
        }

        let type_: u8 = r.read(6)?;
        // Every 6-bit value has a variant.
        let type_ = NaluType::n(type_).unwrap_or_default();
        out.put_enum("nal_unit_type", type_.name(), type_ as u8);

        let nuh_layer_id: u8 = r.read(6)?;
        out.put_uint("nuh_layer_id", nuh_layer_id);
        let nuh_temporal_id_plus1: u8 = r.read(3)?;
        out.put_uint("nuh_temporal_id_plus1", nuh_temporal_id_plus1);

        if nuh_temporal_id_plus1 == 0 {
            log::warn!("nuh_temporal_id_plus1 is zero");
        }

        Ok(Self {
            type_,
            nuh_layer_id,
            nuh_temporal_id_plus1,
        })
    }

    pub fn is_end(&self) -> bool {
        matches!(self.type_, NaluType::EosNut | NaluType::EobNut)
    }
}

/// A NAL unit extracted from an Annex B stream, start code included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nalu {
    /// Start code followed by the NAL unit bytes. Contains emulation
    /// prevention bytes until [`Nalu::strip_emulation_prevention`] is called.
    pub data: BytesMut,
    /// Offset of the start code in the stream.
    pub offset: u64,
    /// 3 or 4.
    pub start_code_len: usize,
}

impl Nalu {
    /// The NAL unit bytes, without start code.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.start_code_len..]
    }

    /// Removes the emulation prevention bytes from `data` and returns its new
    /// length, start code included.
    pub fn strip_emulation_prevention(&mut self) -> usize {
        let len = strip_emulation_prevention(&mut self.data[self.start_code_len..]);
        self.data.truncate(self.start_code_len + len);
        self.data.len()
    }
}

/// Returns the size of the start code at the head of `data`, if there is one.
pub fn start_code_len(data: &[u8]) -> Option<usize> {
    if data.starts_with(&[0x00, 0x00, 0x00, 0x01]) {
        Some(4)
    } else if data.starts_with(&[0x00, 0x00, 0x01]) {
        Some(3)
    } else {
        None
    }
}

/// B.2: looks for the start code ending the NAL unit at the head of `data`.
///
/// A start code at the very beginning of `data` belongs to the current NAL
/// unit and is skipped. Returns the offset where the next start code begins,
/// counting the zero_byte of a 4-byte start code, or `None` if `data` does
/// not contain another start code yet.
pub fn find_next_start_code(data: &[u8]) -> Option<usize> {
    find_start_code_from(data, 0)
}

/// Same as [`find_next_start_code`], for a caller knowing that no start code
/// begins before `from`.
pub fn find_start_code_from(data: &[u8], from: usize) -> Option<usize> {
    let skip = start_code_len(data).unwrap_or(0);
    let from = from.max(skip);

    let pos = data
        .get(from..)?
        .windows(3)
        .position(|window| window == [0x00, 0x00, 0x01])?
        + from;

    // If the preceding byte is 00, then we actually have a four byte SC,
    // i.e. 00 00 00 01 where the first 00 is the zero_byte().
    if pos > skip && data[pos - 1] == 0x00 {
        Some(pos - 1)
    } else {
        Some(pos)
    }
}

/// 7.4.2: removes every emulation_prevention_three_byte from `data` in place
/// and returns the new length.
///
/// Patterns are matched against the input bytes only, so the two zeros
/// left behind by a removal never combine with what follows into a new
/// match.
pub fn strip_emulation_prevention(data: &mut [u8]) -> usize {
    let mut zeros = 0;
    let mut len = 0;

    for i in 0..data.len() {
        let byte = data[i];

        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }

        data[len] = byte;
        len += 1;
        zeros = if byte == 0x00 { zeros + 1 } else { 0 };
    }

    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_byte_start_code() {
        let data = [0x00, 0x00, 0x01, 0x40, 0x01, 0x0c, 0x00, 0x00, 0x01, 0x42];

        assert_eq!(start_code_len(&data), Some(3));
        assert_eq!(find_next_start_code(&data), Some(6));
        assert_eq!(start_code_len(&data[6..]), Some(3));
    }

    #[test]
    fn four_byte_start_code() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0x0c, 0x00, 0x00, 0x00, 0x01, 0x42,
        ];

        assert_eq!(start_code_len(&data), Some(4));
        assert_eq!(find_next_start_code(&data), Some(7));
        assert_eq!(start_code_len(&data[7..]), Some(4));
    }

    #[test]
    fn no_next_start_code() {
        let data = [0x00, 0x00, 0x01, 0x40, 0x01, 0x0c, 0x00, 0x00];
        assert_eq!(find_next_start_code(&data), None);

        assert_eq!(find_next_start_code(&[]), None);
        assert_eq!(find_next_start_code(&[0x00, 0x00, 0x01]), None);
    }

    #[test]
    fn search_from_offset() {
        let data = [
            0x00, 0x00, 0x01, 0x40, 0x01, 0x0c, 0x00, 0x00, 0x00, 0x01, 0x42,
        ];

        assert_eq!(find_start_code_from(&data, 0), Some(6));
        assert_eq!(find_start_code_from(&data, 5), Some(6));
        // The zero_byte is counted even if the search starts after it.
        assert_eq!(find_start_code_from(&data, 7), Some(6));
        assert_eq!(find_start_code_from(&data, 8), None);
        assert_eq!(find_start_code_from(&data, 20), None);
    }

    #[test]
    fn leading_garbage() {
        let data = [0xff, 0xfe, 0x00, 0x00, 0x01, 0x40];

        assert_eq!(start_code_len(&data), None);
        assert_eq!(find_next_start_code(&data), Some(2));
    }

    #[test]
    fn strip_single_emulation_byte() {
        let mut data = [0x00, 0x00, 0x03, 0x01];

        let len = strip_emulation_prevention(&mut data);
        assert_eq!(len, 3);
        assert_eq!(&data[..len], &[0x00, 0x00, 0x01]);
    }

    #[test]
    fn strip_without_pattern_is_identity() {
        let original = [0x40, 0x01, 0x0c, 0x00, 0x01, 0x00, 0x00, 0x02, 0xff, 0x03];
        let mut data = original;

        let len = strip_emulation_prevention(&mut data);
        assert_eq!(len, original.len());
        assert_eq!(data, original);
    }

    #[test]
    fn strip_does_not_cascade() {
        // The second 03 is preceded by an emulation byte in the input, so it
        // is payload.
        let mut data = [0x00, 0x00, 0x03, 0x03, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03];

        let len = strip_emulation_prevention(&mut data);
        assert_eq!(&data[..len], &[0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn nalu_strip() {
        let mut nalu = Nalu {
            data: BytesMut::from(&[0x00, 0x00, 0x01, 0x40, 0x01, 0x00, 0x00, 0x03, 0x01][..]),
            offset: 0,
            start_code_len: 3,
        };

        assert_eq!(nalu.strip_emulation_prevention(), 8);
        assert_eq!(nalu.payload(), &[0x40, 0x01, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn parse_header() {
        // VPS, layer 0, tid 1.
        let data = [0x40, 0x01];
        let mut r = BitCursor::new(&data);
        let mut out = Dict::new();

        let hdr = NaluHeader::parse(&mut r, &mut out).unwrap();
        assert_eq!(hdr.type_, NaluType::VpsNut);
        assert_eq!(hdr.nuh_layer_id, 0);
        assert_eq!(hdr.nuh_temporal_id_plus1, 1);
        assert_eq!(out.get_uint("nal_unit_type"), Some(32));
        assert!(r.at_end());

        // IDR_W_RADL, layer 5, tid 3.
        let data = [0x26, 0x2b];
        let mut r = BitCursor::new(&data);
        let hdr = NaluHeader::parse(&mut r, &mut Dict::new()).unwrap();
        assert_eq!(hdr.type_, NaluType::IdrWRadl);
        assert!(hdr.type_.is_idr());
        assert!(hdr.type_.is_irap());
        assert!(hdr.type_.is_slice());
        assert_eq!(hdr.nuh_layer_id, 5);
        assert_eq!(hdr.nuh_temporal_id_plus1, 3);
    }

    #[test]
    fn truncated_header() {
        let data = [0x40];
        let mut r = BitCursor::new(&data);
        let mut out = Dict::new();

        assert!(matches!(
            NaluHeader::parse(&mut r, &mut out),
            Err(ParseError::TruncatedHeader(8))
        ));
        assert_eq!(r.position(), 0);
        assert!(!r.overrun());
        assert!(out.is_empty());
    }

    #[test]
    fn forbidden_bit() {
        let data = [0xc0, 0x01];
        let mut r = BitCursor::new(&data);

        assert!(matches!(
            NaluHeader::parse(&mut r, &mut Dict::new()),
            Err(ParseError::ForbiddenZeroBit)
        ));
    }

    #[test]
    fn type_names() {
        assert_eq!(NaluType::CraNut.name(), "CRA_NUT");
        assert_eq!(NaluType::RsvNvcl44.name(), "RSV_NVCL");
        assert_eq!(NaluType::n(63u8).map(|t| t.name()), Some("UNSPEC"));
        assert!(!NaluType::RsvVclN10.is_slice());
        assert!(NaluType::RsvVclN10.is_vcl());
        assert!(!NaluType::PrefixSeiNut.is_vcl());
    }
}
