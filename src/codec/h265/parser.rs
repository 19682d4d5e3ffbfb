// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An h.265 syntax parser.
//!
//! [`Parser::parse_nalu`] decodes the NAL unit header and, depending on its
//! type, the VPS, SPS, PPS or slice segment header that follows. Every syntax
//! element is reported into a [`Dict`] as soon as it is read, so a failed
//! decode still leaves the fields decoded so far in the report. Decoded
//! structures are only kept by the parser when their decode succeeds.

use std::collections::BTreeMap;

use anyhow::anyhow;
use enumn::N;
use thiserror::Error;

use crate::bitstream_utils::BitCursor;
use crate::bitstream_utils::BitCursorError;
use crate::codec::h265::nalu::NaluHeader;
use crate::codec::h265::nalu::NaluType;
use crate::report::Dict;
use crate::report::List;

// Given the max SPS id.
const MAX_SPS_COUNT: u32 = 16;
// Given the max PPS id.
const MAX_PPS_COUNT: u32 = 64;

/// vps_max_sub_layers_minus1 and sps_max_sub_layers_minus1 are in 0..=6.
pub const MAX_SUB_LAYERS: usize = 7;
// 7.4.3.2.1
const MAX_SHORT_TERM_REF_PIC_SETS: u32 = 64;
// 7.4.3.2.1
const MAX_LONG_TERM_REF_PICS_SPS: u32 = 32;
// A.4.2
const MAX_DPB_SIZE: u32 = 16;
// 7.4.7.1: num_ref_idx_l0_active_minus1 is in 0..=14.
const MAX_REF_IDX_ACTIVE: u32 = 15;
// E.3.2: cpb_cnt_minus1 is in 0..=31.
const MAX_CPB_COUNT: u32 = 32;
// Largest picture dimension allowed by Table A.8, sqrt(MaxLumaPs * 8).
const MAX_PIC_DIMENSION: u32 = 16888;
// MAX_PIC_DIMENSION in units of the smallest CTB.
const MAX_CTBS_PER_DIMENSION: u32 = (MAX_PIC_DIMENSION + 15) / 16;

// Table 7-5.
const DEFAULT_SCALING_LIST_4X4: [u8; 64] = [16; 64];

// From Table 7-6.
const DEFAULT_SCALING_LIST_INTRA: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 16, 17, 16, 17, 18, 17, 18, 18, 17, 18, 21, 19, 20,
    21, 20, 19, 21, 24, 22, 22, 24, 24, 22, 22, 24, 25, 25, 27, 30, 27, 25, 25, 29, 31, 35, 35, 31,
    29, 36, 41, 44, 41, 36, 47, 54, 54, 47, 65, 70, 65, 88, 88, 115,
];

// From Table 7-6.
const DEFAULT_SCALING_LIST_INTER: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18, 18, 20, 20, 20,
    20, 20, 20, 20, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 28, 28, 28, 28, 28,
    28, 33, 33, 33, 33, 33, 41, 41, 41, 41, 54, 54, 54, 71, 71, 91,
];

#[derive(Error, Debug)]
pub enum ParseError {
    /// Fewer than the 16 bits of a NAL unit header were available.
    #[error("NAL unit header needs 16 bits, only {0} available")]
    TruncatedHeader(usize),
    #[error("forbidden_zero_bit is set")]
    ForbiddenZeroBit,
    /// The bitstream uses a syntax branch that is not decoded.
    #[error("unsupported syntax: {0}")]
    Unsupported(&'static str),
    /// A slice refers to a parameter set that was never successfully parsed.
    #[error("{kind} {id} is not available")]
    MissingParameterSet { kind: &'static str, id: u8 },
    /// A dependent slice segment follows no successfully decoded slice
    /// segment.
    #[error("dependent slice segment without a preceding slice segment")]
    NoPreviousSliceSegment,
    #[error(transparent)]
    BitCursor(#[from] BitCursorError),
    #[error(transparent)]
    Invalid(#[from] anyhow::Error),
}

/// Reads syntax elements, reporting each of them under its name.
trait SyntaxReader {
    fn flag(&mut self, out: &mut Dict, name: &str) -> bool;

    fn u<U>(&mut self, out: &mut Dict, name: &str, num_bits: usize) -> Result<U, BitCursorError>
    where
        U: TryFrom<u32> + Into<u64> + Copy;

    fn ue<U>(&mut self, out: &mut Dict, name: &str) -> Result<U, BitCursorError>
    where
        U: TryFrom<u32> + Into<u64> + Copy;

    fn ue_max<U>(&mut self, out: &mut Dict, name: &str, max: u32) -> Result<U, BitCursorError>
    where
        U: TryFrom<u32> + Into<u64> + Copy;

    fn se<U>(&mut self, out: &mut Dict, name: &str) -> Result<U, BitCursorError>
    where
        U: TryFrom<i32> + Into<i64> + Copy;

    fn se_bounded<U>(
        &mut self,
        out: &mut Dict,
        name: &str,
        min: i32,
        max: i32,
    ) -> Result<U, BitCursorError>
    where
        U: TryFrom<i32> + Into<i64> + Copy;
}

impl SyntaxReader for BitCursor<'_> {
    fn flag(&mut self, out: &mut Dict, name: &str) -> bool {
        let value = self.read_bit();
        out.put_uint(name, value);
        value
    }

    fn u<U>(&mut self, out: &mut Dict, name: &str, num_bits: usize) -> Result<U, BitCursorError>
    where
        U: TryFrom<u32> + Into<u64> + Copy,
    {
        let value: U = self.read(num_bits)?;
        out.put_uint(name, value);
        Ok(value)
    }

    fn ue<U>(&mut self, out: &mut Dict, name: &str) -> Result<U, BitCursorError>
    where
        U: TryFrom<u32> + Into<u64> + Copy,
    {
        let value: U = self.read_ue()?;
        out.put_uint(name, value);
        Ok(value)
    }

    fn ue_max<U>(&mut self, out: &mut Dict, name: &str, max: u32) -> Result<U, BitCursorError>
    where
        U: TryFrom<u32> + Into<u64> + Copy,
    {
        let value: U = self.read_ue_max(max)?;
        out.put_uint(name, value);
        Ok(value)
    }

    fn se<U>(&mut self, out: &mut Dict, name: &str) -> Result<U, BitCursorError>
    where
        U: TryFrom<i32> + Into<i64> + Copy,
    {
        let value: U = self.read_se()?;
        out.put_int(name, value);
        Ok(value)
    }

    fn se_bounded<U>(
        &mut self,
        out: &mut Dict,
        name: &str,
        min: i32,
        max: i32,
    ) -> Result<U, BitCursorError>
    where
        U: TryFrom<i32> + Into<i64> + Copy,
    {
        let value: U = self.read_se_bounded(min, max)?;
        out.put_int(name, value);
        Ok(value)
    }
}

/// Ceil(Log2(value)), with 0 for values up to 1.
fn ceil_log2(value: u32) -> usize {
    if value <= 1 {
        0
    } else {
        (32 - (value - 1).leading_zeros()) as usize
    }
}

fn check_max_sub_layers(max_sub_layers_minus1: u8) -> Result<(), ParseError> {
    if usize::from(max_sub_layers_minus1) >= MAX_SUB_LAYERS {
        return Err(anyhow!("Invalid max_sub_layers_minus1 {}", max_sub_layers_minus1).into());
    }

    Ok(())
}

/// Table 7-7 – Name association to slice_type
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    B = 0,
    P = 1,
    #[default]
    I = 2,
}

impl SliceType {
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SliceType::B => "B",
            SliceType::P => "P",
            SliceType::I => "I",
        }
    }
}

/// The profile part of profile_tier_level(), shared by the general profile
/// and the sub-layer ones.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    pub profile_space: u8,
    /// Tier context for the interpretation of `level_idc`.
    pub tier_flag: bool,
    /// Profile to which the CVS conforms, see Annex A.
    pub profile_idc: u8,
    /// `profile_compatibility_flag[j]` is set when the CVS conforms to the
    /// profile indicated by `profile_idc` equal to j.
    pub profile_compatibility_flag: [bool; 32],
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    pub max_12bit_constraint_flag: bool,
    pub max_10bit_constraint_flag: bool,
    pub max_8bit_constraint_flag: bool,
    pub max_422chroma_constraint_flag: bool,
    pub max_420chroma_constraint_flag: bool,
    pub max_monochrome_constraint_flag: bool,
    pub intra_constraint_flag: bool,
    pub one_picture_only_constraint_flag: bool,
    pub lower_bit_rate_constraint_flag: bool,
    pub inbld_flag: bool,
}

impl Profile {
    /// Whether `profile_idc`, or the matching compatibility flag, designates
    /// one of `profiles`.
    fn is_any_of(&self, profiles: &[u8]) -> bool {
        profiles.iter().any(|&p| {
            self.profile_idc == p || self.profile_compatibility_flag[usize::from(p)]
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubLayerProfileTierLevel {
    pub profile_present_flag: bool,
    pub level_present_flag: bool,
    /// Only meaningful if `profile_present_flag` is set.
    pub profile: Profile,
    /// Only meaningful if `level_present_flag` is set.
    pub level_idc: u8,
}

/// 7.3.3 Profile, tier and level syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general: Profile,
    /// Level to which the CVS conforms, 30 times the level number.
    pub general_level_idc: u8,
    /// One entry per sub-layer below the highest one.
    pub sub_layers: Vec<SubLayerProfileTierLevel>,
}

/// Sub-layer ordering fields, indexed by HighestTid. Shared by the VPS and
/// the SPS.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubLayerOrderingInfo {
    /// Plus 1 specifies the maximum required size of the decoded picture
    /// buffer in units of picture storage buffers.
    pub max_dec_pic_buffering_minus1: [u32; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u32; MAX_SUB_LAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
}

/// One CPB specification of sub_layer_hrd_parameters().
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpbSpec {
    pub bit_rate_value_minus1: u32,
    pub cpb_size_value_minus1: u32,
    pub cpb_size_du_value_minus1: u32,
    pub bit_rate_du_value_minus1: u32,
    pub cbr_flag: bool,
}

/// Per sub-layer part of hrd_parameters().
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdSubLayer {
    pub fixed_pic_rate_general_flag: bool,
    /// Inferred to be set when `fixed_pic_rate_general_flag` is.
    pub fixed_pic_rate_within_cvs_flag: bool,
    pub elemental_duration_in_tc_minus1: u32,
    pub low_delay_hrd_flag: bool,
    pub cpb_cnt_minus1: u32,
    pub nal_hrd: Vec<CpbSpec>,
    pub vcl_hrd: Vec<CpbSpec>,
}

/// E.2.2 HRD parameters syntax.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HrdParams {
    pub nal_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters_present_flag: bool,
    pub sub_pic_hrd_params_present_flag: bool,
    pub tick_divisor_minus2: u8,
    pub du_cpb_removal_delay_increment_length_minus1: u8,
    pub sub_pic_cpb_params_in_pic_timing_sei_flag: bool,
    pub dpb_output_delay_du_length_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub sub_layers: Vec<HrdSubLayer>,
}

impl Default for HrdParams {
    fn default() -> Self {
        Self {
            nal_hrd_parameters_present_flag: false,
            vcl_hrd_parameters_present_flag: false,
            sub_pic_hrd_params_present_flag: false,
            tick_divisor_minus2: 0,
            du_cpb_removal_delay_increment_length_minus1: 0,
            sub_pic_cpb_params_in_pic_timing_sei_flag: false,
            dpb_output_delay_du_length_minus1: 0,
            bit_rate_scale: 0,
            cpb_size_scale: 0,
            cpb_size_du_scale: 0,
            initial_cpb_removal_delay_length_minus1: 23,
            au_cpb_removal_delay_length_minus1: 23,
            dpb_output_delay_length_minus1: 23,
            sub_layers: vec![],
        }
    }
}

/// 7.3.2.1 Video parameter set RBSP syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    /// Identifies the VPS for reference by other syntax elements.
    pub video_parameter_set_id: u8,
    pub base_layer_internal_flag: bool,
    pub base_layer_available_flag: bool,
    /// Plus 1 specifies the maximum allowed number of layers in each CVS
    /// referring to the VPS.
    pub max_layers_minus1: u8,
    /// Plus 1 specifies the maximum number of temporal sub-layers that may be
    /// present in each CVS referring to the VPS.
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub reserved_0xffff_16bits: u16,
    pub profile_tier_level: ProfileTierLevel,
    pub sub_layer_ordering_info_present_flag: bool,
    /// Values for all sub-layers, inferred from the highest one when
    /// `sub_layer_ordering_info_present_flag` is not set.
    pub sub_layer_ordering: SubLayerOrderingInfo,
    pub max_layer_id: u8,
    pub num_layer_sets_minus1: u32,
    /// `layer_id_included_flag[i][j]` for layer sets 1..=num_layer_sets_minus1.
    pub layer_id_included_flag: Vec<Vec<bool>>,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub num_hrd_parameters: u32,
    pub hrd_layer_set_idx: Vec<u32>,
    pub cprms_present_flag: Vec<bool>,
    pub hrd_parameters: Vec<HrdParams>,
    pub extension_flag: bool,
}

/// 7.3.4 Scaling list data syntax, with the lists not transmitted resolved
/// to their predicted or default values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    /// ScalingList[sizeId][matrixId][i]. Only the first 16 coefficients are
    /// used for sizeId 0.
    pub lists: [[[u8; 64]; 6]; 4],
    /// scaling_list_dc_coef_minus8 + 8 for sizeId 2 and 3.
    pub dc_coef: [[u8; 6]; 2],
}

impl Default for ScalingLists {
    /// Flat lists, as used when scaling lists are disabled.
    fn default() -> Self {
        Self {
            lists: [[[16; 64]; 6]; 4],
            dc_coef: [[16; 6]; 2],
        }
    }
}

impl ScalingLists {
    /// The lists of Tables 7-5 and 7-6.
    pub fn default_lists() -> Self {
        let mut sl = Self::default();

        for size_id in 0..4 {
            for matrix_id in 0..6 {
                sl.lists[size_id][matrix_id] = Self::default_list(size_id, matrix_id);
            }
        }

        sl
    }

    fn default_list(size_id: usize, matrix_id: usize) -> [u8; 64] {
        match (size_id, matrix_id) {
            (0, _) => DEFAULT_SCALING_LIST_4X4,
            (_, 0..=2) => DEFAULT_SCALING_LIST_INTRA,
            _ => DEFAULT_SCALING_LIST_INTER,
        }
    }
}

/// 7.3.7 Short-term reference picture set syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    pub inter_ref_pic_set_prediction_flag: bool,
    pub num_negative_pics: u8,
    pub num_positive_pics: u8,
    /// DeltaPocS0, derived from delta_poc_s0_minus1 (7-67).
    pub delta_poc_s0: Vec<i32>,
    pub used_by_curr_pic_s0: Vec<bool>,
    /// DeltaPocS1, derived from delta_poc_s1_minus1 (7-68).
    pub delta_poc_s1: Vec<i32>,
    pub used_by_curr_pic_s1: Vec<bool>,
}

impl ShortTermRefPicSet {
    /// NumDeltaPocs (7-71).
    pub fn num_delta_pocs(&self) -> usize {
        usize::from(self.num_negative_pics) + usize::from(self.num_positive_pics)
    }

    /// Number of entries of the set used by the current picture.
    pub fn num_used_by_curr(&self) -> u32 {
        self.used_by_curr_pic_s0
            .iter()
            .chain(self.used_by_curr_pic_s1.iter())
            .filter(|used| **used)
            .count() as u32
    }
}

/// E.2.1 VUI parameters syntax.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,
    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,
    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coeffs: u8,
    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u32,
    pub chroma_sample_loc_type_bottom_field: u32,
    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,
    pub default_display_window_flag: bool,
    pub def_disp_win_left_offset: u32,
    pub def_disp_win_right_offset: u32,
    pub def_disp_win_top_offset: u32,
    pub def_disp_win_bottom_offset: u32,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub hrd_parameters_present_flag: bool,
    pub hrd: HrdParams,
    pub bitstream_restriction_flag: bool,
    pub tiles_fixed_structure_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub restricted_ref_pic_lists_flag: bool,
    pub min_spatial_segmentation_idc: u32,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_min_cu_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
}

impl Default for VuiParams {
    /// Values inferred for the fields that are not present.
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coeffs: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            neutral_chroma_indication_flag: false,
            field_seq_flag: false,
            frame_field_info_present_flag: false,
            default_display_window_flag: false,
            def_disp_win_left_offset: 0,
            def_disp_win_right_offset: 0,
            def_disp_win_top_offset: 0,
            def_disp_win_bottom_offset: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            poc_proportional_to_timing_flag: false,
            num_ticks_poc_diff_one_minus1: 0,
            hrd_parameters_present_flag: false,
            hrd: Default::default(),
            bitstream_restriction_flag: false,
            tiles_fixed_structure_flag: false,
            motion_vectors_over_pic_boundaries_flag: true,
            restricted_ref_pic_lists_flag: false,
            min_spatial_segmentation_idc: 0,
            max_bytes_per_pic_denom: 2,
            max_bits_per_min_cu_denom: 1,
            log2_max_mv_length_horizontal: 15,
            log2_max_mv_length_vertical: 15,
        }
    }
}

/// 7.3.2.2.2 Sequence parameter set range extension syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpsRangeExtension {
    pub transform_skip_rotation_enabled_flag: bool,
    pub transform_skip_context_enabled_flag: bool,
    pub implicit_rdpcm_enabled_flag: bool,
    pub explicit_rdpcm_enabled_flag: bool,
    pub extended_precision_processing_flag: bool,
    pub intra_smoothing_disabled_flag: bool,
    pub high_precision_offsets_enabled_flag: bool,
    pub persistent_rice_adaptation_enabled_flag: bool,
    pub cabac_bypass_alignment_enabled_flag: bool,
}

/// 7.3.2.2 Sequence parameter set RBSP syntax, followed by the variables
/// derived from it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    /// The value of the vps_video_parameter_set_id of the active VPS.
    pub video_parameter_set_id: u8,
    /// Plus 1 specifies the maximum number of temporal sub-layers that may be
    /// present in each CVS referring to the SPS.
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    /// Identifies the SPS for reference by other syntax elements.
    pub seq_parameter_set_id: u8,
    /// Chroma sampling relative to the luma sampling as specified in clause
    /// 6.2.
    pub chroma_format_idc: u8,
    /// The three colour components of the 4:4:4 chroma format are coded
    /// separately.
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub conformance_window_flag: bool,
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    /// Plus 4 is the length of slice_pic_order_cnt_lsb, in bits.
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub sub_layer_ordering_info_present_flag: bool,
    pub sub_layer_ordering: SubLayerOrderingInfo,
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_luma_transform_block_size_minus2: u8,
    pub log2_diff_max_min_luma_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,
    pub scaling_list_enabled_flag: bool,
    pub scaling_list_data_present_flag: bool,
    /// The lists in use: transmitted, default, or flat when scaling lists are
    /// disabled.
    pub scaling_list: ScalingLists,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_sample_bit_depth_luma_minus1: u8,
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    pub log2_min_pcm_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u8,
    pub pcm_loop_filter_disabled_flag: bool,
    pub num_short_term_ref_pic_sets: u8,
    pub short_term_ref_pic_sets: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u8,
    pub lt_ref_pic_poc_lsb_sps: Vec<u16>,
    pub used_by_curr_pic_lt_sps_flag: Vec<bool>,
    pub temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub multilayer_extension_flag: bool,
    pub three_d_extension_flag: bool,
    pub scc_extension_flag: bool,
    pub extension_4bits: u8,
    pub range_extension: SpsRangeExtension,
    /// From sps_multilayer_extension().
    pub inter_view_mv_vert_constraint_flag: bool,

    // Derived variables.
    pub chroma_array_type: u8,
    pub sub_width_c: u32,
    pub sub_height_c: u32,
    pub min_cb_log2_size_y: u32,
    pub ctb_log2_size_y: u32,
    pub min_cb_size_y: u32,
    pub ctb_size_y: u32,
    pub pic_width_in_min_cbs_y: u32,
    pub pic_width_in_ctbs_y: u32,
    pub pic_height_in_min_cbs_y: u32,
    pub pic_height_in_ctbs_y: u32,
    pub pic_size_in_min_cbs_y: u32,
    pub pic_size_in_ctbs_y: u32,
    pub pic_size_in_samples_y: u32,
    pub pic_width_in_samples_c: u32,
    pub pic_height_in_samples_c: u32,
}

impl Sps {
    /// Table 6-1 and equations 7-10 to 7-22.
    fn derive_variables(&mut self) {
        self.chroma_array_type = if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        };

        (self.sub_width_c, self.sub_height_c) = match self.chroma_array_type {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };

        // (7-10)
        self.min_cb_log2_size_y = u32::from(self.log2_min_luma_coding_block_size_minus3) + 3;
        // (7-11)
        self.ctb_log2_size_y =
            self.min_cb_log2_size_y + u32::from(self.log2_diff_max_min_luma_coding_block_size);
        // (7-12)
        self.min_cb_size_y = 1 << self.min_cb_log2_size_y;
        // (7-13)
        self.ctb_size_y = 1 << self.ctb_log2_size_y;
        // (7-14)
        self.pic_width_in_min_cbs_y = self.pic_width_in_luma_samples / self.min_cb_size_y;
        // (7-15)
        self.pic_width_in_ctbs_y = self.pic_width_in_luma_samples.div_ceil(self.ctb_size_y);
        // (7-16)
        self.pic_height_in_min_cbs_y = self.pic_height_in_luma_samples / self.min_cb_size_y;
        // (7-17)
        self.pic_height_in_ctbs_y = self.pic_height_in_luma_samples.div_ceil(self.ctb_size_y);
        // (7-18)
        self.pic_size_in_min_cbs_y = self.pic_width_in_min_cbs_y * self.pic_height_in_min_cbs_y;
        // (7-19)
        self.pic_size_in_ctbs_y = self.pic_width_in_ctbs_y * self.pic_height_in_ctbs_y;
        // (7-20)
        self.pic_size_in_samples_y =
            self.pic_width_in_luma_samples * self.pic_height_in_luma_samples;
        // (7-21)
        self.pic_width_in_samples_c = self.pic_width_in_luma_samples / self.sub_width_c;
        // (7-22)
        self.pic_height_in_samples_c = self.pic_height_in_luma_samples / self.sub_height_c;
    }

    fn report_derived(&self, out: &mut Dict) {
        out.put_uint("SubWidthC", self.sub_width_c);
        out.put_uint("SubHeightC", self.sub_height_c);
        out.put_uint("MinCbLog2SizeY", self.min_cb_log2_size_y);
        out.put_uint("CtbLog2SizeY", self.ctb_log2_size_y);
        out.put_uint("MinCbSizeY", self.min_cb_size_y);
        out.put_uint("CtbSizeY", self.ctb_size_y);
        out.put_uint("PicWidthInMinCbsY", self.pic_width_in_min_cbs_y);
        out.put_uint("PicWidthInCtbsY", self.pic_width_in_ctbs_y);
        out.put_uint("PicHeightInMinCbsY", self.pic_height_in_min_cbs_y);
        out.put_uint("PicHeightInCtbsY", self.pic_height_in_ctbs_y);
        out.put_uint("PicSizeInMinCbsY", self.pic_size_in_min_cbs_y);
        out.put_uint("PicSizeInCtbsY", self.pic_size_in_ctbs_y);
        out.put_uint("PicSizeInSamplesY", self.pic_size_in_samples_y);
        out.put_uint("PicWidthInSamplesC", self.pic_width_in_samples_c);
        out.put_uint("PicHeightInSamplesC", self.pic_height_in_samples_c);
    }

    /// Number of bits of slice_pic_order_cnt_lsb and lt_ref_pic_poc_lsb_sps.
    pub fn pic_order_cnt_lsb_bits(&self) -> usize {
        usize::from(self.log2_max_pic_order_cnt_lsb_minus4) + 4
    }

    /// Number of bits of slice_segment_address.
    pub fn slice_segment_address_bits(&self) -> usize {
        ceil_log2(self.pic_size_in_ctbs_y)
    }
}

/// 7.3.2.3.2 Picture parameter set range extension syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpsRangeExtension {
    pub log2_max_transform_skip_block_size_minus2: u8,
    pub cross_component_prediction_enabled_flag: bool,
    pub chroma_qp_offset_list_enabled_flag: bool,
    pub diff_cu_chroma_qp_offset_depth: u8,
    pub chroma_qp_offset_list_len_minus1: u8,
    pub cb_qp_offset_list: Vec<i8>,
    pub cr_qp_offset_list: Vec<i8>,
    pub log2_sao_offset_scale_luma: u8,
    pub log2_sao_offset_scale_chroma: u8,
}

/// 7.3.2.3 Picture parameter set RBSP syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    /// Identifies the PPS for reference by other syntax elements.
    pub pic_parameter_set_id: u8,
    /// The value of sps_seq_parameter_set_id of the SPS this PPS refers to.
    pub seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub init_qp_minus26: i8,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u8,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub num_tile_columns_minus1: u32,
    pub num_tile_rows_minus1: u32,
    /// Inferred to be set when tiles are disabled.
    pub uniform_spacing_flag: bool,
    pub column_width_minus1: Vec<u32>,
    pub row_height_minus1: Vec<u32>,
    /// colWidth (6-3 and 6-5), in CTBs. Only derived when the referenced SPS
    /// is known.
    pub column_widths: Vec<u32>,
    /// rowHeight (6-4 and 6-6), in CTBs. Only derived when the referenced SPS
    /// is known.
    pub row_heights: Vec<u32>,
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub scaling_list_data_present_flag: bool,
    /// Transmitted lists, or those of the referenced SPS when known.
    pub scaling_list: ScalingLists,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level_minus2: u8,
    pub slice_segment_header_extension_present_flag: bool,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub multilayer_extension_flag: bool,
    pub three_d_extension_flag: bool,
    pub scc_extension_flag: bool,
    pub extension_4bits: u8,
    pub range_extension: PpsRangeExtension,
}

/// 7.3.6 Slice segment header syntax.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    pub segment_address: u32,
    pub type_: SliceType,
    /// Inferred to be set when not present.
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    pub pic_order_cnt_lsb: u16,
    pub short_term_ref_pic_set_sps_flag: bool,
    /// The set coded in the slice header, if `short_term_ref_pic_set_sps_flag`
    /// is not set.
    pub short_term_ref_pic_set: ShortTermRefPicSet,
    pub short_term_ref_pic_set_idx: u8,
    pub num_long_term_sps: u8,
    pub num_long_term_pics: u8,
    pub lt_idx_sps: Vec<u8>,
    /// PocLsbLt, for the SPS candidates then the explicit ones.
    pub poc_lsb_lt: Vec<u16>,
    /// UsedByCurrPicLt, for the SPS candidates then the explicit ones.
    pub used_by_curr_pic_lt: Vec<bool>,
    pub delta_poc_msb_present_flag: Vec<bool>,
    pub delta_poc_msb_cycle_lt: Vec<u32>,
    pub temporal_mvp_enabled_flag: bool,
    pub sao_luma_flag: bool,
    pub sao_chroma_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    /// NumPicTotalCurr (7-55).
    pub num_pic_total_curr: u32,
    pub mvd_l1_zero_flag: bool,
    pub cabac_init_flag: bool,
    /// Inferred to be set when not present.
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u8,
    pub five_minus_max_num_merge_cand: u8,
    pub qp_delta: i32,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub cu_chroma_qp_offset_enabled_flag: bool,
    pub deblocking_filter_override_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub num_entry_point_offsets: u32,
    pub offset_len_minus1: u8,
    pub entry_point_offset_minus1: Vec<u32>,
    pub segment_header_extension_length: u16,
    pub segment_header_extension_data_byte: Vec<u8>,
    /// Size of the header in bits, byte_alignment() included.
    pub header_bit_size: usize,
}

impl SliceHeader {
    /// A header holding the values inferred from `pps` for the fields that
    /// may not be present.
    fn with_pps_defaults(pps: &Pps) -> Self {
        Self {
            pic_output_flag: true,
            collocated_from_l0_flag: true,
            num_ref_idx_l0_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
            deblocking_filter_disabled_flag: pps.deblocking_filter_disabled_flag,
            beta_offset_div2: pps.beta_offset_div2,
            tc_offset_div2: pps.tc_offset_div2,
            loop_filter_across_slices_enabled_flag: pps.loop_filter_across_slices_enabled_flag,
            ..Default::default()
        }
    }
}

/// Decodes h.265 NAL units, keeping the last successfully decoded parameter
/// sets and slice segment header as context for the following ones.
#[derive(Debug, Default)]
pub struct Parser {
    nalu_header: Option<NaluHeader>,
    vpses: BTreeMap<u8, Vps>,
    spses: BTreeMap<u8, Sps>,
    ppses: BTreeMap<u8, Pps>,
    last_vps_id: Option<u8>,
    last_sps_id: Option<u8>,
    last_pps_id: Option<u8>,
    slice_header: Option<SliceHeader>,
}

impl Parser {
    pub fn new() -> Self {
        Default::default()
    }

    /// Header of the last NAL unit, kept even if its payload failed to
    /// decode.
    pub fn nalu_header(&self) -> Option<&NaluHeader> {
        self.nalu_header.as_ref()
    }

    /// The last successfully decoded VPS.
    pub fn vps(&self) -> Option<&Vps> {
        self.last_vps_id.and_then(|id| self.vpses.get(&id))
    }

    /// The last successfully decoded SPS.
    pub fn sps(&self) -> Option<&Sps> {
        self.last_sps_id.and_then(|id| self.spses.get(&id))
    }

    /// The last successfully decoded PPS.
    pub fn pps(&self) -> Option<&Pps> {
        self.last_pps_id.and_then(|id| self.ppses.get(&id))
    }

    /// The last successfully decoded slice segment header.
    pub fn slice_header(&self) -> Option<&SliceHeader> {
        self.slice_header.as_ref()
    }

    pub fn get_vps(&self, vps_id: u8) -> Option<&Vps> {
        self.vpses.get(&vps_id)
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Sps> {
        self.spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Pps> {
        self.ppses.get(&pps_id)
    }

    /// Decodes the NAL unit in `data`, which holds the bytes following the
    /// start code with emulation prevention bytes already removed. Decoded
    /// fields are reported to `out`, including when an error is returned.
    pub fn parse_nalu(&mut self, data: &[u8], out: &mut Dict) -> Result<NaluType, ParseError> {
        let mut r = BitCursor::new(data);

        let header = NaluHeader::parse(&mut r, out.put_dict("nal_unit_header"))?;
        self.nalu_header = Some(header);
        log::debug!("Parsing {:?} NAL unit of {} bytes", header.type_, data.len());

        match header.type_ {
            NaluType::VpsNut => {
                let vps = Self::parse_vps(&mut r, out.put_dict("video_parameter_set"))?;
                self.last_vps_id = Some(vps.video_parameter_set_id);
                self.vpses.insert(vps.video_parameter_set_id, vps);
            }
            NaluType::SpsNut => {
                let sps = Self::parse_sps(
                    &mut r,
                    out.put_dict("seq_parameter_set"),
                    header.nuh_layer_id,
                )?;
                // Tile sizes of the PPSs using this id follow the new geometry.
                for pps in self.ppses.values_mut() {
                    if pps.tiles_enabled_flag
                        && pps.seq_parameter_set_id == sps.seq_parameter_set_id
                    {
                        Self::derive_tile_sizes(pps, &sps);
                    }
                }

                self.last_sps_id = Some(sps.seq_parameter_set_id);
                self.spses.insert(sps.seq_parameter_set_id, sps);
            }
            NaluType::PpsNut => {
                let pps = self.parse_pps(&mut r, out.put_dict("pic_parameter_set"))?;
                self.last_pps_id = Some(pps.pic_parameter_set_id);
                self.ppses.insert(pps.pic_parameter_set_id, pps);
            }
            type_ if type_.is_slice() => {
                let hdr =
                    self.parse_slice_header(&mut r, out.put_dict("slice_segment_header"), &header);
                match hdr {
                    Ok(hdr) => self.slice_header = Some(hdr),
                    Err(e) => {
                        // Following dependent slice segments have nothing to inherit from.
                        self.slice_header = None;
                        return Err(e);
                    }
                }
            }
            _ => (),
        }

        if r.overrun() {
            log::warn!(
                "{:?} NAL unit ended before its last syntax element, missing bits read as zero",
                header.type_
            );
            out.put_uint("truncated", true);
        }

        Ok(header.type_)
    }

    fn parse_profile(r: &mut BitCursor, out: &mut Dict, prefix: &str) -> Result<Profile, ParseError> {
        let key = |name: &str| format!("{}_{}", prefix, name);

        let mut p = Profile {
            profile_space: r.u(out, &key("profile_space"), 2)?,
            tier_flag: r.flag(out, &key("tier_flag")),
            profile_idc: r.u(out, &key("profile_idc"), 5)?,
            ..Default::default()
        };

        let flags = out.put_list(&key("profile_compatibility_flag"));
        for flag in p.profile_compatibility_flag.iter_mut() {
            *flag = r.read_bit();
            flags.put_uint(*flag);
        }

        p.progressive_source_flag = r.flag(out, &key("progressive_source_flag"));
        p.interlaced_source_flag = r.flag(out, &key("interlaced_source_flag"));
        p.non_packed_constraint_flag = r.flag(out, &key("non_packed_constraint_flag"));
        p.frame_only_constraint_flag = r.flag(out, &key("frame_only_constraint_flag"));

        // The next 43 bits hold constraint flags only for the format range
        // extensions profiles.
        if p.is_any_of(&[4, 5, 6, 7]) {
            p.max_12bit_constraint_flag = r.flag(out, &key("max_12bit_constraint_flag"));
            p.max_10bit_constraint_flag = r.flag(out, &key("max_10bit_constraint_flag"));
            p.max_8bit_constraint_flag = r.flag(out, &key("max_8bit_constraint_flag"));
            p.max_422chroma_constraint_flag = r.flag(out, &key("max_422chroma_constraint_flag"));
            p.max_420chroma_constraint_flag = r.flag(out, &key("max_420chroma_constraint_flag"));
            p.max_monochrome_constraint_flag =
                r.flag(out, &key("max_monochrome_constraint_flag"));
            p.intra_constraint_flag = r.flag(out, &key("intra_constraint_flag"));
            p.one_picture_only_constraint_flag =
                r.flag(out, &key("one_picture_only_constraint_flag"));
            p.lower_bit_rate_constraint_flag =
                r.flag(out, &key("lower_bit_rate_constraint_flag"));
            // reserved_zero_34bits
            r.skip_bits(34);
        } else {
            // reserved_zero_43bits
            r.skip_bits(43);
        }

        if p.is_any_of(&[1, 2, 3, 4, 5]) {
            p.inbld_flag = r.flag(out, &key("inbld_flag"));
        } else {
            // reserved_zero_bit
            r.skip_bits(1);
        }

        Ok(p)
    }

    fn parse_profile_tier_level(
        r: &mut BitCursor,
        out: &mut Dict,
        profile_present_flag: bool,
        max_sub_layers_minus1: u8,
    ) -> Result<ProfileTierLevel, ParseError> {
        let mut ptl = ProfileTierLevel::default();

        if profile_present_flag {
            ptl.general = Self::parse_profile(r, out, "general")?;
        }

        ptl.general_level_idc = r.u(out, "general_level_idc", 8)?;

        let sub_layers = out.put_list("sub_layers");
        for _ in 0..max_sub_layers_minus1 {
            let out = sub_layers.put_dict();
            ptl.sub_layers.push(SubLayerProfileTierLevel {
                profile_present_flag: r.flag(out, "sub_layer_profile_present_flag"),
                level_present_flag: r.flag(out, "sub_layer_level_present_flag"),
                ..Default::default()
            });
        }

        if max_sub_layers_minus1 > 0 {
            for _ in max_sub_layers_minus1..8 {
                // reserved_zero_2bits
                r.skip_bits(2);
            }
        }

        for (i, sub_layer) in ptl.sub_layers.iter_mut().enumerate() {
            let Some(out) = sub_layers.dict_mut(i) else {
                continue;
            };

            if sub_layer.profile_present_flag {
                sub_layer.profile = Self::parse_profile(r, out, "sub_layer")?;
            }

            if sub_layer.level_present_flag {
                sub_layer.level_idc = r.u(out, "sub_layer_level_idc", 8)?;
            }
        }

        Ok(ptl)
    }

    fn parse_sub_layer_ordering_info(
        r: &mut BitCursor,
        out: &mut Dict,
        prefix: &str,
        info_present_flag: bool,
        max_sub_layers_minus1: u8,
    ) -> Result<SubLayerOrderingInfo, ParseError> {
        let mut info = SubLayerOrderingInfo::default();
        let highest = usize::from(max_sub_layers_minus1);
        let first = if info_present_flag { 0 } else { highest };

        let list = out.put_list(&format!("{}_sub_layer_ordering_info", prefix));
        for i in first..=highest {
            let out = list.put_dict();

            info.max_dec_pic_buffering_minus1[i] = r.ue_max(
                out,
                &format!("{}_max_dec_pic_buffering_minus1", prefix),
                MAX_DPB_SIZE - 1,
            )?;
            info.max_num_reorder_pics[i] = r.ue_max(
                out,
                &format!("{}_max_num_reorder_pics", prefix),
                info.max_dec_pic_buffering_minus1[i],
            )?;
            info.max_latency_increase_plus1[i] = r.ue_max(
                out,
                &format!("{}_max_latency_increase_plus1", prefix),
                u32::MAX - 1,
            )?;
        }

        // The values of the highest sub-layer apply to the lower ones when
        // not present.
        for i in 0..first {
            info.max_dec_pic_buffering_minus1[i] = info.max_dec_pic_buffering_minus1[highest];
            info.max_num_reorder_pics[i] = info.max_num_reorder_pics[highest];
            info.max_latency_increase_plus1[i] = info.max_latency_increase_plus1[highest];
        }

        Ok(info)
    }

    fn parse_sub_layer_hrd_parameters(
        r: &mut BitCursor,
        out: &mut List,
        cpb_cnt_minus1: u32,
        sub_pic_hrd_params_present_flag: bool,
    ) -> Result<Vec<CpbSpec>, ParseError> {
        let mut cpbs = vec![];

        for _ in 0..=cpb_cnt_minus1 {
            let out = out.put_dict();
            let mut cpb = CpbSpec {
                bit_rate_value_minus1: r.ue_max(out, "bit_rate_value_minus1", u32::MAX - 1)?,
                cpb_size_value_minus1: r.ue_max(out, "cpb_size_value_minus1", u32::MAX - 1)?,
                ..Default::default()
            };

            if sub_pic_hrd_params_present_flag {
                cpb.cpb_size_du_value_minus1 =
                    r.ue_max(out, "cpb_size_du_value_minus1", u32::MAX - 1)?;
                cpb.bit_rate_du_value_minus1 =
                    r.ue_max(out, "bit_rate_du_value_minus1", u32::MAX - 1)?;
            }

            cpb.cbr_flag = r.flag(out, "cbr_flag");
            cpbs.push(cpb);
        }

        Ok(cpbs)
    }

    /// Decodes hrd_parameters(). The common information is taken from `hrd`
    /// when `common_inf_present_flag` is not set.
    fn parse_hrd_parameters(
        r: &mut BitCursor,
        out: &mut Dict,
        common_inf_present_flag: bool,
        max_sub_layers_minus1: u8,
        mut hrd: HrdParams,
    ) -> Result<HrdParams, ParseError> {
        hrd.sub_layers.clear();

        if common_inf_present_flag {
            hrd.nal_hrd_parameters_present_flag = r.flag(out, "nal_hrd_parameters_present_flag");
            hrd.vcl_hrd_parameters_present_flag = r.flag(out, "vcl_hrd_parameters_present_flag");

            if hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag {
                hrd.sub_pic_hrd_params_present_flag =
                    r.flag(out, "sub_pic_hrd_params_present_flag");

                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.tick_divisor_minus2 = r.u(out, "tick_divisor_minus2", 8)?;
                    hrd.du_cpb_removal_delay_increment_length_minus1 =
                        r.u(out, "du_cpb_removal_delay_increment_length_minus1", 5)?;
                    hrd.sub_pic_cpb_params_in_pic_timing_sei_flag =
                        r.flag(out, "sub_pic_cpb_params_in_pic_timing_sei_flag");
                    hrd.dpb_output_delay_du_length_minus1 =
                        r.u(out, "dpb_output_delay_du_length_minus1", 5)?;
                }

                hrd.bit_rate_scale = r.u(out, "bit_rate_scale", 4)?;
                hrd.cpb_size_scale = r.u(out, "cpb_size_scale", 4)?;

                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.cpb_size_du_scale = r.u(out, "cpb_size_du_scale", 4)?;
                }

                hrd.initial_cpb_removal_delay_length_minus1 =
                    r.u(out, "initial_cpb_removal_delay_length_minus1", 5)?;
                hrd.au_cpb_removal_delay_length_minus1 =
                    r.u(out, "au_cpb_removal_delay_length_minus1", 5)?;
                hrd.dpb_output_delay_length_minus1 =
                    r.u(out, "dpb_output_delay_length_minus1", 5)?;
            }
        }

        let sub_layers = out.put_list("sub_layers");
        for _ in 0..=max_sub_layers_minus1 {
            let out = sub_layers.put_dict();
            let mut sl = HrdSubLayer {
                fixed_pic_rate_general_flag: r.flag(out, "fixed_pic_rate_general_flag"),
                ..Default::default()
            };

            sl.fixed_pic_rate_within_cvs_flag = if sl.fixed_pic_rate_general_flag {
                true
            } else {
                r.flag(out, "fixed_pic_rate_within_cvs_flag")
            };

            if sl.fixed_pic_rate_within_cvs_flag {
                sl.elemental_duration_in_tc_minus1 =
                    r.ue_max(out, "elemental_duration_in_tc_minus1", 2047)?;
            } else {
                sl.low_delay_hrd_flag = r.flag(out, "low_delay_hrd_flag");
            }

            if !sl.low_delay_hrd_flag {
                sl.cpb_cnt_minus1 = r.ue_max(out, "cpb_cnt_minus1", MAX_CPB_COUNT - 1)?;
            }

            if hrd.nal_hrd_parameters_present_flag {
                sl.nal_hrd = Self::parse_sub_layer_hrd_parameters(
                    r,
                    out.put_list("nal_sub_layer_hrd_parameters"),
                    sl.cpb_cnt_minus1,
                    hrd.sub_pic_hrd_params_present_flag,
                )?;
            }

            if hrd.vcl_hrd_parameters_present_flag {
                sl.vcl_hrd = Self::parse_sub_layer_hrd_parameters(
                    r,
                    out.put_list("vcl_sub_layer_hrd_parameters"),
                    sl.cpb_cnt_minus1,
                    hrd.sub_pic_hrd_params_present_flag,
                )?;
            }

            hrd.sub_layers.push(sl);
        }

        Ok(hrd)
    }

    fn parse_vps(r: &mut BitCursor, out: &mut Dict) -> Result<Vps, ParseError> {
        let mut vps = Vps {
            video_parameter_set_id: r.u(out, "vps_video_parameter_set_id", 4)?,
            base_layer_internal_flag: r.flag(out, "vps_base_layer_internal_flag"),
            base_layer_available_flag: r.flag(out, "vps_base_layer_available_flag"),
            max_layers_minus1: r.u(out, "vps_max_layers_minus1", 6)?,
            max_sub_layers_minus1: r.u(out, "vps_max_sub_layers_minus1", 3)?,
            temporal_id_nesting_flag: r.flag(out, "vps_temporal_id_nesting_flag"),
            ..Default::default()
        };

        check_max_sub_layers(vps.max_sub_layers_minus1)?;

        vps.reserved_0xffff_16bits = r.read(16)?;
        out.put_hex("vps_reserved_0xffff_16bits", vps.reserved_0xffff_16bits);
        if vps.reserved_0xffff_16bits != 0xffff {
            log::warn!(
                "vps_reserved_0xffff_16bits is {:#x}",
                vps.reserved_0xffff_16bits
            );
        }

        vps.profile_tier_level = Self::parse_profile_tier_level(
            r,
            out.put_dict("profile_tier_level"),
            true,
            vps.max_sub_layers_minus1,
        )?;

        vps.sub_layer_ordering_info_present_flag =
            r.flag(out, "vps_sub_layer_ordering_info_present_flag");
        vps.sub_layer_ordering = Self::parse_sub_layer_ordering_info(
            r,
            out,
            "vps",
            vps.sub_layer_ordering_info_present_flag,
            vps.max_sub_layers_minus1,
        )?;

        vps.max_layer_id = r.u(out, "vps_max_layer_id", 6)?;
        vps.num_layer_sets_minus1 = r.ue_max(out, "vps_num_layer_sets_minus1", 1023)?;

        let layer_sets = out.put_list("layer_id_included_flag");
        for _ in 1..=vps.num_layer_sets_minus1 {
            let flags = layer_sets.put_list();
            let mut layer_set = vec![];

            for _ in 0..=vps.max_layer_id {
                let included = r.read_bit();
                flags.put_uint(included);
                layer_set.push(included);
            }

            vps.layer_id_included_flag.push(layer_set);
        }

        vps.timing_info_present_flag = r.flag(out, "vps_timing_info_present_flag");
        if vps.timing_info_present_flag {
            vps.num_units_in_tick = r.u(out, "vps_num_units_in_tick", 32)?;
            vps.time_scale = r.u(out, "vps_time_scale", 32)?;
            vps.poc_proportional_to_timing_flag =
                r.flag(out, "vps_poc_proportional_to_timing_flag");

            if vps.poc_proportional_to_timing_flag {
                vps.num_ticks_poc_diff_one_minus1 =
                    r.ue_max(out, "vps_num_ticks_poc_diff_one_minus1", u32::MAX - 1)?;
            }

            vps.num_hrd_parameters =
                r.ue_max(out, "vps_num_hrd_parameters", vps.num_layer_sets_minus1 + 1)?;

            let hrds = out.put_list("hrd_parameters");
            for i in 0..vps.num_hrd_parameters {
                let out = hrds.put_dict();

                let hrd_layer_set_idx =
                    r.ue_max(out, "hrd_layer_set_idx", vps.num_layer_sets_minus1)?;
                vps.hrd_layer_set_idx.push(hrd_layer_set_idx);

                // cprms_present_flag[0] is inferred to be 1.
                let cprms_present_flag = if i > 0 {
                    r.flag(out, "cprms_present_flag")
                } else {
                    true
                };
                vps.cprms_present_flag.push(cprms_present_flag);

                let previous = vps.hrd_parameters.last().cloned().unwrap_or_default();
                let hrd = Self::parse_hrd_parameters(
                    r,
                    out.put_dict("hrd_parameters"),
                    cprms_present_flag,
                    vps.max_sub_layers_minus1,
                    previous,
                )?;
                vps.hrd_parameters.push(hrd);
            }
        }

        vps.extension_flag = r.flag(out, "vps_extension_flag");
        if vps.extension_flag {
            log::debug!("Skipping vps_extension_data_flag");
        }

        Ok(vps)
    }

    /// Decodes scaling_list_data(). The lists that are neither transmitted
    /// nor predicted from another one keep their default values.
    fn parse_scaling_list_data(r: &mut BitCursor, out: &mut Dict) -> Result<ScalingLists, ParseError> {
        let mut sl = ScalingLists::default_lists();
        let matrices = out.put_list("scaling_list");

        for size_id in 0..4u8 {
            let step = if size_id == 3 { 3 } else { 1 };
            let s = usize::from(size_id);

            for matrix_id in (0..6u8).step_by(usize::from(step)) {
                let out = matrices.put_dict();
                out.put_uint("sizeId", size_id);
                out.put_uint("matrixId", matrix_id);

                let m = usize::from(matrix_id);
                let pred_mode_flag = r.flag(out, "scaling_list_pred_mode_flag");

                if !pred_mode_flag {
                    let delta: u8 = r.ue_max(
                        out,
                        "scaling_list_pred_matrix_id_delta",
                        u32::from(matrix_id / step),
                    )?;

                    // A zero delta selects the default list, already in place.
                    if delta != 0 {
                        // (7-42)
                        let ref_matrix_id = usize::from(matrix_id - delta * step);
                        sl.lists[s][m] = sl.lists[s][ref_matrix_id];
                        if size_id > 1 {
                            sl.dc_coef[s - 2][m] = sl.dc_coef[s - 2][ref_matrix_id];
                        }
                    }
                } else {
                    let mut next_coef: i32 = 8;
                    let coef_num = std::cmp::min(64, 1 << (4 + (s << 1)));

                    if size_id > 1 {
                        let dc_coef_minus8: i32 =
                            r.se_bounded(out, "scaling_list_dc_coef_minus8", -7, 247)?;
                        next_coef = dc_coef_minus8 + 8;
                        sl.dc_coef[s - 2][m] = next_coef as u8;
                    }

                    let deltas = out.put_list("scaling_list_delta_coef");
                    for coef in sl.lists[s][m].iter_mut().take(coef_num) {
                        let delta: i32 = r.read_se_bounded(-128, 127)?;
                        deltas.put_int(delta);

                        next_coef = (next_coef + delta + 256) % 256;
                        *coef = next_coef as u8;
                    }
                }
            }
        }

        Ok(sl)
    }

    /// Decodes st_ref_pic_set(`st_rps_idx`). Sets predicted from another one
    /// are not supported.
    fn parse_short_term_ref_pic_set(
        r: &mut BitCursor,
        out: &mut Dict,
        st_rps_idx: u8,
    ) -> Result<ShortTermRefPicSet, ParseError> {
        let mut st = ShortTermRefPicSet::default();

        if st_rps_idx != 0 {
            st.inter_ref_pic_set_prediction_flag =
                r.flag(out, "inter_ref_pic_set_prediction_flag");
        }

        if st.inter_ref_pic_set_prediction_flag {
            return Err(ParseError::Unsupported("inter_ref_pic_set_prediction_flag"));
        }

        st.num_negative_pics = r.ue_max(out, "num_negative_pics", MAX_DPB_SIZE - 1)?;
        st.num_positive_pics = r.ue_max(
            out,
            "num_positive_pics",
            MAX_DPB_SIZE - 1 - u32::from(st.num_negative_pics),
        )?;

        let mut poc = 0;
        let negative = out.put_list("negative_pics");
        for _ in 0..st.num_negative_pics {
            let out = negative.put_dict();
            let delta_poc_s0_minus1: u32 = r.ue_max(out, "delta_poc_s0_minus1", 32767)?;
            // (7-67)
            poc -= delta_poc_s0_minus1 as i32 + 1;
            st.delta_poc_s0.push(poc);
            st.used_by_curr_pic_s0
                .push(r.flag(out, "used_by_curr_pic_s0_flag"));
        }

        let mut poc = 0;
        let positive = out.put_list("positive_pics");
        for _ in 0..st.num_positive_pics {
            let out = positive.put_dict();
            let delta_poc_s1_minus1: u32 = r.ue_max(out, "delta_poc_s1_minus1", 32767)?;
            // (7-68)
            poc += delta_poc_s1_minus1 as i32 + 1;
            st.delta_poc_s1.push(poc);
            st.used_by_curr_pic_s1
                .push(r.flag(out, "used_by_curr_pic_s1_flag"));
        }

        Ok(st)
    }

    fn parse_vui_parameters(
        r: &mut BitCursor,
        out: &mut Dict,
        max_sub_layers_minus1: u8,
    ) -> Result<VuiParams, ParseError> {
        let mut vui = VuiParams::default();

        vui.aspect_ratio_info_present_flag = r.flag(out, "aspect_ratio_info_present_flag");
        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.u(out, "aspect_ratio_idc", 8)?;
            // EXTENDED_SAR
            if vui.aspect_ratio_idc == 255 {
                vui.sar_width = r.u(out, "sar_width", 16)?;
                vui.sar_height = r.u(out, "sar_height", 16)?;
            }
        }

        vui.overscan_info_present_flag = r.flag(out, "overscan_info_present_flag");
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.flag(out, "overscan_appropriate_flag");
        }

        vui.video_signal_type_present_flag = r.flag(out, "video_signal_type_present_flag");
        if vui.video_signal_type_present_flag {
            vui.video_format = r.u(out, "video_format", 3)?;
            vui.video_full_range_flag = r.flag(out, "video_full_range_flag");
            vui.colour_description_present_flag = r.flag(out, "colour_description_present_flag");
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.u(out, "colour_primaries", 8)?;
                vui.transfer_characteristics = r.u(out, "transfer_characteristics", 8)?;
                vui.matrix_coeffs = r.u(out, "matrix_coeffs", 8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.flag(out, "chroma_loc_info_present_flag");
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field =
                r.ue_max(out, "chroma_sample_loc_type_top_field", 5)?;
            vui.chroma_sample_loc_type_bottom_field =
                r.ue_max(out, "chroma_sample_loc_type_bottom_field", 5)?;
        }

        vui.neutral_chroma_indication_flag = r.flag(out, "neutral_chroma_indication_flag");
        vui.field_seq_flag = r.flag(out, "field_seq_flag");
        vui.frame_field_info_present_flag = r.flag(out, "frame_field_info_present_flag");

        vui.default_display_window_flag = r.flag(out, "default_display_window_flag");
        if vui.default_display_window_flag {
            vui.def_disp_win_left_offset = r.ue(out, "def_disp_win_left_offset")?;
            vui.def_disp_win_right_offset = r.ue(out, "def_disp_win_right_offset")?;
            vui.def_disp_win_top_offset = r.ue(out, "def_disp_win_top_offset")?;
            vui.def_disp_win_bottom_offset = r.ue(out, "def_disp_win_bottom_offset")?;
        }

        vui.timing_info_present_flag = r.flag(out, "vui_timing_info_present_flag");
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.u(out, "vui_num_units_in_tick", 32)?;
            vui.time_scale = r.u(out, "vui_time_scale", 32)?;

            vui.poc_proportional_to_timing_flag =
                r.flag(out, "vui_poc_proportional_to_timing_flag");
            if vui.poc_proportional_to_timing_flag {
                vui.num_ticks_poc_diff_one_minus1 =
                    r.ue_max(out, "vui_num_ticks_poc_diff_one_minus1", u32::MAX - 1)?;
            }

            vui.hrd_parameters_present_flag = r.flag(out, "vui_hrd_parameters_present_flag");
            if vui.hrd_parameters_present_flag {
                vui.hrd = Self::parse_hrd_parameters(
                    r,
                    out.put_dict("hrd_parameters"),
                    true,
                    max_sub_layers_minus1,
                    Default::default(),
                )?;
            }
        }

        vui.bitstream_restriction_flag = r.flag(out, "bitstream_restriction_flag");
        if vui.bitstream_restriction_flag {
            vui.tiles_fixed_structure_flag = r.flag(out, "tiles_fixed_structure_flag");
            vui.motion_vectors_over_pic_boundaries_flag =
                r.flag(out, "motion_vectors_over_pic_boundaries_flag");
            vui.restricted_ref_pic_lists_flag = r.flag(out, "restricted_ref_pic_lists_flag");
            vui.min_spatial_segmentation_idc =
                r.ue_max(out, "min_spatial_segmentation_idc", 4095)?;
            vui.max_bytes_per_pic_denom = r.ue_max(out, "max_bytes_per_pic_denom", 16)?;
            vui.max_bits_per_min_cu_denom = r.ue_max(out, "max_bits_per_min_cu_denom", 16)?;
            vui.log2_max_mv_length_horizontal =
                r.ue_max(out, "log2_max_mv_length_horizontal", 16)?;
            vui.log2_max_mv_length_vertical = r.ue_max(out, "log2_max_mv_length_vertical", 15)?;
        }

        Ok(vui)
    }

    fn parse_sps_range_extension(
        r: &mut BitCursor,
        out: &mut Dict,
    ) -> Result<SpsRangeExtension, ParseError> {
        Ok(SpsRangeExtension {
            transform_skip_rotation_enabled_flag: r
                .flag(out, "transform_skip_rotation_enabled_flag"),
            transform_skip_context_enabled_flag: r.flag(out, "transform_skip_context_enabled_flag"),
            implicit_rdpcm_enabled_flag: r.flag(out, "implicit_rdpcm_enabled_flag"),
            explicit_rdpcm_enabled_flag: r.flag(out, "explicit_rdpcm_enabled_flag"),
            extended_precision_processing_flag: r.flag(out, "extended_precision_processing_flag"),
            intra_smoothing_disabled_flag: r.flag(out, "intra_smoothing_disabled_flag"),
            high_precision_offsets_enabled_flag: r.flag(out, "high_precision_offsets_enabled_flag"),
            persistent_rice_adaptation_enabled_flag: r
                .flag(out, "persistent_rice_adaptation_enabled_flag"),
            cabac_bypass_alignment_enabled_flag: r.flag(out, "cabac_bypass_alignment_enabled_flag"),
        })
    }

    fn parse_sps(r: &mut BitCursor, out: &mut Dict, nuh_layer_id: u8) -> Result<Sps, ParseError> {
        let mut sps = Sps {
            video_parameter_set_id: r.u(out, "sps_video_parameter_set_id", 4)?,
            ..Default::default()
        };

        if nuh_layer_id == 0 {
            sps.max_sub_layers_minus1 = r.u(out, "sps_max_sub_layers_minus1", 3)?;
        } else {
            sps.max_sub_layers_minus1 = r.u(out, "sps_ext_or_max_sub_layers_minus1", 3)?;
            if sps.max_sub_layers_minus1 == 7 {
                return Err(ParseError::Unsupported("multi-layer SPS"));
            }
        }

        check_max_sub_layers(sps.max_sub_layers_minus1)?;

        sps.temporal_id_nesting_flag = r.flag(out, "sps_temporal_id_nesting_flag");
        sps.profile_tier_level = Self::parse_profile_tier_level(
            r,
            out.put_dict("profile_tier_level"),
            true,
            sps.max_sub_layers_minus1,
        )?;

        sps.seq_parameter_set_id =
            r.ue_max(out, "sps_seq_parameter_set_id", MAX_SPS_COUNT - 1)?;
        sps.chroma_format_idc = r.ue_max(out, "chroma_format_idc", 3)?;
        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.flag(out, "separate_colour_plane_flag");
        }

        sps.chroma_array_type = if sps.separate_colour_plane_flag {
            0
        } else {
            sps.chroma_format_idc
        };
        out.put_uint("ChromaArrayType", sps.chroma_array_type);

        sps.pic_width_in_luma_samples = r.read_ue_bounded(1, MAX_PIC_DIMENSION)?;
        out.put_uint("pic_width_in_luma_samples", sps.pic_width_in_luma_samples);
        sps.pic_height_in_luma_samples = r.read_ue_bounded(1, MAX_PIC_DIMENSION)?;
        out.put_uint("pic_height_in_luma_samples", sps.pic_height_in_luma_samples);

        sps.conformance_window_flag = r.flag(out, "conformance_window_flag");
        if sps.conformance_window_flag {
            sps.conf_win_left_offset = r.ue(out, "conf_win_left_offset")?;
            sps.conf_win_right_offset = r.ue(out, "conf_win_right_offset")?;
            sps.conf_win_top_offset = r.ue(out, "conf_win_top_offset")?;
            sps.conf_win_bottom_offset = r.ue(out, "conf_win_bottom_offset")?;
        }

        sps.bit_depth_luma_minus8 = r.ue_max(out, "bit_depth_luma_minus8", 8)?;
        sps.bit_depth_chroma_minus8 = r.ue_max(out, "bit_depth_chroma_minus8", 8)?;
        sps.log2_max_pic_order_cnt_lsb_minus4 =
            r.ue_max(out, "log2_max_pic_order_cnt_lsb_minus4", 12)?;

        sps.sub_layer_ordering_info_present_flag =
            r.flag(out, "sps_sub_layer_ordering_info_present_flag");
        sps.sub_layer_ordering = Self::parse_sub_layer_ordering_info(
            r,
            out,
            "sps",
            sps.sub_layer_ordering_info_present_flag,
            sps.max_sub_layers_minus1,
        )?;

        sps.log2_min_luma_coding_block_size_minus3 =
            r.ue_max(out, "log2_min_luma_coding_block_size_minus3", 3)?;
        sps.log2_diff_max_min_luma_coding_block_size =
            r.ue_max(out, "log2_diff_max_min_luma_coding_block_size", 3)?;
        sps.log2_min_luma_transform_block_size_minus2 =
            r.ue_max(out, "log2_min_luma_transform_block_size_minus2", 3)?;
        sps.log2_diff_max_min_luma_transform_block_size =
            r.ue_max(out, "log2_diff_max_min_luma_transform_block_size", 3)?;
        sps.max_transform_hierarchy_depth_inter =
            r.ue_max(out, "max_transform_hierarchy_depth_inter", 4)?;
        sps.max_transform_hierarchy_depth_intra =
            r.ue_max(out, "max_transform_hierarchy_depth_intra", 4)?;

        sps.scaling_list_enabled_flag = r.flag(out, "scaling_list_enabled_flag");
        if sps.scaling_list_enabled_flag {
            sps.scaling_list_data_present_flag = r.flag(out, "sps_scaling_list_data_present_flag");
            sps.scaling_list = if sps.scaling_list_data_present_flag {
                Self::parse_scaling_list_data(r, out.put_dict("scaling_list_data"))?
            } else {
                ScalingLists::default_lists()
            };
        }

        sps.amp_enabled_flag = r.flag(out, "amp_enabled_flag");
        sps.sample_adaptive_offset_enabled_flag =
            r.flag(out, "sample_adaptive_offset_enabled_flag");

        sps.pcm_enabled_flag = r.flag(out, "pcm_enabled_flag");
        if sps.pcm_enabled_flag {
            sps.pcm_sample_bit_depth_luma_minus1 =
                r.u(out, "pcm_sample_bit_depth_luma_minus1", 4)?;
            sps.pcm_sample_bit_depth_chroma_minus1 =
                r.u(out, "pcm_sample_bit_depth_chroma_minus1", 4)?;
            sps.log2_min_pcm_luma_coding_block_size_minus3 =
                r.ue_max(out, "log2_min_pcm_luma_coding_block_size_minus3", 2)?;
            sps.log2_diff_max_min_pcm_luma_coding_block_size =
                r.ue_max(out, "log2_diff_max_min_pcm_luma_coding_block_size", 2)?;
            sps.pcm_loop_filter_disabled_flag = r.flag(out, "pcm_loop_filter_disabled_flag");
        }

        sps.num_short_term_ref_pic_sets =
            r.ue_max(out, "num_short_term_ref_pic_sets", MAX_SHORT_TERM_REF_PIC_SETS)?;
        let st_rps = out.put_list("st_ref_pic_set");
        for i in 0..sps.num_short_term_ref_pic_sets {
            let st = Self::parse_short_term_ref_pic_set(r, st_rps.put_dict(), i)?;
            sps.short_term_ref_pic_sets.push(st);
        }

        sps.long_term_ref_pics_present_flag = r.flag(out, "long_term_ref_pics_present_flag");
        if sps.long_term_ref_pics_present_flag {
            sps.num_long_term_ref_pics_sps =
                r.ue_max(out, "num_long_term_ref_pics_sps", MAX_LONG_TERM_REF_PICS_SPS)?;

            let lt_pics = out.put_list("long_term_ref_pics_sps");
            for _ in 0..sps.num_long_term_ref_pics_sps {
                let out = lt_pics.put_dict();
                let poc_lsb = r.u(out, "lt_ref_pic_poc_lsb_sps", sps.pic_order_cnt_lsb_bits())?;
                sps.lt_ref_pic_poc_lsb_sps.push(poc_lsb);
                sps.used_by_curr_pic_lt_sps_flag
                    .push(r.flag(out, "used_by_curr_pic_lt_sps_flag"));
            }
        }

        sps.temporal_mvp_enabled_flag = r.flag(out, "sps_temporal_mvp_enabled_flag");
        sps.strong_intra_smoothing_enabled_flag =
            r.flag(out, "strong_intra_smoothing_enabled_flag");

        sps.vui_parameters_present_flag = r.flag(out, "vui_parameters_present_flag");
        if sps.vui_parameters_present_flag {
            sps.vui_parameters = Self::parse_vui_parameters(
                r,
                out.put_dict("vui_parameters"),
                sps.max_sub_layers_minus1,
            )?;
        }

        sps.extension_present_flag = r.flag(out, "sps_extension_present_flag");
        if sps.extension_present_flag {
            sps.range_extension_flag = r.flag(out, "sps_range_extension_flag");
            sps.multilayer_extension_flag = r.flag(out, "sps_multilayer_extension_flag");
            sps.three_d_extension_flag = r.flag(out, "sps_3d_extension_flag");
            sps.scc_extension_flag = r.flag(out, "sps_scc_extension_flag");
            sps.extension_4bits = r.u(out, "sps_extension_4bits", 4)?;
        }

        if sps.range_extension_flag {
            sps.range_extension =
                Self::parse_sps_range_extension(r, out.put_dict("sps_range_extension"))?;
        }

        if sps.multilayer_extension_flag {
            sps.inter_view_mv_vert_constraint_flag = r.flag(
                out.put_dict("sps_multilayer_extension"),
                "inter_view_mv_vert_constraint_flag",
            );
        }

        if sps.three_d_extension_flag || sps.scc_extension_flag || sps.extension_4bits != 0 {
            log::debug!("Skipping the remaining SPS extensions");
        }

        sps.derive_variables();
        sps.report_derived(out);

        Ok(sps)
    }

    fn parse_pps_range_extension(
        r: &mut BitCursor,
        out: &mut Dict,
        pps: &Pps,
    ) -> Result<PpsRangeExtension, ParseError> {
        let mut ext = PpsRangeExtension::default();

        if pps.transform_skip_enabled_flag {
            ext.log2_max_transform_skip_block_size_minus2 =
                r.ue_max(out, "log2_max_transform_skip_block_size_minus2", 3)?;
        }

        ext.cross_component_prediction_enabled_flag =
            r.flag(out, "cross_component_prediction_enabled_flag");

        ext.chroma_qp_offset_list_enabled_flag =
            r.flag(out, "chroma_qp_offset_list_enabled_flag");
        if ext.chroma_qp_offset_list_enabled_flag {
            ext.diff_cu_chroma_qp_offset_depth =
                r.ue_max(out, "diff_cu_chroma_qp_offset_depth", 3)?;
            ext.chroma_qp_offset_list_len_minus1 =
                r.ue_max(out, "chroma_qp_offset_list_len_minus1", 5)?;

            let offsets = out.put_list("chroma_qp_offset_list");
            for _ in 0..=ext.chroma_qp_offset_list_len_minus1 {
                let out = offsets.put_dict();
                ext.cb_qp_offset_list
                    .push(r.se_bounded(out, "cb_qp_offset_list", -12, 12)?);
                ext.cr_qp_offset_list
                    .push(r.se_bounded(out, "cr_qp_offset_list", -12, 12)?);
            }
        }

        ext.log2_sao_offset_scale_luma = r.ue_max(out, "log2_sao_offset_scale_luma", 6)?;
        ext.log2_sao_offset_scale_chroma = r.ue_max(out, "log2_sao_offset_scale_chroma", 6)?;

        Ok(ext)
    }

    /// Derives the tile sizes in CTBs, (6-3) to (6-6).
    fn derive_tile_sizes(pps: &mut Pps, sps: &Sps) {
        let num_columns = pps.num_tile_columns_minus1 + 1;
        let num_rows = pps.num_tile_rows_minus1 + 1;
        let width = sps.pic_width_in_ctbs_y;
        let height = sps.pic_height_in_ctbs_y;

        if pps.uniform_spacing_flag {
            pps.column_widths = (0..num_columns)
                .map(|i| ((i + 1) * width) / num_columns - (i * width) / num_columns)
                .collect();
            pps.row_heights = (0..num_rows)
                .map(|j| ((j + 1) * height) / num_rows - (j * height) / num_rows)
                .collect();
        } else {
            pps.column_widths = pps.column_width_minus1.iter().map(|w| w + 1).collect();
            let used: u32 = pps.column_widths.iter().sum();
            pps.column_widths.push(width.saturating_sub(used));

            pps.row_heights = pps.row_height_minus1.iter().map(|h| h + 1).collect();
            let used: u32 = pps.row_heights.iter().sum();
            pps.row_heights.push(height.saturating_sub(used));
        }
    }

    fn parse_pps(&self, r: &mut BitCursor, out: &mut Dict) -> Result<Pps, ParseError> {
        let mut pps = Pps {
            pic_parameter_set_id: r.ue_max(out, "pps_pic_parameter_set_id", MAX_PPS_COUNT - 1)?,
            seq_parameter_set_id: r.ue_max(out, "pps_seq_parameter_set_id", MAX_SPS_COUNT - 1)?,
            ..Default::default()
        };

        let sps = self.get_sps(pps.seq_parameter_set_id);
        if sps.is_none() {
            log::warn!(
                "PPS {} refers to SPS {} which is not available",
                pps.pic_parameter_set_id,
                pps.seq_parameter_set_id
            );
        }

        pps.dependent_slice_segments_enabled_flag =
            r.flag(out, "dependent_slice_segments_enabled_flag");
        pps.output_flag_present_flag = r.flag(out, "output_flag_present_flag");
        pps.num_extra_slice_header_bits = r.u(out, "num_extra_slice_header_bits", 3)?;
        pps.sign_data_hiding_enabled_flag = r.flag(out, "sign_data_hiding_enabled_flag");
        pps.cabac_init_present_flag = r.flag(out, "cabac_init_present_flag");
        pps.num_ref_idx_l0_default_active_minus1 = r.ue_max(
            out,
            "num_ref_idx_l0_default_active_minus1",
            MAX_REF_IDX_ACTIVE - 1,
        )?;
        pps.num_ref_idx_l1_default_active_minus1 = r.ue_max(
            out,
            "num_ref_idx_l1_default_active_minus1",
            MAX_REF_IDX_ACTIVE - 1,
        )?;

        // -(26 + QpBdOffsetY) is at least -74, for a 16-bit luma.
        let min_init_qp = sps.map_or(-74, |sps| -26 - 6 * i32::from(sps.bit_depth_luma_minus8));
        pps.init_qp_minus26 = r.se_bounded(out, "init_qp_minus26", min_init_qp, 25)?;

        pps.constrained_intra_pred_flag = r.flag(out, "constrained_intra_pred_flag");
        pps.transform_skip_enabled_flag = r.flag(out, "transform_skip_enabled_flag");

        pps.cu_qp_delta_enabled_flag = r.flag(out, "cu_qp_delta_enabled_flag");
        if pps.cu_qp_delta_enabled_flag {
            let max_depth =
                sps.map_or(3, |sps| u32::from(sps.log2_diff_max_min_luma_coding_block_size));
            pps.diff_cu_qp_delta_depth = r.ue_max(out, "diff_cu_qp_delta_depth", max_depth)?;
        }

        pps.cb_qp_offset = r.se_bounded(out, "pps_cb_qp_offset", -12, 12)?;
        pps.cr_qp_offset = r.se_bounded(out, "pps_cr_qp_offset", -12, 12)?;
        pps.slice_chroma_qp_offsets_present_flag =
            r.flag(out, "pps_slice_chroma_qp_offsets_present_flag");
        pps.weighted_pred_flag = r.flag(out, "weighted_pred_flag");
        pps.weighted_bipred_flag = r.flag(out, "weighted_bipred_flag");
        pps.transquant_bypass_enabled_flag = r.flag(out, "transquant_bypass_enabled_flag");
        pps.tiles_enabled_flag = r.flag(out, "tiles_enabled_flag");
        pps.entropy_coding_sync_enabled_flag = r.flag(out, "entropy_coding_sync_enabled_flag");

        // Inferred values when tiles are disabled.
        pps.uniform_spacing_flag = true;
        pps.loop_filter_across_tiles_enabled_flag = true;

        if pps.tiles_enabled_flag {
            let max_columns = sps.map_or(MAX_CTBS_PER_DIMENSION, |sps| sps.pic_width_in_ctbs_y);
            let max_rows = sps.map_or(MAX_CTBS_PER_DIMENSION, |sps| sps.pic_height_in_ctbs_y);

            pps.num_tile_columns_minus1 = r.ue_max(out, "num_tile_columns_minus1", max_columns - 1)?;
            pps.num_tile_rows_minus1 = r.ue_max(out, "num_tile_rows_minus1", max_rows - 1)?;

            pps.uniform_spacing_flag = r.flag(out, "uniform_spacing_flag");
            if !pps.uniform_spacing_flag {
                let widths = out.put_list("column_width_minus1");
                for _ in 0..pps.num_tile_columns_minus1 {
                    let width: u32 = r.read_ue_max(max_columns - 1)?;
                    widths.put_uint(width);
                    pps.column_width_minus1.push(width);
                }

                let heights = out.put_list("row_height_minus1");
                for _ in 0..pps.num_tile_rows_minus1 {
                    let height: u32 = r.read_ue_max(max_rows - 1)?;
                    heights.put_uint(height);
                    pps.row_height_minus1.push(height);
                }
            }

            pps.loop_filter_across_tiles_enabled_flag =
                r.flag(out, "loop_filter_across_tiles_enabled_flag");

            if let Some(sps) = sps {
                Self::derive_tile_sizes(&mut pps, sps);
            }
        }

        pps.loop_filter_across_slices_enabled_flag =
            r.flag(out, "pps_loop_filter_across_slices_enabled_flag");

        pps.deblocking_filter_control_present_flag =
            r.flag(out, "deblocking_filter_control_present_flag");
        if pps.deblocking_filter_control_present_flag {
            pps.deblocking_filter_override_enabled_flag =
                r.flag(out, "deblocking_filter_override_enabled_flag");
            pps.deblocking_filter_disabled_flag =
                r.flag(out, "pps_deblocking_filter_disabled_flag");
            if !pps.deblocking_filter_disabled_flag {
                pps.beta_offset_div2 = r.se_bounded(out, "pps_beta_offset_div2", -6, 6)?;
                pps.tc_offset_div2 = r.se_bounded(out, "pps_tc_offset_div2", -6, 6)?;
            }
        }

        pps.scaling_list_data_present_flag = r.flag(out, "pps_scaling_list_data_present_flag");
        if pps.scaling_list_data_present_flag {
            pps.scaling_list = Self::parse_scaling_list_data(r, out.put_dict("scaling_list_data"))?;
        } else if let Some(sps) = sps {
            pps.scaling_list = sps.scaling_list.clone();
        }

        pps.lists_modification_present_flag = r.flag(out, "lists_modification_present_flag");
        pps.log2_parallel_merge_level_minus2 = r.ue_max(
            out,
            "log2_parallel_merge_level_minus2",
            sps.map_or(4, |sps| sps.ctb_log2_size_y - 2),
        )?;
        pps.slice_segment_header_extension_present_flag =
            r.flag(out, "slice_segment_header_extension_present_flag");

        pps.extension_present_flag = r.flag(out, "pps_extension_present_flag");
        if pps.extension_present_flag {
            pps.range_extension_flag = r.flag(out, "pps_range_extension_flag");
            pps.multilayer_extension_flag = r.flag(out, "pps_multilayer_extension_flag");
            pps.three_d_extension_flag = r.flag(out, "pps_3d_extension_flag");
            pps.scc_extension_flag = r.flag(out, "pps_scc_extension_flag");
            pps.extension_4bits = r.u(out, "pps_extension_4bits", 4)?;
        }

        if pps.range_extension_flag {
            pps.range_extension =
                Self::parse_pps_range_extension(r, out.put_dict("pps_range_extension"), &pps)?;
        }

        if pps.multilayer_extension_flag
            || pps.three_d_extension_flag
            || pps.scc_extension_flag
            || pps.extension_4bits != 0
        {
            log::debug!("Skipping the remaining PPS extensions");
        }

        Ok(pps)
    }

    fn parse_slice_header(
        &self,
        r: &mut BitCursor,
        out: &mut Dict,
        nalu_header: &NaluHeader,
    ) -> Result<SliceHeader, ParseError> {
        let first_slice_segment_in_pic_flag = r.flag(out, "first_slice_segment_in_pic_flag");

        let no_output_of_prior_pics_flag = if nalu_header.type_.is_irap() {
            r.flag(out, "no_output_of_prior_pics_flag")
        } else {
            false
        };

        let pic_parameter_set_id: u8 =
            r.ue_max(out, "slice_pic_parameter_set_id", MAX_PPS_COUNT - 1)?;

        let pps = self
            .get_pps(pic_parameter_set_id)
            .ok_or(ParseError::MissingParameterSet {
                kind: "PPS",
                id: pic_parameter_set_id,
            })?;
        let sps = self
            .get_sps(pps.seq_parameter_set_id)
            .ok_or(ParseError::MissingParameterSet {
                kind: "SPS",
                id: pps.seq_parameter_set_id,
            })?;

        let mut dependent_slice_segment_flag = false;
        let mut segment_address = 0;

        if !first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                dependent_slice_segment_flag = r.flag(out, "dependent_slice_segment_flag");
            }

            segment_address = r.u(
                out,
                "slice_segment_address",
                sps.slice_segment_address_bits(),
            )?;
            if segment_address >= sps.pic_size_in_ctbs_y {
                return Err(anyhow!("Invalid slice_segment_address {}", segment_address).into());
            }
        }

        // A dependent slice segment takes the values of the header of the
        // previous slice segment.
        let mut hdr = if dependent_slice_segment_flag {
            match &self.slice_header {
                Some(previous) if previous.pic_parameter_set_id == pic_parameter_set_id => {
                    previous.clone()
                }
                Some(previous) => {
                    return Err(anyhow!(
                        "Dependent slice segment uses PPS {} instead of PPS {}",
                        pic_parameter_set_id,
                        previous.pic_parameter_set_id
                    )
                    .into())
                }
                None => return Err(ParseError::NoPreviousSliceSegment),
            }
        } else {
            SliceHeader::with_pps_defaults(pps)
        };

        hdr.first_slice_segment_in_pic_flag = first_slice_segment_in_pic_flag;
        hdr.no_output_of_prior_pics_flag = no_output_of_prior_pics_flag;
        hdr.pic_parameter_set_id = pic_parameter_set_id;
        hdr.dependent_slice_segment_flag = dependent_slice_segment_flag;
        hdr.segment_address = segment_address;
        hdr.num_entry_point_offsets = 0;
        hdr.offset_len_minus1 = 0;
        hdr.entry_point_offset_minus1.clear();
        hdr.segment_header_extension_length = 0;
        hdr.segment_header_extension_data_byte.clear();

        if !hdr.dependent_slice_segment_flag {
            Self::parse_independent_slice_header(r, out, nalu_header, sps, pps, &mut hdr)?;
        }

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            let num_tile_columns = pps.num_tile_columns_minus1 + 1;
            let num_tile_rows = pps.num_tile_rows_minus1 + 1;
            let max_entry_points = match (
                pps.tiles_enabled_flag,
                pps.entropy_coding_sync_enabled_flag,
            ) {
                (true, false) => num_tile_columns * num_tile_rows - 1,
                (false, true) => sps.pic_height_in_ctbs_y - 1,
                _ => num_tile_columns * sps.pic_height_in_ctbs_y - 1,
            };
            hdr.num_entry_point_offsets =
                r.ue_max(out, "num_entry_point_offsets", max_entry_points)?;

            if hdr.num_entry_point_offsets > 0 {
                hdr.offset_len_minus1 = r.ue_max(out, "offset_len_minus1", 31)?;

                let num_bits = usize::from(hdr.offset_len_minus1) + 1;
                let offsets = out.put_list("entry_point_offset_minus1");
                for _ in 0..hdr.num_entry_point_offsets {
                    let offset: u32 = r.read(num_bits)?;
                    offsets.put_uint(offset);
                    hdr.entry_point_offset_minus1.push(offset);
                }
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            hdr.segment_header_extension_length =
                r.ue_max(out, "slice_segment_header_extension_length", 256)?;

            let bytes = out.put_list("slice_segment_header_extension_data_byte");
            for _ in 0..hdr.segment_header_extension_length {
                let byte: u8 = r.read(8)?;
                bytes.put_hex(byte);
                hdr.segment_header_extension_data_byte.push(byte);
            }
        }

        // byte_alignment()
        let alignment_bit_equal_to_one = r.flag(out, "alignment_bit_equal_to_one");
        if !alignment_bit_equal_to_one {
            log::warn!("alignment_bit_equal_to_one is zero");
        }

        let mut non_zero_alignment = false;
        while !r.is_byte_aligned() {
            non_zero_alignment |= r.read_bit();
        }
        if non_zero_alignment {
            log::warn!("alignment_bit_equal_to_zero is not zero");
        }

        hdr.header_bit_size = r.position();

        Ok(hdr)
    }

    /// Decodes the part of the slice segment header that is only present in
    /// independent slice segments.
    fn parse_independent_slice_header(
        r: &mut BitCursor,
        out: &mut Dict,
        nalu_header: &NaluHeader,
        sps: &Sps,
        pps: &Pps,
        hdr: &mut SliceHeader,
    ) -> Result<(), ParseError> {
        let reserved = out.put_list("slice_reserved_flag");
        for _ in 0..pps.num_extra_slice_header_bits {
            reserved.put_uint(r.read_bit());
        }

        let slice_type: u8 = r.read_ue_max(2)?;
        hdr.type_ =
            SliceType::n(slice_type).ok_or(anyhow!("Invalid slice_type {}", slice_type))?;
        out.put_enum("slice_type", hdr.type_.name(), slice_type);

        if pps.output_flag_present_flag {
            hdr.pic_output_flag = r.flag(out, "pic_output_flag");
        }

        if sps.separate_colour_plane_flag {
            hdr.colour_plane_id = r.u(out, "colour_plane_id", 2)?;
        }

        if !nalu_header.type_.is_idr() {
            hdr.pic_order_cnt_lsb =
                r.u(out, "slice_pic_order_cnt_lsb", sps.pic_order_cnt_lsb_bits())?;

            hdr.short_term_ref_pic_set_sps_flag = r.flag(out, "short_term_ref_pic_set_sps_flag");
            if !hdr.short_term_ref_pic_set_sps_flag {
                hdr.short_term_ref_pic_set = Self::parse_short_term_ref_pic_set(
                    r,
                    out.put_dict("st_ref_pic_set"),
                    sps.num_short_term_ref_pic_sets,
                )?;
            } else if sps.num_short_term_ref_pic_sets > 1 {
                let num_bits = ceil_log2(u32::from(sps.num_short_term_ref_pic_sets));
                hdr.short_term_ref_pic_set_idx = r.u(out, "short_term_ref_pic_set_idx", num_bits)?;
            }

            if sps.long_term_ref_pics_present_flag {
                Self::parse_long_term_pics(r, out, sps, hdr)?;
            }

            if sps.temporal_mvp_enabled_flag {
                hdr.temporal_mvp_enabled_flag = r.flag(out, "slice_temporal_mvp_enabled_flag");
            }

            // (7-55)
            let st_rps = if hdr.short_term_ref_pic_set_sps_flag {
                sps.short_term_ref_pic_sets
                    .get(usize::from(hdr.short_term_ref_pic_set_idx))
                    .ok_or(anyhow!(
                        "Invalid short_term_ref_pic_set_idx {}",
                        hdr.short_term_ref_pic_set_idx
                    ))?
            } else {
                &hdr.short_term_ref_pic_set
            };
            hdr.num_pic_total_curr = st_rps.num_used_by_curr()
                + hdr.used_by_curr_pic_lt.iter().filter(|used| **used).count() as u32;
            out.put_uint("NumPicTotalCurr", hdr.num_pic_total_curr);
        }

        if sps.sample_adaptive_offset_enabled_flag {
            hdr.sao_luma_flag = r.flag(out, "slice_sao_luma_flag");
            if sps.chroma_array_type != 0 {
                hdr.sao_chroma_flag = r.flag(out, "slice_sao_chroma_flag");
            }
        }

        if !hdr.type_.is_i() {
            hdr.num_ref_idx_active_override_flag = r.flag(out, "num_ref_idx_active_override_flag");
            if hdr.num_ref_idx_active_override_flag {
                hdr.num_ref_idx_l0_active_minus1 = r.ue_max(
                    out,
                    "num_ref_idx_l0_active_minus1",
                    MAX_REF_IDX_ACTIVE - 1,
                )?;
                if hdr.type_.is_b() {
                    hdr.num_ref_idx_l1_active_minus1 = r.ue_max(
                        out,
                        "num_ref_idx_l1_active_minus1",
                        MAX_REF_IDX_ACTIVE - 1,
                    )?;
                }
            }

            if pps.lists_modification_present_flag && hdr.num_pic_total_curr > 1 {
                return Err(ParseError::Unsupported("ref_pic_lists_modification"));
            }

            if hdr.type_.is_b() {
                hdr.mvd_l1_zero_flag = r.flag(out, "mvd_l1_zero_flag");
            }

            if pps.cabac_init_present_flag {
                hdr.cabac_init_flag = r.flag(out, "cabac_init_flag");
            }

            if hdr.temporal_mvp_enabled_flag {
                if hdr.type_.is_b() {
                    hdr.collocated_from_l0_flag = r.flag(out, "collocated_from_l0_flag");
                }

                let max_ref_idx = if hdr.collocated_from_l0_flag {
                    hdr.num_ref_idx_l0_active_minus1
                } else {
                    hdr.num_ref_idx_l1_active_minus1
                };
                if max_ref_idx > 0 {
                    hdr.collocated_ref_idx =
                        r.ue_max(out, "collocated_ref_idx", u32::from(max_ref_idx))?;
                }
            }

            if (pps.weighted_pred_flag && hdr.type_.is_p())
                || (pps.weighted_bipred_flag && hdr.type_.is_b())
            {
                return Err(ParseError::Unsupported("pred_weight_table"));
            }

            hdr.five_minus_max_num_merge_cand = r.ue_max(out, "five_minus_max_num_merge_cand", 4)?;
        }

        hdr.qp_delta = r.se(out, "slice_qp_delta")?;

        if pps.slice_chroma_qp_offsets_present_flag {
            hdr.cb_qp_offset = r.se_bounded(out, "slice_cb_qp_offset", -12, 12)?;
            hdr.cr_qp_offset = r.se_bounded(out, "slice_cr_qp_offset", -12, 12)?;
        }

        if pps.range_extension.chroma_qp_offset_list_enabled_flag {
            hdr.cu_chroma_qp_offset_enabled_flag =
                r.flag(out, "cu_chroma_qp_offset_enabled_flag");
        }

        if pps.deblocking_filter_override_enabled_flag {
            hdr.deblocking_filter_override_flag = r.flag(out, "deblocking_filter_override_flag");
        }

        if hdr.deblocking_filter_override_flag {
            hdr.deblocking_filter_disabled_flag =
                r.flag(out, "slice_deblocking_filter_disabled_flag");
            if !hdr.deblocking_filter_disabled_flag {
                hdr.beta_offset_div2 = r.se_bounded(out, "slice_beta_offset_div2", -6, 6)?;
                hdr.tc_offset_div2 = r.se_bounded(out, "slice_tc_offset_div2", -6, 6)?;
            }
        }

        if pps.loop_filter_across_slices_enabled_flag
            && (hdr.sao_luma_flag || hdr.sao_chroma_flag || !hdr.deblocking_filter_disabled_flag)
        {
            hdr.loop_filter_across_slices_enabled_flag =
                r.flag(out, "slice_loop_filter_across_slices_enabled_flag");
        }

        Ok(())
    }

    fn parse_long_term_pics(
        r: &mut BitCursor,
        out: &mut Dict,
        sps: &Sps,
        hdr: &mut SliceHeader,
    ) -> Result<(), ParseError> {
        if sps.num_long_term_ref_pics_sps > 0 {
            hdr.num_long_term_sps = r.ue_max(
                out,
                "num_long_term_sps",
                u32::from(sps.num_long_term_ref_pics_sps),
            )?;
        }

        hdr.num_long_term_pics = r.ue_max(out, "num_long_term_pics", MAX_DPB_SIZE)?;

        let num_long_term = u32::from(hdr.num_long_term_sps) + u32::from(hdr.num_long_term_pics);
        let lt_pics = out.put_list("long_term_pics");
        for i in 0..num_long_term {
            let out = lt_pics.put_dict();

            if i < u32::from(hdr.num_long_term_sps) {
                let lt_idx_sps: u8 = if sps.num_long_term_ref_pics_sps > 1 {
                    let num_bits = ceil_log2(u32::from(sps.num_long_term_ref_pics_sps));
                    r.u(out, "lt_idx_sps", num_bits)?
                } else {
                    0
                };

                let idx = usize::from(lt_idx_sps);
                let poc_lsb = *sps
                    .lt_ref_pic_poc_lsb_sps
                    .get(idx)
                    .ok_or(anyhow!("Invalid lt_idx_sps {}", lt_idx_sps))?;

                hdr.lt_idx_sps.push(lt_idx_sps);
                hdr.poc_lsb_lt.push(poc_lsb);
                hdr.used_by_curr_pic_lt
                    .push(sps.used_by_curr_pic_lt_sps_flag[idx]);
            } else {
                hdr.poc_lsb_lt
                    .push(r.u(out, "poc_lsb_lt", sps.pic_order_cnt_lsb_bits())?);
                hdr.used_by_curr_pic_lt
                    .push(r.flag(out, "used_by_curr_pic_lt_flag"));
            }

            let delta_poc_msb_present_flag = r.flag(out, "delta_poc_msb_present_flag");
            hdr.delta_poc_msb_present_flag
                .push(delta_poc_msb_present_flag);
            hdr.delta_poc_msb_cycle_lt.push(if delta_poc_msb_present_flag {
                r.ue_max(out, "delta_poc_msb_cycle_lt", u32::MAX - 1)?
            } else {
                0
            });
        }

        Ok(())
    }
}
