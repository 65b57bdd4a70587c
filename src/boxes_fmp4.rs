//! Fragmented MP4 (fMP4) 関連のボックス定義
//!
//! このモジュールは内部的なもので、構造体などの外部への提供は boxes モジュールを通して行う
use crate::{
    BaseBox, BoxType, Decode, Encode, FullBox, FullBoxFlags, Result,
    basic_types::as_box_object,
    boxes::{SampleFlags, SbgpBox, SgpdBox, UnknownBox, check_mandatory_box},
    codec::{ByteReader, decode_box, decode_full_box, encode_box, encode_full_box},
};

/// `present` が真の場合だけ値を読み込む
fn get_if<T: Decode>(r: &mut ByteReader<'_>, present: bool) -> Result<Option<T>> {
    present.then(|| r.get()).transpose()
}

/// 立っているフラグのマスクを合成する
fn compose_flags<const N: usize>(flags: [(u32, bool); N]) -> FullBoxFlags {
    FullBoxFlags::new(
        flags
            .into_iter()
            .filter(|(_, set)| *set)
            .fold(0, |acc, (mask, _)| acc | mask),
    )
}

/// [ISO/IEC 14496-12] MovieFragmentBox class
///
/// fMP4 のメディアセグメントはこのボックスと直後の `mdat` ボックスの組で構成される
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MoofBox {
    pub mfhd_box: MfhdBox,
    pub traf_boxes: Vec<TrafBox>,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl MoofBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"moof");
}

impl Encode for MoofBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.mfhd_box)?;
            for b in &self.traf_boxes {
                w.put(b)?;
            }
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for MoofBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut mfhd_box = None;
            let mut traf_boxes = Vec::new();
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    MfhdBox::TYPE if mfhd_box.is_none() => mfhd_box = Some(r.get()?),
                    TrafBox::TYPE => traf_boxes.push(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                mfhd_box: check_mandatory_box(mfhd_box, "mfhd", "moof")?,
                traf_boxes,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for MoofBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::once(&self.mfhd_box as &dyn BaseBox)
                .chain(self.traf_boxes.iter().map(as_box_object))
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] MovieFragmentHeaderBox class (親: [`MoofBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MfhdBox {
    /// 1 始まりで、フラグメントごとに一つずつ増える番号
    pub sequence_number: u32,
}

impl MfhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mfhd");
}

impl Encode for MfhdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| w.put(&self.sequence_number))
    }
}

impl Decode for MfhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |_, r| {
            Ok(Self {
                sequence_number: r.get()?,
            })
        })
    }
}

impl BaseBox for MfhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for MfhdBox {}

/// [ISO/IEC 14496-12] TrackFragmentBox class (親: [`MoofBox`])
///
/// `sbgp_boxes` の各エントリーは [`SampleGroupContext::Fragment`](crate::boxes::SampleGroupContext::Fragment)
/// の文脈で解釈され、同じ traf 内の `sgpd_boxes` を参照する。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TrafBox {
    pub tfhd_box: TfhdBox,
    pub tfdt_box: Option<TfdtBox>,
    pub trun_boxes: Vec<TrunBox>,
    pub sgpd_boxes: Vec<SgpdBox>,
    pub sbgp_boxes: Vec<SbgpBox>,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl TrafBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"traf");
}

impl Encode for TrafBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.tfhd_box)?;
            w.put(&self.tfdt_box)?;
            for b in &self.trun_boxes {
                w.put(b)?;
            }
            for b in &self.sgpd_boxes {
                w.put(b)?;
            }
            for b in &self.sbgp_boxes {
                w.put(b)?;
            }
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for TrafBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut tfhd_box = None;
            let mut tfdt_box = None;
            let mut trun_boxes = Vec::new();
            let mut sgpd_boxes = Vec::new();
            let mut sbgp_boxes = Vec::new();
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    TfhdBox::TYPE if tfhd_box.is_none() => tfhd_box = Some(r.get()?),
                    TfdtBox::TYPE if tfdt_box.is_none() => tfdt_box = Some(r.get()?),
                    TrunBox::TYPE => trun_boxes.push(r.get()?),
                    SgpdBox::TYPE => sgpd_boxes.push(r.get()?),
                    SbgpBox::TYPE => {
                        sbgp_boxes.push(r.get::<SbgpBox>()?.into_fragment_context()?);
                    }
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                tfhd_box: check_mandatory_box(tfhd_box, "tfhd", "traf")?,
                tfdt_box,
                trun_boxes,
                sgpd_boxes,
                sbgp_boxes,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for TrafBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::once(&self.tfhd_box as &dyn BaseBox)
                .chain(self.tfdt_box.iter().map(as_box_object))
                .chain(self.trun_boxes.iter().map(as_box_object))
                .chain(self.sgpd_boxes.iter().map(as_box_object))
                .chain(self.sbgp_boxes.iter().map(as_box_object))
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] TrackFragmentHeaderBox class (親: [`TrafBox`])
///
/// [`None`] のフィールドは書き込まれず、対応する flags のビットも立たない
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TfhdBox {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<SampleFlags>,
    pub duration_is_empty: bool,
    pub default_base_is_moof: bool,
}

impl TfhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"tfhd");

    /// `base-data-offset-present`
    pub const FLAG_BASE_DATA_OFFSET_PRESENT: u32 = 0x000001;

    /// `sample-description-index-present`
    pub const FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT: u32 = 0x000002;

    /// `default-sample-duration-present`
    pub const FLAG_DEFAULT_SAMPLE_DURATION_PRESENT: u32 = 0x000008;

    /// `default-sample-size-present`
    pub const FLAG_DEFAULT_SAMPLE_SIZE_PRESENT: u32 = 0x000010;

    /// `default-sample-flags-present`
    pub const FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT: u32 = 0x000020;

    /// `duration-is-empty`
    pub const FLAG_DURATION_IS_EMPTY: u32 = 0x010000;

    /// `default-base-is-moof`
    pub const FLAG_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;
}

impl Encode for TfhdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| {
            w.put(&self.track_id)?;
            w.put(&self.base_data_offset)?;
            w.put(&self.sample_description_index)?;
            w.put(&self.default_sample_duration)?;
            w.put(&self.default_sample_size)?;
            w.put(&self.default_sample_flags)
        })
    }
}

impl Decode for TfhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let has = |mask: u32| header.flags.get() & mask != 0;
            Ok(Self {
                track_id: r.get()?,
                base_data_offset: get_if(r, has(Self::FLAG_BASE_DATA_OFFSET_PRESENT))?,
                sample_description_index: get_if(
                    r,
                    has(Self::FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT),
                )?,
                default_sample_duration: get_if(r, has(Self::FLAG_DEFAULT_SAMPLE_DURATION_PRESENT))?,
                default_sample_size: get_if(r, has(Self::FLAG_DEFAULT_SAMPLE_SIZE_PRESENT))?,
                default_sample_flags: get_if(r, has(Self::FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT))?,
                duration_is_empty: has(Self::FLAG_DURATION_IS_EMPTY),
                default_base_is_moof: has(Self::FLAG_DEFAULT_BASE_IS_MOOF),
            })
        })
    }
}

impl BaseBox for TfhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for TfhdBox {
    fn full_box_flags(&self) -> FullBoxFlags {
        compose_flags([
            (
                Self::FLAG_BASE_DATA_OFFSET_PRESENT,
                self.base_data_offset.is_some(),
            ),
            (
                Self::FLAG_SAMPLE_DESCRIPTION_INDEX_PRESENT,
                self.sample_description_index.is_some(),
            ),
            (
                Self::FLAG_DEFAULT_SAMPLE_DURATION_PRESENT,
                self.default_sample_duration.is_some(),
            ),
            (
                Self::FLAG_DEFAULT_SAMPLE_SIZE_PRESENT,
                self.default_sample_size.is_some(),
            ),
            (
                Self::FLAG_DEFAULT_SAMPLE_FLAGS_PRESENT,
                self.default_sample_flags.is_some(),
            ),
            (Self::FLAG_DURATION_IS_EMPTY, self.duration_is_empty),
            (Self::FLAG_DEFAULT_BASE_IS_MOOF, self.default_base_is_moof),
        ])
    }
}

/// [ISO/IEC 14496-12] TrackFragmentBaseMediaDecodeTimeBox class (親: [`TrafBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TfdtBox {
    /// 書き込み時の version
    ///
    /// 値が 32 bit に収まらない場合は、ここでの指定に関わらず 1 になる
    pub version: u8,

    /// フラグメント先頭サンプルの復号時刻（メディアのタイムスケール）
    pub base_media_decode_time: u64,
}

impl TfdtBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"tfdt");
}

impl Encode for TfdtBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let version = self.full_box_version();
        encode_full_box(buf, self, |w| match version {
            1 => w.put(&self.base_media_decode_time),
            _ => w.put(&(self.base_media_decode_time as u32)),
        })
    }
}

impl Decode for TfdtBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let base_media_decode_time = match header.version {
                1 => r.get()?,
                _ => r.get::<u32>()?.into(),
            };
            Ok(Self {
                version: header.version,
                base_media_decode_time,
            })
        })
    }
}

impl BaseBox for TfdtBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for TfdtBox {
    fn full_box_version(&self) -> u8 {
        if self.base_media_decode_time > u32::MAX as u64 {
            1
        } else {
            self.version
        }
    }
}

/// [ISO/IEC 14496-12] TrackRunBox class (親: [`TrafBox`])
///
/// サンプルごとのフィールドの有無は先頭サンプルに合わせる
/// （先頭で [`Some`] のフィールドが、後続のサンプルで [`None`] の場合は 0 が書き込まれる）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TrunBox {
    /// `moof` 先頭（あるいは `tfhd` の base_data_offset）からサンプルデータまでのオフセット
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<SampleFlags>,
    pub samples: Vec<TrunSample>,
}

impl TrunBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"trun");

    /// `data-offset-present`
    pub const FLAG_DATA_OFFSET_PRESENT: u32 = 0x000001;

    /// `first-sample-flags-present`
    pub const FLAG_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0x000004;

    /// `sample-duration-present`
    pub const FLAG_SAMPLE_DURATION_PRESENT: u32 = 0x000100;

    /// `sample-size-present`
    pub const FLAG_SAMPLE_SIZE_PRESENT: u32 = 0x000200;

    /// `sample-flags-present`
    pub const FLAG_SAMPLE_FLAGS_PRESENT: u32 = 0x000400;

    /// `sample-composition-time-offsets-present`
    pub const FLAG_SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT: u32 = 0x000800;
}

impl Encode for TrunBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let flags = self.full_box_flags().get();
        let has = |mask: u32| flags & mask != 0;
        encode_full_box(buf, self, |w| {
            w.put(&(self.samples.len() as u32))?;
            w.put(&self.data_offset)?;
            w.put(&self.first_sample_flags)?;
            for sample in &self.samples {
                if has(Self::FLAG_SAMPLE_DURATION_PRESENT) {
                    w.put(&sample.duration.unwrap_or(0))?;
                }
                if has(Self::FLAG_SAMPLE_SIZE_PRESENT) {
                    w.put(&sample.size.unwrap_or(0))?;
                }
                if has(Self::FLAG_SAMPLE_FLAGS_PRESENT) {
                    w.put(&sample.flags.unwrap_or(SampleFlags::empty()))?;
                }
                if has(Self::FLAG_SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT) {
                    // version 0 では符号なしだが、その場合は負の値を含まないのでビット列は同じになる
                    w.put(&sample.composition_time_offset.unwrap_or(0))?;
                }
            }
            Ok(())
        })
    }
}

impl Decode for TrunBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let has = |mask: u32| header.flags.get() & mask != 0;
            let sample_count: u32 = r.get()?;
            let data_offset = get_if(r, has(Self::FLAG_DATA_OFFSET_PRESENT))?;
            let first_sample_flags = get_if(r, has(Self::FLAG_FIRST_SAMPLE_FLAGS_PRESENT))?;

            let mut samples = Vec::new();
            for _ in 0..sample_count {
                samples.push(TrunSample {
                    duration: get_if(r, has(Self::FLAG_SAMPLE_DURATION_PRESENT))?,
                    size: get_if(r, has(Self::FLAG_SAMPLE_SIZE_PRESENT))?,
                    flags: get_if(r, has(Self::FLAG_SAMPLE_FLAGS_PRESENT))?,
                    composition_time_offset: get_if(
                        r,
                        has(Self::FLAG_SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT),
                    )?,
                });
            }
            Ok(Self {
                data_offset,
                first_sample_flags,
                samples,
            })
        })
    }
}

impl BaseBox for TrunBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for TrunBox {
    fn full_box_version(&self) -> u8 {
        self.samples
            .iter()
            .any(|s| s.composition_time_offset.is_some_and(|o| o < 0)) as u8
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        let first = self.samples.first();
        let sample_has = |f: fn(&TrunSample) -> bool| first.is_some_and(f);
        compose_flags([
            (Self::FLAG_DATA_OFFSET_PRESENT, self.data_offset.is_some()),
            (
                Self::FLAG_FIRST_SAMPLE_FLAGS_PRESENT,
                self.first_sample_flags.is_some(),
            ),
            (
                Self::FLAG_SAMPLE_DURATION_PRESENT,
                sample_has(|s| s.duration.is_some()),
            ),
            (
                Self::FLAG_SAMPLE_SIZE_PRESENT,
                sample_has(|s| s.size.is_some()),
            ),
            (
                Self::FLAG_SAMPLE_FLAGS_PRESENT,
                sample_has(|s| s.flags.is_some()),
            ),
            (
                Self::FLAG_SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT,
                sample_has(|s| s.composition_time_offset.is_some()),
            ),
        ])
    }
}

/// [`TrunBox`] のサンプルごとの値（[`None`] なら `tfhd` / `trex` の既定値が使われる）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TrunSample {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<SampleFlags>,
    pub composition_time_offset: Option<i32>,
}

/// [ISO/IEC 14496-12] MovieFragmentRandomAccessBox class
///
/// ファイル末尾に置かれ、トラックごとのランダムアクセスポイントを保持する
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MfraBox {
    pub tfra_boxes: Vec<TfraBox>,
    pub mfro_box: MfroBox,
}

impl MfraBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mfra");
}

impl Encode for MfraBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            for b in &self.tfra_boxes {
                w.put(b)?;
            }
            w.put(&self.mfro_box)
        })
    }
}

impl Decode for MfraBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut tfra_boxes = Vec::new();
            let mut mfro_box = None;
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    TfraBox::TYPE => tfra_boxes.push(r.get()?),
                    MfroBox::TYPE => mfro_box = Some(r.get()?),
                    // 保持はしない
                    _ => {
                        r.get::<UnknownBox>()?;
                    }
                }
            }
            Ok(Self {
                tfra_boxes,
                mfro_box: check_mandatory_box(mfro_box, "mfro", "mfra")?,
            })
        })
    }
}

impl BaseBox for MfraBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            self.tfra_boxes
                .iter()
                .map(as_box_object)
                .chain(std::iter::once(&self.mfro_box as &dyn BaseBox)),
        )
    }
}

/// [ISO/IEC 14496-12] TrackFragmentRandomAccessBox class (親: [`MfraBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TfraBox {
    /// 書き込み時の version（64 bit が必要な値がある場合は常に 1）
    pub version: u8,
    pub track_id: u32,

    /// traf_number のバイト数から 1 を引いた値（0..=3）
    pub length_size_of_traf_num: u8,

    /// trun_number のバイト数から 1 を引いた値（0..=3）
    pub length_size_of_trun_num: u8,

    /// sample_number のバイト数から 1 を引いた値（0..=3）
    pub length_size_of_sample_num: u8,

    pub entries: Vec<TfraEntry>,
}

impl TfraBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"tfra");

    fn number_sizes(&self) -> [usize; 3] {
        [
            self.length_size_of_traf_num,
            self.length_size_of_trun_num,
            self.length_size_of_sample_num,
        ]
        .map(|n| (n & 0b11) as usize + 1)
    }
}

impl Encode for TfraBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let version = self.full_box_version();
        let sizes = self.number_sizes();
        encode_full_box(buf, self, |w| {
            w.put(&self.track_id)?;
            let packed = sizes
                .iter()
                .fold(0u32, |acc, n| (acc << 2) | (*n as u32 - 1));
            w.put(&packed)?;
            w.put(&(self.entries.len() as u32))?;
            for entry in &self.entries {
                match version {
                    1 => {
                        w.put(&entry.time)?;
                        w.put(&entry.moof_offset)?;
                    }
                    _ => {
                        w.put(&(entry.time as u32))?;
                        w.put(&(entry.moof_offset as u32))?;
                    }
                }
                let numbers = [entry.traf_number, entry.trun_number, entry.sample_number];
                for (number, size) in numbers.into_iter().zip(sizes) {
                    w.put(&number.to_be_bytes()[4 - size..])?;
                }
            }
            Ok(())
        })
    }
}

impl Decode for TfraBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let track_id = r.get()?;
            let packed: u32 = r.get()?;
            let [traf, trun, sample] = [4, 2, 0].map(|shift| ((packed >> shift) & 0b11) as u8);
            let sizes = [traf, trun, sample].map(|n| n as usize + 1);

            let entry_count: u32 = r.get()?;
            let mut entries = Vec::new();
            for _ in 0..entry_count {
                let (time, moof_offset) = match header.version {
                    1 => (r.get()?, r.get()?),
                    _ => (r.get::<u32>()?.into(), r.get::<u32>()?.into()),
                };
                let mut numbers = [0u32; 3];
                for (number, size) in numbers.iter_mut().zip(sizes) {
                    *number = r
                        .take(size)?
                        .iter()
                        .fold(0, |acc, b| (acc << 8) | *b as u32);
                }
                let [traf_number, trun_number, sample_number] = numbers;
                entries.push(TfraEntry {
                    time,
                    moof_offset,
                    traf_number,
                    trun_number,
                    sample_number,
                });
            }
            Ok(Self {
                version: header.version,
                track_id,
                length_size_of_traf_num: traf,
                length_size_of_trun_num: trun,
                length_size_of_sample_num: sample,
                entries,
            })
        })
    }
}

impl BaseBox for TfraBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for TfraBox {
    fn full_box_version(&self) -> u8 {
        let limit = u32::MAX as u64;
        if self
            .entries
            .iter()
            .any(|e| e.time > limit || e.moof_offset > limit)
        {
            1
        } else {
            self.version
        }
    }
}

/// [`TfraBox`] のランダムアクセスポイント
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TfraEntry {
    /// 同期サンプルの表示時刻（メディアのタイムスケール）
    pub time: u64,

    /// ファイル先頭から `moof` までのオフセット
    pub moof_offset: u64,

    /// 以下は全て 1 始まり
    pub traf_number: u32,
    pub trun_number: u32,
    pub sample_number: u32,
}

/// [ISO/IEC 14496-12] MovieFragmentRandomAccessOffsetBox class (親: [`MfraBox`])
///
/// ファイル末尾から `mfra` を探すために使う
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MfroBox {
    /// 親の `mfra` ボックス全体のサイズ
    pub size: u32,
}

impl MfroBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mfro");
}

impl Encode for MfroBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| w.put(&self.size))
    }
}

impl Decode for MfroBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |_, r| Ok(Self { size: r.get()? }))
    }
}

impl BaseBox for MfroBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for MfroBox {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn sample(composition_time_offset: Option<i32>) -> TrunSample {
        TrunSample {
            duration: Some(10),
            size: Some(100),
            flags: None,
            composition_time_offset,
        }
    }

    #[test]
    fn trun_fields_follow_first_sample() -> Result<()> {
        let trun = TrunBox {
            data_offset: Some(8),
            first_sample_flags: None,
            samples: vec![sample(Some(-5)), sample(Some(20))],
        };
        let bytes = trun.encode_to_vec()?;
        // version 1, flags = data-offset | duration | size | cts-offset
        assert_eq!(&bytes[8..12], &[1, 0x00, 0x0b, 0x01]);
        assert_eq!(TrunBox::decode(&bytes)?.0, trun);
        Ok(())
    }

    #[test]
    fn tfhd_optional_fields() -> Result<()> {
        let tfhd = TfhdBox {
            track_id: 1,
            base_data_offset: None,
            sample_description_index: Some(1),
            default_sample_duration: None,
            default_sample_size: None,
            default_sample_flags: Some(SampleFlags::new(0x0101_0000)),
            duration_is_empty: false,
            default_base_is_moof: true,
        };
        let bytes = tfhd.encode_to_vec()?;
        assert_eq!(bytes.len(), 8 + 4 + 4 + 4 + 4);
        assert_eq!(&bytes[9..12], &[0x02, 0x00, 0x22]);
        assert_eq!(TfhdBox::decode(&bytes)?.0, tfhd);
        Ok(())
    }

    #[test]
    fn tfra_variable_length_numbers() -> Result<()> {
        let tfra = TfraBox {
            version: 0,
            track_id: 2,
            length_size_of_traf_num: 0,
            length_size_of_trun_num: 1,
            length_size_of_sample_num: 2,
            entries: vec![TfraEntry {
                time: 300,
                moof_offset: 1024,
                traf_number: 1,
                trun_number: 0x0203,
                sample_number: 0x040506,
            }],
        };
        let bytes = tfra.encode_to_vec()?;
        assert_eq!(bytes.len(), 8 + 4 + 4 + 4 + 4 + 8 + 1 + 2 + 3);
        assert_eq!(&bytes[bytes.len() - 6..], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(TfraBox::decode(&bytes)?.0, tfra);
        Ok(())
    }

    #[test]
    fn mfra_requires_mfro() -> Result<()> {
        let bytes = [0, 0, 0, 8, b'm', b'f', b'r', b'a'];
        let e = MfraBox::decode(&bytes).err().ok_or(Error::invalid_input("decoded"))?;
        assert_eq!(e.box_type, Some(MfraBox::TYPE));
        Ok(())
    }
}
