//! `moov` 配下のボックス群
//!
//! 外部からは boxes モジュール経由で参照する
use std::num::NonZeroU32;

use crate::{
    BaseBox, BoxType, Decode, Either, Encode, Error, FixedPointNumber, FullBox, FullBoxFlags,
    Mp4FileTime, Result, Utf8String,
    basic_types::as_box_object,
    boxes::{SampleEntry, SampleFlags, SbgpBox, SdtpBox, SgpdBox, UnknownBox, check_mandatory_box},
    codec::{ByteReader, ByteWriter, decode_box, decode_full_box, encode_box, encode_full_box},
};

/// 単位行列（`mvhd` / `tkhd` の matrix フィールドの既定値）
const UNITY_MATRIX: [i32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

/// 作成時刻・更新時刻・尺のいずれかが 32 bit に収まらない場合は version 1 を使う
fn header_version(creation: Mp4FileTime, modification: Mp4FileTime, duration: u64) -> u8 {
    let limit = u32::MAX as u64;
    (creation.as_secs() > limit || modification.as_secs() > limit || duration > limit) as u8
}

/// version に応じて 32 bit か 64 bit で書き込む
fn put_versioned(w: &mut ByteWriter<'_>, version: u8, v: u64) -> Result<()> {
    match version {
        1 => w.put(&v),
        _ => w.put(&(v as u32)),
    }
}

/// [`put_versioned()`] の逆
fn get_versioned(r: &mut ByteReader<'_>, version: u8) -> Result<u64> {
    match version {
        1 => r.get(),
        _ => r.get::<u32>().map(u64::from),
    }
}

fn get_time(r: &mut ByteReader<'_>, version: u8) -> Result<Mp4FileTime> {
    get_versioned(r, version).map(Mp4FileTime::from_secs)
}

/// [ISO/IEC 14496-12] MovieBox class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MoovBox {
    pub mvhd_box: MvhdBox,
    pub trak_boxes: Vec<TrakBox>,
    pub mvex_box: Option<MvexBox>,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl MoovBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"moov");
}

impl Encode for MoovBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.mvhd_box)?;
            for b in &self.trak_boxes {
                w.put(b)?;
            }
            w.put(&self.mvex_box)?;
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for MoovBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut mvhd_box = None;
            let mut trak_boxes = Vec::new();
            let mut mvex_box = None;
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    MvhdBox::TYPE if mvhd_box.is_none() => mvhd_box = Some(r.get()?),
                    TrakBox::TYPE => trak_boxes.push(r.get()?),
                    MvexBox::TYPE if mvex_box.is_none() => mvex_box = Some(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                mvhd_box: check_mandatory_box(mvhd_box, "mvhd", "moov")?,
                trak_boxes,
                mvex_box,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for MoovBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::once(&self.mvhd_box as &dyn BaseBox)
                .chain(self.trak_boxes.iter().map(as_box_object))
                .chain(self.mvex_box.iter().map(as_box_object))
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] MovieHeaderBox class (親: [`MoovBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MvhdBox {
    pub creation_time: Mp4FileTime,
    pub modification_time: Mp4FileTime,
    pub timescale: NonZeroU32,
    pub duration: u64,
    pub rate: FixedPointNumber<i16, u16>,
    pub volume: FixedPointNumber<i8, u8>,
    pub matrix: [i32; 9],
    pub next_track_id: u32,
}

impl MvhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mvhd");

    /// 等倍速
    pub const DEFAULT_RATE: FixedPointNumber<i16, u16> = FixedPointNumber::new(1, 0);

    /// 最大音量
    pub const DEFAULT_VOLUME: FixedPointNumber<i8, u8> = FixedPointNumber::new(1, 0);

    /// 単位行列
    pub const DEFAULT_MATRIX: [i32; 9] = UNITY_MATRIX;
}

impl Encode for MvhdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let version = self.full_box_version();
        encode_full_box(buf, self, |w| {
            put_versioned(w, version, self.creation_time.as_secs())?;
            put_versioned(w, version, self.modification_time.as_secs())?;
            w.put(&self.timescale)?;
            put_versioned(w, version, self.duration)?;
            w.put(&self.rate)?;
            w.put(&self.volume)?;
            w.put(&[0u8; 10])?;
            w.put(&self.matrix)?;
            w.put(&[0u8; 24])?;
            w.put(&self.next_track_id)
        })
    }
}

impl Decode for MvhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let creation_time = get_time(r, header.version)?;
            let modification_time = get_time(r, header.version)?;
            let timescale = r.get()?;
            let duration = get_versioned(r, header.version)?;
            let rate = r.get()?;
            let volume = r.get()?;
            r.take(10)?;
            let matrix = r.get()?;
            r.take(24)?;
            let next_track_id = r.get()?;
            Ok(Self {
                creation_time,
                modification_time,
                timescale,
                duration,
                rate,
                volume,
                matrix,
                next_track_id,
            })
        })
    }
}

impl BaseBox for MvhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for MvhdBox {
    fn full_box_version(&self) -> u8 {
        header_version(self.creation_time, self.modification_time, self.duration)
    }
}

/// [ISO/IEC 14496-12] TrackBox class (親: [`MoovBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TrakBox {
    pub tkhd_box: TkhdBox,
    pub edts_box: Option<EdtsBox>,
    pub mdia_box: MdiaBox,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl TrakBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"trak");
}

impl Encode for TrakBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.tkhd_box)?;
            w.put(&self.edts_box)?;
            w.put(&self.mdia_box)?;
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for TrakBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut tkhd_box = None;
            let mut edts_box = None;
            let mut mdia_box = None;
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    TkhdBox::TYPE if tkhd_box.is_none() => tkhd_box = Some(r.get()?),
                    EdtsBox::TYPE if edts_box.is_none() => edts_box = Some(r.get()?),
                    MdiaBox::TYPE if mdia_box.is_none() => mdia_box = Some(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                tkhd_box: check_mandatory_box(tkhd_box, "tkhd", "trak")?,
                edts_box,
                mdia_box: check_mandatory_box(mdia_box, "mdia", "trak")?,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for TrakBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::once(&self.tkhd_box as &dyn BaseBox)
                .chain(self.edts_box.iter().map(as_box_object))
                .chain(std::iter::once(&self.mdia_box as &dyn BaseBox))
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] TrackHeaderBox class (親: [`TrakBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TkhdBox {
    pub flag_track_enabled: bool,
    pub flag_track_in_movie: bool,
    pub flag_track_in_preview: bool,
    pub flag_track_size_is_aspect_ratio: bool,

    pub creation_time: Mp4FileTime,
    pub modification_time: Mp4FileTime,
    pub track_id: u32,
    pub duration: u64,
    pub layer: i16,
    pub alternate_group: i16,
    pub volume: FixedPointNumber<i8, u8>,
    pub matrix: [i32; 9],
    pub width: FixedPointNumber<i16, u16>,
    pub height: FixedPointNumber<i16, u16>,
}

impl TkhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"tkhd");

    /// [`TkhdBox::layer`] の既定値
    pub const DEFAULT_LAYER: i16 = 0;

    /// [`TkhdBox::alternate_group`] の既定値
    pub const DEFAULT_ALTERNATE_GROUP: i16 = 0;

    /// 音声トラックの音量（最大）
    pub const DEFAULT_AUDIO_VOLUME: FixedPointNumber<i8, u8> = FixedPointNumber::new(1, 0);

    /// 映像トラックの音量（無音）
    pub const DEFAULT_VIDEO_VOLUME: FixedPointNumber<i8, u8> = FixedPointNumber::new(0, 0);

    /// 単位行列
    pub const DEFAULT_MATRIX: [i32; 9] = UNITY_MATRIX;
}

impl Encode for TkhdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let version = self.full_box_version();
        encode_full_box(buf, self, |w| {
            put_versioned(w, version, self.creation_time.as_secs())?;
            put_versioned(w, version, self.modification_time.as_secs())?;
            w.put(&self.track_id)?;
            w.put(&[0u8; 4])?;
            put_versioned(w, version, self.duration)?;
            w.put(&[0u8; 8])?;
            w.put(&self.layer)?;
            w.put(&self.alternate_group)?;
            w.put(&self.volume)?;
            w.put(&[0u8; 2])?;
            w.put(&self.matrix)?;
            w.put(&self.width)?;
            w.put(&self.height)
        })
    }
}

impl Decode for TkhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let creation_time = get_time(r, header.version)?;
            let modification_time = get_time(r, header.version)?;
            let track_id = r.get()?;
            r.take(4)?;
            let duration = get_versioned(r, header.version)?;
            r.take(8)?;
            let layer = r.get()?;
            let alternate_group = r.get()?;
            let volume = r.get()?;
            r.take(2)?;
            let matrix = r.get()?;
            let width = r.get()?;
            let height = r.get()?;
            Ok(Self {
                flag_track_enabled: header.flags.is_set(0),
                flag_track_in_movie: header.flags.is_set(1),
                flag_track_in_preview: header.flags.is_set(2),
                flag_track_size_is_aspect_ratio: header.flags.is_set(3),
                creation_time,
                modification_time,
                track_id,
                duration,
                layer,
                alternate_group,
                volume,
                matrix,
                width,
                height,
            })
        })
    }
}

impl BaseBox for TkhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for TkhdBox {
    fn full_box_version(&self) -> u8 {
        header_version(self.creation_time, self.modification_time, self.duration)
    }

    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::from_flags([
            (0, self.flag_track_enabled),
            (1, self.flag_track_in_movie),
            (2, self.flag_track_in_preview),
            (3, self.flag_track_size_is_aspect_ratio),
        ])
    }
}

/// [ISO/IEC 14496-12] EditBox class (親: [`TrakBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct EdtsBox {
    pub elst_box: Option<ElstBox>,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl EdtsBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"edts");
}

impl Encode for EdtsBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.elst_box)?;
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for EdtsBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut elst_box = None;
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    ElstBox::TYPE if elst_box.is_none() => elst_box = Some(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                elst_box,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for EdtsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            self.elst_box
                .iter()
                .map(as_box_object)
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [`ElstBox`] の一つの編集区間
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct ElstEntry {
    /// ムービーのタイムスケールでの区間の長さ
    pub edit_duration: u64,

    /// 区間の開始位置（メディアのタイムスケール）。`-1` は空の区間を表す
    pub media_time: i64,

    pub media_rate: FixedPointNumber<i16, i16>,
}

/// [ISO/IEC 14496-12] EditListBox class (親: [`EdtsBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct ElstBox {
    pub entries: Vec<ElstEntry>,
}

impl ElstBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"elst");
}

impl Encode for ElstBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let version = self.full_box_version();
        encode_full_box(buf, self, |w| {
            w.put(&(self.entries.len() as u32))?;
            for entry in &self.entries {
                put_versioned(w, version, entry.edit_duration)?;
                put_versioned(w, version, entry.media_time as u64)?;
                w.put(&entry.media_rate)?;
            }
            Ok(())
        })
    }
}

impl Decode for ElstBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let count: u32 = r.get()?;
            let mut entries = Vec::new();
            for _ in 0..count {
                let edit_duration = get_versioned(r, header.version)?;
                let media_time = match header.version {
                    1 => r.get::<i64>()?,
                    _ => r.get::<i32>()?.into(),
                };
                entries.push(ElstEntry {
                    edit_duration,
                    media_time,
                    media_rate: r.get()?,
                });
            }
            Ok(Self { entries })
        })
    }
}

impl BaseBox for ElstBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for ElstBox {
    fn full_box_version(&self) -> u8 {
        self.entries.iter().any(|e| {
            u32::try_from(e.edit_duration).is_err() || i32::try_from(e.media_time).is_err()
        }) as u8
    }
}

/// [ISO/IEC 14496-12] MediaBox class (親: [`TrakBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MdiaBox {
    pub mdhd_box: MdhdBox,
    pub hdlr_box: HdlrBox,
    pub minf_box: MinfBox,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl MdiaBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mdia");
}

impl Encode for MdiaBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.mdhd_box)?;
            w.put(&self.hdlr_box)?;
            w.put(&self.minf_box)?;
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for MdiaBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut mdhd_box = None;
            let mut hdlr_box = None;
            let mut minf_box = None;
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    MdhdBox::TYPE if mdhd_box.is_none() => mdhd_box = Some(r.get()?),
                    HdlrBox::TYPE if hdlr_box.is_none() => hdlr_box = Some(r.get()?),
                    MinfBox::TYPE if minf_box.is_none() => minf_box = Some(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                mdhd_box: check_mandatory_box(mdhd_box, "mdhd", "mdia")?,
                hdlr_box: check_mandatory_box(hdlr_box, "hdlr", "mdia")?,
                minf_box: check_mandatory_box(minf_box, "minf", "mdia")?,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for MdiaBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        let fixed: [&dyn BaseBox; 3] = [&self.mdhd_box, &self.hdlr_box, &self.minf_box];
        Box::new(
            fixed
                .into_iter()
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] MediaHeaderBox class (親: [`MdiaBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MdhdBox {
    pub creation_time: Mp4FileTime,
    pub modification_time: Mp4FileTime,
    pub timescale: NonZeroU32,
    pub duration: u64,

    /// ISO-639-2/T の三文字の言語コード（小文字）
    pub language: [u8; 3],
}

impl MdhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mdhd");

    /// 言語が未定義であることを表すコード
    pub const LANGUAGE_UNDEFINED: [u8; 3] = *b"und";

    /// 三文字をそれぞれ 5 bit に詰める
    fn packed_language(&self) -> Result<u16> {
        self.language.iter().try_fold(0u16, |acc, c| {
            match c.checked_sub(0x60).filter(|v| *v < 0x20) {
                Some(v) => Ok((acc << 5) | v as u16),
                None => Err(Error::invalid_input(format!(
                    "Invalid language code: {:?}",
                    self.language
                ))),
            }
        })
    }
}

impl Encode for MdhdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let version = self.full_box_version();
        let language = self.packed_language()?;
        encode_full_box(buf, self, |w| {
            put_versioned(w, version, self.creation_time.as_secs())?;
            put_versioned(w, version, self.modification_time.as_secs())?;
            w.put(&self.timescale)?;
            put_versioned(w, version, self.duration)?;
            w.put(&language)?;
            w.put(&[0u8; 2])
        })
    }
}

impl Decode for MdhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let creation_time = get_time(r, header.version)?;
            let modification_time = get_time(r, header.version)?;
            let timescale = r.get()?;
            let duration = get_versioned(r, header.version)?;
            let packed: u16 = r.get()?;
            let language = [10, 5, 0].map(|shift| ((packed >> shift) & 0x1f) as u8 + 0x60);
            r.take(2)?;
            Ok(Self {
                creation_time,
                modification_time,
                timescale,
                duration,
                language,
            })
        })
    }
}

impl BaseBox for MdhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for MdhdBox {
    fn full_box_version(&self) -> u8 {
        header_version(self.creation_time, self.modification_time, self.duration)
    }
}

/// [ISO/IEC 14496-12] HandlerBox class (親: [`MdiaBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct HdlrBox {
    pub handler_type: [u8; 4],

    /// ハンドラー名
    ///
    /// null 終端の UTF-8 であるべきだが、長さ前置の文字列を書き込む実装もあるのでバイト列のまま保持する
    pub name: Vec<u8>,
}

impl HdlrBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"hdlr");

    /// 音声トラック
    pub const HANDLER_TYPE_SOUN: [u8; 4] = *b"soun";

    /// 映像トラック
    pub const HANDLER_TYPE_VIDE: [u8; 4] = *b"vide";
}

impl Encode for HdlrBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| {
            w.put(&[0u8; 4])?;
            w.put(&self.handler_type)?;
            w.put(&[0u8; 12])?;
            w.put(&self.name)
        })
    }
}

impl Decode for HdlrBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |_, r| {
            r.take(4)?;
            let handler_type = r.get()?;
            r.take(12)?;
            Ok(Self {
                handler_type,
                name: r.take_rest().to_vec(),
            })
        })
    }
}

impl BaseBox for HdlrBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for HdlrBox {}

/// [ISO/IEC 14496-12] MediaInformationBox class (親: [`MdiaBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MinfBox {
    /// 音声なら `smhd`、映像なら `vmhd`（それ以外のトラックでは [`None`]）
    pub smhd_or_vmhd_box: Option<Either<SmhdBox, VmhdBox>>,
    pub dinf_box: DinfBox,
    pub stbl_box: StblBox,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl MinfBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"minf");
}

impl Encode for MinfBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.smhd_or_vmhd_box)?;
            w.put(&self.dinf_box)?;
            w.put(&self.stbl_box)?;
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for MinfBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut media_header = None;
            let mut dinf_box = None;
            let mut stbl_box = None;
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    SmhdBox::TYPE if media_header.is_none() => {
                        media_header = Some(Either::A(r.get()?));
                    }
                    VmhdBox::TYPE if media_header.is_none() => {
                        media_header = Some(Either::B(r.get()?));
                    }
                    DinfBox::TYPE if dinf_box.is_none() => dinf_box = Some(r.get()?),
                    StblBox::TYPE if stbl_box.is_none() => stbl_box = Some(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                smhd_or_vmhd_box: media_header,
                dinf_box: check_mandatory_box(dinf_box, "dinf", "minf")?,
                stbl_box: check_mandatory_box(stbl_box, "stbl", "minf")?,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for MinfBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        let fixed: [&dyn BaseBox; 2] = [&self.dinf_box, &self.stbl_box];
        Box::new(
            self.smhd_or_vmhd_box
                .iter()
                .map(as_box_object)
                .chain(fixed)
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] SoundMediaHeaderBox class (親: [`MinfBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct SmhdBox {
    pub balance: FixedPointNumber<u8, u8>,
}

impl SmhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"smhd");
}

impl Encode for SmhdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| {
            w.put(&self.balance)?;
            w.put(&[0u8; 2])
        })
    }
}

impl Decode for SmhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |_, r| {
            let balance = r.get()?;
            r.take(2)?;
            Ok(Self { balance })
        })
    }
}

impl BaseBox for SmhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for SmhdBox {}

/// [ISO/IEC 14496-12] VideoMediaHeaderBox class (親: [`MinfBox`])
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct VmhdBox {
    pub graphicsmode: u16,
    pub opcolor: [u16; 3],
}

impl VmhdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"vmhd");
}

impl Encode for VmhdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| {
            w.put(&self.graphicsmode)?;
            w.put(&self.opcolor)
        })
    }
}

impl Decode for VmhdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        // flags は 1 と決められているが、0 のファイルも出回っているので値は見ない
        decode_full_box(buf, Self::TYPE, |_, r| {
            Ok(Self {
                graphicsmode: r.get()?,
                opcolor: r.get()?,
            })
        })
    }
}

impl BaseBox for VmhdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for VmhdBox {
    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(1)
    }
}

/// [ISO/IEC 14496-12] DataInformationBox class (親: [`MinfBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct DinfBox {
    pub dref_box: DrefBox,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl DinfBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"dinf");

    /// メディアデータが同じファイル内にあることを表す値
    pub const LOCAL_FILE: Self = Self {
        dref_box: DrefBox::LOCAL_FILE,
        unknown_boxes: Vec::new(),
    };
}

impl Encode for DinfBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.dref_box)?;
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for DinfBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut dref_box = None;
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    DrefBox::TYPE if dref_box.is_none() => dref_box = Some(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                dref_box: check_mandatory_box(dref_box, "dref", "dinf")?,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for DinfBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            std::iter::once(&self.dref_box as &dyn BaseBox)
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] DataReferenceBox class (親: [`DinfBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct DrefBox {
    pub url_box: Option<UrlBox>,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl DrefBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"dref");

    /// メディアデータが同じファイル内にあることを表す値
    pub const LOCAL_FILE: Self = Self {
        url_box: Some(UrlBox::LOCAL_FILE),
        unknown_boxes: Vec::new(),
    };
}

impl Encode for DrefBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| {
            let entry_count = self.url_box.iter().count() + self.unknown_boxes.len();
            w.put(&(entry_count as u32))?;
            w.put(&self.url_box)?;
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for DrefBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |_, r| {
            let entry_count: u32 = r.get()?;
            let mut url_box = None;
            let mut unknown_boxes = Vec::new();
            for _ in 0..entry_count {
                match r.peek_box_header()?.box_type {
                    UrlBox::TYPE if url_box.is_none() => url_box = Some(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                url_box,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for DrefBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            self.url_box
                .iter()
                .map(as_box_object)
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

impl FullBox for DrefBox {}

/// [ISO/IEC 14496-12] DataEntryUrlBox class (親: [`DrefBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct UrlBox {
    /// [`None`] ならメディアデータは同じファイル内にある（flags の bit 0 が立つ）
    pub location: Option<Utf8String>,
}

impl UrlBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"url ");

    /// メディアデータが同じファイル内にあることを表す値
    pub const LOCAL_FILE: Self = Self { location: None };
}

impl Encode for UrlBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| w.put(&self.location))
    }
}

impl Decode for UrlBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let location = match header.flags.is_set(0) {
                true => None,
                false => Some(r.get()?),
            };
            Ok(Self { location })
        })
    }
}

impl BaseBox for UrlBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for UrlBox {
    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::new(self.location.is_none() as u32)
    }
}

/// [ISO/IEC 14496-12] SampleTableBox class (親: [`MinfBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct StblBox {
    pub stsd_box: StsdBox,
    pub stts_box: SttsBox,
    pub ctts_box: Option<CttsBox>,
    pub cslg_box: Option<CslgBox>,
    pub stsc_box: StscBox,
    pub stsz_box: StszBox,
    pub stco_or_co64_box: Either<StcoBox, Co64Box>,
    pub stss_box: Option<StssBox>,
    pub stps_box: Option<StpsBox>,
    pub sdtp_box: Option<SdtpBox>,
    pub sgpd_boxes: Vec<SgpdBox>,
    pub sbgp_boxes: Vec<SbgpBox>,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl StblBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stbl");
}

impl Encode for StblBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.stsd_box)?;
            w.put(&self.stts_box)?;
            w.put(&self.ctts_box)?;
            w.put(&self.cslg_box)?;
            w.put(&self.stsc_box)?;
            w.put(&self.stsz_box)?;
            w.put(&self.stco_or_co64_box)?;
            w.put(&self.stss_box)?;
            w.put(&self.stps_box)?;
            w.put(&self.sdtp_box)?;
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

impl Decode for StblBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut stsd_box = None;
            let mut stts_box = None;
            let mut ctts_box = None;
            let mut cslg_box = None;
            let mut stsc_box = None;
            let mut stsz_box = None;
            let mut chunk_offsets = None;
            let mut stss_box = None;
            let mut stps_box = None;
            let mut sdtp_box = None;
            let mut sgpd_boxes = Vec::new();
            let mut sbgp_boxes = Vec::new();
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    StsdBox::TYPE if stsd_box.is_none() => stsd_box = Some(r.get()?),
                    SttsBox::TYPE if stts_box.is_none() => stts_box = Some(r.get()?),
                    CttsBox::TYPE if ctts_box.is_none() => ctts_box = Some(r.get()?),
                    CslgBox::TYPE if cslg_box.is_none() => cslg_box = Some(r.get()?),
                    StscBox::TYPE if stsc_box.is_none() => stsc_box = Some(r.get()?),
                    StszBox::TYPE if stsz_box.is_none() => stsz_box = Some(r.get()?),
                    StcoBox::TYPE if chunk_offsets.is_none() => {
                        chunk_offsets = Some(Either::A(r.get()?));
                    }
                    Co64Box::TYPE if chunk_offsets.is_none() => {
                        chunk_offsets = Some(Either::B(r.get()?));
                    }
                    StssBox::TYPE if stss_box.is_none() => stss_box = Some(r.get()?),
                    StpsBox::TYPE if stps_box.is_none() => stps_box = Some(r.get()?),
                    SdtpBox::TYPE if sdtp_box.is_none() => sdtp_box = Some(r.get()?),
                    SgpdBox::TYPE => sgpd_boxes.push(r.get()?),
                    SbgpBox::TYPE => sbgp_boxes.push(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                stsd_box: check_mandatory_box(stsd_box, "stsd", "stbl")?,
                stts_box: check_mandatory_box(stts_box, "stts", "stbl")?,
                ctts_box,
                cslg_box,
                stsc_box: check_mandatory_box(stsc_box, "stsc", "stbl")?,
                stsz_box: check_mandatory_box(stsz_box, "stsz", "stbl")?,
                stco_or_co64_box: check_mandatory_box(chunk_offsets, "stco' or 'co64", "stbl")?,
                stss_box,
                stps_box,
                sdtp_box,
                sgpd_boxes,
                sbgp_boxes,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for StblBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        let head: [&dyn BaseBox; 2] = [&self.stsd_box, &self.stts_box];
        let middle: [&dyn BaseBox; 3] = [&self.stsc_box, &self.stsz_box, &self.stco_or_co64_box];
        Box::new(
            head.into_iter()
                .chain(self.ctts_box.iter().map(as_box_object))
                .chain(self.cslg_box.iter().map(as_box_object))
                .chain(middle)
                .chain(self.stss_box.iter().map(as_box_object))
                .chain(self.stps_box.iter().map(as_box_object))
                .chain(self.sdtp_box.iter().map(as_box_object))
                .chain(self.sgpd_boxes.iter().map(as_box_object))
                .chain(self.sbgp_boxes.iter().map(as_box_object))
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] SampleDescriptionBox class (親: [`StblBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct StsdBox {
    pub entries: Vec<SampleEntry>,
}

impl StsdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stsd");
}

impl Encode for StsdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_counted(self, &self.entries, buf)
    }
}

impl Decode for StsdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_counted(Self::TYPE, buf).map(|(entries, n)| (Self { entries }, n))
    }
}

impl BaseBox for StsdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(self.entries.iter().map(as_box_object))
    }
}

impl FullBox for StsdBox {}

/// [`SttsBox`] のエントリー（同じ尺を持つ連続したサンプルの数と、その尺）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct SttsEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

impl Encode for SttsEntry {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = ByteWriter::new(buf);
        w.put(&self.sample_count)?;
        w.put(&self.sample_delta)?;
        Ok(w.position())
    }
}

impl Decode for SttsEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(buf);
        let entry = Self {
            sample_count: r.get()?,
            sample_delta: r.get()?,
        };
        Ok((entry, r.position()))
    }
}

/// [ISO/IEC 14496-12] TimeToSampleBox class (親: [`StblBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct SttsBox {
    pub entries: Vec<SttsEntry>,
}

impl SttsBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stts");
}

impl Encode for SttsBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_counted(self, &self.entries, buf)
    }
}

impl Decode for SttsBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_counted(Self::TYPE, buf).map(|(entries, n)| (Self { entries }, n))
    }
}

impl BaseBox for SttsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for SttsBox {}

/// [`StscBox`] のエントリー（`first_chunk` 番目以降のチャンクに含まれるサンプル数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct StscEntry {
    pub first_chunk: NonZeroU32,
    pub sample_per_chunk: u32,
    pub sample_description_index: NonZeroU32,
}

impl Encode for StscEntry {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = ByteWriter::new(buf);
        w.put(&self.first_chunk)?;
        w.put(&self.sample_per_chunk)?;
        w.put(&self.sample_description_index)?;
        Ok(w.position())
    }
}

impl Decode for StscEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(buf);
        let entry = Self {
            first_chunk: r.get()?,
            sample_per_chunk: r.get()?,
            sample_description_index: r.get()?,
        };
        Ok((entry, r.position()))
    }
}

/// [ISO/IEC 14496-12] SampleToChunkBox class (親: [`StblBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct StscBox {
    pub entries: Vec<StscEntry>,
}

impl StscBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stsc");
}

impl Encode for StscBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_counted(self, &self.entries, buf)
    }
}

impl Decode for StscBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_counted(Self::TYPE, buf).map(|(entries, n)| (Self { entries }, n))
    }
}

impl BaseBox for StscBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for StscBox {}

/// [ISO/IEC 14496-12] SampleSizeBox class (親: [`StblBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum StszBox {
    /// 全てのサンプルが同じサイズ
    Fixed {
        sample_size: NonZeroU32,
        sample_count: u32,
    },

    /// サンプルごとにサイズを持つ
    Variable { entry_sizes: Vec<u32> },
}

impl StszBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stsz");
}

impl Encode for StszBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| match self {
            Self::Fixed {
                sample_size,
                sample_count,
            } => {
                w.put(sample_size)?;
                w.put(sample_count)
            }
            Self::Variable { entry_sizes } => {
                w.put(&0u32)?;
                w.put(&(entry_sizes.len() as u32))?;
                for size in entry_sizes {
                    w.put(size)?;
                }
                Ok(())
            }
        })
    }
}

impl Decode for StszBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |_, r| {
            let sample_size: u32 = r.get()?;
            let sample_count: u32 = r.get()?;
            if let Some(sample_size) = NonZeroU32::new(sample_size) {
                return Ok(Self::Fixed {
                    sample_size,
                    sample_count,
                });
            }
            let entry_sizes = get_entries(r, sample_count, 4)?;
            Ok(Self::Variable { entry_sizes })
        })
    }
}

impl BaseBox for StszBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for StszBox {}

/// [ISO/IEC 14496-12] ChunkOffsetBox class (親: [`StblBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct StcoBox {
    pub chunk_offsets: Vec<u32>,
}

impl StcoBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stco");
}

impl Encode for StcoBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_counted(self, &self.chunk_offsets, buf)
    }
}

impl Decode for StcoBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_counted(Self::TYPE, buf).map(|(chunk_offsets, n)| (Self { chunk_offsets }, n))
    }
}

impl BaseBox for StcoBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for StcoBox {}

/// [ISO/IEC 14496-12] ChunkLargeOffsetBox class (親: [`StblBox`])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct Co64Box {
    pub chunk_offsets: Vec<u64>,
}

impl Co64Box {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"co64");
}

impl Encode for Co64Box {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_counted(self, &self.chunk_offsets, buf)
    }
}

impl Decode for Co64Box {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_counted(Self::TYPE, buf).map(|(chunk_offsets, n)| (Self { chunk_offsets }, n))
    }
}

impl BaseBox for Co64Box {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for Co64Box {}

/// [ISO/IEC 14496-12] SyncSampleBox class (親: [`StblBox`])
///
/// このボックスがなければ全サンプルが同期サンプルとなる
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct StssBox {
    pub sample_numbers: Vec<NonZeroU32>,
}

impl StssBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stss");
}

impl Encode for StssBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_counted(self, &self.sample_numbers, buf)
    }
}

impl Decode for StssBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_counted(Self::TYPE, buf).map(|(sample_numbers, n)| (Self { sample_numbers }, n))
    }
}

impl BaseBox for StssBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for StssBox {}

/// [QuickTime File Format] PartialSyncSampleAtom (親: [`StblBox`])
///
/// open-GOP の先頭のように、それ以降のサンプルだけが正しく復号できるサンプルの番号
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct StpsBox {
    pub sample_numbers: Vec<NonZeroU32>,
}

impl StpsBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"stps");
}

impl Encode for StpsBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_counted(self, &self.sample_numbers, buf)
    }
}

impl Decode for StpsBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_counted(Self::TYPE, buf).map(|(sample_numbers, n)| (Self { sample_numbers }, n))
    }
}

impl BaseBox for StpsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for StpsBox {}

/// `entry_count` に続いてエントリーが並ぶフルボックスを書き込む
fn encode_counted<B: FullBox, T: Encode>(b: &B, entries: &[T], buf: &mut [u8]) -> Result<usize> {
    encode_full_box(buf, b, |w| {
        w.put(&(entries.len() as u32))?;
        for entry in entries {
            w.put(entry)?;
        }
        Ok(())
    })
}

/// [`encode_counted()`] で書き込んだボックスを読み込む
fn decode_counted<T: Decode>(box_type: BoxType, buf: &[u8]) -> Result<(Vec<T>, usize)> {
    decode_full_box(buf, box_type, |_, r| {
        let count = r.get()?;
        get_entries(r, count, 4)
    })
}

/// `count` 個のエントリーを読み込む
///
/// 壊れたカウント値で巨大な領域を確保しないよう、事前確保は残りのバイト数で頭打ちにする
fn get_entries<T: Decode>(r: &mut ByteReader<'_>, count: u32, min_entry_size: usize) -> Result<Vec<T>> {
    let capacity = (count as usize).min(r.remaining().len() / min_entry_size);
    let mut entries = Vec::with_capacity(capacity);
    for _ in 0..count {
        entries.push(r.get()?);
    }
    Ok(entries)
}

/// [`CttsBox`] のエントリー（同じ表示時刻オフセットを持つ連続したサンプルの数と、そのオフセット）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct CttsEntry {
    pub sample_count: u32,
    pub sample_offset: i32,
}

impl Encode for CttsEntry {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = ByteWriter::new(buf);
        w.put(&self.sample_count)?;
        w.put(&self.sample_offset)?;
        Ok(w.position())
    }
}

impl Decode for CttsEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(buf);
        let entry = Self {
            sample_count: r.get()?,
            sample_offset: r.get()?,
        };
        Ok((entry, r.position()))
    }
}

/// [ISO/IEC 14496-12] CompositionOffsetBox class (親: [`StblBox`])
///
/// 負のオフセットを含む場合は version 1 になる
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct CttsBox {
    pub entries: Vec<CttsEntry>,
}

impl CttsBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"ctts");
}

impl Encode for CttsBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_counted(self, &self.entries, buf)
    }
}

impl Decode for CttsBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let count = r.get()?;
            let entries: Vec<CttsEntry> = get_entries(r, count, 8)?;
            // version 0 は符号なしだが、負の値を書き込む実装があるので符号付きとして読む
            if header.version == 0 && entries.iter().any(|e| e.sample_offset < 0) {
                log::debug!("ctts version 0 contains negative offsets");
            }
            Ok(Self { entries })
        })
    }
}

impl BaseBox for CttsBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for CttsBox {
    fn full_box_version(&self) -> u8 {
        self.entries.iter().any(|e| e.sample_offset < 0) as u8
    }
}

/// [ISO/IEC 14496-12] CompositionToDecodeBox class (親: [`StblBox`])
///
/// いずれかの値が 32 bit に収まらない場合は version 1 になる
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct CslgBox {
    pub composition_to_dts_shift: i64,
    pub least_decode_to_display_delta: i64,
    pub greatest_decode_to_display_delta: i64,
    pub composition_start_time: i64,
    pub composition_end_time: i64,
}

impl CslgBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"cslg");

    fn fields(&self) -> [i64; 5] {
        [
            self.composition_to_dts_shift,
            self.least_decode_to_display_delta,
            self.greatest_decode_to_display_delta,
            self.composition_start_time,
            self.composition_end_time,
        ]
    }
}

impl Encode for CslgBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let version = self.full_box_version();
        encode_full_box(buf, self, |w| {
            for v in self.fields() {
                put_versioned(w, version, v as u64)?;
            }
            Ok(())
        })
    }
}

impl Decode for CslgBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let mut get = || -> Result<i64> {
                match header.version {
                    1 => r.get(),
                    _ => r.get::<i32>().map(i64::from),
                }
            };
            Ok(Self {
                composition_to_dts_shift: get()?,
                least_decode_to_display_delta: get()?,
                greatest_decode_to_display_delta: get()?,
                composition_start_time: get()?,
                composition_end_time: get()?,
            })
        })
    }
}

impl BaseBox for CslgBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for CslgBox {
    fn full_box_version(&self) -> u8 {
        self.fields().iter().any(|v| i32::try_from(*v).is_err()) as u8
    }
}

/// [ISO/IEC 14496-12] MovieExtendsBox class (親: [`MoovBox`])
///
/// このボックスがあれば、ファイルはフラグメント化されている
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MvexBox {
    pub mehd_box: Option<MehdBox>,
    pub trex_boxes: Vec<TrexBox>,
    pub unknown_boxes: Vec<UnknownBox>,
}

impl MvexBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mvex");
}

impl Encode for MvexBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.mehd_box)?;
            for b in &self.trex_boxes {
                w.put(b)?;
            }
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            Ok(())
        })
    }
}

impl Decode for MvexBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let mut mehd_box = None;
            let mut trex_boxes = Vec::new();
            let mut unknown_boxes = Vec::new();
            while !r.is_empty() {
                match r.peek_box_header()?.box_type {
                    MehdBox::TYPE if mehd_box.is_none() => mehd_box = Some(r.get()?),
                    TrexBox::TYPE => trex_boxes.push(r.get()?),
                    _ => unknown_boxes.push(r.get()?),
                }
            }
            Ok(Self {
                mehd_box,
                trex_boxes,
                unknown_boxes,
            })
        })
    }
}

impl BaseBox for MvexBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            self.mehd_box
                .iter()
                .map(as_box_object)
                .chain(self.trex_boxes.iter().map(as_box_object))
                .chain(self.unknown_boxes.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] MovieExtendsHeaderBox class (親: [`MvexBox`])
///
/// フラグメント化されたムービー全体の尺
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MehdBox {
    /// 書き込み時の version
    ///
    /// 1 を指定すると値が 32 bit に収まる場合でも 64 bit で書き込むので、
    /// 後から尺を上書きしてもボックスのサイズは変わらない
    pub version: u8,
    pub fragment_duration: u64,
}

impl MehdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mehd");
}

impl Encode for MehdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let version = self.full_box_version();
        encode_full_box(buf, self, |w| {
            put_versioned(w, version, self.fragment_duration)
        })
    }
}

impl Decode for MehdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            Ok(Self {
                version: header.version,
                fragment_duration: get_versioned(r, header.version)?,
            })
        })
    }
}

impl BaseBox for MehdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for MehdBox {
    fn full_box_version(&self) -> u8 {
        if self.fragment_duration > u32::MAX as u64 {
            1
        } else {
            self.version
        }
    }
}

/// [ISO/IEC 14496-12] TrackExtendsBox class (親: [`MvexBox`])
///
/// トラックフラグメントで省略された値の既定値（トラックごとに一つ）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct TrexBox {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: SampleFlags,
}

impl TrexBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"trex");
}

impl Encode for TrexBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| {
            w.put(&self.track_id)?;
            w.put(&self.default_sample_description_index)?;
            w.put(&self.default_sample_duration)?;
            w.put(&self.default_sample_size)?;
            w.put(&self.default_sample_flags)
        })
    }
}

impl Decode for TrexBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |_, r| {
            Ok(Self {
                track_id: r.get()?,
                default_sample_description_index: r.get()?,
                default_sample_duration: r.get()?,
                default_sample_size: r.get()?,
                default_sample_flags: r.get()?,
            })
        })
    }
}

impl BaseBox for TrexBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for TrexBox {}

#[cfg(test)]
mod tests {
    use super::*;

    fn mdhd(language: [u8; 3], duration: u64) -> MdhdBox {
        MdhdBox {
            creation_time: Mp4FileTime::from_secs(0),
            modification_time: Mp4FileTime::from_secs(0),
            timescale: NonZeroU32::MIN,
            duration,
            language,
        }
    }

    #[test]
    fn mdhd_language_is_packed() -> Result<()> {
        let b = mdhd(*b"jpn", 10);
        let bytes = b.encode_to_vec()?;
        // header(8) + full header(4) + times(8) + timescale(4) + duration(4)
        let packed = u16::from_be_bytes([bytes[28], bytes[29]]);
        assert_eq!(packed, (10 << 10) | (16 << 5) | 14);
        assert_eq!(MdhdBox::decode(&bytes)?.0, b);
        Ok(())
    }

    #[test]
    fn mdhd_rejects_non_lowercase_language() {
        assert!(mdhd(*b"JPN", 0).encode_to_vec().is_err());
    }

    #[test]
    fn large_duration_selects_version_1() -> Result<()> {
        let b = mdhd(MdhdBox::LANGUAGE_UNDEFINED, u32::MAX as u64 + 1);
        let bytes = b.encode_to_vec()?;
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes.len(), 8 + 4 + 8 * 2 + 4 + 8 + 4);
        assert_eq!(MdhdBox::decode(&bytes)?.0, b);
        Ok(())
    }

    #[test]
    fn ctts_with_negative_offset_is_version_1() -> Result<()> {
        let b = CttsBox {
            entries: vec![CttsEntry {
                sample_count: 2,
                sample_offset: -3,
            }],
        };
        let bytes = b.encode_to_vec()?;
        assert_eq!(bytes[8], 1);
        assert_eq!(CttsBox::decode(&bytes)?.0, b);
        Ok(())
    }

    #[test]
    fn mehd_keeps_requested_version() -> Result<()> {
        let b = MehdBox {
            version: 1,
            fragment_duration: 100,
        };
        let bytes = b.encode_to_vec()?;
        assert_eq!(bytes.len(), 8 + 4 + 8);
        assert_eq!(MehdBox::decode(&bytes)?.0, b);

        let promoted = MehdBox {
            version: 0,
            fragment_duration: u32::MAX as u64 + 1,
        };
        assert_eq!(promoted.encode_to_vec()?.len(), 8 + 4 + 8);
        Ok(())
    }

    #[test]
    fn stbl_requires_chunk_offsets() -> Result<()> {
        let stsd = StsdBox { entries: vec![] }.encode_to_vec()?;
        let stts = SttsBox { entries: vec![] }.encode_to_vec()?;
        let stsc = StscBox { entries: vec![] }.encode_to_vec()?;
        let stsz = StszBox::Variable {
            entry_sizes: vec![],
        }
        .encode_to_vec()?;
        let payload = [stsd, stts, stsc, stsz].concat();
        let mut bytes = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"stbl");
        bytes.extend_from_slice(&payload);

        let e = StblBox::decode(&bytes).err().ok_or(Error::invalid_input("decoded"))?;
        assert_eq!(e.box_type, Some(StblBox::TYPE));
        Ok(())
    }

    #[test]
    fn dref_local_file() -> Result<()> {
        let bytes = DrefBox::LOCAL_FILE.encode_to_vec()?;
        // dref(8+4+4) + url(8+4), url の flags は 1
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[16 + 4..16 + 8], b"url ");
        assert_eq!(bytes[27], 1);
        assert_eq!(DrefBox::decode(&bytes)?.0, DrefBox::LOCAL_FILE);
        Ok(())
    }
}
