//! サンプルエントリー系のボックス
//!
//! コーデック固有の設定ボックス（avcC や dOps など）は解釈せずに [`UnknownBox`] として保持する。
//! 構造化するのは全コーデックに共通するフィールドと `btrt` ボックスだけ。
//!
//! このモジュールは内部的なもので、構造体などの外部への提供は boxes モジュールを通して行う
use std::num::NonZeroU16;

use crate::{
    BaseBox, BoxHeader, BoxType, Decode, Encode, FixedPointNumber, Result,
    basic_types::as_box_object,
    boxes::UnknownBox,
    codec::{ByteReader, ByteWriter, decode_box, encode_box},
};

/// [`StsdBox`](crate::boxes::StsdBox) に含まれるエントリー
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum SampleEntry {
    Visual(VisualSampleEntry),
    Audio(AudioSampleEntry),
    Unknown(UnknownBox),
}

impl SampleEntry {
    fn inner_box(&self) -> &dyn BaseBox {
        match self {
            Self::Visual(b) => b,
            Self::Audio(b) => b,
            Self::Unknown(b) => b,
        }
    }

    /// 映像のサンプルエントリーかどうか
    pub fn is_visual(&self) -> bool {
        matches!(self, Self::Visual(_))
    }

    /// 音声のサンプルエントリーかどうか
    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio(_))
    }

    /// `btrt` ボックス
    pub fn btrt_box(&self) -> Option<&BtrtBox> {
        match self {
            Self::Visual(b) => b.btrt_box.as_ref(),
            Self::Audio(b) => b.btrt_box.as_ref(),
            Self::Unknown(_) => None,
        }
    }

    /// `btrt` ボックス（可変参照）
    pub fn btrt_box_mut(&mut self) -> Option<&mut BtrtBox> {
        match self {
            Self::Visual(b) => b.btrt_box.as_mut(),
            Self::Audio(b) => b.btrt_box.as_mut(),
            Self::Unknown(_) => None,
        }
    }
}

impl Encode for SampleEntry {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Visual(b) => b.encode(buf),
            Self::Audio(b) => b.encode(buf),
            Self::Unknown(b) => b.encode(buf),
        }
    }
}

impl Decode for SampleEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, _) = BoxHeader::decode(buf)?;
        if VisualSampleEntry::KNOWN_TYPES.contains(&header.box_type) {
            VisualSampleEntry::decode(buf).map(|(b, n)| (Self::Visual(b), n))
        } else if AudioSampleEntry::KNOWN_TYPES.contains(&header.box_type) {
            AudioSampleEntry::decode(buf).map(|(b, n)| (Self::Audio(b), n))
        } else {
            UnknownBox::decode(buf).map(|(b, n)| (Self::Unknown(b), n))
        }
    }
}

impl BaseBox for SampleEntry {
    fn box_type(&self) -> BoxType {
        self.inner_box().box_type()
    }

    fn is_unknown_box(&self) -> bool {
        self.inner_box().is_unknown_box()
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        self.inner_box().children()
    }
}

/// サンプルエントリー共通の先頭部分（reserved と data_reference_index）
fn put_entry_prefix(w: &mut ByteWriter<'_>, data_reference_index: NonZeroU16) -> Result<()> {
    w.put(&[0u8; 6])?;
    w.put(&data_reference_index)
}

fn get_entry_prefix(r: &mut ByteReader<'_>) -> Result<NonZeroU16> {
    r.take(6)?;
    r.get()
}

/// 固定フィールドの後ろに続く子ボックス群を読み込む
fn get_entry_children(r: &mut ByteReader<'_>) -> Result<(Vec<UnknownBox>, Option<BtrtBox>)> {
    let mut unknown_boxes = Vec::new();
    let mut btrt_box = None;
    while !r.is_empty() {
        match r.peek_box_header()?.box_type {
            BtrtBox::TYPE if btrt_box.is_none() => btrt_box = Some(r.get()?),
            _ => unknown_boxes.push(r.get()?),
        }
    }
    Ok((unknown_boxes, btrt_box))
}

/// 映像系の [`SampleEntry`] に共通のフィールド
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct VisualSampleEntryFields {
    pub data_reference_index: NonZeroU16,
    pub width: u16,
    pub height: u16,
    pub horizresolution: FixedPointNumber<u16, u16>,
    pub vertresolution: FixedPointNumber<u16, u16>,
    pub frame_count: u16,
    pub compressorname: [u8; 32],
    pub depth: u16,
}

impl VisualSampleEntryFields {
    /// 最初の `dref` エントリーを参照する
    pub const DEFAULT_DATA_REFERENCE_INDEX: NonZeroU16 = NonZeroU16::MIN;

    /// 72 dpi
    pub const DEFAULT_HORIZRESOLUTION: FixedPointNumber<u16, u16> = FixedPointNumber::new(0x48, 0);

    /// 72 dpi
    pub const DEFAULT_VERTRESOLUTION: FixedPointNumber<u16, u16> = FixedPointNumber::new(0x48, 0);

    /// 1 サンプルあたりのフレーム数
    pub const DEFAULT_FRAME_COUNT: u16 = 1;

    /// アルファなしのカラー
    pub const DEFAULT_DEPTH: u16 = 0x0018;

    /// 名前なし
    pub const NULL_COMPRESSORNAME: [u8; 32] = [0; 32];

    /// 解像度以外を既定値で埋める
    pub const fn with_size(width: u16, height: u16) -> Self {
        Self {
            data_reference_index: Self::DEFAULT_DATA_REFERENCE_INDEX,
            width,
            height,
            horizresolution: Self::DEFAULT_HORIZRESOLUTION,
            vertresolution: Self::DEFAULT_VERTRESOLUTION,
            frame_count: Self::DEFAULT_FRAME_COUNT,
            compressorname: Self::NULL_COMPRESSORNAME,
            depth: Self::DEFAULT_DEPTH,
        }
    }
}

impl Encode for VisualSampleEntryFields {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = ByteWriter::new(buf);
        put_entry_prefix(&mut w, self.data_reference_index)?;
        w.put(&[0u8; 16])?;
        w.put(&self.width)?;
        w.put(&self.height)?;
        w.put(&self.horizresolution)?;
        w.put(&self.vertresolution)?;
        w.put(&[0u8; 4])?;
        w.put(&self.frame_count)?;
        w.put(&self.compressorname)?;
        w.put(&self.depth)?;
        w.put(&-1i16)?;
        Ok(w.position())
    }
}

impl Decode for VisualSampleEntryFields {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(buf);
        let data_reference_index = get_entry_prefix(&mut r)?;
        r.take(16)?;
        let width = r.get()?;
        let height = r.get()?;
        let horizresolution = r.get()?;
        let vertresolution = r.get()?;
        r.take(4)?;
        let frame_count = r.get()?;
        let compressorname = r.get()?;
        let depth = r.get()?;
        r.take(2)?;
        let fields = Self {
            data_reference_index,
            width,
            height,
            horizresolution,
            vertresolution,
            frame_count,
            compressorname,
            depth,
        };
        Ok((fields, r.position()))
    }
}

/// [ISO/IEC 14496-12] VisualSampleEntry class (親: [`StsdBox`](crate::boxes::StsdBox))
///
/// ボックス種別はコーデックごとに異なるので値として保持する。
/// コーデック固有の設定ボックスは `unknown_boxes` に入り、読み込んだ順序のまま書き出される。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct VisualSampleEntry {
    pub box_type: BoxType,
    pub visual: VisualSampleEntryFields,
    pub unknown_boxes: Vec<UnknownBox>,
    pub btrt_box: Option<BtrtBox>,
}

impl VisualSampleEntry {
    /// デコード時に映像のサンプルエントリーとして扱うボックス種別
    pub const KNOWN_TYPES: &'static [BoxType] = &[
        BoxType::Normal(*b"avc1"),
        BoxType::Normal(*b"avc3"),
        BoxType::Normal(*b"hev1"),
        BoxType::Normal(*b"hvc1"),
        BoxType::Normal(*b"vp08"),
        BoxType::Normal(*b"vp09"),
        BoxType::Normal(*b"av01"),
        BoxType::Normal(*b"mp4v"),
        BoxType::Normal(*b"jpeg"),
    ];
}

impl Encode for VisualSampleEntry {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, self.box_type, |w| {
            w.put(&self.visual)?;
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            w.put(&self.btrt_box)
        })
    }
}

impl Decode for VisualSampleEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, _) = BoxHeader::decode(buf)?;
        decode_box(buf, header.box_type, |r| {
            let visual = r.get()?;
            let (unknown_boxes, btrt_box) = get_entry_children(r)?;
            Ok(Self {
                box_type: header.box_type,
                visual,
                unknown_boxes,
                btrt_box,
            })
        })
    }
}

impl BaseBox for VisualSampleEntry {
    fn box_type(&self) -> BoxType {
        self.box_type
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            self.unknown_boxes
                .iter()
                .map(as_box_object)
                .chain(self.btrt_box.iter().map(as_box_object)),
        )
    }
}

/// 音声系の [`SampleEntry`] に共通のフィールド
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct AudioSampleEntryFields {
    pub data_reference_index: NonZeroU16,
    pub channelcount: u16,
    pub samplesize: u16,
    pub samplerate: FixedPointNumber<u16, u16>,
}

impl AudioSampleEntryFields {
    /// 最初の `dref` エントリーを参照する
    pub const DEFAULT_DATA_REFERENCE_INDEX: NonZeroU16 = NonZeroU16::MIN;

    /// 16 bit
    pub const DEFAULT_SAMPLESIZE: u16 = 16;
}

impl Encode for AudioSampleEntryFields {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = ByteWriter::new(buf);
        put_entry_prefix(&mut w, self.data_reference_index)?;
        w.put(&[0u8; 8])?;
        w.put(&self.channelcount)?;
        w.put(&self.samplesize)?;
        w.put(&[0u8; 4])?;
        w.put(&self.samplerate)?;
        Ok(w.position())
    }
}

impl Decode for AudioSampleEntryFields {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(buf);
        let data_reference_index = get_entry_prefix(&mut r)?;
        r.take(8)?;
        let channelcount = r.get()?;
        let samplesize = r.get()?;
        r.take(4)?;
        let samplerate = r.get()?;
        let fields = Self {
            data_reference_index,
            channelcount,
            samplesize,
            samplerate,
        };
        Ok((fields, r.position()))
    }
}

/// [ISO/IEC 14496-12] AudioSampleEntry class (親: [`StsdBox`](crate::boxes::StsdBox))
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct AudioSampleEntry {
    pub box_type: BoxType,
    pub audio: AudioSampleEntryFields,
    pub unknown_boxes: Vec<UnknownBox>,
    pub btrt_box: Option<BtrtBox>,
}

impl AudioSampleEntry {
    /// デコード時に音声のサンプルエントリーとして扱うボックス種別
    pub const KNOWN_TYPES: &'static [BoxType] = &[
        BoxType::Normal(*b"mp4a"),
        BoxType::Normal(*b"Opus"),
        BoxType::Normal(*b"fLaC"),
        BoxType::Normal(*b"ac-3"),
        BoxType::Normal(*b"ec-3"),
        BoxType::Normal(*b"alac"),
        BoxType::Normal(*b"ipcm"),
    ];
}

impl Encode for AudioSampleEntry {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, self.box_type, |w| {
            w.put(&self.audio)?;
            for b in &self.unknown_boxes {
                w.put(b)?;
            }
            w.put(&self.btrt_box)
        })
    }
}

impl Decode for AudioSampleEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, _) = BoxHeader::decode(buf)?;
        decode_box(buf, header.box_type, |r| {
            let audio = r.get()?;
            let (unknown_boxes, btrt_box) = get_entry_children(r)?;
            Ok(Self {
                box_type: header.box_type,
                audio,
                unknown_boxes,
                btrt_box,
            })
        })
    }
}

impl BaseBox for AudioSampleEntry {
    fn box_type(&self) -> BoxType {
        self.box_type
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(
            self.unknown_boxes
                .iter()
                .map(as_box_object)
                .chain(self.btrt_box.iter().map(as_box_object)),
        )
    }
}

/// [ISO/IEC 14496-12] BitRateBox class (親: [`VisualSampleEntry`] / [`AudioSampleEntry`])
///
/// 値はムービーの確定時に、このサンプルエントリーを参照するサンプル群から計算される
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct BtrtBox {
    pub buffer_size_db: u32,
    pub max_bitrate: u32,
    pub avg_bitrate: u32,
}

impl BtrtBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"btrt");
}

impl Encode for BtrtBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.buffer_size_db)?;
            w.put(&self.max_bitrate)?;
            w.put(&self.avg_bitrate)
        })
    }
}

impl Decode for BtrtBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            Ok(Self {
                buffer_size_db: r.get()?,
                max_bitrate: r.get()?,
                avg_bitrate: r.get()?,
            })
        })
    }
}

impl BaseBox for BtrtBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}
