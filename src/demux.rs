//! MP4 ファイルを読み込んで、トラックとサンプルの情報を取り出すためのモジュール
//!
//! [`Mp4FileReader`] はファイル先頭からトップレベルのボックスを走査し、
//! `moov` ボックスのサンプルテーブル、もしくは `moof` ボックス群から各サンプルの位置と時刻を復元する。
//! サンプルデータ自体は [`Mp4FileReader::read_sample_data()`] で必要になった時点で読み込む。
use std::{
    io::{Read, Seek, SeekFrom},
    num::NonZeroU32,
};

use crate::{
    BoxHeader, BoxType, Decode, Error,
    aux::SampleTableAccessor,
    boxes::{
        ElstEntry, FtypBox, HdlrBox, MfraBox, MoofBox, MoovBox, SampleEntry, SampleFlags,
        TrafBox, TrexBox,
    },
};

/// トラックの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// 音声トラック
    Audio,

    /// 映像トラック
    Video,
}

/// ファイル直下のボックスの位置情報
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopLevelBox {
    /// ボックス種別
    pub box_type: BoxType,

    /// ファイル内でのボックスの開始位置
    pub offset: u64,

    /// ヘッダーを含むボックス全体のサイズ
    pub size: u64,
}

/// 読み込んだトラックの情報
#[derive(Debug, Clone)]
pub struct DemuxTrack {
    /// トラック ID
    pub track_id: u32,

    /// トラック種別（音声・映像以外のトラックの場合は [`None`]）
    pub kind: Option<TrackKind>,

    /// メディアのタイムスケール
    pub timescale: NonZeroU32,

    /// メディアの尺（`mdhd` ボックスの値）
    pub media_duration: u64,

    /// トラックの尺（`tkhd` ボックスの値、ムービーのタイムスケール）
    pub track_duration: u64,

    /// サンプルエントリー群
    pub sample_entries: Vec<SampleEntry>,

    /// 編集リスト
    pub edits: Vec<ElstEntry>,
}

/// 読み込んだサンプルの情報
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DemuxSample {
    /// トラック ID
    pub track_id: u32,

    /// サンプルエントリーのインデックス（1 始まり）
    pub description_index: NonZeroU32,

    /// 復号時刻（メディアのタイムスケール）
    pub dts: u64,

    /// 表示時刻（メディアのタイムスケール）
    pub cts: i64,

    /// 尺（メディアのタイムスケール）
    pub duration: u32,

    /// サンプルデータのサイズ
    pub size: u32,

    /// ファイル内でのサンプルデータの位置
    pub data_offset: u64,

    /// 同期サンプルかどうか
    pub is_sync: bool,
}

/// [`Mp4FileReader`] の操作で発生するエラー
#[non_exhaustive]
pub enum DemuxError {
    /// MP4 ボックスのデコード処理中に発生したエラー
    DecodeError(Error),

    /// 入出力エラー
    Io(std::io::Error),

    /// `moov` ボックスが見つからなかった
    MissingMoovBox,

    /// 存在しないトラック ID が指定された
    InvalidTrackId {
        /// トラック ID
        track_id: u32,
    },

    /// サンプルテーブルの内容に矛盾がある
    InconsistentSampleTable {
        /// トラック ID
        track_id: u32,
    },
}

impl From<Error> for DemuxError {
    fn from(error: Error) -> Self {
        Self::DecodeError(error)
    }
}

impl From<std::io::Error> for DemuxError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl std::fmt::Debug for DemuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::fmt::Display for DemuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DecodeError(error) => write!(f, "Failed to decode MP4 box: {error}"),
            Self::Io(error) => write!(f, "I/O error: {error}"),
            Self::MissingMoovBox => write!(f, "No moov box found"),
            Self::InvalidTrackId { track_id } => write!(f, "Invalid track_id: {track_id}"),
            Self::InconsistentSampleTable { track_id } => {
                write!(f, "Inconsistent sample table for track_id {track_id}")
            }
        }
    }
}

impl std::error::Error for DemuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DecodeError(error) => Some(error),
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

/// MP4 ファイルを読み込むための構造体
#[derive(Debug)]
pub struct Mp4FileReader<R> {
    reader: R,
    file_size: u64,
    top_level_boxes: Vec<TopLevelBox>,
    ftyp_box: Option<FtypBox>,
    moov_box: MoovBox,
    mfra_box: Option<MfraBox>,
    tracks: Vec<DemuxTrack>,
    samples: Vec<Vec<DemuxSample>>,
}

impl<R: Read + Seek> Mp4FileReader<R> {
    /// ファイル全体を走査して、トラックとサンプルの情報を読み込む
    ///
    /// ファイルは `reader` の先頭から読み込まれる
    pub fn read(mut reader: R) -> Result<Self, DemuxError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        let mut top_level_boxes = Vec::new();
        let mut ftyp_box = None;
        let mut moov_box = None;
        let mut mfra_box = None;
        let mut moof_boxes = Vec::new();

        let mut position = 0;
        while position < file_size {
            let header_size = (file_size - position).min(BoxHeader::MAX_SIZE as u64);
            let header_bytes = read_bytes(&mut reader, position, header_size)?;
            let (header, _) = BoxHeader::decode(&header_bytes)?;
            let size = match header.box_size.get() {
                0 => file_size - position,
                size => size,
            };
            if size < header.external_size() as u64 || size > file_size - position {
                return Err(Error::invalid_data(format!(
                    "Top-level box size {size} at {position} exceeds the file size {file_size}"
                ))
                .with_box_type(header.box_type)
                .into());
            }

            match header.box_type {
                FtypBox::TYPE => {
                    let bytes = read_bytes(&mut reader, position, size)?;
                    ftyp_box = Some(FtypBox::decode(&bytes)?.0);
                }
                MoovBox::TYPE => {
                    let bytes = read_bytes(&mut reader, position, size)?;
                    moov_box = Some(MoovBox::decode(&bytes)?.0);
                }
                MoofBox::TYPE => {
                    let bytes = read_bytes(&mut reader, position, size)?;
                    moof_boxes.push((position, MoofBox::decode(&bytes)?.0));
                }
                MfraBox::TYPE => {
                    let bytes = read_bytes(&mut reader, position, size)?;
                    mfra_box = Some(MfraBox::decode(&bytes)?.0);
                }
                _ => {}
            }
            log::trace!("top-level box {} at {position} ({size} bytes)", header.box_type);
            top_level_boxes.push(TopLevelBox {
                box_type: header.box_type,
                offset: position,
                size,
            });
            position += size;
        }

        let moov_box = moov_box.ok_or(DemuxError::MissingMoovBox)?;
        let tracks: Vec<DemuxTrack> = moov_box.trak_boxes.iter().map(track_info).collect();
        let mut samples = Vec::with_capacity(tracks.len());
        for trak_box in &moov_box.trak_boxes {
            let track_id = trak_box.tkhd_box.track_id;
            let accessor = SampleTableAccessor::new(&trak_box.mdia_box.minf_box.stbl_box);
            let track_samples: Vec<DemuxSample> = accessor
                .samples()
                .map(|s| DemuxSample {
                    track_id,
                    description_index: s.description_index,
                    dts: s.dts,
                    cts: s.cts(),
                    duration: s.duration,
                    size: s.size,
                    data_offset: s.data_offset,
                    is_sync: s.is_sync,
                })
                .collect();
            if track_samples.len() != accessor.sample_count() as usize {
                return Err(DemuxError::InconsistentSampleTable { track_id });
            }
            samples.push(track_samples);
        }

        let trex_boxes = moov_box
            .mvex_box
            .as_ref()
            .map(|b| b.trex_boxes.as_slice())
            .unwrap_or_default();
        for (moof_offset, moof_box) in &moof_boxes {
            let mut data_end = *moof_offset;
            for traf_box in &moof_box.traf_boxes {
                let track_id = traf_box.tfhd_box.track_id;
                let index = tracks
                    .iter()
                    .position(|t| t.track_id == track_id)
                    .ok_or(DemuxError::InvalidTrackId { track_id })?;
                let trex_box = trex_boxes.iter().find(|b| b.track_id == track_id);
                data_end = fragment_samples(
                    traf_box,
                    trex_box,
                    *moof_offset,
                    data_end,
                    &mut samples[index],
                )?;
            }
        }
        log::debug!(
            "read {} tracks ({} samples, {} fragments)",
            tracks.len(),
            samples.iter().map(Vec::len).sum::<usize>(),
            moof_boxes.len()
        );

        Ok(Self {
            reader,
            file_size,
            top_level_boxes,
            ftyp_box,
            moov_box,
            mfra_box,
            tracks,
            samples,
        })
    }

    /// サンプルデータを読み込む
    pub fn read_sample_data(&mut self, sample: &DemuxSample) -> Result<Vec<u8>, DemuxError> {
        if sample
            .data_offset
            .checked_add(sample.size as u64)
            .is_none_or(|end| end > self.file_size)
        {
            return Err(DemuxError::InconsistentSampleTable {
                track_id: sample.track_id,
            });
        }
        read_bytes(&mut self.reader, sample.data_offset, sample.size as u64)
    }
}

impl<R> Mp4FileReader<R> {
    /// ファイル直下のボックスの一覧を出現順に返す
    pub fn top_level_boxes(&self) -> &[TopLevelBox] {
        &self.top_level_boxes
    }

    /// `ftyp` ボックスを返す
    pub fn ftyp_box(&self) -> Option<&FtypBox> {
        self.ftyp_box.as_ref()
    }

    /// `moov` ボックスを返す
    pub fn moov_box(&self) -> &MoovBox {
        &self.moov_box
    }

    /// `mfra` ボックスを返す
    pub fn mfra_box(&self) -> Option<&MfraBox> {
        self.mfra_box.as_ref()
    }

    /// フラグメント化されたファイルかどうかを返す
    pub fn is_fragmented(&self) -> bool {
        self.moov_box.mvex_box.is_some()
    }

    /// トラックの一覧を返す
    pub fn tracks(&self) -> &[DemuxTrack] {
        &self.tracks
    }

    /// 指定されたトラックのサンプルを復号順に返す
    pub fn samples(&self, track_id: u32) -> Result<&[DemuxSample], DemuxError> {
        self.tracks
            .iter()
            .position(|t| t.track_id == track_id)
            .map(|i| self.samples[i].as_slice())
            .ok_or(DemuxError::InvalidTrackId { track_id })
    }

    /// 内部の reader を返す
    pub fn into_inner(self) -> R {
        self.reader
    }
}

fn read_bytes<R: Read + Seek>(reader: &mut R, position: u64, size: u64) -> Result<Vec<u8>, DemuxError> {
    let size = usize::try_from(size)
        .map_err(|_| Error::invalid_data(format!("Read size too large: {size}")))?;
    let mut buf = vec![0; size];
    reader.seek(SeekFrom::Start(position))?;
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn track_info(trak_box: &crate::boxes::TrakBox) -> DemuxTrack {
    let mdia_box = &trak_box.mdia_box;
    let kind = match mdia_box.hdlr_box.handler_type {
        HdlrBox::HANDLER_TYPE_SOUN => Some(TrackKind::Audio),
        HdlrBox::HANDLER_TYPE_VIDE => Some(TrackKind::Video),
        _ => None,
    };
    DemuxTrack {
        track_id: trak_box.tkhd_box.track_id,
        kind,
        timescale: mdia_box.mdhd_box.timescale,
        media_duration: mdia_box.mdhd_box.duration,
        track_duration: trak_box.tkhd_box.duration,
        sample_entries: mdia_box.minf_box.stbl_box.stsd_box.entries.clone(),
        edits: trak_box
            .edts_box
            .iter()
            .flat_map(|b| b.elst_box.iter())
            .flat_map(|b| b.entries.iter().cloned())
            .collect(),
    }
}

/// トラックフラグメントのサンプルを復元して `samples` に追加し、最後のサンプルデータの終端位置を返す
fn fragment_samples(
    traf_box: &TrafBox,
    trex_box: Option<&TrexBox>,
    moof_offset: u64,
    previous_data_end: u64,
    samples: &mut Vec<DemuxSample>,
) -> Result<u64, DemuxError> {
    let tfhd_box = &traf_box.tfhd_box;
    let track_id = tfhd_box.track_id;
    let base_offset = match tfhd_box.base_data_offset {
        Some(offset) => offset,
        None if tfhd_box.default_base_is_moof => moof_offset,
        None => previous_data_end,
    };
    let description_index = tfhd_box
        .sample_description_index
        .or(trex_box.map(|b| b.default_sample_description_index))
        .and_then(NonZeroU32::new)
        .unwrap_or(NonZeroU32::MIN);
    let default_duration = tfhd_box
        .default_sample_duration
        .or(trex_box.map(|b| b.default_sample_duration))
        .unwrap_or(0);
    let default_size = tfhd_box
        .default_sample_size
        .or(trex_box.map(|b| b.default_sample_size))
        .unwrap_or(0);
    let default_flags = tfhd_box
        .default_sample_flags
        .or(trex_box.map(|b| b.default_sample_flags))
        .unwrap_or(SampleFlags::empty());

    let mut dts = match &traf_box.tfdt_box {
        Some(tfdt_box) => tfdt_box.base_media_decode_time,
        None => samples
            .last()
            .map_or(0, |s| s.dts.saturating_add(s.duration as u64)),
    };
    let mut data_end = base_offset;
    for trun_box in &traf_box.trun_boxes {
        let mut data_offset = match trun_box.data_offset {
            Some(offset) => base_offset
                .checked_add_signed(offset as i64)
                .ok_or(DemuxError::InconsistentSampleTable { track_id })?,
            None => data_end,
        };
        for (i, sample) in trun_box.samples.iter().enumerate() {
            let flags = match (i, trun_box.first_sample_flags) {
                (0, Some(flags)) => flags,
                _ => sample.flags.unwrap_or(default_flags),
            };
            let duration = sample.duration.unwrap_or(default_duration);
            let size = sample.size.unwrap_or(default_size);
            samples.push(DemuxSample {
                track_id,
                description_index,
                dts,
                cts: dts as i64 + sample.composition_time_offset.unwrap_or(0) as i64,
                duration,
                size,
                data_offset,
                is_sync: !flags.sample_is_non_sync_sample(),
            });
            dts = dts.saturating_add(duration as u64);
            data_offset = data_offset
                .checked_add(size as u64)
                .ok_or(DemuxError::InconsistentSampleTable { track_id })?;
        }
        data_end = data_offset;
    }
    Ok(data_end)
}
