//! MP4 ファイルを構築するための multiplexer
//!
//! [`Movie`] にトラックを作成してサンプルを追記していき、最後に [`Movie::finalize()`] を呼び出すと
//! `moov` ボックスが書き込まれてファイルが完成する。
//!
//! 通常のファイルでは、サンプルデータはトラックごとにチャンク単位でまとめて `mdat` ボックスに書き込まれ、
//! `moov` ボックスはファイル末尾（もしくは予約領域や `ftyp` ボックスの直後）に配置される。
//! [`CompatibilityMode::Fragmented`] の場合は、最初のサンプルの追記時に初期化用の `moov` ボックスが書き込まれ、
//! 以降は一定間隔で `moof` ボックスと `mdat` ボックスの組が書き出される。
use std::{
    io::{Read, Seek, SeekFrom, Write},
    num::NonZeroU32,
    time::Duration,
};

mod bitrate;
mod chunk;
mod fragment;
mod grouping;
mod relocate;
mod sample_table;
mod timing;

pub use timing::Edit;

use crate::{
    BoxHeader, BoxSize, Either, Encode, Error, FixedPointNumber, Mp4FileTime, TrackKind,
    Utf8String,
    boxes::{
        Brand, DinfBox, EdtsBox, ElstBox, ElstEntry, FreeBox, FtypBox, HdlrBox, MdatBox, MdhdBox,
        MdiaBox, MehdBox, MinfBox, MoovBox, MvexBox, MvhdBox, SampleEntry, SampleFlags,
        SampleGroupContext, SmhdBox, StblBox, StcoBox, StscBox, StsdBox, StszBox, SttsBox,
        TkhdBox, TrakBox, TrexBox, UrlBox, VmhdBox,
    },
};

use self::{
    chunk::{ChunkLimits, ChunkPool, ChunkTable},
    fragment::{Boundary, FragmentTrack, RandomAccessIndex},
    grouping::SampleGrouping,
    sample_table::{SampleTableBuilder, SampleTiming},
    timing::{TimingParams, TrackTiming},
};

/// 生成するファイルの互換性モード
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompatibilityMode {
    /// ISO Base Media File Format
    #[default]
    Iso,

    /// QuickTime File Format
    ///
    /// サンプルグループは生成せず、部分同期サンプルを `stps` ボックスに記録する
    QuickTime,

    /// フラグメント化された ISO Base Media File Format
    Fragmented,
}

impl CompatibilityMode {
    /// `ftyp` ボックスに記録するブランドのデフォルト値（先頭が major brand）
    pub fn default_brands(self) -> Vec<Brand> {
        match self {
            Self::Iso => vec![Brand::ISOM, Brand::ISO2, Brand::ISO4, Brand::MP41],
            Self::QuickTime => vec![Brand::QT],
            Self::Fragmented => vec![Brand::ISO6, Brand::ISOM, Brand::MSDH, Brand::MSIX],
        }
    }
}

/// [`Movie`] 用のオプション
#[derive(Debug, Clone)]
pub struct MovieOptions {
    /// 互換性モード
    pub mode: CompatibilityMode,

    /// `ftyp` ボックスに記録するブランド（先頭が major brand で、全てが compatible brands にも含まれる）
    ///
    /// [`None`] の場合は [`CompatibilityMode::default_brands()`] が使われる
    pub brands: Option<Vec<Brand>>,

    /// ムービー全体のタイムスケール
    pub movie_timescale: NonZeroU32,

    /// 一つのチャンクに含めるサンプル群の最大の尺
    pub max_chunk_duration: Duration,

    /// 一つのチャンクの最大サイズ（バイト）
    pub max_chunk_size: usize,

    /// トラック間で書き出しを待つサンプルの時刻のずれの許容値
    ///
    /// これを超えて古いサンプルを保持しているトラックは、他のトラックへの追記時にチャンクが書き出される
    pub max_async_tolerance: Duration,

    /// ファイルの先頭付近に `moov` ボックス用に予約しておく領域のサイズ（バイト）
    ///
    /// 0 なら予約しない。0 以外の場合は 8 以上である必要がある
    pub reserved_moov_box_size: u64,

    /// `moov` ボックスを前方に移動する際に使うバッファのサイズ（バイト）
    pub relocation_buffer_size: usize,

    /// ファイル作成時刻（UNIX エポックからの経過時間）
    pub creation_timestamp: Duration,

    /// フラグメントの尺の目安（[`CompatibilityMode::Fragmented`] の場合のみ使われる）
    pub fragment_duration: Duration,

    /// ファイル末尾に `mfra` ボックスを書き込むかどうか（[`CompatibilityMode::Fragmented`] の場合のみ使われる）
    pub write_mfra: bool,
}

impl Default for MovieOptions {
    fn default() -> Self {
        Self {
            mode: CompatibilityMode::Iso,
            brands: None,
            movie_timescale: NonZeroU32::MIN.saturating_add(999),
            max_chunk_duration: Duration::from_millis(500),
            max_chunk_size: 4 * 1024 * 1024,
            max_async_tolerance: Duration::from_secs(2),
            reserved_moov_box_size: 0,
            relocation_buffer_size: 4 * 1024 * 1024,
            creation_timestamp: Duration::ZERO,
            fragment_duration: Duration::from_secs(2),
            write_mfra: true,
        }
    }
}

/// トラックの設定
#[derive(Debug, Clone)]
pub struct TrackConfig {
    /// トラック種別
    pub kind: TrackKind,

    /// メディアのタイムスケール
    pub timescale: NonZeroU32,

    /// 先頭で再生をスキップする尺（メディアのタイムスケール）
    ///
    /// 0 以外の場合は編集リストが自動生成される（明示的に [`Movie::create_edit()`] された場合を除く）
    pub leading_skip: u32,

    /// ISO-639-2/T 言語コード
    pub language: [u8; 3],

    /// 映像の幅（映像トラックのみ）
    pub width: u16,

    /// 映像の高さ（映像トラックのみ）
    pub height: u16,

    /// データ参照（[`None`] の場合は同一ファイルを参照する `url ` ボックスが使われる）
    pub data_reference: Option<DinfBox>,
}

impl TrackConfig {
    /// 映像トラックの設定を作成する
    pub fn video(timescale: NonZeroU32, width: u16, height: u16) -> Self {
        Self {
            kind: TrackKind::Video,
            timescale,
            leading_skip: 0,
            language: MdhdBox::LANGUAGE_UNDEFINED,
            width,
            height,
            data_reference: None,
        }
    }

    /// 音声トラックの設定を作成する
    pub fn audio(timescale: NonZeroU32) -> Self {
        Self {
            kind: TrackKind::Audio,
            width: 0,
            height: 0,
            ..Self::video(timescale, 0, 0)
        }
    }
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self::video(NonZeroU32::MIN.saturating_add(89_999), 0, 0)
    }
}

/// ランダムアクセスに関するサンプルの種別
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RandomAccessKind {
    /// ランダムアクセスポイントではない
    #[default]
    None,

    /// 同期サンプル（単独で復号可能）
    Sync,

    /// 部分同期サンプル（オープン GOP の先頭など、後続の一部のサンプルのみが正しく復号可能）
    PartialSync,

    /// 段階的な復帰の開始点
    ///
    /// `recovery_identifier` が `complete` のサンプルで完全に復帰する
    RecoveryStart {
        /// 復帰が完了するサンプルの識別子
        complete: u32,
    },
}

/// ランダムアクセスポイントの後に続くサンプルの leading 種別
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeadingKind {
    /// 不明
    #[default]
    Unknown,

    /// leading サンプルで、直前のランダムアクセスポイントから復号できない
    Undecodable,

    /// leading サンプルではない
    NotLeading,

    /// leading サンプルで、直前のランダムアクセスポイントから復号できる
    Decodable,
}

/// サンプルの属性
///
/// [`Option`] の値が [`None`] のものは「不明」を表す
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleProperties {
    /// ランダムアクセスに関する種別
    pub random_access: RandomAccessKind,

    /// leading 種別
    pub leading: LeadingKind,

    /// 他のサンプルを参照せずに復号できるかどうか
    pub independent: Option<bool>,

    /// 他のサンプルから参照されないかどうか
    pub disposable: Option<bool>,

    /// 冗長な符号化を含むかどうか
    pub redundant: Option<bool>,

    /// 段階的な復帰の識別子（[`RandomAccessKind::RecoveryStart`] の `complete` と照合される）
    pub recovery_identifier: Option<u32>,

    /// 正しく復号するために事前に復号が必要なサンプル数（0 なら不要）
    pub pre_roll_distance: u16,
}

impl SampleProperties {
    /// 同期サンプルを表す属性
    pub const SYNC: Self = Self {
        random_access: RandomAccessKind::Sync,
        leading: LeadingKind::Unknown,
        independent: None,
        disposable: None,
        redundant: None,
        recovery_identifier: None,
        pre_roll_distance: 0,
    };
}

/// トラックに追記するサンプル
#[derive(Debug, Clone)]
pub struct Sample<'a> {
    /// サンプルデータ
    pub data: &'a [u8],

    /// 復号時刻（メディアのタイムスケール）
    pub dts: i64,

    /// 表示時刻（メディアのタイムスケール）
    pub cts: i64,

    /// このサンプルが参照するサンプルエントリーのインデックス（1 始まり）
    pub description_index: NonZeroU32,

    /// サンプルの属性
    pub properties: SampleProperties,
}

impl<'a> Sample<'a> {
    /// 最初のサンプルエントリーを参照する、表示時刻と復号時刻が等しい同期サンプルを作成する
    pub fn new(data: &'a [u8], dts: i64) -> Self {
        Self {
            data,
            dts,
            cts: dts,
            description_index: NonZeroU32::MIN,
            properties: SampleProperties::SYNC,
        }
    }
}

/// [`Movie`] の操作で発生するエラー
#[non_exhaustive]
pub enum MuxError {
    /// MP4 ボックスのエンコード処理中に発生したエラー
    EncodeError(Error),

    /// 入出力エラー
    Io(std::io::Error),

    /// 確定済みのムービーに対して操作が行われた
    AlreadyFinalized,

    /// 存在しないトラック ID が指定された
    InvalidTrackId {
        /// トラック ID
        track_id: u32,
    },

    /// 存在しないサンプルエントリーのインデックスが指定された
    InvalidSampleDescriptionIndex {
        /// トラック ID
        track_id: u32,
        /// サンプルエントリーのインデックス
        description_index: NonZeroU32,
    },

    /// サンプルデータが空
    EmptySample {
        /// トラック ID
        track_id: u32,
    },

    /// 復号時刻が直前のサンプル以下
    NonMonotonicTimestamp {
        /// トラック ID
        track_id: u32,
        /// 直前のサンプルの復号時刻
        previous_dts: i64,
        /// 追記しようとしたサンプルの復号時刻
        dts: i64,
    },

    /// 表示時刻と復号時刻の差が i32 の範囲に収まらない
    CompositionOffsetOutOfRange {
        /// トラック ID
        track_id: u32,
        /// 復号時刻
        dts: i64,
        /// 表示時刻
        cts: i64,
    },

    /// 直前のサンプルとの復号時刻の差が u32 の範囲に収まらない
    DeltaOutOfRange {
        /// トラック ID
        track_id: u32,
        /// 直前のサンプルの復号時刻
        previous_dts: i64,
        /// 追記しようとしたサンプルの復号時刻
        dts: i64,
    },

    /// トラックにサンプルエントリーが一つも追加されていない
    MissingSampleEntry {
        /// トラック ID
        track_id: u32,
    },

    /// サンプルエントリーの種別がトラックの種別と一致しない
    SampleEntryKindMismatch {
        /// トラック ID
        track_id: u32,
    },

    /// トラックが一つも作成されていない
    NoTracks,

    /// 初期化用の `moov` ボックスを書き込んだ後にトラックの構成を変更しようとした
    TrackCreationAfterInit,

    /// 編集リストのエントリーが不正（`media_time` が -1 未満、もしくは存在しないエントリー）
    InvalidEdit {
        /// トラック ID
        track_id: u32,
    },

    /// 書き込み済みの `moov` ボックスを書き換える際に、サイズが変わってしまった
    MoovSizeChanged {
        /// 書き込み済みのサイズ
        expected: usize,
        /// 書き換え後のサイズ
        actual: usize,
    },
}

impl From<Error> for MuxError {
    fn from(error: Error) -> Self {
        Self::EncodeError(error)
    }
}

impl From<std::io::Error> for MuxError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl std::fmt::Debug for MuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::fmt::Display for MuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EncodeError(error) => write!(f, "Failed to encode MP4 box: {error}"),
            Self::Io(error) => write!(f, "I/O error: {error}"),
            Self::AlreadyFinalized => write!(f, "Movie has already been finalized"),
            Self::InvalidTrackId { track_id } => write!(f, "Invalid track_id: {track_id}"),
            Self::InvalidSampleDescriptionIndex {
                track_id,
                description_index,
            } => write!(
                f,
                "Invalid sample description index {description_index} for track_id {track_id}"
            ),
            Self::EmptySample { track_id } => {
                write!(f, "Empty sample data for track_id {track_id}")
            }
            Self::NonMonotonicTimestamp {
                track_id,
                previous_dts,
                dts,
            } => write!(
                f,
                "Non-monotonic decode timestamp for track_id {track_id}: previous={previous_dts}, current={dts}"
            ),
            Self::CompositionOffsetOutOfRange { track_id, dts, cts } => write!(
                f,
                "Composition offset out of i32 range for track_id {track_id}: dts={dts}, cts={cts}"
            ),
            Self::DeltaOutOfRange {
                track_id,
                previous_dts,
                dts,
            } => write!(
                f,
                "Decode delta out of u32 range for track_id {track_id}: previous={previous_dts}, current={dts}"
            ),
            Self::MissingSampleEntry { track_id } => {
                write!(f, "No sample entry for track_id {track_id}")
            }
            Self::SampleEntryKindMismatch { track_id } => write!(
                f,
                "Sample entry kind does not match the kind of track_id {track_id}"
            ),
            Self::NoTracks => write!(f, "No tracks created"),
            Self::TrackCreationAfterInit => write!(
                f,
                "Tracks cannot be changed after the initialization segment has been written"
            ),
            Self::InvalidEdit { track_id } => {
                write!(f, "Invalid edit list entry for track_id {track_id}")
            }
            Self::MoovSizeChanged { expected, actual } => write!(
                f,
                "moov box size changed while rewriting: expected={expected}, actual={actual}"
            ),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EncodeError(error) => Some(error),
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Track {
    id: u32,
    config: TrackConfig,
    sample_entries: Vec<SampleEntry>,
    table: SampleTableBuilder,
    chunks: ChunkTable,
    pool: ChunkPool,
    grouping: SampleGrouping,
    fragment: FragmentTrack,
    edits: Vec<Edit>,
    last_sample_duration: Option<u32>,
}

impl Track {
    fn new(id: u32, config: TrackConfig, mode: CompatibilityMode) -> Self {
        let random_access = config.kind == TrackKind::Video && mode != CompatibilityMode::QuickTime;
        let roll_recovery = mode != CompatibilityMode::QuickTime;
        let grouping = SampleGrouping::new(random_access, roll_recovery);
        Self {
            id,
            config,
            sample_entries: Vec::new(),
            table: SampleTableBuilder::new(),
            chunks: ChunkTable::default(),
            pool: ChunkPool::default(),
            fragment: FragmentTrack::new(grouping.clone()),
            grouping,
            edits: Vec::new(),
            last_sample_duration: None,
        }
    }

    fn timing(&self, movie_timescale: NonZeroU32, synthesize_edits: bool) -> TrackTiming {
        TrackTiming::compute(
            &self.table,
            TimingParams {
                last_sample_duration: self.last_sample_duration,
                edits: &self.edits,
                leading_skip: self.config.leading_skip,
                synthesize_edits,
                media_timescale: self.config.timescale,
                movie_timescale,
            },
        )
    }

    fn accepts(&self, entry: &SampleEntry) -> bool {
        match self.config.kind {
            TrackKind::Video => !entry.is_audio(),
            TrackKind::Audio => !entry.is_visual(),
        }
    }

    fn data_information_box(&self) -> DinfBox {
        let mut dinf_box = self.config.data_reference.clone().unwrap_or(DinfBox::LOCAL_FILE);
        if dinf_box.dref_box.url_box.is_none() && dinf_box.dref_box.unknown_boxes.is_empty() {
            dinf_box.dref_box.url_box = Some(UrlBox::LOCAL_FILE);
        }
        dinf_box
    }
}

/// フラグメント化されたファイルを書き出すための状態
#[derive(Debug, Default)]
struct FragmentedState {
    moov_offset: Option<u64>,
    moov_size: usize,
    sequence_number: u32,
    index: RandomAccessIndex,
}

/// MP4 ファイルを構築するための multiplexer
///
/// サンプルデータは `writer` に逐次書き込まれる。
/// [`Movie::finalize()`] を呼び出さずに破棄した場合、書き込み途中のファイルは不完全なままになる。
#[derive(Debug)]
pub struct Movie<W> {
    writer: Option<W>,
    options: MovieOptions,
    creation_time: Mp4FileTime,
    tracks: Vec<Track>,
    next_track_id: u32,
    position: u64,
    ftyp_end: u64,
    reserved_area: Option<(u64, u64)>,
    data_start: u64,
    fragmented: Option<FragmentedState>,
}

impl<W: Read + Write + Seek> Movie<W> {
    /// 指定したオプションでインスタンスを生成し、`ftyp` ボックスを書き込む
    ///
    /// ファイルは `writer` の現在位置から書き込まれる
    pub fn new(mut writer: W, options: MovieOptions) -> Result<Self, MuxError> {
        let fragmented = options.mode == CompatibilityMode::Fragmented;
        let reserved = options.reserved_moov_box_size;
        if !fragmented && (1..8).contains(&reserved) {
            return Err(Error::invalid_input(format!(
                "reserved_moov_box_size must be 0 or at least 8: {reserved}"
            ))
            .into());
        }

        let brands = options
            .brands
            .clone()
            .filter(|brands| !brands.is_empty())
            .unwrap_or_else(|| options.mode.default_brands());
        let ftyp_box = FtypBox {
            major_brand: brands[0],
            minor_version: 0,
            compatible_brands: brands,
        };

        let mut position = writer.stream_position()?;
        let ftyp_bytes = ftyp_box.encode_to_vec()?;
        writer.write_all(&ftyp_bytes)?;
        position += ftyp_bytes.len() as u64;
        let ftyp_end = position;

        let mut reserved_area = None;
        if !fragmented {
            if reserved > 0 {
                let free_box = FreeBox {
                    payload: vec![0; (reserved - 8) as usize],
                };
                writer.write_all(&free_box.encode_to_vec()?)?;
                reserved_area = Some((position, reserved));
                position += reserved;
            }

            // mdat ボックスのサイズが 32 bit に収まらない場合には、この free ボックスを largesize 用の領域として使う
            let placeholder = FreeBox {
                payload: Vec::new(),
            }
            .encode_to_vec()?;
            let mdat_header =
                BoxHeader::new(MdatBox::TYPE, BoxSize::with_payload_size(MdatBox::TYPE, 0))
                    .encode_to_vec()?;
            writer.write_all(&placeholder)?;
            writer.write_all(&mdat_header)?;
            position += (placeholder.len() + mdat_header.len()) as u64;
        }

        Ok(Self {
            writer: Some(writer),
            creation_time: Mp4FileTime::from_unix_time(options.creation_timestamp),
            fragmented: fragmented.then(FragmentedState::default),
            options,
            tracks: Vec::new(),
            next_track_id: 1,
            position,
            ftyp_end,
            reserved_area,
            data_start: position,
        })
    }

    /// オプションを返す
    pub fn options(&self) -> &MovieOptions {
        &self.options
    }

    /// トラックを作成して、そのトラック ID を返す
    pub fn create_track(&mut self, config: TrackConfig) -> Result<u32, MuxError> {
        self.check_track_changes_allowed()?;
        let track_id = self.next_track_id;
        self.next_track_id = track_id
            .checked_add(1)
            .ok_or_else(|| Error::invalid_input("too many tracks"))?;
        log::debug!("create track {track_id} ({:?})", config.kind);
        self.tracks
            .push(Track::new(track_id, config, self.options.mode));
        Ok(track_id)
    }

    /// トラックにサンプルエントリーを追加して、そのインデックス（1 始まり）を返す
    pub fn add_sample_entry(
        &mut self,
        track_id: u32,
        entry: SampleEntry,
    ) -> Result<NonZeroU32, MuxError> {
        self.check_track_changes_allowed()?;
        let track = self.track_mut(track_id)?;
        if !track.accepts(&entry) {
            return Err(MuxError::SampleEntryKindMismatch { track_id });
        }
        track.sample_entries.push(entry);
        NonZeroU32::new(track.sample_entries.len() as u32)
            .ok_or_else(|| Error::invalid_input("too many sample entries").into())
    }

    /// トラックを削除する
    ///
    /// 書き出し待ちのサンプルデータは破棄される
    pub fn delete_track(&mut self, track_id: u32) -> Result<(), MuxError> {
        self.check_track_changes_allowed()?;
        let index = self.track_index(track_id)?;
        let track = self.tracks.remove(index);
        log::debug!(
            "delete track {track_id} ({} samples)",
            track.table.sample_count()
        );
        Ok(())
    }

    /// トラックにサンプルを追記する
    ///
    /// エラーが発生した場合には、トラックの状態は変更されない（入出力エラーを除く）
    pub fn append_sample(&mut self, track_id: u32, sample: &Sample<'_>) -> Result<(), MuxError> {
        self.check_not_finalized()?;
        let index = self.track_index(track_id)?;
        let track = &self.tracks[index];
        if sample.description_index.get() as usize > track.sample_entries.len() {
            return Err(MuxError::InvalidSampleDescriptionIndex {
                track_id,
                description_index: sample.description_index,
            });
        }
        let timing = track.table.check(track_id, sample)?;

        if self.fragmented.is_some() {
            self.append_fragmented(index, sample, timing)?;
        } else {
            self.pool_sample(index, sample)?;
        }

        let record_partial_sync = self.options.mode == CompatibilityMode::QuickTime;
        let fragmented = self.fragmented.is_some();
        let track = &mut self.tracks[index];
        let sample_number = track.table.sample_count() + 1;
        track.table.append(
            sample.dts,
            timing,
            sample.data.len() as u32,
            &sample.properties,
            record_partial_sync,
        );
        if !fragmented {
            track
                .grouping
                .append(sample_number, timing.cts, &sample.properties);
        }
        log::trace!(
            "track {track_id}: sample #{sample_number} dts={} cts={} size={}",
            sample.dts,
            sample.cts,
            sample.data.len()
        );
        Ok(())
    }

    /// 最後のサンプルの尺を明示的に指定する（メディアのタイムスケール）
    pub fn set_last_sample_duration(&mut self, track_id: u32, duration: u32) -> Result<(), MuxError> {
        self.check_not_finalized()?;
        self.track_mut(track_id)?.last_sample_duration = Some(duration);
        Ok(())
    }

    /// トラックの編集リストにエントリーを追加する
    ///
    /// 一度でも呼び出された場合、編集リストの自動生成は行われない
    pub fn create_edit(&mut self, track_id: u32, edit: Edit) -> Result<(), MuxError> {
        self.check_track_changes_allowed()?;
        edit.validate(track_id)?;
        self.track_mut(track_id)?.edits.push(edit);
        Ok(())
    }

    /// トラックの尺を返す（ムービーのタイムスケール）
    pub fn get_track_duration(&self, track_id: u32) -> Result<u64, MuxError> {
        let track = self.track(track_id)?;
        Ok(track
            .timing(self.options.movie_timescale, self.fragmented.is_none())
            .track_duration)
    }

    /// トラックのメディアのタイムスケールを返す
    pub fn get_media_timescale(&self, track_id: u32) -> Result<NonZeroU32, MuxError> {
        Ok(self.track(track_id)?.config.timescale)
    }

    /// トラックのメディアの尺を返す（メディアのタイムスケール）
    pub fn get_media_duration(&self, track_id: u32) -> Result<u64, MuxError> {
        let track = self.track(track_id)?;
        Ok(track
            .timing(self.options.movie_timescale, self.fragmented.is_none())
            .media_duration)
    }

    /// ムービーを確定させて、`moov` ボックスを書き込む
    ///
    /// `relocate` が `true` の場合は、`moov` ボックスを `ftyp` ボックスの直後に移動する
    /// （予約領域に収まった場合は予約領域が優先される）。
    ///
    /// トラックの構成に問題がある場合は、ファイルに何も書き込まずにエラーを返す。
    /// この場合、問題を修正してから再度呼び出すことができる。
    pub fn finalize(&mut self, relocate: bool) -> Result<FinalizedMovie<W>, MuxError> {
        self.check_not_finalized()?;
        self.validate()?;
        if self.fragmented.is_some() {
            return self.finalize_fragmented();
        }

        self.flush_all_pools()?;
        self.write_mdat_header()?;

        for track in &mut self.tracks {
            track.grouping.finish();
        }
        let timings: Vec<TrackTiming> = self
            .tracks
            .iter()
            .map(|t| t.timing(self.options.movie_timescale, true))
            .collect();
        for (track, timing) in self.tracks.iter_mut().zip(&timings) {
            bitrate::update_bitrates(
                &mut track.sample_entries,
                track.config.timescale,
                track.chunks.sample_description_indices(),
                track.table.sizes().iter().copied(),
                track.table.sample_deltas(timing.last_delta),
            );
        }

        let (moov_offset, moov_box) = self.write_moov(&timings, relocate)?;
        for trak_box in &moov_box.trak_boxes {
            if let Either::B(co64_box) = &trak_box.mdia_box.minf_box.stbl_box.stco_or_co64_box {
                log::debug!(
                    "track {}: {} chunk offsets written as co64",
                    trak_box.tkhd_box.track_id,
                    co64_box.chunk_offsets.len()
                );
            }
        }

        let writer = self.writer.take().ok_or(MuxError::AlreadyFinalized)?;
        Ok(FinalizedMovie {
            writer,
            moov_size: moov_box.encode_to_vec()?.len(),
            moov_box,
            moov_offset,
        })
    }

    fn check_not_finalized(&self) -> Result<(), MuxError> {
        if self.writer.is_none() {
            return Err(MuxError::AlreadyFinalized);
        }
        Ok(())
    }

    fn check_track_changes_allowed(&self) -> Result<(), MuxError> {
        self.check_not_finalized()?;
        if self
            .fragmented
            .as_ref()
            .is_some_and(|state| state.moov_offset.is_some())
        {
            return Err(MuxError::TrackCreationAfterInit);
        }
        Ok(())
    }

    fn track_index(&self, track_id: u32) -> Result<usize, MuxError> {
        self.tracks
            .iter()
            .position(|t| t.id == track_id)
            .ok_or(MuxError::InvalidTrackId { track_id })
    }

    fn track(&self, track_id: u32) -> Result<&Track, MuxError> {
        let index = self.track_index(track_id)?;
        Ok(&self.tracks[index])
    }

    fn track_mut(&mut self, track_id: u32) -> Result<&mut Track, MuxError> {
        let index = self.track_index(track_id)?;
        Ok(&mut self.tracks[index])
    }

    fn validate(&self) -> Result<(), MuxError> {
        if self.tracks.is_empty() {
            return Err(MuxError::NoTracks);
        }
        for track in &self.tracks {
            if track.sample_entries.is_empty() {
                return Err(MuxError::MissingSampleEntry { track_id: track.id });
            }
            if !track.sample_entries.iter().all(|e| track.accepts(e)) {
                return Err(MuxError::SampleEntryKindMismatch { track_id: track.id });
            }
        }
        Ok(())
    }

    fn write_at(&mut self, position: u64, bytes: &[u8]) -> Result<(), MuxError> {
        let writer = self.writer.as_mut().ok_or(MuxError::AlreadyFinalized)?;
        writer.seek(SeekFrom::Start(position))?;
        writer.write_all(bytes)?;
        Ok(())
    }

    fn chunk_limits(&self) -> ChunkLimits {
        ChunkLimits {
            max_duration: self.options.max_chunk_duration,
            max_size: self.options.max_chunk_size,
        }
    }

    fn pool_sample(&mut self, index: usize, sample: &Sample<'_>) -> Result<(), MuxError> {
        let timescale = self.tracks[index].config.timescale;
        let tolerance = self.options.max_async_tolerance;
        let lagging: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|&(i, t)| {
                i != index
                    && t.pool.first_dts().is_some_and(|first| {
                        chunk::exceeds_tolerance(
                            (first, t.config.timescale),
                            (sample.dts, timescale),
                            tolerance,
                        )
                    })
            })
            .map(|(i, _)| i)
            .collect();
        for i in lagging {
            self.flush_track(i)?;
        }

        let limits = self.chunk_limits();
        if self.tracks[index].pool.should_flush(
            sample.dts,
            sample.data.len(),
            sample.description_index,
            timescale,
            limits,
        ) {
            self.flush_track(index)?;
        }
        self.tracks[index]
            .pool
            .push(sample.dts, sample.data, sample.description_index);
        Ok(())
    }

    fn flush_track(&mut self, index: usize) -> Result<(), MuxError> {
        let Some(chunk) = self.tracks[index].pool.take() else {
            return Ok(());
        };
        let offset = self.position;
        self.write_at(offset, &chunk.data)?;
        self.position += chunk.data.len() as u64;

        let track = &mut self.tracks[index];
        track
            .chunks
            .record(offset, chunk.sample_count, chunk.description_index);
        log::debug!(
            "track {}: chunk #{} ({} samples, {} bytes) at {offset}",
            track.id,
            track.chunks.chunk_count(),
            chunk.sample_count,
            chunk.data.len()
        );
        Ok(())
    }

    /// 書き出し待ちのチャンクを、最も古いサンプルの時刻が早いトラックから順に書き出す
    fn flush_all_pools(&mut self) -> Result<(), MuxError> {
        let mut pending: Vec<(usize, i64, NonZeroU32)> = self
            .tracks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.pool.first_dts().map(|dts| (i, dts, t.config.timescale)))
            .collect();
        pending.sort_by(|a, b| {
            let lhs = a.1 as i128 * b.2.get() as i128;
            let rhs = b.1 as i128 * a.2.get() as i128;
            lhs.cmp(&rhs)
        });
        for (i, _, _) in pending {
            self.flush_track(i)?;
        }
        Ok(())
    }

    fn write_mdat_header(&mut self) -> Result<(), MuxError> {
        let payload_size = self.position - self.data_start;
        let header = BoxHeader::new(
            MdatBox::TYPE,
            BoxSize::with_payload_size(MdatBox::TYPE, payload_size),
        )
        .encode_to_vec()?;
        if header.len() > 8 {
            log::debug!("mdat box uses largesize: {payload_size} bytes of media data");
        }
        self.write_at(self.data_start - header.len() as u64, &header)
    }

    /// `moov` ボックスを配置して書き込み、その位置とボックスを返す
    fn write_moov(
        &mut self,
        timings: &[TrackTiming],
        relocate: bool,
    ) -> Result<(u64, MoovBox), MuxError> {
        if let Some((offset, size)) = self.reserved_area {
            let moov_box = self.build_moov(timings, 0)?;
            let bytes = moov_box.encode_to_vec()?;
            if relocate::fits_reserved_area(bytes.len() as u64, size) {
                self.write_at(offset, &bytes)?;
                let remaining = size - bytes.len() as u64;
                if remaining > 0 {
                    let free_box = FreeBox {
                        payload: vec![0; (remaining - 8) as usize],
                    };
                    self.write_at(offset + bytes.len() as u64, &free_box.encode_to_vec()?)?;
                }
                log::debug!(
                    "moov box ({} bytes) placed in the reserved area at {offset}",
                    bytes.len()
                );
                self.seek_to_end()?;
                return Ok((offset, moov_box));
            }
            log::warn!(
                "reserved area ({size} bytes) is too small for the moov box ({} bytes)",
                bytes.len()
            );
        }

        if relocate {
            let bytes = relocate::settle_moov(|shift| Ok(self.build_moov(timings, shift)?.encode_to_vec()?))?;
            let shift = bytes.len() as u64;
            let moov_box = self.build_moov(timings, shift)?;

            let buffer_size = self.options.relocation_buffer_size;
            let (start, end) = (self.ftyp_end, self.position);
            let writer = self.writer.as_mut().ok_or(MuxError::AlreadyFinalized)?;
            relocate::shift_forward(writer, start, end, shift, buffer_size)?;
            self.write_at(start, &bytes)?;
            self.position += shift;
            log::debug!("moov box ({shift} bytes) relocated to {start}");
            self.seek_to_end()?;
            return Ok((start, moov_box));
        }

        let moov_box = self.build_moov(timings, 0)?;
        let bytes = moov_box.encode_to_vec()?;
        let offset = self.position;
        self.write_at(offset, &bytes)?;
        self.position += bytes.len() as u64;
        log::debug!("moov box ({} bytes) placed at the end of file", bytes.len());
        Ok((offset, moov_box))
    }

    fn seek_to_end(&mut self) -> Result<(), MuxError> {
        let position = self.position;
        let writer = self.writer.as_mut().ok_or(MuxError::AlreadyFinalized)?;
        writer.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn build_mvhd_box(&self, duration: u64) -> MvhdBox {
        MvhdBox {
            creation_time: self.creation_time,
            modification_time: self.creation_time,
            timescale: self.options.movie_timescale,
            duration,
            rate: MvhdBox::DEFAULT_RATE,
            volume: MvhdBox::DEFAULT_VOLUME,
            matrix: MvhdBox::DEFAULT_MATRIX,
            next_track_id: self.next_track_id,
        }
    }

    /// 全てのチャンクオフセットに `shift` を加算した `moov` ボックスを構築する
    fn build_moov(&self, timings: &[TrackTiming], shift: u64) -> Result<MoovBox, MuxError> {
        let mut trak_boxes = Vec::with_capacity(self.tracks.len());
        for (track, timing) in self.tracks.iter().zip(timings) {
            let table = &track.table;
            let (sgpd_boxes, sbgp_boxes) = track.grouping.boxes(SampleGroupContext::SampleTable);
            let stbl_box = StblBox {
                stsd_box: StsdBox {
                    entries: track.sample_entries.clone(),
                },
                stts_box: table.stts_box(timing.last_delta),
                ctts_box: table.ctts_box(),
                cslg_box: table.cslg_box(timing.presentation_end),
                stsc_box: track.chunks.stsc_box(),
                stsz_box: table.stsz_box(),
                stco_or_co64_box: track.chunks.chunk_offset_box(shift),
                stss_box: table.stss_box(),
                stps_box: table.stps_box(),
                sdtp_box: table.sdtp_box(),
                sgpd_boxes,
                sbgp_boxes,
                unknown_boxes: Vec::new(),
            };
            trak_boxes.push(self.build_trak_box(track, timing, stbl_box));
        }

        let duration = timings.iter().map(|t| t.track_duration).max().unwrap_or(0);
        Ok(MoovBox {
            mvhd_box: self.build_mvhd_box(duration),
            trak_boxes,
            mvex_box: None,
            unknown_boxes: Vec::new(),
        })
    }

    fn build_trak_box(&self, track: &Track, timing: &TrackTiming, stbl_box: StblBox) -> TrakBox {
        let config = &track.config;
        let (width, height) = match config.kind {
            TrackKind::Video => (config.width, config.height),
            TrackKind::Audio => (0, 0),
        };
        let tkhd_box = TkhdBox {
            flag_track_enabled: true,
            flag_track_in_movie: true,
            flag_track_in_preview: false,
            flag_track_size_is_aspect_ratio: false,
            creation_time: self.creation_time,
            modification_time: self.creation_time,
            track_id: track.id,
            duration: timing.track_duration,
            layer: TkhdBox::DEFAULT_LAYER,
            alternate_group: TkhdBox::DEFAULT_ALTERNATE_GROUP,
            volume: match config.kind {
                TrackKind::Audio => TkhdBox::DEFAULT_AUDIO_VOLUME,
                TrackKind::Video => TkhdBox::DEFAULT_VIDEO_VOLUME,
            },
            matrix: TkhdBox::DEFAULT_MATRIX,
            width: FixedPointNumber::new(width as i16, 0),
            height: FixedPointNumber::new(height as i16, 0),
        };

        let edts_box = (!timing.edits.is_empty()).then(|| EdtsBox {
            elst_box: Some(ElstBox {
                entries: timing.edits.clone(),
            }),
            unknown_boxes: Vec::new(),
        });

        let mdhd_box = MdhdBox {
            creation_time: self.creation_time,
            modification_time: self.creation_time,
            timescale: config.timescale,
            duration: timing.media_duration,
            language: config.language,
        };
        let (handler_type, smhd_or_vmhd_box) = match config.kind {
            TrackKind::Audio => (HdlrBox::HANDLER_TYPE_SOUN, Either::A(SmhdBox::default())),
            TrackKind::Video => (HdlrBox::HANDLER_TYPE_VIDE, Either::B(VmhdBox::default())),
        };
        let hdlr_box = HdlrBox {
            handler_type,
            name: Utf8String::EMPTY.into_null_terminated_bytes(),
        };

        TrakBox {
            tkhd_box,
            edts_box,
            mdia_box: MdiaBox {
                mdhd_box,
                hdlr_box,
                minf_box: MinfBox {
                    smhd_or_vmhd_box: Some(smhd_or_vmhd_box),
                    dinf_box: track.data_information_box(),
                    stbl_box,
                    unknown_boxes: Vec::new(),
                },
                unknown_boxes: Vec::new(),
            },
            unknown_boxes: Vec::new(),
        }
    }

    /// フラグメント化されたファイル用の `moov` ボックスを構築する（サンプルテーブルは空になる）
    fn build_fragmented_moov(&self, fragment_duration: u64) -> MoovBox {
        let mut trak_boxes = Vec::with_capacity(self.tracks.len());
        let mut trex_boxes = Vec::with_capacity(self.tracks.len());
        for track in &self.tracks {
            let edits: Vec<ElstEntry> = track
                .edits
                .iter()
                .map(|e| e.to_elst_entry(0, track.config.timescale, self.options.movie_timescale))
                .collect();
            let timing = TrackTiming {
                last_delta: 0,
                media_duration: 0,
                track_duration: 0,
                presentation_end: 0,
                edits,
            };
            let stbl_box = StblBox {
                stsd_box: StsdBox {
                    entries: track.sample_entries.clone(),
                },
                stts_box: SttsBox {
                    entries: Vec::new(),
                },
                ctts_box: None,
                cslg_box: None,
                stsc_box: StscBox {
                    entries: Vec::new(),
                },
                stsz_box: StszBox::Variable {
                    entry_sizes: Vec::new(),
                },
                stco_or_co64_box: Either::A(StcoBox {
                    chunk_offsets: Vec::new(),
                }),
                stss_box: None,
                stps_box: None,
                sdtp_box: None,
                sgpd_boxes: Vec::new(),
                sbgp_boxes: Vec::new(),
                unknown_boxes: Vec::new(),
            };
            trak_boxes.push(self.build_trak_box(track, &timing, stbl_box));
            trex_boxes.push(TrexBox {
                track_id: track.id,
                default_sample_description_index: 1,
                default_sample_duration: 0,
                default_sample_size: 0,
                default_sample_flags: SampleFlags::new(0),
            });
        }

        MoovBox {
            mvhd_box: self.build_mvhd_box(0),
            trak_boxes,
            mvex_box: Some(MvexBox {
                // 後から尺を書き込んでもサイズが変わらないように、常に 64 bit 版を使う
                mehd_box: Some(MehdBox {
                    version: 1,
                    fragment_duration,
                }),
                trex_boxes,
                unknown_boxes: Vec::new(),
            }),
            unknown_boxes: Vec::new(),
        }
    }

    fn write_init_segment(&mut self) -> Result<(), MuxError> {
        let Some(state) = &self.fragmented else {
            return Ok(());
        };
        if state.moov_offset.is_some() {
            return Ok(());
        }
        self.validate()?;

        let bytes = self.build_fragmented_moov(0).encode_to_vec()?;
        let offset = self.position;
        self.write_at(offset, &bytes)?;
        self.position += bytes.len() as u64;
        log::debug!("initialization moov box ({} bytes) at {offset}", bytes.len());

        let track_ids: Vec<u32> = self.tracks.iter().map(|t| t.id).collect();
        if let Some(state) = &mut self.fragmented {
            state.moov_offset = Some(offset);
            state.moov_size = bytes.len();
            state.sequence_number = 1;
            for track_id in track_ids {
                state.index.add_track(track_id);
            }
        }
        Ok(())
    }

    fn append_fragmented(
        &mut self,
        index: usize,
        sample: &Sample<'_>,
        timing: SampleTiming,
    ) -> Result<(), MuxError> {
        self.write_init_segment()?;

        let has_video = self.tracks.iter().any(|t| t.config.kind == TrackKind::Video);
        let fragment_duration = self.options.fragment_duration;
        let track = &self.tracks[index];
        let is_cut_point = if has_video {
            track.config.kind == TrackKind::Video
                && sample.properties.random_access == RandomAccessKind::Sync
        } else {
            true
        };
        let elapsed = track.fragment.first_dts().is_some_and(|first| {
            (timing.dts - first) as u128 * 1_000_000_000
                >= fragment_duration.as_nanos() * track.config.timescale.get() as u128
        });
        let description_changed = track
            .fragment
            .description_index()
            .is_some_and(|d| d != sample.description_index);
        if (elapsed && is_cut_point) || description_changed {
            self.emit_fragment(Some((index, timing.dts)), None)?;
        }

        self.tracks[index].fragment.push(
            timing.dts,
            timing.cts,
            timing.composition_offset,
            sample.data,
            sample.description_index,
            &sample.properties,
        );
        Ok(())
    }

    /// 溜まっているサンプル群をフラグメントとして書き出す
    ///
    /// `next` は次に追記されるサンプルのトラックのインデックスと相対 dts、
    /// `final_deltas` はファイル末尾の場合の各トラックの最後のサンプルの尺。
    /// それ以外のトラックの最新のサンプルは、尺が確定していないので次のフラグメントに回される
    fn emit_fragment(
        &mut self,
        next: Option<(usize, u64)>,
        final_deltas: Option<&[u32]>,
    ) -> Result<(), MuxError> {
        let mut parts = Vec::new();
        for (i, track) in self.tracks.iter_mut().enumerate() {
            let boundary = match (next, final_deltas) {
                (_, Some(deltas)) => Boundary::End(deltas.get(i).copied().unwrap_or(1)),
                (Some((n, dts)), None) if n == i => Boundary::Before(dts),
                _ => Boundary::Carry,
            };
            if let Some(part) = track.fragment.take(track.id, boundary) {
                parts.push(part);
            }
        }
        if parts.is_empty() {
            return Ok(());
        }

        let sequence_number = self
            .fragmented
            .as_ref()
            .map_or(1, |state| state.sequence_number);
        let offset = self.position;
        let encoded = fragment::encode_fragment(sequence_number, offset, &parts)?;
        self.write_at(offset, &encoded.bytes)?;
        self.position += encoded.bytes.len() as u64;

        if let Some(state) = &mut self.fragmented {
            state.sequence_number = sequence_number
                .checked_add(1)
                .ok_or_else(|| Error::invalid_input("fragment sequence number overflow"))?;
            state.index.record(encoded.random_access_points);
        }
        Ok(())
    }

    fn finalize_fragmented(&mut self) -> Result<FinalizedMovie<W>, MuxError> {
        self.write_init_segment()?;

        let timings: Vec<TrackTiming> = self
            .tracks
            .iter()
            .map(|t| t.timing(self.options.movie_timescale, false))
            .collect();
        let final_deltas: Vec<u32> = timings.iter().map(|t| t.last_delta).collect();
        self.emit_fragment(None, Some(&final_deltas))?;

        let (moov_offset, expected, mfra) = match &self.fragmented {
            Some(FragmentedState {
                moov_offset: Some(offset),
                moov_size,
                index,
                ..
            }) => (
                *offset,
                *moov_size,
                self.options.write_mfra.then(|| index.encode_mfra()),
            ),
            _ => return Err(MuxError::AlreadyFinalized),
        };
        if let Some(mfra) = mfra {
            let mfra = mfra?;
            let offset = self.position;
            self.write_at(offset, &mfra)?;
            self.position += mfra.len() as u64;
            log::debug!("mfra box ({} bytes) at {offset}", mfra.len());
        }

        let fragment_duration = timings.iter().map(|t| t.track_duration).max().unwrap_or(0);
        let moov_box = self.build_fragmented_moov(fragment_duration);
        let bytes = moov_box.encode_to_vec()?;
        if bytes.len() != expected {
            return Err(MuxError::MoovSizeChanged {
                expected,
                actual: bytes.len(),
            });
        }
        self.write_at(moov_offset, &bytes)?;
        self.seek_to_end()?;

        let writer = self.writer.take().ok_or(MuxError::AlreadyFinalized)?;
        Ok(FinalizedMovie {
            writer,
            moov_size: bytes.len(),
            moov_box,
            moov_offset,
        })
    }
}

/// 確定済みのムービー
///
/// 書き込み済みの `moov` ボックスに対して、サイズの変わらない範囲での編集だけが行える
#[derive(Debug)]
pub struct FinalizedMovie<W> {
    writer: W,
    moov_box: MoovBox,
    moov_offset: u64,
    moov_size: usize,
}

impl<W: Write + Seek> FinalizedMovie<W> {
    /// 書き込まれた `moov` ボックスを返す
    pub fn moov_box(&self) -> &MoovBox {
        &self.moov_box
    }

    /// `moov` ボックスのファイル内での位置を返す
    pub fn moov_offset(&self) -> u64 {
        self.moov_offset
    }

    /// 書き込み先を返す
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// 書き込み済みの編集リストのエントリーを置き換える
    ///
    /// `index` は 0 始まりのエントリー位置。
    /// トラックとムービーの尺も再計算される。`moov` ボックスのサイズが変わる場合はエラーになる
    pub fn modify_edit(&mut self, track_id: u32, index: usize, edit: Edit) -> Result<(), MuxError> {
        edit.validate(track_id)?;
        let movie_timescale = self.moov_box.mvhd_box.timescale;
        let mut moov_box = self.moov_box.clone();

        let trak_box = moov_box
            .trak_boxes
            .iter_mut()
            .find(|t| t.tkhd_box.track_id == track_id)
            .ok_or(MuxError::InvalidTrackId { track_id })?;
        let mdhd_box = &trak_box.mdia_box.mdhd_box;
        let (media_timescale, media_duration) = (mdhd_box.timescale, mdhd_box.duration);
        let entries = trak_box
            .edts_box
            .as_mut()
            .and_then(|b| b.elst_box.as_mut())
            .map(|b| &mut b.entries)
            .ok_or(MuxError::InvalidEdit { track_id })?;
        let entry = entries
            .get_mut(index)
            .ok_or(MuxError::InvalidEdit { track_id })?;
        *entry = edit.to_elst_entry(media_duration, media_timescale, movie_timescale);
        trak_box.tkhd_box.duration = entries.iter().map(|e| e.edit_duration).sum();

        if moov_box.mvex_box.is_none() {
            moov_box.mvhd_box.duration = moov_box
                .trak_boxes
                .iter()
                .map(|t| t.tkhd_box.duration)
                .max()
                .unwrap_or(0);
        }

        let bytes = moov_box.encode_to_vec()?;
        if bytes.len() != self.moov_size {
            return Err(MuxError::MoovSizeChanged {
                expected: self.moov_size,
                actual: bytes.len(),
            });
        }
        let end = self.writer.seek(SeekFrom::End(0))?;
        self.writer.seek(SeekFrom::Start(self.moov_offset))?;
        self.writer.write_all(&bytes)?;
        self.writer.seek(SeekFrom::Start(end))?;
        self.moov_box = moov_box;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::boxes::{VisualSampleEntry, VisualSampleEntryFields};
    use crate::BoxType;

    fn video_entry() -> SampleEntry {
        SampleEntry::Visual(VisualSampleEntry {
            box_type: BoxType::Normal(*b"avc1"),
            visual: VisualSampleEntryFields::with_size(320, 240),
            unknown_boxes: Vec::new(),
            btrt_box: None,
        })
    }

    #[test]
    fn validation_failure_keeps_movie_usable() {
        let mut movie = Movie::new(Cursor::new(Vec::new()), MovieOptions::default()).expect("new");
        assert!(matches!(movie.finalize(false), Err(MuxError::NoTracks)));

        let track_id = movie.create_track(TrackConfig::default()).expect("track");
        assert!(matches!(
            movie.finalize(false),
            Err(MuxError::MissingSampleEntry { .. })
        ));

        movie.add_sample_entry(track_id, video_entry()).expect("entry");
        movie
            .append_sample(track_id, &Sample::new(&[1, 2, 3], 0))
            .expect("append");
        movie.finalize(false).expect("finalize");

        assert!(matches!(
            movie.append_sample(track_id, &Sample::new(&[1], 10)),
            Err(MuxError::AlreadyFinalized)
        ));
        assert!(matches!(
            movie.finalize(false),
            Err(MuxError::AlreadyFinalized)
        ));
    }

    #[test]
    fn audio_entry_on_video_track_is_rejected() {
        use crate::boxes::{AudioSampleEntry, AudioSampleEntryFields};

        let mut movie = Movie::new(Cursor::new(Vec::new()), MovieOptions::default()).expect("new");
        let track_id = movie.create_track(TrackConfig::default()).expect("track");
        let entry = SampleEntry::Audio(AudioSampleEntry {
            box_type: BoxType::Normal(*b"mp4a"),
            audio: AudioSampleEntryFields {
                data_reference_index: AudioSampleEntryFields::DEFAULT_DATA_REFERENCE_INDEX,
                channelcount: 1,
                samplesize: AudioSampleEntryFields::DEFAULT_SAMPLESIZE,
                samplerate: FixedPointNumber::new(44100u16, 0),
            },
            unknown_boxes: Vec::new(),
            btrt_box: None,
        });
        assert!(matches!(
            movie.add_sample_entry(track_id, entry),
            Err(MuxError::SampleEntryKindMismatch { track_id: 1 })
        ));
    }

    #[test]
    fn offset_promotion_is_per_track() {
        let mut movie = Movie::new(Cursor::new(Vec::new()), MovieOptions::default()).expect("new");
        for _ in 0..2 {
            let track_id = movie.create_track(TrackConfig::default()).expect("track");
            movie.add_sample_entry(track_id, video_entry()).expect("entry");
            movie
                .append_sample(track_id, &Sample::new(&[0; 10], 0))
                .expect("append");
        }
        movie.flush_all_pools().expect("flush");

        let timings: Vec<TrackTiming> = movie
            .tracks
            .iter()
            .map(|t| t.timing(movie.options.movie_timescale, true))
            .collect();
        // 一つ目のトラックのオフセットがちょうど u32::MAX になるようにずらす
        let shift = u32::MAX as u64 - movie.data_start;
        let moov_box = movie.build_moov(&timings, shift).expect("moov");
        let offsets = |i: usize| &moov_box.trak_boxes[i].mdia_box.minf_box.stbl_box.stco_or_co64_box;
        assert!(matches!(offsets(0), Either::A(b) if b.chunk_offsets == [u32::MAX]));
        assert!(matches!(offsets(1), Either::B(b) if b.chunk_offsets == [u32::MAX as u64 + 10]));
    }

    #[test]
    fn reserved_size_must_hold_a_box_header() {
        let options = MovieOptions {
            reserved_moov_box_size: 4,
            ..Default::default()
        };
        assert!(matches!(
            Movie::new(Cursor::new(Vec::new()), options),
            Err(MuxError::EncodeError(_))
        ));
    }
}
