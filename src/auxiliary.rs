//! MP4 の仕様とは直接は関係がない、実装上便利な補助的なコンポーネントを集めたモジュール

use std::num::NonZeroU32;

use crate::{
    Either,
    boxes::{StblBox, StszBox},
};

/// チャンクの構成（`stsc` ボックスを展開したもの）
#[derive(Debug, Clone, Copy)]
struct ChunkLayout {
    first_sample_index: u32, // 0 始まり
    sample_count: u32,
    description_index: NonZeroU32,
}

/// [`StblBox`] をラップして、その中の情報を簡単かつ効率的に取り出せるようにするための構造体
#[derive(Debug)]
pub struct SampleTableAccessor<'a> {
    stbl_box: &'a StblBox,
    sample_count: u32,
    stts_table: Vec<(u32, u64, u32)>, // (累計サンプル数、累計の尺、尺）
    ctts_table: Vec<(u32, i32)>,      // (累計サンプル数、オフセット）
    chunks: Vec<ChunkLayout>,
}

impl<'a> SampleTableAccessor<'a> {
    /// 引数で渡された [`StblBox`] 用の [`SampleTableAccessor`] インスタンスを生成する
    pub fn new(stbl_box: &'a StblBox) -> Self {
        let sample_count = match &stbl_box.stsz_box {
            StszBox::Fixed { sample_count, .. } => *sample_count,
            StszBox::Variable { entry_sizes } => entry_sizes.len() as u32,
        };

        let mut stts_table = Vec::with_capacity(stbl_box.stts_box.entries.len());
        let (mut count, mut dts) = (0u32, 0u64);
        for entry in &stbl_box.stts_box.entries {
            stts_table.push((count, dts, entry.sample_delta));
            count = count.saturating_add(entry.sample_count);
            dts = dts.saturating_add(entry.sample_count as u64 * entry.sample_delta as u64);
        }

        let mut ctts_table = Vec::new();
        let mut count = 0u32;
        for entry in stbl_box.ctts_box.iter().flat_map(|b| &b.entries) {
            ctts_table.push((count, entry.sample_offset));
            count = count.saturating_add(entry.sample_count);
        }

        let chunk_count = match &stbl_box.stco_or_co64_box {
            Either::A(b) => b.chunk_offsets.len() as u32,
            Either::B(b) => b.chunk_offsets.len() as u32,
        };
        let mut chunks = Vec::with_capacity(chunk_count as usize);
        let mut first_sample_index = 0u32;
        let runs = &stbl_box.stsc_box.entries;
        for (i, run) in runs.iter().enumerate() {
            let end = runs
                .get(i + 1)
                .map_or(chunk_count + 1, |next| next.first_chunk.get())
                .min(chunk_count + 1);
            for _ in run.first_chunk.get()..end {
                chunks.push(ChunkLayout {
                    first_sample_index,
                    sample_count: run.sample_per_chunk,
                    description_index: run.sample_description_index,
                });
                first_sample_index = first_sample_index.saturating_add(run.sample_per_chunk);
            }
        }

        Self {
            stbl_box,
            sample_count,
            stts_table,
            ctts_table,
            chunks,
        }
    }

    /// トラック内のサンプルの数を取得する
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// トラック内のチャンクの数を取得する
    pub fn chunk_count(&self) -> u32 {
        match &self.stbl_box.stco_or_co64_box {
            Either::A(b) => b.chunk_offsets.len() as u32,
            Either::B(b) => b.chunk_offsets.len() as u32,
        }
    }

    /// 指定されたサンプルの尺を取得する
    ///
    /// 存在しないサンプルが指定された場合には [`None`] が返される
    pub fn sample_duration(&self, sample_index: NonZeroU32) -> Option<u32> {
        self.decode_time(sample_index).map(|(_, duration)| duration)
    }

    /// 指定されたサンプルのデータサイズ（バイト数）を取得する
    ///
    /// 存在しないサンプルが指定された場合には [`None`] が返される
    pub fn sample_size(&self, sample_index: NonZeroU32) -> Option<u32> {
        if self.sample_count < sample_index.get() {
            return None;
        }

        let i = sample_index.get() as usize - 1;
        match &self.stbl_box.stsz_box {
            StszBox::Fixed { sample_size, .. } => Some(sample_size.get()),
            StszBox::Variable { entry_sizes } => entry_sizes.get(i).copied(),
        }
    }

    /// 指定されたサンプルが同期サンプルかどうかを判定する
    ///
    /// 存在しないサンプルが指定された場合には [`None`] が返される
    pub fn is_sync_sample(&self, sample_index: NonZeroU32) -> Option<bool> {
        if self.sample_count < sample_index.get() {
            return None;
        }

        let Some(stss_box) = &self.stbl_box.stss_box else {
            // stss ボックスが存在しない場合は全てが同期サンプル扱い
            return Some(true);
        };

        Some(stss_box.sample_numbers.binary_search(&sample_index).is_ok())
    }

    /// 指定されたチャンクのファイル内でのバイト位置を返す
    ///
    /// 存在しないチャンクが指定された場合には [`None`] が返される
    pub fn chunk_offset(&self, chunk_index: NonZeroU32) -> Option<u64> {
        let i = chunk_index.get() as usize - 1;
        match &self.stbl_box.stco_or_co64_box {
            Either::A(b) => b.chunk_offsets.get(i).copied().map(|v| v as u64),
            Either::B(b) => b.chunk_offsets.get(i).copied(),
        }
    }

    /// 指定されたサンプルの情報をまとめて取得する
    ///
    /// 存在しないサンプル、もしくはチャンクに属していないサンプルが指定された場合には [`None`] が返される
    pub fn get_sample(&self, sample_index: NonZeroU32) -> Option<SampleInfo> {
        let i = sample_index.get() - 1;
        let chunk_pos = match self.chunks.binary_search_by_key(&i, |c| c.first_sample_index) {
            Ok(pos) => pos,
            Err(0) => return None,
            Err(pos) => pos - 1,
        };
        let chunk = self.chunks.get(chunk_pos)?;
        if i >= chunk.first_sample_index.saturating_add(chunk.sample_count) {
            return None;
        }
        let chunk_index = NonZeroU32::MIN.saturating_add(chunk_pos as u32);

        let mut data_offset = self.chunk_offset(chunk_index)?;
        for j in chunk.first_sample_index..i {
            let size = self.sample_size(NonZeroU32::MIN.saturating_add(j))?;
            data_offset = data_offset.checked_add(size as u64)?;
        }
        let (dts, duration) = self.decode_time(sample_index)?;

        Some(SampleInfo {
            sample_index,
            chunk_index,
            description_index: chunk.description_index,
            data_offset,
            size: self.sample_size(sample_index)?,
            dts,
            duration,
            composition_offset: self.composition_offset(i),
            is_sync: self.is_sync_sample(sample_index)?,
        })
    }

    /// 全てのサンプルの情報を順番に走査する
    pub fn samples(&self) -> impl '_ + Iterator<Item = SampleInfo> {
        (0..self.sample_count).map_while(|i| self.get_sample(NonZeroU32::MIN.saturating_add(i)))
    }

    fn decode_time(&self, sample_index: NonZeroU32) -> Option<(u64, u32)> {
        if self.sample_count < sample_index.get() {
            return None;
        }
        let i = sample_index.get() - 1;
        let pos = match self.stts_table.binary_search_by_key(&i, |x| x.0) {
            Ok(pos) => pos,
            Err(0) => return None,
            Err(pos) => pos - 1,
        };
        let (first, base, delta) = *self.stts_table.get(pos)?;
        let dts = base.checked_add((i - first) as u64 * delta as u64)?;
        Some((dts, delta))
    }

    fn composition_offset(&self, i: u32) -> i32 {
        match self.ctts_table.binary_search_by_key(&i, |x| x.0) {
            Ok(pos) => self.ctts_table[pos].1,
            Err(0) => 0,
            Err(pos) => self.ctts_table[pos - 1].1,
        }
    }
}

/// [`SampleTableAccessor::get_sample()`] が返すサンプルの情報
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleInfo {
    /// サンプルのインデックス（1 始まり）
    pub sample_index: NonZeroU32,

    /// サンプルが属するチャンクのインデックス（1 始まり）
    pub chunk_index: NonZeroU32,

    /// サンプルエントリーのインデックス（1 始まり）
    pub description_index: NonZeroU32,

    /// ファイル内でのサンプルデータの位置
    pub data_offset: u64,

    /// サンプルデータのサイズ
    pub size: u32,

    /// 復号時刻（メディアのタイムスケール）
    pub dts: u64,

    /// 尺（メディアのタイムスケール）
    pub duration: u32,

    /// 復号時刻から表示時刻へのオフセット
    pub composition_offset: i32,

    /// 同期サンプルかどうか
    pub is_sync: bool,
}

impl SampleInfo {
    /// 表示時刻（メディアのタイムスケール）
    pub fn cts(&self) -> i64 {
        self.dts as i64 + self.composition_offset as i64
    }
}
