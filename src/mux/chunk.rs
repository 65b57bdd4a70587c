//! チャンク単位でサンプルデータをまとめて書き出すための処理
use std::{num::NonZeroU32, time::Duration};

use crate::{
    Either, EntryList,
    boxes::{Co64Box, StcoBox, StscBox, StscEntry},
};

/// チャンクの区切りを決めるための上限値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkLimits {
    pub max_duration: Duration,
    pub max_size: usize,
}

/// 書き出し待ちのチャンク
#[derive(Debug)]
pub(crate) struct PooledChunk {
    pub data: Vec<u8>,
    pub sample_count: u32,
    pub description_index: NonZeroU32,
}

/// トラックごとの書き出し待ちサンプルデータ
#[derive(Debug, Default, Clone)]
pub(crate) struct ChunkPool {
    data: Vec<u8>,
    sample_count: u32,
    first_dts: i64,
    last_dts: i64,
    description_index: Option<NonZeroU32>,
}

impl ChunkPool {
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// プール中の最も古いサンプルの dts（空なら [`None`]）
    pub fn first_dts(&self) -> Option<i64> {
        (!self.is_empty()).then_some(self.first_dts)
    }

    /// 新しいサンプルを追加する前に、プール中のデータをチャンクとして書き出すべきかどうかを判定する
    ///
    /// 新しいサンプルの尺は直前のサンプル間隔と同じだと仮定して、チャンクの尺が上限を超えるかを見積もる
    pub fn should_flush(
        &self,
        dts: i64,
        size: usize,
        description_index: NonZeroU32,
        timescale: NonZeroU32,
        limits: ChunkLimits,
    ) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.description_index != Some(description_index) {
            return true;
        }
        if self.data.len().saturating_add(size) > limits.max_size {
            return true;
        }

        let estimated = (dts as i128 - self.first_dts as i128) + (dts as i128 - self.last_dts as i128);
        estimated * 1_000_000_000 > limits.max_duration.as_nanos() as i128 * timescale.get() as i128
    }

    pub fn push(&mut self, dts: i64, data: &[u8], description_index: NonZeroU32) {
        if self.is_empty() {
            self.first_dts = dts;
            self.description_index = Some(description_index);
        }
        self.last_dts = dts;
        self.sample_count += 1;
        self.data.extend_from_slice(data);
    }

    pub fn take(&mut self) -> Option<PooledChunk> {
        let description_index = self.description_index?;
        if self.is_empty() {
            return None;
        }
        let chunk = PooledChunk {
            data: std::mem::take(&mut self.data),
            sample_count: self.sample_count,
            description_index,
        };
        *self = Self::default();
        Some(chunk)
    }
}

/// 異なるタイムスケールを持つ二つの時刻の差が許容範囲を超えているかどうかを判定する
///
/// `oldest` が `latest` より `tolerance` を超えて古い場合に `true` を返す
pub(crate) fn exceeds_tolerance(
    oldest: (i64, NonZeroU32),
    latest: (i64, NonZeroU32),
    tolerance: Duration,
) -> bool {
    let (oldest_dts, oldest_timescale) = (oldest.0 as i128, oldest.1.get() as i128);
    let (latest_dts, latest_timescale) = (latest.0 as i128, latest.1.get() as i128);

    // latest / latest_timescale - oldest / oldest_timescale > tolerance
    let lag = latest_dts * oldest_timescale - oldest_dts * latest_timescale;
    lag * 1_000_000_000 > tolerance.as_nanos() as i128 * oldest_timescale * latest_timescale
}

/// 書き出し済みチャンクの位置と構成（`stco` / `co64` と `stsc` の元になる）
#[derive(Debug, Default, Clone)]
pub(crate) struct ChunkTable {
    offsets: EntryList<u64>,
    runs: EntryList<StscEntry>,
}

impl ChunkTable {
    pub fn chunk_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn record(&mut self, offset: u64, sample_count: u32, description_index: NonZeroU32) {
        self.offsets.push(offset);
        if let Some(last) = self.runs.last()
            && last.sample_per_chunk == sample_count
            && last.sample_description_index == description_index
        {
            return;
        }
        let first_chunk = NonZeroU32::MIN.saturating_add(self.offsets.len() as u32 - 1);
        self.runs.push(StscEntry {
            first_chunk,
            sample_per_chunk: sample_count,
            sample_description_index: description_index,
        });
    }

    pub fn stsc_box(&self) -> StscBox {
        StscBox {
            entries: self.runs.to_vec(),
        }
    }

    /// 全てのチャンクオフセットに `shift` を加算した結果が 32 bit に収まらないかどうか
    pub fn needs_co64(&self, shift: u64) -> bool {
        self.offsets
            .last()
            .is_some_and(|&offset| offset.saturating_add(shift) > u32::MAX as u64)
    }

    /// 全てのチャンクオフセットに `shift` を加算した `stco` もしくは `co64` ボックスを構築する
    pub fn chunk_offset_box(&self, shift: u64) -> Either<StcoBox, Co64Box> {
        if self.needs_co64(shift) {
            Either::B(Co64Box {
                chunk_offsets: self.offsets.iter().map(|&o| o + shift).collect(),
            })
        } else {
            Either::A(StcoBox {
                chunk_offsets: self.offsets.iter().map(|&o| (o + shift) as u32).collect(),
            })
        }
    }

    /// 各サンプルが属するチャンクのサンプルエントリーのインデックスを、サンプル順に走査する
    pub fn sample_description_indices(&self) -> impl Iterator<Item = NonZeroU32> + '_ {
        let chunk_count = self.offsets.len() as u32;
        let mut runs = self.runs.iter().peekable();
        std::iter::from_fn(move || {
            let run = runs.next()?;
            let next_first = runs
                .peek()
                .map_or(chunk_count + 1, |next| next.first_chunk.get());
            let chunks = next_first - run.first_chunk.get();
            Some(std::iter::repeat_n(
                run.sample_description_index,
                (chunks * run.sample_per_chunk) as usize,
            ))
        })
        .flatten()
    }
}
