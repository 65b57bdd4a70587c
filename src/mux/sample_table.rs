//! サンプル単位のメタデータを `stbl` 配下の各テーブルへと蓄積する処理
use std::num::NonZeroU32;

use crate::{
    EntryList, Uint,
    boxes::{CslgBox, CttsBox, CttsEntry, SdtpBox, SdtpEntry, StpsBox, StssBox, StszBox, SttsBox, SttsEntry},
};

use super::{LeadingKind, MuxError, RandomAccessKind, Sample, SampleProperties};

/// 追記前の検証で得られるサンプルのタイミング情報
///
/// 時刻はトラックの最初のサンプルの dts を 0 とした相対値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SampleTiming {
    pub dts: u64,
    pub cts: i64,
    pub delta: Option<u32>,
    pub composition_offset: i32,
}

/// コンポジションオフセットの統計値（`cslg` ボックスの元になる）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompositionRange {
    min_cts: i64,
    max_cts: i64,
    least_offset: i32,
    greatest_offset: i32,
}

/// トラック単位のサンプルテーブル
///
/// `stts` / `ctts` / `stsz` のエントリー数の合計は、追記のたびに常にサンプル数と一致する。
/// 最後のサンプルの尺は次のサンプルが来るまで確定しないため、直前の尺（最初のサンプルなら 0）を仮に入れておく。
#[derive(Debug, Default, Clone)]
pub(crate) struct SampleTableBuilder {
    sample_count: u32,
    first_dts: Option<i64>,
    last_dts: u64,
    sizes: EntryList<u32>,
    decode_deltas: EntryList<SttsEntry>,
    composition_offsets: EntryList<CttsEntry>,
    has_composition_offsets: bool,
    composition: Option<CompositionRange>,
    sync_samples: Option<EntryList<NonZeroU32>>,
    partial_sync_samples: Option<EntryList<NonZeroU32>>,
    dependencies: Option<EntryList<SdtpEntry>>,
}

impl SampleTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// 最後のサンプルの相対 dts
    pub fn last_dts(&self) -> u64 {
        self.last_dts
    }

    /// 最後に確定したサンプル間の尺（サンプルが 2 つ未満なら [`None`]）
    pub fn last_delta(&self) -> Option<u32> {
        if self.sample_count < 2 {
            return None;
        }
        self.decode_deltas.last().map(|e| e.sample_delta)
    }

    pub fn min_cts(&self) -> i64 {
        self.composition.map_or(0, |c| c.min_cts)
    }

    pub fn max_cts(&self) -> i64 {
        self.composition.map_or(0, |c| c.max_cts)
    }

    pub fn sizes(&self) -> &EntryList<u32> {
        &self.sizes
    }

    /// テーブルを変更せずに、サンプルを追記可能かどうかを検証する
    pub fn check(&self, track_id: u32, sample: &Sample<'_>) -> Result<SampleTiming, MuxError> {
        if sample.data.is_empty() {
            return Err(MuxError::EmptySample { track_id });
        }
        if u32::try_from(sample.data.len()).is_err() {
            return Err(MuxError::EncodeError(crate::Error::invalid_input(
                "sample data size is too large",
            )));
        }
        if self.sample_count == u32::MAX {
            return Err(MuxError::EncodeError(crate::Error::invalid_input(
                "too many samples in a track",
            )));
        }

        let composition_offset = sample
            .cts
            .checked_sub(sample.dts)
            .and_then(|offset| i32::try_from(offset).ok())
            .ok_or(MuxError::CompositionOffsetOutOfRange {
                track_id,
                dts: sample.dts,
                cts: sample.cts,
            })?;

        let Some(first_dts) = self.first_dts else {
            return Ok(SampleTiming {
                dts: 0,
                cts: composition_offset as i64,
                delta: None,
                composition_offset,
            });
        };

        let previous_dts = first_dts.saturating_add_unsigned(self.last_dts);
        if sample.dts <= previous_dts {
            return Err(MuxError::NonMonotonicTimestamp {
                track_id,
                previous_dts,
                dts: sample.dts,
            });
        }

        let delta = sample
            .dts
            .checked_sub(previous_dts)
            .and_then(|d| u32::try_from(d).ok())
            .ok_or(MuxError::DeltaOutOfRange {
                track_id,
                previous_dts,
                dts: sample.dts,
            })?;
        let dts = self.last_dts + delta as u64;
        let cts = i64::try_from(dts)
            .ok()
            .and_then(|dts| dts.checked_add(composition_offset as i64))
            .ok_or(MuxError::CompositionOffsetOutOfRange {
                track_id,
                dts: sample.dts,
                cts: sample.cts,
            })?;

        Ok(SampleTiming {
            dts,
            cts,
            delta: Some(delta),
            composition_offset,
        })
    }

    /// 検証済みのサンプルをテーブルに追記する
    ///
    /// `timing` は直前の [`SampleTableBuilder::check()`] 呼び出しの結果である必要がある
    pub fn append(
        &mut self,
        raw_dts: i64,
        timing: SampleTiming,
        size: u32,
        properties: &SampleProperties,
        record_partial_sync: bool,
    ) {
        let sample_number = NonZeroU32::MIN.saturating_add(self.sample_count);

        self.sizes.push(size);

        match timing.delta {
            Some(delta) => {
                self.pop_decode_delta();
                self.push_decode_delta(delta);
                self.push_decode_delta(delta);
            }
            None => {
                self.first_dts = Some(raw_dts);
                self.push_decode_delta(0);
            }
        }
        self.last_dts = timing.dts;

        self.push_composition_offset(timing.composition_offset);
        self.composition = Some(match self.composition {
            None => CompositionRange {
                min_cts: timing.cts,
                max_cts: timing.cts,
                least_offset: timing.composition_offset,
                greatest_offset: timing.composition_offset,
            },
            Some(c) => CompositionRange {
                min_cts: c.min_cts.min(timing.cts),
                max_cts: c.max_cts.max(timing.cts),
                least_offset: c.least_offset.min(timing.composition_offset),
                greatest_offset: c.greatest_offset.max(timing.composition_offset),
            },
        });

        let is_sync = properties.random_access == RandomAccessKind::Sync;
        if !is_sync && self.sync_samples.is_none() {
            // それまでのサンプルは全て同期サンプルだった
            self.sync_samples = Some(
                (0..self.sample_count)
                    .map(|i| NonZeroU32::MIN.saturating_add(i))
                    .collect(),
            );
        }
        if let Some(list) = &mut self.sync_samples
            && is_sync
        {
            list.push(sample_number);
        }

        if record_partial_sync && properties.random_access == RandomAccessKind::PartialSync {
            self.partial_sync_samples
                .get_or_insert_with(EntryList::new)
                .push(sample_number);
        }

        let dependency = properties.sdtp_entry();
        if dependency != SdtpEntry::default() && self.dependencies.is_none() {
            self.dependencies = Some(
                std::iter::repeat_n(SdtpEntry::default(), self.sample_count as usize).collect(),
            );
        }
        if let Some(list) = &mut self.dependencies {
            list.push(dependency);
        }

        self.sample_count += 1;
    }

    fn push_decode_delta(&mut self, delta: u32) {
        if let Some(last) = self.decode_deltas.last_mut()
            && last.sample_delta == delta
        {
            last.sample_count += 1;
            return;
        }
        self.decode_deltas.push(SttsEntry {
            sample_count: 1,
            sample_delta: delta,
        });
    }

    fn pop_decode_delta(&mut self) {
        if let Some(last) = self.decode_deltas.last_mut() {
            last.sample_count -= 1;
            if last.sample_count == 0 {
                self.decode_deltas.pop();
            }
        }
    }

    fn push_composition_offset(&mut self, offset: i32) {
        if offset != 0 {
            self.has_composition_offsets = true;
        }
        if let Some(last) = self.composition_offsets.last_mut()
            && last.sample_offset == offset
        {
            last.sample_count += 1;
            return;
        }
        self.composition_offsets.push(CttsEntry {
            sample_count: 1,
            sample_offset: offset,
        });
    }

    /// 最後のサンプルの尺を `last_delta` に置き換えた `stts` ボックスを構築する
    pub fn stts_box(&self, last_delta: u32) -> SttsBox {
        let mut entries = self.decode_deltas.to_vec();
        if let Some(last) = entries.last_mut() {
            if last.sample_delta != last_delta {
                last.sample_count -= 1;
                if last.sample_count == 0 {
                    entries.pop();
                }
                match entries.last_mut() {
                    Some(e) if e.sample_delta == last_delta => e.sample_count += 1,
                    _ => entries.push(SttsEntry {
                        sample_count: 1,
                        sample_delta: last_delta,
                    }),
                }
            }
        }
        SttsBox { entries }
    }

    /// 全てのオフセットが 0 の場合は [`None`] を返す
    pub fn ctts_box(&self) -> Option<CttsBox> {
        self.has_composition_offsets.then(|| CttsBox {
            entries: self.composition_offsets.to_vec(),
        })
    }

    /// 負のコンポジションオフセットが存在する場合にのみ `cslg` ボックスを構築する
    ///
    /// `presentation_end` は最後に表示されるサンプルの表示終了時刻
    pub fn cslg_box(&self, presentation_end: i64) -> Option<CslgBox> {
        let c = self.composition?;
        if c.least_offset >= 0 {
            return None;
        }
        Some(CslgBox {
            composition_to_dts_shift: -(c.least_offset as i64),
            least_decode_to_display_delta: c.least_offset as i64,
            greatest_decode_to_display_delta: c.greatest_offset as i64,
            composition_start_time: c.min_cts,
            composition_end_time: presentation_end,
        })
    }

    /// 全サンプルが同じサイズの場合は固定サイズ形式にする
    pub fn stsz_box(&self) -> StszBox {
        if let Some(&first) = self.sizes.first()
            && let Some(sample_size) = NonZeroU32::new(first)
            && self.sizes.iter().all(|&s| s == first)
        {
            return StszBox::Fixed {
                sample_size,
                sample_count: self.sample_count,
            };
        }
        StszBox::Variable {
            entry_sizes: self.sizes.to_vec(),
        }
    }

    pub fn stss_box(&self) -> Option<StssBox> {
        self.sync_samples.as_ref().map(|list| StssBox {
            sample_numbers: list.to_vec(),
        })
    }

    pub fn stps_box(&self) -> Option<StpsBox> {
        self.partial_sync_samples.as_ref().map(|list| StpsBox {
            sample_numbers: list.to_vec(),
        })
    }

    pub fn sdtp_box(&self) -> Option<SdtpBox> {
        self.dependencies.as_ref().map(|list| SdtpBox {
            entries: list.to_vec(),
        })
    }

    /// 最後のサンプルの尺を `last_delta` とした場合のメディアの尺（メディアタイムスケール単位）
    pub fn media_duration(&self, last_delta: u32) -> u64 {
        if self.sample_count == 0 {
            return 0;
        }
        self.last_dts + last_delta as u64
    }

    /// 各サンプルの尺を順番に走査する（最後のサンプルは `last_delta` で置き換える）
    pub fn sample_deltas(&self, last_delta: u32) -> impl Iterator<Item = u32> + '_ {
        let count = self.sample_count as usize;
        self.decode_deltas
            .iter()
            .flat_map(|e| std::iter::repeat_n(e.sample_delta, e.sample_count as usize))
            .enumerate()
            .map(move |(i, d)| if i + 1 == count { last_delta } else { d })
    }
}

impl SampleProperties {
    /// `sdtp` ボックス（および `trun` のサンプルフラグ）用の依存関係情報に変換する
    pub(crate) fn sdtp_entry(&self) -> SdtpEntry {
        let is_leading = match self.leading {
            LeadingKind::Unknown => 0,
            LeadingKind::Undecodable => 1,
            LeadingKind::NotLeading => 2,
            LeadingKind::Decodable => 3,
        };
        let flag = |v: Option<bool>, if_true: u8, if_false: u8| match v {
            None => 0,
            Some(true) => if_true,
            Some(false) => if_false,
        };
        SdtpEntry {
            is_leading: Uint::new(is_leading),
            sample_depends_on: Uint::new(flag(self.independent, 2, 1)),
            sample_is_depended_on: Uint::new(flag(self.disposable, 2, 1)),
            sample_has_redundancy: Uint::new(flag(self.redundant, 1, 2)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(data: &[u8], dts: i64, cts: i64, sync: bool) -> Sample<'_> {
        let mut s = Sample::new(data, dts);
        s.cts = cts;
        if !sync {
            s.properties.random_access = RandomAccessKind::None;
        }
        s
    }

    fn append(table: &mut SampleTableBuilder, s: &Sample<'_>) -> Result<(), MuxError> {
        let timing = table.check(1, s)?;
        table.append(s.dts, timing, s.data.len() as u32, &s.properties, false);
        Ok(())
    }

    fn counts_are_consistent(table: &SampleTableBuilder) -> bool {
        let stts: u32 = table.decode_deltas.iter().map(|e| e.sample_count).sum();
        let ctts: u32 = table.composition_offsets.iter().map(|e| e.sample_count).sum();
        stts == table.sample_count
            && ctts == table.sample_count
            && table.sizes.len() == table.sample_count as usize
    }

    #[test]
    fn provisional_delta_keeps_counts_consistent() {
        let mut table = SampleTableBuilder::new();
        let data = [0u8; 4];
        for (i, dts) in [100, 130, 160, 200, 240].into_iter().enumerate() {
            append(&mut table, &sample(&data, dts, dts, true)).expect("append");
            assert!(counts_are_consistent(&table), "after sample {i}");
        }

        assert_eq!(table.last_dts(), 140);
        assert_eq!(table.last_delta(), Some(40));
        assert_eq!(
            table.stts_box(40).entries,
            [
                SttsEntry {
                    sample_count: 2,
                    sample_delta: 30
                },
                SttsEntry {
                    sample_count: 3,
                    sample_delta: 40
                },
            ]
        );
        assert_eq!(table.stts_box(10).entries.last().map(|e| e.sample_delta), Some(10));
        assert!(table.ctts_box().is_none());
        assert!(table.stss_box().is_none());
        assert_eq!(table.media_duration(40), 180);
    }

    #[test]
    fn rejected_sample_leaves_table_untouched() {
        let mut table = SampleTableBuilder::new();
        let data = [1u8; 8];
        append(&mut table, &sample(&data, 10, 10, true)).expect("append");
        append(&mut table, &sample(&data, 20, 20, true)).expect("append");
        let before = table.clone();

        assert!(matches!(
            append(&mut table, &sample(&data, 20, 20, true)),
            Err(MuxError::NonMonotonicTimestamp { .. })
        ));
        assert!(matches!(
            append(&mut table, &sample(&data, 15, 15, true)),
            Err(MuxError::NonMonotonicTimestamp { .. })
        ));
        assert!(matches!(
            append(&mut table, &sample(&[], 30, 30, true)),
            Err(MuxError::EmptySample { .. })
        ));
        assert!(matches!(
            append(&mut table, &sample(&data, 30, 30 + i32::MAX as i64 + 1, true)),
            Err(MuxError::CompositionOffsetOutOfRange { .. })
        ));
        assert!(matches!(
            append(&mut table, &sample(&data, 20 + u32::MAX as i64 + 1, 0, true)),
            Err(MuxError::CompositionOffsetOutOfRange { .. } | MuxError::DeltaOutOfRange { .. })
        ));

        assert_eq!(table.sample_count(), before.sample_count());
        assert_eq!(table.stts_box(10), before.stts_box(10));
        assert_eq!(table.stsz_box(), before.stsz_box());
    }

    #[test]
    fn sync_table_is_created_lazily_with_backfill() {
        let mut table = SampleTableBuilder::new();
        let data = [0u8; 2];
        for i in 0..5 {
            append(&mut table, &sample(&data, i * 10, i * 10, i != 3)).expect("append");
        }
        let numbers: Vec<u32> = table
            .stss_box()
            .expect("stss")
            .sample_numbers
            .iter()
            .map(|n| n.get())
            .collect();
        assert_eq!(numbers, [1, 2, 3, 5]);
    }

    #[test]
    fn negative_offsets_produce_cslg() {
        let mut table = SampleTableBuilder::new();
        let data = [0u8; 2];
        append(&mut table, &sample(&data, 0, -20, true)).expect("append");
        append(&mut table, &sample(&data, 10, 30, false)).expect("append");
        append(&mut table, &sample(&data, 20, 10, false)).expect("append");

        let ctts = table.ctts_box().expect("ctts");
        assert_eq!(
            ctts.entries.iter().map(|e| e.sample_offset).collect::<Vec<_>>(),
            [-20, 20, -10]
        );
        let cslg = table.cslg_box(40).expect("cslg");
        assert_eq!(cslg.composition_to_dts_shift, 20);
        assert_eq!(cslg.least_decode_to_display_delta, -20);
        assert_eq!(cslg.greatest_decode_to_display_delta, 20);
        assert_eq!(cslg.composition_start_time, -20);
        assert_eq!(cslg.composition_end_time, 40);
    }

    #[test]
    fn fixed_and_variable_sample_sizes() {
        let mut table = SampleTableBuilder::new();
        append(&mut table, &sample(&[0; 3], 0, 0, true)).expect("append");
        append(&mut table, &sample(&[0; 3], 1, 1, true)).expect("append");
        assert!(matches!(table.stsz_box(), StszBox::Fixed { sample_count: 2, .. }));

        append(&mut table, &sample(&[0; 5], 2, 2, true)).expect("append");
        assert_eq!(
            table.stsz_box(),
            StszBox::Variable {
                entry_sizes: vec![3, 3, 5]
            }
        );
    }
}
