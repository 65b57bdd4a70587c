//! トラックの尺と編集リストを確定させる処理
use std::num::NonZeroU32;

use crate::{FixedPointNumber, boxes::ElstEntry};

use super::{MuxError, sample_table::SampleTableBuilder};

/// 編集リスト（`elst` ボックス）のエントリー
///
/// `duration` はムービーのタイムスケール、`media_time` はメディア（トラック）のタイムスケールで表す
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edit {
    /// 編集の尺（0 はメディアの末尾まで）
    pub duration: u64,

    /// 再生を開始するメディア内の時刻（[`Edit::EMPTY_MEDIA_TIME`] は空の編集を表す）
    pub media_time: i64,

    /// 再生レート
    pub rate: FixedPointNumber<i16, i16>,
}

impl Edit {
    /// 空の編集（何も表示しない区間）を表す `media_time` の値
    pub const EMPTY_MEDIA_TIME: i64 = -1;

    /// 通常の再生レート (1.0)
    pub const NORMAL_RATE: FixedPointNumber<i16, i16> = FixedPointNumber::new(1, 0);

    /// 通常の再生レートの編集を作成する
    pub const fn new(duration: u64, media_time: i64) -> Self {
        Self {
            duration,
            media_time,
            rate: Self::NORMAL_RATE,
        }
    }

    pub(crate) fn validate(&self, track_id: u32) -> Result<(), MuxError> {
        if self.media_time < Self::EMPTY_MEDIA_TIME {
            return Err(MuxError::InvalidEdit { track_id });
        }
        Ok(())
    }

    /// `presentation_end` はメディアのタイムスケールでの表示終了時刻
    pub(crate) fn to_elst_entry(
        self,
        presentation_end: u64,
        media_timescale: NonZeroU32,
        movie_timescale: NonZeroU32,
    ) -> ElstEntry {
        let edit_duration = if self.duration == 0 && self.media_time >= 0 {
            let remaining = presentation_end.saturating_sub(self.media_time as u64);
            rescale(remaining, media_timescale, movie_timescale)
        } else {
            self.duration
        };
        ElstEntry {
            edit_duration,
            media_time: self.media_time,
            media_rate: self.rate,
        }
    }
}

/// タイムスケールを変換する（最も近い整数に丸める）
pub(crate) fn rescale(value: u64, from: NonZeroU32, to: NonZeroU32) -> u64 {
    let from = from.get() as u128;
    let scaled = (value as u128 * to.get() as u128 + from / 2) / from;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// トラックのタイミングを確定させるための入力
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimingParams<'a> {
    pub last_sample_duration: Option<u32>,
    pub edits: &'a [Edit],
    pub leading_skip: u32,
    pub synthesize_edits: bool,
    pub media_timescale: NonZeroU32,
    pub movie_timescale: NonZeroU32,
}

/// 確定したトラックのタイミング
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrackTiming {
    /// 最後のサンプルの尺（メディアのタイムスケール）
    pub last_delta: u32,

    /// メディアの尺（メディアのタイムスケール）
    pub media_duration: u64,

    /// トラックの尺（ムービーのタイムスケール）
    pub track_duration: u64,

    /// 表示の終端（メディアのタイムスケール、延長前の最後の尺で求める）
    pub presentation_end: i64,

    pub edits: Vec<ElstEntry>,
}

impl TrackTiming {
    pub fn compute(table: &SampleTableBuilder, params: TimingParams<'_>) -> Self {
        let base_delta = params
            .last_sample_duration
            .or_else(|| table.last_delta())
            .unwrap_or(1);

        // 表示の終端が復号の終端より後ろにある場合は、最後のサンプルの尺を延ばしてメディアの尺に含める
        let mut last_delta = base_delta;
        let max_cts = table.max_cts();
        let last_dts = table.last_dts() as i64;
        if table.sample_count() > 0 && max_cts > last_dts {
            let extension = u32::try_from(max_cts - last_dts).unwrap_or(u32::MAX);
            last_delta = last_delta.saturating_add(extension);
        }

        let media_duration = table.media_duration(last_delta);
        let presentation_end = if table.sample_count() == 0 {
            0
        } else {
            max_cts.saturating_add(base_delta as i64)
        };
        let presentation_end_u64 = u64::try_from(presentation_end).unwrap_or(0);

        let edits: Vec<ElstEntry> = if !params.edits.is_empty() {
            params
                .edits
                .iter()
                .map(|edit| {
                    edit.to_elst_entry(
                        presentation_end_u64,
                        params.media_timescale,
                        params.movie_timescale,
                    )
                })
                .collect()
        } else if params.synthesize_edits
            && table.sample_count() > 0
            && (table.min_cts() != 0 || params.leading_skip > 0)
        {
            let media_time = table.min_cts().max(0) + params.leading_skip as i64;
            let remaining = presentation_end_u64.saturating_sub(media_time as u64);
            vec![ElstEntry {
                edit_duration: rescale(remaining, params.media_timescale, params.movie_timescale),
                media_time,
                media_rate: Edit::NORMAL_RATE,
            }]
        } else {
            Vec::new()
        };

        let track_duration = if edits.is_empty() {
            rescale(media_duration, params.media_timescale, params.movie_timescale)
        } else {
            edits.iter().map(|e| e.edit_duration).sum()
        };

        Self {
            last_delta,
            media_duration,
            track_duration,
            presentation_end,
            edits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Sample;

    fn timescale(v: u32) -> NonZeroU32 {
        NonZeroU32::new(v).expect("non zero")
    }

    fn table(samples: &[(i64, i64)]) -> SampleTableBuilder {
        let mut table = SampleTableBuilder::new();
        let data = [0u8; 4];
        for &(dts, cts) in samples {
            let mut s = Sample::new(&data, dts);
            s.cts = cts;
            let timing = table.check(1, &s).expect("check");
            table.append(dts, timing, 4, &s.properties, false);
        }
        table
    }

    fn params(edits: &[Edit]) -> TimingParams<'_> {
        TimingParams {
            last_sample_duration: None,
            edits,
            leading_skip: 0,
            synthesize_edits: true,
            media_timescale: timescale(1000),
            movie_timescale: timescale(1000),
        }
    }

    #[test]
    fn rescale_rounds_to_nearest() {
        assert_eq!(rescale(1, timescale(3), timescale(1000)), 333);
        assert_eq!(rescale(2, timescale(3), timescale(1000)), 667);
        assert_eq!(rescale(u64::MAX, timescale(1), timescale(2)), u64::MAX);
    }

    #[test]
    fn last_delta_fallbacks() {
        let t = table(&[(0, 0)]);
        assert_eq!(TrackTiming::compute(&t, params(&[])).last_delta, 1);

        let t = table(&[(0, 0), (30, 30)]);
        let timing = TrackTiming::compute(&t, params(&[]));
        assert_eq!(timing.last_delta, 30);
        assert_eq!(timing.media_duration, 60);
        assert!(timing.edits.is_empty());

        let mut p = params(&[]);
        p.last_sample_duration = Some(5);
        assert_eq!(TrackTiming::compute(&t, p).media_duration, 35);
    }

    #[test]
    fn reordered_tail_extends_last_delta() {
        // 最後のサンプルより前のサンプルが後ろに表示される
        let t = table(&[(0, 10), (10, 40), (20, 20)]);
        let timing = TrackTiming::compute(&t, params(&[]));
        assert_eq!(timing.last_delta, 30);
        assert_eq!(timing.media_duration, 50);

        // min_cts != 0 なので編集が合成される
        assert_eq!(timing.edits.len(), 1);
        assert_eq!(timing.edits[0].media_time, 10);
        assert_eq!(timing.edits[0].edit_duration, 40);
        assert_eq!(timing.track_duration, 40);
    }

    #[test]
    fn composition_end_ignores_extended_last_delta() {
        let t = table(&[(0, -20), (10, 30), (20, 10)]);
        let timing = TrackTiming::compute(&t, params(&[]));
        assert_eq!(timing.last_delta, 20);
        assert_eq!(timing.media_duration, 40);
        assert_eq!(timing.presentation_end, 40);

        let cslg = t.cslg_box(timing.presentation_end).expect("cslg");
        assert_eq!(cslg.composition_start_time, -20);
        assert_eq!(cslg.composition_end_time, 40);
    }

    #[test]
    fn explicit_edit_with_zero_duration_extends_to_end() {
        let t = table(&[(0, 0), (500, 500)]);
        let edits = [Edit::new(200, Edit::EMPTY_MEDIA_TIME), Edit::new(0, 100)];
        let mut p = params(&edits);
        p.movie_timescale = timescale(100);
        let timing = TrackTiming::compute(&t, p);
        assert_eq!(timing.edits[0].edit_duration, 200);
        assert_eq!(timing.edits[1].edit_duration, 90);
        assert_eq!(timing.track_duration, 290);
    }

    #[test]
    fn leading_skip_synthesizes_edit() {
        let t = table(&[(0, 0), (100, 100)]);
        let mut p = params(&[]);
        p.leading_skip = 50;
        let timing = TrackTiming::compute(&t, p);
        assert_eq!(timing.edits[0].media_time, 50);
        assert_eq!(timing.edits[0].edit_duration, 150);

        p.synthesize_edits = false;
        assert!(TrackTiming::compute(&t, p).edits.is_empty());
    }

    #[test]
    fn invalid_media_time_is_rejected() {
        assert!(Edit::new(0, -1).validate(1).is_ok());
        assert!(matches!(
            Edit::new(0, -2).validate(1),
            Err(MuxError::InvalidEdit { .. })
        ));
    }
}
