//! サンプルエントリーごとのビットレート（`btrt` ボックスの値）を算出する処理
use std::{collections::VecDeque, num::NonZeroU32};

use crate::boxes::{BtrtBox, SampleEntry};

/// 一つのサンプルエントリーに属するサンプル群の統計
#[derive(Debug, Default)]
struct BitrateWindow {
    window: VecDeque<(u64, u64)>,
    window_bytes: u64,
    max_window_bytes: u64,
    total_bytes: u64,
    total_duration: u64,
    max_sample_size: u32,
}

impl BitrateWindow {
    fn push(&mut self, dts: u64, size: u32, duration: u32, window_length: u64) {
        self.window.push_back((dts, size as u64));
        self.window_bytes += size as u64;
        while let Some(&(front_dts, front_size)) = self.window.front()
            && front_dts + window_length <= dts
        {
            self.window.pop_front();
            self.window_bytes -= front_size;
        }
        self.max_window_bytes = self.max_window_bytes.max(self.window_bytes);
        self.total_bytes += size as u64;
        self.total_duration += duration as u64;
        self.max_sample_size = self.max_sample_size.max(size);
    }

    fn to_btrt_box(&self, timescale: NonZeroU32) -> BtrtBox {
        let avg_bitrate = if self.total_duration == 0 {
            0
        } else {
            self.total_bytes as u128 * 8 * timescale.get() as u128 / self.total_duration as u128
        };
        BtrtBox {
            buffer_size_db: self.max_sample_size,
            max_bitrate: u32::try_from(self.max_window_bytes.saturating_mul(8)).unwrap_or(u32::MAX),
            avg_bitrate: u32::try_from(avg_bitrate).unwrap_or(u32::MAX),
        }
    }
}

/// 各サンプルエントリーの `btrt` ボックスの値を更新する
///
/// 窓幅は復号時刻で 1 秒。`btrt` ボックスを持たないサンプルエントリーは変更しない。
/// 入力が同じなら何度呼び出しても同じ結果になる。
pub(crate) fn update_bitrates<D, S, T>(
    entries: &mut [SampleEntry],
    timescale: NonZeroU32,
    description_indices: D,
    sizes: S,
    durations: T,
) where
    D: IntoIterator<Item = NonZeroU32>,
    S: IntoIterator<Item = u32>,
    T: IntoIterator<Item = u32>,
{
    let mut windows: Vec<BitrateWindow> = entries.iter().map(|_| BitrateWindow::default()).collect();
    let window_length = timescale.get() as u64;

    let mut dts = 0u64;
    let samples = description_indices.into_iter().zip(sizes).zip(durations);
    for ((description_index, size), duration) in samples {
        if let Some(window) = windows.get_mut(description_index.get() as usize - 1) {
            window.push(dts, size, duration, window_length);
        }
        dts += duration as u64;
    }

    for (entry, window) in entries.iter_mut().zip(&windows) {
        if let Some(btrt_box) = entry.btrt_box_mut() {
            *btrt_box = window.to_btrt_box(timescale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::{AudioSampleEntry, AudioSampleEntryFields};
    use crate::{BoxType, FixedPointNumber};

    fn audio_entry() -> SampleEntry {
        SampleEntry::Audio(AudioSampleEntry {
            box_type: BoxType::Normal(*b"Opus"),
            audio: AudioSampleEntryFields {
                data_reference_index: AudioSampleEntryFields::DEFAULT_DATA_REFERENCE_INDEX,
                channelcount: 2,
                samplesize: AudioSampleEntryFields::DEFAULT_SAMPLESIZE,
                samplerate: FixedPointNumber::new(48000u16, 0),
            },
            unknown_boxes: Vec::new(),
            btrt_box: Some(BtrtBox {
                buffer_size_db: 0,
                max_bitrate: 0,
                avg_bitrate: 0,
            }),
        })
    }

    #[test]
    fn window_and_average() {
        let timescale = NonZeroU32::new(10).expect("non zero");
        let mut entries = vec![audio_entry()];
        // 0.5 秒間隔で 100, 300, 100, 100 バイト
        let sizes = [100, 300, 100, 100];
        let run = |entries: &mut [SampleEntry]| {
            update_bitrates(
                entries,
                timescale,
                std::iter::repeat(NonZeroU32::MIN),
                sizes,
                [5, 5, 5, 5],
            )
        };
        run(&mut entries);
        let first = entries[0].btrt_box().cloned();
        assert_eq!(
            first,
            Some(BtrtBox {
                buffer_size_db: 300,
                max_bitrate: 400 * 8,
                avg_bitrate: 600 * 8 / 2,
            })
        );

        run(&mut entries);
        assert_eq!(entries[0].btrt_box().cloned(), first);
    }
}
