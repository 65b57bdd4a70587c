//! エラーパスの Property-Based Testing
//!
//! 不正なサンプルの追記が拒否された場合に、ムービーの状態が変化しないことを確認する

use std::{io::Cursor, num::NonZeroU32};

use isobmff_muxer::{
    BoxType, FixedPointNumber,
    boxes::{AudioSampleEntry, AudioSampleEntryFields, SampleEntry},
    mux::{CompatibilityMode, Movie, MovieOptions, MuxError, Sample, TrackConfig},
};
use proptest::prelude::*;

fn mp4a_entry() -> SampleEntry {
    SampleEntry::Audio(AudioSampleEntry {
        box_type: BoxType::Normal(*b"mp4a"),
        audio: AudioSampleEntryFields {
            data_reference_index: AudioSampleEntryFields::DEFAULT_DATA_REFERENCE_INDEX,
            channelcount: 2,
            samplesize: AudioSampleEntryFields::DEFAULT_SAMPLESIZE,
            samplerate: FixedPointNumber::new(44100u16, 0),
        },
        unknown_boxes: Vec::new(),
        btrt_box: None,
    })
}

/// 追記操作
#[derive(Debug, Clone)]
enum Op {
    /// 正常なサンプル（直前のサンプルからの差分と、データサイズ）
    Valid(u32, usize),
    /// 空のサンプル
    Empty,
    /// 直前のサンプル以前の復号時刻を持つサンプル
    Backward(u32),
    /// 存在しないサンプルエントリーを参照するサンプル
    UnknownDescription(u32),
    /// 存在しないトラックへのサンプル
    UnknownTrack,
    /// 復号時刻との差が 32 bit に収まらない表示時刻を持つサンプル
    OffsetOverflow(u32),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (1u32..2000, 1usize..300).prop_map(|(delta, size)| Op::Valid(delta, size)),
        1 => Just(Op::Empty),
        1 => (0u32..1000).prop_map(Op::Backward),
        1 => (2u32..10).prop_map(Op::UnknownDescription),
        1 => Just(Op::UnknownTrack),
        1 => any::<u32>().prop_map(Op::OffsetOverflow),
    ]
}

/// 操作列を適用してファイルを作成する（`skip_invalid` なら不正な操作は適用しない）
fn run(ops: &[Op], mode: CompatibilityMode, skip_invalid: bool) -> Vec<u8> {
    let options = MovieOptions {
        mode,
        ..Default::default()
    };
    let mut movie = Movie::new(Cursor::new(Vec::new()), options).expect("new");
    let track_id = movie
        .create_track(TrackConfig::audio(NonZeroU32::new(44100).expect("non zero")))
        .expect("create track");
    movie.add_sample_entry(track_id, mp4a_entry()).expect("add sample entry");

    let mut next_dts = 0i64;
    let mut last_dts: Option<i64> = None;
    for op in ops {
        let (target, data, dts, cts, description_index) = match *op {
            Op::Valid(delta, size) => {
                let dts = next_dts;
                next_dts += delta as i64;
                last_dts = Some(dts);
                let data = vec![(dts % 251) as u8; size];
                movie
                    .append_sample(track_id, &Sample::new(&data, dts))
                    .expect("valid sample");
                continue;
            }
            _ if skip_invalid => continue,
            Op::Empty => (track_id, Vec::new(), next_dts, next_dts, 1),
            Op::Backward(back) => {
                let Some(last) = last_dts else {
                    continue;
                };
                let dts = last - back as i64;
                (track_id, vec![1], dts, dts, 1)
            }
            Op::UnknownDescription(index) => (track_id, vec![1], next_dts, next_dts, index),
            Op::UnknownTrack => (track_id + 1, vec![1], next_dts, next_dts, 1),
            Op::OffsetOverflow(extra) => {
                let cts = next_dts + i32::MAX as i64 + 1 + extra as i64;
                (track_id, vec![1], next_dts, cts, 1)
            }
        };
        let sample = Sample {
            cts,
            description_index: NonZeroU32::new(description_index).expect("non zero"),
            ..Sample::new(&data, dts)
        };
        let result = movie.append_sample(target, &sample);
        let rejected = matches!(
            result,
            Err(MuxError::EmptySample { .. }
                | MuxError::NonMonotonicTimestamp { .. }
                | MuxError::InvalidSampleDescriptionIndex { .. }
                | MuxError::InvalidTrackId { .. }
                | MuxError::CompositionOffsetOutOfRange { .. })
        );
        assert!(rejected, "unexpected result: {result:?}");
    }

    movie
        .finalize(false)
        .expect("finalize")
        .into_inner()
        .into_inner()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    // 拒否された追記は出力に影響しない
    #[test]
    fn rejected_samples_do_not_change_output(
        ops in prop::collection::vec(arb_op(), 0..200),
        mode in prop_oneof![
            Just(CompatibilityMode::Iso),
            Just(CompatibilityMode::QuickTime),
            Just(CompatibilityMode::Fragmented),
        ],
    ) {
        let with_errors = run(&ops, mode, false);
        let without_errors = run(&ops, mode, true);
        prop_assert_eq!(with_errors, without_errors);
    }
}
