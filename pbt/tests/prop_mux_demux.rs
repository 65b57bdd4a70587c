//! Mux → Demux Roundtrip の Property-Based Testing
//!
//! Movie で作成したファイルを Mp4FileReader で読み取り、
//! 元のサンプル列と一致することを確認するテスト

use std::{io::Cursor, num::NonZeroU32, time::Duration};

use isobmff_muxer::{
    BoxType, Either, FixedPointNumber, TrackKind,
    aux::SampleTableAccessor,
    boxes::{
        AudioSampleEntry, AudioSampleEntryFields, SampleEntry, VisualSampleEntry,
        VisualSampleEntryFields,
    },
    demux::Mp4FileReader,
    mux::{CompatibilityMode, Movie, MovieOptions, Sample, SampleProperties, TrackConfig},
};
use proptest::prelude::*;

fn vp09_entry(width: u16, height: u16) -> SampleEntry {
    SampleEntry::Visual(VisualSampleEntry {
        box_type: BoxType::Normal(*b"vp09"),
        visual: VisualSampleEntryFields::with_size(width, height),
        unknown_boxes: Vec::new(),
        btrt_box: None,
    })
}

fn opus_entry(channel_count: u16) -> SampleEntry {
    SampleEntry::Audio(AudioSampleEntry {
        box_type: BoxType::Normal(*b"Opus"),
        audio: AudioSampleEntryFields {
            data_reference_index: AudioSampleEntryFields::DEFAULT_DATA_REFERENCE_INDEX,
            channelcount: channel_count,
            samplesize: AudioSampleEntryFields::DEFAULT_SAMPLESIZE,
            samplerate: FixedPointNumber::new(48000u16, 0),
        },
        unknown_boxes: Vec::new(),
        btrt_box: None,
    })
}

/// 入力サンプル情報
#[derive(Debug, Clone)]
struct SampleInfo {
    delta: u32,
    size: usize,
    sync: bool,
    composition_offset: u32,
}

/// 入力トラック情報
#[derive(Debug, Clone)]
struct TrackInfo {
    kind: TrackKind,
    timescale: u32,
    samples: Vec<SampleInfo>,
}

fn arb_video_sample() -> impl Strategy<Value = SampleInfo> {
    (1u32..5000, 1usize..2000, any::<bool>(), 0u32..6000).prop_map(
        |(delta, size, sync, composition_offset)| SampleInfo {
            delta,
            size,
            sync,
            composition_offset,
        },
    )
}

fn arb_audio_sample() -> impl Strategy<Value = SampleInfo> {
    (prop_oneof![Just(960u32), Just(1024), 1u32..2000], 1usize..500).prop_map(|(delta, size)| {
        SampleInfo {
            delta,
            size,
            sync: true,
            composition_offset: 0,
        }
    })
}

fn arb_track() -> impl Strategy<Value = TrackInfo> {
    prop_oneof![
        (
            prop_oneof![Just(90000u32), Just(1000), 1u32..100000],
            prop::collection::vec(arb_video_sample(), 1..120)
        )
            .prop_map(|(timescale, samples)| TrackInfo {
                kind: TrackKind::Video,
                timescale,
                samples,
            }),
        (
            prop_oneof![Just(48000u32), Just(44100), 1u32..100000],
            prop::collection::vec(arb_audio_sample(), 1..200)
        )
            .prop_map(|(timescale, samples)| TrackInfo {
                kind: TrackKind::Audio,
                timescale,
                samples,
            }),
    ]
}

fn arb_mode() -> impl Strategy<Value = CompatibilityMode> {
    prop_oneof![
        Just(CompatibilityMode::Iso),
        Just(CompatibilityMode::QuickTime),
        Just(CompatibilityMode::Fragmented),
    ]
}

/// サンプルデータの中身（トラックとサンプルの位置から決まる）
fn sample_data(track_index: usize, sample_index: usize, size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (track_index * 31 + sample_index * 7 + i) as u8)
        .collect()
}

/// 各トラックのサンプルを時刻順に交互に追記してファイルを作成する
fn build_movie(
    tracks: &[TrackInfo],
    options: MovieOptions,
    relocate: bool,
) -> Result<(Vec<u32>, Vec<u8>), TestCaseError> {
    let mut movie =
        Movie::new(Cursor::new(Vec::new()), options).map_err(|e| TestCaseError::fail(e.to_string()))?;
    let mut track_ids = Vec::new();
    for track in tracks {
        let timescale = NonZeroU32::new(track.timescale).expect("non zero");
        let (config, entry) = match track.kind {
            TrackKind::Video => (TrackConfig::video(timescale, 640, 480), vp09_entry(640, 480)),
            TrackKind::Audio => (TrackConfig::audio(timescale), opus_entry(2)),
        };
        let track_id = movie.create_track(config).expect("create track");
        movie.add_sample_entry(track_id, entry).expect("add sample entry");
        track_ids.push(track_id);
    }

    let mut cursors = vec![(0usize, 0i64); tracks.len()];
    loop {
        // ムービー時間で最も早いサンプルを持つトラックを選ぶ
        let next = cursors
            .iter()
            .enumerate()
            .filter(|(i, (n, _))| *n < tracks[*i].samples.len())
            .min_by_key(|(i, (_, dts))| *dts as i128 * 1_000_000 / tracks[*i].timescale as i128)
            .map(|(i, _)| i);
        let Some(i) = next else {
            break;
        };

        let (n, dts) = cursors[i];
        let info = &tracks[i].samples[n];
        let data = sample_data(i, n, info.size);
        let sample = Sample {
            cts: dts + info.composition_offset as i64,
            properties: if info.sync {
                SampleProperties::SYNC
            } else {
                SampleProperties::default()
            },
            ..Sample::new(&data, dts)
        };
        movie
            .append_sample(track_ids[i], &sample)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        cursors[i] = (n + 1, dts + info.delta as i64);
    }

    for (track, track_id) in tracks.iter().zip(&track_ids) {
        let last = track.samples.last().expect("non empty");
        movie
            .set_last_sample_duration(*track_id, last.delta)
            .expect("set last sample duration");
    }

    let finalized = movie
        .finalize(relocate)
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    Ok((track_ids, finalized.into_inner().into_inner()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // 書き込んだサンプルの時刻・属性・データがそのまま読み出せる
    #[test]
    fn mux_demux_roundtrip(
        tracks in prop::collection::vec(arb_track(), 1..4),
        mode in arb_mode(),
        relocate in any::<bool>(),
        max_chunk_millis in 1u64..2000,
    ) {
        let options = MovieOptions {
            mode,
            max_chunk_duration: Duration::from_millis(max_chunk_millis),
            ..Default::default()
        };
        let (track_ids, bytes) = build_movie(&tracks, options, relocate)?;

        let mut reader = Mp4FileReader::read(Cursor::new(bytes)).expect("read");
        prop_assert_eq!(reader.is_fragmented(), mode == CompatibilityMode::Fragmented);
        prop_assert_eq!(reader.tracks().len(), tracks.len());

        for (i, (track, track_id)) in tracks.iter().zip(&track_ids).enumerate() {
            let demux_track = reader
                .tracks()
                .iter()
                .find(|t| t.track_id == *track_id)
                .cloned()
                .expect("track");
            prop_assert_eq!(demux_track.kind, Some(track.kind));
            prop_assert_eq!(demux_track.timescale.get(), track.timescale);

            let samples = reader.samples(*track_id).expect("samples").to_vec();
            prop_assert_eq!(samples.len(), track.samples.len());

            let mut dts = 0u64;
            for (n, (sample, info)) in samples.iter().zip(&track.samples).enumerate() {
                prop_assert_eq!(sample.dts, dts);
                prop_assert_eq!(sample.cts, dts as i64 + info.composition_offset as i64);
                prop_assert_eq!(sample.duration, info.delta);
                prop_assert_eq!(sample.is_sync, info.sync);
                prop_assert_eq!(sample.size as usize, info.size);
                prop_assert_eq!(reader.read_sample_data(sample).expect("data"), sample_data(i, n, info.size));
                dts += info.delta as u64;
            }
            if mode != CompatibilityMode::Fragmented {
                prop_assert_eq!(demux_track.media_duration, dts);
            }
        }
    }

    // サンプルテーブルから引いた情報が Mp4FileReader の結果と一致する
    #[test]
    fn sample_table_accessor_matches_reader(
        tracks in prop::collection::vec(arb_track(), 1..3),
        reserved in prop_oneof![Just(0u64), 8u64..4096],
    ) {
        let options = MovieOptions {
            reserved_moov_box_size: reserved,
            ..Default::default()
        };
        let (track_ids, bytes) = build_movie(&tracks, options, false)?;
        let reader = Mp4FileReader::read(Cursor::new(bytes)).expect("read");

        for trak_box in &reader.moov_box().trak_boxes {
            let track_id = trak_box.tkhd_box.track_id;
            prop_assert!(track_ids.contains(&track_id));

            let stbl_box = &trak_box.mdia_box.minf_box.stbl_box;
            let accessor = SampleTableAccessor::new(stbl_box);
            let samples = reader.samples(track_id).expect("samples");
            prop_assert_eq!(accessor.sample_count() as usize, samples.len());

            let infos: Vec<_> = accessor.samples().collect();
            prop_assert_eq!(infos.len(), samples.len());
            for (info, sample) in infos.iter().zip(samples) {
                prop_assert_eq!(info.data_offset, sample.data_offset);
                prop_assert_eq!(info.size, sample.size);
                prop_assert_eq!(info.dts, sample.dts);
                prop_assert_eq!(info.cts(), sample.cts);
                prop_assert_eq!(info.is_sync, sample.is_sync);
            }

            // チャンクオフセットは昇順に並ぶ
            let offsets: Vec<u64> = match &stbl_box.stco_or_co64_box {
                Either::A(b) => b.chunk_offsets.iter().map(|&v| v as u64).collect(),
                Either::B(b) => b.chunk_offsets.clone(),
            };
            prop_assert!(offsets.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(offsets.len() as u32, accessor.chunk_count());
        }
    }
}
