//! サンプルテーブル構築の Property-Based Testing
//!
//! 任意のサンプル列に対して、各テーブルの件数の整合性、サンプルグループの重複排除、
//! チャンクの区切り位置、チャンクオフセットの 64 bit 昇格が期待通りになることを確認する

use std::{
    io::{Cursor, Read, Seek, SeekFrom, Write},
    num::NonZeroU32,
    time::Duration,
};

use isobmff_muxer::{
    BoxType, Either, FixedPointNumber,
    aux::SampleTableAccessor,
    boxes::{
        AudioSampleEntry, AudioSampleEntryFields, MoovBox, SampleEntry, StblBox, StszBox,
        VisualSampleEntry, VisualSampleEntryFields,
    },
    mux::{
        CompatibilityMode, LeadingKind, Movie, MovieOptions, RandomAccessKind, Sample,
        SampleProperties, TrackConfig,
    },
};
use proptest::prelude::*;

fn vp09_entry() -> SampleEntry {
    SampleEntry::Visual(VisualSampleEntry {
        box_type: BoxType::Normal(*b"vp09"),
        visual: VisualSampleEntryFields::with_size(320, 240),
        unknown_boxes: Vec::new(),
        btrt_box: None,
    })
}

fn opus_entry() -> SampleEntry {
    SampleEntry::Audio(AudioSampleEntry {
        box_type: BoxType::Normal(*b"Opus"),
        audio: AudioSampleEntryFields {
            data_reference_index: AudioSampleEntryFields::DEFAULT_DATA_REFERENCE_INDEX,
            channelcount: 2,
            samplesize: AudioSampleEntryFields::DEFAULT_SAMPLESIZE,
            samplerate: FixedPointNumber::new(48000u16, 0),
        },
        unknown_boxes: Vec::new(),
        btrt_box: None,
    })
}

fn non_zero(v: u32) -> NonZeroU32 {
    NonZeroU32::new(v).expect("non zero")
}

/// 入力サンプル情報
#[derive(Debug, Clone)]
struct SampleInfo {
    delta: u32,
    composition_offset: i64,
    size: usize,
    properties: SampleProperties,
}

fn arb_random_access() -> impl Strategy<Value = RandomAccessKind> {
    prop_oneof![
        4 => Just(RandomAccessKind::None),
        2 => Just(RandomAccessKind::Sync),
        1 => Just(RandomAccessKind::PartialSync),
        1 => (0u32..4).prop_map(|complete| RandomAccessKind::RecoveryStart { complete }),
    ]
}

fn arb_leading() -> impl Strategy<Value = LeadingKind> {
    prop_oneof![
        Just(LeadingKind::Unknown),
        Just(LeadingKind::Undecodable),
        Just(LeadingKind::NotLeading),
        Just(LeadingKind::Decodable),
    ]
}

fn arb_properties() -> impl Strategy<Value = SampleProperties> {
    (
        arb_random_access(),
        arb_leading(),
        prop::option::of(any::<bool>()),
        prop::option::of(0u32..4),
        prop_oneof![3 => Just(0u16), 1 => 1u16..3],
    )
        .prop_map(
            |(random_access, leading, disposable, recovery_identifier, pre_roll_distance)| {
                SampleProperties {
                    random_access,
                    leading,
                    disposable,
                    recovery_identifier,
                    pre_roll_distance,
                    ..Default::default()
                }
            },
        )
}

fn arb_sample() -> impl Strategy<Value = SampleInfo> {
    (1u32..100, -50i64..200, 1usize..64, arb_properties()).prop_map(
        |(delta, composition_offset, size, properties)| SampleInfo {
            delta,
            composition_offset,
            size,
            properties,
        },
    )
}

/// 一つの映像トラックにサンプル列を追記して確定させ、`moov` ボックスを返す
fn mux_video(samples: &[SampleInfo], mode: CompatibilityMode) -> Result<MoovBox, TestCaseError> {
    let options = MovieOptions {
        mode,
        ..Default::default()
    };
    let mut movie = Movie::new(Cursor::new(Vec::new()), options)
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    let track_id = movie
        .create_track(TrackConfig::video(non_zero(1000), 320, 240))
        .expect("create track");
    movie.add_sample_entry(track_id, vp09_entry()).expect("add sample entry");

    let mut dts = 0i64;
    for info in samples {
        let data = vec![0x5A; info.size];
        let sample = Sample {
            cts: dts + info.composition_offset,
            properties: info.properties,
            ..Sample::new(&data, dts)
        };
        movie
            .append_sample(track_id, &sample)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        dts += info.delta as i64;
    }
    let finalized = movie
        .finalize(false)
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    Ok(finalized.moov_box().clone())
}

fn chunk_offset_count(stbl_box: &StblBox) -> usize {
    match &stbl_box.stco_or_co64_box {
        Either::A(b) => b.chunk_offsets.len(),
        Either::B(b) => b.chunk_offsets.len(),
    }
}

/// `stsc` を展開して、チャンクごとのサンプル数を求める
fn chunk_sample_counts(stbl_box: &StblBox) -> Vec<u32> {
    let entries = &stbl_box.stsc_box.entries;
    (1..=chunk_offset_count(stbl_box) as u32)
        .map(|chunk| {
            entries
                .iter()
                .rev()
                .find(|e| e.first_chunk.get() <= chunk)
                .map_or(0, |e| e.sample_per_chunk)
        })
        .collect()
}

/// 先頭位置が `base` であるかのように振る舞う writer
///
/// `base` 以降に書き込まれたデータだけを保持するので、巨大なオフセットを少ないメモリで再現できる
#[derive(Debug)]
struct OffsetWriter {
    base: u64,
    inner: Cursor<Vec<u8>>,
}

impl Read for OffsetWriter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for OffsetWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for OffsetWriter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let pos = match pos {
            SeekFrom::Start(p) => SeekFrom::Start(
                p.checked_sub(self.base)
                    .ok_or_else(|| std::io::Error::other("seek before base"))?,
            ),
            other => other,
        };
        Ok(self.inner.seek(pos)? + self.base)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // 追記のたびに stts / ctts / stsz / stsc / sdtp / sbgp の件数がサンプル数と一致する
    #[test]
    fn table_counts_match_sample_count(
        samples in prop::collection::vec(arb_sample(), 1..24),
        quicktime in any::<bool>(),
    ) {
        let mode = if quicktime { CompatibilityMode::QuickTime } else { CompatibilityMode::Iso };
        for count in 1..=samples.len() {
            let prefix = &samples[..count];
            let moov_box = mux_video(prefix, mode)?;
            let stbl_box = &moov_box.trak_boxes[0].mdia_box.minf_box.stbl_box;
            let count = count as u32;

            let stts: u32 = stbl_box.stts_box.entries.iter().map(|e| e.sample_count).sum();
            prop_assert_eq!(stts, count);
            if let Some(ctts_box) = &stbl_box.ctts_box {
                let ctts: u32 = ctts_box.entries.iter().map(|e| e.sample_count).sum();
                prop_assert_eq!(ctts, count);
            }
            let stsz = match &stbl_box.stsz_box {
                StszBox::Fixed { sample_count, .. } => *sample_count,
                StszBox::Variable { entry_sizes } => entry_sizes.len() as u32,
            };
            prop_assert_eq!(stsz, count);
            prop_assert_eq!(chunk_sample_counts(stbl_box).iter().sum::<u32>(), count);
            if let Some(sdtp_box) = &stbl_box.sdtp_box {
                prop_assert_eq!(sdtp_box.entries.len() as u32, count);
            }
            for sbgp_box in &stbl_box.sbgp_boxes {
                let total: u32 = sbgp_box.entries.iter().map(|e| e.sample_count).sum();
                prop_assert_eq!(total, count);
            }

            // 同期サンプルの一覧
            let sync: Vec<u32> = prefix
                .iter()
                .enumerate()
                .filter(|(_, s)| s.properties.random_access == RandomAccessKind::Sync)
                .map(|(i, _)| i as u32 + 1)
                .collect();
            match &stbl_box.stss_box {
                Some(stss_box) => {
                    let numbers: Vec<u32> = stss_box.sample_numbers.iter().map(|n| n.get()).collect();
                    prop_assert_eq!(numbers, sync);
                }
                None => prop_assert_eq!(sync.len() as u32, count),
            }
            if mode == CompatibilityMode::QuickTime {
                prop_assert!(stbl_box.sgpd_boxes.is_empty());
                prop_assert!(stbl_box.sbgp_boxes.is_empty());
            }
        }
    }

    // グループ記述は重複せず、全て参照され、隣接する割り当ては異なる記述を指す
    #[test]
    fn group_descriptions_are_deduplicated(samples in prop::collection::vec(arb_sample(), 1..200)) {
        let moov_box = mux_video(&samples, CompatibilityMode::Iso)?;
        let stbl_box = &moov_box.trak_boxes[0].mdia_box.minf_box.stbl_box;
        prop_assert_eq!(stbl_box.sgpd_boxes.len(), stbl_box.sbgp_boxes.len());

        for sgpd_box in &stbl_box.sgpd_boxes {
            for (i, entry) in sgpd_box.entries.iter().enumerate() {
                prop_assert!(!sgpd_box.entries[..i].contains(entry));
            }

            let sbgp_box = stbl_box
                .sbgp_boxes
                .iter()
                .find(|b| b.grouping_type == sgpd_box.grouping_type)
                .expect("sbgp box");
            for entry in &sbgp_box.entries {
                prop_assert!(entry.group_description_index as usize <= sgpd_box.entries.len());
            }
            for pair in sbgp_box.entries.windows(2) {
                prop_assert_ne!(pair[0].group_description_index, pair[1].group_description_index);
            }
            for index in 1..=sgpd_box.entries.len() as u32 {
                prop_assert!(sbgp_box.entries.iter().any(|e| e.group_description_index == index));
            }
        }
    }

    // 1 刻みのサンプル列では、チャンクはちょうど「最大尺 × タイムスケール」個のサンプルで区切られる
    #[test]
    fn chunks_close_at_max_duration(
        ts in 1u32..200,
        max_secs in 1u64..4,
        count in 1usize..600,
    ) {
        let options = MovieOptions {
            max_chunk_duration: Duration::from_secs(max_secs),
            ..Default::default()
        };
        let mut movie = Movie::new(Cursor::new(Vec::new()), options).expect("new");
        let track_id = movie.create_track(TrackConfig::audio(non_zero(ts))).expect("create track");
        movie.add_sample_entry(track_id, opus_entry()).expect("add sample entry");
        for i in 0..count {
            movie
                .append_sample(track_id, &Sample::new(&[i as u8; 3], i as i64))
                .expect("append");
        }
        let finalized = movie.finalize(false).expect("finalize");
        let stbl_box = &finalized.moov_box().trak_boxes[0].mdia_box.minf_box.stbl_box;

        let per_chunk = (max_secs * ts as u64) as usize;
        let mut expected = vec![per_chunk as u32; count / per_chunk];
        if count % per_chunk != 0 {
            expected.push((count % per_chunk) as u32);
        }
        prop_assert_eq!(chunk_sample_counts(stbl_box), expected);
    }

    // チャンクのサイズは上限を超えず（単独で上限を超えるサンプルを除く）、次のサンプルを加えると上限を超える
    #[test]
    fn chunks_respect_max_size(
        max_size in 16usize..256,
        sizes in prop::collection::vec(1usize..128, 1..200),
    ) {
        let options = MovieOptions {
            max_chunk_size: max_size,
            max_chunk_duration: Duration::from_secs(3600),
            ..Default::default()
        };
        let mut movie = Movie::new(Cursor::new(Vec::new()), options).expect("new");
        let track_id = movie.create_track(TrackConfig::audio(non_zero(1000))).expect("create track");
        movie.add_sample_entry(track_id, opus_entry()).expect("add sample entry");
        for (i, size) in sizes.iter().enumerate() {
            movie
                .append_sample(track_id, &Sample::new(&vec![1; *size], i as i64 * 20))
                .expect("append");
        }
        let finalized = movie.finalize(false).expect("finalize");
        let stbl_box = &finalized.moov_box().trak_boxes[0].mdia_box.minf_box.stbl_box;

        let mut next = 0;
        let counts = chunk_sample_counts(stbl_box);
        for (i, count) in counts.iter().enumerate() {
            let chunk = &sizes[next..next + *count as usize];
            let total: usize = chunk.iter().sum();
            prop_assert!(chunk.len() == 1 || total <= max_size);
            next += chunk.len();
            if i + 1 < counts.len() {
                prop_assert!(total + sizes[next] > max_size);
            }
        }
        prop_assert_eq!(next, sizes.len());
    }

    // u32 の範囲を超えるオフセットを持つトラックだけが co64 になり、どちらの形式でも正しいデータを指す
    #[test]
    fn chunk_offsets_promote_per_track(
        gap in 0u64..20_000,
        tracks in prop::collection::vec(prop::collection::vec(1usize..3000, 1..20), 1..4),
    ) {
        let base = u32::MAX as u64 - gap;
        let writer = OffsetWriter { base, inner: Cursor::new(Vec::new()) };
        let options = MovieOptions {
            max_chunk_size: 4096,
            ..Default::default()
        };
        let mut movie = Movie::new(writer, options).expect("new");
        let mut track_ids = Vec::new();
        for _ in &tracks {
            let track_id = movie.create_track(TrackConfig::audio(non_zero(1000))).expect("create track");
            movie.add_sample_entry(track_id, opus_entry()).expect("add sample entry");
            track_ids.push(track_id);
        }

        let sample_data = |track: usize, i: usize, size: usize| -> Vec<u8> {
            (0..size).map(|j| (track * 53 + i * 7 + j) as u8).collect()
        };
        let longest = tracks.iter().map(Vec::len).max().unwrap_or(0);
        for i in 0..longest {
            for (t, sizes) in tracks.iter().enumerate() {
                if let Some(&size) = sizes.get(i) {
                    let data = sample_data(t, i, size);
                    movie
                        .append_sample(track_ids[t], &Sample::new(&data, i as i64 * 20))
                        .expect("append");
                }
            }
        }
        let finalized = movie.finalize(false).expect("finalize");
        let moov_box = finalized.moov_box().clone();
        let bytes = finalized.into_inner().inner.into_inner();

        for (t, trak_box) in moov_box.trak_boxes.iter().enumerate() {
            let stbl_box = &trak_box.mdia_box.minf_box.stbl_box;
            let accessor = SampleTableAccessor::new(stbl_box);
            let offsets: Vec<u64> = (1..=accessor.chunk_count())
                .map(|c| accessor.chunk_offset(non_zero(c)).expect("chunk offset"))
                .collect();
            let needs_64bit = offsets.iter().any(|&o| o > u32::MAX as u64);
            prop_assert_eq!(matches!(stbl_box.stco_or_co64_box, Either::B(_)), needs_64bit);

            for (i, info) in accessor.samples().enumerate() {
                let start = (info.data_offset - base) as usize;
                let end = start + info.size as usize;
                prop_assert_eq!(&bytes[start..end], &sample_data(t, i, tracks[t][i])[..]);
            }
        }
    }
}
