#![no_main]

use std::{io::Cursor, num::NonZeroU32, time::Duration};

use isobmff_muxer::{
    BoxType, Decode, FixedPointNumber, Mp4File,
    boxes::{
        AudioSampleEntry, AudioSampleEntryFields, SampleEntry, VisualSampleEntry,
        VisualSampleEntryFields,
    },
    mux::{
        CompatibilityMode, LeadingKind, Movie, MovieOptions, RandomAccessKind, Sample,
        SampleProperties, TrackConfig,
    },
};
use libfuzzer_sys::fuzz_target;

fn sample_entry(video: bool) -> SampleEntry {
    if video {
        SampleEntry::Visual(VisualSampleEntry {
            box_type: BoxType::Normal(*b"avc1"),
            visual: VisualSampleEntryFields::with_size(16, 16),
            unknown_boxes: Vec::new(),
            btrt_box: None,
        })
    } else {
        SampleEntry::Audio(AudioSampleEntry {
            box_type: BoxType::Normal(*b"mp4a"),
            audio: AudioSampleEntryFields {
                data_reference_index: AudioSampleEntryFields::DEFAULT_DATA_REFERENCE_INDEX,
                channelcount: 1,
                samplesize: AudioSampleEntryFields::DEFAULT_SAMPLESIZE,
                samplerate: FixedPointNumber::new(8000u16, 0),
            },
            unknown_boxes: Vec::new(),
            btrt_box: None,
        })
    }
}

// 入力バイト列を「トラック選択・時刻差分・属性・サイズ」の 4 バイト単位の追記操作として解釈する
fuzz_target!(|data: &[u8]| {
    let Some((&head, ops)) = data.split_first() else {
        return;
    };
    let mode = match head % 3 {
        0 => CompatibilityMode::Iso,
        1 => CompatibilityMode::QuickTime,
        _ => CompatibilityMode::Fragmented,
    };
    let options = MovieOptions {
        mode,
        max_chunk_duration: Duration::from_millis(u64::from(head) * 4),
        reserved_moov_box_size: if head & 0x80 != 0 { 512 } else { 0 },
        relocation_buffer_size: 64,
        fragment_duration: Duration::from_millis(100),
        ..Default::default()
    };
    let Ok(mut movie) = Movie::new(Cursor::new(Vec::new()), options) else {
        return;
    };

    let mut track_ids = Vec::new();
    for (i, video) in [true, false].into_iter().enumerate() {
        let timescale = NonZeroU32::MIN.saturating_add(999 + i as u32 * 7000);
        let config = if video {
            TrackConfig::video(timescale, 16, 16)
        } else {
            TrackConfig::audio(timescale)
        };
        let Ok(track_id) = movie.create_track(config) else {
            return;
        };
        if movie.add_sample_entry(track_id, sample_entry(video)).is_err() {
            return;
        }
        track_ids.push(track_id);
    }

    let mut dts = [0i64; 2];
    for op in ops.chunks_exact(4) {
        let track = usize::from(op[0] & 1);
        dts[track] += i64::from(op[1]) - 8;
        let properties = SampleProperties {
            random_access: match op[2] & 3 {
                0 => RandomAccessKind::None,
                1 => RandomAccessKind::Sync,
                2 => RandomAccessKind::PartialSync,
                _ => RandomAccessKind::RecoveryStart {
                    complete: u32::from(op[2] >> 4),
                },
            },
            leading: match (op[2] >> 2) & 3 {
                0 => LeadingKind::Unknown,
                1 => LeadingKind::Undecodable,
                2 => LeadingKind::NotLeading,
                _ => LeadingKind::Decodable,
            },
            recovery_identifier: (op[0] & 2 != 0).then_some(u32::from(op[2] >> 4)),
            pre_roll_distance: u16::from(op[0] >> 5),
            ..Default::default()
        };
        let payload = vec![op[3]; usize::from(op[3])];
        let sample = Sample {
            cts: dts[track] + i64::from(op[0] >> 2) - 16,
            properties,
            ..Sample::new(&payload, dts[track])
        };
        let _ = movie.append_sample(track_ids[track], &sample);
    }

    let relocate = head & 0x40 != 0;
    if let Ok(finalized) = movie.finalize(relocate) {
        let bytes = finalized.into_inner().into_inner();
        Mp4File::<isobmff_muxer::boxes::RootBox>::decode(&bytes).expect("written file decodes");
    }
});
