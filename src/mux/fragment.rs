//! フラグメント化されたファイル（`moof` + `mdat`）を書き出すための処理
use std::num::NonZeroU32;

use crate::{
    BoxHeader, BoxSize, Encode, Error,
    boxes::{
        MdatBox, MfhdBox, MfraBox, MfroBox, MoofBox, SampleFlags, SbgpBox, SgpdBox, TfdtBox,
        TfhdBox, TfraBox, TfraEntry, TrafBox, TrunBox, TrunSample,
    },
};

use super::{MuxError, RandomAccessKind, SampleProperties, grouping::SampleGrouping};

/// フラグメントに格納することが確定したサンプル
#[derive(Debug, Clone)]
struct PendingSample {
    dts: u64,
    duration: u32,
    size: u32,
    flags: SampleFlags,
    composition_offset: i32,
    is_sync: bool,
}

/// 次のサンプルが届くまで尺が確定しない、トラックの最新のサンプル
#[derive(Debug, Clone)]
struct HeldSample {
    dts: u64,
    cts: i64,
    composition_offset: i32,
    data: Vec<u8>,
    description_index: NonZeroU32,
    properties: SampleProperties,
}

/// フラグメントの区切り方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Boundary {
    /// 相対 dts が指定の値のサンプルの直前で区切る（保留中のサンプルもこのフラグメントに含める）
    Before(u64),

    /// 保留中のサンプルは次のフラグメントに回す
    Carry,

    /// ファイル末尾（保留中のサンプルの尺を指定する）
    End(u32),
}

/// トラックごとの、次のフラグメントに格納するサンプル群
///
/// 最新のサンプルは尺が確定するまで保留し、後続のサンプルの dts か
/// ファイル末尾の尺が分かった時点で `samples` に移す
#[derive(Debug, Default, Clone)]
pub(crate) struct FragmentTrack {
    samples: Vec<PendingSample>,
    data: Vec<u8>,
    description_index: Option<NonZeroU32>,
    held: Option<HeldSample>,
    grouping: SampleGrouping,
}

impl FragmentTrack {
    pub fn new(grouping: SampleGrouping) -> Self {
        Self {
            grouping,
            ..Default::default()
        }
    }

    /// フラグメント内の最初のサンプルの相対 dts
    pub fn first_dts(&self) -> Option<u64> {
        self.samples
            .first()
            .map(|s| s.dts)
            .or(self.held.as_ref().map(|s| s.dts))
    }

    /// 最後に追加されたサンプルのサンプルエントリーのインデックス
    pub fn description_index(&self) -> Option<NonZeroU32> {
        self.held
            .as_ref()
            .map(|s| s.description_index)
            .or(self.description_index)
    }

    pub fn push(
        &mut self,
        dts: u64,
        cts: i64,
        composition_offset: i32,
        data: &[u8],
        description_index: NonZeroU32,
        properties: &SampleProperties,
    ) {
        self.commit_held(dts);
        self.held = Some(HeldSample {
            dts,
            cts,
            composition_offset,
            data: data.to_vec(),
            description_index,
            properties: *properties,
        });
    }

    /// 保留中のサンプルを、次のサンプルの相対 dts から求めた尺で確定させる
    fn commit_held(&mut self, next_dts: u64) {
        if let Some(held) = &self.held {
            let duration = u32::try_from(next_dts.saturating_sub(held.dts)).unwrap_or(u32::MAX);
            self.commit_held_with(duration);
        }
    }

    fn commit_held_with(&mut self, duration: u32) {
        let Some(held) = self.held.take() else {
            return;
        };
        let sample_number = self.samples.len() as u32 + 1;
        self.grouping.append(sample_number, held.cts, &held.properties);
        self.samples.push(PendingSample {
            dts: held.dts,
            duration,
            size: held.data.len() as u32,
            flags: sample_flags(&held.properties),
            composition_offset: held.composition_offset,
            is_sync: held.properties.random_access == RandomAccessKind::Sync,
        });
        self.data.extend_from_slice(&held.data);
        self.description_index = Some(held.description_index);
    }

    /// 確定済みのサンプル群を取り出す
    pub fn take(&mut self, track_id: u32, boundary: Boundary) -> Option<TrackFragment> {
        match boundary {
            Boundary::Before(next_dts) => self.commit_held(next_dts),
            Boundary::End(duration) => self.commit_held_with(duration),
            Boundary::Carry => {}
        }
        if self.samples.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.samples);
        let data = std::mem::take(&mut self.data);
        let description_index = self.description_index.take().unwrap_or(NonZeroU32::MIN);
        let (sgpd_boxes, sbgp_boxes) = self.grouping.take_fragment();
        Some(TrackFragment {
            track_id,
            description_index,
            samples,
            data,
            sgpd_boxes,
            sbgp_boxes,
        })
    }
}

/// 依存関係の情報を `trun` 用のサンプルフラグに変換する
fn sample_flags(properties: &SampleProperties) -> SampleFlags {
    let is_sync = properties.random_access == RandomAccessKind::Sync;
    let dependency = properties.sdtp_entry();
    let sample_depends_on = match dependency.sample_depends_on.get() {
        0 if is_sync => 2,
        0 => 1,
        v => v,
    };
    SampleFlags::from_fields(
        dependency.is_leading.get(),
        sample_depends_on,
        dependency.sample_is_depended_on.get(),
        dependency.sample_has_redundancy.get(),
        0,
        !is_sync,
        0,
    )
}

/// 一つのトラックの、フラグメントに格納するサンプル群
#[derive(Debug)]
pub(crate) struct TrackFragment {
    track_id: u32,
    description_index: NonZeroU32,
    samples: Vec<PendingSample>,
    data: Vec<u8>,
    sgpd_boxes: Vec<SgpdBox>,
    sbgp_boxes: Vec<SbgpBox>,
}

impl TrackFragment {
    fn trun_samples(&self) -> Vec<TrunSample> {
        let use_composition_offset = self.samples.iter().any(|s| s.composition_offset != 0);
        self.samples
            .iter()
            .map(|sample| TrunSample {
                duration: Some(sample.duration),
                size: Some(sample.size),
                flags: Some(sample.flags),
                composition_time_offset: use_composition_offset.then_some(sample.composition_offset),
            })
            .collect()
    }

    fn traf_box(&self, data_offset: i32) -> TrafBox {
        let base_media_decode_time = self.samples.first().map_or(0, |s| s.dts);
        TrafBox {
            tfhd_box: TfhdBox {
                track_id: self.track_id,
                base_data_offset: None,
                sample_description_index: (self.description_index != NonZeroU32::MIN)
                    .then_some(self.description_index.get()),
                default_sample_duration: None,
                default_sample_size: None,
                default_sample_flags: None,
                duration_is_empty: false,
                default_base_is_moof: true,
            },
            tfdt_box: Some(TfdtBox {
                version: (base_media_decode_time > u32::MAX as u64) as u8,
                base_media_decode_time,
            }),
            trun_boxes: vec![TrunBox {
                data_offset: Some(data_offset),
                first_sample_flags: None,
                samples: self.trun_samples(),
            }],
            sgpd_boxes: self.sgpd_boxes.clone(),
            sbgp_boxes: self.sbgp_boxes.clone(),
            unknown_boxes: Vec::new(),
        }
    }
}

/// 書き出すフラグメントのバイト列と、そのランダムアクセス情報
#[derive(Debug)]
pub(crate) struct EncodedFragment {
    pub bytes: Vec<u8>,
    pub random_access_points: Vec<(u32, TfraEntry)>,
}

/// `moof` ボックスと `mdat` ボックスを構築する
///
/// `moof_offset` はファイル中で `moof` ボックスが配置される位置
pub(crate) fn encode_fragment(
    sequence_number: u32,
    moof_offset: u64,
    fragments: &[TrackFragment],
) -> Result<EncodedFragment, MuxError> {
    let payload_size: u64 = fragments.iter().map(|f| f.data.len() as u64).sum();
    let mdat_header = BoxHeader::new(
        MdatBox::TYPE,
        BoxSize::with_payload_size(MdatBox::TYPE, payload_size),
    )
    .encode_to_vec()?;

    let build_moof = |data_offsets: &[i32]| MoofBox {
        mfhd_box: MfhdBox { sequence_number },
        traf_boxes: fragments
            .iter()
            .zip(data_offsets)
            .map(|(f, &offset)| f.traf_box(offset))
            .collect(),
        unknown_boxes: Vec::new(),
    };

    // data_offset の値によって moof ボックスのサイズは変わらないので、仮の値で一度エンコードしてサイズを求める
    let placeholder_size = build_moof(&vec![0; fragments.len()]).encode_to_vec()?.len() as u64;
    let mut data_offsets = Vec::with_capacity(fragments.len());
    let mut running = placeholder_size + mdat_header.len() as u64;
    for fragment in fragments {
        let offset = i32::try_from(running)
            .map_err(|_| Error::invalid_input(format!("data_offset exceeds i32 range: {running}")))?;
        data_offsets.push(offset);
        running += fragment.data.len() as u64;
    }
    let moof_box = build_moof(&data_offsets);
    let mut bytes = moof_box.encode_to_vec()?;

    let mut random_access_points = Vec::new();
    for (traf_index, fragment) in fragments.iter().enumerate() {
        for (sample_index, sample) in fragment.samples.iter().enumerate() {
            if sample.is_sync {
                random_access_points.push((
                    fragment.track_id,
                    TfraEntry {
                        time: sample.dts,
                        moof_offset,
                        traf_number: traf_index as u32 + 1,
                        trun_number: 1,
                        sample_number: sample_index as u32 + 1,
                    },
                ));
            }
        }
    }

    bytes.extend_from_slice(&mdat_header);
    for fragment in fragments {
        bytes.extend_from_slice(&fragment.data);
    }
    log::debug!(
        "fragment #{sequence_number}: {} tracks, {payload_size} bytes of media data at {moof_offset}",
        fragments.len()
    );

    Ok(EncodedFragment {
        bytes,
        random_access_points,
    })
}

/// `tfra` ボックスの元になるトラックごとのランダムアクセスポイント
#[derive(Debug, Default, Clone)]
pub(crate) struct RandomAccessIndex {
    tracks: Vec<(u32, Vec<TfraEntry>)>,
}

impl RandomAccessIndex {
    pub fn add_track(&mut self, track_id: u32) {
        self.tracks.push((track_id, Vec::new()));
    }

    pub fn record(&mut self, points: Vec<(u32, TfraEntry)>) {
        for (track_id, entry) in points {
            if let Some((_, entries)) = self.tracks.iter_mut().find(|(id, _)| *id == track_id) {
                entries.push(entry);
            }
        }
    }

    /// `mfra` ボックスを構築してエンコードする
    pub fn encode_mfra(&self) -> Result<Vec<u8>, MuxError> {
        let tfra_boxes = self
            .tracks
            .iter()
            .map(|(track_id, entries)| {
                let max_traf = entries.iter().map(|e| e.traf_number).max().unwrap_or(0);
                let max_sample = entries.iter().map(|e| e.sample_number).max().unwrap_or(0);
                TfraBox {
                    version: 0,
                    track_id: *track_id,
                    length_size_of_traf_num: length_size(max_traf),
                    length_size_of_trun_num: 0,
                    length_size_of_sample_num: length_size(max_sample),
                    entries: entries.clone(),
                }
            })
            .collect();
        let mut mfra_box = MfraBox {
            tfra_boxes,
            mfro_box: MfroBox { size: 0 },
        };
        let size = mfra_box.encode_to_vec()?.len();
        mfra_box.mfro_box.size = u32::try_from(size)
            .map_err(|_| Error::invalid_input("mfra box is too large"))?;
        Ok(mfra_box.encode_to_vec()?)
    }
}

/// 値を格納するのに必要なバイト数 - 1
fn length_size(max_value: u32) -> u8 {
    match max_value {
        0..=0xFF => 0,
        0x100..=0xFFFF => 1,
        0x1_0000..=0xFF_FFFF => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Decode;

    fn props(random_access: RandomAccessKind) -> SampleProperties {
        SampleProperties {
            random_access,
            ..Default::default()
        }
    }

    #[test]
    fn data_offsets_point_into_mdat() {
        let mut video = FragmentTrack::new(SampleGrouping::new(true, true));
        video.push(0, 0, 0, &[1; 10], NonZeroU32::MIN, &props(RandomAccessKind::Sync));
        video.push(30, 30, 0, &[2; 5], NonZeroU32::MIN, &props(RandomAccessKind::None));
        let mut audio = FragmentTrack::new(SampleGrouping::new(false, true));
        audio.push(0, 0, 0, &[3; 7], NonZeroU32::MIN, &props(RandomAccessKind::Sync));

        let fragments = [
            video.take(1, Boundary::Before(60)).expect("video"),
            audio.take(2, Boundary::End(1024)).expect("audio"),
        ];
        assert!(video.take(1, Boundary::Carry).is_none());

        let encoded = encode_fragment(1, 1000, &fragments).expect("encode");
        let (moof, moof_size) = MoofBox::decode(&encoded.bytes).expect("decode");

        let video_traf = &moof.traf_boxes[0];
        let data_offset = video_traf.trun_boxes[0].data_offset.expect("data_offset") as usize;
        assert_eq!(&encoded.bytes[data_offset..data_offset + 10], &[1; 10]);
        assert_eq!(moof_size + 8, data_offset);
        let durations: Vec<_> = video_traf.trun_boxes[0]
            .samples
            .iter()
            .map(|s| s.duration)
            .collect();
        assert_eq!(durations, [Some(30), Some(30)]);

        let audio_traf = &moof.traf_boxes[1];
        let data_offset = audio_traf.trun_boxes[0].data_offset.expect("data_offset") as usize;
        assert_eq!(&encoded.bytes[data_offset..data_offset + 7], &[3; 7]);
        assert_eq!(audio_traf.trun_boxes[0].samples[0].duration, Some(1024));

        assert_eq!(encoded.random_access_points.len(), 2);
        assert_eq!(encoded.random_access_points[1].1.traf_number, 2);
    }

    #[test]
    fn latest_sample_is_carried_to_next_fragment() {
        let mut audio = FragmentTrack::new(SampleGrouping::new(false, true));
        for (dts, size) in [(0, 3), (20, 4), (50, 5)] {
            let data = vec![0; size];
            let properties = props(RandomAccessKind::Sync);
            audio.push(dts, dts as i64, 0, &data, NonZeroU32::MIN, &properties);
        }

        // 別トラックの都合で区切られても、最新のサンプルは尺が確定するまで次に回される
        let first = audio.take(2, Boundary::Carry).expect("first");
        let durations: Vec<_> = first.samples.iter().map(|s| s.duration).collect();
        assert_eq!(durations, [20, 30]);
        assert_eq!(first.data.len(), 7);
        assert_eq!(audio.first_dts(), Some(50));

        audio.push(70, 70, 0, &[0; 6], NonZeroU32::MIN, &props(RandomAccessKind::Sync));
        let second = audio.take(2, Boundary::End(25)).expect("second");
        let timeline: Vec<_> = second.samples.iter().map(|s| (s.dts, s.duration)).collect();
        assert_eq!(timeline, [(50, 20), (70, 25)]);
        assert!(audio.take(2, Boundary::End(25)).is_none());
    }

    #[test]
    fn mfro_holds_mfra_size() {
        let mut index = RandomAccessIndex::default();
        index.add_track(1);
        index.record(vec![(
            1,
            TfraEntry {
                time: 0,
                moof_offset: 100,
                traf_number: 1,
                trun_number: 1,
                sample_number: 300,
            },
        )]);
        let bytes = index.encode_mfra().expect("encode");
        let (mfra, size) = MfraBox::decode(&bytes).expect("decode");
        assert_eq!(mfra.mfro_box.size as usize, size);
        assert_eq!(mfra.tfra_boxes[0].length_size_of_sample_num, 1);
    }
}
