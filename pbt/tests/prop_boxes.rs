//! サンプルテーブル関連のボックスの Property-Based Testing

use std::num::NonZeroU32;

use isobmff_muxer::{
    BoxHeader, Decode, Encode, FixedPointNumber,
    boxes::{
        Co64Box, CttsBox, CttsEntry, ElstBox, ElstEntry, MehdBox, SampleGroupContext,
        SampleGroupDescription, SbgpBox, SbgpEntry, SgpdBox, StscBox, StscEntry, StszBox,
        SttsBox, SttsEntry, TrunBox, TrunSample,
    },
};
use proptest::prelude::*;

/// エンコード結果をデコードして元の値と一致することと、ヘッダーのサイズが正しいことを確認する
fn assert_roundtrip<T>(value: &T) -> Result<(), TestCaseError>
where
    T: Encode + Decode + PartialEq + std::fmt::Debug,
{
    let encoded = value.encode_to_vec().expect("encode");
    let (header, _) = BoxHeader::decode(&encoded).expect("header");
    prop_assert_eq!(header.box_size.get(), encoded.len() as u64);

    let (decoded, size) = T::decode(&encoded).expect("decode");
    prop_assert_eq!(size, encoded.len());
    prop_assert_eq!(&decoded, value);
    Ok(())
}

fn arb_elst_entry() -> impl Strategy<Value = ElstEntry> {
    (
        prop_oneof![0u64..=(u32::MAX as u64), any::<u64>()],
        prop_oneof![-1i64..=(i32::MAX as i64), -1i64..=i64::MAX],
        any::<i16>(),
    )
        .prop_map(|(edit_duration, media_time, rate)| ElstEntry {
            edit_duration,
            media_time,
            media_rate: FixedPointNumber::new(rate, 0),
        })
}

fn arb_stsc_entry() -> impl Strategy<Value = StscEntry> {
    (1u32..=u32::MAX, any::<u32>(), 1u32..=u32::MAX).prop_map(
        |(first_chunk, sample_per_chunk, sample_description_index)| StscEntry {
            first_chunk: NonZeroU32::new(first_chunk).expect("non zero"),
            sample_per_chunk,
            sample_description_index: NonZeroU32::new(sample_description_index)
                .expect("non zero"),
        },
    )
}

fn arb_sgpd_box() -> impl Strategy<Value = SgpdBox> {
    prop_oneof![
        prop::collection::vec((any::<bool>(), 0u8..128), 0..20).prop_map(|entries| SgpdBox {
            grouping_type: *b"rap ",
            entries: entries
                .into_iter()
                .map(
                    |(num_leading_samples_known, num_leading_samples)| {
                        SampleGroupDescription::RandomAccess {
                            num_leading_samples_known,
                            num_leading_samples,
                        }
                    }
                )
                .collect(),
        }),
        (
            prop_oneof![Just(*b"roll"), Just(*b"prol")],
            prop::collection::vec(any::<i16>(), 0..20)
        )
            .prop_map(|(grouping_type, distances)| SgpdBox {
                grouping_type,
                entries: distances
                    .into_iter()
                    .map(|roll_distance| SampleGroupDescription::RollRecovery { roll_distance })
                    .collect(),
            }),
    ]
}

fn arb_trun_box() -> impl Strategy<Value = TrunBox> {
    (
        prop::option::of(any::<i32>()),
        any::<(bool, bool, bool)>(),
        prop::collection::vec((any::<u32>(), any::<u32>(), any::<i32>()), 1..50),
    )
        .prop_map(
            |(data_offset, (has_duration, has_size, has_offset), samples)| TrunBox {
                data_offset,
                first_sample_flags: None,
                samples: samples
                    .into_iter()
                    .map(|(duration, size, offset)| TrunSample {
                        duration: has_duration.then_some(duration),
                        size: has_size.then_some(size),
                        flags: None,
                        composition_time_offset: has_offset.then_some(offset),
                    })
                    .collect(),
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // 32 bit に収まらない値を含む場合は version 1 でエンコードされる
    #[test]
    fn elst_box_roundtrip(entries in prop::collection::vec(arb_elst_entry(), 0..10)) {
        let large = entries.iter().any(|e| {
            u32::try_from(e.edit_duration).is_err() || i32::try_from(e.media_time).is_err()
        });
        let elst_box = ElstBox { entries };
        let encoded = elst_box.encode_to_vec().expect("encode");
        prop_assert_eq!(encoded[8], if large { 1 } else { 0 });
        assert_roundtrip(&elst_box)?;
    }

    // 負のオフセットを含む場合も元の値が復元できる
    #[test]
    fn ctts_box_roundtrip(entries in prop::collection::vec((any::<u32>(), any::<i32>()), 0..50)) {
        let ctts_box = CttsBox {
            entries: entries
                .into_iter()
                .map(|(sample_count, sample_offset)| CttsEntry { sample_count, sample_offset })
                .collect(),
        };
        assert_roundtrip(&ctts_box)?;
    }

    #[test]
    fn stts_box_roundtrip(entries in prop::collection::vec((any::<u32>(), any::<u32>()), 0..50)) {
        let stts_box = SttsBox {
            entries: entries
                .into_iter()
                .map(|(sample_count, sample_delta)| SttsEntry { sample_count, sample_delta })
                .collect(),
        };
        assert_roundtrip(&stts_box)?;
    }

    #[test]
    fn stsc_box_roundtrip(entries in prop::collection::vec(arb_stsc_entry(), 0..50)) {
        assert_roundtrip(&StscBox { entries })?;
    }

    #[test]
    fn stsz_box_roundtrip(
        sizes in prop::collection::vec(any::<u32>(), 0..100),
        fixed in (1u32..=u32::MAX, any::<u32>()),
    ) {
        assert_roundtrip(&StszBox::Variable { entry_sizes: sizes })?;
        assert_roundtrip(&StszBox::Fixed {
            sample_size: NonZeroU32::new(fixed.0).expect("non zero"),
            sample_count: fixed.1,
        })?;
    }

    #[test]
    fn co64_box_roundtrip(chunk_offsets in prop::collection::vec(any::<u64>(), 0..100)) {
        assert_roundtrip(&Co64Box { chunk_offsets })?;
    }

    // version 1 を指定した mehd ボックスは値に関わらず同じサイズになる
    #[test]
    fn mehd_box_size_is_stable(a in any::<u64>(), b in 0u64..=(u32::MAX as u64)) {
        let x = MehdBox { version: 1, fragment_duration: a };
        let y = MehdBox { version: 1, fragment_duration: b };
        prop_assert_eq!(
            x.encode_to_vec().expect("encode").len(),
            y.encode_to_vec().expect("encode").len()
        );
        assert_roundtrip(&x)?;
        assert_roundtrip(&y)?;
    }

    #[test]
    fn sgpd_box_roundtrip(sgpd_box in arb_sgpd_box()) {
        assert_roundtrip(&sgpd_box)?;
    }

    #[test]
    fn sbgp_box_roundtrip(
        entries in prop::collection::vec((1u32..1000, 0u32..0x10000), 0..50),
        grouping_type in prop_oneof![Just(*b"rap "), Just(*b"roll")],
    ) {
        let sbgp_box = SbgpBox {
            grouping_type,
            grouping_type_parameter: None,
            context: SampleGroupContext::SampleTable,
            entries: entries
                .into_iter()
                .map(|(sample_count, group_description_index)| SbgpEntry {
                    sample_count,
                    group_description_index,
                })
                .collect(),
        };
        assert_roundtrip(&sbgp_box)?;
    }

    #[test]
    fn trun_box_roundtrip(trun_box in arb_trun_box()) {
        assert_roundtrip(&trun_box)?;
    }
}
