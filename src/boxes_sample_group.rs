//! サンプルの依存関係とサンプルグループに関するボックス
//!
//! このモジュールは内部的なもので、構造体などの外部への提供は boxes モジュールを通して行う
use crate::{
    BaseBox, BoxType, Decode, Encode, Error, FullBox, Result, Uint,
    codec::{ByteReader, decode_full_box, encode_full_box},
};

/// [`SdtpBox`] のサンプルごとのエントリー（1 バイトに四つの 2 bit フィールドを詰めたもの）
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct SdtpEntry {
    pub is_leading: Uint<u8, 2, 6>,
    pub sample_depends_on: Uint<u8, 2, 4>,
    pub sample_is_depended_on: Uint<u8, 2, 2>,
    pub sample_has_redundancy: Uint<u8, 2>,
}

impl Encode for SdtpEntry {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let packed = self.is_leading.to_bits()
            | self.sample_depends_on.to_bits()
            | self.sample_is_depended_on.to_bits()
            | self.sample_has_redundancy.to_bits();
        packed.encode(buf)
    }
}

impl Decode for SdtpEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (packed, size) = u8::decode(buf)?;
        let entry = Self {
            is_leading: Uint::from_bits(packed),
            sample_depends_on: Uint::from_bits(packed),
            sample_is_depended_on: Uint::from_bits(packed),
            sample_has_redundancy: Uint::from_bits(packed),
        };
        Ok((entry, size))
    }
}

/// [ISO/IEC 14496-12] SampleDependencyTypeBox class (親: [`StblBox`](crate::boxes::StblBox))
///
/// エントリー数は明示されず、ボックスの残りサイズから決まる（サンプル数と一致していること）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct SdtpBox {
    pub entries: Vec<SdtpEntry>,
}

impl SdtpBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"sdtp");
}

impl Encode for SdtpBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| {
            for entry in &self.entries {
                w.put(entry)?;
            }
            Ok(())
        })
    }
}

impl Decode for SdtpBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |_, r| {
            let mut entries = Vec::with_capacity(r.remaining().len());
            while !r.is_empty() {
                entries.push(r.get()?);
            }
            Ok(Self { entries })
        })
    }
}

impl BaseBox for SdtpBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for SdtpBox {}

/// [`SgpdBox`] に含まれるサンプルグループの記述
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SampleGroupDescription {
    /// [ISO/IEC 14496-12] VisualRandomAccessEntry ('rap ')
    RandomAccess {
        /// 先行サンプル数が判明しているかどうか
        num_leading_samples_known: bool,

        /// 先行サンプル数（7 bit）
        num_leading_samples: u8,
    },

    /// [ISO/IEC 14496-12] VisualRollRecoveryEntry / AudioRollRecoveryEntry ('roll', 'prol')
    ///
    /// 正の値は復帰までに必要な後続サンプル数を、負の値はプリロールに必要な先行サンプル数を表す
    RollRecovery {
        /// ロール距離
        roll_distance: i16,
    },

    /// 構造化して扱わない記述
    Unknown {
        /// 記述のバイト列
        payload: Vec<u8>,
    },
}

type LeadingKnown = Uint<u8, 1, 7>;
type LeadingCount = Uint<u8, 7>;

impl SampleGroupDescription {
    /// version 0 の `sgpd` で使われる、グループ種別ごとの固定の記述長
    fn implicit_length(grouping_type: [u8; 4]) -> Option<usize> {
        match &grouping_type {
            b"rap " => Some(1),
            b"roll" | b"prol" => Some(2),
            _ => None,
        }
    }

    /// 長さの決まった記述を一つ読み込む
    fn parse(grouping_type: [u8; 4], bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let description = match &grouping_type {
            b"rap " => {
                let packed = r.get()?;
                Self::RandomAccess {
                    num_leading_samples_known: LeadingKnown::from_bits(packed).get() == 1,
                    num_leading_samples: LeadingCount::from_bits(packed).get(),
                }
            }
            b"roll" | b"prol" => Self::RollRecovery {
                roll_distance: r.get()?,
            },
            _ => Self::Unknown {
                payload: bytes.to_vec(),
            },
        };
        Ok(description)
    }
}

impl Encode for SampleGroupDescription {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::RandomAccess {
                num_leading_samples_known,
                num_leading_samples,
            } => {
                let packed = LeadingKnown::new(*num_leading_samples_known as u8).to_bits()
                    | LeadingCount::from_bits(*num_leading_samples).to_bits();
                packed.encode(buf)
            }
            Self::RollRecovery { roll_distance } => roll_distance.encode(buf),
            Self::Unknown { payload } => payload.encode(buf),
        }
    }
}

/// [ISO/IEC 14496-12] SampleGroupDescriptionBox class (親: [`StblBox`](crate::boxes::StblBox) / [`TrafBox`](crate::boxes::TrafBox))
///
/// 書き込みは常に version 1 で行う
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct SgpdBox {
    pub grouping_type: [u8; 4],
    pub entries: Vec<SampleGroupDescription>,
}

impl SgpdBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"sgpd");

    /// ランダムアクセスポイントのグループ種別
    pub const GROUPING_TYPE_RAP: [u8; 4] = *b"rap ";

    /// ロールリカバリーのグループ種別
    pub const GROUPING_TYPE_ROLL: [u8; 4] = *b"roll";

    /// 全エントリーの長さが揃っていればその値、そうでなければ 0
    fn default_length(&self) -> Result<u32> {
        let mut common = None;
        for entry in &self.entries {
            let length = entry.encode_to_vec()?.len() as u32;
            match common {
                None => common = Some(length),
                Some(n) if n == length => {}
                Some(_) => return Ok(0),
            }
        }
        Ok(common.unwrap_or(0))
    }
}

impl Encode for SgpdBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let default_length = self.default_length()?;
        encode_full_box(buf, self, |w| {
            w.put(&self.grouping_type)?;
            w.put(&default_length)?;
            w.put(&(self.entries.len() as u32))?;
            for entry in &self.entries {
                if default_length != 0 {
                    w.put(entry)?;
                    continue;
                }
                let length_position = w.position();
                w.put(&0u32)?;
                w.put(entry)?;
                let length = w.position() - length_position - 4;
                w.put_at(length_position, &(length as u32))?;
            }
            Ok(())
        })
    }
}

impl Decode for SgpdBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let grouping_type = r.get()?;
            let default_length: Option<u32> = match header.version {
                0 => None,
                _ => Some(r.get()?),
            };
            if header.version >= 2 {
                // default_sample_description_index
                r.take(4)?;
            }

            let entry_count: u32 = r.get()?;
            let mut entries = Vec::new();
            for _ in 0..entry_count {
                let length = match default_length {
                    Some(0) => r.get::<u32>()? as usize,
                    Some(n) => n as usize,
                    None => SampleGroupDescription::implicit_length(grouping_type).ok_or_else(
                        || Error::unsupported("Version 0 'sgpd' box with an unknown grouping type"),
                    )?,
                };
                let bytes = r
                    .take(length)
                    .map_err(|_| Error::invalid_data("Too large sample group entry length"))?;
                entries.push(SampleGroupDescription::parse(grouping_type, bytes)?);
            }
            Ok(Self {
                grouping_type,
                entries,
            })
        })
    }
}

impl BaseBox for SgpdBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for SgpdBox {
    fn full_box_version(&self) -> u8 {
        1
    }
}

/// [`SbgpBox`] がどのボックスの下に配置されているか
///
/// 配置場所によってグループ記述のインデックスの解釈が異なる
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleGroupContext {
    /// `stbl` の下（インデックスは同じ `stbl` 内の [`SgpdBox`] を参照する）
    #[default]
    SampleTable,

    /// `traf` の下（インデックスは同じ `traf` 内の [`SgpdBox`] を参照し、ファイル上では 0x10000 が加算される）
    Fragment,
}

impl SampleGroupContext {
    /// フラグメント内のグループ記述を参照するインデックスに加算される値
    pub const FRAGMENT_LOCAL_INDEX_BASE: u32 = 0x10000;
}

/// [`SbgpBox`] のエントリー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct SbgpEntry {
    pub sample_count: u32,

    /// 1 始まりのグループ記述のインデックス（0 はどのグループにも属さないことを表す）
    pub group_description_index: u32,
}

/// [ISO/IEC 14496-12] SampleToGroupBox class (親: [`StblBox`](crate::boxes::StblBox) / [`TrafBox`](crate::boxes::TrafBox))
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct SbgpBox {
    pub grouping_type: [u8; 4],
    pub grouping_type_parameter: Option<u32>,
    pub context: SampleGroupContext,
    pub entries: Vec<SbgpEntry>,
}

impl SbgpBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"sbgp");

    /// ファイル上の値をフラグメント内の解釈に変換する
    ///
    /// ムービー全体のグループ記述を参照するエントリーは扱えないのでエラーとなる
    pub fn into_fragment_context(mut self) -> Result<Self> {
        if self.context == SampleGroupContext::Fragment {
            return Ok(self);
        }
        for entry in &mut self.entries {
            entry.group_description_index = match entry.group_description_index {
                0 => 0,
                i if i > SampleGroupContext::FRAGMENT_LOCAL_INDEX_BASE => {
                    i - SampleGroupContext::FRAGMENT_LOCAL_INDEX_BASE
                }
                _ => {
                    return Err(Error::unsupported(
                        "Fragment 'sbgp' entries referring to movie-level descriptions",
                    )
                    .with_box_type(Self::TYPE));
                }
            };
        }
        self.context = SampleGroupContext::Fragment;
        Ok(self)
    }

    /// ファイルに書き込むインデックス
    fn stored_index(&self, index: u32) -> Result<u32> {
        if self.context == SampleGroupContext::SampleTable || index == 0 {
            return Ok(index);
        }
        index
            .checked_add(SampleGroupContext::FRAGMENT_LOCAL_INDEX_BASE)
            .ok_or_else(|| Error::invalid_input("Too large fragment-local group index"))
    }
}

impl Encode for SbgpBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_full_box(buf, self, |w| {
            w.put(&self.grouping_type)?;
            w.put(&self.grouping_type_parameter)?;
            w.put(&(self.entries.len() as u32))?;
            for entry in &self.entries {
                w.put(&entry.sample_count)?;
                w.put(&self.stored_index(entry.group_description_index)?)?;
            }
            Ok(())
        })
    }
}

impl Decode for SbgpBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_full_box(buf, Self::TYPE, |header, r| {
            let grouping_type = r.get()?;
            let grouping_type_parameter = match header.version {
                1 => Some(r.get()?),
                _ => None,
            };
            let entry_count: u32 = r.get()?;
            let capacity = (entry_count as usize).min(r.remaining().len() / 8);
            let mut entries = Vec::with_capacity(capacity);
            for _ in 0..entry_count {
                entries.push(SbgpEntry {
                    sample_count: r.get()?,
                    group_description_index: r.get()?,
                });
            }
            Ok(Self {
                grouping_type,
                grouping_type_parameter,
                context: SampleGroupContext::SampleTable,
                entries,
            })
        })
    }
}

impl BaseBox for SbgpBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

impl FullBox for SbgpBox {
    fn full_box_version(&self) -> u8 {
        self.grouping_type_parameter.is_some() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_local_indices_are_offset() {
        let sbgp = SbgpBox {
            grouping_type: SgpdBox::GROUPING_TYPE_ROLL,
            grouping_type_parameter: None,
            context: SampleGroupContext::Fragment,
            entries: vec![
                SbgpEntry {
                    sample_count: 3,
                    group_description_index: 0,
                },
                SbgpEntry {
                    sample_count: 1,
                    group_description_index: 2,
                },
            ],
        };
        let bytes = sbgp.encode_to_vec().expect("encode");
        assert_eq!(&bytes[bytes.len() - 4..], &0x10002u32.to_be_bytes());

        let (decoded, _) = SbgpBox::decode(&bytes).expect("decode");
        assert_eq!(decoded.context, SampleGroupContext::SampleTable);
        assert_eq!(decoded.entries[1].group_description_index, 0x10002);
        assert_eq!(decoded.into_fragment_context().expect("convert"), sbgp);
    }

    #[test]
    fn movie_level_index_in_fragment_is_rejected() {
        let sbgp = SbgpBox {
            grouping_type: SgpdBox::GROUPING_TYPE_RAP,
            grouping_type_parameter: None,
            context: SampleGroupContext::SampleTable,
            entries: vec![SbgpEntry {
                sample_count: 1,
                group_description_index: 1,
            }],
        };
        assert!(sbgp.into_fragment_context().is_err());
    }

    #[test]
    fn sgpd_with_uniform_entries_uses_default_length() {
        let sgpd = SgpdBox {
            grouping_type: SgpdBox::GROUPING_TYPE_RAP,
            entries: vec![
                SampleGroupDescription::RandomAccess {
                    num_leading_samples_known: true,
                    num_leading_samples: 2,
                },
                SampleGroupDescription::RandomAccess {
                    num_leading_samples_known: false,
                    num_leading_samples: 0,
                },
            ],
        };
        let bytes = sgpd.encode_to_vec().expect("encode");
        // header(8) + fullbox(4) + grouping_type(4) + default_length(4) + count(4) + 2 entries
        assert_eq!(bytes.len(), 8 + 4 + 4 + 4 + 4 + 2);
        assert_eq!(&bytes[16..20], &1u32.to_be_bytes());
        assert_eq!(bytes[24], 0x82);
        assert_eq!(SgpdBox::decode(&bytes).expect("decode").0, sgpd);
    }

    #[test]
    fn sgpd_with_mixed_entries_prefixes_lengths() {
        let sgpd = SgpdBox {
            grouping_type: *b"xxxx",
            entries: vec![
                SampleGroupDescription::Unknown {
                    payload: vec![1, 2, 3],
                },
                SampleGroupDescription::Unknown { payload: vec![4] },
            ],
        };
        let bytes = sgpd.encode_to_vec().expect("encode");
        assert_eq!(&bytes[16..20], &0u32.to_be_bytes());
        assert_eq!(&bytes[24..28], &3u32.to_be_bytes());
        assert_eq!(SgpdBox::decode(&bytes).expect("decode").0, sgpd);
    }

    #[test]
    fn sgpd_version_0_needs_known_grouping_type() {
        // version 0, grouping_type "roll", entry_count 1, roll_distance -1
        let mut bytes = vec![0, 0, 0, 22, b's', b'g', b'p', b'd', 0, 0, 0, 0];
        bytes.extend_from_slice(b"roll");
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&(-1i16).to_be_bytes());
        let (sgpd, _) = SgpdBox::decode(&bytes).expect("decode");
        assert_eq!(
            sgpd.entries,
            [SampleGroupDescription::RollRecovery { roll_distance: -1 }]
        );

        bytes[12..16].copy_from_slice(b"xxxx");
        assert!(SgpdBox::decode(&bytes).is_err());
    }
}
