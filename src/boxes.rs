//! ISOBMFF のボックスを定義するモジュール
//!
//! 多重化処理が生成・参照するボックスのみを構造化して扱い、それ以外のボックスは [`UnknownBox`] として
//! バイト列のまま保持する（読み込んだものはそのまま書き戻せる）。
pub use crate::boxes_fmp4::{
    MfhdBox, MfraBox, MfroBox, MoofBox, TfdtBox, TfhdBox, TfraBox, TfraEntry, TrafBox, TrunBox,
    TrunSample,
};
pub use crate::boxes_moov_tree::{
    Co64Box, CslgBox, CttsBox, CttsEntry, DinfBox, DrefBox, EdtsBox, ElstBox, ElstEntry, HdlrBox,
    MdhdBox, MdiaBox, MehdBox, MinfBox, MoovBox, MvexBox, MvhdBox, SmhdBox, StblBox, StcoBox,
    StpsBox, StscBox, StscEntry, StsdBox, StssBox, StszBox, SttsBox, SttsEntry, TkhdBox, TrakBox,
    TrexBox, UrlBox, VmhdBox,
};
pub use crate::boxes_sample_entry::{
    AudioSampleEntry, AudioSampleEntryFields, BtrtBox, SampleEntry, VisualSampleEntry,
    VisualSampleEntryFields,
};
pub use crate::boxes_sample_group::{
    SampleGroupContext, SampleGroupDescription, SbgpBox, SbgpEntry, SdtpBox, SdtpEntry, SgpdBox,
};

use crate::{
    BaseBox, BoxHeader, BoxSize, BoxType, Decode, Encode, Error, Result, Uint,
    codec::{ByteReader, ByteWriter, decode_box, encode_box},
};

/// 親ボックス内で必須の子ボックスが見つかったかどうかをチェックする
#[track_caller]
pub(crate) fn check_mandatory_box<T>(b: Option<T>, expected: &str, parent: &str) -> Result<T> {
    b.ok_or_else(|| {
        Error::invalid_data(format!(
            "Missing mandatory '{expected}' box in '{parent}' box"
        ))
    })
}

/// [`FtypBox`] に格納されるブランド
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Brand([u8; 4]);

impl Brand {
    /// [ISO/IEC 14496-12] isom ブランド
    pub const ISOM: Self = Self::new(*b"isom");

    /// [ISO/IEC 14496-12] iso2 ブランド
    pub const ISO2: Self = Self::new(*b"iso2");

    /// [ISO/IEC 14496-12] iso4 ブランド（64 bit の各種フィールドを含む）
    pub const ISO4: Self = Self::new(*b"iso4");

    /// [ISO/IEC 14496-12] iso6 ブランド（フラグメント化されたファイル）
    pub const ISO6: Self = Self::new(*b"iso6");

    /// [ISO/IEC 14496-14] mp41 ブランド
    pub const MP41: Self = Self::new(*b"mp41");

    /// QuickTime File Format のブランド
    pub const QT: Self = Self::new(*b"qt  ");

    /// [ETSI TS 126 244] msdh ブランド（メディアセグメント）
    pub const MSDH: Self = Self::new(*b"msdh");

    /// [ETSI TS 126 244] msix ブランド（インデックス付きメディアセグメント）
    pub const MSIX: Self = Self::new(*b"msix");

    /// 四文字のバイト列から作成する
    pub const fn new(brand: [u8; 4]) -> Self {
        Self(brand)
    }

    /// ブランドのバイト列
    pub const fn get(self) -> [u8; 4] {
        self.0
    }
}

impl std::fmt::Debug for Brand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut t = f.debug_tuple("Brand");
        match std::str::from_utf8(&self.0) {
            Ok(s) => t.field(&s),
            Err(_) => t.field(&self.0),
        };
        t.finish()
    }
}

impl Encode for Brand {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.encode(buf)
    }
}

impl Decode for Brand {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        <[u8; 4]>::decode(buf).map(|(brand, n)| (Self(brand), n))
    }
}

/// [ISO/IEC 14496-12] FileTypeBox class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct FtypBox {
    pub major_brand: Brand,
    pub minor_version: u32,
    pub compatible_brands: Vec<Brand>,
}

impl FtypBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"ftyp");
}

impl Encode for FtypBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| {
            w.put(&self.major_brand)?;
            w.put(&self.minor_version)?;
            for brand in &self.compatible_brands {
                w.put(brand)?;
            }
            Ok(())
        })
    }
}

impl Decode for FtypBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            let major_brand = r.get()?;
            let minor_version = r.get()?;
            let mut compatible_brands = Vec::new();
            while !r.is_empty() {
                compatible_brands.push(r.get()?);
            }
            Ok(Self {
                major_brand,
                minor_version,
                compatible_brands,
            })
        })
    }
}

impl BaseBox for FtypBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

/// ファイルのトップレベルに置かれるボックス
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RootBox {
    Free(FreeBox),
    Mdat(MdatBox),
    Moov(MoovBox),
    Moof(MoofBox),
    Mfra(MfraBox),
    Unknown(UnknownBox),
}

impl RootBox {
    fn inner_box(&self) -> &dyn BaseBox {
        match self {
            Self::Free(b) => b,
            Self::Mdat(b) => b,
            Self::Moov(b) => b,
            Self::Moof(b) => b,
            Self::Mfra(b) => b,
            Self::Unknown(b) => b,
        }
    }
}

impl Encode for RootBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = ByteWriter::new(buf);
        match self {
            Self::Free(b) => w.put(b)?,
            Self::Mdat(b) => w.put(b)?,
            Self::Moov(b) => w.put(b)?,
            Self::Moof(b) => w.put(b)?,
            Self::Mfra(b) => w.put(b)?,
            Self::Unknown(b) => w.put(b)?,
        }
        Ok(w.position())
    }
}

impl Decode for RootBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(buf);
        let b = match r.peek_box_header()?.box_type {
            FreeBox::TYPE => Self::Free(r.get()?),
            MdatBox::TYPE => Self::Mdat(r.get()?),
            MoovBox::TYPE => Self::Moov(r.get()?),
            MoofBox::TYPE => Self::Moof(r.get()?),
            MfraBox::TYPE => Self::Mfra(r.get()?),
            _ => Self::Unknown(r.get()?),
        };
        Ok((b, r.position()))
    }
}

impl BaseBox for RootBox {
    fn box_type(&self) -> BoxType {
        self.inner_box().box_type()
    }

    fn is_unknown_box(&self) -> bool {
        self.inner_box().is_unknown_box()
    }

    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        self.inner_box().children()
    }
}

/// [ISO/IEC 14496-12] MediaDataBox class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct MdatBox {
    /// サイズフィールドが 0（ファイル末尾まで続く）かどうか
    pub is_variable_size: bool,
    pub payload: Vec<u8>,
}

impl MdatBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"mdat");
}

impl Encode for MdatBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let box_size = match self.is_variable_size {
            true => BoxSize::VARIABLE_SIZE,
            false => BoxSize::with_payload_size(Self::TYPE, self.payload.len() as u64),
        };
        let mut w = ByteWriter::new(buf);
        w.put(&BoxHeader::new(Self::TYPE, box_size))?;
        w.put(&self.payload)?;
        Ok(w.position())
    }
}

impl Decode for MdatBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, _) = BoxHeader::decode(buf)?;
        decode_box(buf, Self::TYPE, |r| {
            Ok(Self {
                is_variable_size: header.box_size == BoxSize::VARIABLE_SIZE,
                payload: r.take_rest().to_vec(),
            })
        })
    }
}

impl BaseBox for MdatBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

/// [ISO/IEC 14496-12] FreeSpaceBox class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct FreeBox {
    pub payload: Vec<u8>,
}

impl FreeBox {
    /// ボックス種別
    pub const TYPE: BoxType = BoxType::Normal(*b"free");
}

impl Encode for FreeBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_box(buf, Self::TYPE, |w| w.put(&self.payload))
    }
}

impl Decode for FreeBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        decode_box(buf, Self::TYPE, |r| {
            Ok(Self {
                payload: r.take_rest().to_vec(),
            })
        })
    }
}

impl BaseBox for FreeBox {
    fn box_type(&self) -> BoxType {
        Self::TYPE
    }
}

/// 構造化して扱わないボックス
///
/// ペイロードはバイト列のまま保持し、エンコード時にはそのまま書き出す
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct UnknownBox {
    pub box_type: BoxType,
    pub box_size: BoxSize,
    pub payload: Vec<u8>,
}

impl UnknownBox {
    /// 種別とペイロードから作成する（サイズはペイロードから求める）
    pub fn new(box_type: BoxType, payload: Vec<u8>) -> Self {
        Self {
            box_type,
            box_size: BoxSize::with_payload_size(box_type, payload.len() as u64),
            payload,
        }
    }
}

impl Encode for UnknownBox {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = ByteWriter::new(buf);
        w.put(&BoxHeader::new(self.box_type, self.box_size))?;
        w.put(&self.payload)?;
        Ok(w.position())
    }
}

impl Decode for UnknownBox {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
        let b = Self {
            box_type: header.box_type,
            box_size: header.box_size,
            payload: payload.to_vec(),
        };
        Ok((b, header.external_size() + payload.len()))
    }
}

impl BaseBox for UnknownBox {
    fn box_type(&self) -> BoxType {
        self.box_type
    }

    fn is_unknown_box(&self) -> bool {
        true
    }
}

/// `trex` / `tfhd` / `trun` で使われるサンプルフラグ
///
/// ```text
/// bit(4)  reserved
/// uint(2) is_leading
/// uint(2) sample_depends_on
/// uint(2) sample_is_depended_on
/// uint(2) sample_has_redundancy
/// bit(3)  sample_padding_value
/// bit(1)  sample_is_non_sync_sample
/// uint(16) sample_degradation_priority
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleFlags(u32);

type IsLeading = Uint<u32, 2, 26>;
type DependsOn = Uint<u32, 2, 24>;
type IsDependedOn = Uint<u32, 2, 22>;
type HasRedundancy = Uint<u32, 2, 20>;
type PaddingValue = Uint<u32, 3, 17>;
type IsNonSync = Uint<u32, 1, 16>;

impl SampleFlags {
    /// 32 bit 値をそのままフラグとして使う
    pub const fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// 全てのフィールドが 0 のフラグ
    pub const fn empty() -> Self {
        Self(0)
    }

    /// 各フィールドの値からフラグを組み立てる
    ///
    /// 各値はフィールドの幅を超えた上位ビットが切り捨てられる
    pub fn from_fields(
        is_leading: u8,
        sample_depends_on: u8,
        sample_is_depended_on: u8,
        sample_has_redundancy: u8,
        sample_padding_value: u8,
        sample_is_non_sync_sample: bool,
        sample_degradation_priority: u16,
    ) -> Self {
        Self(
            IsLeading::new(is_leading as u32 & 0b11).to_bits()
                | DependsOn::new(sample_depends_on as u32 & 0b11).to_bits()
                | IsDependedOn::new(sample_is_depended_on as u32 & 0b11).to_bits()
                | HasRedundancy::new(sample_has_redundancy as u32 & 0b11).to_bits()
                | PaddingValue::new(sample_padding_value as u32 & 0b111).to_bits()
                | IsNonSync::new(sample_is_non_sync_sample as u32).to_bits()
                | sample_degradation_priority as u32,
        )
    }

    /// 32 bit 値
    pub const fn get(self) -> u32 {
        self.0
    }

    /// 非同期サンプルかどうか
    pub fn sample_is_non_sync_sample(self) -> bool {
        IsNonSync::from_bits(self.0).get() == 1
    }

    /// 依存関係（`2` なら他のサンプルに依存しない）
    pub fn sample_depends_on(self) -> u8 {
        DependsOn::from_bits(self.0).get() as u8
    }
}

impl Encode for SampleFlags {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.encode(buf)
    }
}

impl Decode for SampleFlags {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        u32::decode(buf).map(|(v, n)| (Self(v), n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_flags_fields() {
        let flags = SampleFlags::from_fields(0, 1, 0, 0, 0, true, 0);
        assert_eq!(flags.get(), 0x0101_0000);
        assert!(flags.sample_is_non_sync_sample());
        assert_eq!(flags.sample_depends_on(), 1);

        let sync = SampleFlags::from_fields(0, 2, 0, 0, 0, false, 7);
        assert_eq!(sync.get(), 0x0200_0007);
        assert!(!sync.sample_is_non_sync_sample());
    }

    #[test]
    fn variable_size_mdat() -> Result<()> {
        let mdat = MdatBox {
            is_variable_size: true,
            payload: vec![1, 2, 3],
        };
        let bytes = mdat.encode_to_vec()?;
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(MdatBox::decode(&bytes)?, (mdat, 11));
        Ok(())
    }

    #[test]
    fn unknown_root_box_is_kept_as_is() -> Result<()> {
        let b = UnknownBox::new(BoxType::Normal(*b"udta"), vec![9; 5]);
        let bytes = b.encode_to_vec()?;
        let (root, size) = RootBox::decode(&bytes)?;
        assert_eq!(size, 13);
        assert!(root.is_unknown_box());
        assert_eq!(root.encode_to_vec()?, bytes);
        Ok(())
    }

    #[test]
    fn ftyp_roundtrip() -> Result<()> {
        let ftyp = FtypBox {
            major_brand: Brand::ISOM,
            minor_version: 512,
            compatible_brands: vec![Brand::ISOM, Brand::ISO2, Brand::MP41],
        };
        let bytes = ftyp.encode_to_vec()?;
        assert_eq!(bytes.len(), 8 + 8 + 12);
        assert_eq!(FtypBox::decode(&bytes)?, (ftyp, 28));
        Ok(())
    }
}
