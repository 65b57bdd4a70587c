use std::{
    ops::{BitAnd, Shl, Shr, Sub},
    time::Duration,
};

use crate::{
    Decode, Encode, Error, Result,
    boxes::{FtypBox, RootBox},
    codec::{ByteReader, ByteWriter},
};

/// 全てのボックスが実装するトレイト
///
/// 標準ライブラリの [`std::boxed::Box`] との衝突を避けるため `BaseBox` という名前にしている
pub trait BaseBox {
    /// ボックスの種別
    fn box_type(&self) -> BoxType;

    /// 未知のボックスかどうか
    ///
    /// [`UnknownBox`](crate::boxes::UnknownBox) をバリアントに含む `enum` の場合は、このメソッドを上書きすること
    fn is_unknown_box(&self) -> bool {
        false
    }

    /// 子ボックスを走査するイテレーターを返す
    ///
    /// デフォルト実装は子ボックスを持たないボックス用
    fn children<'a>(&'a self) -> Box<dyn 'a + Iterator<Item = &'a dyn BaseBox>> {
        Box::new(std::iter::empty())
    }
}

pub(crate) fn as_box_object<T: BaseBox>(t: &T) -> &dyn BaseBox {
    t
}

/// フルボックスを表すトレイト
///
/// デフォルト実装はバージョン 0、フラグなし
pub trait FullBox: BaseBox {
    /// フルボックスのバージョンを返す
    fn full_box_version(&self) -> u8 {
        0
    }

    /// フルボックスのフラグを返す
    fn full_box_flags(&self) -> FullBoxFlags {
        FullBoxFlags::empty()
    }
}

/// MP4 ファイル全体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp4File<B = RootBox> {
    /// 先頭の `ftyp` ボックス
    pub ftyp_box: FtypBox,

    /// `ftyp` の後ろに並ぶトップレベルのボックス群
    pub boxes: Vec<B>,
}

impl<B: BaseBox> Mp4File<B> {
    /// トップレベルのボックス群を先頭から順に走査する
    pub fn iter(&self) -> impl Iterator<Item = &dyn BaseBox> {
        std::iter::once(&self.ftyp_box as &dyn BaseBox).chain(self.boxes.iter().map(as_box_object))
    }
}

impl<B: Decode> Decode for Mp4File<B> {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf);
        let ftyp_box = reader.get()?;
        let mut boxes = Vec::new();
        while !reader.is_empty() {
            boxes.push(reader.get()?);
        }
        Ok((Self { ftyp_box, boxes }, reader.position()))
    }
}

impl<B: Encode> Encode for Mp4File<B> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut writer = ByteWriter::new(buf);
        writer.put(&self.ftyp_box)?;
        for b in &self.boxes {
            writer.put(b)?;
        }
        Ok(writer.position())
    }
}

/// ボックスの先頭に置かれるサイズと種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxHeader {
    /// ボックスの種別
    pub box_type: BoxType,

    /// ヘッダーを含むボックス全体のサイズ
    pub box_size: BoxSize,
}

impl BoxHeader {
    /// 32 bit サイズと四文字の種別からなるヘッダーのサイズ
    pub const MIN_SIZE: usize = 4 + 4;

    /// 64 bit サイズと UUID 形式の種別からなるヘッダーのサイズ
    pub const MAX_SIZE: usize = 4 + 8 + 4 + 16;

    /// 種別とサイズを指定してヘッダーを作成する
    pub const fn new(box_type: BoxType, box_size: BoxSize) -> Self {
        Self { box_type, box_size }
    }

    /// サイズ未確定のヘッダーを作成する
    ///
    /// ボックス全体を書き込んだ後に [`BoxHeader::finalize_box_size()`] でサイズを埋める
    pub const fn new_variable_size(box_type: BoxType) -> Self {
        Self::new(box_type, BoxSize::VARIABLE_SIZE)
    }

    /// エンコード済みのボックス全体を受け取って、先頭のサイズフィールドを実際のサイズで上書きする
    ///
    /// 32 bit のサイズフィールドに収まらない場合はエラーになる
    pub fn finalize_box_size(self, box_bytes: &mut [u8]) -> Result<()> {
        let Ok(size) = u32::try_from(box_bytes.len()) else {
            return Err(Error::invalid_input(format!(
                "Box size too large for 32-bit header: {}",
                box_bytes.len()
            ))
            .with_box_type(self.box_type));
        };
        size.encode(box_bytes)?;
        Ok(())
    }

    /// ヘッダーのエンコード後のバイト数
    pub fn external_size(self) -> usize {
        self.box_type.external_size() + self.box_size.external_size()
    }

    /// ヘッダーをデコードして、ペイロード部分と一緒に返す
    ///
    /// サイズフィールドが 0 の場合は `buf` の末尾までをペイロードとする
    pub fn decode_header_and_payload(buf: &[u8]) -> Result<(Self, &[u8])> {
        let (header, header_size) = Self::decode(buf)?;
        let box_size = match header.box_size.get() {
            0 => buf.len(),
            n => usize::try_from(n)
                .ok()
                .filter(|n| *n <= buf.len())
                .ok_or_else(|| {
                    Error::invalid_data(format!(
                        "Box size {n} exceeds the available {} bytes",
                        buf.len()
                    ))
                    .with_box_type(header.box_type)
                })?,
        };
        Ok((header, &buf[header_size..box_size]))
    }
}

impl Encode for BoxHeader {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut writer = ByteWriter::new(buf);
        match self.box_size {
            BoxSize::U32(size) => writer.put(&size)?,
            BoxSize::U64(_) => writer.put(&1u32)?,
        }
        match &self.box_type {
            BoxType::Normal(ty) => writer.put(ty)?,
            BoxType::Uuid(ty) => {
                writer.put(b"uuid")?;
                writer.put(ty)?;
            }
        }
        if let BoxSize::U64(size) = self.box_size {
            writer.put(&size)?;
        }
        Ok(writer.position())
    }
}

impl Decode for BoxHeader {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf);
        let size: u32 = reader.get()?;
        let box_type = match reader.get::<[u8; 4]>()? {
            ty if ty == *b"uuid" => BoxType::Uuid(reader.get()?),
            ty => BoxType::Normal(ty),
        };
        let box_size = match size {
            1 => BoxSize::U64(reader.get()?),
            n => BoxSize::U32(n),
        };

        let header_size = reader.position();
        if box_size.get() != 0 && box_size.get() < header_size as u64 {
            return Err(Error::invalid_data(format!(
                "Too small box size: actual={}, expected={header_size} or more",
                box_size.get(),
            ))
            .with_box_type(box_type));
        }
        Ok((Self { box_type, box_size }, header_size))
    }
}

/// フルボックスのペイロード先頭に置かれるバージョンとフラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullBoxHeader {
    /// バージョン
    pub version: u8,

    /// フラグ
    pub flags: FullBoxFlags,
}

impl FullBoxHeader {
    /// フルボックスの現在の値から、書き込むべきヘッダーを求める
    pub fn from_box<B: FullBox>(b: &B) -> Self {
        Self {
            version: b.full_box_version(),
            flags: b.full_box_flags(),
        }
    }
}

impl Encode for FullBoxHeader {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut writer = ByteWriter::new(buf);
        writer.put(&self.version)?;
        writer.put(&self.flags)?;
        Ok(writer.position())
    }
}

impl Decode for FullBoxHeader {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf);
        let version = reader.get()?;
        let flags = reader.get()?;
        Ok((Self { version, flags }, reader.position()))
    }
}

/// フルボックスの 24 bit のフラグ
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FullBoxFlags(u32);

impl FullBoxFlags {
    /// 全てのビットが立っていないフラグ
    pub const fn empty() -> Self {
        Self(0)
    }

    /// 下位 24 bit をフラグとして使う
    pub const fn new(flags: u32) -> Self {
        Self(flags & 0x00ff_ffff)
    }

    /// `(ビット位置, 立っているかどうか)` の列からフラグを組み立てる
    pub fn from_flags<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = (usize, bool)>,
    {
        iter.into_iter()
            .filter(|(_, set)| *set)
            .fold(Self::empty(), |acc, (i, _)| Self::new(acc.0 | (1 << i)))
    }

    /// フラグの値
    pub const fn get(self) -> u32 {
        self.0
    }

    /// `i` ビット目が立っているかどうか
    pub const fn is_set(self, i: usize) -> bool {
        (self.0 >> i) & 1 == 1
    }
}

impl Encode for FullBoxFlags {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.to_be_bytes()[1..].encode(buf)
    }
}

impl Decode for FullBoxFlags {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let [a, b, c] = ByteReader::new(buf).get::<[u8; 3]>()?;
        Ok((Self(u32::from_be_bytes([0, a, b, c])), 3))
    }
}

/// ボックスのサイズ
///
/// 通常はヘッダーとペイロードの合計値となる。
/// ファイル末尾のボックスに限り 0 を指定でき、その場合はファイルの終わりまでがペイロードとなる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum BoxSize {
    U32(u32),
    U64(u64),
}

impl BoxSize {
    /// ファイルの終わりまで続くボックスのサイズ
    pub const VARIABLE_SIZE: Self = Self::U32(0);

    /// ペイロードのサイズから、ヘッダーを含めたサイズを求める
    ///
    /// 32 bit に収まらない場合は 64 bit のサイズフィールドを使う
    pub fn with_payload_size(box_type: BoxType, payload_size: u64) -> Self {
        let small = 4 + box_type.external_size() as u64 + payload_size;
        match u32::try_from(small) {
            Ok(size) => Self::U32(size),
            Err(_) => Self::U64(small + 8),
        }
    }

    /// サイズの値
    pub const fn get(self) -> u64 {
        match self {
            Self::U32(v) => v as u64,
            Self::U64(v) => v,
        }
    }

    /// ヘッダー内でサイズを表すのに使うバイト数
    pub const fn external_size(self) -> usize {
        match self {
            Self::U32(_) => 4,
            Self::U64(_) => 12,
        }
    }
}

/// ボックスの種別
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BoxType {
    /// 四文字の種別
    Normal([u8; 4]),

    /// `uuid` ボックスの拡張種別
    Uuid([u8; 16]),
}

impl BoxType {
    /// 種別のバイト列
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Normal(ty) => ty,
            Self::Uuid(ty) => ty,
        }
    }

    /// ヘッダー内で種別を表すのに使うバイト数
    pub const fn external_size(self) -> usize {
        match self {
            Self::Normal(_) => 4,
            Self::Uuid(_) => 4 + 16,
        }
    }

    /// `expected` と異なる種別ならエラーを返す
    #[track_caller]
    pub fn expect(self, expected: Self) -> Result<()> {
        if self != expected {
            return Err(Error::invalid_data(format!(
                "Expected box type `{expected}`, but got `{self}`"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut t = f.debug_tuple("BoxType");
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) if matches!(self, Self::Normal(_)) => t.field(&s),
            _ => t.field(&self.as_bytes()),
        };
        t.finish()
    }
}

impl std::fmt::Display for BoxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self, std::str::from_utf8(self.as_bytes())) {
            (Self::Normal(_), Ok(s)) => f.write_str(s),
            _ => write!(f, "{:?}", self.as_bytes()),
        }
    }
}

/// 1904-01-01 00:00:00 UTC からの経過秒数で表現される時刻
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mp4FileTime(u64);

impl Mp4FileTime {
    /// 1904 年と 1970 年の起点の差（秒）
    const UNIX_EPOCH_OFFSET: u64 = 2_082_844_800;

    /// 1904 年起点の経過秒数から作成する
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// 1904 年起点の経過秒数
    pub const fn as_secs(self) -> u64 {
        self.0
    }

    /// UNIX 時刻から作成する
    pub const fn from_unix_time(unix_time: Duration) -> Self {
        Self(unix_time.as_secs().saturating_add(Self::UNIX_EPOCH_OFFSET))
    }
}

/// 整数部 `I` と小数部 `F` からなる固定小数点数
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FixedPointNumber<I, F = I> {
    /// 整数部
    pub integer: I,

    /// 小数部
    pub fraction: F,
}

impl<I, F> FixedPointNumber<I, F> {
    /// 整数部と小数部から作成する
    pub const fn new(integer: I, fraction: F) -> Self {
        Self { integer, fraction }
    }
}

impl<I: Encode, F: Encode> Encode for FixedPointNumber<I, F> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut writer = ByteWriter::new(buf);
        writer.put(&self.integer)?;
        writer.put(&self.fraction)?;
        Ok(writer.position())
    }
}

impl<I: Decode, F: Decode> Decode for FixedPointNumber<I, F> {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf);
        let integer = reader.get()?;
        let fraction = reader.get()?;
        Ok((Self { integer, fraction }, reader.position()))
    }
}

/// null 終端の UTF-8 文字列
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Utf8String(String);

impl Utf8String {
    /// 空文字列
    pub const EMPTY: Self = Self(String::new());

    /// 終端の null を含まない文字列から作成する
    ///
    /// 途中に null 文字がある場合は [`None`] を返す
    pub fn new(s: &str) -> Option<Self> {
        (!s.contains('\0')).then(|| Self(s.to_owned()))
    }

    /// 終端の null を除いた文字列
    pub fn get(&self) -> &str {
        &self.0
    }

    /// 終端の null を含むバイト列に変換する
    pub fn into_null_terminated_bytes(self) -> Vec<u8> {
        let mut bytes = self.0.into_bytes();
        bytes.push(0);
        bytes
    }
}

impl Encode for Utf8String {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut writer = ByteWriter::new(buf);
        writer.put(self.0.as_bytes())?;
        writer.put(&0u8)?;
        Ok(writer.position())
    }
}

impl Decode for Utf8String {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let end = buf
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::invalid_data("Missing null terminator"))?;
        let s = std::str::from_utf8(&buf[..end])
            .map_err(|e| Error::invalid_data(format!("Invalid UTF-8 string: {e}")))?;
        Ok((Self(s.to_owned()), end + 1))
    }
}

/// `A` か `B` のどちらか一方
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum Either<A, B> {
    A(A),
    B(B),
}

impl<A: BaseBox, B: BaseBox> Either<A, B> {
    fn inner_box(&self) -> &dyn BaseBox {
        match self {
            Self::A(x) => x,
            Self::B(x) => x,
        }
    }
}

impl<A: Encode, B: Encode> Encode for Either<A, B> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::A(x) => x.encode(buf),
            Self::B(x) => x.encode(buf),
        }
    }
}

impl<A: BaseBox, B: BaseBox> BaseBox for Either<A, B> {
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

/// `T` の中の `OFFSET` ビット目から `BITS` ビット分に詰め込まれた非負整数
///
/// 一つの整数に複数のフィールドがパックされているボックスで使う
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uint<T, const BITS: u32, const OFFSET: u32 = 0>(T);

impl<T, const BITS: u32, const OFFSET: u32> Uint<T, BITS, OFFSET>
where
    T: Shr<u32, Output = T>
        + Shl<u32, Output = T>
        + BitAnd<Output = T>
        + Sub<Output = T>
        + From<u8>,
{
    /// 値から作成する（値は `BITS` ビットに収まっていること）
    pub const fn new(v: T) -> Self {
        Self(v)
    }

    /// 値
    pub fn get(self) -> T {
        self.0
    }

    /// パックされた `v` からこのフィールドの部分を取り出す
    pub fn from_bits(v: T) -> Self {
        let mask = (T::from(1) << BITS) - T::from(1);
        Self((v >> OFFSET) & mask)
    }

    /// パックされた整数内でのビット列に変換する
    pub fn to_bits(self) -> T {
        self.0 << OFFSET
    }
}
