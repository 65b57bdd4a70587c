use std::{
    backtrace::{Backtrace, BacktraceStatus},
    num::{NonZeroU16, NonZeroU32},
    panic::Location,
};

use crate::{BoxHeader, BoxType, FullBox, FullBoxHeader};

/// このライブラリ用の Result 型
pub type Result<T> = std::result::Result<T, Error>;

/// エンコード/デコード操作のエラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 呼び出し側が渡した値が不正である（エンコードできない値など）
    InvalidInput,

    /// デコード対象のバイト列が壊れている
    InvalidData,

    /// バッファのサイズが足りない
    InsufficientBuffer,

    /// 未対応の形式
    Unsupported,
}

/// エンコード/デコード処理のエラー
pub struct Error {
    /// エラーの種類
    pub kind: ErrorKind,

    /// エラーの詳細
    pub reason: String,

    /// エラーが生成されたソースコード上の位置
    pub location: &'static Location<'static>,

    /// エラーが発生したボックスの種別（判明している場合）
    pub box_type: Option<BoxType>,

    /// バックトレース（`RUST_BACKTRACE` 環境変数が設定されている場合のみ取得される）
    pub backtrace: Backtrace,
}

impl Error {
    /// エラー理由つきで [`Error`] インスタンスを生成する
    #[track_caller]
    pub fn with_reason<T: Into<String>>(kind: ErrorKind, reason: T) -> Self {
        Self {
            kind,
            reason: reason.into(),
            location: Location::caller(),
            box_type: None,
            backtrace: Backtrace::capture(),
        }
    }

    #[track_caller]
    pub(crate) fn unsupported<T: Into<String>>(reason: T) -> Self {
        Self::with_reason(ErrorKind::Unsupported, reason)
    }

    #[track_caller]
    pub(crate) fn invalid_input<T: Into<String>>(reason: T) -> Self {
        Self::with_reason(ErrorKind::InvalidInput, reason)
    }

    #[track_caller]
    pub(crate) fn invalid_data<T: Into<String>>(reason: T) -> Self {
        Self::with_reason(ErrorKind::InvalidData, reason)
    }

    #[track_caller]
    fn insufficient_buffer(required: usize, available: usize) -> Self {
        Self::with_reason(
            ErrorKind::InsufficientBuffer,
            format!("{required} bytes required, but only {available} bytes available"),
        )
    }

    /// エラーが発生したボックスの種別を設定する
    ///
    /// 既に設定済みの場合は、より内側のボックスの種別を優先して何もしない
    pub fn with_box_type(mut self, box_type: BoxType) -> Self {
        self.box_type.get_or_insert(box_type);
        self
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ty) = self.box_type {
            write!(f, "[{ty}] ")?;
        }
        write!(
            f,
            "{:?}: {} (at {}:{})",
            self.kind,
            self.reason,
            self.location.file(),
            self.location.line()
        )?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\n\nBacktrace:\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// バイト列に変換可能な型を表現するためのトレイト
pub trait Encode {
    /// `self` をバイト列に変換して `buf` の先頭に書きこみ、書き込んだバイト数を返す
    ///
    /// `buf` のサイズが不足している場合には [`ErrorKind::InsufficientBuffer`] エラーが返される
    fn encode(&self, buf: &mut [u8]) -> Result<usize>;

    /// `self` をバイト列に変換して、変換後のバイト列を返す
    fn encode_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0; 64];
        loop {
            match self.encode(&mut buf) {
                Ok(size) => {
                    buf.truncate(size);
                    return Ok(buf);
                }
                Err(e) if e.kind == ErrorKind::InsufficientBuffer => {
                    let len = buf.len() * 2;
                    buf.resize(len, 0);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// バイト列から `Self` に変換するためのトレイト
pub trait Decode: Sized {
    /// バイト列の先頭からこの型の値をデコードし、値と消費したバイト数を返す
    fn decode(buf: &[u8]) -> Result<(Self, usize)>;
}

macro_rules! impl_codec_for_int {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            #[track_caller]
            fn encode(&self, buf: &mut [u8]) -> Result<usize> {
                let bytes = self.to_be_bytes();
                let available = buf.len();
                let dst = buf
                    .get_mut(..bytes.len())
                    .ok_or_else(|| Error::insufficient_buffer(bytes.len(), available))?;
                dst.copy_from_slice(&bytes);
                Ok(bytes.len())
            }
        }

        impl Decode for $ty {
            #[track_caller]
            fn decode(buf: &[u8]) -> Result<(Self, usize)> {
                const SIZE: usize = size_of::<$ty>();
                let bytes = buf
                    .first_chunk::<SIZE>()
                    .ok_or_else(|| Error::insufficient_buffer(SIZE, buf.len()))?;
                Ok((<$ty>::from_be_bytes(*bytes), SIZE))
            }
        }
    )*};
}

impl_codec_for_int!(u8, u16, u32, u64, i8, i16, i32, i64);

macro_rules! impl_codec_for_non_zero {
    ($($ty:ty => $inner:ty),*) => {$(
        impl Encode for $ty {
            fn encode(&self, buf: &mut [u8]) -> Result<usize> {
                self.get().encode(buf)
            }
        }

        impl Decode for $ty {
            #[track_caller]
            fn decode(buf: &[u8]) -> Result<(Self, usize)> {
                let (v, size) = <$inner>::decode(buf)?;
                let v = <$ty>::new(v)
                    .ok_or_else(|| Error::invalid_data("Expected a non-zero integer, but got 0"))?;
                Ok((v, size))
            }
        }
    )*};
}

impl_codec_for_non_zero!(NonZeroU16 => u16, NonZeroU32 => u32);

impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut writer = ByteWriter::new(buf);
        for item in self {
            writer.put(item)?;
        }
        Ok(writer.position())
    }
}

impl<T: Decode + Default + Copy, const N: usize> Decode for [T; N] {
    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let mut reader = ByteReader::new(buf);
        let mut items = [T::default(); N];
        for item in &mut items {
            *item = reader.get()?;
        }
        Ok((items, reader.position()))
    }
}

impl Encode for [u8] {
    #[track_caller]
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let available = buf.len();
        buf.get_mut(..self.len())
            .ok_or_else(|| Error::insufficient_buffer(self.len(), available))?
            .copy_from_slice(self);
        Ok(self.len())
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.as_slice().encode(buf)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.as_ref().map_or(Ok(0), |v| v.encode(buf))
    }
}

/// バッファの先頭から順番に値を書き込んでいくためのカーソル
pub(crate) struct ByteWriter<'a> {
    buf: &'a mut [u8],
    position: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, position: 0 }
    }

    /// これまでに書き込んだバイト数
    pub fn position(&self) -> usize {
        self.position
    }

    #[track_caller]
    pub fn put<T: Encode + ?Sized>(&mut self, value: &T) -> Result<()> {
        let rest = self
            .buf
            .get_mut(self.position..)
            .ok_or_else(|| Error::insufficient_buffer(self.position, 0))?;
        self.position += value.encode(rest)?;
        Ok(())
    }

    /// 書き込み済みの位置の値を上書きする
    pub fn put_at<T: Encode>(&mut self, position: usize, value: &T) -> Result<()> {
        let written = &mut self.buf[..self.position];
        let dst = written
            .get_mut(position..)
            .ok_or_else(|| Error::invalid_input("Write position is out of range"))?;
        value.encode(dst)?;
        Ok(())
    }

    pub fn into_written(self) -> &'a mut [u8] {
        &mut self.buf[..self.position]
    }
}

/// バイト列の先頭から順番に値を読み出していくためのカーソル
#[derive(Debug, Clone)]
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// まだ読み出していない部分
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.position..]
    }

    pub fn is_empty(&self) -> bool {
        self.position >= self.buf.len()
    }

    #[track_caller]
    pub fn get<T: Decode>(&mut self) -> Result<T> {
        let (value, size) = T::decode(self.remaining())?;
        self.position += size;
        Ok(value)
    }

    /// 指定されたバイト数をそのまま取り出す
    #[track_caller]
    pub fn take(&mut self, size: usize) -> Result<&'a [u8]> {
        let rest = self.remaining();
        let bytes = rest
            .get(..size)
            .ok_or_else(|| Error::insufficient_buffer(size, rest.len()))?;
        self.position += size;
        Ok(bytes)
    }

    /// 残りを全て取り出す
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = self.remaining();
        self.position = self.buf.len();
        rest
    }

    /// 次のボックスのヘッダーを、読み出し位置を進めずに返す
    pub fn peek_box_header(&self) -> Result<BoxHeader> {
        BoxHeader::decode(self.remaining()).map(|(header, _)| header)
    }
}

/// ボックスをエンコードする
///
/// ペイロードの書き込みは `f` で行い、サイズフィールドは最後に確定させる
pub(crate) fn encode_box<F>(buf: &mut [u8], box_type: BoxType, f: F) -> Result<usize>
where
    F: FnOnce(&mut ByteWriter<'_>) -> Result<()>,
{
    let header = BoxHeader::new_variable_size(box_type);
    let mut writer = ByteWriter::new(buf);
    writer.put(&header)?;
    f(&mut writer)?;
    let written = writer.into_written();
    header.finalize_box_size(written)?;
    Ok(written.len())
}

/// [`FullBox`] をエンコードする（バージョンとフラグは `b` から取得する）
pub(crate) fn encode_full_box<B, F>(buf: &mut [u8], b: &B, f: F) -> Result<usize>
where
    B: FullBox,
    F: FnOnce(&mut ByteWriter<'_>) -> Result<()>,
{
    encode_box(buf, b.box_type(), |writer| {
        writer.put(&FullBoxHeader::from_box(b))?;
        f(writer)
    })
}

/// ボックスをデコードする
///
/// `f` にはペイロード部分を読み出すカーソルが渡される。
/// 発生したエラーにはボックス種別が付与される。
pub(crate) fn decode_box<T, F>(buf: &[u8], box_type: BoxType, f: F) -> Result<(T, usize)>
where
    F: FnOnce(&mut ByteReader<'_>) -> Result<T>,
{
    let decode = || -> Result<(T, usize)> {
        let (header, payload) = BoxHeader::decode_header_and_payload(buf)?;
        header.box_type.expect(box_type)?;
        let value = f(&mut ByteReader::new(payload))?;
        Ok((value, header.external_size() + payload.len()))
    };
    decode().map_err(|e| e.with_box_type(box_type))
}

/// [`FullBox`] をデコードする
pub(crate) fn decode_full_box<T, F>(buf: &[u8], box_type: BoxType, f: F) -> Result<(T, usize)>
where
    F: FnOnce(FullBoxHeader, &mut ByteReader<'_>) -> Result<T>,
{
    decode_box(buf, box_type, |reader| {
        let header = reader.get()?;
        f(header, reader)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        assert_eq!(0x0102u16.encode_to_vec().ok(), Some(vec![1, 2]));
        assert_eq!((-2i32).encode_to_vec().ok(), Some(vec![0xff, 0xff, 0xff, 0xfe]));
        assert_eq!(u32::decode(&[0, 0, 1, 0, 9]).ok(), Some((256, 4)));
    }

    #[test]
    fn short_buffer_is_reported() {
        let e = u64::decode(&[0; 7]).err().map(|e| e.kind);
        assert_eq!(e, Some(ErrorKind::InsufficientBuffer));

        let mut buf = [0; 3];
        let e = 1u32.encode(&mut buf).err().map(|e| e.kind);
        assert_eq!(e, Some(ErrorKind::InsufficientBuffer));
    }

    #[test]
    fn zero_is_rejected_for_non_zero_types() {
        let e = NonZeroU32::decode(&[0; 4]).err().map(|e| e.kind);
        assert_eq!(e, Some(ErrorKind::InvalidData));
    }

    #[test]
    fn writer_and_reader_cursors() -> Result<()> {
        let mut buf = [0; 16];
        let mut writer = ByteWriter::new(&mut buf);
        writer.put(&1u8)?;
        writer.put(&0u32)?;
        writer.put(b"ab")?;
        writer.put_at(1, &7u32)?;
        assert_eq!(writer.into_written(), &[1, 0, 0, 0, 7, b'a', b'b']);

        let mut reader = ByteReader::new(&buf[..7]);
        assert_eq!(reader.get::<u8>()?, 1);
        assert_eq!(reader.get::<u32>()?, 7);
        assert_eq!(reader.take(1)?, b"a");
        assert_eq!(reader.take_rest(), b"b");
        assert!(reader.is_empty());
        Ok(())
    }
}
