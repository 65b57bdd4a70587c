//! ISOBMFF (MP4) ファイルを構築するためのマルチプレックスライブラリ
//!
//! サンプルを追記していくと、`moov` 配下のボックス木とサンプルテーブル（`stts` / `ctts` / `stsc` など）を
//! 逐次組み立てて、最後に [`mux::Movie::finalize()`] でファイルを完成させる。
//!
//! ボックス単位のエンコード・デコードは [`boxes`] モジュール、
//! 生成済みファイルの読み込みは [`demux`] モジュールで行う。
#![warn(missing_docs)]

mod auxiliary;
mod basic_types;
pub mod boxes;
mod boxes_fmp4;
mod boxes_moov_tree;
mod boxes_sample_entry;
mod boxes_sample_group;
mod codec;
pub mod demux;
mod entry_list;
pub mod mux;

pub use basic_types::{
    BaseBox, BoxHeader, BoxSize, BoxType, Either, FixedPointNumber, FullBox, FullBoxFlags,
    FullBoxHeader, Mp4File, Mp4FileTime, Uint, Utf8String,
};
pub use codec::{Decode, Encode, Error, ErrorKind, Result};
pub use demux::TrackKind;
pub use entry_list::EntryList;

// [NOTE]
// Windows 環境では aux.rs というファイル名が予約語で、リポジトリに含まれていると git clone に失敗するため、
// ファイル名自体は auxiliary.rs にして lib.rs の中で aux モジュール以下に再エクスポートしている。
pub mod aux {
    //! MP4 の仕様とは直接は関係がない、実装上便利な補助的なコンポーネントを集めたモジュール

    pub use crate::auxiliary::{SampleInfo, SampleTableAccessor};
}
