//! `moov` ボックスをメディアデータの前方に移動するための処理
use std::io::{Read, Seek, SeekFrom, Write};

use super::MuxError;

/// 移動量（= `moov` ボックスのサイズ）が確定するまで `moov` ボックスを構築し直す
///
/// `build` はチャンクオフセットに加算する移動量を受け取って、エンコード済みの `moov` ボックスを返す。
/// 移動量が増えると `co64` への昇格で `moov` ボックスが大きくなることがあるため、サイズが変わらなくなるまで繰り返す。
pub(crate) fn settle_moov<F>(mut build: F) -> Result<Vec<u8>, MuxError>
where
    F: FnMut(u64) -> Result<Vec<u8>, MuxError>,
{
    let mut shift = 0;
    loop {
        let bytes = build(shift)?;
        if bytes.len() as u64 == shift {
            return Ok(bytes);
        }
        shift = bytes.len() as u64;
    }
}

/// ファイル中の `[start, end)` の範囲のバイト列を `shift` バイト後方にずらす
///
/// 先頭から順に、二つのバッファを交互に使って読み込みと書き込みを行う。
/// 各バッファのサイズは `max(buffer_size / 2, shift)` で、書き込みによって未読の領域を上書きすることはない。
pub(crate) fn shift_forward<F>(
    file: &mut F,
    start: u64,
    end: u64,
    shift: u64,
    buffer_size: usize,
) -> Result<(), MuxError>
where
    F: Read + Write + Seek,
{
    if shift == 0 || start >= end {
        return Ok(());
    }

    let block_size = (buffer_size / 2).max(shift as usize).max(1) as u64;
    let mut current = Vec::new();
    let mut next = Vec::new();

    read_block(file, start, block_size.min(end - start), &mut current)?;
    let mut position = start;
    while !current.is_empty() {
        let next_position = position + current.len() as u64;
        read_block(
            file,
            next_position,
            block_size.min(end - next_position),
            &mut next,
        )?;

        file.seek(SeekFrom::Start(position + shift))?;
        file.write_all(&current)?;

        position = next_position;
        std::mem::swap(&mut current, &mut next);
    }

    log::debug!("shifted {} bytes forward by {shift} bytes", end - start);
    Ok(())
}

fn read_block<F>(file: &mut F, position: u64, size: u64, buf: &mut Vec<u8>) -> Result<(), MuxError>
where
    F: Read + Seek,
{
    buf.clear();
    buf.resize(size as usize, 0);
    if size > 0 {
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(buf)?;
    }
    Ok(())
}

/// 予約済みの領域に `moov` ボックスを書き込めるかどうかを判定する
///
/// 余りが出る場合は `free` ボックスで埋めるので、余りはヘッダー分の 8 バイト以上必要
pub(crate) fn fits_reserved_area(moov_size: u64, reserved_size: u64) -> bool {
    moov_size == reserved_size || moov_size + 8 <= reserved_size
}
