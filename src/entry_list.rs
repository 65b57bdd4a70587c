//! サンプルテーブルの各種エントリーを保持するためのコンテナを提供するモジュール
use std::cell::Cell;

/// 一つのブロックに保持するエントリー数の目安
const BLOCK_SIZE: usize = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    block: usize,
    first_index: usize,
}

/// 末尾への追加が大半を占めるエントリー列を、固定長のブロック単位で保持するコンテナ
///
/// 数十万単位のサンプルを持つトラックでも再確保によるコピーが発生しないようにブロックに分割している。
/// インデックスによるアクセスでは、直前にアクセスしたブロックの位置を覚えておき、そこから前後に辿る。
/// 連続したインデックスへのアクセス（テーブルの走査や末尾付近の更新）ではこれによって定数時間でエントリーが得られる。
///
/// カーソルは内部状態であり、どのようなアクセス順でも結果は [`Vec`] と同一になる。
pub struct EntryList<T> {
    blocks: Vec<Vec<T>>,
    len: usize,
    cursor: Cell<Cursor>,
}

impl<T> EntryList<T> {
    /// 空のリストを作成する
    pub const fn new() -> Self {
        Self {
            blocks: Vec::new(),
            len: 0,
            cursor: Cell::new(Cursor {
                block: 0,
                first_index: 0,
            }),
        }
    }

    /// 要素数を返す
    pub fn len(&self) -> usize {
        self.len
    }

    /// 要素が空かどうかを返す
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 全ての要素を削除する
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.len = 0;
        self.cursor.set(Cursor::default());
    }

    /// 末尾に要素を追加する
    pub fn push(&mut self, value: T) {
        match self.blocks.last_mut() {
            Some(block) if block.len() < BLOCK_SIZE => block.push(value),
            _ => {
                let mut block = Vec::with_capacity(BLOCK_SIZE);
                block.push(value);
                self.blocks.push(block);
            }
        }
        self.len += 1;
    }

    /// 末尾の要素を取り除いて返す
    pub fn pop(&mut self) -> Option<T> {
        let block = self.blocks.last_mut()?;
        let value = block.pop()?;
        if block.is_empty() {
            self.blocks.pop();
            if self.cursor.get().block >= self.blocks.len() {
                self.cursor.set(Cursor::default());
            }
        }
        self.len -= 1;
        Some(value)
    }

    /// 指定位置に要素を挿入する
    ///
    /// `index > len` の場合はパニックする
    pub fn insert(&mut self, index: usize, value: T) {
        assert!(
            index <= self.len,
            "insertion index (is {index}) should be <= len (is {})",
            self.len
        );
        if index == self.len {
            self.push(value);
            return;
        }

        let (block_index, inner) = self.locate(index);
        let block = &mut self.blocks[block_index];
        block.insert(inner, value);
        if block.len() > BLOCK_SIZE * 2 {
            let tail = block.split_off(BLOCK_SIZE);
            self.blocks.insert(block_index + 1, tail);
        }
        self.len += 1;
    }

    /// 指定位置の要素を取り除いて返す
    ///
    /// `index >= len` の場合はパニックする
    pub fn remove(&mut self, index: usize) -> T {
        assert!(
            index < self.len,
            "removal index (is {index}) should be < len (is {})",
            self.len
        );
        let (block_index, inner) = self.locate(index);
        let value = self.blocks[block_index].remove(inner);
        if self.blocks[block_index].is_empty() {
            self.blocks.remove(block_index);
            if block_index >= self.blocks.len() {
                self.cursor.set(Cursor::default());
            }
        }
        self.len -= 1;
        value
    }

    /// 指定位置の要素への参照を返す
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        let (block, inner) = self.locate(index);
        self.blocks[block].get(inner)
    }

    /// 指定位置の要素への可変参照を返す
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        let (block, inner) = self.locate(index);
        self.blocks[block].get_mut(inner)
    }

    /// 先頭の要素への参照を返す
    pub fn first(&self) -> Option<&T> {
        self.blocks.first().and_then(|b| b.first())
    }

    /// 末尾の要素への参照を返す
    pub fn last(&self) -> Option<&T> {
        self.blocks.last().and_then(|b| b.last())
    }

    /// 末尾の要素への可変参照を返す
    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.blocks.last_mut().and_then(|b| b.last_mut())
    }

    /// 要素を先頭から走査するイテレーターを返す
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.blocks.iter().flatten()
    }

    /// 要素を先頭から可変参照で走査するイテレーターを返す
    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.blocks.iter_mut().flatten()
    }

    // index < len であること
    fn locate(&self, index: usize) -> (usize, usize) {
        let mut cursor = self.cursor.get();
        if cursor.block >= self.blocks.len() {
            cursor = Cursor::default();
        }

        while index < cursor.first_index {
            cursor.block -= 1;
            cursor.first_index -= self.blocks[cursor.block].len();
        }
        while index >= cursor.first_index + self.blocks[cursor.block].len() {
            cursor.first_index += self.blocks[cursor.block].len();
            cursor.block += 1;
        }

        self.cursor.set(cursor);
        (cursor.block, index - cursor.first_index)
    }
}

impl<T: Clone> EntryList<T> {
    /// 全要素を [`Vec`] にコピーして返す
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T> Default for EntryList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for EntryList<T> {
    fn clone(&self) -> Self {
        Self {
            blocks: self.blocks.clone(),
            len: self.len,
            cursor: self.cursor.clone(),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for EntryList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: PartialEq> PartialEq for EntryList<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl<T: Eq> Eq for EntryList<T> {}

impl<T> FromIterator<T> for EntryList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut list = Self::new();
        list.extend(iter);
        list
    }
}

impl<T> Extend<T> for EntryList<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

impl<'a, T> IntoIterator for &'a EntryList<T> {
    type Item = &'a T;
    type IntoIter = std::iter::Flatten<std::slice::Iter<'a, Vec<T>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_access_matches_vec() {
        let list: EntryList<usize> = (0..BLOCK_SIZE * 3 + 7).collect();
        let expected: Vec<usize> = (0..BLOCK_SIZE * 3 + 7).collect();

        // 前方・後方・飛び飛びのアクセスでカーソルを揺さぶる
        for i in (0..expected.len()).rev().chain(0..expected.len()).step_by(3) {
            assert_eq!(list.get(i), expected.get(i));
        }
        assert_eq!(list.get(expected.len()), None);
        assert_eq!(list.last(), expected.last());
    }

    #[test]
    fn insert_and_remove_across_blocks() {
        let mut list: EntryList<usize> = (0..BLOCK_SIZE * 2).collect();
        let mut expected: Vec<usize> = (0..BLOCK_SIZE * 2).collect();

        for i in 0..BLOCK_SIZE + 10 {
            list.insert(BLOCK_SIZE / 2, 10_000 + i);
            expected.insert(BLOCK_SIZE / 2, 10_000 + i);
        }
        assert_eq!(list.to_vec(), expected);

        while list.len() > 3 {
            let i = list.len() / 3;
            assert_eq!(list.remove(i), expected.remove(i));
            assert_eq!(list.get(i), expected.get(i));
        }
        assert_eq!(list.to_vec(), expected);

        while let Some(v) = list.pop() {
            assert_eq!(Some(v), expected.pop());
        }
        assert!(list.is_empty());
        assert_eq!(list.get(0), None);
    }
}
