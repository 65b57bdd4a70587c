//! EntryList の Property-Based Testing
//!
//! 任意の操作列を適用した結果が Vec と一致することを確認する

use isobmff_muxer::EntryList;
use proptest::prelude::*;

/// EntryList に適用する操作
#[derive(Debug, Clone)]
enum Op {
    Push(u32),
    Pop,
    Insert(usize, u32),
    Remove(usize),
    Get(usize),
    SetLast(u32),
}

/// 操作を生成する Strategy
///
/// インデックスは適用時に要素数で丸める
fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        8 => any::<u32>().prop_map(Op::Push),
        2 => Just(Op::Pop),
        2 => (any::<usize>(), any::<u32>()).prop_map(|(i, v)| Op::Insert(i, v)),
        2 => any::<usize>().prop_map(Op::Remove),
        3 => any::<usize>().prop_map(Op::Get),
        2 => any::<u32>().prop_map(Op::SetLast),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    // 任意の操作列の後で Vec と同じ内容になる
    //
    // 複数のブロックにまたがった状態から始めて、ブロック境界をまたぐ挿入・削除と
    // カーソルの前後への移動を発生させる
    #[test]
    fn behaves_like_vec(
        initial in prop::collection::vec(any::<u32>(), 800..1200),
        ops in prop::collection::vec(arb_op(), 0..2000),
    ) {
        let mut list: EntryList<u32> = initial.iter().copied().collect();
        let mut model = initial;

        for op in ops {
            match op {
                Op::Push(v) => {
                    list.push(v);
                    model.push(v);
                }
                Op::Pop => {
                    prop_assert_eq!(list.pop(), model.pop());
                }
                Op::Insert(i, v) => {
                    let i = i % (model.len() + 1);
                    list.insert(i, v);
                    model.insert(i, v);
                }
                Op::Remove(i) => {
                    if !model.is_empty() {
                        let i = i % model.len();
                        prop_assert_eq!(list.remove(i), model.remove(i));
                    }
                }
                Op::Get(i) => {
                    let i = i % (model.len() + 2);
                    prop_assert_eq!(list.get(i), model.get(i));
                }
                Op::SetLast(v) => {
                    if let Some(last) = list.last_mut() {
                        *last = v;
                    }
                    if let Some(last) = model.last_mut() {
                        *last = v;
                    }
                }
            }
            prop_assert_eq!(list.len(), model.len());
        }

        prop_assert_eq!(list.first(), model.first());
        prop_assert_eq!(list.last(), model.last());
        prop_assert_eq!(list.to_vec(), model.clone());
        prop_assert!(list.iter().rev().eq(model.iter().rev()));

        // clear 後も再利用できる
        list.clear();
        prop_assert!(list.is_empty());
        list.extend(model.iter().copied().take(300));
        prop_assert_eq!(list.to_vec(), model[..model.len().min(300)].to_vec());
    }

    // 逆順にアクセスしても結果が変わらない
    #[test]
    fn random_access_is_order_independent(
        values in prop::collection::vec(any::<u16>(), 1..3000),
        indices in prop::collection::vec(any::<usize>(), 1..200),
    ) {
        let list: EntryList<u16> = values.iter().copied().collect();
        for i in indices.iter().chain(indices.iter().rev()) {
            let i = i % values.len();
            prop_assert_eq!(list.get(i), Some(&values[i]));
        }
        prop_assert_eq!(list.get(values.len()), None);
    }

    // clone した後で片方を変更しても、もう片方には影響しない
    #[test]
    fn clone_is_independent(values in prop::collection::vec(any::<u8>(), 1..1000)) {
        let mut list: EntryList<u8> = values.iter().copied().collect();
        let cloned = list.clone();
        for v in list.iter_mut() {
            *v = v.wrapping_add(1);
        }
        prop_assert_eq!(cloned.to_vec(), values.clone());
        prop_assert_ne!(list, cloned);
    }
}
