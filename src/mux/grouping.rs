//! サンプルグループ（'rap ' / 'roll'）の割り当てを導出する処理
//!
//! どちらのグループも、グループの先頭サンプルの時点では記述内容が確定せず、後続サンプルを見てから確定する。
//! 確定前のサンプルは割り当てリスト内に仮のエントリーとして置いておき、確定した時点で記述のインデックスを書き込む。
use crate::{
    EntryList,
    boxes::{SampleGroupContext, SampleGroupDescription, SbgpBox, SbgpEntry, SgpdBox},
};

use super::{LeadingKind, RandomAccessKind, SampleProperties};

/// 'roll' グループの復帰点が見つかった後に、表示順の入れ替わりを確認するために待つサンプル数
pub(crate) const MAX_ROLL_WAIT: u8 = 8;

/// 'rap ' の num_leading_samples に格納可能な最大値
const MAX_LEADING_SAMPLES: u32 = 0x7F;

/// sample-to-group の割り当て（ランレングス）と、重複排除されたグループ記述のリスト
#[derive(Debug, Default, Clone)]
struct GroupAssignments {
    entries: EntryList<SbgpEntry>,
    descriptions: Vec<SampleGroupDescription>,
    pending_position: Option<usize>,
}

impl GroupAssignments {
    /// 記述のインデックス（1 始まり）を返す。同じ記述が既にあればそれを再利用する
    fn description_index(&mut self, description: SampleGroupDescription) -> u32 {
        if let Some(i) = self.descriptions.iter().position(|d| *d == description) {
            return i as u32 + 1;
        }
        self.descriptions.push(description);
        self.descriptions.len() as u32
    }

    fn push(&mut self, group_description_index: u32) {
        let last_position = self.entries.len().checked_sub(1);
        if let Some(last) = self.entries.last_mut()
            && last.group_description_index == group_description_index
            && last_position != self.pending_position
        {
            last.sample_count += 1;
            return;
        }
        self.entries.push(SbgpEntry {
            sample_count: 1,
            group_description_index,
        });
    }

    /// 記述が未確定のサンプルを追加する
    fn push_pending(&mut self) -> usize {
        self.entries.push(SbgpEntry {
            sample_count: 1,
            group_description_index: 0,
        });
        let position = self.entries.len() - 1;
        self.pending_position = Some(position);
        position
    }

    /// 未確定だったサンプルの記述を確定させる（[`None`] はどのグループにも属さないことを表す）
    fn resolve(&mut self, position: usize, description: Option<SampleGroupDescription>) {
        let index = description.map_or(0, |d| self.description_index(d));
        if self.pending_position == Some(position) {
            self.pending_position = None;
        }
        let Some(entry) = self.entries.get_mut(position) else {
            return;
        };
        entry.group_description_index = index;

        // 隣接するエントリーと同じインデックスになった場合のみ統合する
        if let Some(next) = self.entries.get(position + 1).copied()
            && next.group_description_index == index
        {
            if let Some(entry) = self.entries.get_mut(position) {
                entry.sample_count += next.sample_count;
            }
            self.entries.remove(position + 1);
        }
        if position > 0
            && let Some(prev) = self.entries.get(position - 1).copied()
            && prev.group_description_index == index
        {
            let count = self.entries.remove(position).sample_count;
            if let Some(prev) = self.entries.get_mut(position - 1) {
                prev.sample_count += count;
            }
        }
    }

    fn boxes(&self, grouping_type: [u8; 4], context: SampleGroupContext) -> Option<(SgpdBox, SbgpBox)> {
        if self.descriptions.is_empty() {
            return None;
        }
        let sgpd_box = SgpdBox {
            grouping_type,
            entries: self.descriptions.clone(),
        };
        let sbgp_box = SbgpBox {
            grouping_type,
            grouping_type_parameter: None,
            context,
            entries: self.entries.to_vec(),
        };
        Some((sgpd_box, sbgp_box))
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRandomAccess {
    position: usize,
    leading_samples: u32,
}

/// ランダムアクセスポイント（同期サンプルおよびオープン GOP の開始点）を 'rap ' グループに分類する
#[derive(Debug, Default, Clone)]
pub(crate) struct RandomAccessGrouping {
    assignments: GroupAssignments,
    pending: Option<PendingRandomAccess>,
}

impl RandomAccessGrouping {
    pub fn append(&mut self, properties: &SampleProperties) {
        let is_rap = matches!(
            properties.random_access,
            RandomAccessKind::Sync | RandomAccessKind::PartialSync
        );

        if let Some(mut pending) = self.pending {
            if is_rap {
                self.determine(true, pending.leading_samples);
            } else {
                match properties.leading {
                    LeadingKind::Unknown => self.determine(false, 0),
                    LeadingKind::NotLeading => self.determine(true, pending.leading_samples),
                    LeadingKind::Decodable | LeadingKind::Undecodable => {
                        pending.leading_samples += 1;
                        if pending.leading_samples > MAX_LEADING_SAMPLES {
                            self.determine(false, 0);
                        } else {
                            self.pending = Some(pending);
                        }
                    }
                }
            }
        }

        if is_rap {
            let position = self.assignments.push_pending();
            self.pending = Some(PendingRandomAccess {
                position,
                leading_samples: 0,
            });
        } else {
            self.assignments.push(0);
        }
    }

    fn determine(&mut self, known: bool, leading_samples: u32) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let description = SampleGroupDescription::RandomAccess {
            num_leading_samples_known: known,
            num_leading_samples: leading_samples.min(MAX_LEADING_SAMPLES) as u8,
        };
        self.assignments.resolve(pending.position, Some(description));
    }

    /// ストリーム終端として未確定のグループを確定させる
    pub fn finish(&mut self) {
        if let Some(pending) = self.pending {
            self.determine(true, pending.leading_samples);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingRoll {
    /// 復帰点となるサンプルがまだ現れていない
    Unmatched {
        position: usize,
        start: u32,
        complete: u32,
    },
    /// 復帰点は見つかったが、表示順で前に来るサンプルがまだ続く可能性がある
    Matched {
        position: usize,
        start: u32,
        distance: u32,
        recovery_cts: i64,
        remaining: u8,
    },
}

/// 復帰開始点からの距離（ロール距離）で 'roll' グループに分類する
///
/// 未確定のグループはトラックごとに高々一つ
#[derive(Debug, Default, Clone)]
pub(crate) struct RollRecoveryGrouping {
    assignments: GroupAssignments,
    pending: Option<PendingRoll>,
}

impl RollRecoveryGrouping {
    /// `sample_number` は 1 始まりのサンプル番号、`cts` はそのサンプルの相対 cts
    pub fn append(&mut self, sample_number: u32, cts: i64, properties: &SampleProperties) {
        if let Some(PendingRoll::Matched {
            position,
            start,
            mut distance,
            recovery_cts,
            remaining,
        }) = self.pending
        {
            if properties.random_access == RandomAccessKind::Sync {
                self.determine();
            } else {
                if cts < recovery_cts {
                    distance = sample_number - start;
                }
                self.pending = Some(PendingRoll::Matched {
                    position,
                    start,
                    distance,
                    recovery_cts,
                    remaining: remaining - 1,
                });
                if remaining <= 1 {
                    self.determine();
                }
            }
        }

        if let Some(PendingRoll::Unmatched {
            position,
            start,
            complete,
        }) = self.pending
        {
            if properties.random_access == RandomAccessKind::Sync {
                self.close_as_plain();
            } else if properties.recovery_identifier == Some(complete) {
                self.pending = Some(PendingRoll::Matched {
                    position,
                    start,
                    distance: sample_number - start,
                    recovery_cts: cts,
                    remaining: MAX_ROLL_WAIT,
                });
            }
        }

        if let RandomAccessKind::RecoveryStart { complete } = properties.random_access {
            self.finish();
            let position = self.assignments.push_pending();
            self.pending = Some(PendingRoll::Unmatched {
                position,
                start: sample_number,
                complete,
            });
        } else if properties.pre_roll_distance > 0 {
            let index = i16::try_from(properties.pre_roll_distance)
                .map(|d| {
                    self.assignments
                        .description_index(SampleGroupDescription::RollRecovery { roll_distance: -d })
                })
                .unwrap_or(0);
            self.assignments.push(index);
        } else {
            self.assignments.push(0);
        }
    }

    fn determine(&mut self) {
        let Some(PendingRoll::Matched {
            position, distance, ..
        }) = self.pending
        else {
            return;
        };
        self.pending = None;
        let description = i16::try_from(distance)
            .ok()
            .map(|roll_distance| SampleGroupDescription::RollRecovery { roll_distance });
        self.assignments.resolve(position, description);
    }

    fn close_as_plain(&mut self) {
        if let Some(PendingRoll::Unmatched { position, .. }) = self.pending.take() {
            self.assignments.resolve(position, None);
        }
    }

    /// ストリーム終端として未確定のグループを閉じる
    pub fn finish(&mut self) {
        match self.pending {
            Some(PendingRoll::Matched { .. }) => self.determine(),
            Some(PendingRoll::Unmatched { .. }) => self.close_as_plain(),
            None => {}
        }
    }
}

/// トラック単位のサンプルグループ導出処理
#[derive(Debug, Default, Clone)]
pub(crate) struct SampleGrouping {
    random_access: Option<RandomAccessGrouping>,
    roll_recovery: Option<RollRecoveryGrouping>,
}

impl SampleGrouping {
    pub fn new(random_access: bool, roll_recovery: bool) -> Self {
        Self {
            random_access: random_access.then(RandomAccessGrouping::default),
            roll_recovery: roll_recovery.then(RollRecoveryGrouping::default),
        }
    }

    pub fn append(&mut self, sample_number: u32, cts: i64, properties: &SampleProperties) {
        if let Some(g) = &mut self.random_access {
            g.append(properties);
        }
        if let Some(g) = &mut self.roll_recovery {
            g.append(sample_number, cts, properties);
        }
    }

    pub fn finish(&mut self) {
        if let Some(g) = &mut self.random_access {
            g.finish();
        }
        if let Some(g) = &mut self.roll_recovery {
            g.finish();
        }
    }

    /// `sgpd` / `sbgp` ボックスを構築する（[`SampleGrouping::finish()`] 呼び出し後に使う）
    pub fn boxes(&self, context: SampleGroupContext) -> (Vec<SgpdBox>, Vec<SbgpBox>) {
        let mut sgpd_boxes = Vec::new();
        let mut sbgp_boxes = Vec::new();
        let groups = [
            self.random_access
                .as_ref()
                .map(|g| (SgpdBox::GROUPING_TYPE_RAP, &g.assignments)),
            self.roll_recovery
                .as_ref()
                .map(|g| (SgpdBox::GROUPING_TYPE_ROLL, &g.assignments)),
        ];
        for (grouping_type, assignments) in groups.into_iter().flatten() {
            if let Some((sgpd_box, sbgp_box)) = assignments.boxes(grouping_type, context) {
                sgpd_boxes.push(sgpd_box);
                sbgp_boxes.push(sbgp_box);
            }
        }
        (sgpd_boxes, sbgp_boxes)
    }

    /// 現在までの割り当てを確定させて取り出し、空の状態に戻す（フラグメント境界で使う）
    pub fn take_fragment(&mut self) -> (Vec<SgpdBox>, Vec<SbgpBox>) {
        self.finish();
        let boxes = self.boxes(SampleGroupContext::Fragment);
        *self = Self::new(self.random_access.is_some(), self.roll_recovery.is_some());
        boxes
    }
}
