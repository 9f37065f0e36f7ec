// AetherOS PDキャッシュ スラブリスト
//
// サイズクラスごとの partial/full リスト。途中の要素をO(1)で削除できるよう、
// 各スラブは自身のリスト内位置を保持し、削除は末尾要素との入れ替えで行います。

use alloc::vec::Vec;

use super::block::BlockId;

/// スラブが所属するリストの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// 空きスロットがあるスラブ
    Partial,

    /// 全スロットが使用中のスラブ
    Full,
}

/// スラブ識別子のリスト
#[derive(Debug, Default)]
pub struct SlabList {
    ids: Vec<BlockId>,
}

impl SlabList {
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// 先頭のスラブ
    pub fn first(&self) -> Option<BlockId> {
        self.ids.first().copied()
    }

    pub fn get(&self, pos: usize) -> Option<BlockId> {
        self.ids.get(pos).copied()
    }

    /// 末尾に追加し、その位置を返す
    pub fn push(&mut self, id: BlockId) -> usize {
        self.ids.push(id);
        self.ids.len() - 1
    }

    /// `pos` の要素を削除する
    ///
    /// 末尾の要素が `pos` に移動した場合はその識別子を返す。
    /// 呼び出し側は移動したスラブの位置情報を更新すること。
    pub fn remove(&mut self, pos: usize) -> Option<BlockId> {
        self.ids.swap_remove(pos);
        self.ids.get(pos).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockId> {
        self.ids.iter()
    }
}
