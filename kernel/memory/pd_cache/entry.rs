// AetherOS PDキャッシュ スラブエントリ
//
// 1つのブロックを同じサイズのスロットに分割し、
// 占有ビットマップで使用状況を追跡します。

use log::debug;

use super::bitmap::OccupancyBitmap;
use super::block::{BlockId, BlockRef, DmaBlock};
use super::list::ListKind;

/// PDメモリエントリ（スラブ）
pub struct PdMemEntry {
    /// 所有するブロック
    mem: DmaBlock,

    /// サイズクラス番号
    pub(super) size_class: usize,

    /// スロットサイズ（バイト）
    slot_size: usize,

    /// スロット数
    nr_slots: usize,

    /// スロット占有ビットマップ
    bitmap: OccupancyBitmap,

    /// 割り当て済みスロット数
    alloc_count: usize,

    /// 所属リスト
    pub(super) list: ListKind,

    /// 所属リスト内の位置
    pub(super) list_pos: usize,
}

impl PdMemEntry {
    /// 新しいスラブを作成する
    ///
    /// # 引数
    /// * `mem` - ブロック粒度以上のブロック
    /// * `size_class` - サイズクラス番号
    /// * `slot_size` - スロットサイズ
    /// * `granule` - ブロック粒度
    /// * `bitmap_bits` - ビットマップのビット数（最小スロットサイズ時のスロット数）
    pub fn new(
        mem: DmaBlock,
        size_class: usize,
        slot_size: usize,
        granule: usize,
        bitmap_bits: usize,
    ) -> Self {
        assert!(mem.size() >= granule, "ブロックがブロック粒度より小さい");
        let nr_slots = granule / slot_size;
        assert!(nr_slots > 0 && nr_slots <= bitmap_bits);

        Self {
            mem,
            size_class,
            slot_size,
            nr_slots,
            bitmap: OccupancyBitmap::new(bitmap_bits),
            alloc_count: 0,
            list: ListKind::Partial,
            list_pos: 0,
        }
    }

    pub fn id(&self) -> BlockId {
        self.mem.id()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    pub fn is_full(&self) -> bool {
        self.alloc_count == self.nr_slots
    }

    pub fn block_ref(&self) -> BlockRef {
        self.mem.as_block_ref()
    }

    pub(super) fn bitmap(&self) -> &OccupancyBitmap {
        &self.bitmap
    }

    /// スロットを1つ割り当て、そのバイトオフセットを返す
    ///
    /// partialリストにあるスラブでのみ呼び出されるため、
    /// 空きスロットが見つからない場合は内部状態の破壊とみなす。
    pub fn alloc_slot(&mut self) -> usize {
        let bit = match self.bitmap.first_zero(self.nr_slots) {
            Some(bit) => bit,
            None => panic!(
                "PDスラブ {:?} に空きスロットがありません (count={}/{})",
                self.id(),
                self.alloc_count,
                self.nr_slots
            ),
        };

        self.bitmap.set(bit);
        self.alloc_count += 1;

        let offset = bit * self.slot_size;
        debug!(
            "PD割り当て [C] スラブ={:?} offs={} bit={} count={}/{}",
            self.id(),
            offset,
            bit,
            self.alloc_count,
            self.nr_slots
        );
        offset
    }

    /// オフセットのスロットを解放する
    ///
    /// 解放領域はCPUにマップされていればゼロクリアされる。
    pub fn free_slot(&mut self, offset: usize) {
        assert!(
            offset % self.slot_size == 0,
            "PDオフセット {} がスロット境界にありません",
            offset
        );
        let bit = offset / self.slot_size;
        assert!(bit < self.nr_slots, "PDオフセット {} がスラブ外です", offset);
        assert!(
            self.bitmap.test(bit),
            "未割り当てのPDスロットを解放しようとしました: スラブ={:?} bit={}",
            self.id(),
            bit
        );

        self.bitmap.clear(bit);
        self.alloc_count -= 1;

        // 次の利用者に古いページテーブル内容を見せない
        let zeroed = self.mem.as_block_ref().zero(offset, self.slot_size);

        debug!(
            "PD解放 [C] スラブ={:?} offs={} bit={} count={}/{} zero={}",
            self.id(),
            offset,
            bit,
            self.alloc_count,
            self.nr_slots,
            zeroed
        );
    }

    /// スラブを破棄してブロックを取り出す
    pub fn into_block(self) -> DmaBlock {
        self.mem
    }
}
