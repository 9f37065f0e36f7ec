// AetherOS PDキャッシュ 占有ビットマップ
//
// スラブ内の各スロットの使用状況を1ビットで管理します。

use alloc::vec;
use alloc::vec::Vec;

use bit_field::BitArray;

const WORD_BITS: usize = u64::BITS as usize;

/// スロット占有ビットマップ
///
/// ビット `i` がセットされていればスロット `i` は割り当て済み。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancyBitmap {
    words: Vec<u64>,
    nbits: usize,
}

impl OccupancyBitmap {
    /// 全ビットがクリアされたビットマップを作成する
    pub fn new(nbits: usize) -> Self {
        let nwords = (nbits + WORD_BITS - 1) / WORD_BITS;
        Self {
            words: vec![0; nwords],
            nbits,
        }
    }

    pub fn test(&self, bit: usize) -> bool {
        assert!(bit < self.nbits);
        self.words.as_slice().get_bit(bit)
    }

    pub fn set(&mut self, bit: usize) {
        assert!(bit < self.nbits);
        self.words.as_mut_slice().set_bit(bit, true);
    }

    pub fn clear(&mut self, bit: usize) {
        assert!(bit < self.nbits);
        self.words.as_mut_slice().set_bit(bit, false);
    }

    /// `[0, limit)` の範囲で最小のクリアビットを探す
    pub fn first_zero(&self, limit: usize) -> Option<usize> {
        let limit = limit.min(self.nbits);

        for (i, word) in self.words.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = i * WORD_BITS + (!*word).trailing_zeros() as usize;
            return if bit < limit { Some(bit) } else { None };
        }

        None
    }

    /// セットされているビット数
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}
