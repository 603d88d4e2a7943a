use std::sync::atomic::{AtomicU64, Ordering};

/// n 个条目两两组合的三角位图
///
/// 单元格按 (i, j)、i < j 线性编码为 j*(j-1)/2 + i。写入使用
/// `fetch_or(Relaxed)`，各比较任务写入互不重叠的单元格，因此不存在
/// 争用，原子字只是让共享在借用检查下成立。
pub struct PairBitmap {
    n: usize,
    words: Vec<AtomicU64>,
}

impl PairBitmap {
    pub fn new(n: usize) -> Self {
        let cells = n * n.saturating_sub(1) / 2;
        let words = (0..cells.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { n, words }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    fn cell(&self, a: usize, b: usize) -> usize {
        debug_assert!(a != b && a < self.n && b < self.n);
        let (i, j) = if a < b { (a, b) } else { (b, a) };
        j * (j - 1) / 2 + i
    }

    /// 标记一对条目，参数顺序无关
    pub fn mark(&self, a: usize, b: usize) {
        let cell = self.cell(a, b);
        self.words[cell / 64].fetch_or(1 << (cell % 64), Ordering::Relaxed);
    }

    pub fn test(&self, a: usize, b: usize) -> bool {
        let cell = self.cell(a, b);
        self.words[cell / 64].load(Ordering::Relaxed) >> (cell % 64) & 1 == 1
    }

    /// 已标记的对数
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.load(Ordering::Relaxed).count_ones() as usize).sum()
    }

    /// 收集全部已标记的对，i < j，按单元格顺序
    pub fn pairs(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::with_capacity(self.count());
        for (wi, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Relaxed);
            while bits != 0 {
                let cell = wi * 64 + bits.trailing_zeros() as usize;
                out.push(decode(cell));
                bits &= bits - 1;
            }
        }
        out
    }
}

/// 线性单元格编号还原为 (i, j)
fn decode(cell: usize) -> (u32, u32) {
    // j 是满足 j*(j-1)/2 <= cell 的最大值，先用浮点估计再修正
    let mut j = ((1.0 + (1.0 + 8.0 * cell as f64).sqrt()) / 2.0) as usize;
    while j * (j - 1) / 2 > cell {
        j -= 1;
    }
    while (j + 1) * j / 2 <= cell {
        j += 1;
    }
    ((cell - j * (j - 1) / 2) as u32, j as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_test() {
        let bm = PairBitmap::new(10);
        assert!(!bm.test(0, 1));
        bm.mark(3, 7);
        bm.mark(7, 2);
        assert!(bm.test(3, 7));
        assert!(bm.test(7, 3));
        assert!(bm.test(2, 7));
        assert!(!bm.test(2, 3));
        assert_eq!(bm.count(), 2);
    }

    #[test]
    fn test_pairs_roundtrip() {
        let bm = PairBitmap::new(100);
        let marked = [(0usize, 1usize), (0, 99), (98, 99), (42, 57), (10, 11)];
        for &(a, b) in &marked {
            bm.mark(a, b);
        }
        let mut pairs = bm.pairs();
        pairs.sort_unstable();
        let mut expected: Vec<(u32, u32)> =
            marked.iter().map(|&(a, b)| (a as u32, b as u32)).collect();
        expected.sort_unstable();
        assert_eq!(pairs, expected);
    }

    #[test]
    fn test_decode_exhaustive_small() {
        let n = 40usize;
        for j in 1..n {
            for i in 0..j {
                assert_eq!(decode(j * (j - 1) / 2 + i), (i as u32, j as u32));
            }
        }
    }

    #[test]
    fn test_empty() {
        let bm = PairBitmap::new(0);
        assert!(bm.pairs().is_empty());
        let bm = PairBitmap::new(1);
        assert_eq!(bm.count(), 0);
    }
}
