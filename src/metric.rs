use std::sync::LazyLock;
use std::sync::Once;

use log::{debug, warn};

use crate::bitmap::PairBitmap;
use crate::config::BackendKind;
use crate::error::{Result, SimError};
use crate::miniature::Miniature;

/// 单像素三通道曼哈顿距离的最大值
const V: u32 = 255 * 3;
/// 调和常数 b = V / 2
const B: f64 = V as f64 / 2.0;

/// 单调饱和压缩，吸收单像素级别的错位和噪声
///
/// moderate(x) = V * b * x / (x + b)
fn moderate(x: f64) -> f64 {
    V as f64 * B * x / (x + B)
}

/// 0..=765 整数距离的调和值查找表，三个后端共用
static MOD_TABLE: LazyLock<[f64; V as usize + 1]> = LazyLock::new(|| {
    let mut table = [0.0; V as usize + 1];
    for (x, slot) in table.iter_mut().enumerate() {
        *slot = moderate(x as f64);
    }
    table
});

/// 给定像素数下可能的最大距离总和，得分的分母
fn max_total(pixels: usize) -> f64 {
    pixels as f64 * MOD_TABLE[V as usize]
}

/// 像素度量的执行后端
///
/// 三个实现必须在浮点容差内得到完全一致的数值。整数最小距离平面是
/// 逐位相等的，查表求和的顺序也相同，因此实践中结果是逐位一致的，
/// 测试按 1e-6 相对容差断言。
pub trait MetricBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// 一对缩略图的相似度得分，范围 [0, 1]
    fn score(&self, a: &Miniature, b: &Miniature) -> Result<f64>;

    /// 一对缩略图是否为同一画面，阈值为闭区间比较
    fn compare(&self, a: &Miniature, b: &Miniature, sim_limit: f64) -> Result<bool> {
        Ok(self.score(a, b)? >= sim_limit)
    }

    /// 验证一批候选对，确认相似的写入结果位图
    ///
    /// 每个任务只写自己批次覆盖的单元格，彼此不重叠。
    fn compare_batch(
        &self,
        minis: &[Miniature],
        pairs: &[(u32, u32)],
        sim_limit: f64,
        out: &PairBitmap,
    ) -> Result<()> {
        for &(i, j) in pairs {
            if self.compare(&minis[i as usize], &minis[j as usize], sim_limit)? {
                out.mark(i as usize, j as usize);
            }
        }
        Ok(())
    }
}

fn check_dims(a: &Miniature, b: &Miniature) -> Result<()> {
    if a.width() != b.width() || a.height() != b.height() {
        return Err(SimError::DimensionMismatch {
            expected: a.pixel_count(),
            found: b.pixel_count(),
        });
    }
    Ok(())
}

/// 方向距离是非对称的（A 的每个像素在 B 的 3x3 邻域里取最小），
/// 取两个方向的较大值让最终关系按值对称
fn pair_total(a: &Miniature, b: &Miniature, directional: impl Fn(&Miniature, &Miniature) -> f64) -> f64 {
    directional(a, b).max(directional(b, a))
}

fn score_from_total(total: f64, pixels: usize) -> f64 {
    let max = max_total(pixels);
    (max - total) / max
}

// ---------------------------------------------------------------------------
// 标量参考实现
// ---------------------------------------------------------------------------

/// 逐像素标量实现，其余后端的数值基准
pub struct ScalarBackend;

fn directional_total_scalar(a: &Miniature, b: &Miniature) -> f64 {
    let w = a.width() as isize;
    let h = a.height() as isize;
    let (ar, ag, ab) = (a.red(), a.green(), a.blue());
    let (br, bg, bb) = (b.red(), b.green(), b.blue());

    let mut total = 0.0;
    for y in 0..h {
        for x in 0..w {
            let p = (y * w + x) as usize;
            let mut best = u32::MAX;
            for dy in -1..=1isize {
                let ny = y + dy;
                if ny < 0 || ny >= h {
                    continue;
                }
                for dx in -1..=1isize {
                    let nx = x + dx;
                    if nx < 0 || nx >= w {
                        continue;
                    }
                    let q = (ny * w + nx) as usize;
                    let d = (ar[p] as i32 - br[q] as i32).unsigned_abs()
                        + (ag[p] as i32 - bg[q] as i32).unsigned_abs()
                        + (ab[p] as i32 - bb[q] as i32).unsigned_abs();
                    best = best.min(d);
                }
            }
            total += MOD_TABLE[best as usize];
        }
    }
    total
}

impl MetricBackend for ScalarBackend {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn score(&self, a: &Miniature, b: &Miniature) -> Result<f64> {
        check_dims(a, b)?;
        let total = pair_total(a, b, directional_total_scalar);
        Ok(score_from_total(total, a.pixel_count()))
    }
}

// ---------------------------------------------------------------------------
// 批处理实现
// ---------------------------------------------------------------------------

/// 缓冲批处理实现：按 9 个偏移整行计算距离并更新最小值平面，
/// 内层循环可被自动向量化，批内复用缓冲区
pub struct BatchBackend;

/// 计算 A 每个像素在 B 的 3x3 邻域内的最小曼哈顿距离平面
///
/// 越界邻居不参与取最小，buf 以 u16::MAX 初始化。
fn min_plane_buffered(a: &Miniature, b: &Miniature, buf: &mut Vec<u16>) {
    let w = a.width();
    let h = a.height();
    buf.clear();
    buf.resize(w * h, u16::MAX);

    let (ar, ag, ab) = (a.red(), a.green(), a.blue());
    let (br, bg, bb) = (b.red(), b.green(), b.blue());

    for dy in -1..=1isize {
        let y0 = (-dy).max(0) as usize;
        let y1 = h - dy.max(0) as usize;
        for dx in -1..=1isize {
            let x0 = (-dx).max(0) as usize;
            let x1 = w - dx.max(0) as usize;
            for y in y0..y1 {
                let p0 = y * w;
                let q0 = (y as isize + dy) as usize * w;
                for x in x0..x1 {
                    let p = p0 + x;
                    let q = (q0 as isize + x as isize + dx) as usize;
                    let d = (ar[p] as i32 - br[q] as i32).unsigned_abs() as u16
                        + (ag[p] as i32 - bg[q] as i32).unsigned_abs() as u16
                        + (ab[p] as i32 - bb[q] as i32).unsigned_abs() as u16;
                    if d < buf[p] {
                        buf[p] = d;
                    }
                }
            }
        }
    }
}

fn total_from_plane(buf: &[u16]) -> f64 {
    let mut total = 0.0;
    for &d in buf {
        total += MOD_TABLE[d as usize];
    }
    total
}

impl BatchBackend {
    fn total_with_buf(a: &Miniature, b: &Miniature, buf: &mut Vec<u16>) -> f64 {
        min_plane_buffered(a, b, buf);
        let t1 = total_from_plane(buf);
        min_plane_buffered(b, a, buf);
        t1.max(total_from_plane(buf))
    }
}

impl MetricBackend for BatchBackend {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn score(&self, a: &Miniature, b: &Miniature) -> Result<f64> {
        check_dims(a, b)?;
        let mut buf = Vec::new();
        let total = Self::total_with_buf(a, b, &mut buf);
        Ok(score_from_total(total, a.pixel_count()))
    }

    fn compare_batch(
        &self,
        minis: &[Miniature],
        pairs: &[(u32, u32)],
        sim_limit: f64,
        out: &PairBitmap,
    ) -> Result<()> {
        let mut buf = Vec::new();
        for &(i, j) in pairs {
            let (a, b) = (&minis[i as usize], &minis[j as usize]);
            check_dims(a, b)?;
            let total = Self::total_with_buf(a, b, &mut buf);
            if score_from_total(total, a.pixel_count()) >= sim_limit {
                out.mark(i as usize, j as usize);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AVX2 实现
// ---------------------------------------------------------------------------

/// AVX2 原生实现，仅 x86_64，构造时探测能力
pub struct Avx2Backend {
    _probed: (),
}

impl Avx2Backend {
    pub fn new() -> Result<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx2") {
                return Ok(Self { _probed: () });
            }
        }
        Err(SimError::BackendUnavailable("avx2"))
    }
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    use crate::miniature::Miniature;

    /// 同 min_plane_buffered，内层 16 像素一组用 AVX2 计算
    ///
    /// 安全性：调用方保证 CPU 支持 AVX2，buf 长度等于像素数。
    #[target_feature(enable = "avx2")]
    pub unsafe fn min_plane(a: &Miniature, b: &Miniature, buf: &mut [u16]) {
        let w = a.width();
        let h = a.height();
        buf.fill(u16::MAX);

        let (ar, ag, ab) = (a.red(), a.green(), a.blue());
        let (br, bg, bb) = (b.red(), b.green(), b.blue());

        for dy in -1..=1isize {
            let y0 = (-dy).max(0) as usize;
            let y1 = h - dy.max(0) as usize;
            for dx in -1..=1isize {
                let x0 = (-dx).max(0) as usize;
                let x1 = w - dx.max(0) as usize;
                let span = x1 - x0;
                for y in y0..y1 {
                    let p0 = y * w + x0;
                    // x0 >= -dx，因此 q0 不会为负
                    let q0 = ((y as isize + dy) * w as isize + x0 as isize + dx) as usize;

                    let mut x = 0;
                    while x + 16 <= span {
                        unsafe {
                            let d = abs_diff3_u16(
                                ar.as_ptr().add(p0 + x),
                                ag.as_ptr().add(p0 + x),
                                ab.as_ptr().add(p0 + x),
                                br.as_ptr().add(q0 + x),
                                bg.as_ptr().add(q0 + x),
                                bb.as_ptr().add(q0 + x),
                            );
                            let dst = buf.as_mut_ptr().add(p0 + x) as *mut __m256i;
                            let cur = _mm256_loadu_si256(dst);
                            _mm256_storeu_si256(dst, _mm256_min_epu16(cur, d));
                        }
                        x += 16;
                    }
                    // 行尾不足 16 像素的部分按标量处理
                    for x in x..span {
                        let p = p0 + x;
                        let q = q0 + x;
                        let d = (ar[p] as i32 - br[q] as i32).unsigned_abs() as u16
                            + (ag[p] as i32 - bg[q] as i32).unsigned_abs() as u16
                            + (ab[p] as i32 - bb[q] as i32).unsigned_abs() as u16;
                        if d < buf[p] {
                            buf[p] = d;
                        }
                    }
                }
            }
        }
    }

    /// 16 个像素的三通道曼哈顿距离，结果为 16 个 u16
    #[target_feature(enable = "avx2")]
    unsafe fn abs_diff3_u16(
        ar: *const u8,
        ag: *const u8,
        ab: *const u8,
        br: *const u8,
        bg: *const u8,
        bb: *const u8,
    ) -> __m256i {
        unsafe {
            let widen = |p: *const u8| _mm256_cvtepu8_epi16(_mm_loadu_si128(p as *const __m128i));
            let diff = |a: __m256i, b: __m256i| _mm256_abs_epi16(_mm256_sub_epi16(a, b));
            let dr = diff(widen(ar), widen(br));
            let dg = diff(widen(ag), widen(bg));
            let db = diff(widen(ab), widen(bb));
            _mm256_add_epi16(dr, _mm256_add_epi16(dg, db))
        }
    }
}

impl MetricBackend for Avx2Backend {
    fn name(&self) -> &'static str {
        "avx2"
    }

    #[cfg(target_arch = "x86_64")]
    fn score(&self, a: &Miniature, b: &Miniature) -> Result<f64> {
        check_dims(a, b)?;
        let mut buf = vec![u16::MAX; a.pixel_count()];
        // 构造时已探测过 AVX2
        let t1 = unsafe {
            avx2::min_plane(a, b, &mut buf);
            total_from_plane(&buf)
        };
        let t2 = unsafe {
            avx2::min_plane(b, a, &mut buf);
            total_from_plane(&buf)
        };
        Ok(score_from_total(t1.max(t2), a.pixel_count()))
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn score(&self, _a: &Miniature, _b: &Miniature) -> Result<f64> {
        Err(SimError::BackendUnavailable("avx2"))
    }

    #[cfg(target_arch = "x86_64")]
    fn compare_batch(
        &self,
        minis: &[Miniature],
        pairs: &[(u32, u32)],
        sim_limit: f64,
        out: &PairBitmap,
    ) -> Result<()> {
        let mut buf = Vec::new();
        for &(i, j) in pairs {
            let (a, b) = (&minis[i as usize], &minis[j as usize]);
            check_dims(a, b)?;
            buf.clear();
            buf.resize(a.pixel_count(), u16::MAX);
            let t1 = unsafe {
                avx2::min_plane(a, b, &mut buf);
                total_from_plane(&buf)
            };
            let t2 = unsafe {
                avx2::min_plane(b, a, &mut buf);
                total_from_plane(&buf)
            };
            if score_from_total(t1.max(t2), a.pixel_count()) >= sim_limit {
                out.mark(i as usize, j as usize);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 能力探测与选择
// ---------------------------------------------------------------------------

static FALLBACK_NOTICE: Once = Once::new();

/// 进程启动时按能力选择后端，整次运行内不再切换
///
/// `Auto` 模式优先 AVX2，缺失时静默回退到批处理实现并记录一次日志；
/// 显式指定不可用的后端则返回 `BackendUnavailable`。
pub fn select_backend(kind: BackendKind) -> Result<Box<dyn MetricBackend>> {
    let backend: Box<dyn MetricBackend> = match kind {
        BackendKind::Scalar => Box::new(ScalarBackend),
        BackendKind::Batch => Box::new(BatchBackend),
        BackendKind::Avx2 => Box::new(Avx2Backend::new()?),
        BackendKind::Auto => match Avx2Backend::new() {
            Ok(b) => Box::new(b),
            Err(_) => {
                FALLBACK_NOTICE.call_once(|| {
                    warn!("avx2 backend unavailable, falling back to batch");
                });
                Box::new(BatchBackend)
            }
        },
    };
    debug!("selected metric backend: {}", backend.name());
    Ok(backend)
}
