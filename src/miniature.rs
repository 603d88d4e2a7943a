use crate::error::{Result, SimError};

/// 条目的不透明标识，由宿主应用分配
pub type ItemId = u64;

/// 宿主应用提供的原始缩略图，RGB 交错排列
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub width: usize,
    pub height: usize,
    /// 长度必须为 width * height * 3
    pub rgb: Vec<u8>,
}

/// 固定小尺寸的平面化缩略图，比较阶段的最小单位
///
/// 三个通道平面等长，一经构造不再修改，整个生命周期由单次流水线运行
/// 独占。
#[derive(Debug, Clone)]
pub struct Miniature {
    id: ItemId,
    width: usize,
    height: usize,
    r: Box<[u8]>,
    g: Box<[u8]>,
    b: Box<[u8]>,
}

impl Miniature {
    /// 直接从三个通道平面构造
    pub fn from_planes(
        id: ItemId,
        width: usize,
        height: usize,
        r: Vec<u8>,
        g: Vec<u8>,
        b: Vec<u8>,
    ) -> Result<Self> {
        let n = width * height;
        if n == 0 || r.len() != n || g.len() != n || b.len() != n {
            return Err(SimError::MissingInput { id, what: "channel planes" });
        }
        Ok(Self { id, width, height, r: r.into(), g: g.into(), b: b.into() })
    }

    /// 把任意尺寸的缩略图按区域平均缩放到固定尺寸
    pub fn from_thumbnail(id: ItemId, thumb: &Thumbnail, width: usize, height: usize) -> Result<Self> {
        let (sw, sh) = (thumb.width, thumb.height);
        if sw == 0 || sh == 0 || thumb.rgb.len() != sw * sh * 3 {
            return Err(SimError::MissingInput { id, what: "thumbnail" });
        }

        let n = width * height;
        let mut r = vec![0u8; n];
        let mut g = vec![0u8; n];
        let mut b = vec![0u8; n];

        for ty in 0..height {
            let sy0 = ty * sh / height;
            let sy1 = ((ty + 1) * sh / height).max(sy0 + 1);
            for tx in 0..width {
                let sx0 = tx * sw / width;
                let sx1 = ((tx + 1) * sw / width).max(sx0 + 1);

                let (mut sr, mut sg, mut sb) = (0u64, 0u64, 0u64);
                for sy in sy0..sy1 {
                    for sx in sx0..sx1 {
                        let p = (sy * sw + sx) * 3;
                        sr += thumb.rgb[p] as u64;
                        sg += thumb.rgb[p + 1] as u64;
                        sb += thumb.rgb[p + 2] as u64;
                    }
                }
                let count = ((sy1 - sy0) * (sx1 - sx0)) as u64;
                let t = ty * width + tx;
                r[t] = (sr / count) as u8;
                g[t] = (sg / count) as u8;
                b[t] = (sb / count) as u8;
            }
        }

        Self::from_planes(id, width, height, r, g, b)
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn red(&self) -> &[u8] {
        &self.r
    }

    pub fn green(&self) -> &[u8] {
        &self.g
    }

    pub fn blue(&self) -> &[u8] {
        &self.b
    }

    /// 全图灰度平均值，作为粗粒度分桶的第一个标量键
    pub fn gray_average(&self) -> f64 {
        let total: u64 = self.r.iter().map(|&v| v as u64).sum::<u64>()
            + self.g.iter().map(|&v| v as u64).sum::<u64>()
            + self.b.iter().map(|&v| v as u64).sum::<u64>();
        total as f64 / (3 * self.pixel_count()) as f64
    }

    /// 固定容差下局部均匀像素区域的数量，作为第二个标量键
    ///
    /// 四连通，相邻像素曼哈顿颜色距离不超过 tolerance 即视为同一区域。
    pub fn region_count(&self, tolerance: u32) -> u32 {
        let n = self.pixel_count();
        let mut parent: Vec<u32> = (0..n as u32).collect();

        fn find(parent: &mut [u32], mut x: u32) -> u32 {
            while parent[x as usize] != x {
                parent[x as usize] = parent[parent[x as usize] as usize];
                x = parent[x as usize];
            }
            x
        }

        let dist = |a: usize, b: usize| -> u32 {
            (self.r[a] as i32 - self.r[b] as i32).unsigned_abs()
                + (self.g[a] as i32 - self.g[b] as i32).unsigned_abs()
                + (self.b[a] as i32 - self.b[b] as i32).unsigned_abs()
        };

        for y in 0..self.height {
            for x in 0..self.width {
                let p = y * self.width + x;
                if x + 1 < self.width && dist(p, p + 1) <= tolerance {
                    let (ra, rb) = (find(&mut parent, p as u32), find(&mut parent, (p + 1) as u32));
                    parent[ra as usize] = rb;
                }
                if y + 1 < self.height {
                    let q = p + self.width;
                    if dist(p, q) <= tolerance {
                        let (ra, rb) = (find(&mut parent, p as u32), find(&mut parent, q as u32));
                        parent[ra as usize] = rb;
                    }
                }
            }
        }

        (0..n as u32).filter(|&i| find(&mut parent, i) == i).count() as u32
    }
}
