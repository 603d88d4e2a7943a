use std::collections::HashMap;

use ndarray::{Array2, ArrayView1};

use crate::error::{Result, SimError};
use crate::miniature::{ItemId, Miniature};

/// 时长映射到通道量程时的上限（秒），超过按上限计
const DURATION_CAP_SECS: f64 = 6.0 * 3600.0;

/// 所有条目的特征矩阵，一行一个条目
///
/// 每行布局为 R 平面、G 平面、B 平面平铺，尾部重复 K 个时长权重，
/// 使时长以与像素数成比例的权重参与距离计算。矩阵随每次运行重新
/// 计算，从不脱离 Miniature 单独持久化。
pub struct FeatureMatrix {
    ids: Vec<ItemId>,
    data: Array2<f32>,
}

impl FeatureMatrix {
    /// 从平面化缩略图和时长表构建特征矩阵
    ///
    /// 纯函数。时长缺失返回 `MissingInput`，平面尺寸不一致返回
    /// `DimensionMismatch`。
    pub fn build(
        miniatures: &[Miniature],
        durations: &HashMap<ItemId, f64>,
        tail_len: usize,
    ) -> Result<Self> {
        let Some(first) = miniatures.first() else {
            return Ok(Self { ids: vec![], data: Array2::zeros((0, tail_len)) });
        };

        let pixels = first.pixel_count();
        let dim = 3 * pixels + tail_len;
        let mut data = Array2::zeros((miniatures.len(), dim));
        let mut ids = Vec::with_capacity(miniatures.len());

        for (row, m) in miniatures.iter().enumerate() {
            if m.pixel_count() != pixels {
                return Err(SimError::DimensionMismatch {
                    expected: dim,
                    found: 3 * m.pixel_count() + tail_len,
                });
            }
            let duration = *durations
                .get(&m.id())
                .ok_or(SimError::MissingInput { id: m.id(), what: "duration" })?;
            let weight = duration_weight(duration);

            let mut out = data.row_mut(row);
            for (i, &v) in m.red().iter().enumerate() {
                out[i] = v as f32;
            }
            for (i, &v) in m.green().iter().enumerate() {
                out[pixels + i] = v as f32;
            }
            for (i, &v) in m.blue().iter().enumerate() {
                out[2 * pixels + i] = v as f32;
            }
            for i in 0..tail_len {
                out[3 * pixels + i] = weight;
            }
            ids.push(m.id());
        }

        Ok(Self { ids, data })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.data.ncols()
    }

    pub fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    pub fn row(&self, i: usize) -> ArrayView1<'_, f32> {
        self.data.row(i)
    }

    /// 第 i 行的连续切片视图
    pub fn row_slice(&self, i: usize) -> &[f32] {
        self.data.row(i).to_slice().expect("feature matrix rows are contiguous")
    }
}

/// 把时长压缩进通道量程 [0, 255]
fn duration_weight(duration: f64) -> f32 {
    (duration.clamp(0.0, DURATION_CAP_SECS) / DURATION_CAP_SECS * 255.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mini(id: ItemId, fill: u8) -> Miniature {
        Miniature::from_planes(id, 4, 4, vec![fill; 16], vec![fill; 16], vec![fill; 16]).unwrap()
    }

    #[test]
    fn test_layout_and_tail() {
        let minis = vec![mini(1, 10), mini(2, 20)];
        let durations = HashMap::from([(1, 60.0), (2, 120.0)]);
        let fm = FeatureMatrix::build(&minis, &durations, 4).unwrap();

        assert_eq!(fm.len(), 2);
        assert_eq!(fm.dim(), 3 * 16 + 4);
        let row = fm.row_slice(0);
        assert!(row[..48].iter().all(|&v| v == 10.0));
        let w = duration_weight(60.0);
        assert!(row[48..].iter().all(|&v| v == w));
    }

    #[test]
    fn test_missing_duration() {
        let minis = vec![mini(1, 0)];
        let r = FeatureMatrix::build(&minis, &HashMap::new(), 4);
        assert!(matches!(r, Err(SimError::MissingInput { id: 1, what: "duration" })));
    }

    #[test]
    fn test_dimension_mismatch() {
        let odd = Miniature::from_planes(3, 2, 2, vec![0; 4], vec![0; 4], vec![0; 4]).unwrap();
        let minis = vec![mini(1, 0), odd];
        let durations = HashMap::from([(1, 1.0), (3, 1.0)]);
        let r = FeatureMatrix::build(&minis, &durations, 0);
        assert!(matches!(r, Err(SimError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_duration_weight_caps() {
        assert_eq!(duration_weight(0.0), 0.0);
        assert_eq!(duration_weight(1e9), 255.0);
    }
}
