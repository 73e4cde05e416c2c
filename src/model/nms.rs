// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/model/nms.rs - 非极大值抑制与坐标还原
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use tracing::debug;

use crate::model::{Candidate, Detection, Labels};

/// 两个角点形式矩形的交并比，无交集或并集非正时为 0
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);
  if x1 >= x2 || y1 >= y2 {
    return 0.0;
  }

  let intersection = (x2 - x1) * (y2 - y1);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;
  if union <= 0.0 {
    return 0.0;
  }
  intersection / union
}

/// 贪心 NMS，与类别无关
///
/// 按分数稳定降序排列，同分保持解码顺序；交并比严格大于阈值的候选被抑制。
pub fn suppress(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept = Vec::new();
  while !candidates.is_empty() {
    let best = candidates.remove(0);
    candidates.retain(|c| iou(&best.bbox, &c.bbox) <= iou_threshold);
    kept.push(best);
  }

  debug!("NMS 后保留 {} 个检测", kept.len());
  kept
}

/// 按源图与模型输入的宽高比分别缩放回源图坐标，并解析标签
///
/// 两个方向独立缩放，不处理保持纵横比的填充偏移。
pub fn restore(
  candidates: &[Candidate],
  input_width: f32,
  input_height: f32,
  source_width: f32,
  source_height: f32,
  labels: &Labels,
) -> Vec<Detection> {
  let scale_x = source_width / input_width;
  let scale_y = source_height / input_height;
  candidates
    .iter()
    .map(|c| Detection {
      label: labels.resolve(c.class_index).to_string(),
      score: c.score,
      bbox: [
        c.bbox[0] * scale_x,
        c.bbox[1] * scale_y,
        c.bbox[2] * scale_x,
        c.bbox[3] * scale_y,
      ],
      mask: None,
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::labels::UNKNOWN_LABEL;

  fn candidate(score: f32, bbox: [f32; 4], anchor: usize) -> Candidate {
    Candidate {
      class_index: 0,
      score,
      bbox,
      anchor,
    }
  }

  #[test]
  fn iou_of_disjoint_and_touching_boxes_is_zero() {
    assert_eq!(iou(&[0.0, 0.0, 1.0, 1.0], &[2.0, 2.0, 3.0, 3.0]), 0.0);
    assert_eq!(iou(&[0.0, 0.0, 1.0, 1.0], &[1.0, 0.0, 2.0, 1.0]), 0.0);
    assert!((iou(&[0.0, 0.0, 2.0, 2.0], &[0.0, 0.0, 2.0, 2.0]) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn overlapping_lower_score_is_suppressed() {
    let kept = suppress(
      vec![
        candidate(0.8, [0.0, 0.0, 10.0, 10.0], 0),
        candidate(0.9, [1.0, 1.0, 11.0, 11.0], 1),
      ],
      0.5,
    );
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].score, 0.9);
  }

  #[test]
  fn disjoint_boxes_survive_in_score_order() {
    let kept = suppress(
      vec![
        candidate(0.6, [0.0, 0.0, 10.0, 10.0], 0),
        candidate(0.9, [20.0, 20.0, 30.0, 30.0], 1),
        candidate(0.7, [40.0, 40.0, 50.0, 50.0], 2),
      ],
      0.5,
    );
    let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
    assert_eq!(scores, vec![0.9, 0.7, 0.6]);
  }

  #[test]
  fn equal_scores_keep_decode_order() {
    let kept = suppress(
      vec![
        candidate(0.8, [0.0, 0.0, 10.0, 10.0], 3),
        candidate(0.8, [0.0, 0.0, 10.0, 10.0], 7),
      ],
      0.5,
    );
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].anchor, 3);
  }

  #[test]
  fn iou_equal_to_threshold_is_kept() {
    // 交集 50，并集 150，交并比为 1/3
    let a = [0.0, 0.0, 10.0, 10.0];
    let b = [5.0, 0.0, 15.0, 10.0];
    let threshold = iou(&a, &b);
    let kept = suppress(vec![candidate(0.9, a, 0), candidate(0.8, b, 1)], threshold);
    assert_eq!(kept.len(), 2);
  }

  #[test]
  fn restore_scales_each_axis_independently() {
    let labels: Labels = ["person"].into_iter().collect();
    let detections = restore(
      &[candidate(0.9, [10.0, 20.0, 30.0, 40.0], 0)],
      100.0,
      100.0,
      200.0,
      50.0,
      &labels,
    );
    assert_eq!(detections[0].label, "person");
    assert_eq!(detections[0].bbox, [20.0, 10.0, 60.0, 20.0]);
  }

  #[test]
  fn restore_ignores_padding_offset() {
    // 居中填充时内容的偏移不被扣除，坐标整体偏移
    let labels: Labels = ["person"].into_iter().collect();
    let detections = restore(
      &[candidate(0.9, [10.0, 10.0, 20.0, 20.0], 0)],
      40.0,
      40.0,
      20.0,
      20.0,
      &labels,
    );
    assert_eq!(detections[0].bbox, [5.0, 5.0, 10.0, 10.0]);
  }

  #[test]
  fn out_of_range_class_maps_to_unknown() {
    let labels: Labels = ["person"].into_iter().collect();
    let mut c = candidate(0.9, [0.0, 0.0, 1.0, 1.0], 0);
    c.class_index = 5;
    let detections = restore(&[c], 1.0, 1.0, 1.0, 1.0, &labels);
    assert_eq!(detections[0].label, UNKNOWN_LABEL);
  }
}
