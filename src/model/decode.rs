// 该文件是 Zonglv （棕榈） 项目的一部分。
// src/model/decode.rs - 检测结果解码与非极大值抑制
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

use std::collections::BTreeMap;

use tracing::debug;

use crate::{
  error::InferenceError,
  model::{DetectItem, DetectParams, engine::RawOutput, letterbox::Letterbox},
};

/// 每行开头的框参数个数 (cx, cy, w, h)
const BOX_PARAMS: usize = 4;

/// 输出张量中候选框的排列方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLayout {
  pub candidates: usize,
  pub row_width: usize,
  /// true 表示 [1, row_width, candidates]（逐通道存放）
  pub channels_first: bool,
}

/// 逐候选排列 [N, C] 要求候选数至少为行宽的该倍数
const CANDIDATE_MAJOR_RATIO: usize = 8;

/// YOLO 检测头的下采样步长
const HEAD_STRIDES: [usize; 3] = [8, 16, 32];

/// 输入尺寸对应的候选数：无锚框头与每格 3 个锚框的头
fn grid_candidates(input_size: u32) -> [usize; 2] {
  let size = input_size as usize;
  let n = HEAD_STRIDES
    .iter()
    .map(|stride| size.div_ceil(*stride).pow(2))
    .sum::<usize>();
  [n, 3 * n]
}

impl OutputLayout {
  /// 形状中含动态维度（<= 0）时返回 Ok(None)
  pub fn from_declared(
    shape: &[i64],
    input_size: Option<u32>,
  ) -> Result<Option<Self>, InferenceError> {
    if shape.iter().any(|&d| d <= 0) {
      return Ok(None);
    }
    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    Self::infer(&dims, input_size).map(Some)
  }

  /// 接受 [1, a, b] 或 [a, b]，默认按 [1, 4 + nc, N] 逐通道排列
  pub fn from_shape(shape: &[usize]) -> Result<Self, InferenceError> {
    Self::infer(shape, None)
  }

  /// 已知模型输入尺寸时，先按网格候选数判断哪一维是候选
  pub fn from_shape_for_input(shape: &[usize], input_size: u32) -> Result<Self, InferenceError> {
    Self::infer(shape, Some(input_size))
  }

  fn infer(shape: &[usize], input_size: Option<u32>) -> Result<Self, InferenceError> {
    let (a, b) = match shape {
      [1, a, b] | [a, b] => (*a, *b),
      other => {
        return Err(InferenceError::MalformedOutput(format!(
          "不支持的输出形状 {:?}",
          other
        )));
      }
    };

    let candidate_major = match input_size.map(grid_candidates) {
      Some(grid) if grid.contains(&b) => false,
      Some(grid) if grid.contains(&a) => true,
      _ => a >= b.saturating_mul(CANDIDATE_MAJOR_RATIO),
    };

    let layout = if candidate_major {
      OutputLayout {
        candidates: a,
        row_width: b,
        channels_first: false,
      }
    } else {
      OutputLayout {
        candidates: b,
        row_width: a,
        channels_first: true,
      }
    };

    if layout.row_width <= BOX_PARAMS {
      return Err(InferenceError::MalformedOutput(format!(
        "输出行宽 {} 不足以容纳框参数与类别分数",
        layout.row_width
      )));
    }
    Ok(layout)
  }

  pub fn num_classes(&self) -> usize {
    self.row_width - BOX_PARAMS
  }

  fn value(&self, data: &[f32], candidate: usize, column: usize) -> f32 {
    if self.channels_first {
      data[column * self.candidates + candidate]
    } else {
      data[candidate * self.row_width + column]
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
  index: usize,
  class_id: u32,
  score: f32,
  bbox: [f32; 4],
}

/// 两个轴对齐矩形的交并比
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 将原始输出解码为图块坐标下的检测结果，按置信度降序
pub fn decode(
  raw: &RawOutput,
  layout: &OutputLayout,
  letterbox: &Letterbox,
  params: &DetectParams,
) -> Result<Vec<DetectItem>, InferenceError> {
  let expected = layout.candidates * layout.row_width;
  if raw.data.len() != expected {
    return Err(InferenceError::MalformedOutput(format!(
      "输出长度 {} 与布局 {}x{} 不符",
      raw.data.len(),
      layout.candidates,
      layout.row_width
    )));
  }

  let candidates = filter_candidates(raw, layout, letterbox, params.confidence);
  debug!(
    "候选框: {} 个中 {} 个通过置信度阈值 {}",
    layout.candidates,
    candidates.len(),
    params.confidence
  );

  let kept = nms_per_class(candidates, params.iou);
  let items = cap_detections(kept, params.max_det);
  debug!("检测到 {} 个物体", items.len());

  Ok(items)
}

fn filter_candidates(
  raw: &RawOutput,
  layout: &OutputLayout,
  letterbox: &Letterbox,
  confidence: f32,
) -> Vec<Candidate> {
  let data = &raw.data;
  let tile_w = letterbox.src_width as f32;
  let tile_h = letterbox.src_height as f32;
  let mut candidates = Vec::new();

  for index in 0..layout.candidates {
    let mut score = f32::MIN;
    let mut class_id = 0usize;
    for c in 0..layout.num_classes() {
      let s = layout.value(data, index, BOX_PARAMS + c);
      if s > score {
        score = s;
        class_id = c;
      }
    }

    if score < confidence {
      continue;
    }

    let cx = layout.value(data, index, 0);
    let cy = layout.value(data, index, 1);
    let w = layout.value(data, index, 2);
    let h = layout.value(data, index, 3);

    let (x_min, y_min) = letterbox.to_tile(cx - w / 2.0, cy - h / 2.0);
    let (x_max, y_max) = letterbox.to_tile(cx + w / 2.0, cy + h / 2.0);
    let bbox = [
      x_min.clamp(0.0, tile_w),
      y_min.clamp(0.0, tile_h),
      x_max.clamp(0.0, tile_w),
      y_max.clamp(0.0, tile_h),
    ];

    // 零面积框（含完全落在填充区内的框）直接丢弃
    if !(bbox[2] > bbox[0] && bbox[3] > bbox[1]) {
      continue;
    }

    candidates.push(Candidate {
      index,
      class_id: class_id as u32,
      score,
      bbox,
    });
  }

  candidates
}

fn nms_per_class(candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  let mut by_class: BTreeMap<u32, Vec<Candidate>> = BTreeMap::new();
  for candidate in candidates {
    by_class.entry(candidate.class_id).or_default().push(candidate);
  }

  let mut kept = Vec::new();
  for (_, mut group) in by_class {
    // 稳定排序，同分时保持输入顺序
    group.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut class_kept: Vec<Candidate> = Vec::with_capacity(group.len());
    for candidate in group {
      if class_kept
        .iter()
        .all(|k| iou(&k.bbox, &candidate.bbox) <= iou_threshold)
      {
        class_kept.push(candidate);
      }
    }
    kept.extend(class_kept);
  }
  kept
}

fn cap_detections(mut kept: Vec<Candidate>, max_det: usize) -> Vec<DetectItem> {
  kept.sort_by(|a, b| {
    b.score
      .total_cmp(&a.score)
      .then_with(|| a.index.cmp(&b.index))
  });
  kept.truncate(max_det);
  kept
    .into_iter()
    .map(|c| DetectItem {
      class_id: c.class_id,
      score: c.score,
      bbox: c.bbox,
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Device;

  const NUM_CLASSES: usize = 2;

  fn params(confidence: f32, iou: f32, max_det: usize) -> DetectParams {
    DetectParams {
      confidence,
      iou,
      max_det,
      input_size: 640,
      device: Device::Cpu,
    }
  }

  /// 以 [cx, cy, w, h, s0, s1] 的行构造逐通道排列的输出
  fn raw_channels_first(rows: &[[f32; 4 + NUM_CLASSES]]) -> (RawOutput, OutputLayout) {
    let width = 4 + NUM_CLASSES;
    // 保证候选数不少于行宽，使布局判断为逐通道
    let n = rows.len().max(width);
    let mut data = vec![0f32; width * n];
    for (i, row) in rows.iter().enumerate() {
      for (c, v) in row.iter().enumerate() {
        data[c * n + i] = *v;
      }
    }
    let raw = RawOutput {
      shape: vec![1, width, n],
      data,
    };
    let layout = OutputLayout::from_shape(&raw.shape).unwrap();
    (raw, layout)
  }

  fn identity() -> Letterbox {
    Letterbox::compute(640, 640, 640).unwrap()
  }

  fn corners(x0: f32, y0: f32, x1: f32, y1: f32) -> [f32; 4] {
    [(x0 + x1) / 2.0, (y0 + y1) / 2.0, x1 - x0, y1 - y0]
  }

  fn row(b: [f32; 4], s0: f32, s1: f32) -> [f32; 6] {
    [b[0], b[1], b[2], b[3], s0, s1]
  }

  #[test]
  fn iou_is_symmetric_and_self_identical() {
    let a = [10.0, 10.0, 50.0, 40.0];
    let b = [30.0, 20.0, 90.0, 70.0];
    assert_eq!(iou(&a, &a), 1.0);
    assert_eq!(iou(&a, &b), iou(&b, &a));
    assert_eq!(iou(&a, &[100.0, 100.0, 120.0, 120.0]), 0.0);
    assert_eq!(iou(&[5.0, 5.0, 5.0, 5.0], &[5.0, 5.0, 5.0, 5.0]), 0.0);
  }

  #[test]
  fn layout_detects_both_orientations() {
    let first = OutputLayout::from_shape(&[1, 6, 8400]).unwrap();
    assert!(first.channels_first);
    assert_eq!((first.candidates, first.num_classes()), (8400, 2));

    let major = OutputLayout::from_shape(&[1, 25200, 85]).unwrap();
    assert!(!major.channels_first);
    assert_eq!(major.num_classes(), 81);

    assert!(OutputLayout::from_shape(&[1, 3, 4, 5]).is_err());
    assert!(OutputLayout::from_shape(&[1, 4, 100]).is_err());
    assert_eq!(OutputLayout::from_declared(&[1, 6, -1], None).unwrap(), None);
  }

  #[test]
  fn few_candidates_stay_channels_first() {
    // 32 像素导出: 16 + 4 + 1 = 21 个候选, 80 个类别
    let small = OutputLayout::from_shape(&[1, 84, 21]).unwrap();
    assert!(small.channels_first);
    assert_eq!((small.candidates, small.num_classes()), (21, 80));

    let single = OutputLayout::from_shape(&[1, 6, 4]).unwrap();
    assert!(single.channels_first);
    assert_eq!((single.candidates, single.num_classes()), (4, 2));

    let declared = OutputLayout::from_declared(&[1, 84, 21], Some(32)).unwrap().unwrap();
    assert!(declared.channels_first);
  }

  #[test]
  fn grid_count_identifies_candidate_axis() {
    let major = OutputLayout::from_shape_for_input(&[1, 21, 84], 32).unwrap();
    assert!(!major.channels_first);
    assert_eq!((major.candidates, major.num_classes()), (21, 80));

    let anchors = OutputLayout::from_shape_for_input(&[1, 25200, 85], 640).unwrap();
    assert!(!anchors.channels_first);

    let free = OutputLayout::from_shape_for_input(&[1, 6, 8400], 640).unwrap();
    assert!(free.channels_first);
  }

  #[test]
  fn short_channels_first_head_decodes() {
    // [1, 6, 4]：候选数少于行宽
    let b = corners(100.0, 100.0, 300.0, 300.0);
    let n = 4;
    let mut data = vec![0f32; 6 * n];
    for (c, v) in row(b, 0.9, 0.05).iter().enumerate() {
      data[c * n] = *v;
    }
    let raw = RawOutput {
      shape: vec![1, 6, n],
      data,
    };
    let layout = OutputLayout::from_shape(&raw.shape).unwrap();
    let items = decode(&raw, &layout, &identity(), &params(0.2, 0.2, 10000)).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].class_id, 0);
    assert_eq!(items[0].bbox, [100.0, 100.0, 300.0, 300.0]);
  }

  #[test]
  fn overlapping_boxes_of_same_class_are_suppressed() {
    // 两框 IoU = 0.7
    let a = corners(0.0, 0.0, 100.0, 100.0);
    let b = corners(0.0, 0.0, 100.0, 70.0);
    assert!((iou(&[0.0, 0.0, 100.0, 100.0], &[0.0, 0.0, 100.0, 70.0]) - 0.7).abs() < 1e-6);

    let (raw, layout) = raw_channels_first(&[row(b, 0.85, 0.0), row(a, 0.9, 0.0)]);
    let items = decode(&raw, &layout, &identity(), &params(0.2, 0.5, 100)).unwrap();

    assert_eq!(items.len(), 1);
    assert!((items[0].score - 0.9).abs() < 1e-6);
    assert_eq!(items[0].bbox, [0.0, 0.0, 100.0, 100.0]);
  }

  #[test]
  fn different_classes_do_not_suppress_each_other() {
    let a = corners(0.0, 0.0, 100.0, 100.0);
    let (raw, layout) = raw_channels_first(&[row(a, 0.9, 0.1), row(a, 0.1, 0.8)]);
    let items = decode(&raw, &layout, &identity(), &params(0.2, 0.5, 100)).unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].class_id, 0);
    assert_eq!(items[1].class_id, 1);
  }

  #[test]
  fn nms_output_has_no_pair_above_threshold() {
    let mut rows = Vec::new();
    for i in 0..40 {
      let offset = (i % 10) as f32 * 7.0;
      let b = corners(offset, offset, offset + 60.0, offset + 50.0);
      rows.push(row(b, 0.3 + i as f32 * 0.01, 0.0));
    }
    let (raw, layout) = raw_channels_first(&rows);
    let threshold = 0.45;
    let items = decode(&raw, &layout, &identity(), &params(0.0, threshold, 1000)).unwrap();

    for (i, a) in items.iter().enumerate() {
      for b in items.iter().skip(i + 1) {
        if a.class_id == b.class_id {
          assert!(iou(&a.bbox, &b.bbox) <= threshold);
        }
      }
    }
  }

  #[test]
  fn global_cap_keeps_highest_scores() {
    let rows: Vec<_> = (0..20)
      .map(|i| {
        let x = i as f32 * 30.0;
        row(corners(x, 0.0, x + 20.0, 20.0), 0.5 + i as f32 * 0.01, 0.0)
      })
      .collect();
    let (raw, layout) = raw_channels_first(&rows);
    let items = decode(&raw, &layout, &identity(), &params(0.2, 0.5, 5)).unwrap();

    assert_eq!(items.len(), 5);
    assert!((items[0].score - 0.69).abs() < 1e-6);
    assert!(items.windows(2).all(|w| w[0].score >= w[1].score));
  }

  #[test]
  fn equal_scores_keep_input_order() {
    let rows: Vec<_> = (0..4)
      .map(|i| {
        let x = i as f32 * 50.0;
        row(corners(x, 0.0, x + 20.0, 20.0), 0.7, 0.0)
      })
      .collect();
    let (raw, layout) = raw_channels_first(&rows);
    let items = decode(&raw, &layout, &identity(), &params(0.2, 0.5, 2)).unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].bbox[0], 0.0);
    assert_eq!(items[1].bbox[0], 50.0);
  }

  #[test]
  fn raising_confidence_yields_subset() {
    let mut rows = Vec::new();
    for i in 0..30 {
      let x = (i * 13 % 200) as f32;
      let y = (i * 29 % 150) as f32;
      let s = ((i * 37) % 100) as f32 / 100.0;
      rows.push(row(corners(x, y, x + 40.0, y + 35.0), s, 1.0 - s));
    }
    let (raw, layout) = raw_channels_first(&rows);

    let thresholds = [0.0f32, 0.1, 0.3, 0.5, 0.7, 0.9];
    for pair in thresholds.windows(2) {
      let low = decode(&raw, &layout, &identity(), &params(pair[0], 0.3, 1000)).unwrap();
      let high = decode(&raw, &layout, &identity(), &params(pair[1], 0.3, 1000)).unwrap();
      for item in &high {
        assert!(low.contains(item), "{:?} missing at {}", item, pair[0]);
      }
    }
  }

  #[test]
  fn degenerate_and_padding_boxes_are_dropped() {
    // 4000x3000 -> 1280 时上方 160 像素为填充
    let lb = Letterbox::compute(4000, 3000, 1280).unwrap();
    let zero = [100.0, 300.0, 0.0, 20.0];
    let in_padding = corners(10.0, 10.0, 60.0, 100.0);
    let (raw, layout) = raw_channels_first(&[row(zero, 0.9, 0.0), row(in_padding, 0.9, 0.0)]);
    let items = decode(&raw, &layout, &lb, &params(0.2, 0.5, 100)).unwrap();
    assert!(items.is_empty());
  }

  #[test]
  fn nothing_above_threshold_is_empty_not_error() {
    let (raw, layout) = raw_channels_first(&[row(corners(0.0, 0.0, 10.0, 10.0), 0.1, 0.05)]);
    let items = decode(&raw, &layout, &identity(), &params(0.5, 0.5, 100)).unwrap();
    assert!(items.is_empty());
  }

  #[test]
  fn candidate_major_rows_decode() {
    let b = corners(20.0, 30.0, 120.0, 90.0);
    let mut data = vec![0f32; 64 * 6];
    data[..6].copy_from_slice(&row(b, 0.1, 0.95));
    let raw = RawOutput {
      shape: vec![1, 64, 6],
      data,
    };
    let layout = OutputLayout::from_shape(&raw.shape).unwrap();
    assert!(!layout.channels_first);

    let items = decode(&raw, &layout, &identity(), &params(0.5, 0.5, 100)).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].class_id, 1);
    assert_eq!(items[0].bbox, [20.0, 30.0, 120.0, 90.0]);
  }

  #[test]
  fn output_length_mismatch_is_reported() {
    let raw = RawOutput {
      shape: vec![1, 6, 10],
      data: vec![0.0; 59],
    };
    let layout = OutputLayout::from_shape(&[1, 6, 10]).unwrap();
    assert!(matches!(
      decode(&raw, &layout, &identity(), &params(0.2, 0.5, 1)),
      Err(InferenceError::MalformedOutput(_))
    ));
  }
}
