// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像检测
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use qingfeng::{
  FromUrl,
  input::ImageFileInput,
  model::Thresholds,
  output::{FrameTag, OutputWrapper, Render},
  task::{ImageRequest, TaskScheduler},
};

/// Qingfeng 单张图像检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 yolov8:///models/best.onnx?labels=/models/coco.txt
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，例如 image:///data/bus.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出地址，例如 json:///tmp/result.json
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// NMS 交并比阈值
  #[arg(long, value_name = "THRESHOLD")]
  pub iou: Option<f32>,
  /// 目标置信度阈值
  #[arg(long, value_name = "THRESHOLD")]
  pub conf: Option<f32>,
  /// 类别置信度阈值
  #[arg(long, value_name = "THRESHOLD")]
  pub class: Option<f32>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);
  info!("支持的模型版本: {}", TaskScheduler::supported_versions());

  let input = ImageFileInput::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;
  let thresholds = Thresholds::from_options(args.iou, args.conf, args.class);

  let scheduler = TaskScheduler::new()?;
  let model_info = scheduler.load_model_from_url(&args.model)?;
  info!("{}", model_info);

  for (index, bytes) in input.enumerate() {
    info!("开始推理...");
    let now = std::time::Instant::now();
    let result = scheduler
      .detect_on_image(ImageRequest::new(bytes).with_thresholds(thresholds))?
      .wait()?;
    info!("推理完成，耗时: {:.2?}, 检测到 {} 个目标", now.elapsed(), result.len());
    for item in result.iter() {
      info!("{}: {:.3} {:?}", item.label, item.score, item.bbox);
    }
    output.render_result(&FrameTag::new(index, args.input.as_str()), &result)?;
  }

  scheduler.close_model()?;
  Ok(())
}
