// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/bin/simple_continueshot.rs - 连续帧检测
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

use std::{thread, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};
use url::Url;

use qingfeng::{
  FromUrl,
  input::YuvFileInput,
  model::{DetectResult, Thresholds},
  output::{FrameTag, OutputWrapper, Render},
  task::{FrameRequest, TaskScheduler, Ticket},
};

/// Qingfeng 连续帧检测，将原始 YUV 文件按固定帧率回放
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 yolo11:///models/best.onnx?labels=/models/coco.txt&rotation=90
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 yuv:///data/frames.yuv?width=640&height=480&format=nv21&loop
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出地址，例如 folder:///tmp/records 或 json:///tmp/result.jsonl?lines
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 回放帧率
  #[arg(long, default_value = "30", value_name = "FPS")]
  pub fps: f64,
  /// 最大处理帧数
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
  #[arg(long, value_name = "THRESHOLD")]
  pub iou: Option<f32>,
  #[arg(long, value_name = "THRESHOLD")]
  pub conf: Option<f32>,
  #[arg(long, value_name = "THRESHOLD")]
  pub class: Option<f32>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = YuvFileInput::from_url(&args.input)?;
  let rotation = input.rotation();
  let output = OutputWrapper::from_url(&args.output)?;
  let thresholds = Thresholds::from_options(args.iou, args.conf, args.class);
  let interval = Duration::from_secs_f64(1.0 / args.fps.max(1.0));

  let scheduler = TaskScheduler::new()?;
  info!("{}", scheduler.load_model_from_url(&args.model)?);

  let (tx, rx) = std::sync::mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
  })?;

  let mut pending: Vec<(FrameTag, Ticket<DetectResult>)> = Vec::new();
  let mut dropped = 0usize;
  let mut rendered = 0usize;

  let mut render_ready = |pending: &mut Vec<(FrameTag, Ticket<DetectResult>)>| -> Result<()> {
    let mut waiting = Vec::with_capacity(pending.len());
    for (tag, ticket) in pending.drain(..) {
      match ticket.poll() {
        Some(result) => {
          let result = result?;
          debug!("第 {} 帧检测到 {} 个目标", tag.index, result.len());
          output.render_result(&tag, &result)?;
          rendered += 1;
        }
        None => waiting.push((tag, ticket)),
      }
    }
    *pending = waiting;
    Ok(())
  };

  for (index, frame) in input.enumerate() {
    render_ready(&mut pending)?;

    let (planes, width, height, _) = frame.into_parts();
    let mut request = FrameRequest::new(planes, width, height).with_thresholds(thresholds);
    if let Some(rotation) = rotation {
      request = request.with_rotation(rotation);
    }

    let ticket = scheduler.detect_on_frame(request)?;
    if ticket.is_dropped() {
      dropped += 1;
      debug!("检测忙，丢弃第 {} 帧", index);
    } else {
      pending.push((FrameTag::new(index, args.input.as_str()), ticket));
    }

    if args.frame_number.is_some_and(|n| index + 1 >= n) {
      info!("达到指定帧数 {}, 退出任务循环", index + 1);
      break;
    }
    if rx.try_recv().is_ok() {
      warn!("中断信号接收，退出任务循环");
      break;
    }
    thread::sleep(interval);
  }

  for (tag, ticket) in pending.drain(..) {
    let result = ticket.wait()?;
    output.render_result(&tag, &result)?;
    rendered += 1;
  }

  info!("任务完成: 输出 {} 帧, 丢弃 {} 帧", rendered, dropped);
  scheduler.close_model()?;
  Ok(())
}
