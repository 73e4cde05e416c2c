// 该文件是 Qingfeng （青峰） 项目的一部分。
// src/task.rs - 单工作线程任务调度
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

//! 所有转换、检测与模型管理任务都在同一个工作线程上串行执行。
//!
//! 转换与检测各有一个准入闸门。闸门被占用时新的请求不会排队，而是立即
//! 得到一个空结果（丢弃最新帧），以保证实时帧流不会积压。

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, Sender, TryRecvError},
  },
  thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use crate::{
  PipelineError, ValidationError,
  convert::{ColorConverter, decode_image},
  frame::{PixelBuffer, PlanarFrame, Rotation},
  model::{DetectResult, Detector, ModelVariant, SUPPORTED_VERSIONS, Thresholds},
  preprocess::TensorPreprocessor,
};

type Job = Box<dyn FnOnce(&mut WorkerState) + Send>;

/// 工作线程独占的状态
struct WorkerState {
  detector: Option<Detector>,
  preprocessor: TensorPreprocessor,
  converter: ColorConverter,
}

impl WorkerState {
  fn new() -> Self {
    Self {
      detector: None,
      preprocessor: TensorPreprocessor::new(),
      converter: ColorConverter::new(),
    }
  }

  fn detect_frame(&mut self, request: FrameRequest) -> Result<DetectResult, PipelineError> {
    let detector = self.detector.as_mut().ok_or(PipelineError::ModelNotLoaded)?;
    let rotation = request.rotation.unwrap_or(detector.rotation());
    let frame = PlanarFrame::new(request.planes, request.width, request.height, rotation);
    let pixels = self.converter.convert(&frame)?;
    drop(frame);
    detector.detect(&pixels, &self.preprocessor, &request.thresholds)
  }

  fn detect_image(&mut self, request: ImageRequest) -> Result<DetectResult, PipelineError> {
    let detector = self.detector.as_mut().ok_or(PipelineError::ModelNotLoaded)?;
    let pixels = decode_image(&request.bytes)?;
    drop(request.bytes);
    detector.detect(&pixels, &self.preprocessor, &request.thresholds)
  }
}

/// 准入闸门的占用凭证，释放时归还闸门
struct GateGuard {
  gate: Arc<AtomicBool>,
}

impl GateGuard {
  fn try_acquire(gate: &Arc<AtomicBool>) -> Option<Self> {
    gate
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self {
        gate: Arc::clone(gate),
      })
  }
}

impl Drop for GateGuard {
  fn drop(&mut self) {
    self.gate.store(false, Ordering::Release);
  }
}

/// 请求的异步结果
///
/// `Dropped` 表示请求因闸门占用被丢弃，等待时立即得到空结果。
#[derive(Debug)]
pub enum Ticket<T> {
  Accepted(Receiver<Result<T, PipelineError>>),
  Dropped,
}

impl<T: Default> Ticket<T> {
  pub fn is_dropped(&self) -> bool {
    matches!(self, Ticket::Dropped)
  }

  /// 阻塞直到工作线程完成
  pub fn wait(self) -> Result<T, PipelineError> {
    match self {
      Ticket::Accepted(rx) => rx.recv().map_err(|_| PipelineError::WorkerGone)?,
      Ticket::Dropped => Ok(T::default()),
    }
  }

  /// 非阻塞查询，结果只会返回一次
  pub fn poll(&self) -> Option<Result<T, PipelineError>> {
    match self {
      Ticket::Accepted(rx) => match rx.try_recv() {
        Ok(result) => Some(result),
        Err(TryRecvError::Empty) => None,
        Err(TryRecvError::Disconnected) => Some(Err(PipelineError::WorkerGone)),
      },
      Ticket::Dropped => Some(Ok(T::default())),
    }
  }
}

/// 在相机帧上检测
#[derive(Debug, Clone)]
pub struct FrameRequest {
  pub planes: Vec<Vec<u8>>,
  pub width: u32,
  pub height: u32,
  /// 缺省时使用加载模型时配置的旋转角度
  pub rotation: Option<Rotation>,
  pub thresholds: Thresholds,
}

impl FrameRequest {
  pub fn new(planes: Vec<Vec<u8>>, width: u32, height: u32) -> Self {
    Self {
      planes,
      width,
      height,
      rotation: None,
      thresholds: Thresholds::default(),
    }
  }

  pub fn with_rotation(mut self, rotation: Rotation) -> Self {
    self.rotation = Some(rotation);
    self
  }

  pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
    self.thresholds = thresholds;
    self
  }

  fn validate(&self) -> Result<(), ValidationError> {
    if self.width == 0 || self.height == 0 {
      return Err(ValidationError::InvalidDimensions {
        width: self.width,
        height: self.height,
      });
    }
    if self.planes.is_empty() {
      return Err(ValidationError::MissingArgument("planes"));
    }
    Ok(())
  }
}

/// 在编码图像上检测，源尺寸取自解码结果
#[derive(Debug, Clone)]
pub struct ImageRequest {
  pub bytes: Vec<u8>,
  pub thresholds: Thresholds,
}

impl ImageRequest {
  pub fn new(bytes: Vec<u8>) -> Self {
    Self {
      bytes,
      thresholds: Thresholds::default(),
    }
  }

  pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
    self.thresholds = thresholds;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelInfo {
  NotLoaded,
  Loaded {
    variant: ModelVariant,
    rotation: Rotation,
  },
}

impl std::fmt::Display for ModelInfo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ModelInfo::NotLoaded => write!(f, "未加载模型"),
      ModelInfo::Loaded { variant, rotation } => {
        write!(f, "模型已加载: {}, 旋转: {}", variant, rotation)
      }
    }
  }
}

impl From<Option<&Detector>> for ModelInfo {
  fn from(detector: Option<&Detector>) -> Self {
    match detector {
      Some(d) => ModelInfo::Loaded {
        variant: d.variant(),
        rotation: d.rotation(),
      },
      None => ModelInfo::NotLoaded,
    }
  }
}

/// 检测任务调度器
pub struct TaskScheduler {
  sender: Option<Sender<Job>>,
  worker: Option<JoinHandle<()>>,
  converting: Arc<AtomicBool>,
  detecting: Arc<AtomicBool>,
  model_loaded: Arc<AtomicBool>,
}

impl TaskScheduler {
  pub fn new() -> Result<Self, PipelineError> {
    let (sender, receiver) = mpsc::channel::<Job>();
    let worker = thread::Builder::new()
      .name("qingfeng-worker".to_string())
      .spawn(move || {
        info!("工作线程启动");
        let mut state = WorkerState::new();
        for job in receiver {
          job(&mut state);
        }
        info!("工作线程退出");
      })
      .map_err(PipelineError::WorkerSpawn)?;

    Ok(Self {
      sender: Some(sender),
      worker: Some(worker),
      converting: Arc::new(AtomicBool::new(false)),
      detecting: Arc::new(AtomicBool::new(false)),
      model_loaded: Arc::new(AtomicBool::new(false)),
    })
  }

  pub fn supported_versions() -> &'static str {
    SUPPORTED_VERSIONS
  }

  pub fn is_model_loaded(&self) -> bool {
    self.model_loaded.load(Ordering::Acquire)
  }

  pub fn is_converting(&self) -> bool {
    self.converting.load(Ordering::Acquire)
  }

  pub fn is_detecting(&self) -> bool {
    self.detecting.load(Ordering::Acquire)
  }

  fn submit(&self, job: Job) -> Result<(), PipelineError> {
    let sender = self.sender.as_ref().ok_or(PipelineError::WorkerGone)?;
    sender.send(job).map_err(|_| {
      error!("工作线程已退出，任务无法提交");
      PipelineError::WorkerGone
    })
  }

  /// 提交任务并阻塞等待其结果
  fn call<T, F>(&self, f: F) -> Result<T, PipelineError>
  where
    T: Send + 'static,
    F: FnOnce(&mut WorkerState) -> Result<T, PipelineError> + Send + 'static,
  {
    let (tx, rx) = mpsc::channel();
    self.submit(Box::new(move |state| {
      let _ = tx.send(f(state));
    }))?;
    rx.recv().map_err(|_| PipelineError::WorkerGone)?
  }

  /// 在工作线程上加载模型，替换已加载的模型
  ///
  /// 旧模型在新模型加载前释放。
  pub fn load_model<F>(&self, loader: F) -> Result<ModelInfo, PipelineError>
  where
    F: FnOnce() -> Result<Detector, PipelineError> + Send + 'static,
  {
    let loaded = Arc::clone(&self.model_loaded);
    self.call(move |state| {
      if state.detector.take().is_some() {
        info!("释放已加载的模型");
      }
      loaded.store(false, Ordering::Release);

      let detector = loader().inspect_err(|e| error!("模型加载失败: {}", e))?;
      state.detector = Some(detector);
      loaded.store(true, Ordering::Release);
      let info = ModelInfo::from(state.detector.as_ref());
      info!("{}", info);
      Ok(info)
    })
  }

  /// 通过模型 URL 加载 ONNX 模型
  #[cfg(feature = "onnx_runtime")]
  pub fn load_model_from_url(&self, url: &url::Url) -> Result<ModelInfo, PipelineError> {
    use crate::{FromUrl, model::DetectorBuilder};

    let builder = DetectorBuilder::from_url(url)?;
    self.load_model(move || builder.build())
  }

  pub fn close_model(&self) -> Result<(), PipelineError> {
    let loaded = Arc::clone(&self.model_loaded);
    self.call(move |state| {
      loaded.store(false, Ordering::Release);
      match state.detector.take() {
        Some(_) => info!("模型已关闭"),
        None => debug!("没有已加载的模型"),
      }
      Ok(())
    })
  }

  pub fn model_info(&self) -> Result<ModelInfo, PipelineError> {
    self.call(|state| Ok(ModelInfo::from(state.detector.as_ref())))
  }

  /// 将相机帧转换为 RGBA 图像
  pub fn frame_to_image(&self, frame: PlanarFrame) -> Result<Ticket<PixelBuffer>, PipelineError> {
    let Some(gate) = GateGuard::try_acquire(&self.converting) else {
      debug!("转换任务忙，丢弃当前帧");
      return Ok(Ticket::Dropped);
    };

    let (tx, rx) = mpsc::channel();
    self.submit(Box::new(move |state| {
      let result = {
        let _gate = gate;
        let frame = frame;
        state.converter.convert(&frame).map_err(PipelineError::from)
      };
      let _ = tx.send(result);
    }))?;
    Ok(Ticket::Accepted(rx))
  }

  pub fn detect_on_frame(
    &self,
    request: FrameRequest,
  ) -> Result<Ticket<DetectResult>, PipelineError> {
    request.validate()?;
    if !self.is_model_loaded() {
      warn!("模型未加载，拒绝检测请求");
      return Err(PipelineError::ModelNotLoaded);
    }
    let Some(gate) = GateGuard::try_acquire(&self.detecting) else {
      debug!("检测任务忙，丢弃当前帧");
      return Ok(Ticket::Dropped);
    };

    let (tx, rx) = mpsc::channel();
    self.submit(Box::new(move |state| {
      let result = {
        let _gate = gate;
        state.detect_frame(request)
      };
      if let Err(e) = &result {
        error!("帧检测失败: {}", e);
      }
      let _ = tx.send(result);
    }))?;
    Ok(Ticket::Accepted(rx))
  }

  pub fn detect_on_image(
    &self,
    request: ImageRequest,
  ) -> Result<Ticket<DetectResult>, PipelineError> {
    if request.bytes.is_empty() {
      return Err(ValidationError::MissingArgument("bytes").into());
    }
    if !self.is_model_loaded() {
      warn!("模型未加载，拒绝检测请求");
      return Err(PipelineError::ModelNotLoaded);
    }
    let Some(gate) = GateGuard::try_acquire(&self.detecting) else {
      debug!("检测任务忙，丢弃当前图像");
      return Ok(Ticket::Dropped);
    };

    let (tx, rx) = mpsc::channel();
    self.submit(Box::new(move |state| {
      let result = {
        let _gate = gate;
        state.detect_image(request)
      };
      if let Err(e) = &result {
        error!("图像检测失败: {}", e);
      }
      let _ = tx.send(result);
    }))?;
    Ok(Ticket::Accepted(rx))
  }
}

impl Drop for TaskScheduler {
  fn drop(&mut self) {
    drop(self.sender.take());
    if let Some(worker) = self.worker.take() {
      if worker.join().is_err() {
        error!("工作线程异常退出");
      }
    }
  }
}
