// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/worker.rs - 有界工作线程池
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Orbital Eye contributors

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::service::Status;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 固定数量的工作线程消费一个有界队列，单个请求 panic 不影响其他请求
pub struct WorkerPool {
  sender: Option<SyncSender<Job>>,
  workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
  pub fn new(size: usize) -> std::io::Result<Self> {
    let size = size.max(1);
    let (sender, receiver) = mpsc::sync_channel::<Job>(size * 2);
    let receiver = Arc::new(Mutex::new(receiver));

    let workers = (0..size)
      .map(|index| {
        let receiver = receiver.clone();
        thread::Builder::new()
          .name(format!("orbital-worker-{}", index))
          .spawn(move || worker_loop(index, receiver))
      })
      .collect::<std::io::Result<Vec<_>>>()?;

    info!("工作线程池启动: {} 个线程", size);
    Ok(Self {
      sender: Some(sender),
      workers,
    })
  }

  /// 提交任务；队列满时阻塞，返回结果接收端
  pub fn submit<T, F>(&self, job: F) -> Result<Receiver<Result<T, Status>>, Status>
  where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Status> + Send + 'static,
  {
    let (tx, rx) = mpsc::channel();
    let wrapped: Job = Box::new(move || {
      let now = Instant::now();
      let result = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|panic| {
        let message = panic_message(panic.as_ref());
        error!("请求处理发生 panic: {}", message);
        Err(Status::internal(format!("请求处理异常: {}", message)))
      });
      debug!("任务完成，耗时: {:.2?}", now.elapsed());
      // 调用方可能已放弃结果
      let _ = tx.send(result);
    });

    self
      .sender
      .as_ref()
      .ok_or_else(|| Status::internal("工作线程池已关闭"))?
      .send(wrapped)
      .map_err(|_| Status::internal("工作线程池已关闭"))?;
    Ok(rx)
  }

  /// 提交并等待结果
  pub fn run<T, F>(&self, job: F) -> Result<T, Status>
  where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Status> + Send + 'static,
  {
    self
      .submit(job)?
      .recv()
      .map_err(|_| Status::internal("工作线程意外退出"))?
  }
}

fn worker_loop(index: usize, receiver: Arc<Mutex<Receiver<Job>>>) {
  loop {
    let job = {
      let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
      receiver.recv()
    };
    match job {
      Ok(job) => job(),
      Err(_) => {
        debug!("工作线程 {} 退出", index);
        break;
      }
    }
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "未知错误".to_string()
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    drop(self.sender.take());
    for worker in self.workers.drain(..) {
      let _ = worker.join();
    }
    info!("工作线程池已停止");
  }
}
