// 该文件是 Orbital Eye （轨道之眼） 项目的一部分。
// src/server.rs - 基于 TCP 的逐行 JSON 传输层
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

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::MAX_MESSAGE_BYTES;
use crate::service::{
  ChangeRequest, ChangeResponse, DetectRequest, DetectResponse, DetectorService, EnhanceRequest,
  EnhanceResponse, HealthReport, Status,
};
use crate::worker::WorkerPool;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

/// 每行一个请求，`op` 字段区分操作
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
  Detect(DetectRequest),
  DetectChanges(ChangeRequest),
  Health,
  Enhance(EnhanceRequest),
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
  Detect(DetectResponse),
  Change(ChangeResponse),
  Health(HealthReport),
  Enhance(EnhanceResponse),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
  Ok(ReplyBody),
  Error(Status),
}

impl From<Result<ReplyBody, Status>> for Reply {
  fn from(result: Result<ReplyBody, Status>) -> Self {
    match result {
      Ok(body) => Reply::Ok(body),
      Err(status) => Reply::Error(status),
    }
  }
}

/// 安装 Ctrl-C 处理，返回停止信号；30 秒内未退出则强制结束进程
pub fn install_shutdown_handler() -> Result<Receiver<()>, ctrlc::Error> {
  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(rx)
}

pub fn dispatch(service: &DetectorService, pool: &WorkerPool, request: Request) -> Reply {
  let result = match request {
    Request::Health => Ok(ReplyBody::Health(service.health())),
    Request::Detect(request) => {
      let service = service.clone();
      pool
        .run(move || service.detect(request))
        .map(ReplyBody::Detect)
    }
    Request::DetectChanges(request) => {
      let service = service.clone();
      pool
        .run(move || service.detect_changes(request))
        .map(ReplyBody::Change)
    }
    Request::Enhance(request) => service.enhance(request).map(ReplyBody::Enhance),
  };
  Reply::from(result)
}

pub fn handle_line(service: &DetectorService, pool: &WorkerPool, line: &[u8]) -> Reply {
  match serde_json::from_slice::<Request>(line) {
    Ok(request) => dispatch(service, pool, request),
    Err(e) => {
      warn!("请求解析失败: {}", e);
      Reply::Error(Status::invalid_argument(format!("请求格式错误: {}", e)))
    }
  }
}

enum Message {
  Line(Vec<u8>),
  TooLarge,
  Eof,
}

fn read_message<R: BufRead>(reader: &mut R, limit: usize) -> io::Result<Message> {
  let mut buf = Vec::new();
  let n = reader.by_ref().take(limit as u64 + 1).read_until(b'\n', &mut buf)?;
  if n == 0 {
    return Ok(Message::Eof);
  }
  if buf.last() == Some(&b'\n') {
    buf.pop();
  } else if n > limit {
    return Ok(Message::TooLarge);
  }
  Ok(Message::Line(buf))
}

fn encode_reply(reply: &Reply) -> Vec<u8> {
  let encoded = serde_json::to_vec(reply).and_then(|data| {
    if data.len() > MAX_MESSAGE_BYTES {
      serde_json::to_vec(&Reply::Error(Status::internal("响应超过最大消息长度")))
    } else {
      Ok(data)
    }
  });
  encoded.unwrap_or_else(|e| {
    error!("响应序列化失败: {}", e);
    br#"{"error":{"code":"internal","message":"response serialization failed"}}"#.to_vec()
  })
}

fn write_reply(stream: &mut TcpStream, reply: &Reply) -> io::Result<()> {
  let mut data = encode_reply(reply);
  data.push(b'\n');
  stream.write_all(&data)?;
  stream.flush()
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, service: DetectorService, pool: Arc<WorkerPool>) {
  debug!("新连接: {}", peer);
  let mut writer = match stream.try_clone() {
    Ok(writer) => writer,
    Err(e) => {
      error!("无法复制连接句柄 {}: {}", peer, e);
      return;
    }
  };
  let mut reader = BufReader::new(stream);

  loop {
    let reply = match read_message(&mut reader, MAX_MESSAGE_BYTES) {
      Ok(Message::Line(line)) if line.iter().all(u8::is_ascii_whitespace) => continue,
      Ok(Message::Line(line)) => handle_line(&service, &pool, &line),
      Ok(Message::TooLarge) => {
        warn!("请求超过最大长度，关闭连接: {}", peer);
        let reply = Reply::Error(Status::invalid_argument("请求超过最大消息长度"));
        let _ = write_reply(&mut writer, &reply);
        break;
      }
      Ok(Message::Eof) => break,
      Err(e) => {
        debug!("读取失败 {}: {}", peer, e);
        break;
      }
    };

    // 客户端已断开时丢弃结果
    if let Err(e) = write_reply(&mut writer, &reply) {
      debug!("写回失败，丢弃结果 {}: {}", peer, e);
      break;
    }
  }
  debug!("连接关闭: {}", peer);
}

/// 接受连接直到收到停止信号；每个连接一个线程，实际计算交给工作线程池
pub fn serve(
  listener: TcpListener,
  service: DetectorService,
  pool: Arc<WorkerPool>,
  stop: Receiver<()>,
) -> io::Result<()> {
  listener.set_nonblocking(true)?;
  info!("AI Worker 监听地址: {}", listener.local_addr()?);

  loop {
    match listener.accept() {
      Ok((stream, peer)) => {
        stream.set_nonblocking(false)?;
        let service = service.clone();
        let pool = pool.clone();
        thread::Builder::new()
          .name(format!("conn-{}", peer))
          .spawn(move || handle_connection(stream, peer, service, pool))?;
      }
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        if stop.try_recv().is_ok() {
          info!("停止接受新连接");
          break;
        }
        thread::sleep(ACCEPT_POLL_INTERVAL);
      }
      Err(e) => warn!("接受连接失败: {}", e),
    }
  }
  Ok(())
}
