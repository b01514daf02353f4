//! SDO 传输管理器
//!
//! 持有一个上传/下载请求的单工作线程队列：底层 SDO 客户端对象同一时刻
//! 只支持一笔事务，因此请求严格按 FIFO 逐笔驱动（single-flight）。
//!
//! # 请求状态机
//!
//! ```text
//! Queued → OnGoing → Complete
//! Queued|OnGoing → CancelRequested → Cancelled
//! ```
//!
//! 取消是请求而非立即停止：只在工作循环的下一个轮询检查点被兑现。
//! 所有收尾路径都经过同一个 CAS：若在自然完成记账之前观察到取消请求，
//! 结果必为 `Cancelled`，绝不产生半取消半完成的混合结局。
//!
//! # 失败与重试
//!
//! 发起或任一步进失败立即以上报的 abort 码完成请求；瞬态 abort
//! （协议超时、块 CRC、toggle 位）在 `retries` 次内重新发起同一笔传输。
//! 错误只经结果 channel 交付，绝不跨线程边界抛出。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use kestrel_can::sdo::{SdoAbortCode, SdoClient, SdoValue, SdoValueType};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::error::DriverError;

/// 请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdoStatus {
    Queued = 0,
    OnGoing = 1,
    CancelRequested = 2,
    Cancelled = 3,
    Complete = 4,
}

impl SdoStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SdoStatus::Queued,
            1 => SdoStatus::OnGoing,
            2 => SdoStatus::CancelRequested,
            3 => SdoStatus::Cancelled,
            _ => SdoStatus::Complete,
        }
    }

    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(self, SdoStatus::Cancelled | SdoStatus::Complete)
    }
}

/// 请求参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoOptions {
    /// 底层传输超时
    pub timeout: Duration,
    /// 瞬态失败的最大重发次数
    pub retries: u32,
    /// 是否使用块传输
    pub is_block: bool,
}

impl Default for SdoOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            retries: 5,
            is_block: false,
        }
    }
}

/// 请求结局（经结果 channel 交付）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoOutcome {
    /// 上传成功，携带累积的数据
    UploadComplete(Vec<u8>),
    /// 下载成功
    DownloadComplete,
    /// 以 abort 码失败
    Aborted(SdoAbortCode),
    /// 已取消
    Cancelled,
}

/// 便捷等待接口的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdoTransferError {
    #[error("SDO transfer aborted: {}", .0.description())]
    Aborted(SdoAbortCode),
    #[error("SDO transfer cancelled")]
    Cancelled,
    #[error("SDO value decode failed: {0}")]
    Decode(String),
    #[error("SDO engine unavailable")]
    EngineClosed,
}

/// 请求的寻址信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SdoDescriptor {
    node_id: u8,
    index: u16,
    sub_index: u8,
    is_block: bool,
}

/// size_indicated 的已知标志位（低 32 位为值本身）
const SIZE_KNOWN: u64 = 1 << 32;

/// 工作线程与调用方句柄共享的权威状态
///
/// 除 `CancelRequested` 状态迁移（任意线程可请求）外，字段只由工作线程
/// 写入。
struct SdoShared {
    status: AtomicU8,
    abort_code: AtomicU32,
    size_indicated: AtomicU64,
    size_transferred: AtomicU32,
    descriptor: SdoDescriptor,
}

impl SdoShared {
    fn new(descriptor: SdoDescriptor) -> Self {
        Self {
            status: AtomicU8::new(SdoStatus::Queued as u8),
            abort_code: AtomicU32::new(0),
            size_indicated: AtomicU64::new(0),
            size_transferred: AtomicU32::new(0),
            descriptor,
        }
    }

    fn status(&self) -> SdoStatus {
        SdoStatus::from_u8(self.status.load(Ordering::Acquire))
    }
}

/// 请求句柄的公共部分
///
/// 轻量、引用计数共享；调用方持有它即可取消请求，权威状态仍归工作线程。
pub struct SdoHandle {
    shared: Arc<SdoShared>,
    outcome_rx: Receiver<SdoOutcome>,
    cached: Mutex<Option<SdoOutcome>>,
}

impl SdoHandle {
    fn new(shared: Arc<SdoShared>, outcome_rx: Receiver<SdoOutcome>) -> Self {
        Self {
            shared,
            outcome_rx,
            cached: Mutex::new(None),
        }
    }

    /// 当前状态
    pub fn status(&self) -> SdoStatus {
        self.shared.status()
    }

    pub fn node_id(&self) -> u8 {
        self.shared.descriptor.node_id
    }

    pub fn index(&self) -> u16 {
        self.shared.descriptor.index
    }

    pub fn sub_index(&self) -> u8 {
        self.shared.descriptor.sub_index
    }

    pub fn is_block(&self) -> bool {
        self.shared.descriptor.is_block
    }

    /// 失败时的 abort 码
    pub fn abort_code(&self) -> Option<SdoAbortCode> {
        let raw = self.shared.abort_code.load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            SdoAbortCode::from_raw(raw)
        }
    }

    /// 服务端声明的总字节数
    pub fn size_indicated(&self) -> Option<u32> {
        let raw = self.shared.size_indicated.load(Ordering::Acquire);
        if raw & SIZE_KNOWN != 0 {
            Some(raw as u32)
        } else {
            None
        }
    }

    /// 已搬运的字节数
    pub fn size_transferred(&self) -> u32 {
        self.shared.size_transferred.load(Ordering::Acquire)
    }

    /// 请求取消
    ///
    /// 取消在工作循环的下一个检查点兑现。仅当请求尚未到达 `Complete`
    /// 时返回 true；对已经取消的请求重复调用仍返回 true。
    pub fn cancel(&self) -> bool {
        loop {
            let current = self.shared.status.load(Ordering::Acquire);
            match SdoStatus::from_u8(current) {
                SdoStatus::Complete => return false,
                SdoStatus::Cancelled | SdoStatus::CancelRequested => return true,
                SdoStatus::Queued | SdoStatus::OnGoing => {
                    if self
                        .shared
                        .status
                        .compare_exchange(
                            current,
                            SdoStatus::CancelRequested as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        trace!(
                            "Cancel requested for SDO 0x{:04X}:{:02X}",
                            self.index(),
                            self.sub_index()
                        );
                        return true;
                    }
                }
            }
        }
    }

    /// 阻塞等待结局
    ///
    /// 可重复调用：结局只经 channel 接收一次，之后返回缓存的克隆。
    ///
    /// # 错误
    /// - [`DriverError::ChannelClosed`]: 工作线程已消亡
    pub fn wait(&self) -> Result<SdoOutcome, DriverError> {
        let mut cached = self.cached.lock().unwrap();
        if let Some(outcome) = cached.as_ref() {
            return Ok(outcome.clone());
        }
        let outcome = self
            .outcome_rx
            .recv()
            .map_err(|_| DriverError::ChannelClosed)?;
        *cached = Some(outcome.clone());
        Ok(outcome)
    }

    /// 带超时的阻塞等待
    ///
    /// # 错误
    /// - [`DriverError::Timeout`]: 超时未完成（请求继续在途）
    /// - [`DriverError::ChannelClosed`]: 工作线程已消亡
    pub fn wait_timeout(&self, timeout: Duration) -> Result<SdoOutcome, DriverError> {
        let mut cached = self.cached.lock().unwrap();
        if let Some(outcome) = cached.as_ref() {
            return Ok(outcome.clone());
        }
        let outcome = self
            .outcome_rx
            .recv_timeout(timeout)
            .map_err(|e| match e {
                crossbeam_channel::RecvTimeoutError::Timeout => DriverError::Timeout,
                crossbeam_channel::RecvTimeoutError::Disconnected => DriverError::ChannelClosed,
            })?;
        *cached = Some(outcome.clone());
        Ok(outcome)
    }
}

/// 上传请求句柄
pub struct SdoUploadHandle {
    handle: SdoHandle,
    value_type: SdoValueType,
}

impl SdoUploadHandle {
    /// 请求时指定的取值类型
    pub fn value_type(&self) -> SdoValueType {
        self.value_type
    }

    /// 等待并返回上传的原始字节
    pub fn wait_data(&self) -> Result<Vec<u8>, SdoTransferError> {
        match self.wait() {
            Ok(SdoOutcome::UploadComplete(data)) => Ok(data),
            Ok(SdoOutcome::Aborted(code)) => Err(SdoTransferError::Aborted(code)),
            Ok(SdoOutcome::Cancelled) => Err(SdoTransferError::Cancelled),
            Ok(SdoOutcome::DownloadComplete) | Err(_) => Err(SdoTransferError::EngineClosed),
        }
    }

    /// 等待并按请求的取值类型解码
    pub fn wait_value(&self) -> Result<SdoValue, SdoTransferError> {
        let data = self.wait_data()?;
        self.value_type
            .decode(&data)
            .map_err(|e| SdoTransferError::Decode(e.to_string()))
    }
}

impl std::ops::Deref for SdoUploadHandle {
    type Target = SdoHandle;

    fn deref(&self) -> &SdoHandle {
        &self.handle
    }
}

/// 下载请求句柄
pub struct SdoDownloadHandle {
    handle: SdoHandle,
    data: Arc<Vec<u8>>,
}

impl SdoDownloadHandle {
    /// 请求携带的下载数据
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 等待下载完成
    pub fn wait_ack(&self) -> Result<(), SdoTransferError> {
        match self.wait() {
            Ok(SdoOutcome::DownloadComplete) => Ok(()),
            Ok(SdoOutcome::Aborted(code)) => Err(SdoTransferError::Aborted(code)),
            Ok(SdoOutcome::Cancelled) => Err(SdoTransferError::Cancelled),
            Ok(SdoOutcome::UploadComplete(_)) | Err(_) => Err(SdoTransferError::EngineClosed),
        }
    }
}

impl std::ops::Deref for SdoDownloadHandle {
    type Target = SdoHandle;

    fn deref(&self) -> &SdoHandle {
        &self.handle
    }
}

/// 工作任务
enum JobKind {
    Upload,
    Download(Arc<Vec<u8>>),
}

struct SdoJob {
    shared: Arc<SdoShared>,
    kind: JobKind,
    options: SdoOptions,
    outcome_tx: Sender<SdoOutcome>,
}

/// FIFO 任务队列（互斥锁 + 条件变量）
struct SdoQueue {
    jobs: Mutex<VecDeque<SdoJob>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl SdoQueue {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn push(&self, job: SdoJob) {
        self.jobs.lock().unwrap().push_back(job);
        self.cond.notify_one();
    }

    /// 阻塞取出下一个任务；关停且队列已空时返回 `None`
    fn pop_blocking(&self) -> Option<SdoJob> {
        let mut jobs = self.jobs.lock().unwrap();
        loop {
            if let Some(job) = jobs.pop_front() {
                return Some(job);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            jobs = self.cond.wait(jobs).unwrap();
        }
    }

    fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

/// SDO 传输管理器
///
/// # Example
///
/// ```no_run
/// use kestrel_driver::{SdoOptions, SdoTransferManager};
/// use kestrel_can::SdoValueType;
/// # fn example(client: impl kestrel_can::SdoClient + 'static) {
/// let manager = SdoTransferManager::new(client);
/// let upload = manager.upload_data(5, 0x2000, 0x01, SdoValueType::UInt32, SdoOptions::default());
/// match upload.wait_data() {
///     Ok(data) => println!("uploaded {} bytes", data.len()),
///     Err(e) => eprintln!("upload failed: {}", e),
/// }
/// # }
/// ```
pub struct SdoTransferManager {
    queue: Arc<SdoQueue>,
    worker: Option<JoinHandle<()>>,
}

impl SdoTransferManager {
    /// 创建管理器并启动工作线程
    pub fn new(client: impl SdoClient + 'static) -> Self {
        let queue = Arc::new(SdoQueue::new());
        let queue_worker = Arc::clone(&queue);
        let worker = thread::Builder::new()
            .name("kestrel-sdo-worker".to_string())
            .spawn(move || worker_loop(client, queue_worker))
            .expect("failed to spawn SDO worker thread");

        Self {
            queue,
            worker: Some(worker),
        }
    }

    /// 入队一笔上传（读远端对象）
    pub fn upload_data(
        &self,
        node_id: u8,
        index: u16,
        sub_index: u8,
        value_type: SdoValueType,
        options: SdoOptions,
    ) -> SdoUploadHandle {
        let shared = Arc::new(SdoShared::new(SdoDescriptor {
            node_id,
            index,
            sub_index,
            is_block: options.is_block,
        }));
        let (outcome_tx, outcome_rx) = bounded(1);
        self.queue.push(SdoJob {
            shared: Arc::clone(&shared),
            kind: JobKind::Upload,
            options,
            outcome_tx,
        });
        debug!(
            "SDO upload queued: node {}, 0x{:04X}:{:02X}",
            node_id, index, sub_index
        );
        SdoUploadHandle {
            handle: SdoHandle::new(shared, outcome_rx),
            value_type,
        }
    }

    /// 入队一笔下载（写远端对象）
    pub fn download_data(
        &self,
        node_id: u8,
        index: u16,
        sub_index: u8,
        data: Vec<u8>,
        options: SdoOptions,
    ) -> SdoDownloadHandle {
        let data = Arc::new(data);
        let shared = Arc::new(SdoShared::new(SdoDescriptor {
            node_id,
            index,
            sub_index,
            is_block: options.is_block,
        }));
        let (outcome_tx, outcome_rx) = bounded(1);
        self.queue.push(SdoJob {
            shared: Arc::clone(&shared),
            kind: JobKind::Download(Arc::clone(&data)),
            options,
            outcome_tx,
        });
        debug!(
            "SDO download queued: node {}, 0x{:04X}:{:02X}, {} bytes",
            node_id,
            index,
            sub_index,
            data.len()
        );
        SdoDownloadHandle {
            handle: SdoHandle::new(shared, outcome_rx),
            data,
        }
    }

    /// 当前排队中的请求数（不含在途的一笔）
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for SdoTransferManager {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, Ordering::Release);
        self.queue.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("SDO worker thread panicked during shutdown");
            }
        }
    }
}

/// 一次驱动循环的结局
enum Drive {
    Finished,
    CancelObserved,
    Aborted(SdoAbortCode),
}

/// 工作线程主循环
fn worker_loop(mut client: impl SdoClient, queue: Arc<SdoQueue>) {
    while let Some(job) = queue.pop_blocking() {
        if queue.shutdown.load(Ordering::Acquire) {
            // 关停：剩余任务一律以取消收尾
            finalize_cancelled(&job.shared, &job.outcome_tx);
            continue;
        }
        run_job(&mut client, job);
    }
    trace!("SDO worker: loop exited");
}

/// 驱动单笔请求直至终态
fn run_job(client: &mut impl SdoClient, job: SdoJob) {
    let shared = &job.shared;
    let d = shared.descriptor;

    // Queued → OnGoing；排队期间已被取消则直接收尾
    if shared
        .status
        .compare_exchange(
            SdoStatus::Queued as u8,
            SdoStatus::OnGoing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        finalize_cancelled(shared, &job.outcome_tx);
        return;
    }

    let mut buffer = Vec::new();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let begun = match &job.kind {
            JobKind::Upload => {
                client.begin_upload(d.node_id, d.index, d.sub_index, d.is_block, job.options.timeout)
            }
            JobKind::Download(data) => client.begin_download(
                d.node_id,
                d.index,
                d.sub_index,
                data,
                d.is_block,
                job.options.timeout,
            ),
        };
        if let Err(code) = begun {
            if code.is_transient() && attempt <= job.options.retries {
                warn!(
                    "SDO setup failed with transient abort ({}), attempt {}/{}",
                    code.description(),
                    attempt,
                    job.options.retries + 1
                );
                continue;
            }
            finalize_abort(shared, &job.outcome_tx, code);
            return;
        }

        match drive(client, shared, &job.kind, &mut buffer) {
            Drive::Finished => {
                let outcome = match &job.kind {
                    JobKind::Upload => SdoOutcome::UploadComplete(std::mem::take(&mut buffer)),
                    JobKind::Download(data) => {
                        shared
                            .size_transferred
                            .store(data.len() as u32, Ordering::Release);
                        SdoOutcome::DownloadComplete
                    }
                };
                finalize_natural(shared, &job.outcome_tx, outcome);
                return;
            }
            Drive::CancelObserved => {
                client.abort(SdoAbortCode::GeneralError);
                finalize_cancelled(shared, &job.outcome_tx);
                return;
            }
            Drive::Aborted(code) => {
                if code.is_transient() && attempt <= job.options.retries {
                    warn!(
                        "SDO transfer aborted ({}), re-attempting {}/{}",
                        code.description(),
                        attempt,
                        job.options.retries + 1
                    );
                    buffer.clear();
                    shared.size_transferred.store(0, Ordering::Release);
                    continue;
                }
                finalize_abort(shared, &job.outcome_tx, code);
                return;
            }
        }
    }
}

/// 传输驱动循环
///
/// 每一轮：取消检查点 → 非阻塞步进（携带累计时间增量）→ 搬运就绪数据
/// （仅上传）→ 按建议时长休眠（0 表示还有数据立即可处理）。
fn drive(
    client: &mut impl SdoClient,
    shared: &SdoShared,
    kind: &JobKind,
    buffer: &mut Vec<u8>,
) -> Drive {
    let mut last_poll = Instant::now();
    loop {
        if shared.status() == SdoStatus::CancelRequested {
            return Drive::CancelObserved;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last_poll);
        last_poll = now;

        let progress = match client.poll(elapsed) {
            Ok(progress) => progress,
            Err(code) => return Drive::Aborted(code),
        };

        if matches!(kind, JobKind::Upload) {
            let moved = client.read_ready(buffer);
            if moved > 0 {
                shared
                    .size_transferred
                    .fetch_add(moved as u32, Ordering::Release);
            }
        }
        if let Some(size) = client.size_indicated() {
            shared
                .size_indicated
                .store(SIZE_KNOWN | size as u64, Ordering::Release);
        }

        if progress.finished {
            return Drive::Finished;
        }
        if !progress.next_poll.is_zero() {
            // 微秒级休眠精度
            spin_sleep::sleep(progress.next_poll);
        }
    }
}

/// 自然完成收尾（取消优先）
///
/// 经 CAS 记账：若在记账前观察到取消请求，结局降级为 `Cancelled`。
fn finalize_natural(shared: &SdoShared, outcome_tx: &Sender<SdoOutcome>, outcome: SdoOutcome) {
    loop {
        let current = shared.status.load(Ordering::Acquire);
        match SdoStatus::from_u8(current) {
            SdoStatus::CancelRequested => {
                shared
                    .status
                    .store(SdoStatus::Cancelled as u8, Ordering::Release);
                let _ = outcome_tx.send(SdoOutcome::Cancelled);
                return;
            }
            SdoStatus::Cancelled | SdoStatus::Complete => {
                // 终态只记账一次
                return;
            }
            _ => {
                if shared
                    .status
                    .compare_exchange(
                        current,
                        SdoStatus::Complete as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let _ = outcome_tx.send(outcome);
                    return;
                }
            }
        }
    }
}

/// 失败收尾（同样服从取消优先）
fn finalize_abort(shared: &SdoShared, outcome_tx: &Sender<SdoOutcome>, code: SdoAbortCode) {
    shared.abort_code.store(code.raw(), Ordering::Release);
    finalize_natural(shared, outcome_tx, SdoOutcome::Aborted(code));
}

/// 取消收尾
fn finalize_cancelled(shared: &SdoShared, outcome_tx: &Sender<SdoOutcome>) {
    shared
        .status
        .store(SdoStatus::Cancelled as u8, Ordering::Release);
    let _ = outcome_tx.send(SdoOutcome::Cancelled);
}
