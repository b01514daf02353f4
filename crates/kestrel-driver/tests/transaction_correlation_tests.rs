//! 事务关联集成测试
//!
//! 验证串口路径端到端的关联语义：
//! 1. N 个并发在途请求，响应以任意乱序投递，每个 future 只拿到自己的响应
//! 2. 未知事务 id 的响应帧被丢弃且不影响链路
//! 3. 异步回调模式与阻塞等待模式可以混用

use kestrel_driver::link::{loopback_pair, LoopbackRx, LoopbackTx, SerialRx, SerialTx};
use kestrel_driver::{LinkConfig, SerialLink};
use kestrel_protocol::{FrameAssembler, FrameCodec, SerialFrame};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// 设备模拟器：收集请求，攒够 `batch` 个后按乱序一次性回发响应
///
/// 响应载荷回显请求载荷，事务 id 原样回传。
fn spawn_batch_device(
    mut rx: LoopbackRx,
    mut tx: LoopbackTx,
    batch: usize,
) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    let handle = thread::spawn(move || {
        let codec = FrameCodec::new();
        let mut assembler = FrameAssembler::new();
        let mut chunk = [0u8; 512];
        let mut backlog: Vec<SerialFrame> = Vec::new();

        while running_clone.load(Ordering::Acquire) {
            let n = match rx.read(&mut chunk) {
                Ok(n) => n,
                Err(_) => return,
            };
            if n > 0 {
                assembler.push(&chunk[..n]);
                while let Some(Ok(request)) = assembler.next_frame() {
                    backlog.push(request);
                }
            }
            if backlog.len() >= batch {
                // 乱序回发
                backlog.shuffle(&mut rand::thread_rng());
                for request in backlog.drain(..) {
                    let mut response = SerialFrame::new(
                        request.command_id(),
                        request.payload().to_vec(),
                        true,
                    )
                    .with_transaction_id(request.transaction_id());
                    let bytes = codec.encode_frame(&mut response).unwrap();
                    if tx.write_all(&bytes).is_err() {
                        return;
                    }
                }
            }
        }
    });
    (running, handle)
}

#[test]
fn test_permuted_responses_resolve_matching_futures() {
    const REQUESTS: usize = 16;

    let ((host_rx, host_tx), (dev_rx, dev_tx)) = loopback_pair(Duration::from_millis(5));
    let (dev_running, dev_thread) = spawn_batch_device(dev_rx, dev_tx, REQUESTS);
    let link = SerialLink::new(host_rx, host_tx, LinkConfig::default());

    // 每个请求的载荷携带自己的序号
    let mut handles = Vec::new();
    for i in 0..REQUESTS {
        let handle = link
            .transmit(SerialFrame::new(0x0300, vec![i as u8, 0x5A], false))
            .unwrap();
        handles.push((i, handle));
    }
    assert_eq!(link.pending_transactions(), REQUESTS);

    // 乱序投递后，每个 future 仍只拿到自己的响应
    for (i, handle) in &handles {
        let response = handle.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(response.transaction_id(), handle.transaction_id());
        assert_eq!(response.payload(), &[*i as u8, 0x5A]);
    }

    let metrics = link.metrics();
    assert_eq!(metrics.responses_matched, REQUESTS as u64);
    assert_eq!(metrics.responses_unknown, 0);

    dev_running.store(false, Ordering::Release);
    drop(link);
    dev_thread.join().unwrap();
}

#[test]
fn test_unknown_response_dropped_non_fatally() {
    let ((host_rx, host_tx), (dev_rx, mut dev_tx)) = loopback_pair(Duration::from_millis(5));
    let (dev_running, dev_thread) = spawn_batch_device(dev_rx, dev_tx.clone(), 1);
    let link = SerialLink::new(host_rx, host_tx, LinkConfig::default());

    // 设备发来一个没人等的响应帧
    let codec = FrameCodec::new();
    let mut orphan =
        SerialFrame::new(0x0400, vec![0xEE], true).with_transaction_id(0x0000_1234);
    let bytes = codec.encode_frame(&mut orphan).unwrap();
    dev_tx.write_all(&bytes).unwrap();

    let start = Instant::now();
    while link.metrics().responses_unknown == 0 && start.elapsed() < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(link.metrics().responses_unknown, 1);
    assert!(link.is_healthy());

    // 链路继续正常工作
    let handle = link
        .transmit(SerialFrame::new(0x0401, vec![0x01], false))
        .unwrap();
    let response = handle.wait(Duration::from_secs(2)).unwrap();
    assert_eq!(response.payload(), &[0x01]);

    dev_running.store(false, Ordering::Release);
    drop(link);
    dev_thread.join().unwrap();
}

#[test]
fn test_async_and_blocking_modes_mix() {
    const REQUESTS: usize = 6;

    let ((host_rx, host_tx), (dev_rx, dev_tx)) = loopback_pair(Duration::from_millis(5));
    let (dev_running, dev_thread) = spawn_batch_device(dev_rx, dev_tx, 1);
    let link = SerialLink::new(host_rx, host_tx, LinkConfig::default());

    let completed = Arc::new(AtomicUsize::new(0));
    let payloads = Arc::new(Mutex::new(Vec::new()));
    let mut joins = Vec::new();

    for i in 0..REQUESTS {
        let handle = link
            .transmit(SerialFrame::new(0x0500, vec![i as u8], false))
            .unwrap();
        if i % 2 == 0 {
            // 异步回调模式
            let completed = Arc::clone(&completed);
            let payloads = Arc::clone(&payloads);
            joins.push(handle.run_async(
                Duration::from_secs(5),
                move |frame| {
                    payloads.lock().unwrap().push(frame.payload()[0]);
                    completed.fetch_add(1, Ordering::SeqCst);
                },
                || panic!("unexpected timeout"),
                |e| panic!("unexpected error: {}", e),
            ));
        } else {
            // 阻塞等待模式
            let frame = handle.wait(Duration::from_secs(5)).unwrap();
            assert_eq!(frame.payload(), &[i as u8]);
        }
    }

    for join in joins {
        join.join().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), REQUESTS / 2);

    let mut seen = payloads.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 2, 4]);

    dev_running.store(false, Ordering::Release);
    drop(link);
    dev_thread.join().unwrap();
}
