//! `pooled_buffer_contract` 集成测试：聚焦 `PooledBuffer` 生命周期与写入契约。
//!
//! # 测试总览（Why）
//! - 校验定长写入、从 `Read` 填充等操作不会越过租约容量；
//! - 以 `RecordingRecycler` 观察回收事件，验证每个块恰好归还一次。

use std::{
    io::{self, Read},
    sync::{Arc, Mutex},
};

use bytes::BytesMut;
use spark_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer};

/// 捕获回收事件的探针实现：记录容量与是否携带可复用块。
#[derive(Default)]
struct RecordingRecycler {
    events: Mutex<Vec<(usize, bool)>>,
}

impl RecordingRecycler {
    fn take_events(&self) -> Vec<(usize, bool)> {
        self.events
            .lock()
            .expect("mutex poisoned")
            .drain(..)
            .collect()
    }
}

impl BufferRecycler for RecordingRecycler {
    fn reclaim(&self, reclaimed: ReclaimedBuffer) {
        let capacity = reclaimed.capacity();
        let had_buffer = reclaimed.into_buffer().is_some();
        self.events
            .lock()
            .expect("mutex poisoned")
            .push((capacity, had_buffer));
    }
}

fn block(capacity: usize, recycler: &Arc<RecordingRecycler>) -> PooledBuffer {
    PooledBuffer::new(
        BytesMut::with_capacity(capacity),
        capacity,
        recycler.clone() as Arc<dyn BufferRecycler>,
    )
}

/// 写入超过剩余容量时只接收能装下的前缀。
#[test]
fn put_slice_never_grows_past_lease_capacity() {
    let recycler = Arc::new(RecordingRecycler::default());
    let mut buffer = block(4, &recycler);
    assert_eq!(buffer.put_slice(b"abc"), 3);
    assert_eq!(buffer.put_slice(b"defg"), 1, "只剩 1 字节可写");
    assert!(buffer.is_full());
    assert_eq!(buffer.put_slice(b"h"), 0, "写满后不再接收数据");
    assert_eq!(buffer.as_slice(), b"abcd");
    assert_eq!(buffer.capacity(), 4);
    drop(buffer);
    assert_eq!(recycler.take_events(), vec![(4, true)]);
}

/// `fill_from` 在源数据充足时写满整块。
#[test]
fn fill_from_stops_when_block_is_full() {
    let recycler = Arc::new(RecordingRecycler::default());
    let mut buffer = block(8, &recycler);
    let mut source = io::Cursor::new(b"0123456789".to_vec());
    let read = buffer.fill_from(&mut source).expect("填充不应失败");
    assert_eq!(read, 8);
    assert!(buffer.is_full());
    assert_eq!(source.position(), 8, "源只应被消费一个块的长度");
}

/// `fill_from` 读到 EOF 时保留已读内容，块未写满即代表源已耗尽。
#[test]
fn fill_from_reports_eof_through_partial_block() {
    let recycler = Arc::new(RecordingRecycler::default());
    let mut buffer = block(16, &recycler);
    let mut source = io::Cursor::new(b"tail".to_vec());
    assert_eq!(buffer.fill_from(&mut source).expect("填充"), 4);
    assert!(!buffer.is_full());
    assert_eq!(buffer.remaining_mut(), 12);
    assert_eq!(buffer.fill_from(&mut source).expect("再次填充"), 0);
}

/// 被中断的读取会被重试，真正的 IO 错误原样返回且不丢失已写内容。
#[test]
fn fill_from_retries_interrupted_and_surfaces_errors() {
    struct Flaky {
        calls: usize,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            match self.calls {
                1 => Err(io::Error::new(io::ErrorKind::Interrupted, "retry")),
                2 => {
                    buf[..2].copy_from_slice(b"ok");
                    Ok(2)
                }
                _ => Err(io::Error::other("socket reset")),
            }
        }
    }

    let recycler = Arc::new(RecordingRecycler::default());
    let mut buffer = block(8, &recycler);
    let err = buffer
        .fill_from(&mut Flaky { calls: 0 })
        .expect_err("第三次读取应返回错误");
    assert_eq!(err.to_string(), "socket reset");
    assert_eq!(buffer.as_slice(), b"ok", "错误前写入的数据应保留");
}

/// `clear` 只清空内容，不改变租约容量，也不会提前触发回收。
#[test]
fn clear_keeps_lease_alive() {
    let recycler = Arc::new(RecordingRecycler::default());
    let mut buffer = block(8, &recycler);
    buffer.put_slice(b"data");
    buffer.clear();
    assert!(buffer.is_empty());
    assert_eq!(buffer.remaining_mut(), 8);
    assert!(recycler.take_events().is_empty());
    drop(buffer);
    assert_eq!(recycler.take_events().len(), 1);
}

/// `ReclaimedBuffer` 的构造与字段访问应保持元数据一致。
#[test]
fn reclaimed_buffer_retains_metadata() {
    let capacity = 32;
    let buf = BytesMut::with_capacity(capacity);
    let reclaimed = ReclaimedBuffer::new(capacity, Some(buf));
    assert_eq!(reclaimed.capacity(), capacity);
    assert!(reclaimed.into_buffer().is_some());
}
