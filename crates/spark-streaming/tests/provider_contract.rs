//! `provider_contract` 集成测试：验证游标提供者的关闭语义与缓冲正确性。
//!
//! # 测试目标（Why）
//! - 关闭后打开游标总是失败，错误信息按是否开启追踪给出不同的诊断内容；
//! - 并发关闭只有一次真正释放资源，且双方都不报错；
//! - 任意块大小下，游标从任意位置读取到的内容都与原始数据一致。

use std::{
    io::{Cursor, Read, Seek, SeekFrom},
    sync::{Arc, Barrier},
    thread,
};

use proptest::prelude::*;
use spark_buffer::BoundedBufferPool;
use spark_streaming::{
    CursorProvider, InMemoryCursorStreamProvider, ProviderLifecycle, ProviderOptions,
    StreamingError, StreamingStatistics, codes,
};

fn stream_provider(pool: &BoundedBufferPool, options: ProviderOptions) -> InMemoryCursorStreamProvider {
    InMemoryCursorStreamProvider::new(Cursor::new(vec![7u8; 256]), pool.clone(), options)
}

/// 开启追踪：错误信息包含打开位置与关闭现场。
#[test]
fn tracked_close_reports_opener_and_closer() {
    let pool = BoundedBufferPool::with_max_capacity(4096);
    let provider = stream_provider(
        &pool,
        ProviderOptions::default()
            .with_location("orders-flow/processors/0")
            .with_track_close(true),
    );
    provider.close();

    let err = provider.open_cursor().expect_err("已关闭的提供者不能再打开");
    assert_eq!(err.code(), codes::PROVIDER_CLOSED);
    let StreamingError::AlreadyClosed(closed) = &err else {
        panic!("意外的错误类型: {err:?}");
    };
    assert!(closed.closed_by().is_some());
    let message = err.to_string();
    assert!(message.contains("opened by: orders-flow/processors/0"));
    assert!(message.contains("closed by:"));
}

/// 未开启追踪：只有打开位置与开启追踪的提示。
#[test]
fn untracked_close_falls_back_to_hint() {
    let pool = BoundedBufferPool::with_max_capacity(4096);
    let provider = stream_provider(&pool, ProviderOptions::default());
    provider.close();

    let message = provider
        .open_cursor()
        .expect_err("已关闭的提供者不能再打开")
        .to_string();
    assert!(message.contains("opened by: unknown"));
    assert!(!message.contains("closed by"));
    assert!(message.contains("enable `track_cursor_provider_close`"));
}

/// 两个线程同时关闭：资源只释放一次，统计不会被重复扣减。
#[test]
fn concurrent_close_releases_exactly_once() {
    for _ in 0..50 {
        let pool = BoundedBufferPool::with_max_capacity(4096);
        let stats = Arc::new(StreamingStatistics::new());
        let provider = Arc::new(stream_provider(
            &pool,
            ProviderOptions::default()
                .with_buffer_capacity(64)
                .with_statistics(Arc::clone(&stats)),
        ));
        let mut sink = Vec::new();
        provider
            .open_cursor()
            .expect("打开游标")
            .read_to_end(&mut sink)
            .expect("读取全部");
        assert_eq!(stats.pooled_bytes(), 256);

        let barrier = Arc::new(Barrier::new(2));
        let closers: Vec<_> = (0..2)
            .map(|_| {
                let provider = Arc::clone(&provider);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    provider.close();
                })
            })
            .collect();
        for closer in closers {
            closer.join().expect("关闭线程不应 panic");
        }

        assert!(provider.is_closed());
        assert_eq!(pool.allocated_bytes(), 0);
        assert_eq!(stats.pooled_bytes(), 0);
    }
}

/// 打开与关闭竞争：要么打开成功且读取干净失败，要么打开直接失败。
#[test]
fn open_racing_close_never_tears() {
    for _ in 0..50 {
        let pool = BoundedBufferPool::with_max_capacity(4096);
        let provider = Arc::new(stream_provider(&pool, ProviderOptions::default()));
        let barrier = Arc::new(Barrier::new(2));

        let opener = {
            let provider = Arc::clone(&provider);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                match provider.open_cursor() {
                    Ok(mut cursor) => {
                        let mut sink = Vec::new();
                        match cursor.read_to_end(&mut sink) {
                            Ok(read) => assert_eq!(read, 256),
                            Err(err) => assert!(err.to_string().contains("released")),
                        }
                    }
                    Err(err) => assert!(matches!(err, StreamingError::AlreadyClosed(_))),
                }
            })
        };
        barrier.wait();
        provider.close();
        opener.join().expect("打开线程不应 panic");
        assert_eq!(pool.allocated_bytes(), 0);
    }
}

/// 关闭是幂等的：重复调用不报错，也不会改变已关闭状态。
#[test]
fn repeated_close_is_a_no_op() {
    let pool = BoundedBufferPool::with_max_capacity(4096);
    let provider = stream_provider(&pool, ProviderOptions::default().with_track_close(true));
    provider.close();
    provider.close();
    assert!(provider.is_closed());
    assert!(provider.open_cursor().is_err());
}

proptest! {
    /// 任意数据、块大小与起始位置：读取结果等于原始数据的对应后缀。
    #[test]
    fn cursor_reads_match_source_suffix(
        data in proptest::collection::vec(any::<u8>(), 0..512),
        block in 1usize..64,
        start in 0u64..600,
    ) {
        let pool = BoundedBufferPool::with_max_capacity(1 << 20);
        let provider = InMemoryCursorStreamProvider::new(
            Cursor::new(data.clone()),
            pool.clone(),
            ProviderOptions::default().with_buffer_capacity(block),
        );
        let mut cursor = provider.open_cursor().expect("打开游标");
        cursor.seek(SeekFrom::Start(start)).expect("seek");
        let mut read = Vec::new();
        cursor.read_to_end(&mut read).expect("读取");

        let expected = data.get(start as usize..).unwrap_or(&[]);
        prop_assert_eq!(read.as_slice(), expected);
        prop_assert!(pool.allocated_bytes() <= data.len().next_multiple_of(block));
    }
}
