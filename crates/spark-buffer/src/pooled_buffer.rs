use std::{
    fmt,
    io::{self, Read},
    mem,
    sync::Arc,
};

use bytes::{BufMut, BytesMut};

/// `BufferRecycler` 描述缓冲池在租借结束时的回收入口。
///
/// # 设计初衷（Why）
/// - 池只负责“租借”侧的准入控制，归还路径需要一个与具体池解耦的钩子，
///   使 [`PooledBuffer`] 在 `Drop` 时即可把容量交还，不依赖调用方记得释放。
///
/// # 使用方式（How）
/// - 池实现将自身内部状态封装为 `Arc<dyn BufferRecycler>`，在构造 [`PooledBuffer`] 时注入；
/// - 每个 `PooledBuffer` 生命周期内 `reclaim` 恰好被调用一次。
///
/// # 契约定义（What）
/// - **前置条件**：实现必须线程安全，且不得 panic，否则 `Drop` 路径上的 panic 会直接终止进程；
/// - **后置条件**：返回后池已把 `reclaimed.capacity()` 计入可用余量。
pub trait BufferRecycler: Send + Sync + 'static {
    /// 通知池归还一个租约。
    fn reclaim(&self, reclaimed: ReclaimedBuffer);
}

/// 一次回收动作携带的上下文：租约容量与可复用的底层内存块。
#[derive(Debug)]
pub struct ReclaimedBuffer {
    capacity: usize,
    buffer: Option<BytesMut>,
}

impl ReclaimedBuffer {
    /// 创建回收结果。
    pub fn new(capacity: usize, buffer: Option<BytesMut>) -> Self {
        Self { capacity, buffer }
    }

    /// 本次回收的租约容量，即租借时计入上限的字节数。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 消耗结构并返回可复用的 `BytesMut`，若底层块不可复用则为 `None`。
    pub fn into_buffer(self) -> Option<BytesMut> {
        self.buffer
    }
}

/// `PooledBuffer` 是从有界池租借的定长字节块。
///
/// # 设计动机（Why）
/// - 流式缓冲按块追加源数据，块一旦租出就不再扩容，池的容量统计因此始终精确；
/// - 类型只能移动、不可克隆：归还动作绑定在 `Drop` 上，同一块内存不可能被归还两次。
///
/// # 契约说明（What）
/// - `capacity()` 为租约容量，写入永远不会超过该值；
/// - `put_slice` / `fill_from` 只写入剩余空间能容纳的部分，并返回实际写入字节数；
/// - `Drop` 时池必然收到一次 `reclaim`，携带清空后的底层块以便复用。
pub struct PooledBuffer {
    buf: BytesMut,
    capacity: usize,
    recycler: Arc<dyn BufferRecycler>,
}

impl PooledBuffer {
    /// 使用给定的 `BytesMut` 与回收句柄创建缓冲。
    ///
    /// # 前置条件
    /// - `inner` 为空且容量不小于 `capacity`；租约容量以 `capacity` 为准。
    pub fn new(inner: BytesMut, capacity: usize, recycler: Arc<dyn BufferRecycler>) -> Self {
        debug_assert!(inner.is_empty());
        debug_assert!(inner.capacity() >= capacity);
        Self {
            buf: inner,
            capacity,
            recycler,
        }
    }

    /// 租约容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 已写入字节数。
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 剩余可写字节数。
    pub fn remaining_mut(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_full(&self) -> bool {
        self.remaining_mut() == 0
    }

    /// 已写入内容的只读视图。
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// 追加 `src` 中能装下的前缀，返回实际写入的字节数。
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining_mut());
        self.buf.put_slice(&src[..n]);
        n
    }

    /// 从 `reader` 读取数据直到块被写满或读到 EOF。
    ///
    /// # 契约说明（What）
    /// - 返回本次写入的字节数；返回后若块仍未写满，说明 `reader` 已到达 EOF；
    /// - `ErrorKind::Interrupted` 会被自动重试，其他 IO 错误原样返回，已写入的数据保留。
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut total = 0;
        while !self.is_full() {
            let start = self.buf.len();
            // 容量已预留，resize 不会触发重新分配。
            self.buf.resize(self.capacity, 0);
            match reader.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    break;
                }
                Ok(n) => {
                    self.buf.truncate(start + n);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.buf.truncate(start);
                }
                Err(err) => {
                    self.buf.truncate(start);
                    return Err(err);
                }
            }
        }
        Ok(total)
    }

    /// 清空已写入内容，租约容量不变。
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = mem::take(&mut self.buf);
        buf.clear();
        // 只有容量未被外部改动的块才值得放回自由链表。
        let reusable = (buf.capacity() >= self.capacity).then_some(buf);
        self.recycler
            .reclaim(ReclaimedBuffer::new(self.capacity, reusable));
    }
}
