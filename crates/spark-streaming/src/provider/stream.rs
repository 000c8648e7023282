use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom},
    mem,
    sync::Arc,
};

use parking_lot::Mutex;
use spark_buffer::{BoundedBufferPool, PooledBuffer};
use tracing::debug;

use super::{CursorProvider, ProviderKey, ProviderLifecycle, ProviderOptions, ProviderState};
use crate::{
    error::{Result, StreamingError},
    location::ComponentLocation,
    statistics::StreamingStatistics,
};

/// 以有界池为后端、可重复读取的字节流提供者。
///
/// # 教案式说明
/// - **意图 (Why)**：把只能读一次的 `Read` 源变成可反复打开的句柄，内存全部经由
///   [`BoundedBufferPool`] 申请，超出池上限时以可恢复错误失败，而不是拖垮整个进程；
/// - **逻辑 (How)**：
///   - 数据按需读取：游标读到尚未缓冲的位置时，才向池申请 `buffer_capacity` 大小的块并从源填充；
///   - 除最后一块外每个块都是满的，因此偏移到块的映射是简单的整除；
///   - 关闭时丢弃源并把全部块归还给池，之后任何游标读取都返回
///     [`CursorProviderReleased`](StreamingError::CursorProviderReleased)；
/// - **契约 (What)**：
///   - 单流缓冲总量不超过 `max_buffer_size`，超出时返回 [`BufferSizeExceeded`](StreamingError::BufferSizeExceeded)；
///   - 池拒绝申请时返回 [`Pool`](StreamingError::Pool)，已缓冲的数据仍可读取。
pub struct InMemoryCursorStreamProvider {
    state: ProviderState,
    shared: Arc<StreamBuffer>,
}

impl InMemoryCursorStreamProvider {
    pub fn new<R>(source: R, pool: BoundedBufferPool, options: ProviderOptions) -> Self
    where
        R: Read + Send + 'static,
    {
        let state = ProviderState::new(options.location, options.track_close);
        let shared = Arc::new(StreamBuffer {
            key: state.key(),
            pool,
            buffer_capacity: options.buffer_capacity,
            max_buffer_size: options.max_buffer_size,
            statistics: options.statistics,
            inner: Mutex::new(StreamChunks {
                source: Some(Box::new(source)),
                chunks: Vec::new(),
                len: 0,
                pooled: 0,
                pending: None,
                eof: false,
                overflowed: false,
                released: false,
            }),
        });
        Self { state, shared }
    }

    /// 已从源读入并缓冲的字节数。
    pub fn buffered_len(&self) -> usize {
        self.shared.inner.lock().len
    }

    /// 当前从池中租借的字节数。
    pub fn pooled_bytes(&self) -> usize {
        self.shared.inner.lock().pooled
    }
}

impl ProviderLifecycle for InMemoryCursorStreamProvider {
    fn key(&self) -> ProviderKey {
        self.state.key()
    }

    fn close(&self) {
        if self.state.mark_closed() {
            let released = self.shared.release();
            debug!(provider = %self.state.key(), released_bytes = released, "byte cursor provider closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn originating_location(&self) -> Option<&ComponentLocation> {
        self.state.location()
    }
}

impl CursorProvider for InMemoryCursorStreamProvider {
    type Cursor = ByteCursor;

    fn open_cursor(&self) -> Result<ByteCursor> {
        self.state.ensure_open()?;
        Ok(ByteCursor {
            shared: Arc::clone(&self.shared),
            position: 0,
            released: false,
        })
    }
}

impl fmt::Debug for InMemoryCursorStreamProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCursorStreamProvider")
            .field("state", &self.state)
            .field("buffered_len", &self.buffered_len())
            .finish()
    }
}

struct StreamBuffer {
    key: ProviderKey,
    pool: BoundedBufferPool,
    buffer_capacity: usize,
    max_buffer_size: usize,
    statistics: Option<Arc<StreamingStatistics>>,
    inner: Mutex<StreamChunks>,
}

struct StreamChunks {
    source: Option<Box<dyn Read + Send>>,
    chunks: Vec<PooledBuffer>,
    len: usize,
    pooled: usize,
    pending: Option<u8>,
    eof: bool,
    overflowed: bool,
    released: bool,
}

impl StreamBuffer {
    /// 从 `position` 起复制数据到 `dst`，必要时先从源补充缓冲。返回 0 表示已到流末尾。
    fn read_at(&self, position: u64, dst: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.released {
            return Err(StreamingError::CursorProviderReleased { key: self.key });
        }
        if dst.is_empty() {
            return Ok(0);
        }
        let Ok(start) = usize::try_from(position) else {
            return Ok(0);
        };
        while inner.len <= start && !inner.eof {
            self.fill_next(&mut inner)?;
        }
        Ok(inner.copy_out(start, dst, self.buffer_capacity))
    }

    /// 把源读到末尾并返回总长度。
    fn total_len(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.released {
            return Err(StreamingError::CursorProviderReleased { key: self.key });
        }
        while !inner.eof {
            self.fill_next(&mut inner)?;
        }
        Ok(inner.len)
    }

    fn fill_next(&self, inner: &mut StreamChunks) -> Result<()> {
        if inner.overflowed {
            return Err(StreamingError::BufferSizeExceeded {
                max: self.max_buffer_size,
            });
        }
        let needs_block = inner.chunks.last().is_none_or(|block| block.is_full());
        if needs_block {
            // 源确有数据时才申请新块。
            let Some(first) = self.next_byte(inner)? else {
                return Ok(());
            };
            let remaining = self.max_buffer_size.saturating_sub(inner.len);
            if remaining == 0 {
                inner.overflowed = true;
                return Err(StreamingError::BufferSizeExceeded {
                    max: self.max_buffer_size,
                });
            }
            let capacity = self.buffer_capacity.min(remaining);
            let mut block = match self.pool.allocate(capacity) {
                Ok(block) => block,
                Err(err) => {
                    inner.pending = Some(first);
                    return Err(err.into());
                }
            };
            block.put_slice(&[first]);
            inner.len += 1;
            inner.chunks.push(block);
            inner.pooled += capacity;
            if let Some(stats) = &self.statistics {
                stats.add_pooled_bytes(capacity);
            }
        }

        let StreamChunks {
            source,
            chunks,
            len,
            eof,
            ..
        } = &mut *inner;
        let (Some(reader), Some(block)) = (source.as_mut(), chunks.last_mut()) else {
            *eof = true;
            return Ok(());
        };
        let before = block.len();
        let outcome = block.fill_from(reader);
        *len += block.len() - before;
        outcome?;
        if !block.is_full() {
            *eof = true;
            *source = None;
        }
        Ok(())
    }

    /// 从源取下一个字节；池拒绝申请时暂存的字节优先返回。`None` 表示源已结束。
    fn next_byte(&self, inner: &mut StreamChunks) -> Result<Option<u8>> {
        if let Some(byte) = inner.pending.take() {
            return Ok(Some(byte));
        }
        let Some(reader) = inner.source.as_mut() else {
            inner.eof = true;
            return Ok(None);
        };
        let mut byte = [0u8; 1];
        loop {
            match reader.read(&mut byte) {
                Ok(0) => {
                    inner.eof = true;
                    inner.source = None;
                    return Ok(None);
                }
                Ok(_) => return Ok(Some(byte[0])),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// 释放源与全部缓冲块，返回归还给池的字节数；重复调用返回 0。
    fn release(&self) -> usize {
        let (chunks, pooled) = {
            let mut inner = self.inner.lock();
            if inner.released {
                return 0;
            }
            inner.released = true;
            inner.eof = true;
            inner.source = None;
            inner.pending = None;
            (mem::take(&mut inner.chunks), mem::take(&mut inner.pooled))
        };
        drop(chunks);
        if let Some(stats) = &self.statistics {
            stats.sub_pooled_bytes(pooled);
        }
        pooled
    }
}

impl StreamChunks {
    fn copy_out(&self, mut position: usize, dst: &mut [u8], block_capacity: usize) -> usize {
        let mut written = 0;
        while written < dst.len() && position < self.len {
            let block = &self.chunks[position / block_capacity];
            let available = &block.as_slice()[position % block_capacity..];
            let n = available.len().min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&available[..n]);
            written += n;
            position += n;
        }
        written
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.released
            && let Some(stats) = &self.statistics
        {
            stats.sub_pooled_bytes(inner.pooled);
        }
    }
}

/// 字节流游标：在共享缓冲上独立定位的读取器。
///
/// 实现 [`Read`] 与 [`Seek`]；`SeekFrom::End` 会把源读到末尾以确定总长度。
pub struct ByteCursor {
    shared: Arc<StreamBuffer>,
    position: u64,
    released: bool,
}

impl ByteCursor {
    pub fn position(&self) -> u64 {
        self.position
    }

    /// 移动到绝对位置。越过末尾的位置合法，之后的读取返回 0。
    pub fn seek_to(&mut self, position: u64) {
        self.position = position;
    }

    /// 释放游标；之后的读取返回 [`CursorReleased`](StreamingError::CursorReleased)。
    pub fn release(&mut self) {
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn ensure_usable(&self) -> io::Result<()> {
        if self.released {
            Err(StreamingError::CursorReleased.into())
        } else {
            Ok(())
        }
    }
}

impl Read for ByteCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_usable()?;
        let read = self.shared.read_at(self.position, buf)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for ByteCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ensure_usable()?;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => (self.shared.total_len()? as u64).checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            ));
        };
        self.position = target;
        Ok(target)
    }
}

impl fmt::Debug for ByteCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteCursor")
            .field("provider", &self.shared.key)
            .field("position", &self.position)
            .field("released", &self.released)
            .finish()
    }
}
