use std::{fmt, mem, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use super::{CursorProvider, ProviderKey, ProviderLifecycle, ProviderOptions, ProviderState};
use crate::{
    error::{Result, StreamingError},
    location::ComponentLocation,
};

/// 可重复遍历的对象流提供者。
///
/// # 教案式说明
/// - **意图 (Why)**：与字节流相同的生命周期语义，只是游标遍历的是对象而非字节；
/// - **逻辑 (How)**：对象在游标第一次走到对应位置时才从源迭代器取出并缓存，
///   之后所有游标读取同一份缓存；
/// - **契约 (What)**：
///   - 缓存实例数不超过 `max_in_memory_instances`，超出时游标返回
///     [`InstanceLimitExceeded`](StreamingError::InstanceLimitExceeded)；
///   - 游标产出的是缓存元素的克隆，`T` 通常应是廉价克隆的类型（例如 `Arc<_>`）。
pub struct InMemoryCursorIteratorProvider<T> {
    state: ProviderState,
    shared: Arc<ObjectBuffer<T>>,
}

impl<T> InMemoryCursorIteratorProvider<T>
where
    T: Clone + Send + 'static,
{
    pub fn new<I>(source: I, options: ProviderOptions) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let state = ProviderState::new(options.location, options.track_close);
        let shared = Arc::new(ObjectBuffer {
            key: state.key(),
            max_instances: options.max_in_memory_instances,
            inner: Mutex::new(ObjectItems {
                source: Some(Box::new(source.into_iter())),
                items: Vec::new(),
                exhausted: false,
                overflowed: false,
                released: false,
            }),
        });
        Self { state, shared }
    }

    /// 已缓存的实例数。
    pub fn buffered_len(&self) -> usize {
        self.shared.inner.lock().items.len()
    }
}

impl<T: Send> ProviderLifecycle for InMemoryCursorIteratorProvider<T> {
    fn key(&self) -> ProviderKey {
        self.state.key()
    }

    fn close(&self) {
        if self.state.mark_closed() {
            let released = self.shared.release();
            debug!(provider = %self.state.key(), released_items = released, "object cursor provider closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn originating_location(&self) -> Option<&ComponentLocation> {
        self.state.location()
    }
}

impl<T: Clone + Send> CursorProvider for InMemoryCursorIteratorProvider<T> {
    type Cursor = ObjectCursor<T>;

    fn open_cursor(&self) -> Result<ObjectCursor<T>> {
        self.state.ensure_open()?;
        Ok(ObjectCursor {
            shared: Arc::clone(&self.shared),
            position: 0,
            released: false,
        })
    }
}

impl<T> fmt::Debug for InMemoryCursorIteratorProvider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCursorIteratorProvider")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

struct ObjectBuffer<T> {
    key: ProviderKey,
    max_instances: usize,
    inner: Mutex<ObjectItems<T>>,
}

struct ObjectItems<T> {
    source: Option<Box<dyn Iterator<Item = T> + Send>>,
    items: Vec<T>,
    exhausted: bool,
    overflowed: bool,
    released: bool,
}

impl<T: Clone> ObjectBuffer<T> {
    fn get(&self, position: usize) -> Result<Option<T>> {
        let mut inner = self.inner.lock();
        if inner.released {
            return Err(StreamingError::CursorProviderReleased { key: self.key });
        }
        while inner.items.len() <= position && !inner.exhausted {
            if inner.overflowed {
                return Err(StreamingError::InstanceLimitExceeded {
                    max: self.max_instances,
                });
            }
            let next = inner.source.as_mut().and_then(|source| source.next());
            match next {
                Some(item) => {
                    if inner.items.len() >= self.max_instances {
                        inner.overflowed = true;
                        return Err(StreamingError::InstanceLimitExceeded {
                            max: self.max_instances,
                        });
                    }
                    inner.items.push(item);
                }
                None => {
                    inner.exhausted = true;
                    inner.source = None;
                }
            }
        }
        Ok(inner.items.get(position).cloned())
    }
}

impl<T> ObjectBuffer<T> {
    fn release(&self) -> usize {
        let (items, source) = {
            let mut inner = self.inner.lock();
            if inner.released {
                return 0;
            }
            inner.released = true;
            inner.exhausted = true;
            (mem::take(&mut inner.items), inner.source.take())
        };
        drop(source);
        items.len()
    }
}

/// 对象流游标。
///
/// 作为 `Iterator<Item = Result<T>>` 使用：`None` 表示遍历结束，`Some(Err(_))` 表示游标或提供者
/// 已不可用，此时位置不前进。
pub struct ObjectCursor<T> {
    shared: Arc<ObjectBuffer<T>>,
    position: usize,
    released: bool,
}

impl<T> ObjectCursor<T> {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn seek_to(&mut self, position: usize) {
        self.position = position;
    }

    pub fn release(&mut self) {
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl<T: Clone> Iterator for ObjectCursor<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.released {
            return Some(Err(StreamingError::CursorReleased));
        }
        match self.shared.get(self.position) {
            Ok(Some(item)) => {
                self.position += 1;
                Some(Ok(item))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl<T> fmt::Debug for ObjectCursor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCursor")
            .field("provider", &self.shared.key)
            .field("position", &self.position)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn cursors_replay_the_same_items() {
        let provider = InMemoryCursorIteratorProvider::new(1..=4, ProviderOptions::default());
        let first: Vec<i32> = provider
            .open_cursor()
            .expect("打开游标")
            .collect::<Result<_>>()
            .expect("遍历");
        let second: Vec<i32> = provider
            .open_cursor()
            .expect("再次打开")
            .collect::<Result<_>>()
            .expect("再次遍历");
        assert_eq!(first, vec![1, 2, 3, 4]);
        assert_eq!(first, second);
    }

    #[test]
    fn seek_rewinds_cursor() {
        let provider = InMemoryCursorIteratorProvider::new(
            vec!["a".to_owned(), "b".to_owned()],
            ProviderOptions::default(),
        );
        let mut cursor = provider.open_cursor().expect("打开游标");
        assert_eq!(cursor.next().transpose().expect("读取").as_deref(), Some("a"));
        cursor.seek_to(0);
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.next().transpose().expect("读取").as_deref(), Some("a"));
    }

    #[test]
    fn instance_limit_is_enforced() {
        let provider = InMemoryCursorIteratorProvider::new(
            0..100,
            ProviderOptions::default().with_max_in_memory_instances(3),
        );
        let mut cursor = provider.open_cursor().expect("打开游标");
        for expected in 0..3 {
            assert_eq!(cursor.next().transpose().expect("未超限"), Some(expected));
        }
        let err = cursor.next().expect("应有结果").expect_err("超过实例上限");
        assert!(matches!(err, StreamingError::InstanceLimitExceeded { max: 3 }));
    }

    #[test]
    fn exceeded_limit_stops_pulling_from_source() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let provider = InMemoryCursorIteratorProvider::new(
            (0..100).inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            ProviderOptions::default().with_max_in_memory_instances(2),
        );
        let mut cursor = provider.open_cursor().expect("打开游标");
        cursor.seek_to(2);
        for _ in 0..3 {
            let err = cursor.next().expect("应有结果").expect_err("超过实例上限");
            assert!(matches!(err, StreamingError::InstanceLimitExceeded { max: 2 }));
        }
        assert_eq!(pulled.load(Ordering::SeqCst), 3, "超限后不应继续消耗源");

        let mut replay = provider.open_cursor().expect("再次打开");
        assert_eq!(replay.next().transpose().expect("已缓存的前缀仍可读"), Some(0));
    }

    #[test]
    fn release_fails_open_cursors() {
        let provider = InMemoryCursorIteratorProvider::new(0..10, ProviderOptions::default());
        let mut cursor = provider.open_cursor().expect("打开游标");
        assert!(matches!(cursor.next(), Some(Ok(0))));
        provider.close();
        assert!(matches!(
            cursor.next(),
            Some(Err(StreamingError::CursorProviderReleased { .. }))
        ));

        let mut detached = ObjectCursor {
            shared: Arc::clone(&cursor.shared),
            position: 0,
            released: false,
        };
        detached.release();
        assert!(matches!(detached.next(), Some(Err(StreamingError::CursorReleased))));
    }
}
