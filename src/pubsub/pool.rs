use std::{
    fmt, mem,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use super::{Handler, HandlerFuture, HandlerId};

/// Количество классов ёмкости: 1, 2, 4, ..., 2^(BUCKETS - 1).
const BUCKETS: usize = 16;

/// Пул переиспользуемых буферов `Vec<T>`.
///
/// Буферы группируются по классу ёмкости (степени двойки). Каждый класс
/// хранит не больше `max_buffers` буферов, буферы с ёмкостью больше
/// `max_capacity` не сохраняются. Буфер очищается до возврата в пул.
pub struct BufferPool<T> {
    buckets: Vec<Mutex<Vec<Vec<T>>>>,
    max_buffers: usize,
    max_capacity: usize,
    rented: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// Счётчики пула.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub rented: u64,
    pub reused: u64,
    pub discarded: u64,
    pub idle: usize,
}

/// Буфер, взятый из пула. Возвращается в пул при уничтожении, в том числе
/// при раскрутке стека.
pub struct Pooled<T> {
    buf: Vec<T>,
    pool: Arc<BufferPool<T>>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl<T> BufferPool<T> {
    pub fn new(
        max_buffers: usize,
        max_capacity: usize,
    ) -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
            max_buffers,
            max_capacity,
            rented: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Берёт пустой буфер ёмкостью не меньше `min_capacity`.
    pub fn rent(
        self: &Arc<Self>,
        min_capacity: usize,
    ) -> Pooled<T> {
        self.rented.fetch_add(1, Ordering::Relaxed);
        let class = class_for_request(min_capacity);

        let reused = self
            .buckets
            .get(class)
            .and_then(|bucket| bucket.lock().pop());

        let buf = match reused {
            Some(buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => Vec::with_capacity(min_capacity.max(1).next_power_of_two()),
        };

        Pooled {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Сколько буферов сейчас лежит в пуле.
    pub fn idle(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.rented.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            idle: self.idle(),
        }
    }

    fn give_back(
        &self,
        mut buf: Vec<T>,
    ) {
        // Элементы уничтожаются до захвата блокировки корзины.
        buf.clear();

        let capacity = buf.capacity();
        if capacity == 0 || capacity > self.max_capacity {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(bucket) = self.buckets.get(class_for_capacity(capacity)) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut bucket = bucket.lock();
        if bucket.len() < self.max_buffers {
            bucket.push(buf);
        } else {
            drop(bucket);
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Класс, любой буфер которого вмещает `n` элементов: ceil(log2(n)).
fn class_for_request(n: usize) -> usize {
    n.max(1).next_power_of_two().trailing_zeros() as usize
}

/// Класс, в который кладётся буфер ёмкости `capacity`: floor(log2(capacity)).
fn class_for_capacity(capacity: usize) -> usize {
    (usize::BITS - 1 - capacity.leading_zeros()) as usize
}

////////////////////////////////////////////////////////////////////////////////
// Пулы снимков брокера
////////////////////////////////////////////////////////////////////////////////

/// Граница группы в плоском снимке обработчиков.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GroupBound {
    pub(crate) order: i32,
    pub(crate) end: usize,
}

/// Запущенный обработчик внутри группы.
pub(crate) struct InFlight {
    pub(crate) handler: HandlerId,
    pub(crate) future: HandlerFuture,
}

/// Пулы буферов, используемые при публикации: снимок обработчиков, границы
/// групп и слоты запущенных future.
///
/// Один экземпляр разделяется всеми брокерами одного типа сообщения.
pub struct SnapshotPools<M> {
    pub(crate) handlers: Arc<BufferPool<Arc<Handler<M>>>>,
    pub(crate) bounds: Arc<BufferPool<GroupBound>>,
    pub(crate) inflight: Arc<BufferPool<InFlight>>,
}

impl<M> SnapshotPools<M> {
    pub fn new(
        max_buffers: usize,
        max_capacity: usize,
    ) -> Self {
        Self {
            handlers: Arc::new(BufferPool::new(max_buffers, max_capacity)),
            bounds: Arc::new(BufferPool::new(max_buffers, max_capacity)),
            inflight: Arc::new(BufferPool::new(max_buffers, max_capacity)),
        }
    }

    /// Статистика пула снимков обработчиков.
    pub fn handler_stats(&self) -> PoolStats {
        self.handlers.stats()
    }
}

impl<M> Default for SnapshotPools<M> {
    fn default() -> Self {
        Self::new(16, 1024)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl<T> Deref for Pooled<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let buf = mem::take(&mut self.buf);
        self.pool.give_back(buf);
    }
}

impl<T> fmt::Debug for BufferPool<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_buffers", &self.max_buffers)
            .field("max_capacity", &self.max_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M> fmt::Debug for SnapshotPools<M> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SnapshotPools")
            .field("handlers", &self.handlers.stats())
            .field("bounds", &self.bounds.stats())
            .field("inflight", &self.inflight.stats())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
