use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{Handler, HandlerId};

/// Набор обработчиков с одинаковым порядком.
///
/// Все обработчики группы запускаются одновременно; следующая группа ждёт
/// завершения текущей.
pub(crate) struct HandlerGroup<M> {
    order: i32,
    handlers: Mutex<FxHashMap<HandlerId, Arc<Handler<M>>>>,
}

impl<M: Send + Sync + 'static> HandlerGroup<M> {
    pub(crate) fn new(order: i32) -> Self {
        Self {
            order,
            handlers: Mutex::new(FxHashMap::default()),
        }
    }

    pub(crate) fn order(&self) -> i32 {
        self.order
    }

    /// Добавляет обработчик. Возвращает `false`, если обработчик с таким же
    /// идентификатором уже есть в группе.
    pub(crate) fn try_add(
        &self,
        handler: Arc<Handler<M>>,
    ) -> bool {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&handler.id()) {
            return false;
        }
        handlers.insert(handler.id(), handler);
        true
    }

    /// Удаляет именно этот экземпляр обработчика (по указателю), чтобы
    /// освобождённая подписка не сняла чужую регистрацию с тем же id.
    pub(crate) fn remove(
        &self,
        handler: &Arc<Handler<M>>,
    ) -> bool {
        let mut handlers = self.handlers.lock();
        match handlers.get(&handler.id()) {
            Some(current) if Arc::ptr_eq(current, handler) => {
                handlers.remove(&handler.id());
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Дописывает текущих обработчиков в `out`.
    pub(crate) fn snapshot_into(
        &self,
        out: &mut Vec<Arc<Handler<M>>>,
    ) {
        out.extend(self.handlers.lock().values().cloned());
    }

    /// Освобождает всех обработчиков и очищает группу.
    pub(crate) fn dispose(&self) {
        let drained: Vec<_> = self.handlers.lock().drain().map(|(_, h)| h).collect();
        for handler in drained {
            handler.dispose();
        }
    }
}
