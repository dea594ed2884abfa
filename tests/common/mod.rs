//! Общие помощники интеграционных тестов.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use mercury::Handler;
use parking_lot::Mutex;

/// Журнал событий обработчиков в порядке их наступления.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        event: impl Into<String>,
    ) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn position(
        &self,
        event: &str,
    ) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }
}

/// Обработчик, записывающий `name` в журнал после задержки `delay`.
pub fn recording<M: Send + Sync + 'static>(
    journal: &Journal,
    name: &'static str,
    delay: Duration,
) -> Handler<M> {
    let journal = journal.clone();
    Handler::unit(move || {
        let journal = journal.clone();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            journal.push(name);
            Ok(())
        }
    })
}

/// Обработчик, увеличивающий счётчик при каждом вызове.
pub fn counting<M: Send + Sync + 'static>(counter: &Arc<AtomicUsize>) -> Handler<M> {
    let counter = Arc::clone(counter);
    Handler::sync(move |_: &M| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}
