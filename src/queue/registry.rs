use std::{collections::HashMap, sync::Arc};

use tokio::task::JoinHandle;
use tracing::warn;

use super::Subscription;

/// Идентификатор записи реестра.
pub type SubscriptionId = u64;

/// Реестр подписок и запущенных для них потребителей.
///
/// Подписки живут до закрытия очереди и хранятся в порядке регистрации.
/// Каждой подписке соответствует не больше одной задачи-потребителя.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Vec<(SubscriptionId, Arc<Subscription>)>,
    consumers: HashMap<SubscriptionId, ConsumerTask>,
    next_id: SubscriptionId,
}

pub(crate) struct ConsumerTask {
    pub topic: String,
    pub handle: JoinHandle<()>,
}

impl ConsumerTask {
    /// Прерывает задачу и ждёт её завершения. После возврата обработчик
    /// этой задачи уже не выполняется.
    pub async fn stop(self) {
        self.handle.abort();
        if let Err(err) = self.handle.await {
            if err.is_panic() {
                warn!(topic = %self.topic, "consumer task panicked");
            }
        }
    }
}

impl Registry {
    pub fn register(
        &mut self,
        subscription: Arc<Subscription>,
    ) -> SubscriptionId {
        self.next_id += 1;
        self.entries.push((self.next_id, subscription));
        self.next_id
    }

    /// Подписки в порядке регистрации.
    pub fn entries(&self) -> Vec<(SubscriptionId, Arc<Subscription>)> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Запоминает потребителя подписки и возвращает прежнего, если он был.
    /// Прежнего нужно остановить через [`ConsumerTask::stop`].
    #[must_use]
    pub fn attach(
        &mut self,
        id: SubscriptionId,
        task: ConsumerTask,
    ) -> Option<ConsumerTask> {
        self.consumers.insert(id, task)
    }

    /// Забирает все задачи-потребители.
    pub fn detach_all(&mut self) -> Vec<ConsumerTask> {
        self.consumers.drain().map(|(_, task)| task).collect()
    }

    /// Топики подписок, у которых потребитель сейчас работает.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<(SubscriptionId, String)> = self
            .consumers
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(id, task)| (*id, task.topic.clone()))
            .collect();
        topics.sort_unstable_by_key(|(id, _)| *id);
        topics.into_iter().map(|(_, topic)| topic).collect()
    }
}
