#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use courier::{
    queue::Backend, ClientOptions, ConnectionState, Message, Publisher, QueueClient, Subscription,
};
use tokio::sync::mpsc;

/// Короткие паузы, чтобы переподключение укладывалось в тест.
pub fn fast_options() -> ClientOptions {
    ClientOptions {
        service_name: "courier-tests".into(),
        reconnect_delay: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(500),
    }
}

/// Подписка, пересылающая доставки в канал.
pub fn forwarding(topic: &str) -> (Subscription, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = Subscription::from_fn(topic, move |_ctx, _span, message| {
        let tx = tx.clone();
        async move {
            tx.send(message)?;
            Ok(())
        }
    });
    (subscription, rx)
}

pub async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Bytes> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
        .map(Message::into_body)
}

/// Убеждается, что за короткое время ничего не пришло.
pub async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Message>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected delivery: {extra:?}");
}

/// Разрывает соединение и ждёт, пока клиент заметит это и подключится снова.
pub async fn await_reconnect<B: Backend>(
    client: &QueueClient<B>,
    disconnect: impl FnOnce(),
) {
    let mut changes = client.state_changes();
    changes.borrow_and_update();
    disconnect();

    tokio::time::timeout(
        Duration::from_secs(2),
        changes.wait_for(|state| *state != ConnectionState::Connected),
    )
    .await
    .expect("disconnect was not observed")
    .expect("state channel closed");
    assert!(client.wait_connected(Duration::from_secs(2)).await);
}

/// Повторяет проверку, пока она не станет истинной или не выйдет время.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Эхо-ответчик: публикует тело запроса обратно в `reply_to`.
pub fn echo<B: Backend>(
    topic: &str,
    client: &Arc<QueueClient<B>>,
) -> Subscription {
    let responder = Arc::downgrade(client);
    Subscription::from_fn(topic, move |ctx, _span, message| {
        let responder = responder.clone();
        async move {
            if let Some(client) = responder.upgrade() {
                if message.expects_reply() {
                    let reply_to = message.reply_to().to_string();
                    client.publish(&ctx, &reply_to, message.into_body()).await?;
                }
            }
            Ok(())
        }
    })
}

/// Считает одновременно работающие обработчики и запоминает пик.
#[derive(Clone, Default)]
pub struct InFlight {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

/// Отметка работающего обработчика; снимается при drop, в том числе когда
/// обработчик прерван.
pub struct InFlightGuard {
    flight: InFlight,
}

impl InFlight {
    pub fn enter(&self) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            flight: self.clone(),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Сколько обработчиков дошли до конца.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl InFlightGuard {
    pub fn finish(self) {
        self.flight.finished.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flight.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Подписка, обработчик которой работает `delay` под учётом `flight`.
pub fn slow(
    topic: &str,
    delay: Duration,
    flight: &InFlight,
) -> Subscription {
    let flight = flight.clone();
    Subscription::from_fn(topic, move |_ctx, _span, _message| {
        let flight = flight.clone();
        async move {
            let guard = flight.enter();
            tokio::time::sleep(delay).await;
            guard.finish();
            Ok(())
        }
    })
}
