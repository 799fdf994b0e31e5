//! Цикл потребителя одной подписки.
//!
//! Для каждой доставки: восстановить удалённого родителя из заголовков,
//! открыть дочерний span `queue.consume`, подтвердить доставку в момент,
//! который задаёт поток, и вызвать обработчик. Обработчик выполняется
//! внутри задачи потребителя: остановка потребителя прерывает и его, а
//! паника обработчика перехватывается и не останавливает цикл.

use std::{panic::AssertUnwindSafe, sync::Arc};

use courier_error::QueueError;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{log_queue_error, AckTiming, Delivery, DeliveryStream, Subscription};
use crate::telemetry::{Context, Tracer};

pub(crate) const CONSUME_SPAN: &str = "queue.consume";

/// Чем закончился цикл потребителя.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumerExit {
    /// Очередь закрывается
    Shutdown,
    /// Брокер закрыл поток доставок
    StreamEnded,
}

pub(crate) async fn run_consumer(
    subscription: Arc<Subscription>,
    mut deliveries: Box<dyn DeliveryStream>,
    tracer: Arc<dyn Tracer>,
    mut shutdown: watch::Receiver<bool>,
) -> ConsumerExit {
    let topic = subscription.topic.as_str();
    let timing = deliveries.ack_timing();
    debug!(topic, ?timing, "consumer started");

    let exit = loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closing| *closing) => break ConsumerExit::Shutdown,
            next = deliveries.next() => match next {
                Some(delivery) => delivery,
                None => break ConsumerExit::StreamEnded,
            },
        };

        process(&subscription, delivery.as_ref(), timing, tracer.as_ref()).await;
    };

    debug!(topic, ?exit, "consumer stopped");
    exit
}

async fn process(
    subscription: &Subscription,
    delivery: &dyn Delivery,
    timing: AckTiming,
    tracer: &dyn Tracer,
) {
    let topic = subscription.topic.as_str();
    let background = Context::background();

    let parent = tracer.extract(&background, delivery.headers());
    let (ctx, span) = tracer.start_from_span(&background, &parent, CONSUME_SPAN);
    span.set_attribute("messaging.destination", topic.to_string());

    if timing == AckTiming::BeforeCallback {
        acknowledge(topic, delivery).await;
    }

    let handled = subscription
        .handler
        .handle(ctx, span.clone(), delivery.message());
    let failure = match AssertUnwindSafe(handled).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(QueueError::callback(topic, format!("{err:#}"))),
        Err(panic) => Some(QueueError::callback(
            topic,
            format!("handler panicked: {}", panic_message(panic.as_ref())),
        )),
    };

    match failure {
        None => trace!(topic, "message handled"),
        Some(err) => {
            log_queue_error(&err, "message handler failed");
            span.record_error(&err);
        }
    }

    if timing == AckTiming::AfterCallback {
        acknowledge(topic, delivery).await;
    }

    span.end();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

async fn acknowledge(
    topic: &str,
    delivery: &dyn Delivery,
) {
    // канал мог закрыться вместе с соединением; брокер доставит повторно
    if let Err(err) = delivery.ack().await {
        debug!(topic, error = %err, "ack failed");
    }
}
