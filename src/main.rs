use std::{
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Context as _;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use courier::{
    broker::{ExchangeDialer, StreamDialer},
    init_logging,
    queue::Backend,
    BackendKind, Context, ExchangeBackend, MemoryExchangeBroker, MemoryStreamBroker, Publisher,
    Queue, QueueClient, Settings, StreamBackend, Subscriber, Subscription, TraceContextTracer,
};
use tokio::sync::mpsc;
use tracing::info;

/// Echo request/reply and publish/subscribe against a broker.
#[derive(Debug, Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Settings file (toml, yaml or json)
    #[arg(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,
    /// Broker dialect; overrides the settings
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
    /// Where the broker lives
    #[arg(long, value_enum, default_value_t = BrokerArg::InProcess)]
    broker: BrokerArg,
    /// Number of requests and events to send
    #[arg(long, default_value_t = 3)]
    count: usize,
    /// Topic prefix; must be covered by the stream subjects
    #[arg(long, default_value = "courier")]
    prefix: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Exchange,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BrokerArg {
    /// Broker inside this process
    InProcess,
    /// Broker at the URL from the settings
    Remote,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Exchange => BackendKind::Exchange,
            BackendArg::Stream => BackendKind::Stream,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings =
        Settings::load_from(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(backend) = cli.backend {
        settings.backend = backend.into();
        settings.validate()?;
    }

    let logging = init_logging(settings.logging.clone())
        .map_err(|err| anyhow::anyhow!("failed to initialize logging: {err}"))?;

    let result: anyhow::Result<()> = async {
        match settings.backend {
            BackendKind::Exchange => {
                let dialer = exchange_dialer(cli.broker)?;
                let backend =
                    ExchangeBackend::new(dialer, &settings.exchange, &settings.service_name);
                run_demo(backend, &settings, &cli).await
            }
            BackendKind::Stream => {
                let dialer = stream_dialer(cli.broker)?;
                let backend = StreamBackend::new(dialer, &settings.stream, &settings.service_name);
                run_demo(backend, &settings, &cli).await
            }
        }
    }
    .await;

    logging.shutdown();
    result
}

fn exchange_dialer(broker: BrokerArg) -> anyhow::Result<Arc<dyn ExchangeDialer>> {
    match broker {
        BrokerArg::InProcess => Ok(Arc::new(MemoryExchangeBroker::new())),
        #[cfg(feature = "amqp")]
        BrokerArg::Remote => Ok(Arc::new(courier::broker::LapinDialer)),
        #[cfg(not(feature = "amqp"))]
        BrokerArg::Remote => anyhow::bail!("remote exchange broker requires the `amqp` feature"),
    }
}

fn stream_dialer(broker: BrokerArg) -> anyhow::Result<Arc<dyn StreamDialer>> {
    match broker {
        BrokerArg::InProcess => Ok(Arc::new(MemoryStreamBroker::new())),
        #[cfg(feature = "nats")]
        BrokerArg::Remote => Ok(Arc::new(courier::broker::NatsDialer)),
        #[cfg(not(feature = "nats"))]
        BrokerArg::Remote => anyhow::bail!("remote stream broker requires the `nats` feature"),
    }
}

async fn run_demo<B: Backend>(
    backend: B,
    settings: &Settings,
    cli: &Cli,
) -> anyhow::Result<()> {
    let tracer = Arc::new(TraceContextTracer::new(&settings.service_name));
    let client = Arc::new(QueueClient::connect(backend, tracer, settings.client_options()).await?);
    let ctx = Context::background();

    let echo_topic = format!("{}.echo", cli.prefix);
    let events_topic = format!("{}.events", cli.prefix);

    // ответчик держит слабую ссылку, чтобы подписка не продлевала жизнь клиенту
    let responder: Weak<QueueClient<B>> = Arc::downgrade(&client);
    client
        .subscribe(
            &ctx,
            Subscription::from_fn(echo_topic.clone(), move |ctx, _span, message| {
                let responder = responder.clone();
                async move {
                    let Some(client) = responder.upgrade() else {
                        return Ok(());
                    };
                    if message.expects_reply() {
                        let reply_to = message.reply_to().to_string();
                        client.publish(&ctx, &reply_to, message.into_body()).await?;
                    }
                    Ok(())
                }
            }),
        )
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe(
            &ctx,
            Subscription::from_fn(events_topic.clone(), move |_ctx, _span, message| {
                let tx = tx.clone();
                async move {
                    tx.send(message.into_body())?;
                    Ok(())
                }
            }),
        )
        .await?;

    for i in 0..cli.count {
        let body = Bytes::from(format!("ping {i}"));
        let reply = client
            .request(&ctx.with_timeout(Duration::from_secs(5)), &echo_topic, body)
            .await?;
        info!(topic = %echo_topic, reply = %String::from_utf8_lossy(&reply), "echo reply");
    }

    for i in 0..cli.count {
        client
            .publish(&ctx, &events_topic, Bytes::from(format!("event {i}")))
            .await?;
    }
    for _ in 0..cli.count {
        let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .context("event was not delivered in time")?
            .context("event subscription stopped")?;
        info!(topic = %events_topic, body = %String::from_utf8_lossy(&body), "event received");
    }

    client.close().await?;
    Ok(())
}
