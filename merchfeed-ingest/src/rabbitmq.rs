use std::future::Future;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, Consumer};
use log::debug;
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::handler::HandlerError;

#[derive(Debug, Error, Diagnostic)]
pub enum ConsumeError {
    #[error("can't handle message")]
    Handler(#[source] HandlerError),

    #[error("can't receive delivery")]
    Delivery(#[source] lapin::Error),

    #[error("can't ack message")]
    Ack(#[source] lapin::Error),

    #[error("can't nack message")]
    Nack(#[source] lapin::Error),
}

/// AMQP adapter: publishes messages to an exchange and consumes deliveries
/// with manual acknowledgement.
pub struct RabbitMq {
    channel: Channel,
    exchange: String,
    cancel: CancellationToken,
    consumer_task: Option<JoinHandle<()>>,
}

impl RabbitMq {
    pub async fn new(
        connection: &Connection,
        exchange: String,
        cancel: CancellationToken,
    ) -> Result<Self, lapin::Error> {
        let channel = connection.create_channel().await?;

        Ok(Self {
            channel,
            exchange,
            cancel,
            consumer_task: None,
        })
    }

    /// Publishes a persistent json message to `routing_key` on the adapter's
    /// exchange.
    pub async fn publish(&self, routing_key: &str, message: &[u8]) -> Result<(), lapin::Error> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                message,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }

    /// Starts consuming `queue` on a background task, passing each delivery
    /// body to `handler`. Successfully handled deliveries are acked; handler
    /// failures are nacked without requeue so poison messages leave through
    /// the dead-letter topology. Returns the channel on which handling and
    /// acknowledgement errors surface.
    ///
    /// The task runs until the adapter's cancellation token fires or the
    /// broker closes the delivery stream.
    pub async fn consume<H, Fut>(
        &mut self,
        queue: &str,
        handler: H,
    ) -> Result<mpsc::Receiver<ConsumeError>, lapin::Error>
    where
        H: Fn(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let (errors_tx, errors_rx) = mpsc::channel(1);
        let cancel = self.cancel.clone();
        self.consumer_task = Some(tokio::spawn(consume_messages(
            consumer, cancel, errors_tx, handler,
        )));

        Ok(errors_rx)
    }

    /// Waits for the consumer task to wind down after cancellation. The
    /// process supervisor awaits this before closing the broker connection.
    pub async fn done(&mut self) {
        if let Some(task) = self.consumer_task.take() {
            let _ = task.await;
        }
    }
}

async fn consume_messages<H, Fut>(
    mut consumer: Consumer,
    cancel: CancellationToken,
    errors: mpsc::Sender<ConsumeError>,
    handler: H,
) where
    H: Fn(Vec<u8>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    loop {
        let mut delivery = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("consumer cancelled");
                return;
            }
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    if push_error(&cancel, &errors, ConsumeError::Delivery(err)).await.is_err() {
                        return;
                    }
                    continue;
                }
                None => {
                    debug!("delivery stream closed by broker");
                    return;
                }
            },
        };

        let body = std::mem::take(&mut delivery.data);
        match handler(body).await {
            Ok(()) => {
                if let Err(err) = delivery.acker.ack(BasicAckOptions::default()).await
                    && push_error(&cancel, &errors, ConsumeError::Ack(err)).await.is_err()
                {
                    return;
                }
            }
            Err(err) => {
                if push_error(&cancel, &errors, ConsumeError::Handler(err)).await.is_err() {
                    return;
                }

                let options = BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                };
                if let Err(err) = delivery.acker.nack(options).await
                    && push_error(&cancel, &errors, ConsumeError::Nack(err)).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn push_error(
    cancel: &CancellationToken,
    errors: &mpsc::Sender<ConsumeError>,
    error: ConsumeError,
) -> Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        sent = errors.send(error) => sent.map_err(|_| ()),
    }
}
