use std::sync::Arc;

use log::{debug, error};
use miette::Diagnostic;
use thiserror::Error;

use crate::commander::ParseCommand;
use crate::parser::{ParseError, ParseFeed, error_chain};
use crate::rabbitmq::RabbitMq;

#[derive(Debug, Error, Diagnostic)]
pub enum HandlerError {
    #[error("can't decode parse command")]
    BadCommand(#[source] serde_json::Error),

    #[error("parsing failed")]
    Parsing(#[source] ParseError),
}

/// Dispatches parse commands from the broker to the parser.
pub struct Handler<P> {
    parser: Arc<P>,
}

impl<P: ParseFeed + 'static> Handler<P> {
    pub fn new(parser: P) -> Self {
        Self {
            parser: Arc::new(parser),
        }
    }

    /// Subscribes to `queue` and handles deliveries until the broker adapter
    /// is cancelled. Returns once the subscription is established; handling
    /// continues in the background. Errors surfaced by the adapter are
    /// logged from a best-effort task.
    pub async fn start(&self, rmq: &mut RabbitMq, queue: &str) -> Result<(), lapin::Error> {
        let parser = Arc::clone(&self.parser);

        let mut errors = rmq
            .consume(queue, move |message: Vec<u8>| {
                let parser = Arc::clone(&parser);
                async move {
                    let command: ParseCommand =
                        serde_json::from_slice(&message).map_err(HandlerError::BadCommand)?;

                    debug!("parsing started for shop {}", command.shop_url);
                    parser
                        .parse(&command.shop_url)
                        .await
                        .map_err(HandlerError::Parsing)?;
                    debug!("parsing finished for shop {}", command.shop_url);

                    Ok(())
                }
            })
            .await?;

        tokio::spawn(async move {
            while let Some(err) = errors.recv().await {
                error!("can't handle message: {}", error_chain(&err));
            }
        });

        Ok(())
    }
}
