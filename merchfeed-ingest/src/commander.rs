//! Client side of the command topology: builds parse commands and publishes
//! them to the routing key the ingest worker consumes from.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rabbitmq::RabbitMq;

/// Command asking the worker to parse one shop's feed.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseCommand {
    pub shop_url: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum CommandError {
    #[error("can't marshal parse command")]
    Encode(#[source] serde_json::Error),

    #[error("can't send parse command")]
    Send(#[source] lapin::Error),
}

/// Sends raw messages somewhere.
#[async_trait]
pub trait SendMessage: Send + Sync {
    async fn send(&self, message: &[u8]) -> Result<(), lapin::Error>;
}

/// Publishes parse commands through a [`SendMessage`] sender.
pub struct ParseCommander<S> {
    sender: S,
}

impl<S: SendMessage> ParseCommander<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    pub async fn send_parse_command(&self, shop_url: &str) -> Result<(), CommandError> {
        let command = ParseCommand {
            shop_url: shop_url.to_owned(),
        };
        let message = serde_json::to_vec(&command).map_err(CommandError::Encode)?;

        self.sender.send(&message).await.map_err(CommandError::Send)
    }
}

/// Sends messages to a fixed routing key through the broker adapter.
pub struct RabbitMqSender<'a> {
    publisher: &'a RabbitMq,
    routing_key: String,
}

impl<'a> RabbitMqSender<'a> {
    pub fn new(publisher: &'a RabbitMq, routing_key: impl Into<String>) -> Self {
        Self {
            publisher,
            routing_key: routing_key.into(),
        }
    }
}

#[async_trait]
impl SendMessage for RabbitMqSender<'_> {
    async fn send(&self, message: &[u8]) -> Result<(), lapin::Error> {
        self.publisher.publish(&self.routing_key, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn parse_command_uses_the_wire_field_name() {
        let command: ParseCommand =
            serde_json::from_str(r#"{"shopUrl": "https://shop.example.com/feed.xml"}"#)
                .expect("can't decode command");
        assert_eq!(command.shop_url, "https://shop.example.com/feed.xml");

        let encoded = serde_json::to_string(&command).expect("can't encode command");
        assert_eq!(
            encoded,
            r#"{"shopUrl":"https://shop.example.com/feed.xml"}"#,
        );
    }

    #[derive(Default)]
    struct RecordingSender {
        messages: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl SendMessage for &RecordingSender {
        async fn send(&self, message: &[u8]) -> Result<(), lapin::Error> {
            self.messages.lock().unwrap().push(message.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn send_parse_command_publishes_json() {
        let sender = RecordingSender::default();
        let commander = ParseCommander::new(&sender);

        commander
            .send_parse_command("https://shop.example.com/feed.xml")
            .await
            .expect("can't send command");

        let messages = sender.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            std::str::from_utf8(&messages[0]).unwrap(),
            r#"{"shopUrl":"https://shop.example.com/feed.xml"}"#,
        );
    }
}
