// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NATS JetStream bus client.
//!
//! Streams are asserted per subject (stream name derived from the subject),
//! consumption goes through durable pull consumers, and naks rely on the
//! consumer's ack-wait for redelivery timing.

use super::{AckHandle, BusError, BusMessage, MessageBus, StreamRetention, Subscription};
use crate::config::Config;
use async_nats::jetstream::{self, consumer::PullConsumer};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;

/// JetStream-backed message bus.
pub struct NatsBus {
    client: async_nats::Client,
    js: jetstream::Context,
}

impl NatsBus {
    /// Connect using the bridge configuration (mTLS material included).
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let mut options = async_nats::ConnectOptions::new();

        if config.tls.enable {
            options = options.require_tls(true);
            if let Some(ca) = &config.tls.ca {
                options = options.add_root_certificates(PathBuf::from(ca));
            }
            if let (Some(cert), Some(key)) = (&config.tls.cert, &config.tls.key) {
                options =
                    options.add_client_certificate(PathBuf::from(cert), PathBuf::from(key));
            }
        }

        let client = options
            .connect(&config.bus_url)
            .await
            .map_err(|e| anyhow::anyhow!("connecting to bus {}: {e}", config.bus_url))?;
        let js = jetstream::new(client.clone());

        tracing::info!("Connected to NATS at {}", config.bus_url);
        Ok(Self { client, js })
    }

    /// JetStream stream names cannot contain subject token separators.
    fn stream_name(subject: &str) -> String {
        subject
            .chars()
            .map(|c| match c {
                '.' | '*' | '>' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect()
    }
}

struct NatsAckHandle {
    message: jetstream::Message,
}

#[async_trait]
impl AckHandle for NatsAckHandle {
    async fn ack(&self) -> Result<(), BusError> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Request(format!("ack: {e}")))
    }

    async fn nak(&self) -> Result<(), BusError> {
        self.message
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| BusError::Request(format!("nak: {e}")))
    }
}

struct NatsSubscription {
    consumer: PullConsumer,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn fetch(
        &mut self,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut messages = self
            .consumer
            .batch()
            .max_messages(batch)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| BusError::Request(format!("pull: {e}")))?;

        let mut out = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| BusError::Request(format!("pull next: {e}")))?;
            out.push(BusMessage {
                subject: message.subject.to_string(),
                payload: message.payload.to_vec(),
                handle: std::sync::Arc::new(NatsAckHandle { message }),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let stream = self
            .js
            .get_or_create_stream(jetstream::stream::Config {
                name: Self::stream_name(subject),
                subjects: vec![subject.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Connection(format!("stream for {subject}: {e}")))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                group,
                jetstream::consumer::pull::Config {
                    durable_name: Some(group.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Connection(format!("consumer {group} on {subject}: {e}")))?;

        Ok(Box::new(NatsSubscription { consumer }))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let ack = self
            .js
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Request(format!("publish to {subject}: {e}")))?;
        ack.await
            .map_err(|e| BusError::Request(format!("publish ack for {subject}: {e}")))?;
        Ok(())
    }

    async fn ensure_stream(
        &self,
        subject: &str,
        retention: &StreamRetention,
    ) -> Result<(), BusError> {
        let storage = if retention.durable_storage {
            jetstream::stream::StorageType::File
        } else {
            jetstream::stream::StorageType::Memory
        };

        self.js
            .get_or_create_stream(jetstream::stream::Config {
                name: Self::stream_name(subject),
                subjects: vec![subject.to_string()],
                max_age: retention.max_age,
                storage,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Connection(format!("ensure stream {subject}: {e}")))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_name_sanitized() {
        assert_eq!(NatsBus::stream_name("ultra_siem.threats"), "ULTRA_SIEM_THREATS");
        assert_eq!(NatsBus::stream_name("a.b.*"), "A_B__");
        assert_eq!(NatsBus::stream_name("plain"), "PLAIN");
    }
}
