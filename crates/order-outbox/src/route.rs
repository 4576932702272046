use chrono::{DateTime, Utc};
use pipeline_broker::{Publishing, QueueOptions};
use pipeline_config_and_utils::{BrokerConfig, RetryPolicy};
use pipeline_database::{NewOutboxMessage, CONTENT_TYPE_JSON};

/// Where order-created audit events are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRoute {
    pub queue: QueueOptions,
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
}

impl OutboxRoute {
    /// Publish to `queue` through the default exchange.
    pub fn to_queue(queue: QueueOptions) -> Self {
        Self {
            routing_key: queue.name.clone(),
            queue,
            exchange: String::new(),
            content_type: CONTENT_TYPE_JSON.to_string(),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        let queue = QueueOptions {
            name: config.queue_name.clone(),
            durable: config.durable,
            exclusive: config.exclusive,
            auto_delete: config.auto_delete,
        };
        Self {
            exchange: config.exchange_name.clone(),
            ..Self::to_queue(queue)
        }
    }

    pub fn publishing(&self, body: Vec<u8>) -> Publishing {
        Publishing {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            content_type: self.content_type.clone(),
            body,
        }
    }

    /// Outbox row for an event whose synchronous publish failed at `failed_at`.
    pub fn outbox_message(
        &self,
        payload: Vec<u8>,
        publish_error: String,
        policy: &RetryPolicy,
        failed_at: DateTime<Utc>,
    ) -> NewOutboxMessage {
        NewOutboxMessage {
            queue_name: self.queue.name.clone(),
            exchange_name: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            payload,
            content_type: self.content_type.clone(),
            retry_count: 0,
            max_retries: policy.max_retries,
            last_error: Some(publish_error),
            next_retry_at: policy.first_retry_at(failed_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_route_from_config() {
        let config = BrokerConfig {
            durable: true,
            ..Default::default()
        };
        let route = OutboxRoute::from_config(&config);
        assert_eq!(route.queue.name, "oms.order.created");
        assert!(route.queue.durable);
        assert_eq!(route.exchange, "");
        assert_eq!(route.routing_key, "oms.order.created");
        assert_eq!(route.content_type, "application/json");
    }

    #[test]
    fn test_outbox_message_is_due_after_base_delay() {
        let route = OutboxRoute::to_queue(QueueOptions::new("orders"));
        let now = Utc::now();
        let message = route.outbox_message(
            b"{}".to_vec(),
            "broker down".to_string(),
            &RetryPolicy::default(),
            now,
        );
        assert_eq!(message.retry_count, 0);
        assert_eq!(message.max_retries, 5);
        assert_eq!(message.last_error.as_deref(), Some("broker down"));
        assert_eq!(message.next_retry_at, now + Duration::seconds(30));
        assert_eq!(message.queue_name, "orders");
    }
}
