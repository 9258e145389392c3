//! Per-delivery retry accounting and routing.
//!
//! Backoff is implemented with broker-side TTL queues that dead-letter
//! back to the original queue, so the writer holds no timers and no
//! per-message state beyond the header triple; a crash loses nothing.

use std::time::Duration;

use chrono::Utc;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use tracing::{error, info, warn};

use super::Result;
use crate::error::WriteError;

/// Retries granted before a delivery is dead-lettered.
pub const MAX_RETRIES: i32 = 5;
/// First backoff step.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Backoff ceiling.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Retry attempt counter, i32.
pub const RETRY_COUNT_HEADER: &str = "retry-count";
/// Queue the delivery first failed on.
pub const ORIGINAL_QUEUE_HEADER: &str = "original-queue";
/// Epoch seconds of the first failure, i64.
pub const FIRST_FAILURE_HEADER: &str = "first-failure-time";

/// Retry decisions for a failed delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the retry counter from a delivery's headers, defaulting to 0.
    /// Only the i32 width is honored; other widths read as 0.
    pub fn retry_count(headers: Option<&FieldTable>) -> i32 {
        match headers.and_then(|t| t.inner().get(RETRY_COUNT_HEADER)) {
            Some(AMQPValue::LongInt(n)) => *n,
            _ => 0,
        }
    }

    /// True while the delivery still has retry budget.
    pub fn should_retry(&self, headers: Option<&FieldTable>) -> bool {
        Self::retry_count(headers) < self.max_retries
    }

    /// Exponential backoff: 1s, 2s, 4s, 8s, 16s, ... capped at 5 minutes.
    pub fn backoff(retry_count: i32) -> Duration {
        let shift = retry_count.clamp(0, 20) as u32;
        let delay_ms = (INITIAL_RETRY_DELAY.as_millis() as u64).saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(MAX_RETRY_DELAY.as_millis() as u64))
    }

    /// Epoch seconds of the delivery's first failure, if recorded.
    pub fn first_failure_time(headers: Option<&FieldTable>) -> Option<i64> {
        match headers?.inner().get(FIRST_FAILURE_HEADER)? {
            AMQPValue::LongLongInt(t) => Some(*t),
            _ => None,
        }
    }

    /// Build the retry publication: headers copied width-for-width, the
    /// counter bumped, the origin queue stamped, and the first failure
    /// time set only if absent.
    pub fn prepare_retry(
        properties: &BasicProperties,
        body: &[u8],
        original_queue: &str,
    ) -> (BasicProperties, Vec<u8>) {
        let mut headers = properties.headers().clone().unwrap_or_default();

        let next = Self::retry_count(properties.headers().as_ref()) + 1;
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(next));
        headers.insert(
            ORIGINAL_QUEUE_HEADER.into(),
            AMQPValue::LongString(original_queue.to_string().into()),
        );
        if headers.inner().get(FIRST_FAILURE_HEADER).is_none() {
            headers.insert(
                FIRST_FAILURE_HEADER.into(),
                AMQPValue::LongLongInt(Utc::now().timestamp()),
            );
        }

        let mut props = BasicProperties::default()
            .with_delivery_mode(2)
            .with_headers(headers);
        if let Some(content_type) = properties.content_type() {
            props = props.with_content_type(content_type.clone());
        }

        (props, body.to_vec())
    }

    /// Route a failed delivery: through a TTL delay queue while budget
    /// remains, to the DLQ once it is spent.
    pub async fn handle_failure(
        &self,
        channel: &Channel,
        delivery: &Delivery,
        queue_name: &str,
        cause: &WriteError,
    ) -> Result<()> {
        let headers = delivery.properties.headers().as_ref();
        let retry_count = Self::retry_count(headers);

        error!(
            queue = %queue_name,
            retry = retry_count,
            max_retries = self.max_retries,
            error = %cause,
            "delivery processing failed"
        );

        if self.should_retry(headers) {
            let delay = Self::backoff(retry_count);
            info!(
                queue = %queue_name,
                delay_ms = delay.as_millis() as u64,
                attempt = retry_count + 1,
                "routing delivery through delay queue"
            );
            self.requeue_with_delay(channel, delivery, queue_name, delay)
                .await
        } else {
            match Self::first_failure_time(headers) {
                Some(first) => warn!(
                    queue = %queue_name,
                    retry_age_secs = Utc::now().timestamp() - first,
                    "retry budget exhausted, dead-lettering"
                ),
                None => warn!(queue = %queue_name, "retry budget exhausted, dead-lettering"),
            }
            delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await?;
            Ok(())
        }
    }

    /// Publish the delivery to `<queue>.retry.<delay_ms>ms`, a durable
    /// queue whose TTL dead-letters back to the original queue through
    /// the default exchange, then ack the original.
    async fn requeue_with_delay(
        &self,
        channel: &Channel,
        delivery: &Delivery,
        original_queue: &str,
        delay: Duration,
    ) -> Result<()> {
        let delay_ms = delay.as_millis() as i32;
        let delay_queue = format!("{original_queue}.retry.{delay_ms}ms");

        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongInt(delay_ms));
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(String::new().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(original_queue.to_string().into()),
        );
        channel
            .queue_declare(
                &delay_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;

        let (properties, body) =
            Self::prepare_retry(&delivery.properties, &delivery.data, original_queue);
        channel
            .basic_publish(
                "",
                &delay_queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        delivery.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    /// Log retry age for deliveries reappearing off a delay queue.
    pub fn log_retry_metrics(headers: Option<&FieldTable>) {
        let retry_count = Self::retry_count(headers);
        if retry_count == 0 {
            return;
        }
        match Self::first_failure_time(headers) {
            Some(first) => info!(
                retry_count,
                since_first_failure_secs = Utc::now().timestamp() - first,
                "processing retried delivery"
            ),
            None => info!(retry_count, "processing retried delivery"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(entries: &[(&str, AMQPValue)]) -> FieldTable {
        let mut table = FieldTable::default();
        for (key, value) in entries {
            table.insert((*key).into(), value.clone());
        }
        table
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        assert_eq!(RetryPolicy::retry_count(None), 0);

        let table = headers_with(&[("other", AMQPValue::LongString("value".to_string().into()))]);
        assert_eq!(RetryPolicy::retry_count(Some(&table)), 0);
    }

    #[test]
    fn retry_count_reads_i32_width_only() {
        let table = headers_with(&[(RETRY_COUNT_HEADER, AMQPValue::LongInt(3))]);
        assert_eq!(RetryPolicy::retry_count(Some(&table)), 3);

        // A mistyped width is ignored rather than misread.
        let table = headers_with(&[(RETRY_COUNT_HEADER, AMQPValue::LongLongInt(3))]);
        assert_eq!(RetryPolicy::retry_count(Some(&table)), 0);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let cases = [
            (0, Duration::from_secs(1)),
            (1, Duration::from_secs(2)),
            (2, Duration::from_secs(4)),
            (3, Duration::from_secs(8)),
            (4, Duration::from_secs(16)),
            (5, Duration::from_secs(32)),
            (10, Duration::from_secs(300)),
            (100, Duration::from_secs(300)),
        ];
        for (retry_count, expected) in cases {
            assert_eq!(
                RetryPolicy::backoff(retry_count),
                expected,
                "retry_count={retry_count}"
            );
        }
    }

    #[test]
    fn should_retry_boundaries() {
        let policy = RetryPolicy::new();
        for (count, expected) in [(0, true), (1, true), (4, true), (5, false), (6, false)] {
            let table = headers_with(&[(RETRY_COUNT_HEADER, AMQPValue::LongInt(count))]);
            assert_eq!(policy.should_retry(Some(&table)), expected, "count={count}");
        }
    }

    #[test]
    fn prepare_retry_bumps_count_and_preserves_headers() {
        let headers = headers_with(&[
            (RETRY_COUNT_HEADER, AMQPValue::LongInt(2)),
            (
                "custom-header",
                AMQPValue::LongString("value".to_string().into()),
            ),
        ]);
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_headers(headers);

        let (props, body) =
            RetryPolicy::prepare_retry(&properties, br#"{"test":"data"}"#, "test_queue");

        assert_eq!(body, br#"{"test":"data"}"#);
        assert_eq!(props.delivery_mode(), &Some(2));
        assert_eq!(
            props.content_type().as_ref().map(|ct| ct.as_str()),
            Some("application/json")
        );

        let out = props.headers().as_ref().unwrap();
        assert_eq!(
            out.inner().get(RETRY_COUNT_HEADER),
            Some(&AMQPValue::LongInt(3))
        );
        assert_eq!(
            out.inner().get(ORIGINAL_QUEUE_HEADER),
            Some(&AMQPValue::LongString("test_queue".to_string().into()))
        );
        assert_eq!(
            out.inner().get("custom-header"),
            Some(&AMQPValue::LongString("value".to_string().into()))
        );
        // First failure stamped as i64 on the first hop.
        assert!(matches!(
            out.inner().get(FIRST_FAILURE_HEADER),
            Some(AMQPValue::LongLongInt(_))
        ));
    }

    #[test]
    fn prepare_retry_keeps_existing_first_failure_time() {
        let headers = headers_with(&[
            (RETRY_COUNT_HEADER, AMQPValue::LongInt(1)),
            (FIRST_FAILURE_HEADER, AMQPValue::LongLongInt(1_700_000_000)),
        ]);
        let properties = BasicProperties::default().with_headers(headers);

        let (props, _) = RetryPolicy::prepare_retry(&properties, b"{}", "q");

        assert_eq!(
            props
                .headers()
                .as_ref()
                .unwrap()
                .inner()
                .get(FIRST_FAILURE_HEADER),
            Some(&AMQPValue::LongLongInt(1_700_000_000))
        );
    }

    #[test]
    fn first_failure_time_reads_i64_width_only() {
        let table = headers_with(&[(FIRST_FAILURE_HEADER, AMQPValue::LongLongInt(1234))]);
        assert_eq!(RetryPolicy::first_failure_time(Some(&table)), Some(1234));

        let table = headers_with(&[(FIRST_FAILURE_HEADER, AMQPValue::LongInt(1234))]);
        assert_eq!(RetryPolicy::first_failure_time(Some(&table)), None);
    }
}
