//! Turns a task invocation into a broker publish.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fahrplan_core::{
    isoformat, new_task_id, Config, DeliveryDescriptor, Expires, FahrplanError, MessageProperties,
    PublishOptions, QueueSpec, Result, TaskMessage, TaskOptions, Timezone,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::app::App;
use crate::events::{publish_task_sent, TaskSentEvent};
use crate::retry::retry_with_backoff;
use crate::serialization::{Compression, Serializer, COMPRESSION_HEADER};
use crate::signals::{AfterTaskPublish, BeforeTaskPublish};

/// Hands out producers bound to one app's connection pool.
#[derive(Debug, Clone)]
pub struct ProducerPool {
    app: App,
}

impl ProducerPool {
    pub(crate) fn new(app: App) -> Self {
        Self { app }
    }

    pub fn acquire(&self) -> Producer {
        Producer {
            app: self.app.clone(),
        }
    }
}

/// Publishes task messages. Connections are checked out per publish.
#[derive(Debug, Clone)]
pub struct Producer {
    app: App,
}

impl Producer {
    /// Route, encode and publish one task message. Returns the task id.
    pub async fn publish_task(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: PublishOptions,
    ) -> Result<String> {
        let app = &self.app;
        let conf = app.conf()?;
        if conf.accept_content.is_empty() {
            return Err(FahrplanError::ImproperlyConfigured(
                "accept_content is empty: refusing to publish".into(),
            ));
        }
        if let Some(policy) = &options.retry_policy {
            policy.validate()?;
        }

        let task_defaults = app
            .registry()
            .lookup(name)
            .map(|desc| desc.resolved_options().clone());
        let router = app.router()?;
        let delivery = router.route(
            &options.overrides(),
            task_defaults.as_ref(),
            name,
            &args,
            &kwargs,
        )?;
        let serializer = Serializer::checked(&delivery.serializer, &conf.accept_content)?;
        let compression = delivery
            .compression
            .as_deref()
            .map(Compression::lookup)
            .transpose()?;

        let now = app.now();
        let tz = if conf.enable_utc {
            Timezone::utc()
        } else {
            conf.timezone
        };
        let eta = resolve_eta(&options, now)?;
        let expires = resolve_expires(&options, task_defaults.as_ref(), now)?;

        let task_id = options.task_id.clone().unwrap_or_else(new_task_id);
        let message = TaskMessage {
            args,
            kwargs,
            retries: options.retries,
            eta: eta.map(|t| isoformat(&tz.localize(t))),
            expires: expires.map(|t| isoformat(&tz.localize(t))),
            utc: conf.enable_utc,
            callbacks: non_empty(options.link.clone()),
            errbacks: non_empty(options.link_error.clone()),
            timelimit: time_limits(&options, task_defaults.as_ref(), &conf),
            group_id: options.group_id.clone(),
            chord: options.chord.clone(),
            ..TaskMessage::new(name, task_id.clone())
        };

        let mut headers = options.headers.clone();
        let mut body = serializer.dumps(&message)?;
        if let Some(compression) = compression {
            body = compression.compress(&body)?;
            headers.insert(
                COMPRESSION_HEADER.to_string(),
                Value::from(compression.content_type()),
            );
        }
        let properties = MessageProperties {
            content_type: serializer.content_type().to_string(),
            content_encoding: serializer.content_encoding().to_string(),
            correlation_id: Some(task_id.clone()),
            reply_to: options.reply_to.clone(),
            delivery_mode: delivery.delivery_mode,
            priority: delivery.priority,
            expiration_ms: None,
            headers,
        };

        let declare: Vec<QueueSpec> = delivery
            .queue
            .as_deref()
            .and_then(|q| router.queue(q))
            .into_iter()
            .collect();

        let retry_enabled = options.retry.unwrap_or(conf.task_publish_retry);
        let retry_policy = options
            .retry_policy
            .clone()
            .unwrap_or_else(|| conf.task_publish_retry_policy.clone());

        let signals = app.signals();
        if signals.before_task_publish.has_listeners() {
            signals.before_task_publish.send(
                name,
                &BeforeTaskPublish {
                    body: message.to_value()?,
                    exchange: delivery.exchange.clone(),
                    routing_key: delivery.routing_key.clone(),
                    declare: declare.clone(),
                    headers: properties.headers.clone(),
                    properties: properties.clone(),
                    retry_policy: retry_enabled.then(|| retry_policy.clone()),
                },
            );
        }

        let timeout = options
            .connect_timeout
            .unwrap_or_else(|| conf.connection_timeout());
        let (declare, delivery_ref, properties_ref, body_ref) =
            (&declare, &delivery, &properties, &body);
        retry_with_backoff(&retry_policy, retry_enabled, |_attempt| async move {
            let mut conn = app.pool()?.acquire(timeout).await?;
            let sent = publish_once(app, &*conn, declare, delivery_ref, body_ref, properties_ref)
                .await;
            if let Err(e) = &sent {
                if e.is_connection_loss() {
                    conn.mark_broken();
                    app.forget_declarations();
                }
            }
            sent
        })
        .await?;

        if signals.after_task_publish.has_listeners() {
            signals.after_task_publish.send(
                name,
                &AfterTaskPublish {
                    body: message.to_value()?,
                    exchange: delivery.exchange.clone(),
                    routing_key: delivery.routing_key.clone(),
                },
            );
        }

        if conf.task_send_sent_event {
            let event = TaskSentEvent::new(&message, &delivery, now);
            let sent = match app.connection().await {
                Ok(conn) => publish_task_sent(&*conn, &event).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(task = %name, task_id = %task_id, error = %e, "failed to send task-sent event");
            }
        }

        debug!(
            task = %name,
            task_id = %task_id,
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            eta = ?message.eta,
            "task published"
        );
        Ok(task_id)
    }
}

async fn publish_once(
    app: &App,
    broker: &dyn crate::broker::Broker,
    declare: &[QueueSpec],
    delivery: &DeliveryDescriptor,
    body: &[u8],
    properties: &MessageProperties,
) -> Result<()> {
    if declare.is_empty() {
        app.ensure_exchange(broker, &delivery.exchange, delivery.exchange_type)
            .await?;
    }
    for queue in declare {
        app.ensure_queue(broker, queue).await?;
    }
    broker
        .publish(
            &delivery.exchange,
            &delivery.routing_key,
            body.to_vec(),
            properties,
        )
        .await
}

/// Absolute ETA from `countdown` or `eta`. A zero countdown still sets an
/// ETA of now.
fn resolve_eta(options: &PublishOptions, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match (options.countdown, options.eta) {
        (Some(_), Some(_)) => Err(FahrplanError::InvalidTask(
            "countdown and eta are mutually exclusive".into(),
        )),
        (Some(countdown), None) => {
            if !countdown.is_finite() || countdown < 0.0 {
                return Err(FahrplanError::InvalidTask(format!(
                    "countdown must be a non-negative number of seconds, got {countdown}"
                )));
            }
            offset(now, countdown).map(Some)
        }
        (None, Some(eta)) if eta < now => Err(FahrplanError::InvalidTask(format!(
            "eta {eta} is in the past"
        ))),
        (None, eta) => Ok(eta),
    }
}

/// Absolute expiry from the call, or the task's default in seconds.
fn resolve_expires(
    options: &PublishOptions,
    task_defaults: Option<&TaskOptions>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let at = match options.expires {
        Some(Expires::At(at)) => at,
        Some(Expires::In(after)) => offset(now, after.as_secs_f64())?,
        None => match task_defaults.and_then(|d| d.expires) {
            Some(secs) if secs.is_finite() && secs >= 0.0 => offset(now, secs)?,
            Some(secs) => {
                return Err(FahrplanError::InvalidTask(format!(
                    "task expires must be a non-negative number of seconds, got {secs}"
                )))
            }
            None => return Ok(None),
        },
    };
    if at <= now {
        return Err(FahrplanError::InvalidTask(format!(
            "expires {at} is not in the future"
        )));
    }
    Ok(Some(at))
}

fn offset(now: DateTime<Utc>, secs: f64) -> Result<DateTime<Utc>> {
    let out_of_range = || FahrplanError::InvalidTask(format!("{secs}s is out of range"));
    let step = Duration::try_from_secs_f64(secs).map_err(|_| out_of_range())?;
    let step = chrono::Duration::from_std(step).map_err(|_| out_of_range())?;
    now.checked_add_signed(step).ok_or_else(out_of_range)
}

fn time_limits(
    options: &PublishOptions,
    task_defaults: Option<&TaskOptions>,
    conf: &Config,
) -> (Option<f64>, Option<f64>) {
    let hard = options
        .time_limit
        .or_else(|| task_defaults.and_then(|d| d.time_limit))
        .or(conf.task_time_limit);
    let soft = options
        .soft_time_limit
        .or_else(|| task_defaults.and_then(|d| d.soft_time_limit))
        .or(conf.task_soft_time_limit);
    (hard, soft)
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn countdown_becomes_absolute_eta() {
        let opts = PublishOptions::new().countdown(1.5);
        let eta = resolve_eta(&opts, now()).unwrap().unwrap();
        assert_eq!(eta, now() + chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn zero_countdown_is_now() {
        let opts = PublishOptions::new().countdown(0.0);
        assert_eq!(resolve_eta(&opts, now()).unwrap(), Some(now()));
    }

    #[test]
    fn bad_countdowns_are_rejected() {
        for bad in [-1.0, f64::NAN, f64::INFINITY, 1e300] {
            let opts = PublishOptions::new().countdown(bad);
            assert!(
                matches!(resolve_eta(&opts, now()), Err(FahrplanError::InvalidTask(_))),
                "countdown {bad} accepted"
            );
        }
    }

    #[test]
    fn countdown_and_eta_conflict() {
        let opts = PublishOptions::new().countdown(5.0).eta(now());
        assert!(resolve_eta(&opts, now()).is_err());
    }

    #[test]
    fn past_eta_is_rejected() {
        let opts = PublishOptions::new().eta(now() - chrono::Duration::seconds(1));
        assert!(resolve_eta(&opts, now()).is_err());
    }

    #[test]
    fn expires_from_task_defaults() {
        let defaults = TaskOptions {
            expires: Some(30.0),
            ..TaskOptions::default()
        };
        let at = resolve_expires(&PublishOptions::new(), Some(&defaults), now()).unwrap();
        assert_eq!(at, Some(now() + chrono::Duration::seconds(30)));
    }

    #[test]
    fn expired_on_arrival_is_rejected() {
        let opts = PublishOptions::new().expires(Expires::At(now()));
        assert!(resolve_expires(&opts, None, now()).is_err());
        let opts = PublishOptions::new().expires(Expires::In(Duration::ZERO));
        assert!(resolve_expires(&opts, None, now()).is_err());
    }

    #[test]
    fn time_limits_fall_back_to_config() {
        let conf = Config {
            task_time_limit: Some(60.0),
            ..Config::default()
        };
        let opts = PublishOptions {
            soft_time_limit: Some(10.0),
            ..PublishOptions::default()
        };
        assert_eq!(time_limits(&opts, None, &conf), (Some(60.0), Some(10.0)));
    }
}
