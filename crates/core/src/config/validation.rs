use super::types::{Config, RetryPolicy, ScheduleSpec};
use crate::error::{FahrplanError, Result};

impl Config {
    /// Validate the config. An empty `accept_content` is not checked here:
    /// it only becomes an error once something is dispatched.
    pub fn validate(&self) -> Result<()> {
        self.validate_broker()?;
        self.validate_retry_policy()?;
        self.validate_routing()?;
        self.validate_time_limits()?;
        self.validate_beat()?;
        Ok(())
    }

    fn validate_broker(&self) -> Result<()> {
        if !self.broker_url.contains("://") {
            return Err(FahrplanError::ImproperlyConfigured(format!(
                "invalid broker_url '{}', expected '<scheme>://...'",
                self.redacted_broker_url()
            )));
        }
        if self.broker_pool_limit == 0 {
            return Err(FahrplanError::ImproperlyConfigured(
                "broker_pool_limit must be at least 1".into(),
            ));
        }
        if !self.broker_connection_timeout.is_finite() || self.broker_connection_timeout < 0.0 {
            return Err(FahrplanError::ImproperlyConfigured(format!(
                "broker_connection_timeout must be a non-negative number, got {}",
                self.broker_connection_timeout
            )));
        }
        Ok(())
    }

    fn validate_retry_policy(&self) -> Result<()> {
        self.task_publish_retry_policy
            .validate_as("task_publish_retry_policy")
    }

    fn validate_routing(&self) -> Result<()> {
        if self.task_default_queue.is_empty() {
            return Err(FahrplanError::ImproperlyConfigured(
                "task_default_queue must not be empty".into(),
            ));
        }
        for spec in &self.task_queues {
            if spec.name.is_empty() {
                return Err(FahrplanError::ImproperlyConfigured(
                    "task_queues contains a queue without a name".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_time_limits(&self) -> Result<()> {
        for (name, v) in [
            ("task_time_limit", self.task_time_limit),
            ("task_soft_time_limit", self.task_soft_time_limit),
        ] {
            if let Some(v) = v {
                if !v.is_finite() || v <= 0.0 {
                    return Err(FahrplanError::ImproperlyConfigured(format!(
                        "{name} must be positive, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_beat(&self) -> Result<()> {
        if !self.beat_max_loop_interval.is_finite() || self.beat_max_loop_interval <= 0.0 {
            return Err(FahrplanError::ImproperlyConfigured(format!(
                "beat_max_loop_interval must be positive, got {}",
                self.beat_max_loop_interval
            )));
        }
        if !self.beat_sync_interval.is_finite() || self.beat_sync_interval < 0.0 {
            return Err(FahrplanError::ImproperlyConfigured(format!(
                "beat_sync_interval must be non-negative, got {}",
                self.beat_sync_interval
            )));
        }
        for (name, entry) in &self.beat_schedule {
            if entry.task.is_empty() {
                return Err(FahrplanError::ImproperlyConfigured(format!(
                    "beat_schedule entry '{name}' has no task"
                )));
            }
            if let ScheduleSpec::Every(secs) = entry.schedule {
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(FahrplanError::ImproperlyConfigured(format!(
                        "beat_schedule entry '{name}' has non-positive interval {secs}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl RetryPolicy {
    /// Reject intervals that are negative, NaN or infinite.
    pub fn validate(&self) -> Result<()> {
        self.validate_as("retry_policy")
    }

    fn validate_as(&self, prefix: &str) -> Result<()> {
        for (name, v) in [
            ("interval_start", self.interval_start),
            ("interval_step", self.interval_step),
            ("interval_max", self.interval_max),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(FahrplanError::ImproperlyConfigured(format!(
                    "{prefix}.{name} must be a non-negative number, got {v}"
                )));
            }
        }
        Ok(())
    }
}
