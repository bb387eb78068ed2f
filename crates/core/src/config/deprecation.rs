use tracing::warn;

/// Old upper-case setting names and the keys that replaced them.
pub(crate) const DEPRECATED_KEYS: &[(&str, &str)] = &[
    ("BROKER_URL", "broker_url"),
    ("BROKER_POOL_LIMIT", "broker_pool_limit"),
    ("BROKER_CONNECTION_TIMEOUT", "broker_connection_timeout"),
    ("BROKER_CONNECTION_MAX_RETRIES", "broker_connection_max_retries"),
    ("BROKER_HEARTBEAT", "broker_heartbeat"),
    ("CELERY_TASK_SERIALIZER", "task_serializer"),
    ("CELERY_ACCEPT_CONTENT", "accept_content"),
    ("CELERY_MESSAGE_COMPRESSION", "message_compression"),
    ("CELERY_TASK_PUBLISH_RETRY", "task_publish_retry"),
    ("CELERY_TASK_PUBLISH_RETRY_POLICY", "task_publish_retry_policy"),
    ("CELERY_SEND_TASK_SENT_EVENT", "task_send_sent_event"),
    ("CELERY_DEFAULT_QUEUE", "task_default_queue"),
    ("CELERY_DEFAULT_EXCHANGE", "task_default_exchange"),
    ("CELERY_DEFAULT_EXCHANGE_TYPE", "task_default_exchange_type"),
    ("CELERY_DEFAULT_ROUTING_KEY", "task_default_routing_key"),
    ("CELERY_DEFAULT_DELIVERY_MODE", "task_default_delivery_mode"),
    ("CELERY_QUEUES", "task_queues"),
    ("CELERY_CREATE_MISSING_QUEUES", "task_create_missing_queues"),
    ("CELERY_QUEUE_HA_POLICY", "task_queue_ha_policy"),
    ("CELERY_ROUTES", "task_routes"),
    ("CELERY_ANNOTATIONS", "task_annotations"),
    ("CELERY_TRACK_STARTED", "task_track_started"),
    ("CELERY_ACKS_LATE", "task_acks_late"),
    ("CELERY_IGNORE_RESULT", "task_ignore_result"),
    ("CELERY_STORE_ERRORS_EVEN_IF_IGNORED", "task_store_errors_even_if_ignored"),
    ("CELERYD_TASK_TIME_LIMIT", "task_time_limit"),
    ("CELERYD_TASK_SOFT_TIME_LIMIT", "task_soft_time_limit"),
    ("CELERY_RESULT_BACKEND", "result_backend"),
    ("CELERY_TASK_RESULT_EXPIRES", "result_expires"),
    ("CELERY_TIMEZONE", "timezone"),
    ("CELERY_ENABLE_UTC", "enable_utc"),
    ("CELERYBEAT_SCHEDULE", "beat_schedule"),
    ("CELERYBEAT_SCHEDULE_FILENAME", "beat_schedule_filename"),
    ("CELERYBEAT_SYNC_EVERY", "beat_sync_every"),
    ("CELERYBEAT_MAX_LOOP_INTERVAL", "beat_max_loop_interval"),
];

/// Current key for a deprecated name, if it is one.
pub fn replacement_for(old: &str) -> Option<&'static str> {
    DEPRECATED_KEYS
        .iter()
        .find(|(name, _)| *name == old)
        .map(|(_, new)| *new)
}

/// Rename deprecated keys in one configuration layer. When both spellings
/// appear in the same layer the current one wins.
pub(crate) fn migrate_deprecated(table: &mut toml::Table) {
    let old_keys: Vec<String> = table
        .keys()
        .filter(|k| replacement_for(k).is_some())
        .cloned()
        .collect();

    for old in old_keys {
        let Some(new) = replacement_for(&old) else {
            continue;
        };
        let Some(value) = table.remove(&old) else {
            continue;
        };
        if table.contains_key(new) {
            warn!(old = %old, new = %new, "deprecated setting ignored, current name also set");
            continue;
        }
        warn!(old = %old, new = %new, "deprecated setting name, use the new key");
        table.insert(new.to_string(), value);
    }
}
