//! Celery message protocol v2 over the Redis transport.
//!
//! A chain is submitted as one message for its first stage; the remaining
//! stages travel in `embed.chain` and the worker enqueues them as each stage
//! finishes. Job results are read back from the Redis result backend.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use draftline_core::{AppError, Config};
use redis::aio::ConnectionManager;
use redis::Client;
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;

use super::{ChainHandle, JobChain, JobSignature, JobState, JobStatus, RenderQueue};

const RESULT_KEY_PREFIX: &str = "celery-task-meta-";

pub struct CeleryRedisQueue {
    broker: Client,
    result_backend: Client,
    broker_conn: OnceCell<ConnectionManager>,
    result_conn: OnceCell<ConnectionManager>,
    origin: String,
}

fn redis_unavailable(context: &str, err: redis::RedisError) -> AppError {
    AppError::BackendUnavailable(format!("{}: {}", context, err))
}

impl CeleryRedisQueue {
    /// Validates both URLs; connections are opened on first use.
    pub fn new(broker_url: &str, result_backend_url: &str) -> Result<Self, AppError> {
        let broker = Client::open(broker_url).map_err(|e| {
            AppError::Configuration(format!("Invalid CELERY_BROKER_URL: {}", e))
        })?;
        let result_backend = Client::open(result_backend_url).map_err(|e| {
            AppError::Configuration(format!("Invalid CELERY_RESULT_BACKEND: {}", e))
        })?;
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

        Ok(Self {
            broker,
            result_backend,
            broker_conn: OnceCell::new(),
            result_conn: OnceCell::new(),
            origin: format!("draftline@{}", host),
        })
    }

    /// `None` when either endpoint is not configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>, AppError> {
        match (&config.celery_broker_url, &config.celery_result_backend) {
            (Some(broker), Some(backend)) => Self::new(broker, backend).map(Some),
            _ => Ok(None),
        }
    }

    async fn broker(&self) -> Result<ConnectionManager, AppError> {
        self.broker_conn
            .get_or_try_init(|| self.broker.get_connection_manager())
            .await
            .cloned()
            .map_err(|e| redis_unavailable("Failed to connect to broker", e))
    }

    async fn results(&self) -> Result<ConnectionManager, AppError> {
        self.result_conn
            .get_or_try_init(|| self.result_backend.get_connection_manager())
            .await
            .cloned()
            .map_err(|e| redis_unavailable("Failed to connect to result backend", e))
    }
}

#[async_trait::async_trait]
impl RenderQueue for CeleryRedisQueue {
    async fn ping(&self, timeout: Duration) -> Result<bool, AppError> {
        let probe = async {
            let mut conn = self.broker().await?;
            let reply: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_unavailable("Broker PING failed", e))?;
            Ok::<_, AppError>(reply)
        };
        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(reply)) => Ok(reply == "PONG"),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    #[tracing::instrument(skip(self, chain), fields(queue = %chain.queue, stages = chain.stages.len()))]
    async fn submit_chain(&self, chain: &JobChain) -> Result<ChainHandle, AppError> {
        let stage_ids = chain.resolve_ids();
        let message = encode_chain_message(chain, &stage_ids, &self.origin)?;
        let payload = serde_json::to_string(&message)?;

        let mut conn = self.broker().await?;
        let _queued: i64 = redis::cmd("LPUSH")
            .arg(&chain.queue)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_unavailable("Failed to publish job", e))?;

        tracing::info!(first_job = %stage_ids[0], "Render chain published");
        Ok(ChainHandle { stage_ids })
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, AppError> {
        let mut conn = self.results().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(format!("{}{}", RESULT_KEY_PREFIX, job_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_unavailable("Failed to read job result", e))?;

        match raw {
            Some(raw) => decode_result_meta(&raw),
            None => Ok(JobStatus::pending()),
        }
    }
}

/// Signature dict as Celery serializes it inside `embed.chain`.
fn signature_value(stage: &JobSignature, stage_id: &str, queue: &str) -> Value {
    json!({
        "task": stage.task,
        "args": stage.args,
        "kwargs": stage.kwargs,
        "options": {
            "task_id": stage_id,
            "queue": queue,
        },
        "subtask_type": null,
        "immutable": false,
        "chord_size": null,
    })
}

/// Transport envelope for the first stage of `chain`.
pub(crate) fn encode_chain_message(
    chain: &JobChain,
    stage_ids: &[String],
    origin: &str,
) -> Result<Value, AppError> {
    let (first, rest) = chain
        .stages
        .split_first()
        .ok_or_else(|| AppError::InvalidRequest("Job chain has no stages".to_string()))?;
    if stage_ids.len() != chain.stages.len() {
        return Err(AppError::Internal(
            "Job chain and stage ids differ in length".to_string(),
        ));
    }
    let first_id = &stage_ids[0];

    // Workers pop the next stage from the end of the list
    let remaining: Vec<Value> = rest
        .iter()
        .zip(&stage_ids[1..])
        .rev()
        .map(|(stage, id)| signature_value(stage, id, &chain.queue))
        .collect();
    let embedded_chain = if remaining.is_empty() {
        Value::Null
    } else {
        Value::Array(remaining)
    };

    let body = json!([
        first.args,
        first.kwargs,
        {
            "callbacks": null,
            "errbacks": null,
            "chain": embedded_chain,
            "chord": null,
        }
    ]);
    let body = STANDARD.encode(serde_json::to_vec(&body)?);

    let headers = json!({
        "lang": "py",
        "task": first.task,
        "id": first_id,
        "shadow": null,
        "eta": null,
        "expires": null,
        "group": null,
        "group_index": null,
        "retries": 0,
        "timelimit": [null, null],
        "root_id": first_id,
        "parent_id": null,
        "argsrepr": repr_args(&first.args),
        "kwargsrepr": Value::Object(first.kwargs.clone()).to_string(),
        "origin": origin,
        "ignore_result": false,
    });

    Ok(json!({
        "body": body,
        "content-encoding": "utf-8",
        "content-type": "application/json",
        "headers": headers,
        "properties": {
            "correlation_id": first_id,
            "reply_to": uuid::Uuid::new_v4().to_string(),
            "delivery_mode": 2,
            "delivery_info": {
                "exchange": "",
                "routing_key": chain.queue,
            },
            "priority": 0,
            "body_encoding": "base64",
            "delivery_tag": uuid::Uuid::new_v4().to_string(),
        },
    }))
}

fn repr_args(args: &[Value]) -> String {
    let parts: Vec<String> = args.iter().map(Value::to_string).collect();
    format!("({})", parts.join(", "))
}

/// Parses a `celery-task-meta-*` value.
fn decode_result_meta(raw: &str) -> Result<JobStatus, AppError> {
    let meta: Map<String, Value> = serde_json::from_str(raw)
        .map_err(|e| AppError::Internal(format!("Malformed job result: {}", e)))?;
    let state = meta
        .get("status")
        .and_then(Value::as_str)
        .map(JobState::from_celery)
        .unwrap_or(JobState::Pending);
    Ok(JobStatus {
        state,
        result: meta.get("result").cloned().filter(|v| !v.is_null()),
    })
}
