//! The JSON RPC surface under `/api/{method}`.
//!
//! Every coordinator operation is exposed as a method name in the URL.
//! Arguments arrive either as a JSON object in the `data` query parameter
//! (GET) or as a JSON body (POST); both forms are equivalent. Successful
//! replies wrap the payload as `{"response": ...}`. The method table is an
//! explicit match; nothing is dispatched by reflection.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::scheduler::{AddTaskRequest, Scheduler};
use foreman_core::{SchedulerError, TaskId, TaskStatus, WorkerId};

#[derive(Debug, Deserialize)]
pub struct DataParam {
    data: Option<String>,
}

/// GET form: arguments in the percent-encoded `data` query parameter.
pub async fn rpc_get(
    State(scheduler): State<Arc<Scheduler>>,
    Path(method): Path<String>,
    Query(query): Query<DataParam>,
) -> Response {
    let args = match query.data {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(error) => {
                return RpcFailure::bad_request(format!("invalid data parameter: {error}"))
                    .into_response();
            }
        },
        None => json!({}),
    };
    respond(dispatch(&scheduler, &method, args))
}

/// POST form: arguments as the JSON body. An empty body means no arguments.
pub async fn rpc_post(
    State(scheduler): State<Arc<Scheduler>>,
    Path(method): Path<String>,
    body: String,
) -> Response {
    let trimmed = body.trim();
    let args = if trimmed.is_empty() {
        json!({})
    } else {
        match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(error) => {
                return RpcFailure::bad_request(format!("invalid request body: {error}"))
                    .into_response();
            }
        }
    };
    respond(dispatch(&scheduler, &method, args))
}

fn respond(result: Result<Value, RpcFailure>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(json!({ "response": value }))).into_response(),
        Err(failure) => failure.into_response(),
    }
}

fn dispatch(scheduler: &Scheduler, method: &str, args: Value) -> Result<Value, RpcFailure> {
    match method {
        "add_task" => {
            let args: AddTaskArgs = parse(args)?;
            let status = scheduler.add_task(AddTaskRequest {
                task_id: args.task_id.clone(),
                deps: args.deps,
                resources: args.resources,
                priority: args.priority,
                params: args.params,
                worker_id: args.worker_id,
            });
            Ok(json!({ "task_id": args.task_id, "status": status }))
        }
        "get_work" => {
            let args: WorkerArgs = parse(args)?;
            encode(scheduler.get_work(&args.worker_id, args.host))
        }
        "task_done" => {
            let args: TaskDoneArgs = parse(args)?;
            let status = scheduler.task_done(&args.worker_id, &args.task_id)?;
            Ok(json!({ "task_id": args.task_id, "status": status }))
        }
        "task_failed" => {
            let args: TaskFailedArgs = parse(args)?;
            let status = scheduler.task_failed(&args.worker_id, &args.task_id, args.message)?;
            Ok(json!({ "task_id": args.task_id, "status": status }))
        }
        "disable_task" => {
            let args: TaskArgs = parse(args)?;
            let status = scheduler.disable_task(&args.task_id)?;
            Ok(json!({ "task_id": args.task_id, "status": status }))
        }
        "re_enable_task" => {
            let args: TaskArgs = parse(args)?;
            let status = scheduler.re_enable_task(&args.task_id)?;
            Ok(json!({ "task_id": args.task_id, "status": status }))
        }
        "ping" => {
            let args: WorkerArgs = parse(args)?;
            scheduler.ping(&args.worker_id, args.host);
            Ok(Value::Null)
        }
        "task_list" => {
            let args: TaskListArgs = parse(args)?;
            let status = match args.status.as_deref() {
                None => None,
                Some(name) => Some(TaskStatus::parse(name).ok_or_else(|| {
                    RpcFailure::bad_request(format!("unknown task status: {name}"))
                })?),
            };
            encode(scheduler.task_list(status, args.search.as_deref()))
        }
        "worker_list" => encode(scheduler.worker_list()),
        "dep_graph" => {
            let args: TaskArgs = parse(args)?;
            encode(scheduler.dep_graph(&args.task_id))
        }
        "fetch_error" => {
            let args: TaskArgs = parse(args)?;
            let error = scheduler.fetch_error(&args.task_id)?;
            Ok(json!({ "task_id": args.task_id, "error": error }))
        }
        _ => Err(RpcFailure::not_found(format!("no such method: {method}"))),
    }
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(args)
        .map_err(|error| RpcFailure::bad_request(format!("invalid arguments: {error}")))
}

fn encode<T: Serialize>(value: T) -> Result<Value, RpcFailure> {
    serde_json::to_value(value)
        .map_err(|error| RpcFailure::internal(format!("failed to encode response: {error}")))
}

#[derive(Debug, Deserialize)]
struct AddTaskArgs {
    task_id: TaskId,
    #[serde(default)]
    deps: Vec<TaskId>,
    #[serde(default)]
    resources: BTreeMap<String, u64>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    params: BTreeMap<String, String>,
    #[serde(default)]
    worker_id: Option<WorkerId>,
}

#[derive(Debug, Deserialize)]
struct WorkerArgs {
    worker_id: WorkerId,
    #[serde(default)]
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskDoneArgs {
    worker_id: WorkerId,
    task_id: TaskId,
}

#[derive(Debug, Deserialize)]
struct TaskFailedArgs {
    worker_id: WorkerId,
    task_id: TaskId,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskArgs {
    task_id: TaskId,
}

#[derive(Debug, Deserialize)]
struct TaskListArgs {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    search: Option<String>,
}

/// A rejected RPC call: malformed arguments, a missing entity, or an
/// operation the current state does not allow.
pub struct RpcFailure {
    status: StatusCode,
    message: String,
}

impl RpcFailure {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<SchedulerError> for RpcFailure {
    fn from(error: SchedulerError) -> Self {
        if error.is_not_found() {
            Self::not_found(error.to_string())
        } else {
            Self::conflict(error.to_string())
        }
    }
}

impl IntoResponse for RpcFailure {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
