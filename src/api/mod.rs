//! HTTP surface: explicit method+path routing on hyper, JSON helpers, and
//! the audit-header plumbing shared by all handlers.

pub mod activity;
pub mod cells;
pub mod diff;
pub mod services;
pub mod sse;
pub mod terminals;

use crate::engine::Engine;
use crate::errors::HiveError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use url::form_urlencoded;

pub type ApiBody = BoxBody<Bytes, Infallible>;

pub async fn handle_request(
    req: Request<Incoming>,
    engine: Arc<Engine>,
) -> Result<Response<ApiBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));
    let headers = req.headers().clone();
    let audit = AuditContext::from_headers(&headers);

    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .unwrap_or(std::borrow::Cow::Borrowed(s))
                .to_string()
        })
        .collect();
    let parts: Vec<&str> = segments.iter().map(String::as_str).collect();

    let body = if matches!(
        method,
        Method::POST | Method::DELETE | Method::PUT | Method::PATCH
    ) {
        req.into_body().collect().await?.to_bytes()
    } else {
        Bytes::new()
    };

    use terminals::TerminalFlavor::{Chat, Service, Setup, Shell};
    let response = match (&method, parts.as_slice()) {
        (&Method::GET, ["health"]) => {
            json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }))
        }

        (&Method::POST, ["api", "cells"]) => cells::create(&engine, &body, &audit).await,
        (&Method::GET, ["api", "cells"]) => cells::list(&engine, &query).await,
        (&Method::DELETE, ["api", "cells"]) => cells::bulk_delete(&engine, &body, &audit).await,

        (&Method::GET, ["api", "cells", "timings", "global"]) => {
            activity::global_timings(&engine, &query).await
        }
        (&Method::GET, ["api", "cells", "workspace", workspace_id, "stream"]) => {
            cells::workspace_stream(&engine, workspace_id).await
        }

        (&Method::GET, ["api", "cells", id, "setup", "log"]) => {
            cells::setup_log(&engine, id, &audit).await
        }
        (&Method::POST, ["api", "cells", id, "setup", "retry"]) => {
            cells::retry(&engine, id, &audit).await
        }
        (&Method::GET, ["api", "cells", id, "setup", "terminal", "stream"]) => {
            terminals::stream(&engine, Setup, id).await
        }
        (&Method::POST, ["api", "cells", id, "setup", "terminal", "input"]) => {
            terminals::input(&engine, Setup, id, &body).await
        }
        (&Method::POST, ["api", "cells", id, "setup", "terminal", "resize"]) => {
            terminals::resize(&engine, Setup, id, &body).await
        }

        (&Method::GET, ["api", "cells", id, "services"]) => services::list(&engine, id).await,
        (&Method::GET, ["api", "cells", id, "services", "stream"]) => {
            services::stream(&engine, id).await
        }
        (&Method::POST, ["api", "cells", id, "services", action @ ("start" | "stop" | "restart")]) => {
            services::cell_action(&engine, id, action, &audit).await
        }
        (&Method::GET, ["api", "cells", _id, "services", service_id, "terminal", "stream"]) => {
            terminals::stream(&engine, Service, service_id).await
        }
        (&Method::POST, ["api", "cells", _id, "services", service_id, "terminal", "input"]) => {
            terminals::input(&engine, Service, service_id, &body).await
        }
        (&Method::POST, ["api", "cells", _id, "services", service_id, "terminal", "resize"]) => {
            terminals::resize(&engine, Service, service_id, &body).await
        }
        (&Method::POST, ["api", "cells", _id, "services", service_id, "terminal", "restart"]) => {
            services::service_action(&engine, service_id, "restart", &audit).await
        }
        (
            &Method::POST,
            ["api", "cells", _id, "services", service_id, action @ ("start" | "stop" | "restart")],
        ) => services::service_action(&engine, service_id, action, &audit).await,

        (&Method::POST, ["api", "cells", id, "terminal"]) => {
            terminals::ensure(&engine, Shell, id, &body).await
        }
        (&Method::GET, ["api", "cells", id, "terminal", "stream"]) => {
            terminals::stream(&engine, Shell, id).await
        }
        (&Method::POST, ["api", "cells", id, "terminal", "input"]) => {
            terminals::input(&engine, Shell, id, &body).await
        }
        (&Method::POST, ["api", "cells", id, "terminal", "resize"]) => {
            terminals::resize(&engine, Shell, id, &body).await
        }
        (&Method::POST, ["api", "cells", id, "terminal", "restart"]) => {
            terminals::restart(&engine, Shell, id, &body, &audit).await
        }

        (&Method::POST, ["api", "cells", id, "chat", "terminal"]) => {
            terminals::ensure(&engine, Chat, id, &body).await
        }
        (&Method::GET, ["api", "cells", id, "chat", "terminal", "stream"]) => {
            terminals::stream(&engine, Chat, id).await
        }
        (&Method::POST, ["api", "cells", id, "chat", "terminal", "input"]) => {
            terminals::input(&engine, Chat, id, &body).await
        }
        (&Method::POST, ["api", "cells", id, "chat", "terminal", "resize"]) => {
            terminals::resize(&engine, Chat, id, &body).await
        }
        (&Method::POST, ["api", "cells", id, "chat", "terminal", "restart"]) => {
            terminals::restart(&engine, Chat, id, &body, &audit).await
        }

        (&Method::GET, ["api", "cells", id, "diff"]) => diff::diff(&engine, id).await,
        (&Method::GET, ["api", "cells", id, "activity"]) => {
            activity::list(&engine, id, &query).await
        }
        (&Method::GET, ["api", "cells", id, "timings"]) => {
            activity::timings(&engine, id, &query).await
        }
        (&Method::GET, ["api", "cells", id, "timings", "stream"]) => {
            activity::timings_stream(&engine, id, &query).await
        }

        (&Method::GET, ["api", "cells", id]) => cells::get(&engine, id, &query).await,
        (&Method::DELETE, ["api", "cells", id]) => cells::delete(&engine, id, &audit).await,

        _ => not_found_response(),
    };

    Ok(response)
}

/// Attribution headers recorded on activity-event inserts when present.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub source: Option<String>,
    pub tool: Option<String>,
    pub audit_event: Option<String>,
    pub service_name: Option<String>,
}

impl AuditContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        Self {
            source: get("x-hive-source"),
            tool: get("x-hive-tool"),
            audit_event: get("x-hive-audit-event"),
            service_name: get("x-hive-service-name"),
        }
    }

    pub fn activity(
        &self,
        cell_id: &str,
        action: &str,
        detail: Option<String>,
    ) -> crate::infrastructure::database::NewActivityEvent {
        crate::infrastructure::database::NewActivityEvent {
            cell_id: cell_id.to_string(),
            action: action.to_string(),
            detail,
            source: self.source.clone(),
            tool: self.tool.clone(),
            audit_event: self.audit_event.clone(),
            service_name: self.service_name.clone(),
        }
    }
}

pub fn parse_query(raw: &str) -> HashMap<String, String> {
    form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

pub fn full_body(payload: String) -> ApiBody {
    Full::new(Bytes::from(payload)).boxed()
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ApiBody> {
    let payload = match serde_json::to_string(value) {
        Ok(payload) => payload,
        Err(e) => {
            return plain_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialize response: {e}"),
            );
        }
    };
    let mut response = Response::new(full_body(payload));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn error_response(err: &HiveError) -> Response<ApiBody> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut payload = serde_json::json!({ "message": err.to_string() });
    if let Ok(serde_json::Value::Object(tagged)) = serde_json::to_value(err) {
        if let Some(kind) = tagged.get("kind") {
            payload["kind"] = kind.clone();
        }
    }
    json_response(status, &payload)
}

pub fn internal_error_response(err: &anyhow::Error) -> Response<ApiBody> {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &serde_json::json!({
            "message": err.to_string(),
            "details": format!("{err:#}"),
        }),
    )
}

pub fn not_found_response() -> Response<ApiBody> {
    plain_error(StatusCode::NOT_FOUND, "Not Found".to_string())
}

fn plain_error(status: StatusCode, message: String) -> Response<ApiBody> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
}

pub fn read_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, HiveError> {
    if body.is_empty() {
        return serde_json::from_slice(b"{}")
            .map_err(|e| HiveError::invalid_input("body", e.to_string()));
    }
    serde_json::from_slice(body).map_err(|e| HiveError::invalid_input("body", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_context_reads_hive_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-hive-source", HeaderValue::from_static("cli"));
        headers.insert("x-hive-tool", HeaderValue::from_static("hive-mcp"));
        let audit = AuditContext::from_headers(&headers);
        assert_eq!(audit.source.as_deref(), Some("cli"));
        assert_eq!(audit.tool.as_deref(), Some("hive-mcp"));
        assert!(audit.audit_event.is_none());

        let event = audit.activity("c1", "setup_retry", None);
        assert_eq!(event.cell_id, "c1");
        assert_eq!(event.source.as_deref(), Some("cli"));
    }

    #[test]
    fn query_parsing_decodes_pairs() {
        let query = parse_query("workspaceId=w1&includeSetupLog=true");
        assert_eq!(query.get("workspaceId").map(String::as_str), Some("w1"));
        assert_eq!(
            query.get("includeSetupLog").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn error_payload_carries_message_and_kind() {
        let err = HiveError::CellNotFound {
            cell_id: "c1".into(),
        };
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn empty_body_parses_as_defaults() {
        #[derive(serde::Deserialize)]
        struct Empty {
            #[serde(default)]
            cols: Option<u16>,
        }
        let parsed: Empty = read_json_body(&Bytes::new()).unwrap();
        assert!(parsed.cols.is_none());
    }
}
