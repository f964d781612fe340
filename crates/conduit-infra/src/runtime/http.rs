//! The `http` function for `call` tasks.
//!
//! Recognized arguments:
//! - `method` -- HTTP method, default `get`
//! - `endpoint` -- URI string, or an object with a `uri` field
//! - `headers` / `query` -- objects of scalar values
//! - `body` -- any JSON value, sent as a JSON body
//! - `output` -- `content` (default), `response` or `raw`
//!
//! A non-2xx response is a `communication` error carrying the status code,
//! or an `authentication` error for 401 and 403.

use std::collections::BTreeMap;

use conduit_core::workflow::capability::{CallRequest, FunctionCaller};
use conduit_types::error::TaskError;
use serde_json::{json, Map, Value};

/// Name the caller is registered under in `Capabilities`.
pub const HTTP_FUNCTION: &str = "http";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    /// Response body, parsed as JSON when possible.
    Content,
    /// `{status, headers, body}`.
    Response,
    /// Response body as a string.
    Raw,
}

#[derive(Debug, Clone)]
pub struct HttpCaller {
    client: reqwest::Client,
}

impl HttpCaller {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("conduit/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl FunctionCaller for HttpCaller {
    async fn call(&self, request: CallRequest) -> Result<Value, TaskError> {
        let task = request.reference.as_str();
        let args = &request.arguments;

        let method_name = string_arg(args, "method")?.unwrap_or("get");
        let method: reqwest::Method = method_name
            .to_uppercase()
            .parse()
            .map_err(|_| TaskError::configuration(format!("invalid HTTP method '{method_name}'")))?;
        let uri = endpoint(args)?;
        let format = match string_arg(args, "output")? {
            None | Some("content") => OutputFormat::Content,
            Some("response") => OutputFormat::Response,
            Some("raw") => OutputFormat::Raw,
            Some(other) => {
                return Err(TaskError::configuration(format!(
                    "unsupported http output format '{other}'"
                )));
            }
        };

        let mut builder = self.client.request(method.clone(), uri);
        for (name, value) in scalar_map(args, "headers")? {
            builder = builder.header(name, value);
        }
        let query = scalar_map(args, "query")?;
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(body) = args.get("body").filter(|b| !b.is_null()) {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            let error = if e.is_timeout() {
                TaskError::timeout(format!("HTTP request to '{uri}' timed out"))
            } else {
                TaskError::communication(format!("HTTP request to '{uri}' failed"))
            };
            error.with_detail(e.to_string()).with_instance(task)
        })?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("<binary>").to_string()))
            .collect();
        let text = response.text().await.map_err(|e| {
            TaskError::communication("failed to read HTTP response body")
                .with_detail(e.to_string())
                .with_instance(task)
        })?;

        tracing::debug!(
            task,
            method = %method,
            uri,
            status = status.as_u16(),
            body_len = text.len(),
            "http call completed"
        );

        if !status.is_success() {
            let title = format!("HTTP {method} {uri} returned {status}");
            let error = match status.as_u16() {
                401 | 403 => TaskError::authentication(title),
                _ => TaskError::communication(title),
            };
            return Err(error
                .with_status(status.as_u16())
                .with_detail(text)
                .with_instance(task));
        }

        let content = || serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.clone()));
        Ok(match format {
            OutputFormat::Content => content(),
            OutputFormat::Raw => Value::String(text.clone()),
            OutputFormat::Response => json!({
                "status": status.as_u16(),
                "headers": headers,
                "body": content(),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn string_arg<'a>(args: &'a Map<String, Value>, name: &str) -> Result<Option<&'a str>, TaskError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(TaskError::validation(format!(
            "http argument '{name}' must be a string, got {other}"
        ))),
    }
}

fn endpoint(args: &Map<String, Value>) -> Result<&str, TaskError> {
    let uri = match args.get("endpoint") {
        Some(Value::String(uri)) => Some(uri.as_str()),
        Some(Value::Object(endpoint)) => endpoint.get("uri").and_then(Value::as_str),
        _ => None,
    };
    uri.ok_or_else(|| TaskError::configuration("http call requires an 'endpoint'"))
}

/// Object argument flattened to strings. Non-string scalars are rendered
/// as JSON.
fn scalar_map(args: &Map<String, Value>, name: &str) -> Result<Vec<(String, String)>, TaskError> {
    let entries = match args.get(name) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Object(entries)) => entries,
        Some(other) => {
            return Err(TaskError::validation(format!(
                "http argument '{name}' must be an object, got {other}"
            )));
        }
    };
    entries
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key.clone(), s.clone())),
            Value::Number(_) | Value::Bool(_) => Ok((key.clone(), value.to_string())),
            _ => Err(TaskError::validation(format!(
                "http {name} entry '{key}' must be a scalar"
            ))),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::error::ErrorKind;
    use conduit_types::reference::TaskReference;
    use uuid::Uuid;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn call(arguments: Value) -> CallRequest {
        CallRequest {
            instance_id: Uuid::now_v7(),
            task_id: Uuid::now_v7(),
            reference: TaskReference::root(0, "fetch"),
            function: HTTP_FUNCTION.to_string(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_posts_json_and_parses_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header("x-tenant", "acme"))
            .and(body_json(json!({"sku": "A-1", "qty": 2})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
            .mount(&server)
            .await;

        let caller = HttpCaller::new().unwrap();
        let output = caller
            .call(call(json!({
                "method": "post",
                "endpoint": format!("{}/orders", server.uri()),
                "headers": {"x-tenant": "acme"},
                "body": {"sku": "A-1", "qty": 2},
            })))
            .await
            .unwrap();
        assert_eq!(output, json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_response_output_includes_status_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
            .mount(&server)
            .await;

        let caller = HttpCaller::new().unwrap();
        let output = caller
            .call(call(json!({
                "endpoint": {"uri": format!("{}/items", server.uri())},
                "query": {"page": 2},
                "output": "response",
            })))
            .await
            .unwrap();
        assert_eq!(output["status"], json!(200));
        assert_eq!(output["body"], json!("plain text"));
    }

    #[tokio::test]
    async fn test_error_status_is_a_communication_error() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;

        let caller = HttpCaller::new().unwrap();
        let err = caller
            .call(call(json!({"endpoint": format!("{}/missing", server.uri())})))
            .await
            .unwrap_err();
        assert!(err.is_kind(ErrorKind::Communication));
        assert_eq!(err.status, "404");
        assert_eq!(err.detail.as_deref(), Some("nope"));
        assert_eq!(err.instance.as_deref(), Some("/do/0/fetch"));
    }

    #[tokio::test]
    async fn test_unauthorized_is_an_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(path("/secure"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let caller = HttpCaller::new().unwrap();
        let err = caller
            .call(call(json!({"endpoint": format!("{}/secure", server.uri())})))
            .await
            .unwrap_err();
        assert!(err.is_kind(ErrorKind::Authentication));
        assert_eq!(err.status, "401");
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_a_configuration_error() {
        let caller = HttpCaller::new().unwrap();
        let err = caller.call(call(json!({"method": "get"}))).await.unwrap_err();
        assert!(err.is_kind(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_unknown_output_format_is_rejected() {
        let caller = HttpCaller::new().unwrap();
        let err = caller
            .call(call(json!({"endpoint": "http://localhost:1", "output": "xml"})))
            .await
            .unwrap_err();
        assert!(err.is_kind(ErrorKind::Configuration));
    }
}
