//! JSON-RPC message types exchanged with the analysis server.

use std::path::{Path, PathBuf};
use std::process;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{MessageSeverity, ProgressEvent, ServerMessage, TraceLevel};

pub(crate) const PROGRESS_METHOD: &str = "$/progress";
pub(crate) const SHOW_MESSAGE_METHOD: &str = "window/showMessage";
pub(crate) const LOG_MESSAGE_METHOD: &str = "window/logMessage";
pub(crate) const DID_CHANGE_CONFIGURATION_METHOD: &str = "workspace/didChangeConfiguration";
pub(crate) const SET_TRACE_METHOD: &str = "$/setTrace";
/// Routed by the reader when an inbound frame can't be decoded. Never sent
/// on the wire; params are `{ "reason": <text> }`.
pub(crate) const UNDECODABLE_FRAME_METHOD: &str = "$/grails/undecodableFrame";

/// JSON-RPC error code for an unhandled server request.
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Reply to a request the server sent us.
pub(crate) fn response(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub(crate) fn error_response(id: &serde_json::Value, code: i64, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

pub(crate) fn initialize_params(
    root_uri: Option<&str>,
    initialization_options: &serde_json::Value,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "window": {
                "workDoneProgress": true,
                "showMessage": { "messageActionItem": { "additionalPropertiesSupport": false } }
            },
            "workspace": {
                "configuration": false,
                "didChangeConfiguration": { "dynamicRegistration": false }
            }
        },
    });
    if let Some(uri) = root_uri {
        params["workspaceFolders"] = serde_json::json!([{ "uri": uri, "name": "workspace" }]);
    }
    if !initialization_options.is_null() {
        params["initializationOptions"] = initialization_options.clone();
    }
    params
}

pub(crate) fn did_change_configuration_params(settings: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "settings": settings })
}

pub(crate) fn set_trace_params(level: TraceLevel) -> serde_json::Value {
    serde_json::json!({ "value": level.as_str() })
}

/// `$/progress` params as they arrive on the wire.
#[derive(Debug, Deserialize)]
pub(crate) struct ProgressParams {
    pub token: ProgressToken,
    pub value: WorkDoneProgress,
}

/// Tokens may be strings or integers; both are matched as strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ProgressToken {
    String(String),
    Number(i64),
}

impl ProgressToken {
    pub fn into_string(self) -> String {
        match self {
            Self::String(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkDoneProgress {
    pub kind: String,
    pub title: Option<String>,
    pub message: Option<String>,
    pub percentage: Option<f64>,
}

impl WorkDoneProgress {
    /// Decode into a [`ProgressEvent`]. Unknown kinds keep their raw value.
    pub fn into_event(self, token: &str) -> Result<ProgressEvent, ProtocolError> {
        let percentage = self.percentage.map(|p| p.clamp(0.0, 100.0).round() as u32);
        match self.kind.as_str() {
            "begin" => Ok(ProgressEvent::Begin {
                title: self.title.unwrap_or_default(),
                message: self.message,
                percentage,
            }),
            "report" => Ok(ProgressEvent::Report {
                message: self.message,
                percentage,
            }),
            "end" => Ok(ProgressEvent::End {
                message: self.message,
            }),
            _ => Err(ProtocolError::UnknownProgressKind {
                token: token.to_string(),
                raw: self.kind,
            }),
        }
    }
}

/// `window/showMessage` and `window/logMessage` params.
#[derive(Debug, Deserialize)]
pub(crate) struct MessageParams {
    #[serde(rename = "type")]
    pub kind: i64,
    pub message: String,
}

impl MessageParams {
    /// Unknown types are demoted to `Log`, keeping the raw value in the text.
    pub fn into_message(self) -> ServerMessage {
        match MessageSeverity::from_lsp(self.kind) {
            Some(severity) => ServerMessage::new(severity, self.message),
            None => ServerMessage::new(
                MessageSeverity::Log,
                format!("unknown message type {}: {}", self.kind, self.message),
            ),
        }
    }
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_params_advertise_work_done_progress() {
        let params = initialize_params(Some("file:///workspace"), &serde_json::Value::Null);
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///workspace");
        assert_eq!(params["capabilities"]["window"]["workDoneProgress"], true);
        assert_eq!(params["workspaceFolders"][0]["uri"], "file:///workspace");
        assert!(params.get("initializationOptions").is_none());
    }

    #[test]
    fn initialize_params_without_root_send_null_root() {
        let options = serde_json::json!({ "javaHome": "/opt/jdk" });
        let params = initialize_params(None, &options);
        assert!(params["rootUri"].is_null());
        assert!(params.get("workspaceFolders").is_none());
        assert_eq!(params["initializationOptions"]["javaHome"], "/opt/jdk");
    }

    #[test]
    fn did_change_configuration_wraps_settings() {
        let settings = serde_json::json!({ "grails": { "maxItems": 100 } });
        let params = did_change_configuration_params(&settings);
        assert_eq!(params["settings"]["grails"]["maxItems"], 100);
    }

    #[test]
    fn progress_begin_decodes() {
        let params: ProgressParams = serde_json::from_value(serde_json::json!({
            "token": "GLS-SERVER-SETUP",
            "value": { "kind": "begin", "title": "Setup", "message": "Compiling", "percentage": 12.6 }
        }))
        .unwrap();
        let token = params.token.into_string();
        let event = params.value.into_event(&token).unwrap();
        assert_eq!(
            event,
            ProgressEvent::Begin {
                title: "Setup".to_string(),
                message: Some("Compiling".to_string()),
                percentage: Some(13),
            }
        );
    }

    #[test]
    fn numeric_progress_token_is_stringified() {
        let params: ProgressParams = serde_json::from_value(serde_json::json!({
            "token": 7,
            "value": { "kind": "end" }
        }))
        .unwrap();
        assert_eq!(params.token.into_string(), "7");
    }

    #[test]
    fn unknown_progress_kind_keeps_raw_value() {
        let value = WorkDoneProgress {
            kind: "pause".to_string(),
            title: None,
            message: None,
            percentage: None,
        };
        let err = value.into_event("grails-index").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnknownProgressKind {
                token: "grails-index".to_string(),
                raw: "pause".to_string(),
            }
        );
    }

    #[test]
    fn unknown_message_type_demoted_to_log_with_raw_value() {
        let params: MessageParams =
            serde_json::from_value(serde_json::json!({ "type": 9, "message": "odd" })).unwrap();
        let msg = params.into_message();
        assert_eq!(msg.severity, MessageSeverity::Log);
        assert_eq!(msg.text, "unknown message type 9: odd");
    }

    #[test]
    fn request_serialization_omits_missing_params() {
        let json = serde_json::to_value(Request::new(1, "shutdown", None)).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert!(json.get("params").is_none(), "params must be omitted, not null");
    }

    #[test]
    fn notification_has_no_id() {
        let json = serde_json::to_value(Notification::new("initialized", Some(serde_json::json!({}))))
            .unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["method"], "initialized");
    }

    #[test]
    fn responses_echo_request_id() {
        let id = serde_json::json!("abc");
        assert_eq!(response(&id, serde_json::Value::Null)["id"], "abc");
        let err = error_response(&id, METHOD_NOT_FOUND, "Method not found: x");
        assert_eq!(err["error"]["code"], -32601);
    }

    #[test]
    fn set_trace_uses_wire_names() {
        assert_eq!(set_trace_params(TraceLevel::Verbose)["value"], "verbose");
    }
}
