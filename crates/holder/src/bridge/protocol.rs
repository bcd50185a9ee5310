//! Wire protocol types for host-worker communication.
//!
//! Two unidirectional pipes, inherited by the worker beyond its stdio:
//! - **fd 3** (host → worker): `WorkerRequest` frames, both calls and cancels
//! - **fd 4** (worker → host): `WorkerResponse` frames
//!
//! stdout/stderr are diagnostic only and never carry protocol frames.

use serde::{Deserialize, Serialize};

/// Export invoked when a request names no method.
pub const DEFAULT_METHOD: &str = "default";

/// Host-assigned sequence number for a call.
///
/// Monotonic per host and never reused, so a live id is always unique on
/// the wire. Serialized as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl CallId {
    pub(crate) fn from_seq(seq: u64) -> Self {
        Self(seq)
    }

    /// Parse a wire id. Zero and non-numeric ids never name a call.
    pub fn parse(s: &str) -> Option<Self> {
        match s.parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(seq) => Some(Self(seq)),
        }
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from host to worker.
///
/// A request with `cancel` set is a control message: a non-empty `id`
/// aborts that call, an empty `id` asks the worker to exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(default)]
    pub import: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,

    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel: bool,
}

impl WorkerRequest {
    pub fn call(
        id: impl Into<String>,
        import: impl Into<String>,
        method: Option<String>,
        args: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            import: import.into(),
            method,
            args,
            id: id.into(),
            cancel: false,
        }
    }

    pub fn cancel(id: impl Into<String>) -> Self {
        Self {
            import: String::new(),
            method: None,
            args: Vec::new(),
            id: id.into(),
            cancel: true,
        }
    }

    pub fn shutdown() -> Self {
        Self::cancel(String::new())
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel && self.id.is_empty()
    }

    pub fn method_name(&self) -> &str {
        self.method.as_deref().unwrap_or(DEFAULT_METHOD)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Err,
}

/// Messages from worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,

    pub status: ResponseStatus,

    /// Return value; absent when the export returned nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errtext: Option<String>,
}

impl WorkerResponse {
    pub fn ok(id: impl Into<String>, res: Option<serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Ok,
            res,
            errtext: None,
        }
    }

    pub fn err(id: impl Into<String>, errtext: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Err,
            res: None,
            errtext: Some(errtext.into()),
        }
    }

    /// Split into the return value or the worker's error text.
    pub fn into_result(self) -> Result<Option<serde_json::Value>, String> {
        match self.status {
            ResponseStatus::Ok => Ok(self.res),
            ResponseStatus::Err => Err(self.errtext.unwrap_or_default()),
        }
    }
}

/// Which diagnostic stream a worker line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_id_parse() {
        assert_eq!(CallId::parse("12"), Some(CallId(12)));
        assert_eq!(CallId::parse("0"), None);
        assert_eq!(CallId::parse(""), None);
        assert_eq!(CallId::parse("-3"), None);
        assert_eq!(CallId::parse("abc"), None);
        assert_eq!(CallId(42).to_string(), "42");
    }

    #[test]
    fn call_request_serializes() {
        let req = WorkerRequest::call("1", "m.js", Some("inc".to_string()), vec![json!(5)]);
        insta::assert_json_snapshot!(req, @r#"
        {
          "import": "m.js",
          "method": "inc",
          "args": [
            5
          ],
          "id": "1"
        }
        "#);
    }

    #[test]
    fn default_method_call_omits_method_and_args() {
        let req = WorkerRequest::call("2", "./other.ts", None, Vec::new());
        insta::assert_json_snapshot!(req, @r#"
        {
          "import": "./other.ts",
          "id": "2"
        }
        "#);
        assert_eq!(req.method_name(), "default");
    }

    #[test]
    fn cancel_serializes() {
        let req = WorkerRequest::cancel("3");
        insta::assert_json_snapshot!(req, @r#"
        {
          "import": "",
          "id": "3",
          "cancel": true
        }
        "#);
        assert!(!req.is_shutdown());
    }

    #[test]
    fn shutdown_serializes() {
        let req = WorkerRequest::shutdown();
        insta::assert_json_snapshot!(req, @r#"
        {
          "import": "",
          "id": "",
          "cancel": true
        }
        "#);
        assert!(req.is_shutdown());
    }

    #[test]
    fn shutdown_without_id_field_parses() {
        let req: WorkerRequest = serde_json::from_str(r#"{"cancel":true}"#).unwrap();
        assert!(req.is_shutdown());
    }

    #[test]
    fn ok_response_serializes() {
        let resp = WorkerResponse::ok("1", Some(json!(6)));
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "1",
          "status": "ok",
          "res": 6
        }
        "#);
    }

    #[test]
    fn ok_response_without_value_omits_res() {
        let resp = WorkerResponse::ok("5", None);
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "5",
          "status": "ok"
        }
        "#);
    }

    #[test]
    fn err_response_serializes() {
        let resp = WorkerResponse::err("2", "Error: boom");
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "2",
          "status": "err",
          "errtext": "Error: boom"
        }
        "#);
    }

    #[test]
    fn response_into_result() {
        let ok: WorkerResponse = serde_json::from_str(r#"{"id":"1","status":"ok","res":[1,2]}"#).unwrap();
        assert_eq!(ok.into_result(), Ok(Some(json!([1, 2]))));

        let err: WorkerResponse = serde_json::from_str(r#"{"id":"1","status":"err"}"#).unwrap();
        assert_eq!(err.into_result(), Err(String::new()));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let parsed = serde_json::from_str::<WorkerResponse>(r#"{"id":"1","status":"maybe"}"#);
        assert!(parsed.is_err());
    }
}
