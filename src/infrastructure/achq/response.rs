//! The two wire formats the gateway answers in, normalized to one shape.

use serde_json::{Map, Value};

/// Key under which list-shaped results (status tracking reports) are kept.
pub const RECORDS_KEY: &str = "Transactions";

/// A gateway answer reduced to a success flag, its raw fields and, for
/// failures, a code and message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedResponse {
    pub success: bool,
    pub fields: Map<String, Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl NormalizedResponse {
    pub fn failure(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            fields: Map::new(),
            error_code: code,
            error_message: Some(message.into()),
        }
    }

    /// A field as trimmed text. Blank values count as absent.
    pub fn text(&self, key: &str) -> Option<String> {
        text_field(&self.fields, key)
    }

    /// List-shaped results. A single object stands for a list of one.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        match self.fields.get(RECORDS_KEY) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .collect(),
            Some(Value::Object(item)) => vec![item.clone()],
            _ => Vec::new(),
        }
    }
}

pub fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    let text = match fields.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

pub trait ResponseParser: Send + Sync {
    /// Splits a body into its fields without judging success.
    fn fields(&self, raw: &str) -> Result<Map<String, Value>, String>;

    /// Applies the format's success rule to already split fields.
    fn classify(&self, fields: Map<String, Value>) -> NormalizedResponse;

    fn parse(&self, raw: &str) -> NormalizedResponse {
        if raw.trim().is_empty() {
            return NormalizedResponse::failure(None, "Empty response");
        }
        match self.fields(raw) {
            Ok(fields) => self.classify(fields),
            Err(message) => NormalizedResponse::failure(None, message),
        }
    }
}

/// `CommandVersion=2.0` JSON answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonResponseParser;

impl ResponseParser for JsonResponseParser {
    fn fields(&self, raw: &str) -> Result<Map<String, Value>, String> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(fields)) => Ok(fields),
            Ok(_) => Err("Invalid JSON response: expected an object".to_string()),
            Err(e) => Err(format!("Invalid JSON response: {e}")),
        }
    }

    fn classify(&self, fields: Map<String, Value>) -> NormalizedResponse {
        let approved = text_field(&fields, "CommandStatus")
            .is_some_and(|status| status.eq_ignore_ascii_case("approved"));
        let response_code = text_field(&fields, "ResponseCode");
        if approved || response_code.as_deref() == Some("000") {
            return NormalizedResponse {
                success: true,
                fields,
                ..NormalizedResponse::default()
            };
        }

        let message = text_field(&fields, "Description")
            .or_else(|| match fields.get("ErrorInformation") {
                Some(Value::Object(info)) => text_field(info, "Message"),
                Some(Value::String(info)) if !info.trim().is_empty() => {
                    Some(info.trim().to_string())
                }
                _ => None,
            })
            .unwrap_or_else(|| "Unknown error".to_string());
        NormalizedResponse {
            success: false,
            fields,
            error_code: response_code,
            error_message: Some(message),
        }
    }
}

/// Legacy `Key=Value|Key=Value` answers.
///
/// The first line holds the response fields. Any further non-empty line is a
/// record of a list result and is collected under [`RECORDS_KEY`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DelimitedResponseParser;

fn split_pairs(line: &str) -> Map<String, Value> {
    line.split('|')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), Value::String(value.trim().to_string())))
        .collect()
}

impl ResponseParser for DelimitedResponseParser {
    fn fields(&self, raw: &str) -> Result<Map<String, Value>, String> {
        let mut lines = raw.trim().lines().map(str::trim).filter(|l| !l.is_empty());
        let mut fields = lines.next().map(split_pairs).unwrap_or_default();
        let records: Vec<Value> = lines.map(|line| Value::Object(split_pairs(line))).collect();
        if !records.is_empty() {
            fields.insert(RECORDS_KEY.to_string(), Value::Array(records));
        }
        Ok(fields)
    }

    fn classify(&self, fields: Map<String, Value>) -> NormalizedResponse {
        let status = text_field(&fields, "Status").unwrap_or_default();
        if ["APPROVED", "SUCCESS", "OK"]
            .iter()
            .any(|ok| status.eq_ignore_ascii_case(ok))
        {
            return NormalizedResponse {
                success: true,
                fields,
                ..NormalizedResponse::default()
            };
        }

        let message = text_field(&fields, "Message")
            .or_else(|| text_field(&fields, "ErrorMessage"))
            .unwrap_or_else(|| "Unknown error".to_string());
        let code = text_field(&fields, "ErrorCode").or_else(|| text_field(&fields, "Code"));
        NormalizedResponse {
            success: false,
            fields,
            error_code: code,
            error_message: Some(message),
        }
    }
}
