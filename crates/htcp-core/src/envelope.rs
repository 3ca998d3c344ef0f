//! Payload shapes for the handshake and call/subscribe request frames.
//!
//! These are internal wire envelopes, not user records, so they are encoded
//! by hand against [`htcp_value::Value`] rather than through [`htcp_value::Record`].

use htcp_value::{EncodingError, Fields, Value};

/// The `WELCOME`/`INFO_REP` payload: server identity plus, optionally, the
/// list of registered transaction codes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub transactions: Option<Vec<String>>,
}

impl ServerInfo {
    /// The value returned by a client's `server_info()` before `connect()` has run.
    pub fn unknown() -> Self {
        Self {
            server_name: "unknown".to_string(),
            host: String::new(),
            port: 0,
            connected: false,
            transactions: None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut fields = Fields::new();
        fields.insert("server_name".into(), Value::String(self.server_name.clone()));
        let mut addr = Fields::new();
        addr.insert("host".into(), Value::String(self.host.clone()));
        addr.insert("port".into(), Value::Int(self.port as i64));
        fields.insert("server_addr".into(), Value::Map(addr));
        fields.insert("connected".into(), Value::Bool(self.connected));
        if let Some(codes) = &self.transactions {
            fields.insert(
                "transactions".into(),
                Value::Seq(codes.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Map(fields)
    }

    pub fn from_value(value: Value) -> Result<Self, EncodingError> {
        let Value::Map(mut fields) = value else {
            return Err(EncodingError::TypeMismatch {
                expected: "mapping",
                found: value.type_name(),
            });
        };
        let server_name = match fields.shift_remove("server_name") {
            Some(Value::String(s)) => s,
            _ => return Err(EncodingError::MissingField("server_name".into())),
        };
        let (host, port) = match fields.shift_remove("server_addr") {
            Some(Value::Map(mut addr)) => {
                let host = match addr.shift_remove("host") {
                    Some(Value::String(s)) => s,
                    _ => return Err(EncodingError::MissingField("host".into())),
                };
                let port = match addr.shift_remove("port") {
                    Some(Value::Int(p)) => p as u16,
                    _ => return Err(EncodingError::MissingField("port".into())),
                };
                (host, port)
            }
            _ => return Err(EncodingError::MissingField("server_addr".into())),
        };
        let connected = match fields.shift_remove("connected") {
            Some(Value::Bool(b)) => b,
            _ => return Err(EncodingError::MissingField("connected".into())),
        };
        let transactions = match fields.shift_remove("transactions") {
            Some(Value::Seq(items)) => Some(
                items
                    .into_iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s),
                        other => Err(EncodingError::TypeMismatch {
                            expected: "string",
                            found: other.type_name(),
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => None,
        };
        Ok(Self {
            server_name,
            host,
            port,
            connected,
            transactions,
        })
    }
}

/// The payload of a `CALL` or `SUBSCRIBE` frame: the target code plus keyword args.
pub struct Request {
    pub code: String,
    pub args: Fields,
}

impl Request {
    /// `code_field` is `"transaction"` for `CALL`, `"event_type"` for `SUBSCRIBE`.
    pub fn to_value(&self, code_field: &str) -> Value {
        let mut fields = Fields::new();
        fields.insert(code_field.to_string(), Value::String(self.code.clone()));
        fields.insert("args".into(), Value::Map(self.args.clone()));
        Value::Map(fields)
    }

    pub fn from_value(value: Value, code_field: &str) -> Result<Self, EncodingError> {
        let Value::Map(mut fields) = value else {
            return Err(EncodingError::TypeMismatch {
                expected: "mapping",
                found: value.type_name(),
            });
        };
        let code = match fields.shift_remove(code_field) {
            Some(Value::String(s)) => s,
            _ => return Err(EncodingError::MissingField(code_field.to_string())),
        };
        let args = match fields.shift_remove("args") {
            Some(Value::Map(m)) => m,
            Some(other) => {
                return Err(EncodingError::TypeMismatch {
                    expected: "mapping",
                    found: other.type_name(),
                });
            }
            None => Fields::new(),
        };
        Ok(Self { code, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_round_trips_with_transactions() {
        let info = ServerInfo {
            server_name: "example".into(),
            host: "127.0.0.1".into(),
            port: 2353,
            connected: true,
            transactions: Some(vec!["get_welcome".into(), "upload_file".into()]),
        };
        let decoded = ServerInfo::from_value(info.to_value()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn server_info_round_trips_without_transactions() {
        let info = ServerInfo {
            server_name: "example".into(),
            host: "127.0.0.1".into(),
            port: 2353,
            connected: true,
            transactions: None,
        };
        let decoded = ServerInfo::from_value(info.to_value()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn request_round_trips() {
        let mut args = Fields::new();
        args.insert("client_name".into(), Value::String("John".into()));
        let req = Request {
            code: "get_welcome".into(),
            args,
        };
        let value = req.to_value("transaction");
        let decoded = Request::from_value(value, "transaction").unwrap();
        assert_eq!(decoded.code, "get_welcome");
        assert_eq!(decoded.args.get("client_name"), Some(&Value::String("John".into())));
    }
}
