//! Endpoint registry: explicit parameter descriptors, argument binding, and
//! the handler traits invoked by the dispatcher.
//!
//! Registration is static: every endpoint's parameter list is built once, by
//! hand, at startup (see [`ParamListBuilder`]) rather than discovered through
//! runtime reflection. This mirrors the teacher's preference for an explicit
//! descriptor over magic — see `DESIGN.md` for the rationale.

mod context;

pub use context::HandlerContext;
use htcp_value::{EncodingError, Fields, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Whether an endpoint is a request/response transaction or a pushed subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Transaction,
    Subscription,
}

/// The wire-level shape a declared parameter is allowed to take. Checked by
/// [`bind_args`] before a handler ever sees the value, so a mistyped argument
/// fails the call as a [`BindError::TypeMismatch`] (surfaced as `bad_request`)
/// instead of reaching the handler body as a `handler_error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Seq,
    Map,
    Record,
}

impl ValueKind {
    fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ValueKind::Null, Value::Null)
                | (ValueKind::Bool, Value::Bool(_))
                | (ValueKind::Int, Value::Int(_))
                | (ValueKind::Float, Value::Float(_))
                | (ValueKind::String, Value::String(_))
                | (ValueKind::Bytes, Value::Bytes(_))
                | (ValueKind::Seq, Value::Seq(_))
                | (ValueKind::Map, Value::Map(_))
                | (ValueKind::Record, Value::Record(..))
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Bytes => "bytes",
            ValueKind::Seq => "sequence",
            ValueKind::Map => "mapping",
            ValueKind::Record => "record",
        }
    }
}

/// One declared handler parameter: name, an optional type hint enforced by
/// [`bind_args`], and an optional default used when the caller omits it.
#[derive(Clone, Debug)]
pub struct ParamDesc {
    pub name: String,
    pub type_hint: Option<ValueKind>,
    pub default: Option<Value>,
}

/// Builds an endpoint's ordered parameter list at registration time.
#[derive(Default)]
pub struct ParamListBuilder {
    params: Vec<ParamDesc>,
}

impl ParamListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required parameter with no default.
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamDesc {
            name: name.into(),
            type_hint: None,
            default: None,
        });
        self
    }

    /// Add a required parameter, rejecting any argument that doesn't match `type_hint`.
    pub fn required_typed(mut self, name: impl Into<String>, type_hint: ValueKind) -> Self {
        self.params.push(ParamDesc {
            name: name.into(),
            type_hint: Some(type_hint),
            default: None,
        });
        self
    }

    /// Add an optional parameter with a default value.
    pub fn with_default(mut self, name: impl Into<String>, default: Value) -> Self {
        self.params.push(ParamDesc {
            name: name.into(),
            type_hint: None,
            default: Some(default),
        });
        self
    }

    pub fn build(self) -> Vec<ParamDesc> {
        self.params
    }
}

/// Error produced while binding a `CALL`/`SUBSCRIBE` keyword mapping to an
/// endpoint's declared parameters. The dispatcher reports this as a
/// wire-visible `bad_request` error.
#[derive(Debug)]
pub enum BindError {
    MissingArgument(String),
    UnexpectedArgument(String),
    TypeMismatch { name: String, expected: ValueKind, found: String },
    Encoding(EncodingError),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::MissingArgument(name) => write!(f, "missing argument `{name}`"),
            BindError::UnexpectedArgument(name) => write!(f, "unexpected argument `{name}`"),
            BindError::TypeMismatch { name, expected, found } => {
                write!(f, "argument `{name}` must be {}, found {found}", expected.as_str())
            }
            BindError::Encoding(e) => write!(f, "argument encoding error: {e}"),
        }
    }
}

impl std::error::Error for BindError {}

impl From<EncodingError> for BindError {
    fn from(e: EncodingError) -> Self {
        BindError::Encoding(e)
    }
}

/// Bind a request's keyword mapping to `params`, in declaration order.
///
/// 1. For each declared parameter, consume the mapping entry of the same
///    name; if absent and a default exists, use the default; otherwise fail.
/// 2. If the parameter declares a type hint, the resolved value must match it.
/// 3. Leftover mapping entries (none consumed by any parameter) are a bad request.
pub fn bind_args(params: &[ParamDesc], mut args: Fields) -> Result<Vec<Value>, BindError> {
    let mut bound = Vec::with_capacity(params.len());
    for param in params {
        let value = match args.shift_remove(&param.name) {
            Some(v) => v,
            None => match &param.default {
                Some(default) => default.clone(),
                None => return Err(BindError::MissingArgument(param.name.clone())),
            },
        };
        if let Some(expected) = param.type_hint {
            if !expected.matches(&value) {
                return Err(BindError::TypeMismatch {
                    name: param.name.clone(),
                    expected,
                    found: value.type_name(),
                });
            }
        }
        bound.push(value);
    }
    if let Some((extra_name, _)) = args.into_iter().next() {
        return Err(BindError::UnexpectedArgument(extra_name));
    }
    Ok(bound)
}

/// Error returned by a handler's own logic (as opposed to binding or wire errors).
#[derive(Debug, Clone)]
pub struct HandlerError(pub String);

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError(s.to_string())
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A transaction handler: runs once to completion and produces a single reply.
pub trait TransactionHandler: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        args: Vec<Value>,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Result<Value, HandlerError>>;
}

impl<F> TransactionHandler for F
where
    F: for<'a> Fn(Vec<Value>, &'a HandlerContext) -> BoxFuture<'a, Result<Value, HandlerError>>
        + Send
        + Sync
        + 'static,
{
    fn call<'a>(
        &'a self,
        args: Vec<Value>,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Result<Value, HandlerError>> {
        (self)(args, ctx)
    }
}

/// A live subscription's lazy item source, pulled by the subscription engine.
///
/// One instance is created per accepted `SUBSCRIBE`; `next()` is awaited
/// repeatedly until it returns `Ok(None)` (normal end) or `Err` (failure).
/// Dropping the handler (on cancellation) is the signal to stop producing.
pub trait SubscriptionHandler: Send + 'static {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<Value>, HandlerError>>;
}

/// Creates a fresh [`SubscriptionHandler`] for one accepted `SUBSCRIBE` request.
pub trait SubscriptionFactory: Send + Sync + 'static {
    fn create<'a>(
        &'a self,
        args: Vec<Value>,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Result<Box<dyn SubscriptionHandler>, HandlerError>>;
}

impl<F> SubscriptionFactory for F
where
    F: for<'a> Fn(
            Vec<Value>,
            &'a HandlerContext,
        ) -> BoxFuture<'a, Result<Box<dyn SubscriptionHandler>, HandlerError>>
        + Send
        + Sync
        + 'static,
{
    fn create<'a>(
        &'a self,
        args: Vec<Value>,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Result<Box<dyn SubscriptionHandler>, HandlerError>> {
        (self)(args, ctx)
    }
}

struct TransactionEndpoint {
    params: Vec<ParamDesc>,
    handler: Box<dyn TransactionHandler>,
}

struct SubscriptionEndpoint {
    params: Vec<ParamDesc>,
    factory: Box<dyn SubscriptionFactory>,
}

/// Error returned when registering a duplicate code for a given endpoint kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateEndpoint {
    pub kind: EndpointKind,
    pub code: String,
}

impl std::fmt::Display for DuplicateEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "a {:?} endpoint named `{}` is already registered",
            self.kind, self.code
        )
    }
}

impl std::error::Error for DuplicateEndpoint {}

/// Immutable-after-startup table of registered transactions and subscriptions.
#[derive(Default)]
pub struct Registry {
    transactions: HashMap<String, TransactionEndpoint>,
    subscriptions: HashMap<String, SubscriptionEndpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transaction(
        &mut self,
        code: impl Into<String>,
        params: Vec<ParamDesc>,
        handler: impl TransactionHandler,
    ) -> Result<(), DuplicateEndpoint> {
        let code = code.into();
        if self.transactions.contains_key(&code) {
            return Err(DuplicateEndpoint {
                kind: EndpointKind::Transaction,
                code,
            });
        }
        self.transactions.insert(
            code,
            TransactionEndpoint {
                params,
                handler: Box::new(handler),
            },
        );
        Ok(())
    }

    pub fn register_subscription(
        &mut self,
        code: impl Into<String>,
        params: Vec<ParamDesc>,
        factory: impl SubscriptionFactory,
    ) -> Result<(), DuplicateEndpoint> {
        let code = code.into();
        if self.subscriptions.contains_key(&code) {
            return Err(DuplicateEndpoint {
                kind: EndpointKind::Subscription,
                code,
            });
        }
        self.subscriptions.insert(
            code,
            SubscriptionEndpoint {
                params,
                factory: Box::new(factory),
            },
        );
        Ok(())
    }

    pub fn transaction_codes(&self) -> Vec<String> {
        self.transactions.keys().cloned().collect()
    }

    pub fn subscription_codes(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub(crate) fn transaction_params(&self, code: &str) -> Option<&[ParamDesc]> {
        self.transactions.get(code).map(|e| e.params.as_slice())
    }

    pub(crate) fn subscription_params(&self, code: &str) -> Option<&[ParamDesc]> {
        self.subscriptions.get(code).map(|e| e.params.as_slice())
    }

    pub fn transaction_handler(&self, code: &str) -> Option<&dyn TransactionHandler> {
        self.transactions.get(code).map(|e| e.handler.as_ref())
    }

    pub fn subscription_factory(&self, code: &str) -> Option<&dyn SubscriptionFactory> {
        self.subscriptions.get(code).map(|e| e.factory.as_ref())
    }

    pub fn has_transaction(&self, code: &str) -> bool {
        self.transactions.contains_key(code)
    }

    pub fn has_subscription(&self, code: &str) -> bool {
        self.subscriptions.contains_key(code)
    }

    /// Bind a `CALL`'s keyword mapping against a registered transaction's parameters.
    pub fn bind_transaction_args(
        &self,
        code: &str,
        args: Fields,
    ) -> Option<Result<Vec<Value>, BindError>> {
        self.transaction_params(code).map(|params| bind_args(params, args))
    }

    /// Bind a `SUBSCRIBE`'s keyword mapping against a registered subscription's parameters.
    pub fn bind_subscription_args(
        &self,
        code: &str,
        args: Fields,
    ) -> Option<Result<Vec<Value>, BindError>> {
        self.subscription_params(code).map(|params| bind_args(params, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_in_declared_order_and_applies_defaults() {
        let params = ParamListBuilder::new()
            .required("name")
            .with_default("greeting", Value::String("hi".into()))
            .build();

        let mut args = Fields::new();
        args.insert("name".into(), Value::String("Ann".into()));
        let bound = bind_args(&params, args).unwrap();
        assert_eq!(bound, vec![Value::String("Ann".into()), Value::String("hi".into())]);
    }

    #[test]
    fn missing_required_argument_is_bad_request() {
        let params = ParamListBuilder::new().required("name").build();
        let err = bind_args(&params, Fields::new()).unwrap_err();
        assert!(matches!(err, BindError::MissingArgument(n) if n == "name"));
    }

    #[test]
    fn mistyped_argument_is_bad_request() {
        let params = ParamListBuilder::new().required_typed("count", ValueKind::Int).build();
        let mut args = Fields::new();
        args.insert("count".into(), Value::String("not a number".into()));
        let err = bind_args(&params, args).unwrap_err();
        assert!(matches!(err, BindError::TypeMismatch { name, expected: ValueKind::Int, .. } if name == "count"));
    }

    #[test]
    fn unexpected_argument_is_bad_request() {
        let params = ParamListBuilder::new().required("name").build();
        let mut args = Fields::new();
        args.insert("name".into(), Value::String("Ann".into()));
        args.insert("extra".into(), Value::Null);
        let err = bind_args(&params, args).unwrap_err();
        assert!(matches!(err, BindError::UnexpectedArgument(n) if n == "extra"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register_transaction("echo", vec![], |args: Vec<Value>, _ctx: &HandlerContext| {
                Box::pin(async move { Ok(args.into_iter().next().unwrap_or(Value::Null)) })
                    as BoxFuture<'static, Result<Value, HandlerError>>
            })
            .unwrap();

        let err = registry
            .register_transaction("echo", vec![], |_args: Vec<Value>, _ctx: &HandlerContext| {
                Box::pin(async move { Ok(Value::Null) }) as BoxFuture<'static, Result<Value, HandlerError>>
            })
            .unwrap_err();
        assert_eq!(err.code, "echo");
    }
}
