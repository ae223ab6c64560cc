use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::protocol::{parameters, split_values};

/// A single protocol parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameter {
    String(String),
    Array(Vec<String>),
    Json(Value),
}

impl Parameter {
    /// Returns the value when it is a single string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Parameter::String(s) => Some(s),
            _ => None,
        }
    }

    /// Every string value carried by the parameter, in order.
    pub fn values(&self) -> Vec<&str> {
        match self {
            Parameter::String(s) => vec![s.as_str()],
            Parameter::Array(values) => values.iter().map(String::as_str).collect(),
            Parameter::Json(Value::String(s)) => vec![s.as_str()],
            Parameter::Json(Value::Array(values)) => {
                values.iter().filter_map(Value::as_str).collect()
            }
            Parameter::Json(_) => Vec::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Parameter::String(s) => Value::String(s.clone()),
            Parameter::Array(values) => {
                Value::Array(values.iter().cloned().map(Value::String).collect())
            }
            Parameter::Json(value) => value.clone(),
        }
    }

    /// Renders the parameter as a single line for plain-text documents. Line breaks are dropped
    /// so a value can never start a line of its own.
    pub fn to_text(&self) -> String {
        let text = match self {
            Parameter::String(s) => s.clone(),
            Parameter::Array(values) => values.join(", "),
            Parameter::Json(Value::String(s)) => s.clone(),
            Parameter::Json(value) => value.to_string(),
        };
        text.replace(['\r', '\n'], "")
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Parameter::String(s) => s.is_empty(),
            Parameter::Array(values) => values.is_empty(),
            Parameter::Json(Value::Null) => true,
            Parameter::Json(_) => false,
        }
    }
}

impl From<&str> for Parameter {
    fn from(value: &str) -> Self {
        Parameter::String(value.to_string())
    }
}

impl From<String> for Parameter {
    fn from(value: String) -> Self {
        Parameter::String(value)
    }
}

impl From<Vec<String>> for Parameter {
    fn from(value: Vec<String>) -> Self {
        Parameter::Array(value)
    }
}

impl From<Value> for Parameter {
    fn from(value: Value) -> Self {
        Parameter::Json(value)
    }
}

impl From<bool> for Parameter {
    fn from(value: bool) -> Self {
        Parameter::Json(Value::Bool(value))
    }
}

impl From<i64> for Parameter {
    fn from(value: i64) -> Self {
        Parameter::Json(Value::from(value))
    }
}

/// Parameter bag shared by requests and responses.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    parameters: BTreeMap<String, Parameter>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a message from decoded name/value pairs. Repeated names become arrays.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut message = Message::new();
        for (name, value) in pairs {
            let name = name.into();
            let value = value.into();
            let merged = match message.parameters.remove(&name) {
                None => Parameter::String(value),
                Some(Parameter::String(first)) => Parameter::Array(vec![first, value]),
                Some(Parameter::Array(mut values)) => {
                    values.push(value);
                    Parameter::Array(values)
                }
                Some(Parameter::Json(_)) => Parameter::String(value),
            };
            message.parameters.insert(name, merged);
        }
        message
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.get(name)
    }

    /// Returns a non-empty single string value.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .and_then(Parameter::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Sets a parameter, overwriting any existing value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Parameter>) {
        self.parameters.insert(name.into(), value.into());
    }

    /// Sets a parameter only when the message doesn't carry it yet.
    pub fn set_if_absent(&mut self, name: impl Into<String>, value: impl Into<Parameter>) -> bool {
        let name = name.into();
        if self.parameters.contains_key(&name) {
            return false;
        }
        self.parameters.insert(name, value.into());
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<Parameter> {
        self.parameters.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// Copies every parameter of `other` that this message doesn't already carry.
    /// Returns how many parameters were added.
    pub fn merge_missing(&mut self, other: Message) -> usize {
        let mut added = 0;
        for (name, value) in other.parameters {
            if !self.parameters.contains_key(&name) {
                self.parameters.insert(name, value);
                added += 1;
            }
        }
        added
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parameters that carry a value, flattened into name/value pairs (repeated names allowed).
    pub fn to_pairs(&self) -> Vec<(&str, String)> {
        let mut pairs = Vec::new();
        for (name, parameter) in self.iter().filter(|(_, p)| !p.is_empty()) {
            match parameter {
                Parameter::Json(value) if !value.is_string() && !value.is_array() => {
                    pairs.push((name, value.to_string()))
                }
                other => pairs.extend(other.values().into_iter().map(|v| (name, v.to_string()))),
            }
        }
        pairs
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

/// An inbound protocol request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Request(Message);

impl Deref for Request {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.0
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.0
    }
}

impl From<Message> for Request {
    fn from(message: Message) -> Self {
        Request(message)
    }
}

impl Request {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Request(Message::from_pairs(pairs))
    }

    pub fn into_message(self) -> Message {
        self.0
    }

    pub fn access_token(&self) -> Option<&str> {
        self.get_str(parameters::ACCESS_TOKEN)
    }

    pub fn client_id(&self) -> Option<&str> {
        self.get_str(parameters::CLIENT_ID)
    }

    pub fn client_secret(&self) -> Option<&str> {
        self.get_str(parameters::CLIENT_SECRET)
    }

    pub fn code(&self) -> Option<&str> {
        self.get_str(parameters::CODE)
    }

    pub fn code_challenge(&self) -> Option<&str> {
        self.get_str(parameters::CODE_CHALLENGE)
    }

    pub fn code_challenge_method(&self) -> Option<&str> {
        self.get_str(parameters::CODE_CHALLENGE_METHOD)
    }

    pub fn code_verifier(&self) -> Option<&str> {
        self.get_str(parameters::CODE_VERIFIER)
    }

    pub fn device_code(&self) -> Option<&str> {
        self.get_str(parameters::DEVICE_CODE)
    }

    pub fn grant_type(&self) -> Option<&str> {
        self.get_str(parameters::GRANT_TYPE)
    }

    pub fn id_token_hint(&self) -> Option<&str> {
        self.get_str(parameters::ID_TOKEN_HINT)
    }

    pub fn nonce(&self) -> Option<&str> {
        self.get_str(parameters::NONCE)
    }

    pub fn post_logout_redirect_uri(&self) -> Option<&str> {
        self.get_str(parameters::POST_LOGOUT_REDIRECT_URI)
    }

    pub fn redirect_uri(&self) -> Option<&str> {
        self.get_str(parameters::REDIRECT_URI)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.get_str(parameters::REFRESH_TOKEN)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.get_str(parameters::REQUEST_ID)
    }

    pub fn response_mode(&self) -> Option<&str> {
        self.get_str(parameters::RESPONSE_MODE)
    }

    pub fn response_type(&self) -> Option<&str> {
        self.get_str(parameters::RESPONSE_TYPE)
    }

    /// True when the space-delimited `response_type` contains `value`.
    pub fn has_response_type(&self, value: &str) -> bool {
        self.response_type()
            .is_some_and(|types| split_values(types).any(|t| t == value))
    }

    pub fn scope(&self) -> Option<&str> {
        self.get_str(parameters::SCOPE)
    }

    pub fn scopes(&self) -> Vec<&str> {
        self.scope().map(|s| split_values(s).collect()).unwrap_or_default()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope().is_some_and(|s| split_values(s).any(|v| v == scope))
    }

    pub fn state(&self) -> Option<&str> {
        self.get_str(parameters::STATE)
    }

    pub fn token(&self) -> Option<&str> {
        self.get_str(parameters::TOKEN)
    }

    pub fn token_type_hint(&self) -> Option<&str> {
        self.get_str(parameters::TOKEN_TYPE_HINT)
    }
}

/// An outbound protocol response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response(Message);

impl Deref for Response {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.0
    }
}

impl DerefMut for Response {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.0
    }
}

impl From<&ProtocolError> for Response {
    fn from(error: &ProtocolError) -> Self {
        let mut response = Response::default();
        response.set_error(error);
        response
    }
}

impl Response {
    pub fn error(&self) -> Option<&str> {
        self.get_str(parameters::ERROR)
    }

    pub fn error_description(&self) -> Option<&str> {
        self.get_str(parameters::ERROR_DESCRIPTION)
    }

    pub fn error_uri(&self) -> Option<&str> {
        self.get_str(parameters::ERROR_URI)
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn set_error(&mut self, error: &ProtocolError) {
        self.set(parameters::ERROR, error.error.as_str());
        if let Some(description) = &error.description {
            self.set(parameters::ERROR_DESCRIPTION, description.as_str());
        }
        if let Some(uri) = &error.uri {
            self.set(parameters::ERROR_URI, uri.as_str());
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.get_str(parameters::ACCESS_TOKEN)
    }

    pub fn code(&self) -> Option<&str> {
        self.get_str(parameters::CODE)
    }

    pub fn id_token(&self) -> Option<&str> {
        self.get_str(parameters::ID_TOKEN)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.get_str(parameters::REFRESH_TOKEN)
    }

    pub fn state(&self) -> Option<&str> {
        self.get_str(parameters::STATE)
    }
}
