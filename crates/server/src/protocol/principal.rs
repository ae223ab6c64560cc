use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::{claims, split_values};

/// The claims describing an authenticated subject (or a validated token).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal {
    claims: Map<String, Value>,
}

impl Principal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subject(subject: impl Into<String>) -> Self {
        let mut principal = Self::new();
        principal.set_claim(claims::SUBJECT, subject.into());
        principal
    }

    pub fn from_claims(claims: Map<String, Value>) -> Self {
        Self { claims }
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    pub fn into_claims(self) -> Map<String, Value> {
        self.claims
    }

    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    pub fn set_claim(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.claims.insert(name.into(), value.into());
        self
    }

    pub fn remove_claim(&mut self, name: &str) -> Option<Value> {
        self.claims.remove(name)
    }

    pub fn subject(&self) -> Option<&str> {
        self.claim_str(claims::SUBJECT)
    }

    pub fn scopes(&self) -> Vec<&str> {
        self.claim_str(claims::SCOPE)
            .map(|s| split_values(s).collect())
            .unwrap_or_default()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().contains(&scope)
    }

    pub fn set_scopes<'a>(&mut self, scopes: impl IntoIterator<Item = &'a str>) -> &mut Self {
        let joined = scopes.into_iter().collect::<Vec<_>>().join(" ");
        self.set_claim(claims::SCOPE, joined)
    }

    /// The client the token was issued to (`client_id`, falling back to `azp`).
    pub fn presenter(&self) -> Option<&str> {
        self.claim_str(claims::CLIENT_ID)
            .or_else(|| self.claim_str(claims::AUTHORIZED_PARTY))
    }
}
