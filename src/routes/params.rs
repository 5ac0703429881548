//! Request-scoped path parameters.
//!
//! The router publishes a [`Params`] into the request extensions when a route
//! matches. Handlers take it as an extractor; it is dropped with the request.

use axum::{
    extract::{FromRequestParts, RawPathParams, Request, rejection::RawPathParamsRejection},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use crate::errors::ApiError;

/// Immutable mapping of path-pattern names to the values matched for one request.
#[derive(Clone, Debug, Default)]
pub struct Params(Arc<HashMap<String, String>>);

impl Params {
    /// Value matched for `name`, or `""` when the route has no such segment.
    pub fn by_name(&self, name: &str) -> &str {
        self.0.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Weak handle used to check that nothing kept the set alive past the request.
    pub(crate) fn downgrade(&self) -> Weak<HashMap<String, String>> {
        Arc::downgrade(&self.0)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(Arc::new(
            iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ))
    }
}

impl<S> FromRequestParts<S> for Params
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Params>()
            .cloned()
            .ok_or_else(|| ApiError::internal("Route parameters unavailable"))
    }
}

/// Route layer that copies the matched path segments into a fresh [`Params`].
pub(crate) async fn publish_params(
    matched: Result<RawPathParams, RawPathParamsRejection>,
    mut req: Request,
    next: Next,
) -> Response {
    let params = match matched {
        Ok(raw) => raw.iter().collect::<Params>(),
        Err(RawPathParamsRejection::InvalidUtf8InPathParam(err)) => {
            return ApiError::bad_request("Invalid path parameter")
                .with_cause(err.body_text())
                .into_response();
        }
        Err(_) => Params::default(),
    };

    req.extensions_mut().insert(params);
    next.run(req).await
}
