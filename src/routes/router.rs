//! Method/path router. Each registered chain is wrapped in a layer that
//! publishes the matched path parameters as [`Params`](super::params::Params)
//! before the pipeline runs.
//!
//! Unknown paths answer 404; known paths with an unregistered method answer 405.
//! HEAD is not implied by GET: a path without an explicit HEAD route answers
//! HEAD with 405 too.

use axum::{
    Router,
    http::StatusCode,
    middleware::from_fn,
    routing::{self, MethodFilter},
};
use std::collections::BTreeSet;

use super::params::publish_params;
use crate::middleware::Chain;

pub struct ApiRouter<S = ()> {
    inner: Router<S>,
    gets: BTreeSet<String>,
    heads: BTreeSet<String>,
}

impl<S> Default for ApiRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ApiRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Router::new(),
            gets: BTreeSet::new(),
            heads: BTreeSet::new(),
        }
    }

    pub fn get(mut self, path: &str, chain: Chain<S>) -> Self {
        self.gets.insert(path.to_string());
        self.handle(MethodFilter::GET, path, chain)
    }

    pub fn post(self, path: &str, chain: Chain<S>) -> Self {
        self.handle(MethodFilter::POST, path, chain)
    }

    pub fn put(self, path: &str, chain: Chain<S>) -> Self {
        self.handle(MethodFilter::PUT, path, chain)
    }

    pub fn patch(self, path: &str, chain: Chain<S>) -> Self {
        self.handle(MethodFilter::PATCH, path, chain)
    }

    pub fn delete(self, path: &str, chain: Chain<S>) -> Self {
        self.handle(MethodFilter::DELETE, path, chain)
    }

    pub fn head(mut self, path: &str, chain: Chain<S>) -> Self {
        self.heads.insert(path.to_string());
        self.handle(MethodFilter::HEAD, path, chain)
    }

    /// Routes registered on the same path are merged into one method router.
    fn handle(mut self, filter: MethodFilter, path: &str, chain: Chain<S>) -> Self {
        let route = chain
            .into_method_router(filter)
            .route_layer(from_fn(publish_params));
        self.inner = self.inner.route(path, route);
        self
    }

    pub fn into_router(self) -> Router<S> {
        let mut inner = self.inner;
        for path in self.gets.difference(&self.heads) {
            inner = inner.route(path, routing::head(reject_head));
        }
        inner
    }
}

async fn reject_head() -> StatusCode {
    StatusCode::METHOD_NOT_ALLOWED
}
