//! Request/response decorators and the pipelines built from them.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s. The first stage is the
//! outermost: it runs its pre-logic first and sees the response last.
//!
//! - **default**: cleanup → logging → recovery → info headers
//! - **json**: cleanup → logging → recovery → content-type check → info headers → JSON rendering

use axum::{
    handler::Handler,
    middleware::{from_fn, from_fn_with_state},
    routing::{MethodFilter, MethodRouter, on},
};
use std::sync::Arc;

pub mod stages;

/// One decorator in a pipeline.
#[derive(Clone, Debug)]
pub enum Stage {
    /// Release request-scoped state once the inner handler returns.
    Cleanup,
    /// Log method, path, status and duration of the inner call.
    Logging,
    /// Turn a panic anywhere inside into a bare 500.
    Recovery,
    /// Reject PUT/POST/PATCH requests whose media type is not listed (415).
    ContentType(Arc<[String]>),
    /// Add fixed informational response headers.
    InfoHeaders,
    /// Force `Content-Type: application/json` on the response.
    JsonRendering,
}

#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `stage` inside every stage added so far.
    pub fn with(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Pipeline for endpoints that stream or accept non-JSON bodies.
    pub fn default_chain() -> Self {
        Self::new()
            .with(Stage::Cleanup)
            .with(Stage::Logging)
            .with(Stage::Recovery)
            .with(Stage::InfoHeaders)
    }

    /// Pipeline for the JSON API.
    pub fn json_chain() -> Self {
        Self::new()
            .with(Stage::Cleanup)
            .with(Stage::Logging)
            .with(Stage::Recovery)
            .with(Stage::ContentType(Arc::from(["application/json".to_string()])))
            .with(Stage::InfoHeaders)
            .with(Stage::JsonRendering)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Bind `handler` to this pipeline. The method is chosen when the chain is
    /// registered with the router.
    pub fn then<H, T, S>(&self, handler: H) -> Chain<S>
    where
        H: Handler<T, S>,
        T: 'static,
        S: Clone + Send + Sync + 'static,
    {
        Chain {
            pipeline: self.clone(),
            endpoint: Box::new(move |filter| on(filter, handler)),
        }
    }

    /// Wrap the endpoint of `route` so that the first stage ends up outermost.
    /// Only the endpoint is wrapped: an unregistered method still gets a bare 405.
    fn wrap<S>(&self, mut route: MethodRouter<S>) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        for stage in self.stages.iter().rev() {
            route = match stage {
                Stage::Cleanup => route.route_layer(from_fn(stages::clear_request_scope)),
                Stage::Logging => route.route_layer(from_fn(stages::log_access)),
                Stage::Recovery => route.route_layer(from_fn(stages::recover_panics)),
                Stage::ContentType(allowed) => route.route_layer(from_fn_with_state(
                    allowed.clone(),
                    stages::negotiate_content_type,
                )),
                Stage::InfoHeaders => route.route_layer(from_fn(stages::inject_info_headers)),
                Stage::JsonRendering => route.route_layer(from_fn(stages::render_json)),
            };
        }
        route
    }
}

/// A handler bound to a pipeline, waiting for its HTTP method.
pub struct Chain<S> {
    pipeline: Pipeline,
    endpoint: Box<dyn FnOnce(MethodFilter) -> MethodRouter<S> + Send>,
}

impl<S> Chain<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub(crate) fn into_method_router(self, filter: MethodFilter) -> MethodRouter<S> {
        self.pipeline.wrap((self.endpoint)(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_chain_checks_content_type_before_rendering() {
        let pipeline = Pipeline::json_chain();
        let names: Vec<&str> = pipeline
            .stages()
            .iter()
            .map(|stage| match stage {
                Stage::Cleanup => "cleanup",
                Stage::Logging => "logging",
                Stage::Recovery => "recovery",
                Stage::ContentType(_) => "content-type",
                Stage::InfoHeaders => "info-headers",
                Stage::JsonRendering => "json",
            })
            .collect();

        assert_eq!(
            names,
            ["cleanup", "logging", "recovery", "content-type", "info-headers", "json"]
        );
        assert_eq!(Pipeline::default_chain().stages().len(), 4);
    }
}
