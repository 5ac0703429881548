//! The individual pipeline decorators, written as `axum::middleware::from_fn`
//! functions.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use std::{
    any::Any,
    backtrace::Backtrace,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};
use tracing::{error, info, warn};

use crate::routes::params::Params;

const SERVER_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Leak check for the request's [`Params`]. They live in the request
/// extensions and are dropped with the request, so once the inner call has
/// returned nothing may still hold them.
pub async fn clear_request_scope(req: Request, next: Next) -> Response {
    let scope = req.extensions().get::<Params>().map(Params::downgrade);

    let response = next.run(req).await;

    if let Some(scope) = scope {
        if scope.strong_count() > 0 {
            warn!("request parameters outlived their request");
        }
    }
    response
}

pub async fn log_access(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();

    let response = next.run(req).await;

    info!(
        target: "rest",
        "[{}] {:?} {} {:?}",
        method,
        uri.to_string(),
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

/// Failure boundary: a panic in any inner stage or handler becomes a bare 500
/// carrying no detail. The panic hook has already logged the backtrace.
pub async fn recover_panics(req: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            error!("PANIC: {}", panic_message(payload.as_ref()));
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

/// Reject mutating requests whose media type (parameters after `;` ignored)
/// is not one of `allowed`. Other methods pass through unchecked.
pub async fn negotiate_content_type(
    State(allowed): State<Arc<[String]>>,
    req: Request,
    next: Next,
) -> Response {
    if !matches!(*req.method(), Method::PUT | Method::POST | Method::PATCH) {
        return next.run(req).await;
    }

    let received = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if allowed.iter().any(|ct| media_type(&received) == ct) {
        return next.run(req).await;
    }

    (
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        format!("Unsupported content type {received:?}; expected one of {allowed:?}"),
    )
        .into_response()
}

pub async fn inject_info_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

pub async fn render_json(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}

/// Log panics through `tracing`, with a backtrace taken at the panic site.
pub fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        error!("{}\n{}", info, backtrace);
    }));
}

fn media_type(content_type: &str) -> &str {
    match content_type.find(';') {
        Some(i) => &content_type[..i],
        None => content_type,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::params::publish_params;
    use axum::{Router, body::Body, http, middleware::from_fn, routing::get};
    use std::{
        collections::HashMap,
        sync::{Mutex, Weak},
    };
    use tower::ServiceExt;

    #[test]
    fn media_type_drops_parameters_only() {
        assert_eq!(media_type("application/json; charset=utf-8"), "application/json");
        assert_eq!(media_type("application/json"), "application/json");
        assert_eq!(media_type("text/plain"), "text/plain");
        assert_eq!(media_type(""), "");
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let static_payload: Box<dyn Any + Send> = Box::new("boom");
        let owned_payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other_payload: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(static_payload.as_ref()), "boom");
        assert_eq!(panic_message(owned_payload.as_ref()), "bang");
        assert_eq!(panic_message(other_payload.as_ref()), "non-string panic payload");
    }

    async fn explode() -> &'static str {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn recovery_turns_a_panic_into_one_500() {
        let app = Router::new()
            .route("/boom", get(explode))
            .route("/ok", get(|| async { "fine" }))
            .layer(axum::middleware::from_fn(recover_panics));

        let response = app
            .clone()
            .oneshot(http::Request::get("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = app
            .oneshot(http::Request::get("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn content_type_check_skips_reads() {
        let allowed: Arc<[String]> = Arc::from(["application/json".to_string()]);
        let app = Router::new()
            .route("/", get(|| async { "read" }).post(|| async { "write" }))
            .layer(axum::middleware::from_fn_with_state(
                allowed,
                negotiate_content_type,
            ));

        let read = app
            .clone()
            .oneshot(
                http::Request::get("/")
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(read.status(), StatusCode::OK);

        let rejected = app
            .clone()
            .oneshot(
                http::Request::post("/")
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let accepted = app
            .oneshot(
                http::Request::post("/")
                    .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn request_parameters_are_released_with_the_request() {
        let seen: Arc<Mutex<Option<Weak<HashMap<String, String>>>>> = Arc::default();
        let slot = seen.clone();
        let app = Router::new()
            .route(
                "/things/{name}",
                get(move |params: Params| {
                    let slot = slot.clone();
                    async move {
                        *slot.lock().unwrap() = Some(params.downgrade());
                        params.by_name("name").to_string()
                    }
                }),
            )
            .route_layer(from_fn(clear_request_scope))
            .route_layer(from_fn(publish_params));

        let response = app
            .oneshot(http::Request::get("/things/lamp").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let scope = seen.lock().unwrap().take().expect("handler saw the parameters");
        assert_eq!(scope.strong_count(), 0);
    }
}
