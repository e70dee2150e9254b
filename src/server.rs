//! HTTP surface.
//!
//! | Route | Response |
//! |-------|----------|
//! | `POST /configure?sample_rate=<int>&points=<int>` | JSON acknowledgement, 400 on invalid values |
//! | `GET /ch<N>.dat` | latest samples of channel N as plain text |
//! | `GET /status` | JSON status document |
//! | `GET /` | HTML status page |
//!
//! Handlers only take short locks on the acquisition state and never block
//! on the acquisition worker.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::control::{parse_param, ControlSurface, DEFAULT_POINTS, DEFAULT_SAMPLE_RATE_HZ};
use crate::error::{AppResult, DaqError};

const CONFIGURE_ACCEPTED: &str = "Re-initializing with new settings...";

/// Serve `surface` on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, surface: ControlSurface, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()>,
{
    let make_service = make_service_fn(move |_conn| {
        let surface = surface.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let surface = surface.clone();
                async move { Ok::<_, Infallible>(handle_request(&surface, req)) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);
    info!(address = %server.local_addr(), "HTTP server listening");

    server.with_graceful_shutdown(shutdown).await?;
    info!("HTTP server stopped");
    Ok(())
}

/// Route one request.
pub fn handle_request(surface: &ControlSurface, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "HTTP request");

    match (&method, path.as_str()) {
        (&Method::POST, "/configure") => configure(surface, req.uri().query()),
        (&Method::GET, "/") => html(StatusCode::OK, surface.index_html()),
        (&Method::GET, "/status") => match serde_json::to_string(&surface.status()) {
            Ok(body) => json_body(StatusCode::OK, body),
            Err(e) => {
                error!(error = %e, "Failed to encode status");
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode status")
            }
        },
        (_, "/" | "/status") => method_not_allowed("GET"),
        (_, "/configure") => method_not_allowed("POST"),
        (_, path) => match channel_id(path) {
            Some(id) if method == Method::GET => channel_data(surface, id),
            Some(_) => method_not_allowed("GET"),
            None => text(StatusCode::NOT_FOUND, "Not Found"),
        },
    }
}

fn configure(surface: &ControlSurface, query: Option<&str>) -> Response<Body> {
    let mut sample_rate = None;
    let mut points = None;
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        match key.as_ref() {
            "sample_rate" => sample_rate = Some(value.into_owned()),
            "points" => points = Some(value.into_owned()),
            _ => {}
        }
    }

    let result = parse_param("sample_rate", sample_rate.as_deref(), DEFAULT_SAMPLE_RATE_HZ)
        .and_then(|rate| {
            parse_param("points", points.as_deref(), DEFAULT_POINTS).map(|points| (rate, points))
        })
        .and_then(|(rate, points)| surface.configure(rate, points));

    match result {
        Ok(_) => json_body(
            StatusCode::OK,
            json!({"status": "ok", "message": CONFIGURE_ACCEPTED}).to_string(),
        ),
        Err(e) => {
            warn!(error = %e, "Rejected configure request");
            json_body(
                StatusCode::BAD_REQUEST,
                json!({"status": "error", "message": e.to_string()}).to_string(),
            )
        }
    }
}

fn channel_data(surface: &ControlSurface, id: usize) -> Response<Body> {
    match surface.read_channel(id) {
        Ok(report) => text(StatusCode::OK, report.render()),
        Err(e) => error_response(&e),
    }
}

/// Channel id of a `/ch<N>.dat` path.
fn channel_id(path: &str) -> Option<usize> {
    let digits = path.strip_prefix("/ch")?.strip_suffix(".dat")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn error_response(err: &DaqError) -> Response<Body> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    text(status, err.to_string())
}

fn method_not_allowed(allow: &'static str) -> Response<Body> {
    let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    response
        .headers_mut()
        .insert(header::ALLOW, header::HeaderValue::from_static(allow));
    response
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    respond(status, "text/plain; charset=utf-8", body.into())
}

fn html(status: StatusCode, body: String) -> Response<Body> {
    respond(status, "text/html; charset=utf-8", Body::from(body))
}

fn json_body(status: StatusCode, body: String) -> Response<Body> {
    respond(status, "application/json", Body::from(body))
}

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type),
    );
    response
}
