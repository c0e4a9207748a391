use blegate_core::{DecodedStream, Gateway, GatewayError};
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use warp::filters::BoxedFilter;
use warp::http::{StatusCode, Uri};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

type Query = HashMap<String, String>;

// ============================================================================
// WEB CONTEXT
// ============================================================================

pub struct WebContext {
    pub gateway: Arc<Gateway>,
    /// Route prefix, either empty or `/segment[/segment...]`
    pub prefix: String,
    /// Directory served under /test
    pub test_dir: Option<PathBuf>,
}

// ============================================================================
// ROUTES
// ============================================================================

/// Every route of the gateway, without CORS.
pub fn routes(ctx: Arc<WebContext>) -> BoxedFilter<(Response,)> {
    let ctx_filter = warp::any().map({
        let ctx = ctx.clone();
        move || ctx.clone()
    });
    let api = prefix_filter(&ctx.prefix);
    let query = warp::query::<Query>();

    // GET <prefix>/nodes[?connectable=1]
    let nodes_route = api
        .clone()
        .and(warp::path!("nodes"))
        .and(warp::get())
        .and(query.clone())
        .and(ctx_filter.clone())
        .and_then(handle_nodes)
        .boxed();

    // GET <prefix>/nodes/<node>
    let node_route = api
        .clone()
        .and(warp::path!("nodes" / String))
        .and(warp::get())
        .and(ctx_filter.clone())
        .and_then(handle_node)
        .boxed();

    // GET <prefix>/nodes/<node>/services
    let services_route = api
        .clone()
        .and(warp::path!("nodes" / String / "services"))
        .and(warp::get())
        .and(ctx_filter.clone())
        .and_then(handle_services)
        .boxed();

    // GET <prefix>/nodes/<node>/services/<service>/items
    let items_route = api
        .clone()
        .and(warp::path!("nodes" / String / "services" / String / "items"))
        .and(warp::get())
        .and(ctx_filter.clone())
        .and_then(handle_items)
        .boxed();

    // GET <prefix>/nodes/<node>/services/<service>/items/<item>/value
    let read_route = api
        .clone()
        .and(warp::path!("nodes" / String / "services" / String / "items" / String / "value"))
        .and(warp::get())
        .and(ctx_filter.clone())
        .and_then(handle_read)
        .boxed();

    // GET <prefix>/nodes/<node>/services/<service>/items/<item>/report
    let report_route = api
        .clone()
        .and(warp::path!("nodes" / String / "services" / String / "items" / String / "report"))
        .and(warp::get())
        .and(ctx_filter.clone())
        .and_then(handle_report)
        .boxed();

    // PUT <prefix>/nodes/<node>/services/<service>/items/<item>/value/<value>[?noresponse=1]
    let write_route = api
        .clone()
        .and(warp::path!(
            "nodes" / String / "services" / String / "items" / String / "value" / String
        ))
        .and(warp::put())
        .and(query)
        .and(ctx_filter.clone())
        .and_then(handle_write)
        .boxed();

    // PUT <prefix>/wakeup, PUT <prefix>/sleep
    let wakeup_route = api
        .clone()
        .and(warp::path!("wakeup"))
        .and(warp::put())
        .and(ctx_filter.clone())
        .and_then(handle_wakeup)
        .boxed();
    let sleep_route = api
        .clone()
        .and(warp::path!("sleep"))
        .and(warp::put())
        .and(ctx_filter.clone())
        .and_then(handle_sleep)
        .boxed();

    // PUT <prefix>/node/<node>/open, PUT <prefix>/node/<node>/close
    let open_route = api
        .clone()
        .and(warp::path!("node" / String / "open"))
        .and(warp::put())
        .and(ctx_filter.clone())
        .and_then(handle_open)
        .boxed();
    let close_route = api
        .clone()
        .and(warp::path!("node" / String / "close"))
        .and(warp::put())
        .and(ctx_filter.clone())
        .and_then(handle_close)
        .boxed();

    // GET <prefix>/connections
    let connections_route = api
        .and(warp::path!("connections"))
        .and(warp::get())
        .and(ctx_filter)
        .and_then(handle_connections)
        .boxed();

    nodes_route
        .or(node_route)
        .unify()
        .or(services_route)
        .unify()
        .or(items_route)
        .unify()
        .or(read_route)
        .unify()
        .or(report_route)
        .unify()
        .or(write_route)
        .unify()
        .or(wakeup_route)
        .unify()
        .or(sleep_route)
        .unify()
        .or(open_route)
        .unify()
        .or(close_route)
        .unify()
        .or(connections_route)
        .unify()
        .or(test_routes(ctx.test_dir.clone()))
        .unify()
        .boxed()
}

/// Match the configured prefix one segment at a time.
fn prefix_filter(prefix: &str) -> BoxedFilter<()> {
    prefix
        .split('/')
        .filter(|s| !s.is_empty())
        .fold(warp::any().boxed(), |filter, segment| {
            filter.and(warp::path(segment.to_string())).boxed()
        })
}

/// `GET /test` redirects to the index; `GET /test/<file>` serves `test_dir`.
fn test_routes(test_dir: Option<PathBuf>) -> BoxedFilter<(Response,)> {
    let Some(dir) = test_dir else {
        return warp::any()
            .and_then(|| async { Err::<Response, Rejection>(warp::reject::not_found()) })
            .boxed();
    };

    let index = warp::path!("test")
        .and(warp::get())
        .map(|| warp::redirect::found(Uri::from_static("/test/index.html")).into_response());
    let files = warp::path("test")
        .and(warp::get())
        .and(warp::fs::dir(dir))
        .map(|file: warp::fs::File| file.into_response());
    index.or(files).unify().boxed()
}

pub async fn serve(ctx: Arc<WebContext>, port: u16) {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "PUT"]);
    let routes = routes(ctx.clone()).with(cors);

    info!(port, prefix = %ctx.prefix, "HTTP server listening on 0.0.0.0:{}", port);
    warp::serve(routes).run(([0, 0, 0, 0], port)).await;
}

// ============================================================================
// REPLIES
// ============================================================================

fn json_reply<T: Serialize>(body: &T) -> Response {
    warp::reply::json(body).into_response()
}

/// Status of a failed request; the body is always the message string.
pub fn status_of(err: &GatewayError) -> StatusCode {
    if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if matches!(err, GatewayError::InvalidValueFormat { .. }) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::BAD_GATEWAY
    }
}

fn error_reply(err: &GatewayError) -> Response {
    debug!(kind = err.kind(), error = %err, "response error");
    warp::reply::with_status(warp::reply::json(&err.to_string()), status_of(err)).into_response()
}

fn result_reply<T: Serialize>(result: Result<T, GatewayError>) -> Response {
    match result {
        Ok(body) => {
            if let Ok(json) = serde_json::to_string(&body) {
                debug!(body = %json, "response");
            }
            json_reply(&body)
        }
        Err(e) => error_reply(&e),
    }
}

fn flag(query: &Query, key: &str) -> bool {
    query.get(key).is_some_and(|v| v == "1")
}

/// Path segments arrive percent-encoded.
fn decoded(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

// ============================================================================
// API HANDLERS
// ============================================================================

async fn handle_nodes(query: Query, ctx: Arc<WebContext>) -> Result<Response, Rejection> {
    let connectable = flag(&query, "connectable");
    info!(connectable, "GET nodes");
    Ok(json_reply(&ctx.gateway.nodes(connectable)))
}

async fn handle_node(node: String, ctx: Arc<WebContext>) -> Result<Response, Rejection> {
    let node = decoded(&node);
    info!(node = %node, "GET node");
    match ctx.gateway.node(&node) {
        Some(found) => Ok(json_reply(&found)),
        None => Ok(json_reply(&serde_json::json!({}))),
    }
}

async fn handle_services(node: String, ctx: Arc<WebContext>) -> Result<Response, Rejection> {
    let node = decoded(&node);
    info!(node = %node, "GET services");
    Ok(result_reply(ctx.gateway.services(&node).await))
}

async fn handle_items(
    node: String,
    service: String,
    ctx: Arc<WebContext>,
) -> Result<Response, Rejection> {
    let (node, service) = (decoded(&node), decoded(&service));
    info!(node = %node, service = %service, "GET items");
    Ok(result_reply(ctx.gateway.items(&node, &service).await))
}

async fn handle_read(
    node: String,
    service: String,
    item: String,
    ctx: Arc<WebContext>,
) -> Result<Response, Rejection> {
    let (node, service, item) = (decoded(&node), decoded(&service), decoded(&item));
    info!(node = %node, service = %service, item = %item, "GET value");
    Ok(result_reply(ctx.gateway.read_value(&node, &service, &item).await))
}

async fn handle_write(
    node: String,
    service: String,
    item: String,
    value: String,
    query: Query,
    ctx: Arc<WebContext>,
) -> Result<Response, Rejection> {
    let (node, service, item, value) =
        (decoded(&node), decoded(&service), decoded(&item), decoded(&value));
    let no_ack = flag(&query, "noresponse");
    info!(node = %node, service = %service, item = %item, value = %value, no_ack, "PUT value");
    let result = ctx
        .gateway
        .write_value(&node, &service, &item, Some(&value), no_ack)
        .await
        .map(|()| "OK");
    Ok(result_reply(result))
}

async fn handle_report(
    node: String,
    service: String,
    item: String,
    ctx: Arc<WebContext>,
) -> Result<Response, Rejection> {
    let (node, service, item) = (decoded(&node), decoded(&service), decoded(&item));
    info!(node = %node, service = %service, item = %item, "GET report");
    match ctx.gateway.subscribe(&node, &service, &item).await {
        Ok(stream) => Ok(warp::sse::reply(SyncStream::new(report_events(stream))).into_response()),
        Err(e) => Ok(error_reply(&e)),
    }
}

/// warp's `sse::reply` requires `Sync`; `Mutex::get_mut` gives that without locking.
struct SyncStream<S>(std::sync::Mutex<S>);

impl<S> SyncStream<S> {
    fn new(stream: S) -> Self {
        SyncStream(std::sync::Mutex::new(stream))
    }
}

impl<S: futures::Stream + Unpin> futures::Stream for SyncStream<S> {
    type Item = S::Item;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<S::Item>> {
        let inner = self.get_mut().0.get_mut().unwrap_or_else(|e| e.into_inner());
        inner.poll_next_unpin(cx)
    }
}

/// One `data: <json>` frame per value; the first error closes the stream.
fn report_events(
    stream: DecodedStream,
) -> impl futures::Stream<Item = Result<warp::sse::Event, Infallible>> + Send + 'static {
    stream
        .scan((), |_, item| {
            futures::future::ready(match item {
                Ok(value) => Some(value),
                Err(e) => {
                    info!(error = %e, "report ended");
                    None
                }
            })
        })
        .map(|value| {
            // warp writes `data:` with no separator.
            let data = serde_json::to_string(&value).unwrap_or_default();
            Ok(warp::sse::Event::default().data(format!(" {}", data)))
        })
}

async fn handle_wakeup(ctx: Arc<WebContext>) -> Result<Response, Rejection> {
    info!("PUT wakeup");
    Ok(result_reply(ctx.gateway.wakeup().await.map(|()| "OK")))
}

async fn handle_sleep(ctx: Arc<WebContext>) -> Result<Response, Rejection> {
    info!("PUT sleep");
    Ok(result_reply(ctx.gateway.sleep().await.map(|()| "OK")))
}

async fn handle_open(node: String, ctx: Arc<WebContext>) -> Result<Response, Rejection> {
    let node = decoded(&node);
    info!(node = %node, "PUT open");
    Ok(result_reply(ctx.gateway.open(&node).await.map(|()| "OK")))
}

async fn handle_close(node: String, ctx: Arc<WebContext>) -> Result<Response, Rejection> {
    let node = decoded(&node);
    info!(node = %node, "PUT close");
    Ok(result_reply(ctx.gateway.close(&node).await.map(|()| "OK")))
}

async fn handle_connections(ctx: Arc<WebContext>) -> Result<Response, Rejection> {
    debug!("GET connections");
    Ok(json_reply(&ctx.gateway.connection_summaries()))
}
