use super::dispatcher::{channel, Dispatcher, TargetReceiver};
use crate::error::{json_error_response, DispatchErrorCode};
use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Version information for the control plane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Path proxies subscribe on
pub const DISPATCH_PATH: &str = "/api/dispatch";

/// Encoded heartbeat message
const HEARTBEAT_LINE: &[u8] = b"{\"messageType\":\"Heartbeat\",\"key\":\"\",\"routes\":[],\"cluster\":[]}\n";

type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).boxed_unsync())
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()).boxed_unsync())
        .expect("valid response with StatusCode enum and static header")
}

/// HTTP server streaming dispatcher messages to subscribed proxies
pub struct DispatchServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    heartbeat_interval: Duration,
    target_buffer: usize,
    shutdown: CancellationToken,
}

#[derive(Clone)]
struct ServerContext {
    dispatcher: Arc<Dispatcher>,
    heartbeat_interval: Duration,
    target_buffer: usize,
    shutdown: CancellationToken,
}

impl DispatchServer {
    pub fn new(bind_addr: SocketAddr, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) -> Self {
        Self {
            bind_addr,
            dispatcher,
            heartbeat_interval: Duration::from_secs(30),
            target_buffer: 16,
            shutdown,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_target_buffer(mut self, buffer: usize) -> Self {
        self.target_buffer = buffer;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Dispatch server listening (HTTP/1.1 and HTTP/2)");

        let context = ServerContext {
            dispatcher: self.dispatcher,
            heartbeat_interval: self.heartbeat_interval,
            target_buffer: self.target_buffer,
            shutdown: self.shutdown,
        };

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = context.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Dispatch connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept dispatch connection");
                        }
                    }
                }
                _ = context.shutdown.cancelled() => {
                    info!("Dispatch server shutting down");
                    break;
                }
            }
        }

        context.dispatcher.detach_all();
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, addr: SocketAddr, context: ServerContext) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let context = context.clone();
        async move { handle_request(req, addr, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Dispatch connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    addr: SocketAddr,
    context: ServerContext,
) -> Result<Response<ResponseBody>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Dispatch API request");

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, DISPATCH_PATH) => {
            if context.shutdown.is_cancelled() {
                json_error_response(DispatchErrorCode::ShuttingDown, "dispatcher is shutting down")
            } else {
                subscribe(addr, &context)
            }
        }

        (_, DISPATCH_PATH) | (_, "/health") | (_, "/version") => json_error_response(
            DispatchErrorCode::MethodNotAllowed,
            format!("{} not allowed on {}", method, path),
        ),

        _ => json_error_response(DispatchErrorCode::NotFound, format!("no route for {}", path)),
    };

    Ok(response)
}

/// Detaches the target once the response body is dropped
struct Subscription {
    receiver: TargetReceiver,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Interval,
    shutdown: CancellationToken,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.dispatcher.detach(self.receiver.id()) {
            info!(target_id = self.receiver.id(), "Proxy unsubscribed");
        }
    }
}

fn subscribe(addr: SocketAddr, context: &ServerContext) -> Response<ResponseBody> {
    let (target, receiver) = channel(context.target_buffer);
    info!(target_id = receiver.id(), addr = %addr, "Proxy subscribed");
    context.dispatcher.attach(target);

    let mut heartbeat = interval_at(
        Instant::now() + context.heartbeat_interval,
        context.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let subscription = Subscription {
        receiver,
        dispatcher: Arc::clone(&context.dispatcher),
        heartbeat,
        shutdown: context.shutdown.clone(),
    };

    let frames = stream::unfold(subscription, |mut sub| async move {
        let line = tokio::select! {
            biased;
            _ = sub.shutdown.cancelled() => None,
            message = sub.receiver.recv() => message,
            _ = sub.heartbeat.tick() => Some(Bytes::from_static(HEARTBEAT_LINE)),
        }?;
        Some((Ok::<_, Infallible>(Frame::data(line)), sub))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .header("cache-control", "no-cache")
        .body(StreamBody::new(frames).boxed_unsync())
        .expect("valid response with StatusCode enum and static headers")
}
