// HTTP/1.1 transport over hyper

use crate::{Dispatcher, Error, HttpMethod, HttpRequest, HttpResponse, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming as IncomingBody;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Serves a [`Dispatcher`] over TCP.
///
/// Hyper owns parsing and connection management; this type only converts
/// between hyper's types and [`HttpRequest`]/[`HttpResponse`].
pub struct Server {
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub fn new(dispatcher: impl Into<Arc<Dispatcher>>) -> Self {
        Self {
            dispatcher: dispatcher.into(),
        }
    }

    pub async fn listen(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// accepted keep running on their own tasks.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Server listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    return Ok(());
                }
            };
            let io = TokioIo::new(stream);
            let dispatcher = self.dispatcher.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<IncomingBody>| {
                    let dispatcher = dispatcher.clone();
                    async move { handle_request(req, dispatcher).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(peer = %peer, error = %err, "Error serving connection");
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<IncomingBody>,
    dispatcher: Arc<Dispatcher>,
) -> std::result::Result<Response<Full<Bytes>>, Error> {
    let (parts, body) = req.into_parts();
    let Some(method) = HttpMethod::parse(parts.method.as_str()) else {
        return Ok(plain(501, "Not Implemented"));
    };
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "Failed to read request body");
            return Ok(plain(400, "Bad Request"));
        }
    };

    let target = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
    let mut request = HttpRequest::new(method, target).with_body(body);
    request.headers = parts.headers;

    let response = dispatcher.handle(request).await;
    into_hyper_response(response)
}

/// Converts a pipeline response. Aborted responses become an error so hyper
/// drops the connection instead of finishing the message.
pub fn into_hyper_response(response: HttpResponse) -> Result<Response<Full<Bytes>>> {
    if response.is_aborted() {
        return Err(Error::ResponseWrite("response aborted".into()));
    }
    let status = response.status;
    let headers = response.headers.clone();
    let mut out = Response::new(Full::new(response.into_body()));
    *out.status_mut() = hyper::StatusCode::from_u16(status)
        .map_err(|e| Error::ResponseWrite(format!("invalid status {status}: {e}")))?;
    *out.headers_mut() = headers;
    Ok(out)
}

fn plain(status: u16, body: &'static str) -> Response<Full<Bytes>> {
    let mut out = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *out.status_mut() =
        hyper::StatusCode::from_u16(status).unwrap_or(hyper::StatusCode::INTERNAL_SERVER_ERROR);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_conversion() {
        let mut response = HttpResponse::new(201);
        response.insert_header("x-id", "7").unwrap();
        response.send_bytes("made").unwrap();

        let converted = into_hyper_response(response).unwrap();
        assert_eq!(converted.status(), 201);
        assert_eq!(converted.headers()["x-id"], "7");
        let body = converted.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"made");
    }

    #[test]
    fn test_aborted_response_is_error() {
        let mut response = HttpResponse::ok();
        response.output_stream().unwrap();
        response.abort();
        assert!(into_hyper_response(response).is_err());
    }
}
