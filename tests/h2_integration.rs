//! HTTP/2 integration tests
//!
//! These tests run a server connection and a client connection against each
//! other over an in-memory duplex pipe and verify end-to-end behaviour:
//! - Request/response exchange and routing
//! - Request and response bodies larger than the flow-control windows
//! - Many concurrent streams against the stream ceiling
//! - Server push
//! - Handler failures and shutdown

use bytes::Bytes;
use h2mux::http::h2::{
    Connection, ConnectionConfig, Error, ErrorCode, FrameEvents, FrameInfo, H2ClientBuilder, H2Session,
    HeadersCategory, ProtocolEngine, Role, Settings,
};
use h2mux::http::{Method, Request, Response, Routes, Status};
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::task::{spawn_local, LocalSet};

fn routes() -> Routes {
    let mut routes = Routes::new();
    routes
        .add(Method::Get, "/", |req, mut rep: Response| async move {
            rep.set_header("content-type", "text/plain");
            rep.set_body("hello");
            Ok((req, rep))
        })
        .add(Method::Post, "/echo", |req: Rc<Request>, mut rep: Response| async move {
            rep.set_body(req.body().to_vec());
            Ok((req, rep))
        })
        .add(Method::Get, "/large", |req, mut rep: Response| async move {
            rep.set_body(vec![b'x'; 200_000]);
            Ok((req, rep))
        })
        .add(Method::Get, "/fail", |_req, _rep: Response| async move {
            Err("upstream timed out".into())
        })
        .add(Method::Get, "/slow", |req, rep: Response| async move {
            tokio::task::yield_now().await;
            Ok((req, rep))
        });
    routes
}

fn get(path: &str) -> Request {
    Request::builder().path(path).authority("localhost").build()
}

type Exchanged = (Vec<h2mux::http::h2::Result<Response>>, Connection<tokio::io::DuplexStream>);

/// Serve `requests` from `routes` over a duplex pipe; returns the client
/// connection after it finished, for inspection
async fn exchange(routes: Routes, client: H2ClientBuilder, requests: Vec<Request>) -> Exchanged {
    exchange_over(64 * 1024, routes, client, requests).await
}

async fn exchange_over(
    capacity: usize,
    routes: Routes,
    client: H2ClientBuilder,
    requests: Vec<Request>,
) -> Exchanged {
    let (client_io, server_io) = duplex(capacity);
    let routes = Rc::new(routes);

    let server = spawn_local(async move {
        let mut conn = Connection::new(server_io, routes, ConnectionConfig::server());
        conn.process().await
    });

    let mut conn = client.build(client_io).unwrap();
    let waiters: Vec<_> = requests.into_iter().map(|req| conn.send_request(req)).collect();
    conn.process().await.unwrap();
    server.await.unwrap().unwrap();

    let mut responses = Vec::new();
    for waiter in waiters {
        responses.push(waiter.await.unwrap());
    }
    (responses, conn)
}

#[tokio::test]
async fn test_get_round_trip() {
    LocalSet::new()
        .run_until(async {
            let (responses, conn) = exchange(routes(), H2ClientBuilder::new(), vec![get("/")]).await;
            let rep = responses[0].as_ref().unwrap();

            assert_eq!(rep.status(), Status::OK);
            assert_eq!(rep.headers().get("content-type"), Some("text/plain"));
            assert_eq!(rep.headers().get("content-length"), Some("5"));
            assert_eq!(&rep.body()[..], b"hello");
            assert_eq!(conn.pending_streams(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_post_body_is_echoed() {
    LocalSet::new()
        .run_until(async {
            let request = Request::builder()
                .method(Method::Post)
                .path("/echo")
                .authority("localhost")
                .body("ping")
                .build();
            let (responses, _) = exchange(routes(), H2ClientBuilder::new(), vec![request]).await;

            assert_eq!(&responses[0].as_ref().unwrap().body()[..], b"ping");
        })
        .await;
}

#[tokio::test]
async fn test_not_found_and_method_not_allowed() {
    LocalSet::new()
        .run_until(async {
            let wrong_verb = Request::builder()
                .method(Method::Delete)
                .path("/")
                .authority("localhost")
                .build();
            let (responses, _) =
                exchange(routes(), H2ClientBuilder::new(), vec![get("/missing"), wrong_verb]).await;

            assert_eq!(responses[0].as_ref().unwrap().status(), Status::NOT_FOUND);
            assert_eq!(responses[1].as_ref().unwrap().status(), Status::METHOD_NOT_ALLOWED);
        })
        .await;
}

#[tokio::test]
async fn test_handler_error_becomes_500() {
    LocalSet::new()
        .run_until(async {
            let (responses, _) =
                exchange(routes(), H2ClientBuilder::new(), vec![get("/fail"), get("/")]).await;

            assert_eq!(responses[0].as_ref().unwrap().status(), Status::INTERNAL_SERVER_ERROR);
            // the connection survives
            assert_eq!(responses[1].as_ref().unwrap().status(), Status::OK);
        })
        .await;
}

#[tokio::test]
async fn test_large_body_crosses_flow_control_windows() {
    LocalSet::new()
        .run_until(async {
            let (responses, _) = exchange(routes(), H2ClientBuilder::new(), vec![get("/large")]).await;
            let rep = responses[0].as_ref().unwrap();

            assert_eq!(rep.body().len(), 200_000);
            assert!(rep.body().iter().all(|b| *b == b'x'));
        })
        .await;
}

#[tokio::test]
async fn test_bodies_in_both_directions_over_small_pipe() {
    LocalSet::new()
        .run_until(async {
            let upload = Request::builder()
                .method(Method::Post)
                .path("/echo")
                .authority("localhost")
                .body(vec![b'y'; 60_000])
                .build();
            let run = exchange_over(1024, routes(), H2ClientBuilder::new(), vec![get("/large"), upload]);
            let (responses, _) = tokio::time::timeout(Duration::from_secs(10), run)
                .await
                .expect("exchange stalled");

            assert_eq!(responses[0].as_ref().unwrap().body().len(), 200_000);
            assert_eq!(responses[1].as_ref().unwrap().body().len(), 60_000);
        })
        .await;
}

#[tokio::test]
async fn test_more_requests_than_stream_ceiling() {
    LocalSet::new()
        .run_until(async {
            let requests = (0..150)
                .map(|i| get(if i % 2 == 0 { "/" } else { "/slow" }))
                .collect();
            let (responses, _) = exchange(routes(), H2ClientBuilder::new(), requests).await;

            assert_eq!(responses.len(), 150);
            assert!(responses.iter().all(|r| r.as_ref().unwrap().status() == Status::OK));
        })
        .await;
}

#[tokio::test]
async fn test_server_push() {
    LocalSet::new()
        .run_until(async {
            let mut table = routes();
            table.add_on_push(
                "/index.html",
                |req, mut rep: Response| async move {
                    rep.set_body("<html>");
                    Ok((req, rep))
                },
                |req, mut rep: Response| async move {
                    rep.set_header("content-type", "text/css");
                    rep.set_body("body{}");
                    Ok((req, rep))
                },
            );

            let client = H2ClientBuilder::new().enable_push(true);
            let (responses, mut conn) = exchange(table, client, vec![get("/index.html")]).await;
            assert_eq!(&responses[0].as_ref().unwrap().body()[..], b"<html>");

            let pushed = conn.take_pushed();
            assert_eq!(pushed.len(), 1);
            let (request, response) = &pushed[0];
            // the pushed stream shares the request of the stream that triggered it
            assert_eq!(request.path(), "/index.html");
            assert_eq!(response.headers().get("content-type"), Some("text/css"));
            assert_eq!(&response.body()[..], b"body{}");
        })
        .await;
}

#[tokio::test]
async fn test_push_refused_by_client_settings() {
    LocalSet::new()
        .run_until(async {
            let mut table = routes();
            table.add_on_push(
                "/index.html",
                |req, mut rep: Response| async move {
                    rep.set_body("<html>");
                    Ok((req, rep))
                },
                |req, rep: Response| async move { Ok((req, rep)) },
            );

            let (responses, mut conn) =
                exchange(table, H2ClientBuilder::new(), vec![get("/index.html")]).await;
            assert_eq!(&responses[0].as_ref().unwrap().body()[..], b"<html>");
            assert!(conn.take_pushed().is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_shutdown_handle_stops_idle_connection() {
    LocalSet::new()
        .run_until(async {
            let (_client_io, server_io) = duplex(1024);
            let mut conn = Connection::new(server_io, Rc::new(routes()), ConnectionConfig::server());
            let handle = conn.shutdown_handle();

            let server = spawn_local(async move {
                let result = conn.process().await;
                (result, conn.pending_streams())
            });
            tokio::task::yield_now().await;
            handle.shutdown();

            let (result, pending) = server.await.unwrap();
            assert!(result.is_ok());
            assert_eq!(pending, 0);
        })
        .await;
}

struct Ignore;

impl FrameEvents for Ignore {
    fn on_begin_headers(&mut self, _stream_id: u32, _category: HeadersCategory) {}
    fn on_header(&mut self, _stream_id: u32, _name: &str, _value: &str) {}
    fn on_data_chunk_recv(&mut self, _stream_id: u32, _data: &[u8]) {}
    fn on_frame_recv(&mut self, _frame: &FrameInfo) {}
    fn on_stream_close(&mut self, _stream_id: u32, _code: ErrorCode) {}
}

#[tokio::test]
async fn test_shutdown_interrupts_blocked_write() {
    LocalSet::new()
        .run_until(async {
            let (mut client_io, server_io) = duplex(1024);
            let mut conn = Connection::new(server_io, Rc::new(routes()), ConnectionConfig::server());
            let handle = conn.shutdown_handle();
            let server = spawn_local(async move {
                let result = conn.process().await;
                (result, conn.pending_streams())
            });

            // ask for a large body, then never read
            let mut peer = H2Session::new(Role::Client, Settings::new());
            let request = [(":method", "GET"), (":path", "/large"), (":scheme", "http"), (":authority", "localhost")]
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect();
            peer.submit_request(request, Bytes::new()).unwrap();
            while let Some(bytes) = peer.prepare_send(&mut Ignore) {
                client_io.write_all(&bytes).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!server.is_finished());

            handle.shutdown();
            let (result, pending) = tokio::time::timeout(Duration::from_secs(5), server)
                .await
                .expect("process did not stop")
                .unwrap();
            assert!(result.is_ok());
            assert_eq!(pending, 0);
        })
        .await;
}

#[tokio::test]
async fn test_garbage_preface_fails_connection() {
    LocalSet::new()
        .run_until(async {
            let (mut client_io, server_io) = duplex(1024);
            let server = spawn_local(async move {
                let mut conn = Connection::new(server_io, Rc::new(routes()), ConnectionConfig::server());
                conn.process().await
            });

            client_io.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
            let result = server.await.unwrap();
            assert!(matches!(result, Err(Error::MissingPreface)));

            // the server answered with SETTINGS and GOAWAY(PROTOCOL_ERROR) before closing
            let mut reply = Vec::new();
            client_io.read_to_end(&mut reply).await.unwrap();
            assert_eq!(goaway_code(&reply), Some(ErrorCode::ProtocolError.as_u32()));
        })
        .await;
}

/// Error code of the first GOAWAY frame in `bytes`
fn goaway_code(bytes: &[u8]) -> Option<u32> {
    let mut pos = 0;
    while pos + 9 <= bytes.len() {
        let len = u32::from_be_bytes([0, bytes[pos], bytes[pos + 1], bytes[pos + 2]]) as usize;
        let payload = &bytes[pos + 9..(pos + 9 + len).min(bytes.len())];
        if bytes[pos + 3] == 0x7 && payload.len() >= 8 {
            return Some(u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]));
        }
        pos += 9 + len;
    }
    None
}

#[tokio::test]
async fn test_peer_close_ends_process() {
    LocalSet::new()
        .run_until(async {
            let (mut client_io, server_io) = duplex(1024);
            let server = spawn_local(async move {
                let mut conn = Connection::new(server_io, Rc::new(routes()), ConnectionConfig::server());
                conn.process().await
            });

            // wait for the server SETTINGS, then hang up
            let mut settings = [0u8; 9];
            client_io.read_exact(&mut settings).await.unwrap();
            assert_eq!(settings[3], 0x4);
            drop(client_io);
            assert!(server.await.unwrap().is_ok());
        })
        .await;
}
