//! End-to-end FastCGI tests against a real TCP listener. The client side
//! re-implements record encoding at the byte level so the server is tested
//! against the wire format, not against its own codec.

use std::collections::HashMap;
use std::sync::Arc;

use rgi_core::{
    async_trait, Body, Handler, Request, Response, Server, ServerConfig, ShutdownHandle,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const FCGI_VERSION: u8 = 1;
const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_RESPONDER: u16 = 1;
const FCGI_KEEP_CONN: u8 = 1;

fn encode_record(record_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    let padding = (8 - (content.len() % 8)) % 8;
    let mut buf = Vec::with_capacity(8 + content.len() + padding);
    buf.push(FCGI_VERSION);
    buf.push(record_type);
    buf.push((request_id >> 8) as u8);
    buf.push((request_id & 0xff) as u8);
    buf.push((content.len() >> 8) as u8);
    buf.push((content.len() & 0xff) as u8);
    buf.push(padding as u8);
    buf.push(0);
    buf.extend_from_slice(content);
    buf.extend(std::iter::repeat(0u8).take(padding));
    buf
}

fn encode_nv_pair(name: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    if name.len() < 128 {
        buf.push(name.len() as u8);
    } else {
        buf.extend_from_slice(&((name.len() as u32) | 0x8000_0000).to_be_bytes());
    }
    if value.len() < 128 {
        buf.push(value.len() as u8);
    } else {
        buf.extend_from_slice(&((value.len() as u32) | 0x8000_0000).to_be_bytes());
    }
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
    buf
}

fn begin_request(request_id: u16, flags: u8) -> Vec<u8> {
    let mut body = [0u8; 8];
    body[0] = (FCGI_RESPONDER >> 8) as u8;
    body[1] = (FCGI_RESPONDER & 0xff) as u8;
    body[2] = flags;
    encode_record(FCGI_BEGIN_REQUEST, request_id, &body)
}

fn params_record(request_id: u16, pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut content = Vec::new();
    for (name, value) in pairs {
        content.extend_from_slice(&encode_nv_pair(name.as_bytes(), value.as_bytes()));
    }
    encode_record(FCGI_PARAMS, request_id, &content)
}

/// Per-request stdout bytes and END_REQUEST protocol status.
#[derive(Debug, Default)]
struct CollectedResponse {
    stdout: Vec<u8>,
    protocol_status: Option<u8>,
}

/// Read records until every request id in `ids` has seen END_REQUEST.
async fn collect_responses(
    stream: &mut TcpStream,
    ids: &[u16],
) -> HashMap<u16, CollectedResponse> {
    let mut out: HashMap<u16, CollectedResponse> = HashMap::new();
    let mut remaining: Vec<u16> = ids.to_vec();
    while !remaining.is_empty() {
        let mut hdr = [0u8; 8];
        stream.read_exact(&mut hdr).await.expect("record header");
        assert_eq!(hdr[0], FCGI_VERSION);
        let rtype = hdr[1];
        let rid = u16::from_be_bytes([hdr[2], hdr[3]]);
        let content_len = u16::from_be_bytes([hdr[4], hdr[5]]) as usize;
        let padding_len = hdr[6] as usize;
        let mut body = vec![0u8; content_len + padding_len];
        if !body.is_empty() {
            stream.read_exact(&mut body).await.expect("record body");
        }
        let content = &body[..content_len];
        match rtype {
            FCGI_STDOUT => {
                out.entry(rid).or_default().stdout.extend_from_slice(content);
            }
            FCGI_END_REQUEST => {
                out.entry(rid).or_default().protocol_status = Some(content[4]);
                remaining.retain(|id| *id != rid);
            }
            _ => {}
        }
    }
    out
}

/// Split CGI output into (status line + headers, body).
fn split_cgi_output(raw: &[u8]) -> (String, Vec<u8>) {
    let text = raw;
    let pos = (0..text.len())
        .find(|&i| text[i..].starts_with(b"\r\n\r\n"))
        .expect("header boundary");
    (
        String::from_utf8(text[..pos].to_vec()).unwrap(),
        text[pos + 4..].to_vec(),
    )
}

struct AppHandler;

#[async_trait]
impl Handler for AppHandler {
    async fn handle(&self, req: Request, res: &mut Response) -> anyhow::Result<()> {
        match req.path.as_str() {
            "/json" => {
                res.json(&serde_json::json!({"message": "hi"})).await?;
            }
            "/greet" => {
                let name = req.query.get_str("name").unwrap_or("nobody");
                res.json(&serde_json::json!({ "hello": name })).await?;
            }
            "/echo-body" => {
                let Body::Json(value) = &req.body else {
                    anyhow::bail!("expected a JSON body, got {:?}", req.body);
                };
                res.json(value).await?;
            }
            "/moved" => {
                res.redirect_with_status("/new", 301).await?;
            }
            _ => {
                res.status(404)?;
                res.content_type("text")?;
                res.write("no such route").await?;
                res.end().await?;
            }
        }
        Ok(())
    }
}

async fn start_server() -> (std::net::SocketAddr, ShutdownHandle) {
    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await.expect("bind");
    let addr = server.local_addr().expect("tcp addr");
    let shutdown = server.shutdown_handle();
    tokio::spawn(server.serve(Arc::new(AppHandler)));
    (addr, shutdown)
}

#[tokio::test]
async fn simple_get_returns_json() {
    let (addr, shutdown) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(&begin_request(1, FCGI_KEEP_CONN)).await.unwrap();
    stream
        .write_all(&params_record(
            1,
            &[
                ("REQUEST_METHOD", "GET"),
                ("REQUEST_URI", "/json?x=1"),
                ("QUERY_STRING", "x=1"),
                ("HTTP_HOST", "localhost"),
            ],
        ))
        .await
        .unwrap();
    stream.write_all(&params_record(1, &[])).await.unwrap();
    stream.write_all(&encode_record(FCGI_STDIN, 1, &[])).await.unwrap();

    let responses = collect_responses(&mut stream, &[1]).await;
    let resp = &responses[&1];
    assert_eq!(resp.protocol_status, Some(0));

    let (head, body) = split_cgi_output(&resp.stdout);
    assert!(head.starts_with("Status: 200 OK\r\n"));
    assert!(head.contains("Content-Type: application/json; charset=utf-8"));
    assert!(head.contains("Content-Length: 15"));
    assert_eq!(body, b"{\"message\":\"hi\"}");

    shutdown.shutdown();
}

#[tokio::test]
async fn json_post_body_reaches_the_handler() {
    let (addr, shutdown) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let body = b"{\"name\":\"John\"}";
    stream.write_all(&begin_request(1, FCGI_KEEP_CONN)).await.unwrap();
    stream
        .write_all(&params_record(
            1,
            &[
                ("REQUEST_METHOD", "POST"),
                ("REQUEST_URI", "/echo-body"),
                ("CONTENT_TYPE", "application/json"),
                ("CONTENT_LENGTH", "15"),
            ],
        ))
        .await
        .unwrap();
    stream.write_all(&params_record(1, &[])).await.unwrap();
    stream.write_all(&encode_record(FCGI_STDIN, 1, body)).await.unwrap();
    stream.write_all(&encode_record(FCGI_STDIN, 1, &[])).await.unwrap();

    let responses = collect_responses(&mut stream, &[1]).await;
    let (_, body) = split_cgi_output(&responses[&1].stdout);
    assert_eq!(body, b"{\"name\":\"John\"}");

    shutdown.shutdown();
}

#[tokio::test]
async fn interleaved_requests_multiplex_on_one_connection() {
    let (addr, shutdown) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // BEGIN(1), BEGIN(2), PARAMS(1), PARAMS(2), PARAMS(1, empty),
    // STDIN(1, empty), PARAMS(2, empty), STDIN(2, empty)
    stream.write_all(&begin_request(1, FCGI_KEEP_CONN)).await.unwrap();
    stream.write_all(&begin_request(2, FCGI_KEEP_CONN)).await.unwrap();
    stream
        .write_all(&params_record(
            1,
            &[
                ("REQUEST_METHOD", "GET"),
                ("REQUEST_URI", "/greet?name=first"),
                ("QUERY_STRING", "name=first"),
            ],
        ))
        .await
        .unwrap();
    stream
        .write_all(&params_record(
            2,
            &[
                ("REQUEST_METHOD", "GET"),
                ("REQUEST_URI", "/greet?name=second"),
                ("QUERY_STRING", "name=second"),
            ],
        ))
        .await
        .unwrap();
    stream.write_all(&params_record(1, &[])).await.unwrap();
    stream.write_all(&encode_record(FCGI_STDIN, 1, &[])).await.unwrap();
    stream.write_all(&params_record(2, &[])).await.unwrap();
    stream.write_all(&encode_record(FCGI_STDIN, 2, &[])).await.unwrap();

    let responses = collect_responses(&mut stream, &[1, 2]).await;
    for (id, expect) in [(1u16, "first"), (2u16, "second")] {
        let resp = &responses[&id];
        assert_eq!(resp.protocol_status, Some(0), "request {id}");
        let (_, body) = split_cgi_output(&resp.stdout);
        assert_eq!(
            body,
            format!("{{\"hello\":\"{expect}\"}}").into_bytes(),
            "request {id}"
        );
    }

    shutdown.shutdown();
}

#[tokio::test]
async fn keep_conn_allows_sequential_requests() {
    let (addr, shutdown) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    for id in [1u16, 2, 3] {
        stream.write_all(&begin_request(id, FCGI_KEEP_CONN)).await.unwrap();
        stream
            .write_all(&params_record(
                id,
                &[("REQUEST_METHOD", "GET"), ("REQUEST_URI", "/json")],
            ))
            .await
            .unwrap();
        stream.write_all(&params_record(id, &[])).await.unwrap();
        stream.write_all(&encode_record(FCGI_STDIN, id, &[])).await.unwrap();
        let responses = collect_responses(&mut stream, &[id]).await;
        assert_eq!(responses[&id].protocol_status, Some(0));
    }

    shutdown.shutdown();
}

#[tokio::test]
async fn redirect_emits_location_and_status() {
    let (addr, shutdown) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(&begin_request(1, FCGI_KEEP_CONN)).await.unwrap();
    stream
        .write_all(&params_record(
            1,
            &[("REQUEST_METHOD", "GET"), ("REQUEST_URI", "/moved")],
        ))
        .await
        .unwrap();
    stream.write_all(&params_record(1, &[])).await.unwrap();
    stream.write_all(&encode_record(FCGI_STDIN, 1, &[])).await.unwrap();

    let responses = collect_responses(&mut stream, &[1]).await;
    let (head, _) = split_cgi_output(&responses[&1].stdout);
    assert!(head.starts_with("Status: 301 Moved Permanently\r\n"));
    assert!(head.contains("Location: /new\r\n"));

    shutdown.shutdown();
}

#[tokio::test]
async fn handler_error_becomes_a_contained_500() {
    struct Failing;

    #[async_trait]
    impl Handler for Failing {
        async fn handle(&self, _req: Request, _res: &mut Response) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve(Arc::new(Failing)));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&begin_request(1, FCGI_KEEP_CONN)).await.unwrap();
    stream
        .write_all(&params_record(1, &[("REQUEST_METHOD", "GET")]))
        .await
        .unwrap();
    stream.write_all(&params_record(1, &[])).await.unwrap();
    stream.write_all(&encode_record(FCGI_STDIN, 1, &[])).await.unwrap();

    let responses = collect_responses(&mut stream, &[1]).await;
    let resp = &responses[&1];
    // The protocol-level exchange still completes normally.
    assert_eq!(resp.protocol_status, Some(0));
    let (head, body) = split_cgi_output(&resp.stdout);
    assert!(head.starts_with("Status: 500 Internal Server Error\r\n"));
    assert_eq!(body, b"Internal Server Error: boom");
}

#[tokio::test]
async fn shutdown_runs_completion_callback() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let flag = Arc::new(AtomicBool::new(false));
    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    let flag2 = Arc::clone(&flag);
    let server = Server::bind(config)
        .await
        .unwrap()
        .on_shutdown(move || flag2.store(true, Ordering::SeqCst));
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let serve_task = tokio::spawn(server.serve(Arc::new(AppHandler)));

    // The endpoint is reachable, then shutdown stops the accept loop.
    let _probe = TcpStream::connect(addr).await.unwrap();
    shutdown.shutdown();
    serve_task.await.unwrap().unwrap();
    assert!(flag.load(Ordering::SeqCst));
    assert!(TcpStream::connect(addr).await.is_err());
}
