//! In-process mock of an EVM JSON-RPC node. Answers `eth_blockNumber`,
//! `eth_getBlockByNumber`, and a `test_echo` method used by the batching
//! tests; failure injection knobs let tests exercise retry and breaker
//! behavior without a real node.

use std::{
    collections::HashSet,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Result;
use chainspan::rpc::client::{parse_quantity, quantity};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct MockNode {
    head: Arc<AtomicU64>,
    fail_http: Arc<AtomicUsize>,
    fail_blocks: Arc<Mutex<HashSet<u64>>>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
    single_calls: Arc<AtomicU64>,
}

impl MockNode {
    pub fn new(head: u64) -> Self {
        Self {
            head: Arc::new(AtomicU64::new(head)),
            fail_http: Arc::new(AtomicUsize::new(0)),
            fail_blocks: Arc::new(Mutex::new(HashSet::new())),
            batch_sizes: Arc::new(Mutex::new(Vec::new())),
            single_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// The next `count` HTTP requests answer 500.
    pub fn fail_next_http(&self, count: usize) {
        self.fail_http.store(count, Ordering::SeqCst);
    }

    /// Requests for this block answer a JSON-RPC error entry.
    pub fn fail_block(&self, number: u64) {
        self.fail_blocks.lock().unwrap().insert(number);
    }

    pub fn clear_failed_blocks(&self) {
        self.fail_blocks.lock().unwrap().clear();
    }

    /// Sizes of the batched wire calls observed so far.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn single_calls(&self) -> u64 {
        self.single_calls.load(Ordering::SeqCst)
    }

    fn take_http_failure(&self) -> bool {
        self.fail_http
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    fn respond(&self, request: &Value) -> Value {
        let id = request["id"].clone();
        let Some(method) = request["method"].as_str() else {
            return error_entry(id, -32600, "invalid request");
        };

        match method {
            "eth_blockNumber" => result_entry(id, json!(quantity(self.head()))),
            "eth_getBlockByNumber" => {
                let Ok(number) = parse_quantity(&request["params"][0]) else {
                    return error_entry(id, -32602, "invalid block number");
                };
                if self.fail_blocks.lock().unwrap().contains(&number) {
                    return error_entry(id, -32000, "induced block failure");
                }
                if number > self.head() {
                    return result_entry(id, Value::Null);
                }
                result_entry(id, block_json(number))
            }
            "test_echo" => result_entry(id, request["params"][0].clone()),
            _ => error_entry(id, -32601, "method not found"),
        }
    }
}

fn result_entry(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_entry(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

pub fn block_json(number: u64) -> Value {
    json!({
        "number": quantity(number),
        "hash": block_hash(number),
        "parentHash": block_hash(number.wrapping_sub(1)),
        "transactions": [],
    })
}

pub fn block_hash(number: u64) -> String {
    format!("0x{:064x}", number.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1))
}

pub struct MockServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(node: MockNode) -> Result<Self> {
        let make_svc = make_service_fn(move |_| {
            let node = node.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let node = node.clone();
                    async move { handle(node, request).await }
                }))
            }
        });

        let server = Server::bind(&"127.0.0.1:0".parse().expect("loopback addr")).serve(make_svc);
        let addr = server.local_addr();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock rpc server error: {err}");
            }
        });

        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

async fn handle(node: MockNode, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    if request.method() != Method::POST {
        return Ok(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }

    let bytes = match body::to_bytes(request.into_body()).await {
        Ok(bytes) => bytes,
        Err(_) => return Ok(status_response(StatusCode::BAD_REQUEST)),
    };

    if node.take_http_failure() {
        return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
    }

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(_) => return Ok(status_response(StatusCode::BAD_REQUEST)),
    };

    let response = match payload {
        Value::Array(requests) => {
            node.batch_sizes.lock().unwrap().push(requests.len());
            Value::Array(requests.iter().map(|entry| node.respond(entry)).collect())
        }
        single => {
            node.single_calls.fetch_add(1, Ordering::SeqCst);
            node.respond(&single)
        }
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(response.to_string()))
        .expect("response must build"))
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("status response must build")
}
