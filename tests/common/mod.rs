//! Common test utilities for integration tests
//!
//! `MockServer` is an in-process memcached speaking the text protocol, enough
//! of it for the client: storage commands, retrieval, arithmetic, touch,
//! delete, version, stats groups, cachedump and flush_all. Expiration times
//! are stored but never enforced.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const MOCK_VERSION: &str = "1.6.21";

/// Install a test subscriber; `RUST_LOG=memring=debug` shows client logs
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An address nothing listens on
pub fn unused_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port 0");
    let addr = listener.local_addr().expect("Failed to get local addr");
    drop(listener);
    addr.to_string()
}

#[derive(Debug, Clone)]
struct Item {
    flags: u32,
    exptime: u32,
    data: Vec<u8>,
    cas: u64,
}

#[derive(Default)]
struct Store {
    items: HashMap<String, Item>,
    next_cas: u64,
}

impl Store {
    fn bump(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }
}

/// In-process memcached
pub struct MockServer {
    addr: String,
    store: Arc<Mutex<Store>>,
    cancel: CancellationToken,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl MockServer {
    /// Start on a random local port
    pub async fn start() -> Self {
        Self::start_on("127.0.0.1:0").await
    }

    /// Start on a specific address, e.g. to bring a stopped server back
    pub async fn start_on(addr: &str) -> Self {
        let listener = TcpListener::bind(addr).await.expect("Failed to bind mock server");
        let addr = listener.local_addr().unwrap().to_string();
        let store = Arc::new(Mutex::new(Store::default()));
        let cancel = CancellationToken::new();

        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&store), cancel.clone()));
        Self {
            addr,
            store,
            cancel,
            accept: Mutex::new(Some(accept)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Close the listener and every open connection
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.accept.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn len(&self) -> usize {
        self.store.lock().items.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().items.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<(u32, Vec<u8>)> {
        self.store
            .lock()
            .items
            .get(key)
            .map(|item| (item.flags, item.data.clone()))
    }

    pub fn exptime(&self, key: &str) -> Option<u32> {
        self.store.lock().items.get(key).map(|item| item.exptime)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, store: Arc<Mutex<Store>>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { break };
                tokio::spawn(serve(stream, Arc::clone(&store), cancel.clone()));
            }
        }
    }
}

async fn serve(stream: TcpStream, store: Arc<Mutex<Store>>, cancel: CancellationToken) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        let parts: Vec<&str> = text.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            continue;
        };

        let reply = match command {
            "set" | "add" | "replace" | "append" | "prepend" | "cas" => {
                let Some(len) = parts.get(4).and_then(|n| n.parse::<usize>().ok()) else {
                    let _ = writer.write_all(b"CLIENT_ERROR bad command line format\r\n").await;
                    continue;
                };
                let mut data = vec![0u8; len + 2];
                if reader.read_exact(&mut data).await.is_err() {
                    break;
                }
                data.truncate(len);
                let mut guard = store.lock();
                storage(&mut guard, &parts, data)
            }
            "get" | "gets" => retrieval(&store.lock(), &parts[1..], command == "gets"),
            "incr" | "decr" => arithmetic(&mut store.lock(), &parts, command == "incr"),
            "delete" => match store.lock().items.remove(parts[1]) {
                Some(_) => b"DELETED\r\n".to_vec(),
                None => b"NOT_FOUND\r\n".to_vec(),
            },
            "touch" => {
                let mut store = store.lock();
                match store.items.get_mut(parts[1]) {
                    Some(item) => {
                        item.exptime = parts[2].parse().unwrap_or(0);
                        b"TOUCHED\r\n".to_vec()
                    }
                    None => b"NOT_FOUND\r\n".to_vec(),
                }
            }
            "version" => format!("VERSION {MOCK_VERSION}\r\n").into_bytes(),
            "stats" => stats(&store.lock(), &parts[1..]),
            "flush_all" => {
                store.lock().items.clear();
                b"OK\r\n".to_vec()
            }
            _ => b"ERROR\r\n".to_vec(),
        };

        if writer.write_all(&reply).await.is_err() {
            break;
        }
    }
}

fn storage(store: &mut Store, parts: &[&str], data: Vec<u8>) -> Vec<u8> {
    let key = parts[1].to_string();
    let flags = parts[2].parse().unwrap_or(0);
    let exptime = parts[3].parse().unwrap_or(0);
    let exists = store.items.contains_key(&key);

    let stored = match parts[0] {
        "set" => true,
        "add" => !exists,
        "replace" | "append" | "prepend" => exists,
        "cas" => {
            let expected: u64 = parts.get(5).and_then(|c| c.parse().ok()).unwrap_or(0);
            match store.items.get(&key) {
                None => return b"NOT_FOUND\r\n".to_vec(),
                Some(item) if item.cas != expected => return b"EXISTS\r\n".to_vec(),
                Some(_) => true,
            }
        }
        _ => false,
    };
    if !stored {
        return b"NOT_STORED\r\n".to_vec();
    }

    let cas = store.bump();
    match parts[0] {
        "append" | "prepend" => {
            if let Some(item) = store.items.get_mut(&key) {
                if parts[0] == "append" {
                    item.data.extend_from_slice(&data);
                } else {
                    let mut joined = data;
                    joined.extend_from_slice(&item.data);
                    item.data = joined;
                }
                item.cas = cas;
            }
        }
        _ => {
            store.items.insert(
                key,
                Item {
                    flags,
                    exptime,
                    data,
                    cas,
                },
            );
        }
    }
    b"STORED\r\n".to_vec()
}

fn retrieval(store: &Store, keys: &[&str], with_cas: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for key in keys {
        if let Some(item) = store.items.get(*key) {
            let header = if with_cas {
                format!("VALUE {key} {} {} {}\r\n", item.flags, item.data.len(), item.cas)
            } else {
                format!("VALUE {key} {} {}\r\n", item.flags, item.data.len())
            };
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(&item.data);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"END\r\n");
    out
}

fn arithmetic(store: &mut Store, parts: &[&str], incr: bool) -> Vec<u8> {
    let amount: u64 = parts.get(2).and_then(|n| n.parse().ok()).unwrap_or(0);
    let cas = store.bump();
    let Some(item) = store.items.get_mut(parts[1]) else {
        return b"NOT_FOUND\r\n".to_vec();
    };
    let Some(current) = std::str::from_utf8(&item.data)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
    else {
        return b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec();
    };

    let next = if incr {
        current.wrapping_add(amount)
    } else {
        current.saturating_sub(amount)
    };
    item.data = next.to_string().into_bytes();
    item.cas = cas;
    format!("{next}\r\n").into_bytes()
}

fn stats(store: &Store, args: &[&str]) -> Vec<u8> {
    let mut out = String::new();
    match args {
        [] => {
            out.push_str("STAT pid 4242\r\n");
            out.push_str(&format!("STAT version {MOCK_VERSION}\r\n"));
            out.push_str(&format!("STAT curr_items {}\r\n", store.items.len()));
        }
        ["settings"] => {
            out.push_str("STAT maxbytes 67108864\r\n");
            out.push_str("STAT maxconns 1024\r\n");
            out.push_str("STAT item_size_max 1048576\r\n");
        }
        ["slabs"] => {
            out.push_str("STAT 1:chunk_size 96\r\n");
            out.push_str(&format!("STAT 1:used_chunks {}\r\n", store.items.len()));
            out.push_str("STAT active_slabs 1\r\n");
        }
        ["items"] => {
            out.push_str(&format!("STAT items:1:number {}\r\n", store.items.len()));
        }
        ["cachedump", _slab, limit] => {
            let limit: usize = limit.parse().unwrap_or(0);
            let mut keys: Vec<(&String, &Item)> = store.items.iter().collect();
            keys.sort_by(|a, b| a.0.cmp(b.0));
            let take = if limit == 0 { keys.len() } else { limit };
            for (key, item) in keys.into_iter().take(take) {
                out.push_str(&format!(
                    "ITEM {key} [{} b; {} s]\r\n",
                    item.data.len(),
                    item.exptime
                ));
            }
        }
        _ => return b"ERROR\r\n".to_vec(),
    }
    out.push_str("END\r\n");
    out.into_bytes()
}

/// Wait for an event matching `pred`, skipping others
pub async fn wait_for<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    timeout: Duration,
    pred: impl Fn(&T) -> bool,
) -> Option<T> {
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// First key of the form `key:N` that routes to `addr`
pub fn key_on(client: &memring::Client, addr: &str) -> String {
    (0..10_000)
        .map(|i| format!("key:{i}"))
        .find(|key| client.server_for(key).unwrap() == addr)
        .expect("no key routes to server")
}
