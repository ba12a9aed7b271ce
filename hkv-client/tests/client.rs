use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hkv_common::Storage;
use hkv_engine::StripedCache;
use hkv_server::{ReactorMode, Server, ServerConfig};

use hkv_client::{ClientConfig, KVClient};

fn spawn_server(mode: ReactorMode) -> (String, Arc<std::sync::atomic::AtomicBool>, thread::JoinHandle<()>) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        shard_count: 1,
        cache_bytes: hkv_engine::PER_SHARD_FLOOR,
        reactor_mode: mode,
        ..ServerConfig::default()
    };
    let storage: Arc<dyn Storage> = Arc::new(StripedCache::new(1, hkv_engine::PER_SHARD_FLOOR).unwrap());
    let server = Server::bind(config, storage).expect("bind");
    let addr = server.local_addr().expect("addr").to_string();
    let shutdown = server.shutdown_flag();

    let handle = thread::spawn(move || {
        server.run().expect("server run");
    });

    (addr, shutdown, handle)
}

fn client_with_addr(addr: String) -> KVClient {
    let config = ClientConfig {
        addr,
        max_idle: 1,
        max_total: 1,
        read_timeout: Some(Duration::from_secs(2)),
        write_timeout: Some(Duration::from_secs(2)),
        connect_timeout: Some(Duration::from_secs(2)),
    };
    KVClient::with_config(config).expect("client")
}

fn shutdown_and_join(shutdown: Arc<std::sync::atomic::AtomicBool>, handle: thread::JoinHandle<()>) {
    shutdown.store(true, Ordering::SeqCst);
    handle.join().expect("server thread");
}

#[test]
fn set_get_and_delete_roundtrip() {
    let (addr, shutdown, handle) = spawn_server(ReactorMode::SingleThreaded);
    let client = client_with_addr(addr);

    assert!(client.set(b"key", b"value").expect("set"));
    assert_eq!(client.get(b"key").expect("get"), Some(b"value".to_vec()));
    assert!(client.delete(b"key").expect("delete"));
    assert_eq!(client.get(b"key").expect("get after delete"), None);

    shutdown_and_join(shutdown, handle);
}

#[test]
fn add_refuses_existing_key_and_replace_refuses_missing_key() {
    let (addr, shutdown, handle) = spawn_server(ReactorMode::SingleThreaded);
    let client = client_with_addr(addr);

    assert!(client.add(b"a", b"1").expect("add new"));
    assert!(!client.add(b"a", b"2").expect("add existing"));
    assert_eq!(client.get(b"a").expect("get"), Some(b"1".to_vec()));

    assert!(!client.replace(b"missing", b"x").expect("replace missing"));
    assert!(client.replace(b"a", b"3").expect("replace existing"));
    assert_eq!(client.get(b"a").expect("get"), Some(b"3".to_vec()));

    shutdown_and_join(shutdown, handle);
}

#[test]
fn delete_missing_key_reports_not_found() {
    let (addr, shutdown, handle) = spawn_server(ReactorMode::SingleThreaded);
    let client = client_with_addr(addr);

    assert!(!client.delete(b"nope").expect("delete"));

    shutdown_and_join(shutdown, handle);
}

#[test]
fn version_returns_nonempty_string() {
    let (addr, shutdown, handle) = spawn_server(ReactorMode::SingleThreaded);
    let client = client_with_addr(addr);

    let version = client.version().expect("version");
    assert!(!version.is_empty());

    shutdown_and_join(shutdown, handle);
}

#[test]
fn multithreaded_reactor_serves_the_same_protocol() {
    let (addr, shutdown, handle) = spawn_server(ReactorMode::Multithreaded);
    let client = client_with_addr(addr);

    assert!(client.set(b"mt", b"1").expect("set"));
    assert_eq!(client.get(b"mt").expect("get"), Some(b"1".to_vec()));

    shutdown_and_join(shutdown, handle);
}
