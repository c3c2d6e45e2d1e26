//! Integration tests for Peerchat
//!
//! Every test runs two peers on loopback, each with its own storage
//! directory and local port, talking through the public API only.

use std::fs;
use std::net::TcpListener;
use std::sync::OnceLock;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use peerchat::chat::{open, Channel, ChatConfig, ChatError, ChatMessage, Role};
use peerchat::crypto::{load_foreign_key, persist_foreign_key, KeyPair, KeyPaths, KeyStore};

const WAIT: Duration = Duration::from_secs(60);

fn alice() -> KeyPair {
    static KEY: OnceLock<KeyPair> = OnceLock::new();
    KEY.get_or_init(|| KeyPair::generate().unwrap()).clone()
}

fn bob() -> KeyPair {
    static KEY: OnceLock<KeyPair> = OnceLock::new();
    KEY.get_or_init(|| KeyPair::generate().unwrap()).clone()
}

fn mallory() -> KeyPair {
    static KEY: OnceLock<KeyPair> = OnceLock::new();
    KEY.get_or_init(|| KeyPair::generate().unwrap()).clone()
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Storage directory with `identity` already saved in it.
fn provisioned(temp: &TempDir, name: &str, identity: &KeyPair) -> KeyPaths {
    let paths = KeyPaths::in_dir(temp.path().join(name));
    fs::create_dir_all(&paths.dir).unwrap();
    identity.save_to_files(&paths.private, &paths.public).unwrap();
    paths
}

fn config(paths: KeyPaths, local_port: u16, remote_port: u16) -> ChatConfig {
    ChatConfig::new("127.0.0.1", paths).with_ports(local_port, remote_port)
}

struct Peer {
    channel: Channel,
    messages: mpsc::UnboundedReceiver<Value>,
    closed: oneshot::Receiver<()>,
}

async fn connect(config: ChatConfig) -> Result<Peer, ChatError> {
    let keys = config.load_keys()?;
    let (tx, messages) = mpsc::unbounded_channel();
    let (close_tx, closed) = oneshot::channel();

    let channel = open(
        &config,
        &keys,
        Some(move |message: Value| {
            let _ = tx.send(message);
        }),
        move || {
            let _ = close_tx.send(());
        },
    )
    .await?;

    Ok(Peer { channel, messages, closed })
}

/// Start the first peer, give it time to fall back to listening, then
/// start the second.
async fn connect_pair(first: ChatConfig, second: ChatConfig) -> (Result<Peer, ChatError>, Result<Peer, ChatError>) {
    let first = tokio::spawn(connect(first));
    sleep(Duration::from_millis(300)).await;
    let second = timeout(WAIT, connect(second)).await.expect("second peer timed out");
    let first = timeout(WAIT, first).await.expect("first peer timed out").unwrap();
    (first, second)
}

/// Test the basic hello / hi exchange with stored keys on both sides
#[tokio::test]
async fn test_hello_and_hi() {
    let temp = TempDir::new().unwrap();
    let (p1, p2) = (free_port(), free_port());

    let a = config(provisioned(&temp, "a", &alice()), p1, p2);
    let b = config(provisioned(&temp, "b", &bob()), p2, p1);

    let (a, b) = connect_pair(a, b).await;
    let mut a = a.unwrap();
    let mut b = b.unwrap();

    // The first peer found nobody listening, so it accepted
    assert_eq!(a.channel.role(), Role::Acceptor);
    assert_eq!(b.channel.role(), Role::Connector);

    a.channel.send(&ChatMessage::new("hello")).await.unwrap();
    let got = timeout(WAIT, b.messages.recv()).await.unwrap().unwrap();
    assert_eq!(got, serde_json::json!({"text": "hello"}));

    b.channel.send(&ChatMessage::new("hi")).await.unwrap();
    let got = timeout(WAIT, a.messages.recv()).await.unwrap().unwrap();
    assert_eq!(got["text"], "hi");

    b.channel.close().await.unwrap();
    timeout(WAIT, a.closed).await.unwrap().unwrap();
    timeout(WAIT, b.closed).await.unwrap().unwrap();
}

/// Test that a fresh storage directory is created for temporary keys
#[tokio::test]
async fn test_temporary_keys_bootstrap_directory() {
    let temp = TempDir::new().unwrap();
    let (p1, p2) = (free_port(), free_port());

    let a = config(provisioned(&temp, "a", &alice()), p1, p2);
    let mut b = config(KeyPaths::in_dir(temp.path().join("fresh")), p2, p1);
    b.temporary_keys = true;
    let fresh_dir = b.key_paths.dir.clone();

    let (a, b) = connect_pair(a, b).await;
    let mut a = a.unwrap();
    let mut b = b.unwrap();

    assert!(fresh_dir.is_dir());
    // Temporary keys are never written
    assert!(!fresh_dir.join("priv_key").exists());
    assert!(a.channel.learned_peer_key());
    assert!(b.channel.learned_peer_key());
    assert_eq!(b.channel.peer_key(), alice().public_key());

    b.channel.send(&ChatMessage::new("from a throwaway key")).await.unwrap();
    let got = timeout(WAIT, a.messages.recv()).await.unwrap().unwrap();
    assert_eq!(got["text"], "from a throwaway key");
}

/// Test known keys on both sides, and saving the peer key into a profile map
#[tokio::test]
async fn test_known_keys_and_save_profile() {
    let temp = TempDir::new().unwrap();
    let (p1, p2) = (free_port(), free_port());

    let bob_pub = temp.path().join("bob.pub");
    persist_foreign_key(bob().public_key(), &bob_pub, None).unwrap();
    let saved = temp.path().join("contacts.json");

    let mut a = config(provisioned(&temp, "a", &alice()), p1, p2).with_foreign_key(&bob_pub);
    a.save_foreign_key = Some(saved.clone());

    let b_paths = provisioned(&temp, "b", &bob());
    persist_foreign_key(alice().public_key(), &b_paths.foreign, Some("alice")).unwrap();
    let mut b = config(b_paths, p2, p1);
    b.profile = Some("alice".to_string());

    let (a, b) = connect_pair(a, b).await;
    let a = a.unwrap();
    let b = b.unwrap();

    assert!(!a.channel.learned_peer_key());
    assert!(!b.channel.learned_peer_key());
    assert_eq!(a.channel.peer_key(), bob().public_key());
    assert_eq!(b.channel.peer_key(), alice().public_key());

    assert_eq!(&load_foreign_key(&saved, None).unwrap(), bob().public_key());
}

/// Test that an impostor is rejected on both sides
#[tokio::test]
async fn test_wrong_peer_key_fails_both_sides() {
    let temp = TempDir::new().unwrap();
    let (p1, p2) = (free_port(), free_port());

    // Alice expects Bob, but Mallory answers
    let bob_pub = temp.path().join("bob.pub");
    persist_foreign_key(bob().public_key(), &bob_pub, None).unwrap();
    let a = config(provisioned(&temp, "a", &alice()), p1, p2).with_foreign_key(&bob_pub);
    let m = config(provisioned(&temp, "m", &mallory()), p2, p1);

    let (a, m) = connect_pair(a, m).await;
    let a_err = a.err().expect("alice must reject mallory");
    let m_err = m.err().expect("mallory must fail too");
    assert_eq!(a_err.code(), Some(103));
    assert_eq!(m_err.code(), Some(103));
}

/// Test that peers started at the same moment still end up with one session
#[tokio::test]
async fn test_simultaneous_start() {
    let temp = TempDir::new().unwrap();
    let (p1, p2) = (free_port(), free_port());

    let mut a = config(provisioned(&temp, "a", &alice()), p1, p2);
    let mut b = config(provisioned(&temp, "b", &bob()), p2, p1);
    a.opening_timeout = Duration::from_millis(500);
    b.opening_timeout = Duration::from_millis(500);

    let first = tokio::spawn(timeout(WAIT, connect(a)));
    let second = tokio::spawn(timeout(WAIT, connect(b)));

    let mut a = first.await.unwrap().expect("first peer hung").unwrap();
    let mut b = second.await.unwrap().expect("second peer hung").unwrap();
    assert_ne!(a.channel.role(), b.channel.role());

    a.channel.send(&ChatMessage::new("together")).await.unwrap();
    let got = timeout(WAIT, b.messages.recv()).await.unwrap().unwrap();
    assert_eq!(got["text"], "together");
}

/// Test the directory error when a file sits where the storage directory goes
#[test]
fn test_storage_path_is_a_file() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("occupied");
    fs::write(&dir, "not a directory").unwrap();

    let config = config(KeyPaths::in_dir(&dir), 4567, 4567);
    let err = config.load_keys().unwrap_err();
    assert_eq!(err.code(), Some(100));
    assert_eq!(fs::read_to_string(&dir).unwrap(), "not a directory");
}

/// Test that a missing explicit foreign key is reported before connecting
#[test]
fn test_missing_explicit_foreign_key() {
    let temp = TempDir::new().unwrap();
    let paths = provisioned(&temp, "a", &alice());
    let config = config(paths, 4567, 4567).with_foreign_key(temp.path().join("absent.pub"));

    let err = config.load_keys().unwrap_err();
    assert_eq!(err.code(), Some(102));
}

/// Test that key stores built in memory work the same as loaded ones
#[test]
fn test_in_memory_key_store() {
    let keys = KeyStore::new(alice()).with_foreign_key(bob().public_key().clone());
    assert!(keys.has_foreign_key());
    assert!(keys.public_key_pem().unwrap().contains("RSA PUBLIC KEY"));
}
