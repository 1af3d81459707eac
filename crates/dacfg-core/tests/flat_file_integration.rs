//! Two clients sharing one flat-file store: durability and cross-instance
//! change notification.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dacfg_core::{notify_fn, Client, EventLoop, FlatFileBackend, NotifyPolicy, TypedValue};

fn schema_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data/test-config.schema.toml")
}

fn open_client(store: &std::path::Path, ev: Option<&EventLoop>) -> Client {
    let backend = Arc::new(FlatFileBackend::open(store).expect("store must open"));
    let mut builder = Client::builder(schema_path()).backend(backend);
    if let Some(ev) = ev {
        builder = builder.event_loop(ev.handle());
    }
    builder.build().expect("client must build")
}

/// Drives `ev` until `done` holds or five seconds pass.
fn drive_until(ev: &EventLoop, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if ev.wait_pending(Duration::from_millis(100)) {
            ev.run_pending();
        }
        if done() {
            return true;
        }
    }
    done()
}

#[test]
fn test_values_persist_across_client_instances() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store.toml");

    // Act
    {
        let writer = open_client(&store, None);
        writer.set_float("numeric", "float", 1.25).unwrap();
        writer
            .set_list("list", "string", ["a;b", "c\\d", ""])
            .unwrap();
    }
    let reader = open_client(&store, None);

    // Assert
    assert_eq!(reader.get_float("numeric", "float").unwrap(), 1.25);
    assert_eq!(
        reader.get_value("list", "string").unwrap(),
        TypedValue::from(vec!["a;b", "c\\d", ""])
    );
    assert_eq!(reader.get_int("numeric", "integer").unwrap(), 3);
}

#[test]
fn test_write_by_other_instance_notifies_listener() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store.toml");
    let ev = EventLoop::new();
    let watcher = open_client(&store, Some(&ev));
    let writer = open_client(&store, None);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    watcher
        .notify_add(
            "misc",
            "string",
            notify_fn(move |_, _, value| sink.lock().unwrap().push(value.clone())),
        )
        .unwrap();

    // Act
    writer.set_string("misc", "string", "from elsewhere").unwrap();

    // Assert
    let delivered = drive_until(&ev, || !seen.lock().unwrap().is_empty());
    assert!(delivered, "change by another instance must be delivered");
    assert_eq!(
        seen.lock().unwrap()[0],
        TypedValue::from("from elsewhere")
    );
    assert_eq!(
        watcher.get_string("misc", "string").unwrap(),
        "from elsewhere"
    );
}

#[test]
fn test_on_change_policy_drops_rewrite_of_same_value() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store.toml");
    let ev = EventLoop::new();
    let backend = Arc::new(FlatFileBackend::open(&store).unwrap());
    let client = Client::builder(schema_path())
        .backend(backend)
        .event_loop(ev.handle())
        .notify_policy(NotifyPolicy::OnChange)
        .build()
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .notify_add(
            "numeric",
            "integer",
            notify_fn(move |_, _, value| sink.lock().unwrap().push(value.clone())),
        )
        .unwrap();

    // Act
    client.set_int("numeric", "integer", 3).unwrap();
    client.set_int("numeric", "integer", 4).unwrap();
    client.set_int("numeric", "integer", 4).unwrap();
    ev.run_pending();

    // Assert
    assert_eq!(*seen.lock().unwrap(), vec![TypedValue::Int(4)]);
}
