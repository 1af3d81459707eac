//! `watch`: print changes to selected keys until shutdown.
//!
//! The engine's [`EventLoop`] does not run by itself.  This module drives it
//! from a Tokio task: every tick it drains whatever notifications are
//! pending, so listener callbacks run on the task that owns the loop.

use std::future::Future;
use std::time::Duration;

use dacfg_core::{Client, EventLoop, KeyPath, ListenerHandle, NotifyFn};
use tracing::{debug, info};

/// Registers `sink` on every key in `keys`.
///
/// # Errors
///
/// Fails on the first undeclared key; listeners registered before it are
/// removed again.
pub fn subscribe(
    client: &Client,
    keys: &[KeyPath],
    sink: &NotifyFn,
) -> anyhow::Result<Vec<ListenerHandle>> {
    let mut handles = Vec::with_capacity(keys.len());
    for path in keys {
        match client.notify_add(&path.group, &path.key, sink.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for handle in handles {
                    client.notify_remove_handle(handle)?;
                }
                return Err(e.into());
            }
        }
    }
    info!("watching {} key(s)", handles.len());
    Ok(handles)
}

/// Drains `event_loop` every `interval` until `shutdown` completes.
/// Returns the number of passes that delivered something.
pub async fn drive(
    event_loop: &EventLoop,
    interval: Duration,
    shutdown: impl Future<Output = ()>,
) -> usize {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut busy = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let passes = event_loop.run_pending();
                if passes > 0 {
                    debug!("delivered notifications in {passes} pass(es)");
                    busy += 1;
                }
            }
        }
    }
    busy
}

#[cfg(test)]
mod tests {
    use super::*;
    use dacfg_core::{notify_fn, TypedValue};
    use std::sync::{Arc, Mutex};

    const SCHEMA: &str = r#"
[misc.string]
type = "string"
default = "Foo bar"
"#;

    #[test]
    fn test_subscribe_rolls_back_on_unknown_key() {
        // Arrange
        let ev = EventLoop::new();
        let client = Client::builder_from_str(SCHEMA)
            .event_loop(ev.handle())
            .build()
            .unwrap();
        let sink = notify_fn(|_, _, _| {});
        let keys = vec![KeyPath::new("misc", "string"), KeyPath::new("misc", "nope")];

        // Act
        let result = subscribe(&client, &keys, &sink);

        // Assert
        assert!(result.is_err());
        assert!(!client.notify_remove("misc", "string", &sink).unwrap());
    }

    #[tokio::test]
    async fn test_drive_delivers_pending_changes_until_shutdown() {
        // Arrange
        let ev = EventLoop::new();
        let client = Client::builder_from_str(SCHEMA)
            .event_loop(ev.handle())
            .build()
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = notify_fn(move |_, _, value| sink.lock().unwrap().push(value.clone()));
        subscribe(&client, &[KeyPath::new("misc", "string")], &callback).unwrap();
        client.set_string("misc", "string", "changed").unwrap();

        // Act
        let busy = drive(
            &ev,
            Duration::from_millis(10),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await;

        // Assert
        assert_eq!(busy, 1);
        assert_eq!(*seen.lock().unwrap(), vec![TypedValue::from("changed")]);
    }
}
