use std::fmt::Debug;
use std::time::Duration;

use futures::{Stream, StreamExt};
use keel_core::{Snapshot, StateStream};

/// How long helpers wait by default before giving up.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

/// Next item, or `None` if the stream ends or nothing arrives within `wait`.
pub async fn next_within<St>(stream: &mut St, wait: Duration) -> Option<St::Item>
where
    St: Stream + Unpin,
{
    tokio::time::timeout(wait, stream.next()).await.ok().flatten()
}

/// Up to `n` items, each waited for at most `wait`.
pub async fn take_within<St>(stream: &mut St, n: usize, wait: Duration) -> Vec<St::Item>
where
    St: Stream + Unpin,
{
    let mut items = Vec::with_capacity(n);
    while items.len() < n {
        match next_within(stream, wait).await {
            Some(item) => items.push(item),
            None => break,
        }
    }
    items
}

/// Panic if the stream yields anything within `wait`.
pub async fn assert_quiet<St>(stream: &mut St, wait: Duration)
where
    St: Stream + Unpin,
    St::Item: Debug,
{
    if let Ok(Some(item)) = tokio::time::timeout(wait, stream.next()).await {
        panic!("expected no item within {wait:?}, got {item:?}");
    }
}

/// Skip snapshots until `version` is committed.
///
/// Panics if it does not show up within [`DEFAULT_WAIT`].
pub async fn wait_for_version<S>(states: &mut StateStream<S>, version: u64) -> Snapshot<S> {
    loop {
        match next_within(states, DEFAULT_WAIT).await {
            Some(snapshot) if snapshot.version >= version => return snapshot,
            Some(_) => continue,
            None => panic!("state version {version} not observed within {DEFAULT_WAIT:?}"),
        }
    }
}
