//! The sequenced event fan-out.
//!
//! One background collector task reads events from durable storage in seq
//! order, renders them as frames, appends them to a bounded in-memory
//! rollback ring, and pushes them onto every live subscriber's queue.
//! Subscribers with an old cursor are backfilled from durable storage first,
//! handed off to the rollback ring the moment their position enters it, and
//! then fed live.
//!
//! The subscriber set and rollback ring share a single mutex; the collector
//! reads storage outside the lock and only takes it to append and fan out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use weft_repo::{RepoStorage, SUBSCRIBE_REPOS_NSID};

use crate::config::FirehoseConfig;
use crate::error::Result;
use crate::event::{Frame, process_event};

/// Handle to the firehose: collector control plus the subscribe entry point.
///
/// Cheap to clone; all clones share the same collector, rollback ring, and
/// subscriber set.
#[derive(Debug, Clone)]
pub struct Firehose<S: RepoStorage> {
    inner: Arc<FirehoseInner<S>>,
}

#[derive(Debug)]
struct FirehoseInner<S> {
    storage: Arc<S>,
    config: FirehoseConfig,
    state: Mutex<SharedState>,
    new_events: Notify,
    started: watch::Sender<bool>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
struct SharedState {
    rollback: VecDeque<Arc<Frame>>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<Arc<Frame>>)>,
    next_subscriber_id: u64,
}

fn register(state: &mut SharedState) -> (u64, mpsc::UnboundedReceiver<Arc<Frame>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = state.next_subscriber_id;
    state.next_subscriber_id += 1;
    state.subscribers.push((id, tx));
    (id, rx)
}

/// Rollback frames with `seq >= from_seq`, oldest first
fn frames_from(state: &SharedState, from_seq: i64) -> VecDeque<Arc<Frame>> {
    state
        .rollback
        .iter()
        .filter(|f| f.seq().is_some_and(|s| s >= from_seq))
        .cloned()
        .collect()
}

/// Merge manually loaded pre-rollback frames backwards into the ring's spare
/// capacity, so future subscribers with similar cursors can be served from
/// memory.
fn merge_pre_rollback(state: &mut SharedState, pre_rollback: &[Arc<Frame>], window: usize) {
    let spare = window.saturating_sub(state.rollback.len());
    if spare == 0 || pre_rollback.is_empty() {
        return;
    }

    let take = pre_rollback.len().min(spare);
    let slice = &pre_rollback[pre_rollback.len() - take..];

    let front_seq = state.rollback.front().and_then(|f| f.seq());
    let last_merged_seq = slice.last().and_then(|f| f.seq());
    match (last_merged_seq, front_seq) {
        (Some(last), Some(front)) if last < front => {}
        (_, None) => {}
        _ => {
            debug!("pre-rollback frames overlap the ring; skipping merge");
            return;
        }
    }

    info!(count = take, "merging pre-rollback events into rollback window");
    for frame in slice.iter().rev() {
        state.rollback.push_front(frame.clone());
    }
}

impl<S: RepoStorage + Send + Sync + 'static> Firehose<S> {
    /// Create a firehose over the given storage
    pub fn new(storage: Arc<S>, config: FirehoseConfig) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            inner: Arc::new(FirehoseInner {
                storage,
                config,
                state: Mutex::new(SharedState::default()),
                new_events: Notify::new(),
                started,
                collector: Mutex::new(None),
            }),
        }
    }

    /// Signal that new events are available in storage
    ///
    /// Called after every `apply_commit` / lifecycle event write.
    pub fn notify(&self) {
        self.inner.new_events.notify_one();
    }

    /// Start the collector (idempotent) and wait for it to finish preloading
    pub async fn start(&self) {
        self.start_with_limit(None).await
    }

    /// Start the collector; with a limit it exits after processing that many
    /// new (post-preload) events. The limit is only used in tests.
    pub async fn start_with_limit(&self, limit: Option<usize>) {
        {
            let mut collector = self.inner.collector.lock().unwrap();
            if collector.is_none() {
                info!(?limit, "starting firehose collector");
                *collector = Some(tokio::spawn(collect(self.inner.clone(), limit)));
            }
        }

        let mut started = self.inner.started.subscribe();
        let _ = started.wait_for(|s| *s).await;
    }

    /// Subscribe to the event stream.
    ///
    /// With no cursor, delivery starts with the next live event. A cursor
    /// within the rollback window replays from memory; one behind it is
    /// backfilled from durable storage (preceded by an `#info
    /// OutdatedCursor` frame) and handed off to the window once caught up. A
    /// cursor past the stream head yields a single terminal `FutureCursor`
    /// error frame.
    pub async fn subscribe(&self, cursor: Option<i64>) -> Result<Subscription<S>> {
        // Block until the collector has preloaded the rollback window
        let mut started = self.inner.started.subscribe();
        let _ = started.wait_for(|s| *s).await;

        debug!(?cursor, "subscriber starting");

        if let Some(cursor) = cursor {
            let last_seq = self.inner.storage.last_seq(SUBSCRIBE_REPOS_NSID).await?;
            if cursor > last_seq {
                info!(cursor, last_seq, "future cursor");
                let frame = Frame::error(
                    "FutureCursor",
                    format!("Cursor {cursor} is past our current sequence number {last_seq}"),
                );
                return Ok(Subscription {
                    inner: self.inner.clone(),
                    id: None,
                    state: SubState::Terminal(Some(Arc::new(frame))),
                });
            }
        }

        let (state, id) = {
            let mut st = self.inner.state.lock().unwrap();
            match cursor {
                None => {
                    debug!("streaming live events only");
                    let (id, rx) = register(&mut st);
                    (SubState::Live { rx }, Some(id))
                }
                Some(cursor) => {
                    let rollback_start = st.rollback.front().and_then(|f| f.seq());
                    match rollback_start {
                        Some(start) if cursor < start => {
                            info!(
                                cursor,
                                rollback_start = start,
                                "cursor behind rollback window; backfilling from storage"
                            );
                            let state = SubState::Manual {
                                preamble: Some(Arc::new(Frame::info("OutdatedCursor"))),
                                next_seq: cursor.max(0),
                                pending: VecDeque::new(),
                                pre_rollback: Vec::new(),
                            };
                            (state, None)
                        }
                        _ => {
                            debug!(cursor, "replaying from rollback window");
                            let frames = frames_from(&st, cursor);
                            let (id, rx) = register(&mut st);
                            (SubState::Replay { frames, rx }, Some(id))
                        }
                    }
                }
            }
        };

        Ok(Subscription {
            inner: self.inner.clone(),
            id,
            state,
        })
    }
}

/// Collector task: preload the rollback window, signal `started`, then pump
/// new events to the ring and every subscriber queue.
async fn collect<S: RepoStorage + Send + Sync + 'static>(
    inner: Arc<FirehoseInner<S>>,
    limit: Option<usize>,
) {
    let config = &inner.config;

    info!(
        preload = config.preload_window,
        "collector preloading rollback window"
    );
    let mut cur_seq = match inner.storage.last_seq(SUBSCRIBE_REPOS_NSID).await {
        Ok(seq) => seq,
        Err(e) => {
            warn!(error = %e, "collector failed to read last seq");
            0
        }
    };

    let preload_start = (cur_seq - config.preload_window as i64 + 1).max(0);
    let mut preloaded = VecDeque::new();
    match inner.storage.read_events_by_seq(preload_start).await {
        Ok(events) => {
            for event in events {
                match process_event(&inner.storage, &event).await {
                    Ok(frame) => preloaded.push_back(Arc::new(frame)),
                    Err(e) => warn!(seq = event.seq(), error = %e, "skipping malformed event"),
                }
            }
        }
        Err(e) => warn!(error = %e, "collector failed to preload events"),
    }
    while preloaded.len() > config.rollback_window {
        preloaded.pop_front();
    }

    {
        let mut state = inner.state.lock().unwrap();
        if let (Some(first), Some(last)) = (
            preloaded.front().and_then(|f| f.seq()),
            preloaded.back().and_then(|f| f.seq()),
        ) {
            info!(first, last, "preloaded rollback window");
            cur_seq = last;
        }
        state.rollback = preloaded;
    }

    inner.started.send_replace(true);

    info!("collecting new events");
    let timeout = config.new_events_timeout;
    let mut last_event = Instant::now();
    let mut seen = 0usize;

    loop {
        if limit.is_some_and(|limit| seen >= limit) {
            return;
        }

        let _ = tokio::time::timeout(timeout, inner.new_events.notified()).await;

        let events = match inner.storage.read_events_by_seq(cur_seq + 1).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "collector failed to read events");
                continue;
            }
        };

        for event in events {
            if limit.is_some_and(|limit| seen >= limit) {
                return;
            }

            let last_seq = cur_seq;
            let seq = event.seq();

            // Gap policy: wait for a skipped seq up to NEW_EVENTS_TIMEOUT,
            // unless the gap is already far behind the stream head (an
            // aborted commit that will never materialise).
            if seq > last_seq + 1 {
                let waited_enough = last_event.elapsed() >= timeout;
                let head = inner
                    .storage
                    .last_seq(SUBSCRIBE_REPOS_NSID)
                    .await
                    .unwrap_or(seq);
                let gap_is_old = head - (last_seq + 1) > config.wait_for_skipped_seq_window;

                if !waited_enough && !gap_is_old {
                    info!(seq = last_seq + 1, "waiting for skipped seq");
                    break;
                }
                warn!(from = last_seq + 1, to = seq - 1, "gave up waiting for skipped seqs");
            }

            cur_seq = seq;
            last_event = Instant::now();

            let frame = match process_event(&inner.storage, &event).await {
                Ok(frame) => Arc::new(frame),
                Err(e) => {
                    warn!(seq, error = %e, "skipping malformed event");
                    continue;
                }
            };

            {
                let mut state = inner.state.lock().unwrap();
                debug!(seq, subscribers = state.subscribers.len(), "emitting event");
                if state.rollback.len() == config.rollback_window {
                    state.rollback.pop_front();
                }
                state.rollback.push_back(frame.clone());
                // Sends are non-blocking; a closed queue means the subscriber
                // is gone and gets dropped from the set.
                state
                    .subscribers
                    .retain(|(_, tx)| tx.send(frame.clone()).is_ok());
            }

            seen += 1;
        }

        if !config.subscribe_repos_batch_delay.is_zero() {
            tokio::time::sleep(config.subscribe_repos_batch_delay).await;
        }
    }
}

enum SubState {
    /// Yield one terminal frame (FutureCursor), then end
    Terminal(Option<Arc<Frame>>),
    /// Backfilling from durable storage, below the rollback window
    Manual {
        preamble: Option<Arc<Frame>>,
        next_seq: i64,
        pending: VecDeque<Arc<Frame>>,
        pre_rollback: Vec<Arc<Frame>>,
    },
    /// Delivering a handoff snapshot of the rollback window
    Replay {
        frames: VecDeque<Arc<Frame>>,
        rx: mpsc::UnboundedReceiver<Arc<Frame>>,
    },
    /// Live: fed by the collector
    Live {
        rx: mpsc::UnboundedReceiver<Arc<Frame>>,
    },
    /// Stream over
    Done,
}

/// A live subscription to the firehose.
///
/// Pull frames with [`Subscription::next`]; dropping the subscription
/// removes it from the subscriber set.
pub struct Subscription<S: RepoStorage> {
    inner: Arc<FirehoseInner<S>>,
    id: Option<u64>,
    state: SubState,
}

impl<S: RepoStorage + Send + Sync + 'static> Subscription<S> {
    /// Next frame, in strictly ascending seq order; `None` when the stream
    /// ends (terminal error delivered, or the collector went away).
    pub async fn next(&mut self) -> Result<Option<Arc<Frame>>> {
        loop {
            let state = std::mem::replace(&mut self.state, SubState::Done);
            match state {
                SubState::Done => return Ok(None),

                SubState::Terminal(mut frame) => {
                    return Ok(frame.take());
                }

                SubState::Manual {
                    mut preamble,
                    mut next_seq,
                    mut pending,
                    mut pre_rollback,
                } => {
                    if let Some(frame) = preamble.take() {
                        self.state = SubState::Manual {
                            preamble: None,
                            next_seq,
                            pending,
                            pre_rollback,
                        };
                        return Ok(Some(frame));
                    }

                    if let Some(frame) = pending.pop_front() {
                        // The rollback window may have advanced; check it
                        // again, fresh, before every yield.
                        let handoff = {
                            let mut st = self.inner.state.lock().unwrap();
                            let rollback_start = st.rollback.front().and_then(|f| f.seq());
                            match (frame.seq(), rollback_start) {
                                (Some(seq), Some(start)) if seq >= start => {
                                    let frames = frames_from(&st, seq);
                                    merge_pre_rollback(
                                        &mut st,
                                        &pre_rollback,
                                        self.inner.config.rollback_window,
                                    );
                                    let (id, rx) = register(&mut st);
                                    Some((frames, rx, id))
                                }
                                _ => None,
                            }
                        };

                        match handoff {
                            Some((frames, rx, id)) => {
                                debug!(
                                    seq = frame.seq(),
                                    "caught up to rollback window; handing off"
                                );
                                self.id = Some(id);
                                self.state = SubState::Replay { frames, rx };
                                continue;
                            }
                            None => {
                                pre_rollback.push(frame.clone());
                                self.state = SubState::Manual {
                                    preamble,
                                    next_seq,
                                    pending,
                                    pre_rollback,
                                };
                                return Ok(Some(frame));
                            }
                        }
                    }

                    // Nothing buffered: load the next batch from durable
                    // storage.
                    match self.inner.storage.read_events_by_seq(next_seq).await {
                        Err(e) => {
                            self.state = SubState::Manual {
                                preamble,
                                next_seq,
                                pending,
                                pre_rollback,
                            };
                            return Err(e.into());
                        }
                        Ok(events) if events.is_empty() => {
                            // The durable log holds nothing below the window;
                            // hand off to the ring directly.
                            let (frames, rx, id) = {
                                let mut st = self.inner.state.lock().unwrap();
                                let frames = frames_from(&st, next_seq);
                                merge_pre_rollback(
                                    &mut st,
                                    &pre_rollback,
                                    self.inner.config.rollback_window,
                                );
                                let (id, rx) = register(&mut st);
                                (frames, rx, id)
                            };
                            self.id = Some(id);
                            self.state = SubState::Replay { frames, rx };
                            continue;
                        }
                        Ok(events) => {
                            for event in events {
                                let seq = event.seq();
                                match process_event(&self.inner.storage, &event).await {
                                    Ok(frame) => pending.push_back(Arc::new(frame)),
                                    Err(e) => {
                                        warn!(seq, error = %e, "skipping malformed event during backfill");
                                    }
                                }
                                next_seq = next_seq.max(seq + 1);
                            }
                            self.state = SubState::Manual {
                                preamble,
                                next_seq,
                                pending,
                                pre_rollback,
                            };
                            continue;
                        }
                    }
                }

                SubState::Replay { mut frames, rx } => {
                    if let Some(frame) = frames.pop_front() {
                        self.state = SubState::Replay { frames, rx };
                        return Ok(Some(frame));
                    }
                    self.state = SubState::Live { rx };
                    continue;
                }

                SubState::Live { mut rx } => match rx.recv().await {
                    Some(frame) => {
                        self.state = SubState::Live { rx };
                        return Ok(Some(frame));
                    }
                    None => return Ok(None),
                },
            }
        }
    }
}

impl<S: RepoStorage> Drop for Subscription<S> {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            if let Ok(mut state) = self.inner.state.lock() {
                debug!(id, "removing subscriber");
                state.subscribers.retain(|(sid, _)| *sid != id);
            }
        }
    }
}
