//! The background fetcher: a single worker thread that pulls pages from the
//! upstream source into the window, retries failures, keeps the connection
//! warm while idle and satisfies deferred reads.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use log::{debug, error, info};

use crate::cache::{FetchStatus, MAX_RETRIES, SEEK_PADDING_BYTES, Shared};
use crate::source::{SourceError, SourceFlags};

/// Pause between reconnect attempts after a failed fetch.
const RETRY_DELAY: Duration = Duration::from_secs(3);
/// Polling period while idle (above high water or out of work).
const IDLE_POLL: Duration = Duration::from_millis(100);
/// Repost period for a deferred read the window cannot cover yet. This
/// bounds the latency between prefetch completion and reader wake-up.
const READ_POLL: Duration = Duration::from_millis(50);

/// Work posted to the fetcher thread.
pub(crate) enum Command {
    /// Run a fetch pass now (construction, resume).
    Tick,
    /// A reader request the window could not serve.
    Read { offset: u64, size: usize },
    Shutdown,
}

/// Owning handle to the fetcher thread.
pub(crate) struct FetcherHandle {
    commands: channel::Sender<Command>,
    thread: Option<thread::JoinHandle<()>>,
}

impl FetcherHandle {
    pub(crate) fn post_tick(&self) {
        let _ = self.commands.send(Command::Tick);
    }

    /// Posts a deferred read. Returns false if the fetcher is gone.
    pub(crate) fn post_read(&self, offset: u64, size: usize) -> bool {
        self.commands.send(Command::Read { offset, size }).is_ok()
    }

    /// Stops the fetcher and waits for the thread to exit.
    pub(crate) fn stop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("fetcher thread panicked");
        }
    }
}

/// Spawns the fetcher thread for `shared`. The first fetch pass runs
/// immediately; the cache starts out prefetching.
pub(crate) fn spawn(shared: Arc<Shared>) -> FetcherHandle {
    let (sender, receiver) = channel::unbounded();
    let fetcher = Fetcher {
        shared,
        commands: receiver,
    };
    let thread = thread::spawn(move || fetcher.run());
    FetcherHandle {
        commands: sender,
        thread: Some(thread),
    }
}

/// A deferred read parked on the repost cycle.
struct DeferredRead {
    offset: u64,
    size: usize,
    due: Instant,
}

/// What a deferred-read attempt produced.
enum ReadOutcome {
    /// The requested bytes (possibly a short read against a dead window).
    Done(Vec<u8>),
    /// End of stream at this offset.
    Eof,
    Failed(SourceError),
    /// The window does not cover the request yet; try again shortly.
    Again,
}

struct Fetcher {
    shared: Arc<Shared>,
    commands: channel::Receiver<Command>,
}

impl Fetcher {
    fn run(self) {
        let mut next_fetch = Some(Instant::now());
        let mut deferred: Option<DeferredRead> = None;

        loop {
            let deadline = match (next_fetch, &deferred) {
                (Some(fetch_at), Some(read)) => Some(fetch_at.min(read.due)),
                (Some(fetch_at), None) => Some(fetch_at),
                (None, Some(read)) => Some(read.due),
                (None, None) => None,
            };

            let command = match deadline {
                Some(deadline) => match self.commands.recv_deadline(deadline) {
                    Ok(command) => Some(command),
                    Err(channel::RecvTimeoutError::Timeout) => None,
                    Err(channel::RecvTimeoutError::Disconnected) => return,
                },
                None => match self.commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => return,
                },
            };

            match command {
                Some(Command::Tick) => next_fetch = Some(Instant::now()),
                Some(Command::Read { offset, size }) => {
                    debug_assert!(deferred.is_none());
                    deferred = Some(DeferredRead {
                        offset,
                        size,
                        due: Instant::now(),
                    });
                }
                Some(Command::Shutdown) => return,
                None => {}
            }

            let due_read = match &deferred {
                Some(read) if read.due <= Instant::now() => Some((read.offset, read.size)),
                _ => None,
            };
            if let Some((offset, size)) = due_read {
                deferred = self.on_read(offset, size);
            }

            if let Some(fetch_at) = next_fetch
                && fetch_at <= Instant::now()
            {
                next_fetch = self.on_fetch();
            }
        }
    }

    /// One fetch pass. Returns when the next pass is due, or `None` once
    /// the cache is suspended (resume posts a fresh tick).
    fn on_fetch(&self) -> Option<Instant> {
        let (run_fetch, keep_alive) = {
            let mut state = self.shared.state.lock();

            if !state.final_status.is_ok() && state.retries_left == 0 {
                debug!("out of retries, prefetching stops");
                state.fetching = false;
            }

            // A proxy restart can be behind a failed read; ask the next
            // reconnect to re-query the proxy configuration.
            if !state.final_status.is_ok() && state.retries_left > 0 && state.is_proxy_configured {
                state.query_proxy = true;
            }

            let keep_alive = !state.fetching
                && state.final_status.is_ok()
                && state.config.keep_alive_interval > Duration::ZERO
                && state
                    .last_fetch_time
                    .is_none_or(|at| at.elapsed() >= state.config.keep_alive_interval);

            (state.fetching, keep_alive)
        };

        if run_fetch || keep_alive {
            if keep_alive {
                info!("keep-alive fetch");
            }

            self.fetch_step();

            let mut state = self.shared.state.lock();
            state.last_fetch_time = Some(Instant::now());

            if state.fetching && state.window.total_size() >= state.config.high_water_bytes {
                info!(
                    "window full at {} bytes, prefetching pauses",
                    state.window.total_size()
                );
                state.fetching = false;

                if state.disconnect_at_high_water
                    && self.shared.source.flags().contains(SourceFlags::HTTP_BASED)
                    && !state.is_proxy_configured
                {
                    debug!("disconnecting at high water");
                    state.final_status = FetchStatus::Reconnect;
                    drop(state);
                    self.shared.source.disconnect();
                }
            }
        } else {
            let mut state = self.shared.state.lock();
            state.maybe_restart_prefetcher(false, false);
        }

        let mut state = self.shared.state.lock();
        if state.suspended {
            state.final_status = FetchStatus::Reconnect;
            drop(state);
            debug!("disconnecting for suspend");
            self.shared.source.disconnect();
            return None;
        }

        let delay = if state.fetching {
            if !state.final_status.is_ok() && state.retries_left > 0 {
                // The last attempt failed; space the retries out.
                RETRY_DELAY
            } else {
                Duration::ZERO
            }
        } else {
            IDLE_POLL
        };
        Some(Instant::now() + delay)
    }

    /// One upstream pull: reconnect when retrying, read one page at the end
    /// of the window, fold the result into the state. The blocking upstream
    /// calls run with no lock held.
    fn fetch_step(&self) {
        let (reconnect, fetch_pos, suspended) = {
            let mut state = self.shared.state.lock();
            debug_assert!(state.final_status.is_ok() || state.retries_left > 0);

            let reconnect = if state.final_status.is_ok() {
                false
            } else {
                state.retries_left -= 1;
                true
            };
            (reconnect, state.fetch_pos(), state.suspended)
        };

        if reconnect && !suspended {
            let mut query_proxy = self.shared.state.lock().query_proxy;
            let result = self.shared.source.reconnect_at(fetch_pos, &mut query_proxy);

            let mut state = self.shared.state.lock();

            // A configured proxy that failed to re-configure on this
            // reconnect falls back to proxy-less behavior: the high-water
            // disconnect takes over and keep-alives stop.
            if state.is_proxy_configured && !query_proxy && state.disconnect_at_high_water {
                state.config.keep_alive_interval = Duration::ZERO;
            }
            state.query_proxy = query_proxy;
            state.is_proxy_configured = query_proxy;

            if state.disconnecting {
                state.retries_left = 0;
                state.final_status = FetchStatus::EndOfStream;
                return;
            }
            match result {
                Err(e) if e.is_permanent() => {
                    // The server will not start supporting range requests on
                    // the next attempt; stop reconnecting.
                    error!("reconnect failed for good: {e}");
                    state.retries_left = 0;
                    return;
                }
                Err(e) => {
                    info!(
                        "reconnect attempt failed ({e}), {} retries remaining",
                        state.retries_left
                    );
                    return;
                }
                Ok(()) => {}
            }
        }

        let mut page = self.shared.state.lock().pool.acquire();

        let result = self.shared.source.read_at(fetch_pos, page.buf_mut());

        let mut state = self.shared.state.lock();
        if state.disconnecting || matches!(result, Ok(0)) {
            info!("caching reached end of stream");
            state.retries_left = 0;
            state.final_status = FetchStatus::EndOfStream;
            state.pool.release(page);
        } else {
            match result {
                Ok(n) => {
                    if !state.final_status.is_ok() {
                        info!("retrying a previously failed read succeeded");
                    }
                    state.retries_left = MAX_RETRIES;
                    state.final_status = FetchStatus::Ok;
                    page.set_used(n);
                    state.window.append_page(page);
                }
                Err(e) => {
                    state.final_status = FetchStatus::Failed(e);
                    if e.is_permanent() {
                        state.retries_left = 0;
                    }
                    error!("source returned {e}, {} retries left", state.retries_left);
                    state.pool.release(page);
                }
            }
        }
    }

    /// Handles one attempt at a deferred read. Returns the read re-armed
    /// for another attempt, or `None` once it has been resolved.
    fn on_read(&self, offset: u64, size: usize) -> Option<DeferredRead> {
        let outcome = self.read_internal(offset, size);

        let mut state = self.shared.state.lock();

        if matches!(outcome, ReadOutcome::Again) && !state.disconnecting {
            // Not servable yet: poll until the window covers the request.
            // A suspended cache stays on this cycle too, so that resuming
            // completes the read.
            return Some(DeferredRead {
                offset,
                size,
                due: Instant::now() + READ_POLL,
            });
        }

        if state.disconnecting {
            self.shared.cond.notify_all();
            return None;
        }

        debug_assert!(state.pending_result.is_none());
        state.pending_result = Some(match outcome {
            ReadOutcome::Done(data) => Ok(data),
            ReadOutcome::Eof => Ok(Vec::new()),
            ReadOutcome::Failed(e) => Err(e),
            ReadOutcome::Again => unreachable!("unresolved reads are re-armed above"),
        });
        self.shared.cond.notify_all();
        None
    }

    /// The slow-path read logic. Repositions the window when the request
    /// falls outside it, serves what it can, and reports
    /// [`ReadOutcome::Again`] while the request is not coverable yet.
    fn read_internal(&self, offset: u64, size: usize) -> ReadOutcome {
        let mut state = self.shared.state.lock();

        if !state.fetching {
            state.last_access_pos = offset;
            state.maybe_restart_prefetcher(false, true);
        }

        let covered_end = state.base_offset + state.window.total_size() as u64;
        if offset < state.base_offset || offset >= covered_end {
            state.seek(offset.saturating_sub(SEEK_PADDING_BYTES));
        }

        let delta = (offset - state.base_offset) as usize;

        if !state.final_status.is_ok() && state.retries_left == 0 {
            // No more data will ever arrive; drain what the window has.
            if delta >= state.window.total_size() {
                return match state.final_status {
                    FetchStatus::EndOfStream => ReadOutcome::Eof,
                    FetchStatus::Failed(e) => ReadOutcome::Failed(e),
                    // The connection was dropped on purpose; a later seek
                    // refills the retry budget and recovers.
                    FetchStatus::Reconnect => ReadOutcome::Again,
                    FetchStatus::Ok => unreachable!(),
                };
            }

            let avail = (state.window.total_size() - delta).min(size);
            let mut data = vec![0u8; avail];
            state.window.copy(delta, &mut data);
            return ReadOutcome::Done(data);
        }

        if offset + size as u64 <= state.base_offset + state.window.total_size() as u64 {
            let mut data = vec![0u8; size];
            state.window.copy(delta, &mut data);
            return ReadOutcome::Done(data);
        }

        debug!("deferring read at offset {offset}");
        ReadOutcome::Again
    }
}
