//! The cache engine: shared state, the reader facade and the control surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::{Condvar, Mutex};

use crate::config::{CacheConfig, ConfigError};
use crate::fetcher::{self, FetcherHandle};
use crate::pages::{PagePool, PageWindow};
use crate::source::{DataSource, SourceError, SourceFlags};

/// Reconnect attempts per failure before the cache gives up.
pub(crate) const MAX_RETRIES: u32 = 10;

/// Slack kept behind the reader when reclaiming window space, so small
/// backward seeks are served from memory instead of thrashing the window.
pub(crate) const GRAY_AREA_BYTES: u64 = 1024 * 1024;

/// How far before a seek target the window is positioned. With several
/// demuxed streams one stream triggers the seek and a sibling soon reads
/// "nearby" behind it; the padding keeps that read from seeking again.
pub(crate) const SEEK_PADDING_BYTES: u64 = 256 * 1024;

/// Outcome of upstream fetching, as the cache tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchStatus {
    Ok,
    EndOfStream,
    Failed(SourceError),
    /// The connection was dropped on purpose (high-water disconnect or
    /// suspend) and will be re-established on the next fetch pass. Suspend
    /// and the high-water disconnect share this value; the next pass
    /// resolves both the same way.
    Reconnect,
}

impl FetchStatus {
    pub(crate) fn is_ok(self) -> bool {
        matches!(self, FetchStatus::Ok)
    }
}

/// Stream health as reported to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Data is flowing, or a failure is still being retried.
    Ok,
    /// The upstream stream ended; only buffered bytes remain.
    EndOfStream,
    /// The upstream failed for good.
    Failed(SourceError),
}

/// Construction-time settings for [`CachedSource`].
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub config: CacheConfig,
    /// Drop the upstream connection whenever the window reaches the high
    /// watermark. Only honored for HTTP-based sources without a proxy.
    pub disconnect_at_high_water: bool,
    /// True if an HTTP proxy sits in front of the source. A proxy keeps its
    /// own cache, so the high-water disconnect is left to the proxy.
    pub is_proxy_configured: bool,
}

/// Everything mutable in the cache, behind one short-held mutex.
///
/// The invariants span several of these fields (window extent vs. offsets,
/// status vs. retry budget), so they live together rather than as
/// per-field atomics.
pub(crate) struct CacheState {
    pub(crate) pool: PagePool,
    pub(crate) window: PageWindow,
    /// Upstream offset of the first byte in the window.
    pub(crate) base_offset: u64,
    /// Upstream offset just past the last byte the consumer read.
    ///
    /// The reader's fast path bumps this while the fetcher makes watermark
    /// decisions on its own schedule, so a watermark check can observe a
    /// value that is one read stale. Watermarking is approximate on
    /// purpose; do not tighten this.
    pub(crate) last_access_pos: u64,
    pub(crate) final_status: FetchStatus,
    /// Reconnect attempts left. Reset to [`MAX_RETRIES`] by any successful
    /// fetch and by a window seek.
    pub(crate) retries_left: u32,
    /// True while the fetcher actively prefetches (below high water).
    pub(crate) fetching: bool,
    /// Teardown flag. Once set, every read resolves as end of stream and
    /// the fetch loop winds down.
    pub(crate) disconnecting: bool,
    /// Soft pause: the upstream is dropped and fetching stops, but the
    /// window survives for a later resume.
    pub(crate) suspended: bool,
    pub(crate) disconnect_at_high_water: bool,
    pub(crate) is_proxy_configured: bool,
    /// Set to ask the next reconnect to re-query the proxy configuration.
    pub(crate) query_proxy: bool,
    /// When the upstream was last read, for keep-alive scheduling.
    pub(crate) last_fetch_time: Option<Instant>,
    /// Slot the fetcher fills when it completes a deferred read; the bytes
    /// are staged here and the waiting reader copies them out.
    pub(crate) pending_result: Option<Result<Vec<u8>, SourceError>>,
    pub(crate) config: CacheConfig,
}

impl CacheState {
    fn new(options: CacheOptions) -> CacheState {
        let mut config = options.config;
        if options.disconnect_at_high_water && !options.is_proxy_configured {
            // Makes no sense to disconnect and keep the connection warm.
            config.keep_alive_interval = Duration::ZERO;
        }

        CacheState {
            pool: PagePool::default(),
            window: PageWindow::default(),
            base_offset: 0,
            last_access_pos: 0,
            final_status: FetchStatus::Ok,
            retries_left: MAX_RETRIES,
            fetching: true,
            disconnecting: false,
            suspended: false,
            disconnect_at_high_water: options.disconnect_at_high_water,
            is_proxy_configured: options.is_proxy_configured,
            query_proxy: false,
            last_fetch_time: None,
            pending_result: None,
            config,
        }
    }

    /// Upstream offset the next fetch reads at (one past the window).
    pub(crate) fn fetch_pos(&self) -> u64 {
        self.base_offset + self.window.total_size() as u64
    }

    /// Turns prefetching back on if it is worth it, reclaiming window space
    /// behind the reader first.
    ///
    /// Does nothing while fetching is already on or the cache has
    /// permanently failed. Without `ignore_low_water`/`force`, also does
    /// nothing while at least the low watermark is buffered ahead of the
    /// reader. Reclaiming keeps a [`GRAY_AREA_BYTES`] rear guard (and is
    /// skipped entirely when less than that lies behind the reader), unless
    /// `force` reclaims everything behind the reader.
    pub(crate) fn maybe_restart_prefetcher(&mut self, ignore_low_water: bool, force: bool) {
        if self.fetching || (!self.final_status.is_ok() && self.retries_left == 0) {
            return;
        }

        let ahead = self.fetch_pos().saturating_sub(self.last_access_pos);
        if !ignore_low_water && !force && ahead >= self.config.low_water_bytes as u64 {
            return;
        }

        let mut reclaim = self.last_access_pos.saturating_sub(self.base_offset);
        if !force {
            if reclaim < GRAY_AREA_BYTES {
                return;
            }
            reclaim -= GRAY_AREA_BYTES;
        }

        let released = self
            .window
            .release_from_start(reclaim as usize, &mut self.pool);
        self.base_offset += released as u64;

        info!(
            "restarting prefetcher, window holds {} bytes",
            self.window.total_size()
        );
        self.fetching = true;
    }

    /// Repositions the window at `offset`. A target already inside the
    /// window (or exactly at its end) leaves it in place; otherwise the
    /// whole window is released, the retry budget refilled and fetching
    /// turned back on.
    pub(crate) fn seek(&mut self, offset: u64) {
        self.last_access_pos = offset;

        if offset >= self.base_offset && offset <= self.fetch_pos() {
            return;
        }

        info!("window seeks to offset {offset}");

        self.base_offset = offset;
        let total = self.window.total_size();
        let released = self.window.release_from_start(total, &mut self.pool);
        debug_assert_eq!(released, total);

        self.retries_left = MAX_RETRIES;
        self.fetching = true;
    }
}

/// State shared between the reader facade and the fetcher thread.
pub(crate) struct Shared {
    pub(crate) state: Mutex<CacheState>,
    /// Signaled when a deferred read completes and on disconnect.
    pub(crate) cond: Condvar,
    pub(crate) source: Arc<dyn DataSource>,
}

/// Read-ahead cache over a [`DataSource`].
///
/// One instance serves one upstream source and one logical reader. A
/// background fetcher pulls pages ahead of the reader's position into a
/// bounded window; [`CachedSource::read_at`] serves from the window when it
/// can and otherwise defers to the fetcher, blocking until the bytes arrive
/// or the cache is torn down.
pub struct CachedSource {
    shared: Arc<Shared>,
    fetcher: FetcherHandle,
    /// Serializes concurrent readers; the cache supports only one.
    serializer: Mutex<()>,
}

impl CachedSource {
    pub fn new(source: Arc<dyn DataSource>) -> CachedSource {
        Self::with_options(source, CacheOptions::default())
    }

    pub fn with_options(source: Arc<dyn DataSource>, options: CacheOptions) -> CachedSource {
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState::new(options)),
            cond: Condvar::new(),
            source,
        });

        CachedSource {
            fetcher: fetcher::spawn(shared.clone()),
            shared,
            serializer: Mutex::new(()),
        }
    }

    /// Reads `buf.len()` bytes at the absolute stream position `offset`.
    ///
    /// Returns the number of bytes read; `Ok(0)` means end of stream (or a
    /// disconnected cache). A request not yet covered by the window blocks
    /// until the fetcher satisfies it. Requests larger than the high
    /// watermark can never be satisfied and panic.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        let _reader = self.serializer.lock();

        let mut state = self.shared.state.lock();
        if state.disconnecting {
            return Ok(0);
        }

        // Serve straight from the window if it covers the request.
        let end = state.base_offset + state.window.total_size() as u64;
        if offset >= state.base_offset && offset + buf.len() as u64 <= end {
            let delta = (offset - state.base_offset) as usize;
            state.window.copy(delta, buf);
            state.last_access_pos = offset + buf.len() as u64;
            return Ok(buf.len());
        }

        assert!(
            buf.len() <= state.config.high_water_bytes,
            "a read of {} bytes cannot fit a window of {}",
            buf.len(),
            state.config.high_water_bytes
        );

        debug_assert!(state.pending_result.is_none());
        if !self.fetcher.post_read(offset, buf.len()) {
            return Ok(0);
        }

        while state.pending_result.is_none() && !state.disconnecting {
            self.shared.cond.wait(&mut state);
        }

        if state.disconnecting {
            state.pending_result = None;
            return Ok(0);
        }

        let result = state
            .pending_result
            .take()
            .expect("deferred read resolved without a result");

        match result {
            Ok(data) => {
                buf[..data.len()].copy_from_slice(&data);
                if !data.is_empty() {
                    state.last_access_pos = offset + data.len() as u64;
                }
                Ok(data.len())
            }
            Err(e) => Err(e),
        }
    }

    /// Tears the cache down. Any blocked and all future reads return end of
    /// stream promptly; the upstream is told to drop its connection so a
    /// pending upstream read unblocks too.
    pub fn disconnect(&self) {
        {
            let mut state = self.shared.state.lock();
            state.disconnecting = true;
            self.shared.cond.notify_all();
        }
        self.shared.source.disconnect();
    }

    /// Pauses the cache: the fetcher stops and the upstream connection is
    /// dropped, but the window is kept for [`CachedSource::resume`].
    pub fn suspend(&self) {
        let mut state = self.shared.state.lock();
        state.final_status = FetchStatus::Reconnect;
        state.suspended = true;
    }

    /// Undoes [`CachedSource::suspend`] and kicks the fetcher back to life.
    pub fn resume(&self) {
        {
            let mut state = self.shared.state.lock();
            state.suspended = false;
        }
        self.fetcher.post_tick();
    }

    /// Upper bound of the cached stream position.
    pub fn cached_size(&self) -> u64 {
        let state = self.shared.state.lock();
        state.fetch_pos()
    }

    /// Bytes buffered ahead of the reader, and the stream health.
    ///
    /// While reconnect attempts remain the status reads [`StreamStatus::Ok`]
    /// even though the last fetch failed: the consumer is told everything is
    /// fine until the cache truly gives up.
    pub fn approx_data_remaining(&self) -> (u64, StreamStatus) {
        let state = self.shared.state.lock();

        let status = if state.retries_left > 0 {
            StreamStatus::Ok
        } else {
            match state.final_status {
                FetchStatus::Ok | FetchStatus::Reconnect => StreamStatus::Ok,
                FetchStatus::EndOfStream => StreamStatus::EndOfStream,
                FetchStatus::Failed(e) => StreamStatus::Failed(e),
            }
        };

        let remaining = state.fetch_pos().saturating_sub(state.last_access_pos);
        (remaining, status)
    }

    /// Applies a `"lowKB/highKB/keepAliveSecs"` parameter string at runtime.
    pub fn update_cache_params(&self, params: &str) -> Result<(), ConfigError> {
        let mut state = self.shared.state.lock();
        state.config.update_from_str(params)
    }

    /// Restarts prefetching even when the low watermark says there is no
    /// hurry, e.g. after the consumer drained a rebuffering pause.
    pub fn resume_fetching_if_necessary(&self) {
        let mut state = self.shared.state.lock();
        state.maybe_restart_prefetcher(true, false);
    }

    /// Capability bits of the cache, derived from the upstream's. The
    /// HTTP and wants-prefetching bits are masked out since this layer
    /// replaces that behavior, and the caching bit is added.
    pub fn flags(&self) -> SourceFlags {
        self.shared
            .source
            .flags()
            .without(SourceFlags::HTTP_BASED | SourceFlags::WANTS_PREFETCHING)
            | SourceFlags::CACHING
    }

    /// Total stream length, when the upstream knows it.
    pub fn size(&self) -> Option<u64> {
        self.shared.source.size()
    }
}

impl Drop for CachedSource {
    fn drop(&mut self) {
        self.disconnect();
        self.fetcher.stop();
    }
}
