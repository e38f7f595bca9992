//! Token bucket rate limiter
//!
//! A [`Limiter`] controls how frequently events are allowed to happen. The
//! bucket holds up to `burst` tokens and is refilled at `limit` tokens per
//! second. Refill is lazy: the token count is advanced from the elapsed time
//! whenever the limiter is consulted, there is no background timer.
//!
//! Three ways of consuming tokens are offered:
//! - [`Limiter::allow_n`] grants or denies immediately,
//! - [`Limiter::reserve_n`] always books the tokens and reports how long the
//!   caller has to wait before acting,
//! - [`Limiter::wait_n`] suspends until the tokens are available.
//!
//! All methods taking a `now` argument are deterministic and are what the
//! tests use; the argument-less variants read the tokio clock.

use crate::error::LimiterError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Maximum frequency of events, in events per second
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Limit(f64);

impl Limit {
    /// No limit at all; every request is granted and burst is ignored
    pub const INF: Limit = Limit(f64::INFINITY);

    pub fn per_second(events: f64) -> Self {
        Limit(events.max(0.0))
    }

    /// One event every `interval`. A zero interval means no limit.
    pub fn every(interval: Duration) -> Self {
        if interval.is_zero() {
            return Self::INF;
        }
        Limit(1.0 / interval.as_secs_f64())
    }

    pub fn is_inf(&self) -> bool {
        self.0.is_infinite()
    }

    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Time needed to accumulate `tokens` at this rate
    pub fn duration_from_tokens(&self, tokens: f64) -> Duration {
        if tokens <= 0.0 || self.is_inf() {
            return Duration::ZERO;
        }
        if self.0 <= 0.0 {
            return Duration::MAX;
        }
        let nanos = (tokens / self.0 * 1e9).round();
        if nanos >= u64::MAX as f64 {
            return Duration::MAX;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Number of tokens accumulated over `duration` at this rate
    pub fn tokens_from_duration(&self, duration: Duration) -> f64 {
        if self.0 <= 0.0 {
            return 0.0;
        }
        duration.as_secs_f64() * self.0
    }
}

#[derive(Debug)]
struct LimiterState {
    limit: Limit,
    burst: u32,
    tokens: f64,
    /// Last time `tokens` was brought up to date
    last: Instant,
    /// Latest time a granted reservation becomes actionable
    last_event: Instant,
}

impl LimiterState {
    /// Token count the bucket would hold at `now`, and the instant the
    /// accounting is based on. Does not mutate the state.
    fn advance(&self, now: Instant) -> (Instant, f64) {
        let last = if now < self.last { now } else { self.last };

        let max_elapsed = self
            .limit
            .duration_from_tokens(f64::from(self.burst) - self.tokens);
        let elapsed = now.saturating_duration_since(last).min(max_elapsed);

        let tokens = (self.tokens + self.limit.tokens_from_duration(elapsed)).min(f64::from(self.burst));
        (now, tokens)
    }
}

/// A token bucket shared between tasks
///
/// Cloning a `Limiter` yields another handle onto the same bucket.
#[derive(Debug, Clone)]
pub struct Limiter {
    state: Arc<Mutex<LimiterState>>,
}

/// Result of a token request, see [`Limiter::reserve_n`]
#[derive(Debug)]
pub struct Reservation {
    ok: bool,
    tokens: u32,
    time_to_act: Instant,
    /// Limit at reservation time, used when the reservation is cancelled
    limit: Limit,
    state: Arc<Mutex<LimiterState>>,
}

impl Limiter {
    /// Create a limiter with a full bucket
    pub fn new(limit: Limit, burst: u32) -> Self {
        Self::new_at(Instant::now(), limit, burst)
    }

    /// Create a limiter with a full bucket whose accounting starts at `now`
    pub fn new_at(now: Instant, limit: Limit, burst: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                limit,
                burst,
                tokens: f64::from(burst),
                last: now,
                last_event: now,
            })),
        }
    }

    pub fn limit(&self) -> Limit {
        self.state.lock().limit
    }

    pub fn burst(&self) -> u32 {
        self.state.lock().burst
    }

    /// Number of tokens the bucket holds at `now`
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let state = self.state.lock();
        state.advance(now).1
    }

    /// Change the refill rate. Tokens accumulated so far are kept.
    pub fn set_limit_at(&self, now: Instant, limit: Limit) {
        let mut state = self.state.lock();
        let (now, tokens) = state.advance(now);
        state.last = now;
        state.tokens = tokens;
        state.limit = limit;
    }

    /// Change the bucket size. Tokens above the new burst are discarded.
    pub fn set_burst_at(&self, now: Instant, burst: u32) {
        let mut state = self.state.lock();
        let (now, tokens) = state.advance(now);
        state.last = now;
        state.burst = burst;
        state.tokens = tokens.min(f64::from(burst));
    }

    /// Shorthand for `allow_n(Instant::now(), 1)`
    pub fn allow(&self) -> bool {
        self.allow_n(Instant::now(), 1)
    }

    /// Report whether `n` events may happen at `now`, consuming the tokens if so
    pub fn allow_n(&self, now: Instant, n: u32) -> bool {
        self.reserve_inner(now, n, Duration::ZERO).ok
    }

    /// Shorthand for `reserve_n(Instant::now(), 1)`
    pub fn reserve(&self) -> Reservation {
        self.reserve_n(Instant::now(), 1)
    }

    /// Book `n` tokens, however long the caller has to wait for them.
    ///
    /// The reservation is only `!ok` when `n` exceeds the burst.
    pub fn reserve_n(&self, now: Instant, n: u32) -> Reservation {
        self.reserve_inner(now, n, Duration::MAX)
    }

    /// Shorthand for `wait_n(cancel, 1)`
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), LimiterError> {
        self.wait_n(cancel, 1).await
    }

    /// Suspend until `n` tokens are available and consume them.
    ///
    /// Fails before sleeping when `n` exceeds the burst of a finite limit.
    /// If `cancel` fires while sleeping the reservation is returned to the
    /// bucket.
    pub async fn wait_n(&self, cancel: &CancellationToken, n: u32) -> Result<(), LimiterError> {
        let (burst, limit) = {
            let state = self.state.lock();
            (state.burst, state.limit)
        };
        if n > burst && !limit.is_inf() {
            return Err(LimiterError::ExceedsBurst {
                requested: n,
                burst,
            });
        }
        if cancel.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }

        let now = Instant::now();
        let max_wait = limit.duration_from_tokens(f64::from(n));
        let reservation = self.reserve_inner(now, n, max_wait);
        if !reservation.ok {
            return Err(LimiterError::WouldExceedWait { max_wait });
        }

        let delay = reservation.delay_from(now);
        if delay.is_zero() {
            return Ok(());
        }
        trace!(delay_ms = delay.as_millis() as u64, tokens = n, "Waiting for rate limiter");

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => {
                reservation.cancel_at(Instant::now());
                Err(LimiterError::Cancelled)
            }
        }
    }

    fn reserve_inner(&self, now: Instant, n: u32, max_future_reserve: Duration) -> Reservation {
        let mut state = self.state.lock();

        if state.limit.is_inf() {
            return Reservation {
                ok: true,
                tokens: n,
                time_to_act: now,
                limit: state.limit,
                state: Arc::clone(&self.state),
            };
        }

        let (now, tokens) = state.advance(now);

        // A zero limit never refills: only what is left of the burst can be handed out
        if state.limit.as_f64() <= 0.0 {
            let ok = tokens >= f64::from(n);
            if ok {
                state.tokens = tokens - f64::from(n);
                state.last = now;
                state.last_event = now;
            }
            return Reservation {
                ok,
                tokens: if ok { n } else { 0 },
                time_to_act: now,
                limit: state.limit,
                state: Arc::clone(&self.state),
            };
        }

        let tokens = tokens - f64::from(n);
        let wait = if tokens < 0.0 {
            state.limit.duration_from_tokens(-tokens)
        } else {
            Duration::ZERO
        };

        let time_to_act = now.checked_add(wait);
        let ok = n <= state.burst && wait <= max_future_reserve && time_to_act.is_some();

        match (ok, time_to_act) {
            (true, Some(time_to_act)) => {
                state.last = now;
                state.tokens = tokens;
                state.last_event = time_to_act;
                Reservation {
                    ok: true,
                    tokens: n,
                    time_to_act,
                    limit: state.limit,
                    state: Arc::clone(&self.state),
                }
            }
            _ => Reservation {
                ok: false,
                tokens: 0,
                time_to_act: now,
                limit: state.limit,
                state: Arc::clone(&self.state),
            },
        }
    }
}

impl Reservation {
    /// Whether the limiter can provide the requested tokens within the
    /// maximum wait the request was made with
    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn time_to_act(&self) -> Instant {
        self.time_to_act
    }

    /// How long the holder must wait before acting, measured from now
    pub fn delay(&self) -> Duration {
        self.delay_from(Instant::now())
    }

    /// How long the holder must wait before acting, measured from `now`.
    /// `Duration::MAX` when the reservation was not granted.
    pub fn delay_from(&self, now: Instant) -> Duration {
        if !self.ok {
            return Duration::MAX;
        }
        self.time_to_act.saturating_duration_since(now)
    }

    /// Give the reserved tokens back, as far as later reservations allow.
    pub fn cancel(&self) {
        self.cancel_at(Instant::now())
    }

    pub fn cancel_at(&self, now: Instant) {
        if !self.ok || self.tokens == 0 || self.limit.is_inf() || self.time_to_act < now {
            return;
        }

        let mut state = self.state.lock();

        // Tokens booked by reservations made after this one cannot be returned
        let later = state.last_event.saturating_duration_since(self.time_to_act);
        let restore = f64::from(self.tokens) - self.limit.tokens_from_duration(later);
        if restore <= 0.0 {
            return;
        }

        let (now, tokens) = state.advance(now);
        state.last = now;
        state.tokens = (tokens + restore).min(f64::from(state.burst));

        if self.time_to_act == state.last_event {
            let previous = self
                .time_to_act
                .checked_sub(self.limit.duration_from_tokens(f64::from(self.tokens)));
            if let Some(previous) = previous {
                if previous >= now {
                    state.last_event = previous;
                }
            }
        }
    }
}
