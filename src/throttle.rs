//! Token-bucket rate limiter used to throttle ingestion so write bursts
//! cannot outrun downstream compaction capacity.
//!
//! The bucket only advises: `request` either grants immediately or returns
//! the wait needed before the tokens could be granted, without consuming
//! them. Callers that receive a nonzero wait typically `delay` and retry;
//! cancelling a pending delay is the caller's concern.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

const NSEC_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug)]
struct BucketState {
    refill_time_ns: u64,
    balance: u64,
    burst: u64,
    rate: u64,
    /// Upper bound on the elapsed-time term of a refill, chosen so
    /// `dt * rate` cannot overflow after a long idle period.
    dt_max_ns: u64,
}

pub struct TokenBucket {
    state: Mutex<BucketState>,
    origin: Instant,
}

impl TokenBucket {
    /// Creates a bucket that starts full, so new writers are not forced to
    /// wait for an initial fill. `rate` is tokens per second and must be
    /// nonzero: a zero rate can never repay a shortfall, so it is rejected
    /// here rather than left to deadlock a requester.
    pub fn new(burst: u64, rate: u64) -> Result<Self> {
        if rate == 0 {
            return Err(Error::InvalidConfiguration(
                "token bucket rate must be nonzero".into(),
            ));
        }
        Ok(Self {
            state: Mutex::new(BucketState {
                refill_time_ns: 0,
                balance: burst,
                burst,
                rate,
                dt_max_ns: dt_max(rate),
            }),
            origin: Instant::now(),
        })
    }

    /// Updates capacity and rate without zeroing the balance. A shrink
    /// clamps the balance down to the new burst.
    pub fn reinit(&self, burst: u64, rate: u64) -> Result<()> {
        self.reinit_at(burst, rate, self.now_ns())
    }

    pub fn reinit_at(&self, burst: u64, rate: u64, now_ns: u64) -> Result<()> {
        if rate == 0 {
            return Err(Error::InvalidConfiguration(
                "token bucket rate must be nonzero".into(),
            ));
        }
        let mut state = self.state.lock();
        state.burst = burst;
        state.rate = rate;
        state.dt_max_ns = dt_max(rate);
        state.balance = state.balance.min(burst);
        state.refill_time_ns = now_ns;
        Ok(())
    }

    /// Requests `tokens`. Returns `Duration::ZERO` if granted (tokens
    /// subtracted), else the wait needed for the balance to reach `tokens`
    /// at the configured rate; the tokens are not subtracted in that case.
    pub fn request(&self, tokens: u64) -> Duration {
        self.request_at(tokens, self.now_ns())
    }

    /// `request` with the clock injected; refill and subtract execute as
    /// one critical section so concurrent requesters cannot both observe a
    /// stale balance and over-grant.
    pub fn request_at(&self, tokens: u64, now_ns: u64) -> Duration {
        let mut state = self.state.lock();

        let dt = now_ns
            .saturating_sub(state.refill_time_ns)
            .min(state.dt_max_ns);
        let refill = dt * state.rate / NSEC_PER_SEC;
        state.balance = state.balance.saturating_add(refill).min(state.burst);

        // Advance the refill time only past the interval actually converted
        // to whole tokens; the remainder keeps accruing, so a slow-rate
        // bucket polled frequently is not starved by rounding. Monotonic:
        // `request` reads the clock before taking the lock, and a stale
        // reading that wins the lock late must not rewind the refill time
        // and re-credit an interval already converted.
        let converted_ns = refill.saturating_mul(NSEC_PER_SEC) / state.rate;
        state.refill_time_ns = state.refill_time_ns.max(now_ns - (dt - converted_ns));

        if state.balance >= tokens {
            state.balance -= tokens;
            return Duration::ZERO;
        }

        // Ceiling division so a caller that sleeps the full hint never
        // comes back a hair early.
        let deficit = tokens - state.balance;
        let wait_ns = deficit.saturating_mul(NSEC_PER_SEC).div_ceil(state.rate);
        Duration::from_nanos(wait_ns)
    }

    /// Current balance, after no refill. Diagnostic only.
    pub fn balance(&self) -> u64 {
        self.state.lock().balance
    }

    /// Blocks the calling thread for at least `wait`. Held locks must be
    /// released before calling; the bucket itself never sleeps under its
    /// lock.
    pub fn delay(wait: Duration) {
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }

    fn now_ns(&self) -> u64 {
        // Saturates after ~584 years of uptime.
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

fn dt_max(rate: u64) -> u64 {
    u64::MAX / rate
}
