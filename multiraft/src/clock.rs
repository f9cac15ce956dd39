//! A virtualizable clock for election deadlines.

use futures::future::BoxFuture;
use tokio::time::Instant;

/// The source of time used by the engine for election deadlines.
///
/// The engine only ever observes time through this trait, so tests may
/// substitute a virtual implementation for deterministic scheduling. The
/// default is [`WallClock`].
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Instant;

    /// A future which resolves once `deadline` has been reached.
    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()>;
}

/// A `Clock` backed by the tokio runtime's clock.
///
/// Under `tokio::time::pause()` this is already virtual, which covers most
/// deterministic-testing needs without a custom implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep_until(deadline))
    }
}
