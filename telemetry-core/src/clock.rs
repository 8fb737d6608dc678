use core::time::Duration;

/// Monotonic time source for the scheduler.
#[allow(async_fn_in_trait)]
pub trait Clock {
    /// Time elapsed since an arbitrary fixed point.
    fn now(&self) -> Duration;

    async fn sleep(&mut self, duration: Duration);
}
