use crate::{
    acquisition::{Acquirer, AcquisitionReport, Bms},
    clock::Clock,
    debug,
    payload::PAYLOAD_CAPACITY,
    publisher::{Publisher, TelemetryTransport},
    sample::TelemetrySample,
    warn, CycleError,
};
use core::time::Duration;

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
pub enum CycleState {
    Idle,
    Acquiring,
    Publishing,
    Waiting,
}

/// What happened during one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub acquisition: AcquisitionReport,
    /// Payload length on success
    pub publish: Result<usize, CycleError>,
    /// Time spent waiting for the end of the period
    pub wait: Duration,
}

/// Runs acquire, publish and wait cycles back to back.
///
/// Each cycle starts no sooner than `period` after the previous one started. A cycle that
/// overruns the period is followed immediately by the next one, with no attempt to catch up.
pub struct Scheduler<B, T, C> {
    acquirer: Acquirer<B>,
    publisher: Publisher<T>,
    clock: C,
    period: Duration,
    state: CycleState,

    sample: TelemetrySample,
    buffer: [u8; PAYLOAD_CAPACITY],
}

impl<B: Bms, T: TelemetryTransport, C: Clock> Scheduler<B, T, C> {
    pub fn new(bms: B, transport: T, clock: C, period: Duration) -> Self {
        Self {
            acquirer: Acquirer::new(bms),
            publisher: Publisher::new(transport),
            clock,
            period,
            state: CycleState::Idle,
            sample: TelemetrySample::default(),
            buffer: [0; PAYLOAD_CAPACITY],
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn sample(&self) -> &TelemetrySample {
        &self.sample
    }

    pub fn bms(&self) -> &B {
        self.acquirer.bms()
    }

    pub fn transport(&self) -> &T {
        self.publisher.transport()
    }

    pub async fn run(&mut self) -> ! {
        loop {
            self.run_cycle().await;
        }
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let start = self.clock.now();

        self.state = CycleState::Acquiring;
        let acquisition = self.acquirer.acquire(&mut self.sample).await;

        self.state = CycleState::Publishing;
        let publish = self
            .publisher
            .publish_sample(&self.sample, &mut self.buffer)
            .await;

        self.state = CycleState::Waiting;
        let elapsed = self.clock.now().saturating_sub(start);
        let wait = self.period.saturating_sub(elapsed);
        if wait.is_zero() {
            warn!(
                "Cycle took {} ms, longer than the {} ms period",
                elapsed.as_millis() as u64,
                self.period.as_millis() as u64
            );
        } else {
            debug!("Waiting {} ms for next cycle", wait.as_millis() as u64);
            self.clock.sleep(wait).await;
        }

        self.state = CycleState::Idle;

        CycleReport {
            acquisition,
            publish,
            wait,
        }
    }
}
