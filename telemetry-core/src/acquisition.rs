use crate::{
    debug,
    sample::{TelemetrySample, MAX_BATTERY_STRINGS, MAX_NTC_SENSORS},
    warn, AcquisitionError,
};
use heapless::Vec;

/// Pack level status as reported by the BMS, in raw device units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
pub struct StatusReading {
    pub voltage: u16,
    pub current: i16,
    pub remaining_capacity: u16,
    pub nominal_capacity: u16,
    pub cycles: u16,
    pub production_date: u16,
    pub balance_low: u16,
    pub balance_high: u16,
    pub protection: u16,
    pub version: u8,
    pub rsoc: u8,
    pub fet: u8,

    /// Number of series cells, as reported (may exceed [`MAX_BATTERY_STRINGS`])
    pub cell_count: u8,
    /// Number of NTC sensors, as reported (may exceed [`MAX_NTC_SENSORS`])
    pub ntc_count: u8,
    /// Raw temperatures in tenths of a Kelvin
    pub temperatures: Vec<u16, MAX_NTC_SENSORS>,
}

/// Per-cell voltages in mV.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
pub struct CellReading {
    pub voltages: Vec<u16, MAX_BATTERY_STRINGS>,
}

/// A battery management system.
///
/// Both requests complete or time out on their own; timeouts are the implementation's concern.
#[allow(async_fn_in_trait)]
pub trait Bms {
    async fn get_status(&mut self) -> Result<StatusReading, AcquisitionError>;
    async fn get_cells(&mut self) -> Result<CellReading, AcquisitionError>;
}

/// Result of both acquisition requests in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
pub struct AcquisitionReport {
    pub status: Result<(), AcquisitionError>,
    pub cells: Result<(), AcquisitionError>,
}

/// Folds BMS readings into a telemetry sample.
///
/// Status and cell reads are independent and best effort: a failed read leaves the fields it
/// would have written holding their previous values.
pub struct Acquirer<B> {
    bms: B,
}

impl<B: Bms> Acquirer<B> {
    pub fn new(bms: B) -> Self {
        Self { bms }
    }

    pub fn bms(&self) -> &B {
        &self.bms
    }

    pub async fn acquire(&mut self, sample: &mut TelemetrySample) -> AcquisitionReport {
        let status = self.acquire_status(sample).await;
        let cells = self.acquire_cells(sample).await;
        AcquisitionReport { status, cells }
    }

    pub async fn acquire_status(
        &mut self,
        sample: &mut TelemetrySample,
    ) -> Result<(), AcquisitionError> {
        let status = match self.bms.get_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("BMS status request failed: {}", e);
                return Err(e);
            }
        };

        if let Err(e) = sample.apply_status(&status) {
            warn!("Discarding BMS status: {}", e);
            return Err(e);
        }

        debug!(
            "BMS status: {} cells, {} NTC sensors, RSOC {}%",
            sample.num_battery_strings(),
            sample.num_ntc_sensors(),
            sample.relative_state_of_charge
        );

        if !sample.protection_flags().is_empty() {
            warn!(
                "BMS protection active, status word {}",
                sample.protection_status
            );
        }

        Ok(())
    }

    pub async fn acquire_cells(
        &mut self,
        sample: &mut TelemetrySample,
    ) -> Result<(), AcquisitionError> {
        let cells = match self.bms.get_cells().await {
            Ok(cells) => cells,
            Err(e) => {
                warn!("BMS cell voltage request failed: {}", e);
                return Err(e);
            }
        };

        if let Err(e) = sample.apply_cells(&cells) {
            warn!("Discarding BMS cell voltages: {}", e);
            return Err(e);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{cells, scenario_status, MockBms};

    #[tokio::test]
    async fn status_and_cells() {
        let bms = MockBms::default()
            .with_status(Ok(scenario_status()))
            .with_cells(Ok(cells(&[3700, 3695, 3702])));
        let mut acquirer = Acquirer::new(bms);
        let mut sample = TelemetrySample::default();

        let report = acquirer.acquire(&mut sample).await;

        assert_eq!(
            report,
            AcquisitionReport {
                status: Ok(()),
                cells: Ok(())
            }
        );
        assert_eq!(sample.total_voltage, 3700);
        assert_eq!(sample.cell_voltages(), &[3700, 3695, 3702]);
        assert_eq!(sample.ntc_temperatures(), &[250]);
    }

    #[tokio::test]
    async fn status_failure_keeps_previous_values_and_still_reads_cells() {
        let bms = MockBms::default()
            .with_status(Ok(scenario_status()))
            .with_status(Err(AcquisitionError::Timeout))
            .with_cells(Ok(cells(&[3700, 3695, 3702])))
            .with_cells(Ok(cells(&[3600, 3601, 3602])));
        let mut acquirer = Acquirer::new(bms);
        let mut sample = TelemetrySample::default();

        acquirer.acquire(&mut sample).await;
        let report = acquirer.acquire(&mut sample).await;

        assert_eq!(report.status, Err(AcquisitionError::Timeout));
        assert_eq!(report.cells, Ok(()));
        assert_eq!(sample.total_voltage, 3700);
        assert_eq!(sample.cycle_count, 12);
        assert_eq!(sample.ntc_temperatures(), &[250]);
        assert_eq!(sample.cell_voltages(), &[3600, 3601, 3602]);
        assert_eq!(acquirer.bms().cell_requests, 2);
    }

    #[tokio::test]
    async fn cell_failure_keeps_previous_voltages() {
        let mut updated = scenario_status();
        updated.voltage = 3650;

        let bms = MockBms::default()
            .with_status(Ok(scenario_status()))
            .with_status(Ok(updated))
            .with_cells(Ok(cells(&[3700, 3695, 3702])))
            .with_cells(Err(AcquisitionError::Malformed));
        let mut acquirer = Acquirer::new(bms);
        let mut sample = TelemetrySample::default();

        acquirer.acquire(&mut sample).await;
        let report = acquirer.acquire(&mut sample).await;

        assert_eq!(report.status, Ok(()));
        assert_eq!(report.cells, Err(AcquisitionError::Malformed));
        assert_eq!(sample.total_voltage, 3650);
        assert_eq!(sample.cell_voltages(), &[3700, 3695, 3702]);
    }

    #[tokio::test]
    async fn cell_read_uses_previous_count_when_status_fails() {
        let bms = MockBms::default()
            .with_status(Err(AcquisitionError::Timeout))
            .with_cells(Ok(cells(&[3700, 3695, 3702])));
        let mut acquirer = Acquirer::new(bms);
        let mut sample = TelemetrySample::default();

        let report = acquirer.acquire(&mut sample).await;

        assert_eq!(report.cells, Ok(()));
        assert!(sample.cell_voltages().is_empty());
    }
}
