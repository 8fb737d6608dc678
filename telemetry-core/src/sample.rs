use crate::{
    acquisition::{CellReading, StatusReading},
    warn, AcquisitionError,
};
use heapless::Vec;

/// Maximum number of series cells (battery strings) a sample can hold.
pub const MAX_BATTERY_STRINGS: usize = 32;

/// Maximum number of NTC temperature sensors a sample can hold.
pub const MAX_NTC_SENSORS: usize = 8;

/// 0 degrees Celsius expressed in the device's temperature unit (tenths of a Kelvin).
const ZERO_CELSIUS_DECI_KELVIN: i32 = 2731;

/// Convert a raw device temperature (tenths of a Kelvin) to tenths of a degree Celsius.
pub fn deci_celsius(raw: u16) -> i16 {
    let value = i32::from(raw) - ZERO_CELSIUS_DECI_KELVIN;
    value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// One point in time snapshot of the battery pack.
///
/// Scalar fields hold the raw device values. The per-cell voltages and per-sensor temperatures
/// are bounded collections whose lengths are the cell and sensor counts, so a sample can never
/// claim more readings than the device reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
pub struct TelemetrySample {
    /// Pack voltage in units of 10 mV
    pub total_voltage: u16,
    /// Pack current in units of 10 mA, negative when discharging
    pub current: i16,
    /// Remaining capacity in units of 10 mAh
    pub remaining_capacity: u16,
    /// Nominal capacity in units of 10 mAh
    pub nominal_capacity: u16,
    pub cycle_count: u16,
    /// See [`ProductionDate`]
    pub production_date: u16,
    /// Balancing state of cells 1 to 16, one bit per cell
    pub balance_status_low: u16,
    /// Balancing state of cells 17 to 32, one bit per cell
    pub balance_status_high: u16,
    /// See [`ProtectionStatus`]
    pub protection_status: u16,
    pub software_version: u8,
    /// Relative state of charge in %
    pub relative_state_of_charge: u8,
    /// See [`FetControl`]
    pub fet_control: u8,

    cell_voltages: Vec<u16, MAX_BATTERY_STRINGS>,
    ntc_temperatures: Vec<i16, MAX_NTC_SENSORS>,
}

impl TelemetrySample {
    pub fn num_battery_strings(&self) -> u8 {
        self.cell_voltages.len() as u8
    }

    pub fn num_ntc_sensors(&self) -> u8 {
        self.ntc_temperatures.len() as u8
    }

    /// Cell voltages in mV, in cell order.
    pub fn cell_voltages(&self) -> &[u16] {
        &self.cell_voltages
    }

    /// Temperatures in tenths of a degree Celsius, in sensor order.
    pub fn ntc_temperatures(&self) -> &[i16] {
        &self.ntc_temperatures
    }

    pub fn fet_flags(&self) -> FetControl {
        FetControl::from_bits_retain(self.fet_control)
    }

    pub fn protection_flags(&self) -> ProtectionStatus {
        ProtectionStatus::from_bits_retain(self.protection_status)
    }

    pub fn manufactured(&self) -> ProductionDate {
        ProductionDate::from_raw(self.production_date)
    }

    /// Overwrite every status derived field from a status reading.
    ///
    /// Counts beyond [`MAX_BATTERY_STRINGS`] and [`MAX_NTC_SENSORS`] are clamped. When the cell
    /// count changes, existing cell voltages are kept and new cells read 0 until the next
    /// successful cell read.
    ///
    /// Either the whole reading is applied or, on error, the sample is left untouched.
    pub fn apply_status(&mut self, status: &StatusReading) -> Result<(), AcquisitionError> {
        let cell_count = bounded_count(status.cell_count, MAX_BATTERY_STRINGS, "cell");
        let ntc_count = bounded_count(status.ntc_count, MAX_NTC_SENSORS, "NTC");

        let raw_temperatures = status.temperatures.get(..ntc_count).ok_or_else(|| {
            warn!(
                "Status reports {} NTC sensors but carries {} temperatures",
                ntc_count,
                status.temperatures.len()
            );
            AcquisitionError::Malformed
        })?;

        let mut ntc_temperatures = Vec::new();
        for raw in raw_temperatures {
            ntc_temperatures
                .push(deci_celsius(*raw))
                .map_err(|_| AcquisitionError::Malformed)?;
        }

        let mut cell_voltages = self.cell_voltages.clone();
        cell_voltages
            .resize(cell_count, 0)
            .map_err(|_| AcquisitionError::Malformed)?;

        self.total_voltage = status.voltage;
        self.current = status.current;
        self.remaining_capacity = status.remaining_capacity;
        self.nominal_capacity = status.nominal_capacity;
        self.cycle_count = status.cycles;
        self.production_date = status.production_date;
        self.balance_status_low = status.balance_low;
        self.balance_status_high = status.balance_high;
        self.protection_status = status.protection;
        self.software_version = status.version;
        self.relative_state_of_charge = status.rsoc;
        self.fet_control = status.fet;
        self.cell_voltages = cell_voltages;
        self.ntc_temperatures = ntc_temperatures;

        Ok(())
    }

    /// Overwrite the cell voltages for the current cell count.
    ///
    /// Voltages beyond the current count are ignored. A reading with fewer voltages than the
    /// current count is rejected and the sample is left untouched.
    pub fn apply_cells(&mut self, cells: &CellReading) -> Result<(), AcquisitionError> {
        let count = self.cell_voltages.len();

        let voltages = cells.voltages.get(..count).ok_or_else(|| {
            warn!(
                "Expected {} cell voltages but the BMS returned {}",
                count,
                cells.voltages.len()
            );
            AcquisitionError::Malformed
        })?;

        self.cell_voltages.copy_from_slice(voltages);

        Ok(())
    }
}

fn bounded_count(reported: u8, max: usize, what: &str) -> usize {
    let reported = usize::from(reported);

    if reported > max {
        warn!(
            "BMS reported {} {} readings, only the first {} are used",
            reported, what, max
        );
        max
    } else {
        reported
    }
}

bitflags::bitflags! {
    /// MOSFET enable state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FetControl: u8 {
        const CHARGE = 1 << 0;
        const DISCHARGE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Active protection conditions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtectionStatus: u16 {
        const CELL_OVERVOLTAGE = 1 << 0;
        const CELL_UNDERVOLTAGE = 1 << 1;
        const PACK_OVERVOLTAGE = 1 << 2;
        const PACK_UNDERVOLTAGE = 1 << 3;
        const CHARGE_OVERTEMPERATURE = 1 << 4;
        const CHARGE_UNDERTEMPERATURE = 1 << 5;
        const DISCHARGE_OVERTEMPERATURE = 1 << 6;
        const DISCHARGE_UNDERTEMPERATURE = 1 << 7;
        const CHARGE_OVERCURRENT = 1 << 8;
        const DISCHARGE_OVERCURRENT = 1 << 9;
        const SHORT_CIRCUIT = 1 << 10;
        const FRONTEND_IC_ERROR = 1 << 11;
        const SOFTWARE_MOSFET_LOCK = 1 << 12;
    }
}

/// Date of manufacture, packed by the device as `(year - 2000) << 9 | month << 5 | day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "no-std", derive(defmt::Format))]
pub struct ProductionDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl ProductionDate {
    pub fn from_raw(raw: u16) -> Self {
        Self {
            year: 2000 + (raw >> 9),
            month: ((raw >> 5) & 0x0f) as u8,
            day: (raw & 0x1f) as u8,
        }
    }
}
