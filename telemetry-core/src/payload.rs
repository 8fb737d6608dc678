use crate::{sample::TelemetrySample, warn, SerializationOverflow};
use serde::{ser::SerializeMap, Serialize, Serializer};

/// Size of the payload serialization buffer.
///
/// Large enough for a fully populated sample (32 cells, 8 sensors) with every field at its
/// widest value, which encodes to 840 bytes.
pub const PAYLOAD_CAPACITY: usize = 1024;

const CELL_KEYS: [&str; crate::sample::MAX_BATTERY_STRINGS] = [
    "cell1", "cell2", "cell3", "cell4", "cell5", "cell6", "cell7", "cell8", "cell9", "cell10",
    "cell11", "cell12", "cell13", "cell14", "cell15", "cell16", "cell17", "cell18", "cell19",
    "cell20", "cell21", "cell22", "cell23", "cell24", "cell25", "cell26", "cell27", "cell28",
    "cell29", "cell30", "cell31", "cell32",
];

/// Wire representation of a [`TelemetrySample`].
///
/// Key names and nesting are consumed downstream and must not change.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload<'a> {
    total_voltage: u16,
    current: i16,
    remaining_capacity: u16,
    nominal_capacity: u16,
    cycles: u16,
    production_date: u16,
    balance_status: u16,
    balance_status_high: u16,
    protection_status: u16,
    software_version: u8,
    rsoc: u8,
    fet_control: u8,
    num_battery_strings: u8,
    num_ntc: u8,
    cell_voltages: CellVoltages<'a>,
    ntc_temperatures: &'a [i16],
}

impl<'a> From<&'a TelemetrySample> for TelemetryPayload<'a> {
    fn from(sample: &'a TelemetrySample) -> Self {
        Self {
            total_voltage: sample.total_voltage,
            current: sample.current,
            remaining_capacity: sample.remaining_capacity,
            nominal_capacity: sample.nominal_capacity,
            cycles: sample.cycle_count,
            production_date: sample.production_date,
            balance_status: sample.balance_status_low,
            balance_status_high: sample.balance_status_high,
            protection_status: sample.protection_status,
            software_version: sample.software_version,
            rsoc: sample.relative_state_of_charge,
            fet_control: sample.fet_control,
            num_battery_strings: sample.num_battery_strings(),
            num_ntc: sample.num_ntc_sensors(),
            cell_voltages: CellVoltages(sample.cell_voltages()),
            ntc_temperatures: sample.ntc_temperatures(),
        }
    }
}

/// Serializes as `{"cell1": v1, "cell2": v2, ...}`.
#[derive(Debug)]
struct CellVoltages<'a>(&'a [u16]);

impl Serialize for CellVoltages<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, voltage) in CELL_KEYS.iter().zip(self.0) {
            map.serialize_entry(key, voltage)?;
        }
        map.end()
    }
}

/// Encode a sample as JSON into `buffer`, returning the number of bytes written.
///
/// Never writes past the end of `buffer`; a payload that does not fit is reported as
/// [`SerializationOverflow`] and the buffer contents are unspecified.
pub fn serialize_into(
    sample: &TelemetrySample,
    buffer: &mut [u8],
) -> Result<usize, SerializationOverflow> {
    let capacity = buffer.len();

    serde_json_core::to_slice(&TelemetryPayload::from(sample), buffer).map_err(|_| {
        warn!(
            "Telemetry payload does not fit in {} bytes, not publishing",
            capacity
        );
        SerializationOverflow { capacity }
    })
}
