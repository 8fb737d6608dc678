//! JBD (Jiabaida) BMS UART protocol.
//!
//! Requests are `DD A5 <register> 00 <checksum> 77`. Responses are framed as:
//!
//! Byte    | Meaning
//! ------- | -------------------------------------------------------------
//! 0       | Start byte, `0xDD`
//! 1       | Register being answered
//! 2       | Status, `0x00` on success
//! 3       | Data length `n`
//! 4..4+n  | Data
//! +2      | Checksum, big endian: `0x10000 - sum(status, length, data)`
//! +1      | End byte, `0x77`

use bms_telemetry_core::{
    acquisition::{Bms, CellReading, StatusReading},
    sample::{MAX_BATTERY_STRINGS, MAX_NTC_SENSORS},
    AcquisitionError,
};
use log::{debug, trace, warn};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const START: u8 = 0xDD;
const END: u8 = 0x77;
const READ: u8 = 0xA5;
const STATUS_OK: u8 = 0x00;

const REG_BASIC_INFO: u8 = 0x03;
const REG_CELL_VOLTAGES: u8 = 0x04;

/// Length of the basic info data preceding the NTC temperatures.
const BASIC_INFO_FIXED_LEN: usize = 23;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) struct JbdBms<P> {
    port: P,
    timeout: Duration,
}

impl JbdBms<SerialStream> {
    pub(crate) fn open(path: &str, baud: u32) -> Result<Self, tokio_serial::Error> {
        let port = tokio_serial::new(path, baud).open_native_async()?;
        Ok(Self::new(port))
    }
}

impl<P: AsyncRead + AsyncWrite + Unpin> JbdBms<P> {
    pub(crate) fn new(port: P) -> Self {
        Self {
            port,
            timeout: RESPONSE_TIMEOUT,
        }
    }

    /// Read a register, returning the response data.
    ///
    /// Anything received before the request is sent is discarded, as are responses to other
    /// registers that arrive within the response window.
    ///
    /// Serial I/O errors are reported as timeouts since in both cases the device has not
    /// answered.
    async fn read_register(&mut self, register: u8) -> Result<Vec<u8>, AcquisitionError> {
        self.discard_input().await;

        let request = encode_read_request(register);
        trace!("TX: {:02x?}", request);

        self.port.write_all(&request).await.map_err(|e| {
            warn!("Failed to write to serial port with error {e}");
            AcquisitionError::Timeout
        })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, read_frame(&mut self.port))
                .await
                .map_err(|_| {
                    warn!("No response to read of register {register:#04x}");
                    AcquisitionError::Timeout
                })?
                .map_err(|e| {
                    warn!("Serial error: {e}");
                    AcquisitionError::Timeout
                })?;
            trace!("RX: {:02x?}", frame);

            if frame[1] == register {
                return parse_response(register, &frame).map(<[u8]>::to_vec);
            }
            debug!(
                "Discarding response to register {:#04x} while waiting for {register:#04x}",
                frame[1]
            );
        }
    }

    /// Drop whatever is already waiting in the receive buffer, without blocking.
    async fn discard_input(&mut self) {
        let mut scratch = [0u8; 64];
        let mut discarded: usize = 0;

        loop {
            match tokio::time::timeout(Duration::ZERO, self.port.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => discarded = discarded.saturating_add(n),
                _ => break,
            }
        }

        if discarded > 0 {
            debug!("Discarded {discarded} stale bytes before request");
        }
    }
}

impl<P: AsyncRead + AsyncWrite + Unpin> Bms for JbdBms<P> {
    async fn get_status(&mut self) -> Result<StatusReading, AcquisitionError> {
        let data = self.read_register(REG_BASIC_INFO).await?;
        decode_basic_info(&data)
    }

    async fn get_cells(&mut self) -> Result<CellReading, AcquisitionError> {
        let data = self.read_register(REG_CELL_VOLTAGES).await?;
        decode_cell_voltages(&data)
    }
}

fn checksum(bytes: &[u8]) -> u16 {
    let sum = bytes
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
    0u16.wrapping_sub(sum)
}

fn encode_read_request(register: u8) -> [u8; 7] {
    let [hi, lo] = checksum(&[register, 0x00]).to_be_bytes();
    [START, READ, register, 0x00, hi, lo, END]
}

/// Read one complete frame, discarding anything before the start byte.
async fn read_frame<R: AsyncRead + Unpin>(port: &mut R) -> std::io::Result<Vec<u8>> {
    let mut skipped: usize = 0;
    while port.read_u8().await? != START {
        skipped = skipped.saturating_add(1);
    }
    if skipped > 0 {
        debug!("Discarded {skipped} bytes before start of frame");
    }

    let mut header = [START, 0, 0, 0];
    port.read_exact(&mut header[1..]).await?;

    let data_len = usize::from(header[3]);
    let mut frame = header.to_vec();
    frame.resize(header.len() + data_len + 3, 0);
    port.read_exact(&mut frame[header.len()..]).await?;

    Ok(frame)
}

/// Validate a response frame, returning its data.
fn parse_response(register: u8, frame: &[u8]) -> Result<&[u8], AcquisitionError> {
    let malformed = |reason: &str| {
        warn!("Malformed response to register {register:#04x}: {reason}");
        AcquisitionError::Malformed
    };

    if frame.len() < 7 {
        return Err(malformed("too short"));
    }
    if frame[0] != START || frame[frame.len() - 1] != END {
        return Err(malformed("bad framing"));
    }
    if frame[1] != register {
        return Err(malformed("unexpected register"));
    }
    if frame[2] != STATUS_OK {
        return Err(malformed("error status"));
    }

    let data_len = usize::from(frame[3]);
    if frame.len() != data_len + 7 {
        return Err(malformed("length mismatch"));
    }

    let checked = &frame[2..4 + data_len];
    let expected = checksum(checked).to_be_bytes();
    if frame[4 + data_len..6 + data_len] != expected {
        return Err(malformed("checksum mismatch"));
    }

    Ok(&frame[4..4 + data_len])
}

fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn decode_basic_info(data: &[u8]) -> Result<StatusReading, AcquisitionError> {
    if data.len() < BASIC_INFO_FIXED_LEN {
        warn!("Basic info too short ({} bytes)", data.len());
        return Err(AcquisitionError::Malformed);
    }

    let ntc_count = data[22];
    let temperature_data = &data[BASIC_INFO_FIXED_LEN..];
    if temperature_data.len() < usize::from(ntc_count) * 2 {
        warn!(
            "Basic info reports {ntc_count} NTC sensors but carries {} bytes of temperatures",
            temperature_data.len()
        );
        return Err(AcquisitionError::Malformed);
    }

    let mut temperatures = heapless::Vec::new();
    for raw in temperature_data
        .chunks_exact(2)
        .take(usize::from(ntc_count).min(MAX_NTC_SENSORS))
    {
        temperatures
            .push(u16::from_be_bytes([raw[0], raw[1]]))
            .map_err(|_| AcquisitionError::Malformed)?;
    }

    Ok(StatusReading {
        voltage: be_u16(data, 0),
        current: be_u16(data, 2) as i16,
        remaining_capacity: be_u16(data, 4),
        nominal_capacity: be_u16(data, 6),
        cycles: be_u16(data, 8),
        production_date: be_u16(data, 10),
        balance_low: be_u16(data, 12),
        balance_high: be_u16(data, 14),
        protection: be_u16(data, 16),
        version: data[18],
        rsoc: data[19],
        fet: data[20],
        cell_count: data[21],
        ntc_count,
        temperatures,
    })
}

fn decode_cell_voltages(data: &[u8]) -> Result<CellReading, AcquisitionError> {
    if data.len() % 2 != 0 {
        warn!("Cell voltage data has odd length {}", data.len());
        return Err(AcquisitionError::Malformed);
    }

    let count = data.len() / 2;
    if count > MAX_BATTERY_STRINGS {
        warn!("BMS returned {count} cell voltages, only the first {MAX_BATTERY_STRINGS} are used");
    }

    let mut voltages = heapless::Vec::new();
    for raw in data.chunks_exact(2).take(MAX_BATTERY_STRINGS) {
        voltages
            .push(u16::from_be_bytes([raw[0], raw[1]]))
            .map_err(|_| AcquisitionError::Malformed)?;
    }

    Ok(CellReading { voltages })
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    /// Basic info from a 15 cell pack with 2 NTC sensors.
    const BASIC_INFO_RESPONSE: [u8; 34] = [
        0xDD, 0x03, 0x00, 0x1B, 0x17, 0x00, 0x00, 0x00, 0x02, 0xD0, 0x03, 0xE8, 0x00, 0x00, 0x20,
        0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x48, 0x03, 0x0F, 0x02, 0x0B, 0x76, 0x0B,
        0x82, 0xFB, 0xFF, 0x77,
    ];

    const CELL_VOLTAGES_RESPONSE: [u8; 13] = [
        0xDD, 0x04, 0x00, 0x06, 0x0E, 0x74, 0x0E, 0x6F, 0x0E, 0x76, 0xFE, 0x77, 0x77,
    ];

    fn bms_pair() -> (JbdBms<DuplexStream>, DuplexStream) {
        let (port, device) = duplex(256);
        (JbdBms::new(port), device)
    }

    #[test]
    fn read_requests() {
        assert_eq!(
            encode_read_request(REG_BASIC_INFO),
            [0xDD, 0xA5, 0x03, 0x00, 0xFF, 0xFD, 0x77]
        );
        assert_eq!(
            encode_read_request(REG_CELL_VOLTAGES),
            [0xDD, 0xA5, 0x04, 0x00, 0xFF, 0xFC, 0x77]
        );
    }

    #[test]
    fn parse_basic_info() {
        let data = parse_response(REG_BASIC_INFO, &BASIC_INFO_RESPONSE).unwrap();
        let status = decode_basic_info(data).unwrap();

        assert_eq!(status.voltage, 5888);
        assert_eq!(status.current, 0);
        assert_eq!(status.remaining_capacity, 720);
        assert_eq!(status.nominal_capacity, 1000);
        assert_eq!(status.production_date, 0x2078);
        assert_eq!(status.version, 0x10);
        assert_eq!(status.rsoc, 72);
        assert_eq!(status.fet, 0x03);
        assert_eq!(status.cell_count, 15);
        assert_eq!(status.ntc_count, 2);
        assert_eq!(status.temperatures, [2934, 2946]);
    }

    #[test]
    fn parse_negative_current() {
        let mut data = parse_response(REG_BASIC_INFO, &BASIC_INFO_RESPONSE)
            .unwrap()
            .to_vec();
        data[2..4].copy_from_slice(&(-150i16).to_be_bytes());

        assert_eq!(decode_basic_info(&data).unwrap().current, -150);
    }

    #[test]
    fn parse_cell_voltages() {
        let data = parse_response(REG_CELL_VOLTAGES, &CELL_VOLTAGES_RESPONSE).unwrap();
        let cells = decode_cell_voltages(data).unwrap();
        assert_eq!(cells.voltages, [3700, 3695, 3702]);
    }

    #[test]
    fn reject_bad_checksum() {
        let mut frame = BASIC_INFO_RESPONSE;
        frame[31] = 0xFC;
        assert_eq!(
            parse_response(REG_BASIC_INFO, &frame),
            Err(AcquisitionError::Malformed)
        );
    }

    #[test]
    fn reject_error_status() {
        let frame = [0xDD, 0x03, 0x80, 0x00, 0xFF, 0x80, 0x77];
        assert_eq!(
            parse_response(REG_BASIC_INFO, &frame),
            Err(AcquisitionError::Malformed)
        );
    }

    #[test]
    fn reject_wrong_register() {
        assert_eq!(
            parse_response(REG_BASIC_INFO, &CELL_VOLTAGES_RESPONSE),
            Err(AcquisitionError::Malformed)
        );
    }

    #[test]
    fn reject_truncated_temperatures() {
        let data = parse_response(REG_BASIC_INFO, &BASIC_INFO_RESPONSE).unwrap();
        assert_eq!(
            decode_basic_info(&data[..BASIC_INFO_FIXED_LEN + 2]),
            Err(AcquisitionError::Malformed)
        );
    }

    #[test]
    fn excess_cells_are_truncated() {
        let data: Vec<u8> = (0..40u16).flat_map(|v| (3000 + v).to_be_bytes()).collect();
        let cells = decode_cell_voltages(&data).unwrap();
        assert_eq!(cells.voltages.len(), MAX_BATTERY_STRINGS);
        assert_eq!(cells.voltages[31], 3031);
    }

    /// Answer one request from the driver with `reply`, returning the request.
    async fn answer(device: &mut DuplexStream, reply: &[u8]) -> [u8; 7] {
        let mut request = [0u8; 7];
        device.read_exact(&mut request).await.unwrap();
        device.write_all(reply).await.unwrap();
        request
    }

    #[tokio::test]
    async fn status_over_serial() {
        let (mut bms, mut device) = bms_pair();

        // Line noise ahead of the response
        let reply = [&[0x00, 0x42][..], &BASIC_INFO_RESPONSE].concat();
        let (status, request) = tokio::join!(bms.get_status(), answer(&mut device, &reply));

        assert_eq!(status.unwrap().cell_count, 15);
        assert_eq!(request, encode_read_request(REG_BASIC_INFO));
    }

    #[tokio::test]
    async fn cells_over_serial() {
        let (mut bms, mut device) = bms_pair();

        let (cells, request) = tokio::join!(
            bms.get_cells(),
            answer(&mut device, &CELL_VOLTAGES_RESPONSE)
        );

        assert_eq!(cells.unwrap().voltages, [3700, 3695, 3702]);
        assert_eq!(request, encode_read_request(REG_CELL_VOLTAGES));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (mut bms, _device) = bms_pair();
        assert_eq!(bms.get_status().await, Err(AcquisitionError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_does_not_desynchronise() {
        let (mut bms, mut device) = bms_pair();

        assert_eq!(bms.get_status().await, Err(AcquisitionError::Timeout));
        let mut unanswered = [0u8; 7];
        device.read_exact(&mut unanswered).await.unwrap();

        // Reply to the timed out request turns up before the next one is sent
        device.write_all(&BASIC_INFO_RESPONSE).await.unwrap();

        let (cells, _) = tokio::join!(
            bms.get_cells(),
            answer(&mut device, &CELL_VOLTAGES_RESPONSE)
        );
        assert_eq!(cells.unwrap().voltages, [3700, 3695, 3702]);

        let (status, _) = tokio::join!(
            bms.get_status(),
            answer(&mut device, &BASIC_INFO_RESPONSE)
        );
        assert_eq!(status.unwrap().cell_count, 15);
    }

    #[tokio::test]
    async fn response_to_other_register_is_skipped() {
        let (mut bms, mut device) = bms_pair();

        let reply = [&BASIC_INFO_RESPONSE[..], &CELL_VOLTAGES_RESPONSE].concat();
        let (cells, _) = tokio::join!(bms.get_cells(), answer(&mut device, &reply));

        assert_eq!(cells.unwrap().voltages, [3700, 3695, 3702]);
    }
}
