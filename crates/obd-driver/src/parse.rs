//! Response parsing: hex payloads, DTC groups, PID decoding
//!
//! Responses arrive already prompt-framed and trimmed by the command queue;
//! these helpers work on that cleaned text.

use obd_core::{Dtc, VehicleStatus};

use crate::error::DriverError;

/// Strip whitespace and uppercase, leaving only the characters that matter
/// for hex comparison
fn compact(response: &str) -> String {
    response
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// "NO DATA" means the request was understood but the bus had nothing to say
pub fn is_no_data(response: &str) -> bool {
    compact(response).contains("NODATA")
}

/// Adapter-level error markers that make a payload unusable
pub fn is_error_marker(response: &str) -> bool {
    let c = compact(response);
    c.contains("UNABLETOCONNECT")
        || c.contains("CANERROR")
        || c.contains("BUSERROR")
        || c.contains("STOPPED")
        || c == "?"
}

/// Decode the hex payload of a mode 01 response, stripping the `41<pid>`
/// mode echo when present
pub fn parse_hex_payload(response: &str, pid: &str) -> Result<Vec<u8>, DriverError> {
    let mut cleaned = compact(response);
    let echo = format!("41{}", pid.to_uppercase());
    if let Some(stripped) = cleaned.strip_prefix(&echo) {
        cleaned = stripped.to_string();
    }
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        return Err(DriverError::InvalidResponse(response.to_string()));
    }
    hex::decode(&cleaned).map_err(|_| DriverError::InvalidResponse(response.to_string()))
}

/// Scale a PID's data bytes into engineering units
pub fn decode_pid(pid: &str, data: &[u8]) -> Option<f64> {
    let a = *data.first()? as f64;
    match pid.to_uppercase().as_str() {
        // Engine RPM: two bytes, quarter-rpm resolution
        "0C" => {
            let b = *data.get(1)? as f64;
            Some((a * 256.0 + b) / 4.0)
        }
        // Temperatures carry a -40 offset
        "05" | "0F" => Some(a - 40.0),
        // Vehicle speed is the raw byte
        "0D" => Some(a),
        // Throttle position as a percentage
        "11" => Some(a / 255.0 * 100.0),
        // Control module voltage in millivolt steps
        "42" => {
            let b = *data.get(1)? as f64;
            Some((a * 256.0 + b) / 1000.0)
        }
        _ => None,
    }
}

/// Parse one PID out of a mode 01 response
pub fn parse_pid_response(response: &str, pid: &str) -> Option<f64> {
    if is_no_data(response) || is_error_marker(response) {
        return None;
    }
    let payload = parse_hex_payload(response, pid).ok()?;
    decode_pid(pid, &payload)
}

/// Parse stored trouble codes out of a mode 03 response.
///
/// Everything after the `43` mode echo is read as 2-byte groups; all-zero
/// groups are padding and are skipped. Unparseable tails end the scan.
pub fn parse_dtcs(response: &str) -> Vec<Dtc> {
    let cleaned = compact(response);
    let Some(start) = cleaned.find("43") else {
        return Vec::new();
    };
    let body = &cleaned[start + 2..];

    let mut dtcs = Vec::new();
    for group in body.as_bytes().chunks_exact(4) {
        let Ok(text) = std::str::from_utf8(group) else {
            break;
        };
        let Ok(bytes) = hex::decode(text) else {
            break;
        };
        if let Some(dtc) = Dtc::from_bytes(bytes[0], bytes[1]) {
            dtcs.push(dtc);
        }
    }
    dtcs
}

/// Parse MIL state and stored-code count out of a PID 01 response
pub fn parse_status(response: &str) -> Option<VehicleStatus> {
    if is_no_data(response) || is_error_marker(response) {
        return None;
    }
    let payload = parse_hex_payload(response, "01").ok()?;
    let a = *payload.first()?;
    Some(VehicleStatus {
        mil_on: a & 0x80 != 0,
        dtc_count: a & 0x7F,
    })
}

/// Parse the adapter's battery voltage reading, e.g. `12.6V`
pub fn parse_voltage(response: &str) -> Option<f64> {
    let line = response.lines().map(str::trim).find(|l| !l.is_empty())?;
    line.trim_end_matches(['V', 'v']).trim().parse().ok()
}

/// Whether a mode 04 response reports a successful clear
pub fn is_clear_ok(response: &str) -> bool {
    let c = compact(response);
    c.contains("44") || c.contains("OK")
}
