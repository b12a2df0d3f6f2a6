//! Live sensor data and vehicle status models

use serde::{Deserialize, Serialize};

/// A batch of live sensor readings from mode 01 PIDs
///
/// Fields are `None` when the vehicle did not answer the corresponding PID;
/// a partial read is still a usable result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    /// Engine speed in revolutions per minute (PID 0C)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<f64>,
    /// Coolant temperature in degrees Celsius (PID 05)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coolant_temp_c: Option<f64>,
    /// Vehicle speed in km/h (PID 0D)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kph: Option<f64>,
    /// Intake air temperature in degrees Celsius (PID 0F)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intake_temp_c: Option<f64>,
    /// Throttle position in percent (PID 11)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_pct: Option<f64>,
    /// Control module voltage in volts (PID 42)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_voltage: Option<f64>,
}

impl LiveData {
    /// True when no PID produced a value
    pub fn is_empty(&self) -> bool {
        self.rpm.is_none()
            && self.coolant_temp_c.is_none()
            && self.speed_kph.is_none()
            && self.intake_temp_c.is_none()
            && self.throttle_pct.is_none()
            && self.module_voltage.is_none()
    }
}

/// Monitor status from PID 01 (MIL lamp and stored DTC count)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleStatus {
    /// Malfunction indicator lamp commanded on
    pub mil_on: bool,
    /// Number of stored trouble codes
    pub dtc_count: u8,
}

/// Adapter identity gathered during initialization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterIdentity {
    /// Firmware version string reported by the adapter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// OBD protocol number reported by the adapter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Battery voltage at the OBD port in volts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
}
