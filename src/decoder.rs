use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// Bit positions of the `sys_flag` status word
const VOLT_APV: u32 = 1 << 0;
const CUR_APV: u32 = 1 << 1;
const POW_APV: u32 = 1 << 2;
const ON_DELAY: u32 = 1 << 3;
const HWRELAY_IS_ON: u32 = 1 << 4;
const EVENT_RELAY: u32 = 1 << 6;
const USER_RELAY: u32 = 1 << 7;
const HOLIDAY_RELAY: u32 = 1 << 8;
const SYNC_TIME_SNTP: u32 = 1 << 9;
const SYNC_TIME_CLOUD: u32 = 1 << 10;
const LOCK_PANEL: u32 = 1 << 11;
const FREQ_APV: u32 = 1 << 12;
const WF_STA_EN: u32 = 1 << 16;
const WF_STA_GOT_IP: u32 = 1 << 17;
const WF_AP_EN: u32 = 1 << 18;
const WF_AP_GOT_IP: u32 = 1 << 19;
const WEB_RUN: u32 = 1 << 26;
const CLOUD_RUN: u32 = 1 << 27;
const SNTP_RUN: u32 = 1 << 28;
const DNS_RUN: u32 = 1 << 30;
const CLB_ENABLED: u32 = 1 << 31;

/// Union of every bit `decode_flags` looks at.
pub const FLAG_MASK: u32 = VOLT_APV
    | CUR_APV
    | POW_APV
    | ON_DELAY
    | HWRELAY_IS_ON
    | EVENT_RELAY
    | USER_RELAY
    | HOLIDAY_RELAY
    | SYNC_TIME_SNTP
    | SYNC_TIME_CLOUD
    | LOCK_PANEL
    | FREQ_APV
    | WF_STA_EN
    | WF_STA_GOT_IP
    | WF_AP_EN
    | WF_AP_GOT_IP
    | WEB_RUN
    | CLOUD_RUN
    | SNTP_RUN
    | DNS_RUN
    | CLB_ENABLED;

/// Fault word bits in ascending order. Bits 18 to 29 are unused by the firmware.
const FAULTS: [(u32, &str); 20] = [
    (0, "voltHi"),
    (1, "voltLo"),
    (2, "oltOver"),
    (3, "voltApv"),
    (4, "curHi"),
    (5, "curOver"),
    (6, "curApv"),
    (7, "powHi"),
    (8, "powApv"),
    (9, "tempSensorError"),
    (10, "tempSensorDisconnected"),
    (11, "tempSensorShortCirc"),
    (12, "badRtc"),
    (13, "badRelay"),
    (14, "onLimit"),
    (15, "freqHi"),
    (16, "freqLo"),
    (17, "freqApv"),
    (30, "callibrationsError"),
    (31, "settingsError"),
];

/// Metric keys requested on every refresh, in request order.
pub const METRIC_KEYS: [&str; 8] = [
    "volt_msr",
    "freq_msr",
    "cur_msr",
    "pows_msr",
    "enrga_msr",
    "enrgs_msr",
    "sys_flag",
    "faul_flag",
];

/// Named view of the device status word.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagSet {
    pub volt_apv: bool,
    pub cur_apv: bool,
    pub pow_apv: bool,
    pub on_delay: bool,
    pub hwrelay_is_on: bool,
    pub event_relay: bool,
    pub user_relay: bool,
    pub holiday_relay: bool,
    pub sync_time_sntp: bool,
    pub sync_time_cloud: bool,
    pub lock_panel: bool,
    pub freq_apv: bool,
    pub wf_sta_en: bool,
    pub wf_sta_got_ip: bool,
    pub wf_ap_en: bool,
    pub wf_ap_got_ip: bool,
    pub web_run: bool,
    pub cloud_run: bool,
    pub sntp_run: bool,
    pub dns_run: bool,
    pub clb_enabled: bool,
}

pub fn decode_flags(raw: u32) -> FlagSet {
    let set = |bit: u32| raw & bit != 0;
    FlagSet {
        volt_apv: set(VOLT_APV),
        cur_apv: set(CUR_APV),
        pow_apv: set(POW_APV),
        on_delay: set(ON_DELAY),
        hwrelay_is_on: set(HWRELAY_IS_ON),
        event_relay: set(EVENT_RELAY),
        user_relay: set(USER_RELAY),
        holiday_relay: set(HOLIDAY_RELAY),
        sync_time_sntp: set(SYNC_TIME_SNTP),
        sync_time_cloud: set(SYNC_TIME_CLOUD),
        lock_panel: set(LOCK_PANEL),
        freq_apv: set(FREQ_APV),
        wf_sta_en: set(WF_STA_EN),
        wf_sta_got_ip: set(WF_STA_GOT_IP),
        wf_ap_en: set(WF_AP_EN),
        wf_ap_got_ip: set(WF_AP_GOT_IP),
        web_run: set(WEB_RUN),
        cloud_run: set(CLOUD_RUN),
        sntp_run: set(SNTP_RUN),
        dns_run: set(DNS_RUN),
        clb_enabled: set(CLB_ENABLED),
    }
}

/// Active faults in ascending bit order, or `None` when no fault bit is set.
pub fn decode_faults(raw: u32) -> Option<Vec<&'static str>> {
    let faults: Vec<&'static str> = FAULTS
        .iter()
        .filter(|(bit, _)| raw & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect();

    if faults.is_empty() {
        None
    } else {
        Some(faults)
    }
}

/// Raw answer to `/all/get` for [`METRIC_KEYS`].
///
/// The status and fault words may arrive signed when bit 31 is set; only
/// their low 32 bits are meaningful.
#[derive(Default, Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub volt_msr: f64,
    pub freq_msr: f64,
    pub cur_msr: f64,
    pub pows_msr: f64,
    pub enrga_msr: f64,
    pub enrgs_msr: f64,
    pub sys_flag: i64,
    pub faul_flag: i64,
}

/// Low 32 bits of a status or fault word, whatever its sign on the wire.
fn word(raw: i64) -> u32 {
    raw as u32
}

/// Relay state, held by the "state" store.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayState {
    pub on: bool,
}

/// Live electrical readings, held by the "status" store.
#[derive(Default, Debug, Clone, PartialEq, Serialize)]
pub struct MeterStatus {
    pub voltage: f64,
    pub current: f64,
    pub frequency: f64,
    pub power: f64,
    pub energy: f64,
    pub faults: Option<Vec<&'static str>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub state: RelayState,
    pub status: MeterStatus,
    pub flags: FlagSet,
}

pub fn decode_snapshot(metrics: &Metrics) -> MetricSnapshot {
    let flags = decode_flags(word(metrics.sys_flag));

    MetricSnapshot {
        state: RelayState {
            on: flags.hwrelay_is_on,
        },
        status: MeterStatus {
            voltage: metrics.volt_msr / 10.0,
            current: metrics.cur_msr / 100.0,
            frequency: metrics.freq_msr / 100.0,
            power: metrics.pows_msr,
            energy: metrics.enrgs_msr,
            faults: decode_faults(word(metrics.faul_flag)),
        },
        flags,
    }
}

/// One entry of the device's historical log, positional fields named.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: i64,
    pub flags: u32,
    pub fault: u32,
    pub voltage: f64,
    pub power: f64,
    pub current: f64,
    pub temperature: f64,
    pub energy: Option<f64>,
}

impl TryFrom<&[Value]> for LogRecord {
    type Error = Error;

    fn try_from(fields: &[Value]) -> Result<Self> {
        if fields.len() < 7 {
            return Err(Error::InvalidRecord(format!(
                "expected at least 7 fields, got {}",
                fields.len()
            )));
        }

        let number = |index: usize| -> Result<f64> {
            fields[index].as_f64().ok_or_else(|| {
                Error::InvalidRecord(format!(
                    "field {index} is not a number: {}",
                    fields[index]
                ))
            })
        };

        let timestamp = number(0)? as i64;
        if DateTime::<Utc>::from_timestamp(timestamp, 0).is_none() {
            return Err(Error::InvalidRecord(format!(
                "timestamp {} is out of range",
                fields[0]
            )));
        }

        Ok(Self {
            timestamp,
            flags: word(number(1)? as i64),
            fault: word(number(2)? as i64),
            voltage: number(3)?,
            power: number(4)?,
            current: number(5)?,
            temperature: number(6)?,
            energy: match fields.get(7) {
                None | Some(Value::Null) => None,
                Some(_) => Some(number(7)?),
            },
        })
    }
}

impl TryFrom<&Value> for LogRecord {
    type Error = Error;

    fn try_from(value: &Value) -> Result<Self> {
        match value.as_array() {
            Some(fields) => Self::try_from(fields.as_slice()),
            None => Err(Error::InvalidRecord(format!("not an array: {value}"))),
        }
    }
}

/// A decoded historical measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub time: DateTime<Utc>,
    pub voltage: f64,
    pub current: f64,
    pub power: String,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    pub fault: Option<Vec<&'static str>>,
}

pub fn decode_log_record(record: &LogRecord) -> Report {
    Report {
        time: DateTime::from_timestamp(record.timestamp, 0).unwrap_or_default(),
        voltage: record.voltage / 10.0,
        current: record.current / 100.0,
        power: format!("{}", record.power.round() as i64),
        temperature: record.temperature / 10.0,
        energy: record.energy.map(|energy| energy / 1000.0),
        fault: decode_faults(record.fault),
    }
}
