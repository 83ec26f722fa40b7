mod channels;

pub use channels::{TransportEvents, TRANSPORT_EVENTS, TRANSPORT_EVENT_DEPTH};

pub const GENERATOR: &str = "meterlink";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_HOSTNAME: &str = "meterlink";
pub const DEFAULT_MIDDLEWARE: &str = "http://volkszaehler.local:80/middleware.php";
pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";
pub const DEFAULT_TZ_OFFSET_MIN: i32 = 60;

pub const NET_TIMEOUT_DEFAULT_MS: u32 = 30_000;
pub const NET_DNS_STEP_DEFAULT_MS: u32 = 10;
pub const HTTPD_PORT_DEFAULT: u16 = 80;

pub const RADIO_JOIN_RETRIES_DEFAULT: u8 = 5;
pub const RADIO_JOIN_TIMEOUT_DEFAULT_MS: u32 = 30_000;
pub const RADIO_RETRY_BACKOFF_DEFAULT_MS: u32 = 1_000;
pub const RADIO_LED_BLINK_DEFAULT_MS: u32 = 10;

pub const SCHED_TICK_DEFAULT_MS: u32 = 1_000;
pub const SCHED_RADIO_OFF_HORIZON_DEFAULT_S: u32 = 30;
pub const SCHED_SEND_INTERVAL_DEFAULT_S: u32 = 0;
pub const SCHED_TIME_RESYNC_DEFAULT_TICKS: u32 = 3_600;
pub const SCHED_STATUS_LOG_DEFAULT_TICKS: u32 = 10;
pub const SCHED_LOW_CLOCK_DIVISOR_DEFAULT: u8 = 3;

pub const UPLOAD_BATCH_MAX: usize = 64;
pub const CHANNEL_BUFFER_MAX: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetPolicy {
    pub timeout_ms: u32,
    pub dns_step_ms: u32,
    pub httpd_port: u16,
    pub httpd_index_enabled: bool,
}

impl NetPolicy {
    pub const fn defaults() -> Self {
        Self {
            timeout_ms: NET_TIMEOUT_DEFAULT_MS,
            dns_step_ms: NET_DNS_STEP_DEFAULT_MS,
            httpd_port: HTTPD_PORT_DEFAULT,
            httpd_index_enabled: true,
        }
    }

    pub const fn sanitized(self) -> Self {
        let timeout_ms = clamp_u32(self.timeout_ms, 1_000, 120_000);
        let mut dns_step_ms = clamp_u32(self.dns_step_ms, 1, 1_000);
        if dns_step_ms > timeout_ms {
            dns_step_ms = timeout_ms;
        }
        let httpd_port = if self.httpd_port == 0 {
            HTTPD_PORT_DEFAULT
        } else {
            self.httpd_port
        };
        Self {
            timeout_ms,
            dns_step_ms,
            httpd_port,
            httpd_index_enabled: self.httpd_index_enabled,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RadioPolicy {
    pub join_retries: u8,
    pub join_timeout_ms: u32,
    pub retry_backoff_ms: u32,
    pub led_blink_ms: u32,
}

impl RadioPolicy {
    pub const fn defaults() -> Self {
        Self {
            join_retries: RADIO_JOIN_RETRIES_DEFAULT,
            join_timeout_ms: RADIO_JOIN_TIMEOUT_DEFAULT_MS,
            retry_backoff_ms: RADIO_RETRY_BACKOFF_DEFAULT_MS,
            led_blink_ms: RADIO_LED_BLINK_DEFAULT_MS,
        }
    }

    pub const fn sanitized(self) -> Self {
        Self {
            join_retries: clamp_u8(self.join_retries, 1, 20),
            join_timeout_ms: clamp_u32(self.join_timeout_ms, 2_000, 180_000),
            retry_backoff_ms: clamp_u32(self.retry_backoff_ms, 0, 30_000),
            led_blink_ms: clamp_u32(self.led_blink_ms, 0, 1_000),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerPolicy {
    pub tick_ms: u32,
    pub radio_off_horizon_s: u32,
    /// Minimum spacing of send windows; 0 sends as soon as data is ready.
    pub send_interval_s: u32,
    pub time_resync_ticks: u32,
    pub status_log_ticks: u32,
    /// 0 keeps the CPU at default speed.
    pub low_clock_divisor: u8,
}

impl SchedulerPolicy {
    pub const fn defaults() -> Self {
        Self {
            tick_ms: SCHED_TICK_DEFAULT_MS,
            radio_off_horizon_s: SCHED_RADIO_OFF_HORIZON_DEFAULT_S,
            send_interval_s: SCHED_SEND_INTERVAL_DEFAULT_S,
            time_resync_ticks: SCHED_TIME_RESYNC_DEFAULT_TICKS,
            status_log_ticks: SCHED_STATUS_LOG_DEFAULT_TICKS,
            low_clock_divisor: SCHED_LOW_CLOCK_DIVISOR_DEFAULT,
        }
    }

    pub const fn sanitized(self) -> Self {
        Self {
            tick_ms: clamp_u32(self.tick_ms, 100, 60_000),
            radio_off_horizon_s: clamp_u32(self.radio_off_horizon_s, 0, 86_400),
            send_interval_s: clamp_u32(self.send_interval_s, 0, 86_400),
            time_resync_ticks: clamp_u32(self.time_resync_ticks, 1, u32::MAX),
            status_log_ticks: clamp_u32(self.status_log_ticks, 1, 86_400),
            low_clock_divisor: clamp_u8(self.low_clock_divisor, 0, 16),
        }
    }
}

/// Build-time settings. Everything except the WiFi credentials has a default.
#[derive(Clone, Copy, Debug)]
pub struct BuildSettings {
    pub wifi_ssid: Option<&'static str>,
    pub wifi_password: &'static str,
    pub hostname: &'static str,
    pub middleware: &'static str,
    pub ntp_server: &'static str,
    pub tz_offset_min: i32,
    pub channel_uuids: &'static str,
}

impl BuildSettings {
    pub fn from_env() -> Self {
        Self {
            wifi_ssid: option_env!("METERLINK_WIFI_SSID"),
            wifi_password: option_env!("METERLINK_WIFI_PASSWORD").unwrap_or(""),
            hostname: option_env!("METERLINK_HOSTNAME").unwrap_or(DEFAULT_HOSTNAME),
            middleware: option_env!("METERLINK_MIDDLEWARE").unwrap_or(DEFAULT_MIDDLEWARE),
            ntp_server: option_env!("METERLINK_NTP_SERVER").unwrap_or(DEFAULT_NTP_SERVER),
            tz_offset_min: parse_i32_or(
                option_env!("METERLINK_TZ_OFFSET_MIN"),
                DEFAULT_TZ_OFFSET_MIN,
            ),
            channel_uuids: option_env!("METERLINK_CHANNEL_UUIDS").unwrap_or(""),
        }
    }

    /// UUID for the n-th configured source, if one was provided.
    pub fn channel_uuid(&self, index: usize) -> Option<&'static str> {
        self.channel_uuids
            .split(',')
            .map(str::trim)
            .filter(|uuid| !uuid.is_empty())
            .nth(index)
    }
}

fn parse_i32_or(value: Option<&str>, default: i32) -> i32 {
    value
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

const fn clamp_u32(value: u32, min: u32, max: u32) -> u32 {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

const fn clamp_u8(value: u8, min: u8, max: u8) -> u8 {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}
