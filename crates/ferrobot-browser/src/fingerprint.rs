//! Session fingerprint — the identity a browser session presents.
//!
//! Chosen once per session from closed sets so every surface (UA header,
//! client hints, screen metrics, timezone) stays internally consistent.

use rand::seq::SliceRandom;
use rand::Rng;

/// A user-agent triple: UA string, matching `Sec-CH-UA` value, platform.
#[derive(Clone, Copy, Debug)]
pub struct UaProfile {
    pub user_agent: &'static str,
    pub sec_ch_ua: &'static str,
    pub platform: &'static str,
}

/// Consistent UA/client-hint/platform triples.
const UA_PROFILES: &[UaProfile] = &[
    UaProfile {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
        sec_ch_ua: "\"Chromium\";v=\"122\", \"Not(A:Brand\";v=\"24\", \"Google Chrome\";v=\"122\"",
        platform: "macOS",
    },
    UaProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
        sec_ch_ua: "\"Chromium\";v=\"122\", \"Not(A:Brand\";v=\"24\", \"Google Chrome\";v=\"122\"",
        platform: "Windows",
    },
    UaProfile {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
        sec_ch_ua: "\"Chromium\";v=\"122\", \"Not(A:Brand\";v=\"24\", \"Google Chrome\";v=\"122\"",
        platform: "Linux",
    },
    UaProfile {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
        sec_ch_ua: "\"Chromium\";v=\"121\", \"Not A(Brand\";v=\"99\", \"Google Chrome\";v=\"121\"",
        platform: "macOS",
    },
    UaProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
        sec_ch_ua: "\"Chromium\";v=\"121\", \"Not A(Brand\";v=\"99\", \"Google Chrome\";v=\"121\"",
        platform: "Windows",
    },
];

/// Common desktop viewports.
const VIEWPORTS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (1280, 800),
    (1600, 900),
];

/// Plausible end-user timezones (US east/central/west, London, Paris).
const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Los_Angeles",
    "Europe/London",
    "Europe/Paris",
];

/// Weighted: most sessions are 1x, some Retina.
const DEVICE_SCALES: &[f64] = &[1.0, 1.0, 1.0, 2.0];

/// Weighted: most sessions prefer light mode.
const COLOR_SCHEMES: &[&str] = &["light", "light", "light", "dark"];

/// The randomly-chosen identity a browser session presents.
#[derive(Clone, Debug)]
pub struct Fingerprint {
    pub user_agent: String,
    pub sec_ch_ua: String,
    pub platform: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub timezone: String,
    pub device_scale: f64,
    pub color_scheme: String,
}

impl Fingerprint {
    /// Pick a random fingerprint from the closed sets.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let ua = UA_PROFILES.choose(&mut rng).expect("non-empty UA set");
        let (width, height) = *VIEWPORTS.choose(&mut rng).expect("non-empty viewport set");

        Self {
            user_agent: ua.user_agent.to_string(),
            sec_ch_ua: ua.sec_ch_ua.to_string(),
            platform: ua.platform.to_string(),
            viewport_width: width,
            viewport_height: height,
            timezone: TIMEZONES.choose(&mut rng).expect("non-empty tz set").to_string(),
            device_scale: *DEVICE_SCALES.choose(&mut rng).expect("non-empty scale set"),
            color_scheme: COLOR_SCHEMES
                .choose(&mut rng)
                .expect("non-empty scheme set")
                .to_string(),
        }
    }

    /// A small jittered offset inside the viewport, for cursor start points.
    pub fn random_point_in_viewport(&self) -> (f64, f64) {
        let mut rng = rand::thread_rng();
        (
            rng.gen_range(0.0..self.viewport_width as f64),
            rng.gen_range(0.0..self.viewport_height as f64),
        )
    }
}
