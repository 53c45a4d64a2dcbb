//! Stealth browser automation.
//!
//! One lazily-launched Chromium instance per tool, presenting a random but
//! internally consistent fingerprint, driven with human-like input timing,
//! with CAPTCHA detection and third-party solver orchestration.

pub mod captcha;
pub mod fingerprint;
pub mod humanize;
pub mod solvers;
pub mod stealth;
pub mod tool;

pub use fingerprint::Fingerprint;
pub use solvers::{solver_from_config, CaptchaSolver};
pub use tool::BrowserTool;
