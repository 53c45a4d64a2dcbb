//! Platform credit precheck — gates LM usage per user.
//!
//! `GET {platform_url}/api/internal/credit-check/{user_id}` must return
//! `{"ok": true}` within 3 seconds for the message to proceed. Fail-closed:
//! any timeout, non-200, non-JSON body, or `ok != true` blocks the message.

use std::time::Duration;

use tracing::warn;

/// Timeout for the credit-check HTTP call.
const CREDIT_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of the credit precheck.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreditVerdict {
    /// Credits available, proceed to the LM.
    Ok,
    /// The platform reported `ok: false`.
    Exhausted,
    /// The check could not be evaluated (timeout, bad status, bad body).
    Unverified,
}

/// Run the credit precheck against the platform.
pub async fn check(platform_url: &str, user_id: &str) -> CreditVerdict {
    let url = format!(
        "{}/api/internal/credit-check/{}",
        platform_url.trim_end_matches('/'),
        user_id
    );

    let client = match reqwest::Client::builder().timeout(CREDIT_CHECK_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "credit check: failed to build client (blocking message)");
            return CreditVerdict::Unverified;
        }
    };

    let resp = match client.get(&url).header("Accept", "application/json").send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "credit check failed (blocking message)");
            return CreditVerdict::Unverified;
        }
    };

    if !resp.status().is_success() {
        warn!(status = %resp.status(), "credit check returned non-success (blocking message)");
        return CreditVerdict::Unverified;
    }

    let body: serde_json::Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "credit check returned non-JSON (blocking message)");
            return CreditVerdict::Unverified;
        }
    };

    if body["ok"].as_bool() == Some(true) {
        CreditVerdict::Ok
    } else {
        warn!(user_id = %user_id, "credits exhausted");
        CreditVerdict::Exhausted
    }
}
