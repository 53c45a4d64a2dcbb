//! CAPTCHA detection and token injection, both evaluated in-page.

use serde::Deserialize;

/// What kind of challenge is on the page.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaKind {
    RecaptchaV2,
    RecaptchaV3,
    Hcaptcha,
    Turnstile,
}

impl CaptchaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptchaKind::RecaptchaV2 => "recaptcha_v2",
            CaptchaKind::RecaptchaV3 => "recaptcha_v3",
            CaptchaKind::Hcaptcha => "hcaptcha",
            CaptchaKind::Turnstile => "turnstile",
        }
    }
}

/// Detection result returned by [`DETECT_SCRIPT`].
#[derive(Clone, Debug, Deserialize)]
pub struct CaptchaInfo {
    #[serde(rename = "type")]
    pub kind: CaptchaKind,
    pub sitekey: String,
    pub page_url: String,
    /// reCAPTCHA v3 action, when one is declared on the page.
    #[serde(default)]
    pub action: Option<String>,
}

/// In-page detection. Returns `{type, sitekey, page_url, action?}` or null.
///
/// Checks, in order: reCAPTCHA v2 (iframe src or `.g-recaptcha` widget,
/// demoted to v3 when the widget is invisible or a `render=` script is
/// present), hCaptcha, Cloudflare Turnstile.
pub const DETECT_SCRIPT: &str = r#"
(() => {
    const pageUrl = window.location.href;

    // reCAPTCHA
    const recaptchaFrame = document.querySelector('iframe[src*="recaptcha"]');
    const recaptchaWidget = document.querySelector('.g-recaptcha[data-sitekey]');
    if (recaptchaFrame || recaptchaWidget) {
        let sitekey = recaptchaWidget ? recaptchaWidget.getAttribute('data-sitekey') : null;
        if (!sitekey && recaptchaFrame) {
            const m = (recaptchaFrame.src || '').match(/[?&]k=([^&]+)/);
            if (m) sitekey = m[1];
        }
        if (sitekey) {
            const invisible = recaptchaWidget
                && recaptchaWidget.getAttribute('data-size') === 'invisible';
            const renderScript = Array.from(document.scripts)
                .some(s => (s.src || '').includes('recaptcha/api.js?render='));
            if (invisible || renderScript) {
                let action = null;
                const actionEl = document.querySelector('[data-action]');
                if (actionEl) action = actionEl.getAttribute('data-action');
                return { type: 'recaptcha_v3', sitekey, page_url: pageUrl, action };
            }
            return { type: 'recaptcha_v2', sitekey, page_url: pageUrl, action: null };
        }
    }

    // hCaptcha
    const hcaptchaFrame = document.querySelector('iframe[src*="hcaptcha"]');
    const hcaptchaWidget = document.querySelector('[data-hcaptcha-sitekey], .h-captcha[data-sitekey]');
    if (hcaptchaFrame || hcaptchaWidget) {
        let sitekey = null;
        if (hcaptchaWidget) {
            sitekey = hcaptchaWidget.getAttribute('data-hcaptcha-sitekey')
                || hcaptchaWidget.getAttribute('data-sitekey');
        }
        if (!sitekey && hcaptchaFrame) {
            const m = (hcaptchaFrame.src || '').match(/sitekey=([^&]+)/);
            if (m) sitekey = m[1];
        }
        if (sitekey) {
            return { type: 'hcaptcha', sitekey, page_url: pageUrl, action: null };
        }
    }

    // Cloudflare Turnstile
    const turnstile = document.querySelector('.cf-turnstile');
    if (turnstile) {
        const sitekey = turnstile.getAttribute('data-sitekey');
        if (sitekey) {
            return { type: 'turnstile', sitekey, page_url: pageUrl, action: null };
        }
    }

    return null;
})()
"#;

/// Build the injection script for a solved token.
///
/// Sets the hidden response fields, fires an `input` event, walks
/// `window.___grecaptcha_cfg.clients` (depth ≤ 5) to invoke the
/// site-provided callback, then attempts a form submission.
pub fn inject_script(token: &str) -> String {
    let escaped = token.replace('\\', "\\\\").replace('\'', "\\'");
    format!(
        r#"
(() => {{
    const token = '{escaped}';
    let touched = false;

    for (const selector of ['#g-recaptcha-response', 'textarea[name="g-recaptcha-response"]',
                            '[name="h-captcha-response"]', '[name="cf-turnstile-response"]']) {{
        for (const el of document.querySelectorAll(selector)) {{
            el.style.display = 'block';
            el.value = token;
            el.dispatchEvent(new Event('input', {{ bubbles: true }}));
            el.style.display = 'none';
            touched = true;
        }}
    }}

    // Locate and invoke the site-provided success callback.
    const visit = (obj, depth) => {{
        if (!obj || depth > 5) return false;
        if (typeof obj === 'function') return false;
        for (const key of Object.keys(obj)) {{
            let val;
            try {{ val = obj[key]; }} catch (e) {{ continue; }}
            if (key === 'callback' && typeof val === 'function') {{
                try {{ val(token); return true; }} catch (e) {{ }}
            }}
            if (val && typeof val === 'object') {{
                if (visit(val, depth + 1)) return true;
            }}
        }}
        return false;
    }};
    let invoked = false;
    if (window.___grecaptcha_cfg && window.___grecaptcha_cfg.clients) {{
        invoked = visit(window.___grecaptcha_cfg.clients, 0);
    }}

    // Last resort: submit the enclosing form.
    if (!invoked) {{
        const field = document.querySelector('#g-recaptcha-response, [name="h-captcha-response"], [name="cf-turnstile-response"]');
        const form = field ? field.closest('form') : document.querySelector('form');
        if (form) {{
            try {{ form.submit(); }} catch (e) {{ }}
        }}
    }}

    return {{ touched, invoked }};
}})()
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_script_covers_all_kinds() {
        for needle in [
            "iframe[src*=\"recaptcha\"]",
            ".g-recaptcha[data-sitekey]",
            "data-size",
            "render=",
            "hcaptcha",
            "cf-turnstile",
        ] {
            assert!(DETECT_SCRIPT.contains(needle), "detection missing {needle}");
        }
    }

    #[test]
    fn test_detection_result_deserializes() {
        let json = r#"{"type":"recaptcha_v3","sitekey":"6Lc-abc","page_url":"https://x.test/","action":"login"}"#;
        let info: CaptchaInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.kind, CaptchaKind::RecaptchaV3);
        assert_eq!(info.sitekey, "6Lc-abc");
        assert_eq!(info.action.as_deref(), Some("login"));
    }

    #[test]
    fn test_detection_result_no_action() {
        let json = r#"{"type":"turnstile","sitekey":"0x4AAA","page_url":"https://x.test/"}"#;
        let info: CaptchaInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.kind, CaptchaKind::Turnstile);
        assert!(info.action.is_none());
    }

    #[test]
    fn test_inject_script_embeds_token_and_targets() {
        let script = inject_script("tok-123");
        assert!(script.contains("'tok-123'"));
        for needle in [
            "#g-recaptcha-response",
            "h-captcha-response",
            "cf-turnstile-response",
            "___grecaptcha_cfg",
            "new Event('input'",
            "form.submit()",
        ] {
            assert!(script.contains(needle), "injection missing {needle}");
        }
    }

    #[test]
    fn test_inject_script_escapes_quotes() {
        let script = inject_script("to'k");
        assert!(script.contains("'to\\'k'"));
    }

    #[test]
    fn test_kind_as_str() {
        assert_eq!(CaptchaKind::RecaptchaV2.as_str(), "recaptcha_v2");
        assert_eq!(CaptchaKind::Hcaptcha.as_str(), "hcaptcha");
    }
}
