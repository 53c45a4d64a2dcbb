//! The stealth script installed before any page script runs.
//!
//! Installed via the CDP pre-navigation hook (`Page.addScriptToEvaluateOnNewDocument`)
//! so it executes ahead of fingerprinting code on every page and iframe.

use crate::fingerprint::Fingerprint;

/// Static portion of the stealth script. Reads session-specific values from
/// the `__fbfp` object defined by the prelude.
const STEALTH_BODY: &str = r#"
(() => {
    const fp = window.__fbfp || { width: 1920, height: 1080, scale: 1, scheme: 'light' };
    delete window.__fbfp;

    // navigator.webdriver must read as undefined.
    Object.defineProperty(Object.getPrototypeOf(navigator), 'webdriver', {
        get: () => undefined,
        configurable: true
    });

    // Headless Chrome lacks the chrome object entirely.
    if (!window.chrome) {
        window.chrome = {
            runtime: {},
            loadTimes: function() { return {}; },
            csi: function() { return {}; },
            app: { isInstalled: false }
        };
    }

    // A plausible plugin list (headless reports zero plugins).
    const fakePlugins = [
        { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
        { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
        { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
    ];
    Object.defineProperty(navigator, 'plugins', {
        get: () => {
            const arr = fakePlugins.map(p => ({ ...p, length: 1 }));
            arr.item = i => arr[i] || null;
            arr.namedItem = n => arr.find(p => p.name === n) || null;
            arr.refresh = () => {};
            return arr;
        }
    });

    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en']
    });

    // WebGL vendor/renderer strings that match consumer hardware.
    const getParameter = WebGLRenderingContext.prototype.getParameter;
    WebGLRenderingContext.prototype.getParameter = function(parameter) {
        if (parameter === 37445) return 'Intel Inc.';
        if (parameter === 37446) return 'Intel Iris OpenGL Engine';
        return getParameter.apply(this, arguments);
    };

    // The notifications permission probe: headless answers 'denied' for
    // 'default' state, which is a classic tell.
    const originalQuery = window.navigator.permissions.query;
    window.navigator.permissions.query = (parameters) =>
        parameters.name === 'notifications'
            ? Promise.resolve({ state: Notification.permission })
            : originalQuery(parameters);

    // Network Information API.
    if (!navigator.connection) {
        Object.defineProperty(navigator, 'connection', {
            get: () => ({ effectiveType: '4g', rtt: 50, downlink: 10, saveData: false })
        });
    }

    // Screen metrics aligned with the viewport.
    Object.defineProperty(screen, 'width', { get: () => fp.width });
    Object.defineProperty(screen, 'height', { get: () => fp.height });
    Object.defineProperty(screen, 'availWidth', { get: () => fp.width });
    Object.defineProperty(screen, 'availHeight', { get: () => fp.height - 40 });
    Object.defineProperty(screen, 'colorDepth', { get: () => 24 });
    Object.defineProperty(screen, 'pixelDepth', { get: () => 24 });
    Object.defineProperty(window, 'devicePixelRatio', { get: () => fp.scale });

    Object.defineProperty(navigator, 'deviceMemory', { get: () => 8 });
    Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 8 });
    Object.defineProperty(navigator, 'maxTouchPoints', { get: () => 0 });

    // Battery API: a charging battery at a believable level.
    if (navigator.getBattery) {
        navigator.getBattery = () => Promise.resolve({
            charging: true,
            chargingTime: 0,
            dischargingTime: Infinity,
            level: 0.87,
            addEventListener: () => {},
            removeEventListener: () => {},
            dispatchEvent: () => true
        });
    }

    // Hidden-iframe detection: contentWindow of a sandboxed iframe should
    // look like a regular window.
    try {
        const frameDescriptor = Object.getOwnPropertyDescriptor(HTMLIFrameElement.prototype, 'contentWindow');
        Object.defineProperty(HTMLIFrameElement.prototype, 'contentWindow', {
            get: function() {
                const win = frameDescriptor.get.call(this);
                if (win) return win;
                return window;
            }
        });
    } catch (e) { /* frame trap best-effort */ }
})();
"#;

/// Build the full stealth script for a fingerprint.
pub fn stealth_script(fp: &Fingerprint) -> String {
    let prelude = format!(
        "window.__fbfp = {{ width: {}, height: {}, scale: {}, scheme: '{}' }};",
        fp.viewport_width, fp.viewport_height, fp.device_scale, fp.color_scheme
    );
    format!("{prelude}\n{STEALTH_BODY}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp() -> Fingerprint {
        Fingerprint {
            user_agent: "ua".into(),
            sec_ch_ua: "ch".into(),
            platform: "macOS".into(),
            viewport_width: 1440,
            viewport_height: 900,
            timezone: "Europe/Paris".into(),
            device_scale: 2.0,
            color_scheme: "dark".into(),
        }
    }

    #[test]
    fn test_script_embeds_fingerprint_values() {
        let script = stealth_script(&fp());
        assert!(script.contains("width: 1440"));
        assert!(script.contains("height: 900"));
        assert!(script.contains("scale: 2"));
        assert!(script.contains("scheme: 'dark'"));
    }

    #[test]
    fn test_script_covers_required_patches() {
        let script = stealth_script(&fp());
        for needle in [
            "webdriver",
            "window.chrome",
            "plugins",
            "languages",
            "getParameter",           // WebGL
            "permissions.query",
            "connection",
            "deviceMemory",
            "hardwareConcurrency",
            "maxTouchPoints",
            "getBattery",
            "contentWindow",          // iframe trap
            "devicePixelRatio",
        ] {
            assert!(script.contains(needle), "stealth script missing {needle}");
        }
    }
}
