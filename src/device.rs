//! Device-class upstream selection from the User-Agent string

/// User-agent fragments that classify a client as mobile.
const MOBILE_SIGNATURES: &[&str] = &[
    "Android",
    "iPhone",
    "iPad",
    "iPod",
    "Windows Phone",
    "SymbianOS",
];

/// Chooses the upstream host for a request based on its device class.
pub struct UpstreamSelector {
    desktop: String,
    mobile: String,
}

impl UpstreamSelector {
    pub fn new(desktop: String, mobile: String) -> Self {
        Self { desktop, mobile }
    }

    /// Absent or empty user-agent counts as desktop.
    pub fn select(&self, user_agent: Option<&str>) -> &str {
        match user_agent {
            Some(ua) if is_mobile(ua) => &self.mobile,
            _ => &self.desktop,
        }
    }
}

fn is_mobile(user_agent: &str) -> bool {
    MOBILE_SIGNATURES.iter().any(|sig| user_agent.contains(sig))
}
