//! Coarse `User-Agent` classification: browser family and version, OS family, device class.

use regex::Regex;
use std::sync::LazyLock;

static BOT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(bot|crawler|spider|curl|wget|python-requests|httpclient|go-http-client)").ok()
});

// Order matters: Edge and Opera also advertise Chrome, Chrome also advertises Safari.
static BROWSERS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("Edge", r"Edg(?:e|A|iOS)?/([\d.]+)"),
        ("Opera", r"(?:OPR|Opera)/([\d.]+)"),
        ("Firefox", r"(?:Firefox|FxiOS)/([\d.]+)"),
        ("Chrome", r"(?:Chrome|CriOS)/([\d.]+)"),
        ("Safari", r"Version/([\d.]+).*Safari/"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (name, re)))
    .collect()
});

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub device: String,
}

#[must_use]
pub fn parse(user_agent: &str) -> UserAgentInfo {
    let os = detect_os(user_agent);

    if let Some(bot) = BOT
        .as_ref()
        .and_then(|re| re.captures(user_agent))
        .and_then(|caps| caps.get(1))
    {
        let family = user_agent
            .split('/')
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty() && !name.contains(' ') && *name != "Mozilla")
            .unwrap_or(bot.as_str());
        return UserAgentInfo {
            browser: Some(family.to_string()),
            browser_version: None,
            os,
            device: "bot".to_string(),
        };
    }

    let (browser, browser_version) = BROWSERS
        .iter()
        .find_map(|(name, re)| {
            re.captures(user_agent).map(|caps| {
                (
                    Some((*name).to_string()),
                    caps.get(1).map(|m| m.as_str().to_string()),
                )
            })
        })
        .unwrap_or((None, None));

    let device = detect_device(user_agent, os.as_deref()).to_string();

    UserAgentInfo {
        browser,
        browser_version,
        os,
        device,
    }
}

fn detect_os(user_agent: &str) -> Option<String> {
    let os = if user_agent.contains("Windows NT") {
        "Windows"
    } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        "iOS"
    } else if user_agent.contains("Android") {
        "Android"
    } else if user_agent.contains("CrOS") {
        "ChromeOS"
    } else if user_agent.contains("Mac OS X") || user_agent.contains("Macintosh") {
        "macOS"
    } else if user_agent.contains("Linux") {
        "Linux"
    } else {
        return None;
    };
    Some(os.to_string())
}

fn detect_device(user_agent: &str, os: Option<&str>) -> &'static str {
    if user_agent.contains("iPad") || user_agent.contains("Tablet") {
        return "tablet";
    }
    if os == Some("Android") && !user_agent.contains("Mobile") {
        return "tablet";
    }
    if user_agent.contains("Mobi") || user_agent.contains("iPhone") {
        return "mobile";
    }
    match os {
        Some("Windows" | "macOS" | "Linux" | "ChromeOS") => "desktop",
        _ => "other",
    }
}
