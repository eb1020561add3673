use std::fmt;
use std::str::FromStr;

use rand::prelude::IndexedRandom;
use serde::{Deserialize, Serialize};

/// `--user-agent` 的取值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAgentKind {
    Random,
    Chrome,
    Firefox,
    Safari,
}

impl FromStr for UserAgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(UserAgentKind::Random),
            "chrome" => Ok(UserAgentKind::Chrome),
            "firefox" => Ok(UserAgentKind::Firefox),
            "safari" => Ok(UserAgentKind::Safari),
            other => Err(format!("unknown user agent: {other}")),
        }
    }
}

impl fmt::Display for UserAgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserAgentKind::Random => "random",
            UserAgentKind::Chrome => "chrome",
            UserAgentKind::Firefox => "firefox",
            UserAgentKind::Safari => "safari",
        };
        write!(f, "{s}")
    }
}

const WINDOWS: &[&str] = &["Windows NT 10.0; Win64; x64"];

const MACOS: &[&str] = &[
    "Macintosh; Intel Mac OS X 13_0",
    "Macintosh; Intel Mac OS X 12_6",
    "Macintosh; Intel Mac OS X 10_15_7",
];

const LINUX: &[&str] = &["X11; Linux x86_64"];

const CHROME: &[&str] = &[
    "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/106.0.0.0 Safari/537.36",
    "Mozilla/5.0 ({}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/105.0.0.0 Safari/537.36",
];

const FIREFOX: &[&str] = &[
    "Mozilla/5.0 ({}; rv:106.0) Gecko/20100101 Firefox/106.0",
    "Mozilla/5.0 ({}; rv:105.0) Gecko/20100101 Firefox/105.0",
];

const SAFARI: &[&str] = &[
    "Mozilla/5.0 ({}) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Safari/605.1.15",
    "Mozilla/5.0 ({}) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.5 Safari/605.1.15",
];

/// 生成一条浏览器 User-Agent。Safari 只配 macOS 平台串。
pub fn generate(kind: UserAgentKind) -> String {
    let mut rng = rand::rng();

    let kind = if kind == UserAgentKind::Random {
        *[UserAgentKind::Chrome, UserAgentKind::Firefox, UserAgentKind::Safari]
            .choose(&mut rng)
            .unwrap()
    } else {
        kind
    };

    let desktop: Vec<&str> = WINDOWS.iter().chain(MACOS).chain(LINUX).copied().collect();
    let (template, platform) = match kind {
        UserAgentKind::Chrome => (CHROME.choose(&mut rng), desktop.choose(&mut rng)),
        UserAgentKind::Firefox => (FIREFOX.choose(&mut rng), desktop.choose(&mut rng)),
        _ => (SAFARI.choose(&mut rng), MACOS.choose(&mut rng)),
    };

    template.unwrap().replace("{}", platform.unwrap())
}
