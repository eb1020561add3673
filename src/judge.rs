//! 判定站响应解析。
//!
//! AZenv 风格页面把请求环境按 `KEY = value` 逐行回显，这里把它解析成
//! 结构化记录。解析对字段顺序、空白和简单 HTML 标签不敏感；缺少
//! `REMOTE_ADDR` 视为响应损坏。

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// 出口 IP 可能藏身的转发头（AZenv 的 CGI 变量名形式）。
pub const FORWARDING_KEYS: [&str; 6] = [
    "HTTP_VIA",
    "HTTP_X_FORWARDED_FOR",
    "HTTP_FORWARDED",
    "HTTP_FORWARDED_FOR",
    "HTTP_CLIENT_IP",
    "HTTP_X_CLUSTER_CLIENT_IP",
];

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag regex"));

/// 判定站一次响应的解析结果。键统一成大写，值去掉首尾空白。
#[derive(Debug, Clone)]
pub struct JudgeReport {
    headers: HashMap<String, String>,
}

impl JudgeReport {
    /// 解析响应正文。提不出 `REMOTE_ADDR` 时返回错误，
    /// 上层把它映射成 BAD_RESPONSE。
    pub fn parse(body: &str) -> Result<Self, String> {
        let text = TAG_RE.replace_all(body, "\n");
        let mut headers = HashMap::new();

        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                continue;
            }
            // 同名键保留第一次出现的值
            headers.entry(key).or_insert_with(|| value.to_owned());
        }

        let report = Self { headers };
        if report.remote_addr().is_none() {
            return Err("REMOTE_ADDR not found in judge response".into());
        }
        Ok(report)
    }

    /// 判定站观察到的客户端地址。
    pub fn remote_addr(&self) -> Option<&str> {
        self.headers.get("REMOTE_ADDR").map(String::as_str)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("HTTP_USER_AGENT").map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_uppercase()).map(String::as_str)
    }

    /// 在 REMOTE_ADDR 与所有转发头里找给定 IP，命中即代理暴露了真实出口。
    /// 返回命中的键与值，供诊断信息使用。
    pub fn reveals(&self, local_ip: &str) -> Option<(&str, &str)> {
        if let Some(addr) = self.remote_addr() {
            if addr.contains(local_ip) {
                return Some(("REMOTE_ADDR", addr));
            }
        }
        for key in FORWARDING_KEYS {
            if let Some(value) = self.headers.get(key) {
                if value.contains(local_ip) {
                    return Some((key, value));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AZENV_BODY: &str = "\
REMOTE_ADDR = 9.9.9.9
REMOTE_PORT = 51234
REQUEST_METHOD = GET
HTTP_USER_AGENT = Mozilla/5.0 (X11; Linux x86_64) test
HTTP_ACCEPT = text/html
";

    #[test]
    fn test_parse_extracts_remote_addr() {
        let report = JudgeReport::parse(AZENV_BODY).unwrap();
        assert_eq!(report.remote_addr(), Some("9.9.9.9"));
        assert_eq!(report.get("remote_port"), Some("51234"));
        assert!(report.user_agent().unwrap().starts_with("Mozilla/5.0"));
    }

    #[test]
    fn test_parse_tolerates_html_and_reordering() {
        let body = "<html><body><pre>HTTP_HOST = judge.example</pre>\
                    <pre>REMOTE_ADDR   =   10.1.2.3</pre></body></html>";
        let report = JudgeReport::parse(body).unwrap();
        assert_eq!(report.remote_addr(), Some("10.1.2.3"));
        assert_eq!(report.get("HTTP_HOST"), Some("judge.example"));
    }

    #[test]
    fn test_parse_missing_remote_addr_is_error() {
        assert!(JudgeReport::parse("HTTP_VIA = squid").is_err());
        assert!(JudgeReport::parse("").is_err());
    }

    #[test]
    fn test_reveals_in_forwarding_header() {
        let body = "REMOTE_ADDR = 9.9.9.9\nHTTP_X_FORWARDED_FOR = 7.7.7.7\n";
        let report = JudgeReport::parse(body).unwrap();

        let (key, value) = report.reveals("7.7.7.7").unwrap();
        assert_eq!(key, "HTTP_X_FORWARDED_FOR");
        assert_eq!(value, "7.7.7.7");
        assert!(report.reveals("8.8.8.8").is_none());
    }

    #[test]
    fn test_reveals_in_remote_addr() {
        let body = "REMOTE_ADDR = 7.7.7.7\n";
        let report = JudgeReport::parse(body).unwrap();
        assert_eq!(report.reveals("7.7.7.7").unwrap().0, "REMOTE_ADDR");
    }

    #[test]
    fn test_case_variants_are_normalized() {
        let body = "remote_addr = 1.1.1.1\nHttp_Via = cache1\n";
        let report = JudgeReport::parse(body).unwrap();
        assert_eq!(report.remote_addr(), Some("1.1.1.1"));
        assert_eq!(report.reveals("cache1").map(|(k, _)| k), Some("HTTP_VIA"));
    }
}
