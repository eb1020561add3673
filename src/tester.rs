//! 测试器：对单个 (端点, 协议) 执行有序探测链并给出结论。
//!
//! 探测链：国家门禁 → 可达性（带重试与退避）→ 匿名性（可选）→ 延迟。
//! 默认任一步失败即短路；`--tester-force` 时继续执行并记录最差结论。
//! 测试器只发网络流量，从不写存储；内部故障一律折叠为 INTERNAL_ERROR。

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::common::useragent;
use crate::common::utils::{backoff_delay, find_ip_address};
use crate::geo::CountryResolver;
use crate::judge::JudgeReport;
use crate::model::{AppConfig, Proxy, TestOutcome, Verdict};

/// 判定站返回这些状态码视为代理被封。
const STATUS_BANLIST: [u16; 2] = [403, 409];

pub struct TestHarness {
    pub judge_url: String,
    pub local_ip: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub retries: u32,
    pub backoff_factor: f64,
    pub test_anonymity: bool,
    pub force: bool,
    pub ignore_countries: Vec<String>,
    pub geo: CountryResolver,
}

/// 探测过程中的累积状态，最终折叠成一个 [`Verdict`]。
#[derive(Default)]
struct Battery {
    outcomes: Vec<(TestOutcome, String)>,
    latency_ms: Option<u32>,
    country: Option<String>,
    anonymous: Option<bool>,
    banned: bool,
}

impl Battery {
    fn push(&mut self, outcome: TestOutcome, info: impl Into<String>) {
        self.outcomes.push((outcome, info.into()));
    }

    fn failed(&self) -> bool {
        !self.outcomes.is_empty()
    }

    /// 折叠为最终结论：没有失败记录即 OK，否则取严重程度最高的一条。
    fn finish(self, started_at: chrono::NaiveDateTime) -> Verdict {
        let (outcome, info) = match self.outcomes.into_iter().max_by_key(|(o, _)| o.severity()) {
            Some(worst) => worst,
            None => {
                let info =
                    if self.anonymous == Some(true) { "anonymous proxy" } else { "reachable" };
                (TestOutcome::Ok, info.to_owned())
            }
        };
        Verdict {
            outcome,
            latency_ms: self.latency_ms,
            country: self.country,
            anonymous: self.anonymous,
            info,
            started_at,
            finished_at: Utc::now().naive_utc(),
            banned: self.banned,
        }
    }
}

impl TestHarness {
    pub fn from_config(config: &AppConfig, local_ip: String, geo: CountryResolver) -> Self {
        Self {
            judge_url: config.proxy_judge.clone(),
            local_ip,
            user_agent: useragent::generate(config.user_agent),
            timeout: config.tester_timeout(),
            retries: config.tester.retries,
            backoff_factor: config.tester.backoff_factor,
            test_anonymity: config.manager.test_anonymity,
            force: config.tester.force,
            ignore_countries: config.proxy.ignore_countries.clone(),
            geo,
        }
    }

    /// 跑完整条探测链。实现故障不外传，折叠成 INTERNAL_ERROR 结论。
    pub async fn run(&self, proxy: &Proxy) -> Verdict {
        let started_at = Utc::now().naive_utc();
        match self.run_battery(proxy, started_at).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("测试器内部错误 {}：{e:#}", proxy.url(false));
                let mut verdict = Verdict::new(TestOutcome::InternalError, e.to_string(), started_at);
                verdict.finished_at = Utc::now().naive_utc();
                verdict
            }
        }
    }

    async fn run_battery(
        &self,
        proxy: &Proxy,
        started_at: chrono::NaiveDateTime,
    ) -> Result<Verdict> {
        let mut battery = Battery::default();

        // 1. 国家门禁
        battery.country = self.geo.lookup(proxy.addr());
        if let Some(cc) = battery.country.clone() {
            if self.ignore_countries.iter().any(|i| i.eq_ignore_ascii_case(&cc)) {
                battery.push(TestOutcome::ForbiddenCountry, format!("ignored country: {cc}"));
                if !self.force {
                    return Ok(battery.finish(started_at));
                }
            }
        }

        // 2. 可达性
        let body = self.probe_reachability(proxy, &mut battery).await?;
        if battery.failed() && !self.force {
            return Ok(battery.finish(started_at));
        }

        // 3. 匿名性
        if self.test_anonymity {
            if let Some(body) = &body {
                self.analyze_judge(body, &mut battery);
            }
        }

        Ok(battery.finish(started_at))
    }

    /// 经由代理请求判定站。成功返回响应正文，失败把原因记入 battery。
    /// 延迟取成功请求耗时的中位数。
    async fn probe_reachability(
        &self,
        proxy: &Proxy,
        battery: &mut Battery,
    ) -> Result<Option<String>> {
        let client = self.build_client(proxy)?;
        let mut latencies: Vec<Duration> = Vec::new();
        let mut last_failure: Option<(TestOutcome, String)> = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.backoff_factor, attempt)).await;
            }

            let start = Instant::now();
            match client.get(&self.judge_url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if STATUS_BANLIST.contains(&status.as_u16()) {
                        battery.banned = true;
                        battery.push(
                            TestOutcome::BadResponse,
                            format!("banned status code: {status}"),
                        );
                        return Ok(None);
                    }
                    if !status.is_success() {
                        last_failure = Some((
                            TestOutcome::BadResponse,
                            format!("bad status code: {status}"),
                        ));
                        continue;
                    }
                    match response.text().await {
                        Ok(body) if !body.is_empty() => {
                            latencies.push(start.elapsed());
                            battery.latency_ms = Some(median_ms(&latencies));
                            return Ok(Some(body));
                        }
                        Ok(_) => {
                            last_failure =
                                Some((TestOutcome::BadResponse, "empty response".into()));
                        }
                        Err(e) => {
                            last_failure = Some(classify_error(&e));
                        }
                    }
                }
                Err(e) => {
                    last_failure = Some(classify_error(&e));
                    debug!(
                        "{} 第 {} 次请求失败：{}",
                        proxy.url(false),
                        attempt + 1,
                        last_failure.as_ref().unwrap().1
                    );
                }
            }
        }

        let (outcome, info) =
            last_failure.unwrap_or((TestOutcome::InternalError, "no attempt executed".into()));
        battery.push(outcome, info);
        Ok(None)
    }

    /// 解析判定站回显并检查真实出口是否暴露。
    fn analyze_judge(&self, body: &str, battery: &mut Battery) {
        let report = match JudgeReport::parse(body) {
            Ok(report) => report,
            Err(e) => {
                battery.push(TestOutcome::BadResponse, e);
                return;
            }
        };

        if let Some((key, _)) = report.reveals(&self.local_ip) {
            battery.anonymous = Some(false);
            battery.push(TestOutcome::NonAnonymous, format!("local ip revealed via {key}"));
            return;
        }

        // 判定站有回显 UA 时顺带校验，被改写说明中间有可疑网关
        if let Some(echoed) = report.user_agent() {
            if echoed != self.user_agent {
                battery.push(TestOutcome::BadResponse, "user-agent mismatch");
                return;
            }
        }

        battery.anonymous = Some(true);
    }

    fn build_client(&self, proxy: &Proxy) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-GB,en-US;q=0.9,en;q=0.8"));

        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy.url(false))?)
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .default_headers(headers)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(client)
    }
}

fn classify_error(e: &reqwest::Error) -> (TestOutcome, String) {
    if e.is_timeout() {
        (TestOutcome::Timeout, "connection timed out".into())
    } else if e.is_connect() {
        (TestOutcome::ConnRefused, format!("failed to connect: {e}"))
    } else {
        (TestOutcome::BadResponse, format!("request error: {e}"))
    }
}

fn median_ms(latencies: &[Duration]) -> u32 {
    let mut ms: Vec<u128> = latencies.iter().map(Duration::as_millis).collect();
    ms.sort_unstable();
    ms.get(ms.len() / 2).copied().unwrap_or(0).min(u128::from(u32::MAX)) as u32
}

/// 启动时直连判定站解析本机公网 IP。
pub async fn find_local_ip(judge_url: &str) -> Result<String> {
    let body = reqwest::get(judge_url).await?.error_for_status()?.text().await?;
    let report =
        JudgeReport::parse(&body).map_err(|e| anyhow::anyhow!("判定站响应异常：{e}"))?;
    let addr = report.remote_addr().unwrap_or_default();
    let ip = find_ip_address(addr)
        .ok_or_else(|| anyhow::anyhow!("判定站返回的 REMOTE_ADDR 无效：{addr}"))?;
    Ok(ip.to_string())
}

/// 用第三方服务交叉验证判定站解析出的本机 IP。
pub async fn validate_local_ip(local_ip: &str) -> bool {
    #[derive(serde::Deserialize)]
    struct Ipify {
        ip: String,
    }

    match reqwest::get("https://api.ipify.org/?format=json").await {
        Ok(response) => match response.json::<Ipify>().await {
            Ok(data) if data.ip == local_ip => true,
            Ok(data) => {
                tracing::error!("本机 IP 不一致：判定站 {local_ip}，ipify {}", data.ip);
                false
            }
            Err(e) => {
                tracing::error!("解析 ipify 响应失败：{e}");
                false
            }
        },
        Err(e) => {
            tracing::error!("连接 ipify 失败：{e}");
            false
        }
    }
}
