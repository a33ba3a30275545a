//! Wholesale price producer consumed by C7 (spike controller). Unlike the
//! retail feeds this talks to a public, unauthenticated AEMO endpoint and
//! an ad-hoc pre-dispatch ZIP-of-CSV export — no per-site subscription, one
//! shared summary for the whole market.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::domain::PriceSourceError;

const SUMMARY_URL: &str = "https://visualisations.aemo.com.au/aemo/apps/api/report/ELEC_NEM_SUMMARY";
const PREDISPATCH_DIR_URL: &str = "https://nemweb.com.au/Reports/Current/Predispatch_Reports/";

/// Current dispatch price for one NEM region.
#[derive(Debug, Clone)]
pub struct WholesaleSummary {
    pub region: String,
    pub price_per_mwh: f64,
    pub price_status: String,
    pub total_demand_mw: f64,
    pub settlement_date: DateTime<Utc>,
}

impl WholesaleSummary {
    pub fn cents_per_kwh(&self) -> f64 {
        self.price_per_mwh / 10.0
    }
}

/// One 30-minute pre-dispatch forecast row.
#[derive(Debug, Clone)]
pub struct PredispatchRow {
    pub region: String,
    pub period: DateTime<Utc>,
    pub rrp_per_mwh: f64,
}

impl PredispatchRow {
    pub fn cents_per_kwh(&self) -> f64 {
        self.rrp_per_mwh / 10.0
    }
}

pub struct AemoClient {
    client: reqwest::Client,
    summary_url: String,
    predispatch_dir_url: String,
    predispatch_cache: Arc<RwLock<Option<(String, Vec<PredispatchRow>)>>>,
}

impl AemoClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(15))
            .user_agent("open-energy-controller/0.2")
            .build()?;
        Ok(Self {
            client,
            summary_url: SUMMARY_URL.to_string(),
            predispatch_dir_url: PREDISPATCH_DIR_URL.to_string(),
            predispatch_cache: Arc::new(RwLock::new(None)),
        })
    }

    /// Fetches `{REGIONID, PRICE, PRICE_STATUS, TOTALDEMAND, SETTLEMENTDATE}`
    /// for one region from the public summary endpoint.
    pub async fn current_price(&self, region: &str) -> Result<WholesaleSummary, PriceSourceError> {
        let resp = self
            .client
            .get(&self.summary_url)
            .send()
            .await
            .map_err(|e| PriceSourceError::TransientHttp(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PriceSourceError::TransientHttp(format!("HTTP {}", resp.status())));
        }
        let body: SummaryResponse = resp.json().await.map_err(|e| PriceSourceError::ParseError(e.to_string()))?;
        body.elec_nem_summary
            .into_iter()
            .find(|r| r.regionid == region)
            .map(|r| WholesaleSummary {
                region: r.regionid,
                price_per_mwh: r.price,
                price_status: r.price_status,
                total_demand_mw: r.totaldemand,
                settlement_date: r.settlementdate,
            })
            .ok_or_else(|| PriceSourceError::ParseError(format!("region {region} not present in summary")))
    }

    /// Downloads and parses the latest `PUBLIC_PREDISPATCH_*_LEGACY.zip`,
    /// filtered to `region`. Repeated calls within the same publication
    /// window (same upstream filename) are served from cache.
    pub async fn predispatch_forecast(&self, region: &str) -> Result<Vec<PredispatchRow>, PriceSourceError> {
        let latest_name = self.latest_predispatch_filename().await?;

        {
            let cache = self.predispatch_cache.read().await;
            if let Some((name, rows)) = cache.as_ref() {
                if *name == latest_name {
                    debug!(file = %latest_name, "using cached pre-dispatch forecast");
                    return Ok(rows.iter().filter(|r| r.region == region).cloned().collect());
                }
            }
        }

        let zip_url = format!("{}{}", self.predispatch_dir_url, latest_name);
        let bytes = self
            .client
            .get(&zip_url)
            .send()
            .await
            .map_err(|e| PriceSourceError::TransientHttp(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| PriceSourceError::TransientHttp(e.to_string()))?;

        let rows = parse_predispatch_zip(&bytes)?;
        info!(file = %latest_name, rows = rows.len(), "parsed fresh pre-dispatch forecast");
        *self.predispatch_cache.write().await = Some((latest_name, rows.clone()));
        Ok(rows.into_iter().filter(|r| r.region == region).collect())
    }

    async fn latest_predispatch_filename(&self) -> Result<String, PriceSourceError> {
        let resp = self
            .client
            .get(&self.predispatch_dir_url)
            .send()
            .await
            .map_err(|e| PriceSourceError::TransientHttp(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PriceSourceError::TransientHttp(format!("HTTP {}", resp.status())));
        }
        let html = resp.text().await.map_err(|e| PriceSourceError::TransientHttp(e.to_string()))?;
        html.lines()
            .filter_map(|line| {
                let start = line.find("PUBLIC_PREDISPATCH_")?;
                let rest = &line[start..];
                let end = rest.find("_LEGACY.zip")? + "_LEGACY.zip".len();
                Some(rest[..end].to_string())
            })
            .max()
            .ok_or_else(|| PriceSourceError::ParseError("no predispatch legacy zip found in listing".to_string()))
    }
}

fn parse_predispatch_zip(bytes: &[u8]) -> Result<Vec<PredispatchRow>, PriceSourceError> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader).map_err(|e| PriceSourceError::ParseError(e.to_string()))?;
    if archive.is_empty() {
        return Err(PriceSourceError::ParseError("predispatch zip had no entries".to_string()));
    }
    let mut csv = String::new();
    archive
        .by_index(0)
        .map_err(|e| PriceSourceError::ParseError(e.to_string()))?
        .read_to_string(&mut csv)
        .map_err(|e| PriceSourceError::ParseError(e.to_string()))?;
    parse_predispatch_csv(&csv)
}

/// AEMO MMS CSV convention: `I` rows declare the column layout for the data
/// type named in their third field; `D` rows carry values for that layout.
/// We only care about `REGIONID`, `PERIOD_DATETIME`/`DATETIME`, and `RRP`.
fn parse_predispatch_csv(csv: &str) -> Result<Vec<PredispatchRow>, PriceSourceError> {
    let mut columns: HashMap<String, usize> = HashMap::new();
    let mut rows = Vec::new();

    for line in csv.lines() {
        let fields: Vec<&str> = line.split(',').map(|f| f.trim_matches('"')).collect();
        let Some(record_type) = fields.first() else { continue };

        match *record_type {
            "I" => {
                columns.clear();
                for (idx, name) in fields.iter().enumerate().skip(4) {
                    columns.insert(name.to_string(), idx);
                }
            }
            "D" => {
                let region_idx = columns.get("REGIONID");
                let rrp_idx = columns.get("RRP");
                let period_idx = columns.get("PERIOD_DATETIME").or_else(|| columns.get("DATETIME"));
                let (Some(&r), Some(&p), Some(&rr)) = (region_idx, period_idx, rrp_idx) else { continue };
                let (Some(region), Some(period_raw), Some(rrp_raw)) =
                    (fields.get(r), fields.get(p), fields.get(rr))
                else {
                    continue;
                };
                let Ok(rrp) = rrp_raw.parse::<f64>() else { continue };
                let Ok(period) = parse_aemo_datetime(period_raw) else {
                    warn!(raw = %period_raw, "skipping predispatch row with unparseable timestamp");
                    continue;
                };
                rows.push(PredispatchRow { region: region.to_string(), period, rrp_per_mwh: rrp });
            }
            _ => {}
        }
    }

    Ok(rows)
}

fn parse_aemo_datetime(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y/%m/%d %H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))?;
    Ok(naive.and_utc())
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(rename = "ELEC_NEM_SUMMARY")]
    elec_nem_summary: Vec<SummaryRow>,
}

#[derive(Debug, Deserialize)]
struct SummaryRow {
    #[serde(rename = "REGIONID")]
    regionid: String,
    #[serde(rename = "PRICE")]
    price: f64,
    #[serde(rename = "PRICE_STATUS")]
    price_status: String,
    #[serde(rename = "TOTALDEMAND")]
    totaldemand: f64,
    #[serde(rename = "SETTLEMENTDATE")]
    settlementdate: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_rows_matching_the_preceding_info_row() {
        let csv = "C,HEADER\n\
I,PREDISPATCH,REGION_PRICES,1,SETTLEMENTDATE,RUNNO,REGIONID,PERIOD_DATETIME,RRP\n\
D,PREDISPATCH,REGION_PRICES,1,2024/06/10 00:00:00,1,NSW1,2024/06/10 00:30:00,85.32\n\
D,PREDISPATCH,REGION_PRICES,1,2024/06/10 00:00:00,1,QLD1,2024/06/10 00:30:00,60.10\n";
        let rows = parse_predispatch_csv(csv).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].region, "NSW1");
        assert!((rows[0].rrp_per_mwh - 85.32).abs() < 1e-9);
        assert!((rows[0].cents_per_kwh() - 8.532).abs() < 1e-9);
    }

    #[test]
    fn ignores_rows_before_any_info_header() {
        let csv = "D,PREDISPATCH,REGION_PRICES,1,x,1,NSW1,2024/06/10 00:30:00,85.32\n";
        let rows = parse_predispatch_csv(csv).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn latest_filename_picks_lexicographically_greatest_match() {
        let html = r#"
            <a href="PUBLIC_PREDISPATCH_20240610120000_0000000412345678_LEGACY.zip">a</a>
            <a href="PUBLIC_PREDISPATCH_20240610123000_0000000412345679_LEGACY.zip">b</a>
        "#;
        let found = html
            .lines()
            .filter_map(|line| {
                let start = line.find("PUBLIC_PREDISPATCH_")?;
                let rest = &line[start..];
                let end = rest.find("_LEGACY.zip")? + "_LEGACY.zip".len();
                Some(rest[..end].to_string())
            })
            .max()
            .unwrap();
        assert!(found.contains("20240610123000"));
    }
}
