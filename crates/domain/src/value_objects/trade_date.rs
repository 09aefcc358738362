//! 交易日分区值对象

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
// 1970-01-01 距公元元年的天数
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TradeDateError {
    #[error("交易日格式无效（应为 YYYY-MM-DD）: {0}")]
    InvalidFormat(String),
}

/// 交易日
///
/// 缓存的主分区维度。序列化为 `YYYY-MM-DD`，
/// `epoch_offset()` 为自 1970-01-01 起的天数，用作存在性守卫的位偏移。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeDate(NaiveDate);

impl TradeDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn today() -> Self {
        Self(Utc::now().date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// 自 1970-01-01 起的天数；早于该日期返回 None
    pub fn epoch_offset(&self) -> Option<u64> {
        u64::try_from(self.0.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE).ok()
    }

    pub fn pred(&self) -> Option<Self> {
        self.0.pred_opt().map(Self)
    }

    pub fn succ(&self) -> Option<Self> {
        self.0.succ_opt().map(Self)
    }
}

impl fmt::Display for TradeDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl FromStr for TradeDate {
    type Err = TradeDateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
            .map(Self)
            .map_err(|_| TradeDateError::InvalidFormat(s.to_string()))
    }
}

impl From<NaiveDate> for TradeDate {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}
