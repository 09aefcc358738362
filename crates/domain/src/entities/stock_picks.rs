//! 每日选股结果

use serde::{Deserialize, Serialize};

use crate::traits::CacheQuery;
use crate::value_objects::TradeDate;

/// 单只入选股票
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockPick {
    pub code: String,
    pub name: String,
    pub strategy_id: String,
    #[serde(default)]
    pub industry: Option<String>,
    pub score: f64,
}

/// 选股查询
///
/// 过滤维度顺序固定为: strategy_id, industry, page, page_size
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StockPicksQuery {
    pub trade_date: TradeDate,
    pub strategy_id: Option<String>,
    pub industry: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl StockPicksQuery {
    pub fn new(trade_date: TradeDate) -> Self {
        Self {
            trade_date,
            strategy_id: None,
            industry: None,
            page: 1,
            page_size: 20,
        }
    }

    pub fn with_strategy(mut self, strategy_id: impl Into<String>) -> Self {
        self.strategy_id = Some(strategy_id.into());
        self
    }

    pub fn with_industry(mut self, industry: impl Into<String>) -> Self {
        self.industry = Some(industry.into());
        self
    }

    pub fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page.max(1);
        self.page_size = page_size.max(1);
        self
    }

    /// 按过滤条件筛选并分页；无任何匹配时返回 None
    pub fn apply(&self, picks: &[StockPick]) -> Option<StockPicksPage> {
        let mut matched: Vec<StockPick> = picks
            .iter()
            .filter(|p| {
                self.strategy_id
                    .as_deref()
                    .map_or(true, |id| p.strategy_id == id)
            })
            .filter(|p| {
                self.industry
                    .as_deref()
                    .map_or(true, |ind| p.industry.as_deref() == Some(ind))
            })
            .cloned()
            .collect();
        if matched.is_empty() {
            return None;
        }
        matched.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.code.cmp(&b.code))
        });

        let total = matched.len();
        let start = (self.page.saturating_sub(1) as usize).saturating_mul(self.page_size as usize);
        let items = matched
            .into_iter()
            .skip(start)
            .take(self.page_size as usize)
            .collect();
        Some(StockPicksPage {
            trade_date: self.trade_date,
            items,
            total,
            page: self.page,
            page_size: self.page_size,
        })
    }
}

impl CacheQuery for StockPicksQuery {
    fn partition(&self) -> TradeDate {
        self.trade_date
    }

    fn filters(&self) -> Vec<Option<String>> {
        vec![
            self.strategy_id.clone(),
            self.industry.clone(),
            Some(self.page.to_string()),
            Some(self.page_size.to_string()),
        ]
    }
}

/// 一页选股结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockPicksPage {
    pub trade_date: TradeDate,
    pub items: Vec<StockPick>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pick(code: &str, strategy: &str, industry: &str, score: f64) -> StockPick {
        StockPick {
            code: code.to_string(),
            name: code.to_string(),
            strategy_id: strategy.to_string(),
            industry: Some(industry.to_string()),
            score,
        }
    }

    #[test]
    fn test_filters_follow_declared_order() {
        let query = StockPicksQuery::new(TradeDate::from_ymd(2024, 1, 2).unwrap());
        assert_eq!(
            query.filters(),
            vec![None, None, Some("1".to_string()), Some("20".to_string())]
        );
    }

    #[test]
    fn test_apply_filters_sorts_and_pages() {
        let picks = vec![
            pick("600000", "macd", "bank", 0.5),
            pick("000001", "macd", "bank", 0.9),
            pick("300750", "vegas", "battery", 0.7),
        ];
        let query = StockPicksQuery::new(TradeDate::from_ymd(2024, 1, 2).unwrap())
            .with_strategy("macd")
            .with_page(1, 1);
        let page = query.apply(&picks).unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].code, "000001");

        let none = StockPicksQuery::new(TradeDate::from_ymd(2024, 1, 2).unwrap())
            .with_industry("steel");
        assert!(none.apply(&picks).is_none());
    }
}
