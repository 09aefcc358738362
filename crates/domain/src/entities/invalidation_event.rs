//! 缓存失效事件
//!
//! 写入方每完成一批数据落库即发布一条事件，线上格式:
//! `{"eventId": "...", "partition": "2024-01-02", "computationId": "...", "version": 3, "producedAt": "..."}`

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value_objects::TradeDate;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("事件无法解析: {0}")]
    Malformed(String),

    #[error("事件缺少作用域: {0}")]
    MissingScope(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub event_id: String,
    pub partition: TradeDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computation_id: Option<String>,
    pub version: i64,
    pub produced_at: DateTime<Utc>,
}

/// 宽松的线上结构，用来区分「字段缺失」和「格式错误」
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    event_id: Option<String>,
    partition: Option<String>,
    computation_id: Option<String>,
    version: Option<i64>,
    produced_at: Option<DateTime<Utc>>,
}

impl InvalidationEvent {
    pub fn new(partition: TradeDate, computation_id: Option<String>, version: i64) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            partition,
            computation_id,
            version,
            produced_at: Utc::now(),
        }
    }

    /// 解析并校验线上报文
    pub fn from_json(payload: &str) -> Result<Self, EventError> {
        let wire: WireEvent =
            serde_json::from_str(payload).map_err(|e| EventError::Malformed(e.to_string()))?;

        let event_id = wire
            .event_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| EventError::MissingScope("eventId".to_string()))?;
        let partition = wire
            .partition
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| EventError::MissingScope("partition".to_string()))?;
        let partition = NaiveDate::parse_from_str(partition.trim(), "%Y-%m-%d")
            .map(TradeDate::new)
            .map_err(|_| EventError::Malformed(format!("partition={}", partition)))?;

        Ok(Self {
            event_id,
            partition,
            computation_id: wire.computation_id.filter(|id| !id.trim().is_empty()),
            version: wire.version.unwrap_or_default(),
            produced_at: wire.produced_at.unwrap_or_else(Utc::now),
        })
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(|e| EventError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_event() {
        let payload = r#"{"eventId":"e-1","partition":"2024-01-02","computationId":"macd","version":3,"producedAt":"2024-01-02T08:00:00Z"}"#;
        let event = InvalidationEvent::from_json(payload).unwrap();
        assert_eq!(event.event_id, "e-1");
        assert_eq!(event.partition, TradeDate::from_ymd(2024, 1, 2).unwrap());
        assert_eq!(event.computation_id.as_deref(), Some("macd"));
        assert_eq!(event.version, 3);
    }

    #[test]
    fn test_missing_partition_is_missing_scope() {
        let payload = r#"{"eventId":"e-1","version":3}"#;
        assert_eq!(
            InvalidationEvent::from_json(payload),
            Err(EventError::MissingScope("partition".to_string()))
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            InvalidationEvent::from_json("not json"),
            Err(EventError::Malformed(_))
        ));
        assert!(matches!(
            InvalidationEvent::from_json(r#"{"eventId":"e","partition":"yesterday"}"#),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn test_json_shape() {
        let event = InvalidationEvent::new(TradeDate::from_ymd(2024, 1, 2).unwrap(), None, 1);
        let json = event.to_json().unwrap();
        assert!(json.contains(r#""partition":"2024-01-02""#));
        assert!(!json.contains("computationId"));
        assert_eq!(InvalidationEvent::from_json(&json).unwrap(), event);
    }
}
