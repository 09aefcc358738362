//! 缓存键值对象
//!
//! 格式: `{namespace}:{kind}:{partition}:{filter1}:{filter2}:...`
//!
//! 业务规则:
//! - 过滤维度按声明顺序拼接
//! - 缺省（None、空白串、字面量 `ALL`）统一渲染为哨兵 `ALL`
//! - 过滤值中的 `%` 和 `:` 被转义为 `%25` / `%3A`，保证不同参数组合不会拼出相同的键
//! - 过滤值中的 `\`、`[`、`]` 同样按百分号转义，glob 与 Redis MATCH 对它们的解释不一致

use std::fmt;

use serde::{Deserialize, Serialize};

use super::trade_date::TradeDate;

/// 缺省过滤维度的哨兵
pub const ALL_SENTINEL: &str = "ALL";

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// 缓存键构造器
///
/// 纯函数，无 I/O。`namespace` 与 `kind` 视为受信任的常量，不做转义。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    namespace: String,
    kind: String,
}

impl KeyBuilder {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// 构造缓存键
    pub fn build_key<I, S>(&self, partition: &TradeDate, filters: I) -> CacheKey
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        let mut key = self.partition_prefix(partition);
        for filter in filters {
            key.push(':');
            match filter.as_ref().map(|v| AsRef::<str>::as_ref(v)) {
                Some(value) if !value.trim().is_empty() && value != ALL_SENTINEL => {
                    key.push_str(&escape_segment(value))
                }
                _ => key.push_str(ALL_SENTINEL),
            }
        }
        CacheKey(key)
    }

    /// 该分区所有键的公共前缀（也是不带过滤维度时的完整键）
    pub fn partition_prefix(&self, partition: &TradeDate) -> String {
        format!("{}:{}:{}", self.namespace, self.kind, partition)
    }

    /// 失效扫描用的 glob 模式
    ///
    /// 仅按分区失效时返回分区前缀下的全部键；带计算标识时只覆盖首个过滤维度
    /// 等于该标识或为 `ALL`（跨计算聚合）的键。
    pub fn invalidation_patterns(
        &self,
        partition: &TradeDate,
        computation_id: Option<&str>,
    ) -> Vec<String> {
        let prefix = glob_escape(&self.partition_prefix(partition));
        match computation_id.filter(|id| !id.trim().is_empty()) {
            None => vec![prefix.clone(), format!("{}:*", prefix)],
            Some(id) => {
                let segment = glob_escape(&escape_segment(id));
                vec![
                    prefix.clone(),
                    format!("{}:{}", prefix, segment),
                    format!("{}:{}:*", prefix, segment),
                    format!("{}:{}", prefix, ALL_SENTINEL),
                    format!("{}:{}:*", prefix, ALL_SENTINEL),
                ]
            }
        }
    }

    /// 从键中解析分区；不属于本构造器的键返回 None
    pub fn partition_of(&self, key: &str) -> Option<TradeDate> {
        let rest = key
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix(':')?
            .strip_prefix(self.kind.as_str())?
            .strip_prefix(':')?;
        let partition = rest.split(':').next()?;
        partition.parse().ok()
    }
}

fn escape_segment(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            '[' => escaped.push_str("%5B"),
            '\\' => escaped.push_str("%5C"),
            ']' => escaped.push_str("%5D"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// 转义 glob 元字符，`*`、`?` 等被包进字符类（`[*]`），Redis MATCH 同样识别
pub fn glob_escape(value: &str) -> String {
    glob::Pattern::escape(value)
}
