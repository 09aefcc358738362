//! 内存实现的失效扫描匹配
//!
//! 模式由 `KeyBuilder::invalidation_patterns` 生成，元字符已用 `glob::Pattern::escape` 转义，
//! 同一模式交给 Redis `SCAN MATCH` 时匹配结果一致。

use glob::{MatchOptions, Pattern};
use tracing::warn;

/// 键里没有路径语义，`*` 可以跨过任何字符
const KEY_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// 编译模式；非法模式记录告警并视为不匹配任何键
pub fn compile(pattern: &str) -> Option<Pattern> {
    match Pattern::new(pattern) {
        Ok(compiled) => Some(compiled),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "非法的失效模式");
            None
        }
    }
}

pub fn matches(pattern: &Pattern, key: &str) -> bool {
    pattern.matches_with(key, KEY_MATCH)
}
