//! 每个会话一条只追加的记忆日志（MemoryEntry），生命周期独立于会话与子进程

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::MemorySection;
use crate::memory::line::{LineKind, MemoryLine};

/// 单个会话的记忆：按时间顺序的紧凑摘要行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub session_key: String,
    pub lines: Vec<String>,
    /// Unix 毫秒
    pub updated_at_ms: i64,
}

/// 所有会话的记忆日志
#[derive(Debug, Clone)]
pub struct MemoryBook {
    entries: HashMap<String, MemoryEntry>,
    max_lines: usize,
    max_chars: usize,
}

impl MemoryBook {
    pub fn new(settings: &MemorySection) -> Self {
        Self {
            entries: HashMap::new(),
            max_lines: settings.max_lines.max(1),
            max_chars: settings.max_chars,
        }
    }

    /// 追加一行；与上一行相同时不重复追加，返回是否有变化
    pub fn append(&mut self, session_key: &str, line: String, now_ms: i64) -> bool {
        let entry = self
            .entries
            .entry(session_key.to_string())
            .or_insert_with(|| MemoryEntry {
                session_key: session_key.to_string(),
                lines: Vec::new(),
                updated_at_ms: now_ms,
            });
        if entry.lines.last() == Some(&line) {
            return false;
        }
        entry.lines.push(line);
        entry.updated_at_ms = now_ms;
        trim_front(&mut entry.lines, self.max_lines, self.max_chars);
        true
    }

    pub fn lines(&self, session_key: &str) -> &[String] {
        self.entries
            .get(session_key)
            .map(|e| e.lines.as_slice())
            .unwrap_or(&[])
    }

    /// 最近一条指定类型的行（用于给收尾行补全 Goal / Scope）
    pub fn last_of_kind(&self, session_key: &str, kind: LineKind) -> Option<&str> {
        self.lines(session_key)
            .iter()
            .rev()
            .map(String::as_str)
            .find(|l| MemoryLine::parse(l).kind == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<MemoryEntry> {
        let mut all: Vec<_> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        all
    }

    /// 从快照恢复：丢弃过期条目，超过上限时丢弃最旧的，并按当前上限重新修剪
    pub fn restore(&mut self, entries: Vec<MemoryEntry>, now_ms: i64, ttl_ms: i64, max_entries: usize) -> usize {
        let mut fresh: Vec<_> = entries
            .into_iter()
            .filter(|e| now_ms.saturating_sub(e.updated_at_ms) <= ttl_ms)
            .collect();
        fresh.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
        fresh.truncate(max_entries);
        let restored = fresh.len();
        for mut entry in fresh {
            trim_front(&mut entry.lines, self.max_lines, self.max_chars);
            self.entries.insert(entry.session_key.clone(), entry);
        }
        restored
    }
}

/// 先按行数、再按总字符数从头部修剪；最新一行总是保留
fn trim_front(lines: &mut Vec<String>, max_lines: usize, max_chars: usize) {
    if lines.len() > max_lines {
        let excess = lines.len() - max_lines;
        lines.drain(..excess);
    }
    let mut total: usize = lines.iter().map(|l| l.chars().count()).sum();
    while total > max_chars && lines.len() > 1 {
        total -= lines[0].chars().count();
        lines.remove(0);
    }
}
