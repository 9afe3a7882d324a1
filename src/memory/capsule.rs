//! 记忆胶囊压缩引擎
//!
//! 把无界的记忆日志压成一段可注入 prompt 的短文本，同时给出各阶段的丢弃统计。
//!
//! - **legacy**：Scope 相关性过滤 → 闲聊噪声过滤 → 失败信号回填（Signal Pin）→ 行数上限
//! - **layered**：最近 H 行原样保留（hot），更早的行压成一条 `ColdSummary=` 行（cold）
//!
//! 注入策略（bootstrap_only / always / disabled）由编排器决定，这里只回答「现在的胶囊长什么样」。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::MemorySection;
use crate::memory::line::{truncate_chars, LineKind, MemoryLine};
use crate::memory::scope::FocusScope;

pub const PINNED_FAILURE_PREFIX: &str = "PinnedFailure:";
pub const COLD_SUMMARY_PREFIX: &str = "ColdSummary=";

/// 胶囊压缩模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapsuleMode {
    #[default]
    Legacy,
    Layered,
}

/// 各阶段丢弃的行数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DroppedCounts {
    pub scope: usize,
    pub noise: usize,
    /// 超出胶囊行数上限被丢弃
    pub cap: usize,
    /// layered 模式下被压进冷摘要的行
    pub cold: usize,
}

impl DroppedCounts {
    pub fn total(&self) -> usize {
        self.scope + self.noise + self.cap + self.cold
    }
}

/// 压缩结果与指标（每次请求时从当前记忆重新计算，不持久化）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryCapsule {
    pub mode: CapsuleMode,
    pub text: String,
    pub source_line_count: usize,
    pub included_line_count: usize,
    pub dropped: DroppedCounts,
    /// 被过滤后又因携带错误码回填的行数（已计入 included）
    pub pinned_count: usize,
    pub char_count: usize,
    /// 胶囊字符数 / 源日志字符数；源为空时为 1.0
    pub compaction_ratio: f64,
}

impl MemoryCapsule {
    pub fn is_empty(&self) -> bool {
        self.included_line_count == 0
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

/// 按配置的模式压缩
pub fn build_capsule(lines: &[String], focus: &FocusScope, settings: &MemorySection) -> MemoryCapsule {
    match settings.capsule_mode {
        CapsuleMode::Legacy => build_legacy(lines, focus, settings),
        CapsuleMode::Layered => build_layered(lines, focus, settings),
    }
}

fn finish(
    mode: CapsuleMode,
    source: &[String],
    out: Vec<String>,
    dropped: DroppedCounts,
    pinned_count: usize,
) -> MemoryCapsule {
    let text = out.join("\n");
    let char_count = text.chars().count();
    let source_chars = source.join("\n").chars().count();
    MemoryCapsule {
        mode,
        source_line_count: source.len(),
        included_line_count: out.len(),
        dropped,
        pinned_count,
        char_count,
        compaction_ratio: if source_chars == 0 {
            1.0
        } else {
            char_count as f64 / source_chars as f64
        },
        text,
    }
}

/// 按谓词拆分保留 / 丢弃；保留数低于 floor 时从最近的丢弃行回补
fn filter_with_floor<F>(kept: Vec<usize>, floor: usize, keep: F) -> (Vec<usize>, Vec<usize>)
where
    F: Fn(usize) -> bool,
{
    let (mut pass, mut fail): (Vec<usize>, Vec<usize>) = kept.into_iter().partition(|i| keep(*i));
    let floor = floor.min(pass.len() + fail.len());
    while pass.len() < floor {
        match fail.pop() {
            Some(i) => pass.push(i),
            None => break,
        }
    }
    pass.sort_unstable();
    (pass, fail)
}

fn build_legacy(lines: &[String], focus: &FocusScope, settings: &MemorySection) -> MemoryCapsule {
    let parsed: Vec<MemoryLine<'_>> = lines.iter().map(|l| MemoryLine::parse(l)).collect();
    let mut dropped = DroppedCounts::default();
    let mut filtered_out: Vec<usize> = Vec::new();
    let mut kept: Vec<usize> = (0..lines.len()).collect();
    let floor = settings.min_keep_lines;

    if settings.scope_filter && !focus.is_empty() {
        let (pass, fail) = filter_with_floor(kept, floor, |i| focus.matches(parsed[i].scope()));
        dropped.scope = fail.len();
        filtered_out.extend(fail);
        kept = pass;
    }

    if settings.noise_filter {
        let (pass, fail) = filter_with_floor(kept, floor, |i| !parsed[i].is_chat_only());
        dropped.noise = fail.len();
        filtered_out.extend(fail);
        kept = pass;
    }

    let cap = settings.capsule_max_lines;
    let mut pins: Vec<usize> = Vec::new();
    if settings.signal_pin {
        filtered_out.sort_unstable_by(|a, b| b.cmp(a));
        pins = filtered_out
            .iter()
            .copied()
            .filter(|i| parsed[*i].error_code().is_some())
            .take(settings.pin_max_lines.min(cap))
            .collect();
    }

    let slots = cap.saturating_sub(pins.len());
    if kept.len() > slots {
        let excess = kept.len() - slots;
        dropped.cap = excess;
        kept.drain(..excess);
    }

    // 回填行按新到旧消耗字符预算，超出预算的压成固定形状的标记
    let mut pinned_text: HashMap<usize, String> = HashMap::new();
    let mut added_chars = 0usize;
    for &i in &pins {
        let raw = lines[i].as_str();
        let raw_chars = raw.chars().count();
        let text = if added_chars + raw_chars > settings.pin_max_added_chars {
            compact_pin(&parsed[i], settings.pin_max_chars_per_line)
        } else {
            raw.to_string()
        };
        added_chars += text.chars().count();
        pinned_text.insert(i, text);
    }

    let mut order: Vec<usize> = kept.iter().chain(pins.iter()).copied().collect();
    order.sort_unstable();
    let out = order
        .into_iter()
        .map(|i| pinned_text.remove(&i).unwrap_or_else(|| lines[i].clone()))
        .collect();

    finish(CapsuleMode::Legacy, lines, out, dropped, pins.len())
}

/// `PinnedFailure: <goal> <error_code>`；错误码永不截断，只截 goal
fn compact_pin(line: &MemoryLine<'_>, max_chars: usize) -> String {
    let code = line.error_code().unwrap_or("E_UNKNOWN");
    let goal = line.goal().unwrap_or("-");
    let fixed = PINNED_FAILURE_PREFIX.chars().count() + 2 + code.chars().count();
    if max_chars > fixed + 3 {
        format!(
            "{} {} {}",
            PINNED_FAILURE_PREFIX,
            truncate_chars(goal, max_chars - fixed),
            code
        )
    } else {
        format!("{} {}", PINNED_FAILURE_PREFIX, code)
    }
}

fn build_layered(lines: &[String], focus: &FocusScope, settings: &MemorySection) -> MemoryCapsule {
    let cap = settings.capsule_max_lines;
    let hot_count = settings.hot_lines.min(lines.len());
    let split = lines.len() - hot_count;
    let (cold, hot) = lines.split_at(split);

    let mut dropped = DroppedCounts {
        cold: cold.len(),
        ..DroppedCounts::default()
    };
    let mut summary = if cold.is_empty() {
        None
    } else {
        Some(cold_summary(cold, focus, settings.cold_summary_max_chars))
    };
    let mut hot: Vec<String> = hot.to_vec();

    // 超出上限：先丢冷摘要，再丢最旧的热行
    while hot.len() + usize::from(summary.is_some()) > cap {
        if summary.take().is_some() {
            continue;
        }
        hot.remove(0);
        dropped.cap += 1;
    }

    let out: Vec<String> = summary.into_iter().chain(hot).collect();
    finish(CapsuleMode::Layered, lines, out, dropped, 0)
}

/// 冷区摘要：规划 / 收尾行数、失败码、最相关的 Scope
fn cold_summary(cold: &[String], focus: &FocusScope, max_chars: usize) -> String {
    let parsed: Vec<MemoryLine<'_>> = cold.iter().map(|l| MemoryLine::parse(l)).collect();
    let plans = parsed.iter().filter(|l| l.kind == LineKind::Plan).count();
    let finals = parsed.iter().filter(|l| l.kind == LineKind::Final).count();

    let mut errors: Vec<&str> = Vec::new();
    for code in parsed.iter().rev().filter_map(|l| l.error_code()) {
        if !errors.contains(&code) {
            errors.push(code);
        }
    }

    // Scope 排序：与当前焦点相关优先，其次出现次数，再次最近出现
    let mut scopes: HashMap<&str, (usize, usize)> = HashMap::new();
    for (idx, scope) in parsed
        .iter()
        .enumerate()
        .filter_map(|(i, l)| l.scope().filter(|s| *s != "-").map(|s| (i, s)))
    {
        let slot = scopes.entry(scope).or_insert((0, 0));
        slot.0 += 1;
        slot.1 = idx;
    }
    let mut ranked: Vec<(&str, (usize, usize))> = scopes.into_iter().collect();
    ranked.sort_by(|(a, (ca, la)), (b, (cb, lb))| {
        let fa = !focus.is_empty() && focus.matches(Some(a));
        let fb = !focus.is_empty() && focus.matches(Some(b));
        fb.cmp(&fa).then(cb.cmp(ca)).then(lb.cmp(la))
    });

    let mut summary = format!(
        "{}plans:{},finals:{},failures:{}",
        COLD_SUMMARY_PREFIX,
        plans,
        finals,
        parsed.iter().filter(|l| l.error_code().is_some()).count()
    );
    if !errors.is_empty() {
        summary.push_str(" | Errors=");
        summary.push_str(&errors.iter().take(4).copied().collect::<Vec<_>>().join(","));
    }
    if !ranked.is_empty() {
        summary.push_str(" | Scopes=");
        summary.push_str(
            &ranked
                .iter()
                .take(3)
                .map(|(s, _)| *s)
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    truncate_chars(&summary, max_chars.max(COLD_SUMMARY_PREFIX.len() + 1))
}
