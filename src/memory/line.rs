//! 紧凑记忆行：每个规划 / 收尾阶段产出一行 `key=value` 摘要
//!
//! ```text
//! [Plan] Goal=add a jump button | Scope=Canvas/Panel | Actions=file=1[create_file];visual=1[add_component]
//! [Final] Goal=add a jump button | Scope=Canvas/Panel | Outcome=failed | Compile=failed | ActionStatus=skipped | Error=E_COMPILE
//! ```

pub const PLAN_TAG: &str = "[Plan]";
pub const FINAL_TAG: &str = "[Final]";
/// 无文件 / 可视化动作时的 Actions 值
pub const NO_ACTIONS: &str = "none";

const FIELD_SEPARATOR: &str = " | ";
const GOAL_MAX_CHARS: usize = 96;
const OUTCOME_MAX_CHARS: usize = 120;
const ACTIONS_MAX_CHARS: usize = 160;
const CODE_MAX_CHARS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Plan,
    Final,
    Other,
}

/// 已解析的记忆行（借用原始文本）
#[derive(Debug, Clone)]
pub struct MemoryLine<'a> {
    pub raw: &'a str,
    pub kind: LineKind,
    fields: Vec<(&'a str, &'a str)>,
}

impl<'a> MemoryLine<'a> {
    pub fn parse(raw: &'a str) -> Self {
        let (kind, body) = if let Some(rest) = raw.strip_prefix(PLAN_TAG) {
            (LineKind::Plan, rest)
        } else if let Some(rest) = raw.strip_prefix(FINAL_TAG) {
            (LineKind::Final, rest)
        } else {
            (LineKind::Other, raw)
        };
        let fields = body
            .split(FIELD_SEPARATOR)
            .filter_map(|part| {
                let (k, v) = part.split_once('=')?;
                Some((k.trim(), v.trim()))
            })
            .collect();
        Self { raw, kind, fields }
    }

    pub fn field(&self, key: &str) -> Option<&'a str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .filter(|v| !v.is_empty())
    }

    pub fn goal(&self) -> Option<&'a str> {
        self.field("Goal")
    }

    pub fn scope(&self) -> Option<&'a str> {
        self.field("Scope")
    }

    pub fn error_code(&self) -> Option<&'a str> {
        self.field("Error")
    }

    /// 规划行且未产出任何文件 / 可视化动作
    pub fn is_chat_only(&self) -> bool {
        self.kind == LineKind::Plan && self.field("Actions").map_or(true, |a| a == NO_ACTIONS)
    }
}

/// 折叠空白、去掉分隔符并按字符截断
pub fn compact_value(value: &str, max_chars: usize) -> String {
    let collapsed = value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('|', "/");
    truncate_chars(&collapsed, max_chars)
}

pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut out: String = value.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

fn or_dash(value: &str) -> &str {
    if value.trim().is_empty() {
        "-"
    } else {
        value
    }
}

/// 规划阶段的记忆行；`actions` 为动作摘要，无动作时传 [`NO_ACTIONS`]
pub fn plan_line(goal: &str, scope: &str, actions: &str) -> String {
    format!(
        "{} Goal={} | Scope={} | Actions={}",
        PLAN_TAG,
        or_dash(&compact_value(goal, GOAL_MAX_CHARS)),
        or_dash(&compact_value(scope, GOAL_MAX_CHARS)),
        or_dash(&compact_value(actions, ACTIONS_MAX_CHARS)),
    )
}

/// 收尾 / 执行结果记忆行的输入
#[derive(Debug, Clone, Default)]
pub struct FinalLineInput<'a> {
    pub goal: &'a str,
    pub scope: &'a str,
    pub outcome: &'a str,
    pub compile: &'a str,
    pub action_status: &'a str,
    pub error_code: Option<&'a str>,
}

pub fn final_line(input: &FinalLineInput<'_>) -> String {
    let mut line = format!(
        "{} Goal={} | Scope={} | Outcome={} | Compile={} | ActionStatus={}",
        FINAL_TAG,
        or_dash(&compact_value(input.goal, GOAL_MAX_CHARS)),
        or_dash(&compact_value(input.scope, GOAL_MAX_CHARS)),
        or_dash(&compact_value(input.outcome, OUTCOME_MAX_CHARS)),
        or_dash(&compact_value(input.compile, CODE_MAX_CHARS)),
        or_dash(&compact_value(input.action_status, CODE_MAX_CHARS)),
    );
    if let Some(code) = input.error_code.map(str::trim).filter(|c| !c.is_empty()) {
        line.push_str(FIELD_SEPARATOR);
        line.push_str("Error=");
        line.push_str(&compact_value(code, CODE_MAX_CHARS).replace(' ', "_"));
    }
    line
}
