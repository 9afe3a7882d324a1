//! 任务分配（TaskAllocation）：抽取回合产出的结构化动作计划及其校验
//!
//! 文件动作与可视化动作各 4 种，形状固定；任何结构问题都是不可重试的 Schema 错误。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::PlannerError;
use crate::memory::NO_ACTIONS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskAllocation {
    pub reasoning_and_plan: String,
    #[serde(default)]
    pub file_actions: Vec<FileAction>,
    #[serde(default)]
    pub visual_layer_actions: Vec<VisualAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileAction {
    CreateFile { path: String, content: String },
    UpdateFile { path: String, content: String },
    RenameFile { old_path: String, new_path: String },
    DeleteFile { path: String },
}

impl FileAction {
    pub fn kind(&self) -> &'static str {
        match self {
            FileAction::CreateFile { .. } => "create_file",
            FileAction::UpdateFile { .. } => "update_file",
            FileAction::RenameFile { .. } => "rename_file",
            FileAction::DeleteFile { .. } => "delete_file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PrimitiveType {
    Cube,
    Sphere,
    Capsule,
    Cylinder,
    Plane,
    Quad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum UiType {
    Canvas,
    Panel,
    Button,
    Image,
    Text,
    #[serde(rename = "TMP_Text")]
    TmpText,
    InputField,
    Toggle,
    Slider,
    ScrollView,
    RawImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VisualAction {
    AddComponent {
        target_object_path: String,
        component_assembly_qualified_name: String,
    },
    RemoveComponent {
        target_object_path: String,
        /// 短名或程序集限定名均可
        component_name: String,
    },
    ReplaceComponent {
        target_object_path: String,
        source_component_assembly_qualified_name: String,
        component_assembly_qualified_name: String,
    },
    /// primitive_type 与 ui_type 恰好设置一个
    CreateGameobject {
        name: String,
        parent_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        primitive_type: Option<PrimitiveType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ui_type: Option<UiType>,
    },
}

impl VisualAction {
    pub fn kind(&self) -> &'static str {
        match self {
            VisualAction::AddComponent { .. } => "add_component",
            VisualAction::RemoveComponent { .. } => "remove_component",
            VisualAction::ReplaceComponent { .. } => "replace_component",
            VisualAction::CreateGameobject { .. } => "create_gameobject",
        }
    }
}

/// 抽取回合要求的输出形状（仅用于生成 outputSchema）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ExtractionOutput {
    /// 纯聊天 / 不可执行的请求为 null
    task_allocation: Option<TaskAllocation>,
}

/// 抽取回合的 outputSchema
pub fn extraction_output_schema() -> Value {
    let schema = schemars::schema_for!(ExtractionOutput);
    serde_json::to_value(schema).unwrap_or(Value::Null)
}

impl TaskAllocation {
    /// 校验并规整 `task_allocation` 的值；null 表示没有可执行动作
    ///
    /// `reasoning_and_plan` 缺失或为空时用推理阶段的文本代替。
    pub fn from_value(value: &Value, reasoning_fallback: &str) -> Result<Option<Self>, PlannerError> {
        let obj = match value {
            Value::Null => return Ok(None),
            Value::Object(obj) => obj,
            other => {
                return Err(PlannerError::Schema(format!(
                    "task_allocation must be an object or null, got {}",
                    type_name(other)
                )))
            }
        };

        let reasoning_and_plan = obj
            .get("reasoning_and_plan")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| reasoning_fallback.trim())
            .to_string();

        let file_actions = array_field(obj, "file_actions")?
            .iter()
            .enumerate()
            .map(|(i, v)| parse_file_action(v, &format!("file_actions[{}]", i)))
            .collect::<Result<Vec<_>, _>>()?;
        let visual_layer_actions = array_field(obj, "visual_layer_actions")?
            .iter()
            .enumerate()
            .map(|(i, v)| parse_visual_action(v, &format!("visual_layer_actions[{}]", i)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Self {
            reasoning_and_plan,
            file_actions,
            visual_layer_actions,
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.file_actions.is_empty() && self.visual_layer_actions.is_empty()
    }

    /// 记忆行的 Actions 摘要，如 `file=2[create_file,update_file];visual=1[add_component]`
    pub fn action_summary(&self) -> String {
        if self.is_empty() {
            return NO_ACTIONS.to_string();
        }
        let mut parts = Vec::new();
        if !self.file_actions.is_empty() {
            parts.push(format!(
                "file={}[{}]",
                self.file_actions.len(),
                distinct(self.file_actions.iter().map(FileAction::kind))
            ));
        }
        if !self.visual_layer_actions.is_empty() {
            parts.push(format!(
                "visual={}[{}]",
                self.visual_layer_actions.len(),
                distinct(self.visual_layer_actions.iter().map(VisualAction::kind))
            ));
        }
        parts.join(";")
    }
}

fn distinct<'a>(kinds: impl Iterator<Item = &'a str>) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for kind in kinds {
        if !seen.contains(&kind) {
            seen.push(kind);
        }
    }
    seen.join(",")
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn array_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a [Value], PlannerError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(other) => Err(PlannerError::Schema(format!(
            "{} must be an array, got {}",
            key,
            type_name(other)
        ))),
    }
}

fn required_str(obj: &Map<String, Value>, key: &str, at: &str) -> Result<String, PlannerError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PlannerError::Schema(format!("{}: missing required field '{}'", at, key)))
}

/// 文件内容允许为空串，但必须是字符串
fn required_content(obj: &Map<String, Value>, at: &str) -> Result<String, PlannerError> {
    obj.get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PlannerError::Schema(format!("{}: missing required field 'content'", at)))
}

fn action_object<'a>(value: &'a Value, at: &str) -> Result<(&'a Map<String, Value>, &'a str), PlannerError> {
    let obj = value
        .as_object()
        .ok_or_else(|| PlannerError::Schema(format!("{}: action must be an object", at)))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| PlannerError::Schema(format!("{}: missing action type", at)))?;
    Ok((obj, kind))
}

fn parse_file_action(value: &Value, at: &str) -> Result<FileAction, PlannerError> {
    let (obj, kind) = action_object(value, at)?;
    match kind {
        "create_file" => Ok(FileAction::CreateFile {
            path: required_str(obj, "path", at)?,
            content: required_content(obj, at)?,
        }),
        "update_file" => Ok(FileAction::UpdateFile {
            path: required_str(obj, "path", at)?,
            content: required_content(obj, at)?,
        }),
        "rename_file" => Ok(FileAction::RenameFile {
            old_path: required_str(obj, "old_path", at)?,
            new_path: required_str(obj, "new_path", at)?,
        }),
        "delete_file" => Ok(FileAction::DeleteFile {
            path: required_str(obj, "path", at)?,
        }),
        other => Err(PlannerError::Schema(format!(
            "{}: unsupported file action type '{}'",
            at, other
        ))),
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(obj: &Map<String, Value>, key: &str, at: &str) -> Result<Option<T>, PlannerError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|_| PlannerError::Schema(format!("{}: invalid {} {}", at, key, v))),
    }
}

fn parse_visual_action(value: &Value, at: &str) -> Result<VisualAction, PlannerError> {
    let (obj, kind) = action_object(value, at)?;
    match kind {
        "add_component" => Ok(VisualAction::AddComponent {
            target_object_path: required_str(obj, "target_object_path", at)?,
            component_assembly_qualified_name: required_str(
                obj,
                "component_assembly_qualified_name",
                at,
            )?,
        }),
        "remove_component" => {
            let component_name = required_str(obj, "component_name", at)
                .or_else(|_| required_str(obj, "component_assembly_qualified_name", at))
                .map_err(|_| {
                    PlannerError::Schema(format!(
                        "{}: missing required field 'component_name'",
                        at
                    ))
                })?;
            Ok(VisualAction::RemoveComponent {
                target_object_path: required_str(obj, "target_object_path", at)?,
                component_name,
            })
        }
        "replace_component" => Ok(VisualAction::ReplaceComponent {
            target_object_path: required_str(obj, "target_object_path", at)?,
            source_component_assembly_qualified_name: required_str(
                obj,
                "source_component_assembly_qualified_name",
                at,
            )?,
            component_assembly_qualified_name: required_str(
                obj,
                "component_assembly_qualified_name",
                at,
            )?,
        }),
        "create_gameobject" => {
            let name = required_str(obj, "name", at)?;
            let parent_path = required_str(obj, "parent_path", at)?;
            let primitive_type: Option<PrimitiveType> = parse_enum(obj, "primitive_type", at)?;
            let ui_type: Option<UiType> = parse_enum(obj, "ui_type", at)?;
            if primitive_type.is_some() == ui_type.is_some() {
                return Err(PlannerError::Schema(format!(
                    "{}: create_gameobject needs exactly one of primitive_type or ui_type",
                    at
                )));
            }
            Ok(VisualAction::CreateGameobject {
                name,
                parent_path,
                primitive_type,
                ui_type,
            })
        }
        other => Err(PlannerError::Schema(format!(
            "{}: unsupported visual action type '{}'",
            at, other
        ))),
    }
}
