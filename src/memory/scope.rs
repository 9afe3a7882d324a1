//! 当前焦点（选中对象路径 / 名称 / 场景）与记忆行 Scope 令牌的匹配

use serde_json::Value;

/// 本回合的编辑器焦点，从调用方传入的 context JSON 中宽松提取
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusScope {
    pub object_path: Option<String>,
    pub object_name: Option<String>,
    pub scene: Option<String>,
}

const PATH_KEYS: &[&[&str]] = &[
    &["selection", "path"],
    &["selection", "object_path"],
    &["selection", "hierarchy_path"],
    &["selected_object", "path"],
    &["selected_object_path"],
    &["target_path"],
];

const NAME_KEYS: &[&[&str]] = &[
    &["selection", "name"],
    &["selected_object", "name"],
    &["selected_object_name"],
];

const SCENE_KEYS: &[&[&str]] = &[
    &["scene", "path"],
    &["scene", "name"],
    &["scene_path"],
    &["active_scene"],
    &["scene"],
];

fn first_str(context: &Value, candidates: &[&[&str]]) -> Option<String> {
    candidates.iter().find_map(|path| {
        let mut node = context;
        for key in path.iter() {
            node = node.get(*key)?;
        }
        node.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

impl FocusScope {
    pub fn from_context(context: &Value) -> Self {
        Self {
            object_path: first_str(context, PATH_KEYS),
            object_name: first_str(context, NAME_KEYS),
            scene: first_str(context, SCENE_KEYS),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.object_path.is_none() && self.object_name.is_none() && self.scene.is_none()
    }

    /// 写入记忆行的 Scope 令牌；无焦点时为 "-"
    pub fn token(&self) -> String {
        if let Some(path) = &self.object_path {
            return path.clone();
        }
        if let Some(name) = &self.object_name {
            return name.clone();
        }
        if let Some(scene) = &self.scene {
            return format!("scene:{}", scene);
        }
        "-".to_string()
    }

    /// 记忆行的 Scope 令牌是否与当前焦点相关；无 Scope 的行视为全局行
    pub fn matches(&self, token: Option<&str>) -> bool {
        let token = match token.map(str::trim) {
            None | Some("") | Some("-") => return true,
            Some(t) => t,
        };
        if let Some(path) = &self.object_path {
            if token == path
                || token.starts_with(&format!("{}/", path))
                || path.starts_with(&format!("{}/", token))
            {
                return true;
            }
        }
        if let Some(name) = &self.object_name {
            if token == name || token.ends_with(&format!("/{}", name)) {
                return true;
            }
        }
        if let Some(scene) = &self.scene {
            if token == scene || token.strip_prefix("scene:") == Some(scene.as_str()) {
                return true;
            }
        }
        false
    }
}
