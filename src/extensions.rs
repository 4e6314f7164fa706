//! 上传与资源输出共用的扩展名白名单。

use std::collections::HashSet;

use crate::config::DEFAULT_ALLOWED_EXTENSIONS;

/// 不可变的小写扩展名集合，每项带前导点。
#[derive(Clone, Debug)]
pub struct AllowedExtensions {
    entries: HashSet<String>,
}

impl AllowedExtensions {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|entry| entry.as_ref().trim().to_ascii_lowercase())
            .filter(|entry| !entry.is_empty() && entry != ".")
            .map(|entry| {
                if entry.starts_with('.') {
                    entry
                } else {
                    format!(".{entry}")
                }
            })
            .collect();
        Self { entries }
    }

    /// 解析逗号分隔的自定义列表，为空时使用内置列表。
    pub fn from_config(list: Option<&str>) -> Self {
        match list {
            Some(list) if !list.trim().is_empty() => Self::new(list.split(',')),
            _ => Self::default(),
        }
    }

    /// 忽略大小写判断是否允许；空扩展名一律拒绝。
    pub fn is_allowed(&self, ext: &str) -> bool {
        if ext.is_empty() {
            return false;
        }
        self.entries.contains(&ext.to_ascii_lowercase())
    }

    /// 上传表单 `accept` 属性的值。
    pub fn accept_list(&self) -> String {
        let mut entries: Vec<&str> = self.entries.iter().map(String::as_str).collect();
        entries.sort_unstable();
        entries.join(",")
    }
}

impl Default for AllowedExtensions {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_EXTENSIONS)
    }
}

/// 返回最后一段路径的小写扩展名（含点）。
///
/// `.png` 这样的名称返回 `.png`，不含点的名称返回空字符串。
pub fn extension_of(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match base.rfind('.') {
        Some(index) => base[index..].to_ascii_lowercase(),
        None => String::new(),
    }
}
