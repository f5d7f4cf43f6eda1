//! 路径 <-> 对象键的转换。
//!
//! 对象存储没有目录，目录只是键前缀加上可选的目录标记对象（以 `/` 结尾的空对象）。

pub const SEPARATOR: char = '/';

/// 文件路径对应的键：去掉开头的分隔符，根目录映射为空键。
pub fn to_key(path: &str) -> String {
    path.trim_start_matches(SEPARATOR).to_string()
}

/// 目录路径对应的键前缀，保证恰好一个结尾分隔符。
///
/// 根目录的前缀为空字符串，列举它即列举整个桶；根目录从不存储标记对象。
pub fn to_dir_key(path: &str) -> String {
    let trimmed = path.trim_matches(SEPARATOR);
    if trimmed.is_empty() {
        return String::new();
    }
    let mut key = String::with_capacity(trimmed.len() + 1);
    key.push_str(trimmed);
    key.push(SEPARATOR);
    key
}

pub fn is_root(path: &str) -> bool {
    path.trim_matches(SEPARATOR).is_empty()
}

/// `key` 相对于 `prefix` 的直接子项名称。
///
/// 目录标记本身、孙子项返回 `None`；公共前缀的结尾分隔符会被去掉。
pub fn child_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    let rest = rest.strip_suffix(SEPARATOR).unwrap_or(rest);
    if rest.is_empty() || rest.contains(SEPARATOR) {
        return None;
    }
    Some(rest)
}

/// 拼接父路径和子项名称，结果总是以 `/` 开头。
pub fn join(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches(SEPARATOR);
    format!("{}{}{}", parent, SEPARATOR, name)
}
