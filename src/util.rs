//! 共通ユーティリティ

use crate::cache::headers::Headers;

/// Cookieヘッダーから指定名の値を取り出す
pub fn get_cookie_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let cookie_header = headers.get("Cookie")?;
    for pair in cookie_header.split(';') {
        let pair = pair.trim();
        if let Some((k, v)) = pair.split_once('=') {
            if k == name {
                return Some(v);
            }
        }
    }
    None
}

/// `${NAME}` 形式の参照を環境変数から解決する
///
/// 参照形式でない値、または未設定の環境変数の場合は元の値を返します。
pub fn resolve_env_value(value: &str) -> String {
    if let Some(name) = value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        if let Ok(resolved) = std::env::var(name) {
            return resolved;
        }
    }
    value.to_string()
}

/// `Name:Value` 形式のヘッダー設定リストをパース
///
/// 値に含まれる `${NAME}` は環境変数で置換されます。コロンを含まない
/// 要素は無視されます。
pub fn parse_header_list(list: &[String]) -> Vec<(String, String)> {
    list.iter()
        .filter_map(|item| {
            let (name, value) = item.split_once(':')?;
            Some((name.trim().to_string(), resolve_env_value(value.trim())))
        })
        .collect()
}
