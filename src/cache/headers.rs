//! HTTPヘッダーマップ
//!
//! 挿入順と元の大文字小文字を保持しつつ、名前の照合は大文字小文字を
//! 区別しないヘッダーマップを提供します。キャッシュレコードへの
//! 永続化時は「ヘッダー名 → 値の配列」のJSONオブジェクトとして
//! シリアライズされ、デコード時に挿入順が再現されます。

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// ヘッダーマップ
///
/// 同名ヘッダーは1エントリに値リストとしてまとめられます。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// ヘッダー値を追加（同名が存在すれば値リストに追記）
    pub fn append(&mut self, name: &str, value: &str) {
        match self.position(name) {
            Some(idx) => self.entries[idx].1.push(value.to_string()),
            None => self
                .entries
                .push((name.to_string(), vec![value.to_string()])),
        }
    }

    /// ヘッダーを設定（同名の既存値はすべて置換）
    pub fn set(&mut self, name: &str, value: &str) {
        match self.position(name) {
            Some(idx) => {
                let values = &mut self.entries[idx].1;
                values.clear();
                values.push(value.to_string());
            }
            None => self
                .entries
                .push((name.to_string(), vec![value.to_string()])),
        }
    }

    /// 最初の値を取得（大文字小文字を区別しない）
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(|s| s.as_str())
    }

    /// すべての値を取得
    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// ヘッダーを削除
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// (名前, 値) ペアを挿入順に列挙
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, values)| values.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Headers {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of header name to value list")
            }

            fn visit_map<M>(self, mut access: M) -> std::result::Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(8));
                while let Some((name, values)) = access.next_entry::<String, Vec<String>>()? {
                    entries.push((name, values));
                }
                Ok(Headers { entries })
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}
