//! キャッシュキー生成
//!
//! リクエスト属性からキャッシュキーを組み立てます。フォーマットは
//! 空白区切りのトークン列で、設定の`identity`キーで変更できます。
//! デフォルトは `method host uri`（METHOD + SP + HOST + SP + URI）。
//!
//! 同一キーのリクエストはoriginから見て交換可能でなければならない、
//! というのがキーの不変条件です。

use crate::error::{Error, Result};
use crate::server::RequestMeta;
use crate::util::get_cookie_value;

/// キーを構成するトークン
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Host,
    Method,
    Path,
    Proto,
    Scheme,
    Uri,
    UserAgent,
    Query,
    /// `~name`: Cookie値
    Cookie(String),
    /// `>name`: ヘッダー値
    Header(String),
    /// `?name`: クエリパラメータ値
    QueryParam(String),
}

/// パース済みのidentityフォーマット
#[derive(Debug, Clone)]
pub struct Identity {
    tokens: Vec<Token>,
}

impl Identity {
    /// フォーマット文字列をパース
    ///
    /// 空文字列はデフォルトの `method host uri` になります。
    /// 未知のトークンは設定エラーです。
    pub fn parse(format: &str) -> Result<Identity> {
        let format = if format.trim().is_empty() {
            "method host uri"
        } else {
            format
        };
        let mut tokens = Vec::new();
        for part in format.split_whitespace() {
            let token = match part {
                "host" => Token::Host,
                "method" => Token::Method,
                "path" => Token::Path,
                "proto" => Token::Proto,
                "scheme" => Token::Scheme,
                "uri" => Token::Uri,
                "userAgent" => Token::UserAgent,
                "query" => Token::Query,
                _ => {
                    if let Some(name) = part.strip_prefix('~') {
                        Token::Cookie(name.to_string())
                    } else if let Some(name) = part.strip_prefix('>') {
                        Token::Header(name.to_string())
                    } else if let Some(name) = part.strip_prefix('?') {
                        Token::QueryParam(name.to_string())
                    } else {
                        return Err(Error::Config(format!("unknown identity token: {}", part)));
                    }
                }
            };
            tokens.push(token);
        }
        Ok(Identity { tokens })
    }

    /// リクエストからキャッシュキーを組み立てる
    ///
    /// 各トークンの値を単一スペースで連結します。存在しない値は
    /// 空文字列になります。
    pub fn build(&self, req: &RequestMeta) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                key.push(b' ');
            }
            let value: &str = match token {
                Token::Host => &req.host,
                Token::Method => &req.method,
                Token::Path => &req.path,
                Token::Proto => &req.proto,
                Token::Scheme => "http",
                Token::Uri => &req.uri,
                Token::UserAgent => req.headers.get("User-Agent").unwrap_or(""),
                Token::Query => &req.query,
                Token::Cookie(name) => get_cookie_value(&req.headers, name).unwrap_or(""),
                Token::Header(name) => req.headers.get(name).unwrap_or(""),
                Token::QueryParam(name) => req.query_param(name).unwrap_or(""),
            };
            key.extend_from_slice(value.as_bytes());
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::headers::Headers;

    fn sample_request() -> RequestMeta {
        let mut headers = Headers::new();
        headers.set("Host", "aslant.site");
        headers.set("User-Agent", "kura-test");
        headers.set("Cookie", "jt=token-1; theme=dark");
        headers.set("X-Device", "mobile");
        RequestMeta {
            method: "GET".to_string(),
            host: "aslant.site".to_string(),
            path: "/users/me".to_string(),
            query: "cache-control=no-cache&v=2".to_string(),
            uri: "/users/me?cache-control=no-cache&v=2".to_string(),
            proto: "HTTP/1.1".to_string(),
            client_ip: "127.0.0.1".to_string(),
            headers,
            body: Vec::new(),
        }
    }

    #[test]
    fn test_default_identity() {
        let identity = Identity::parse("").unwrap();
        let key = identity.build(&sample_request());
        assert_eq!(
            key,
            b"GET aslant.site /users/me?cache-control=no-cache&v=2".to_vec()
        );
    }

    #[test]
    fn test_custom_tokens() {
        let identity = Identity::parse("method scheme host path").unwrap();
        let key = identity.build(&sample_request());
        assert_eq!(key, b"GET http aslant.site /users/me".to_vec());
    }

    #[test]
    fn test_cookie_header_query_param_tokens() {
        let identity = Identity::parse("host ~jt >X-Device ?v").unwrap();
        let key = identity.build(&sample_request());
        assert_eq!(key, b"aslant.site token-1 mobile 2".to_vec());
    }

    #[test]
    fn test_missing_values_are_empty() {
        let identity = Identity::parse("host ~missing >X-None ?none").unwrap();
        let key = identity.build(&sample_request());
        assert_eq!(key, b"aslant.site   ".to_vec());
    }

    #[test]
    fn test_unknown_token_rejected() {
        assert!(Identity::parse("host nonsense").is_err());
    }

    #[test]
    fn test_user_agent_and_query() {
        let identity = Identity::parse("userAgent query proto").unwrap();
        let key = identity.build(&sample_request());
        assert_eq!(
            key,
            b"kura-test cache-control=no-cache&v=2 HTTP/1.1".to_vec()
        );
    }
}
