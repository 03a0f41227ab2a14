//! CGI environment decoding: a flat parameter map plus body bytes become a
//! structured [`Request`]. Shared by the FastCGI engine and the one-shot CGI
//! driver.

use std::collections::HashMap;

use bytes::Bytes;
use percent_encoding::percent_decode_str;

/// Methods that may carry a request body.
const BODY_METHODS: [&str; 3] = ["POST", "PUT", "PATCH"];

/// A decoded application-facing request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Uppercased request method, `GET` when absent.
    pub method: String,
    /// Request URI as sent by the front-end, including any query component.
    pub uri: String,
    /// URI with the query component removed.
    pub path: String,
    /// Decoded query string, insertion-ordered.
    pub query: QueryMap,
    /// Header names lowercased and hyphenated (`HTTP_USER_AGENT` ->
    /// `user-agent`); `CONTENT_TYPE` and `CONTENT_LENGTH` mapped in.
    pub headers: HashMap<String, String>,
    /// Cookie names to percent-decoded values.
    pub cookies: HashMap<String, String>,
    /// Body parsed according to the content type.
    pub body: Body,
    /// Unparsed body bytes.
    pub raw_body: Bytes,
    /// The `content-type` header, if any.
    pub content_type: Option<String>,
    /// `REMOTE_ADDR` as reported by the front-end.
    pub remote_addr: Option<String>,
    /// Synthesized absolute URL.
    pub url: String,
    /// The raw parameter map the request was decoded from.
    pub params: HashMap<String, String>,
}

/// Parsed request body.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// Empty body, binary payload, or non-body method.
    #[default]
    None,
    /// `text/*`, `application/xml`, untyped non-empty bodies, and JSON that
    /// failed to parse.
    Text(String),
    Json(serde_json::Value),
    /// `application/x-www-form-urlencoded`.
    Form(QueryMap),
}

/// Ordered key-value mapping for query strings and form bodies.
///
/// A key maps to a list when its wire form ends with `[]` or when the key
/// repeats; otherwise to a single value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryMap(Vec<(String, QueryValue)>);

#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Single(String),
    List(Vec<String>),
}

impl QueryMap {
    /// Decode an `application/x-www-form-urlencoded` string.
    pub fn parse(input: &str) -> Self {
        let mut map = QueryMap::default();
        for (key, value) in url::form_urlencoded::parse(input.as_bytes()) {
            let value = value.into_owned();
            match key.strip_suffix("[]") {
                Some(stripped) => map.push_list(stripped.to_string(), value),
                None => map.push(key.into_owned(), value),
            }
        }
        map
    }

    pub fn get(&self, key: &str) -> Option<&QueryValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// The value for `key` when it is single-valued.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            QueryValue::Single(v) => Some(v),
            QueryValue::List(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, QueryValue)> {
        self.0.iter()
    }

    fn entry_mut(&mut self, key: &str) -> Option<&mut QueryValue> {
        self.0.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn push(&mut self, key: String, value: String) {
        match self.entry_mut(&key) {
            None => self.0.push((key, QueryValue::Single(value))),
            Some(slot) => match slot {
                QueryValue::Single(existing) => {
                    let first = std::mem::take(existing);
                    *slot = QueryValue::List(vec![first, value]);
                }
                QueryValue::List(list) => list.push(value),
            },
        }
    }

    fn push_list(&mut self, key: String, value: String) {
        match self.entry_mut(&key) {
            None => self.0.push((key, QueryValue::List(vec![value]))),
            Some(slot) => match slot {
                QueryValue::Single(existing) => {
                    let first = std::mem::take(existing);
                    *slot = QueryValue::List(vec![first, value]);
                }
                QueryValue::List(list) => list.push(value),
            },
        }
    }
}

impl Request {
    /// Decode a parameter map and body bytes into a request.
    pub fn from_params(params: HashMap<String, String>, body: Bytes) -> Self {
        let method = params
            .get("REQUEST_METHOD")
            .map(|m| m.to_ascii_uppercase())
            .unwrap_or_else(|| "GET".to_string());

        let headers = extract_headers(&params);
        let cookies = headers
            .get("cookie")
            .map(|raw| parse_cookies(raw))
            .unwrap_or_default();

        let uri = params
            .get("REQUEST_URI")
            .or_else(|| params.get("SCRIPT_NAME"))
            .cloned()
            .unwrap_or_else(|| "/".to_string());
        let path = uri
            .split_once('?')
            .map(|(p, _)| p.to_string())
            .unwrap_or_else(|| uri.clone());

        let query = params
            .get("QUERY_STRING")
            .filter(|qs| !qs.is_empty())
            .map(|qs| QueryMap::parse(qs))
            .unwrap_or_default();

        let content_type = headers.get("content-type").cloned();
        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok());

        // Only body-carrying methods read stdin, capped at CONTENT_LENGTH.
        let raw_body = if BODY_METHODS.contains(&method.as_str()) {
            match content_length {
                Some(len) if body.len() > len => body.slice(..len),
                _ => body,
            }
        } else {
            Bytes::new()
        };
        let parsed = Body::parse(content_type.as_deref(), &raw_body);

        let scheme = if params
            .get("HTTPS")
            .is_some_and(|v| v.eq_ignore_ascii_case("on"))
        {
            "https"
        } else {
            "http"
        };
        let host = headers
            .get("host")
            .cloned()
            .or_else(|| params.get("SERVER_NAME").cloned())
            .unwrap_or_else(|| "localhost".to_string());
        let url = format!("{scheme}://{host}{uri}");

        let remote_addr = params.get("REMOTE_ADDR").cloned();

        Request {
            method,
            uri,
            path,
            query,
            headers,
            cookies,
            body: parsed,
            raw_body,
            content_type,
            remote_addr,
            url,
            params,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

fn extract_headers(params: &HashMap<String, String>) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in params {
        if let Some(suffix) = name.strip_prefix("HTTP_") {
            let key = http_suffix_to_header_name(suffix.as_bytes());
            if let Some(existing) = headers.get_mut(&key) {
                existing.push_str(", ");
                existing.push_str(value);
            } else {
                headers.insert(key, value.clone());
            }
        }
    }
    if let Some(ct) = params.get("CONTENT_TYPE") {
        if !ct.is_empty() {
            headers.insert("content-type".to_string(), ct.clone());
        }
    }
    if let Some(cl) = params.get("CONTENT_LENGTH") {
        if !cl.is_empty() {
            headers.insert("content-length".to_string(), cl.clone());
        }
    }
    headers
}

fn http_suffix_to_header_name(suffix: &[u8]) -> String {
    let mut out = String::with_capacity(suffix.len());
    for &b in suffix {
        let b = match b {
            b'_' => b'-',
            b'A'..=b'Z' => b + 32,
            _ => b,
        };
        out.push(b as char);
    }
    out
}

fn parse_cookies(raw: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for token in raw.split(';') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (name, value) = token.split_once('=').unwrap_or((token, ""));
        if name.is_empty() {
            continue;
        }
        let value = percent_decode_str(value).decode_utf8_lossy().into_owned();
        cookies.insert(name.to_string(), value);
    }
    cookies
}

impl Body {
    /// Dispatch on the lowercased media type, ignoring parameters such as
    /// `charset`.
    fn parse(content_type: Option<&str>, raw: &Bytes) -> Body {
        if raw.is_empty() {
            return Body::None;
        }
        let media_type = content_type
            .map(|ct| {
                ct.split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_ascii_lowercase()
            })
            .unwrap_or_default();

        match media_type.as_str() {
            "application/json" => match serde_json::from_slice(raw) {
                Ok(value) => Body::Json(value),
                // Unparseable JSON degrades to the raw text.
                Err(_) => Body::Text(String::from_utf8_lossy(raw).into_owned()),
            },
            "application/x-www-form-urlencoded" => {
                Body::Form(QueryMap::parse(&String::from_utf8_lossy(raw)))
            }
            "application/xml" => Body::Text(String::from_utf8_lossy(raw).into_owned()),
            "" => Body::Text(String::from_utf8_lossy(raw).into_owned()),
            t if t.starts_with("text/") => Body::Text(String::from_utf8_lossy(raw).into_owned()),
            _ => Body::None,
        }
    }
}
