use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::borrow::Cow;
use std::time::Duration;

/// 详细日志等级：
/// - off：不输出请求/响应详情
/// - low：输出客户端请求/响应（格式化，脱敏，截断 base64）
/// - medium：额外输出上游请求/响应
/// - high：客户端 + 上游，完全原始输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" | "1" | "true" | "on" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

/// 需要掩码的请求头（小写）。
const SECRET_HEADERS: [&str; 6] = [
    "authorization",
    "proxy-authorization",
    "x-goog-api-key",
    "x-api-key",
    "x-admin-key",
    "cookie",
];

/// 按 base64 处理的 JSON 字段名。
const BASE64_FIELDS: [&str; 3] = ["data", "bytesBase64Encoded", "imageBytes"];

const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
const HEAD_TAIL: usize = 16 * 1024;
const MAX_TEXT_CHARS: usize = 32 * 1024;
const BASE64_KEEP: usize = 20;

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(level: LogLevel, method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    if !level.client_enabled() {
        return;
    }
    tracing::info!(
        "\n==================== 客户端请求 ====================\n[客户端请求] {method} {path}\n[请求头]\n{}\n[请求体]\n{}\n====================================================",
        format_headers(headers, level.raw_enabled()),
        format_body(body, level.raw_enabled()),
    );
}

pub fn client_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    if !level.client_enabled() {
        return;
    }
    tracing::info!(
        "\n==================== 客户端响应 ====================\n[客户端响应] {} {}ms\n{}\n====================================================",
        status,
        format_duration_ms(duration),
        format_body(body, level.raw_enabled()),
    );
}

pub fn backend_request(level: LogLevel, method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    if !level.backend_enabled() {
        return;
    }
    tracing::info!(
        "\n===================== 上游请求 =====================\n[上游请求] {method} {url}\n[请求头]\n{}\n[请求体]\n{}\n====================================================",
        format_headers(headers, level.raw_enabled()),
        format_body(body, level.raw_enabled()),
    );
}

pub fn backend_response(level: LogLevel, status: u16, duration: Duration, body: &[u8]) {
    if !level.backend_enabled() {
        return;
    }
    tracing::info!(
        "\n===================== 上游响应 =====================\n[上游响应] {} {}ms\n{}\n====================================================",
        status,
        format_duration_ms(duration),
        format_body(body, level.raw_enabled()),
    );
}

fn format_headers(headers: &HeaderMap, raw: bool) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let val = if !raw && SECRET_HEADERS.contains(&key.to_lowercase().as_str()) {
            "***"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(val);
        out.push('\n');
    }
    out
}

fn format_body(bytes: &[u8], raw: bool) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    if raw {
        return String::from_utf8_lossy(bytes).into_owned();
    }

    // 极端大包：不为日志做完整解析。
    if bytes.len() > MAX_PARSE_BYTES {
        let head = &bytes[..HEAD_TAIL];
        let tail = &bytes[bytes.len() - HEAD_TAIL..];
        return format!(
            "(body too large: {} bytes, showing head/tail)\n--- head ---\n{}\n--- tail ---\n{}",
            bytes.len(),
            String::from_utf8_lossy(head),
            String::from_utf8_lossy(tail),
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => {
            let sanitized = sanitize_json(&v);
            sonic_rs::to_string_pretty(&sanitized).unwrap_or_else(|_| sanitized.to_string())
        }
        Err(_) => truncate_text(&String::from_utf8_lossy(bytes)),
    }
}

/// 递归截断 JSON 中的 base64 负载（图片数据）。
pub fn sanitize_json(v: &sonic_rs::Value) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            let sanitized = match child.as_str() {
                Some(s) if BASE64_FIELDS.contains(&key) => {
                    sonic_rs::Value::from(truncate_base64(s).as_ref())
                }
                _ => sanitize_json(child),
            };
            out.insert(key, sanitized);
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let out: Vec<sonic_rs::Value> = arr.iter().map(sanitize_json).collect();
        return sonic_rs::Value::from(out);
    }

    if let Some(s) = v.as_str()
        && s.contains(";base64,")
    {
        return sonic_rs::Value::from(truncate_base64(s).as_ref());
    }

    v.to_owned()
}

fn truncate_base64(s: &str) -> Cow<'_, str> {
    let (prefix, payload) = match s.find(";base64,") {
        Some(idx) => s.split_at(idx + ";base64,".len()),
        None => ("", s),
    };
    if payload.len() <= 100 || !payload.is_ascii() {
        return Cow::Borrowed(s);
    }

    let omitted = payload.len() - BASE64_KEEP * 2;
    Cow::Owned(format!(
        "{prefix}{}...[TRUNCATED: {omitted} chars]...{}",
        &payload[..BASE64_KEEP],
        &payload[payload.len() - BASE64_KEEP..],
    ))
}

fn truncate_text(s: &str) -> String {
    if s.chars().count() <= MAX_TEXT_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_TEXT_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}
