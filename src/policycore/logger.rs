/*
 * Copyright (C) 2024 The Policycore Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::policycore::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
#[cfg(not(test))]
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "policycore";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unsupported log format '{other}' (expected text or json)")),
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "unsupported log level '{other}' (expected debug, info, warn, or error)"
            )),
        }
    }
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);
#[cfg(not(test))]
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
// Tests assert on debug lines emitted by reconcilers.
#[cfg(test)]
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

pub fn set_log_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn current_log_level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ','))
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

fn render_text(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| {
            if needs_quoting(value) {
                format!("{key}={}", quote(value))
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_json(fields: &[(&str, &str)]) -> String {
    let mut payload = Map::new();
    for (key, value) in fields.iter().filter(|(key, _)| !key.is_empty()) {
        payload.insert((*key).to_string(), Value::String((*value).to_string()));
    }
    Value::Object(payload).to_string()
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    if level < current_log_level() {
        return;
    }

    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let pid = std::process::id().to_string();
    let trace = tracing::current_context();

    let mut fields: Vec<(&str, &str)> = vec![
        ("ts", timestamp.as_str()),
        ("level", level.as_str()),
        ("service", SERVICE_NAME),
        ("component", component),
        ("pid", pid.as_str()),
        ("msg", message),
    ];
    if let Some(ctx) = trace.as_ref() {
        fields.push(("trace_id", ctx.trace_id()));
        fields.push(("span_id", ctx.span_id()));
    }
    fields.extend_from_slice(metadata);

    let line = match current_log_format() {
        LogFormat::Text => render_text(&fields),
        LogFormat::Json => render_json(&fields),
    };
    write_line(level, &line);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let result = if level >= LogLevel::Warn {
        writeln!(io::stderr().lock(), "{line}")
    } else {
        writeln!(io::stdout().lock(), "{line}")
    };

    if let Err(error) = result {
        let _ = writeln!(
            io::stderr().lock(),
            "policycore: failed to write log line: {error} (original: {line})"
        );
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Returns captured lines containing `needle`, leaving others in place so
/// tests running in parallel do not steal each other's lines.
#[cfg(test)]
pub(crate) fn take_test_logs_matching(needle: &str) -> Vec<(LogLevel, String)> {
    let mut store = test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let (matching, rest): (Vec<_>, Vec<_>) = store
        .drain(..)
        .partition(|(_, line)| line.contains(needle));
    *store = rest;
    matching
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policycore::observability::tracing;

    #[test]
    fn parses_format_and_level() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!(LogLevel::Debug < LogLevel::Error);
    }

    #[test]
    fn text_quotes_values_with_spaces() {
        let line = render_text(&[("msg", "policy not found"), ("kind", "PolicyKindA")]);
        assert_eq!(line, "msg=\"policy not found\" kind=PolicyKindA");
        let empty = render_text(&[("namespace", "")]);
        assert_eq!(empty, "namespace=\"\"");
    }

    #[tokio::test]
    async fn text_logs_include_trace_ids() {
        tracing::init();
        tracing::with_span("test.component", "text-log", async {
            log_info("logger-text-test", "testing", &[("namespace", "default")]);
        })
        .await;

        let logs = take_test_logs_matching("component=logger-text-test");
        assert_eq!(logs.len(), 1);
        let (level, line) = &logs[0];
        assert_eq!(*level, LogLevel::Info);
        assert!(line.contains("trace_id=") && line.contains("span_id="), "{line}");
        assert!(line.contains("namespace=default"), "{line}");
    }

    #[test]
    fn json_rendering_carries_metadata() {
        let line = render_json(&[("component", "unit"), ("key", "value"), ("", "skipped")]);
        let payload: Value = serde_json::from_str(&line).expect("valid json log");
        assert_eq!(payload["component"], "unit");
        assert_eq!(payload["key"], "value");
        assert_eq!(payload.as_object().map(|o| o.len()), Some(2));
    }
}
