//! Logger 协作者：分级 + 键值字段 + 子 logger

use std::fmt;
use std::sync::Arc;

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// 执行器与记忆使用的日志接口；仅用于诊断，不影响行为
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, msg: &str, fields: &[(&str, String)]);

    /// 派生携带固定字段的子 logger
    fn with(&self, fields: &[(&str, String)]) -> Arc<dyn Logger>;

    fn debug(&self, msg: &str, fields: &[(&str, String)]) {
        self.log(Level::Debug, msg, fields);
    }

    fn info(&self, msg: &str, fields: &[(&str, String)]) {
        self.log(Level::Info, msg, fields);
    }

    fn warn(&self, msg: &str, fields: &[(&str, String)]) {
        self.log(Level::Warn, msg, fields);
    }

    fn error(&self, msg: &str, fields: &[(&str, String)]) {
        self.log(Level::Error, msg, fields);
    }

    fn fatal(&self, msg: &str, fields: &[(&str, String)]) {
        self.log(Level::Fatal, msg, fields);
    }
}

/// 默认实现：转发到 tracing，字段拼成 `k=v` 形式
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    context: Vec<(String, String)>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn Logger> {
        Arc::new(Self::new())
    }

    fn render_fields(&self, fields: &[(&str, String)]) -> String {
        self.context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(fields.iter().map(|(k, v)| format!("{}={}", k, v)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, msg: &str, fields: &[(&str, String)]) {
        let fields = self.render_fields(fields);
        match level {
            Level::Debug => tracing::debug!(fields = %fields, "{}", msg),
            Level::Info => tracing::info!(fields = %fields, "{}", msg),
            Level::Warn => tracing::warn!(fields = %fields, "{}", msg),
            Level::Error => tracing::error!(fields = %fields, "{}", msg),
            Level::Fatal => tracing::error!(fatal = true, fields = %fields, "{}", msg),
        }
    }

    fn with(&self, fields: &[(&str, String)]) -> Arc<dyn Logger> {
        let mut context = self.context.clone();
        context.extend(fields.iter().map(|(k, v)| (k.to_string(), v.clone())));
        Arc::new(Self { context })
    }
}

/// 丢弃所有输出
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _msg: &str, _fields: &[(&str, String)]) {}

    fn with(&self, _fields: &[(&str, String)]) -> Arc<dyn Logger> {
        Arc::new(NoopLogger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        lines: Arc<Mutex<Vec<String>>>,
        prefix: Vec<(String, String)>,
    }

    impl Logger for Capture {
        fn log(&self, level: Level, msg: &str, fields: &[(&str, String)]) {
            let mut parts: Vec<String> = self.prefix.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            parts.extend(fields.iter().map(|(k, v)| format!("{}={}", k, v)));
            self.lines
                .lock()
                .unwrap()
                .push(format!("[{}] {} {}", level, msg, parts.join(" ")));
        }

        fn with(&self, fields: &[(&str, String)]) -> Arc<dyn Logger> {
            let mut prefix = self.prefix.clone();
            prefix.extend(fields.iter().map(|(k, v)| (k.to_string(), v.clone())));
            Arc::new(Capture {
                lines: self.lines.clone(),
                prefix,
            })
        }
    }

    #[test]
    fn test_child_logger_carries_fields() {
        let root = Capture::default();
        let lines = root.lines.clone();
        let child = root.with(&[("plan_id", "p1".to_string())]);
        child.warn("step failed", &[("step_id", "s2".to_string())]);
        let lines = lines.lock().unwrap();
        assert_eq!(lines[0], "[warn] step failed plan_id=p1 step_id=s2");
    }

    #[test]
    fn test_tracing_logger_renders_context_first() {
        let logger = TracingLogger {
            context: vec![("a".to_string(), "1".to_string())],
        };
        assert_eq!(logger.render_fields(&[("b", "2".to_string())]), "a=1 b=2");
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Fatal);
        assert_eq!(Level::Fatal.to_string(), "fatal");
    }
}
