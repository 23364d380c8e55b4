use std::collections::BTreeMap;
use tracing::{debug, error, info, trace, warn};

/// Context information attached to every message of a component logger
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g., "allocator", "battery", "opendtu")
    pub component: String,
    /// Inverter index in control order
    pub inverter: Option<usize>,
    /// Inverter serial number, once known
    pub serial: Option<String>,
    /// Additional context fields, emitted in key order
    pub extra_fields: BTreeMap<String, String>,
}

impl LogContext {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            inverter: None,
            serial: None,
            extra_fields: BTreeMap::new(),
        }
    }

    pub fn with_inverter(mut self, idx: usize) -> Self {
        self.inverter = Some(idx);
        self
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        if !serial.is_empty() {
            self.serial = Some(serial.to_string());
        }
        self
    }

    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Logger that prefixes its context as a `fields` value
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
}

impl StructuredLogger {
    pub fn new(context: LogContext) -> Self {
        Self { context }
    }

    /// Same component, scoped to one inverter
    pub fn for_inverter(&self, idx: usize, serial: &str) -> Self {
        Self::new(self.context.clone().with_inverter(idx).with_serial(serial))
    }

    pub fn info(&self, message: &str) {
        let fields = self.format_fields();
        info!(%fields, "{}", message);
    }
    pub fn warn(&self, message: &str) {
        let fields = self.format_fields();
        warn!(%fields, "{}", message);
    }
    pub fn error(&self, message: &str) {
        let fields = self.format_fields();
        error!(%fields, "{}", message);
    }
    pub fn debug(&self, message: &str) {
        let fields = self.format_fields();
        debug!(%fields, "{}", message);
    }
    pub fn trace(&self, message: &str) {
        let fields = self.format_fields();
        trace!(%fields, "{}", message);
    }

    pub(crate) fn format_fields(&self) -> String {
        let mut fields = vec![format!("component={}", self.context.component)];
        if let Some(idx) = self.context.inverter {
            fields.push(format!("inverter={}", idx));
        }
        if let Some(ref serial) = self.context.serial {
            fields.push(format!("serial={}", serial));
        }
        for (key, value) in &self.context.extra_fields {
            fields.push(format!("{}={}", key, value));
        }
        fields.join(",")
    }
}

/// Create a logger for a specific component
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

/// Create a logger with full context
pub fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}
