use std::{collections::VecDeque, sync::Arc};

use tokio::sync::broadcast;

pub(crate) const LOG_RING_CAP: usize = 500;

/// Mirrors tracing events as JSON lines into a ring buffer and a broadcast
/// channel for `GET /api/logs`.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

/// Collects the message plus structured fields of one event.
#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for EventVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.into());
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let mut text = format!("{value:?}");
        // Debug on &str adds quotes
        if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
            text = text[1..text.len() - 1].to_string();
        }
        if field.name() == "message" {
            self.message = text;
        } else {
            self.fields.insert(field.name().to_string(), text.into());
        }
    }
}

pub(crate) fn category_for(target: &str) -> &'static str {
    if target.contains("approval") || target.contains("telegram") {
        "approval"
    } else if target.contains("codefix") || target.contains("cloud") {
        "codefix"
    } else if target.contains("orchestrator")
        || target.contains("executor")
        || target.contains("verifier")
        || target.contains("classifier")
        || target.contains("command")
    {
        "repair"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let json = serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "level": level,
            "category": category_for(event.metadata().target()),
            "message": visitor.message,
            "fields": visitor.fields,
        })
        .to_string();

        let _ = self.tx.send(json.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(json);
            if ring.len() > LOG_RING_CAP {
                ring.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::category_for;

    #[test]
    fn targets_map_to_categories() {
        assert_eq!(category_for("mend_core::approval"), "approval");
        assert_eq!(category_for("mend_agent::cloud"), "codefix");
        assert_eq!(category_for("mend_core::executor"), "repair");
        assert_eq!(category_for("tower_http::trace::on_response"), "system");
    }
}
