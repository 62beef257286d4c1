//! Trace Context Propagation over AMQP Headers
//!
//! Injects and extracts the W3C text-map representation of the current span
//! context plus baggage into message headers. Header values travel as byte
//! arrays on the wire and are decoded as UTF-8 on extract; header name
//! lookup is case-insensitive.

use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};

fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()) as Box<dyn TextMapPropagator + Send + Sync>,
        Box::new(BaggagePropagator::new()),
    ])
}

/// Write the context (span + baggage) into the header table, creating the
/// entries as UTF-8 long strings.
pub fn inject(context: &Context, headers: &mut FieldTable) {
    propagator().inject_context(context, &mut FieldTableInjector(headers));
}

/// Read the propagated context back from a header table.
pub fn extract(headers: &FieldTable) -> Context {
    propagator().extract(&FieldTableExtractor(headers))
}

struct FieldTableInjector<'a>(&'a mut FieldTable);

impl Injector for FieldTableInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_string()),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

struct FieldTableExtractor<'a>(&'a FieldTable);

impl Extractor for FieldTableExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .inner()
            .iter()
            .find(|(name, _)| name.as_str().eq_ignore_ascii_case(key))
            .and_then(|(_, value)| header_value_as_str(value))
    }

    fn keys(&self) -> Vec<&str> {
        self.0.inner().keys().map(ShortString::as_str).collect()
    }
}

fn header_value_as_str(value: &AMQPValue) -> Option<&str> {
    match value {
        AMQPValue::LongString(bytes) => std::str::from_utf8(bytes.as_bytes()).ok(),
        AMQPValue::ShortString(string) => Some(string.as_str()),
        _ => None,
    }
}
