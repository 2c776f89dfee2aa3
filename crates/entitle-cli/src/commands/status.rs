//! Status command
//!
//! Shows the persisted entitlement state and the flags derived from it.

use anyhow::Result;
use entitle_core::entitlement::{ContextValue, PublisherSettings};
use entitle_core::ContextPublisher;
use serde_json::{json, Map, Value};

use super::Context;
use crate::output::{print_rows_or_json, FieldRow};

pub async fn execute(ctx: &Context) -> Result<()> {
    let context = ContextPublisher::new(ctx.store.clone(), PublisherSettings::from(&ctx.config));
    let flags = context.flags();
    let slots = flags.slots();

    let rows: Vec<FieldRow> = slots
        .iter()
        .map(|(name, value)| FieldRow::new(*name, value))
        .collect();

    let mut published = Map::new();
    for (name, value) in slots {
        published.insert(name.to_string(), slot_json(value));
    }
    let value = json!({
        "state": context.state(),
        "flags": published,
    });

    print_rows_or_json(&rows, &value, ctx.format)
}

fn slot_json(value: ContextValue) -> Value {
    match value {
        ContextValue::Bool(b) => Value::Bool(b),
        ContextValue::Text(text) => text.map(Value::String).unwrap_or(Value::Null),
        ContextValue::List(list) => list
            .map(|items| Value::Array(items.into_iter().map(Value::String).collect()))
            .unwrap_or(Value::Null),
    }
}
