use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::types::Property;

static METADATA_RE: OnceLock<Regex> = OnceLock::new();

fn metadata_re() -> &'static Regex {
    METADATA_RE.get_or_init(|| Regex::new(r"\$\{metadata\.([A-Za-z0-9_.\-]+)\}").unwrap())
}

/// Feed fields that `${metadata.<field>}` placeholders can refer to.
pub struct ExpressionContext<'a> {
    pub category: &'a str,
    pub system_feed_name: &'a str,
    pub feed_name: &'a str,
    pub user_fields: &'a BTreeMap<String, String>,
}

impl ExpressionContext<'_> {
    fn field(&self, path: &str) -> Option<&str> {
        match path {
            "category.systemName" => Some(self.category),
            "systemFeedName" => Some(self.system_feed_name),
            "feedName" => Some(self.feed_name),
            other => self.user_fields.get(other).map(String::as_str),
        }
    }
}

/// Replace placeholders in one value. Unknown fields are left as written.
/// Returns `None` when nothing was replaced.
pub fn resolve_value(value: &str, ctx: &ExpressionContext<'_>) -> Option<String> {
    let mut replaced = false;
    let out = metadata_re().replace_all(value, |caps: &Captures<'_>| match ctx.field(&caps[1]) {
        Some(v) => {
            replaced = true;
            v.to_string()
        }
        None => caps[0].to_string(),
    });
    match out {
        Cow::Owned(s) if replaced => Some(s),
        _ => None,
    }
}

/// Resolve placeholders across `properties` in place, returning a copy of
/// every property whose value changed.
pub fn resolve_expressions(
    properties: &mut [Property],
    ctx: &ExpressionContext<'_>,
) -> Vec<Property> {
    let mut resolved = Vec::new();
    for prop in properties.iter_mut() {
        let Some(value) = prop.value.as_deref() else {
            continue;
        };
        if let Some(new_value) = resolve_value(value, ctx) {
            prop.value = Some(new_value);
            resolved.push(prop.clone());
        }
    }
    resolved
}
