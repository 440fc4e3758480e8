//! Property resolution for a feed being provisioned.
//!
//! The template's full declaration goes in; only the properties a feed needs
//! to remember come out:
//!
//! 1. user values are matched onto the template's properties (by processor id
//!    and name, falling back to processor display name and name),
//! 2. properties whose value differs from the template default are kept,
//! 3. `${metadata.*}` placeholders are resolved,
//! 4. input-processor properties are always kept.
//!
//! Categories are unioned by [`PropertyKey`] in the order modified, matched,
//! resolved, input; a later category wins for the same key. Matched comes
//! after modified so an explicit user value is authoritative.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{FeedMgrError, Result};
use crate::expression::{resolve_expressions, ExpressionContext};
use crate::store::{ReadTx, ReadTxExt};
use crate::types::{Property, PropertyKey, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    IdKey,
    ProcessorName,
    Unmatched,
}

#[derive(Debug, Clone)]
pub struct PropertyResolution {
    /// Final property list, in template declaration order.
    pub properties: Vec<Property>,
    pub strategy: MatchStrategy,
    pub matched: usize,
    pub modified: usize,
    pub resolved: usize,
    pub inputs: usize,
}

/// Find a template by id, falling back to its name.
pub fn locate_template(
    tx: &dyn ReadTx,
    id: Option<&str>,
    name: Option<&str>,
) -> Result<Template> {
    if let Some(id) = id.filter(|s| !s.is_empty()) {
        if let Some(t) = tx.template(id)? {
            return Ok(t);
        }
    }
    if let Some(name) = name.filter(|s| !s.is_empty()) {
        if let Some(t) = tx.find_template_by_name(name)? {
            return Ok(t);
        }
    }
    let wanted = id.or(name).unwrap_or("<unspecified>");
    Err(FeedMgrError::TemplateNotFound(wanted.to_string()))
}

/// Overwrite every baseline property that has a user counterpart under
/// `key_of`. Returns copies of the updated properties.
fn match_and_update<K, F>(baseline: &mut [Property], submitted: &[Property], key_of: F) -> Vec<Property>
where
    K: Ord,
    F: Fn(&Property) -> K,
{
    let by_key: BTreeMap<K, &Property> = submitted.iter().map(|p| (key_of(p), p)).collect();
    let mut matched = Vec::new();
    for prop in baseline.iter_mut() {
        if let Some(user) = by_key.get(&key_of(prop)) {
            prop.value = user.value.clone();
            matched.push(prop.clone());
        }
    }
    matched
}

pub fn resolve_properties(
    template: &Template,
    submitted: &[Property],
    ctx: &ExpressionContext<'_>,
) -> PropertyResolution {
    let mut baseline = template.properties.clone();

    let mut strategy = MatchStrategy::IdKey;
    let mut matched = match_and_update(&mut baseline, submitted, Property::key);
    if matched.is_empty() {
        strategy = MatchStrategy::ProcessorName;
        matched = match_and_update(&mut baseline, submitted, |p| {
            (p.processor_name.clone(), p.name.clone())
        });
    }
    if matched.is_empty() {
        strategy = MatchStrategy::Unmatched;
    }

    let modified: Vec<Property> = baseline
        .iter()
        .filter(|p| p.is_modified_from_default())
        .cloned()
        .collect();
    let resolved = resolve_expressions(&mut baseline, ctx);
    let inputs: Vec<Property> = baseline.iter().filter(|p| p.input_port).cloned().collect();

    let position: BTreeMap<PropertyKey, usize> = baseline
        .iter()
        .enumerate()
        .map(|(i, p)| (p.key(), i))
        .collect();
    let mut union: BTreeMap<usize, Property> = BTreeMap::new();
    for prop in modified
        .iter()
        .chain(&matched)
        .chain(&resolved)
        .chain(&inputs)
    {
        if let Some(&i) = position.get(&prop.key()) {
            union.insert(i, prop.clone());
        }
    }

    tracing::debug!(
        "resolved {} properties for template {} ({} matched by {:?}, {} modified, {} expressions, {} inputs)",
        union.len(),
        template.name,
        matched.len(),
        strategy,
        modified.len(),
        resolved.len(),
        inputs.len()
    );

    PropertyResolution {
        properties: union.into_values().collect(),
        strategy,
        matched: matched.len(),
        modified: modified.len(),
        resolved: resolved.len(),
        inputs: inputs.len(),
    }
}
