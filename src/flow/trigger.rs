use crate::flow::definition::{FlowDefinition, MatchMode, TriggerConfig};

/// Whether `text` fires this trigger. Both sides are trimmed and folded to
/// Unicode lowercase first, so "Oi " fires an exact trigger on "oi".
pub fn matches(trigger: &TriggerConfig, text: &str) -> bool {
    if !trigger.enabled {
        return false;
    }
    let text = text.trim().to_lowercase();
    let keyword = trigger.keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return false;
    }
    match trigger.match_mode {
        MatchMode::Exact => text == keyword,
        MatchMode::Contains => text.contains(&keyword),
        MatchMode::StartsWith => text.starts_with(&keyword),
    }
}

/// Pick the flow an unclaimed inbound message should start. Only consulted
/// when the conversation has no active session. Deterministic tie-break:
/// highest priority, then most recently updated, then lowest flow id.
pub fn best_match<'a>(flows: &'a [FlowDefinition], text: &str) -> Option<&'a FlowDefinition> {
    let mut candidates: Vec<&FlowDefinition> = flows
        .iter()
        .filter(|flow| flow.is_active)
        .filter(|flow| {
            flow.trigger
                .as_ref()
                .map(|t| matches(t, text))
                .unwrap_or(false)
        })
        .collect();

    candidates.sort_by(|a, b| {
        let pa = a.trigger.as_ref().map(|t| t.priority).unwrap_or(0);
        let pb = b.trigger.as_ref().map(|t| t.priority).unwrap_or(0);
        pb.cmp(&pa)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.id.cmp(&b.id))
    });
    candidates.first().copied()
}
