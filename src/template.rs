use std::collections::HashMap;

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use serde_json::{Value, json};

use crate::error::EngineError;

static HBS: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hbs = Handlebars::new();
    // rendered output leaves as plain WhatsApp text, never markup
    hbs.register_escape_fn(handlebars::no_escape);
    hbs
});

/// Renders a Handlebars template against a prepared context.
///
/// Templates written in the flow editor get access to:
/// - `contact`: `{{contact.name}}`, `{{contact.phone}}`
/// - `vars`: every variable captured by `input` nodes, e.g. `{{vars.email}}`
/// - `campaign`: `{{campaign.name}}` for campaign messages
///
/// Missing fields render as empty strings, so `Oi {{contact.name}}!` stays
/// usable for contacts without a stored name. A malformed template is a
/// configuration error of the flow or campaign that owns it.
pub fn render(template: &str, data: &Value) -> Result<String, EngineError> {
    HBS.render_template(template, data)
        .map_err(|e| EngineError::Template(e.to_string()))
}

/// Context for messages rendered inside a flow session.
pub fn conversation_context(
    contact_name: &str,
    contact_phone: &str,
    variables: &HashMap<String, String>,
) -> Value {
    json!({
        "contact": { "name": contact_name, "phone": contact_phone },
        "vars": variables,
    })
}

/// Context for campaign messages, one recipient at a time.
pub fn campaign_context(contact_name: &str, contact_phone: &str, campaign_name: &str) -> Value {
    json!({
        "contact": { "name": contact_name, "phone": contact_phone },
        "campaign": { "name": campaign_name },
    })
}
