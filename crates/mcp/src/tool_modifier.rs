//! Response-modifier-template re-rendering (§4.3 "Response modification").

use serde_json::Value;

/// Re-render `content` through `template` if the tool row carries one. On
/// template error the original content passes through unchanged and the
/// error is logged — a misbehaving template must never break the tool call.
pub fn apply_response_modifier(template: Option<&str>, content: &Value) -> Value {
    let Some(template) = template else {
        return content.clone();
    };

    let mut env = minijinja::Environment::new();
    if let Err(err) = env.add_template("response_modifier", template) {
        tracing::warn!(error = %err, "response modifier template failed to parse");
        return content.clone();
    }
    let Ok(tmpl) = env.get_template("response_modifier") else {
        return content.clone();
    };
    match tmpl.render(minijinja::context! { result => content }) {
        Ok(rendered) => Value::String(rendered),
        Err(err) => {
            tracing::warn!(error = %err, "response modifier template failed to render");
            content.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_template_passes_content_through() {
        let content = json!({ "ok": true });
        assert_eq!(apply_response_modifier(None, &content), content);
    }

    #[test]
    fn template_rerenders_content() {
        let content = json!({ "count": 3 });
        let rendered = apply_response_modifier(Some("there are {{ result.count }} items"), &content);
        assert_eq!(rendered, json!("there are 3 items"));
    }

    #[test]
    fn malformed_template_falls_back_to_original_content() {
        let content = json!({ "count": 3 });
        let rendered = apply_response_modifier(Some("{{ unterminated"), &content);
        assert_eq!(rendered, content);
    }
}
