//! HTML page returned to the authorization popup.
//!
//! The page hands a JSON message to `window.opener` and closes itself.
//! Provider-supplied text only reaches the page through `serde_json`
//! (script context) or [`escape_html`] (markup context).

use crate::credentials::ScopeSummary;
use crate::provider::ProviderKind;
use serde::Serialize;

/// Message posted to the window that opened the popup.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PopupMessage {
    Success {
        #[serde(rename = "type")]
        event: String,
        provider: ProviderKind,
        #[serde(rename = "scopeSummary")]
        scope_summary: ScopeSummary,
    },
    Error {
        #[serde(rename = "type")]
        event: String,
        provider: ProviderKind,
        message: String,
    },
}

impl PopupMessage {
    pub fn success(scope_summary: ScopeSummary) -> Self {
        PopupMessage::Success {
            event: event_name(scope_summary.provider, "SUCCESS"),
            provider: scope_summary.provider,
            scope_summary,
        }
    }

    pub fn error(provider: ProviderKind, message: impl Into<String>) -> Self {
        PopupMessage::Error {
            event: event_name(provider, "ERROR"),
            provider,
            message: message.into(),
        }
    }

    /// Renders the popup page.
    pub fn render_page(&self) -> String {
        let (title, detail) = match self {
            PopupMessage::Success {
                provider,
                scope_summary,
                ..
            } => (
                format!("Connected to {}!", display_name(*provider)),
                describe_scope(scope_summary),
            ),
            PopupMessage::Error { message, .. } => {
                ("Authorization Failed".to_string(), format!("Error: {}", message))
            }
        };

        format!(
            r#"<!DOCTYPE html>
<html>
  <head><meta charset="utf-8"><title>{title}</title></head>
  <body>
    <h1>{title}</h1>
    <p>{detail}</p>
    <p>You can close this window.</p>
    <script>
      const message = {payload};
      if (window.opener) {{
        window.opener.postMessage(message, '*');
      }}
      setTimeout(() => window.close(), 2000);
    </script>
  </body>
</html>
"#,
            title = escape_html(&title),
            detail = escape_html(&detail),
            payload = script_json(self),
        )
    }
}

fn event_name(provider: ProviderKind, outcome: &str) -> String {
    let prefix = match provider {
        ProviderKind::Xero => "XERO",
        ProviderKind::QuickBooks => "QB",
    };
    format!("{}_AUTH_{}", prefix, outcome)
}

fn display_name(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::Xero => "Xero",
        ProviderKind::QuickBooks => "QuickBooks",
    }
}

fn describe_scope(summary: &ScopeSummary) -> String {
    if let Some(name) = summary.company.as_ref().and_then(|c| c.name.as_deref()) {
        return format!("Company: {}", name);
    }
    match summary.tenants.len() {
        0 => String::new(),
        1 => format!("Organisation: {}", summary.tenants[0].name),
        n => format!("{} organisations connected", n),
    }
}

/// Serializes `value` for embedding inside a `<script>` element.
fn script_json<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    json.replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CompanyInfo, TenantDescriptor};

    fn qb_summary(name: &str) -> ScopeSummary {
        ScopeSummary {
            provider: ProviderKind::QuickBooks,
            scope_id: "9130348".to_string(),
            tenants: Vec::new(),
            company: Some(CompanyInfo {
                id: "1".to_string(),
                name: Some(name.to_string()),
                country: Some("US".to_string()),
            }),
        }
    }

    #[test]
    fn test_success_message_shape() {
        let message = PopupMessage::success(qb_summary("Craig's Design"));
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["kind"], "success");
        assert_eq!(json["type"], "QB_AUTH_SUCCESS");
        assert_eq!(json["provider"], "quickbooks");
        assert_eq!(json["scopeSummary"]["scopeId"], "9130348");
        assert_eq!(json["scopeSummary"]["company"]["name"], "Craig's Design");
    }

    #[test]
    fn test_error_message_shape() {
        let message = PopupMessage::error(ProviderKind::Xero, "access_denied");
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["kind"], "error");
        assert_eq!(json["type"], "XERO_AUTH_ERROR");
        assert_eq!(json["message"], "access_denied");
    }

    #[test]
    fn test_provider_text_cannot_break_out_of_script() {
        let hostile = "</script><script>alert('x')</script>";
        let page = PopupMessage::error(ProviderKind::Xero, hostile).render_page();

        // Only the page's own script element
        assert_eq!(page.matches("<script>").count(), 1);
        assert_eq!(page.matches("</script>").count(), 1);
        assert!(page.contains("\\u003c/script\\u003e"));
        assert!(page.contains("&lt;/script&gt;"));
    }

    #[test]
    fn test_quotes_in_error_stay_inside_string() {
        let page = PopupMessage::error(ProviderKind::QuickBooks, "bad' }); alert(1); ({'").render_page();

        let start = page.find("const message = ").unwrap() + "const message = ".len();
        let end = page[start..].find(";\n").unwrap() + start;
        let parsed: serde_json::Value = serde_json::from_str(&page[start..end]).unwrap();
        assert_eq!(parsed["message"], "bad' }); alert(1); ({'");
    }

    #[test]
    fn test_success_page_names_scope() {
        let page = PopupMessage::success(qb_summary("A & B <Ltd>")).render_page();
        assert!(page.contains("Connected to QuickBooks!"));
        assert!(page.contains("Company: A &amp; B &lt;Ltd&gt;"));

        let xero = ScopeSummary {
            provider: ProviderKind::Xero,
            scope_id: "default".to_string(),
            tenants: vec![TenantDescriptor {
                id: "t1".to_string(),
                name: "Demo Company (UK)".to_string(),
            }],
            company: None,
        };
        let page = PopupMessage::success(xero).render_page();
        assert!(page.contains("Organisation: Demo Company (UK)"));
    }
}
