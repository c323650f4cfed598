//! HTML email rendering
//!
//! Plain-text bodies are escaped, line breaks become `<br>`, and the result is
//! wrapped in a single 600px card layout.

use crate::models::followup_job::Model as FollowUpJob;
use crate::providers::OutboundMessage;

pub const TEST_EMAIL_SUBJECT: &str = "Test email from your follow-up connection";

/// Escapes the five HTML-significant characters.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn text_to_html(text: &str) -> String {
    escape_html(text.trim()).replace("\r\n", "\n").replace('\n', "<br>")
}

/// Wraps a plain-text body, and an optional signature, in the email layout.
pub fn render_html(body: &str, signature: Option<&str>) -> String {
    let signature_html = signature
        .filter(|sig| !sig.trim().is_empty())
        .map(|sig| {
            format!(
                r#"<div style="margin-top: 30px; padding-top: 20px; border-top: 1px solid #e5e7eb; color: #6b7280;">{}</div>"#,
                text_to_html(sig)
            )
        })
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Email</title>
</head>
<body style="margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Arial, sans-serif; line-height: 1.6; color: #1f2937; background-color: #f9fafb;">
    <table role="presentation" style="width: 100%; border-collapse: collapse;">
        <tr>
            <td align="center" style="padding: 40px 0;">
                <table role="presentation" style="width: 600px; max-width: 100%; border-collapse: collapse; background-color: #ffffff; border-radius: 8px;">
                    <tr>
                        <td style="padding: 40px;">
                            <div style="font-size: 15px; line-height: 24px; color: #374151;">{body}</div>
                            {signature}
                        </td>
                    </tr>
                </table>
            </td>
        </tr>
    </table>
</body>
</html>"#,
        body = text_to_html(body),
        signature = signature_html,
    )
}

/// Subject used for a follow-up: the draft subject when present, otherwise a
/// reply to the original thread.
pub fn followup_subject(job: &FollowUpJob) -> String {
    match job.draft_subject.as_deref().map(str::trim) {
        Some(subject) if !subject.is_empty() => subject.to_string(),
        _ => {
            let original = job.original_subject.trim();
            if original.to_ascii_lowercase().starts_with("re:") {
                original.to_string()
            } else {
                format!("Re: {}", original)
            }
        }
    }
}

/// Body text: the draft when present, otherwise the original email's body.
pub fn followup_body(job: &FollowUpJob) -> &str {
    job.draft_body
        .as_deref()
        .filter(|body| !body.trim().is_empty())
        .or(job.original_body.as_deref())
        .unwrap_or_default()
}

/// Renders a job into the message handed to its provider.
pub fn compose_followup(job: &FollowUpJob) -> OutboundMessage {
    OutboundMessage {
        to: job.recipient.clone(),
        subject: followup_subject(job),
        html_body: render_html(followup_body(job), None),
        reply_to: None,
    }
}

/// Fixed message used to verify a connection end to end.
pub fn compose_test_email(to: &str, from_name: &str) -> OutboundMessage {
    let body = format!(
        "Hi there!\n\n\
         This is a test email from {} to verify your email connection is working correctly.\n\n\
         If you're receiving this, your email integration is set up properly and ready to send follow-up emails.",
        from_name
    );

    OutboundMessage {
        to: to.to_string(),
        subject: TEST_EMAIL_SUBJECT.to_string(),
        html_body: render_html(&body, Some(&format!("Sent via {}", from_name))),
        reply_to: None,
    }
}
