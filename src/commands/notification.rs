//! Desktop toast notifications.
//!
//! Payloads are either plain text or `{"title", "message", "data":
//! {"image"}}`. The fields are substituted into a toast XML template, so
//! everything is escaped first: the five XML entities, plus stripping the
//! control characters XML 1.0 prohibits (0x00-0x1F except tab/newline/CR).

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Toasts should render quickly; the child is killed after this
const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Title used when the payload carries none
const DEFAULT_TITLE: &str = "Home Assistant";

/// Notification payload received over the bus
#[derive(Debug, Default, Deserialize)]
pub struct NotificationPayload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: NotificationData,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationData {
    #[serde(default)]
    pub image: Option<String>,
}

impl NotificationPayload {
    /// Parse JSON, falling back to treating the whole payload as the
    /// message text.
    pub fn from_payload(payload: &str) -> Self {
        serde_json::from_str(payload).unwrap_or_else(|_| Self {
            message: payload.to_string(),
            ..Self::default()
        })
    }
}

/// Raise a toast for the payload. Errors are logged, never propagated.
pub async fn show(payload: &str) {
    let notif = NotificationPayload::from_payload(payload);

    let title = if notif.title.is_empty() {
        DEFAULT_TITLE
    } else {
        &notif.title
    };
    let message = if notif.message.is_empty() {
        payload.trim()
    } else {
        &notif.message
    };

    let xml = build_toast_xml(title, message, notif.data.image.as_deref());
    let script = build_toast_script(&xml);

    if let Err(e) = super::run_powershell(script, NOTIFICATION_TIMEOUT, "notification").await {
        warn!("Notification failed: {e}");
    }
}

/// The toast XML document with escaped content.
fn build_toast_xml(title: &str, message: &str, image: Option<&str>) -> String {
    let title = escape_xml(title);
    let message = escape_xml(message);
    let image_element = match image {
        Some(src) if !src.is_empty() => format!(
            "\n            <image placement=\"appLogoOverride\" src=\"{}\"/>",
            escape_xml(src)
        ),
        _ => String::new(),
    };

    format!(
        r#"<toast>
    <visual>
        <binding template="ToastText02">
            <text id="1">{title}</text>
            <text id="2">{message}</text>{image_element}
        </binding>
    </visual>
</toast>"#
    )
}

/// PowerShell script that loads the XML and shows the toast under the
/// PowerShell app identity (works without app registration).
fn build_toast_script(toast_xml: &str) -> String {
    format!(
        r#"$app = '{{1AC14E77-02E7-4E5D-B744-2EB1AE5198B7}}\WindowsPowerShell\v1.0\powershell.exe'
[Windows.UI.Notifications.ToastNotificationManager, Windows.UI.Notifications, ContentType = WindowsRuntime] | Out-Null
[Windows.Data.Xml.Dom.XmlDocument, Windows.Data.Xml.Dom.XmlDocument, ContentType = WindowsRuntime] | Out-Null
$template = @"
{toast_xml}
"@
$xml = New-Object Windows.Data.Xml.Dom.XmlDocument
$xml.LoadXml($template)
$toast = [Windows.UI.Notifications.ToastNotification]::new($xml)
[Windows.UI.Notifications.ToastNotificationManager]::CreateToastNotifier($app).Show($toast)
"#
    )
}

/// Escape the five XML entities and strip the control characters XML 1.0
/// prohibits.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 10);
    for c in s.chars() {
        if c < '\u{20}' && c != '\t' && c != '\n' && c != '\r' {
            continue;
        }
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
